//! Configuration for instrumentation behavior.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::ResourceKind;
use crate::params::ParameterMasking;

static CREDENTIAL_NAMES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:pass(?:word|wd)?|pwd|secret|token|api_?key|credential)s?$")
        .expect("credential pattern is valid")
});

/// Options consumed by [`install`](crate::install).
///
/// # Example
///
/// ```rust
/// use sql_spy::InstrumentationConfig;
/// use std::time::Duration;
///
/// let config = InstrumentationConfig::default()
///     .with_result_set_logging(true)
///     .with_slow_query_threshold(Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct InstrumentationConfig {
    /// Emit lifecycle events for the pooled source and its connections.
    /// Default: `true`
    pub log_connections: bool,

    /// Emit execution events and statement lifecycle events.
    /// Default: `true`
    pub log_statements: bool,

    /// Emit cursor lifecycle events, one per `next()` call.
    /// Default: `false` (voluminous)
    pub log_result_sets: bool,

    /// Executions at or above this latency are tagged `slow`. Nothing is
    /// filtered out.
    /// Default: `None`
    pub slow_query_threshold: Option<Duration>,

    /// Bound values matching these patterns are redacted before they are
    /// recorded.
    pub parameter_masking: ParameterMasking,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            log_connections: true,
            log_statements: true,
            log_result_sets: false,
            slow_query_threshold: None,
            parameter_masking: ParameterMasking::default(),
        }
    }
}

impl InstrumentationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_logging(mut self, enabled: bool) -> Self {
        self.log_connections = enabled;
        self
    }

    pub fn with_statement_logging(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }

    pub fn with_result_set_logging(mut self, enabled: bool) -> Self {
        self.log_result_sets = enabled;
        self
    }

    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = Some(threshold);
        self
    }

    /// Redact any bound value (or named placeholder) matching `pattern`.
    pub fn with_parameter_mask(mut self, pattern: Regex) -> Self {
        self.parameter_masking.push(pattern);
        self
    }

    /// Whether non-diagnostic events of `kind` should be emitted.
    pub fn logs(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::PooledSource | ResourceKind::Connection => self.log_connections,
            ResourceKind::Statement => self.log_statements,
            ResourceKind::ResultCursor => self.log_result_sets,
        }
    }

    pub fn is_slow(&self, elapsed: Duration) -> bool {
        self.slow_query_threshold
            .is_some_and(|threshold| elapsed >= threshold)
    }

    /// Everything on, 100ms slow threshold.
    ///
    /// **Warning**: records every bound value. Do not use in production.
    pub fn development() -> Self {
        Self {
            log_connections: true,
            log_statements: true,
            log_result_sets: true,
            slow_query_threshold: Some(Duration::from_millis(100)),
            parameter_masking: ParameterMasking::default(),
        }
    }

    /// No cursor events, 1s slow threshold, credential-like named
    /// parameters redacted.
    pub fn production() -> Self {
        Self {
            log_connections: true,
            log_statements: true,
            log_result_sets: false,
            slow_query_threshold: Some(Duration::from_secs(1)),
            parameter_masking: ParameterMasking::new([CREDENTIAL_NAMES.clone()]),
        }
    }
}
