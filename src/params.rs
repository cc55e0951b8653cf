//! Per-statement parameter tracking.
//!
//! Every instrumented statement owns a [`ParameterTracker`]. Bound values are
//! passed through [`ParameterMasking`] on the way in, so a redacted value is
//! never held by the tracker and can never reach an event.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

use crate::value::Value;

/// Replacement written in place of a masked parameter.
pub const REDACTION_TOKEN: &str = "<redacted>";

/// A placeholder: 1-based position or a named parameter.
///
/// Positions order before names, so snapshots list `?1, ?2, ..` first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamKey {
    Index(u32),
    Name(String),
}

impl From<u32> for ParamKey {
    fn from(index: u32) -> Self {
        ParamKey::Index(index)
    }
}

impl From<&str> for ParamKey {
    fn from(name: &str) -> Self {
        ParamKey::Name(name.to_string())
    }
}

impl From<String> for ParamKey {
    fn from(name: String) -> Self {
        ParamKey::Name(name)
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKey::Index(index) => write!(f, "{index}"),
            ParamKey::Name(name) => write!(f, ":{name}"),
        }
    }
}

/// What the tracker recorded for a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Bound(Value),
    Redacted,
}

impl ParameterValue {
    pub fn value(&self) -> Option<&Value> {
        match self {
            ParameterValue::Bound(value) => Some(value),
            ParameterValue::Redacted => None,
        }
    }

    pub fn is_redacted(&self) -> bool {
        matches!(self, ParameterValue::Redacted)
    }

    pub fn to_sql_literal(&self, booleans_as_words: bool) -> String {
        match self {
            ParameterValue::Bound(value) => value.to_sql_literal(booleans_as_words),
            ParameterValue::Redacted => REDACTION_TOKEN.to_string(),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bound(value) => value.fmt(f),
            ParameterValue::Redacted => f.write_str(REDACTION_TOKEN),
        }
    }
}

/// Patterns selecting parameters whose values must never be recorded.
///
/// A binding is masked when any pattern matches its name (named placeholders
/// only) or the textual form of its value.
#[derive(Debug, Clone, Default)]
pub struct ParameterMasking {
    patterns: Vec<Regex>,
}

impl ParameterMasking {
    pub fn new(patterns: impl IntoIterator<Item = Regex>) -> Self {
        Self {
            patterns: patterns.into_iter().collect(),
        }
    }

    pub fn push(&mut self, pattern: Regex) {
        self.patterns.push(pattern);
    }

    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, key: &ParamKey, value: &Value) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let name = match key {
            ParamKey::Name(name) => Some(name.as_str()),
            ParamKey::Index(_) => None,
        };
        let text = value.match_text();
        self.patterns.iter().any(|pattern| {
            name.is_some_and(|n| pattern.is_match(n))
                || text.as_deref().is_some_and(|t| pattern.is_match(t))
        })
    }

    /// The form of `value` the tracker is allowed to keep.
    pub fn apply(&self, key: &ParamKey, value: &Value) -> ParameterValue {
        if self.matches(key, value) {
            ParameterValue::Redacted
        } else {
            ParameterValue::Bound(value.clone())
        }
    }
}

/// Immutable, ordered copy of a statement's bindings at one point in time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterSnapshot {
    bindings: Vec<(ParamKey, ParameterValue)>,
}

impl ParameterSnapshot {
    pub fn get(&self, key: &ParamKey) -> Option<&ParameterValue> {
        self.bindings
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &ParameterValue)> {
        self.bindings.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Display for ParameterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.bindings.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}: {value}")?;
        }
        f.write_str("}")
    }
}

/// Mutable binding state owned by one instrumented statement.
///
/// Clearing follows the statement contract: bindings survive single
/// executions and `add_batch`; they are dropped by `clear`, by taking the
/// batch for execution and by `clear_batch`.
#[derive(Debug, Default)]
pub struct ParameterTracker {
    masking: ParameterMasking,
    current: BTreeMap<ParamKey, ParameterValue>,
    batch: Vec<ParameterSnapshot>,
}

impl ParameterTracker {
    pub fn new(masking: ParameterMasking) -> Self {
        Self {
            masking,
            current: BTreeMap::new(),
            batch: Vec::new(),
        }
    }

    /// Record a binding. Rebinding a placeholder keeps only the last value.
    pub fn bind(&mut self, key: ParamKey, value: &Value) {
        let recorded = self.masking.apply(&key, value);
        self.record(key, recorded);
    }

    /// Mask `value` for `key` without recording it yet.
    pub(crate) fn mask(&self, key: &ParamKey, value: &Value) -> ParameterValue {
        self.masking.apply(key, value)
    }

    pub(crate) fn record(&mut self, key: ParamKey, value: ParameterValue) {
        self.current.insert(key, value);
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        ParameterSnapshot {
            bindings: self
                .current
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn clear(&mut self) {
        self.current.clear();
    }

    /// Snapshot the current bindings as one batch element. Bindings are kept.
    pub fn add_batch(&mut self) {
        let element = self.snapshot();
        self.batch.push(element);
    }

    /// Hand over the accumulated batch for execution and reset all state.
    pub fn take_batch(&mut self) -> Vec<ParameterSnapshot> {
        self.current.clear();
        std::mem::take(&mut self.batch)
    }

    pub fn clear_batch(&mut self) {
        self.batch.clear();
        self.current.clear();
    }

    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }
}
