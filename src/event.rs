//! Structured events produced by instrumented resources.
//!
//! Events are immutable once built. Every event carries an [`EventMeta`]
//! whose `sequence` is strictly increasing per resource, in the order the
//! underlying calls completed.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::params::ParameterSnapshot;
use crate::parser::SqlOperation;

/// Correlation id of one proxied resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub(crate) u64);

impl ResourceId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    PooledSource,
    Connection,
    Statement,
    ResultCursor,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::PooledSource => "pooled_source",
            ResourceKind::Connection => "connection",
            ResourceKind::Statement => "statement",
            ResourceKind::ResultCursor => "result_cursor",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-execution operations that can fail and be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Checkout,
    Prepare,
    Bind,
    ClearParameters,
    AddBatch,
    ClearBatch,
    GeneratedKeys,
    Next,
    Read,
    Begin,
    Commit,
    Rollback,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Checkout => "checkout",
            Operation::Prepare => "prepare",
            Operation::Bind => "bind",
            Operation::ClearParameters => "clear_parameters",
            Operation::AddBatch => "add_batch",
            Operation::ClearBatch => "clear_batch",
            Operation::GeneratedKeys => "generated_keys",
            Operation::Next => "next",
            Operation::Read => "read",
            Operation::Begin => "begin",
            Operation::Commit => "commit",
            Operation::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of an error raised by the wrapped driver.
///
/// The original error is returned to the caller untouched; this is only the
/// recorded copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescriptor {
    pub type_name: &'static str,
    pub message: String,
    /// Messages of the `source()` chain, outermost first.
    pub causes: Vec<String>,
}

impl ErrorDescriptor {
    pub fn from_error<E: Error>(error: &E) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            type_name: std::any::type_name::<E>(),
            message: error.to_string(),
            causes,
        }
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Common header of every event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMeta {
    pub resource: ResourceId,
    pub kind: ResourceKind,
    /// Ancestor ids, pooled source first, direct parent last.
    pub lineage: Arc<[ResourceId]>,
    /// Per-resource sequence number, starting at 0.
    pub sequence: u64,
    /// Recorder-wide sequence number.
    pub global_sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn parent(&self) -> Option<ResourceId> {
        self.lineage.last().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// `close()` called on the resource itself.
    Explicit,
    /// An ancestor was closed first.
    Cascade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionAction {
    Begin,
    Commit,
    Rollback,
}

impl TransactionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionAction::Begin => "BEGIN",
            TransactionAction::Commit => "COMMIT",
            TransactionAction::Rollback => "ROLLBACK",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleAction {
    /// Emitted before delegating an acquisition (checkout, prepare).
    Acquiring,
    Opened {
        elapsed: Duration,
    },
    /// Cursor moved; `row` counts rows seen so far.
    Advanced {
        row: u64,
        has_row: bool,
    },
    Transaction {
        action: TransactionAction,
        elapsed: Duration,
    },
    Closed {
        cause: CloseCause,
        error: Option<ErrorDescriptor>,
    },
    /// `close()` on a resource that was already closed.
    DuplicateClose,
    Failed {
        operation: Operation,
        error: ErrorDescriptor,
    },
}

impl LifecycleAction {
    /// Diagnostics are emitted regardless of the category flags.
    pub fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            LifecycleAction::DuplicateClose
                | LifecycleAction::Failed { .. }
                | LifecycleAction::Closed { error: Some(_), .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleAction::Acquiring => "acquiring",
            LifecycleAction::Opened { .. } => "opened",
            LifecycleAction::Advanced { .. } => "advanced",
            LifecycleAction::Transaction { .. } => "transaction",
            LifecycleAction::Closed { .. } => "closed",
            LifecycleAction::DuplicateClose => "duplicate_close",
            LifecycleAction::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub meta: EventMeta,
    pub action: LifecycleAction,
    /// Statement text for statements and their cursors.
    pub sql: Option<Arc<str>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Unprepared execution through the connection.
    Direct,
    Update,
    Query,
    Batch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Updated { rows: u64 },
    Batched { counts: Vec<u64> },
    /// Rows are reported by the cursor as it advances.
    Queried,
    Failed(ErrorDescriptor),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }

    /// Rows affected; batches report the sum of their element counts.
    pub fn rows(&self) -> Option<u64> {
        match self {
            Outcome::Updated { rows } => Some(*rows),
            Outcome::Batched { counts } => Some(counts.iter().sum()),
            Outcome::Queried | Outcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorDescriptor> {
        match self {
            Outcome::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// One logical execution. Batches carry one parameter snapshot per element.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionEvent {
    pub meta: EventMeta,
    pub sql: Arc<str>,
    pub operation: SqlOperation,
    pub table: Option<String>,
    pub mode: ExecutionMode,
    pub parameters: Vec<ParameterSnapshot>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Elapsed time met the configured slow-query threshold.
    pub slow: bool,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Lifecycle(LifecycleEvent),
    Execution(ExecutionEvent),
}

impl Event {
    pub fn meta(&self) -> &EventMeta {
        match self {
            Event::Lifecycle(event) => &event.meta,
            Event::Execution(event) => &event.meta,
        }
    }

    pub fn as_execution(&self) -> Option<&ExecutionEvent> {
        match self {
            Event::Execution(event) => Some(event),
            Event::Lifecycle(_) => None,
        }
    }

    pub fn as_lifecycle(&self) -> Option<&LifecycleEvent> {
        match self {
            Event::Lifecycle(event) => Some(event),
            Event::Execution(_) => None,
        }
    }
}
