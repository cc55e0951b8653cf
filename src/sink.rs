//! Event destinations.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::error::SinkError;
use crate::event::{
    Event, ExecutionEvent, ExecutionMode, LifecycleAction, LifecycleEvent, Outcome, ResourceKind,
};
use crate::format::SqlFormat;
use crate::parser::SqlOperation;

/// Append-only destination for events.
///
/// Called synchronously from the thread that completed the observed call.
/// Implementations should not block for long; a returned error or a panic is
/// absorbed by the recorder and never reaches application code.
pub trait Sink: Send + Sync {
    fn on_lifecycle_event(&self, event: &LifecycleEvent) -> Result<(), SinkError>;

    fn on_execution_event(&self, event: &ExecutionEvent) -> Result<(), SinkError>;
}

/// Collects every event in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn executions(&self) -> Vec<ExecutionEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Execution(event) => Some(event),
                Event::Lifecycle(_) => None,
            })
            .collect()
    }

    pub fn lifecycle(&self) -> Vec<LifecycleEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Lifecycle(event) => Some(event),
                Event::Execution(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl Sink for MemorySink {
    fn on_lifecycle_event(&self, event: &LifecycleEvent) -> Result<(), SinkError> {
        self.push(Event::Lifecycle(event.clone()));
        Ok(())
    }

    fn on_execution_event(&self, event: &ExecutionEvent) -> Result<(), SinkError> {
        self.push(Event::Execution(event.clone()));
        Ok(())
    }
}

/// Writes events as `tracing` events.
///
/// Executions go to target `sql_spy::sqltiming` (INFO, WARN when slow, ERROR
/// on failure or above the error threshold). Cursor events go to
/// `sql_spy::resultset`, everything else to `sql_spy::connection`.
///
/// # Example
///
/// ```rust
/// use sql_spy::{SqlFormat, SqlOperation, TracingSink};
/// use std::time::Duration;
///
/// let sink = TracingSink::new()
///     .with_format(SqlFormat::default().with_semicolon(true))
///     .with_error_threshold(Duration::from_secs(5))
///     .suppress(SqlOperation::Select);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    format: SqlFormat,
    error_threshold: Option<Duration>,
    suppressed: Vec<SqlOperation>,
    warn_on_unprepared: bool,
}

macro_rules! lifecycle_event {
    ($level:ident, $event:expr, $($rest:tt)+) => {
        match $event.meta.kind {
            ResourceKind::ResultCursor => tracing::event!(
                target: "sql_spy::resultset",
                tracing::Level::$level,
                db.resource = %$event.meta.resource,
                db.resource.kind = %$event.meta.kind,
                db.sequence = $event.meta.sequence,
                $($rest)+
            ),
            _ => tracing::event!(
                target: "sql_spy::connection",
                tracing::Level::$level,
                db.resource = %$event.meta.resource,
                db.resource.kind = %$event.meta.kind,
                db.sequence = $event.meta.sequence,
                $($rest)+
            ),
        }
    };
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(mut self, format: SqlFormat) -> Self {
        self.format = format;
        self
    }

    /// Successful executions at or above `threshold` are logged at ERROR.
    pub fn with_error_threshold(mut self, threshold: Duration) -> Self {
        self.error_threshold = Some(threshold);
        self
    }

    /// Do not log executions of this kind. Failures are still logged.
    pub fn suppress(mut self, operation: SqlOperation) -> Self {
        if !self.suppressed.contains(&operation) {
            self.suppressed.push(operation);
        }
        self
    }

    /// Warn whenever SQL is executed without being prepared.
    pub fn with_unprepared_warning(mut self, enabled: bool) -> Self {
        self.warn_on_unprepared = enabled;
        self
    }

    pub fn format(&self) -> &SqlFormat {
        &self.format
    }

    fn render(&self, event: &ExecutionEvent) -> String {
        match event.parameters.as_slice() {
            [] => self.format.render(&event.sql, &Default::default()),
            elements => elements
                .iter()
                .map(|params| self.format.render(&event.sql, params))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl Sink for TracingSink {
    fn on_lifecycle_event(&self, event: &LifecycleEvent) -> Result<(), SinkError> {
        let sql = event.sql.as_deref().unwrap_or("");
        match &event.action {
            LifecycleAction::Failed { operation, error } => lifecycle_event!(
                ERROR,
                event,
                db.operation = %operation,
                error.message = %error.message,
                error.kind = error.type_name,
                "Database call failed"
            ),
            LifecycleAction::Closed {
                error: Some(error),
                ..
            } => lifecycle_event!(
                ERROR,
                event,
                error.message = %error.message,
                "Closing resource failed"
            ),
            LifecycleAction::DuplicateClose => lifecycle_event!(
                DEBUG,
                event,
                "Resource closed more than once"
            ),
            LifecycleAction::Advanced { row, has_row } => lifecycle_event!(
                DEBUG,
                event,
                db.row = row,
                db.has_row = has_row,
                "Cursor advanced"
            ),
            LifecycleAction::Transaction { action, elapsed } => lifecycle_event!(
                INFO,
                event,
                db.operation = action.as_str(),
                db.duration_ms = elapsed.as_millis() as i64,
                "Transaction"
            ),
            action => lifecycle_event!(
                DEBUG,
                event,
                db.lifecycle = action.name(),
                db.statement = sql,
                "Resource lifecycle"
            ),
        }
        Ok(())
    }

    fn on_execution_event(&self, event: &ExecutionEvent) -> Result<(), SinkError> {
        if self.warn_on_unprepared && event.mode == ExecutionMode::Direct {
            tracing::event!(
                target: "sql_spy::sqltiming",
                tracing::Level::WARN,
                db.resource = %event.meta.resource,
                "Statement executed without preparation"
            );
        }

        let failed = !event.outcome.is_success();
        if !failed && self.suppressed.contains(&event.operation) {
            return Ok(());
        }

        let statement = self.render(event);
        let duration_ms = event.elapsed.as_millis() as i64;
        let table = event.table.as_deref().unwrap_or("");
        let rows = event.outcome.rows().map_or(-1, |rows| rows as i64);
        let over_error_threshold = self
            .error_threshold
            .is_some_and(|threshold| event.elapsed >= threshold);

        match &event.outcome {
            Outcome::Failed(error) => tracing::event!(
                target: "sql_spy::sqltiming",
                tracing::Level::ERROR,
                db.resource = %event.meta.resource,
                db.operation = %event.operation,
                db.sql.table = table,
                db.statement = %statement,
                db.duration_ms = duration_ms,
                slow_query = event.slow,
                otel.status_code = "ERROR",
                error.message = %error.message,
                "Database query failed"
            ),
            _ if over_error_threshold => tracing::event!(
                target: "sql_spy::sqltiming",
                tracing::Level::ERROR,
                db.resource = %event.meta.resource,
                db.operation = %event.operation,
                db.sql.table = table,
                db.statement = %statement,
                db.rows_affected = rows,
                db.duration_ms = duration_ms,
                slow_query = true,
                otel.status_code = "OK",
                "Query exceeded error threshold"
            ),
            _ if event.slow => tracing::event!(
                target: "sql_spy::sqltiming",
                tracing::Level::WARN,
                db.resource = %event.meta.resource,
                db.operation = %event.operation,
                db.sql.table = table,
                db.statement = %statement,
                db.rows_affected = rows,
                db.duration_ms = duration_ms,
                slow_query = true,
                otel.status_code = "OK",
                "Slow query detected"
            ),
            _ => tracing::event!(
                target: "sql_spy::sqltiming",
                tracing::Level::INFO,
                db.resource = %event.meta.resource,
                db.operation = %event.operation,
                db.sql.table = table,
                db.statement = %statement,
                db.rows_affected = rows,
                db.duration_ms = duration_ms,
                otel.status_code = "OK",
                "Query executed"
            ),
        }
        Ok(())
    }
}
