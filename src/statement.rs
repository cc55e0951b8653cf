//! Instrumented prepared statement.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cursor::InstrumentedCursor;
use crate::driver::PreparedStatement;
use crate::error::ProxyError;
use crate::event::{ExecutionMode, Operation, Outcome, ResourceId, ResourceKind};
use crate::kernel::{Timed, Tracked};
use crate::params::{ParamKey, ParameterSnapshot, ParameterTracker};
use crate::value::Value;

/// A prepared statement that records its bindings and executions.
///
/// Bindings are masked as they are recorded, before anything leaves the
/// statement. The value handed to the driver is always the caller's.
pub struct InstrumentedStatement<P> {
    inner: P,
    tracked: Tracked,
    sql: Arc<str>,
    parameters: ParameterTracker,
}

impl<P> InstrumentedStatement<P> {
    pub(crate) fn new(
        inner: P,
        tracked: Tracked,
        sql: Arc<str>,
        parameters: ParameterTracker,
    ) -> Self {
        Self {
            inner,
            tracked,
            sql,
            parameters,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.tracked.id()
    }

    pub fn connection_id(&self) -> Option<ResourceId> {
        self.tracked.parent()
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn is_closed(&self) -> bool {
        self.tracked.is_closed()
    }

    /// Current bindings as they will be reported, masks applied.
    pub fn parameters(&self) -> ParameterSnapshot {
        self.parameters.snapshot()
    }

    /// Batch elements added since the last batch execution.
    pub fn pending_batch(&self) -> usize {
        self.parameters.batch_len()
    }

    /// Cursors opened by this statement and not yet closed.
    pub fn open_cursors(&self) -> usize {
        self.tracked.open_children()
    }

    fn cursor<R>(&self, inner: R, elapsed: std::time::Duration) -> InstrumentedCursor<R> {
        let tracked = self
            .tracked
            .open_child(ResourceKind::ResultCursor, Some(self.sql.clone()), elapsed);
        InstrumentedCursor::new(inner, tracked)
    }
}

#[async_trait]
impl<P: PreparedStatement> PreparedStatement for InstrumentedStatement<P> {
    type Cursor = InstrumentedCursor<P::Cursor>;
    type Error = ProxyError<P::Error>;

    fn bind(&mut self, key: ParamKey, value: Value) -> Result<(), Self::Error> {
        self.tracked.ensure_open()?;
        let recorded = self.parameters.mask(&key, &value);
        self.tracked
            .check(Operation::Bind, self.inner.bind(key.clone(), value))?;
        self.parameters.record(key, recorded);
        Ok(())
    }

    fn clear_parameters(&mut self) -> Result<(), Self::Error> {
        self.tracked.ensure_open()?;
        self.tracked
            .check(Operation::ClearParameters, self.inner.clear_parameters())?;
        self.parameters.clear();
        Ok(())
    }

    async fn execute_update(&mut self) -> Result<u64, Self::Error> {
        self.tracked.ensure_open()?;
        let snapshot = vec![self.parameters.snapshot()];
        let timed = Timed::run(self.inner.execute_update()).await;
        self.tracked
            .execution(&self.sql, ExecutionMode::Update, snapshot, timed, |rows| {
                Outcome::Updated { rows: *rows }
            })
    }

    async fn execute_query(&mut self) -> Result<Self::Cursor, Self::Error> {
        self.tracked.ensure_open()?;
        let snapshot = vec![self.parameters.snapshot()];
        let timed = Timed::run(self.inner.execute_query()).await;
        let elapsed = timed.elapsed();
        let cursor = self
            .tracked
            .execution(&self.sql, ExecutionMode::Query, snapshot, timed, |_| {
                Outcome::Queried
            })?;
        Ok(self.cursor(cursor, elapsed))
    }

    fn add_batch(&mut self) -> Result<(), Self::Error> {
        self.tracked.ensure_open()?;
        self.tracked
            .check(Operation::AddBatch, self.inner.add_batch())?;
        self.parameters.add_batch();
        Ok(())
    }

    async fn execute_batch(&mut self) -> Result<Vec<u64>, Self::Error> {
        self.tracked.ensure_open()?;
        // the driver discards the batch whether or not it succeeds
        let batch = self.parameters.take_batch();
        let timed = Timed::run(self.inner.execute_batch()).await;
        self.tracked
            .execution(&self.sql, ExecutionMode::Batch, batch, timed, |counts| {
                Outcome::Batched {
                    counts: counts.clone(),
                }
            })
    }

    fn clear_batch(&mut self) -> Result<(), Self::Error> {
        self.tracked.ensure_open()?;
        self.tracked
            .check(Operation::ClearBatch, self.inner.clear_batch())?;
        self.parameters.clear_batch();
        Ok(())
    }

    async fn generated_keys(&mut self) -> Result<Self::Cursor, Self::Error> {
        self.tracked.ensure_open()?;
        let timed = Timed::run(self.inner.generated_keys()).await;
        let elapsed = timed.elapsed();
        let keys = self.tracked.check(Operation::GeneratedKeys, timed.value)?;
        Ok(self.cursor(keys, elapsed))
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.tracked.close(self.inner.close()).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use regex::Regex;

    use super::*;
    use crate::config::InstrumentationConfig;
    use crate::driver::{Connection, DataSource, GeneratedKeys, ResultCursor};
    use crate::event::{ExecutionEvent, LifecycleAction};
    use crate::fake::{self, FakeError, FakeSource, FakeStatement};
    use crate::params::{ParameterValue, REDACTION_TOKEN};
    use crate::sink::MemorySink;
    use crate::source::InstrumentedSource;

    const INSERT: &str = "INSERT INTO t(v) VALUES (?)";

    async fn prepared(
        config: InstrumentationConfig,
        sql: &str,
    ) -> (
        InstrumentedSource<FakeSource>,
        InstrumentedStatement<FakeStatement>,
        Arc<MemorySink>,
    ) {
        let (source, sink, _fake) = fake::instrumented(config);
        let mut conn = source.connection().await.unwrap();
        let stmt = conn.prepare(sql, GeneratedKeys::Return).await.unwrap();
        (source, stmt, sink)
    }

    fn only_execution(sink: &MemorySink) -> ExecutionEvent {
        let mut executions = sink.executions();
        assert_eq!(executions.len(), 1);
        executions.remove(0)
    }

    #[tokio::test]
    async fn test_insert_records_bound_parameter_and_count() {
        let (_source, mut stmt, sink) = prepared(InstrumentationConfig::default(), INSERT).await;

        stmt.bind(1.into(), 42.into()).unwrap();
        let rows = stmt.execute_update().await.unwrap();

        assert_eq!(rows, 1);
        let event = only_execution(&sink);
        assert_eq!(&*event.sql, INSERT);
        assert_eq!(event.mode, ExecutionMode::Update);
        assert_eq!(event.parameters.len(), 1);
        assert_eq!(event.parameters[0].to_string(), "{1: 42}");
        assert_eq!(event.outcome, Outcome::Updated { rows: 1 });
        assert_eq!(event.meta.resource, stmt.id());
    }

    #[tokio::test]
    async fn test_failed_execution_keeps_bindings_and_error() {
        let (_source, mut stmt, sink) = prepared(
            InstrumentationConfig::default(),
            "INSERT INTO t(v) VALUES (?) -- NOT NULL",
        )
        .await;

        stmt.bind(1.into(), Value::Null).unwrap();
        let error = stmt.execute_update().await.err().unwrap();

        assert_eq!(error.into_delegated(), Some(FakeError::NotNull(1)));
        let event = only_execution(&sink);
        assert_eq!(event.parameters[0].to_string(), "{1: NULL}");
        let failure = event.outcome.error().unwrap();
        assert_eq!(failure.message, FakeError::NotNull(1).to_string());
        assert!(!event.outcome.is_success());
    }

    #[tokio::test]
    async fn test_driver_receives_unmasked_values() {
        let config = InstrumentationConfig::default()
            .with_parameter_mask(Regex::new("(?i)secret").unwrap());
        let (_source, mut stmt, sink) = prepared(config, INSERT).await;

        stmt.bind(1.into(), "top secret".into()).unwrap();
        stmt.execute_update().await.unwrap();

        assert_eq!(
            stmt.inner().bound(&ParamKey::Index(1)),
            Some(Value::Text("top secret".to_string()))
        );
        let event = only_execution(&sink);
        assert_eq!(
            event.parameters[0].get(&ParamKey::Index(1)),
            Some(&ParameterValue::Redacted)
        );
        assert!(!format!("{:?}", sink.events()).contains("top secret"));
    }

    #[tokio::test]
    async fn test_masking_applies_to_failed_executions() {
        let config = InstrumentationConfig::default()
            .with_parameter_mask(Regex::new("(?i)secret").unwrap());
        let (_source, mut stmt, sink) =
            prepared(config, "INSERT INTO t(a, b) VALUES (?, ?) -- NOT NULL").await;

        stmt.bind(1.into(), "secret-token".into()).unwrap();
        stmt.bind(2.into(), Value::Null).unwrap();
        assert!(stmt.execute_update().await.is_err());

        let event = only_execution(&sink);
        assert_eq!(
            event.parameters[0].to_string(),
            format!("{{1: {REDACTION_TOKEN}, 2: NULL}}")
        );
        assert!(!format!("{:?}", sink.events()).contains("secret-token"));
    }

    #[tokio::test]
    async fn test_failed_bind_is_not_recorded() {
        let (_source, mut stmt, sink) = prepared(InstrumentationConfig::default(), INSERT).await;

        let error = stmt.bind(0.into(), 1.into()).err().unwrap();

        assert_eq!(error.into_delegated(), Some(FakeError::BadIndex));
        assert!(stmt.parameters().is_empty());
        assert!(sink.lifecycle().iter().any(|e| matches!(
            e.action,
            LifecycleAction::Failed {
                operation: Operation::Bind,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_batch_reports_one_snapshot_per_element() {
        let (_source, mut stmt, sink) = prepared(InstrumentationConfig::default(), INSERT).await;

        stmt.bind(1.into(), 1.into()).unwrap();
        stmt.add_batch().unwrap();
        stmt.bind(1.into(), 2.into()).unwrap();
        stmt.add_batch().unwrap();
        assert_eq!(stmt.pending_batch(), 2);
        let counts = stmt.execute_batch().await.unwrap();

        assert_eq!(counts, vec![1, 1]);
        let event = only_execution(&sink);
        assert_eq!(event.mode, ExecutionMode::Batch);
        assert_eq!(
            event
                .parameters
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            vec!["{1: 1}", "{1: 2}"]
        );
        assert_eq!(event.outcome.rows(), Some(2));
        assert_eq!(stmt.pending_batch(), 0);
        assert!(stmt.parameters().is_empty());
    }

    #[tokio::test]
    async fn test_clear_batch_discards_elements() {
        let (_source, mut stmt, sink) = prepared(InstrumentationConfig::default(), INSERT).await;

        stmt.bind(1.into(), 1.into()).unwrap();
        stmt.add_batch().unwrap();
        stmt.clear_batch().unwrap();
        stmt.bind(1.into(), 7.into()).unwrap();
        stmt.add_batch().unwrap();
        stmt.execute_batch().await.unwrap();

        let event = only_execution(&sink);
        assert_eq!(event.parameters.len(), 1);
        assert_eq!(event.parameters[0].to_string(), "{1: 7}");
    }

    #[tokio::test]
    async fn test_bindings_survive_execution_until_cleared() {
        let (_source, mut stmt, sink) = prepared(InstrumentationConfig::default(), INSERT).await;

        stmt.bind(1.into(), 5.into()).unwrap();
        stmt.execute_update().await.unwrap();
        stmt.execute_update().await.unwrap();
        stmt.clear_parameters().unwrap();

        let executions = sink.executions();
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[1].parameters[0].to_string(), "{1: 5}");
        assert!(stmt.parameters().is_empty());
    }

    #[tokio::test]
    async fn test_query_opens_cursor_child() {
        let (source, sink, _fake) = fake::instrumented(InstrumentationConfig::default());
        let mut conn = source.connection().await.unwrap();
        let mut insert = conn.prepare(INSERT, GeneratedKeys::None).await.unwrap();
        insert.bind(1.into(), 9.into()).unwrap();
        insert.execute_update().await.unwrap();

        let mut select = conn
            .prepare("SELECT v FROM t", GeneratedKeys::None)
            .await
            .unwrap();
        let mut cursor = select.execute_query().await.unwrap();

        assert!(cursor.next().await.unwrap());
        assert_eq!(cursor.value(0).unwrap(), Value::Int(9));
        assert_eq!(select.open_cursors(), 1);
        let query = sink.executions().pop().unwrap();
        assert_eq!(query.mode, ExecutionMode::Query);
        assert_eq!(query.outcome, Outcome::Queried);
        assert_eq!(query.table.as_deref(), Some("t"));
        assert_eq!(query.parameters, vec![ParameterSnapshot::default()]);
    }

    #[tokio::test]
    async fn test_generated_keys_cursor() {
        let (_source, mut stmt, _sink) = prepared(InstrumentationConfig::default(), INSERT).await;
        stmt.bind(1.into(), 3.into()).unwrap();
        stmt.execute_update().await.unwrap();

        let mut keys = stmt.generated_keys().await.unwrap();

        assert!(keys.next().await.unwrap());
        assert_eq!(keys.value(0).unwrap(), Value::Int(1));
        assert_eq!(stmt.open_cursors(), 1);
    }

    #[tokio::test]
    async fn test_statement_logging_off_still_reports_failures() {
        let config = InstrumentationConfig::default().with_statement_logging(false);
        let (_source, mut stmt, sink) =
            prepared(config, "INSERT INTO t(v) VALUES (?) -- NOT NULL").await;

        stmt.bind(1.into(), 1.into()).unwrap();
        stmt.execute_update().await.unwrap();
        assert!(sink.executions().is_empty());

        stmt.bind(1.into(), Value::Null).unwrap();
        assert!(stmt.execute_update().await.is_err());
        assert_eq!(sink.executions().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_statement_never_reaches_driver() {
        let (_source, mut stmt, sink) = prepared(InstrumentationConfig::default(), INSERT).await;

        stmt.close().await.unwrap();
        let before = sink.len();

        assert!(stmt.bind(1.into(), 1.into()).err().unwrap().is_closed());
        assert!(stmt.execute_update().await.err().unwrap().is_closed());
        assert!(stmt.add_batch().err().unwrap().is_closed());
        assert!(stmt.execute_query().await.err().unwrap().is_closed());
        assert_eq!(sink.len(), before);
        assert_eq!(stmt.inner().executions(), 0);
    }

    #[tokio::test]
    async fn test_dropped_cursors_are_forgotten() {
        let (_source, mut stmt, _sink) =
            prepared(InstrumentationConfig::default(), "SELECT v FROM t").await;
        let kept = stmt.execute_query().await.unwrap();

        for _ in 0..500 {
            let mut cursor = stmt.execute_query().await.unwrap();
            cursor.next().await.unwrap();
        }

        assert_eq!(stmt.open_cursors(), 1);
        drop(kept);
        assert_eq!(stmt.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_execution_at_threshold_is_tagged_slow() {
        let config = InstrumentationConfig::default().with_slow_query_threshold(Duration::ZERO);
        let (_source, mut stmt, sink) = prepared(config, INSERT).await;

        stmt.bind(1.into(), 1.into()).unwrap();
        stmt.execute_update().await.unwrap();

        let event = only_execution(&sink);
        assert!(event.slow);
        assert_eq!(event.outcome, Outcome::Updated { rows: 1 });
    }

    #[tokio::test]
    async fn test_execution_under_threshold_is_not_slow() {
        let config =
            InstrumentationConfig::default().with_slow_query_threshold(Duration::from_secs(3600));
        let (_source, mut stmt, sink) = prepared(config, INSERT).await;

        stmt.bind(1.into(), 1.into()).unwrap();
        stmt.execute_update().await.unwrap();

        assert!(!only_execution(&sink).slow);
    }
}
