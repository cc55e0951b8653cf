//! Bookkeeping shared by all proxies.
//!
//! Each proxy owns a [`Tracked`] handle: its [`ResourceState`] plus the
//! installation [`Scope`]. The state is the only part other threads can see.
//! A parent keeps weak references to its open children so that closing it
//! can mark them closed; a child keeps a weak link back, used to detach
//! itself when it is closed first. A proxy dropped without being closed
//! simply disappears from its parent's list.

use std::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::InstrumentationConfig;
use crate::error::{ClosedResourceError, ProxyError};
use crate::event::{
    CloseCause, ErrorDescriptor, Event, ExecutionEvent, ExecutionMode, LifecycleAction,
    LifecycleEvent, Operation, Outcome, ResourceId, ResourceKind, TransactionAction,
};
use crate::params::ParameterSnapshot;
use crate::parser::ParsedSql;
use crate::recorder::{Recorder, RecorderStats};

/// Everything shared by the resources of one installation.
pub(crate) struct Scope {
    pub(crate) config: InstrumentationConfig,
    pub(crate) recorder: Recorder,
}

pub(crate) struct ResourceState {
    id: ResourceId,
    kind: ResourceKind,
    lineage: Arc<[ResourceId]>,
    sql: Option<Arc<str>>,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
    parent: Weak<ResourceState>,
    children: Mutex<Vec<Weak<ResourceState>>>,
    sequence: Mutex<u64>,
}

impl ResourceState {
    pub(crate) fn root(id: ResourceId, kind: ResourceKind) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            lineage: Arc::from(Vec::new()),
            sql: None,
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
            parent: Weak::new(),
            children: Mutex::new(Vec::new()),
            sequence: Mutex::new(0),
        })
    }

    fn child_of(
        parent: &Arc<Self>,
        id: ResourceId,
        kind: ResourceKind,
        sql: Option<Arc<str>>,
    ) -> Arc<Self> {
        let mut lineage = parent.lineage.to_vec();
        lineage.push(parent.id);
        Arc::new(Self {
            id,
            kind,
            lineage: Arc::from(lineage),
            sql,
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
            parent: Arc::downgrade(parent),
            children: Mutex::new(Vec::new()),
            sequence: Mutex::new(0),
        })
    }

    pub(crate) fn id(&self) -> ResourceId {
        self.id
    }

    pub(crate) fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub(crate) fn lineage(&self) -> Arc<[ResourceId]> {
        self.lineage.clone()
    }

    pub(crate) fn sequence(&self) -> &Mutex<u64> {
        &self.sequence
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip to closed. Returns `true` only for the caller that flipped it.
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Live children only; entries of dropped proxies are pruned on access.
    fn children(&self) -> std::sync::MutexGuard<'_, Vec<Weak<ResourceState>>> {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        children.retain(|child| child.strong_count() > 0);
        children
    }

    fn open_children(&self) -> usize {
        self.children().len()
    }
}

/// Result of a delegated call plus when it ran.
pub(crate) struct Timed<T> {
    pub(crate) value: T,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    elapsed: Duration,
}

impl<T> Timed<T> {
    pub(crate) async fn run<F: Future<Output = T>>(call: F) -> Self {
        let started_at = Utc::now();
        let start = Instant::now();
        let value = call.await;
        let elapsed = start.elapsed();
        Self {
            value,
            started_at,
            finished_at: Utc::now(),
            elapsed,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// A proxy's view of its own state.
pub(crate) struct Tracked {
    state: Arc<ResourceState>,
    scope: Arc<Scope>,
}

impl Tracked {
    /// Track a new pooled source and announce it.
    pub(crate) fn root(scope: Arc<Scope>) -> Self {
        let state = ResourceState::root(scope.recorder.allocate_id(), ResourceKind::PooledSource);
        let tracked = Self { state, scope };
        tracked.lifecycle(LifecycleAction::Opened {
            elapsed: Duration::ZERO,
        });
        tracked
    }

    pub(crate) fn id(&self) -> ResourceId {
        self.state.id
    }

    pub(crate) fn parent(&self) -> Option<ResourceId> {
        self.state.lineage.last().copied()
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.state.created_at
    }

    pub(crate) fn sql(&self) -> Option<&Arc<str>> {
        self.state.sql.as_ref()
    }

    pub(crate) fn config(&self) -> &InstrumentationConfig {
        &self.scope.config
    }

    pub(crate) fn stats(&self) -> RecorderStats {
        self.scope.recorder.stats()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub(crate) fn open_children(&self) -> usize {
        self.state.open_children()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ClosedResourceError> {
        if self.state.is_closed() {
            Err(ClosedResourceError {
                id: self.state.id,
                kind: self.state.kind,
            })
        } else {
            Ok(())
        }
    }

    fn emit(&self, action: LifecycleAction) {
        let sql = self.state.sql.clone();
        self.scope.recorder.emit(&self.state, |meta| {
            Event::Lifecycle(LifecycleEvent { meta, action, sql })
        });
    }

    /// Emit unless the category of this resource is switched off.
    pub(crate) fn lifecycle(&self, action: LifecycleAction) {
        if action.is_diagnostic() || self.scope.config.logs(self.state.kind) {
            self.emit(action);
        }
    }

    /// Pass `result` through, reporting a failure of `operation`.
    pub(crate) fn check<T, E: Error>(
        &self,
        operation: Operation,
        result: Result<T, E>,
    ) -> Result<T, ProxyError<E>> {
        result.map_err(|error| {
            self.lifecycle(LifecycleAction::Failed {
                operation,
                error: ErrorDescriptor::from_error(&error),
            });
            ProxyError::Delegated(error)
        })
    }

    fn new_child(&self, kind: ResourceKind, sql: Option<Arc<str>>) -> Self {
        let id = self.scope.recorder.allocate_id();
        Self {
            state: ResourceState::child_of(&self.state, id, kind, sql),
            scope: self.scope.clone(),
        }
    }

    /// Start an acquisition: the child gets its id and announces itself
    /// before the real call is made.
    pub(crate) fn begin_child(&self, kind: ResourceKind, sql: Option<Arc<str>>) -> Self {
        let child = self.new_child(kind, sql);
        child.lifecycle(LifecycleAction::Acquiring);
        child
    }

    /// Finish an acquisition started with [`begin_child`](Self::begin_child).
    pub(crate) fn finish_child<T, E: Error>(
        &self,
        child: Self,
        operation: Operation,
        timed: Timed<Result<T, E>>,
    ) -> Result<(T, Self), ProxyError<E>> {
        let elapsed = timed.elapsed;
        let value = child.check(operation, timed.value)?;
        child.lifecycle(LifecycleAction::Opened { elapsed });
        self.adopt(&child);
        Ok((value, child))
    }

    /// Track a child produced as a by-product of an execution.
    pub(crate) fn open_child(
        &self,
        kind: ResourceKind,
        sql: Option<Arc<str>>,
        elapsed: Duration,
    ) -> Self {
        let child = self.new_child(kind, sql);
        child.lifecycle(LifecycleAction::Opened { elapsed });
        self.adopt(&child);
        child
    }

    fn adopt(&self, child: &Self) {
        self.state.children().push(Arc::downgrade(&child.state));
        // close() may have drained the list before the push above
        if self.state.is_closed() && child.state.mark_closed() {
            child.lifecycle(LifecycleAction::Closed {
                cause: CloseCause::Cascade,
                error: None,
            });
        }
    }

    fn cascade(&self) {
        let children = std::mem::take(&mut *self.state.children());
        for state in children.iter().filter_map(Weak::upgrade) {
            let child = Self {
                state,
                scope: self.scope.clone(),
            };
            if child.state.mark_closed() {
                tracing::debug!(
                    resource = %child.state.id,
                    parent = %self.state.id,
                    "Closing child resource with its parent"
                );
                child.cascade();
                child.lifecycle(LifecycleAction::Closed {
                    cause: CloseCause::Cascade,
                    error: None,
                });
            }
        }
    }

    fn detach(&self) {
        if let Some(parent) = self.state.parent.upgrade() {
            let this = Arc::as_ptr(&self.state);
            parent.children().retain(|c| !std::ptr::eq(c.as_ptr(), this));
        }
    }

    /// Close exactly once.
    ///
    /// A repeated close is a no-op reported as [`LifecycleAction::DuplicateClose`];
    /// `closing` is then dropped without being polled, so the real resource
    /// is never touched again.
    pub(crate) async fn close<E, F>(&self, closing: F) -> Result<(), ProxyError<E>>
    where
        E: Error,
        F: Future<Output = Result<(), E>>,
    {
        if !self.state.mark_closed() {
            self.lifecycle(LifecycleAction::DuplicateClose);
            return Ok(());
        }
        self.cascade();
        self.detach();

        let result = closing.await;
        self.lifecycle(LifecycleAction::Closed {
            cause: CloseCause::Explicit,
            error: result.as_ref().err().map(ErrorDescriptor::from_error),
        });
        result.map_err(ProxyError::Delegated)
    }

    /// Report an execution and pass its result through.
    ///
    /// Failures are reported even when statement logging is off.
    pub(crate) fn execution<T, E: Error>(
        &self,
        sql: &Arc<str>,
        mode: ExecutionMode,
        parameters: Vec<ParameterSnapshot>,
        timed: Timed<Result<T, E>>,
        outcome: impl FnOnce(&T) -> Outcome,
    ) -> Result<T, ProxyError<E>> {
        let Timed {
            value,
            started_at,
            finished_at,
            elapsed,
        } = timed;
        let outcome = match &value {
            Ok(value) => outcome(value),
            Err(error) => Outcome::Failed(ErrorDescriptor::from_error(error)),
        };

        if self.scope.config.log_statements || !outcome.is_success() {
            let parsed = ParsedSql::parse(sql);
            let slow = self.scope.config.is_slow(elapsed);
            let sql = sql.clone();
            self.scope.recorder.emit(&self.state, |meta| {
                Event::Execution(ExecutionEvent {
                    meta,
                    sql,
                    operation: parsed.operation,
                    table: parsed.table,
                    mode,
                    parameters,
                    started_at,
                    finished_at,
                    elapsed,
                    slow,
                    outcome,
                })
            });
        }
        value.map_err(ProxyError::Delegated)
    }

    pub(crate) fn transaction<E: Error>(
        &self,
        action: TransactionAction,
        timed: Timed<Result<(), E>>,
    ) -> Result<(), ProxyError<E>> {
        let elapsed = timed.elapsed;
        let operation = match action {
            TransactionAction::Begin => Operation::Begin,
            TransactionAction::Commit => Operation::Commit,
            TransactionAction::Rollback => Operation::Rollback,
        };
        self.check(operation, timed.value)?;
        self.lifecycle(LifecycleAction::Transaction { action, elapsed });
        Ok(())
    }

    pub(crate) fn advanced(&self, row: u64, has_row: bool) {
        self.lifecycle(LifecycleAction::Advanced { row, has_row });
    }
}

impl Scope {
    pub(crate) fn new(config: InstrumentationConfig, recorder: Recorder) -> Arc<Self> {
        Arc::new(Self { config, recorder })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    #[derive(Debug, thiserror::Error)]
    #[error("real close failed")]
    struct CloseError;

    fn scope(sink: Arc<MemorySink>) -> Arc<Scope> {
        Scope::new(InstrumentationConfig::development(), Recorder::new(sink))
    }

    fn actions(sink: &MemorySink, id: ResourceId) -> Vec<LifecycleAction> {
        sink.lifecycle()
            .into_iter()
            .filter(|e| e.meta.resource == id)
            .map(|e| e.action)
            .collect()
    }

    #[tokio::test]
    async fn test_close_cascades_to_descendants() {
        let sink = Arc::new(MemorySink::new());
        let source = Tracked::root(scope(sink.clone()));
        let conn = source.open_child(ResourceKind::Connection, None, Duration::ZERO);
        let stmt = conn.open_child(ResourceKind::Statement, Some(Arc::from("SELECT 1")), Duration::ZERO);
        let cursor = stmt.open_child(ResourceKind::ResultCursor, Some(Arc::from("SELECT 1")), Duration::ZERO);

        conn.close(async { Ok::<_, CloseError>(()) }).await.unwrap();

        assert!(stmt.ensure_open().is_err());
        assert!(cursor.ensure_open().is_err());
        assert!(source.ensure_open().is_ok());
        assert_eq!(source.open_children(), 0);
        assert_eq!(
            actions(&sink, cursor.id()).last(),
            Some(&LifecycleAction::Closed {
                cause: CloseCause::Cascade,
                error: None
            })
        );
        assert_eq!(cursor.parent(), Some(stmt.id()));
    }

    #[tokio::test]
    async fn test_second_close_is_a_noop_diagnostic() {
        let sink = Arc::new(MemorySink::new());
        let source = Tracked::root(scope(sink.clone()));
        let conn = source.open_child(ResourceKind::Connection, None, Duration::ZERO);

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let counter = &calls;
        let closing = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CloseError>(())
        };
        conn.close(closing()).await.unwrap();
        conn.close(closing()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            actions(&sink, conn.id()).last(),
            Some(&LifecycleAction::DuplicateClose)
        );
    }

    #[tokio::test]
    async fn test_failed_close_still_closes() {
        let sink = Arc::new(MemorySink::new());
        let source = Tracked::root(scope(sink.clone()));
        let conn = source.open_child(ResourceKind::Connection, None, Duration::ZERO);

        let result = conn.close(async { Err(CloseError) }).await;

        assert!(matches!(result, Err(ProxyError::Delegated(CloseError))));
        assert!(conn.is_closed());
        assert!(matches!(
            actions(&sink, conn.id()).last(),
            Some(LifecycleAction::Closed { error: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_child_adopted_after_parent_closed_is_closed() {
        let sink = Arc::new(MemorySink::new());
        let source = Tracked::root(scope(sink.clone()));
        let conn = source.begin_child(ResourceKind::Connection, None);
        source.close(async { Ok::<_, CloseError>(()) }).await.unwrap();

        let timed = Timed::run(async { Ok::<_, CloseError>(()) }).await;
        let ((), conn) = source.finish_child(conn, Operation::Checkout, timed).unwrap();

        assert!(conn.ensure_open().is_err());
    }

    #[tokio::test]
    async fn test_failed_acquisition_reports_on_child() {
        let sink = Arc::new(MemorySink::new());
        let source = Tracked::root(scope(sink.clone()));
        let conn = source.begin_child(ResourceKind::Connection, None);
        let conn_id = conn.id();

        let timed = Timed::run(async { Err::<(), _>(CloseError) }).await;
        assert!(source.finish_child(conn, Operation::Checkout, timed).is_err());

        let recorded = actions(&sink, conn_id);
        assert_eq!(recorded[0], LifecycleAction::Acquiring);
        assert!(matches!(
            &recorded[1],
            LifecycleAction::Failed { operation: Operation::Checkout, .. }
        ));
        assert_eq!(source.open_children(), 0);
    }

    #[tokio::test]
    async fn test_disabled_category_still_reports_failures() {
        let sink = Arc::new(MemorySink::new());
        let config = InstrumentationConfig::default().with_connection_logging(false);
        let source = Tracked::root(Scope::new(config, Recorder::new(sink.clone())));
        let conn = source.open_child(ResourceKind::Connection, None, Duration::ZERO);
        assert!(sink.is_empty());

        let _ = conn.check(Operation::Commit, Err::<(), _>(CloseError));
        conn.close(async { Ok::<_, CloseError>(()) }).await.unwrap();
        conn.close(async { Ok::<_, CloseError>(()) }).await.unwrap();

        let recorded = actions(&sink, conn.id());
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1], LifecycleAction::DuplicateClose);
    }

    #[tokio::test]
    async fn test_dropped_child_is_pruned_and_skipped_by_cascade() {
        let sink = Arc::new(MemorySink::new());
        let source = Tracked::root(scope(sink.clone()));
        let kept = source.open_child(ResourceKind::Connection, None, Duration::ZERO);
        let dropped = source.open_child(ResourceKind::Connection, None, Duration::ZERO);
        let dropped_id = dropped.id();
        assert_eq!(source.open_children(), 2);

        drop(dropped);
        assert_eq!(source.open_children(), 1);

        source.close(async { Ok::<_, CloseError>(()) }).await.unwrap();
        assert!(kept.is_closed());
        assert!(!actions(&sink, dropped_id)
            .iter()
            .any(|a| matches!(a, LifecycleAction::Closed { .. })));
    }
}
