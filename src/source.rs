//! Instrumented pooled source.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::InstrumentationConfig;
use crate::connection::InstrumentedConnection;
use crate::driver::DataSource;
use crate::error::ProxyError;
use crate::event::{Operation, ResourceId, ResourceKind};
use crate::kernel::{Scope, Timed, Tracked};
use crate::recorder::RecorderStats;

/// A [`DataSource`] whose connections, statements and cursors are all
/// instrumented.
///
/// Produced by [`install`](crate::install). Share it the way the wrapped
/// source would be shared, e.g. behind an `Arc`.
pub struct InstrumentedSource<S> {
    inner: S,
    tracked: Tracked,
}

impl<S> InstrumentedSource<S> {
    pub(crate) fn new(inner: S, scope: Arc<Scope>) -> Self {
        Self {
            inner,
            tracked: Tracked::root(scope),
        }
    }

    /// Correlation id of this source.
    pub fn id(&self) -> ResourceId {
        self.tracked.id()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Remove the instrumentation and return the wrapped source.
    ///
    /// Connections checked out earlier stay instrumented until closed.
    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn config(&self) -> &InstrumentationConfig {
        self.tracked.config()
    }

    pub fn stats(&self) -> RecorderStats {
        self.tracked.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.tracked.is_closed()
    }

    /// Connections checked out and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.tracked.open_children()
    }
}

#[async_trait]
impl<S: DataSource> DataSource for InstrumentedSource<S> {
    type Connection = InstrumentedConnection<S::Connection>;
    type Error = ProxyError<S::Error>;

    async fn connection(&self) -> Result<Self::Connection, Self::Error> {
        self.tracked.ensure_open()?;
        let pending = self.tracked.begin_child(ResourceKind::Connection, None);
        let timed = Timed::run(self.inner.connection()).await;
        let (connection, tracked) = self
            .tracked
            .finish_child(pending, Operation::Checkout, timed)?;
        Ok(InstrumentedConnection::new(connection, tracked))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.tracked.close(self.inner.close()).await
    }

    fn is_instrumented(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Connection;
    use crate::event::LifecycleAction;
    use crate::fake::{self, FakeError};

    #[tokio::test]
    async fn test_checkout_emits_acquiring_then_opened() {
        let (source, sink, _fake) = fake::instrumented(InstrumentationConfig::default());
        let conn = source.connection().await.unwrap();

        let events: Vec<_> = sink
            .lifecycle()
            .into_iter()
            .filter(|e| e.meta.resource == conn.id())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, LifecycleAction::Acquiring);
        assert!(matches!(events[1].action, LifecycleAction::Opened { .. }));
        assert_eq!(events[1].meta.kind, ResourceKind::Connection);
        assert_eq!(events[1].meta.lineage.as_ref(), &[source.id()]);
        assert_eq!(source.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_failed_checkout_is_passed_through() {
        let (source, sink, fake) = fake::instrumented(InstrumentationConfig::default());
        fake.refuse_checkouts();

        let error = source.connection().await.err().unwrap();
        assert_eq!(error.into_delegated(), Some(FakeError::Checkout));
        assert!(sink.lifecycle().iter().any(|e| matches!(
            e.action,
            LifecycleAction::Failed {
                operation: Operation::Checkout,
                ..
            }
        )));
        assert_eq!(source.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_closed_source_refuses_checkout_and_closes_connections() {
        let (source, _sink, fake) = fake::instrumented(InstrumentationConfig::default());
        let mut conn = source.connection().await.unwrap();

        source.close().await.unwrap();

        assert!(source.is_closed());
        assert!(source.connection().await.err().unwrap().is_closed());
        assert!(conn.execute("DELETE FROM t").await.err().unwrap().is_closed());
        // the pool close is the only real close; the connection was never touched
        assert_eq!(fake.real_closes(), 1);
        assert!(conn.close().await.is_ok());
        assert_eq!(fake.real_closes(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connections_are_forgotten() {
        let (source, _sink, _fake) = fake::instrumented(InstrumentationConfig::default());
        let kept = source.connection().await.unwrap();

        for _ in 0..1000 {
            source.connection().await.unwrap();
        }

        assert_eq!(source.open_connections(), 1);
        drop(kept);
        assert_eq!(source.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_source_is_marked_instrumented() {
        let (source, _sink, fake) = fake::instrumented(InstrumentationConfig::default());
        assert!(source.is_instrumented());
        assert!(!fake.is_instrumented());
        assert!(!source.into_inner().is_instrumented());
    }
}
