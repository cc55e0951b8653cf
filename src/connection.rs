//! Instrumented database connection wrapper.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::driver::{Connection, GeneratedKeys};
use crate::error::ProxyError;
use crate::event::{ExecutionMode, Operation, Outcome, ResourceId, ResourceKind, TransactionAction};
use crate::kernel::{Timed, Tracked};
use crate::params::ParameterTracker;
use crate::statement::InstrumentedStatement;

/// A connection checked out from an [`InstrumentedSource`](crate::InstrumentedSource).
///
/// Implements [`Connection`] by delegating to the real connection, so it is a
/// drop-in replacement wherever the real one was used. Statements prepared
/// through it are instrumented as well.
///
/// # Lifecycle
///
/// Closing the connection closes every statement (and their cursors) still
/// open on it. Any later call on those resources fails with
/// [`ProxyError::Closed`] without reaching the driver.
///
/// # Example
///
/// ```rust,ignore
/// let mut conn = source.connection().await?;
/// conn.begin().await?;
/// let mut stmt = conn.prepare("INSERT INTO t(v) VALUES (?)", GeneratedKeys::None).await?;
/// stmt.bind(1.into(), 42.into())?;
/// stmt.execute_update().await?;
/// conn.commit().await?;
/// conn.close().await?;
/// ```
pub struct InstrumentedConnection<C> {
    inner: C,
    tracked: Tracked,
}

impl<C> InstrumentedConnection<C> {
    pub(crate) fn new(inner: C, tracked: Tracked) -> Self {
        Self { inner, tracked }
    }

    pub fn id(&self) -> ResourceId {
        self.tracked.id()
    }

    /// Id of the source this connection was checked out from.
    pub fn source_id(&self) -> Option<ResourceId> {
        self.tracked.parent()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.tracked.created_at()
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn is_closed(&self) -> bool {
        self.tracked.is_closed()
    }

    /// Statements prepared on this connection and not yet closed.
    pub fn open_statements(&self) -> usize {
        self.tracked.open_children()
    }
}

async fn transact<E, F>(
    tracked: &Tracked,
    action: TransactionAction,
    call: F,
) -> Result<(), ProxyError<E>>
where
    E: std::error::Error,
    F: Future<Output = Result<(), E>>,
{
    tracked.ensure_open()?;
    let timed = Timed::run(call).await;
    tracked.transaction(action, timed)
}

#[async_trait]
impl<C: Connection> Connection for InstrumentedConnection<C> {
    type Statement = InstrumentedStatement<C::Statement>;
    type Error = ProxyError<C::Error>;

    async fn prepare(
        &mut self,
        sql: &str,
        keys: GeneratedKeys,
    ) -> Result<Self::Statement, Self::Error> {
        self.tracked.ensure_open()?;
        let sql: Arc<str> = Arc::from(sql);
        let pending = self
            .tracked
            .begin_child(ResourceKind::Statement, Some(sql.clone()));
        let timed = Timed::run(self.inner.prepare(&sql, keys)).await;
        let (statement, tracked) = self
            .tracked
            .finish_child(pending, Operation::Prepare, timed)?;
        let parameters = ParameterTracker::new(self.tracked.config().parameter_masking.clone());
        Ok(InstrumentedStatement::new(statement, tracked, sql, parameters))
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, Self::Error> {
        self.tracked.ensure_open()?;
        let timed = Timed::run(self.inner.execute(sql)).await;
        self.tracked.execution(
            &Arc::from(sql),
            ExecutionMode::Direct,
            Vec::new(),
            timed,
            |rows| Outcome::Updated { rows: *rows },
        )
    }

    async fn begin(&mut self) -> Result<(), Self::Error> {
        transact(&self.tracked, TransactionAction::Begin, self.inner.begin()).await
    }

    async fn commit(&mut self) -> Result<(), Self::Error> {
        transact(&self.tracked, TransactionAction::Commit, self.inner.commit()).await
    }

    async fn rollback(&mut self) -> Result<(), Self::Error> {
        transact(&self.tracked, TransactionAction::Rollback, self.inner.rollback()).await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.tracked.close(self.inner.close()).await
    }
}
