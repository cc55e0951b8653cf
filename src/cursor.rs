//! Instrumented result cursor.

use async_trait::async_trait;

use crate::driver::ResultCursor;
use crate::error::ProxyError;
use crate::event::{Operation, ResourceId};
use crate::kernel::Tracked;
use crate::value::Value;

/// Cursor over the rows of a query or over generated keys.
///
/// Row movement is reported only when result-set logging is on; read
/// failures are always reported.
pub struct InstrumentedCursor<R> {
    inner: R,
    tracked: Tracked,
    rows: u64,
}

impl<R> InstrumentedCursor<R> {
    pub(crate) fn new(inner: R, tracked: Tracked) -> Self {
        Self {
            inner,
            tracked,
            rows: 0,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.tracked.id()
    }

    pub fn statement_id(&self) -> Option<ResourceId> {
        self.tracked.parent()
    }

    /// Text of the statement that produced this cursor.
    pub fn sql(&self) -> Option<&str> {
        self.tracked.sql().map(|sql| &**sql)
    }

    /// Rows the cursor has moved onto so far.
    pub fn rows_read(&self) -> u64 {
        self.rows
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn is_closed(&self) -> bool {
        self.tracked.is_closed()
    }
}

#[async_trait]
impl<R: ResultCursor> ResultCursor for InstrumentedCursor<R> {
    type Error = ProxyError<R::Error>;

    async fn next(&mut self) -> Result<bool, Self::Error> {
        self.tracked.ensure_open()?;
        let has_row = self.tracked.check(Operation::Next, self.inner.next().await)?;
        if has_row {
            self.rows += 1;
        }
        self.tracked.advanced(self.rows, has_row);
        Ok(has_row)
    }

    fn value(&self, index: usize) -> Result<Value, Self::Error> {
        self.tracked.ensure_open()?;
        self.tracked.check(Operation::Read, self.inner.value(index))
    }

    fn value_named(&self, column: &str) -> Result<Value, Self::Error> {
        self.tracked.ensure_open()?;
        self.tracked
            .check(Operation::Read, self.inner.value_named(column))
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.tracked.close(self.inner.close()).await
    }
}
