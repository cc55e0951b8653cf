//! Capability surface of the four intercepted resource kinds.
//!
//! Real adapters (see [`seaorm`](crate::seaorm)) implement these traits by
//! delegating to a driver; the instrumented proxies implement them again by
//! delegating to any other implementor, so the two are interchangeable at
//! every call site.
//!
//! Parameter contract: bindings survive `execute_update` and
//! `execute_query`, and are kept by `add_batch`. `clear_parameters` clears
//! them; `execute_batch` and `clear_batch` discard the batch and the current
//! bindings.

use async_trait::async_trait;

use crate::params::ParamKey;
use crate::value::Value;

/// Whether a prepared statement should make auto-generated keys available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GeneratedKeys {
    #[default]
    None,
    Return,
}

/// Entry point applications use to check out connections from a pool.
#[async_trait]
pub trait DataSource: Send + Sync {
    type Connection: Connection<Error = Self::Error>;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn connection(&self) -> Result<Self::Connection, Self::Error>;

    /// Shut the pool down.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Marker capability: `true` only for sources produced by
    /// [`install`](crate::install).
    fn is_instrumented(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait Connection: Send {
    type Statement: PreparedStatement<Error = Self::Error>;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn prepare(
        &mut self,
        sql: &str,
        keys: GeneratedKeys,
    ) -> Result<Self::Statement, Self::Error>;

    /// Execute SQL without preparing it. Returns the update count.
    async fn execute(&mut self, sql: &str) -> Result<u64, Self::Error>;

    async fn begin(&mut self) -> Result<(), Self::Error>;

    async fn commit(&mut self) -> Result<(), Self::Error>;

    async fn rollback(&mut self) -> Result<(), Self::Error>;

    /// Return the connection to its pool.
    async fn close(&mut self) -> Result<(), Self::Error>;
}

#[async_trait]
pub trait PreparedStatement: Send {
    type Cursor: ResultCursor<Error = Self::Error>;
    type Error: std::error::Error + Send + Sync + 'static;

    fn bind(&mut self, key: ParamKey, value: Value) -> Result<(), Self::Error>;

    fn clear_parameters(&mut self) -> Result<(), Self::Error>;

    async fn execute_update(&mut self) -> Result<u64, Self::Error>;

    async fn execute_query(&mut self) -> Result<Self::Cursor, Self::Error>;

    fn add_batch(&mut self) -> Result<(), Self::Error>;

    /// Execute every batch element in order. Returns one count per element.
    async fn execute_batch(&mut self) -> Result<Vec<u64>, Self::Error>;

    fn clear_batch(&mut self) -> Result<(), Self::Error>;

    /// Keys generated by the last execution, if requested at prepare time.
    async fn generated_keys(&mut self) -> Result<Self::Cursor, Self::Error>;

    async fn close(&mut self) -> Result<(), Self::Error>;
}

/// Forward-only cursor over a result set. Column indexes are 0-based.
#[async_trait]
pub trait ResultCursor: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Advance to the next row. `false` once the rows are exhausted.
    async fn next(&mut self) -> Result<bool, Self::Error>;

    fn value(&self, index: usize) -> Result<Value, Self::Error>;

    fn value_named(&self, column: &str) -> Result<Value, Self::Error>;

    async fn close(&mut self) -> Result<(), Self::Error>;
}
