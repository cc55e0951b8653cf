//! # sql-spy
//!
//! Transparent statement-level instrumentation for pooled SQL database access.
//!
//! Wrap a [`DataSource`] once at startup and every connection, prepared
//! statement and result cursor obtained through it reports what it does:
//! checkouts, prepares, parameter bindings, executions with their outcome and
//! timing, transactions and closes. Application code keeps calling the same
//! operations and gets the same results and the same errors back.
//!
//! ## Features
//!
//! - **Transparent**: proxies return the driver's values and errors untouched
//! - **Correlated**: every resource gets an id; events carry the id chain
//!   back to the pooled source plus per-resource sequence numbers
//! - **Parameter capture**: bound values, per batch element, masked before
//!   they leave the statement
//! - **Close cascade**: closing a connection closes its statements and cursors
//! - **Pluggable output**: [`MemorySink`], [`TracingSink`] or your own [`Sink`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sea_orm::Database;
//! use sql_spy::prelude::*;
//!
//! let db = Database::connect("sqlite::memory:").await?;
//! let source = SeaOrmSource::from(db).instrument_with_tracing(InstrumentationConfig::default())?;
//!
//! let mut conn = source.connection().await?;
//! let mut stmt = conn.prepare("INSERT INTO t(v) VALUES (?)", GeneratedKeys::None).await?;
//! stmt.bind(1.into(), 42.into())?;
//! stmt.execute_update().await?;
//! conn.close().await?;
//! ```
//!
//! ## Configuration
//!
//! ```rust,ignore
//! use sql_spy::InstrumentationConfig;
//!
//! let config = InstrumentationConfig::default()
//!     .with_result_set_logging(true)
//!     .with_slow_query_threshold(Duration::from_millis(100))
//!     .with_parameter_mask(Regex::new("(?i)password")?);
//! ```
//!
//! ## Tracing Fields
//!
//! [`TracingSink`] records executions with these fields:
//!
//! | Field | Description |
//! |-------|-------------|
//! | `db.resource` | Correlation id of the statement or connection |
//! | `db.operation` | SQL operation (SELECT, INSERT, UPDATE, DELETE, ...) |
//! | `db.sql.table` | Target table name (when detectable) |
//! | `db.statement` | SQL with parameters inlined, masks applied |
//! | `db.rows_affected` | Update count (sum for batches) |
//! | `db.duration_ms` | Execution time |
//! | `slow_query` | Met the slow-query threshold |
//! | `otel.status_code` | "OK" or "ERROR" |
//! | `error.message` | Error details (on failure) |

mod config;
mod connection;
mod cursor;
mod driver;
mod error;
mod event;
#[cfg(test)]
mod fake;
mod format;
mod install;
mod kernel;
mod params;
mod parser;
mod recorder;
mod seaorm;
mod sink;
mod source;
mod statement;
mod value;

pub use config::InstrumentationConfig;
pub use connection::InstrumentedConnection;
pub use cursor::InstrumentedCursor;
pub use driver::{Connection, DataSource, GeneratedKeys, PreparedStatement, ResultCursor};
pub use error::{AlreadyInstrumentedError, ClosedResourceError, ProxyError, SinkError};
pub use event::{
    CloseCause, ErrorDescriptor, Event, EventMeta, ExecutionEvent, ExecutionMode,
    LifecycleAction, LifecycleEvent, Operation, Outcome, ResourceId, ResourceKind,
    TransactionAction,
};
pub use format::SqlFormat;
pub use install::{install, InstrumentExt};
pub use params::{
    ParamKey, ParameterMasking, ParameterSnapshot, ParameterTracker, ParameterValue,
    REDACTION_TOKEN,
};
pub use parser::{ParsedSql, SqlOperation};
pub use recorder::RecorderStats;
pub use seaorm::{SeaOrmConnection, SeaOrmCursor, SeaOrmSource, SeaOrmStatement, GENERATED_KEY_COLUMN};
pub use sink::{MemorySink, Sink, TracingSink};
pub use source::InstrumentedSource;
pub use statement::InstrumentedStatement;
pub use value::Value;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Connection, DataSource, GeneratedKeys, InstrumentExt, InstrumentationConfig,
        InstrumentedSource, MemorySink, PreparedStatement, ResultCursor, SeaOrmSource, Sink,
        TracingSink, Value,
    };
}
