//! [`DataSource`] implementation over a SeaORM `DatabaseConnection`.
//!
//! SeaORM has no prepared-statement handle, so a statement here is SQL plus
//! the values bound so far, sent as one parameterized [`Statement`] per
//! execution. Placeholders use the backend's native syntax (`?` for SQLite
//! and MySQL, `$1` for PostgreSQL) and are bound by 1-based index.
//!
//! ```rust,ignore
//! use sea_orm::Database;
//! use sql_spy::{InstrumentExt, InstrumentationConfig, SeaOrmSource};
//!
//! let db = Database::connect("sqlite::memory:").await?;
//! let source = SeaOrmSource::from(db).instrument_with_tracing(InstrumentationConfig::default())?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, ExecResult,
    QueryResult, Statement, TransactionTrait, TryGetable,
};
use tokio::sync::Mutex;

use crate::driver::{Connection, DataSource, GeneratedKeys, PreparedStatement, ResultCursor};
use crate::params::ParamKey;
use crate::value::Value;

/// Column name under which generated keys are exposed.
pub const GENERATED_KEY_COLUMN: &str = "generated_key";

/// A SeaORM connection pool seen as a [`DataSource`].
#[derive(Debug, Clone)]
pub struct SeaOrmSource {
    db: DatabaseConnection,
}

impl SeaOrmSource {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn into_inner(self) -> DatabaseConnection {
        self.db
    }

    /// Backend name as used by the `db.system` attribute.
    pub fn db_system(&self) -> &'static str {
        match self.db.get_database_backend() {
            DbBackend::Postgres => "postgresql",
            DbBackend::MySql => "mysql",
            DbBackend::Sqlite => "sqlite",
        }
    }
}

impl From<DatabaseConnection> for SeaOrmSource {
    fn from(db: DatabaseConnection) -> Self {
        Self::new(db)
    }
}

impl AsRef<DatabaseConnection> for SeaOrmSource {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl DataSource for SeaOrmSource {
    type Connection = SeaOrmConnection;
    type Error = DbErr;

    /// Checks the pool is reachable. Pooled connections are acquired per
    /// execution, or held for the duration of a transaction.
    async fn connection(&self) -> Result<SeaOrmConnection, DbErr> {
        self.db.ping().await?;
        Ok(SeaOrmConnection {
            session: Session {
                db: self.db.clone(),
                transaction: Arc::new(Mutex::new(None)),
            },
        })
    }

    async fn close(&self) -> Result<(), DbErr> {
        self.db.clone().close().await
    }
}

/// Where a connection's statements run: the pool, or its open transaction.
#[derive(Clone)]
struct Session {
    db: DatabaseConnection,
    transaction: Arc<Mutex<Option<DatabaseTransaction>>>,
}

impl Session {
    fn backend(&self) -> DbBackend {
        self.db.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let transaction = self.transaction.lock().await;
        match transaction.as_ref() {
            Some(txn) => txn.execute(stmt).await,
            None => self.db.execute(stmt).await,
        }
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        let transaction = self.transaction.lock().await;
        match transaction.as_ref() {
            Some(txn) => txn.execute_unprepared(sql).await,
            None => self.db.execute_unprepared(sql).await,
        }
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let transaction = self.transaction.lock().await;
        match transaction.as_ref() {
            Some(txn) => txn.query_all(stmt).await,
            None => self.db.query_all(stmt).await,
        }
    }

    async fn take_transaction(&self) -> Result<DatabaseTransaction, DbErr> {
        self.transaction
            .lock()
            .await
            .take()
            .ok_or_else(|| DbErr::Custom("no transaction in progress".to_string()))
    }
}

/// A logical connection over the pool.
///
/// Outside a transaction each execution borrows whichever pooled connection
/// is free, so session state (`SET`, temporary tables, connection-local
/// variables) is not guaranteed to be visible to the next statement. Between
/// [`begin`](Connection::begin) and commit or rollback every statement runs
/// on the one connection the transaction holds.
pub struct SeaOrmConnection {
    session: Session,
}

impl SeaOrmConnection {
    pub async fn in_transaction(&self) -> bool {
        self.session.transaction.lock().await.is_some()
    }
}

#[async_trait]
impl Connection for SeaOrmConnection {
    type Statement = SeaOrmStatement;
    type Error = DbErr;

    async fn prepare(&mut self, sql: &str, keys: GeneratedKeys) -> Result<SeaOrmStatement, DbErr> {
        // last_insert_id is not available on PostgreSQL; use RETURNING there
        if keys == GeneratedKeys::Return && self.session.backend() == DbBackend::Postgres {
            return Err(DbErr::Custom(
                "generated keys are not supported on PostgreSQL, use RETURNING".to_string(),
            ));
        }
        Ok(SeaOrmStatement {
            session: self.session.clone(),
            sql: sql.to_string(),
            keys,
            bound: BTreeMap::new(),
            batch: Vec::new(),
            last_insert_id: None,
        })
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DbErr> {
        let result = self.session.execute_unprepared(sql).await?;
        Ok(result.rows_affected())
    }

    async fn begin(&mut self) -> Result<(), DbErr> {
        let mut transaction = self.session.transaction.lock().await;
        if transaction.is_some() {
            return Err(DbErr::Custom("transaction already in progress".to_string()));
        }
        *transaction = Some(self.session.db.begin().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbErr> {
        self.session.take_transaction().await?.commit().await
    }

    async fn rollback(&mut self) -> Result<(), DbErr> {
        self.session.take_transaction().await?.rollback().await
    }

    /// Rolls back a transaction left open.
    async fn close(&mut self) -> Result<(), DbErr> {
        let open = self.session.transaction.lock().await.take();
        match open {
            Some(txn) => {
                tracing::debug!("Rolling back transaction left open at close");
                txn.rollback().await
            }
            None => Ok(()),
        }
    }
}

pub struct SeaOrmStatement {
    session: Session,
    sql: String,
    keys: GeneratedKeys,
    bound: BTreeMap<u32, Value>,
    batch: Vec<BTreeMap<u32, Value>>,
    last_insert_id: Option<u64>,
}

impl SeaOrmStatement {
    fn statement(&self, bound: &BTreeMap<u32, Value>) -> Statement {
        Statement::from_sql_and_values(
            self.session.backend(),
            self.sql.as_str(),
            bound.values().map(to_sea_value),
        )
    }

    async fn run(&mut self, stmt: Statement) -> Result<u64, DbErr> {
        let result = self.session.execute(stmt).await?;
        if self.keys == GeneratedKeys::Return {
            self.last_insert_id = Some(result.last_insert_id());
        }
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PreparedStatement for SeaOrmStatement {
    type Cursor = SeaOrmCursor;
    type Error = DbErr;

    fn bind(&mut self, key: ParamKey, value: Value) -> Result<(), DbErr> {
        match key {
            ParamKey::Index(0) => Err(DbErr::Custom(
                "parameter indexes start at 1".to_string(),
            )),
            ParamKey::Index(index) => {
                self.bound.insert(index, value);
                Ok(())
            }
            ParamKey::Name(name) => Err(DbErr::Custom(format!(
                "named parameter :{name} is not supported, bind by index"
            ))),
        }
    }

    fn clear_parameters(&mut self) -> Result<(), DbErr> {
        self.bound.clear();
        Ok(())
    }

    async fn execute_update(&mut self) -> Result<u64, DbErr> {
        let stmt = self.statement(&self.bound);
        self.run(stmt).await
    }

    async fn execute_query(&mut self) -> Result<SeaOrmCursor, DbErr> {
        let stmt = self.statement(&self.bound);
        let rows = self.session.query_all(stmt).await?;
        Ok(SeaOrmCursor::new(rows.into_iter().map(Row::Query).collect()))
    }

    fn add_batch(&mut self) -> Result<(), DbErr> {
        self.batch.push(self.bound.clone());
        Ok(())
    }

    /// Stops at the first failing element; earlier elements stay applied.
    async fn execute_batch(&mut self) -> Result<Vec<u64>, DbErr> {
        let batch = std::mem::take(&mut self.batch);
        self.bound.clear();
        let mut counts = Vec::with_capacity(batch.len());
        for element in &batch {
            let stmt = self.statement(element);
            counts.push(self.run(stmt).await?);
        }
        Ok(counts)
    }

    fn clear_batch(&mut self) -> Result<(), DbErr> {
        self.batch.clear();
        self.bound.clear();
        Ok(())
    }

    async fn generated_keys(&mut self) -> Result<SeaOrmCursor, DbErr> {
        if self.keys != GeneratedKeys::Return {
            return Err(DbErr::Custom(
                "generated keys were not requested at prepare time".to_string(),
            ));
        }
        let rows = match self.last_insert_id {
            Some(id) => vec![Row::Generated(generated_key(id)?)],
            None => Vec::new(),
        };
        Ok(SeaOrmCursor::new(rows))
    }

    async fn close(&mut self) -> Result<(), DbErr> {
        Ok(())
    }
}

enum Row {
    Query(QueryResult),
    Generated(Value),
}

/// Fully buffered rows of one query.
pub struct SeaOrmCursor {
    rows: Vec<Row>,
    position: usize,
}

impl SeaOrmCursor {
    fn new(rows: Vec<Row>) -> Self {
        Self { rows, position: 0 }
    }

    fn current(&self) -> Result<&Row, DbErr> {
        self.position
            .checked_sub(1)
            .and_then(|i| self.rows.get(i))
            .ok_or_else(|| DbErr::Custom("cursor is not positioned on a row".to_string()))
    }
}

#[async_trait]
impl ResultCursor for SeaOrmCursor {
    type Error = DbErr;

    async fn next(&mut self) -> Result<bool, DbErr> {
        if self.position < self.rows.len() {
            self.position += 1;
            Ok(true)
        } else {
            self.position = self.rows.len() + 1;
            Ok(false)
        }
    }

    fn value(&self, index: usize) -> Result<Value, DbErr> {
        match self.current()? {
            Row::Query(row) => decode(row, Column::Index(index)),
            Row::Generated(key) if index == 0 => Ok(key.clone()),
            Row::Generated(_) => Err(DbErr::Custom(format!("no column at index {index}"))),
        }
    }

    fn value_named(&self, column: &str) -> Result<Value, DbErr> {
        match self.current()? {
            Row::Query(row) => decode(row, Column::Name(column)),
            Row::Generated(key) if column == GENERATED_KEY_COLUMN => Ok(key.clone()),
            Row::Generated(_) => Err(DbErr::Custom(format!("no column named {column}"))),
        }
    }

    async fn close(&mut self) -> Result<(), DbErr> {
        self.rows.clear();
        Ok(())
    }
}

fn generated_key(id: u64) -> Result<Value, DbErr> {
    i64::try_from(id)
        .map(Value::Int)
        .map_err(|_| DbErr::Custom(format!("generated key {id} does not fit in a signed 64-bit integer")))
}

fn to_sea_value(value: &Value) -> sea_orm::Value {
    match value {
        Value::Null => sea_orm::Value::String(None),
        Value::Bool(b) => (*b).into(),
        Value::Int(i) => (*i).into(),
        Value::Float(f) => (*f).into(),
        Value::Text(s) => s.clone().into(),
        Value::Bytes(b) => b.clone().into(),
        Value::Date(d) => (*d).into(),
        Value::Timestamp(ts) => (*ts).into(),
    }
}

#[derive(Clone, Copy)]
enum Column<'a> {
    Index(usize),
    Name(&'a str),
}

fn get<T: TryGetable>(row: &QueryResult, column: Column<'_>) -> Result<Option<T>, DbErr> {
    match column {
        Column::Index(index) => row.try_get_by_index(index),
        Column::Name(name) => row.try_get("", name),
    }
}

/// Decode a column without knowing its type, trying the narrowest
/// representations first.
fn decode(row: &QueryResult, column: Column<'_>) -> Result<Value, DbErr> {
    if let Ok(value) = get::<i64>(row, column) {
        return Ok(value.map_or(Value::Null, Value::Int));
    }
    if let Ok(Some(value)) = get::<i32>(row, column) {
        return Ok(Value::Int(i64::from(value)));
    }
    if let Ok(Some(value)) = get::<f64>(row, column) {
        return Ok(Value::Float(value));
    }
    if let Ok(Some(value)) = get::<bool>(row, column) {
        return Ok(Value::Bool(value));
    }
    if let Ok(Some(value)) = get::<String>(row, column) {
        return Ok(Value::Text(value));
    }
    if let Ok(Some(value)) = get::<DateTime<Utc>>(row, column) {
        return Ok(Value::Timestamp(value));
    }
    if let Ok(Some(value)) = get::<NaiveDate>(row, column) {
        return Ok(Value::Date(value));
    }
    get::<Vec<u8>>(row, column).map(|value| value.map_or(Value::Null, Value::Bytes))
}
