//! In-memory driver used by the unit tests.
//!
//! One table of rows shared by every connection of a source. `INSERT`
//! appends the bound values in placeholder order; `SELECT` returns every
//! row. SQL containing `NOT NULL` rejects null bindings, and SQL starting
//! with `BOGUS` fails to prepare.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::InstrumentationConfig;
use crate::driver::{Connection, DataSource, GeneratedKeys, PreparedStatement, ResultCursor};
use crate::install::install;
use crate::params::ParamKey;
use crate::sink::MemorySink;
use crate::source::InstrumentedSource;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum FakeError {
    #[error("connection refused")]
    Checkout,
    #[error("syntax error in {0:?}")]
    Syntax(String),
    #[error("NOT NULL constraint failed for parameter {0}")]
    NotNull(u32),
    #[error("close failed")]
    Close,
    #[error("cursor is not on a row")]
    NoRow,
    #[error("column index {0} out of range")]
    Column(usize),
    #[error("no such column {0:?}")]
    UnknownColumn(String),
    #[error("generated keys were not requested")]
    KeysNotRequested,
    #[error("parameter index must be positive")]
    BadIndex,
    #[error("no transaction in progress")]
    NoTransaction,
}

type Row = Vec<Value>;

#[derive(Debug, Default)]
struct Shared {
    rows: Mutex<Vec<Row>>,
    refuse_checkouts: AtomicBool,
    fail_closes: AtomicBool,
    closes: AtomicUsize,
}

impl Shared {
    fn rows(&self) -> std::sync::MutexGuard<'_, Vec<Row>> {
        self.rows.lock().unwrap()
    }

    fn close(&self) -> Result<(), FakeError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_closes.load(Ordering::SeqCst) {
            Err(FakeError::Close)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeSource {
    shared: Arc<Shared>,
}

impl FakeSource {
    pub(crate) fn refuse_checkouts(&self) {
        self.shared.refuse_checkouts.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_closes(&self) {
        self.shared.fail_closes.store(true, Ordering::SeqCst);
    }

    /// Close calls that reached the driver, across all resource kinds.
    pub(crate) fn real_closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }
}

/// A fake source instrumented into a [`MemorySink`]. The returned
/// [`FakeSource`] shares state with the wrapped one.
pub(crate) fn instrumented(
    config: InstrumentationConfig,
) -> (InstrumentedSource<FakeSource>, Arc<MemorySink>, FakeSource) {
    let fake = FakeSource::default();
    let sink = Arc::new(MemorySink::new());
    let source = install(fake.clone(), config, sink.clone()).unwrap();
    (source, sink, fake)
}

#[async_trait]
impl DataSource for FakeSource {
    type Connection = FakeConnection;
    type Error = FakeError;

    async fn connection(&self) -> Result<FakeConnection, FakeError> {
        if self.shared.refuse_checkouts.load(Ordering::SeqCst) {
            return Err(FakeError::Checkout);
        }
        Ok(FakeConnection {
            shared: self.shared.clone(),
            in_transaction: false,
        })
    }

    async fn close(&self) -> Result<(), FakeError> {
        self.shared.close()
    }
}

#[derive(Debug)]
pub(crate) struct FakeConnection {
    shared: Arc<Shared>,
    in_transaction: bool,
}

impl FakeConnection {
    fn end_transaction(&mut self) -> Result<(), FakeError> {
        if !self.in_transaction {
            return Err(FakeError::NoTransaction);
        }
        self.in_transaction = false;
        Ok(())
    }
}

fn check_syntax(sql: &str) -> Result<(), FakeError> {
    if sql.trim_start().starts_with("BOGUS") {
        Err(FakeError::Syntax(sql.to_string()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Connection for FakeConnection {
    type Statement = FakeStatement;
    type Error = FakeError;

    async fn prepare(&mut self, sql: &str, keys: GeneratedKeys) -> Result<FakeStatement, FakeError> {
        check_syntax(sql)?;
        Ok(FakeStatement {
            shared: self.shared.clone(),
            sql: sql.to_string(),
            keys,
            bound: BTreeMap::new(),
            batch: Vec::new(),
            executions: 0,
            last_key: None,
        })
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, FakeError> {
        check_syntax(sql)?;
        Ok(0)
    }

    async fn begin(&mut self) -> Result<(), FakeError> {
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), FakeError> {
        self.end_transaction()
    }

    async fn rollback(&mut self) -> Result<(), FakeError> {
        self.end_transaction()
    }

    async fn close(&mut self) -> Result<(), FakeError> {
        self.shared.close()
    }
}

#[derive(Debug)]
pub(crate) struct FakeStatement {
    shared: Arc<Shared>,
    sql: String,
    keys: GeneratedKeys,
    bound: BTreeMap<ParamKey, Value>,
    batch: Vec<BTreeMap<ParamKey, Value>>,
    executions: usize,
    last_key: Option<i64>,
}

impl FakeStatement {
    /// The value the driver received for `key`.
    pub(crate) fn bound(&self, key: &ParamKey) -> Option<Value> {
        self.bound.get(key).cloned()
    }

    pub(crate) fn executions(&self) -> usize {
        self.executions
    }

    fn run(&mut self, bound: &BTreeMap<ParamKey, Value>) -> Result<u64, FakeError> {
        if self.sql.contains("NOT NULL") {
            if let Some((key, _)) = bound.iter().find(|(_, v)| v.is_null()) {
                let index = match key {
                    ParamKey::Index(i) => *i,
                    ParamKey::Name(_) => 0,
                };
                return Err(FakeError::NotNull(index));
            }
        }

        let verb = self.sql.trim_start().to_ascii_uppercase();
        let mut rows = self.shared.rows();
        if verb.starts_with("INSERT") {
            rows.push(bound.values().cloned().collect());
            self.last_key = Some(rows.len() as i64);
            Ok(1)
        } else if verb.starts_with("UPDATE") || verb.starts_with("DELETE") {
            Ok(rows.len() as u64)
        } else {
            Ok(0)
        }
    }
}

#[async_trait]
impl PreparedStatement for FakeStatement {
    type Cursor = FakeCursor;
    type Error = FakeError;

    fn bind(&mut self, key: ParamKey, value: Value) -> Result<(), FakeError> {
        if key == ParamKey::Index(0) {
            return Err(FakeError::BadIndex);
        }
        self.bound.insert(key, value);
        Ok(())
    }

    fn clear_parameters(&mut self) -> Result<(), FakeError> {
        self.bound.clear();
        Ok(())
    }

    async fn execute_update(&mut self) -> Result<u64, FakeError> {
        self.executions += 1;
        let bound = self.bound.clone();
        self.run(&bound)
    }

    async fn execute_query(&mut self) -> Result<FakeCursor, FakeError> {
        self.executions += 1;
        Ok(FakeCursor::new(self.shared.clone(), self.shared.rows().clone()))
    }

    fn add_batch(&mut self) -> Result<(), FakeError> {
        self.batch.push(self.bound.clone());
        Ok(())
    }

    async fn execute_batch(&mut self) -> Result<Vec<u64>, FakeError> {
        self.executions += 1;
        let batch = std::mem::take(&mut self.batch);
        self.bound.clear();
        batch.iter().map(|element| self.run(element)).collect()
    }

    fn clear_batch(&mut self) -> Result<(), FakeError> {
        self.batch.clear();
        self.bound.clear();
        Ok(())
    }

    async fn generated_keys(&mut self) -> Result<FakeCursor, FakeError> {
        if self.keys != GeneratedKeys::Return {
            return Err(FakeError::KeysNotRequested);
        }
        let rows = self.last_key.map(|key| vec![Value::Int(key)]).into_iter().collect();
        Ok(FakeCursor::new(self.shared.clone(), rows))
    }

    async fn close(&mut self) -> Result<(), FakeError> {
        self.shared.close()
    }
}

/// Columns are addressed by index or by the names `c0`, `c1`, ...
#[derive(Debug)]
pub(crate) struct FakeCursor {
    shared: Arc<Shared>,
    rows: Vec<Row>,
    position: usize,
}

impl FakeCursor {
    fn new(shared: Arc<Shared>, rows: Vec<Row>) -> Self {
        Self {
            shared,
            rows,
            position: 0,
        }
    }
}

#[async_trait]
impl ResultCursor for FakeCursor {
    type Error = FakeError;

    async fn next(&mut self) -> Result<bool, FakeError> {
        if self.position < self.rows.len() {
            self.position += 1;
            Ok(true)
        } else {
            self.position = self.rows.len() + 1;
            Ok(false)
        }
    }

    fn value(&self, index: usize) -> Result<Value, FakeError> {
        let row = self
            .position
            .checked_sub(1)
            .and_then(|i| self.rows.get(i))
            .ok_or(FakeError::NoRow)?;
        row.get(index).cloned().ok_or(FakeError::Column(index))
    }

    fn value_named(&self, column: &str) -> Result<Value, FakeError> {
        let index = column
            .strip_prefix('c')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| FakeError::UnknownColumn(column.to_string()))?;
        self.value(index)
    }

    async fn close(&mut self) -> Result<(), FakeError> {
        self.shared.close()
    }
}
