//! Basic example showing how to instrument a SeaORM database with sql-spy.
//!
//! Run with: cargo run --example basic

use std::time::Duration;

use sea_orm::{ConnectOptions, Database};
use sql_spy::prelude::*;
use sql_spy::{SqlFormat, SqlOperation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sql_spy=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".into());

    tracing::info!("Connecting to database...");
    // a second pooled connection to sqlite::memory: would see an empty database
    let mut options = ConnectOptions::new(database_url);
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await?;

    // Option 1: the extension trait with default tracing output
    // let source = SeaOrmSource::from(db).instrument_with_tracing(InstrumentationConfig::default())?;

    // Option 2: a configured sink
    let sink = TracingSink::new()
        .with_format(SqlFormat::default().with_semicolon(true))
        .with_error_threshold(Duration::from_secs(1))
        .with_unprepared_warning(true)
        .suppress(SqlOperation::Create);
    let source = SeaOrmSource::from(db)
        .instrument(InstrumentationConfig::development(), std::sync::Arc::new(sink))?;

    let mut conn = source.connection().await?;
    conn.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
        .await?;

    let mut insert = conn
        .prepare("INSERT INTO users(name) VALUES (?)", GeneratedKeys::None)
        .await?;
    for name in ["ada", "grace"] {
        insert.bind(1.into(), name.into())?;
        insert.add_batch()?;
    }
    insert.execute_batch().await?;

    // Fails, and is reported with the NULL it was given
    insert.bind(1.into(), Value::Null)?;
    if let Err(error) = insert.execute_update().await {
        tracing::info!(error = %error, "Insert rejected as expected");
    }

    let mut select = conn
        .prepare("SELECT id, name FROM users ORDER BY id", GeneratedKeys::None)
        .await?;
    let mut rows = select.execute_query().await?;
    while rows.next().await? {
        tracing::info!(id = %rows.value(0)?, name = %rows.value_named("name")?, "Row");
    }

    conn.close().await?;

    let stats = source.stats();
    tracing::info!(
        emitted = stats.emitted,
        sink_failures = stats.sink_failures,
        "Done"
    );

    Ok(())
}
