// src/utils/db_connect.rs

use anyhow::{Context, Result};
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use log::info;
use std::time::Duration;
use tokio_postgres::{Config, NoTls};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Reads environment variables and constructs a PostgreSQL config.
fn build_pg_config() -> Config {
    let mut config = Config::new();
    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port_str = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let port = port_str.parse::<u16>().unwrap_or(5432);
    let dbname = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "complaint_db".to_string());
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();

    info!(
        "DB Config: Host={}, Port={}, DB={}, User={}",
        host, port, dbname, user
    );
    config
        .host(&host)
        .port(port)
        .dbname(&dbname)
        .user(&user)
        .password(&password);
    config.application_name("incident_clustering");
    config.connect_timeout(Duration::from_secs(10));
    config
}

/// Initializes the database connection pool.
///
/// Runs are serial, so the pool stays small: one connection carries the
/// in-flight partition transaction, the rest serve reads and run bookkeeping.
pub async fn connect() -> Result<PgPool> {
    let config = build_pg_config();
    info!("Connecting to PostgreSQL database...");
    let manager = PostgresConnectionManager::new(config, NoTls);

    let pool = Pool::builder()
        .max_size(8)
        .min_idle(Some(1))
        .idle_timeout(Some(Duration::from_secs(180)))
        .connection_timeout(Duration::from_secs(15))
        .build(manager)
        .await
        .context("Failed to build database connection pool")?;

    // Test connection
    let conn = pool
        .get()
        .await
        .context("Failed to get test connection from pool")?;
    conn.query_one("SELECT 1", &[])
        .await
        .context("Test query 'SELECT 1' failed")?;
    drop(conn);
    info!("Database connection pool initialized successfully.");
    Ok(pool)
}

/// Returns (total connections, idle connections, in-use connections).
pub fn get_pool_status(pool: &PgPool) -> (u32, u32, u32) {
    let state = pool.state();
    (
        state.connections,
        state.idle_connections,
        state.connections.saturating_sub(state.idle_connections),
    )
}

/// True when `err` means the database itself went away: the pool timed out
/// handing out a connection, the connection closed underneath us, or the
/// socket failed. Query and constraint errors are not connection loss.
pub fn is_connection_loss(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(run_err) = cause.downcast_ref::<bb8::RunError<tokio_postgres::Error>>() {
            return match run_err {
                bb8::RunError::TimedOut => true,
                bb8::RunError::User(pg_err) => pg_err.is_closed() || pg_err.code().is_none(),
            };
        }
        if let Some(pg_err) = cause.downcast_ref::<tokio_postgres::Error>() {
            return pg_err.is_closed();
        }
        cause.downcast_ref::<std::io::Error>().is_some()
    })
}
