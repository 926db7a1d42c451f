// src/utils/instantiate_run.rs

use crate::{models::stats_models::RunStats, utils::db_connect::PgPool};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use log::info;
use tokio_postgres::types::Json;

/// Inserts the run-metadata row before any incident is written.
pub async fn create_initial_clustering_run(
    pool: &PgPool,
    run_id: &str,
    mode: &str,
    run_timestamp: NaiveDateTime,
    description: Option<&str>,
) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for create_initial_clustering_run")?;

    const INSERT_SQL: &str = "
        INSERT INTO incident_metadata.clustering_run (id, mode, run_timestamp, description)
        VALUES ($1, $2, $3, $4)
    ";

    conn.execute(INSERT_SQL, &[&run_id, &mode, &run_timestamp, &description])
        .await
        .context("Failed to insert initial clustering_run record")?;

    info!("Created initial clustering_run record with ID: {}", run_id);
    Ok(())
}

/// Stores the final stats on the run row.
pub async fn finalize_clustering_run(pool: &PgPool, run_id: &str, stats: &RunStats) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for finalize_clustering_run")?;

    const UPDATE_SQL: &str = "
        UPDATE incident_metadata.clustering_run
        SET stats = $2, finished_at = CURRENT_TIMESTAMP
        WHERE id = $1
    ";

    conn.execute(UPDATE_SQL, &[&run_id, &Json(stats)])
        .await
        .context("Failed to update clustering_run record")?;

    info!("Finalized clustering_run record {}", run_id);
    Ok(())
}
