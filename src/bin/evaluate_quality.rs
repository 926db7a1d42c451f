// src/bin/evaluate_quality.rs

use anyhow::{Context, Result};
use incident_lib::clustering::quality::run_quality_evaluation;
use incident_lib::utils::clustering_config::ClusteringConfig;
use incident_lib::utils::db_connect::connect;
use incident_lib::utils::env::load_env;
use incident_lib::utils::progress_config::ProgressConfig;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("Starting standalone clustering quality evaluation (read-only)");
    load_env();

    let config = ClusteringConfig::from_env();
    let progress_config = ProgressConfig::from_env();
    let multi_progress = progress_config.create_multi_progress();

    let main_pb = multi_progress.as_ref().map(|mp| {
        let pb = mp.add(ProgressBar::new(1));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        pb.set_message("Connecting to database...");
        pb
    });

    let pool = connect().await.context("Failed to connect to database")?;
    info!("Successfully connected to the database");

    if let Some(pb) = &main_pb {
        pb.set_message("Computing silhouette over labeled complaints...");
    }
    let start = Instant::now();
    let report = run_quality_evaluation(&pool, config.embedding_dim)
        .await
        .context("Quality evaluation failed")?;
    let elapsed = start.elapsed();

    let summary = match &report {
        Some(r) => format!("Accuracy index {:.2}% (silhouette {:.4})", r.accuracy_pct, r.silhouette),
        None => "Insufficient data for a quality figure".to_string(),
    };
    if let Some(pb) = &main_pb {
        pb.inc(1);
        pb.finish_with_message(format!("{} in {:.2?}", summary, elapsed));
    }
    if let Some(r) = &report {
        info!("{}", serde_json::to_string_pretty(r).context("Failed to serialize quality report")?);
    }
    info!("{} ({:.2?})", summary, elapsed);
    Ok(())
}
