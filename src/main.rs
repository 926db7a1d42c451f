use std::{collections::HashMap, sync::Arc, time::Instant};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use incident_lib::{
    clustering::{
        create_clusters::{check_reset_scope, run_incident_clustering},
        quality::run_quality_evaluation,
    },
    matching::manager::run_incremental_matching,
    models::stats_models::RunStats,
    utils::{
        clustering_config::ClusteringConfig,
        db_connect::{connect, get_pool_status, PgPool},
        env::load_env,
        get_memory_usage,
        instantiate_run::{create_initial_clustering_run, finalize_clustering_run},
        progress_config::ProgressConfig,
        scope_filter::ScopeFilter,
    },
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about = "Groups civil complaints into incidents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Cluster every unassigned complaint from scratch, partition by partition
    Batch {
        /// Unlink all complaints and delete all incidents first (destructive;
        /// refused together with a region or category scope)
        #[arg(long)]
        reset: bool,
        /// Only cluster complaints from this district
        #[arg(long)]
        region: Option<i64>,
        /// Only cluster complaints with this target object
        #[arg(long)]
        category: Option<String>,
    },
    /// Match pending complaints to open incidents, then cluster the rest
    Incremental {
        #[arg(long)]
        region: Option<i64>,
        #[arg(long)]
        category: Option<String>,
    },
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Mode::Batch { .. } => "batch",
            Mode::Incremental { .. } => "incremental",
        }
    }

    fn scope(&self) -> ScopeFilter {
        let (region, category) = match self {
            Mode::Batch { region, category, .. } | Mode::Incremental { region, category } => {
                (*region, category.clone())
            }
        };
        ScopeFilter::from_env().with_overrides(region, category)
    }
}

async fn update_main_pb_message(pb: &ProgressBar, phase_name: &str, config: &ProgressConfig, pool: &PgPool) {
    if config.should_show_memory() || config.should_show_db_connection_stats() {
        let mut parts = Vec::new();
        if config.should_show_memory() {
            parts.push(format!("Memory: {} MB", get_memory_usage().await));
        }
        if config.should_show_db_connection_stats() {
            let (size, available, _in_use) = get_pool_status(pool);
            parts.push(format!("DB: {}/{} (used/total)", size - available, size));
        }
        pb.set_message(format!("{} ({})", phase_name, parts.join(", ")));
    } else {
        pb.set_message(phase_name.to_string());
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    load_env();
    let cli = Cli::parse();
    info!("Starting complaint incident clustering ({} mode)", cli.mode.name());

    let config = ClusteringConfig::from_env();
    config.log_config();
    let scope = cli.mode.scope();
    scope.log_config();
    if let Mode::Batch { reset, .. } = &cli.mode {
        check_reset_scope(*reset, &scope)?;
    }

    let progress_config = Arc::new(ProgressConfig::from_env());
    info!(
        "Progress tracking: enabled={}, detailed={}",
        progress_config.enabled, progress_config.detailed
    );
    let multi_progress = progress_config.create_multi_progress();
    let detailed_progress = if progress_config.should_show_detailed() {
        multi_progress.clone()
    } else {
        None
    };

    let main_pb = multi_progress.as_ref().map(|mp| {
        let pb = mp.add(ProgressBar::new(2));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        pb.set_message(format!("Initializing {} run...", cli.mode.name()));
        pb
    });

    let pool = connect().await.context("Failed to connect to database")?;
    info!("Successfully connected to the database");

    let mut phase_times = HashMap::new();
    let run_id = Uuid::new_v4().to_string();
    let run_timestamp = Utc::now().naive_utc();
    let description = match &cli.mode {
        Mode::Batch { reset: true, .. } => "Batch clustering with full reset".to_string(),
        Mode::Batch { .. } => "Batch clustering".to_string(),
        Mode::Incremental { .. } => "Incremental matching cycle".to_string(),
    };
    create_initial_clustering_run(&pool, &run_id, cli.mode.name(), run_timestamp, Some(&description))
        .await
        .context("Failed to create clustering run record")?;

    // Phase 1: clustering or matching
    if let Some(pb) = &main_pb {
        update_main_pb_message(pb, &format!("Phase 1: {}", cli.mode.name()), &progress_config, &pool).await;
    }
    let phase1_start = Instant::now();

    let run_stats = match &cli.mode {
        Mode::Batch { reset, .. } => {
            let stats = run_incident_clustering(&pool, &config, &scope, *reset, detailed_progress.clone())
                .await
                .context("Batch clustering failed")?;
            phase_times.insert("Batch_Clustering".to_string(), phase1_start.elapsed());
            if let Some(pb) = &main_pb {
                pb.inc(2);
            }
            RunStats::Batch {
                reset: *reset,
                average_silhouette: stats.average_silhouette(),
                stats,
                processing_time_secs: phase1_start.elapsed().as_secs_f64(),
            }
        }
        Mode::Incremental { .. } => {
            let stats = run_incremental_matching(&pool, &config, &scope, detailed_progress.clone())
                .await
                .context("Incremental matching failed")?;
            phase_times.insert("Incremental_Matching".to_string(), phase1_start.elapsed());
            if let Some(pb) = &main_pb {
                pb.inc(1);
                update_main_pb_message(pb, "Phase 2: quality evaluation", &progress_config, &pool).await;
            }

            // Phase 2: advisory quality figure, never fatal
            let phase2_start = Instant::now();
            let quality = match run_quality_evaluation(&pool, config.embedding_dim).await {
                Ok(report) => report,
                Err(e) => {
                    warn!("Quality evaluation failed: {:#}", e);
                    None
                }
            };
            phase_times.insert("Quality_Evaluation".to_string(), phase2_start.elapsed());
            if let Some(pb) = &main_pb {
                pb.inc(1);
            }
            RunStats::Incremental {
                stats,
                quality,
                processing_time_secs: phase1_start.elapsed().as_secs_f64(),
            }
        }
    };

    if let Some(pb) = &main_pb {
        update_main_pb_message(pb, "Run complete", &progress_config, &pool).await;
        pb.finish();
    }

    finalize_clustering_run(&pool, &run_id, &run_stats)
        .await
        .context("Failed to finalize clustering run record")?;

    let total_time: std::time::Duration = phase_times.values().sum();
    info!("=== Phase Timing Summary ===");
    for (phase, duration) in &phase_times {
        info!("  {}: {:.2?}", phase, duration);
    }
    info!("  Total Time: {:.2?}", total_time);

    let (pool_size, available_connections, in_use_connections) = get_pool_status(&pool);
    info!(
        "Final DB Connection Pool Status: Total: {}, Available: {}, In Use: {}",
        pool_size, available_connections, in_use_connections
    );
    info!("=== Run {} complete ===", run_id);
    Ok(())
}
