// src/clustering/create_clusters.rs

use anyhow::{bail, Context, Result};
use indicatif::{MultiProgress, ProgressBar};
use log::{debug, info, warn};
use ndarray::{Array2, Axis};
use std::collections::{BTreeMap, HashSet};

use crate::clustering::db::{fetch_existing_titles, fetch_unassigned_complaints, reset_incidents, IncidentStore};
use crate::clustering::dbscan::{dbscan_precomputed, NOISE};
use crate::clustering::hybrid_distance::{hybrid_distance_matrix, text_distance_matrix};
use crate::clustering::quality::silhouette_score_precomputed;
use crate::clustering::title::synthesize_title;
use crate::models::complaint::{ComplaintRecord, IncidentDraft, PartitionKey, SingletonPolicy};
use crate::models::stats_models::BatchClusteringStats;
use crate::utils::clustering_config::ClusteringConfig;
use crate::utils::db_connect::{is_connection_loss, PgPool};
use crate::utils::keywords::representative_keyword;
use crate::utils::progress_config::phase_bar;
use crate::utils::scope_filter::ScopeFilter;

/// Everything one partition produces before it is written.
#[derive(Debug, Clone, Default)]
pub struct PartitionOutcome {
    pub drafts: Vec<IncidentDraft>,
    /// Items the singleton policy chose not to open incidents for.
    pub unassigned: Vec<i64>,
    /// Pass-3 silhouettes, one per group where it was computable.
    pub silhouettes: Vec<f64>,
}

impl PartitionOutcome {
    pub fn cluster_count(&self) -> usize {
        self.drafts.iter().filter(|d| !d.is_noise).count()
    }

    pub fn noise_count(&self) -> usize {
        self.drafts.iter().filter(|d| d.is_noise).count()
    }
}

/// The value every member agrees on, or `None` when any member differs.
fn shared_value<T: PartialEq + Clone>(mut values: impl Iterator<Item = Option<T>>) -> Option<T> {
    let first = values.next()??;
    if values.all(|v| v.as_ref() == Some(&first)) {
        Some(first)
    } else {
        None
    }
}

/// Builds an unsaved incident for `members` and reserves its title. Region
/// and category are only set when every member shares them.
///
/// Arguments:
/// * `members` - Cluster members, ascending by complaint id. Must be non-empty.
/// * `is_noise` - Whether this is a singleton opened for an unclusterable item.
/// * `link_score` - Score recorded on each member's incident link.
/// * `title_max_len` - Title length cap.
/// * `titles_in_use` - Titles already taken.
///
/// Returns:
/// The draft and the in-use title set grown by its title.
pub fn incident_draft(
    members: &[&ComplaintRecord],
    is_noise: bool,
    link_score: f64,
    title_max_len: usize,
    titles_in_use: HashSet<String>,
) -> (IncidentDraft, HashSet<String>) {
    let (title, titles_in_use) = synthesize_title(members, title_max_len, titles_in_use);
    let opened_at = members.iter().map(|m| m.received_at).min().unwrap_or_default();
    let closed_at = members.iter().map(|m| m.received_at).max().unwrap_or(opened_at);
    let draft = IncidentDraft {
        title,
        member_ids: members.iter().map(|m| m.id).collect(),
        representative_keyword: representative_keyword(members.iter().map(|m| &m.keywords)),
        opened_at,
        closed_at,
        region: shared_value(members.iter().map(|m| m.region)),
        category: shared_value(members.iter().map(|m| m.category.clone())),
        is_noise,
        link_score,
    };
    (draft, titles_in_use)
}

/// Splits records into (region, category) partitions, each ascending by id.
pub fn partition_records(records: Vec<ComplaintRecord>) -> BTreeMap<PartitionKey, Vec<ComplaintRecord>> {
    let mut partitions: BTreeMap<PartitionKey, Vec<ComplaintRecord>> = BTreeMap::new();
    for record in records {
        partitions.entry(record.partition_key()).or_default().push(record);
    }
    for members in partitions.values_mut() {
        members.sort_by_key(|r| r.id);
    }
    partitions
}

fn square_subset(dist: &Array2<f64>, indices: &[usize]) -> Array2<f64> {
    dist.select(Axis(0), indices).select(Axis(1), indices)
}

/// Pass 1 plus large-cluster refinement. Returns the groups bound for Pass 3
/// and the indices that fell out as noise, both as indices into `records`.
fn coarse_groups(records: &[ComplaintRecord], config: &ClusteringConfig) -> (Vec<Vec<usize>>, Vec<usize>) {
    let embeddings: Vec<Vec<f32>> = records.iter().map(|r| r.embedding.clone()).collect();
    let keywords: Vec<HashSet<String>> = records.iter().map(|r| r.keywords.clone()).collect();
    let dist = hybrid_distance_matrix(&embeddings, &keywords, config.alpha, config.embedding_dim);

    let pass1 = dbscan_precomputed(&dist, config.eps_coarse, config.min_samples);
    let mut groups = Vec::new();
    let mut noise = pass1.noise();

    for cluster in pass1.clusters() {
        if cluster.len() < config.large_cluster_threshold {
            groups.push(cluster);
            continue;
        }
        // Refinement reuses the pass-1 distances over the cluster's members.
        let refined = dbscan_precomputed(&square_subset(&dist, &cluster), config.eps_refine, config.min_samples);
        debug!(
            "Refined cluster of {} into {} sub-clusters ({} noise)",
            cluster.len(),
            refined.n_clusters,
            refined.noise().len()
        );
        noise.extend(refined.noise().into_iter().map(|i| cluster[i]));
        groups.extend(
            refined
                .clusters()
                .into_iter()
                .map(|sub| sub.into_iter().map(|i| cluster[i]).collect::<Vec<_>>()),
        );
    }
    noise.sort_unstable();
    (groups, noise)
}

/// Pass 3 on one group: text-level density clustering. Returns the final
/// clusters, the noise, and the group's silhouette when computable.
fn text_pass(
    records: &[ComplaintRecord],
    group: &[usize],
    config: &ClusteringConfig,
) -> (Vec<Vec<usize>>, Vec<usize>, Option<f64>) {
    let texts: Vec<&str> = group.iter().map(|&i| records[i].text.as_str()).collect();
    let dist = text_distance_matrix(&texts);
    let pass3 = dbscan_precomputed(&dist, config.eps_text, config.min_samples);

    let valid: Vec<usize> = (0..group.len()).filter(|&i| pass3.labels[i] != NOISE).collect();
    let silhouette = if pass3.n_clusters >= 2 && valid.len() >= 2 {
        let labels: Vec<i32> = valid.iter().map(|&i| pass3.labels[i]).collect();
        silhouette_score_precomputed(&square_subset(&dist, &valid), &labels)
    } else {
        None
    };

    let clusters = pass3
        .clusters()
        .into_iter()
        .map(|c| c.into_iter().map(|i| group[i]).collect())
        .collect();
    let noise = pass3.noise().into_iter().map(|i| group[i]).collect();
    (clusters, noise, silhouette)
}

/// Runs the three-stage cascade on one partition.
///
/// Partitions of fewer than two records, Pass-1 and refinement noise, groups
/// too small for Pass 3, and Pass-3 noise all end up as singletons, handled
/// per `config.batch_singleton_policy`. The cascade never goes deeper than
/// these three stages.
///
/// Arguments:
/// * `records` - The partition's records, ascending by id.
/// * `config` - Radii, thresholds and policies.
/// * `titles_in_use` - Titles already taken across the corpus.
///
/// Returns:
/// The partition's outcome and the grown title set.
pub fn plan_partition(
    records: &[ComplaintRecord],
    config: &ClusteringConfig,
    titles_in_use: HashSet<String>,
) -> (PartitionOutcome, HashSet<String>) {
    let mut outcome = PartitionOutcome::default();
    let mut titles = titles_in_use;

    let mut clusters: Vec<Vec<usize>> = Vec::new();
    let mut singletons: Vec<usize> = Vec::new();

    if records.len() < 2 {
        singletons.extend(0..records.len());
    } else {
        let (groups, coarse_noise) = coarse_groups(records, config);
        singletons.extend(coarse_noise);
        for group in groups {
            if group.len() < 2 {
                singletons.extend(group);
                continue;
            }
            let (final_clusters, text_noise, silhouette) = text_pass(records, &group, config);
            clusters.extend(final_clusters);
            singletons.extend(text_noise);
            outcome.silhouettes.extend(silhouette);
        }
    }

    for cluster in &clusters {
        let members: Vec<&ComplaintRecord> = cluster.iter().map(|&i| &records[i]).collect();
        let (draft, next) = incident_draft(&members, false, config.batch_link_score, config.title_max_len, titles);
        titles = next;
        outcome.drafts.push(draft);
    }

    singletons.sort_unstable();
    for idx in singletons {
        let record = &records[idx];
        match config.batch_singleton_policy {
            SingletonPolicy::OpenIncident => {
                let (draft, next) =
                    incident_draft(&[record], true, config.batch_link_score, config.title_max_len, titles);
                titles = next;
                outcome.drafts.push(draft);
            }
            SingletonPolicy::LeaveUnassigned => outcome.unassigned.push(record.id),
        }
    }

    (outcome, titles)
}

/// Plans and writes every partition in key order, one transaction each.
/// A partition whose write fails is rolled back, logged and counted, and the
/// next one proceeds. Losing the storage connection ends the run.
///
/// Arguments:
/// * `store` - Where incidents are written.
/// * `partitions` - Records by (region, category), each ascending by id.
/// * `config` - Clustering tunables.
/// * `titles_in_use` - Titles already taken across the corpus.
/// * `stats` - Batch statistics to accumulate into.
/// * `partition_pb` - An optional per-partition progress bar.
///
/// Returns:
/// The title set grown by every committed partition.
pub async fn write_partitions<S: IncidentStore + ?Sized>(
    store: &S,
    partitions: &BTreeMap<PartitionKey, Vec<ComplaintRecord>>,
    config: &ClusteringConfig,
    titles_in_use: HashSet<String>,
    stats: &mut BatchClusteringStats,
    partition_pb: Option<&ProgressBar>,
) -> Result<HashSet<String>> {
    let mut titles = titles_in_use;
    for (key, members) in partitions {
        if let Some(pb) = partition_pb {
            pb.set_message(format!("{} ({} complaints)", key, members.len()));
        }
        let (outcome, next_titles) = plan_partition(members, config, titles.clone());

        match store.store_drafts(&outcome.drafts).await {
            Ok(ids) => {
                titles = next_titles;
                stats.partitions_processed += 1;
                stats.clusters_created += outcome.cluster_count();
                stats.noise_incidents += outcome.noise_count();
                stats.records_unassigned += outcome.unassigned.len();
                stats.silhouette_scores.extend(outcome.silhouettes.iter().copied());
                debug!(
                    "Partition {}: {} incidents written ({} clusters, {} noise), {} left unassigned",
                    key,
                    ids.len(),
                    outcome.cluster_count(),
                    outcome.noise_count(),
                    outcome.unassigned.len()
                );
            }
            Err(e) if is_connection_loss(&e) => {
                return Err(e.context(format!("Lost the database connection while writing partition {}", key)));
            }
            Err(e) => {
                stats.partitions_failed += 1;
                warn!("Partition {} rolled back: {:#}", key, e);
            }
        }
        if let Some(pb) = partition_pb {
            pb.inc(1);
        }
    }
    Ok(titles)
}

/// A reset wipes every incident, so it is only allowed on an unscoped run.
pub fn check_reset_scope(reset: bool, scope: &ScopeFilter) -> Result<()> {
    if reset && scope.is_scoped() {
        bail!(
            "Refusing to reset with a scope (region {:?}, category {:?}): reset deletes every incident but only the scope would be rebuilt",
            scope.region,
            scope.category
        );
    }
    Ok(())
}

/// Orchestrates the batch (bootstrap) clustering of every unassigned complaint
/// in scope. Each partition is planned in memory and written in its own
/// transaction; see `write_partitions` for the failure handling.
///
/// Arguments:
/// * `pool` - A reference to the PostgreSQL connection pool.
/// * `config` - Clustering tunables.
/// * `scope` - Optional region/category restriction on what is read.
/// * `reset` - Unlink all complaints and delete all incidents first. Refused
///   when `scope` is set.
/// * `multi_progress` - An optional `MultiProgress` instance for progress tracking.
///
/// Returns:
/// A `Result` containing the batch statistics on success, or an `anyhow::Error` on failure.
pub async fn run_incident_clustering(
    pool: &PgPool,
    config: &ClusteringConfig,
    scope: &ScopeFilter,
    reset: bool,
    multi_progress: Option<MultiProgress>,
) -> Result<BatchClusteringStats> {
    let mut stats = BatchClusteringStats::default();

    check_reset_scope(reset, scope)?;
    if reset {
        reset_incidents(pool).await.context("Incident reset failed")?;
    }

    let (records, skipped) = fetch_unassigned_complaints(pool, scope, multi_progress.clone()).await?;
    stats.records_loaded = records.len();
    stats.records_skipped = skipped;
    if records.is_empty() {
        info!("No unassigned complaints to cluster.");
        return Ok(stats);
    }

    let titles = fetch_existing_titles(pool).await?;
    let partitions = partition_records(records);
    info!(
        "Clustering {} complaints across {} partitions ({} titles already in use)",
        stats.records_loaded,
        partitions.len(),
        titles.len()
    );

    let partition_pb = phase_bar(
        &multi_progress,
        partitions.len() as u64,
        "  ",
        "Clustering partitions...",
    );
    write_partitions(pool, &partitions, config, titles, &mut stats, partition_pb.as_ref()).await?;

    if let Some(pb) = &partition_pb {
        pb.finish_with_message(format!(
            "{} incidents from {} partitions",
            stats.incidents_created(),
            stats.partitions_processed
        ));
    }

    info!("📊 Batch clustering report");
    info!("   ✅ Incidents created: {}", stats.incidents_created());
    info!("   🧩 Multi-member clusters: {}", stats.clusters_created);
    info!("   🧹 Noise singletons: {}", stats.noise_incidents);
    if stats.records_unassigned > 0 {
        info!("   ⏸️  Left unassigned by policy: {}", stats.records_unassigned);
    }
    if stats.records_skipped > 0 {
        info!("   ⚠️  Skipped (undecodable): {}", stats.records_skipped);
    }
    if stats.partitions_failed > 0 {
        warn!("   ❌ Partitions rolled back: {}", stats.partitions_failed);
    }
    info!(
        "   🎯 Mean silhouette: {:.4} ({})",
        stats.average_silhouette(),
        stats.verdict()
    );

    Ok(stats)
}
