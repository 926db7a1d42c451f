// src/matching/manager.rs

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use indicatif::{MultiProgress, ProgressBar};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;

use crate::clustering::db::{fetch_existing_titles, fetch_unassigned_complaints, IncidentStore};
use crate::matching::centroid::IncidentIndex;
use crate::matching::db::load_open_incident_index;
use crate::matching::residual::{cluster_residual_pool, ResidualOutcome};
use crate::models::complaint::ComplaintRecord;
use crate::models::stats_models::IncrementalStats;
use crate::utils::clustering_config::ClusteringConfig;
use crate::utils::db_connect::{is_connection_loss, PgPool};
use crate::utils::keywords::clean_keywords;
use crate::utils::progress_config::phase_bar;
use crate::utils::scope_filter::ScopeFilter;

/// One accepted match, ready to be written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchAssignment {
    pub complaint_id: i64,
    pub incident_id: i64,
    pub score: f64,
    pub received_at: NaiveDateTime,
}

/// Everything one incremental cycle decided.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub assignments: Vec<MatchAssignment>,
    pub residual_pool: Vec<i64>,
    pub residual: ResidualOutcome,
}

/// Scores each unassigned record against the open incidents, in ascending
/// record id order. An accepted record is absorbed into its incident right
/// away, so later records see the updated centroid and signature.
///
/// Returns:
/// The accepted matches and the indices (into `records`) of the rejected ones.
pub fn match_records(
    records: &[ComplaintRecord],
    index: &mut IncidentIndex,
    config: &ClusteringConfig,
) -> (Vec<MatchAssignment>, Vec<usize>) {
    let mut order: Vec<usize> = (0..records.len())
        .filter(|&i| records[i].assigned_incident_id.is_none())
        .collect();
    order.sort_by_key(|&i| records[i].id);

    let mut assignments = Vec::new();
    let mut rejected = Vec::new();
    for i in order {
        let record = &records[i];
        let keywords = clean_keywords(&record.keywords);
        let candidate = index.best_match(&record.embedding, &keywords, config.match_embedding_weight);
        match candidate {
            Some(best) if 1.0 - best.score <= config.match_threshold => {
                index.absorb(best.incident_id, &record.embedding, &keywords, record.received_at);
                debug!(
                    "Complaint {} -> incident {} (score {:.4})",
                    record.id, best.incident_id, best.score
                );
                assignments.push(MatchAssignment {
                    complaint_id: record.id,
                    incident_id: best.incident_id,
                    score: best.score,
                    received_at: record.received_at,
                });
            }
            _ => rejected.push(i),
        }
    }
    (assignments, rejected)
}

/// Plans one full cycle: matching, then residual clustering of what the
/// matcher rejected.
///
/// Arguments:
/// * `records` - Unassigned complaints in scope.
/// * `index` - Open incidents; mutated as records are absorbed.
/// * `config` - Matcher and residual settings.
/// * `titles_in_use` - Titles already taken.
///
/// Returns:
/// The cycle outcome and the grown title set.
pub fn plan_incremental_cycle(
    records: &[ComplaintRecord],
    index: &mut IncidentIndex,
    config: &ClusteringConfig,
    titles_in_use: HashSet<String>,
) -> (CycleOutcome, HashSet<String>) {
    let (assignments, rejected) = match_records(records, index, config);
    let pool: Vec<&ComplaintRecord> = rejected.iter().map(|&i| &records[i]).collect();
    let (residual, titles) = cluster_residual_pool(&pool, config, titles_in_use);
    (
        CycleOutcome {
            assignments,
            residual_pool: pool.iter().map(|r| r.id).collect(),
            residual,
        },
        titles,
    )
}

/// Writes a planned cycle: matches in one transaction, residual incidents in
/// a second. A failed transaction is logged and counted without undoing the
/// other; losing the storage connection ends the run.
pub async fn write_cycle<S: IncidentStore + ?Sized>(
    store: &S,
    outcome: &CycleOutcome,
    stats: &mut IncrementalStats,
    step_pb: Option<&ProgressBar>,
) -> Result<()> {
    if let Some(pb) = step_pb {
        pb.set_message(format!("Writing {} matches...", outcome.assignments.len()));
    }
    match store.link_matches(&outcome.assignments).await {
        Ok(linked) => stats.assigned_to_existing = linked as usize,
        Err(e) if is_connection_loss(&e) => {
            return Err(e.context("Lost the database connection while writing matches"));
        }
        Err(e) => {
            stats.transactions_failed += 1;
            warn!("Match transaction rolled back: {:#}", e);
        }
    }
    if let Some(pb) = step_pb {
        pb.inc(1);
        pb.set_message(format!("Writing {} residual incidents...", outcome.residual.drafts.len()));
    }

    match store.store_drafts(&outcome.residual.drafts).await {
        Ok(_) => {
            stats.new_incidents = outcome.residual.cluster_count();
            stats.new_noise_incidents = outcome.residual.noise_count();
            stats.records_deferred = outcome.residual.deferred.len();
        }
        Err(e) if is_connection_loss(&e) => {
            return Err(e.context("Lost the database connection while writing residual incidents"));
        }
        Err(e) => {
            stats.transactions_failed += 1;
            stats.records_deferred = outcome.residual_pool.len();
            warn!("Residual incident transaction rolled back: {:#}", e);
        }
    }
    Ok(())
}

/// Runs one incremental cycle over every eligible unassigned complaint and
/// writes it with `write_cycle`. A no-op when nothing is pending.
///
/// Arguments:
/// * `pool` - A reference to the PostgreSQL connection pool.
/// * `config` - Clustering tunables.
/// * `scope` - Optional region/category restriction on what is read.
/// * `multi_progress` - An optional `MultiProgress` instance for progress tracking.
///
/// Returns:
/// A `Result` containing the cycle statistics on success, or an `anyhow::Error` on failure.
pub async fn run_incremental_matching(
    pool: &PgPool,
    config: &ClusteringConfig,
    scope: &ScopeFilter,
    multi_progress: Option<MultiProgress>,
) -> Result<IncrementalStats> {
    let mut stats = IncrementalStats::default();

    let (records, skipped) = fetch_unassigned_complaints(pool, scope, multi_progress.clone()).await?;
    stats.records_pending = records.len();
    stats.records_skipped = skipped;
    if records.is_empty() {
        info!("🎉 No pending complaints; nothing to match.");
        return Ok(stats);
    }

    let mut index = load_open_incident_index(pool, config.embedding_dim)
        .await
        .context("Failed to load open incidents")?;
    stats.open_incidents = index.len();
    let titles = fetch_existing_titles(pool).await?;

    let step_pb = phase_bar(&multi_progress, 3, "  ", "Matching against open incidents...");
    let (outcome, _titles) = plan_incremental_cycle(&records, &mut index, config, titles);
    stats.residual_pool = outcome.residual_pool.len();
    if let Some(pb) = &step_pb {
        pb.inc(1);
    }

    write_cycle(pool, &outcome, &mut stats, step_pb.as_ref()).await?;
    if let Some(pb) = &step_pb {
        pb.inc(1);
        pb.finish_with_message("Incremental cycle written");
    }

    info!("📊 Incremental cycle report");
    info!(
        "   👉 Pending: {} ({} skipped as undecodable), open incidents: {}",
        stats.records_pending, stats.records_skipped, stats.open_incidents
    );
    info!("   ✅ Joined existing incidents: {}", stats.assigned_to_existing);
    info!(
        "   🆕 New incidents: {} (+{} noise singletons) from a residual pool of {}",
        stats.new_incidents, stats.new_noise_incidents, stats.residual_pool
    );
    info!("   ⏸️  Deferred to a later cycle: {}", stats.records_deferred);
    if stats.transactions_failed > 0 {
        warn!("   ❌ Transactions rolled back: {}", stats.transactions_failed);
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::centroid::IncidentSignature;
    use crate::models::complaint::IncidentDraft;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::cell::RefCell;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 9, day)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap()
    }

    fn kw(words: &[&str]) -> HashSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn record(id: i64, day: u32, keywords: &[&str], embedding: Vec<f32>) -> ComplaintRecord {
        ComplaintRecord {
            id,
            received_at: at(day),
            region: Some(2),
            category: Some("환경".to_string()),
            text: format!("민원 내용 {}", id),
            keywords: kw(keywords),
            embedding,
            assigned_incident_id: None,
        }
    }

    fn incident(id: i64, centroid: Vec<f32>, words: &[&str], closed_day: u32) -> IncidentSignature {
        IncidentSignature {
            incident_id: id,
            centroid,
            keyword_signature: kw(words),
            member_count: 4,
            closed_at: Some(at(closed_day)),
        }
    }

    #[test]
    fn test_high_scoring_complaint_joins_incident() {
        // cos = 0.94, jaccard = 1.0 -> score 0.97, distance 0.03.
        let theta = 0.94f32.acos();
        let mut index = IncidentIndex::new(vec![incident(10, vec![1.0, 0.0], &["하천", "악취"], 2)]);
        let records = vec![record(100, 8, &["하천", "악취"], vec![theta.cos(), theta.sin()])];

        let (outcome, _) = plan_incremental_cycle(&records, &mut index, &ClusteringConfig::default(), HashSet::new());
        assert_eq!(outcome.assignments.len(), 1);
        let assignment = &outcome.assignments[0];
        assert_eq!(assignment.incident_id, 10);
        assert!((assignment.score - 0.97).abs() < 1e-4);
        assert!(outcome.residual_pool.is_empty());

        let sig = index.get(10).unwrap();
        assert_eq!(sig.member_count, 5);
        assert_eq!(sig.closed_at, Some(at(8)));
    }

    #[test]
    fn test_weak_match_is_deferred_when_alone() {
        // cos = 0.6, jaccard = 1.0 -> score 0.80, distance 0.20.
        let mut index = IncidentIndex::new(vec![incident(10, vec![1.0, 0.0], &["하천"], 2)]);
        let records = vec![record(101, 8, &["하천"], vec![0.6, 0.8])];

        let (outcome, titles) =
            plan_incremental_cycle(&records, &mut index, &ClusteringConfig::default(), HashSet::new());
        assert!(outcome.assignments.is_empty());
        assert_eq!(outcome.residual_pool, vec![101]);
        assert!(outcome.residual.drafts.is_empty());
        assert_eq!(outcome.residual.deferred, vec![101]);
        assert!(titles.is_empty());
        assert_eq!(index.get(10).unwrap().member_count, 4);
    }

    #[test]
    fn test_no_open_incidents_sends_everything_to_residual() {
        let mut index = IncidentIndex::default();
        let records = vec![
            record(1, 1, &["가로수"], vec![0.0, 1.0]),
            record(2, 2, &["가로수"], vec![0.0, 1.0]),
        ];
        let (outcome, _) = plan_incremental_cycle(&records, &mut index, &ClusteringConfig::default(), HashSet::new());
        assert!(outcome.assignments.is_empty());
        assert_eq!(outcome.residual_pool, vec![1, 2]);
        assert_eq!(outcome.residual.cluster_count(), 1);
        assert_eq!(outcome.residual.drafts[0].member_ids, vec![1, 2]);
    }

    #[test]
    fn test_equal_scores_pick_lowest_incident_id() {
        let mut index = IncidentIndex::new(vec![
            incident(41, vec![1.0, 0.0], &["소음"], 1),
            incident(17, vec![1.0, 0.0], &["소음"], 1),
        ]);
        let records = vec![record(5, 3, &["소음"], vec![1.0, 0.0])];
        let (assignments, rejected) = match_records(&records, &mut index, &ClusteringConfig::default());
        assert!(rejected.is_empty());
        assert_eq!(assignments[0].incident_id, 17);
    }

    #[test]
    fn test_rerun_over_assigned_records_changes_nothing() {
        let mut index = IncidentIndex::new(vec![incident(10, vec![1.0, 0.0], &["하천"], 2)]);
        let mut records = vec![record(7, 4, &["하천"], vec![1.0, 0.0])];
        let config = ClusteringConfig::default();

        let (first, _) = plan_incremental_cycle(&records, &mut index, &config, HashSet::new());
        assert_eq!(first.assignments.len(), 1);
        records[0].assigned_incident_id = Some(first.assignments[0].incident_id);
        let count_after_first = index.get(10).unwrap().member_count;

        let (second, titles) = plan_incremental_cycle(&records, &mut index, &config, HashSet::new());
        assert!(second.assignments.is_empty());
        assert!(second.residual_pool.is_empty());
        assert!(second.residual.drafts.is_empty());
        assert!(titles.is_empty());
        assert_eq!(index.get(10).unwrap().member_count, count_after_first);

        let (empty, _) = plan_incremental_cycle(&[], &mut index, &config, HashSet::new());
        assert!(empty.assignments.is_empty() && empty.residual.drafts.is_empty());
    }

    #[derive(Clone, Copy)]
    enum Failure {
        Constraint,
        PoolTimeout,
    }

    impl Failure {
        fn error(self) -> anyhow::Error {
            match self {
                Failure::Constraint => anyhow!("duplicate key value violates unique constraint"),
                Failure::PoolTimeout => anyhow::Error::new(bb8::RunError::<tokio_postgres::Error>::TimedOut)
                    .context("Failed to get DB client"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        fail_matches: Option<Failure>,
        fail_drafts: Option<Failure>,
        linked: RefCell<Vec<i64>>,
        stored: RefCell<Vec<Vec<i64>>>,
    }

    #[async_trait(?Send)]
    impl IncidentStore for RecordingStore {
        async fn store_drafts(&self, drafts: &[IncidentDraft]) -> Result<Vec<i64>> {
            if let Some(failure) = self.fail_drafts {
                return Err(failure.error());
            }
            self.stored.borrow_mut().extend(drafts.iter().map(|d| d.member_ids.clone()));
            Ok((1..=drafts.len() as i64).collect())
        }

        async fn link_matches(&self, assignments: &[MatchAssignment]) -> Result<u64> {
            if let Some(failure) = self.fail_matches {
                return Err(failure.error());
            }
            self.linked.borrow_mut().extend(assignments.iter().map(|a| a.complaint_id));
            Ok(assignments.len() as u64)
        }
    }

    /// Record 7 joins incident 10; records 8 and 9 form a residual incident.
    fn planned_cycle() -> CycleOutcome {
        let mut index = IncidentIndex::new(vec![incident(10, vec![1.0, 0.0], &["하천"], 2)]);
        let records = vec![
            record(7, 4, &["하천"], vec![1.0, 0.0]),
            record(8, 5, &["가로수"], vec![0.0, 1.0]),
            record(9, 6, &["가로수"], vec![0.0, 1.0]),
        ];
        let (outcome, _) = plan_incremental_cycle(&records, &mut index, &ClusteringConfig::default(), HashSet::new());
        assert_eq!(outcome.assignments.len(), 1);
        assert_eq!(outcome.residual.cluster_count(), 1);
        outcome
    }

    #[tokio::test]
    async fn test_write_cycle_commits_both_transactions() {
        let outcome = planned_cycle();
        let store = RecordingStore::default();
        let mut stats = IncrementalStats::default();
        write_cycle(&store, &outcome, &mut stats, None).await.unwrap();

        assert_eq!(*store.linked.borrow(), vec![7]);
        assert_eq!(*store.stored.borrow(), vec![vec![8, 9]]);
        assert_eq!(stats.assigned_to_existing, 1);
        assert_eq!(stats.new_incidents, 1);
        assert_eq!(stats.transactions_failed, 0);
    }

    #[tokio::test]
    async fn test_failed_match_transaction_still_writes_residual() {
        let outcome = planned_cycle();
        let store = RecordingStore {
            fail_matches: Some(Failure::Constraint),
            ..Default::default()
        };
        let mut stats = IncrementalStats::default();
        write_cycle(&store, &outcome, &mut stats, None).await.unwrap();

        assert!(store.linked.borrow().is_empty());
        assert_eq!(*store.stored.borrow(), vec![vec![8, 9]]);
        assert_eq!(stats.assigned_to_existing, 0);
        assert_eq!(stats.transactions_failed, 1);
        assert_eq!(stats.new_incidents, 1);
    }

    #[tokio::test]
    async fn test_lost_connection_ends_the_cycle() {
        let outcome = planned_cycle();
        let store = RecordingStore {
            fail_drafts: Some(Failure::PoolTimeout),
            ..Default::default()
        };
        let mut stats = IncrementalStats::default();
        let err = write_cycle(&store, &outcome, &mut stats, None).await.unwrap_err();

        assert!(is_connection_loss(&err));
        assert_eq!(*store.linked.borrow(), vec![7]);
        assert_eq!(stats.transactions_failed, 0);
    }
}
