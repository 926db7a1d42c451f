// src/matching/db.rs

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use log::{debug, info, warn};
use postgres_types::ToSql;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::clustering::db::{decode_embedding, decode_keywords};
use crate::matching::centroid::{IncidentIndex, IncidentSignature};
use crate::matching::manager::MatchAssignment;
use crate::models::complaint::INCIDENT_STATUS_OPEN;
use crate::utils::db_connect::PgPool;
use crate::utils::keywords::clean_keywords;

#[derive(Default)]
struct IncidentMembers {
    closed_at: Option<NaiveDateTime>,
    embeddings: Vec<Vec<f32>>,
    keyword_sets: Vec<HashSet<String>>,
}

/// Loads every OPEN incident and derives its centroid and cleaned keyword
/// signature from the current members. Members whose payload cannot be
/// decoded are left out of the derivation; an incident with no decodable
/// member is not matchable this cycle.
pub async fn load_open_incident_index(pool: &PgPool, fallback_dim: usize) -> Result<IncidentIndex> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for load_open_incident_index")?;

    const MEMBERS_SQL: &str = "
        SELECT i.id AS incident_id, i.closed_at, c.id AS complaint_id,
               n.embedding::text AS embedding, n.keywords_jsonb
        FROM incidents i
        JOIN complaints c ON c.incident_id = i.id
        JOIN complaint_normalizations n ON n.complaint_id = c.id AND n.is_current = true
        WHERE i.status = $1 AND n.embedding IS NOT NULL
        ORDER BY i.id, c.id
    ";
    let status = INCIDENT_STATUS_OPEN;
    let params: [&(dyn ToSql + Sync); 1] = [&status];
    let rows = conn
        .query(MEMBERS_SQL, &params)
        .await
        .context("Failed to query open incident members")?;

    let mut by_incident: BTreeMap<i64, IncidentMembers> = BTreeMap::new();
    let mut skipped = 0usize;
    for row in &rows {
        let incident_id: i64 = row.get("incident_id");
        let complaint_id: i64 = row.get("complaint_id");
        let entry = by_incident.entry(incident_id).or_default();
        entry.closed_at = row.get("closed_at");

        let raw_embedding: String = row.get("embedding");
        let raw_keywords: Option<Value> = row.get("keywords_jsonb");
        match (decode_embedding(&raw_embedding), decode_keywords(raw_keywords.as_ref())) {
            (Ok(embedding), Ok(keywords)) => {
                entry.embeddings.push(embedding);
                entry.keyword_sets.push(clean_keywords(&keywords));
            }
            (Err(e), _) | (_, Err(e)) => {
                skipped += 1;
                warn!(
                    "Leaving complaint {} out of incident {} signature: {:#}",
                    complaint_id, incident_id, e
                );
            }
        }
    }

    let signatures: Vec<IncidentSignature> = by_incident
        .into_iter()
        .filter_map(|(id, members)| {
            IncidentSignature::from_members(
                id,
                &members.embeddings,
                &members.keyword_sets,
                members.closed_at,
                fallback_dim,
            )
        })
        .collect();

    info!(
        "Loaded {} open incident signatures from {} member rows ({} undecodable)",
        signatures.len(),
        rows.len(),
        skipped
    );
    Ok(IncidentIndex::new(signatures))
}

/// Links matched complaints to their incidents in one transaction, bumping
/// each incident's member count and advancing its closedAt. A complaint
/// that was linked elsewhere in the meantime is left alone.
///
/// Returns:
/// The number of complaints actually linked.
pub async fn apply_matches(pool: &PgPool, assignments: &[MatchAssignment]) -> Result<u64> {
    if assignments.is_empty() {
        return Ok(0);
    }
    let mut client = pool
        .get()
        .await
        .context("Failed to get DB client for apply_matches")?;
    let tx = client
        .transaction()
        .await
        .context("Failed to start match transaction")?;

    let link_stmt = tx
        .prepare(
            "UPDATE complaints
             SET incident_id = $1, incident_linked_at = NOW(), incident_link_score = $2
             WHERE id = $3 AND incident_id IS NULL",
        )
        .await
        .context("Failed to prepare complaint link update")?;
    let incident_stmt = tx
        .prepare(
            "UPDATE incidents
             SET complaint_count = complaint_count + 1,
                 closed_at = GREATEST(closed_at, $2)
             WHERE id = $1",
        )
        .await
        .context("Failed to prepare incident update")?;

    let mut linked = 0u64;
    for assignment in assignments {
        let updated = tx
            .execute(
                &link_stmt,
                &[&assignment.incident_id, &assignment.score, &assignment.complaint_id],
            )
            .await
            .with_context(|| format!("Failed to link complaint {}", assignment.complaint_id))?;
        if updated == 0 {
            debug!(
                "Complaint {} already linked, not counting it toward incident {}",
                assignment.complaint_id, assignment.incident_id
            );
            continue;
        }
        tx.execute(&incident_stmt, &[&assignment.incident_id, &assignment.received_at])
            .await
            .with_context(|| format!("Failed to update incident {}", assignment.incident_id))?;
        linked += updated;
    }

    tx.commit().await.context("Failed to commit match transaction")?;
    Ok(linked)
}
