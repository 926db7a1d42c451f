// src/clustering/db.rs

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashSet;
use tokio_postgres::{types::ToSql, Row};

use crate::matching::db::apply_matches;
use crate::matching::manager::MatchAssignment;
use crate::models::complaint::{ComplaintRecord, IncidentDraft, INCIDENT_STATUS_OPEN};
use crate::utils::db_connect::PgPool;
use crate::utils::scope_filter::ScopeFilter;

/// Decodes an embedding stored as text. Both JSON arrays and pgvector's text
/// form (`[0.1,0.2,...]`) parse the same way.
pub fn decode_embedding(raw: &str) -> Result<Vec<f32>> {
    let values: Vec<f64> = serde_json::from_str(raw.trim())
        .with_context(|| format!("Embedding is not a numeric array (starts with {:?})", raw.chars().take(24).collect::<String>()))?;
    Ok(values.into_iter().map(|v| v as f32).collect())
}

/// Decodes the keyword payload: `null` is an empty set, an array yields its
/// string elements, anything else is malformed.
pub fn decode_keywords(value: Option<&Value>) -> Result<HashSet<String>> {
    match value {
        None | Some(Value::Null) => Ok(HashSet::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()),
        Some(other) => Err(anyhow!("Keyword payload is not an array: {}", other)),
    }
}

fn complaint_from_row(row: &Row) -> Result<ComplaintRecord> {
    let id: i64 = row.try_get("id").context("Missing complaint id")?;
    let received_at: NaiveDateTime = row
        .try_get("received_at")
        .with_context(|| format!("Missing received_at for complaint {}", id))?;
    let raw_embedding: String = row
        .try_get("embedding")
        .with_context(|| format!("Unreadable embedding for complaint {}", id))?;
    let raw_keywords: Option<Value> = row
        .try_get("keywords_jsonb")
        .with_context(|| format!("Unreadable keywords for complaint {}", id))?;

    Ok(ComplaintRecord {
        id,
        received_at,
        region: row
            .try_get::<_, Option<i64>>("district_id")
            .with_context(|| format!("Unreadable district_id for complaint {}", id))?,
        category: row
            .try_get::<_, Option<String>>("target_object")
            .with_context(|| format!("Unreadable target_object for complaint {}", id))?,
        text: row
            .try_get::<_, Option<String>>("core_request")
            .with_context(|| format!("Unreadable core_request for complaint {}", id))?
            .unwrap_or_default(),
        keywords: decode_keywords(raw_keywords.as_ref())
            .with_context(|| format!("Malformed keywords for complaint {}", id))?,
        embedding: decode_embedding(&raw_embedding)
            .with_context(|| format!("Malformed embedding for complaint {}", id))?,
        assigned_incident_id: None,
    })
}

/// Columns are cast to the types `complaint_from_row` reads, so an int4
/// district or a varchar category column still decodes.
const UNASSIGNED_COMPLAINTS_SQL: &str = "
    SELECT c.id::bigint AS id, c.received_at, c.district_id::bigint AS district_id,
           n.target_object::text AS target_object, n.core_request::text AS core_request,
           n.embedding::text AS embedding, n.keywords_jsonb
    FROM complaints c
    JOIN complaint_normalizations n ON c.id = n.complaint_id
    WHERE c.incident_id IS NULL
      AND n.is_current = true
      AND n.embedding IS NOT NULL";

fn unassigned_complaints_query(scope: &ScopeFilter) -> (String, Vec<Box<dyn ToSql + Sync + Send>>) {
    let mut query = String::from(UNASSIGNED_COMPLAINTS_SQL);
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
    if let Some((clause, scope_params)) = scope.build_sql_filter_with_offset(0) {
        query.push_str(&clause);
        params.extend(scope_params);
    }
    query.push_str(" ORDER BY c.id");
    (query, params)
}

/// Fetches every unassigned complaint that carries a current embedding,
/// ordered by id. Rows whose embedding or keywords cannot be decoded are
/// skipped and counted rather than failing the read.
///
/// Arguments:
/// * `pool` - A reference to the PostgreSQL connection pool.
/// * `scope` - Optional region/category restriction.
/// * `multi_progress` - An optional `MultiProgress` instance for progress tracking.
///
/// Returns:
/// The decoded records and the number of skipped rows.
pub async fn fetch_unassigned_complaints(
    pool: &PgPool,
    scope: &ScopeFilter,
    multi_progress: Option<MultiProgress>,
) -> Result<(Vec<ComplaintRecord>, usize)> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for fetch_unassigned_complaints")?;

    let fetch_pb = multi_progress.as_ref().map(|mp| {
        let pb = mp.add(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("    {spinner:.blue} [{elapsed_precise}] {msg}")
                .unwrap(),
        );
        pb.set_message("Querying unassigned complaints...");
        pb
    });

    let (query, params) = unassigned_complaints_query(scope);

    let params_slice: Vec<&(dyn ToSql + Sync)> = params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    let rows = conn
        .query(query.as_str(), &params_slice)
        .await
        .context("Failed to query unassigned complaints")?;

    let mut records = Vec::with_capacity(rows.len());
    let mut skipped = 0usize;
    for row in &rows {
        match complaint_from_row(row) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                warn!("Skipping complaint row: {:#}", e);
            }
        }
    }

    if let Some(pb) = &fetch_pb {
        pb.finish_with_message(format!(
            "Fetched {} unassigned complaints ({} skipped)",
            records.len(),
            skipped
        ));
    }
    info!(
        "Loaded {} unassigned complaints with embeddings ({} skipped as undecodable)",
        records.len(),
        skipped
    );
    Ok((records, skipped))
}

/// Titles of every current incident, for collision checks.
pub async fn fetch_existing_titles(pool: &PgPool) -> Result<HashSet<String>> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for fetch_existing_titles")?;
    let rows = conn
        .query("SELECT title FROM incidents WHERE title IS NOT NULL", &[])
        .await
        .context("Failed to query incident titles")?;
    Ok(rows.iter().map(|r| r.get::<_, String>("title")).collect())
}

/// Destructive reset: unlinks every complaint and deletes every incident in
/// one transaction. Only the batch mode calls this.
pub async fn reset_incidents(pool: &PgPool) -> Result<u64> {
    let mut client = pool
        .get()
        .await
        .context("Failed to get DB connection for reset_incidents")?;
    let tx = client
        .transaction()
        .await
        .context("Failed to start reset transaction")?;

    let unlinked = tx
        .execute(
            "UPDATE complaints
             SET incident_id = NULL, incident_linked_at = NULL, incident_link_score = NULL
             WHERE incident_id IS NOT NULL",
            &[],
        )
        .await
        .context("Failed to unlink complaints from incidents")?;
    let deleted = tx
        .execute("DELETE FROM incidents", &[])
        .await
        .context("Failed to delete incidents")?;

    tx.commit().await.context("Failed to commit reset transaction")?;
    info!(
        "🧨 Reset complete: {} complaints unlinked, {} incidents deleted",
        unlinked, deleted
    );
    Ok(deleted)
}

/// Writes a set of new incidents and links their members, all in one
/// transaction. Any failure rolls back every row of the set.
///
/// Arguments:
/// * `pool` - A reference to the PostgreSQL connection pool.
/// * `drafts` - Incidents formed in memory, with their member ids.
///
/// Returns:
/// The new incident ids, in draft order.
pub async fn store_incident_drafts(pool: &PgPool, drafts: &[IncidentDraft]) -> Result<Vec<i64>> {
    if drafts.is_empty() {
        return Ok(Vec::new());
    }
    let mut client = pool
        .get()
        .await
        .context("Failed to get DB client for storing incidents")?;
    let tx = client
        .transaction()
        .await
        .context("Failed to start incident transaction")?;

    let insert_stmt = tx
        .prepare(
            "INSERT INTO incidents
                 (title, status, complaint_count, keywords, district_id, category, is_noise, opened_at, closed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING id",
        )
        .await
        .context("Failed to prepare incident insert")?;
    let link_stmt = tx
        .prepare(
            "UPDATE complaints
             SET incident_id = $1, incident_linked_at = NOW(), incident_link_score = $2
             WHERE id = ANY($3) AND incident_id IS NULL",
        )
        .await
        .context("Failed to prepare complaint link update")?;

    let status = INCIDENT_STATUS_OPEN;
    let mut ids = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let row = tx
            .query_one(
                &insert_stmt,
                &[
                    &draft.title,
                    &status,
                    &draft.member_count(),
                    &draft.representative_keyword,
                    &draft.region,
                    &draft.category,
                    &draft.is_noise,
                    &draft.opened_at,
                    &draft.closed_at,
                ],
            )
            .await
            .with_context(|| format!("Failed to insert incident '{}'", draft.title))?;
        let incident_id: i64 = row.get("id");

        let linked = tx
            .execute(&link_stmt, &[&incident_id, &draft.link_score, &draft.member_ids])
            .await
            .with_context(|| format!("Failed to link members of incident {}", incident_id))?;
        if linked != draft.member_ids.len() as u64 {
            return Err(anyhow!(
                "Incident '{}' expected {} unassigned members but linked {}",
                draft.title,
                draft.member_ids.len(),
                linked
            ));
        }
        debug!("Incident {} '{}' linked {} complaints", incident_id, draft.title, linked);
        ids.push(incident_id);
    }

    tx.commit().await.context("Failed to commit incident transaction")?;
    Ok(ids)
}

/// Write side of a run. Batch partitions and incremental cycles both go
/// through this.
#[async_trait(?Send)]
pub trait IncidentStore {
    /// Writes new incidents and links their members in one transaction.
    async fn store_drafts(&self, drafts: &[IncidentDraft]) -> Result<Vec<i64>>;
    /// Links matched complaints to open incidents in one transaction.
    async fn link_matches(&self, assignments: &[MatchAssignment]) -> Result<u64>;
}

#[async_trait(?Send)]
impl IncidentStore for PgPool {
    async fn store_drafts(&self, drafts: &[IncidentDraft]) -> Result<Vec<i64>> {
        store_incident_drafts(self, drafts).await
    }

    async fn link_matches(&self, assignments: &[MatchAssignment]) -> Result<u64> {
        apply_matches(self, assignments).await
    }
}

/// Incident label and embedding of every linked complaint, for the quality
/// evaluator. Undecodable embeddings are left out.
pub async fn fetch_labeled_embeddings(pool: &PgPool) -> Result<(Vec<i64>, Vec<Vec<f32>>)> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for fetch_labeled_embeddings")?;
    let rows = conn
        .query(
            "SELECT c.id, c.incident_id, n.embedding::text AS embedding
             FROM complaints c
             JOIN complaint_normalizations n ON c.id = n.complaint_id
             WHERE c.incident_id IS NOT NULL
               AND n.is_current = true
               AND n.embedding IS NOT NULL
             ORDER BY c.id",
            &[],
        )
        .await
        .context("Failed to query labeled embeddings")?;

    let mut labels = Vec::with_capacity(rows.len());
    let mut embeddings = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: i64 = row.get("id");
        let raw: String = row.get("embedding");
        match decode_embedding(&raw) {
            Ok(embedding) => {
                labels.push(row.get::<_, i64>("incident_id"));
                embeddings.push(embedding);
            }
            Err(e) => warn!("Skipping complaint {} in quality evaluation: {:#}", id, e),
        }
    }
    Ok((labels, embeddings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_embedding_formats() {
        assert_eq!(decode_embedding("[0.5, -1, 2e-1]").unwrap(), vec![0.5, -1.0, 0.2]);
        assert_eq!(decode_embedding(" [1,2,3] ").unwrap(), vec![1.0, 2.0, 3.0]);
        assert!(decode_embedding("[]").unwrap().is_empty());
        assert!(decode_embedding("not a vector").is_err());
        assert!(decode_embedding("{\"a\": 1}").is_err());
        assert!(decode_embedding("[1, \"x\"]").is_err());
    }

    #[test]
    fn test_decode_keywords_shapes() {
        assert!(decode_keywords(None).unwrap().is_empty());
        assert!(decode_keywords(Some(&Value::Null)).unwrap().is_empty());

        let kws = decode_keywords(Some(&json!(["소음", " 공사 ", 3, "", "소음"]))).unwrap();
        let expected: HashSet<String> = ["소음", "공사"].iter().map(|s| s.to_string()).collect();
        assert_eq!(kws, expected);

        assert!(decode_keywords(Some(&json!({"k": "v"}))).is_err());
        assert!(decode_keywords(Some(&json!("소음"))).is_err());
    }

    #[test]
    fn test_unassigned_query_casts_partition_columns() {
        let (query, params) = unassigned_complaints_query(&ScopeFilter::default());
        assert!(params.is_empty());
        assert!(query.contains("c.district_id::bigint AS district_id"));
        assert!(query.contains("n.target_object::text AS target_object"));
        assert!(query.trim_end().ends_with("ORDER BY c.id"));

        let scope = ScopeFilter {
            region: Some(11),
            category: None,
        };
        let (query, params) = unassigned_complaints_query(&scope);
        assert_eq!(params.len(), 1);
        assert!(query.contains("AND c.district_id::bigint = $1 ORDER BY c.id"));
    }
}
