// src/models/complaint.rs

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Catch-all region bucket for complaints without a district.
pub const UNKNOWN_REGION: i64 = 0;
/// Catch-all category bucket for complaints without a target object.
pub const UNKNOWN_CATEGORY: &str = "기타";

/// A complaint as read from storage: only rows that are unassigned and carry
/// an embedding are ever loaded into this shape.
#[derive(Debug, Clone)]
pub struct ComplaintRecord {
    pub id: i64,
    pub received_at: NaiveDateTime,
    pub region: Option<i64>,
    pub category: Option<String>,
    pub text: String,
    pub keywords: HashSet<String>,
    pub embedding: Vec<f32>,
    pub assigned_incident_id: Option<i64>,
}

impl ComplaintRecord {
    /// Partition key with missing values folded into the catch-all buckets.
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            region: self.region.unwrap_or(UNKNOWN_REGION),
            category: self
                .category
                .clone()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string()),
        }
    }
}

/// A disjoint (region, category) bucket processed independently in batch mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PartitionKey {
    pub region: i64,
    pub category: String,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region={} category={}", self.region, self.category)
    }
}

/// Status stored on every incident this crate opens; only open incidents
/// take part in incremental matching.
pub const INCIDENT_STATUS_OPEN: &str = "OPEN";

/// An incident that has been formed in memory but not yet written.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentDraft {
    pub title: String,
    pub member_ids: Vec<i64>,
    pub representative_keyword: String,
    pub opened_at: NaiveDateTime,
    pub closed_at: NaiveDateTime,
    pub region: Option<i64>,
    pub category: Option<String>,
    pub is_noise: bool,
    pub link_score: f64,
}

impl IncidentDraft {
    pub fn member_count(&self) -> i32 {
        self.member_ids.len() as i32
    }
}

/// What to do with an item no density cluster accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SingletonPolicy {
    /// Open a one-member incident tagged as noise.
    OpenIncident,
    /// Leave the item unassigned so a later run can pick it up.
    LeaveUnassigned,
}

impl SingletonPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SingletonPolicy::OpenIncident => "open_incident",
            SingletonPolicy::LeaveUnassigned => "leave_unassigned",
        }
    }
}

impl FromStr for SingletonPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "open_incident" | "openincident" => Ok(SingletonPolicy::OpenIncident),
            "leave_unassigned" | "leaveunassigned" => Ok(SingletonPolicy::LeaveUnassigned),
            other => Err(anyhow::anyhow!("Unknown singleton policy '{}'", other)),
        }
    }
}
