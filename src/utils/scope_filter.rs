// src/utils/scope_filter.rs
use log::info;
use std::env;
use tokio_postgres::types::ToSql;

/// Optional (region, category) restriction applied to every storage read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeFilter {
    pub region: Option<i64>,
    pub category: Option<String>,
}

impl ScopeFilter {
    pub fn from_env() -> Self {
        let region = env::var("CLUSTER_SCOPE_REGION")
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok());
        let category = env::var("CLUSTER_SCOPE_CATEGORY")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self { region, category }
    }

    /// CLI flags take precedence over the environment.
    pub fn with_overrides(mut self, region: Option<i64>, category: Option<String>) -> Self {
        if region.is_some() {
            self.region = region;
        }
        if let Some(c) = category.filter(|c| !c.trim().is_empty()) {
            self.category = Some(c);
        }
        self
    }

    pub fn is_scoped(&self) -> bool {
        self.region.is_some() || self.category.is_some()
    }

    /// Builds `AND ...` clauses against `c.district_id` / `n.target_object`,
    /// numbering placeholders after `param_offset` existing parameters. The
    /// columns are cast to the i64 / text parameter types.
    pub fn build_sql_filter_with_offset(&self, param_offset: usize) -> Option<(String, Vec<Box<dyn ToSql + Sync + Send>>)> {
        if !self.is_scoped() {
            return None;
        }
        let mut clauses = Vec::new();
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
        if let Some(region) = self.region {
            params.push(Box::new(region));
            clauses.push(format!("c.district_id::bigint = ${}", param_offset + params.len()));
        }
        if let Some(category) = &self.category {
            params.push(Box::new(category.clone()));
            clauses.push(format!("n.target_object::text = ${}", param_offset + params.len()));
        }
        Some((format!(" AND {}", clauses.join(" AND ")), params))
    }

    pub fn log_config(&self) {
        if self.is_scoped() {
            info!("🔍 Scope filtering ENABLED");
            info!("   Region: {:?}, Category: {:?}", self.region, self.category);
        } else {
            info!("🔍 Scope filtering DISABLED - processing all regions and categories");
        }
    }
}
