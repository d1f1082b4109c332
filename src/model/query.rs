//! Query execution records and canonical result rows

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::DataSourceType;
use crate::error::ErrorKind;

/// What a query extracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Aggregated metric moments per variation and dimension value
    ExperimentMetrics,
    /// One row per exposed unit
    ExperimentUnits,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::ExperimentMetrics => "experiment_metrics",
            QueryKind::ExperimentUnits => "experiment_units",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Running,
    Succeeded,
    Failed,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Running => "running",
            QueryStatus::Succeeded => "succeeded",
            QueryStatus::Failed => "failed",
        }
    }
}

/// Canonical metric row, identical across every backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValueRow {
    pub metric_id: String,
    pub variation: String,
    pub dimension: String,
    pub users: u64,
    pub main_sum: f64,
    pub main_sum_squares: f64,
    #[serde(default)]
    pub covariate_sum: Option<f64>,
    #[serde(default)]
    pub covariate_sum_squares: Option<f64>,
    #[serde(default)]
    pub main_covariate_sum_product: Option<f64>,
}

/// Canonical unit-level exposure row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentUnitRow {
    pub user_id: String,
    pub variation: String,
    pub dimension: String,
    pub first_exposure: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "rows", rename_all = "snake_case")]
pub enum QueryResult {
    Metrics(Vec<MetricValueRow>),
    Units(Vec<ExperimentUnitRow>),
}

impl QueryResult {
    pub fn len(&self) -> usize {
        match self {
            QueryResult::Metrics(rows) => rows.len(),
            QueryResult::Units(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metric_rows(&self) -> &[MetricValueRow] {
        match self {
            QueryResult::Metrics(rows) => rows,
            QueryResult::Units(_) => &[],
        }
    }
}

/// One query submitted to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: String,
    pub organization: String,
    pub snapshot_id: String,
    pub kind: QueryKind,
    pub backend: DataSourceType,
    pub group: String,
    pub status: QueryStatus,
    /// Engine-native query text
    pub query: String,
    pub heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub result: Option<QueryResult>,
    /// Bumped on every write; reclassification writes are conditional on it
    #[serde(default)]
    pub version: u64,
}

impl QueryRecord {
    /// A running query whose heartbeat is older than the threshold is dead.
    pub fn is_stale(&self, now: DateTime<Utc>, liveness_threshold: Duration) -> bool {
        self.status == QueryStatus::Running && now - self.heartbeat > liveness_threshold
    }
}
