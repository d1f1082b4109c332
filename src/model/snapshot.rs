//! Snapshot and analysis documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsEngineKind {
    #[default]
    Bayesian,
    Frequentist,
}

/// One way of analysing an experiment's raw data.
///
/// Value type: two settings are the same analysis iff every field is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub stats_engine: StatsEngineKind,
    /// `None` for no cut, `exp:<column>` for an exposure-query column,
    /// `pre:date` for first-exposure date
    pub dimension: Option<String>,
    pub regression_adjusted: bool,
    /// Variation indices to keep; `None` keeps every variation
    pub variation_filter: Option<Vec<usize>>,
    pub baseline_variation_index: usize,
}

impl AnalysisSettings {
    pub fn new(stats_engine: StatsEngineKind) -> Self {
        Self {
            stats_engine,
            dimension: None,
            regression_adjusted: false,
            variation_filter: None,
            baseline_variation_index: 0,
        }
    }

    pub fn with_dimension(mut self, dimension: impl Into<String>) -> Self {
        self.dimension = Some(dimension.into());
        self
    }

    pub fn with_regression_adjustment(mut self, enabled: bool) -> Self {
        self.regression_adjusted = enabled;
        self
    }

    pub fn with_baseline(mut self, index: usize) -> Self {
        self.baseline_variation_index = index;
        self
    }

    pub fn with_variation_filter(mut self, variations: Vec<usize>) -> Self {
        self.variation_filter = Some(variations);
        self
    }
}

/// Raw-extraction settings shared by every analysis of one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotSettings {
    pub dimension: Option<String>,
    pub start_date: DateTime<Utc>,
    /// `None` extracts up to the time the query runs
    pub end_date: Option<DateTime<Utc>>,
}

impl SnapshotSettings {
    /// Whether two settings read the same time window of data.
    pub fn same_window(&self, other: &SnapshotSettings) -> bool {
        self.start_date == other.start_date && self.end_date == other.end_date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Schedule,
    Manual,
    Dashboard,
}

impl SnapshotTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotTrigger::Schedule => "schedule",
            SnapshotTrigger::Manual => "manual",
            SnapshotTrigger::Dashboard => "dashboard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Running,
    Success,
    /// Every query resolved but at least one failed
    CompletedWithErrors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationResult {
    pub variation: String,
    pub users: u64,
    pub sum: f64,
    pub mean: f64,
    pub stddev: f64,
    /// Relative change of the mean against the baseline
    #[serde(default)]
    pub uplift: Option<f64>,
    #[serde(default)]
    pub ci: Option<(f64, f64)>,
    #[serde(default)]
    pub p_value: Option<f64>,
    #[serde(default)]
    pub chance_to_win: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionResult {
    pub name: String,
    pub variations: Vec<VariationResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub metric_id: String,
    pub dimensions: Vec<DimensionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub settings: AnalysisSettings,
    pub fingerprint: Fingerprint,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub results: Vec<MetricResult>,
}

impl Analysis {
    pub fn pending(settings: AnalysisSettings, fingerprint: Fingerprint) -> Self {
        Self {
            settings,
            fingerprint,
            status: AnalysisStatus::Running,
            error: None,
            results: Vec::new(),
        }
    }

    pub fn metric(&self, metric_id: &str) -> Option<&MetricResult> {
        self.results.iter().find(|r| r.metric_id == metric_id)
    }
}

/// Links a snapshot to a query that produced part of its raw data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPointer {
    pub query_id: String,
    /// Extraction group the query serves (dimension + adjustment flag)
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub organization: String,
    pub experiment_id: String,
    pub phase_index: usize,
    pub trigger: SnapshotTrigger,
    pub settings: SnapshotSettings,
    pub metric_ids: Vec<String>,
    pub analyses: Vec<Analysis>,
    pub queries: Vec<QueryPointer>,
    pub status: SnapshotStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub date_created: DateTime<Utc>,
    pub run_started: DateTime<Utc>,
}

impl Snapshot {
    pub fn analysis(&self, fingerprint: &Fingerprint) -> Option<&Analysis> {
        self.analyses.iter().find(|a| &a.fingerprint == fingerprint)
    }

    /// Whether every fingerprint has a successful analysis on this snapshot.
    pub fn covers<'a>(&self, fingerprints: impl IntoIterator<Item = &'a Fingerprint>) -> bool {
        fingerprints.into_iter().all(|fp| {
            self.analysis(fp)
                .map(|a| a.status == AnalysisStatus::Success)
                .unwrap_or(false)
        })
    }

    /// Whether every requested metric was extracted.
    pub fn has_metrics(&self, metric_ids: &[String]) -> bool {
        metric_ids.iter().all(|m| self.metric_ids.contains(m))
    }

    pub fn is_resolved(&self) -> bool {
        self.status != SnapshotStatus::Running
    }
}
