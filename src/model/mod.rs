//! Documents the orchestration engine reads and writes
//!
//! Experiments, metrics, data sources and dashboards are owned by the
//! surrounding application; the engine reads them and mutates only the
//! scheduling fields. Snapshots and queries are owned by the engine.

mod query;
mod snapshot;

pub use query::{
    ExperimentUnitRow, MetricValueRow, QueryKind, QueryRecord, QueryResult, QueryStatus,
};
pub use snapshot::{
    Analysis, AnalysisStatus, AnalysisSettings, DimensionResult, MetricResult, QueryPointer,
    Snapshot, SnapshotSettings, SnapshotStatus, SnapshotTrigger, StatsEngineKind, VariationResult,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether an experiment is refreshed by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    Never,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    #[default]
    Draft,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    pub id: String,
    /// Value logged by the exposure query for this arm
    pub key: String,
    pub name: String,
}

/// A time window of an experiment with fixed traffic weights.
///
/// Closed phases never change; the active phase is the last one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentPhase {
    pub name: String,
    pub date_started: DateTime<Utc>,
    pub date_ended: Option<DateTime<Utc>>,
    pub coverage: f64,
    pub variation_weights: Vec<f64>,
}

impl ExperimentPhase {
    pub fn is_closed(&self) -> bool {
        self.date_ended.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub organization: String,
    pub name: String,
    /// Experiment identifier as logged by the exposure query
    pub tracking_key: String,
    pub datasource_id: String,
    pub exposure_query_id: String,
    pub metric_ids: Vec<String>,
    pub variations: Vec<Variation>,
    pub phases: Vec<ExperimentPhase>,
    #[serde(default)]
    pub status: ExperimentStatus,
    #[serde(default)]
    pub auto_snapshots: SchedulingMode,
    #[serde(default)]
    pub next_snapshot_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_snapshot_attempt: Option<DateTime<Utc>>,
    /// Reason automatic refreshes were switched off, if they were
    #[serde(default)]
    pub auto_snapshot_failure: Option<String>,
    #[serde(default)]
    pub regression_adjustment_enabled: bool,
    #[serde(default)]
    pub stats_engine: StatsEngineKind,
}

impl Experiment {
    pub fn phase(&self, index: usize) -> Option<&ExperimentPhase> {
        self.phases.get(index)
    }

    pub fn current_phase_index(&self) -> Option<usize> {
        self.phases.len().checked_sub(1)
    }

    /// Default analysis for this experiment's current configuration.
    pub fn default_analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            stats_engine: self.stats_engine,
            dimension: None,
            regression_adjusted: self.regression_adjustment_enabled,
            variation_filter: None,
            baseline_variation_index: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }
}

/// Partial update applied by the scheduler and orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentUpdate {
    pub auto_snapshots: Option<SchedulingMode>,
    /// `Some(None)` clears the field
    pub next_snapshot_attempt: Option<Option<DateTime<Utc>>>,
    pub last_snapshot_attempt: Option<DateTime<Utc>>,
    pub auto_snapshot_failure: Option<Option<String>>,
}

impl ExperimentUpdate {
    pub fn apply(&self, experiment: &mut Experiment) {
        if let Some(mode) = self.auto_snapshots {
            experiment.auto_snapshots = mode;
        }
        if let Some(next) = self.next_snapshot_attempt {
            experiment.next_snapshot_attempt = next;
        }
        if let Some(last) = self.last_snapshot_attempt {
            experiment.last_snapshot_attempt = Some(last);
        }
        if let Some(failure) = &self.auto_snapshot_failure {
            experiment.auto_snapshot_failure = failure.clone();
        }
    }
}

/// How a metric's per-unit values aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Converted or not; value is 0/1 per unit
    Binomial,
    /// Number of events per unit
    Count,
    /// Time spent per unit
    Duration,
    /// Summed monetary value per unit
    Revenue,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Binomial => "binomial",
            MetricType::Count => "count",
            MetricType::Duration => "duration",
            MetricType::Revenue => "revenue",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: String,
    pub organization: String,
    pub name: String,
    pub datasource_id: String,
    pub metric_type: MetricType,
    /// SELECT returning `user_id`, `timestamp` and `value` columns
    pub sql: String,
    #[serde(default = "default_conversion_window_hours")]
    pub conversion_window_hours: u32,
    /// Upper bound on each unit's summed value, applied before the
    /// per-variation aggregation; ignored for binomial metrics
    #[serde(default)]
    pub cap: Option<f64>,
    #[serde(default)]
    pub inverse: bool,
    /// Event name when the metric lives in a reporting API instead of SQL
    #[serde(default)]
    pub event_name: Option<String>,
}

fn default_conversion_window_hours() -> u32 {
    72
}

/// Backend identifier of a data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceType {
    Postgres,
    Redshift,
    Snowflake,
    BigQuery,
    ClickHouse,
    MySql,
    MsSql,
    Databricks,
    Presto,
    Athena,
    DataFusion,
    GoogleAnalytics,
}

impl DataSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceType::Postgres => "postgres",
            DataSourceType::Redshift => "redshift",
            DataSourceType::Snowflake => "snowflake",
            DataSourceType::BigQuery => "bigquery",
            DataSourceType::ClickHouse => "clickhouse",
            DataSourceType::MySql => "mysql",
            DataSourceType::MsSql => "mssql",
            DataSourceType::Databricks => "databricks",
            DataSourceType::Presto => "presto",
            DataSourceType::Athena => "athena",
            DataSourceType::DataFusion => "datafusion",
            DataSourceType::GoogleAnalytics => "google_analytics",
        }
    }

    pub fn is_sql(&self) -> bool {
        !matches!(self, DataSourceType::GoogleAnalytics)
    }
}

impl std::fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataSourceType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redshift" => Ok(Self::Redshift),
            "snowflake" => Ok(Self::Snowflake),
            "bigquery" => Ok(Self::BigQuery),
            "clickhouse" => Ok(Self::ClickHouse),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "mssql" | "sqlserver" => Ok(Self::MsSql),
            "databricks" => Ok(Self::Databricks),
            "presto" | "trino" => Ok(Self::Presto),
            "athena" => Ok(Self::Athena),
            "datafusion" | "embedded" => Ok(Self::DataFusion),
            "google_analytics" | "ga" => Ok(Self::GoogleAnalytics),
            other => Err(format!("unknown data source type '{}'", other)),
        }
    }
}

/// Query that yields one row per exposure event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureQuery {
    pub id: String,
    /// SELECT returning `user_id`, `timestamp`, `experiment_id`, `variation_id`
    /// plus any dimension columns
    pub sql: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSourceSettings {
    #[serde(default)]
    pub default_schema: Option<String>,
    #[serde(default)]
    pub exposure_queries: Vec<ExposureQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub organization: String,
    pub kind: DataSourceType,
    /// Encrypted connection parameters; see [`crate::adapter::CredentialDecryptor`]
    pub params: String,
    #[serde(default)]
    pub settings: DataSourceSettings,
    pub date_updated: DateTime<Utc>,
}

impl DataSource {
    pub fn exposure_query(&self, id: &str) -> Option<&ExposureQuery> {
        self.settings.exposure_queries.iter().find(|q| q.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    ExperimentMetric,
    ExperimentDimension,
    ExperimentTimeSeries,
    Markdown,
}

/// A dashboard block and the analysis it renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardBlock {
    pub id: String,
    pub kind: BlockKind,
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub snapshot_settings: Option<SnapshotSettings>,
    #[serde(default)]
    pub analysis_settings: Option<AnalysisSettings>,
}

impl DashboardBlock {
    /// Blocks that render experiment results need a snapshot.
    pub fn needs_snapshot(&self) -> bool {
        self.kind != BlockKind::Markdown
            && self.experiment_id.is_some()
            && self.analysis_settings.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    pub id: String,
    pub organization: String,
    #[serde(default)]
    pub experiment_id: Option<String>,
    pub blocks: Vec<DashboardBlock>,
    #[serde(default)]
    pub enable_auto_updates: bool,
    #[serde(default)]
    pub next_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_update_failure: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardUpdate {
    pub enable_auto_updates: Option<bool>,
    pub next_update: Option<Option<DateTime<Utc>>>,
    pub last_update: Option<DateTime<Utc>>,
    pub auto_update_failure: Option<Option<String>>,
    /// Block id -> snapshot id
    pub block_snapshots: Vec<(String, String)>,
}

impl DashboardUpdate {
    pub fn apply(&self, dashboard: &mut Dashboard) {
        if let Some(enabled) = self.enable_auto_updates {
            dashboard.enable_auto_updates = enabled;
        }
        if let Some(next) = self.next_update {
            dashboard.next_update = next;
        }
        if let Some(last) = self.last_update {
            dashboard.last_update = Some(last);
        }
        if let Some(failure) = &self.auto_update_failure {
            dashboard.auto_update_failure = failure.clone();
        }
        for (block_id, snapshot_id) in &self.block_snapshots {
            if let Some(block) = dashboard.blocks.iter_mut().find(|b| &b.id == block_id) {
                block.snapshot_id = Some(snapshot_id.clone());
            }
        }
    }
}
