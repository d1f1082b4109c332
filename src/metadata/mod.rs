//! Document store for the orchestration engine
//!
//! The engine treats its storage as a keyed document store: documents are
//! fetched by id, found by experiment, and updated by id. It never assumes a
//! particular query language.

mod local;
mod object_store;

pub use self::object_store::{ObjectStoreMetadataClient, ObjectStoreMetadataConfig};
pub use local::LocalMetadataClient;

use crate::model::{
    Dashboard, DashboardUpdate, DataSource, Experiment, ExperimentUpdate, MetricDefinition,
    QueryRecord, Snapshot, SnapshotStatus,
};
use crate::Result;
use async_trait::async_trait;

/// Filter for [`MetadataClient::find_snapshots_by_experiment`]
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub phase_index: Option<usize>,
    pub status: Option<SnapshotStatus>,
    pub limit: Option<usize>,
}

impl SnapshotFilter {
    pub fn phase(phase_index: usize) -> Self {
        Self {
            phase_index: Some(phase_index),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: SnapshotStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        self.phase_index.map_or(true, |p| snapshot.phase_index == p)
            && self.status.map_or(true, |s| snapshot.status == s)
    }
}

/// Newest first, with the limit applied.
pub(crate) fn sort_and_limit(mut snapshots: Vec<Snapshot>, filter: &SnapshotFilter) -> Vec<Snapshot> {
    snapshots.sort_by(|a, b| {
        b.date_created
            .cmp(&a.date_created)
            .then_with(|| b.id.cmp(&a.id))
    });
    if let Some(limit) = filter.limit {
        snapshots.truncate(limit);
    }
    snapshots
}

/// Metadata client interface
///
/// Implementations must make `update_query` conditional on the stored
/// version so concurrent liveness reclassification never double-writes.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    // Experiments
    async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>>;
    async fn put_experiment(&self, experiment: &Experiment) -> Result<()>;
    async fn update_experiment(&self, id: &str, update: &ExperimentUpdate) -> Result<Experiment>;
    async fn list_experiments(&self) -> Result<Vec<Experiment>>;

    // Metrics and data sources
    async fn get_metric(&self, id: &str) -> Result<Option<MetricDefinition>>;
    async fn put_metric(&self, metric: &MetricDefinition) -> Result<()>;
    async fn get_datasource(&self, id: &str) -> Result<Option<DataSource>>;
    async fn put_datasource(&self, datasource: &DataSource) -> Result<()>;

    // Snapshots
    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>>;
    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    async fn find_snapshots_by_experiment(
        &self,
        experiment_id: &str,
        filter: &SnapshotFilter,
    ) -> Result<Vec<Snapshot>>;

    // Queries
    async fn create_query(&self, query: &QueryRecord) -> Result<()>;
    async fn get_query(&self, id: &str) -> Result<Option<QueryRecord>>;
    /// Replace a query record if its stored version equals `expected_version`.
    ///
    /// The stored copy gets `expected_version + 1`; the new record is returned.
    async fn update_query(&self, query: &QueryRecord, expected_version: u64) -> Result<QueryRecord>;
    async fn find_queries_by_snapshot(&self, snapshot_id: &str) -> Result<Vec<QueryRecord>>;

    // Dashboards
    async fn get_dashboard(&self, id: &str) -> Result<Option<Dashboard>>;
    async fn put_dashboard(&self, dashboard: &Dashboard) -> Result<()>;
    async fn update_dashboard(&self, id: &str, update: &DashboardUpdate) -> Result<Dashboard>;
    async fn list_dashboards(&self) -> Result<Vec<Dashboard>>;
}
