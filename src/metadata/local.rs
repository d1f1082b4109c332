//! Local in-memory metadata client for development and testing

use super::{sort_and_limit, MetadataClient, SnapshotFilter};
use crate::model::{
    Dashboard, DashboardUpdate, DataSource, Experiment, ExperimentUpdate, MetricDefinition,
    QueryRecord, Snapshot,
};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;

/// Local in-memory metadata client
///
/// Suitable for tests and single-process deployments. Every collection is a
/// `DashMap` keyed by document id; query updates are version-checked under
/// the entry lock.
#[derive(Debug, Default)]
pub struct LocalMetadataClient {
    experiments: DashMap<String, Experiment>,
    metrics: DashMap<String, MetricDefinition>,
    datasources: DashMap<String, DataSource>,
    snapshots: DashMap<String, Snapshot>,
    queries: DashMap<String, QueryRecord>,
    dashboards: DashMap<String, Dashboard>,
}

impl LocalMetadataClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of query records ever created
    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Number of snapshots ever created
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}

#[async_trait]
impl MetadataClient for LocalMetadataClient {
    async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        Ok(self.experiments.get(id).map(|e| e.value().clone()))
    }

    async fn put_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.experiments
            .insert(experiment.id.clone(), experiment.clone());
        Ok(())
    }

    async fn update_experiment(&self, id: &str, update: &ExperimentUpdate) -> Result<Experiment> {
        let mut entry = self.experiments.get_mut(id).ok_or_else(|| Error::NotFound {
            collection: "experiments",
            id: id.to_string(),
        })?;
        update.apply(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> =
            self.experiments.iter().map(|e| e.value().clone()).collect();
        experiments.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(experiments)
    }

    async fn get_metric(&self, id: &str) -> Result<Option<MetricDefinition>> {
        Ok(self.metrics.get(id).map(|e| e.value().clone()))
    }

    async fn put_metric(&self, metric: &MetricDefinition) -> Result<()> {
        self.metrics.insert(metric.id.clone(), metric.clone());
        Ok(())
    }

    async fn get_datasource(&self, id: &str) -> Result<Option<DataSource>> {
        Ok(self.datasources.get(id).map(|e| e.value().clone()))
    }

    async fn put_datasource(&self, datasource: &DataSource) -> Result<()> {
        self.datasources
            .insert(datasource.id.clone(), datasource.clone());
        Ok(())
    }

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        if self.snapshots.contains_key(&snapshot.id) {
            return Err(Error::Conflict);
        }
        self.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.get(id).map(|e| e.value().clone()))
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut entry = self
            .snapshots
            .get_mut(&snapshot.id)
            .ok_or_else(|| Error::NotFound {
                collection: "snapshots",
                id: snapshot.id.clone(),
            })?;
        *entry.value_mut() = snapshot.clone();
        Ok(())
    }

    async fn find_snapshots_by_experiment(
        &self,
        experiment_id: &str,
        filter: &SnapshotFilter,
    ) -> Result<Vec<Snapshot>> {
        let matching = self
            .snapshots
            .iter()
            .filter(|e| e.experiment_id == experiment_id && filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        Ok(sort_and_limit(matching, filter))
    }

    async fn create_query(&self, query: &QueryRecord) -> Result<()> {
        if self.queries.contains_key(&query.id) {
            return Err(Error::Conflict);
        }
        self.queries.insert(query.id.clone(), query.clone());
        Ok(())
    }

    async fn get_query(&self, id: &str) -> Result<Option<QueryRecord>> {
        Ok(self.queries.get(id).map(|e| e.value().clone()))
    }

    async fn update_query(&self, query: &QueryRecord, expected_version: u64) -> Result<QueryRecord> {
        let mut entry = self.queries.get_mut(&query.id).ok_or_else(|| Error::NotFound {
            collection: "queries",
            id: query.id.clone(),
        })?;

        if entry.version != expected_version {
            return Err(Error::StaleVersion {
                expected: expected_version,
                actual: entry.version,
            });
        }

        let mut updated = query.clone();
        updated.version = expected_version + 1;
        *entry.value_mut() = updated.clone();
        Ok(updated)
    }

    async fn find_queries_by_snapshot(&self, snapshot_id: &str) -> Result<Vec<QueryRecord>> {
        let mut queries: Vec<QueryRecord> = self
            .queries
            .iter()
            .filter(|e| e.snapshot_id == snapshot_id)
            .map(|e| e.value().clone())
            .collect();
        queries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(queries)
    }

    async fn get_dashboard(&self, id: &str) -> Result<Option<Dashboard>> {
        Ok(self.dashboards.get(id).map(|e| e.value().clone()))
    }

    async fn put_dashboard(&self, dashboard: &Dashboard) -> Result<()> {
        self.dashboards
            .insert(dashboard.id.clone(), dashboard.clone());
        Ok(())
    }

    async fn update_dashboard(&self, id: &str, update: &DashboardUpdate) -> Result<Dashboard> {
        let mut entry = self.dashboards.get_mut(id).ok_or_else(|| Error::NotFound {
            collection: "dashboards",
            id: id.to_string(),
        })?;
        update.apply(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn list_dashboards(&self) -> Result<Vec<Dashboard>> {
        let mut dashboards: Vec<Dashboard> =
            self.dashboards.iter().map(|e| e.value().clone()).collect();
        dashboards.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(dashboards)
    }
}
