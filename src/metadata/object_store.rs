//! Object-store metadata client for multi-process deployments
//!
//! Every document is one JSON object at `<prefix><collection>/<id>.json`.
//! Writes that depend on the current document (partial updates, version
//! checked query updates) load the object with its ETag and write back with
//! a conditional put, retrying on conflict.

use super::{sort_and_limit, MetadataClient, SnapshotFilter};
use crate::model::{
    Dashboard, DashboardUpdate, DataSource, Experiment, ExperimentUpdate, MetricDefinition,
    QueryRecord, Snapshot,
};
use crate::{Error, Result};

use async_trait::async_trait;
use futures::TryStreamExt;
use metrics::{counter, histogram};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum number of CAS retries for atomic operations
const MAX_CAS_RETRIES: u32 = 5;

/// Base backoff duration in milliseconds for exponential backoff
const BASE_BACKOFF_MS: u64 = 50;

const EXPERIMENTS: &str = "experiments";
const METRICS: &str = "metrics";
const DATASOURCES: &str = "datasources";
const SNAPSHOTS: &str = "snapshots";
const QUERIES: &str = "queries";
const DASHBOARDS: &str = "dashboards";

/// CAS retry loop with exponential backoff on conflict.
///
/// The body is an async block performing one load-modify-save cycle.
/// Return `Ok(value)` on success, `Err(Error::Conflict)` to trigger retry,
/// or any other `Err` to abort immediately.
macro_rules! cas_retry {
    ($body:block) => {{
        let mut __cas_result = Err(Error::TooManyRetries);
        for __cas_attempt in 0..MAX_CAS_RETRIES {
            match (async $body).await {
                Ok(value) => {
                    __cas_result = Ok(value);
                    break;
                }
                Err(Error::Conflict) => {
                    let backoff_ms = BASE_BACKOFF_MS * 2_u64.pow(__cas_attempt);
                    metrics::counter!(
                        "splitsight_metadata_cas_retries_total",
                        "service" => crate::telemetry::service(),
                        "run_id" => crate::telemetry::run_id()
                    )
                    .increment(1);
                    debug!(
                        "CAS conflict on attempt {}, retrying after {}ms",
                        __cas_attempt + 1,
                        backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    __cas_result = Err(e);
                    break;
                }
            }
        }
        __cas_result
    }};
}

/// Object-store metadata client configuration
#[derive(Debug, Clone)]
pub struct ObjectStoreMetadataConfig {
    /// Prefix for metadata objects
    pub metadata_prefix: String,
    /// Allow explicit fallback to unsafe overwrite when CAS update is not supported
    pub allow_unsafe_overwrite: bool,
}

impl Default for ObjectStoreMetadataConfig {
    fn default() -> Self {
        Self {
            metadata_prefix: "splitsight/".to_string(),
            allow_unsafe_overwrite: false,
        }
    }
}

/// Object-store metadata client
pub struct ObjectStoreMetadataClient {
    object_store: Arc<dyn ObjectStore>,
    config: ObjectStoreMetadataConfig,
}

impl ObjectStoreMetadataClient {
    pub fn new(object_store: Arc<dyn ObjectStore>, config: ObjectStoreMetadataConfig) -> Self {
        Self {
            object_store,
            config,
        }
    }

    fn collection_path(&self, collection: &str) -> Path {
        Path::from(self.config.metadata_prefix.as_str()).child(collection)
    }

    fn document_path(&self, collection: &str, id: &str) -> Path {
        self.collection_path(collection)
            .child(format!("{}.json", id).as_str())
    }

    /// Load a document and its ETag. `None` if the object does not exist.
    async fn load_with_etag<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<(T, String)>> {
        let path = self.document_path(collection, id);
        match self.object_store.get(&path).await {
            Ok(result) => {
                let e_tag = result
                    .meta
                    .e_tag
                    .clone()
                    .unwrap_or_else(|| "no-etag".to_string());
                let bytes = result.bytes().await?;
                let document: T = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::Metadata(format!("corrupt {} document {}: {}", collection, id, e))
                })?;
                Ok(Some((document, e_tag)))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Error::Metadata(format!(
                "failed to load {} document {}: {}",
                collection, id, e
            ))),
        }
    }

    async fn load<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        Ok(self
            .load_with_etag(collection, id)
            .await?
            .map(|(document, _)| document))
    }

    async fn load_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let prefix = self.collection_path(collection);
        let objects: Vec<_> = self
            .object_store
            .list(Some(&prefix))
            .try_collect()
            .await?;

        let mut documents = Vec::with_capacity(objects.len());
        for meta in objects {
            let bytes = match self.object_store.get(&meta.location).await {
                Ok(result) => result.bytes().await?,
                // Deleted between list and get
                Err(object_store::Error::NotFound { .. }) => continue,
                Err(e) => return Err(Error::ObjectStore(e)),
            };
            let document: T = serde_json::from_slice(&bytes).map_err(|e| {
                Error::Metadata(format!("corrupt document at {}: {}", meta.location, e))
            })?;
            documents.push(document);
        }
        Ok(documents)
    }

    /// Unconditional write of a whole document.
    async fn save<T: Serialize>(&self, collection: &str, id: &str, document: &T) -> Result<()> {
        let path = self.document_path(collection, id);
        let bytes = serde_json::to_vec(document)?;
        self.object_store
            .put(&path, PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    /// Write a new document, failing with `Conflict` if it already exists.
    async fn create<T: Serialize>(&self, collection: &str, id: &str, document: &T) -> Result<()> {
        let path = self.document_path(collection, id);
        let bytes = serde_json::to_vec(document)?;
        self.put_with_cas(&path, PutPayload::from(bytes), None, collection)
            .await
    }

    /// Conditional put. `expected_etag` of `None` means create-only.
    async fn put_with_cas(
        &self,
        path: &Path,
        payload: PutPayload,
        expected_etag: Option<&str>,
        context: &str,
    ) -> Result<()> {
        let cas_start = Instant::now();
        let operation = context.to_string();
        let opts = match expected_etag {
            None => PutOptions {
                mode: PutMode::Create,
                ..Default::default()
            },
            Some(e_tag) => PutOptions {
                mode: PutMode::Update(object_store::UpdateVersion {
                    e_tag: Some(e_tag.to_string()),
                    version: None,
                }),
                ..Default::default()
            },
        };

        let result = self
            .object_store
            .put_opts(path, payload.clone(), opts)
            .await;

        let outcome = match result {
            Ok(_) => Ok("ok"),
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => Err(Error::Conflict),
            Err(object_store::Error::NotImplemented)
            | Err(object_store::Error::NotSupported { .. }) => {
                if !self.config.allow_unsafe_overwrite {
                    Err(Error::Metadata(format!(
                        "conditional writes are required for {} at {} but are not supported by the object store",
                        context, path
                    )))
                } else {
                    warn!(
                        "CAS not supported for {} at {} - explicitly opting into unsafe overwrite mode",
                        context, path
                    );
                    let overwrite = PutOptions {
                        mode: PutMode::Overwrite,
                        ..Default::default()
                    };
                    self.object_store
                        .put_opts(path, payload, overwrite)
                        .await
                        .map(|_| "unsafe_overwrite")
                        .map_err(Error::ObjectStore)
                }
            }
            Err(e) => Err(Error::ObjectStore(e)),
        };

        let label = match &outcome {
            Ok(label) => *label,
            Err(Error::Conflict) => "conflict",
            Err(_) => "error",
        };
        counter!(
            "splitsight_metadata_cas_attempts_total",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id(),
            "operation" => operation.clone(),
            "result" => label
        )
        .increment(1);
        histogram!(
            "splitsight_metadata_cas_duration_seconds",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id(),
            "operation" => operation,
            "result" => label
        )
        .record(cas_start.elapsed().as_secs_f64());

        outcome.map(|_| ())
    }

    /// Load, modify and conditionally save one document.
    async fn modify<T, F>(&self, collection: &'static str, id: &str, mut apply: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut(&mut T) -> Result<()> + Send,
    {
        cas_retry!({
            let (mut document, etag) = self
                .load_with_etag::<T>(collection, id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    collection,
                    id: id.to_string(),
                })?;
            apply(&mut document)?;
            let bytes = serde_json::to_vec(&document)?;
            self.put_with_cas(
                &self.document_path(collection, id),
                PutPayload::from(bytes),
                Some(&etag),
                collection,
            )
            .await?;
            Ok(document)
        })
    }
}

#[async_trait]
impl MetadataClient for ObjectStoreMetadataClient {
    async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        self.load(EXPERIMENTS, id).await
    }

    async fn put_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.save(EXPERIMENTS, &experiment.id, experiment).await
    }

    async fn update_experiment(&self, id: &str, update: &ExperimentUpdate) -> Result<Experiment> {
        self.modify(EXPERIMENTS, id, |experiment: &mut Experiment| {
            update.apply(experiment);
            Ok(())
        })
        .await
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> = self.load_all(EXPERIMENTS).await?;
        experiments.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(experiments)
    }

    async fn get_metric(&self, id: &str) -> Result<Option<MetricDefinition>> {
        self.load(METRICS, id).await
    }

    async fn put_metric(&self, metric: &MetricDefinition) -> Result<()> {
        self.save(METRICS, &metric.id, metric).await
    }

    async fn get_datasource(&self, id: &str) -> Result<Option<DataSource>> {
        self.load(DATASOURCES, id).await
    }

    async fn put_datasource(&self, datasource: &DataSource) -> Result<()> {
        self.save(DATASOURCES, &datasource.id, datasource).await
    }

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.create(SNAPSHOTS, &snapshot.id, snapshot).await
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        self.load(SNAPSHOTS, id).await
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.modify(SNAPSHOTS, &snapshot.id, |current: &mut Snapshot| {
            *current = snapshot.clone();
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn find_snapshots_by_experiment(
        &self,
        experiment_id: &str,
        filter: &SnapshotFilter,
    ) -> Result<Vec<Snapshot>> {
        let snapshots: Vec<Snapshot> = self.load_all(SNAPSHOTS).await?;
        let matching = snapshots
            .into_iter()
            .filter(|s| s.experiment_id == experiment_id && filter.matches(s))
            .collect();
        Ok(sort_and_limit(matching, filter))
    }

    async fn create_query(&self, query: &QueryRecord) -> Result<()> {
        self.create(QUERIES, &query.id, query).await
    }

    async fn get_query(&self, id: &str) -> Result<Option<QueryRecord>> {
        self.load(QUERIES, id).await
    }

    async fn update_query(&self, query: &QueryRecord, expected_version: u64) -> Result<QueryRecord> {
        self.modify(QUERIES, &query.id, |current: &mut QueryRecord| {
            if current.version != expected_version {
                return Err(Error::StaleVersion {
                    expected: expected_version,
                    actual: current.version,
                });
            }
            *current = query.clone();
            current.version = expected_version + 1;
            Ok(())
        })
        .await
    }

    async fn find_queries_by_snapshot(&self, snapshot_id: &str) -> Result<Vec<QueryRecord>> {
        let queries: Vec<QueryRecord> = self.load_all(QUERIES).await?;
        let mut matching: Vec<QueryRecord> = queries
            .into_iter()
            .filter(|q| q.snapshot_id == snapshot_id)
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn get_dashboard(&self, id: &str) -> Result<Option<Dashboard>> {
        self.load(DASHBOARDS, id).await
    }

    async fn put_dashboard(&self, dashboard: &Dashboard) -> Result<()> {
        self.save(DASHBOARDS, &dashboard.id, dashboard).await
    }

    async fn update_dashboard(&self, id: &str, update: &DashboardUpdate) -> Result<Dashboard> {
        self.modify(DASHBOARDS, id, |dashboard: &mut Dashboard| {
            update.apply(dashboard);
            Ok(())
        })
        .await
    }

    async fn list_dashboards(&self) -> Result<Vec<Dashboard>> {
        let mut dashboards: Vec<Dashboard> = self.load_all(DASHBOARDS).await?;
        dashboards.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(dashboards)
    }
}
