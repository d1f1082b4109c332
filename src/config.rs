//! Environment-based configuration
//!
//! Every interval the engine waits on is configuration. [`EngineConfig`]
//! gathers them with their defaults; [`ComponentFactory`] builds the object
//! store and metadata client the binaries run against.

use crate::metadata::{
    LocalMetadataClient, MetadataClient, ObjectStoreMetadataClient, ObjectStoreMetadataConfig,
};
use crate::orchestrator::OrchestratorConfig;
use crate::scheduler::{parse_interval, LocalJobQueueConfig, SchedulerConfig};
use crate::tracker::TrackerConfig;
use crate::{Error, Result};
use object_store::{aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, ObjectStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Read a duration such as `2m` or `10 minutes` from `name`.
fn env_duration(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => parse_interval(&raw)
            .map(Some)
            .map_err(|e| Error::Config(format!("{}: {}", name, e))),
        _ => Ok(None),
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{} is invalid ('{}'): {}", name, raw, e))),
        _ => Ok(None),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| {
            let value = value.trim();
            value == "1" || value.eq_ignore_ascii_case("true")
        })
        .unwrap_or(false)
}

/// All engine tunables
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub tracker: TrackerConfig,
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
    pub queue: LocalJobQueueConfig,
}

impl EngineConfig {
    /// Defaults overridden from the environment.
    ///
    /// Environment variables:
    /// - SPLITSIGHT_LIVENESS_THRESHOLD (default: 120s)
    /// - SPLITSIGHT_HEARTBEAT_INTERVAL (default: 30s)
    /// - SPLITSIGHT_POLL_INTERVAL (default: 1s)
    /// - SPLITSIGHT_MAX_WAIT (default: unbounded)
    /// - SPLITSIGHT_COVARIATE_LOOKBACK_HOURS (default: 336)
    /// - SPLITSIGHT_SCAN_INTERVAL (default: 10 minutes)
    /// - SPLITSIGHT_EXPERIMENT_UPDATE_INTERVAL (default: 6h)
    /// - SPLITSIGHT_DASHBOARD_UPDATE_INTERVAL (default: 6h)
    /// - SPLITSIGHT_WORKERS (default: CPU count, at most 8)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_duration("SPLITSIGHT_LIVENESS_THRESHOLD")? {
            config.tracker.liveness_threshold = v;
        }
        if let Some(v) = env_duration("SPLITSIGHT_HEARTBEAT_INTERVAL")? {
            config.tracker.heartbeat_interval = v;
        }
        if let Some(v) = env_duration("SPLITSIGHT_POLL_INTERVAL")? {
            config.orchestrator.poll_interval = v;
        }
        if let Some(v) = env_duration("SPLITSIGHT_MAX_WAIT")? {
            config.orchestrator.max_wait = Some(v);
        }
        if let Some(v) = env_parse("SPLITSIGHT_COVARIATE_LOOKBACK_HOURS")? {
            config.orchestrator.covariate_lookback_hours = v;
        }
        if let Some(v) = env_duration("SPLITSIGHT_SCAN_INTERVAL")? {
            config.scheduler.scan_interval = v;
        }
        if let Some(v) = env_duration("SPLITSIGHT_EXPERIMENT_UPDATE_INTERVAL")? {
            config.scheduler.experiment_update_interval = v;
        }
        if let Some(v) = env_duration("SPLITSIGHT_DASHBOARD_UPDATE_INTERVAL")? {
            config.scheduler.dashboard_update_interval = v;
        }
        if let Some(v) = env_parse("SPLITSIGHT_WORKERS")? {
            config.queue.workers = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tracker.validate()?;
        self.orchestrator.validate()?;
        self.scheduler.validate()?;
        if self.queue.workers == 0 {
            return Err(Error::Config("SPLITSIGHT_WORKERS must be at least 1".to_string()));
        }
        Ok(())
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create object store from environment
    ///
    /// Environment variables:
    /// - STORAGE_BACKEND: "memory" (default), "local" or "s3"
    /// - STORAGE_PATH: root directory (required for local)
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID: AWS credentials (optional, uses IAM role if not set)
    /// - AWS_SECRET_ACCESS_KEY: AWS credentials (optional)
    pub async fn create_object_store() -> Result<Arc<dyn ObjectStore>> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory object store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            "local" => {
                let path = std::env::var("STORAGE_PATH").map_err(|_| {
                    Error::Config("STORAGE_PATH required when STORAGE_BACKEND=local".to_string())
                })?;
                std::fs::create_dir_all(&path)?;
                info!(path = %path, "Using local filesystem object store");
                Ok(Arc::new(LocalFileSystem::new_with_prefix(&path)?))
            }
            "s3" => {
                let bucket = std::env::var("S3_BUCKET").map_err(|_| {
                    Error::Config("S3_BUCKET required when STORAGE_BACKEND=s3".to_string())
                })?;
                let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

                info!(bucket = %bucket, region = %region, "Using S3 object store");

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&bucket)
                    .with_region(&region);

                // MinIO, LocalStack
                if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
                    info!(endpoint = %endpoint, "Using custom S3 endpoint");
                    builder = builder.with_endpoint(&endpoint).with_allow_http(true);
                }

                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(&key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(&secret);
                }

                Ok(Arc::new(builder.build()?))
            }
            _ => Err(Error::Config(format!(
                "Unknown STORAGE_BACKEND: {}. Use 'memory', 'local' or 's3'",
                backend
            ))),
        }
    }

    /// Create metadata client from environment
    ///
    /// Environment variables:
    /// - METADATA_BACKEND: "local" (default) or "object_store"
    /// - METADATA_PREFIX: key prefix for documents (default: splitsight/)
    /// - METADATA_ALLOW_UNSAFE_OVERWRITE: fall back to plain puts when the
    ///   store lacks conditional writes
    pub async fn create_metadata_client(
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Arc<dyn MetadataClient>> {
        let backend = std::env::var("METADATA_BACKEND").unwrap_or_else(|_| "local".to_string());

        match backend.as_str() {
            "local" => {
                info!("Using LocalMetadataClient (development mode)");
                Ok(Arc::new(LocalMetadataClient::new()))
            }
            "object_store" => {
                let defaults = ObjectStoreMetadataConfig::default();
                let config = ObjectStoreMetadataConfig {
                    metadata_prefix: std::env::var("METADATA_PREFIX")
                        .unwrap_or(defaults.metadata_prefix),
                    allow_unsafe_overwrite: env_flag("METADATA_ALLOW_UNSAFE_OVERWRITE"),
                };
                info!(
                    prefix = %config.metadata_prefix,
                    allow_unsafe_overwrite = config.allow_unsafe_overwrite,
                    "Using ObjectStoreMetadataClient"
                );
                Ok(Arc::new(ObjectStoreMetadataClient::new(object_store, config)))
            }
            _ => Err(Error::Config(format!(
                "Unknown METADATA_BACKEND: {}. Use 'local' or 'object_store'",
                backend
            ))),
        }
    }
}
