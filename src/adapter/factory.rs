//! Resolution of data sources to adapters

use super::drivers::{self, ClickHouseParams, DataFusionParams, PostgresParams};
use super::{dialect_for, AnalyticsApiAdapter, AnalyticsApiParams, QueryAdapter, SqlAdapter, SqlExecutor};
use crate::model::{DataSource, DataSourceType};
use crate::{Error, Result};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Decrypted connection parameters
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum ConnectionParams {
    Postgres(PostgresParams),
    #[serde(rename = "clickhouse")]
    ClickHouse(ClickHouseParams),
    #[serde(rename = "datafusion")]
    DataFusion(DataFusionParams),
    AnalyticsApi(AnalyticsApiParams),
    /// Parameters for drivers registered by the embedding application
    Custom {
        #[serde(default)]
        settings: serde_json::Value,
    },
}

impl ConnectionParams {
    pub fn driver_name(&self) -> &'static str {
        match self {
            ConnectionParams::Postgres(_) => "postgres",
            ConnectionParams::ClickHouse(_) => "clickhouse",
            ConnectionParams::DataFusion(_) => "datafusion",
            ConnectionParams::AnalyticsApi(_) => "analytics_api",
            ConnectionParams::Custom { .. } => "custom",
        }
    }
}

// Secrets never reach logs
impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("driver", &self.driver_name())
            .finish_non_exhaustive()
    }
}

/// Decrypts a data source's stored connection parameters.
pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, datasource: &DataSource) -> Result<ConnectionParams>;
}

/// Treats the stored parameters as plain JSON. For development and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextDecryptor;

impl CredentialDecryptor for PlaintextDecryptor {
    fn decrypt(&self, datasource: &DataSource) -> Result<ConnectionParams> {
        serde_json::from_str(&datasource.params).map_err(|e| {
            Error::Config(format!(
                "invalid connection parameters for data source {}: {}",
                datasource.id, e
            ))
        })
    }
}

/// Builds a [`SqlExecutor`] from decrypted parameters.
pub trait DriverFactory: Send + Sync {
    fn connect(&self, params: Arc<ConnectionParams>) -> Result<Arc<dyn SqlExecutor>>;
}

impl<F> DriverFactory for F
where
    F: Fn(Arc<ConnectionParams>) -> Result<Arc<dyn SqlExecutor>> + Send + Sync,
{
    fn connect(&self, params: Arc<ConnectionParams>) -> Result<Arc<dyn SqlExecutor>> {
        self(params)
    }
}

/// Resolves data sources to adapters, caching one adapter per data source
/// revision.
pub struct AdapterFactory {
    decryptor: Arc<dyn CredentialDecryptor>,
    drivers: HashMap<DataSourceType, Arc<dyn DriverFactory>>,
    cache: Cache<String, Arc<dyn QueryAdapter>>,
}

impl AdapterFactory {
    pub fn new(decryptor: Arc<dyn CredentialDecryptor>) -> Self {
        Self::with_drivers(decryptor, drivers::default_drivers())
    }

    pub fn with_drivers(
        decryptor: Arc<dyn CredentialDecryptor>,
        drivers: HashMap<DataSourceType, Arc<dyn DriverFactory>>,
    ) -> Self {
        Self {
            decryptor,
            drivers,
            cache: Cache::builder()
                .max_capacity(1_000)
                .time_to_idle(Duration::from_secs(30 * 60))
                .build(),
        }
    }

    /// Register or replace the driver for a backend.
    pub fn register_driver(&mut self, backend: DataSourceType, driver: Arc<dyn DriverFactory>) {
        self.drivers.insert(backend, driver);
    }

    pub fn has_driver(&self, backend: DataSourceType) -> bool {
        backend == DataSourceType::GoogleAnalytics || self.drivers.contains_key(&backend)
    }

    /// Adapter for `datasource`, built on first use.
    pub async fn adapter_for(&self, datasource: &DataSource) -> Result<Arc<dyn QueryAdapter>> {
        let key = format!(
            "{}:{}",
            datasource.id,
            datasource.date_updated.timestamp_millis()
        );
        if let Some(adapter) = self.cache.get(&key).await {
            return Ok(adapter);
        }

        let adapter = self.build(datasource)?;
        self.cache.insert(key, adapter.clone()).await;
        info!(
            datasource_id = %datasource.id,
            backend = %datasource.kind,
            "Created query adapter"
        );
        Ok(adapter)
    }

    fn build(&self, datasource: &DataSource) -> Result<Arc<dyn QueryAdapter>> {
        if datasource.kind == DataSourceType::GoogleAnalytics {
            return match self.decryptor.decrypt(datasource)? {
                ConnectionParams::AnalyticsApi(params) => {
                    Ok(Arc::new(AnalyticsApiAdapter::new(params)?))
                }
                other => Err(Error::Config(format!(
                    "analytics API data source {} has {} connection parameters",
                    datasource.id,
                    other.driver_name()
                ))),
            };
        }

        let dialect = dialect_for(datasource.kind).ok_or_else(|| {
            Error::unsupported(datasource.kind.as_str(), "SQL generation")
        })?;
        let driver = self.drivers.get(&datasource.kind).ok_or_else(|| {
            Error::unsupported(datasource.kind.as_str(), "query execution (no driver registered)")
        })?;

        let params = Arc::new(self.decryptor.decrypt(datasource)?);
        debug!(
            datasource_id = %datasource.id,
            driver = params.driver_name(),
            "Connecting driver"
        );
        let executor = driver.connect(params)?;
        Ok(Arc::new(SqlAdapter::new(dialect, executor)))
    }
}
