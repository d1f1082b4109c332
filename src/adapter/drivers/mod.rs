//! Warehouse drivers
//!
//! A driver turns decrypted connection parameters into a [`SqlExecutor`].
//! Backends without a registered driver are rejected by the
//! [`AdapterFactory`](super::AdapterFactory) before any query is generated.

mod clickhouse;
mod datafusion;
mod postgres;

pub use self::datafusion::{DataFusionExecutor, DataFusionParams, TableSource};
pub use clickhouse::{ClickHouseExecutor, ClickHouseParams};
pub use postgres::{PostgresExecutor, PostgresParams};

use super::{ConnectionParams, DriverFactory, SqlExecutor};
use crate::model::DataSourceType;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

fn mismatch(driver: &str, params: &ConnectionParams) -> Error {
    Error::Config(format!(
        "{} driver cannot use {} connection parameters",
        driver,
        params.driver_name()
    ))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDriver;

impl DriverFactory for PostgresDriver {
    fn connect(&self, params: Arc<ConnectionParams>) -> Result<Arc<dyn SqlExecutor>> {
        match params.as_ref() {
            ConnectionParams::Postgres(p) => Ok(Arc::new(PostgresExecutor::new(p.clone()))),
            other => Err(mismatch("postgres", other)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ClickHouseDriver;

impl DriverFactory for ClickHouseDriver {
    fn connect(&self, params: Arc<ConnectionParams>) -> Result<Arc<dyn SqlExecutor>> {
        match params.as_ref() {
            ConnectionParams::ClickHouse(p) => Ok(Arc::new(ClickHouseExecutor::new(p.clone())?)),
            other => Err(mismatch("clickhouse", other)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DataFusionDriver;

impl DriverFactory for DataFusionDriver {
    fn connect(&self, params: Arc<ConnectionParams>) -> Result<Arc<dyn SqlExecutor>> {
        match params.as_ref() {
            ConnectionParams::DataFusion(p) => Ok(Arc::new(DataFusionExecutor::new(p.clone()))),
            other => Err(mismatch("datafusion", other)),
        }
    }
}

/// Drivers shipped with the crate
pub fn default_drivers() -> HashMap<DataSourceType, Arc<dyn DriverFactory>> {
    let mut drivers: HashMap<DataSourceType, Arc<dyn DriverFactory>> = HashMap::new();
    drivers.insert(DataSourceType::Postgres, Arc::new(PostgresDriver));
    // Redshift speaks the PostgreSQL wire protocol
    drivers.insert(DataSourceType::Redshift, Arc::new(PostgresDriver));
    drivers.insert(DataSourceType::ClickHouse, Arc::new(ClickHouseDriver));
    drivers.insert(DataSourceType::DataFusion, Arc::new(DataFusionDriver));
    drivers
}
