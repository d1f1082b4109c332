//! Query adapters
//!
//! An adapter turns an experiment analysis request into engine-native query
//! text and runs that text against one data source, returning canonical rows.
//! Generation is pure so every dialect can be tested without a connection.
//!
//! SQL warehouses share one [`SqlAdapter`] templated by a [`SqlDialect`] and
//! executed by a [`SqlExecutor`] driver. Reporting APIs without raw rows
//! implement [`QueryAdapter`] directly (see [`AnalyticsApiAdapter`]).

mod analytics_api;
mod canonical;
mod dialect;
pub mod drivers;
mod factory;
mod sql;

pub use analytics_api::{AnalyticsApiAdapter, AnalyticsApiParams};
pub use canonical::{reconstruct_moments, RawRow};
pub use dialect::{dialect_for, SqlDialect};
pub use factory::{
    AdapterFactory, ConnectionParams, CredentialDecryptor, DriverFactory, PlaintextDecryptor,
};
pub use sql::{SqlAdapter, SqlExecutor};

use crate::model::{
    DataSourceType, ExperimentUnitRow, ExposureQuery, MetricDefinition, MetricValueRow, QueryKind,
    QueryResult,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Analyses an adapter can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ExperimentMetrics,
    ExperimentUnits,
    RegressionAdjustment,
    Dimensions,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ExperimentMetrics => "experiment metrics",
            Capability::ExperimentUnits => "experiment units",
            Capability::RegressionAdjustment => "regression adjustment",
            Capability::Dimensions => "dimension breakdowns",
        }
    }
}

/// How exposed units are split for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dimension {
    /// Every unit in one bucket named `All`
    None,
    /// Column of the exposure query (`exp:<column>`)
    Exposure(String),
    /// Day of first exposure (`pre:date`)
    FirstExposureDate,
}

impl Dimension {
    pub const ALL: &'static str = "All";

    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw {
            None => Ok(Dimension::None),
            Some("pre:date") => Ok(Dimension::FirstExposureDate),
            Some(raw) => match raw.strip_prefix("exp:") {
                Some(column) if is_identifier(column) => Ok(Dimension::Exposure(column.to_string())),
                _ => Err(Error::InvalidRequest(format!(
                    "unsupported dimension '{}'",
                    raw
                ))),
            },
        }
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

/// Everything needed to extract raw data for one extraction group
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentQueryRequest {
    /// Experiment id as logged by the exposure query
    pub tracking_key: String,
    pub exposure_query: ExposureQuery,
    pub metrics: Vec<MetricDefinition>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub dimension: Option<String>,
    pub regression_adjusted: bool,
    /// Pre-exposure window used for covariates
    pub covariate_lookback_hours: u32,
    pub default_schema: Option<String>,
}

impl ExperimentQueryRequest {
    pub fn parsed_dimension(&self) -> Result<Dimension> {
        Dimension::parse(self.dimension.as_deref())
    }
}

/// Backend-specific query generation and execution
#[async_trait]
pub trait QueryAdapter: Send + Sync {
    fn backend(&self) -> DataSourceType;

    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Fail with `Unsupported` unless the adapter has `capability`.
    fn require(&self, capability: Capability) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(Error::unsupported(self.backend().as_str(), capability.as_str()))
        }
    }

    fn generate_metrics_query(&self, request: &ExperimentQueryRequest) -> Result<String>;

    async fn run_metrics_query(&self, query: &str) -> Result<Vec<MetricValueRow>>;

    fn generate_units_query(&self, request: &ExperimentQueryRequest) -> Result<String>;

    async fn run_units_query(&self, query: &str) -> Result<Vec<ExperimentUnitRow>>;

    fn generate_query(&self, kind: QueryKind, request: &ExperimentQueryRequest) -> Result<String> {
        match kind {
            QueryKind::ExperimentMetrics => self.generate_metrics_query(request),
            QueryKind::ExperimentUnits => self.generate_units_query(request),
        }
    }

    async fn run_query(&self, kind: QueryKind, query: &str) -> Result<QueryResult> {
        match kind {
            QueryKind::ExperimentMetrics => {
                self.run_metrics_query(query).await.map(QueryResult::Metrics)
            }
            QueryKind::ExperimentUnits => self.run_units_query(query).await.map(QueryResult::Units),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_parsing() {
        assert_eq!(Dimension::parse(None).unwrap(), Dimension::None);
        assert_eq!(
            Dimension::parse(Some("exp:country")).unwrap(),
            Dimension::Exposure("country".into())
        );
        assert_eq!(
            Dimension::parse(Some("pre:date")).unwrap(),
            Dimension::FirstExposureDate
        );
        // Column names are spliced into SQL, so only identifiers pass
        assert!(Dimension::parse(Some("exp:country; DROP TABLE x")).is_err());
        assert!(Dimension::parse(Some("dim_123")).is_err());
    }
}
