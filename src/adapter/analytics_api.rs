//! Reporting-API adapter
//!
//! Talks to a Google-Analytics-style `runReport` endpoint. The API only
//! returns aggregates (unit counts and per-unit means), so metric rows are
//! rebuilt with [`reconstruct_moments`]. Unit-level extraction is impossible
//! and fails fast.

use super::canonical::{as_f64, reconstruct_moments};
use super::{Capability, Dimension, ExperimentQueryRequest, QueryAdapter};
use crate::model::{DataSourceType, ExperimentUnitRow, MetricType, MetricValueRow};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};

const CAPABILITIES: &[Capability] = &[Capability::ExperimentMetrics];

#[derive(Clone, Serialize, Deserialize)]
pub struct AnalyticsApiParams {
    /// Base URL, e.g. `https://analyticsdata.googleapis.com`
    pub endpoint: String,
    pub property_id: String,
    pub access_token: String,
    #[serde(default = "default_experiment_dimension")]
    pub experiment_dimension: String,
    #[serde(default = "default_variation_dimension")]
    pub variation_dimension: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_experiment_dimension() -> String {
    "customEvent:experiment_id".to_string()
}

fn default_variation_dimension() -> String {
    "customEvent:variation_id".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

/// What a generated report query carries besides the API request itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ReportMetric {
    id: String,
    metric_type: MetricType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReportQuery {
    request: Value,
    metrics: Vec<ReportMetric>,
}

#[derive(Debug, Deserialize)]
struct ReportValue {
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRow {
    dimension_values: Vec<ReportValue>,
    metric_values: Vec<ReportValue>,
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    #[serde(default)]
    rows: Vec<ReportRow>,
}

pub struct AnalyticsApiAdapter {
    http_client: HttpClient,
    params: AnalyticsApiParams,
}

impl AnalyticsApiAdapter {
    pub fn new(params: AnalyticsApiParams) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(params.timeout_secs))
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self {
            http_client,
            params,
        })
    }

    fn report_url(&self) -> String {
        format!(
            "{}/v1beta/properties/{}:runReport",
            self.params.endpoint.trim_end_matches('/'),
            self.params.property_id
        )
    }

    /// Turn a report into canonical rows.
    ///
    /// Column 0 of every row is the unit count; column `i + 1` is the mean
    /// per unit of metric `i`.
    fn rows_from_report(
        metrics: &[ReportMetric],
        report: ReportResponse,
    ) -> Result<Vec<MetricValueRow>> {
        let mut rows = Vec::with_capacity(report.rows.len() * metrics.len());
        for row in report.rows {
            let variation = row
                .dimension_values
                .first()
                .map(|v| v.value.clone())
                .ok_or_else(|| Error::Serialization("report row has no variation".to_string()))?;
            let values: Vec<f64> = row
                .metric_values
                .iter()
                .map(|v| {
                    as_f64(&Value::String(v.value.clone())).ok_or_else(|| {
                        Error::Serialization(format!("non-numeric report value '{}'", v.value))
                    })
                })
                .collect::<Result<_>>()?;
            if values.len() != metrics.len() + 1 {
                return Err(Error::Serialization(format!(
                    "report row has {} values, expected {}",
                    values.len(),
                    metrics.len() + 1
                )));
            }

            let users = values[0].max(0.0) as u64;
            for (metric, mean) in metrics.iter().zip(&values[1..]) {
                let (main_sum, main_sum_squares) =
                    reconstruct_moments(metric.metric_type, users, *mean);
                rows.push(MetricValueRow {
                    metric_id: metric.id.clone(),
                    variation: variation.clone(),
                    dimension: Dimension::ALL.to_string(),
                    users,
                    main_sum,
                    main_sum_squares,
                    covariate_sum: None,
                    covariate_sum_squares: None,
                    main_covariate_sum_product: None,
                });
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl QueryAdapter for AnalyticsApiAdapter {
    fn backend(&self) -> DataSourceType {
        DataSourceType::GoogleAnalytics
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn generate_metrics_query(&self, request: &ExperimentQueryRequest) -> Result<String> {
        if request.parsed_dimension()? != Dimension::None {
            self.require(Capability::Dimensions)?;
        }
        if request.regression_adjusted {
            self.require(Capability::RegressionAdjustment)?;
        }

        let mut api_metrics = vec![json!({"name": "totalUsers"})];
        let mut metrics = Vec::with_capacity(request.metrics.len());
        for metric in &request.metrics {
            let event = metric.event_name.as_deref().ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "metric {} has no event name for the analytics API",
                    metric.id
                ))
            })?;
            api_metrics.push(json!({
                "name": format!("{}_per_user", metric.id),
                "expression": format!("eventValue:{}/totalUsers", event),
            }));
            metrics.push(ReportMetric {
                id: metric.id.clone(),
                metric_type: metric.metric_type,
            });
        }

        let query = ReportQuery {
            request: json!({
                "dateRanges": [{
                    "startDate": request.start_date.format("%Y-%m-%d").to_string(),
                    "endDate": request.end_date.format("%Y-%m-%d").to_string(),
                }],
                "dimensions": [{"name": self.params.variation_dimension}],
                "dimensionFilter": {
                    "filter": {
                        "fieldName": self.params.experiment_dimension,
                        "stringFilter": {"matchType": "EXACT", "value": request.tracking_key},
                    }
                },
                "metrics": api_metrics,
                "keepEmptyRows": false,
            }),
            metrics,
        };
        Ok(serde_json::to_string_pretty(&query)?)
    }

    #[instrument(skip_all, err)]
    async fn run_metrics_query(&self, query: &str) -> Result<Vec<MetricValueRow>> {
        let query: ReportQuery = serde_json::from_str(query)
            .map_err(|e| Error::QuerySyntax(format!("malformed report query: {}", e)))?;

        let response = self
            .http_client
            .post(self.report_url())
            .bearer_auth(&self.params.access_token)
            .json(&query.request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 => Error::QuerySyntax(format!("HTTP {}: {}", status, body)),
                _ => Error::Connection(format!("HTTP {}: {}", status, body)),
            });
        }

        let report: ReportResponse = response.json().await?;
        debug!(rows = report.rows.len(), "Analytics report returned");
        Self::rows_from_report(&query.metrics, report)
    }

    fn generate_units_query(&self, _request: &ExperimentQueryRequest) -> Result<String> {
        Err(Error::unsupported(
            self.backend().as_str(),
            Capability::ExperimentUnits.as_str(),
        ))
    }

    async fn run_units_query(&self, _query: &str) -> Result<Vec<ExperimentUnitRow>> {
        Err(Error::unsupported(
            self.backend().as_str(),
            Capability::ExperimentUnits.as_str(),
        ))
    }
}
