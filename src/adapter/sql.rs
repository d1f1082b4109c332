//! Generic SQL adapter
//!
//! Builds the experiment query as a chain of CTEs:
//!
//! * `__rawExperiment` - the data source's exposure query
//! * `__experimentExposures` - exposures for this experiment and window
//! * `__experimentUnits` - one row per unit with its variation and first
//!   exposure; units seen in more than one variation get `__multiple__`
//! * `__metric_N` / `__userMetric_N` / `__stats_N` - per metric: raw events,
//!   per-unit value within the conversion window, per-variation moments
//!
//! and a final `UNION ALL` producing canonical metric rows.

use super::canonical::{self, RawRow};
use super::dialect::SqlDialect;
use super::{Capability, Dimension, ExperimentQueryRequest, QueryAdapter};
use crate::model::{DataSourceType, ExperimentUnitRow, MetricDefinition, MetricType, MetricValueRow};
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

pub(crate) const MULTIPLE_EXPOSURES: &str = "__multiple__";

/// Runs SQL text against a warehouse connection.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<RawRow>>;
}

const SQL_CAPABILITIES: &[Capability] = &[
    Capability::ExperimentMetrics,
    Capability::ExperimentUnits,
    Capability::RegressionAdjustment,
    Capability::Dimensions,
];

/// Adapter for every SQL warehouse
pub struct SqlAdapter {
    dialect: Arc<dyn SqlDialect>,
    executor: Arc<dyn SqlExecutor>,
}

impl SqlAdapter {
    pub fn new(dialect: Arc<dyn SqlDialect>, executor: Arc<dyn SqlExecutor>) -> Self {
        Self { dialect, executor }
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Substitute `{{ placeholders }}` in user-provided SQL.
    fn render_template(&self, sql: &str, request: &ExperimentQueryRequest) -> String {
        let d = self.dialect.as_ref();
        let mut rendered = sql.trim().trim_end_matches(';').to_string();
        for (key, value) in [
            ("startDate", d.to_timestamp(request.start_date)),
            ("endDate", d.to_timestamp(request.end_date)),
            (
                "experimentId",
                format!("'{}'", d.escape_string(&request.tracking_key)),
            ),
            ("schema", d.schema_prefix(request.default_schema.as_deref())),
        ] {
            rendered = rendered
                .replace(&format!("{{{{{}}}}}", key), &value)
                .replace(&format!("{{{{ {} }}}}", key), &value);
        }
        rendered
    }

    /// CTEs shared by metric and unit queries, without the leading `WITH`.
    fn units_ctes(&self, request: &ExperimentQueryRequest, dimension: &Dimension) -> String {
        let d = self.dialect.as_ref();
        let exposure_dimension = match dimension {
            Dimension::Exposure(column) => d.cast_to_string(&format!("e.{}", column)),
            Dimension::None | Dimension::FirstExposureDate => format!("'{}'", Dimension::ALL),
        };
        let unit_dimension = match dimension {
            Dimension::FirstExposureDate => {
                d.cast_to_string(&d.date_trunc_day("MIN(x.exposure_ts)"))
            }
            _ => "MAX(x.dimension)".to_string(),
        };

        let mut sql = String::new();
        let _ = write!(
            sql,
            "  __rawExperiment AS (\n    {raw}\n  ),\n",
            raw = self.render_template(&request.exposure_query.sql, request)
        );
        let _ = write!(
            sql,
            "  __experimentExposures AS (\n    SELECT\n      {user_id} AS user_id,\n      {variation} AS variation,\n      e.timestamp AS exposure_ts,\n      {dim} AS dimension\n    FROM __rawExperiment e\n    WHERE e.experiment_id = '{key}'\n      AND e.timestamp >= {start}\n      AND e.timestamp <= {end}\n  ),\n",
            user_id = d.cast_to_string("e.user_id"),
            variation = d.cast_to_string("e.variation_id"),
            dim = exposure_dimension,
            key = d.escape_string(&request.tracking_key),
            start = d.to_timestamp(request.start_date),
            end = d.to_timestamp(request.end_date),
        );
        let _ = write!(
            sql,
            "  __experimentUnits AS (\n    SELECT\n      x.user_id AS user_id,\n      CASE WHEN COUNT(DISTINCT x.variation) > 1 THEN '{multiple}' ELSE MAX(x.variation) END AS variation,\n      MIN(x.exposure_ts) AS first_exposure,\n      {dim} AS dimension\n    FROM __experimentExposures x\n    GROUP BY x.user_id\n  )",
            multiple = MULTIPLE_EXPOSURES,
            dim = unit_dimension,
        );
        sql
    }

    fn metric_ctes(
        &self,
        index: usize,
        metric: &MetricDefinition,
        request: &ExperimentQueryRequest,
    ) -> String {
        let d = self.dialect.as_ref();
        let window = i64::from(metric.conversion_window_hours);
        let lower_bound = if request.regression_adjusted {
            d.add_hours("u.first_exposure", -i64::from(request.covariate_lookback_hours))
        } else {
            "u.first_exposure".to_string()
        };

        // The cap bounds each unit's total, so it wraps the per-unit SUM
        let aggregate = |condition: &str| match metric.metric_type {
            MetricType::Binomial => format!(
                "MAX(CASE WHEN m.user_id IS NOT NULL AND {} THEN 1 ELSE 0 END)",
                condition
            ),
            MetricType::Count | MetricType::Duration | MetricType::Revenue => {
                let total = format!("SUM(CASE WHEN {} THEN m.value ELSE 0 END)", condition);
                match metric.cap {
                    Some(cap) => format!("CASE WHEN {total} > {cap} THEN {cap} ELSE {total} END"),
                    None => total,
                }
            }
        };
        let main = d.ensure_float(&aggregate("m.timestamp >= u.first_exposure"));
        let covariate = request
            .regression_adjusted
            .then(|| d.ensure_float(&aggregate("m.timestamp < u.first_exposure")));

        let mut sql = String::new();
        let _ = write!(
            sql,
            ",\n  __metric_{i} AS (\n    {raw}\n  ),\n",
            i = index,
            raw = self.render_template(&metric.sql, request)
        );
        let _ = write!(
            sql,
            "  __userMetric_{i} AS (\n    SELECT\n      u.user_id AS user_id,\n      u.variation AS variation,\n      u.dimension AS dimension,\n      {main} AS main_value",
            i = index,
            main = main,
        );
        if let Some(covariate) = &covariate {
            let _ = write!(sql, ",\n      {} AS covariate_value", covariate);
        }
        let _ = write!(
            sql,
            "\n    FROM __experimentUnits u\n    LEFT JOIN __metric_{i} m ON (\n      m.user_id = u.user_id\n      AND m.timestamp >= {lower}\n      AND m.timestamp <= {upper}\n    )\n    WHERE u.variation != '{multiple}'\n    GROUP BY u.user_id, u.variation, u.dimension\n  ),\n",
            i = index,
            lower = lower_bound,
            upper = d.add_hours("u.first_exposure", window),
            multiple = MULTIPLE_EXPOSURES,
        );
        let _ = write!(
            sql,
            "  __stats_{i} AS (\n    SELECT\n      s.variation AS variation,\n      s.dimension AS dimension,\n      COUNT(*) AS users,\n      {sum} AS main_sum,\n      {sumsq} AS main_sum_squares",
            i = index,
            sum = d.ensure_float("SUM(s.main_value)"),
            sumsq = d.ensure_float("SUM(s.main_value * s.main_value)"),
        );
        if covariate.is_some() {
            let _ = write!(
                sql,
                ",\n      {} AS covariate_sum,\n      {} AS covariate_sum_squares,\n      {} AS main_covariate_sum_product",
                d.ensure_float("SUM(s.covariate_value)"),
                d.ensure_float("SUM(s.covariate_value * s.covariate_value)"),
                d.ensure_float("SUM(s.main_value * s.covariate_value)"),
            );
        }
        let _ = write!(
            sql,
            "\n    FROM __userMetric_{i} s\n    GROUP BY s.variation, s.dimension\n  )",
            i = index
        );
        sql
    }
}

/// Caps are spliced into SQL as literals; NaN or inf would not parse.
fn check_cap(metric: &MetricDefinition) -> Result<()> {
    match metric.cap {
        Some(cap) if !cap.is_finite() || cap <= 0.0 => Err(Error::InvalidRequest(format!(
            "metric {} has cap {}, expected a positive finite number",
            metric.id, cap
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl QueryAdapter for SqlAdapter {
    fn backend(&self) -> DataSourceType {
        self.dialect.backend()
    }

    fn capabilities(&self) -> &[Capability] {
        SQL_CAPABILITIES
    }

    fn generate_metrics_query(&self, request: &ExperimentQueryRequest) -> Result<String> {
        if request.metrics.is_empty() {
            return Err(Error::InvalidRequest(
                "metrics query needs at least one metric".to_string(),
            ));
        }
        let dimension = request.parsed_dimension()?;
        let d = self.dialect.as_ref();

        let mut sql = format!(
            "-- Experiment metrics: {}\nWITH\n",
            request.tracking_key.replace('\n', " ")
        );
        sql.push_str(&self.units_ctes(request, &dimension));
        for (i, metric) in request.metrics.iter().enumerate() {
            check_cap(metric)?;
            sql.push_str(&self.metric_ctes(i, metric, request));
        }
        sql.push('\n');

        let covariate_columns = if request.regression_adjusted {
            ", covariate_sum, covariate_sum_squares, main_covariate_sum_product"
        } else {
            ""
        };
        let selects: Vec<String> = request
            .metrics
            .iter()
            .enumerate()
            .map(|(i, metric)| {
                format!(
                    "SELECT\n  '{id}' AS metric_id,\n  variation,\n  dimension,\n  users,\n  main_sum,\n  main_sum_squares{cov}\nFROM __stats_{i}",
                    id = d.escape_string(&metric.id),
                    cov = covariate_columns,
                    i = i,
                )
            })
            .collect();
        sql.push_str(&selects.join("\nUNION ALL\n"));
        Ok(sql)
    }

    async fn run_metrics_query(&self, query: &str) -> Result<Vec<MetricValueRow>> {
        let rows = self.executor.execute(query).await?;
        debug!(backend = %self.backend(), rows = rows.len(), "Metric query returned");
        canonical::metric_rows(rows)
    }

    fn generate_units_query(&self, request: &ExperimentQueryRequest) -> Result<String> {
        let dimension = request.parsed_dimension()?;
        let d = self.dialect.as_ref();
        let mut sql = format!(
            "-- Experiment units: {}\nWITH\n",
            request.tracking_key.replace('\n', " ")
        );
        sql.push_str(&self.units_ctes(request, &dimension));
        let _ = write!(
            sql,
            "\nSELECT\n  user_id,\n  variation,\n  dimension,\n  {} AS first_exposure\nFROM __experimentUnits",
            d.cast_to_string("first_exposure")
        );
        Ok(sql)
    }

    async fn run_units_query(&self, query: &str) -> Result<Vec<ExperimentUnitRow>> {
        let rows = self.executor.execute(query).await?;
        debug!(backend = %self.backend(), rows = rows.len(), "Units query returned");
        canonical::unit_rows(rows)
    }
}
