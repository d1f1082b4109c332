//! Conversion of driver rows into canonical result rows

use crate::model::{ExperimentUnitRow, MetricType, MetricValueRow};
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// One result row as returned by a driver, keyed by lower-case column name
pub type RawRow = serde_json::Map<String, Value>;

/// Rebuild `(sum, sum_of_squares)` from a count and a mean.
///
/// Backends that only report aggregates give no access to per-unit values,
/// so the variance is approximated from the metric's distribution family:
/// exponential for durations, Poisson for counts and revenue, Bernoulli for
/// conversions.
pub fn reconstruct_moments(metric_type: MetricType, count: u64, mean: f64) -> (f64, f64) {
    let n = count as f64;
    let variance = match metric_type {
        MetricType::Duration => mean * mean,
        MetricType::Count | MetricType::Revenue => mean,
        MetricType::Binomial => mean * (1.0 - mean),
    };
    (n * mean, n * (variance + mean * mean))
}

fn column<'a>(row: &'a RawRow, name: &str) -> Option<&'a Value> {
    row.get(name)
        .or_else(|| row.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v))
        .filter(|v| !v.is_null())
}

fn required<'a>(row: &'a RawRow, name: &str) -> Result<&'a Value> {
    column(row, name)
        .ok_or_else(|| Error::Serialization(format!("result row is missing column '{}'", name)))
}

/// Some drivers return numerics as strings (NUMERIC, DECIMAL, 64-bit ints over HTTP).
pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub(crate) fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn float_column(row: &RawRow, name: &str) -> Result<f64> {
    let value = required(row, name)?;
    as_f64(value).ok_or_else(|| {
        Error::Serialization(format!("column '{}' is not numeric: {}", name, value))
    })
}

fn optional_float_column(row: &RawRow, name: &str) -> Option<f64> {
    column(row, name).and_then(as_f64)
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts.and_utc());
        }
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

pub(crate) fn metric_row(row: &RawRow) -> Result<MetricValueRow> {
    let users = float_column(row, "users")?;
    if users < 0.0 {
        return Err(Error::Serialization(format!(
            "negative user count {}",
            users
        )));
    }
    Ok(MetricValueRow {
        metric_id: as_string(required(row, "metric_id")?),
        variation: as_string(required(row, "variation")?),
        dimension: column(row, "dimension")
            .map(as_string)
            .unwrap_or_else(|| super::Dimension::ALL.to_string()),
        users: users as u64,
        main_sum: float_column(row, "main_sum")?,
        main_sum_squares: float_column(row, "main_sum_squares")?,
        covariate_sum: optional_float_column(row, "covariate_sum"),
        covariate_sum_squares: optional_float_column(row, "covariate_sum_squares"),
        main_covariate_sum_product: optional_float_column(row, "main_covariate_sum_product"),
    })
}

pub(crate) fn metric_rows(rows: Vec<RawRow>) -> Result<Vec<MetricValueRow>> {
    rows.iter().map(metric_row).collect()
}

pub(crate) fn unit_row(row: &RawRow) -> Result<ExperimentUnitRow> {
    let first_exposure = match column(row, "first_exposure") {
        None => None,
        Some(Value::String(s)) => Some(parse_timestamp(s).ok_or_else(|| {
            Error::Serialization(format!("unparseable first_exposure '{}'", s))
        })?),
        // Epoch milliseconds
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        Some(other) => {
            return Err(Error::Serialization(format!(
                "unexpected first_exposure value {}",
                other
            )))
        }
    };
    Ok(ExperimentUnitRow {
        user_id: as_string(required(row, "user_id")?),
        variation: as_string(required(row, "variation")?),
        dimension: column(row, "dimension")
            .map(as_string)
            .unwrap_or_else(|| super::Dimension::ALL.to_string()),
        first_exposure,
    })
}

pub(crate) fn unit_rows(rows: Vec<RawRow>) -> Result<Vec<ExperimentUnitRow>> {
    rows.iter().map(unit_row).collect()
}
