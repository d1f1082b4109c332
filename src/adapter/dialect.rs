//! SQL dialect hooks
//!
//! The experiment query template is shared by every warehouse. Anything that
//! differs between engines (date arithmetic, casts, literal syntax) goes
//! through one of these hooks.

use crate::model::DataSourceType;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub trait SqlDialect: Send + Sync {
    fn backend(&self) -> DataSourceType;

    /// Timestamp literal for `ts`, compared against exposure timestamps.
    fn to_timestamp(&self, ts: DateTime<Utc>) -> String {
        format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S"))
    }

    /// `col` shifted by a (possibly negative) number of hours.
    fn add_hours(&self, col: &str, hours: i64) -> String;

    /// `col` truncated to its day.
    fn date_trunc_day(&self, col: &str) -> String {
        format!("date_trunc('day', {})", col)
    }

    fn cast_to_string(&self, col: &str) -> String {
        format!("CAST({} AS VARCHAR)", col)
    }

    /// Force floating point arithmetic on aggregates.
    fn ensure_float(&self, col: &str) -> String {
        format!("CAST({} AS DOUBLE PRECISION)", col)
    }

    /// Escape a value for use inside a single-quoted string literal.
    fn escape_string(&self, value: &str) -> String {
        value.replace('\'', "''")
    }

    /// Prefix that qualifies a table with the data source's default schema.
    fn schema_prefix(&self, schema: Option<&str>) -> String {
        match schema {
            Some(schema) if !schema.is_empty() => format!("{}.", schema),
            _ => String::new(),
        }
    }
}

/// Engines that escape quotes with a backslash
fn backslash_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Postgres;

impl SqlDialect for Postgres {
    fn backend(&self) -> DataSourceType {
        DataSourceType::Postgres
    }

    fn to_timestamp(&self, ts: DateTime<Utc>) -> String {
        format!("'{}'::timestamp", ts.format("%Y-%m-%d %H:%M:%S"))
    }

    fn add_hours(&self, col: &str, hours: i64) -> String {
        format!("{} + INTERVAL '{} hours'", col, hours)
    }

    fn ensure_float(&self, col: &str) -> String {
        format!("({})::float", col)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Redshift;

impl SqlDialect for Redshift {
    fn backend(&self) -> DataSourceType {
        DataSourceType::Redshift
    }

    fn add_hours(&self, col: &str, hours: i64) -> String {
        format!("DATEADD(hour, {}, {})", hours, col)
    }

    fn ensure_float(&self, col: &str) -> String {
        format!("({})::float", col)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Snowflake;

impl SqlDialect for Snowflake {
    fn backend(&self) -> DataSourceType {
        DataSourceType::Snowflake
    }

    fn to_timestamp(&self, ts: DateTime<Utc>) -> String {
        format!("TO_TIMESTAMP_NTZ('{}')", ts.format("%Y-%m-%d %H:%M:%S"))
    }

    fn add_hours(&self, col: &str, hours: i64) -> String {
        format!("DATEADD(hour, {}, {})", hours, col)
    }

    fn cast_to_string(&self, col: &str) -> String {
        format!("TO_VARCHAR({})", col)
    }

    fn ensure_float(&self, col: &str) -> String {
        format!("CAST({} AS DOUBLE)", col)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BigQuery;

impl SqlDialect for BigQuery {
    fn backend(&self) -> DataSourceType {
        DataSourceType::BigQuery
    }

    fn to_timestamp(&self, ts: DateTime<Utc>) -> String {
        format!("TIMESTAMP('{}')", ts.format("%Y-%m-%d %H:%M:%S"))
    }

    fn add_hours(&self, col: &str, hours: i64) -> String {
        format!("TIMESTAMP_ADD({}, INTERVAL {} HOUR)", col, hours)
    }

    fn date_trunc_day(&self, col: &str) -> String {
        format!("TIMESTAMP_TRUNC({}, DAY)", col)
    }

    fn cast_to_string(&self, col: &str) -> String {
        format!("CAST({} AS STRING)", col)
    }

    fn ensure_float(&self, col: &str) -> String {
        format!("CAST({} AS FLOAT64)", col)
    }

    fn escape_string(&self, value: &str) -> String {
        backslash_escape(value)
    }

    fn schema_prefix(&self, schema: Option<&str>) -> String {
        match schema {
            Some(schema) if !schema.is_empty() => format!("`{}`.", schema),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ClickHouse;

impl SqlDialect for ClickHouse {
    fn backend(&self) -> DataSourceType {
        DataSourceType::ClickHouse
    }

    fn to_timestamp(&self, ts: DateTime<Utc>) -> String {
        format!("toDateTime('{}', 'UTC')", ts.format("%Y-%m-%d %H:%M:%S"))
    }

    fn add_hours(&self, col: &str, hours: i64) -> String {
        format!("dateAdd(hour, {}, {})", hours, col)
    }

    fn date_trunc_day(&self, col: &str) -> String {
        format!("toStartOfDay({})", col)
    }

    fn cast_to_string(&self, col: &str) -> String {
        format!("toString({})", col)
    }

    fn ensure_float(&self, col: &str) -> String {
        format!("toFloat64({})", col)
    }

    fn escape_string(&self, value: &str) -> String {
        backslash_escape(value)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MySql;

impl SqlDialect for MySql {
    fn backend(&self) -> DataSourceType {
        DataSourceType::MySql
    }

    fn add_hours(&self, col: &str, hours: i64) -> String {
        format!("DATE_ADD({}, INTERVAL {} HOUR)", col, hours)
    }

    fn date_trunc_day(&self, col: &str) -> String {
        format!("DATE({})", col)
    }

    fn cast_to_string(&self, col: &str) -> String {
        format!("CAST({} AS CHAR)", col)
    }

    fn ensure_float(&self, col: &str) -> String {
        format!("CAST({} AS DOUBLE)", col)
    }

    fn escape_string(&self, value: &str) -> String {
        backslash_escape(value)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MsSql;

impl SqlDialect for MsSql {
    fn backend(&self) -> DataSourceType {
        DataSourceType::MsSql
    }

    fn add_hours(&self, col: &str, hours: i64) -> String {
        format!("DATEADD(hour, {}, {})", hours, col)
    }

    fn date_trunc_day(&self, col: &str) -> String {
        format!("CAST({} AS DATE)", col)
    }

    fn cast_to_string(&self, col: &str) -> String {
        format!("CAST({} AS VARCHAR(256))", col)
    }

    fn ensure_float(&self, col: &str) -> String {
        format!("CAST({} AS FLOAT)", col)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Databricks;

impl SqlDialect for Databricks {
    fn backend(&self) -> DataSourceType {
        DataSourceType::Databricks
    }

    fn to_timestamp(&self, ts: DateTime<Utc>) -> String {
        format!("TIMESTAMP'{}'", ts.format("%Y-%m-%d %H:%M:%S"))
    }

    fn add_hours(&self, col: &str, hours: i64) -> String {
        format!("timestampadd(HOUR, {}, {})", hours, col)
    }

    fn cast_to_string(&self, col: &str) -> String {
        format!("CAST({} AS STRING)", col)
    }

    fn ensure_float(&self, col: &str) -> String {
        format!("CAST({} AS DOUBLE)", col)
    }

    fn escape_string(&self, value: &str) -> String {
        backslash_escape(value)
    }
}

/// Presto, Trino and Athena
#[derive(Debug, Clone, Copy)]
pub struct Presto {
    backend: DataSourceType,
}

impl Presto {
    pub fn new(backend: DataSourceType) -> Self {
        Self { backend }
    }
}

impl SqlDialect for Presto {
    fn backend(&self) -> DataSourceType {
        self.backend
    }

    fn to_timestamp(&self, ts: DateTime<Utc>) -> String {
        format!(
            "from_iso8601_timestamp('{}')",
            ts.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        )
    }

    fn add_hours(&self, col: &str, hours: i64) -> String {
        format!("{} + INTERVAL '{}' hour", col, hours)
    }

    fn ensure_float(&self, col: &str) -> String {
        format!("CAST({} AS DOUBLE)", col)
    }
}

/// Embedded DataFusion engine
#[derive(Debug, Default, Clone, Copy)]
pub struct DataFusion;

impl SqlDialect for DataFusion {
    fn backend(&self) -> DataSourceType {
        DataSourceType::DataFusion
    }

    fn to_timestamp(&self, ts: DateTime<Utc>) -> String {
        format!("CAST('{}' AS TIMESTAMP)", ts.format("%Y-%m-%dT%H:%M:%S"))
    }

    fn add_hours(&self, col: &str, hours: i64) -> String {
        format!("{} + INTERVAL '{} hours'", col, hours)
    }

    fn ensure_float(&self, col: &str) -> String {
        format!("CAST({} AS DOUBLE)", col)
    }
}

/// Dialect for a SQL backend; `None` for non-SQL backends.
pub fn dialect_for(backend: DataSourceType) -> Option<Arc<dyn SqlDialect>> {
    let dialect: Arc<dyn SqlDialect> = match backend {
        DataSourceType::Postgres => Arc::new(Postgres),
        DataSourceType::Redshift => Arc::new(Redshift),
        DataSourceType::Snowflake => Arc::new(Snowflake),
        DataSourceType::BigQuery => Arc::new(BigQuery),
        DataSourceType::ClickHouse => Arc::new(ClickHouse),
        DataSourceType::MySql => Arc::new(MySql),
        DataSourceType::MsSql => Arc::new(MsSql),
        DataSourceType::Databricks => Arc::new(Databricks),
        DataSourceType::Presto | DataSourceType::Athena => Arc::new(Presto::new(backend)),
        DataSourceType::DataFusion => Arc::new(DataFusion),
        DataSourceType::GoogleAnalytics => return None,
    };
    Some(dialect)
}
