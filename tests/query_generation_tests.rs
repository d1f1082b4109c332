//! Query generation across every backend
//!
//! Generation is pure, so no warehouse is needed.

mod harness;

use chrono::{TimeZone, Utc};
use harness::{checkout_metric, datasource, ScriptedExecutor};
use splitsight::adapter::{
    dialect_for, AnalyticsApiAdapter, AnalyticsApiParams, ExperimentQueryRequest, QueryAdapter,
    SqlAdapter,
};
use splitsight::model::{DataSourceType, MetricType, QueryKind};
use splitsight::{Error, ErrorKind};
use std::sync::Arc;

const SQL_BACKENDS: [DataSourceType; 11] = [
    DataSourceType::Postgres,
    DataSourceType::Redshift,
    DataSourceType::Snowflake,
    DataSourceType::BigQuery,
    DataSourceType::ClickHouse,
    DataSourceType::MySql,
    DataSourceType::MsSql,
    DataSourceType::Databricks,
    DataSourceType::Presto,
    DataSourceType::Athena,
    DataSourceType::DataFusion,
];

fn request() -> ExperimentQueryRequest {
    let mut revenue = checkout_metric();
    revenue.id = "met_revenue".into();
    revenue.metric_type = MetricType::Revenue;
    revenue.cap = Some(500.0);
    revenue.event_name = Some("purchase".into());
    let mut checkout = checkout_metric();
    checkout.event_name = Some("checkout".into());

    ExperimentQueryRequest {
        tracking_key: "checkout-flow".into(),
        exposure_query: datasource(DataSourceType::Postgres).settings.exposure_queries[0].clone(),
        metrics: vec![checkout, revenue],
        start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end_date: Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
        dimension: None,
        regression_adjusted: false,
        covariate_lookback_hours: 336,
        default_schema: Some("analytics".into()),
    }
}

fn sql_adapter(backend: DataSourceType) -> SqlAdapter {
    SqlAdapter::new(
        dialect_for(backend).unwrap(),
        Arc::new(ScriptedExecutor::succeeding()),
    )
}

#[test]
fn test_every_sql_backend_generates_canonical_columns() {
    for backend in SQL_BACKENDS {
        let adapter = sql_adapter(backend);
        assert_eq!(adapter.backend(), backend);

        let sql = adapter
            .generate_query(QueryKind::ExperimentMetrics, &request())
            .unwrap();
        for column in [
            "metric_id",
            "variation",
            "dimension",
            "users",
            "main_sum",
            "main_sum_squares",
        ] {
            assert!(sql.contains(column), "{}: missing {}", backend, column);
        }
        assert!(sql.contains("'met_checkout' AS metric_id"), "{}", backend);
        assert!(sql.contains("'met_revenue' AS metric_id"), "{}", backend);
        assert!(
            sql.contains("FROM analytics.") || sql.contains("FROM `analytics`."),
            "{}: schema not applied",
            backend
        );
        assert!(!sql.contains("{{"), "{}: unrendered placeholder", backend);
    }
}

#[test]
fn test_generation_is_deterministic_per_backend() {
    let mut req = request();
    req.dimension = Some("exp:country".into());
    req.regression_adjusted = true;
    for backend in SQL_BACKENDS {
        let first = sql_adapter(backend).generate_metrics_query(&req).unwrap();
        let second = sql_adapter(backend).generate_metrics_query(&req).unwrap();
        assert_eq!(first, second, "{}", backend);
    }
}

#[test]
fn test_conversion_window_uses_dialect_date_arithmetic() {
    let cases = [
        (DataSourceType::Postgres, "u.first_exposure + INTERVAL '72 hours'"),
        (DataSourceType::Snowflake, "DATEADD(hour, 72, u.first_exposure)"),
        (DataSourceType::BigQuery, "TIMESTAMP_ADD(u.first_exposure, INTERVAL 72 HOUR)"),
        (DataSourceType::ClickHouse, "dateAdd(hour, 72, u.first_exposure)"),
        (DataSourceType::MySql, "DATE_ADD(u.first_exposure, INTERVAL 72 HOUR)"),
        (DataSourceType::Databricks, "timestampadd(HOUR, 72, u.first_exposure)"),
        (DataSourceType::Athena, "u.first_exposure + INTERVAL '72' hour"),
    ];
    for (backend, expected) in cases {
        let sql = sql_adapter(backend).generate_metrics_query(&request()).unwrap();
        assert!(sql.contains(expected), "{}: expected {}\n{}", backend, expected, sql);
    }
}

#[test]
fn test_regression_adjustment_adds_covariate_moments() {
    let mut req = request();
    req.regression_adjusted = true;
    let sql = sql_adapter(DataSourceType::Postgres)
        .generate_metrics_query(&req)
        .unwrap();
    assert!(sql.contains("u.first_exposure + INTERVAL '-336 hours'"));
    assert!(sql.contains("covariate_sum_squares"));
    assert!(sql.contains("main_covariate_sum_product"));
    assert!(sql.contains("m.timestamp < u.first_exposure"));
}

#[test]
fn test_units_query_has_one_row_per_unit() {
    for backend in SQL_BACKENDS {
        let sql = sql_adapter(backend)
            .generate_query(QueryKind::ExperimentUnits, &request())
            .unwrap();
        assert!(sql.contains("FROM __experimentUnits"), "{}", backend);
        assert!(sql.contains("first_exposure"), "{}", backend);
        assert!(!sql.contains("__stats_"), "{}", backend);
    }
}

#[test]
fn test_dimension_must_be_an_identifier() {
    let mut req = request();
    req.dimension = Some("exp:country) OR (1=1".into());
    let result = sql_adapter(DataSourceType::Postgres).generate_metrics_query(&req);
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
}

#[test]
fn test_unusable_caps_are_rejected() {
    for cap in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 0.0, -10.0] {
        let mut req = request();
        req.metrics[1].cap = Some(cap);
        for backend in SQL_BACKENDS {
            let result = sql_adapter(backend).generate_metrics_query(&req);
            assert!(
                matches!(result, Err(Error::InvalidRequest(_))),
                "{}: cap {} accepted",
                backend,
                cap
            );
        }
    }
}

#[test]
fn test_cap_applies_to_the_unit_total() {
    let sql = sql_adapter(DataSourceType::Postgres)
        .generate_metrics_query(&request())
        .unwrap();
    assert!(sql.contains("CASE WHEN SUM(CASE WHEN m.timestamp >= u.first_exposure THEN m.value ELSE 0 END) > 500 THEN 500"));
    assert!(!sql.contains("m.value > 500"));
}

fn analytics_adapter() -> AnalyticsApiAdapter {
    AnalyticsApiAdapter::new(AnalyticsApiParams {
        endpoint: "http://127.0.0.1:9".into(),
        property_id: "123456".into(),
        access_token: "token".into(),
        experiment_dimension: "customEvent:experiment_id".into(),
        variation_dimension: "customEvent:variation_id".into(),
        timeout_secs: 1,
    })
    .unwrap()
}

#[test]
fn test_analytics_api_generates_report_request() {
    let adapter = analytics_adapter();
    let query = adapter
        .generate_query(QueryKind::ExperimentMetrics, &request())
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&query).unwrap();
    assert_eq!(parsed["request"]["dateRanges"][0]["startDate"], "2024-01-01");
    assert_eq!(
        parsed["request"]["dimensionFilter"]["filter"]["stringFilter"]["value"],
        "checkout-flow"
    );
    assert_eq!(parsed["request"]["metrics"].as_array().unwrap().len(), 3);
    assert_eq!(query, adapter.generate_metrics_query(&request()).unwrap());
}

#[test]
fn test_analytics_api_rejects_what_it_cannot_serve() {
    let adapter = analytics_adapter();

    let mut by_country = request();
    by_country.dimension = Some("exp:country".into());
    let err = adapter.generate_metrics_query(&by_country).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let mut adjusted = request();
    adjusted.regression_adjusted = true;
    let err = adapter.generate_metrics_query(&adjusted).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let err = adapter.generate_units_query(&request()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}
