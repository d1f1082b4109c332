//! Generated SQL executed by a real engine
//!
//! Exposure and metric tables are in-memory DataFusion tables, so the whole
//! CTE chain (exposure filtering, multiple-exposure exclusion, conversion
//! windows) runs for real.

mod harness;

use arrow::array::{ArrayRef, Float64Array, StringArray, TimestampNanosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, TimeZone, Utc};
use datafusion::datasource::MemTable;
use datafusion::prelude::SessionContext;
use harness::{checkout_metric, datasource, experiment, Harness, METRIC_ID};
use splitsight::adapter::drivers::DataFusionExecutor;
use splitsight::adapter::{dialect_for, ExperimentQueryRequest, QueryAdapter, SqlAdapter};
use splitsight::model::{
    AnalysisSettings, DataSourceType, MetricDefinition, MetricType, SnapshotStatus,
    StatsEngineKind,
};
use splitsight::orchestrator::CreateSnapshotRequest;
use std::sync::Arc;

fn ts(day: u32, hour: u32) -> i64 {
    let at: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap();
    at.timestamp_nanos_opt().unwrap()
}

fn timestamp_field() -> Field {
    Field::new("ts", DataType::Timestamp(TimeUnit::Nanosecond, None), false)
}

fn exposures() -> MemTable {
    let schema = Arc::new(Schema::new(vec![
        Field::new("user_id", DataType::Utf8, false),
        timestamp_field(),
        Field::new("experiment_id", DataType::Utf8, false),
        Field::new("variation_id", DataType::Utf8, false),
        Field::new("country", DataType::Utf8, false),
    ]));
    // u5 saw both arms and is excluded; u6 belongs to another experiment
    let rows = [
        ("u1", ts(2, 0), "checkout-flow", "0", "US"),
        ("u2", ts(2, 0), "checkout-flow", "0", "CA"),
        ("u3", ts(2, 0), "checkout-flow", "1", "US"),
        ("u4", ts(3, 0), "checkout-flow", "1", "US"),
        ("u5", ts(2, 0), "checkout-flow", "0", "US"),
        ("u5", ts(2, 6), "checkout-flow", "1", "US"),
        ("u6", ts(2, 0), "pricing-page", "1", "US"),
    ];
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>())),
        Arc::new(TimestampNanosecondArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| r.2).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| r.3).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| r.4).collect::<Vec<_>>())),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();
    MemTable::try_new(schema, vec![vec![batch]]).unwrap()
}

fn checkouts() -> MemTable {
    let schema = Arc::new(Schema::new(vec![
        Field::new("user_id", DataType::Utf8, false),
        timestamp_field(),
        Field::new("value", DataType::Float64, false),
    ]));
    // u2 converted before exposure; u4 converted after its 72h window
    let rows = [
        ("u1", ts(2, 1), 1.0),
        ("u2", ts(1, 12), 1.0),
        ("u3", ts(2, 5), 1.0),
        ("u4", ts(7, 0), 1.0),
        ("u5", ts(2, 1), 1.0),
    ];
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>())),
        Arc::new(TimestampNanosecondArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>())),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();
    MemTable::try_new(schema, vec![vec![batch]]).unwrap()
}

fn metric() -> MetricDefinition {
    MetricDefinition {
        sql: r#"SELECT user_id, ts AS "timestamp", value FROM checkouts"#.to_string(),
        ..checkout_metric()
    }
}

async fn harness() -> Harness {
    let ctx = SessionContext::new();
    ctx.register_table("experiment_viewed", Arc::new(exposures()))
        .unwrap();
    ctx.register_table("checkouts", Arc::new(checkouts())).unwrap();

    let h = Harness::empty(
        DataSourceType::DataFusion,
        Arc::new(DataFusionExecutor::from_context(ctx)),
    );
    let mut ds = datasource(DataSourceType::DataFusion);
    ds.settings.default_schema = None;
    ds.settings.exposure_queries[0].sql = r#"SELECT user_id, ts AS "timestamp", experiment_id, variation_id, country FROM experiment_viewed"#.to_string();
    h.seed(&ds, &experiment(), &[metric()]).await;
    h
}

#[tokio::test]
async fn test_overall_conversion_per_variation() {
    let h = harness().await;

    let mut runner = h.orchestrator.create_snapshot(h.request()).await.unwrap();
    runner.wait_for_results().await.unwrap();
    assert!(runner.error().is_none(), "{:?}", runner.error());

    let snapshot = runner.model().unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Success);
    let result = snapshot.analyses[0].metric(METRIC_ID).unwrap();
    assert_eq!(result.dimensions.len(), 1);
    let variations = &result.dimensions[0].variations;

    // Control: u1 converted, u2 only before exposure
    assert_eq!(variations[0].variation, "0");
    assert_eq!(variations[0].users, 2);
    assert!((variations[0].mean - 0.5).abs() < 1e-9);
    // Treatment: u3 converted, u4 outside the conversion window
    assert_eq!(variations[1].variation, "1");
    assert_eq!(variations[1].users, 2);
    assert!((variations[1].mean - 0.5).abs() < 1e-9);
    assert!(variations[1].uplift.unwrap().abs() < 1e-9);
}

#[tokio::test]
async fn test_exposure_dimension_splits_units() {
    let h = harness().await;

    let experiment = experiment();
    let by_country = AnalysisSettings::new(StatsEngineKind::Frequentist).with_dimension("exp:country");
    let request = CreateSnapshotRequest::new(experiment, 0, by_country);
    let mut runner = h.orchestrator.create_snapshot(request).await.unwrap();
    runner.wait_for_results().await.unwrap();
    assert!(runner.error().is_none(), "{:?}", runner.error());

    let snapshot = runner.model().unwrap();
    let result = snapshot.analyses[0].metric(METRIC_ID).unwrap();
    let names: Vec<&str> = result.dimensions.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["CA", "US"]);

    let us = &result.dimensions[1];
    assert_eq!(us.variations[0].users, 1);
    assert_eq!(us.variations[1].users, 2);
    let ca = &result.dimensions[0];
    assert_eq!(ca.variations[0].users, 1);
    // No treatment units in CA
    assert_eq!(ca.variations[1].users, 0);
}

fn purchases() -> MemTable {
    let schema = Arc::new(Schema::new(vec![
        Field::new("user_id", DataType::Utf8, false),
        timestamp_field(),
        Field::new("value", DataType::Float64, false),
    ]));
    // u1 buys twice; each purchase is under the cap, the total is not
    let rows = [
        ("u1", ts(2, 1), 1.0),
        ("u1", ts(2, 2), 1.0),
        ("u3", ts(2, 5), 1.0),
    ];
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>())),
        Arc::new(TimestampNanosecondArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>())),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();
    MemTable::try_new(schema, vec![vec![batch]]).unwrap()
}

#[tokio::test]
async fn test_cap_bounds_each_units_total() {
    let ctx = SessionContext::new();
    ctx.register_table("experiment_viewed", Arc::new(exposures()))
        .unwrap();
    ctx.register_table("purchases", Arc::new(purchases())).unwrap();
    let adapter = SqlAdapter::new(
        dialect_for(DataSourceType::DataFusion).unwrap(),
        Arc::new(DataFusionExecutor::from_context(ctx)),
    );

    let mut exposure_query = datasource(DataSourceType::DataFusion).settings.exposure_queries[0].clone();
    exposure_query.sql = r#"SELECT user_id, ts AS "timestamp", experiment_id, variation_id, country FROM experiment_viewed"#.to_string();
    let revenue = MetricDefinition {
        id: "met_revenue".to_string(),
        metric_type: MetricType::Revenue,
        sql: r#"SELECT user_id, ts AS "timestamp", value FROM purchases"#.to_string(),
        cap: Some(1.5),
        ..checkout_metric()
    };
    let request = ExperimentQueryRequest {
        tracking_key: "checkout-flow".to_string(),
        exposure_query,
        metrics: vec![revenue],
        start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end_date: Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
        dimension: None,
        regression_adjusted: false,
        covariate_lookback_hours: 336,
        default_schema: None,
    };

    let sql = adapter.generate_metrics_query(&request).unwrap();
    let mut rows = adapter.run_metrics_query(&sql).await.unwrap();
    rows.sort_by(|a, b| a.variation.cmp(&b.variation));
    assert_eq!(rows.len(), 2);

    // Control: u1 totals 2.0, capped to 1.5; u2 bought nothing
    assert_eq!(rows[0].variation, "0");
    assert_eq!(rows[0].users, 2);
    assert!((rows[0].main_sum - 1.5).abs() < 1e-9);
    assert!((rows[0].main_sum_squares - 2.25).abs() < 1e-9);
    // Treatment: u3 stays under the cap
    assert!((rows[1].main_sum - 1.0).abs() < 1e-9);
}
