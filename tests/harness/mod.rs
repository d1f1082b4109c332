//! Shared fixtures for the integration tests
//!
//! Everything runs in-process: documents live in a `LocalMetadataClient`,
//! time is a `ManualClock`, and warehouses are scripted executors registered
//! as drivers on the adapter factory.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;
use splitsight::adapter::{AdapterFactory, ConnectionParams, PlaintextDecryptor, RawRow, SqlExecutor};
use splitsight::clock::ManualClock;
use splitsight::metadata::{LocalMetadataClient, MetadataClient, SnapshotFilter};
use splitsight::model::{
    Dashboard, DashboardUpdate, DataSource, DataSourceSettings, DataSourceType, Experiment,
    ExperimentPhase, ExperimentStatus, ExperimentUpdate, ExposureQuery, MetricDefinition,
    MetricType, QueryRecord, SchedulingMode, Snapshot, StatsEngineKind, Variation,
};
use splitsight::orchestrator::{
    CreateSnapshotRequest, OrchestratorConfig, SnapshotOrchestrator, SummaryStatistics,
};
use splitsight::tracker::{QueryTracker, TrackerConfig};
use splitsight::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const ORG: &str = "org_1";
pub const EXPERIMENT_ID: &str = "exp_1";
pub const METRIC_ID: &str = "met_checkout";
pub const DATASOURCE_ID: &str = "ds_1";

pub fn phase_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Where every harness clock starts
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
}

type Responder = Box<dyn Fn(&str) -> Result<Vec<RawRow>> + Send + Sync>;

/// Warehouse stand-in that records every statement it receives.
///
/// With a gate, each execution waits for a permit before answering, which
/// lets tests hold queries in flight.
pub struct ScriptedExecutor {
    calls: Mutex<Vec<String>>,
    respond: Responder,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedExecutor {
    pub fn new(respond: impl Fn(&str) -> Result<Vec<RawRow>> + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
            gate: None,
        }
    }

    /// Answers every statement with [`checkout_rows`].
    pub fn succeeding() -> Self {
        Self::new(|_| Ok(checkout_rows()))
    }

    pub fn failing(message: &'static str) -> Self {
        Self::new(move |_| Err(Error::Connection(message.to_string())))
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SqlExecutor for ScriptedExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<RawRow>> {
        self.calls.lock().push(sql.to_string());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
                .forget();
        }
        (self.respond)(sql)
    }
}

pub fn metric_row(
    metric_id: &str,
    variation: &str,
    dimension: &str,
    users: u64,
    main_sum: f64,
) -> RawRow {
    // Binomial: every value is 0 or 1, so the sum of squares is the sum
    json!({
        "metric_id": metric_id,
        "variation": variation,
        "dimension": dimension,
        "users": users,
        "main_sum": main_sum,
        "main_sum_squares": main_sum,
    })
    .as_object()
    .unwrap()
    .clone()
}

/// 10% conversion in control, 15% in treatment.
pub fn checkout_rows() -> Vec<RawRow> {
    vec![
        metric_row(METRIC_ID, "0", "All", 100, 10.0),
        metric_row(METRIC_ID, "1", "All", 100, 15.0),
    ]
}

pub fn experiment() -> Experiment {
    Experiment {
        id: EXPERIMENT_ID.to_string(),
        organization: ORG.to_string(),
        name: "Checkout flow".to_string(),
        tracking_key: "checkout-flow".to_string(),
        datasource_id: DATASOURCE_ID.to_string(),
        exposure_query_id: "user_exposures".to_string(),
        metric_ids: vec![METRIC_ID.to_string()],
        variations: vec![
            Variation {
                id: "var_control".to_string(),
                key: "0".to_string(),
                name: "Control".to_string(),
            },
            Variation {
                id: "var_treatment".to_string(),
                key: "1".to_string(),
                name: "Treatment".to_string(),
            },
        ],
        phases: vec![ExperimentPhase {
            name: "Main".to_string(),
            date_started: phase_start(),
            date_ended: None,
            coverage: 1.0,
            variation_weights: vec![0.5, 0.5],
        }],
        status: ExperimentStatus::Running,
        auto_snapshots: SchedulingMode::Auto,
        next_snapshot_attempt: None,
        last_snapshot_attempt: None,
        auto_snapshot_failure: None,
        regression_adjustment_enabled: false,
        stats_engine: StatsEngineKind::Frequentist,
    }
}

pub fn checkout_metric() -> MetricDefinition {
    MetricDefinition {
        id: METRIC_ID.to_string(),
        organization: ORG.to_string(),
        name: "Checkout".to_string(),
        datasource_id: DATASOURCE_ID.to_string(),
        metric_type: MetricType::Binomial,
        sql: "SELECT user_id, timestamp, 1 AS value FROM {{schema}}checkouts".to_string(),
        conversion_window_hours: 72,
        cap: None,
        inverse: false,
        event_name: None,
    }
}

pub fn datasource(kind: DataSourceType) -> DataSource {
    DataSource {
        id: DATASOURCE_ID.to_string(),
        organization: ORG.to_string(),
        kind,
        params: r#"{"driver":"custom"}"#.to_string(),
        settings: DataSourceSettings {
            default_schema: Some("analytics".to_string()),
            exposure_queries: vec![ExposureQuery {
                id: "user_exposures".to_string(),
                sql: "SELECT user_id, timestamp, experiment_id, variation_id, country FROM {{schema}}experiment_viewed".to_string(),
                dimensions: vec!["country".to_string()],
            }],
        },
        date_updated: phase_start(),
    }
}

/// Local store whose query creation starts failing after `allowed` records,
/// and whose query reads fail while `reads_failing` is set.
pub struct FailingQueryStore {
    inner: Arc<LocalMetadataClient>,
    allowed: AtomicUsize,
    reads_failing: Arc<AtomicBool>,
    panic_on_snapshots: bool,
}

impl FailingQueryStore {
    pub fn new(inner: Arc<LocalMetadataClient>, allowed: usize) -> Self {
        Self {
            inner,
            allowed: AtomicUsize::new(allowed),
            reads_failing: Arc::new(AtomicBool::new(false)),
            panic_on_snapshots: false,
        }
    }

    /// Snapshot creation panics instead of returning an error
    pub fn panicking_on_snapshots(mut self) -> Self {
        self.panic_on_snapshots = true;
        self
    }

    pub fn with_read_switch(mut self, switch: Arc<AtomicBool>) -> Self {
        self.reads_failing = switch;
        self
    }
}

#[async_trait]
impl MetadataClient for FailingQueryStore {
    async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        self.inner.get_experiment(id).await
    }
    async fn put_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.inner.put_experiment(experiment).await
    }
    async fn update_experiment(&self, id: &str, update: &ExperimentUpdate) -> Result<Experiment> {
        self.inner.update_experiment(id, update).await
    }
    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        self.inner.list_experiments().await
    }
    async fn get_metric(&self, id: &str) -> Result<Option<MetricDefinition>> {
        self.inner.get_metric(id).await
    }
    async fn put_metric(&self, metric: &MetricDefinition) -> Result<()> {
        self.inner.put_metric(metric).await
    }
    async fn get_datasource(&self, id: &str) -> Result<Option<DataSource>> {
        self.inner.get_datasource(id).await
    }
    async fn put_datasource(&self, datasource: &DataSource) -> Result<()> {
        self.inner.put_datasource(datasource).await
    }
    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        if self.panic_on_snapshots {
            panic!("snapshot store unavailable");
        }
        self.inner.create_snapshot(snapshot).await
    }
    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        self.inner.get_snapshot(id).await
    }
    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.inner.update_snapshot(snapshot).await
    }
    async fn find_snapshots_by_experiment(
        &self,
        experiment_id: &str,
        filter: &SnapshotFilter,
    ) -> Result<Vec<Snapshot>> {
        self.inner
            .find_snapshots_by_experiment(experiment_id, filter)
            .await
    }
    async fn create_query(&self, query: &QueryRecord) -> Result<()> {
        let remaining = self
            .allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_err() {
            return Err(Error::Metadata("transient store error".to_string()));
        }
        self.inner.create_query(query).await
    }
    async fn get_query(&self, id: &str) -> Result<Option<QueryRecord>> {
        if self.reads_failing.load(Ordering::SeqCst) {
            return Err(Error::Metadata("transient read error".to_string()));
        }
        self.inner.get_query(id).await
    }
    async fn update_query(&self, query: &QueryRecord, expected_version: u64) -> Result<QueryRecord> {
        self.inner.update_query(query, expected_version).await
    }
    async fn find_queries_by_snapshot(&self, snapshot_id: &str) -> Result<Vec<QueryRecord>> {
        self.inner.find_queries_by_snapshot(snapshot_id).await
    }
    async fn get_dashboard(&self, id: &str) -> Result<Option<Dashboard>> {
        self.inner.get_dashboard(id).await
    }
    async fn put_dashboard(&self, dashboard: &Dashboard) -> Result<()> {
        self.inner.put_dashboard(dashboard).await
    }
    async fn update_dashboard(&self, id: &str, update: &DashboardUpdate) -> Result<Dashboard> {
        self.inner.update_dashboard(id, update).await
    }
    async fn list_dashboards(&self) -> Result<Vec<Dashboard>> {
        self.inner.list_dashboards().await
    }
}

pub fn tracker_config() -> TrackerConfig {
    TrackerConfig {
        liveness_threshold: Duration::from_secs(120),
        // Longer than any test runs, so only explicit heartbeats happen
        heartbeat_interval: Duration::from_secs(60),
    }
}

pub fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_millis(10),
        max_wait: Some(Duration::from_secs(10)),
        ..Default::default()
    }
}

pub struct Harness {
    pub metadata: Arc<LocalMetadataClient>,
    pub clock: Arc<ManualClock>,
    pub tracker: Arc<QueryTracker>,
    pub orchestrator: Arc<SnapshotOrchestrator>,
}

impl Harness {
    /// A Postgres data source served by `executor`, seeded with the
    /// checkout experiment.
    pub async fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self::with_config(executor, orchestrator_config()).await
    }

    pub async fn with_config(executor: Arc<dyn SqlExecutor>, config: OrchestratorConfig) -> Self {
        let harness = Self::empty_with_config(DataSourceType::Postgres, executor, config);
        harness
            .seed(&datasource(DataSourceType::Postgres), &experiment(), &[checkout_metric()])
            .await;
        harness
    }

    /// No documents; `executor` serves every data source of type `kind`.
    pub fn empty(kind: DataSourceType, executor: Arc<dyn SqlExecutor>) -> Self {
        Self::empty_with_config(kind, executor, orchestrator_config())
    }

    pub fn empty_with_config(
        kind: DataSourceType,
        executor: Arc<dyn SqlExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        let metadata = Arc::new(LocalMetadataClient::new());
        Self::build(kind, executor, config, metadata.clone(), metadata)
    }

    /// Seeded like [`Harness::new`], but the engine reads and writes through
    /// `wrap(local store)`; `metadata` still exposes the local store.
    pub async fn with_store(
        executor: Arc<dyn SqlExecutor>,
        wrap: impl FnOnce(Arc<LocalMetadataClient>) -> Arc<dyn MetadataClient>,
    ) -> Self {
        let metadata = Arc::new(LocalMetadataClient::new());
        let store = wrap(metadata.clone());
        let harness = Self::build(
            DataSourceType::Postgres,
            executor,
            orchestrator_config(),
            store,
            metadata,
        );
        harness
            .seed(&datasource(DataSourceType::Postgres), &experiment(), &[checkout_metric()])
            .await;
        harness
    }

    fn build(
        kind: DataSourceType,
        executor: Arc<dyn SqlExecutor>,
        config: OrchestratorConfig,
        store: Arc<dyn MetadataClient>,
        metadata: Arc<LocalMetadataClient>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(test_now()));

        let mut adapters = AdapterFactory::new(Arc::new(PlaintextDecryptor));
        adapters.register_driver(
            kind,
            Arc::new(
                move |_params: Arc<ConnectionParams>| -> Result<Arc<dyn SqlExecutor>> {
                    Ok(executor.clone())
                },
            ),
        );

        let tracker = Arc::new(
            QueryTracker::new(store.clone(), clock.clone(), tracker_config()).unwrap(),
        );
        let orchestrator = Arc::new(
            SnapshotOrchestrator::new(
                store,
                Arc::new(adapters),
                tracker.clone(),
                Arc::new(SummaryStatistics),
                clock.clone(),
                config,
            )
            .unwrap(),
        );

        Self {
            metadata,
            clock,
            tracker,
            orchestrator,
        }
    }

    pub async fn seed(
        &self,
        datasource: &DataSource,
        experiment: &Experiment,
        metrics: &[MetricDefinition],
    ) {
        self.metadata.put_datasource(datasource).await.unwrap();
        for metric in metrics {
            self.metadata.put_metric(metric).await.unwrap();
        }
        self.metadata.put_experiment(experiment).await.unwrap();
    }

    /// Default analysis of the current phase of the checkout experiment
    pub fn request(&self) -> CreateSnapshotRequest {
        let experiment = experiment();
        let default = experiment.default_analysis_settings();
        CreateSnapshotRequest::new(experiment, 0, default)
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }
}
