//! Snapshot orchestration
//!
//! [`SnapshotOrchestrator::create_snapshot`] decides whether an existing
//! snapshot already answers a request. If not, it persists a new snapshot,
//! partitions the requested analyses into extraction groups (analyses with
//! the same dimension and regression adjustment read the same raw rows),
//! submits one query per group and hands back a [`QueryRunner`].
//!
//! All queries of a snapshot are submitted before any is awaited. The runner
//! polls the tracker, so liveness reclassification applies to its reads, and
//! assembles analyses once every query is terminal. Nothing is retried here;
//! callers decide.

pub mod dedup;
mod stats;
pub(crate) mod telemetry;

pub use dedup::{dedupe, flatten};
pub use stats::{AnalysisInput, StatsEngine, SummaryStatistics};

use crate::adapter::{AdapterFactory, ExperimentQueryRequest, QueryAdapter};
use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::metadata::{MetadataClient, SnapshotFilter};
use crate::model::{
    Analysis, AnalysisSettings, AnalysisStatus, DashboardBlock, Experiment, MetricDefinition,
    QueryKind, QueryPointer, QueryRecord, QueryStatus, Snapshot, SnapshotSettings, SnapshotStatus,
    SnapshotTrigger, Variation,
};
use crate::tracker::{NewQuery, QueryTracker};
use crate::{Error, Result};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Delay between status reads while waiting for queries
    pub poll_interval: Duration,
    /// Pre-exposure window read for regression-adjustment covariates
    pub covariate_lookback_hours: u32,
    /// Give up waiting after this long; `None` waits until the tracker
    /// resolves every query, which the liveness rule bounds
    pub max_wait: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            covariate_lookback_hours: 14 * 24,
            max_wait: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Input to [`SnapshotOrchestrator::create_snapshot`]
#[derive(Debug, Clone)]
pub struct CreateSnapshotRequest {
    pub experiment: Experiment,
    pub phase_index: usize,
    pub default_analysis_settings: AnalysisSettings,
    pub additional_analysis_settings: Vec<AnalysisSettings>,
    /// Extraction window; defaults to the phase's own window
    pub snapshot_settings: Option<SnapshotSettings>,
    pub use_cache: bool,
    pub trigger: SnapshotTrigger,
}

impl CreateSnapshotRequest {
    pub fn new(
        experiment: Experiment,
        phase_index: usize,
        default_analysis_settings: AnalysisSettings,
    ) -> Self {
        Self {
            experiment,
            phase_index,
            default_analysis_settings,
            additional_analysis_settings: Vec::new(),
            snapshot_settings: None,
            use_cache: false,
            trigger: SnapshotTrigger::Manual,
        }
    }

    pub fn with_additional(mut self, settings: Vec<AnalysisSettings>) -> Self {
        self.additional_analysis_settings = settings;
        self
    }

    pub fn with_snapshot_settings(mut self, settings: SnapshotSettings) -> Self {
        self.snapshot_settings = Some(settings);
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_trigger(mut self, trigger: SnapshotTrigger) -> Self {
        self.trigger = trigger;
        self
    }
}

/// Analyses served by one raw extraction
#[derive(Debug, Clone, PartialEq)]
struct ExtractionGroup {
    key: String,
    dimension: Option<String>,
    regression_adjusted: bool,
}

fn group_key(settings: &AnalysisSettings) -> String {
    format!(
        "{}/{}",
        settings.dimension.as_deref().unwrap_or("none"),
        if settings.regression_adjusted {
            "adjusted"
        } else {
            "unadjusted"
        }
    )
}

/// Distinct extraction groups in first-seen order.
fn extraction_groups(analyses: &[Analysis]) -> Vec<ExtractionGroup> {
    let mut groups: Vec<ExtractionGroup> = Vec::new();
    for analysis in analyses {
        let key = group_key(&analysis.settings);
        if groups.iter().all(|g| g.key != key) {
            groups.push(ExtractionGroup {
                key,
                dimension: analysis.settings.dimension.clone(),
                regression_adjusted: analysis.settings.regression_adjusted,
            });
        }
    }
    groups
}

/// Whether `snapshot` already answers what `block` renders.
pub fn snapshot_satisfies(snapshot: &Snapshot, block: &DashboardBlock) -> bool {
    let (Some(experiment_id), Some(settings)) = (&block.experiment_id, &block.analysis_settings)
    else {
        return false;
    };
    if &snapshot.experiment_id != experiment_id || snapshot.status != SnapshotStatus::Success {
        return false;
    }
    if let Some(window) = &block.snapshot_settings {
        if !snapshot.settings.same_window(window) {
            return false;
        }
    }
    let fp = fingerprint(experiment_id, snapshot.phase_index, settings);
    snapshot.covers(std::iter::once(&fp))
}

struct Shared {
    metadata: Arc<dyn MetadataClient>,
    adapters: Arc<AdapterFactory>,
    tracker: Arc<QueryTracker>,
    stats: Arc<dyn StatsEngine>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl Shared {
    /// Most recent successful snapshot reading the same window and metrics
    /// whose successful analyses cover every fingerprint.
    async fn find_reusable(
        &self,
        experiment_id: &str,
        phase_index: usize,
        window: &SnapshotSettings,
        metric_ids: &[String],
        fingerprints: &[Fingerprint],
    ) -> Result<Option<Snapshot>> {
        let filter = SnapshotFilter::phase(phase_index).with_status(SnapshotStatus::Success);
        let candidates = self
            .metadata
            .find_snapshots_by_experiment(experiment_id, &filter)
            .await?;
        Ok(candidates.into_iter().find(|s| {
            s.settings.same_window(window) && s.has_metrics(metric_ids) && s.covers(fingerprints)
        }))
    }

    /// Best effort; the caller is already returning the original error.
    async fn persist_failed(&self, snapshot: &Snapshot) {
        if let Err(e) = self.metadata.update_snapshot(snapshot).await {
            warn!(snapshot_id = %snapshot.id, error = %e, "Failed to persist failed snapshot");
        }
    }
}

pub struct SnapshotOrchestrator {
    shared: Arc<Shared>,
}

impl SnapshotOrchestrator {
    pub fn new(
        metadata: Arc<dyn MetadataClient>,
        adapters: Arc<AdapterFactory>,
        tracker: Arc<QueryTracker>,
        stats: Arc<dyn StatsEngine>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                metadata,
                adapters,
                tracker,
                stats,
                clock,
                config,
            }),
        })
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataClient> {
        &self.shared.metadata
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    /// Find or start a snapshot answering `request`.
    ///
    /// Errors returned here happen before any query is submitted. Once the
    /// snapshot document exists, a failure also writes it back as
    /// `completed_with_errors` so it never stays running.
    #[instrument(
        skip_all,
        fields(
            experiment_id = %request.experiment.id,
            phase = request.phase_index,
            trigger = request.trigger.as_str(),
        )
    )]
    pub async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<QueryRunner> {
        let shared = &self.shared;
        let experiment = &request.experiment;
        let phase_index = request.phase_index;
        let phase = experiment.phase(phase_index).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "experiment {} has no phase {}",
                experiment.id, phase_index
            ))
        })?;

        let settings = dedup::unique_analyses(
            std::iter::once(request.default_analysis_settings.clone())
                .chain(request.additional_analysis_settings.iter().cloned()),
        );
        let fingerprints: Vec<Fingerprint> = settings
            .iter()
            .map(|s| fingerprint(&experiment.id, phase_index, s))
            .collect();
        let window = request.snapshot_settings.clone().unwrap_or_else(|| SnapshotSettings {
            dimension: request.default_analysis_settings.dimension.clone(),
            start_date: phase.date_started,
            end_date: phase.date_ended,
        });

        if request.use_cache {
            if let Some(existing) = shared
                .find_reusable(
                    &experiment.id,
                    phase_index,
                    &window,
                    &experiment.metric_ids,
                    &fingerprints,
                )
                .await?
            {
                info!(snapshot_id = %existing.id, "Reusing existing snapshot");
                telemetry::record_cache_hit();
                return Ok(QueryRunner::resolved(shared.clone(), experiment, existing));
            }
        }

        let datasource = shared
            .metadata
            .get_datasource(&experiment.datasource_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                collection: "datasources",
                id: experiment.datasource_id.clone(),
            })?;
        let exposure_query = datasource
            .exposure_query(&experiment.exposure_query_id)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "data source {} has no exposure query {}",
                    datasource.id, experiment.exposure_query_id
                ))
            })?;
        let metrics = self.load_metrics(experiment).await?;
        let adapter = shared.adapters.adapter_for(&datasource).await?;

        let now = shared.clock.now();
        let mut snapshot = Snapshot {
            id: format!("snp_{}", uuid::Uuid::new_v4().simple()),
            organization: experiment.organization.clone(),
            experiment_id: experiment.id.clone(),
            phase_index,
            trigger: request.trigger,
            settings: window.clone(),
            metric_ids: experiment.metric_ids.clone(),
            analyses: settings
                .into_iter()
                .zip(fingerprints.iter().cloned())
                .map(|(s, fp)| Analysis::pending(s, fp))
                .collect(),
            queries: Vec::new(),
            status: SnapshotStatus::Running,
            error: None,
            date_created: now,
            run_started: now,
        };
        shared.metadata.create_snapshot(&snapshot).await?;

        let base = ExperimentQueryRequest {
            tracking_key: experiment.tracking_key.clone(),
            exposure_query,
            metrics: metrics.clone(),
            start_date: window.start_date,
            end_date: window.end_date.unwrap_or(now),
            dimension: None,
            regression_adjusted: false,
            covariate_lookback_hours: shared.config.covariate_lookback_hours,
            default_schema: datasource.settings.default_schema.clone(),
        };

        let mut submit = Vec::new();
        let created = async {
            for group in extraction_groups(&snapshot.analyses) {
                let query_request = ExperimentQueryRequest {
                    dimension: group.dimension.clone(),
                    regression_adjusted: group.regression_adjusted,
                    ..base.clone()
                };
                let generated = adapter.generate_query(QueryKind::ExperimentMetrics, &query_request);
                let record = shared
                    .tracker
                    .create(NewQuery {
                        organization: snapshot.organization.clone(),
                        snapshot_id: snapshot.id.clone(),
                        kind: QueryKind::ExperimentMetrics,
                        backend: adapter.backend(),
                        group: group.key.clone(),
                        query: generated.as_ref().cloned().unwrap_or_default(),
                    })
                    .await?;
                snapshot.queries.push(QueryPointer {
                    query_id: record.id.clone(),
                    group: group.key,
                });
                match generated {
                    Ok(_) => submit.push(record),
                    // Generation failures are recorded like backend failures so
                    // sibling groups still run
                    Err(e) => {
                        shared.tracker.fail(&record.id, &e).await?;
                    }
                }
            }
            shared.metadata.update_snapshot(&snapshot).await
        }
        .await;
        if let Err(e) = created {
            // Nothing was submitted yet; close out what was written so the
            // snapshot does not sit in running forever
            for record in &submit {
                if let Err(fail_err) = shared.tracker.fail(&record.id, &e).await {
                    warn!(query_id = %record.id, error = %fail_err, "Failed to close out query");
                }
            }
            mark_failed(&mut snapshot, &e);
            shared.persist_failed(&snapshot).await;
            return Err(e);
        }

        let submitted = snapshot.queries.len();
        for record in submit {
            spawn_execution(shared.tracker.clone(), adapter.clone(), record);
        }

        telemetry::record_snapshot_created(request.trigger.as_str());
        info!(
            snapshot_id = %snapshot.id,
            analyses = snapshot.analyses.len(),
            queries = submitted,
            "Snapshot created"
        );

        Ok(QueryRunner {
            shared: shared.clone(),
            snapshot,
            variations: experiment.variations.clone(),
            metrics,
            reuse_on_failure: request.use_cache,
            submitted,
            error: None,
        })
    }

    async fn load_metrics(&self, experiment: &Experiment) -> Result<Vec<MetricDefinition>> {
        let mut metrics = Vec::with_capacity(experiment.metric_ids.len());
        for id in &experiment.metric_ids {
            let metric = self
                .shared
                .metadata
                .get_metric(id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    collection: "metrics",
                    id: id.clone(),
                })?;
            if metric.datasource_id != experiment.datasource_id {
                return Err(Error::InvalidRequest(format!(
                    "metric {} reads data source {}, experiment {} uses {}",
                    metric.id, metric.datasource_id, experiment.id, experiment.datasource_id
                )));
            }
            metrics.push(metric);
        }
        Ok(metrics)
    }
}

/// Resolve a snapshot that could not run to completion.
fn mark_failed(snapshot: &mut Snapshot, error: &Error) {
    for analysis in &mut snapshot.analyses {
        if analysis.status == AnalysisStatus::Running {
            analysis.status = AnalysisStatus::Error;
            analysis.error = Some(error.to_string());
        }
    }
    snapshot.status = SnapshotStatus::CompletedWithErrors;
    snapshot.error = Some(error.to_string());
}

fn spawn_execution(tracker: Arc<QueryTracker>, adapter: Arc<dyn QueryAdapter>, record: QueryRecord) {
    tokio::spawn(async move {
        let work = adapter.run_query(record.kind, &record.query);
        if let Err(e) = tracker.execute(&record, work).await {
            // The record stays running; readers reclassify it once the
            // heartbeat ages out
            warn!(query_id = %record.id, error = %e, "Failed to persist query outcome");
        }
    });
}

/// Handle on a snapshot whose queries may still be running
pub struct QueryRunner {
    shared: Arc<Shared>,
    snapshot: Snapshot,
    variations: Vec<Variation>,
    metrics: Vec<MetricDefinition>,
    reuse_on_failure: bool,
    submitted: usize,
    error: Option<Error>,
}

impl QueryRunner {
    fn resolved(shared: Arc<Shared>, experiment: &Experiment, snapshot: Snapshot) -> Self {
        Self {
            shared,
            snapshot,
            variations: experiment.variations.clone(),
            metrics: Vec::new(),
            reuse_on_failure: false,
            submitted: 0,
            error: None,
        }
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot.id
    }

    /// Queries this runner created; zero when an existing snapshot was reused
    pub fn submitted_queries(&self) -> usize {
        self.submitted
    }

    pub fn is_resolved(&self) -> bool {
        self.snapshot.is_resolved()
    }

    /// The snapshot, once every query has resolved
    pub fn model(&self) -> Option<&Snapshot> {
        self.snapshot.is_resolved().then_some(&self.snapshot)
    }

    pub fn into_model(self) -> Option<Snapshot> {
        self.snapshot.is_resolved().then_some(self.snapshot)
    }

    /// First failure behind a `completed_with_errors` snapshot
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Wait until every query is terminal, then assemble and persist the
    /// analyses.
    ///
    /// When the runner was created with `use_cache` and this snapshot ends
    /// `completed_with_errors`, a successful equivalent snapshot written
    /// meanwhile by a concurrent request replaces it, and [`Self::error`]
    /// is cleared. Giving up after `max_wait` persists this snapshot as
    /// `completed_with_errors` and returns [`Error::Timeout`].
    #[instrument(skip_all, fields(snapshot_id = %self.snapshot.id))]
    pub async fn wait_for_results(&mut self) -> Result<()> {
        if self.snapshot.is_resolved() {
            return Ok(());
        }

        let started = Instant::now();
        let resolved = async {
            let records = self.poll_until_terminal(started).await?;
            self.assemble(&records);
            self.shared.metadata.update_snapshot(&self.snapshot).await
        }
        .await;
        if let Err(e) = resolved {
            // Never leave the stored snapshot looking in flight
            mark_failed(&mut self.snapshot, &e);
            self.shared.persist_failed(&self.snapshot).await;
            telemetry::record_snapshot_resolved("completed_with_errors");
            if matches!(e, Error::Timeout) {
                self.error = Some(Error::Timeout);
            }
            return Err(e);
        }
        let status = match self.snapshot.status {
            SnapshotStatus::Success => "success",
            _ => "completed_with_errors",
        };
        telemetry::record_snapshot_resolved(status);
        info!(status, elapsed = ?started.elapsed(), "Snapshot resolved");

        if self.snapshot.status == SnapshotStatus::CompletedWithErrors && self.reuse_on_failure {
            // A concurrent equivalent request may have finished first
            let fingerprints: Vec<Fingerprint> = self
                .snapshot
                .analyses
                .iter()
                .map(|a| a.fingerprint.clone())
                .collect();
            if let Some(existing) = self
                .shared
                .find_reusable(
                    &self.snapshot.experiment_id,
                    self.snapshot.phase_index,
                    &self.snapshot.settings,
                    &self.snapshot.metric_ids,
                    &fingerprints,
                )
                .await?
            {
                info!(
                    failed_snapshot_id = %self.snapshot.id,
                    snapshot_id = %existing.id,
                    "Preferring concurrently completed snapshot"
                );
                self.snapshot = existing;
                self.error = None;
            }
        }
        Ok(())
    }

    async fn poll_until_terminal(&self, started: Instant) -> Result<Vec<QueryRecord>> {
        let ids: Vec<String> = self
            .snapshot
            .queries
            .iter()
            .map(|q| q.query_id.clone())
            .collect();
        loop {
            let records = self.shared.tracker.get_many(&ids).await?;
            if records.len() != ids.len() {
                return Err(Error::Internal(format!(
                    "snapshot {} references {} queries, {} found",
                    self.snapshot.id,
                    ids.len(),
                    records.len()
                )));
            }
            if records.iter().all(|r| r.status.is_terminal()) {
                return Ok(records);
            }
            if let Some(max_wait) = self.shared.config.max_wait {
                if started.elapsed() >= max_wait {
                    warn!(waited = ?started.elapsed(), "Gave up waiting for queries");
                    return Err(Error::Timeout);
                }
            }
            debug!(
                pending = records.iter().filter(|r| !r.status.is_terminal()).count(),
                "Waiting for queries"
            );
            tokio::time::sleep(self.shared.config.poll_interval).await;
        }
    }

    fn assemble(&mut self, records: &[QueryRecord]) {
        let by_id: HashMap<&str, &QueryRecord> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut first_error: Option<Error> = None;

        for pointer in &self.snapshot.queries {
            let Some(record) = by_id.get(pointer.query_id.as_str()) else {
                continue;
            };
            for analysis in self
                .snapshot
                .analyses
                .iter_mut()
                .filter(|a| group_key(&a.settings) == pointer.group)
            {
                match record.status {
                    QueryStatus::Succeeded => {
                        let rows = record
                            .result
                            .as_ref()
                            .map(|r| r.metric_rows())
                            .unwrap_or(&[]);
                        let input = AnalysisInput {
                            settings: &analysis.settings,
                            variations: &self.variations,
                            metrics: &self.metrics,
                            rows,
                        };
                        match self.shared.stats.analyze(&input) {
                            Ok(results) => {
                                analysis.status = AnalysisStatus::Success;
                                analysis.results = results;
                            }
                            Err(e) => {
                                analysis.status = AnalysisStatus::Error;
                                analysis.error = Some(e.to_string());
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                    QueryStatus::Failed => {
                        let message = record
                            .error
                            .clone()
                            .unwrap_or_else(|| "query failed".to_string());
                        analysis.status = AnalysisStatus::Error;
                        analysis.error = Some(message.clone());
                        if first_error.is_none() {
                            first_error = Some(Error::from_kind(
                                record.error_kind.unwrap_or(ErrorKind::Internal),
                                message,
                            ));
                        }
                    }
                    QueryStatus::Running => {}
                }
            }
        }

        for analysis in &mut self.snapshot.analyses {
            if analysis.status == AnalysisStatus::Running {
                analysis.status = AnalysisStatus::Error;
                analysis.error = Some("no query produced this analysis".to_string());
            }
        }

        let all_succeeded = self
            .snapshot
            .analyses
            .iter()
            .all(|a| a.status == AnalysisStatus::Success);
        if all_succeeded {
            self.snapshot.status = SnapshotStatus::Success;
        } else {
            self.snapshot.status = SnapshotStatus::CompletedWithErrors;
            let error = first_error.unwrap_or_else(|| {
                Error::Internal("snapshot completed with errors".to_string())
            });
            self.snapshot.error = Some(error.to_string());
            self.error = Some(error);
        }
    }
}
