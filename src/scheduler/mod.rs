//! Scheduled refreshes
//!
//! A recurring scan lists experiments and dashboards whose next update time
//! has passed and enqueues one refresh job per entity, keyed by entity type,
//! organization and id so overlapping scans never double-enqueue. A refresh
//! that fails switches that entity's automatic updates off and sends a
//! notification instead of failing again on every scan.

mod notify;
mod queue;

pub use notify::{EntityKind, LogNotifier, Notification, Notifier};
pub use queue::{
    parse_interval, EnqueueOutcome, Job, JobHandler, JobQueue, JobRequest, LocalJobQueue,
    LocalJobQueueConfig,
};

use crate::clock::Clock;
use crate::model::{
    Dashboard, DashboardBlock, DashboardUpdate, Experiment, ExperimentUpdate, SchedulingMode,
    SnapshotSettings, SnapshotTrigger,
};
use crate::orchestrator::{dedupe, telemetry, CreateSnapshotRequest, SnapshotOrchestrator};
use crate::{Error, Result};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const SCAN_JOB: &str = "refresh-scan";
pub const REFRESH_EXPERIMENT_JOB: &str = "refresh-experiment";
pub const REFRESH_DASHBOARD_JOB: &str = "refresh-dashboard";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due entities are looked for
    pub scan_interval: Duration,
    /// Delay between automatic experiment snapshots
    pub experiment_update_interval: Duration,
    /// Delay between automatic dashboard refreshes
    pub dashboard_update_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10 * 60),
            experiment_update_interval: Duration::from_secs(6 * 60 * 60),
            dashboard_update_interval: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("scan interval", self.scan_interval),
            ("experiment update interval", self.experiment_update_interval),
            ("dashboard update interval", self.dashboard_update_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}

/// Payload of refresh jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshPayload {
    pub organization: String,
    pub id: String,
}

/// Idempotency key of the refresh job for one entity.
pub fn refresh_key(entity: EntityKind, organization: &str, id: &str) -> String {
    format!("{}:{}:{}", entity.as_str(), organization, id)
}

/// What one scan did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub enqueued: usize,
    pub duplicates: usize,
}

/// A panicking refresh is a failed refresh, so it disables the entity
/// instead of panicking again on every scan.
async fn contain_panic<T>(work: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(Error::Internal(format!(
            "refresh panicked: {}",
            queue::panic_message(panic.as_ref())
        ))),
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::Config(format!("interval out of range: {}", e)))
}

pub struct RefreshScheduler {
    orchestrator: Arc<SnapshotOrchestrator>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
}

impl RefreshScheduler {
    pub fn new(
        orchestrator: Arc<SnapshotOrchestrator>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            orchestrator,
            queue,
            notifier,
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register this scheduler's handlers on `queue` and start the
    /// recurring scan.
    pub async fn install(self: &Arc<Self>, queue: &LocalJobQueue) -> Result<()> {
        for name in [SCAN_JOB, REFRESH_EXPERIMENT_JOB, REFRESH_DASHBOARD_JOB] {
            queue.register_handler(name, self.clone());
        }
        let interval = humantime::format_duration(self.config.scan_interval).to_string();
        queue.every(&interval, SCAN_JOB).await
    }

    fn experiment_due(&self, experiment: &Experiment, now: DateTime<Utc>, legacy: chrono::Duration) -> bool {
        if !experiment.is_running() || experiment.auto_snapshots != SchedulingMode::Auto {
            return false;
        }
        match (experiment.next_snapshot_attempt, experiment.last_snapshot_attempt) {
            (Some(next), _) => next <= now,
            // Documents written before next attempts were tracked
            (None, Some(last)) => now - last >= legacy,
            (None, None) => true,
        }
    }

    fn dashboard_due(dashboard: &Dashboard, now: DateTime<Utc>) -> bool {
        dashboard.enable_auto_updates && dashboard.next_update.map_or(false, |next| next <= now)
    }

    async fn enqueue_refresh(
        &self,
        job: &'static str,
        entity: EntityKind,
        organization: &str,
        id: &str,
        now: DateTime<Utc>,
        summary: &mut ScanSummary,
    ) -> Result<()> {
        let payload = serde_json::to_value(RefreshPayload {
            organization: organization.to_string(),
            id: id.to_string(),
        })?;
        let request = JobRequest::new(job, payload, now)
            .with_idempotency_key(refresh_key(entity, organization, id));
        let outcome = self.queue.enqueue(request).await?;
        queue::record_enqueue(job, outcome);
        match outcome {
            EnqueueOutcome::Enqueued => summary.enqueued += 1,
            EnqueueOutcome::Duplicate => summary.duplicates += 1,
        }
        Ok(())
    }

    /// Enqueue a refresh for every due experiment and dashboard.
    #[instrument(skip_all)]
    pub async fn scan(&self) -> Result<ScanSummary> {
        let metadata = self.orchestrator.metadata();
        let now = self.orchestrator.clock().now();
        let legacy = to_chrono(self.config.experiment_update_interval)?;
        let mut summary = ScanSummary::default();

        for experiment in metadata.list_experiments().await? {
            if self.experiment_due(&experiment, now, legacy) {
                self.enqueue_refresh(
                    REFRESH_EXPERIMENT_JOB,
                    EntityKind::Experiment,
                    &experiment.organization,
                    &experiment.id,
                    now,
                    &mut summary,
                )
                .await?;
            }
        }
        for dashboard in metadata.list_dashboards().await? {
            if Self::dashboard_due(&dashboard, now) {
                self.enqueue_refresh(
                    REFRESH_DASHBOARD_JOB,
                    EntityKind::Dashboard,
                    &dashboard.organization,
                    &dashboard.id,
                    now,
                    &mut summary,
                )
                .await?;
            }
        }

        info!(
            enqueued = summary.enqueued,
            duplicates = summary.duplicates,
            "Refresh scan finished"
        );
        Ok(summary)
    }

    /// Snapshot one experiment, then reschedule or disable it.
    ///
    /// Orchestration failures are recorded on the experiment, not returned.
    #[instrument(skip(self), fields(experiment_id = %id))]
    pub async fn refresh_experiment(&self, organization: &str, id: &str) -> Result<()> {
        let metadata = self.orchestrator.metadata();
        let Some(experiment) = metadata.get_experiment(id).await? else {
            warn!("Experiment no longer exists");
            return Ok(());
        };
        if experiment.organization != organization {
            warn!(organization = %experiment.organization, "Refresh job organization mismatch");
            return Ok(());
        }
        if !experiment.is_running() || experiment.auto_snapshots != SchedulingMode::Auto {
            debug!("Experiment no longer refreshes automatically");
            return Ok(());
        }

        let started = self.orchestrator.clock().now();
        match contain_panic(self.snapshot_experiment(&experiment)).await {
            Ok(snapshot_id) => {
                let next = started + to_chrono(self.config.experiment_update_interval)?;
                metadata
                    .update_experiment(
                        id,
                        &ExperimentUpdate {
                            next_snapshot_attempt: Some(Some(next)),
                            last_snapshot_attempt: Some(started),
                            auto_snapshot_failure: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(snapshot_id = %snapshot_id, next_attempt = %next, "Experiment refreshed");
            }
            Err(e) => {
                let reason = e.to_string();
                metadata
                    .update_experiment(
                        id,
                        &ExperimentUpdate {
                            auto_snapshots: Some(SchedulingMode::Never),
                            next_snapshot_attempt: Some(None),
                            last_snapshot_attempt: Some(started),
                            auto_snapshot_failure: Some(Some(reason.clone())),
                        },
                    )
                    .await?;
                warn!(error = %reason, "Experiment refresh failed, automatic snapshots disabled");
                self.disabled(EntityKind::Experiment, organization, id, reason)
                    .await;
            }
        }
        Ok(())
    }

    async fn snapshot_experiment(&self, experiment: &Experiment) -> Result<String> {
        let phase_index = experiment.current_phase_index().ok_or_else(|| {
            Error::InvalidRequest(format!("experiment {} has no phases", experiment.id))
        })?;
        let request = CreateSnapshotRequest::new(
            experiment.clone(),
            phase_index,
            experiment.default_analysis_settings(),
        )
        .with_trigger(SnapshotTrigger::Schedule);

        let mut runner = self.orchestrator.create_snapshot(request).await?;
        runner.wait_for_results().await?;
        if let Some(e) = runner.error() {
            return Err(Error::from_kind(
                e.kind(),
                format!("snapshot {} completed with errors: {}", runner.snapshot_id(), e),
            ));
        }
        Ok(runner.snapshot_id().to_string())
    }

    /// Refresh every experiment block of a dashboard, then reschedule or
    /// disable it.
    ///
    /// Blocks sharing a window are served by one snapshot carrying the union
    /// of their distinct analyses.
    #[instrument(skip(self), fields(dashboard_id = %id))]
    pub async fn refresh_dashboard(&self, organization: &str, id: &str) -> Result<()> {
        let metadata = self.orchestrator.metadata();
        let Some(dashboard) = metadata.get_dashboard(id).await? else {
            warn!("Dashboard no longer exists");
            return Ok(());
        };
        if dashboard.organization != organization {
            warn!(organization = %dashboard.organization, "Refresh job organization mismatch");
            return Ok(());
        }
        if !dashboard.enable_auto_updates {
            debug!("Dashboard no longer refreshes automatically");
            return Ok(());
        }

        let started = self.orchestrator.clock().now();
        let mut block_snapshots = Vec::new();
        let outcome = contain_panic(self.snapshot_blocks(&dashboard, &mut block_snapshots)).await;

        let mut update = DashboardUpdate {
            last_update: Some(started),
            block_snapshots,
            ..Default::default()
        };
        match outcome {
            Ok(has_running_experiment) => {
                update.auto_update_failure = Some(None);
                update.next_update = if has_running_experiment {
                    Some(Some(
                        started + to_chrono(self.config.dashboard_update_interval)?,
                    ))
                } else {
                    // Nothing left that changes
                    Some(None)
                };
                metadata.update_dashboard(id, &update).await?;
                info!(
                    blocks = update.block_snapshots.len(),
                    rescheduled = has_running_experiment,
                    "Dashboard refreshed"
                );
            }
            Err(e) => {
                let reason = e.to_string();
                update.enable_auto_updates = Some(false);
                update.next_update = Some(None);
                update.auto_update_failure = Some(Some(reason.clone()));
                metadata.update_dashboard(id, &update).await?;
                warn!(error = %reason, "Dashboard refresh failed, automatic updates disabled");
                self.disabled(EntityKind::Dashboard, organization, id, reason)
                    .await;
            }
        }
        Ok(())
    }

    /// Returns whether any block references a running experiment.
    async fn snapshot_blocks(
        &self,
        dashboard: &Dashboard,
        block_snapshots: &mut Vec<(String, String)>,
    ) -> Result<bool> {
        let metadata = self.orchestrator.metadata();

        // Experiment ids in first-seen order
        let mut experiment_ids: Vec<&str> = Vec::new();
        for block in dashboard.blocks.iter().filter(|b| b.needs_snapshot()) {
            if let Some(experiment_id) = block.experiment_id.as_deref() {
                if !experiment_ids.contains(&experiment_id) {
                    experiment_ids.push(experiment_id);
                }
            }
        }

        let mut has_running_experiment = false;
        for experiment_id in experiment_ids {
            let experiment = metadata.get_experiment(experiment_id).await?.ok_or_else(|| {
                Error::NotFound {
                    collection: "experiments",
                    id: experiment_id.to_string(),
                }
            })?;
            if !experiment.is_running() {
                continue;
            }
            has_running_experiment = true;

            let phase_index = experiment.current_phase_index().ok_or_else(|| {
                Error::InvalidRequest(format!("experiment {} has no phases", experiment.id))
            })?;
            let phase = &experiment.phases[phase_index];
            let default_window = SnapshotSettings {
                dimension: None,
                start_date: phase.date_started,
                end_date: phase.date_ended,
            };

            let blocks: Vec<(&DashboardBlock, SnapshotSettings)> = dashboard
                .blocks
                .iter()
                .filter(|b| b.needs_snapshot() && b.experiment_id.as_deref() == Some(experiment_id))
                .map(|b| {
                    let window = b.snapshot_settings.clone().unwrap_or_else(|| default_window.clone());
                    (b, window)
                })
                .collect();
            let requests = blocks.iter().filter_map(|(block, window)| {
                block
                    .analysis_settings
                    .clone()
                    .map(|settings| (window.clone(), settings))
            });

            for (window, analyses) in dedupe(requests) {
                let mut analyses = analyses.into_iter();
                let Some(default) = analyses.next() else {
                    continue;
                };
                let request = CreateSnapshotRequest::new(experiment.clone(), phase_index, default)
                    .with_additional(analyses.collect())
                    .with_snapshot_settings(window.clone())
                    .with_trigger(SnapshotTrigger::Dashboard);

                let mut runner = self.orchestrator.create_snapshot(request).await?;
                runner.wait_for_results().await?;
                if let Some(e) = runner.error() {
                    return Err(Error::from_kind(
                        e.kind(),
                        format!("snapshot {} completed with errors: {}", runner.snapshot_id(), e),
                    ));
                }
                for (block, block_window) in &blocks {
                    if *block_window == window {
                        block_snapshots.push((block.id.clone(), runner.snapshot_id().to_string()));
                    }
                }
            }
        }
        Ok(has_running_experiment)
    }

    async fn disabled(&self, entity: EntityKind, organization: &str, id: &str, reason: String) {
        telemetry::record_auto_refresh_disabled(entity.as_str());
        let now = self.orchestrator.clock().now();
        let notification = Notification::auto_update_disabled(organization, entity, id, reason, now);
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(error = %e, entity = %entity, entity_id = %id, "Failed to send notification");
        }
    }
}

#[async_trait]
impl JobHandler for RefreshScheduler {
    async fn handle(&self, job: &Job) -> Result<()> {
        match job.name.as_str() {
            SCAN_JOB => self.scan().await.map(|_| ()),
            REFRESH_EXPERIMENT_JOB => {
                let payload: RefreshPayload = serde_json::from_value(job.payload.clone())?;
                self.refresh_experiment(&payload.organization, &payload.id).await
            }
            REFRESH_DASHBOARD_JOB => {
                let payload: RefreshPayload = serde_json::from_value(job.payload.clone())?;
                self.refresh_dashboard(&payload.organization, &payload.id).await
            }
            other => Err(Error::Queue(format!("unknown job '{}'", other))),
        }
    }
}
