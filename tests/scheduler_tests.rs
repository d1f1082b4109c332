//! Scheduled refreshes: due detection, idempotent enqueue, rescheduling and
//! disable-on-failure.

mod harness;

use async_trait::async_trait;
use harness::{
    experiment, test_now, FailingQueryStore, Harness, ScriptedExecutor, EXPERIMENT_ID, ORG,
};
use parking_lot::Mutex;
use splitsight::metadata::MetadataClient;
use splitsight::model::{
    AnalysisSettings, BlockKind, Dashboard, DashboardBlock, ExperimentStatus, SchedulingMode,
    SnapshotTrigger, StatsEngineKind,
};
use splitsight::scheduler::{
    EntityKind, JobQueue, LocalJobQueue, LocalJobQueueConfig, Notification, Notifier,
    RefreshScheduler, SchedulerConfig, ScanSummary,
};
use splitsight::Result;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.sent.lock().push(notification);
        Ok(())
    }
}

struct Setup {
    h: Harness,
    executor: Arc<ScriptedExecutor>,
    queue: LocalJobQueue,
    notifier: Arc<RecordingNotifier>,
    scheduler: Arc<RefreshScheduler>,
}

async fn setup(executor: ScriptedExecutor) -> Setup {
    let executor = Arc::new(executor);
    let h = Harness::new(executor.clone()).await;
    setup_with(h, executor)
}

fn setup_with(h: Harness, executor: Arc<ScriptedExecutor>) -> Setup {
    let queue = LocalJobQueue::new(
        LocalJobQueueConfig {
            workers: 2,
            idle_poll_interval: Duration::from_millis(10),
        },
        h.clock.clone(),
    )
    .unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let scheduler = Arc::new(
        RefreshScheduler::new(
            h.orchestrator.clone(),
            Arc::new(queue.clone()),
            notifier.clone(),
            SchedulerConfig::default(),
        )
        .unwrap(),
    );
    Setup {
        h,
        executor,
        queue,
        notifier,
        scheduler,
    }
}

fn six_hours() -> chrono::Duration {
    chrono::Duration::hours(6)
}

#[tokio::test]
async fn test_overlapping_scans_enqueue_once() {
    let s = setup(ScriptedExecutor::succeeding()).await;

    let first = s.scheduler.scan().await.unwrap();
    assert_eq!(
        first,
        ScanSummary {
            enqueued: 1,
            duplicates: 0
        }
    );
    let second = s.scheduler.scan().await.unwrap();
    assert_eq!(
        second,
        ScanSummary {
            enqueued: 0,
            duplicates: 1
        }
    );
    assert_eq!(s.queue.pending_len(), 1);
}

#[tokio::test]
async fn test_refresh_reschedules_on_success() {
    let s = setup(ScriptedExecutor::succeeding()).await;
    for name in [
        splitsight::scheduler::SCAN_JOB,
        splitsight::scheduler::REFRESH_EXPERIMENT_JOB,
    ] {
        s.queue.register_handler(name, s.scheduler.clone());
    }

    s.scheduler.scan().await.unwrap();
    assert_eq!(s.queue.run_pending().await, 1);
    assert_eq!(s.executor.calls().len(), 1);

    let updated = s.h.metadata.get_experiment(EXPERIMENT_ID).await.unwrap().unwrap();
    assert_eq!(updated.auto_snapshots, SchedulingMode::Auto);
    assert_eq!(updated.last_snapshot_attempt, Some(test_now()));
    assert_eq!(updated.next_snapshot_attempt, Some(test_now() + six_hours()));
    assert!(updated.auto_snapshot_failure.is_none());

    let snapshots = s
        .h
        .metadata
        .find_snapshots_by_experiment(EXPERIMENT_ID, &Default::default())
        .await
        .unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].trigger, SnapshotTrigger::Schedule);

    // Not due again until the next attempt time; the key was released
    assert_eq!(s.scheduler.scan().await.unwrap().enqueued, 0);
    s.h.advance(six_hours());
    assert_eq!(s.scheduler.scan().await.unwrap().enqueued, 1);
}

#[tokio::test]
async fn test_refresh_failure_disables_and_notifies() {
    let s = setup(ScriptedExecutor::failing("warehouse unreachable")).await;

    s.scheduler.refresh_experiment(ORG, EXPERIMENT_ID).await.unwrap();

    let updated = s.h.metadata.get_experiment(EXPERIMENT_ID).await.unwrap().unwrap();
    assert_eq!(updated.auto_snapshots, SchedulingMode::Never);
    assert!(updated.next_snapshot_attempt.is_none());
    assert_eq!(updated.last_snapshot_attempt, Some(test_now()));
    assert!(updated
        .auto_snapshot_failure
        .as_deref()
        .unwrap()
        .contains("warehouse unreachable"));

    let sent = s.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].entity, EntityKind::Experiment);
    assert_eq!(sent[0].entity_id, EXPERIMENT_ID);
    assert_eq!(sent[0].organization, ORG);
    assert_eq!(sent[0].event, Notification::AUTO_UPDATE_DISABLED);

    // Disabled experiments drop out of later scans
    s.h.advance(chrono::Duration::days(1));
    assert_eq!(s.scheduler.scan().await.unwrap().enqueued, 0);
}

#[tokio::test]
async fn test_panicking_refresh_disables_instead_of_looping() {
    let executor = Arc::new(ScriptedExecutor::succeeding());
    let h = Harness::with_store(executor.clone(), |local| {
        Arc::new(FailingQueryStore::new(local, usize::MAX).panicking_on_snapshots())
    })
    .await;
    let s = setup_with(h, executor);
    for name in [
        splitsight::scheduler::SCAN_JOB,
        splitsight::scheduler::REFRESH_EXPERIMENT_JOB,
    ] {
        s.queue.register_handler(name, s.scheduler.clone());
    }

    s.scheduler.scan().await.unwrap();
    assert_eq!(s.queue.run_pending().await, 1);

    let updated = s.h.metadata.get_experiment(EXPERIMENT_ID).await.unwrap().unwrap();
    assert_eq!(updated.auto_snapshots, SchedulingMode::Never);
    assert!(updated.next_snapshot_attempt.is_none());
    assert!(updated
        .auto_snapshot_failure
        .as_deref()
        .unwrap()
        .contains("snapshot store unavailable"));
    assert_eq!(s.notifier.sent().len(), 1);

    s.h.advance(chrono::Duration::days(1));
    assert_eq!(s.scheduler.scan().await.unwrap().enqueued, 0);
}

#[tokio::test]
async fn test_only_running_auto_experiments_are_due() {
    let s = setup(ScriptedExecutor::succeeding()).await;

    let mut stopped = experiment();
    stopped.id = "exp_stopped".into();
    stopped.status = ExperimentStatus::Stopped;
    s.h.metadata.put_experiment(&stopped).await.unwrap();

    let mut manual = experiment();
    manual.id = "exp_manual".into();
    manual.auto_snapshots = SchedulingMode::Never;
    s.h.metadata.put_experiment(&manual).await.unwrap();

    let mut later = experiment();
    later.id = "exp_later".into();
    later.next_snapshot_attempt = Some(test_now() + chrono::Duration::minutes(5));
    s.h.metadata.put_experiment(&later).await.unwrap();

    // Only exp_1, which has never been attempted
    assert_eq!(s.scheduler.scan().await.unwrap().enqueued, 1);
}

#[tokio::test]
async fn test_legacy_experiments_use_last_attempt() {
    let s = setup(ScriptedExecutor::succeeding()).await;

    let mut recent = experiment();
    recent.last_snapshot_attempt = Some(test_now() - chrono::Duration::hours(1));
    s.h.metadata.put_experiment(&recent).await.unwrap();
    assert_eq!(s.scheduler.scan().await.unwrap().enqueued, 0);

    s.h.advance(six_hours());
    assert_eq!(s.scheduler.scan().await.unwrap().enqueued, 1);
}

#[tokio::test]
async fn test_refresh_for_other_organization_is_ignored() {
    let s = setup(ScriptedExecutor::succeeding()).await;

    s.scheduler
        .refresh_experiment("org_other", EXPERIMENT_ID)
        .await
        .unwrap();
    assert!(s.executor.calls().is_empty());
    let unchanged = s.h.metadata.get_experiment(EXPERIMENT_ID).await.unwrap().unwrap();
    assert_eq!(unchanged, experiment());
}

fn block(id: &str, kind: BlockKind, settings: Option<AnalysisSettings>) -> DashboardBlock {
    DashboardBlock {
        id: id.to_string(),
        kind,
        experiment_id: settings.as_ref().map(|_| EXPERIMENT_ID.to_string()),
        snapshot_id: None,
        snapshot_settings: None,
        analysis_settings: settings,
    }
}

fn dashboard() -> Dashboard {
    let overall = AnalysisSettings::new(StatsEngineKind::Frequentist);
    let by_country = overall.clone().with_dimension("exp:country");
    Dashboard {
        id: "dash_1".to_string(),
        organization: ORG.to_string(),
        experiment_id: Some(EXPERIMENT_ID.to_string()),
        blocks: vec![
            block("blk_metric", BlockKind::ExperimentMetric, Some(overall.clone())),
            block("blk_country", BlockKind::ExperimentDimension, Some(by_country)),
            block("blk_series", BlockKind::ExperimentTimeSeries, Some(overall)),
            block("blk_notes", BlockKind::Markdown, None),
        ],
        enable_auto_updates: true,
        next_update: Some(test_now() - chrono::Duration::minutes(1)),
        last_update: None,
        auto_update_failure: None,
    }
}

#[tokio::test]
async fn test_dashboard_blocks_share_one_snapshot() {
    let s = setup(ScriptedExecutor::succeeding()).await;
    s.h.metadata.put_dashboard(&dashboard()).await.unwrap();

    s.scheduler.refresh_dashboard(ORG, "dash_1").await.unwrap();

    // One window, two extraction groups
    assert_eq!(s.h.metadata.snapshot_count(), 1);
    assert_eq!(s.executor.calls().len(), 2);

    let updated = s.h.metadata.get_dashboard("dash_1").await.unwrap().unwrap();
    assert!(updated.enable_auto_updates);
    assert_eq!(updated.last_update, Some(test_now()));
    assert_eq!(updated.next_update, Some(test_now() + six_hours()));
    let snapshot_ids: Vec<Option<String>> =
        updated.blocks.iter().map(|b| b.snapshot_id.clone()).collect();
    let shared = snapshot_ids[0].clone().unwrap();
    assert_eq!(snapshot_ids[1].as_deref(), Some(shared.as_str()));
    assert_eq!(snapshot_ids[2].as_deref(), Some(shared.as_str()));
    assert!(snapshot_ids[3].is_none());

    let snapshot = s.h.metadata.get_snapshot(&shared).await.unwrap().unwrap();
    assert_eq!(snapshot.trigger, SnapshotTrigger::Dashboard);
    assert_eq!(snapshot.analyses.len(), 2);
}

#[tokio::test]
async fn test_dashboard_failure_disables_auto_updates() {
    let s = setup(ScriptedExecutor::failing("permission denied")).await;
    s.h.metadata.put_dashboard(&dashboard()).await.unwrap();

    s.scheduler.refresh_dashboard(ORG, "dash_1").await.unwrap();

    let updated = s.h.metadata.get_dashboard("dash_1").await.unwrap().unwrap();
    assert!(!updated.enable_auto_updates);
    assert!(updated.next_update.is_none());
    assert!(updated
        .auto_update_failure
        .as_deref()
        .unwrap()
        .contains("permission denied"));

    let sent = s.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].entity, EntityKind::Dashboard);
    assert_eq!(sent[0].entity_id, "dash_1");

    assert_eq!(s.scheduler.scan().await.unwrap().enqueued, 1); // exp_1 only
}

#[tokio::test]
async fn test_dashboard_without_running_experiment_stops_rescheduling() {
    let s = setup(ScriptedExecutor::succeeding()).await;
    let mut stopped = experiment();
    stopped.status = ExperimentStatus::Stopped;
    s.h.metadata.put_experiment(&stopped).await.unwrap();
    s.h.metadata.put_dashboard(&dashboard()).await.unwrap();

    s.scheduler.refresh_dashboard(ORG, "dash_1").await.unwrap();

    assert!(s.executor.calls().is_empty());
    let updated = s.h.metadata.get_dashboard("dash_1").await.unwrap().unwrap();
    assert!(updated.enable_auto_updates);
    assert!(updated.next_update.is_none());
    assert!(updated.auto_update_failure.is_none());
    assert!(s.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_installed_scheduler_scans_and_refreshes() {
    let s = setup(ScriptedExecutor::succeeding()).await;
    s.scheduler.install(&s.queue).await.unwrap();

    // The recurring scan fires immediately on install
    tokio::time::timeout(Duration::from_secs(5), async {
        while s.queue.pending_len() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Scan, then the refresh it enqueued
    assert_eq!(s.queue.run_pending().await, 2);
    let updated = s.h.metadata.get_experiment(EXPERIMENT_ID).await.unwrap().unwrap();
    assert_eq!(updated.next_snapshot_attempt, Some(test_now() + six_hours()));

    s.queue.shutdown_token().cancel();
    let late = s
        .queue
        .enqueue(splitsight::scheduler::JobRequest::new(
            "refresh-scan",
            serde_json::Value::Null,
            test_now(),
        ))
        .await;
    assert!(late.is_err());
}
