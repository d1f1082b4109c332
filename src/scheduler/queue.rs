//! Job queue seam and the in-process implementation
//!
//! The scheduler only needs two operations from a queue: a one-off enqueue
//! with an optional idempotency key, and a recurring registration. A second
//! enqueue with a key whose job is still pending or running is ignored.

use crate::clock::Clock;
use crate::orchestrator::telemetry;
use crate::{Error, Result};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub name: String,
    pub payload: Value,
    /// At most one pending-or-running job per key
    pub idempotency_key: Option<String>,
    pub run_at: DateTime<Utc>,
}

impl JobRequest {
    pub fn new(name: impl Into<String>, payload: Value, run_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            payload,
            idempotency_key: None,
            run_at,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with the same idempotency key is pending or running
    Duplicate,
}

impl EnqueueOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnqueueOutcome::Enqueued => "enqueued",
            EnqueueOutcome::Duplicate => "duplicate",
        }
    }
}

/// A job handed to a handler
#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub name: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub run_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: JobRequest) -> Result<EnqueueOutcome>;

    /// Enqueue a payload-less `name` job every `interval` (e.g. `"10 minutes"`).
    async fn every(&self, interval: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

/// Parse a human interval such as `"10 minutes"` or `"1h 30m"`.
pub fn parse_interval(raw: &str) -> Result<Duration> {
    let compact: String = raw.split_whitespace().collect();
    let interval = humantime::parse_duration(&compact)
        .map_err(|e| Error::Config(format!("invalid interval '{}': {}", raw, e)))?;
    if interval.is_zero() {
        return Err(Error::Config(format!("interval '{}' must be positive", raw)));
    }
    Ok(interval)
}

#[derive(Debug, Clone)]
pub struct LocalJobQueueConfig {
    pub workers: usize,
    /// How often idle workers look for delayed jobs that became due
    pub idle_poll_interval: Duration,
}

impl Default for LocalJobQueueConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(1, 8),
            idle_poll_interval: Duration::from_secs(1),
        }
    }
}

struct QueueInner {
    config: LocalJobQueueConfig,
    clock: Arc<dyn Clock>,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    /// (run_at, sequence) -> job
    pending: Mutex<BTreeMap<(DateTime<Utc>, u64), Job>>,
    /// Idempotency keys of pending or running jobs
    keys: DashMap<String, u64>,
    next_id: AtomicU64,
    wakeup: Notify,
    shutdown: CancellationToken,
}

impl QueueInner {
    fn enqueue(&self, request: JobRequest) -> EnqueueOutcome {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(key) = &request.idempotency_key {
            match self.keys.entry(key.clone()) {
                Entry::Occupied(existing) => {
                    debug!(
                        job = %request.name,
                        key = %key,
                        existing_job_id = *existing.get(),
                        "Ignoring duplicate job"
                    );
                    return EnqueueOutcome::Duplicate;
                }
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }

        let job = Job {
            id,
            name: request.name,
            payload: request.payload,
            idempotency_key: request.idempotency_key,
            run_at: request.run_at,
        };
        self.pending.lock().insert((job.run_at, id), job);
        self.wakeup.notify_one();
        EnqueueOutcome::Enqueued
    }

    /// Pop the earliest job whose `run_at` has passed.
    fn next_due(&self) -> Option<Job> {
        let now = self.clock.now();
        let mut pending = self.pending.lock();
        let due = pending.first_key_value().map(|((run_at, _), _)| *run_at <= now)?;
        if due {
            pending.pop_first().map(|(_, job)| job)
        } else {
            None
        }
    }

    async fn run_job(&self, job: Job) {
        // Released however the handler exits, panics included
        let _key = job.idempotency_key.as_deref().map(|key| KeyGuard {
            keys: &self.keys,
            key,
            job_id: job.id,
        });

        let handler = self.handlers.read().get(&job.name).cloned();
        let Some(handler) = handler else {
            warn!(job_id = job.id, job = %job.name, "No handler registered, dropping job");
            return;
        };
        debug!(job_id = job.id, job = %job.name, "Running job");
        match AssertUnwindSafe(handler.handle(&job)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(job_id = job.id, job = %job.name, error = %e, "Job failed"),
            Err(panic) => error!(
                job_id = job.id,
                job = %job.name,
                panic = panic_message(panic.as_ref()),
                "Job handler panicked"
            ),
        }
    }

    async fn worker(self: Arc<Self>, index: usize) {
        debug!(worker = index, "Job worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.next_due() {
                Some(job) => self.run_job(job).await,
                None => {
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!(worker = index, "Job worker stopped");
    }
}

/// Removes a job's idempotency key on drop, unless a newer job owns it.
struct KeyGuard<'a> {
    keys: &'a DashMap<String, u64>,
    key: &'a str,
    job_id: u64,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.keys.remove_if(self.key, |_, id| *id == self.job_id);
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// In-process job queue with a fixed-size worker pool
///
/// Jobs live in memory only, so a restart forgets them; recurring scans
/// re-discover due entities.
#[derive(Clone)]
pub struct LocalJobQueue {
    inner: Arc<QueueInner>,
}

impl LocalJobQueue {
    pub fn new(config: LocalJobQueueConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::Config("job queue needs at least one worker".to_string()));
        }
        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                clock,
                handlers: RwLock::new(HashMap::new()),
                pending: Mutex::new(BTreeMap::new()),
                keys: DashMap::new(),
                next_id: AtomicU64::new(1),
                wakeup: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.inner.handlers.write().insert(name.into(), handler);
    }

    /// Get a cancellation token that can be used to trigger graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Run every job that is due now, one at a time, until none is left.
    ///
    /// Returns the number of jobs run.
    pub async fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.inner.next_due() {
            self.inner.run_job(job).await;
            ran += 1;
        }
        ran
    }

    /// Run the worker pool. Returns when the shutdown token is cancelled,
    /// after in-flight jobs finish.
    pub async fn run(&self) {
        info!(workers = self.inner.config.workers, "Job queue started");
        let mut workers = JoinSet::new();
        for index in 0..self.inner.config.workers {
            workers.spawn(self.inner.clone().worker(index));
        }
        let mut next_index = self.inner.config.workers;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job worker panicked");
                if !self.inner.shutdown.is_cancelled() {
                    workers.spawn(self.inner.clone().worker(next_index));
                    next_index += 1;
                }
            }
        }
        // Handlers may hold the queue; drop them so both can be freed
        self.inner.handlers.write().clear();
        info!("Job queue stopped");
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn enqueue(&self, job: JobRequest) -> Result<EnqueueOutcome> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Queue("job queue is shutting down".to_string()));
        }
        let name = job.name.clone();
        let outcome = self.inner.enqueue(job);
        debug!(job = %name, outcome = outcome.as_str(), "Enqueue");
        Ok(outcome)
    }

    async fn every(&self, interval: &str, name: &str) -> Result<()> {
        let period = parse_interval(interval)?;
        let inner = self.inner.clone();
        let name = name.to_string();
        info!(job = %name, interval = %humantime::format_duration(period), "Registered recurring job");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let request = JobRequest::new(name.as_str(), Value::Null, inner.clock.now())
                            .with_idempotency_key(format!("recurring:{}", name));
                        let outcome = inner.enqueue(request);
                        if outcome == EnqueueOutcome::Duplicate {
                            debug!(job = %name, "Previous recurring run still in flight");
                        }
                    }
                    _ = inner.shutdown.cancelled() => break,
                }
            }
        });
        Ok(())
    }
}

/// Record an enqueue outcome for a scheduler job.
pub(crate) fn record_enqueue(job: &'static str, outcome: EnqueueOutcome) {
    telemetry::record_enqueue(job, outcome.as_str());
}
