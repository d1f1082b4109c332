//! Orchestration telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct OrchestratorInstruments {
    snapshots_created: Counter<u64>,
    snapshot_cache_hits: Counter<u64>,
    snapshots_resolved: Counter<u64>,
    queries: Counter<u64>,
    query_duration_seconds: Histogram<f64>,
    stale_reclassifications: Counter<u64>,
    jobs_enqueued: Counter<u64>,
    auto_refresh_disabled: Counter<u64>,
}

fn instruments() -> &'static OrchestratorInstruments {
    static INSTRUMENTS: OnceLock<OrchestratorInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("splitsight.orchestrator");
        OrchestratorInstruments {
            snapshots_created: meter
                .u64_counter("splitsight.snapshots.created")
                .with_description("Snapshots that submitted queries, by trigger")
                .init(),
            snapshot_cache_hits: meter
                .u64_counter("splitsight.snapshots.cache_hits")
                .with_description("Snapshot requests answered by an existing snapshot")
                .init(),
            snapshots_resolved: meter
                .u64_counter("splitsight.snapshots.resolved")
                .with_description("Snapshots resolved, by final status")
                .init(),
            queries: meter
                .u64_counter("splitsight.queries")
                .with_description("Backend queries by outcome")
                .init(),
            query_duration_seconds: meter
                .f64_histogram("splitsight.queries.duration")
                .with_description("Backend query latency")
                .with_unit("s")
                .init(),
            stale_reclassifications: meter
                .u64_counter("splitsight.queries.stale_reclassifications")
                .with_description("Running queries reported aborted after losing their heartbeat")
                .init(),
            jobs_enqueued: meter
                .u64_counter("splitsight.scheduler.jobs")
                .with_description("Refresh job enqueue attempts by outcome")
                .init(),
            auto_refresh_disabled: meter
                .u64_counter("splitsight.scheduler.auto_refresh_disabled")
                .with_description("Automatic refreshes switched off after a failure")
                .init(),
        }
    })
}

pub fn record_snapshot_created(trigger: &'static str) {
    instruments()
        .snapshots_created
        .add(1, &[KeyValue::new("trigger", trigger)]);
}

pub fn record_cache_hit() {
    instruments().snapshot_cache_hits.add(1, &[]);
}

pub fn record_snapshot_resolved(status: &'static str) {
    instruments()
        .snapshots_resolved
        .add(1, &[KeyValue::new("status", status)]);
}

pub fn record_query(backend: &'static str, status: &'static str, duration_seconds: f64) {
    let i = instruments();
    let attrs = [
        KeyValue::new("backend", backend),
        KeyValue::new("status", status),
    ];
    i.queries.add(1, &attrs);
    i.query_duration_seconds.record(duration_seconds, &attrs);
}

pub fn record_stale_reclassification(backend: &'static str) {
    instruments()
        .stale_reclassifications
        .add(1, &[KeyValue::new("backend", backend)]);
}

pub fn record_enqueue(job: &'static str, outcome: &'static str) {
    instruments().jobs_enqueued.add(
        1,
        &[KeyValue::new("job", job), KeyValue::new("outcome", outcome)],
    );
}

pub fn record_auto_refresh_disabled(entity: &'static str) {
    instruments()
        .auto_refresh_disabled
        .add(1, &[KeyValue::new("entity", entity)]);
}
