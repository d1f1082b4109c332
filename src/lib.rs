//! # splitsight
//!
//! Experiment analysis snapshot orchestration.
//!
//! splitsight decides when the statistical analysis of a running experiment
//! must be recomputed, generates the right query for whichever warehouse the
//! experiment's data lives in, runs it asynchronously, notices stalled or
//! failed runs, and reuses earlier work when several consumers ask for the
//! same analysis.
//!
//! ## Architecture
//!
//! - **Adapters**: one query generator and runner per backend (SQL dialects,
//!   an embedded DataFusion warehouse and a reporting API)
//! - **Tracker**: persisted query records with heartbeat liveness
//! - **Orchestrator**: snapshot reuse, extraction grouping and result assembly
//! - **Scheduler**: recurring scans, idempotent refresh jobs and
//!   disable-on-failure

pub mod adapter;
pub mod clock;
pub mod config;
pub mod fingerprint;
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod scheduler;
pub mod telemetry;
pub mod tracker;

mod error;

pub use error::{Error, ErrorKind, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::adapter::{AdapterFactory, QueryAdapter};
    pub use crate::clock::{BoundedClock, Clock};
    pub use crate::config::{ComponentFactory, EngineConfig};
    pub use crate::fingerprint::{fingerprint, Fingerprint};
    pub use crate::metadata::{LocalMetadataClient, MetadataClient};
    pub use crate::model::{AnalysisSettings, Experiment, Snapshot, SnapshotSettings};
    pub use crate::orchestrator::{
        CreateSnapshotRequest, OrchestratorConfig, QueryRunner, SnapshotOrchestrator,
        SummaryStatistics,
    };
    pub use crate::scheduler::{LocalJobQueue, RefreshScheduler, SchedulerConfig};
    pub use crate::tracker::{QueryTracker, TrackerConfig};
    pub use crate::{Error, Result};
}
