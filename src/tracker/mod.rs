//! Query execution tracker
//!
//! Every warehouse query is persisted as a [`QueryRecord`] that moves from
//! `running` to `succeeded` or `failed` exactly once. The executing task
//! refreshes a heartbeat while the backend works. Liveness is enforced by
//! readers: any read that finds a running query whose heartbeat is older than
//! the liveness threshold reports it failed with error `"aborted"` and writes
//! that back, conditional on the record's version. There is no watchdog task,
//! so any number of processes can share the store.

use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::metadata::MetadataClient;
use crate::model::{DataSourceType, QueryKind, QueryRecord, QueryResult, QueryStatus};
use crate::orchestrator::telemetry;
use crate::{Error, Result};

use futures::future::try_join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Error recorded on queries that stopped heart-beating
pub const ABORTED: &str = "aborted";

/// Conditional writes that lose a race are retried this many times
const MAX_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Age after which a running query's heartbeat is considered dead
    pub liveness_threshold: Duration,
    /// How often an executing query refreshes its heartbeat
    pub heartbeat_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            liveness_threshold: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.liveness_threshold {
            return Err(Error::Config(format!(
                "heartbeat interval ({:?}) must be shorter than the liveness threshold ({:?})",
                self.heartbeat_interval, self.liveness_threshold
            )));
        }
        Ok(())
    }
}

/// A query about to be submitted
#[derive(Debug, Clone)]
pub struct NewQuery {
    pub organization: String,
    pub snapshot_id: String,
    pub kind: QueryKind,
    pub backend: DataSourceType,
    pub group: String,
    pub query: String,
}

pub struct QueryTracker {
    metadata: Arc<dyn MetadataClient>,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
    liveness_threshold: chrono::Duration,
}

impl QueryTracker {
    pub fn new(
        metadata: Arc<dyn MetadataClient>,
        clock: Arc<dyn Clock>,
        config: TrackerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let liveness_threshold = chrono::Duration::from_std(config.liveness_threshold)
            .map_err(|e| Error::Config(format!("liveness threshold out of range: {}", e)))?;
        Ok(Self {
            metadata,
            clock,
            config,
            liveness_threshold,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Persist a new query in `running` with a fresh heartbeat.
    pub async fn create(&self, new: NewQuery) -> Result<QueryRecord> {
        let now = self.clock.now();
        let record = QueryRecord {
            id: format!("qry_{}", uuid::Uuid::new_v4().simple()),
            organization: new.organization,
            snapshot_id: new.snapshot_id,
            kind: new.kind,
            backend: new.backend,
            group: new.group,
            status: QueryStatus::Running,
            query: new.query,
            heartbeat: now,
            created_at: now,
            finished_at: None,
            error: None,
            error_kind: None,
            result: None,
            version: 0,
        };
        self.metadata.create_query(&record).await?;
        debug!(query_id = %record.id, backend = %record.backend, group = %record.group, "Query created");
        Ok(record)
    }

    async fn load(&self, id: &str) -> Result<QueryRecord> {
        self.metadata
            .get_query(id)
            .await?
            .ok_or_else(|| Error::NotFound {
                collection: "queries",
                id: id.to_string(),
            })
    }

    /// Refresh the heartbeat of a running query.
    ///
    /// Returns `false` once the query is terminal, including after a reader
    /// reclassified it.
    pub async fn heartbeat(&self, id: &str) -> Result<bool> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut current = self.load(id).await?;
            if current.status.is_terminal() {
                return Ok(false);
            }
            let expected = current.version;
            current.heartbeat = self.clock.now();
            match self.metadata.update_query(&current, expected).await {
                Ok(_) => return Ok(true),
                // Another writer got in first; reload and try again
                Err(Error::StaleVersion { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::TooManyRetries)
    }

    /// Mark a query succeeded with its canonical rows.
    pub async fn succeed(&self, id: &str, result: QueryResult) -> Result<QueryRecord> {
        let rows = result.len();
        let record = self
            .finish(id, |record| {
                record.status = QueryStatus::Succeeded;
                record.result = Some(result.clone());
            })
            .await?;
        debug!(query_id = %id, rows, "Query succeeded");
        Ok(record)
    }

    /// Mark a query failed with a classified error.
    pub async fn fail(&self, id: &str, error: &Error) -> Result<QueryRecord> {
        let message = error.to_string();
        let kind = error.kind();
        let record = self
            .finish(id, |record| {
                record.status = QueryStatus::Failed;
                record.error = Some(message.clone());
                record.error_kind = Some(kind);
            })
            .await?;
        warn!(query_id = %id, error_kind = kind.as_str(), error = %message, "Query failed");
        Ok(record)
    }

    /// Apply a terminal transition unless one already happened.
    ///
    /// A query reclassified as aborted stays failed even if its backend
    /// later returns; the stored terminal record is returned unchanged.
    async fn finish<F>(&self, id: &str, apply: F) -> Result<QueryRecord>
    where
        F: Fn(&mut QueryRecord),
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.load(id).await?;
            if current.status.is_terminal() {
                warn!(
                    query_id = %id,
                    status = current.status.as_str(),
                    "Ignoring transition of a terminal query"
                );
                return Ok(current);
            }
            let mut next = current.clone();
            apply(&mut next);
            next.finished_at = Some(self.clock.now());
            match self.metadata.update_query(&next, current.version).await {
                Ok(stored) => return Ok(stored),
                Err(Error::StaleVersion { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::TooManyRetries)
    }

    /// Read a query, applying the liveness rule.
    pub async fn get(&self, id: &str) -> Result<Option<QueryRecord>> {
        let Some(record) = self.metadata.get_query(id).await? else {
            return Ok(None);
        };
        self.enforce_liveness(record).await.map(Some)
    }

    /// Read many queries, applying the liveness rule to each.
    pub async fn get_many(&self, ids: &[String]) -> Result<Vec<QueryRecord>> {
        let records = try_join_all(ids.iter().map(|id| self.get(id))).await?;
        Ok(records.into_iter().flatten().collect())
    }

    async fn enforce_liveness(&self, record: QueryRecord) -> Result<QueryRecord> {
        let now = self.clock.now();
        if !record.is_stale(now, self.liveness_threshold) {
            return Ok(record);
        }

        let mut aborted = record.clone();
        aborted.status = QueryStatus::Failed;
        aborted.error = Some(ABORTED.to_string());
        aborted.error_kind = Some(ErrorKind::StaleQuery);
        aborted.finished_at = Some(now);

        match self.metadata.update_query(&aborted, record.version).await {
            Ok(stored) => {
                info!(
                    query_id = %stored.id,
                    heartbeat = %record.heartbeat,
                    "Reclassified stale query as aborted"
                );
                telemetry::record_stale_reclassification(stored.backend.as_str());
                Ok(stored)
            }
            Err(Error::StaleVersion { .. }) => {
                // Someone else wrote first: a heartbeat, a terminal
                // transition or another reader's reclassification
                let fresh = self.load(&record.id).await?;
                if fresh.is_stale(now, self.liveness_threshold) {
                    Ok(aborted)
                } else {
                    Ok(fresh)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Run `work` for `record`, keeping its heartbeat fresh, then persist
    /// the outcome.
    ///
    /// The returned record is the stored terminal state. Backend errors are
    /// recorded on the query rather than returned.
    #[instrument(skip_all, fields(query_id = %record.id, backend = %record.backend))]
    pub async fn execute<F>(&self, record: &QueryRecord, work: F) -> Result<QueryRecord>
    where
        F: Future<Output = Result<QueryResult>> + Send,
    {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the record was just created
        ticker.tick().await;

        tokio::pin!(work);
        let outcome = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = ticker.tick() => {
                    match self.heartbeat(&record.id).await {
                        Ok(true) => {}
                        Ok(false) => debug!("Query is no longer running, skipping heartbeat"),
                        Err(e) => warn!(error = %e, "Heartbeat write failed"),
                    }
                }
            }
        };

        let stored = match outcome {
            Ok(result) => self.succeed(&record.id, result).await?,
            Err(e) => self.fail(&record.id, &e).await?,
        };
        telemetry::record_query(
            stored.backend.as_str(),
            stored.status.as_str(),
            started.elapsed().as_secs_f64(),
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(TrackerConfig::default().validate().is_ok());
        let config = TrackerConfig {
            liveness_threshold: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(60),
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        let config = TrackerConfig {
            liveness_threshold: Duration::from_secs(60),
            heartbeat_interval: Duration::ZERO,
        };
        assert!(config.validate().is_err());
    }
}
