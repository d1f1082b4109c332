//! Failure notifications
//!
//! When a scheduled refresh fails the entity's automatic updates are turned
//! off. The owning organization hears about it through a [`Notifier`].

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Experiment,
    Dashboard,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Experiment => "experiment",
            EntityKind::Dashboard => "dashboard",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub organization: String,
    pub entity: EntityKind,
    pub entity_id: String,
    pub event: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub const AUTO_UPDATE_DISABLED: &'static str = "auto-update-disabled";

    pub fn auto_update_disabled(
        organization: &str,
        entity: EntityKind,
        entity_id: &str,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            organization: organization.to_string(),
            entity,
            entity_id: entity_id.to_string(),
            event: Self::AUTO_UPDATE_DISABLED.to_string(),
            message: message.into(),
            timestamp,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        warn!(
            organization = %notification.organization,
            entity = %notification.entity,
            entity_id = %notification.entity_id,
            event = %notification.event,
            message = %notification.message,
            "Notification"
        );
        Ok(())
    }
}
