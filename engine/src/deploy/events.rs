//! Deployment progress notifications

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

/// Something observable happened during a deployment or rollback
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeployNotification {
    DeploymentStarted { deployment_id: String, version: String, dry_run: bool },
    StepStarted { deployment_id: String, step: String },
    StepCompleted { deployment_id: String, step: String },
    StepSkipped { deployment_id: String, step: String, reason: String },
    StepFailed { deployment_id: String, step: String, error: String },
    TrafficShifted { deployment_id: String, version: String, weight: f64 },
    DeploymentCompleted { deployment_id: String, version: String },
    DeploymentFailed { deployment_id: String, version: String, error: String },
    RollbackStarted { from_version: String, to_version: String, automatic: bool },
    RollbackCompleted { from_version: String, to_version: String },
    RollbackFailed { from_version: String, to_version: String, error: String },
}

/// Timestamped notification as delivered to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub notification: DeployNotification,
}

/// Fan-out of notifications to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events; publishing never blocks.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventRecord>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    pub fn emit(&self, notification: DeployNotification) {
        trace!(?notification, "deployment event");
        // No receivers is not an error
        let _ = self.sender.send(EventRecord {
            at: Utc::now(),
            notification,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
