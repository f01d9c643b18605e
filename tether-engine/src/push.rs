//! Push Notification Manager
//!
//! Owns the per-task subscription registry and turns coordinator state
//! transitions into lifecycle events delivered to external subscriber
//! endpoints. Delivery is strictly best-effort: it runs on a detached task
//! with its own timeout, failures are logged and dropped, and nothing on
//! this path can roll back or delay a task-state write.

use crate::config::PushConfig;
use serde::Serialize;
use std::collections::HashMap;
use tether_core::{
    new_entity_id, ContextId, PushNotificationConfig, Task, TaskId, TaskState, TetherResult,
    Timestamp, ValidationError,
};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

// ============================================================================
// LIFECYCLE EVENTS
// ============================================================================

/// Snapshot of a task's state at transition time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub timestamp: Timestamp,
}

/// Event sent to a subscriber endpoint on every task state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdateEvent {
    /// Freshly generated per event.
    pub event_id: Uuid,
    /// Monotonic per task, starting at 1.
    pub sequence: u64,
    pub timestamp: Timestamp,
    /// Always `"status-update"`.
    pub kind: &'static str,
    pub task_id: TaskId,
    pub context_id: ContextId,
    pub status: TaskStatus,
    /// True iff the task reached a terminal state; subscribers may drop
    /// their subscription after a final event.
    #[serde(rename = "final")]
    pub is_final: bool,
}

// ============================================================================
// MANAGER
// ============================================================================

/// Per-task push subscription registry and event dispatcher.
pub struct PushNotificationManager {
    configs: RwLock<HashMap<TaskId, PushNotificationConfig>>,
    sequences: Mutex<HashMap<TaskId, u64>>,
    client: reqwest::Client,
    config: PushConfig,
}

impl PushNotificationManager {
    pub fn new(config: PushConfig) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
            client: reqwest::Client::new(),
            config,
        }
    }

    // === Registry Operations ===

    /// Register (or replace) the push config for a task. Last set wins.
    pub async fn set_config(&self, config: PushNotificationConfig) -> TetherResult<()> {
        if config.url.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "url".to_string(),
            }
            .into());
        }
        reqwest::Url::parse(&config.url).map_err(|_| ValidationError::InvalidValue {
            field: "url".to_string(),
            reason: "invalid URL format".to_string(),
        })?;

        tracing::info!(task_id = %config.task_id, url = %config.url, "push config registered");
        self.configs.write().await.insert(config.task_id, config);
        Ok(())
    }

    pub async fn get_config(&self, task_id: TaskId) -> Option<PushNotificationConfig> {
        self.configs.read().await.get(&task_id).cloned()
    }

    pub async fn list_configs(&self) -> Vec<PushNotificationConfig> {
        self.configs.read().await.values().cloned().collect()
    }

    /// Remove the config for a task. Returns whether one existed.
    pub async fn delete_config(&self, task_id: TaskId) -> bool {
        self.sequences.lock().await.remove(&task_id);
        self.configs.write().await.remove(&task_id).is_some()
    }

    /// Drop configs and sequence counters for tasks removed from storage.
    pub async fn forget_tasks(&self, task_ids: &[TaskId]) {
        let mut configs = self.configs.write().await;
        let mut sequences = self.sequences.lock().await;
        for task_id in task_ids {
            configs.remove(task_id);
            sequences.remove(task_id);
        }
    }

    /// Drop every config and counter (used by `clear_all`).
    pub async fn forget_all(&self) {
        self.configs.write().await.clear();
        self.sequences.lock().await.clear();
    }

    // === Event Dispatch ===

    /// Build the lifecycle event for a task's current state, advancing the
    /// task's sequence counter.
    pub async fn build_event(&self, task: &Task) -> StatusUpdateEvent {
        let mut sequences = self.sequences.lock().await;
        let sequence = sequences.entry(task.task_id).or_insert(0);
        *sequence += 1;

        StatusUpdateEvent {
            event_id: new_entity_id(),
            sequence: *sequence,
            timestamp: chrono::Utc::now(),
            kind: "status-update",
            task_id: task.task_id,
            context_id: task.context_id,
            status: TaskStatus {
                state: task.state,
                timestamp: task.state_timestamp,
            },
            is_final: task.state.is_terminal(),
        }
    }

    /// Publish a state transition. Fire-and-forget: the delivery runs on a
    /// detached task and any failure is only observable via logs.
    pub async fn notify_state_change(&self, task: &Task) {
        let event = self.build_event(task).await;

        let Some(config) = self.get_config(task.task_id).await else {
            // Push disabled for this task.
            return;
        };

        let client = self.client.clone();
        let timeout = self.config.delivery_timeout;
        tokio::spawn(async move {
            deliver(client, timeout, config, event).await;
        });
    }
}

/// Deliver one event to one subscriber endpoint.
async fn deliver(
    client: reqwest::Client,
    timeout: std::time::Duration,
    config: PushNotificationConfig,
    event: StatusUpdateEvent,
) {
    let mut request = client
        .post(&config.url)
        .timeout(timeout)
        .header("X-Tether-Event-Id", event.event_id.to_string())
        .json(&event);
    if let Some(token) = &config.token {
        request = request.bearer_auth(token);
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(
                task_id = %event.task_id,
                event_id = %event.event_id,
                status = %response.status(),
                "push notification delivered"
            );
        }
        Ok(response) => {
            tracing::warn!(
                task_id = %event.task_id,
                event_id = %event.event_id,
                status = %response.status(),
                url = %config.url,
                "push notification rejected with non-2xx status"
            );
        }
        Err(e) => {
            tracing::warn!(
                task_id = %event.task_id,
                event_id = %event.event_id,
                url = %config.url,
                error = %e,
                "push notification delivery failed"
            );
        }
    }
}
