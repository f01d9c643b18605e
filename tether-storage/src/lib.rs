//! Tether Storage - Backend Contract and In-Memory Backend
//!
//! Defines the storage abstraction used by the lifecycle coordinator. Exactly
//! two implementations exist: [`MemoryStore`] (here, the reference backend)
//! and `PgStore` in tether-pg (the durable backend). The backend is selected
//! once at process startup and never switched at runtime.

pub mod memory;

pub use memory::MemoryStore;

use ::async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tether_core::{
    Artifact, Context, ContextId, Message, StorageError, Task, TaskFeedback, TaskId, TaskState,
    TetherResult,
};

// ============================================================================
// UPDATE TYPES
// ============================================================================

/// Update payload for tasks.
///
/// Collections are append-only: `new_messages` and `new_artifacts` are added
/// to the stored sequences, never replacing them. `metadata` merges shallowly,
/// last write wins per top-level key.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    /// New state. `None` leaves the state untouched; re-asserting the
    /// current state is a no-op rather than an error so concurrent progress
    /// updates don't race each other.
    pub state: Option<TaskState>,
    pub new_messages: Vec<Message>,
    pub new_artifacts: Vec<Artifact>,
    pub metadata: Option<Map<String, Value>>,
}

impl TaskUpdate {
    /// Update that only transitions the state.
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.new_messages.push(message);
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.new_artifacts.push(artifact);
        self
    }

    /// Validate the payload and check the transition against the task's
    /// current state, without mutating anything.
    pub fn check_against(&self, task: &Task) -> Result<(), StorageError> {
        if task.state.is_terminal() {
            return Err(StorageError::InvalidStateTransition {
                task_id: task.task_id,
                from: task.state,
                to: self.state,
            });
        }
        if let Some(next) = self.state {
            if next != task.state && !task.state.can_transition_to(next) {
                return Err(StorageError::InvalidStateTransition {
                    task_id: task.task_id,
                    from: task.state,
                    to: Some(next),
                });
            }
        }
        Ok(())
    }

    /// Apply this update to a task in place.
    ///
    /// Both backends funnel their read-modify-write through here so the
    /// terminal-immutability check and the append/merge semantics cannot
    /// drift between them. The caller is responsible for holding whatever
    /// lock makes the read-modify-write atomic.
    pub fn apply_to(self, task: &mut Task) -> Result<(), StorageError> {
        self.check_against(task)?;

        let now = Utc::now();
        for mut message in self.new_messages {
            message.task_id = Some(task.task_id);
            message.context_id = Some(task.context_id);
            task.history.push(message);
        }
        task.artifacts.extend(self.new_artifacts);
        if let Some(metadata) = self.metadata {
            for (key, value) in metadata {
                task.metadata.insert(key, value);
            }
        }
        if let Some(next) = self.state {
            if next != task.state {
                task.state = next;
                task.state_timestamp = now;
            }
        }
        task.updated_at = now;
        Ok(())
    }
}

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// Backend contract for Tether entities.
///
/// All operations may be invoked concurrently; implementations must
/// linearize mutations per task id so that no appended message or artifact
/// is ever lost. Validation and state-machine violations are detected before
/// any write.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // === Task Operations ===

    /// Load a task by id. `history_length` truncates the returned history to
    /// the most recent N messages without mutating stored state.
    async fn load_task(
        &self,
        task_id: TaskId,
        history_length: Option<usize>,
    ) -> TetherResult<Option<Task>>;

    /// Submit a message to a context.
    ///
    /// When the message carries a `task_id`, the message is appended to that
    /// task (terminal tasks are rejected). Otherwise a new task is created in
    /// `Submitted` state with `history = [message]`, implicitly creating the
    /// owning context when absent.
    async fn submit_task(&self, context_id: ContextId, message: Message) -> TetherResult<Task>;

    /// Transition state and append artifacts/messages atomically.
    async fn update_task(&self, task_id: TaskId, update: TaskUpdate) -> TetherResult<Task>;

    /// List tasks, most recent first.
    async fn list_tasks(&self, length: Option<usize>) -> TetherResult<Vec<Task>>;

    /// List tasks belonging to a context, most recent first.
    async fn list_tasks_by_context(
        &self,
        context_id: ContextId,
        length: Option<usize>,
    ) -> TetherResult<Vec<Task>>;

    // === Context Operations ===

    async fn load_context(&self, context_id: ContextId) -> TetherResult<Option<Context>>;

    /// Upsert a context.
    async fn update_context(&self, context: Context) -> TetherResult<Context>;

    /// List contexts, most recent first.
    async fn list_contexts(&self, length: Option<usize>) -> TetherResult<Vec<Context>>;

    /// Delete a context and all its tasks (with their feedback) in one
    /// atomic step. Idempotent: clearing an absent context is a no-op.
    async fn clear_context(&self, context_id: ContextId) -> TetherResult<()>;

    /// Delete every context and task. Destructive; used for test/reset flows.
    async fn clear_all(&self) -> TetherResult<()>;

    // === Feedback Operations ===

    async fn store_task_feedback(
        &self,
        task_id: TaskId,
        feedback_data: Value,
    ) -> TetherResult<TaskFeedback>;

    /// Feedback records for a task, oldest first.
    async fn get_task_feedback(&self, task_id: TaskId) -> TetherResult<Vec<TaskFeedback>>;

    // === Health & Diagnostics ===

    /// Check if the storage backend is reachable.
    async fn health_check(&self) -> TetherResult<bool>;
}
