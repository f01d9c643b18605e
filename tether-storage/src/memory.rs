//! In-memory backend.
//!
//! Process-local reference implementation used to validate protocol
//! correctness independent of persistence concerns. Data does not survive
//! process restart and is not visible across processes.
//!
//! Concurrency: every mutation takes the relevant map's write lock for the
//! whole read-modify-write, which linearizes concurrent `update_task` calls
//! on the same task id. `clear_context` holds the task-map write lock for the
//! duration of the cascade, so it cannot interleave with an in-flight update
//! for a task inside that context. Lock order is always tasks, then contexts,
//! then feedback.

use crate::{TaskStore, TaskUpdate};
use ::async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tether_core::{
    Context, ContextId, EntityKind, Message, StorageError, Task, TaskFeedback, TaskId,
    TetherResult,
};

/// In-memory backend over lock-protected maps keyed by id.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    contexts: RwLock<HashMap<ContextId, Context>>,
    feedback: RwLock<HashMap<TaskId, Vec<TaskFeedback>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get count of stored tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Get count of stored contexts.
    pub fn context_count(&self) -> usize {
        self.contexts.read().map(|c| c.len()).unwrap_or(0)
    }
}

/// Sort most-recent-first: newest `created_at` wins, UUIDv7 id as the stable
/// tie-breaker for entities created in the same instant.
fn sort_recent_first<T>(items: &mut [T], key: impl Fn(&T) -> (chrono::DateTime<Utc>, uuid::Uuid)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

fn cap<T>(mut items: Vec<T>, length: Option<usize>) -> Vec<T> {
    if let Some(n) = length {
        items.truncate(n);
    }
    items
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn load_task(
        &self,
        task_id: TaskId,
        history_length: Option<usize>,
    ) -> TetherResult<Option<Task>> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut task = match tasks.get(&task_id) {
            Some(task) => task.clone(),
            None => return Ok(None),
        };
        if let Some(n) = history_length {
            task.truncate_history(n);
        }
        Ok(Some(task))
    }

    async fn submit_task(&self, context_id: ContextId, message: Message) -> TetherResult<Task> {
        message.validate()?;

        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut contexts = self
            .contexts
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;

        // Continuation targets the message's own task id; otherwise a new
        // task row is minted. The continuation target is resolved and
        // checked before anything else is touched, so a rejected submission
        // leaves no phantom context and no stray transcript entry.
        let task = match message.task_id {
            Some(task_id) => {
                let task = tasks
                    .get_mut(&task_id)
                    .ok_or_else(|| StorageError::NotFound {
                        kind: EntityKind::Task,
                        id: task_id,
                    })?;
                TaskUpdate::default()
                    .with_message(message.clone())
                    .apply_to(task)?;
                task.clone()
            }
            None => {
                let task = Task::new(context_id, message.clone());
                tasks.insert(task.task_id, task.clone());
                task
            }
        };

        // Context-level history records every submitted message, whether it
        // opens a task or continues one.
        let context = contexts
            .entry(context_id)
            .or_insert_with(|| Context::new(context_id));
        context.message_history.push(message);
        context.updated_at = Utc::now();

        tracing::debug!(task_id = %task.task_id, context_id = %context_id, "task submitted");
        Ok(task)
    }

    async fn update_task(&self, task_id: TaskId, update: TaskUpdate) -> TetherResult<Task> {
        for message in &update.new_messages {
            message.validate()?;
        }
        for artifact in &update.new_artifacts {
            artifact.validate()?;
        }

        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| StorageError::NotFound {
                kind: EntityKind::Task,
                id: task_id,
            })?;
        update.apply_to(task)?;

        tracing::debug!(task_id = %task_id, state = task.state.as_db_str(), "task updated");
        Ok(task.clone())
    }

    async fn list_tasks(&self, length: Option<usize>) -> TetherResult<Vec<Task>> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<Task> = tasks.values().cloned().collect();
        sort_recent_first(&mut result, |t| (t.created_at, t.task_id));
        Ok(cap(result, length))
    }

    async fn list_tasks_by_context(
        &self,
        context_id: ContextId,
        length: Option<usize>,
    ) -> TetherResult<Vec<Task>> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<Task> = tasks
            .values()
            .filter(|t| t.context_id == context_id)
            .cloned()
            .collect();
        sort_recent_first(&mut result, |t| (t.created_at, t.task_id));
        Ok(cap(result, length))
    }

    async fn load_context(&self, context_id: ContextId) -> TetherResult<Option<Context>> {
        let contexts = self
            .contexts
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(contexts.get(&context_id).cloned())
    }

    async fn update_context(&self, mut context: Context) -> TetherResult<Context> {
        let mut contexts = self
            .contexts
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        context.updated_at = Utc::now();
        contexts.insert(context.context_id, context.clone());
        Ok(context)
    }

    async fn list_contexts(&self, length: Option<usize>) -> TetherResult<Vec<Context>> {
        let contexts = self
            .contexts
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<Context> = contexts.values().cloned().collect();
        sort_recent_first(&mut result, |c| (c.created_at, c.context_id));
        Ok(cap(result, length))
    }

    async fn clear_context(&self, context_id: ContextId) -> TetherResult<()> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut contexts = self
            .contexts
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut feedback = self
            .feedback
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;

        let removed: Vec<TaskId> = tasks
            .values()
            .filter(|t| t.context_id == context_id)
            .map(|t| t.task_id)
            .collect();
        for task_id in &removed {
            tasks.remove(task_id);
            feedback.remove(task_id);
        }
        contexts.remove(&context_id);

        tracing::debug!(context_id = %context_id, tasks = removed.len(), "context cleared");
        Ok(())
    }

    async fn clear_all(&self) -> TetherResult<()> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut contexts = self
            .contexts
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut feedback = self
            .feedback
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;

        tasks.clear();
        contexts.clear();
        feedback.clear();
        Ok(())
    }

    async fn store_task_feedback(
        &self,
        task_id: TaskId,
        feedback_data: Value,
    ) -> TetherResult<TaskFeedback> {
        TaskFeedback::validate_data(&feedback_data)?;

        // The tasks lock is held across the insert so a concurrent
        // clear_context cannot delete the task between the existence check
        // and the write, which would orphan the record. Lock order is still
        // tasks, then feedback.
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        if !tasks.contains_key(&task_id) {
            return Err(StorageError::NotFound {
                kind: EntityKind::Task,
                id: task_id,
            }
            .into());
        }

        let record = TaskFeedback::new(task_id, feedback_data);
        let mut feedback = self
            .feedback
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        feedback.entry(task_id).or_default().push(record.clone());
        Ok(record)
    }

    async fn get_task_feedback(&self, task_id: TaskId) -> TetherResult<Vec<TaskFeedback>> {
        let feedback = self
            .feedback
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(feedback.get(&task_id).cloned().unwrap_or_default())
    }

    async fn health_check(&self) -> TetherResult<bool> {
        Ok(true)
    }
}

// ============================================================================
// TESTS
// ============================================================================
