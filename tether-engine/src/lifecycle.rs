//! Task Lifecycle Coordinator
//!
//! Backend-agnostic layer that enforces the task state machine and the
//! continue-vs-create decision for inbound messages. Every state transition
//! it performs is published through the [`PushNotificationManager`]; push
//! delivery is fire-and-forget and can never fail or delay a storage write.

use crate::push::PushNotificationManager;
use serde_json::Value;
use std::sync::Arc;
use tether_core::{
    Context, ContextId, EntityKind, Message, PushNotificationConfig, Task, TaskFeedback, TaskId,
    TaskState, TetherError, TetherResult,
};
use tether_storage::{TaskStore, TaskUpdate};

/// Coordinates task lifecycle operations over a storage backend.
pub struct LifecycleCoordinator {
    store: Arc<dyn TaskStore>,
    push: Arc<PushNotificationManager>,
}

impl LifecycleCoordinator {
    pub fn new(store: Arc<dyn TaskStore>, push: Arc<PushNotificationManager>) -> Self {
        Self { store, push }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn push(&self) -> &Arc<PushNotificationManager> {
        &self.push
    }

    // ========================================================================
    // MESSAGE SUBMISSION
    // ========================================================================

    /// Route an inbound message to its task.
    ///
    /// A message carrying a `task_id` continues that exact task. Otherwise
    /// the context's most recent task decides: a task awaiting input is
    /// resumed under its existing id, a terminal (or absent) latest task
    /// means a new task id is minted, referencing the prior terminal task
    /// for conversational continuity.
    pub async fn message_send(
        &self,
        context_id: ContextId,
        message: Message,
    ) -> TetherResult<Task> {
        message.validate()?;

        if let Some(task_id) = message.task_id {
            return self.continue_task(task_id, message).await;
        }

        let latest = self
            .store
            .list_tasks_by_context(context_id, Some(1))
            .await?
            .into_iter()
            .next();

        match latest {
            Some(task) if task.state.awaits_continuation() => {
                self.resume_task(&task, message).await
            }
            Some(task) if task.is_terminal() => {
                let mut message = message;
                if !message.reference_task_ids.contains(&task.task_id) {
                    message.reference_task_ids.push(task.task_id);
                }
                self.create_task(context_id, message).await
            }
            _ => self.create_task(context_id, message).await,
        }
    }

    /// Continue the task the message explicitly names.
    ///
    /// Routed through `submit_task` rather than `update_task` so the
    /// context-level transcript records the continuation message alongside
    /// the task history.
    async fn continue_task(&self, task_id: TaskId, message: Message) -> TetherResult<Task> {
        let task = self
            .store
            .load_task(task_id, Some(0))
            .await?
            .ok_or_else(|| TetherError::not_found(EntityKind::Task, task_id))?;

        if task.state.awaits_continuation() {
            return self.resume_task(&task, message).await;
        }

        // Terminal tasks are rejected inside submit_task with
        // InvalidStateTransition; submitted/working tasks just accept the
        // appended message.
        self.store.submit_task(task.context_id, message).await
    }

    /// Resume a task awaiting input: append the message, then move the task
    /// back to `working`.
    async fn resume_task(&self, task: &Task, mut message: Message) -> TetherResult<Task> {
        tracing::info!(
            task_id = %task.task_id,
            from = ?task.state,
            "resuming task awaiting continuation"
        );
        message.task_id = Some(task.task_id);
        self.store.submit_task(task.context_id, message).await?;
        let task = self
            .store
            .update_task(task.task_id, TaskUpdate::state(TaskState::Working))
            .await?;
        self.push.notify_state_change(&task).await;
        Ok(task)
    }

    /// Mint a new task for the context.
    async fn create_task(&self, context_id: ContextId, message: Message) -> TetherResult<Task> {
        let task = self.store.submit_task(context_id, message).await?;
        tracing::info!(task_id = %task.task_id, context_id = %context_id, "task created");
        self.push.notify_state_change(&task).await;
        Ok(task)
    }

    // ========================================================================
    // TASK OPERATIONS
    // ========================================================================

    pub async fn get_task(
        &self,
        task_id: TaskId,
        history_length: Option<usize>,
    ) -> TetherResult<Task> {
        self.store
            .load_task(task_id, history_length)
            .await?
            .ok_or_else(|| TetherError::not_found(EntityKind::Task, task_id))
    }

    /// List tasks, scoped to a context when one is given. Most recent first.
    pub async fn list_tasks(
        &self,
        context_id: Option<ContextId>,
        length: Option<usize>,
    ) -> TetherResult<Vec<Task>> {
        match context_id {
            Some(context_id) => self.store.list_tasks_by_context(context_id, length).await,
            None => self.store.list_tasks(length).await,
        }
    }

    /// Apply an update, publishing a lifecycle event when it carries a state
    /// transition.
    pub async fn update_task(&self, task_id: TaskId, update: TaskUpdate) -> TetherResult<Task> {
        let notify = update.state.is_some();
        let task = self.store.update_task(task_id, update).await?;
        if notify {
            self.push.notify_state_change(&task).await;
        }
        Ok(task)
    }

    /// Cancel a non-terminal task. Terminal tasks are rejected with
    /// `InvalidStateTransition`, unknown ids with `NotFound`.
    pub async fn cancel_task(&self, task_id: TaskId) -> TetherResult<Task> {
        let task = self
            .store
            .update_task(task_id, TaskUpdate::state(TaskState::Canceled))
            .await?;
        tracing::info!(task_id = %task_id, "task canceled");
        self.push.notify_state_change(&task).await;
        Ok(task)
    }

    // ========================================================================
    // FEEDBACK OPERATIONS
    // ========================================================================

    pub async fn store_feedback(
        &self,
        task_id: TaskId,
        feedback_data: Value,
    ) -> TetherResult<TaskFeedback> {
        self.store.store_task_feedback(task_id, feedback_data).await
    }

    pub async fn get_feedback(&self, task_id: TaskId) -> TetherResult<Vec<TaskFeedback>> {
        self.store.get_task_feedback(task_id).await
    }

    // ========================================================================
    // CONTEXT OPERATIONS
    // ========================================================================

    /// Create a fresh empty context.
    pub async fn create_context(&self) -> TetherResult<Context> {
        let context = Context::new(tether_core::new_entity_id());
        self.store.update_context(context).await
    }

    pub async fn get_context(&self, context_id: ContextId) -> TetherResult<Context> {
        self.store
            .load_context(context_id)
            .await?
            .ok_or_else(|| TetherError::not_found(EntityKind::Context, context_id))
    }

    pub async fn upsert_context(&self, context: Context) -> TetherResult<Context> {
        self.store.update_context(context).await
    }

    pub async fn list_contexts(&self, length: Option<usize>) -> TetherResult<Vec<Context>> {
        self.store.list_contexts(length).await
    }

    /// Clear one context, or every context when `context_id` is `None`.
    /// Push configs for the deleted tasks are dropped alongside.
    pub async fn clear_context(&self, context_id: Option<ContextId>) -> TetherResult<()> {
        match context_id {
            Some(context_id) => {
                let task_ids: Vec<TaskId> = self
                    .store
                    .list_tasks_by_context(context_id, None)
                    .await?
                    .into_iter()
                    .map(|t| t.task_id)
                    .collect();
                self.store.clear_context(context_id).await?;
                self.push.forget_tasks(&task_ids).await;
                tracing::info!(context_id = %context_id, tasks = task_ids.len(), "context cleared");
            }
            None => {
                self.store.clear_all().await?;
                self.push.forget_all().await;
                tracing::info!("all contexts cleared");
            }
        }
        Ok(())
    }

    // ========================================================================
    // PUSH CONFIG OPERATIONS
    // ========================================================================

    /// Register a push config. The task must exist.
    pub async fn set_push_config(&self, config: PushNotificationConfig) -> TetherResult<()> {
        if self.store.load_task(config.task_id, Some(0)).await?.is_none() {
            return Err(TetherError::not_found(EntityKind::Task, config.task_id));
        }
        self.push.set_config(config).await
    }

    pub async fn get_push_config(&self, task_id: TaskId) -> Option<PushNotificationConfig> {
        self.push.get_config(task_id).await
    }

    pub async fn list_push_configs(&self) -> Vec<PushNotificationConfig> {
        self.push.list_configs().await
    }

    pub async fn delete_push_config(&self, task_id: TaskId) -> bool {
        self.push.delete_config(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushConfig;
    use serde_json::json;
    use tether_core::{new_entity_id, Artifact, Part, StorageError};
    use tether_storage::MemoryStore;

    fn coordinator() -> LifecycleCoordinator {
        LifecycleCoordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(PushNotificationManager::new(PushConfig::default())),
        )
    }

    fn text_of(message: &Message) -> &str {
        match &message.parts[0] {
            Part::Text { text } => text,
            other => panic!("expected text part, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_message_creates_submitted_task() {
        let coordinator = coordinator();
        let context_id = new_entity_id();

        let task = coordinator
            .message_send(context_id, Message::user_text("hi"))
            .await
            .unwrap();

        assert_eq!(task.state, TaskState::Submitted);
        assert_eq!(task.context_id, context_id);
        assert_eq!(task.history.len(), 1);
        assert_eq!(text_of(&task.history[0]), "hi");
    }

    #[tokio::test]
    async fn test_full_lifecycle_example() {
        let coordinator = coordinator();
        let context_id = new_entity_id();

        let task = coordinator
            .message_send(context_id, Message::user_text("hi"))
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Submitted);

        let task = coordinator
            .update_task(task.task_id, TaskUpdate::state(TaskState::Working))
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Working);

        let task = coordinator
            .update_task(
                task.task_id,
                TaskUpdate::state(TaskState::Completed).with_artifact(Artifact::text("hello!")),
            )
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.artifacts.len(), 1);

        let err = coordinator
            .update_task(task.task_id, TaskUpdate::state(TaskState::Working))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TetherError::Storage(StorageError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_input_required_resumes_same_task() {
        let coordinator = coordinator();
        let context_id = new_entity_id();

        let task = coordinator
            .message_send(context_id, Message::user_text("book a flight"))
            .await
            .unwrap();
        coordinator
            .update_task(task.task_id, TaskUpdate::state(TaskState::Working))
            .await
            .unwrap();
        coordinator
            .update_task(
                task.task_id,
                TaskUpdate::state(TaskState::InputRequired)
                    .with_message(Message::agent_text("which date?")),
            )
            .await
            .unwrap();

        let resumed = coordinator
            .message_send(context_id, Message::user_text("next friday"))
            .await
            .unwrap();

        assert_eq!(resumed.task_id, task.task_id, "continuation reuses the task id");
        assert_eq!(resumed.state, TaskState::Working);
        assert_eq!(resumed.history.len(), 3);
        assert_eq!(text_of(&resumed.history[2]), "next friday");
    }

    #[tokio::test]
    async fn test_terminal_latest_task_mints_new_referencing_task() {
        let coordinator = coordinator();
        let context_id = new_entity_id();

        let first = coordinator
            .message_send(context_id, Message::user_text("hi"))
            .await
            .unwrap();
        coordinator
            .update_task(first.task_id, TaskUpdate::state(TaskState::Working))
            .await
            .unwrap();
        coordinator
            .update_task(first.task_id, TaskUpdate::state(TaskState::Completed))
            .await
            .unwrap();

        let second = coordinator
            .message_send(context_id, Message::user_text("one more thing"))
            .await
            .unwrap();

        assert_ne!(second.task_id, first.task_id);
        assert_eq!(second.state, TaskState::Submitted);
        assert_eq!(second.reference_task_ids, vec![first.task_id]);
    }

    #[tokio::test]
    async fn test_explicit_continuation_of_terminal_task_rejected() {
        let coordinator = coordinator();
        let context_id = new_entity_id();

        let task = coordinator
            .message_send(context_id, Message::user_text("hi"))
            .await
            .unwrap();
        coordinator
            .update_task(task.task_id, TaskUpdate::state(TaskState::Working))
            .await
            .unwrap();
        coordinator
            .update_task(task.task_id, TaskUpdate::state(TaskState::Failed))
            .await
            .unwrap();

        let mut followup = Message::user_text("try again");
        followup.task_id = Some(task.task_id);
        let err = coordinator
            .message_send(context_id, followup)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TetherError::Storage(StorageError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_explicit_continuation_of_working_task_appends() {
        let coordinator = coordinator();
        let context_id = new_entity_id();

        let task = coordinator
            .message_send(context_id, Message::user_text("hi"))
            .await
            .unwrap();
        coordinator
            .update_task(task.task_id, TaskUpdate::state(TaskState::Working))
            .await
            .unwrap();

        let mut followup = Message::user_text("also do this");
        followup.task_id = Some(task.task_id);
        let task = coordinator.message_send(context_id, followup).await.unwrap();

        assert_eq!(task.state, TaskState::Working);
        assert_eq!(task.history.len(), 2);
    }

    #[tokio::test]
    async fn test_context_transcript_records_continuation_messages() {
        let coordinator = coordinator();
        let context_id = new_entity_id();

        let task = coordinator
            .message_send(context_id, Message::user_text("book a flight"))
            .await
            .unwrap();
        coordinator
            .update_task(task.task_id, TaskUpdate::state(TaskState::Working))
            .await
            .unwrap();
        coordinator
            .update_task(task.task_id, TaskUpdate::state(TaskState::InputRequired))
            .await
            .unwrap();

        // Implicit resume, then an explicit continuation of the working task.
        coordinator
            .message_send(context_id, Message::user_text("next friday"))
            .await
            .unwrap();
        let mut explicit = Message::user_text("window seat");
        explicit.task_id = Some(task.task_id);
        coordinator.message_send(context_id, explicit).await.unwrap();

        let context = coordinator.get_context(context_id).await.unwrap();
        assert_eq!(
            context.message_history.len(),
            3,
            "every inbound message belongs in the context transcript"
        );
    }

    #[tokio::test]
    async fn test_continuation_of_unknown_task_is_not_found() {
        let coordinator = coordinator();
        let mut message = Message::user_text("hello?");
        message.task_id = Some(new_entity_id());

        let err = coordinator
            .message_send(new_entity_id(), message)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TetherError::Storage(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_non_terminal_and_reject_terminal() {
        let coordinator = coordinator();
        let context_id = new_entity_id();

        let task = coordinator
            .message_send(context_id, Message::user_text("hi"))
            .await
            .unwrap();
        let canceled = coordinator.cancel_task(task.task_id).await.unwrap();
        assert_eq!(canceled.state, TaskState::Canceled);

        let err = coordinator.cancel_task(task.task_id).await.unwrap_err();
        assert!(matches!(
            err,
            TetherError::Storage(StorageError::InvalidStateTransition { .. })
        ));

        let err = coordinator.cancel_task(new_entity_id()).await.unwrap_err();
        assert!(matches!(
            err,
            TetherError::Storage(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_task_honors_history_length() {
        let coordinator = coordinator();
        let context_id = new_entity_id();

        let task = coordinator
            .message_send(context_id, Message::user_text("one"))
            .await
            .unwrap();
        coordinator
            .update_task(
                task.task_id,
                TaskUpdate::default()
                    .with_message(Message::agent_text("two"))
                    .with_message(Message::agent_text("three")),
            )
            .await
            .unwrap();

        let truncated = coordinator.get_task(task.task_id, Some(2)).await.unwrap();
        assert_eq!(truncated.history.len(), 2);
        assert_eq!(text_of(&truncated.history[0]), "two");

        let full = coordinator.get_task(task.task_id, None).await.unwrap();
        assert_eq!(full.history.len(), 3);
    }

    #[tokio::test]
    async fn test_list_tasks_scoped_by_context() {
        let coordinator = coordinator();
        let ctx_a = new_entity_id();
        let ctx_b = new_entity_id();

        coordinator
            .message_send(ctx_a, Message::user_text("a1"))
            .await
            .unwrap();
        coordinator
            .message_send(ctx_b, Message::user_text("b1"))
            .await
            .unwrap();

        assert_eq!(coordinator.list_tasks(None, None).await.unwrap().len(), 2);
        let scoped = coordinator.list_tasks(Some(ctx_a), None).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].context_id, ctx_a);
    }

    #[tokio::test]
    async fn test_feedback_round_trip() {
        let coordinator = coordinator();
        let task = coordinator
            .message_send(new_entity_id(), Message::user_text("hi"))
            .await
            .unwrap();

        coordinator
            .store_feedback(task.task_id, json!({"rating": 5, "comment": "great"}))
            .await
            .unwrap();

        let feedback = coordinator.get_feedback(task.task_id).await.unwrap();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].feedback_data["rating"], json!(5));

        let err = coordinator
            .store_feedback(task.task_id, json!({"comment": "no rating"}))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Validation(_)));
    }

    #[tokio::test]
    async fn test_context_create_get_list() {
        let coordinator = coordinator();

        let context = coordinator.create_context().await.unwrap();
        let loaded = coordinator.get_context(context.context_id).await.unwrap();
        assert_eq!(loaded.context_id, context.context_id);
        assert_eq!(coordinator.list_contexts(None).await.unwrap().len(), 1);

        let err = coordinator.get_context(new_entity_id()).await.unwrap_err();
        assert!(matches!(
            err,
            TetherError::Storage(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_clear_context_drops_tasks_and_push_configs() {
        let coordinator = coordinator();
        let context_id = new_entity_id();

        let task = coordinator
            .message_send(context_id, Message::user_text("hi"))
            .await
            .unwrap();
        coordinator
            .set_push_config(PushNotificationConfig {
                task_id: task.task_id,
                url: "https://subscriber.example/events".to_string(),
                token: None,
                authentication: None,
            })
            .await
            .unwrap();

        coordinator.clear_context(Some(context_id)).await.unwrap();

        assert!(coordinator
            .list_tasks(Some(context_id), None)
            .await
            .unwrap()
            .is_empty());
        assert!(coordinator.get_push_config(task.task_id).await.is_none());

        // Idempotent.
        coordinator.clear_context(Some(context_id)).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_all_contexts() {
        let coordinator = coordinator();
        coordinator
            .message_send(new_entity_id(), Message::user_text("a"))
            .await
            .unwrap();
        coordinator
            .message_send(new_entity_id(), Message::user_text("b"))
            .await
            .unwrap();

        coordinator.clear_context(None).await.unwrap();

        assert!(coordinator.list_tasks(None, None).await.unwrap().is_empty());
        assert!(coordinator.list_contexts(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_push_config_requires_existing_task() {
        let coordinator = coordinator();
        let err = coordinator
            .set_push_config(PushNotificationConfig {
                task_id: new_entity_id(),
                url: "https://subscriber.example/events".to_string(),
                token: None,
                authentication: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TetherError::Storage(StorageError::NotFound { .. })
        ));
    }
}
