//! Protocol entities stored by the Tether engine.
//!
//! `history`, `artifacts`, `metadata` and `context_data` are kept as typed
//! in-memory values here; only the durable backend's adapter layer turns them
//! into JSONB. That keeps conversational content schemaless on disk while the
//! engine logic stays fully typed.

use crate::enums::{Role, TaskState};
use crate::error::ValidationError;
use crate::{new_entity_id, ArtifactId, ContextId, FeedbackId, MessageId, TaskId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// MESSAGE & PART
// ============================================================================

/// One element of a message or artifact payload.
///
/// Serialized with an explicit `kind` tag so protocol payloads round-trip
/// through the schemaless JSON columns without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    /// Plain text content.
    Text { text: String },
    /// Structured data payload.
    Data { payload: Value },
    /// File content, either by reference or inline.
    File {
        #[serde(flatten)]
        source: FileSource,
    },
}

/// File content carried by a [`Part::File`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileSource {
    /// File referenced by URI.
    Uri { uri: String },
    /// Inline file content, base64-encoded.
    Bytes { bytes: String },
}

/// Immutable message exchanged between user and agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub role: Role,
    pub parts: Vec<Part>,
    /// Task this message belongs to. Set on continuation messages; `None`
    /// lets the lifecycle coordinator decide continue-vs-create.
    pub task_id: Option<TaskId>,
    pub context_id: Option<ContextId>,
    /// Prior terminal task ids this message follows up on. Copied onto a
    /// newly minted task for conversational continuity.
    #[serde(default)]
    pub reference_task_ids: Vec<TaskId>,
    pub timestamp: Timestamp,
}

impl Message {
    /// Build a user message with a single text part.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            message_id: new_entity_id(),
            role: Role::User,
            parts: vec![Part::Text { text: text.into() }],
            task_id: None,
            context_id: None,
            reference_task_ids: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Build an agent message with a single text part.
    pub fn agent_text(text: impl Into<String>) -> Self {
        Self {
            message_id: new_entity_id(),
            role: Role::Agent,
            parts: vec![Part::Text { text: text.into() }],
            task_id: None,
            context_id: None,
            reference_task_ids: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Validate the message before any mutation is attempted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.parts.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "parts".to_string(),
            });
        }
        for part in &self.parts {
            if let Part::File {
                source: FileSource::Uri { uri },
            } = part
            {
                if uri.trim().is_empty() {
                    return Err(ValidationError::InvalidValue {
                        field: "parts.file.uri".to_string(),
                        reason: "empty file URI".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// ARTIFACT
// ============================================================================

/// Immutable output produced by task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: ArtifactId,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Artifact {
    /// Build an artifact with a single text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            artifact_id: new_entity_id(),
            parts: vec![Part::Text { text: text.into() }],
            metadata: Map::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.parts.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "parts".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// TASK
// ============================================================================

/// A unit of agent work with an append-only history and a terminal or
/// non-terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub context_id: ContextId,
    pub state: TaskState,
    /// When the task entered its current state.
    pub state_timestamp: Timestamp,
    /// Append-only message history, oldest first.
    pub history: Vec<Message>,
    /// Append-only artifacts produced by execution.
    pub artifacts: Vec<Artifact>,
    /// Application metadata, last-write-wins per top-level key.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Prior terminal task ids this task continues, for conversational
    /// continuity across terminal boundaries.
    #[serde(default)]
    pub reference_task_ids: Vec<TaskId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Task {
    /// Create a new task in `Submitted` state seeded with its first message.
    pub fn new(context_id: ContextId, mut first_message: Message) -> Self {
        let task_id = new_entity_id();
        let now = Utc::now();
        let reference_task_ids = first_message.reference_task_ids.clone();
        first_message.task_id = Some(task_id);
        first_message.context_id = Some(context_id);
        Self {
            task_id,
            context_id,
            state: TaskState::Submitted,
            state_timestamp: now,
            history: vec![first_message],
            artifacts: Vec::new(),
            metadata: Map::new(),
            reference_task_ids,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Keep only the most recent `n` history messages. Read-side helper used
    /// by `load_task(history_length)`; stored state is never truncated.
    pub fn truncate_history(&mut self, n: usize) {
        if self.history.len() > n {
            self.history.drain(..self.history.len() - n);
        }
    }
}

// ============================================================================
// CONTEXT
// ============================================================================

/// A conversation grouping zero or more tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub context_id: ContextId,
    /// Arbitrary application-defined data.
    #[serde(default)]
    pub context_data: Map<String, Value>,
    /// Context-level message history, oldest first.
    #[serde(default)]
    pub message_history: Vec<Message>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Context {
    pub fn new(context_id: ContextId) -> Self {
        let now = Utc::now();
        Self {
            context_id,
            context_data: Map::new(),
            message_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// TASK FEEDBACK
// ============================================================================

/// Caller feedback attached to a task. Many records may exist per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFeedback {
    pub feedback_id: FeedbackId,
    pub task_id: TaskId,
    /// Contains at least `rating: integer`, optionally `comment: string`.
    pub feedback_data: Value,
    pub created_at: Timestamp,
}

impl TaskFeedback {
    pub fn new(task_id: TaskId, feedback_data: Value) -> Self {
        Self {
            feedback_id: new_entity_id(),
            task_id,
            feedback_data,
            created_at: Utc::now(),
        }
    }

    /// Validate a feedback payload before any mutation is attempted.
    pub fn validate_data(data: &Value) -> Result<(), ValidationError> {
        let obj = data.as_object().ok_or_else(|| ValidationError::InvalidValue {
            field: "feedback_data".to_string(),
            reason: "expected a JSON object".to_string(),
        })?;
        match obj.get("rating") {
            None => {
                return Err(ValidationError::RequiredFieldMissing {
                    field: "rating".to_string(),
                })
            }
            Some(rating) if !rating.is_i64() && !rating.is_u64() => {
                return Err(ValidationError::InvalidValue {
                    field: "rating".to_string(),
                    reason: "must be an integer".to_string(),
                });
            }
            Some(_) => {}
        }
        if let Some(comment) = obj.get("comment") {
            if !comment.is_string() {
                return Err(ValidationError::InvalidValue {
                    field: "comment".to_string(),
                    reason: "must be a string".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// PUSH NOTIFICATION CONFIG
// ============================================================================

/// Authentication details for a push subscriber endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAuthentication {
    /// Supported schemes, e.g. `["bearer"]`.
    pub schemes: Vec<String>,
    pub credentials: Option<String>,
}

/// Per-task push subscription. One active config per task, last set wins;
/// absence means push is disabled for that task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNotificationConfig {
    pub task_id: TaskId,
    /// Subscriber endpoint receiving lifecycle events.
    pub url: String,
    /// Bearer token sent with each delivery, if set.
    pub token: Option<String>,
    pub authentication: Option<PushAuthentication>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_part_serde_tagged_union() {
        let text = Part::Text {
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&text).unwrap();
        assert_eq!(json, json!({"kind": "text", "text": "hi"}));

        let file: Part = serde_json::from_value(json!({
            "kind": "file",
            "uri": "https://example.com/report.pdf"
        }))
        .unwrap();
        assert!(matches!(
            file,
            Part::File {
                source: FileSource::Uri { .. }
            }
        ));

        let data: Part =
            serde_json::from_value(json!({"kind": "data", "payload": {"a": 1}})).unwrap();
        assert!(matches!(data, Part::Data { .. }));
    }

    #[test]
    fn test_message_validate_rejects_empty_parts() {
        let mut msg = Message::user_text("hello");
        msg.parts.clear();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_task_new_seeds_history() {
        let context_id = crate::new_entity_id();
        let task = Task::new(context_id, Message::user_text("hi"));

        assert_eq!(task.state, TaskState::Submitted);
        assert_eq!(task.history.len(), 1);
        assert_eq!(task.history[0].task_id, Some(task.task_id));
        assert_eq!(task.history[0].context_id, Some(context_id));
    }

    #[test]
    fn test_truncate_history_keeps_most_recent() {
        let context_id = crate::new_entity_id();
        let mut task = Task::new(context_id, Message::user_text("one"));
        task.history.push(Message::user_text("two"));
        task.history.push(Message::user_text("three"));

        task.truncate_history(2);

        assert_eq!(task.history.len(), 2);
        assert!(matches!(&task.history[0].parts[0], Part::Text { text } if text == "two"));
    }

    #[test]
    fn test_feedback_validation() {
        assert!(TaskFeedback::validate_data(&json!({"rating": 5})).is_ok());
        assert!(TaskFeedback::validate_data(&json!({"rating": 5, "comment": "good"})).is_ok());
        assert!(TaskFeedback::validate_data(&json!({"comment": "missing rating"})).is_err());
        assert!(TaskFeedback::validate_data(&json!({"rating": "five"})).is_err());
        assert!(TaskFeedback::validate_data(&json!({"rating": 3, "comment": 7})).is_err());
        assert!(TaskFeedback::validate_data(&json!([1, 2])).is_err());
    }
}
