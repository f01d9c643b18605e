//! Enums shared across the Tether workspace.

use serde::{Deserialize, Serialize};

/// Entity type discriminator for errors and polymorphic references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Task,
    Context,
    Message,
    Artifact,
    Feedback,
    PushConfig,
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    System,
}

/// Lifecycle state of a task.
///
/// `Completed`, `Failed` and `Canceled` are terminal: once a task enters one
/// of them its history, artifacts and state become immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    AuthRequired,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    /// Whether this state permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled
        )
    }

    /// Whether a task in this state is waiting on a continuation message
    /// from the caller (resumes to `Working` under the same task id).
    pub fn awaits_continuation(&self) -> bool {
        matches!(self, TaskState::InputRequired | TaskState::AuthRequired)
    }

    /// Whether the state machine allows a transition from `self` to `next`.
    ///
    /// ```text
    /// submitted -> working
    /// working   -> completed | failed | canceled | input-required | auth-required
    /// input-required -> working
    /// auth-required  -> working
    /// ```
    /// Cancellation is additionally allowed from any non-terminal state.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == TaskState::Canceled {
            return true;
        }
        match self {
            TaskState::Submitted => next == TaskState::Working,
            TaskState::Working => matches!(
                next,
                TaskState::Completed
                    | TaskState::Failed
                    | TaskState::InputRequired
                    | TaskState::AuthRequired
            ),
            TaskState::InputRequired | TaskState::AuthRequired => next == TaskState::Working,
            _ => false,
        }
    }

    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::InputRequired => "input-required",
            TaskState::AuthRequired => "auth-required",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(TaskState::Submitted),
            "working" => Some(TaskState::Working),
            "input-required" => Some(TaskState::InputRequired),
            "auth-required" => Some(TaskState::AuthRequired),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            "canceled" => Some(TaskState::Canceled),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [TaskState; 7] = [
        TaskState::Submitted,
        TaskState::Working,
        TaskState::InputRequired,
        TaskState::AuthRequired,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Canceled,
    ];

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Submitted.is_terminal());
        assert!(!TaskState::Working.is_terminal());
        assert!(!TaskState::InputRequired.is_terminal());
        assert!(!TaskState::AuthRequired.is_terminal());
    }

    #[test]
    fn test_submitted_transitions() {
        assert!(TaskState::Submitted.can_transition_to(TaskState::Working));
        assert!(TaskState::Submitted.can_transition_to(TaskState::Canceled));
        assert!(!TaskState::Submitted.can_transition_to(TaskState::Completed));
    }

    #[test]
    fn test_working_transitions() {
        assert!(TaskState::Working.can_transition_to(TaskState::Completed));
        assert!(TaskState::Working.can_transition_to(TaskState::Failed));
        assert!(TaskState::Working.can_transition_to(TaskState::Canceled));
        assert!(TaskState::Working.can_transition_to(TaskState::InputRequired));
        assert!(TaskState::Working.can_transition_to(TaskState::AuthRequired));
        assert!(!TaskState::Working.can_transition_to(TaskState::Submitted));
    }

    #[test]
    fn test_continuation_resumes_to_working() {
        assert!(TaskState::InputRequired.can_transition_to(TaskState::Working));
        assert!(TaskState::AuthRequired.can_transition_to(TaskState::Working));
        assert!(!TaskState::InputRequired.can_transition_to(TaskState::Completed));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [TaskState::Completed, TaskState::Failed, TaskState::Canceled] {
            for next in ALL_STATES {
                assert!(
                    !terminal.can_transition_to(next),
                    "{:?} -> {:?} must be rejected",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn test_db_str_round_trip() {
        for state in ALL_STATES {
            assert_eq!(TaskState::from_db_str(state.as_db_str()), Some(state));
        }
        assert_eq!(TaskState::from_db_str("bogus"), None);
    }

    #[test]
    fn test_serde_uses_kebab_case() {
        let json = serde_json::to_string(&TaskState::InputRequired).unwrap();
        assert_eq!(json, "\"input-required\"");
        let back: TaskState = serde_json::from_str("\"auth-required\"").unwrap();
        assert_eq!(back, TaskState::AuthRequired);
    }
}
