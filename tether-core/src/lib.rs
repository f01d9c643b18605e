//! Tether Core - Entity Types
//!
//! Pure data structures for the Tether persistence engine. All other crates
//! depend on this. This crate contains the protocol entities, the task state
//! machine, and the shared error taxonomy - no storage, no I/O.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod entities;
pub mod enums;
pub mod error;

pub use entities::{
    Artifact, Context, FileSource, Message, Part, PushNotificationConfig, Task, TaskFeedback,
};
pub use enums::{EntityKind, Role, TaskState};
pub use error::{ConfigError, StorageError, TetherError, TetherResult, ValidationError};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
/// UUIDv7 embeds a Unix timestamp, making IDs naturally sortable by creation time.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier of a [`Task`].
pub type TaskId = EntityId;

/// Identifier of a [`Context`].
pub type ContextId = EntityId;

/// Identifier of a [`Message`].
pub type MessageId = EntityId;

/// Identifier of an [`Artifact`].
pub type ArtifactId = EntityId;

/// Identifier of a [`TaskFeedback`] record.
pub type FeedbackId = EntityId;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Sequentially generated ids sort in creation order, which is what
        /// most-recent-first task listings rely on.
        #[test]
        fn prop_entity_ids_are_timestamp_sortable(_iteration in 0..100u32) {
            let id1 = new_entity_id();
            std::thread::sleep(std::time::Duration::from_millis(1));
            let id2 = new_entity_id();

            prop_assert!(id1.to_string() < id2.to_string(),
                "id1 ({}) should sort before id2 ({})", id1, id2);
        }

        #[test]
        fn prop_entity_ids_are_v7(_iteration in 0..100u32) {
            let id = new_entity_id();
            prop_assert_eq!(id.get_version_num(), 7);
        }
    }
}
