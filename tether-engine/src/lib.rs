//! Tether Engine - Lifecycle Coordination and Push Notifications
//!
//! Sits above the storage contract and is backend-agnostic: the
//! [`LifecycleCoordinator`] enforces the task state machine and the
//! continue-vs-create decision for inbound messages, and the
//! [`PushNotificationManager`] delivers lifecycle events to external
//! subscribers without ever blocking or failing the primary write path.

pub mod config;
pub mod lifecycle;
pub mod push;

pub use config::{BackendConfig, EngineConfig, PushConfig};
pub use lifecycle::LifecycleCoordinator;
pub use push::{PushNotificationManager, StatusUpdateEvent, TaskStatus};

use std::sync::Arc;
use tether_core::TetherResult;
use tether_pg::PgStore;
use tether_storage::{MemoryStore, TaskStore};

/// Construct the storage backend selected by configuration.
///
/// Exactly two variants exist; the choice is made once at process startup
/// and never switched at runtime.
pub async fn connect(config: &EngineConfig) -> TetherResult<Arc<dyn TaskStore>> {
    match &config.backend {
        BackendConfig::Memory => {
            tracing::info!("using in-memory storage backend");
            Ok(Arc::new(MemoryStore::new()))
        }
        BackendConfig::Postgres(pg) => {
            tracing::info!(host = %pg.host, dbname = %pg.dbname, "using PostgreSQL storage backend");
            Ok(Arc::new(PgStore::connect(pg.clone()).await?))
        }
    }
}

/// Construct a fully wired coordinator from configuration.
pub async fn build_coordinator(config: &EngineConfig) -> TetherResult<LifecycleCoordinator> {
    let store = connect(config).await?;
    let push = Arc::new(PushNotificationManager::new(config.push.clone()));
    Ok(LifecycleCoordinator::new(store, push))
}
