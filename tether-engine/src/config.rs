//! Engine configuration.
//!
//! Loaded from environment variables with sensible defaults for
//! development, following the `TETHER_*` convention used by the durable
//! backend's `PgConfig`.

use std::time::Duration;
use tether_pg::PgConfig;

/// Which storage backend to construct at startup.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Process-local, lock-protected maps. Reference/test backend.
    Memory,
    /// Pooled, retrying PostgreSQL backend.
    Postgres(PgConfig),
}

/// Push notification delivery settings.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Per-delivery request timeout. A slow subscriber can never delay
    /// task-state persistence; this only bounds the detached delivery task.
    pub delivery_timeout: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

impl PushConfig {
    /// Environment variables:
    /// - `TETHER_PUSH_TIMEOUT`: delivery timeout in seconds (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            delivery_timeout: std::env::var("TETHER_PUSH_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.delivery_timeout),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: BackendConfig,
    pub push: PushConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::Memory,
            push: PushConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Environment variables:
    /// - `TETHER_BACKEND`: "memory" (default) or "postgres"
    /// - `TETHER_DB_*`: see [`PgConfig::from_env`]
    /// - `TETHER_PUSH_TIMEOUT`: see [`PushConfig::from_env`]
    pub fn from_env() -> Self {
        let backend = match std::env::var("TETHER_BACKEND").as_deref() {
            Ok("postgres") => BackendConfig::Postgres(PgConfig::from_env()),
            _ => BackendConfig::Memory,
        };
        Self {
            backend,
            push: PushConfig::from_env(),
        }
    }
}
