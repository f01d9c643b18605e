//! Connection pool configuration.

use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use std::time::Duration;
use tether_core::{ConfigError, TetherResult};
use tokio_postgres::NoTls;

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub pool_max: usize,
    /// Per-connection connect timeout
    pub connect_timeout: Duration,
    /// Upper bound for any single storage operation, pool acquisition
    /// included. Exceeding it surfaces `StorageError::Unavailable`.
    pub command_timeout: Duration,
    /// Maximum retry attempts after the initial try for transient failures
    pub retry_max: u32,
    /// Fixed delay between retry attempts
    pub retry_delay: Duration,
    /// Run the embedded schema bootstrap at startup
    pub auto_migrate: bool,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "tether".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            pool_max: 16,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            retry_max: 3,
            retry_delay: Duration::from_millis(200),
            auto_migrate: true,
        }
    }
}

impl PgConfig {
    /// Create a new database configuration from environment variables.
    ///
    /// Environment variables (all optional, with defaults):
    /// - `TETHER_DB_HOST`, `TETHER_DB_PORT`, `TETHER_DB_NAME`,
    ///   `TETHER_DB_USER`, `TETHER_DB_PASSWORD`
    /// - `TETHER_DB_POOL_SIZE`: max pool size (default: 16)
    /// - `TETHER_DB_CONNECT_TIMEOUT`: seconds (default: 10)
    /// - `TETHER_DB_COMMAND_TIMEOUT`: seconds (default: 30)
    /// - `TETHER_DB_RETRY_MAX`: retry attempts (default: 3)
    /// - `TETHER_DB_RETRY_DELAY_MS`: milliseconds (default: 200)
    /// - `TETHER_DB_AUTO_MIGRATE`: "true" or "false" (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("TETHER_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("TETHER_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("TETHER_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("TETHER_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("TETHER_DB_PASSWORD").unwrap_or_default(),
            pool_max: std::env::var("TETHER_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.pool_max),
            connect_timeout: std::env::var("TETHER_DB_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            command_timeout: std::env::var("TETHER_DB_COMMAND_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.command_timeout),
            retry_max: std::env::var("TETHER_DB_RETRY_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retry_max),
            retry_delay: std::env::var("TETHER_DB_RETRY_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            auto_migrate: std::env::var("TETHER_DB_AUTO_MIGRATE")
                .ok()
                .map(|s| s.to_lowercase() != "false")
                .unwrap_or(defaults.auto_migrate),
        }
    }

    /// Basic sanity checks before a pool is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "host".to_string(),
            });
        }
        if self.pool_max == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool_max".to_string(),
                value: "0".to_string(),
                reason: "pool must allow at least one connection".to_string(),
            });
        }
        if self.command_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "command_timeout".to_string(),
                value: "0".to_string(),
                reason: "operations need a non-zero time budget".to_string(),
            });
        }
        Ok(())
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> TetherResult<Pool> {
        self.validate()?;

        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.connect_timeout = Some(self.connect_timeout);
        cfg.pool = Some(PoolConfig::new(self.pool_max));

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| tether_core::StorageError::Unavailable {
                reason: format!("failed to create pool: {}", e),
            })?;

        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PgConfig::default();
        assert_eq!(config.pool_max, 16);
        assert_eq!(config.retry_max, 3);
        assert!(config.auto_migrate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let config = PgConfig {
            pool_max: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = PgConfig {
            command_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
