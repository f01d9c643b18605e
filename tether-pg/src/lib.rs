//! Tether PostgreSQL Backend
//!
//! Durable implementation of the `TaskStore` contract over PostgreSQL using
//! deadpool-postgres connection pooling. Conversational content (`history`,
//! `artifacts`, `metadata`, `context_data`, `message_history`) lives in JSONB
//! columns inside otherwise relational rows, so the protocol payload can
//! evolve without schema migration while ids, state and timestamps stay
//! indexed scalar columns.
//!
//! Concurrency: every mutating operation runs inside a single transaction and
//! takes `SELECT ... FOR UPDATE` on the affected rows, so concurrent appends
//! to the same task serialize at the row lock and commit atomically.
//! Transient connectivity failures are retried with a fixed delay up to a
//! configured bound before surfacing `StorageError::Unavailable`.

pub mod config;
pub mod schema;
pub mod store;

pub use config::PgConfig;
pub use store::PgStore;
