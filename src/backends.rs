//! Storage backend implementations.
//!
//! [`memory::MemoryBackend`] is always available and is the right choice
//! for single-process deployments and tests. The PostgreSQL, SQLite and
//! Redis backends are feature gated and share their state with every
//! process that points at the same store.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis-backend")]
pub mod redis_backend;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryBackend;
#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;
#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
