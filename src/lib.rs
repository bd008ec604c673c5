//! # Sluice
//!
//! Leaky-bucket rate limiting with a timed block layer, backed by atomic
//! state updates in PostgreSQL, SQLite, Redis or process memory.
//!
//! A caller identifies a resource by a string key, declares a capacity
//! and a leak rate, and asks whether a request of N tokens may proceed.
//! Level updates are atomic across concurrent callers sharing the same
//! backing store: the SQL backends fold the leak math into a single
//! upsert executed under the database's own clock, the Redis backend
//! runs it in a server-side script, and the in-memory backend serializes
//! per key behind a mutex. When a request overflows the bucket, the
//! throttle arms a time-bounded block; while the block is in effect,
//! every request on that key is refused without consulting the bucket.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sluice::{MemoryBackend, Throttle};
//!
//! # tokio_test::block_on(async {
//! let throttle = Throttle::builder()
//! 	.key("api:user:42")
//! 	.capacity(30.0)
//! 	.over_time(Duration::from_secs(60))
//! 	.backend(Arc::new(MemoryBackend::new()))
//! 	.build()
//! 	.unwrap();
//!
//! match throttle.request(1.0).await.unwrap() {
//! 	state if state.blocked() => {
//! 		// refuse, advising state.retry_after_seconds()
//! 	}
//! 	_ => {
//! 		// proceed
//! 	}
//! }
//! # });
//! ```
//!
//! Most deployments install one backend for the whole process instead of
//! threading it through every builder:
//!
//! ```
//! use std::sync::Arc;
//! use sluice::{LeakyBucket, MemoryBackend};
//!
//! # tokio_test::block_on(async {
//! sluice::set_default_backend(Arc::new(MemoryBackend::new()));
//!
//! let bucket = LeakyBucket::builder()
//! 	.key("ingest:batch")
//! 	.capacity(100.0)
//! 	.leak_rate(10.0)
//! 	.build()
//! 	.unwrap();
//! assert!(bucket.able_to_accept(1.0).await.unwrap());
//! # sluice::clear_default_backend();
//! # });
//! ```
//!
//! ## Feature flags
//!
//! - `postgres`: [`PostgresBackend`] on `sqlx`'s `PgPool`.
//! - `sqlite`: [`SqliteBackend`] on `sqlx`'s `SqlitePool`.
//! - `redis-backend`: [`RedisBackend`] on `deadpool-redis`.
//!
//! The in-memory backend is always available. All backends implement the
//! same [`StorageBackend`] contract and behave identically modulo clock
//! source; pick the one your deployment shares state through.

pub mod backend;
pub mod backends;
pub mod bucket;
pub mod cached;
pub mod error;
pub mod registry;
pub mod throttle;
pub mod time_provider;

pub use backend::{BucketState, ConditionalFillup, StorageBackend};
pub use backends::MemoryBackend;
#[cfg(feature = "postgres")]
pub use backends::PostgresBackend;
#[cfg(feature = "redis-backend")]
pub use backends::RedisBackend;
#[cfg(feature = "sqlite")]
pub use backends::SqliteBackend;
pub use bucket::{LeakyBucket, LeakyBucketBuilder};
pub use cached::{CachedThrottle, MemoryStateCache, StateCache};
pub use error::{Error, Result};
pub use registry::{clear_default_backend, default_backend, prune, set_default_backend};
pub use throttle::{Throttle, ThrottleBuilder, ThrottleState};
pub use time_provider::{MockTimeProvider, SystemTimeProvider, TimeProvider};
