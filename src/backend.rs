//! Storage backend contract.
//!
//! A backend realizes the atomic bucket and block operations on top of a
//! concrete store. All operations are keyed; a backend must make every
//! operation atomic with respect to other operations on the same key, so
//! that concurrent callers serialize into a total order per key. Across
//! keys no ordering is promised.
//!
//! Backends either succeed or fail with [`Error::Storage`]; they never
//! expose partially updated state. Callers treat any failure as fatal for
//! the request in flight, and the core performs no retries.
//!
//! [`Error::Storage`]: crate::error::Error::Storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;

/// Observed bucket state after an operation.
///
/// `level` is the effective level at the store's clock. `full` uses the
/// strict `level >= capacity` convention; every backend applies the same
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
	pub level: f64,
	pub full: bool,
}

/// Outcome of a conditional fillup.
///
/// When `accepted` is false the fillup was not applied and `level` is the
/// post-leak level that was persisted instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConditionalFillup {
	pub level: f64,
	pub full: bool,
	pub accepted: bool,
}

/// The atomic operation set shared by all storage backends.
///
/// Four implementations ship with the crate: [`MemoryBackend`] (always
/// available), and the `postgres`, `sqlite` and `redis-backend` feature
/// gated backends.
///
/// [`MemoryBackend`]: crate::backends::MemoryBackend
#[async_trait]
pub trait StorageBackend: Send + Sync {
	/// Read the effective level for `key` without mutating anything.
	///
	/// The effective level is the stored level minus what leaked since the
	/// bucket was last touched, clamped into `[0, capacity]`. A key with no
	/// bucket reads as a zero, non-full state.
	async fn state(&self, key: &str, capacity: f64, leak_rate: f64) -> Result<BucketState>;

	/// Unconditional fillup: add `n_tokens` (which may be negative) to the
	/// effective level and clamp the result into `[0, capacity]`.
	///
	/// The write also refreshes `last_touched_at` and pushes the bucket's
	/// deletion horizon to `now + 2 * capacity / leak_rate`. The
	/// read-modify-write commits as a single atomic step.
	async fn add_tokens(
		&self,
		key: &str,
		capacity: f64,
		leak_rate: f64,
		n_tokens: f64,
	) -> Result<BucketState>;

	/// Conditional fillup: apply `n_tokens` entirely, or not at all.
	///
	/// The fillup is rejected when the post-leak level plus `n_tokens`
	/// would exceed `capacity`; the leak update is still persisted in that
	/// case. Filling exactly to capacity is accepted.
	async fn add_tokens_conditionally(
		&self,
		key: &str,
		capacity: f64,
		leak_rate: f64,
		n_tokens: f64,
	) -> Result<ConditionalFillup>;

	/// Install or extend a block on `key`, returning the moment it lapses.
	///
	/// The resulting timestamp is the maximum of any existing block and
	/// `now + block_for`, which makes concurrent installs idempotent.
	/// Fails with [`Error::InvalidConfig`] when `block_for` is zero.
	///
	/// [`Error::InvalidConfig`]: crate::error::Error::InvalidConfig
	async fn set_block(&self, key: &str, block_for: Duration) -> Result<DateTime<Utc>>;

	/// The stored block expiry for `key`, if it lies strictly in the
	/// future. Lapsed blocks read as `None`; no explicit unblock exists.
	async fn blocked_until(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

	/// Delete buckets past their deletion horizon and lapsed blocks.
	///
	/// Returns the number of entries removed (zero where the store expires
	/// keys by TTL). Idempotent and safe to run concurrently with live
	/// traffic.
	async fn prune(&self) -> Result<u64>;

	/// Backend-specific schema initialization. Creates the bucket and
	/// block tables on SQL backends; a no-op elsewhere.
	async fn create_tables(&self) -> Result<()>;
}
