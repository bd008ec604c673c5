//! Throttle: a leaky bucket with a timed block armed on overflow.
//!
//! A [`Throttle`] answers "may this request proceed" for one key. While no
//! block is active it charges the request against its bucket; the first
//! request that overflows the bucket installs a block, and until that
//! block lapses every request on the key is refused without consulting
//! the bucket at all.
//!
//! The block check, the conditional fillup and the block install are
//! three separate atomic steps, not one transaction. That is sound
//! because installing a block is idempotent under `max` and an installed
//! block dominates every later bucket observation: among concurrent
//! callers the first overflow arms the block, and stragglers either see
//! it or harmlessly re-arm it to the same deadline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::StorageBackend;
use crate::bucket::{LeakyBucket, LeakyBucketBuilder};
use crate::error::{Error, Result};

/// Outcome of a throttle request.
///
/// Serializable so that cache layers can persist it; see
/// [`CachedThrottle`](crate::cached::CachedThrottle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleState {
	/// When the active block lapses, or `None` when the request went
	/// through.
	pub blocked_until: Option<DateTime<Utc>>,
}

impl ThrottleState {
	pub(crate) fn unblocked() -> Self {
		Self {
			blocked_until: None,
		}
	}

	pub(crate) fn blocked_at(blocked_until: DateTime<Utc>) -> Self {
		Self {
			blocked_until: Some(blocked_until),
		}
	}

	/// Whether the block is still in effect. Purely local arithmetic
	/// against the current wall clock, so a cached state expires on its
	/// own without a store round-trip.
	pub fn blocked(&self) -> bool {
		matches!(self.blocked_until, Some(until) if until > Utc::now())
	}

	/// Whole seconds until the block lapses, rounded up; zero when the
	/// state is not blocked.
	pub fn retry_after_seconds(&self) -> u64 {
		match self.blocked_until {
			Some(until) => {
				let remaining = (until - Utc::now()).as_seconds_f64();
				if remaining <= 0.0 {
					0
				} else {
					remaining.ceil() as u64
				}
			}
			None => 0,
		}
	}
}

/// A leaky bucket and a block under one shared key.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use sluice::{MemoryBackend, Throttle};
///
/// # tokio_test::block_on(async {
/// let throttle = Throttle::builder()
/// 	.key("api:alice")
/// 	.capacity(30.0)
/// 	.over_time(Duration::from_secs(1))
/// 	.backend(Arc::new(MemoryBackend::new()))
/// 	.build()
/// 	.unwrap();
///
/// let state = throttle.request(1.0).await.unwrap();
/// assert!(!state.blocked());
/// # });
/// ```
#[derive(Clone)]
pub struct Throttle {
	block_for: Duration,
	bucket: LeakyBucket,
	backend: Arc<dyn StorageBackend>,
}

impl Throttle {
	pub fn builder() -> ThrottleBuilder {
		ThrottleBuilder::default()
	}

	pub fn key(&self) -> &str {
		self.bucket.key()
	}

	/// How long an overflow blocks the key for.
	pub fn block_for(&self) -> Duration {
		self.block_for
	}

	pub fn bucket(&self) -> &LeakyBucket {
		&self.bucket
	}

	/// Advisory: no block is active and the bucket currently has room for
	/// `n_tokens`. Racy against other callers, like
	/// [`LeakyBucket::able_to_accept`].
	pub async fn able_to_accept(&self, n_tokens: f64) -> Result<bool> {
		if self.blocked_until().await?.is_some() {
			return Ok(false);
		}
		self.bucket.able_to_accept(n_tokens).await
	}

	/// Ask whether a request of `n_tokens` may proceed.
	///
	/// Charges the bucket conditionally; the request that overflows it
	/// installs a block of [`block_for`](Self::block_for). The returned
	/// state says whether this request was refused and until when.
	pub async fn request(&self, n_tokens: f64) -> Result<ThrottleState> {
		if let Some(blocked_until) = self.backend.blocked_until(self.key()).await? {
			return Ok(ThrottleState::blocked_at(blocked_until));
		}

		let fill = self.bucket.fillup_conditionally(n_tokens).await?;
		if fill.accepted {
			return Ok(ThrottleState::unblocked());
		}

		let blocked_until = self.backend.set_block(self.key(), self.block_for).await?;
		tracing::debug!(key = self.key(), %blocked_until, "bucket overflow armed a block");
		Ok(ThrottleState::blocked_at(blocked_until))
	}

	/// As [`request`](Self::request), but a refused request returns
	/// [`Error::Throttled`] carrying the state and a retry-after hint.
	pub async fn request_strict(&self, n_tokens: f64) -> Result<ThrottleState> {
		let state = self.request(n_tokens).await?;
		if state.blocked() {
			return Err(Error::Throttled {
				key: self.key().to_string(),
				retry_after_seconds: state.retry_after_seconds(),
				state,
			});
		}
		Ok(state)
	}

	/// Run `body` unless the key is throttled, charging one token first.
	///
	/// A prefix guard: the token is charged before `body` runs, and a
	/// refused request skips `body` entirely and returns `None`.
	pub async fn throttled<F, Fut, T>(&self, body: F) -> Result<Option<T>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T>,
	{
		let state = self.request(1.0).await?;
		if state.blocked() {
			return Ok(None);
		}
		Ok(Some(body().await))
	}

	/// Install or extend a block by hand.
	///
	/// Unlike the raw backend call this maps a zero duration to
	/// `Ok(None)` instead of an error, so callers can pass through a
	/// computed duration without guarding it.
	pub async fn block(&self, block_for: Duration) -> Result<Option<DateTime<Utc>>> {
		match self.backend.set_block(self.key(), block_for).await {
			Ok(blocked_until) => Ok(Some(blocked_until)),
			Err(Error::InvalidConfig(_)) => Ok(None),
			Err(other) => Err(other),
		}
	}

	/// When the active block lapses, if one is in effect.
	pub async fn blocked_until(&self) -> Result<Option<DateTime<Utc>>> {
		self.backend.blocked_until(self.key()).await
	}
}

impl std::fmt::Debug for Throttle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Throttle")
			.field("key", &self.key())
			.field("block_for", &self.block_for)
			.field("bucket", &self.bucket)
			.finish_non_exhaustive()
	}
}

/// Builder for [`Throttle`]. Bucket parameters follow
/// [`LeakyBucketBuilder`]; `block_for` defaults to the bucket's natural
/// drain time, `capacity / leak_rate`.
#[derive(Default)]
pub struct ThrottleBuilder {
	bucket: LeakyBucketBuilder,
	block_for: Option<Duration>,
}

impl ThrottleBuilder {
	pub fn key(mut self, key: impl Into<String>) -> Self {
		self.bucket = self.bucket.key(key);
		self
	}

	pub fn capacity(mut self, capacity: f64) -> Self {
		self.bucket = self.bucket.capacity(capacity);
		self
	}

	pub fn leak_rate(mut self, leak_rate: f64) -> Self {
		self.bucket = self.bucket.leak_rate(leak_rate);
		self
	}

	pub fn over_time(mut self, over_time: Duration) -> Self {
		self.bucket = self.bucket.over_time(over_time);
		self
	}

	/// How long an overflow blocks the key for. Defaults to the bucket's
	/// drain time.
	pub fn block_for(mut self, block_for: Duration) -> Self {
		self.block_for = Some(block_for);
		self
	}

	pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
		self.bucket = self.bucket.backend(backend);
		self
	}

	/// # Errors
	///
	/// Returns [`Error::InvalidConfig`] on any bucket validation failure
	/// or a zero `block_for`.
	pub fn build(self) -> Result<Throttle> {
		let bucket = self.bucket.build()?;
		let block_for = match self.block_for {
			Some(block_for) => {
				if block_for.is_zero() {
					return Err(Error::InvalidConfig(
						"block_for must be non-zero".to_string(),
					));
				}
				block_for
			}
			None => Duration::from_secs_f64(bucket.capacity() / bucket.leak_rate()),
		};
		let backend = bucket.backend().clone();
		Ok(Throttle {
			block_for,
			bucket,
			backend,
		})
	}
}
