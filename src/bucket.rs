//! Leaky bucket facade.
//!
//! A [`LeakyBucket`] binds a key, a capacity and a leak rate to a storage
//! backend. The bucket itself holds no mutable state: every observation
//! and update happens in the backing store, atomically per key, so any
//! number of clones (or processes, for the central backends) can share
//! one bucket identity.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BucketState, ConditionalFillup, StorageBackend};
use crate::error::{Error, Result};
use crate::registry;

/// A leaky bucket bound to one key.
///
/// Tokens are added through [`fillup`](Self::fillup) and
/// [`fillup_conditionally`](Self::fillup_conditionally) and drain
/// continuously at `leak_rate` tokens per second.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use sluice::{LeakyBucket, MemoryBackend};
///
/// # tokio_test::block_on(async {
/// let bucket = LeakyBucket::builder()
/// 	.key("uploads:alice")
/// 	.capacity(10.0)
/// 	.leak_rate(2.0)
/// 	.backend(Arc::new(MemoryBackend::new()))
/// 	.build()
/// 	.unwrap();
///
/// let state = bucket.fillup(3.0).await.unwrap();
/// assert_eq!(state.level, 3.0);
/// assert!(!state.full);
/// # });
/// ```
#[derive(Clone)]
pub struct LeakyBucket {
	key: String,
	capacity: f64,
	leak_rate: f64,
	backend: Arc<dyn StorageBackend>,
}

impl LeakyBucket {
	pub fn builder() -> LeakyBucketBuilder {
		LeakyBucketBuilder::default()
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	pub fn capacity(&self) -> f64 {
		self.capacity
	}

	/// Tokens drained per second.
	pub fn leak_rate(&self) -> f64 {
		self.leak_rate
	}

	pub(crate) fn backend(&self) -> &Arc<dyn StorageBackend> {
		&self.backend
	}

	/// Add `n_tokens` unconditionally; the stored level is clamped into
	/// `[0, capacity]`. Negative amounts drain the bucket.
	pub async fn fillup(&self, n_tokens: f64) -> Result<BucketState> {
		self.backend
			.add_tokens(&self.key, self.capacity, self.leak_rate, n_tokens)
			.await
	}

	/// Add `n_tokens` only if they all fit, returning whether they were
	/// accepted alongside the resulting level.
	pub async fn fillup_conditionally(&self, n_tokens: f64) -> Result<ConditionalFillup> {
		self.backend
			.add_tokens_conditionally(&self.key, self.capacity, self.leak_rate, n_tokens)
			.await
	}

	/// The current effective level. Interpret results of a previous fillup
	/// from that fillup's returned state instead of re-reading: tokens
	/// keep leaking between calls.
	pub async fn state(&self) -> Result<BucketState> {
		self.backend
			.state(&self.key, self.capacity, self.leak_rate)
			.await
	}

	/// Whether `n_tokens` would currently fit. Advisory by construction:
	/// another caller can touch the bucket between this read and any
	/// subsequent fillup.
	pub async fn able_to_accept(&self, n_tokens: f64) -> Result<bool> {
		let state = self.state().await?;
		Ok(state.level + n_tokens <= self.capacity)
	}
}

impl std::fmt::Debug for LeakyBucket {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LeakyBucket")
			.field("key", &self.key)
			.field("capacity", &self.capacity)
			.field("leak_rate", &self.leak_rate)
			.finish_non_exhaustive()
	}
}

/// Builder for [`LeakyBucket`].
///
/// Exactly one of [`leak_rate`](Self::leak_rate) and
/// [`over_time`](Self::over_time) must be supplied. When the backend is
/// omitted the process-wide default backend is used.
#[derive(Default)]
pub struct LeakyBucketBuilder {
	key: Option<String>,
	capacity: Option<f64>,
	leak_rate: Option<f64>,
	over_time: Option<Duration>,
	backend: Option<Arc<dyn StorageBackend>>,
}

impl LeakyBucketBuilder {
	/// Bucket identity. Keys sharing a prefix do not interact.
	pub fn key(mut self, key: impl Into<String>) -> Self {
		self.key = Some(key.into());
		self
	}

	/// Maximum number of retained tokens. Must be positive.
	pub fn capacity(mut self, capacity: f64) -> Self {
		self.capacity = Some(capacity);
		self
	}

	/// Tokens drained per second. Mutually exclusive with `over_time`.
	pub fn leak_rate(mut self, leak_rate: f64) -> Self {
		self.leak_rate = Some(leak_rate);
		self
	}

	/// Time a full bucket takes to drain completely; the leak rate is
	/// derived as `capacity / over_time`. Mutually exclusive with
	/// `leak_rate`.
	pub fn over_time(mut self, over_time: Duration) -> Self {
		self.over_time = Some(over_time);
		self
	}

	pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
		self.backend = Some(backend);
		self
	}

	/// # Errors
	///
	/// Returns [`Error::InvalidConfig`] when the key is missing or empty,
	/// the capacity is not a positive finite number, both or neither of
	/// `leak_rate`/`over_time` are set, or no backend is available.
	pub fn build(self) -> Result<LeakyBucket> {
		let key = self
			.key
			.filter(|key| !key.is_empty())
			.ok_or_else(|| Error::InvalidConfig("key must be set and non-empty".to_string()))?;
		let capacity = self
			.capacity
			.ok_or_else(|| Error::InvalidConfig("capacity must be set".to_string()))?;
		if !capacity.is_finite() || capacity <= 0.0 {
			return Err(Error::InvalidConfig(
				"capacity must be a positive number".to_string(),
			));
		}

		let leak_rate = match (self.leak_rate, self.over_time) {
			(Some(_), Some(_)) => {
				return Err(Error::InvalidConfig(
					"leak_rate and over_time are mutually exclusive".to_string(),
				));
			}
			(None, None) => {
				return Err(Error::InvalidConfig(
					"either leak_rate or over_time must be set".to_string(),
				));
			}
			(Some(leak_rate), None) => {
				if !leak_rate.is_finite() || leak_rate <= 0.0 {
					return Err(Error::InvalidConfig(
						"leak_rate must be a positive number".to_string(),
					));
				}
				leak_rate
			}
			(None, Some(over_time)) => {
				if over_time.is_zero() {
					return Err(Error::InvalidConfig(
						"over_time must be non-zero".to_string(),
					));
				}
				capacity / over_time.as_secs_f64()
			}
		};

		let backend = match self.backend {
			Some(backend) => backend,
			None => registry::default_backend()?,
		};

		Ok(LeakyBucket {
			key,
			capacity,
			leak_rate,
			backend,
		})
	}
}
