//! In-memory storage backend.
//!
//! State lives in process memory: one map for bucket records, one for
//! blocks, and a coarse map handing out a per-key mutex. Every operation
//! acquires its key's mutex for the whole read-modify-write, which gives
//! the same per-key serialization the central stores get from row locks.
//!
//! Level math runs on a monotonic [`TimeProvider`] clock; wall-clock
//! timestamps are produced only at the API boundary by projecting the
//! remaining monotonic interval onto the system clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::{BucketState, ConditionalFillup, StorageBackend};
use crate::error::{Error, Result};
use crate::time_provider::{SystemTimeProvider, TimeProvider, project_deadline};

#[derive(Debug, Clone, Copy)]
struct BucketEntry {
	level: f64,
	last_touched: Instant,
	may_be_deleted_after: Instant,
}

/// Process-local backend with per-key locking.
pub struct MemoryBackend<T: TimeProvider = SystemTimeProvider> {
	time_provider: Arc<T>,
	locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
	buckets: Mutex<HashMap<String, BucketEntry>>,
	blocks: Mutex<HashMap<String, Instant>>,
}

impl MemoryBackend<SystemTimeProvider> {
	/// Creates a backend on the monotonic process clock.
	///
	/// # Examples
	///
	/// ```
	/// use sluice::backends::MemoryBackend;
	/// use sluice::StorageBackend;
	///
	/// # tokio_test::block_on(async {
	/// let backend = MemoryBackend::new();
	/// let state = backend.add_tokens("job:alpha", 10.0, 1.0, 3.0).await.unwrap();
	/// assert_eq!(state.level, 3.0);
	/// assert!(!state.full);
	/// # });
	/// ```
	pub fn new() -> Self {
		Self::with_time_provider(Arc::new(SystemTimeProvider::new()))
	}
}

impl Default for MemoryBackend<SystemTimeProvider> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: TimeProvider> MemoryBackend<T> {
	/// Creates a backend on a custom clock, usually a
	/// [`MockTimeProvider`](crate::time_provider::MockTimeProvider) in tests.
	pub fn with_time_provider(time_provider: Arc<T>) -> Self {
		Self {
			time_provider,
			locks: Mutex::new(HashMap::new()),
			buckets: Mutex::new(HashMap::new()),
			blocks: Mutex::new(HashMap::new()),
		}
	}

	/// Hand out the mutex serializing operations on `key`.
	fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
		let mut locks = self.locks.lock();
		locks.entry(key.to_string()).or_default().clone()
	}

	/// Effective level at `now`, per the leak invariant.
	fn leaked_level(entry: &BucketEntry, now: Instant, capacity: f64, leak_rate: f64) -> f64 {
		let elapsed = now.duration_since(entry.last_touched).as_secs_f64();
		(entry.level - elapsed * leak_rate).clamp(0.0, capacity)
	}

	/// How long an untouched bucket stays around: twice its drain time.
	fn retention(capacity: f64, leak_rate: f64) -> Result<Duration> {
		Duration::try_from_secs_f64(2.0 * capacity / leak_rate).map_err(|_| {
			Error::InvalidConfig(format!(
				"capacity {capacity} and leak_rate {leak_rate} produce an invalid retention window"
			))
		})
	}
}

#[async_trait]
impl<T: TimeProvider> StorageBackend for MemoryBackend<T> {
	async fn state(&self, key: &str, capacity: f64, leak_rate: f64) -> Result<BucketState> {
		let lock = self.key_lock(key);
		let _guard = lock.lock();
		let now = self.time_provider.now();

		let buckets = self.buckets.lock();
		let level = buckets
			.get(key)
			.map(|entry| Self::leaked_level(entry, now, capacity, leak_rate))
			.unwrap_or(0.0);
		Ok(BucketState {
			level,
			full: level >= capacity,
		})
	}

	async fn add_tokens(
		&self,
		key: &str,
		capacity: f64,
		leak_rate: f64,
		n_tokens: f64,
	) -> Result<BucketState> {
		let retention = Self::retention(capacity, leak_rate)?;
		let lock = self.key_lock(key);
		let _guard = lock.lock();
		let now = self.time_provider.now();

		let mut buckets = self.buckets.lock();
		let pre = buckets
			.get(key)
			.map(|entry| Self::leaked_level(entry, now, capacity, leak_rate))
			.unwrap_or(0.0);
		let post = (pre + n_tokens).clamp(0.0, capacity);
		buckets.insert(
			key.to_string(),
			BucketEntry {
				level: post,
				last_touched: now,
				may_be_deleted_after: now + retention,
			},
		);
		Ok(BucketState {
			level: post,
			full: post >= capacity,
		})
	}

	async fn add_tokens_conditionally(
		&self,
		key: &str,
		capacity: f64,
		leak_rate: f64,
		n_tokens: f64,
	) -> Result<ConditionalFillup> {
		let retention = Self::retention(capacity, leak_rate)?;
		let lock = self.key_lock(key);
		let _guard = lock.lock();
		let now = self.time_provider.now();

		let mut buckets = self.buckets.lock();
		let pre = buckets
			.get(key)
			.map(|entry| Self::leaked_level(entry, now, capacity, leak_rate))
			.unwrap_or(0.0);

		// Filling exactly to capacity must be accepted.
		let would_reach = pre + n_tokens;
		let (level, accepted) = if would_reach > capacity {
			(pre, false)
		} else {
			(would_reach.max(0.0), true)
		};
		buckets.insert(
			key.to_string(),
			BucketEntry {
				level,
				last_touched: now,
				may_be_deleted_after: now + retention,
			},
		);
		Ok(ConditionalFillup {
			level,
			full: level >= capacity,
			accepted,
		})
	}

	async fn set_block(&self, key: &str, block_for: Duration) -> Result<DateTime<Utc>> {
		if block_for.is_zero() {
			return Err(Error::InvalidConfig(
				"block duration must be positive".to_string(),
			));
		}
		let lock = self.key_lock(key);
		let _guard = lock.lock();
		let now = self.time_provider.now();

		let mut blocks = self.blocks.lock();
		let proposed = now + block_for;
		let blocked_until = blocks
			.entry(key.to_string())
			.and_modify(|existing| *existing = (*existing).max(proposed))
			.or_insert(proposed);
		Ok(project_deadline(now, *blocked_until))
	}

	async fn blocked_until(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
		let lock = self.key_lock(key);
		let _guard = lock.lock();
		let now = self.time_provider.now();

		let blocks = self.blocks.lock();
		Ok(blocks
			.get(key)
			.filter(|&&until| until > now)
			.map(|&until| project_deadline(now, until)))
	}

	async fn prune(&self) -> Result<u64> {
		let now = self.time_provider.now();
		let mut removed = 0u64;
		{
			let mut buckets = self.buckets.lock();
			let before = buckets.len();
			buckets.retain(|_, entry| entry.may_be_deleted_after >= now);
			removed += (before - buckets.len()) as u64;
		}
		{
			let mut blocks = self.blocks.lock();
			let before = blocks.len();
			blocks.retain(|_, blocked_until| *blocked_until >= now);
			removed += (before - blocks.len()) as u64;
		}

		// Garbage-collect lock entries for keys with no remaining state.
		// A lock some operation still holds (strong_count > 1) survives so
		// that per-key serialization is never split across two mutexes.
		let survivors: HashSet<String> = {
			let buckets = self.buckets.lock();
			let blocks = self.blocks.lock();
			buckets.keys().chain(blocks.keys()).cloned().collect()
		};
		self.locks
			.lock()
			.retain(|key, lock| survivors.contains(key) || Arc::strong_count(lock) > 1);

		tracing::debug!(removed, "pruned in-memory buckets and blocks");
		Ok(removed)
	}

	async fn create_tables(&self) -> Result<()> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::time_provider::MockTimeProvider;
	use rstest::rstest;

	fn mock_backend() -> (Arc<MockTimeProvider>, MemoryBackend<MockTimeProvider>) {
		let clock = Arc::new(MockTimeProvider::new(Instant::now()));
		let backend = MemoryBackend::with_time_provider(clock.clone());
		(clock, backend)
	}

	#[rstest]
	#[tokio::test]
	async fn test_state_of_unknown_key_is_zero_and_not_full() {
		let (_clock, backend) = mock_backend();

		let state = backend.state("missing", 10.0, 1.0).await.unwrap();

		assert_eq!(state.level, 0.0);
		assert!(!state.full);
	}

	#[rstest]
	#[tokio::test]
	async fn test_fillup_then_leak() {
		// capacity 1, leak 2/s: full immediately, half drained after 250ms
		let (clock, backend) = mock_backend();

		let state = backend.add_tokens("b", 1.0, 2.0, 1.0).await.unwrap();
		assert_eq!(state.level, 1.0);
		assert!(state.full);

		clock.advance(Duration::from_millis(250));

		let state = backend.state("b", 1.0, 2.0).await.unwrap();
		assert!((state.level - 0.5).abs() < 0.01, "level was {}", state.level);
		assert!(!state.full);
	}

	#[rstest]
	#[tokio::test]
	async fn test_negative_fillup_clamps_at_zero() {
		let (_clock, backend) = mock_backend();

		backend.add_tokens("b", 15.0, 1.1, 5.0).await.unwrap();
		let state = backend.add_tokens("b", 15.0, 1.1, -10.0).await.unwrap();

		assert!(state.level.abs() < 0.1);
		assert!(!state.full);
	}

	#[rstest]
	#[tokio::test]
	async fn test_overfill_clamps_at_capacity() {
		let (_clock, backend) = mock_backend();

		let state = backend.add_tokens("b", 10.0, 1.0, 100.0).await.unwrap();

		assert_eq!(state.level, 10.0);
		assert!(state.full);
	}

	#[rstest]
	#[tokio::test]
	async fn test_conditional_fillup_to_exact_capacity_is_accepted() {
		let (_clock, backend) = mock_backend();

		backend
			.add_tokens_conditionally("b", 10.0, 1.0, 4.0)
			.await
			.unwrap();
		let fill = backend
			.add_tokens_conditionally("b", 10.0, 1.0, 6.0)
			.await
			.unwrap();

		assert!(fill.accepted);
		assert_eq!(fill.level, 10.0);
		assert!(fill.full);
	}

	#[rstest]
	#[tokio::test]
	async fn test_oversized_conditional_fillup_is_rejected_without_spill() {
		let (_clock, backend) = mock_backend();

		let fill = backend
			.add_tokens_conditionally("b", 1.0, 1.0, 1.1)
			.await
			.unwrap();

		assert!(!fill.accepted);
		assert_eq!(fill.level, 0.0);
		assert!(!fill.full);
	}

	#[rstest]
	#[tokio::test]
	async fn test_conditional_fillup_stairstep() {
		// capacity 1, drains fully over 1s
		let (clock, backend) = mock_backend();
		let fc = |n: f64| backend.add_tokens_conditionally("b", 1.0, 1.0, n);

		let fill = fc(1.1).await.unwrap();
		assert!(!fill.accepted);
		assert!(fill.level.abs() < 0.005);

		for expected in [0.3, 0.6, 0.9] {
			let fill = fc(0.3).await.unwrap();
			assert!(fill.accepted);
			assert!((fill.level - expected).abs() < 0.005, "level {}", fill.level);
		}

		let fill = fc(0.3).await.unwrap();
		assert!(!fill.accepted);
		assert!((fill.level - 0.9).abs() < 0.005);

		clock.advance(Duration::from_millis(200));

		let fill = fc(0.3).await.unwrap();
		assert!(fill.accepted);
		assert!((fill.level - 1.0).abs() < 0.005);

		let fill = fc(-2.0).await.unwrap();
		assert!(fill.accepted);
		assert!(fill.level.abs() < 0.005);

		let fill = fc(1.0).await.unwrap();
		assert!(fill.accepted);
		assert!((fill.level - 1.0).abs() < 0.005);
		assert!(fill.full);
	}

	#[rstest]
	#[tokio::test]
	async fn test_rejected_fillup_still_persists_the_leak() {
		let (clock, backend) = mock_backend();

		backend.add_tokens("b", 10.0, 1.0, 10.0).await.unwrap();
		clock.advance(Duration::from_secs(4));

		// 6 tokens left; 5 more would fit, 7 would not
		let fill = backend
			.add_tokens_conditionally("b", 10.0, 1.0, 7.0)
			.await
			.unwrap();
		assert!(!fill.accepted);
		assert!((fill.level - 6.0).abs() < 0.01);

		// The leak was committed: without further waiting the same bucket
		// reads 6, not 10.
		let state = backend.state("b", 10.0, 1.0).await.unwrap();
		assert!((state.level - 6.0).abs() < 0.01);
	}

	#[rstest]
	#[tokio::test]
	async fn test_add_zero_tokens_agrees_with_state() {
		let (_clock, backend) = mock_backend();

		backend.add_tokens("b", 20.0, 2.0, 12.5).await.unwrap();
		let after_touch = backend.add_tokens("b", 20.0, 2.0, 0.0).await.unwrap();
		let observed = backend.state("b", 20.0, 2.0).await.unwrap();

		assert!((after_touch.level - observed.level).abs() < 0.1);
	}

	#[rstest]
	#[tokio::test]
	async fn test_set_block_and_read_back() {
		let (clock, backend) = mock_backend();

		assert!(backend.blocked_until("k").await.unwrap().is_none());

		let until = backend
			.set_block("k", Duration::from_millis(2_200))
			.await
			.unwrap();
		let read_back = backend.blocked_until("k").await.unwrap().unwrap();
		assert!((read_back - until).num_milliseconds().abs() < 100);

		clock.advance(Duration::from_millis(2_300));
		assert!(backend.blocked_until("k").await.unwrap().is_none());
	}

	#[rstest]
	#[tokio::test]
	async fn test_set_block_extends_under_max() {
		let (clock, backend) = mock_backend();

		let first = backend.set_block("k", Duration::from_secs(5)).await.unwrap();
		clock.advance(Duration::from_secs(1));

		// A shorter proposal cannot pull the block in
		let second = backend.set_block("k", Duration::from_secs(1)).await.unwrap();
		assert!((second - first).num_milliseconds().abs() < 100);

		// A longer proposal extends it
		let third = backend.set_block("k", Duration::from_secs(10)).await.unwrap();
		assert!(third > first);
	}

	#[rstest]
	#[tokio::test]
	async fn test_zero_block_duration_is_rejected_and_state_unchanged() {
		let (_clock, backend) = mock_backend();

		let until = backend.set_block("k", Duration::from_secs(2)).await.unwrap();

		let result = backend.set_block("k", Duration::ZERO).await;
		assert!(matches!(result, Err(Error::InvalidConfig(_))));

		let read_back = backend.blocked_until("k").await.unwrap().unwrap();
		assert!((read_back - until).num_milliseconds().abs() < 100);
	}

	#[rstest]
	#[tokio::test]
	async fn test_prune_drops_lapsed_buckets_and_blocks() {
		let (clock, backend) = mock_backend();

		// retention is 2 * 1/1 = 2s for this bucket
		backend.add_tokens("bucket", 1.0, 1.0, 1.0).await.unwrap();
		backend
			.set_block("blocked", Duration::from_secs(1))
			.await
			.unwrap();

		assert_eq!(backend.prune().await.unwrap(), 0);

		clock.advance(Duration::from_secs(3));
		assert_eq!(backend.prune().await.unwrap(), 2);

		// Pruning an already-clean store is a no-op
		assert_eq!(backend.prune().await.unwrap(), 0);
	}

	#[rstest]
	#[tokio::test]
	async fn test_keys_do_not_interact() {
		let (_clock, backend) = mock_backend();

		backend.add_tokens("a", 5.0, 1.0, 5.0).await.unwrap();
		let state = backend.state("b", 5.0, 1.0).await.unwrap();

		assert_eq!(state.level, 0.0);
	}

	#[rstest]
	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_concurrent_conditional_fillups_never_overshoot() {
		let backend = Arc::new(MemoryBackend::new());
		let mut handles = Vec::new();
		for _ in 0..40 {
			let backend = backend.clone();
			handles.push(tokio::spawn(async move {
				backend
					.add_tokens_conditionally("shared", 10.0, 0.001, 1.0)
					.await
					.unwrap()
					.accepted
			}));
		}

		let mut accepted = 0;
		for handle in handles {
			if handle.await.unwrap() {
				accepted += 1;
			}
		}

		// With a negligible leak rate exactly `capacity` fillups fit.
		assert_eq!(accepted, 10);
		let state = backend.state("shared", 10.0, 0.001).await.unwrap();
		assert!(state.level <= 10.0);
	}
}
