//! Clock sources for the in-memory backend.
//!
//! Central stores supply their own clock: the PostgreSQL backend reads
//! `statement_timestamp()`, the Redis backend calls `TIME` inside its
//! scripts, and the SQLite backend uses an application-side timestamp
//! because the store runs in-process anyway. The in-memory backend has no
//! store clock to lean on, so it runs on a monotonic [`TimeProvider`] and
//! converts to wall-clock time only at the API boundary.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time::Instant;

#[cfg(any(feature = "sqlite", feature = "redis-backend"))]
use crate::error::{Error, Result};

/// Supplies "now" to the in-memory backend.
///
/// Implementations must be monotonic. Wall-clock timestamps are derived by
/// projecting the remaining monotonic interval onto [`Utc::now`], never by
/// reading the system clock for level math.
pub trait TimeProvider: Send + Sync {
	fn now(&self) -> Instant;
}

/// Monotonic process clock.
#[derive(Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl SystemTimeProvider {
	pub fn new() -> Self {
		Self
	}
}

impl TimeProvider for SystemTimeProvider {
	fn now(&self) -> Instant {
		Instant::now()
	}
}

/// Manually controlled clock for tests.
#[derive(Clone)]
pub struct MockTimeProvider {
	current: Arc<RwLock<Instant>>,
}

impl MockTimeProvider {
	pub fn new(start: Instant) -> Self {
		Self {
			current: Arc::new(RwLock::new(start)),
		}
	}

	/// Move the clock forward by `duration`.
	pub fn advance(&self, duration: std::time::Duration) {
		let mut current = self.current.write();
		*current += duration;
	}

	pub fn set_time(&self, to: Instant) {
		let mut current = self.current.write();
		*current = to;
	}
}

impl Default for MockTimeProvider {
	fn default() -> Self {
		Self::new(Instant::now())
	}
}

impl TimeProvider for MockTimeProvider {
	fn now(&self) -> Instant {
		*self.current.read()
	}
}

/// Project a monotonic deadline onto the wall clock.
///
/// `now` must come from the same provider that produced `deadline`; the
/// remaining interval is added to [`Utc::now`]. Deadlines already in the
/// past project onto the current moment.
pub(crate) fn project_deadline(now: Instant, deadline: Instant) -> DateTime<Utc> {
	let remaining = deadline.duration_since(now);
	Utc::now() + TimeDelta::from_std(remaining).unwrap_or(TimeDelta::MAX)
}

/// Fractional seconds since the Unix epoch, as stored by the SQLite
/// backend. Microsecond resolution.
#[cfg(feature = "sqlite")]
pub(crate) fn utc_now_epoch() -> f64 {
	Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Decode a fractional-seconds epoch value written by the SQLite or Redis
/// backend.
#[cfg(any(feature = "sqlite", feature = "redis-backend"))]
pub(crate) fn epoch_to_utc(seconds: f64) -> Result<DateTime<Utc>> {
	DateTime::<Utc>::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
		.ok_or_else(|| Error::Storage(format!("timestamp out of range: {seconds}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;
	use std::time::Duration;

	#[rstest]
	fn test_system_time_provider_is_monotonic() {
		let provider = SystemTimeProvider::new();
		let t1 = provider.now();
		std::thread::sleep(Duration::from_millis(5));
		let t2 = provider.now();
		assert!(t2 > t1);
	}

	#[rstest]
	fn test_mock_time_provider_advance() {
		let start = Instant::now();
		let provider = MockTimeProvider::new(start);
		assert_eq!(provider.now(), start);

		provider.advance(Duration::from_secs(90));
		assert_eq!(provider.now(), start + Duration::from_secs(90));
	}

	#[rstest]
	fn test_mock_time_provider_set_time() {
		let provider = MockTimeProvider::default();
		let target = Instant::now() + Duration::from_secs(42);
		provider.set_time(target);
		assert_eq!(provider.now(), target);
	}

	#[rstest]
	fn test_project_deadline_future() {
		let now = Instant::now();
		let deadline = now + Duration::from_secs(10);
		let projected = project_deadline(now, deadline);
		let delta = (projected - Utc::now()).num_milliseconds();
		assert!((9_900..=10_100).contains(&delta), "delta was {delta}ms");
	}

	#[rstest]
	fn test_project_deadline_past_saturates_to_now() {
		let now = Instant::now();
		let deadline = now - Duration::from_secs(10);
		let projected = project_deadline(now, deadline);
		let delta = (projected - Utc::now()).num_milliseconds();
		assert!(delta.abs() < 100, "delta was {delta}ms");
	}
}
