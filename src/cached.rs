//! Cache layer short-circuiting blocked throttles.
//!
//! Once a key is blocked, every request on it is refused until the block
//! lapses; hitting the store again and again just to re-learn that fact
//! is wasted round-trips. [`CachedThrottle`] remembers a blocked
//! [`ThrottleState`] in any [`StateCache`] and answers from the cache
//! while the block is in effect. Because `ThrottleState::blocked` is
//! local wall-clock arithmetic, a cached state expires on its own even
//! when the cache store keeps the entry around longer.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::throttle::{Throttle, ThrottleState};

/// A keyed store for blocked throttle states.
///
/// Any cache offering read and expiring write fits; entries may be
/// evicted at any time, and an entry outliving `expires_after` is
/// harmless because [`ThrottleState::blocked`] re-checks the deadline.
#[async_trait]
pub trait StateCache: Send + Sync {
	async fn read(&self, key: &str) -> Result<Option<ThrottleState>>;

	async fn write(
		&self,
		key: &str,
		state: &ThrottleState,
		expires_after: Duration,
	) -> Result<()>;
}

/// Wraps a [`Throttle`], serving blocked outcomes from a cache.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use sluice::{CachedThrottle, MemoryBackend, MemoryStateCache, Throttle};
///
/// # tokio_test::block_on(async {
/// let throttle = Throttle::builder()
/// 	.key("api:bob")
/// 	.capacity(10.0)
/// 	.over_time(Duration::from_secs(1))
/// 	.backend(Arc::new(MemoryBackend::new()))
/// 	.build()
/// 	.unwrap();
/// let cached = CachedThrottle::new(throttle, MemoryStateCache::new());
///
/// assert!(!cached.request(1.0).await.unwrap().blocked());
/// # });
/// ```
pub struct CachedThrottle<C> {
	throttle: Throttle,
	cache: C,
}

impl<C: StateCache> CachedThrottle<C> {
	pub fn new(throttle: Throttle, cache: C) -> Self {
		Self { throttle, cache }
	}

	pub fn throttle(&self) -> &Throttle {
		&self.throttle
	}

	/// The cached state for this key, if it is still blocked.
	async fn cached_block(&self) -> Result<Option<ThrottleState>> {
		match self.cache.read(self.throttle.key()).await? {
			Some(state) if state.blocked() => Ok(Some(state)),
			_ => Ok(None),
		}
	}

	/// Remember a blocked state until its own deadline.
	async fn remember(&self, state: &ThrottleState) -> Result<()> {
		let Some(blocked_until) = state.blocked_until else {
			return Ok(());
		};
		let Ok(expires_after) = (blocked_until - Utc::now()).to_std() else {
			// Already lapsed; nothing worth caching.
			return Ok(());
		};
		if expires_after.is_zero() {
			return Ok(());
		}
		self.cache
			.write(self.throttle.key(), state, expires_after)
			.await
	}

	/// As [`Throttle::request`], answering from the cache while a
	/// remembered block is in effect.
	pub async fn request(&self, n_tokens: f64) -> Result<ThrottleState> {
		if let Some(state) = self.cached_block().await? {
			return Ok(state);
		}
		let state = self.throttle.request(n_tokens).await?;
		if state.blocked() {
			self.remember(&state).await?;
		}
		Ok(state)
	}

	/// As [`Throttle::request_strict`], answering from the cache while a
	/// remembered block is in effect.
	pub async fn request_strict(&self, n_tokens: f64) -> Result<ThrottleState> {
		if let Some(state) = self.cached_block().await? {
			return Err(Error::Throttled {
				key: self.throttle.key().to_string(),
				retry_after_seconds: state.retry_after_seconds(),
				state,
			});
		}
		match self.throttle.request_strict(n_tokens).await {
			Err(Error::Throttled {
				key,
				state,
				retry_after_seconds,
			}) => {
				self.remember(&state).await?;
				Err(Error::Throttled {
					key,
					state,
					retry_after_seconds,
				})
			}
			other => other,
		}
	}

	/// Advisory, as [`Throttle::able_to_accept`]; a remembered block
	/// answers `false` without a store round-trip.
	pub async fn able_to_accept(&self, n_tokens: f64) -> Result<bool> {
		if self.cached_block().await?.is_some() {
			return Ok(false);
		}
		self.throttle.able_to_accept(n_tokens).await
	}

	/// Run `body` unless the key is throttled, as [`Throttle::throttled`].
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
}

/// In-process [`StateCache`] for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryStateCache {
	entries: RwLock<HashMap<String, (ThrottleState, Instant)>>,
}

impl MemoryStateCache {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl StateCache for MemoryStateCache {
	async fn read(&self, key: &str) -> Result<Option<ThrottleState>> {
		let entries = self.entries.read().await;
		Ok(entries
			.get(key)
			.filter(|(_, expires_at)| *expires_at > Instant::now())
			.map(|(state, _)| state.clone()))
	}

	async fn write(
		&self,
		key: &str,
		state: &ThrottleState,
		expires_after: Duration,
	) -> Result<()> {
		let mut entries = self.entries.write().await;
		entries.insert(
			key.to_string(),
			(state.clone(), Instant::now() + expires_after),
		);
		Ok(())
	}
}
