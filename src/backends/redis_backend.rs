//! Redis storage backend.
//!
//! Level math runs inside Redis in a server-side Lua script, under the
//! server's own `TIME`, so the read-modify-write is atomic and every
//! client shares one clock. [`redis::Script`] drives execution by cached
//! SHA (`EVALSHA`), transparently reloading the source on a `NOSCRIPT`
//! reply from a restarted or flushed server.
//!
//! Layout per key: `{prefix}:leaky_bucket:{key}:level` and
//! `…:last_touched` hold the bucket as decimal text, `…:block` holds the
//! block expiry as epoch seconds. All three carry TTLs, so pruning is
//! the server's job and [`StorageBackend::prune`] is a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Script;
use std::time::Duration;

use crate::backend::{BucketState, ConditionalFillup, StorageBackend};
use crate::error::{Error, Result};
use crate::time_provider::epoch_to_utc;

const DEFAULT_KEY_PREFIX: &str = "sluice";

/// Both fillup flavors behind one conditional flag.
///
/// KEYS: level key, last-touched key.
/// ARGV: leak rate, fillup amount, capacity, conditional flag (0/1).
/// Returns `{level_as_string, at_capacity, accepted}`; the level travels
/// as a string because Lua-to-Redis conversion truncates numbers to
/// integers.
const FILLUP_SCRIPT: &str = r#"
	redis.replicate_commands()
	local level_key = KEYS[1]
	local last_touched_key = KEYS[2]
	local leak_rate = tonumber(ARGV[1])
	local fillup = tonumber(ARGV[2])
	local capacity = tonumber(ARGV[3])
	local conditional = tonumber(ARGV[4]) == 1

	local time = redis.call("TIME")
	local now = tonumber(time[1]) + (tonumber(time[2]) / 1000000)

	local level = tonumber(redis.call("GET", level_key)) or 0
	local last_touched = tonumber(redis.call("GET", last_touched_key)) or now
	local elapsed = now - last_touched
	if elapsed < 0 then
		elapsed = 0
	end
	local leaked = math.max(0, level - (elapsed * leak_rate))

	local accepted = 1
	local next_level
	if conditional then
		local with_fillup = math.max(0, leaked + fillup)
		if with_fillup > capacity then
			next_level = leaked
			accepted = 0
		else
			next_level = with_fillup
		end
	else
		next_level = math.max(0, math.min(capacity, leaked + fillup))
	end

	local retention = math.max(1, math.ceil((capacity / leak_rate) * 2))
	redis.call("SET", level_key, tostring(next_level), "EX", retention)
	redis.call("SET", last_touched_key, tostring(now), "EX", retention)

	local at_capacity = 0
	if next_level >= capacity then
		at_capacity = 1
	end
	return {tostring(next_level), at_capacity, accepted}
"#;

/// Install or extend a block under max semantics.
///
/// KEYS: block key. ARGV: block duration in seconds.
/// Returns the resulting expiry as epoch seconds in decimal text. The
/// TTL covers the full remaining block, which can exceed the proposed
/// duration when an earlier, longer block wins the max.
const SET_BLOCK_SCRIPT: &str = r#"
	redis.replicate_commands()
	local block_key = KEYS[1]
	local block_for = tonumber(ARGV[1])

	local time = redis.call("TIME")
	local now = tonumber(time[1]) + (tonumber(time[2]) / 1000000)

	local existing = tonumber(redis.call("GET", block_key)) or 0
	local blocked_until = math.max(existing, now + block_for)
	redis.call("SET", block_key, tostring(blocked_until), "EX", math.max(1, math.ceil(blocked_until - now)))
	return tostring(blocked_until)
"#;

/// Backend sharing state through a Redis server.
///
/// # Examples
///
/// ```no_run
/// use sluice::backends::RedisBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = RedisBackend::new("redis://127.0.0.1:6379")?
/// 	.with_key_prefix("myapp");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisBackend {
	pool: Pool,
	key_prefix: String,
}

impl RedisBackend {
	/// Create a pooled backend for `connection_url`.
	pub fn new(connection_url: impl Into<String>) -> Result<Self> {
		let cfg = PoolConfig::from_url(connection_url.into());
		let pool = cfg
			.create_pool(Some(Runtime::Tokio1))
			.map_err(|e| Error::Storage(format!("failed to create Redis pool: {e}")))?;
		Ok(Self {
			pool,
			key_prefix: DEFAULT_KEY_PREFIX.to_string(),
		})
	}

	/// Reuse an existing pool.
	pub fn with_pool(pool: Pool) -> Self {
		Self {
			pool,
			key_prefix: DEFAULT_KEY_PREFIX.to_string(),
		}
	}

	/// Namespace every key under `prefix` instead of the default
	/// `"sluice"`.
	pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.key_prefix = prefix.into();
		self
	}

	fn level_key(&self, key: &str) -> String {
		format!("{}:leaky_bucket:{}:level", self.key_prefix, key)
	}

	fn last_touched_key(&self, key: &str) -> String {
		format!("{}:leaky_bucket:{}:last_touched", self.key_prefix, key)
	}

	fn block_key(&self, key: &str) -> String {
		format!("{}:leaky_bucket:{}:block", self.key_prefix, key)
	}

	async fn connection(&self) -> Result<deadpool_redis::Connection> {
		self.pool
			.get()
			.await
			.map_err(|e| Error::Storage(format!("failed to get Redis connection: {e}")))
	}

	/// Server wall clock as fractional epoch seconds.
	async fn server_now(conn: &mut deadpool_redis::Connection) -> Result<f64> {
		let (seconds, micros): (u64, u64) = redis::cmd("TIME")
			.query_async(conn)
			.await
			.map_err(|e| Error::Storage(format!("failed to read Redis server time: {e}")))?;
		Ok(seconds as f64 + micros as f64 / 1_000_000.0)
	}

	async fn run_fillup(
		&self,
		key: &str,
		capacity: f64,
		leak_rate: f64,
		n_tokens: f64,
		conditional: bool,
	) -> Result<ConditionalFillup> {
		let mut conn = self.connection().await?;
		let (level, at_capacity, accepted): (String, i64, i64) = Script::new(FILLUP_SCRIPT)
			.key(self.level_key(key))
			.key(self.last_touched_key(key))
			.arg(leak_rate)
			.arg(n_tokens)
			.arg(capacity)
			.arg(i32::from(conditional))
			.invoke_async(&mut conn)
			.await
			.map_err(|e| Error::Storage(format!("fillup script failed: {e}")))?;

		let level: f64 = level
			.parse()
			.map_err(|e| Error::Storage(format!("fillup script returned a bad level: {e}")))?;
		Ok(ConditionalFillup {
			level,
			full: at_capacity == 1,
			accepted: accepted == 1,
		})
	}
}

#[async_trait]
impl StorageBackend for RedisBackend {
	async fn state(&self, key: &str, capacity: f64, leak_rate: f64) -> Result<BucketState> {
		let mut conn = self.connection().await?;
		let (level, last_touched): (Option<String>, Option<String>) = redis::cmd("MGET")
			.arg(self.level_key(key))
			.arg(self.last_touched_key(key))
			.query_async(&mut conn)
			.await
			.map_err(|e| Error::Storage(format!("failed to read bucket state: {e}")))?;

		let Some(level) = level else {
			return Ok(BucketState {
				level: 0.0,
				full: false,
			});
		};
		let stored: f64 = level
			.parse()
			.map_err(|e| Error::Storage(format!("stored level is not a number: {e}")))?;
		let now = Self::server_now(&mut conn).await?;
		let last_touched: f64 = match last_touched {
			Some(raw) => raw
				.parse()
				.map_err(|e| Error::Storage(format!("stored timestamp is not a number: {e}")))?,
			None => now,
		};

		let elapsed = (now - last_touched).max(0.0);
		let level = (stored - elapsed * leak_rate).clamp(0.0, capacity);
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
		let fill = self
			.run_fillup(key, capacity, leak_rate, n_tokens, false)
			.await?;
		Ok(BucketState {
			level: fill.level,
			full: fill.full,
		})
	}

	async fn add_tokens_conditionally(
		&self,
		key: &str,
		capacity: f64,
		leak_rate: f64,
		n_tokens: f64,
	) -> Result<ConditionalFillup> {
		self.run_fillup(key, capacity, leak_rate, n_tokens, true)
			.await
	}

	async fn set_block(&self, key: &str, block_for: Duration) -> Result<DateTime<Utc>> {
		if block_for.is_zero() {
			return Err(Error::InvalidConfig(
				"block duration must be positive".to_string(),
			));
		}
		let mut conn = self.connection().await?;
		let blocked_until: String = Script::new(SET_BLOCK_SCRIPT)
			.key(self.block_key(key))
			.arg(block_for.as_secs_f64())
			.invoke_async(&mut conn)
			.await
			.map_err(|e| Error::Storage(format!("set_block script failed: {e}")))?;

		let blocked_until: f64 = blocked_until
			.parse()
			.map_err(|e| Error::Storage(format!("set_block script returned a bad time: {e}")))?;
		epoch_to_utc(blocked_until)
	}

	async fn blocked_until(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
		let mut conn = self.connection().await?;
		let stored: Option<String> = redis::cmd("GET")
			.arg(self.block_key(key))
			.query_async(&mut conn)
			.await
			.map_err(|e| Error::Storage(format!("failed to read block: {e}")))?;

		let Some(stored) = stored else {
			return Ok(None);
		};
		let blocked_until: f64 = stored
			.parse()
			.map_err(|e| Error::Storage(format!("stored block time is not a number: {e}")))?;
		let now = Self::server_now(&mut conn).await?;
		if blocked_until > now {
			Ok(Some(epoch_to_utc(blocked_until)?))
		} else {
			Ok(None)
		}
	}

	async fn prune(&self) -> Result<u64> {
		// Every key carries a TTL; the server prunes for us.
		Ok(0)
	}

	async fn create_tables(&self) -> Result<()> {
		Ok(())
	}
}
