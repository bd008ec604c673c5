//! SQLite storage backend.
//!
//! SQLite runs in-process, so the application clock is the store clock:
//! timestamps are fractional epoch seconds (REAL columns) captured on
//! the Rust side at microsecond resolution. The unconditional fillup is
//! a single upsert-RETURNING statement like the PostgreSQL one. The
//! conditional fillup keeps a two-statement protocol (ensure the row
//! exists, then update it through a materialized CTE snapshot of the
//! pre-image) because an `ON CONFLICT DO UPDATE` arm cannot hand the
//! pre-update level back out of `RETURNING`; both statements run inside
//! one transaction and the ensure-insert makes the update's row lock the
//! serialization point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::{BucketState, ConditionalFillup, StorageBackend};
use crate::error::{Error, Result};
use crate::time_provider::{epoch_to_utc, utc_now_epoch};

const STATE_SQL: &str = "\
SELECT MAX(0.0, MIN(?2, level - ((?3 - last_touched_at) * ?4))) AS level
FROM leaky_buckets
WHERE key = ?1";

const ADD_TOKENS_SQL: &str = "\
INSERT INTO leaky_buckets (id, key, level, last_touched_at, may_be_deleted_after)
VALUES (?1, ?2, MAX(0.0, MIN(?3, ?4)), ?5, ?5 + ?6)
ON CONFLICT (key) DO UPDATE SET
	level = MAX(0.0, MIN(?3, level - ((?5 - last_touched_at) * ?7) + ?4)),
	last_touched_at = ?5,
	may_be_deleted_after = ?5 + ?6
RETURNING level, level >= ?3 AS at_capacity";

/// First half of the conditional fillup: make sure the row exists so the
/// following UPDATE always has a pre-image to read. A fresh row carries
/// level zero, which is exactly the first-touch base level.
const ENSURE_ROW_SQL: &str = "\
INSERT INTO leaky_buckets (id, key, level, last_touched_at, may_be_deleted_after)
VALUES (?1, ?2, 0.0, ?3, ?3 + ?4)
ON CONFLICT (key) DO NOTHING";

/// Second half: snapshot the pre-image as the post-leak level and the
/// post-fillup candidate clamped at zero but NOT at capacity, then pick
/// between them on `level_with_fillup <= capacity`.
const CONDITIONAL_UPDATE_SQL: &str = "\
WITH pre AS MATERIALIZED (
	SELECT
		MAX(0.0, level - ((?3 - last_touched_at) * ?4)) AS level_post_leak,
		MAX(0.0, MAX(0.0, level - ((?3 - last_touched_at) * ?4)) + ?5) AS level_with_fillup
	FROM leaky_buckets
	WHERE key = ?1
)
UPDATE leaky_buckets SET
	level = CASE
		WHEN (SELECT level_with_fillup FROM pre) <= ?2
			THEN MIN(?2, (SELECT level_with_fillup FROM pre))
		ELSE (SELECT level_post_leak FROM pre)
	END,
	last_touched_at = ?3,
	may_be_deleted_after = ?3 + ?6
WHERE key = ?1
RETURNING
	level,
	level >= ?2 AS at_capacity,
	(SELECT level_with_fillup FROM pre) <= ?2 AS accepted";

const SET_BLOCK_SQL: &str = "\
INSERT INTO blocks (id, key, blocked_until)
VALUES (?1, ?2, ?3)
ON CONFLICT (key) DO UPDATE SET blocked_until = MAX(blocked_until, excluded.blocked_until)
RETURNING blocked_until";

const BLOCKED_UNTIL_SQL: &str =
	"SELECT blocked_until FROM blocks WHERE key = ?1 AND blocked_until > ?2";

const PRUNE_BUCKETS_SQL: &str = "DELETE FROM leaky_buckets WHERE may_be_deleted_after < ?1";
const PRUNE_BLOCKS_SQL: &str = "DELETE FROM blocks WHERE blocked_until < ?1";

const CREATE_TABLES_SQL: [&str; 4] = [
	"CREATE TABLE IF NOT EXISTS leaky_buckets (
		id TEXT PRIMARY KEY,
		key TEXT NOT NULL UNIQUE,
		level REAL NOT NULL,
		last_touched_at REAL NOT NULL,
		may_be_deleted_after REAL NOT NULL
	)",
	"CREATE INDEX IF NOT EXISTS idx_leaky_buckets_may_be_deleted_after
		ON leaky_buckets (may_be_deleted_after)",
	"CREATE TABLE IF NOT EXISTS blocks (
		id TEXT PRIMARY KEY,
		key TEXT NOT NULL UNIQUE,
		blocked_until REAL NOT NULL
	)",
	"CREATE INDEX IF NOT EXISTS idx_blocks_blocked_until ON blocks (blocked_until)",
];

/// Backend sharing state through a SQLite database.
///
/// # Examples
///
/// ```no_run
/// use sluice::backends::SqliteBackend;
/// use sluice::StorageBackend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = SqliteBackend::connect("sqlite://throttles.db").await?;
/// backend.create_tables().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SqliteBackend {
	pool: SqlitePool,
}

impl SqliteBackend {
	/// Connect a new pool to `database_url`.
	pub async fn connect(database_url: &str) -> Result<Self> {
		let pool = SqlitePool::connect(database_url)
			.await
			.map_err(|e| Error::Storage(format!("failed to connect to SQLite: {e}")))?;
		Ok(Self { pool })
	}

	/// Reuse an existing pool.
	pub fn with_pool(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	fn retention_seconds(capacity: f64, leak_rate: f64) -> f64 {
		2.0 * capacity / leak_rate
	}
}

#[async_trait]
impl StorageBackend for SqliteBackend {
	async fn state(&self, key: &str, capacity: f64, leak_rate: f64) -> Result<BucketState> {
		let row = sqlx::query(STATE_SQL)
			.bind(key)
			.bind(capacity)
			.bind(utc_now_epoch())
			.bind(leak_rate)
			.fetch_optional(&self.pool)
			.await
			.map_err(|e| Error::Storage(format!("failed to read bucket state: {e}")))?;

		let level = match row {
			Some(row) => row
				.try_get::<f64, _>("level")
				.map_err(|e| Error::Storage(format!("failed to decode bucket level: {e}")))?,
			None => 0.0,
		};
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
		let row = sqlx::query(ADD_TOKENS_SQL)
			.bind(Uuid::new_v4().to_string())
			.bind(key)
			.bind(capacity)
			.bind(n_tokens)
			.bind(utc_now_epoch())
			.bind(Self::retention_seconds(capacity, leak_rate))
			.bind(leak_rate)
			.fetch_one(&self.pool)
			.await
			.map_err(|e| Error::Storage(format!("failed to add tokens: {e}")))?;

		let level: f64 = row
			.try_get("level")
			.map_err(|e| Error::Storage(format!("failed to decode bucket level: {e}")))?;
		let full: bool = row
			.try_get("at_capacity")
			.map_err(|e| Error::Storage(format!("failed to decode at_capacity: {e}")))?;
		Ok(BucketState { level, full })
	}

	async fn add_tokens_conditionally(
		&self,
		key: &str,
		capacity: f64,
		leak_rate: f64,
		n_tokens: f64,
	) -> Result<ConditionalFillup> {
		let now = utc_now_epoch();
		let retention = Self::retention_seconds(capacity, leak_rate);

		let mut tx = self
			.pool
			.begin()
			.await
			.map_err(|e| Error::Storage(format!("failed to begin transaction: {e}")))?;

		sqlx::query(ENSURE_ROW_SQL)
			.bind(Uuid::new_v4().to_string())
			.bind(key)
			.bind(now)
			.bind(retention)
			.execute(&mut *tx)
			.await
			.map_err(|e| Error::Storage(format!("failed to ensure bucket row: {e}")))?;

		let row = sqlx::query(CONDITIONAL_UPDATE_SQL)
			.bind(key)
			.bind(capacity)
			.bind(now)
			.bind(leak_rate)
			.bind(n_tokens)
			.bind(retention)
			.fetch_one(&mut *tx)
			.await
			.map_err(|e| Error::Storage(format!("failed to add tokens conditionally: {e}")))?;

		let level: f64 = row
			.try_get("level")
			.map_err(|e| Error::Storage(format!("failed to decode bucket level: {e}")))?;
		let full: bool = row
			.try_get("at_capacity")
			.map_err(|e| Error::Storage(format!("failed to decode at_capacity: {e}")))?;
		let accepted: bool = row
			.try_get("accepted")
			.map_err(|e| Error::Storage(format!("failed to decode accepted: {e}")))?;

		tx.commit()
			.await
			.map_err(|e| Error::Storage(format!("failed to commit conditional fillup: {e}")))?;

		Ok(ConditionalFillup {
			level,
			full,
			accepted,
		})
	}

	async fn set_block(&self, key: &str, block_for: Duration) -> Result<DateTime<Utc>> {
		if block_for.is_zero() {
			return Err(Error::InvalidConfig(
				"block duration must be positive".to_string(),
			));
		}
		let blocked_until = utc_now_epoch() + block_for.as_secs_f64();
		let row = sqlx::query(SET_BLOCK_SQL)
			.bind(Uuid::new_v4().to_string())
			.bind(key)
			.bind(blocked_until)
			.fetch_one(&self.pool)
			.await
			.map_err(|e| Error::Storage(format!("failed to set block: {e}")))?;

		let stored: f64 = row
			.try_get("blocked_until")
			.map_err(|e| Error::Storage(format!("failed to decode blocked_until: {e}")))?;
		epoch_to_utc(stored)
	}

	async fn blocked_until(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
		let row = sqlx::query(BLOCKED_UNTIL_SQL)
			.bind(key)
			.bind(utc_now_epoch())
			.fetch_optional(&self.pool)
			.await
			.map_err(|e| Error::Storage(format!("failed to read block: {e}")))?;

		row.map(|row| {
			let stored: f64 = row
				.try_get("blocked_until")
				.map_err(|e| Error::Storage(format!("failed to decode blocked_until: {e}")))?;
			epoch_to_utc(stored)
		})
		.transpose()
	}

	async fn prune(&self) -> Result<u64> {
		let now = utc_now_epoch();
		let buckets = sqlx::query(PRUNE_BUCKETS_SQL)
			.bind(now)
			.execute(&self.pool)
			.await
			.map_err(|e| Error::Storage(format!("failed to prune buckets: {e}")))?
			.rows_affected();
		let blocks = sqlx::query(PRUNE_BLOCKS_SQL)
			.bind(now)
			.execute(&self.pool)
			.await
			.map_err(|e| Error::Storage(format!("failed to prune blocks: {e}")))?
			.rows_affected();

		tracing::debug!(buckets, blocks, "pruned SQLite buckets and blocks");
		Ok(buckets + blocks)
	}

	async fn create_tables(&self) -> Result<()> {
		for statement in CREATE_TABLES_SQL {
			sqlx::query(statement)
				.execute(&self.pool)
				.await
				.map_err(|e| Error::Storage(format!("failed to create tables: {e}")))?;
		}
		tracing::debug!("created leaky_buckets and blocks tables");
		Ok(())
	}
}
