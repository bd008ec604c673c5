//! PostgreSQL storage backend.
//!
//! Every level update is one `INSERT … ON CONFLICT DO UPDATE … RETURNING`
//! statement: the leaked level and the post-fillup value are computed in
//! SQL under `statement_timestamp()`, so the read-modify-write commits as
//! a single atomic step and the database clock is the only clock.
//! Concurrent fillups on one key serialize on the row lock taken by the
//! upsert.
//!
//! Note that a surrounding transaction scopes these writes too: if the
//! caller rolls back, the level update and any installed block roll back
//! with it. Apply the throttle outside the transaction when the
//! rate-limit effect must survive a rollback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::time::Duration;

use crate::backend::{BucketState, ConditionalFillup, StorageBackend};
use crate::error::{Error, Result};

/// Effective level, read-only.
const STATE_SQL: &str = "\
SELECT GREATEST(0, LEAST($2, level - (EXTRACT(EPOCH FROM (statement_timestamp() - last_touched_at)) * $3)))::double precision AS level
FROM leaky_buckets
WHERE key = $1";

/// Unconditional fillup. The insert arm covers first touch (base level
/// zero); the update arm leaks the stored level across the interval since
/// `last_touched_at`, applies the fillup and clamps into [0, capacity].
const ADD_TOKENS_SQL: &str = "\
INSERT INTO leaky_buckets AS t (key, last_touched_at, may_be_deleted_after, level)
VALUES ($1, statement_timestamp(), statement_timestamp() + make_interval(secs => $4), GREATEST(0, LEAST($2, $3)))
ON CONFLICT (key) DO UPDATE SET
	last_touched_at = EXCLUDED.last_touched_at,
	may_be_deleted_after = EXCLUDED.may_be_deleted_after,
	level = GREATEST(0, LEAST($2,
		t.level
		- (EXTRACT(EPOCH FROM (EXCLUDED.last_touched_at - t.last_touched_at)) * $5)
		+ $3))
RETURNING level::double precision AS level, level >= $2 AS at_capacity";

/// Conditional fillup. The materialized CTE snapshots the pre-image as
/// two candidates: the plain post-leak level and the post-fillup level
/// clamped at zero but deliberately NOT at capacity, so that overflow is
/// detectable. `FOR UPDATE` makes the snapshot the serialization point:
/// a concurrent fillup waits here and then re-reads the committed row,
/// so the candidates the upsert chooses between are never stale. The
/// upsert picks a candidate on `level_with_fillup <= capacity`, and the
/// RETURNING row carries the acceptance verdict.
///
/// The COALESCE arms cover the one case where the CTE is empty but the
/// insert still conflicts: two first touches racing on the same key.
/// The loser recomputes its candidates inline from the freshly inserted
/// row (whose age is sub-statement, so the leak term vanishes).
const ADD_TOKENS_CONDITIONALLY_SQL: &str = "\
WITH pre AS MATERIALIZED (
	SELECT
		GREATEST(0, level - (EXTRACT(EPOCH FROM (statement_timestamp() - last_touched_at)) * $5)) AS level_post_leak,
		GREATEST(0, GREATEST(0, level - (EXTRACT(EPOCH FROM (statement_timestamp() - last_touched_at)) * $5)) + $3) AS level_with_fillup
	FROM leaky_buckets
	WHERE key = $1
	FOR UPDATE
)
INSERT INTO leaky_buckets AS t (key, last_touched_at, may_be_deleted_after, level)
VALUES ($1, statement_timestamp(), statement_timestamp() + make_interval(secs => $4),
	CASE WHEN GREATEST(0, $3) <= $2 THEN GREATEST(0, LEAST($2, $3)) ELSE 0 END)
ON CONFLICT (key) DO UPDATE SET
	last_touched_at = EXCLUDED.last_touched_at,
	may_be_deleted_after = EXCLUDED.may_be_deleted_after,
	level = CASE
		WHEN COALESCE((SELECT level_with_fillup FROM pre),
				GREATEST(0, GREATEST(0, t.level - (EXTRACT(EPOCH FROM (EXCLUDED.last_touched_at - t.last_touched_at)) * $5)) + $3)) <= $2
			THEN LEAST($2, COALESCE((SELECT level_with_fillup FROM pre),
				GREATEST(0, GREATEST(0, t.level - (EXTRACT(EPOCH FROM (EXCLUDED.last_touched_at - t.last_touched_at)) * $5)) + $3)))
		ELSE COALESCE((SELECT level_post_leak FROM pre),
			GREATEST(0, t.level - (EXTRACT(EPOCH FROM (EXCLUDED.last_touched_at - t.last_touched_at)) * $5)))
	END
RETURNING
	level::double precision AS level,
	level >= $2 AS at_capacity,
	COALESCE((SELECT level_with_fillup FROM pre), GREATEST(0, $3)) <= $2 AS accepted";

/// Install or extend a block under max semantics.
const SET_BLOCK_SQL: &str = "\
INSERT INTO blocks AS t (key, blocked_until)
VALUES ($1, statement_timestamp() + make_interval(secs => $2))
ON CONFLICT (key) DO UPDATE SET blocked_until = GREATEST(t.blocked_until, EXCLUDED.blocked_until)
RETURNING blocked_until";

const BLOCKED_UNTIL_SQL: &str = "\
SELECT blocked_until
FROM blocks
WHERE key = $1 AND blocked_until > statement_timestamp()";

const PRUNE_BUCKETS_SQL: &str =
	"DELETE FROM leaky_buckets WHERE may_be_deleted_after < statement_timestamp()";
const PRUNE_BLOCKS_SQL: &str = "DELETE FROM blocks WHERE blocked_until < statement_timestamp()";

const CREATE_TABLES_SQL: [&str; 4] = [
	"CREATE TABLE IF NOT EXISTS leaky_buckets (
		id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
		key TEXT NOT NULL UNIQUE,
		level DOUBLE PRECISION NOT NULL,
		last_touched_at TIMESTAMPTZ NOT NULL,
		may_be_deleted_after TIMESTAMPTZ NOT NULL
	)",
	"CREATE INDEX IF NOT EXISTS idx_leaky_buckets_may_be_deleted_after
		ON leaky_buckets (may_be_deleted_after)",
	"CREATE TABLE IF NOT EXISTS blocks (
		id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
		key TEXT NOT NULL UNIQUE,
		blocked_until TIMESTAMPTZ NOT NULL
	)",
	"CREATE INDEX IF NOT EXISTS idx_blocks_blocked_until ON blocks (blocked_until)",
];

/// Backend sharing state through a PostgreSQL database.
///
/// # Examples
///
/// ```no_run
/// use sluice::backends::PostgresBackend;
/// use sluice::StorageBackend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = PostgresBackend::connect("postgres://localhost/app").await?;
/// backend.create_tables().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresBackend {
	pool: PgPool,
}

impl PostgresBackend {
	/// Connect a new pool to `database_url`.
	pub async fn connect(database_url: &str) -> Result<Self> {
		let pool = PgPool::connect(database_url)
			.await
			.map_err(|e| Error::Storage(format!("failed to connect to PostgreSQL: {e}")))?;
		Ok(Self { pool })
	}

	/// Reuse an existing pool, the usual choice inside an application
	/// that already owns one.
	pub fn with_pool(pool: PgPool) -> Self {
		Self { pool }
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	fn retention_seconds(capacity: f64, leak_rate: f64) -> f64 {
		2.0 * capacity / leak_rate
	}
}

#[async_trait]
impl StorageBackend for PostgresBackend {
	async fn state(&self, key: &str, capacity: f64, leak_rate: f64) -> Result<BucketState> {
		let row = sqlx::query(STATE_SQL)
			.bind(key)
			.bind(capacity)
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
			.bind(key)
			.bind(capacity)
			.bind(n_tokens)
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
		let row = sqlx::query(ADD_TOKENS_CONDITIONALLY_SQL)
			.bind(key)
			.bind(capacity)
			.bind(n_tokens)
			.bind(Self::retention_seconds(capacity, leak_rate))
			.bind(leak_rate)
			.fetch_one(&self.pool)
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
		let row = sqlx::query(SET_BLOCK_SQL)
			.bind(key)
			.bind(block_for.as_secs_f64())
			.fetch_one(&self.pool)
			.await
			.map_err(|e| Error::Storage(format!("failed to set block: {e}")))?;

		row.try_get::<DateTime<Utc>, _>("blocked_until")
			.map_err(|e| Error::Storage(format!("failed to decode blocked_until: {e}")))
	}

	async fn blocked_until(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
		let row = sqlx::query(BLOCKED_UNTIL_SQL)
			.bind(key)
			.fetch_optional(&self.pool)
			.await
			.map_err(|e| Error::Storage(format!("failed to read block: {e}")))?;

		row.map(|row| {
			row.try_get::<DateTime<Utc>, _>("blocked_until")
				.map_err(|e| Error::Storage(format!("failed to decode blocked_until: {e}")))
		})
		.transpose()
	}

	async fn prune(&self) -> Result<u64> {
		let buckets = sqlx::query(PRUNE_BUCKETS_SQL)
			.execute(&self.pool)
			.await
			.map_err(|e| Error::Storage(format!("failed to prune buckets: {e}")))?
			.rows_affected();
		let blocks = sqlx::query(PRUNE_BLOCKS_SQL)
			.execute(&self.pool)
			.await
			.map_err(|e| Error::Storage(format!("failed to prune blocks: {e}")))?
			.rows_affected();

		tracing::debug!(buckets, blocks, "pruned PostgreSQL buckets and blocks");
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
