//! Backend contract suite shared by the per-backend integration tests.
//!
//! Every storage backend must pass these exercises unchanged; the only
//! backend-specific knobs are the key prefix (so suites running against
//! a shared server do not collide) and whether `prune` reports counts
//! (Redis prunes by TTL and always reports zero).

use std::sync::Arc;
use std::time::Duration;

use sluice::{Error, StorageBackend};

fn key(prefix: &str, name: &str) -> String {
	format!("{prefix}:{name}")
}

async fn sleep(millis: u64) {
	tokio::time::sleep(Duration::from_millis(millis)).await;
}

/// Level math: clamping, leaking, and pre/post semantics.
pub async fn exercise_bucket_contract(backend: &Arc<dyn StorageBackend>, prefix: &str) {
	// An untouched key reads as empty
	let state = backend.state(&key(prefix, "empty"), 10.0, 1.0).await.unwrap();
	assert_eq!(state.level, 0.0);
	assert!(!state.full);

	// Fill to capacity, then watch the leak drain it: capacity 1 at
	// 2 tokens/s is half gone after 250ms
	let k = key(prefix, "leak");
	let state = backend.add_tokens(&k, 1.0, 2.0, 1.0).await.unwrap();
	assert!((state.level - 1.0).abs() < 0.01, "level {}", state.level);
	assert!(state.full);

	sleep(250).await;
	let state = backend.state(&k, 1.0, 2.0).await.unwrap();
	assert!(
		(0.35..=0.65).contains(&state.level),
		"expected a half-drained bucket, level {}",
		state.level
	);
	assert!(!state.full);

	// Negative fillups clamp at zero
	let k = key(prefix, "negative");
	backend.add_tokens(&k, 15.0, 1.1, 5.0).await.unwrap();
	let state = backend.add_tokens(&k, 15.0, 1.1, -10.0).await.unwrap();
	assert!(state.level.abs() < 0.1, "level {}", state.level);

	// Oversized unconditional fillups clamp at capacity
	let k = key(prefix, "overfill");
	let state = backend.add_tokens(&k, 10.0, 1.0, 100.0).await.unwrap();
	assert!((state.level - 10.0).abs() < 0.01);
	assert!(state.full);

	// A touch with zero tokens agrees with a plain read
	let k = key(prefix, "agree");
	backend.add_tokens(&k, 20.0, 2.0, 12.5).await.unwrap();
	let touched = backend.add_tokens(&k, 20.0, 2.0, 0.0).await.unwrap();
	let observed = backend.state(&k, 20.0, 2.0).await.unwrap();
	assert!(
		(touched.level - observed.level).abs() < 0.1,
		"touch said {}, read said {}",
		touched.level,
		observed.level
	);
}

/// Conditional fillup: all-or-nothing semantics at the capacity edge.
pub async fn exercise_conditional_contract(backend: &Arc<dyn StorageBackend>, prefix: &str) {
	// Filling exactly to capacity is accepted
	let k = key(prefix, "exact");
	let fill = backend
		.add_tokens_conditionally(&k, 10.0, 0.5, 4.0)
		.await
		.unwrap();
	assert!(fill.accepted);
	let fill = backend
		.add_tokens_conditionally(&k, 10.0, 0.5, 6.0)
		.await
		.unwrap();
	assert!(fill.accepted);
	assert!(fill.level > 9.9, "level {}", fill.level);

	// An oversized fillup is rejected outright
	let k = key(prefix, "oversized");
	let fill = backend
		.add_tokens_conditionally(&k, 1.0, 1.0, 1.1)
		.await
		.unwrap();
	assert!(!fill.accepted);
	assert!(fill.level < 0.05, "level {}", fill.level);

	// The stairstep: capacity 1 draining over 1s
	let k = key(prefix, "stairstep");
	let fc = |n: f64| backend.add_tokens_conditionally(&k, 1.0, 1.0, n);

	let fill = fc(1.1).await.unwrap();
	assert!(!fill.accepted);
	assert!(fill.level < 0.05);

	for expected in [0.3, 0.6, 0.9] {
		let fill = fc(0.3).await.unwrap();
		assert!(fill.accepted, "fillup to {expected} was rejected");
		assert!(
			(fill.level - expected).abs() < 0.1,
			"expected ~{expected}, level {}",
			fill.level
		);
	}

	let fill = fc(0.3).await.unwrap();
	assert!(!fill.accepted);
	assert!((fill.level - 0.9).abs() < 0.1);

	// After 200ms there is room again
	sleep(200).await;
	let fill = fc(0.3).await.unwrap();
	assert!(fill.accepted);
	assert!((fill.level - 1.0).abs() < 0.1);

	// Draining below zero clamps, and a full refill fits afterwards
	let fill = fc(-2.0).await.unwrap();
	assert!(fill.accepted);
	assert!(fill.level.abs() < 0.05);

	let fill = fc(1.0).await.unwrap();
	assert!(fill.accepted);
	assert!((fill.level - 1.0).abs() < 0.1);

	// A rejected fillup still persists the leak update
	let k = key(prefix, "reject-persists");
	backend.add_tokens(&k, 10.0, 1.0, 10.0).await.unwrap();
	sleep(300).await;
	let fill = backend
		.add_tokens_conditionally(&k, 10.0, 1.0, 5.0)
		.await
		.unwrap();
	assert!(!fill.accepted);
	assert!(fill.level < 10.0, "leak was not persisted, level {}", fill.level);
}

/// Blocks: max semantics, lapsing, and zero-duration rejection.
pub async fn exercise_block_contract(backend: &Arc<dyn StorageBackend>, prefix: &str) {
	let k = key(prefix, "block");
	assert!(backend.blocked_until(&k).await.unwrap().is_none());

	let t = backend
		.set_block(&k, Duration::from_millis(2_200))
		.await
		.unwrap();
	let offset = (t - chrono::Utc::now()).num_milliseconds();
	assert!(
		(1_700..=2_700).contains(&offset),
		"block expiry {offset}ms away, expected ~2200ms"
	);

	let read_back = backend.blocked_until(&k).await.unwrap().unwrap();
	assert!((read_back - t).num_milliseconds().abs() < 100);

	// Zero durations are rejected and change nothing
	let result = backend.set_block(&k, Duration::ZERO).await;
	assert!(matches!(result, Err(Error::InvalidConfig(_))));
	let unchanged = backend.blocked_until(&k).await.unwrap().unwrap();
	assert!((unchanged - t).num_milliseconds().abs() < 100);

	// A shorter proposal cannot pull an existing block in; a longer one
	// extends it
	let shorter = backend
		.set_block(&k, Duration::from_millis(100))
		.await
		.unwrap();
	assert!((shorter - t).num_milliseconds().abs() < 100);
	let longer = backend.set_block(&k, Duration::from_secs(10)).await.unwrap();
	assert!(longer > t);

	// Blocks lapse by the clock alone
	let k = key(prefix, "lapse");
	backend
		.set_block(&k, Duration::from_millis(300))
		.await
		.unwrap();
	assert!(backend.blocked_until(&k).await.unwrap().is_some());
	sleep(450).await;
	assert!(backend.blocked_until(&k).await.unwrap().is_none());
}

/// Pruning: lapsed state disappears, live state survives.
pub async fn exercise_prune_contract(
	backend: &Arc<dyn StorageBackend>,
	prefix: &str,
	expect_counts: bool,
) {
	// Retention is 2 * capacity / leak_rate = 200ms for this bucket
	let short = key(prefix, "prune-short");
	backend.add_tokens(&short, 0.1, 1.0, 0.1).await.unwrap();
	let live = key(prefix, "prune-live");
	backend.add_tokens(&live, 100.0, 0.1, 50.0).await.unwrap();
	let lapsed_block = key(prefix, "prune-block");
	backend
		.set_block(&lapsed_block, Duration::from_millis(200))
		.await
		.unwrap();

	sleep(400).await;
	let removed = backend.prune().await.unwrap();
	if expect_counts {
		assert!(removed >= 2, "expected the short bucket and the lapsed block to go, removed {removed}");
	}

	// The lapsed state is gone either way
	assert!(backend.blocked_until(&lapsed_block).await.unwrap().is_none());
	let state = backend.state(&short, 0.1, 1.0).await.unwrap();
	assert_eq!(state.level, 0.0);

	// The live bucket survives
	let state = backend.state(&live, 100.0, 0.1).await.unwrap();
	assert!(state.level > 40.0, "live bucket was pruned, level {}", state.level);

	// Pruning again is harmless
	backend.prune().await.unwrap();
}
