use thiserror::Error;

use crate::throttle::ThrottleState;

/// Errors returned by bucket, throttle and storage operations.
#[derive(Debug, Error)]
pub enum Error {
	/// Construction or argument validation failed: a bucket with a
	/// non-positive capacity, both or neither of `leak_rate`/`over_time`,
	/// or a block with a zero duration.
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	/// The request was refused because a block is in effect.
	///
	/// This is a domain signal, not an operational failure. It is returned
	/// only from the strict request path and carries everything a caller
	/// needs to build a Retry-After response.
	#[error("request on {key:?} is throttled, retry after {retry_after_seconds}s")]
	Throttled {
		/// Key of the throttle that refused the request.
		key: String,
		/// The blocked state observed or installed by the request.
		state: ThrottleState,
		/// Whole seconds until the block lapses, rounded up.
		retry_after_seconds: u64,
	},

	/// A storage backend failed at the transport or query level. These
	/// propagate unchanged; the core never retries.
	#[error("storage backend error: {0}")]
	Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_throttled_display_includes_retry_after() {
		let err = Error::Throttled {
			key: "api:42".to_string(),
			state: ThrottleState::unblocked(),
			retry_after_seconds: 3,
		};
		let rendered = err.to_string();
		assert!(rendered.contains("api:42"));
		assert!(rendered.contains("3s"));
	}

	#[test]
	fn test_invalid_config_display() {
		let err = Error::InvalidConfig("capacity must be positive".to_string());
		assert_eq!(
			err.to_string(),
			"invalid configuration: capacity must be positive"
		);
	}
}
