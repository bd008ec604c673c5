//! Process-wide default backend.
//!
//! Builders accept an explicit backend, and passing one is the preferred
//! style. The default slot exists for the common deployment where one
//! store serves every throttle in the process: install it once at
//! startup and omit `.backend(...)` everywhere else.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::backend::StorageBackend;
use crate::error::{Error, Result};

static DEFAULT_BACKEND: RwLock<Option<Arc<dyn StorageBackend>>> = RwLock::new(None);

/// Install the backend used by builders when none is supplied
/// explicitly. Meant to be called once at process start; later calls
/// replace the slot for subsequently built buckets and throttles.
pub fn set_default_backend(backend: Arc<dyn StorageBackend>) {
	*DEFAULT_BACKEND.write() = Some(backend);
}

/// The installed default backend.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] when no default has been installed.
pub fn default_backend() -> Result<Arc<dyn StorageBackend>> {
	DEFAULT_BACKEND.read().clone().ok_or_else(|| {
		Error::InvalidConfig(
			"no default storage backend is installed; call set_default_backend or pass .backend(...)"
				.to_string(),
		)
	})
}

/// Empty the default slot. Exists for test isolation.
pub fn clear_default_backend() {
	*DEFAULT_BACKEND.write() = None;
}

/// Prune lapsed buckets and blocks on the default backend, returning the
/// number of entries removed.
pub async fn prune() -> Result<u64> {
	default_backend()?.prune().await
}
