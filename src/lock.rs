//! Per-resource locks over file-backed state
//!
//! Token files and the consensus membership artifacts are shared by every
//! request. Each read-modify-write sequence holds the lock of the path it
//! touches for its whole duration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of async mutexes keyed by resource path
#[derive(Clone, Debug, Default)]
pub struct ResourceLocks {
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ResourceLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `path`, creating it on first use
    pub async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}
