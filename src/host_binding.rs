//! Runtime-owning storage state behind the C ABI.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{info, warn};
use tokio::runtime::{Builder, Runtime};

use crate::error::Result;
use crate::local_db_state::DbEnvironment;
use crate::storage::StorageHandle;
use crate::storage_factory::StorageFactory;
use crate::sync_config::SyncConfig;

/// Grace period given to queued sync work when the binding closes.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// State handed to C callers as an opaque pointer.
///
/// Owns a small multi-thread runtime so background sync keeps progressing
/// between calls, and caches one handle per collection.
pub struct StorageBinding {
    runtime: Runtime,
    factory: Mutex<StorageFactory>,
    handles: Mutex<HashMap<String, StorageHandle>>,
}

impl StorageBinding {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("offline-first-sync")
            .enable_all()
            .build()?;
        let env = DbEnvironment::open(path)?;
        let factory = StorageFactory::from_environment(env);

        info!(
            "Storage opened at {} (sync {})",
            factory.environment().path().display(),
            if factory.sync_config().enabled { "enabled" } else { "disabled" }
        );

        Ok(Self {
            runtime,
            factory: Mutex::new(factory),
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Handle for `collection`, created on first use.
    pub fn handle(&self, collection: &str) -> Result<StorageHandle> {
        let mut handles = lock(&self.handles);
        if let Some(handle) = handles.get(collection) {
            return Ok(handle.clone());
        }

        let handle = lock(&self.factory).create(collection)?;
        handles.insert(collection.to_string(), handle.clone());
        Ok(handle)
    }

    /// Persists `config` and rebuilds the factory. Cached handles are
    /// dropped so the next call constructs them with the new configuration.
    pub fn configure_sync(&self, config: SyncConfig) -> Result<()> {
        let mut handles = lock(&self.handles);
        let mut factory = lock(&self.factory);
        *factory = factory.reconfigure(config)?;
        handles.clear();
        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfig {
        lock(&self.factory).sync_config().clone()
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Waits up to a short grace period for queued sync work, then drops
    /// the runtime.
    pub fn close(self) {
        let queue = lock(&self.factory).queue().clone();
        let drained = self
            .runtime
            .block_on(async { tokio::time::timeout(CLOSE_GRACE, queue.wait_idle()).await });
        if drained.is_err() {
            warn!("Closing storage with {} sync tasks still pending", queue.pending());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
