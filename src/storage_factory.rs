//! Assembles the storage pipeline for a named collection.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::background::BackgroundQueue;
use crate::error::Result;
use crate::local_db_state::DbEnvironment;
use crate::storage::{RecordStore, StorageHandle};
use crate::sync_config::{AlwaysOnline, Connectivity, SyncConfig, SyncHttpConfig};
use crate::sync_store::SyncStore;
use crate::sync_transport::{HttpSyncTransport, SyncTransport};

/// Builds [`StorageHandle`]s for collections of one environment.
///
/// The sync configuration is fixed for the lifetime of a factory. Handles
/// created by it keep that configuration even after
/// [`StorageFactory::reconfigure`] produces a new factory.
///
/// ```no_run
/// use offline_first_sync::local_db_model::Record;
/// use offline_first_sync::local_db_state::DbEnvironment;
/// use offline_first_sync::storage_factory::StorageFactory;
///
/// # async fn run() -> Result<(), offline_first_sync::error::StoreError> {
/// let env = DbEnvironment::open("app_data")?;
/// let factory = StorageFactory::from_environment(env);
/// let tasks = factory.create("tasks")?;
///
/// tasks.save(Record::with_id("t1")).await?;
/// assert_eq!(tasks.get_all().await?.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StorageFactory {
    env: DbEnvironment,
    sync: SyncConfig,
    http: SyncHttpConfig,
    transport: Option<Arc<dyn SyncTransport>>,
    connectivity: Arc<dyn Connectivity>,
    queue: BackgroundQueue,
    merge_window: Duration,
}

impl StorageFactory {
    pub fn new(env: DbEnvironment, sync: SyncConfig) -> Self {
        Self {
            env,
            sync,
            http: SyncHttpConfig::default(),
            transport: None,
            connectivity: Arc::new(AlwaysOnline),
            queue: BackgroundQueue::new(),
            merge_window: Duration::ZERO,
        }
    }

    /// Factory using the sync configuration persisted in `env`.
    pub fn from_environment(env: DbEnvironment) -> Self {
        let sync = SyncConfig::load(&env);
        Self::new(env, sync)
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_http_config(mut self, http: SyncHttpConfig) -> Self {
        self.http = http;
        self
    }

    /// Replaces the HTTP transport, e.g. with an in-process fake.
    pub fn with_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_merge_window(mut self, window: Duration) -> Self {
        self.merge_window = window;
        self
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync
    }

    pub fn environment(&self) -> &DbEnvironment {
        &self.env
    }

    /// Queue shared by every sync handle this factory creates.
    pub fn queue(&self) -> &BackgroundQueue {
        &self.queue
    }

    /// Storage handle for `collection`: the local store, wrapped in a
    /// [`SyncStore`] when sync is enabled.
    pub fn create(&self, collection: &str) -> Result<StorageHandle> {
        let local: Arc<dyn RecordStore> = Arc::new(self.env.collection(collection)?);

        if !self.sync.enabled {
            debug!("Collection '{}' is local-only", collection);
            return Ok(local);
        }

        let Some(transport) = self.transport() else {
            return Ok(local);
        };

        debug!("Collection '{}' syncs with {:?}", collection, self.sync.endpoint());
        let store = SyncStore::new(
            local,
            transport,
            Arc::clone(&self.connectivity),
            self.queue.clone(),
            &self.sync,
        )
        .with_merge_window(self.merge_window);

        Ok(Arc::new(store))
    }

    /// Persists `sync` and returns a factory built with it.
    pub fn reconfigure(&self, sync: SyncConfig) -> Result<Self> {
        sync.persist(&self.env)?;
        Ok(Self {
            sync,
            ..self.clone()
        })
    }

    fn transport(&self) -> Option<Arc<dyn SyncTransport>> {
        if let Some(transport) = &self.transport {
            return Some(Arc::clone(transport));
        }

        match HttpSyncTransport::new(self.sync.clone(), &self.http, Arc::clone(&self.connectivity)) {
            Ok(transport) => Some(Arc::new(transport)),
            Err(e) => {
                warn!("Sync transport unavailable, falling back to local-only storage: {e}");
                None
            }
        }
    }
}
