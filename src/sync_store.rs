//! Local-first sync wrapper around a durable store.
//!
//! Every operation completes against the local store first and returns as
//! soon as the local result is durable. Remote work is queued on the
//! [`BackgroundQueue`] and its outcome never reaches the caller. On merge,
//! local records always win: a record that exists locally is never replaced
//! by its remote counterpart, whatever the timestamps say.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::oneshot;

use crate::background::BackgroundQueue;
use crate::error::{Result, StoreError, SyncError};
use crate::local_db_model::Record;
use crate::storage::RecordStore;
use crate::sync_config::{Connectivity, SyncConfig};
use crate::sync_transport::{self, SyncTransport};

pub struct SyncStore {
    local: Arc<dyn RecordStore>,
    transport: Arc<dyn SyncTransport>,
    connectivity: Arc<dyn Connectivity>,
    queue: BackgroundQueue,
    enabled: bool,
    merge_window: Duration,
    collection: String,
}

impl SyncStore {
    pub fn new(
        local: Arc<dyn RecordStore>,
        transport: Arc<dyn SyncTransport>,
        connectivity: Arc<dyn Connectivity>,
        queue: BackgroundQueue,
        config: &SyncConfig,
    ) -> Self {
        let collection = local.collection().to_string();
        Self {
            local,
            transport,
            connectivity,
            queue,
            enabled: config.enabled,
            merge_window: Duration::ZERO,
            collection,
        }
    }

    /// How long `get_all` waits for the remote merge before returning the
    /// local result alone. Zero by default.
    pub fn with_merge_window(mut self, window: Duration) -> Self {
        self.merge_window = window;
        self
    }

    pub fn queue(&self) -> &BackgroundQueue {
        &self.queue
    }

    fn should_sync(&self) -> bool {
        self.enabled && self.connectivity.is_online()
    }

    fn schedule_upload(&self) {
        let local = Arc::clone(&self.local);
        let transport = Arc::clone(&self.transport);
        let collection = self.collection.clone();

        self.queue.spawn(format!("upload {collection}"), async move {
            let snapshot = local.get_all().await?;
            transport.upload(&collection, &snapshot).await?;
            debug!("Uploaded {} records of '{}'", snapshot.len(), collection);
            Ok::<(), SyncError>(())
        });
    }

    fn schedule_remote_delete(&self, id: &str) {
        let transport = Arc::clone(&self.transport);
        let collection = self.collection.clone();
        let id = id.to_string();

        self.queue.spawn(format!("delete {collection}/{id}"), async move {
            transport.delete_remote(&collection, &id).await?;
            Ok::<(), SyncError>(())
        });
    }

    /// Queues a merge of the remote snapshot against `local_snapshot`.
    /// The receiver yields the records imported, if the merge succeeds.
    fn schedule_merge(&self, local_snapshot: Vec<Record>) -> oneshot::Receiver<Vec<Record>> {
        let (tx, rx) = oneshot::channel();
        let local = Arc::clone(&self.local);
        let transport = Arc::clone(&self.transport);
        let collection = self.collection.clone();

        self.queue.spawn(format!("merge {collection}"), async move {
            let imported =
                merge_remote(local.as_ref(), transport.as_ref(), &collection, &local_snapshot)
                    .await?;
            let _ = tx.send(imported);
            Ok::<(), StoreError>(())
        });

        rx
    }
}

/// Imports every remote record whose id is unknown locally.
///
/// Ids present in `local_snapshot` are filtered out before import, and the
/// insert itself refuses ids written locally since the snapshot was taken.
/// A failed download imports nothing; only local store errors are returned.
pub async fn merge_remote(
    local: &dyn RecordStore,
    transport: &dyn SyncTransport,
    collection: &str,
    local_snapshot: &[Record],
) -> Result<Vec<Record>> {
    let candidates = sync_transport::download(transport, collection, local_snapshot).await;

    let mut imported = Vec::with_capacity(candidates.len());
    for record in candidates {
        if let Some(stored) = local.insert_if_absent(record).await? {
            imported.push(stored);
        }
    }

    if !imported.is_empty() {
        info!("Imported {} remote records into '{}'", imported.len(), collection);
    }
    Ok(imported)
}

#[async_trait]
impl RecordStore for SyncStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn get_all(&self) -> Result<Vec<Record>> {
        let mut records = self.local.get_all().await?;
        if !self.should_sync() {
            return Ok(records);
        }

        let merged = self.schedule_merge(records.clone());
        if let Ok(Ok(imported)) = tokio::time::timeout(self.merge_window, merged).await {
            records.extend(imported);
        }
        Ok(records)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Record>> {
        self.local.get_by_id(id).await
    }

    async fn save(&self, record: Record) -> Result<Record> {
        let saved = self.local.save(record).await?;
        if self.should_sync() {
            self.schedule_upload();
        }
        Ok(saved)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let deleted = self.local.delete(id).await?;
        if deleted && self.should_sync() {
            self.schedule_remote_delete(id);
        }
        Ok(deleted)
    }

    async fn clear(&self) -> Result<()> {
        self.local.clear().await
    }

    async fn insert_if_absent(&self, record: Record) -> Result<Option<Record>> {
        self.local.insert_if_absent(record).await
    }
}
