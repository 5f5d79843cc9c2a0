//! The storage contract every domain service depends on.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::local_db_model::Record;

/// Asynchronous CRUD contract over one collection of [`Record`]s.
///
/// Implemented by the durable local store and by the sync wrapper, so a
/// service holding a [`StorageHandle`] never knows whether replication is
/// active.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Name of the collection this handle is bound to.
    fn collection(&self) -> &str;

    /// All records of the collection, in no guaranteed order.
    async fn get_all(&self) -> Result<Vec<Record>>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Record>>;

    /// Upserts `record` and returns it as persisted, timestamps included.
    async fn save(&self, record: Record) -> Result<Record>;

    /// Returns `false` when no record with `id` existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    /// Stores `record` only if its id is unknown, keeping any timestamps it
    /// already carries. Returns the stored record, or `None` when a record
    /// with that id already existed and was left untouched.
    async fn insert_if_absent(&self, record: Record) -> Result<Option<Record>> {
        if self.get_by_id(&record.id).await?.is_some() {
            return Ok(None);
        }
        self.save(record).await.map(Some)
    }

    /// All records tagged with `kind`.
    async fn get_by_kind(&self, kind: &str) -> Result<Vec<Record>> {
        let records = self.get_all().await?;
        Ok(records.into_iter().filter(|r| r.is_kind(kind)).collect())
    }
}

/// Shared handle returned by the storage factory.
pub type StorageHandle = Arc<dyn RecordStore>;
