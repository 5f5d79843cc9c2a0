//! Durable LMDB-backed local store.
//!
//! One [`DbEnvironment`] owns the LMDB environment of a data directory. Each
//! collection lives in its own named database; internal databases use a
//! `__` prefix that collection names may not take.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lmdb::{Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, Transaction, WriteFlags};
use log::{debug, info};

use crate::error::{Result, StoreError};
use crate::local_db_model::Record;
use crate::offline_cache::LmdbCacheStorage;
use crate::storage::RecordStore;

const MAP_SIZE: usize = 1024 * 1024 * 1024;
const MAX_DBS: u32 = 128;
const MAX_COLLECTION_NAME: usize = 200;
const META_DB: &str = "__meta";

/// Handle to the LMDB environment backing every collection of one data
/// directory. Cheap to clone.
///
/// LMDB must not open the same environment twice in one process, so a host
/// opens the directory once and derives all collections from this value.
#[derive(Clone)]
pub struct DbEnvironment {
    env: Arc<Environment>,
    meta: Database,
    path: PathBuf,
}

impl DbEnvironment {
    /// Opens (creating if needed) the environment stored in `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        info!("Opening LMDB environment at: {}", path.display());

        let env = Environment::new()
            .set_flags(EnvironmentFlags::NO_TLS)
            .set_max_dbs(MAX_DBS)
            .set_map_size(MAP_SIZE)
            .open(&path)?;
        let meta = env.create_db(Some(META_DB), DatabaseFlags::empty())?;

        Ok(Self {
            env: Arc::new(env),
            meta,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the local store for `name`, creating its database on first use.
    pub fn collection(&self, name: &str) -> Result<LocalDbState> {
        validate_collection_name(name)?;
        let db = self.env.create_db(Some(name), DatabaseFlags::empty())?;
        debug!("Opened collection '{}'", name);
        Ok(LocalDbState {
            env: Arc::clone(&self.env),
            db,
            collection: name.to_string(),
        })
    }

    /// Reads a raw value from the metadata slot database.
    pub fn read_slot(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.meta, &key) {
            Ok(bytes) => Ok(Some(bytes.to_vec())),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Durably writes a raw value to the metadata slot database.
    pub fn write_slot(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.meta, &key, &value, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    /// Durable offline cache buckets stored alongside the collections.
    pub fn cache_storage(&self) -> Result<LmdbCacheStorage> {
        LmdbCacheStorage::open(self)
    }

    /// Opens an internal database; `name` must carry the `__` prefix.
    pub(crate) fn internal_db(&self, name: &str) -> Result<Database> {
        debug_assert!(name.starts_with("__"));
        Ok(self.env.create_db(Some(name), DatabaseFlags::empty())?)
    }

    pub(crate) fn env(&self) -> &Arc<Environment> {
        &self.env
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidCollection("name must not be empty".to_string()));
    }
    if name.starts_with("__") {
        return Err(StoreError::InvalidCollection(format!(
            "'{name}' uses the reserved '__' prefix"
        )));
    }
    if name.len() > MAX_COLLECTION_NAME {
        return Err(StoreError::InvalidCollection(format!(
            "name exceeds {MAX_COLLECTION_NAME} bytes"
        )));
    }
    Ok(())
}

/// Durable store for a single collection.
///
/// Every write commits its LMDB transaction before returning, so a later
/// read in the same process always observes it.
#[derive(Clone)]
pub struct LocalDbState {
    env: Arc<Environment>,
    db: Database,
    collection: String,
}

impl LocalDbState {
    pub fn get_record(&self, id: &str) -> Result<Option<Record>> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.db, &id) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn all_records(&self) -> Result<Vec<Record>> {
        let txn = self.env.begin_ro_txn()?;
        let mut records = Vec::new();
        {
            let mut cursor = txn.open_ro_cursor(self.db)?;
            for (_key, value) in cursor.iter() {
                records.push(serde_json::from_slice(value)?);
            }
        }
        Ok(records)
    }

    /// Upserts `record` in one write transaction.
    ///
    /// New records get `created_at` (when unset) and `updated_at` stamped
    /// with the current time. Existing records keep their stored
    /// `created_at`, and `updated_at` never moves backwards.
    pub fn put_record(&self, mut record: Record) -> Result<Record> {
        if record.id.is_empty() {
            return Err(StoreError::InvalidRecord("record id must not be empty".to_string()));
        }

        let now = Utc::now();
        let mut txn = self.env.begin_rw_txn()?;

        let stored: Option<Record> = match txn.get(self.db, &record.id) {
            Ok(bytes) => Some(serde_json::from_slice(bytes)?),
            Err(lmdb::Error::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        match stored {
            Some(stored) => {
                record.created_at = stored.created_at.or(record.created_at).or(Some(now));
                record.updated_at = Some(stored.updated_at.map_or(now, |prev| prev.max(now)));
            }
            None => {
                if record.created_at.is_none() {
                    record.created_at = Some(now);
                }
                record.updated_at = Some(now);
            }
        }

        let json = serde_json::to_vec(&record)?;
        txn.put(self.db, &record.id, &json, WriteFlags::empty())?;
        txn.commit()?;

        Ok(record)
    }

    /// Inserts `record` unless its id is already stored. Timestamps the
    /// record already carries are kept; missing ones are stamped now.
    pub fn insert_new_record(&self, mut record: Record) -> Result<Option<Record>> {
        if record.id.is_empty() {
            return Err(StoreError::InvalidRecord("record id must not be empty".to_string()));
        }

        let now = Utc::now();
        let created_at = *record.created_at.get_or_insert(now);
        if record.updated_at.is_none() {
            record.updated_at = Some(created_at.max(now));
        }

        let json = serde_json::to_vec(&record)?;
        let mut txn = self.env.begin_rw_txn()?;
        match txn.put(self.db, &record.id, &json, WriteFlags::NO_OVERWRITE) {
            Ok(()) => {
                txn.commit()?;
                Ok(Some(record))
            }
            Err(lmdb::Error::KeyExist) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_record(&self, id: &str) -> Result<bool> {
        let mut txn = self.env.begin_rw_txn()?;
        match txn.del(self.db, &id, None) {
            Ok(()) => {
                txn.commit()?;
                Ok(true)
            }
            Err(lmdb::Error::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear_records(&self) -> Result<()> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.clear_db(self.db)?;
        txn.commit()?;
        info!("Cleared collection '{}'", self.collection);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for LocalDbState {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn get_all(&self) -> Result<Vec<Record>> {
        self.all_records()
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Record>> {
        self.get_record(id)
    }

    async fn save(&self, record: Record) -> Result<Record> {
        self.put_record(record)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.remove_record(id)
    }

    async fn insert_if_absent(&self, record: Record) -> Result<Option<Record>> {
        self.insert_new_record(record)
    }

    async fn clear(&self) -> Result<()> {
        self.clear_records()
    }
}
