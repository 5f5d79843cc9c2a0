//! Named cache buckets.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use lmdb::{Cursor, Database, Environment, Transaction, WriteFlags};
use tokio::sync::Mutex;

use super::fetch::CachedResponse;
use crate::error::{self, CacheError};
use crate::local_db_state::DbEnvironment;

const CACHE_DB: &str = "__offline_cache";
const SEPARATOR: u8 = 0;

/// Bucketed response storage shared by every client of an origin.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Creates `bucket` if it does not exist yet.
    async fn open(&self, bucket: &str) -> Result<(), CacheError>;

    /// Stores `response` under `key`, creating the bucket if needed.
    async fn put(&self, bucket: &str, key: &str, response: &CachedResponse) -> Result<(), CacheError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedResponse>, CacheError>;

    async fn bucket_names(&self) -> Result<Vec<String>, CacheError>;

    /// Returns `false` when the bucket did not exist.
    async fn delete_bucket(&self, bucket: &str) -> Result<bool, CacheError>;
}

/// In-process bucket storage.
#[derive(Default)]
pub struct MemoryCacheStorage {
    buckets: Mutex<BTreeMap<String, HashMap<String, CachedResponse>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, bucket: &str) -> Result<(), CacheError> {
        self.buckets.lock().await.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn put(&self, bucket: &str, key: &str, response: &CachedResponse) -> Result<(), CacheError> {
        self.buckets
            .lock()
            .await
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), response.clone());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let buckets = self.buckets.lock().await;
        Ok(buckets.get(bucket).and_then(|entries| entries.get(key)).cloned())
    }

    async fn bucket_names(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.buckets.lock().await.keys().cloned().collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<bool, CacheError> {
        Ok(self.buckets.lock().await.remove(bucket).is_some())
    }
}

/// Durable bucket storage inside the storage environment.
///
/// Entries live in one internal database keyed `{bucket}\0{key}`. An empty
/// key marks the bucket itself, so empty buckets survive restarts.
#[derive(Clone)]
pub struct LmdbCacheStorage {
    env: Arc<Environment>,
    db: Database,
}

impl LmdbCacheStorage {
    pub fn open(env: &DbEnvironment) -> error::Result<Self> {
        let db = env.internal_db(CACHE_DB)?;
        Ok(Self {
            env: Arc::clone(env.env()),
            db,
        })
    }

    fn entry_key(bucket: &str, key: &str) -> Vec<u8> {
        let mut entry = Vec::with_capacity(bucket.len() + key.len() + 1);
        entry.extend_from_slice(bucket.as_bytes());
        entry.push(SEPARATOR);
        entry.extend_from_slice(key.as_bytes());
        entry
    }

    fn write(&self, bucket: &str, key: &str, value: &[u8]) -> error::Result<()> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.db, &Self::entry_key(bucket, ""), &"", WriteFlags::empty())?;
        if !key.is_empty() {
            txn.put(self.db, &Self::entry_key(bucket, key), &value, WriteFlags::empty())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn read(&self, bucket: &str, key: &str) -> error::Result<Option<CachedResponse>> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.db, &Self::entry_key(bucket, key)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn names(&self) -> error::Result<Vec<String>> {
        let txn = self.env.begin_ro_txn()?;
        let mut names = BTreeSet::new();
        {
            let mut cursor = txn.open_ro_cursor(self.db)?;
            for (key, _value) in cursor.iter() {
                if let Some(end) = key.iter().position(|b| *b == SEPARATOR) {
                    names.insert(String::from_utf8_lossy(&key[..end]).into_owned());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn remove_bucket(&self, bucket: &str) -> error::Result<bool> {
        let prefix = Self::entry_key(bucket, "");
        let mut txn = self.env.begin_rw_txn()?;

        let keys: Vec<Vec<u8>> = {
            let mut cursor = txn.open_ro_cursor(self.db)?;
            cursor
                .iter()
                .map(|(key, _value)| key)
                .skip_while(|key| !key.starts_with(&prefix))
                .take_while(|key| key.starts_with(&prefix))
                .map(|key| key.to_vec())
                .collect()
        };

        if keys.is_empty() {
            return Ok(false);
        }
        for key in &keys {
            txn.del(self.db, key, None)?;
        }
        txn.commit()?;
        Ok(true)
    }
}

#[async_trait]
impl CacheStorage for LmdbCacheStorage {
    async fn open(&self, bucket: &str) -> Result<(), CacheError> {
        Ok(self.write(bucket, "", &[])?)
    }

    async fn put(&self, bucket: &str, key: &str, response: &CachedResponse) -> Result<(), CacheError> {
        let json = serde_json::to_vec(response).map_err(error::StoreError::from)?;
        Ok(self.write(bucket, key, &json)?)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        Ok(self.read(bucket, key)?)
    }

    async fn bucket_names(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.names()?)
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<bool, CacheError> {
        Ok(self.remove_bucket(bucket)?)
    }
}
