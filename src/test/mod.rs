//! # Test Suite for Offline First Sync
//!
//! ## Test Categories
//!
//! - `local_store` - LMDB store contract, timestamps, persistence, config slot
//! - `storage_factory` - pipeline selection and explicit reconfiguration
//! - `sync_store` - local-wins merge, fire-and-forget replication
//! - `sync_transport` - HTTP protocol against a mock server
//! - `offline_cache` - install, activation sweep, fetch strategies, messages
//! - `ffi` - C ABI functions and their JSON envelopes
//!
//! Every test opens its own LMDB environment inside a `tempfile` directory,
//! so tests never share state and leave nothing behind.

mod offline_cache;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use crate::error::{CacheError, TransportError};
use crate::local_db_model::Record;
use crate::local_db_state::DbEnvironment;
use crate::offline_cache::{CachedResponse, FetchRequest, NetworkFetch};
use crate::sync_transport::SyncTransport;

pub(crate) fn temp_env() -> (TempDir, DbEnvironment) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let env = DbEnvironment::open(dir.path().join("data")).expect("open environment");
    (dir, env)
}

pub(crate) fn task(id: &str, title: &str) -> Record {
    Record::with_id(id).with_field("title", json!(title))
}

pub(crate) fn sorted_ids(records: &[Record]) -> Vec<String> {
    let mut ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
    ids.sort();
    ids
}

/// In-process remote service recording every call.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    remote: Mutex<HashMap<String, Vec<Record>>>,
    deletes: Mutex<Vec<(String, String)>>,
    uploads_started: AtomicUsize,
    uploads_finished: AtomicUsize,
    fetches: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    pub fn seed(&self, collection: &str, records: Vec<Record>) {
        self.remote.lock().unwrap().insert(collection.to_string(), records);
    }

    pub fn remote(&self, collection: &str) -> Vec<Record> {
        self.remote.lock().unwrap().get(collection).cloned().unwrap_or_default()
    }

    pub fn deletes(&self) -> Vec<(String, String)> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn uploads_started(&self) -> usize {
        self.uploads_started.load(Ordering::SeqCst)
    }

    pub fn uploads_finished(&self) -> usize {
        self.uploads_finished.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn outage(&self, method: &'static str, collection: &str) -> TransportError {
        TransportError::Status {
            method,
            url: format!("https://sync.test/{collection}"),
            status: 503,
        }
    }
}

#[async_trait]
impl SyncTransport for RecordingTransport {
    async fn upload(&self, collection: &str, records: &[Record]) -> Result<(), TransportError> {
        self.uploads_started.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.uploads_finished.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(self.outage("PUT", collection));
        }
        self.seed(collection, records.to_vec());
        Ok(())
    }

    async fn fetch(&self, collection: &str) -> Result<Vec<Record>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.outage("GET", collection));
        }
        Ok(self.remote(collection))
    }

    async fn delete_remote(&self, collection: &str, id: &str) -> Result<(), TransportError> {
        self.deletes
            .lock()
            .unwrap()
            .push((collection.to_string(), id.to_string()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.outage("DELETE", collection));
        }
        Ok(())
    }
}

/// Network double answering from a fixed table of responses.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    responses: Mutex<HashMap<String, CachedResponse>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), CachedResponse::new(status, body));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl NetworkFetch for ScriptedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse, CacheError> {
        let url = request.url.to_string();
        self.calls.lock().unwrap().push(url.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Network {
                url,
                reason: "network unreachable".to_string(),
            });
        }

        let responses = self.responses.lock().unwrap();
        Ok(responses
            .get(&url)
            .cloned()
            .unwrap_or_else(|| CachedResponse::new(404, "not found")))
    }
}
