//! Offline delivery cache for the application shell and static assets.
//!
//! Lifecycle, driven by the host:
//!
//! 1. [`OfflineCache::install`] precaches the shell routes into
//!    `shell-{version}` and the static assets into `static-{version}`. Any
//!    failure aborts the install; a partially cached shell is never served.
//! 2. [`OfflineCache::activate`] deletes every bucket that does not belong
//!    to the current generation and claims all open clients.
//! 3. [`OfflineCache::handle_fetch`] decides, per intercepted request,
//!    between pass-through, cache-first and network-first.
//!
//! [`ControlMessage`]s arrive on the control channel: `SKIP_WAITING`
//! activates a pending install, `CACHE_URLS` precaches extra URLs.

pub mod config;
pub mod fetch;
pub mod storage;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
pub use config::OfflineCacheConfig;
pub use fetch::{CachedResponse, FetchRequest, HttpFetcher, NetworkFetch, RequestMode};
pub use storage::{CacheStorage, LmdbCacheStorage, MemoryCacheStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    /// Installed and ready to activate.
    Installed,
    Activating,
    Activated,
    /// Install failed; this generation is never activated.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Commands accepted on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    SkipWaiting,
    CacheUrls { urls: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    /// Cached root document served to a failed navigation.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not intercepted; the host performs the request unmodified.
    PassThrough,
    Respond {
        response: CachedResponse,
        source: ResponseSource,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub deleted_buckets: Vec<String>,
    pub claimed_clients: usize,
}

/// Open application clients (tabs, windows) of the origin.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// Puts every open client under control of `generation`; returns how
    /// many clients were claimed.
    async fn claim(&self, generation: &str) -> usize;
}

/// In-process [`ClientRegistry`] mapping client ids to their controlling
/// generation.
#[derive(Default)]
pub struct OpenClients {
    controllers: Mutex<HashMap<String, Option<String>>>,
}

impl OpenClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: impl Into<String>) {
        lock(&self.controllers).insert(client_id.into(), None);
    }

    pub fn unregister(&self, client_id: &str) {
        lock(&self.controllers).remove(client_id);
    }

    /// Generation controlling `client_id`, if any.
    pub fn controller(&self, client_id: &str) -> Option<String> {
        lock(&self.controllers).get(client_id).cloned().flatten()
    }
}

#[async_trait]
impl ClientRegistry for OpenClients {
    async fn claim(&self, generation: &str) -> usize {
        let mut controllers = lock(&self.controllers);
        for controller in controllers.values_mut() {
            *controller = Some(generation.to_string());
        }
        controllers.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One generation of the offline cache.
pub struct OfflineCache {
    config: OfflineCacheConfig,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn NetworkFetch>,
    clients: Arc<dyn ClientRegistry>,
    state: Mutex<WorkerState>,
}

impl OfflineCache {
    pub fn new(
        config: OfflineCacheConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn NetworkFetch>,
        clients: Arc<dyn ClientRegistry>,
    ) -> Self {
        Self {
            config,
            storage,
            network,
            clients,
            state: Mutex::new(WorkerState::Parsed),
        }
    }

    pub fn config(&self) -> &OfflineCacheConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    fn set_state(&self, state: WorkerState) {
        debug!("Offline cache {} -> {}", self.config.version, state);
        *lock(&self.state) = state;
    }

    /// Precaches the shell and static buckets. On success the worker is
    /// ready to activate at once, without waiting for older clients.
    pub async fn install(&self) -> Result<(), CacheError> {
        let state = self.state();
        if !matches!(state, WorkerState::Parsed | WorkerState::Installed) {
            return Err(CacheError::InvalidState {
                action: "install",
                state: state.to_string(),
            });
        }

        self.set_state(WorkerState::Installing);
        let shell = self.config.shell_bucket();
        let statics = self.config.static_bucket();

        let result = match self.precache(&shell, &self.config.shell_routes).await {
            Ok(()) => self.precache(&statics, &self.config.static_assets).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!("Offline cache {} installed", self.config.version);
                self.set_state(WorkerState::Installed);
                Ok(())
            }
            Err(e) => {
                warn!("Offline cache {} install failed: {e}", self.config.version);
                self.set_state(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    /// Fetches every path first and stores only once all succeeded.
    async fn precache(&self, bucket: &str, paths: &[String]) -> Result<(), CacheError> {
        let mut fetched = Vec::with_capacity(paths.len());
        for path in paths {
            let url = self.config.resolve(path)?;
            let request = FetchRequest::get(url);
            let install_error = |reason: String| CacheError::Install {
                url: request.url.to_string(),
                reason,
            };

            let response = self
                .network
                .fetch(&request)
                .await
                .map_err(|e| install_error(e.to_string()))?;
            if !response.is_success() {
                return Err(install_error(format!("HTTP {}", response.status)));
            }
            fetched.push((request.cache_key(), response));
        }

        self.storage.open(bucket).await?;
        for (key, response) in &fetched {
            self.storage.put(bucket, key, response).await?;
        }
        debug!("Cached {} entries into '{}'", fetched.len(), bucket);
        Ok(())
    }

    /// Deletes every stale bucket and claims all open clients.
    pub async fn activate(&self) -> Result<ActivationReport, CacheError> {
        let state = self.state();
        if state != WorkerState::Installed {
            return Err(CacheError::InvalidState {
                action: "activate",
                state: state.to_string(),
            });
        }

        self.set_state(WorkerState::Activating);
        match self.sweep().await {
            Ok(deleted_buckets) => {
                let claimed_clients = self.clients.claim(&self.config.version).await;
                self.set_state(WorkerState::Activated);
                info!(
                    "Offline cache {} active: {} stale buckets removed, {} clients claimed",
                    self.config.version,
                    deleted_buckets.len(),
                    claimed_clients
                );
                Ok(ActivationReport {
                    deleted_buckets,
                    claimed_clients,
                })
            }
            Err(e) => {
                self.set_state(WorkerState::Installed);
                Err(e)
            }
        }
    }

    async fn sweep(&self) -> Result<Vec<String>, CacheError> {
        let live = self.config.current_buckets();
        let mut deleted = Vec::new();
        for name in self.storage.bucket_names().await? {
            if live.contains(&name) {
                continue;
            }
            if self.storage.delete_bucket(&name).await? {
                debug!("Deleted stale cache bucket '{}'", name);
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    /// Decides how to answer an intercepted request.
    ///
    /// `Err` carries a network failure that no cache entry could cover.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, CacheError> {
        if self.state() != WorkerState::Activated || !self.intercepts(request) {
            return Ok(FetchOutcome::PassThrough);
        }

        if request.is_navigation() || self.config.is_static_asset(&request.url) {
            self.cache_first(request).await
        } else {
            self.network_first(request).await
        }
    }

    fn intercepts(&self, request: &FetchRequest) -> bool {
        request.method == Method::GET
            && matches!(request.url.scheme(), "http" | "https")
            && self.config.is_same_origin(&request.url)
    }

    async fn cache_first(&self, request: &FetchRequest) -> Result<FetchOutcome, CacheError> {
        let key = request.cache_key();
        if let Some(response) = self.lookup(&key).await {
            return Ok(respond(response, ResponseSource::Cache));
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                self.store_if_success(&key, &response).await;
                Ok(respond(response, ResponseSource::Network))
            }
            Err(e) => self.navigation_fallback(request, e).await,
        }
    }

    async fn network_first(&self, request: &FetchRequest) -> Result<FetchOutcome, CacheError> {
        let key = request.cache_key();
        match self.network.fetch(request).await {
            Ok(response) => {
                self.store_if_success(&key, &response).await;
                Ok(respond(response, ResponseSource::Network))
            }
            Err(e) => match self.lookup(&key).await {
                Some(response) => Ok(respond(response, ResponseSource::Cache)),
                None => self.navigation_fallback(request, e).await,
            },
        }
    }

    async fn navigation_fallback(
        &self,
        request: &FetchRequest,
        error: CacheError,
    ) -> Result<FetchOutcome, CacheError> {
        if request.is_navigation() {
            if let Some(root) = self.root_document().await {
                debug!("Serving cached root document for {}", request.url);
                return Ok(respond(root, ResponseSource::Fallback));
            }
        }
        Err(error)
    }

    async fn root_document(&self) -> Option<CachedResponse> {
        let url = self.config.resolve(&self.config.root_document).ok()?;
        self.lookup(&fetch::cache_key(&url)).await
    }

    /// Looks `key` up across the live buckets. Storage errors count as a
    /// miss.
    async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        for bucket in self.config.current_buckets() {
            match self.storage.get(&bucket, key).await {
                Ok(Some(response)) => return Some(response),
                Ok(None) => {}
                Err(e) => warn!("Cache lookup in '{}' failed: {e}", bucket),
            }
        }
        None
    }

    async fn store_if_success(&self, key: &str, response: &CachedResponse) {
        if !response.is_success() {
            return;
        }
        let bucket = self.config.default_bucket();
        if let Err(e) = self.storage.put(&bucket, key, response).await {
            warn!("Could not cache {key} into '{bucket}': {e}");
        }
    }

    pub async fn handle_message(&self, message: ControlMessage) -> Result<(), CacheError> {
        match message {
            ControlMessage::SkipWaiting => {
                if self.state() == WorkerState::Installed {
                    self.activate().await?;
                } else {
                    debug!("SKIP_WAITING ignored in state {}", self.state());
                }
                Ok(())
            }
            ControlMessage::CacheUrls { urls } => {
                self.cache_urls(&urls).await;
                Ok(())
            }
        }
    }

    /// Parses and handles a JSON control message.
    pub async fn handle_message_json(&self, json: &str) -> Result<(), CacheError> {
        let message: ControlMessage =
            serde_json::from_str(json).map_err(|e| CacheError::BadMessage(e.to_string()))?;
        self.handle_message(message).await
    }

    /// Caches each URL into the default bucket. Individual failures are
    /// logged and skipped.
    async fn cache_urls(&self, urls: &[String]) {
        for raw in urls {
            let request = match self.config.resolve(raw) {
                Ok(url) => FetchRequest::get(url),
                Err(e) => {
                    warn!("Skipping {raw}: {e}");
                    continue;
                }
            };

            match self.network.fetch(&request).await {
                Ok(response) if response.is_success() => {
                    self.store_if_success(&request.cache_key(), &response).await;
                }
                Ok(response) => warn!("Not caching {}: HTTP {}", request.url, response.status),
                Err(e) => warn!("Not caching {}: {e}", request.url),
            }
        }
    }
}

fn respond(response: CachedResponse, source: ResponseSource) -> FetchOutcome {
    FetchOutcome::Respond { response, source }
}
