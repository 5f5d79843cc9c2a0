//! Client for the remote sync protocol.
//!
//! ```text
//! PUT    {endpoint}/{collection}        body { "items": [...] }  (full replace)
//! GET    {endpoint}/{collection}        -> { "items": [...] }
//! DELETE {endpoint}/{collection}/{id}
//! ```
//!
//! Every request carries `Authorization: Bearer {apiKey}` when a key is
//! configured. All three calls are no-ops while sync is disabled, the
//! endpoint is unset, or the device is offline.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Method, RequestBuilder, Response};
use url::Url;

use crate::error::TransportError;
use crate::local_db_model::{Record, RecordEnvelope};
use crate::sync_config::{Connectivity, SyncConfig, SyncHttpConfig};

type Result<T> = std::result::Result<T, TransportError>;

/// Remote replication primitives, one collection per call.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Replaces the remote snapshot of `collection` with `records`.
    async fn upload(&self, collection: &str, records: &[Record]) -> Result<()>;

    /// Fetches the full remote snapshot of `collection`.
    async fn fetch(&self, collection: &str) -> Result<Vec<Record>>;

    async fn delete_remote(&self, collection: &str, id: &str) -> Result<()>;
}

/// Remote records whose id is absent from `local`, for merge.
///
/// Any transport failure yields an empty list.
pub async fn download(
    transport: &dyn SyncTransport,
    collection: &str,
    local: &[Record],
) -> Vec<Record> {
    match transport.fetch(collection).await {
        Ok(remote) => remote_only(remote, local),
        Err(e) => {
            warn!("Download of '{collection}' failed: {e}");
            Vec::new()
        }
    }
}

/// Filters `remote` down to records unknown locally. Remote duplicates and
/// records without an id are dropped.
pub fn remote_only(remote: Vec<Record>, local: &[Record]) -> Vec<Record> {
    let known: HashSet<&str> = local.iter().map(|r| r.id.as_str()).collect();
    let mut seen = HashSet::new();
    remote
        .into_iter()
        .filter(|r| !r.id.is_empty() && !known.contains(r.id.as_str()))
        .filter(|r| seen.insert(r.id.clone()))
        .collect()
}

/// [`SyncTransport`] over HTTP.
pub struct HttpSyncTransport {
    client: reqwest::Client,
    config: SyncConfig,
    connectivity: Arc<dyn Connectivity>,
}

impl HttpSyncTransport {
    pub fn new(
        config: SyncConfig,
        http: &SyncHttpConfig,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http.timeout)
            .user_agent(&http.user_agent)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        Ok(Self {
            client,
            config,
            connectivity,
        })
    }

    /// Base endpoint when a remote call may be made right now.
    fn reachable_endpoint(&self) -> Option<&str> {
        if !self.config.enabled || !self.connectivity.is_online() {
            return None;
        }
        self.config.endpoint()
    }

    fn url(&self, endpoint: &str, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(endpoint)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

fn ensure_success(method: &'static str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TransportError::Status {
            method,
            url: response.url().to_string(),
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn upload(&self, collection: &str, records: &[Record]) -> Result<()> {
        let Some(endpoint) = self.reachable_endpoint() else {
            return Ok(());
        };
        let url = self.url(endpoint, &[collection])?;
        debug!("PUT {} ({} records)", url, records.len());

        let body = RecordEnvelope {
            items: records.to_vec(),
        };
        let response = self.request(Method::PUT, url).json(&body).send().await?;
        ensure_success("PUT", response)?;
        Ok(())
    }

    async fn fetch(&self, collection: &str) -> Result<Vec<Record>> {
        let Some(endpoint) = self.reachable_endpoint() else {
            return Ok(Vec::new());
        };
        let url = self.url(endpoint, &[collection])?;
        debug!("GET {}", url);

        let response = self.request(Method::GET, url).send().await?;
        let response = ensure_success("GET", response)?;
        let body = response.bytes().await?;
        let envelope: RecordEnvelope =
            serde_json::from_slice(&body).map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(envelope.items)
    }

    async fn delete_remote(&self, collection: &str, id: &str) -> Result<()> {
        let Some(endpoint) = self.reachable_endpoint() else {
            return Ok(());
        };
        let url = self.url(endpoint, &[collection, id])?;
        debug!("DELETE {}", url);

        let response = self.request(Method::DELETE, url).send().await?;
        ensure_success("DELETE", response)?;
        Ok(())
    }
}
