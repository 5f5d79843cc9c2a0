//! Error types for the three failure domains of the crate.
//!
//! Local store errors are fatal to the calling operation and always reach
//! the caller. Transport errors never do: the sync layer logs and drops
//! them. Cache errors are fatal only during install.

use thiserror::Error;

/// Failure of the durable local store, the system of record.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("LMDB error: {0}")]
    Lmdb(#[from] lmdb::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Failure talking to the remote sync service.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{method} {url} returned HTTP {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },

    #[error("malformed response body: {0}")]
    Malformed(String),

    #[error("invalid sync endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Failure inside the offline delivery cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("install failed while caching {url}: {reason}")]
    Install { url: String, reason: String },

    #[error("network fetch failed for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("cache storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("invalid cache URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unknown control message: {0}")]
    BadMessage(String),

    #[error("cannot {action} while the worker is {state}")]
    InvalidState { action: &'static str, state: String },
}

/// Failure of a detached sync task. Only ever logged.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("local store: {0}")]
    Local(#[from] StoreError),

    #[error("remote: {0}")]
    Remote(#[from] TransportError),
}
