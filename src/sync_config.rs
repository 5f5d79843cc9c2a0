//! Sync configuration and device connectivity.
//!
//! Configuration is a plain value handed to the storage factory. It is read
//! from the metadata slot once, when the factory is built; changing it means
//! persisting a new value and building a new factory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::local_db_state::DbEnvironment;

/// Well-known metadata slot holding the persisted [`SyncConfig`] blob.
pub const SYNC_CONFIG_KEY: &str = "sync_config";

/// Remote replication settings, persisted as
/// `{ "enabled": bool, "endpoint"?: string, "apiKey"?: string }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl SyncConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(endpoint: impl Into<String>) -> Self {
        Self {
            enabled: true,
            endpoint: Some(endpoint.into()),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Endpoint with surrounding whitespace and trailing slashes removed,
    /// or `None` when unset or blank.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(|e| e.trim().trim_end_matches('/'))
            .filter(|e| !e.is_empty())
    }

    /// True when remote calls can actually be made.
    pub fn is_active(&self) -> bool {
        self.enabled && self.endpoint().is_some()
    }

    /// Loads the persisted configuration.
    ///
    /// A missing, unreadable or corrupt blob yields a disabled configuration.
    pub fn load(env: &DbEnvironment) -> Self {
        let bytes = match env.read_slot(SYNC_CONFIG_KEY) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Self::disabled(),
            Err(e) => {
                warn!("Could not read sync configuration, sync disabled: {e}");
                return Self::disabled();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(config) => config,
            Err(e) => {
                warn!("Corrupt sync configuration, sync disabled: {e}");
                Self::disabled()
            }
        }
    }

    pub fn persist(&self, env: &DbEnvironment) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        env.write_slot(SYNC_CONFIG_KEY, &json)
    }
}

/// HTTP client settings for the sync transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHttpConfig {
    #[serde(default = "default_timeout")]
    pub timeout: Duration,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for SyncHttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("offline_first_sync/{}", env!("CARGO_PKG_VERSION"))
}

/// Reports whether the device currently has network connectivity.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity for hosts that cannot observe the network; always online.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Connectivity flag flipped by the host on network change events.
#[derive(Debug)]
pub struct ConnectivityFlag {
    online: AtomicBool,
}

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
