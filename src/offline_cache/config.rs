//! Offline cache configuration: generation, precache lists and the static
//! asset allow-list.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CacheError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineCacheConfig {
    /// Generation tag appended to every bucket name, e.g. `v1`.
    #[serde(default = "default_version")]
    pub version: String,

    /// Origin the cache serves. Requests to any other origin pass through.
    pub origin: Url,

    /// Navigable routes of the application shell, cached on install.
    #[serde(default = "default_shell_routes")]
    pub shell_routes: Vec<String>,

    /// Static asset paths cached on install.
    #[serde(default)]
    pub static_assets: Vec<String>,

    /// File extensions (with leading dot) treated as static assets.
    #[serde(default = "default_static_extensions")]
    pub static_extensions: Vec<String>,

    /// Path prefixes treated as static assets.
    #[serde(default = "default_static_prefixes")]
    pub static_prefixes: Vec<String>,

    /// Document served to failed navigations.
    #[serde(default = "default_root_document")]
    pub root_document: String,
}

impl OfflineCacheConfig {
    pub fn new(origin: Url) -> Self {
        Self {
            version: default_version(),
            origin,
            shell_routes: default_shell_routes(),
            static_assets: Vec::new(),
            static_extensions: default_static_extensions(),
            static_prefixes: default_static_prefixes(),
            root_document: default_root_document(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_shell_routes<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shell_routes = routes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_static_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.static_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    pub fn shell_bucket(&self) -> String {
        format!("shell-{}", self.version)
    }

    pub fn static_bucket(&self) -> String {
        format!("static-{}", self.version)
    }

    pub fn default_bucket(&self) -> String {
        format!("default-{}", self.version)
    }

    /// Live bucket names of the current generation, in lookup order.
    pub fn current_buckets(&self) -> [String; 3] {
        [self.shell_bucket(), self.static_bucket(), self.default_bucket()]
    }

    /// Resolves a path or absolute URL against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, CacheError> {
        self.origin.join(path).map_err(|e| CacheError::InvalidUrl {
            url: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// True when `url` matches the static prefix or extension allow-list.
    pub fn is_static_asset(&self, url: &Url) -> bool {
        let path = url.path();
        if self.static_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return true;
        }

        let file_name = path.rsplit('/').next().unwrap_or_default().to_ascii_lowercase();
        self.static_extensions
            .iter()
            .any(|ext| file_name.ends_with(&ext.to_ascii_lowercase()))
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }
}

fn default_version() -> String {
    "v1".to_string()
}

fn default_shell_routes() -> Vec<String> {
    vec!["/".to_string()]
}

fn default_root_document() -> String {
    "/".to_string()
}

fn default_static_extensions() -> Vec<String> {
    [
        ".js", ".mjs", ".css", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico",
        ".woff", ".woff2", ".ttf", ".otf", ".json", ".webmanifest",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

fn default_static_prefixes() -> Vec<String> {
    ["/static/", "/assets/", "/icons/", "/fonts/"]
        .iter()
        .map(|prefix| prefix.to_string())
        .collect()
}
