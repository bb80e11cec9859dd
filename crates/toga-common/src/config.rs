//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::{CommonError, Result};

/// Deployment version token. Bump whenever the manifest or strategy logic changes.
pub const DEFAULT_VERSION: &str = "toga-v11.0.0";

/// Abort threshold for the page-side data loader.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 12_000;

/// Immutable worker configuration, built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Version token embedded in every partition name
    pub version: String,

    /// Registration scope; every relative path resolves against it
    pub scope: Url,

    /// Ordered app-shell assets fetched at install time
    pub precache_manifest: Vec<String>,

    /// Hostname fragments identifying third-party data API traffic
    pub api_host_fragments: Vec<String>,

    /// Generic offline page used when the requested page is not cached
    pub offline_page: String,

    /// Home page, last cached fallback for navigations
    pub home_page: String,

    /// Timeout applied by the caller-facing fetch wrapper
    pub fetch_timeout_ms: u64,

    /// User agent for the network fetcher
    pub user_agent: String,

    /// Directory for durable partitions; in-memory only when unset
    pub storage_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            scope: default_scope(),
            precache_manifest: [
                "./",
                "./index.html",
                "./ar.html",
                "./gallery.html",
                "./profile.html",
                "./marker-generator.html",
                "./print-markers.html",
                "./offline.html",
                "./manifest.webmanifest",
                "./assets/style.css",
                "./assets/app.js",
                "./assets/pwa.js",
                "./assets/theme.js",
                "./assets/icons/icon-192.png",
                "./assets/icons/icon-512.png",
                "./data/plants.json",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            api_host_fragments: vec![
                "script.google.com".to_string(),
                "script.googleusercontent.com".to_string(),
            ],
            offline_page: "./offline.html".to_string(),
            home_page: "./index.html".to_string(),
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            user_agent: format!("toga-sw/{}", env!("CARGO_PKG_VERSION")),
            storage_dir: None,
        }
    }
}

fn default_scope() -> Url {
    // Static literal; parsing cannot fail.
    Url::parse("http://localhost/").unwrap_or_else(|_| unreachable!())
}

impl WorkerConfig {
    /// Create a default configuration rooted at `scope`.
    pub fn with_scope(scope: Url) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    /// Replace the version token.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Replace the precache manifest.
    pub fn manifest<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache_manifest = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Persist partitions under `dir`.
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(CommonError::config("version must not be empty"));
        }
        if self.scope.cannot_be_a_base() {
            return Err(CommonError::config(format!(
                "scope {} cannot be used as a base URL",
                self.scope
            )));
        }
        for path in &self.precache_manifest {
            self.resolve(path)?;
        }
        Ok(())
    }

    /// Resolve a scope-relative path to an absolute URL.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        Ok(self.scope.join(path)?)
    }

    /// Fetch timeout as a [`std::time::Duration`].
    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.fetch_timeout_ms)
    }
}
