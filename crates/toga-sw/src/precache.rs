//! Precache installer.

use futures::future::join_all;
use toga_common::WorkerConfig;
use toga_net::{CacheMode, Fetch, Request};
use tracing::{info, warn};

use crate::partition::{PartitionNames, PartitionTag};
use crate::storage::CacheStorage;
use crate::{Result, ServiceWorkerError};

/// Outcome of an install-time precache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecacheReport {
    /// Manifest paths stored, in manifest order.
    pub stored: Vec<String>,
    /// Manifest paths skipped, with the reason.
    pub skipped: Vec<(String, String)>,
}

impl PrecacheReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Fetch every manifest asset (bypassing HTTP caches) into the app-shell partition.
///
/// A single asset that fails to fetch, answers non-2xx, or has an unresolvable
/// path is skipped and logged. Only failure to open the partition fails the install.
pub async fn precache(
    config: &WorkerConfig,
    storage: &CacheStorage,
    fetcher: &dyn Fetch,
) -> Result<PrecacheReport> {
    let names = PartitionNames::new(config.version.clone());
    let cache = storage.open(&names.name(PartitionTag::AppShell)).await?;

    let attempts = config.precache_manifest.iter().map(|path| {
        let cache = &cache;
        async move {
            let url = config.resolve(path).map_err(|e| e.to_string())?;
            let request = Request::get(url.clone()).cache_mode(CacheMode::NoCache);
            let response = fetcher.fetch(&request).await.map_err(|e| e.to_string())?;
            if !response.ok() {
                return Err(format!("HTTP {} for {}", response.status.as_u16(), path));
            }
            cache
                .put_url(&url, &response)
                .await
                .map_err(|e: ServiceWorkerError| e.to_string())
        }
    });

    let mut report = PrecacheReport::default();
    for (path, outcome) in config.precache_manifest.iter().zip(join_all(attempts).await) {
        match outcome {
            Ok(()) => report.stored.push(path.clone()),
            Err(reason) => {
                warn!(asset = %path, reason = %reason, "Precache skipped");
                report.skipped.push((path.clone(), reason));
            }
        }
    }

    info!(
        partition = %cache.name(),
        stored = report.stored.len(),
        skipped = report.skipped.len(),
        "Precache complete"
    );
    Ok(report)
}
