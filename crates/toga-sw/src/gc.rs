//! Activation-time garbage collection of superseded partitions.

use tracing::info;

use crate::partition::PartitionNames;
use crate::storage::CacheStorage;
use crate::Result;

/// Delete every partition outside the current allowlist. Returns the deleted names.
pub async fn collect_garbage(storage: &CacheStorage, names: &PartitionNames) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in storage.keys().await {
        if names.is_current(&name) {
            continue;
        }
        if storage.delete(&name).await? {
            info!(partition = %name, "Deleted stale partition");
            deleted.push(name);
        }
    }
    Ok(deleted)
}
