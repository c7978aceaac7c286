use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::InformerError;

/// Anything with a `HasSynced` gate.
#[async_trait]
pub trait Synced: Send + Sync {
    fn name(&self) -> &str;
    fn has_synced(&self) -> bool;
    async fn wait_for_sync(&self, cancel: &CancellationToken) -> Result<(), InformerError>;
}

/// Wait until every informer has synced. Fails on the first one that
/// stops or on cancellation.
pub async fn wait_for_cache_sync(cancel: &CancellationToken, informers: &[&dyn Synced]) -> Result<(), InformerError> {
    for informer in informers {
        if informer.has_synced() {
            continue;
        }
        debug!(informer = informer.name(), "waiting for cache sync");
        informer.wait_for_sync(cancel).await?;
    }
    info!(informers = informers.len(), "caches synced");
    Ok(())
}
