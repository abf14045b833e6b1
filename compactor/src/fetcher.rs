use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use data_types::{BlockMeta, DynError};
use futures::StreamExt;
use metric::U64Counter;
use observability_deps::tracing::warn;
use ulid::Ulid;

use crate::{CompactorMetrics, TenantBucket};

/// Concurrent meta fetches per sync.
const FETCH_CONCURRENCY: usize = 32;

/// Lists a tenant's blocks and fetches their `meta.json`, caching metas
/// on local disk.
///
/// Blocks are immutable, so a cached meta never goes stale; the cache
/// only ever grows with new blocks and saves one object-store round trip
/// per known block per iteration.
#[derive(Debug)]
pub struct MetaFetcher {
    bucket: TenantBucket,
    cache_dir: PathBuf,
    corrupted: U64Counter,
}

impl MetaFetcher {
    /// Create a fetcher for `bucket`, caching under
    /// `<data_dir>/compactor-meta-<tenant>/`.
    pub fn new(bucket: TenantBucket, data_dir: &std::path::Path, metrics: &CompactorMetrics) -> Self {
        let cache_dir = data_dir.join(format!("compactor-meta-{}", bucket.tenant()));
        let corrupted = metrics
            .corrupted_metas
            .recorder([("tenant", bucket.tenant().to_string())]);
        Self {
            bucket,
            cache_dir,
            corrupted,
        }
    }

    /// Fetch the metas of all blocks currently present.
    ///
    /// Corrupted metas are counted and skipped; the block stays invisible
    /// until its meta can be parsed.
    pub async fn fetch(&self) -> Result<HashMap<Ulid, BlockMeta>, DynError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let ids = self.bucket.list_blocks().await?;

        let fetches = futures::stream::iter(ids.into_iter().map(|id| {
            let fetcher = self;
            async move { (id, fetcher.fetch_one(id).await) }
        }))
        .buffer_unordered(FETCH_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

        let mut metas = HashMap::with_capacity(fetches.len());
        for (id, result) in fetches {
            match result {
                Ok(meta) => {
                    metas.insert(id, meta);
                }
                Err(e) => {
                    warn!(
                        tenant = %self.bucket.tenant(),
                        block = %id,
                        error = %e,
                        "skipping block with unreadable meta",
                    );
                    self.corrupted.inc(1);
                }
            }
        }
        Ok(metas)
    }

    async fn fetch_one(&self, id: Ulid) -> Result<BlockMeta, DynError> {
        let cached = self.cache_dir.join(format!("{id}.json"));
        if let Ok(bytes) = tokio::fs::read(&cached).await {
            if let Ok(meta) = serde_json::from_slice::<BlockMeta>(&bytes) {
                return Ok(meta);
            }
            // Unreadable cache entries are replaced from the store.
            let _ = tokio::fs::remove_file(&cached).await;
        }

        let meta = self.bucket.read_meta(id).await?;
        tokio::fs::write(&cached, serde_json::to_vec(&meta)?).await?;
        Ok(meta)
    }
}
