use std::collections::HashMap;
use std::time::Instant;

use data_types::{BlockMeta, DynError};
use observability_deps::tracing::{info, warn};
use stratus_time::TimeProvider;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::{filter_chain, CompactorMetrics, FilteredMetas, MetaFetcher, MetaFilter, TenantBucket};

/// Synchronizes one tenant's block metas from the object store and
/// garbage-collects superseded blocks.
#[derive(Debug)]
pub struct Syncer {
    bucket: TenantBucket,
    fetcher: MetaFetcher,
    filters: Vec<Box<dyn MetaFilter>>,
    metrics: std::sync::Arc<CompactorMetrics>,
    time_provider: std::sync::Arc<dyn TimeProvider>,
    state: FilteredMetas,
}

impl Syncer {
    /// Create a syncer running `filters` over fetched metas.
    pub fn new(
        bucket: TenantBucket,
        fetcher: MetaFetcher,
        filters: Vec<Box<dyn MetaFilter>>,
        metrics: std::sync::Arc<CompactorMetrics>,
        time_provider: std::sync::Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            bucket,
            fetcher,
            filters,
            metrics,
            time_provider,
            state: FilteredMetas::default(),
        }
    }

    /// Fetch and filter the current meta set.
    pub async fn sync_metas(&mut self) -> Result<(), DynError> {
        let fetched = self.fetcher.fetch().await?;
        let mut state = FilteredMetas {
            metas: fetched,
            ..Default::default()
        };
        filter_chain(&self.filters, self.time_provider.now(), &mut state).await?;
        self.state = state;
        Ok(())
    }

    /// The metas of the last sync, by ULID.
    pub fn metas(&self) -> &HashMap<Ulid, BlockMeta> {
        &self.state.metas
    }

    /// Blocks the planner must skip (no-compact flagged).
    pub fn no_compact(&self) -> &std::collections::HashSet<Ulid> {
        &self.state.no_compact
    }

    /// Write deletion markers for every duplicate found by the last sync.
    ///
    /// Cancellation is honored between markers; a marker write that has
    /// begun always completes (it runs under its own short timeout), so
    /// shutdown never leaves a half-marked block.
    pub async fn garbage_collect(&mut self, cancel: &CancellationToken) -> Result<(), DynError> {
        let tenant_attr = [("tenant", self.bucket.tenant().to_string())];
        self.metrics
            .garbage_collection_runs
            .recorder(tenant_attr.clone())
            .inc(1);
        let started = Instant::now();

        let duplicates = std::mem::take(&mut self.state.duplicates);
        let mut marked = 0_u64;
        let mut failure = None;
        for id in duplicates {
            if cancel.is_cancelled() {
                warn!(tenant = %self.bucket.tenant(), "garbage collection interrupted by shutdown");
                break;
            }
            match self
                .bucket
                .mark_block_for_deletion(id, self.time_provider.now())
                .await
            {
                Ok(()) => {
                    marked += 1;
                    self.metrics
                        .blocks_marked_for_deletion
                        .recorder(tenant_attr.clone())
                        .inc(1);
                    self.state.metas.remove(&id);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.metrics
            .garbage_collected_blocks
            .recorder(tenant_attr.clone())
            .inc(marked);
        self.metrics
            .garbage_collection_duration
            .recorder(tenant_attr.clone())
            .record(started.elapsed());

        if let Some(e) = failure {
            self.metrics
                .garbage_collection_failures
                .recorder(tenant_attr)
                .inc(1);
            return Err(e);
        }

        if marked > 0 {
            info!(tenant = %self.bucket.tenant(), blocks = marked, "garbage collected superseded blocks");
        }
        Ok(())
    }
}
