use std::sync::Arc;

use backoff::{Backoff, BackoffConfig};
use data_types::{DynError, MultiError, TenantId};
use futures::StreamExt;
use metric::{Attributes, Registry};
use object_store::DynObjectStore;
use observability_deps::tracing::{debug, info, warn};
use stratus_time::TimeProvider;
use tokio_util::sync::CancellationToken;

use crate::{
    list_tenants, AllowedTenants, BlockCompactor, BlockVerifier, CompactorConfig,
    CompactorMetrics, ConsistencyDelayFilter, DeduplicateFilter, DeletionMarkFilter, Grouper,
    Job, JobRunner, JobRunnerConfig, LabelSanitizerFilter, MetaFetcher, MetaFilter,
    NoCompactFilter, Planner, ShardingStrategy, Syncer, TenantBucket,
};

/// The multitenant compactor service: discovers tenants, syncs their
/// block metas, and runs the compaction jobs this replica owns.
#[derive(Debug)]
pub struct MultitenantCompactor {
    config: CompactorConfig,
    store: Arc<DynObjectStore>,
    grouper: Arc<dyn Grouper>,
    planner: Arc<dyn Planner>,
    block_compactor: Arc<dyn BlockCompactor>,
    verifier: Arc<dyn BlockVerifier>,
    sharding: Arc<dyn ShardingStrategy>,
    allowed: AllowedTenants,
    backoff_config: BackoffConfig,
    metrics: Arc<CompactorMetrics>,
    time_provider: Arc<dyn TimeProvider>,
}

impl MultitenantCompactor {
    /// Assemble the service.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CompactorConfig,
        store: Arc<DynObjectStore>,
        grouper: Arc<dyn Grouper>,
        planner: Arc<dyn Planner>,
        block_compactor: Arc<dyn BlockCompactor>,
        verifier: Arc<dyn BlockVerifier>,
        sharding: Arc<dyn ShardingStrategy>,
        time_provider: Arc<dyn TimeProvider>,
        registry: &Registry,
    ) -> Self {
        let allowed = AllowedTenants::new(
            config.enabled_tenants.clone(),
            config.disabled_tenants.clone(),
        );
        Self {
            config,
            store,
            grouper,
            planner,
            block_compactor,
            verifier,
            sharding,
            allowed,
            backoff_config: BackoffConfig::default(),
            metrics: Arc::new(CompactorMetrics::new(registry)),
            time_provider,
        }
    }

    /// The metrics recorded by this service.
    pub fn metrics(&self) -> &Arc<CompactorMetrics> {
        &self.metrics
    }

    /// Run compaction iterations until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.compaction_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.compact_all_tenants(&shutdown).await,
            }
        }
    }

    /// One full iteration over every owned tenant.
    pub async fn compact_all_tenants(&self, shutdown: &CancellationToken) {
        self.metrics
            .runs_started
            .recorder(Attributes::default())
            .inc(1);

        // Bound the iteration; workers drain at the next stage boundary
        // once the deadline cancels this token.
        let iteration = shutdown.child_token();
        let deadline = (!self.config.max_compaction_time.is_zero()).then(|| {
            let token = iteration.clone();
            let max = self.config.max_compaction_time;
            tokio::spawn(async move {
                tokio::time::sleep(max).await;
                token.cancel();
            })
        });

        let result = self.compact_tenants(&iteration).await;

        if let Some(handle) = deadline {
            handle.abort();
        }

        match result {
            Ok(()) => {
                self.metrics
                    .runs_completed
                    .recorder(Attributes::default())
                    .inc(1);
            }
            Err(e) => {
                warn!(error = %e, "compaction iteration failed");
                self.metrics
                    .runs_failed
                    .recorder(Attributes::default())
                    .inc(1);
            }
        }
    }

    async fn compact_tenants(&self, cancel: &CancellationToken) -> Result<(), DynError> {
        let tenants = list_tenants(&*self.store).await?;
        debug!(tenants = tenants.len(), "discovered tenants");

        let mut errors = MultiError::new();
        for tenant in tenants {
            if cancel.is_cancelled() {
                info!("compaction iteration interrupted");
                break;
            }
            if !self.allowed.is_allowed(&tenant) {
                continue;
            }
            match self.sharding.own_tenant(&tenant) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(tenant = %tenant, error = %e, "cannot resolve tenant ownership, skipping");
                    continue;
                }
            }

            if let Err(e) = self.compact_tenant_with_retries(cancel, &tenant).await {
                warn!(tenant = %tenant, error = %e, "tenant compaction failed");
                errors.push(e);
            }
        }

        errors.err().map_err(Into::into)
    }

    async fn compact_tenant_with_retries(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantId,
    ) -> Result<(), DynError> {
        let mut backoff = Backoff::new(&self.backoff_config);
        let mut last_error: Option<DynError> = None;

        for attempt in 0..self.config.compaction_retries.max(1) {
            if cancel.is_cancelled() {
                break;
            }
            match self.compact_tenant(cancel, tenant).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        tenant = %tenant,
                        attempt,
                        error = %e,
                        "tenant compaction attempt failed, backing off",
                    );
                    last_error = Some(e);
                    tokio::time::sleep(backoff.next()).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "tenant compaction interrupted".into()))
    }

    async fn compact_tenant(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantId,
    ) -> Result<(), DynError> {
        let bucket = TenantBucket::new(Arc::clone(&self.store), tenant.clone());
        let fetcher = MetaFetcher::new(bucket.clone(), &self.config.data_dir, &self.metrics);
        let filters: Vec<Box<dyn MetaFilter>> = vec![
            Box::new(DeletionMarkFilter::new(bucket.clone())),
            Box::new(ConsistencyDelayFilter::new(
                bucket.clone(),
                self.config.consistency_delay,
            )),
            Box::new(DeduplicateFilter::new()),
            Box::new(NoCompactFilter::new(
                bucket.clone(),
                self.config.no_compact_mode,
            )),
            Box::new(LabelSanitizerFilter::new(
                self.config.sanitized_legacy_labels.clone(),
            )),
        ];

        let mut syncer = Syncer::new(
            bucket.clone(),
            fetcher,
            filters,
            Arc::clone(&self.metrics),
            Arc::clone(&self.time_provider),
        );
        syncer.sync_metas().await?;
        syncer.garbage_collect(cancel).await?;

        let metas = syncer.metas().clone();
        let no_compact = syncer.no_compact().clone();
        let jobs = self.grouper.groups(tenant, &metas);
        let jobs = self.filter_own_jobs(jobs);
        let jobs = self.filter_jobs_by_wait_period(&bucket, jobs).await;

        let runner = JobRunner::new(
            JobRunnerConfig {
                data_dir: self.config.data_dir.clone(),
                block_sync_concurrency: self.config.block_sync_concurrency,
                skip_blocks_with_out_of_order_chunks: self
                    .config
                    .skip_blocks_with_out_of_order_chunks,
            },
            bucket,
            Arc::clone(&self.planner),
            Arc::clone(&self.block_compactor),
            Arc::clone(&self.verifier),
            Arc::clone(&self.metrics),
            Arc::clone(&self.time_provider),
        );

        let errors: Vec<DynError> = futures::stream::iter(jobs.iter().map(|job| {
            let runner = &runner;
            let no_compact = &no_compact;
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                // Ownership may have moved while the iteration was
                // running; re-check just before executing.
                match self.sharding.own_job(job) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(group = %job.key, "job ownership moved away, skipping");
                        return None;
                    }
                    Err(e) => return Some(DynError::from(e.to_string())),
                }
                runner.run_job(cancel, job, no_compact).await.err()
            }
        }))
        .buffer_unordered(self.config.compaction_concurrency.get())
        .filter_map(|e| async move { e })
        .collect()
        .await;

        let mut multi = MultiError::new();
        for e in errors {
            multi.push(e);
        }
        multi.err().map_err(Into::into)
    }

    fn filter_own_jobs(&self, jobs: Vec<Job>) -> Vec<Job> {
        jobs.into_iter()
            .filter(|job| match self.sharding.own_job(job) {
                Ok(own) => own,
                Err(e) => {
                    warn!(group = %job.key, error = %e, "cannot resolve job ownership, skipping");
                    false
                }
            })
            .collect()
    }

    /// Skip jobs containing a block uploaded within the wait period, so
    /// still-finalizing producers are never raced.
    async fn filter_jobs_by_wait_period(
        &self,
        bucket: &TenantBucket,
        jobs: Vec<Job>,
    ) -> Vec<Job> {
        if self.config.wait_period.is_zero() {
            return jobs;
        }

        let cutoff = self.time_provider.now() - self.config.wait_period;
        let mut kept = vec![];
        'jobs: for job in jobs {
            for block in job.blocks() {
                match bucket.block_upload_time(block.id).await {
                    Ok(uploaded) if uploaded > cutoff => {
                        debug!(
                            group = %job.key,
                            block = %block.id,
                            "skipping job within the wait period",
                        );
                        continue 'jobs;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(block = %block.id, error = %e, "cannot read block upload time");
                        continue 'jobs;
                    }
                }
            }
            kept.push(job);
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mock::{MockBlockCompactor, MockBlockVerifier};
    use crate::test_util::{memory_bucket, meta, upload_block};
    use crate::{
        DefaultGrouper, NoShardingStrategy, RangePlanner, RANGE_2H_MS,
    };
    use std::num::NonZeroUsize;
    use stratus_time::{MockProvider, SystemProvider};
    use ulid::Ulid;

    fn compactor(
        store: Arc<DynObjectStore>,
        config: CompactorConfig,
        time_provider: Arc<dyn TimeProvider>,
    ) -> (MultitenantCompactor, Registry) {
        test_helpers::maybe_start_logging();
        let registry = Registry::new();
        let compactor = MultitenantCompactor::new(
            config,
            store,
            Arc::new(DefaultGrouper::new()),
            Arc::new(RangePlanner::new(vec![
                RANGE_2H_MS,
                6 * RANGE_2H_MS,
                12 * RANGE_2H_MS,
            ])),
            Arc::new(MockBlockCompactor::default()),
            Arc::new(MockBlockVerifier::default()),
            Arc::new(NoShardingStrategy::new()),
            time_provider,
            &registry,
        );
        (compactor, registry)
    }

    fn test_config(tmp: &tempfile::TempDir) -> CompactorConfig {
        CompactorConfig {
            data_dir: tmp.path().to_path_buf(),
            compaction_concurrency: NonZeroUsize::new(2).unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_noop_iteration_on_mixed_resolutions() {
        let (store, bucket) = memory_bucket("t1");
        let tmp = test_helpers::tmp_dir().unwrap();

        // Two blocks at different resolutions never group together.
        let raw = meta(Ulid::new(), 0, RANGE_2H_MS);
        let mut downsampled = meta(Ulid::new(), 0, RANGE_2H_MS);
        downsampled.resolution = 5 * 60 * 1000;
        upload_block(&bucket, &raw).await;
        upload_block(&bucket, &downsampled).await;

        let (compactor, _registry) = compactor(
            store,
            test_config(&tmp),
            Arc::new(SystemProvider::new()) as _,
        );
        compactor
            .compact_all_tenants(&CancellationToken::new())
            .await;

        // The iteration completed successfully and wrote nothing.
        let completed = compactor
            .metrics()
            .runs_completed
            .recorder(Attributes::default());
        assert_eq!(completed.fetch(), 1);
        assert!(bucket.deletion_marked_blocks().await.unwrap().is_empty());
        assert_eq!(bucket.list_blocks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_happy_path_iteration() {
        let (store, bucket) = memory_bucket("t1");
        let tmp = test_helpers::tmp_dir().unwrap();

        // Four 2h blocks covering an aligned 8h window.
        let mut sources = vec![];
        for i in 0..4_i64 {
            let block = meta(Ulid::new(), i * RANGE_2H_MS, (i + 1) * RANGE_2H_MS);
            upload_block(&bucket, &block).await;
            sources.push(block);
        }

        let (compactor, _registry) = compactor(
            store,
            test_config(&tmp),
            Arc::new(SystemProvider::new()) as _,
        );
        compactor
            .compact_all_tenants(&CancellationToken::new())
            .await;

        let completed = compactor
            .metrics()
            .runs_completed
            .recorder(Attributes::default());
        assert_eq!(completed.fetch(), 1);

        let compactions = compactor
            .metrics()
            .jobs_compacted
            .recorder([("tenant", "t1".to_owned())]);
        assert_eq!(compactions.fetch(), 1);

        // One output block, four deletion markers.
        let marked = bucket.deletion_marked_blocks().await.unwrap();
        assert_eq!(marked.len(), 4);
        for source in &sources {
            assert!(marked.contains(&source.id));
        }

        let remaining: Vec<Ulid> = bucket
            .list_blocks()
            .await
            .unwrap()
            .into_iter()
            .filter(|id| !marked.contains(id))
            .collect();
        assert_eq!(remaining.len(), 1);
        let output = bucket.read_meta(remaining[0]).await.unwrap();
        assert_eq!(output.min_time, 0);
        assert_eq!(output.max_time, 8 * RANGE_2H_MS);

        // Compaction is idempotent: the second iteration plans nothing.
        compactor
            .compact_all_tenants(&CancellationToken::new())
            .await;
        assert_eq!(completed.fetch(), 2);
        assert_eq!(compactions.fetch(), 1);
        assert_eq!(bucket.deletion_marked_blocks().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_wait_period_skips_fresh_blocks() {
        let (store, bucket) = memory_bucket("t1");
        let tmp = test_helpers::tmp_dir().unwrap();

        for i in 0..2_i64 {
            let block = meta(
                Ulid::new(),
                i * RANGE_2H_MS / 2,
                (i + 1) * RANGE_2H_MS / 2,
            );
            upload_block(&bucket, &block).await;
        }

        // The blocks were uploaded "now" (system clock in the in-memory
        // store); a mock clock pinned at the same instant keeps them
        // inside the wait window.
        let provider = Arc::new(MockProvider::new(SystemProvider::new().now()));
        let config = CompactorConfig {
            wait_period: std::time::Duration::from_secs(600),
            ..test_config(&tmp)
        };
        let (compactor, _registry) = compactor(store, config, provider as _);
        compactor
            .compact_all_tenants(&CancellationToken::new())
            .await;

        // Nothing happened: the job was within the wait period.
        assert!(bucket.deletion_marked_blocks().await.unwrap().is_empty());
        assert_eq!(bucket.list_blocks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_tenant_is_skipped() {
        let (store, bucket) = memory_bucket("t1");
        let tmp = test_helpers::tmp_dir().unwrap();

        for i in 0..2_i64 {
            let block = meta(
                Ulid::new(),
                i * RANGE_2H_MS / 2,
                (i + 1) * RANGE_2H_MS / 2,
            );
            upload_block(&bucket, &block).await;
        }

        let config = CompactorConfig {
            disabled_tenants: vec!["t1".to_owned()],
            ..test_config(&tmp)
        };
        let (compactor, _registry) = compactor(
            store,
            config,
            Arc::new(SystemProvider::new()) as _,
        );
        compactor
            .compact_all_tenants(&CancellationToken::new())
            .await;

        assert!(bucket.deletion_marked_blocks().await.unwrap().is_empty());
        assert_eq!(bucket.list_blocks().await.unwrap().len(), 2);
    }
}
