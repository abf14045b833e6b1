use std::collections::{BTreeSet, HashSet};
use std::fmt::{Debug, Display};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use data_types::{shard_id_label_value, DynError, NoCompactReason, SHARD_ID_LABEL};
use futures::StreamExt;
use observability_deps::tracing::{info, warn};
use stratus_time::TimeProvider;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::{CompactorMetrics, Job, Planner, TenantBucket, META_FILENAME, TOMBSTONES_FILENAME};

/// What a block health check found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockIssue {
    /// The block is healthy.
    None,
    /// Chunks are not ordered by time; skippable per configuration.
    OutOfOrderChunks,
    /// Chunks outside the block's time range ("issue 347"); repairable.
    Outside347,
    /// Series labels are not sorted; fatal.
    OutOfOrderLabels,
    /// The block is unreadable; fatal.
    Corruption(String),
}

/// The external merge engine: turns several downloaded blocks into one
/// (or, when splitting, several) new blocks on local disk.
#[async_trait]
pub trait BlockCompactor: Debug + Display + Send + Sync {
    /// Merge `sources` into one block under `dest`, returning its ULID;
    /// the nil ULID means the merge produced no data.
    async fn compact(&self, dest: &Path, sources: &[PathBuf]) -> Result<Ulid, DynError>;

    /// Merge `sources` into up to `shards` blocks partitioned by series
    /// hash; nil ULIDs mark empty shards.
    async fn compact_with_splitting(
        &self,
        dest: &Path,
        sources: &[PathBuf],
        shards: u64,
    ) -> Result<Vec<Ulid>, DynError>;
}

/// Health checks and repairs over downloaded block directories.
#[async_trait]
pub trait BlockVerifier: Debug + Display + Send + Sync {
    /// Inspect the block in `block_dir`.
    async fn verify(&self, block_dir: &Path) -> Result<BlockIssue, DynError>;

    /// Rewrite a block broken by issue 347 into a fresh block under
    /// `dest`, returning the new ULID.
    async fn repair_issue_347(&self, block_dir: &Path, dest: &Path) -> Result<Ulid, DynError>;
}

/// Configuration of a [`JobRunner`].
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Local scratch space.
    pub data_dir: PathBuf,
    /// Concurrent block downloads within one job.
    pub block_sync_concurrency: NonZeroUsize,
    /// Mark out-of-order-chunk blocks no-compact instead of failing.
    pub skip_blocks_with_out_of_order_chunks: bool,
}

/// The result of one compaction job.
#[derive(Debug, Default)]
pub struct JobOutcome {
    /// Whether the group may have more work (re-plan soon).
    pub should_rerun: bool,
    /// ULIDs of the uploaded output blocks.
    pub uploaded: Vec<Ulid>,
}

/// Executes one compaction job as a state machine:
/// plan → download → validate → compact → upload → mark sources deleted,
/// with the repair and mark-no-compact side exits.
#[derive(Debug)]
pub struct JobRunner {
    config: JobRunnerConfig,
    bucket: TenantBucket,
    planner: Arc<dyn Planner>,
    compactor: Arc<dyn BlockCompactor>,
    verifier: Arc<dyn BlockVerifier>,
    metrics: Arc<CompactorMetrics>,
    time_provider: Arc<dyn TimeProvider>,
}

impl JobRunner {
    /// Create a runner for one tenant's bucket.
    pub fn new(
        config: JobRunnerConfig,
        bucket: TenantBucket,
        planner: Arc<dyn Planner>,
        compactor: Arc<dyn BlockCompactor>,
        verifier: Arc<dyn BlockVerifier>,
        metrics: Arc<CompactorMetrics>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            config,
            bucket,
            planner,
            compactor,
            verifier,
            metrics,
            time_provider,
        }
    }

    fn tenant_attr(&self) -> [(&'static str, String); 1] {
        [("tenant", self.bucket.tenant().to_string())]
    }

    /// Run `job` to completion.
    ///
    /// An empty plan is a successful no-op. The iteration context is
    /// checked at every stage boundary; marker writes run detached under
    /// their own timeout.
    pub async fn run_job(
        &self,
        cancel: &CancellationToken,
        job: &Job,
        no_compact: &HashSet<Ulid>,
    ) -> Result<JobOutcome, DynError> {
        // PLAN. Splitting jobs take their whole block set: the point is
        // to shard them, not to wait for a full range bucket.
        let plan = if job.use_splitting {
            job.blocks()
                .iter()
                .filter(|b| !no_compact.contains(&b.id))
                .cloned()
                .collect::<Vec<_>>()
        } else {
            self.planner.plan(job.blocks(), no_compact)
        };
        if plan.is_empty() {
            return Ok(JobOutcome::default());
        }

        let min_time = plan.first().map(|b| b.min_time).unwrap_or(0);
        let max_time = plan.iter().map(|b| b.max_time).max().unwrap_or(0);
        info!(
            tenant = %self.bucket.tenant(),
            group = %job.key,
            blocks = plan.len(),
            min_time,
            max_time,
            "compaction job planned",
        );

        let job_dir = self.config.data_dir.join("compact").join(format!(
            "{}-{}",
            self.bucket.tenant(),
            ring::stable_hash64(&job.sharding_key()),
        ));
        if job_dir.exists() {
            tokio::fs::remove_dir_all(&job_dir).await?;
        }
        tokio::fs::create_dir_all(&job_dir).await?;

        let result = self.run_stages(cancel, job, &plan, &job_dir).await;

        // Scratch space is reclaimed regardless of outcome; the next run
        // re-downloads what it needs.
        if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
            warn!(dir = %job_dir.display(), error = %e, "failed to clean compaction scratch dir");
        }

        result
    }

    async fn run_stages(
        &self,
        cancel: &CancellationToken,
        job: &Job,
        plan: &[data_types::BlockMeta],
        job_dir: &Path,
    ) -> Result<JobOutcome, DynError> {
        if cancel.is_cancelled() {
            return Err("compaction interrupted by shutdown".into());
        }

        // DOWNLOAD, bounded by the block sync concurrency.
        let downloads: Vec<Result<(Ulid, PathBuf), DynError>> =
            futures::stream::iter(plan.iter().map(|meta| {
                let id = meta.id;
                async move { Ok((id, self.bucket.download_block(id, job_dir).await?)) }
            }))
            .buffer_unordered(self.config.block_sync_concurrency.get())
            .collect()
            .await;
        let mut dirs = Vec::with_capacity(plan.len());
        for result in downloads {
            dirs.push(result?);
        }
        dirs.sort_by_key(|(id, _)| plan.iter().position(|m| m.id == *id));

        if cancel.is_cancelled() {
            return Err("compaction interrupted by shutdown".into());
        }

        // VALIDATE every source block before merging.
        for (id, dir) in &dirs {
            match self.verifier.verify(dir).await? {
                BlockIssue::None => {}
                BlockIssue::Corruption(detail) => {
                    return Err(format!("critical corruption in block {id}: {detail}").into());
                }
                BlockIssue::OutOfOrderLabels => {
                    return Err(format!("block {id} has out-of-order labels").into());
                }
                BlockIssue::Outside347 => {
                    return self.repair_issue_347(*id, dir, job_dir).await;
                }
                BlockIssue::OutOfOrderChunks => {
                    if !self.config.skip_blocks_with_out_of_order_chunks {
                        return Err(format!("block {id} has out-of-order chunks").into());
                    }
                    self.bucket
                        .mark_block_no_compact(
                            *id,
                            NoCompactReason::OutOfOrderChunks,
                            self.time_provider.now(),
                        )
                        .await?;
                    self.metrics
                        .blocks_marked_for_no_compaction
                        .recorder(self.tenant_attr())
                        .inc(1);
                    warn!(
                        tenant = %self.bucket.tenant(),
                        block = %id,
                        "block with out-of-order chunks marked no-compact; job skipped",
                    );
                    return Ok(JobOutcome::default());
                }
            }
        }

        if cancel.is_cancelled() {
            return Err("compaction interrupted by shutdown".into());
        }

        // COMPACT.
        let source_dirs: Vec<PathBuf> = dirs.iter().map(|(_, d)| d.clone()).collect();
        let out_ids: Vec<Ulid> = if job.use_splitting {
            self.compactor
                .compact_with_splitting(job_dir, &source_dirs, job.split_shards)
                .await?
        } else {
            vec![self.compactor.compact(job_dir, &source_dirs).await?]
        };

        if cancel.is_cancelled() {
            return Err("compaction interrupted by shutdown".into());
        }

        // UPLOAD each non-empty output.
        let mut uploaded = vec![];
        for (shard_index, out_id) in out_ids.iter().enumerate() {
            if out_id.is_nil() {
                continue;
            }
            let out_dir = job_dir.join(out_id.to_string());
            self.finalize_meta(job, plan, shard_index, *out_id, &out_dir)
                .await?;

            match self.verifier.verify(&out_dir).await? {
                BlockIssue::None => {}
                issue => {
                    return Err(format!(
                        "compacted block {out_id} failed verification: {issue:?}"
                    )
                    .into());
                }
            }

            self.bucket.upload_block(*out_id, &out_dir).await?;
            self.metrics
                .blocks_uploaded
                .recorder(self.tenant_attr())
                .inc(1);
            uploaded.push(*out_id);
        }

        // MARK_SOURCES_DELETED. Each marker runs under its own timeout;
        // stopping between markers is safe because the dedup filter will
        // catch unmarked sources on the next iteration.
        for meta in plan {
            self.bucket
                .mark_block_for_deletion(meta.id, self.time_provider.now())
                .await?;
            self.metrics
                .blocks_marked_for_deletion
                .recorder(self.tenant_attr())
                .inc(1);
        }

        self.metrics
            .jobs_compacted
            .recorder(self.tenant_attr())
            .inc(1);
        info!(
            tenant = %self.bucket.tenant(),
            group = %job.key,
            outputs = uploaded.len(),
            "compaction job completed",
        );

        Ok(JobOutcome {
            should_rerun: true,
            uploaded,
        })
    }

    /// Rewrite the single broken block, upload the fix, retire the
    /// original, and ask for a re-plan.
    async fn repair_issue_347(
        &self,
        broken: Ulid,
        block_dir: &Path,
        job_dir: &Path,
    ) -> Result<JobOutcome, DynError> {
        warn!(tenant = %self.bucket.tenant(), block = %broken, "repairing block with outside-range chunks");

        let repaired = self.verifier.repair_issue_347(block_dir, job_dir).await?;
        let repaired_dir = job_dir.join(repaired.to_string());

        match self.verifier.verify(&repaired_dir).await? {
            BlockIssue::None => {}
            issue => {
                return Err(
                    format!("repaired block {repaired} failed verification: {issue:?}").into(),
                );
            }
        }

        self.bucket.upload_block(repaired, &repaired_dir).await?;
        self.bucket
            .mark_block_for_deletion(broken, self.time_provider.now())
            .await?;
        self.metrics
            .blocks_marked_for_deletion
            .recorder(self.tenant_attr())
            .inc(1);
        self.metrics
            .blocks_repaired
            .recorder(self.tenant_attr())
            .inc(1);

        Ok(JobOutcome {
            should_rerun: true,
            uploaded: vec![repaired],
        })
    }

    /// Rewrite the output block's meta: compaction lineage from the
    /// sources, the group's external labels, and the shard id label when
    /// splitting.
    async fn finalize_meta(
        &self,
        job: &Job,
        plan: &[data_types::BlockMeta],
        shard_index: usize,
        out_id: Ulid,
        out_dir: &Path,
    ) -> Result<(), DynError> {
        let meta_path = out_dir.join(META_FILENAME);
        let bytes = tokio::fs::read(&meta_path).await?;
        let mut meta: data_types::BlockMeta = serde_json::from_slice(&bytes)?;

        meta.id = out_id;
        meta.resolution = plan[0].resolution;
        meta.compaction.level = plan
            .iter()
            .map(|m| m.compaction.level)
            .max()
            .unwrap_or(0)
            + 1;
        let sources: BTreeSet<Ulid> = plan
            .iter()
            .flat_map(|m| m.compaction.sources.iter().copied())
            .collect();
        meta.compaction.sources = sources.into_iter().collect();
        meta.compaction.parents = plan.iter().map(|m| m.id).collect();

        meta.external_labels = plan[0].external_labels.clone();
        if job.use_splitting {
            meta.external_labels.insert(
                SHARD_ID_LABEL.to_owned(),
                shard_id_label_value(shard_index as u64 + 1, job.split_shards),
            );
        }

        tokio::fs::write(&meta_path, serde_json::to_vec(&meta)?).await?;

        // Compacted blocks never carry pending deletions.
        let tombstones = out_dir.join(TOMBSTONES_FILENAME);
        if tombstones.exists() {
            tokio::fs::remove_file(&tombstones).await?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{MockBlockCompactor, MockBlockVerifier};
    use super::*;
    use crate::test_util::{memory_bucket, meta, upload_block};
    use crate::{RangePlanner, RANGE_2H_MS};
    use data_types::BlockMeta;
    use metric::Registry;
    use stratus_time::{MockProvider, Time};

    struct Setup {
        runner: JobRunner,
        bucket: TenantBucket,
        metrics: Arc<CompactorMetrics>,
        _tmp: tempfile::TempDir,
    }

    fn setup(verifier: MockBlockVerifier, skip_ooo: bool) -> Setup {
        test_helpers::maybe_start_logging();
        let (_store, bucket) = memory_bucket("t1");
        let tmp = test_helpers::tmp_dir().unwrap();
        let registry = Registry::new();
        let metrics = Arc::new(CompactorMetrics::new(&registry));
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));

        let runner = JobRunner::new(
            JobRunnerConfig {
                data_dir: tmp.path().to_path_buf(),
                block_sync_concurrency: NonZeroUsize::new(4).unwrap(),
                skip_blocks_with_out_of_order_chunks: skip_ooo,
            },
            bucket.clone(),
            Arc::new(RangePlanner::new(vec![
                RANGE_2H_MS,
                6 * RANGE_2H_MS,
                12 * RANGE_2H_MS,
            ])),
            Arc::new(MockBlockCompactor::default()),
            Arc::new(verifier),
            Arc::clone(&metrics),
            provider as _,
        );

        Setup {
            runner,
            bucket,
            metrics,
            _tmp: tmp,
        }
    }

    async fn four_2h_blocks(bucket: &TenantBucket) -> Vec<BlockMeta> {
        let mut blocks = vec![];
        for i in 0..4_i64 {
            let block = meta(Ulid::new(), i * RANGE_2H_MS, (i + 1) * RANGE_2H_MS);
            upload_block(bucket, &block).await;
            blocks.push(block);
        }
        blocks
    }

    fn job_of(blocks: &[BlockMeta]) -> Job {
        let mut job = Job::new(data_types::TenantId::new("t1").unwrap(), "0@1");
        for block in blocks {
            job.add(block.clone());
        }
        job
    }

    #[tokio::test]
    async fn test_happy_path_four_blocks_into_one() {
        let setup = setup(MockBlockVerifier::default(), false);
        let blocks = four_2h_blocks(&setup.bucket).await;

        let outcome = setup
            .runner
            .run_job(&CancellationToken::new(), &job_of(&blocks), &HashSet::new())
            .await
            .unwrap();

        assert!(outcome.should_rerun);
        assert_eq!(outcome.uploaded.len(), 1);

        // One 8h output block was uploaded with the merged lineage.
        let out = setup.bucket.read_meta(outcome.uploaded[0]).await.unwrap();
        assert_eq!(out.min_time, 0);
        assert_eq!(out.max_time, 8 * RANGE_2H_MS);
        assert_eq!(out.compaction.level, 2);
        assert_eq!(out.compaction.sources.len(), 4);

        // Every source got a deletion marker.
        let marked = setup.bucket.deletion_marked_blocks().await.unwrap();
        for block in &blocks {
            assert!(marked.contains(&block.id));
        }

        let compactions = setup
            .metrics
            .jobs_compacted
            .recorder([("tenant", "t1".to_owned())]);
        assert_eq!(compactions.fetch(), 1);
    }

    #[tokio::test]
    async fn test_empty_plan_is_noop() {
        let setup = setup(MockBlockVerifier::default(), false);
        // A single block fills no range bucket.
        let block = meta(Ulid::new(), 0, RANGE_2H_MS);
        upload_block(&setup.bucket, &block).await;

        let outcome = setup
            .runner
            .run_job(&CancellationToken::new(), &job_of(&[block]), &HashSet::new())
            .await
            .unwrap();

        assert!(!outcome.should_rerun);
        assert!(outcome.uploaded.is_empty());
        assert!(setup
            .bucket
            .deletion_marked_blocks()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_marks_no_compact_when_configured() {
        let (_store, bucket) = memory_bucket("t1");
        let mut blocks = vec![];
        for i in 0..2_i64 {
            let block = meta(
                Ulid::new(),
                i * RANGE_2H_MS / 2,
                (i + 1) * RANGE_2H_MS / 2,
            );
            upload_block(&bucket, &block).await;
            blocks.push(block);
        }

        let registry = Registry::new();
        let metrics = Arc::new(CompactorMetrics::new(&registry));
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let tmp = test_helpers::tmp_dir().unwrap();
        let runner = JobRunner::new(
            JobRunnerConfig {
                data_dir: tmp.path().to_path_buf(),
                block_sync_concurrency: NonZeroUsize::new(4).unwrap(),
                skip_blocks_with_out_of_order_chunks: true,
            },
            bucket.clone(),
            Arc::new(RangePlanner::new(vec![RANGE_2H_MS])),
            Arc::new(MockBlockCompactor::default()),
            Arc::new(
                MockBlockVerifier::default()
                    .with_issue(blocks[0].id, BlockIssue::OutOfOrderChunks),
            ),
            Arc::clone(&metrics),
            provider as _,
        );

        let outcome = runner
            .run_job(&CancellationToken::new(), &job_of(&blocks), &HashSet::new())
            .await
            .unwrap();

        // The job was skipped, not failed; the broken block is flagged.
        assert!(!outcome.should_rerun);
        assert!(bucket
            .no_compact_marked_blocks()
            .await
            .unwrap()
            .contains(&blocks[0].id));
        // No sources were deleted.
        assert!(bucket.deletion_marked_blocks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corruption_fails_the_job() {
        let (_store, bucket) = memory_bucket("t1");
        let a = meta(Ulid::new(), 0, RANGE_2H_MS / 2);
        let b = meta(Ulid::new(), RANGE_2H_MS / 2, RANGE_2H_MS);
        upload_block(&bucket, &a).await;
        upload_block(&bucket, &b).await;

        let registry = Registry::new();
        let metrics = Arc::new(CompactorMetrics::new(&registry));
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let tmp = test_helpers::tmp_dir().unwrap();
        let runner = JobRunner::new(
            JobRunnerConfig {
                data_dir: tmp.path().to_path_buf(),
                block_sync_concurrency: NonZeroUsize::new(4).unwrap(),
                skip_blocks_with_out_of_order_chunks: false,
            },
            bucket.clone(),
            Arc::new(RangePlanner::new(vec![RANGE_2H_MS])),
            Arc::new(MockBlockCompactor::default()),
            Arc::new(MockBlockVerifier::default().with_issue(
                a.id,
                BlockIssue::Corruption("index unreadable".to_owned()),
            )),
            metrics,
            provider as _,
        );

        let err = runner
            .run_job(
                &CancellationToken::new(),
                &job_of(&[a.clone(), b]),
                &HashSet::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("critical corruption"));

        // The object store is untouched: no markers, no uploads.
        assert!(bucket.deletion_marked_blocks().await.unwrap().is_empty());
        assert_eq!(bucket.list_blocks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_issue_347_repair_path() {
        let (_store, bucket) = memory_bucket("t1");
        let a = meta(Ulid::new(), 0, RANGE_2H_MS / 2);
        let b = meta(Ulid::new(), RANGE_2H_MS / 2, RANGE_2H_MS);
        upload_block(&bucket, &a).await;
        upload_block(&bucket, &b).await;

        let registry = Registry::new();
        let metrics = Arc::new(CompactorMetrics::new(&registry));
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let tmp = test_helpers::tmp_dir().unwrap();
        let runner = JobRunner::new(
            JobRunnerConfig {
                data_dir: tmp.path().to_path_buf(),
                block_sync_concurrency: NonZeroUsize::new(4).unwrap(),
                skip_blocks_with_out_of_order_chunks: false,
            },
            bucket.clone(),
            Arc::new(RangePlanner::new(vec![RANGE_2H_MS])),
            Arc::new(MockBlockCompactor::default()),
            Arc::new(
                MockBlockVerifier::default().with_issue(a.id, BlockIssue::Outside347),
            ),
            Arc::clone(&metrics),
            provider as _,
        );

        let outcome = runner
            .run_job(
                &CancellationToken::new(),
                &job_of(&[a.clone(), b]),
                &HashSet::new(),
            )
            .await
            .unwrap();

        // Repair asks for a re-plan; the broken source is retired and a
        // rewritten block took its place.
        assert!(outcome.should_rerun);
        assert_eq!(outcome.uploaded.len(), 1);
        assert!(bucket
            .deletion_marked_blocks()
            .await
            .unwrap()
            .contains(&a.id));
        let repaired = metrics
            .blocks_repaired
            .recorder([("tenant", "t1".to_owned())]);
        assert_eq!(repaired.fetch(), 1);
    }

    #[tokio::test]
    async fn test_splitting_job_tags_shards() {
        let (_store, bucket) = memory_bucket("t1");
        let block = meta(Ulid::new(), 0, RANGE_2H_MS);
        upload_block(&bucket, &block).await;

        let registry = Registry::new();
        let metrics = Arc::new(CompactorMetrics::new(&registry));
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let tmp = test_helpers::tmp_dir().unwrap();
        let runner = JobRunner::new(
            JobRunnerConfig {
                data_dir: tmp.path().to_path_buf(),
                block_sync_concurrency: NonZeroUsize::new(4).unwrap(),
                skip_blocks_with_out_of_order_chunks: false,
            },
            bucket.clone(),
            Arc::new(RangePlanner::new(vec![RANGE_2H_MS])),
            Arc::new(MockBlockCompactor {
                empty_shards: [2].into_iter().collect(),
            }),
            Arc::new(MockBlockVerifier::default()),
            metrics,
            provider as _,
        );

        let mut job =
            Job::new_splitting(data_types::TenantId::new("t1").unwrap(), "0@1", 4, 0);
        job.add(block.clone());

        let outcome = runner
            .run_job(&CancellationToken::new(), &job, &HashSet::new())
            .await
            .unwrap();

        // Shard 3 (index 2) was empty and omitted.
        assert_eq!(outcome.uploaded.len(), 3);
        let shard_values: Vec<String> = {
            let mut values = vec![];
            for id in &outcome.uploaded {
                let out = bucket.read_meta(*id).await.unwrap();
                values.push(out.external_labels[SHARD_ID_LABEL].clone());
            }
            values.sort();
            values
        };
        assert_eq!(
            shard_values,
            vec!["1_of_4".to_owned(), "2_of_4".to_owned(), "4_of_4".to_owned()]
        );
    }
}
