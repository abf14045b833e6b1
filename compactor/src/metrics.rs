use metric::{DurationHistogram, Metric, Registry, U64Counter};

/// Instruments recorded by the compactor and its syncer.
#[derive(Debug)]
pub struct CompactorMetrics {
    /// Compaction iterations started.
    pub runs_started: Metric<U64Counter>,
    /// Iterations that finished with zero errors.
    pub runs_completed: Metric<U64Counter>,
    /// Iterations that hit at least one fatal job error.
    pub runs_failed: Metric<U64Counter>,
    /// Compaction jobs that produced at least one output block, by tenant.
    pub jobs_compacted: Metric<U64Counter>,
    /// Blocks uploaded as compaction output, by tenant.
    pub blocks_uploaded: Metric<U64Counter>,
    /// Deletion markers written, by tenant.
    pub blocks_marked_for_deletion: Metric<U64Counter>,
    /// No-compact markers written, by tenant.
    pub blocks_marked_for_no_compaction: Metric<U64Counter>,
    /// Broken blocks rewritten by the repair path, by tenant.
    pub blocks_repaired: Metric<U64Counter>,
    /// Block metas that could not be decoded, by tenant.
    pub corrupted_metas: Metric<U64Counter>,
    /// Garbage-collection passes, by tenant.
    pub garbage_collection_runs: Metric<U64Counter>,
    /// Garbage-collection passes that failed, by tenant.
    pub garbage_collection_failures: Metric<U64Counter>,
    /// Blocks deleted by garbage collection, by tenant.
    pub garbage_collected_blocks: Metric<U64Counter>,
    /// Duration of garbage-collection passes.
    pub garbage_collection_duration: Metric<DurationHistogram>,
}

impl CompactorMetrics {
    /// Register all compactor instruments against `registry`.
    pub fn new(registry: &Registry) -> Self {
        Self {
            runs_started: registry.register_metric(
                "compactor_runs_started_total",
                "compaction iterations started",
            ),
            runs_completed: registry.register_metric(
                "compactor_runs_completed_total",
                "compaction iterations that completed without errors",
            ),
            runs_failed: registry.register_metric(
                "compactor_runs_failed_total",
                "compaction iterations that hit at least one error",
            ),
            jobs_compacted: registry.register_metric(
                "compactor_group_compactions_total",
                "compaction jobs that produced at least one output block",
            ),
            blocks_uploaded: registry.register_metric(
                "compactor_blocks_uploaded_total",
                "blocks uploaded as compaction output",
            ),
            blocks_marked_for_deletion: registry.register_metric(
                "compactor_blocks_marked_for_deletion_total",
                "deletion markers written",
            ),
            blocks_marked_for_no_compaction: registry.register_metric(
                "compactor_blocks_marked_for_no_compaction_total",
                "no-compact markers written",
            ),
            blocks_repaired: registry.register_metric(
                "compactor_blocks_repaired_total",
                "broken blocks rewritten by the repair path",
            ),
            corrupted_metas: registry.register_metric(
                "compactor_corrupted_metas_total",
                "block meta files that could not be decoded",
            ),
            garbage_collection_runs: registry.register_metric(
                "compactor_garbage_collection_runs_total",
                "garbage collection passes",
            ),
            garbage_collection_failures: registry.register_metric(
                "compactor_garbage_collection_failures_total",
                "garbage collection passes that failed",
            ),
            garbage_collected_blocks: registry.register_metric(
                "compactor_garbage_collected_blocks_total",
                "blocks deleted by garbage collection",
            ),
            garbage_collection_duration: registry.register_metric(
                "compactor_garbage_collection_duration_seconds",
                "duration of garbage collection passes",
            ),
        }
    }
}
