use std::collections::HashSet;
use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use data_types::TenantId;

/// Two hours in milliseconds, the smallest block range.
pub const RANGE_2H_MS: i64 = 2 * 60 * 60 * 1000;

/// The order in which a tenant's compaction jobs are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobsOrder {
    /// Jobs covering the smallest time range first, oldest first within
    /// equal ranges. The only order the default strategy supports.
    SmallestRangeOldestFirst,
    /// Most recent jobs first; supported by the split-merge strategy.
    NewestFirst,
}

/// Which grouping strategy the compactor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategy {
    /// Group by (resolution, external labels) and merge whole groups.
    Default,
    /// First split level-1 blocks into shards, then merge per shard.
    SplitMerge,
}

/// How blocks carrying a no-compact marker are handled during sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoCompactMode {
    /// Drop them from the synced set entirely.
    DropFromSync,
    /// Keep them visible but flag them so the planner skips them.
    FlagForPlanner,
}

/// Configuration of the multitenant compactor.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Local scratch space for downloads and merge output.
    pub data_dir: PathBuf,
    /// Block time ranges compacted together, in milliseconds, ascending.
    pub block_ranges: Vec<i64>,
    /// How often a full compaction iteration starts.
    pub compaction_interval: Duration,
    /// Retries of a failing tenant within one iteration.
    pub compaction_retries: usize,
    /// Jobs run in parallel for one tenant.
    pub compaction_concurrency: NonZeroUsize,
    /// Concurrent block downloads/uploads within one job.
    pub block_sync_concurrency: NonZeroUsize,
    /// Blocks uploaded less than this long ago are invisible to the
    /// syncer, so half-written uploads are never considered.
    pub consistency_delay: Duration,
    /// Jobs touching a block uploaded within this window are skipped,
    /// preventing races with still-finalizing producers.
    pub wait_period: Duration,
    /// Bound on one whole iteration; zero disables the bound.
    pub max_compaction_time: Duration,
    /// Mark blocks with out-of-order chunks no-compact instead of failing
    /// the job.
    pub skip_blocks_with_out_of_order_chunks: bool,
    /// How no-compact-marked blocks are treated during sync.
    pub no_compact_mode: NoCompactMode,
    /// Legacy external labels stripped from synced metas.
    pub sanitized_legacy_labels: Vec<String>,
    /// The grouping strategy.
    pub strategy: CompactionStrategy,
    /// Job execution order (split-merge only; the default strategy always
    /// runs smallest-range-oldest-first).
    pub jobs_order: JobsOrder,
    /// Tenants allowed to be compacted; empty means all.
    pub enabled_tenants: Vec<String>,
    /// Tenants never compacted.
    pub disabled_tenants: Vec<String>,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data-compactor"),
            block_ranges: vec![RANGE_2H_MS, 6 * RANGE_2H_MS, 12 * RANGE_2H_MS],
            compaction_interval: Duration::from_secs(3600),
            compaction_retries: 3,
            compaction_concurrency: NonZeroUsize::new(1).unwrap(),
            block_sync_concurrency: NonZeroUsize::new(8).unwrap(),
            consistency_delay: Duration::ZERO,
            wait_period: Duration::ZERO,
            max_compaction_time: Duration::ZERO,
            skip_blocks_with_out_of_order_chunks: false,
            no_compact_mode: NoCompactMode::FlagForPlanner,
            sanitized_legacy_labels: vec![],
            strategy: CompactionStrategy::Default,
            jobs_order: JobsOrder::SmallestRangeOldestFirst,
            enabled_tenants: vec![],
            disabled_tenants: vec![],
        }
    }
}

/// Per-tenant compactor options, looked up at iteration time.
pub trait ConfigProvider: Debug + Send + Sync {
    /// Number of shards split compaction produces for the tenant; values
    /// below 2 disable splitting.
    fn split_shards(&self, tenant: &TenantId) -> u64;

    /// Number of groups level-1 blocks are partitioned into before
    /// splitting.
    fn split_groups(&self, tenant: &TenantId) -> u64;

    /// Size of the tenant's compactor subring; 0 means the full ring.
    fn compactor_tenant_shard_size(&self, tenant: &TenantId) -> usize;
}

/// A [`ConfigProvider`] with the same settings for every tenant.
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    /// Shards for split compaction.
    pub split_shards: u64,
    /// Groups for split staging.
    pub split_groups: u64,
    /// Compactor subring size.
    pub compactor_tenant_shard_size: usize,
}

impl Default for StaticConfigProvider {
    fn default() -> Self {
        Self {
            split_shards: 1,
            split_groups: 1,
            compactor_tenant_shard_size: 0,
        }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn split_shards(&self, _tenant: &TenantId) -> u64 {
        self.split_shards
    }

    fn split_groups(&self, _tenant: &TenantId) -> u64 {
        self.split_groups
    }

    fn compactor_tenant_shard_size(&self, _tenant: &TenantId) -> usize {
        self.compactor_tenant_shard_size
    }
}

/// The allow/deny tenant lists.
#[derive(Debug, Clone, Default)]
pub struct AllowedTenants {
    enabled: Option<HashSet<String>>,
    disabled: HashSet<String>,
}

impl AllowedTenants {
    /// Build from the configured lists; an empty `enabled` list allows
    /// everyone not explicitly disabled.
    pub fn new(
        enabled: impl IntoIterator<Item = String>,
        disabled: impl IntoIterator<Item = String>,
    ) -> Self {
        let enabled: HashSet<String> = enabled.into_iter().collect();
        Self {
            enabled: (!enabled.is_empty()).then_some(enabled),
            disabled: disabled.into_iter().collect(),
        }
    }

    /// Whether `tenant` may be processed.
    pub fn is_allowed(&self, tenant: &TenantId) -> bool {
        if self.disabled.contains(tenant.as_str()) {
            return false;
        }
        match &self.enabled {
            Some(enabled) => enabled.contains(tenant.as_str()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_tenants() {
        let tenant = |s: &str| TenantId::new(s).unwrap();

        let all = AllowedTenants::new([], []);
        assert!(all.is_allowed(&tenant("a")));

        let denied = AllowedTenants::new([], ["a".to_owned()]);
        assert!(!denied.is_allowed(&tenant("a")));
        assert!(denied.is_allowed(&tenant("b")));

        let only = AllowedTenants::new(["a".to_owned()], []);
        assert!(only.is_allowed(&tenant("a")));
        assert!(!only.is_allowed(&tenant("b")));

        // Deny wins over allow.
        let both = AllowedTenants::new(["a".to_owned()], ["a".to_owned()]);
        assert!(!both.is_allowed(&tenant("a")));
    }
}
