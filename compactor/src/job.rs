use data_types::{BlockMeta, TenantId};

/// A homogeneous set of blocks planned to be compacted together.
///
/// All blocks of a job share the same group key (resolution plus external
/// labels, which include the shard id for sharded blocks).
#[derive(Debug, Clone)]
pub struct Job {
    /// The owning tenant.
    pub tenant: TenantId,
    /// The shared group key.
    pub key: String,
    /// Whether this is a splitting job of the split-merge strategy.
    pub use_splitting: bool,
    /// Number of output shards of a splitting job (>1 iff splitting).
    pub split_shards: u64,
    /// The split-stage partition this job belongs to (splitting only).
    pub shard_group: u64,
    /// The blocks of this job, kept ordered by min time.
    blocks: Vec<BlockMeta>,
}

impl Job {
    /// An empty job for `tenant` with group `key`.
    pub fn new(tenant: TenantId, key: impl Into<String>) -> Self {
        Self {
            tenant,
            key: key.into(),
            use_splitting: false,
            split_shards: 1,
            shard_group: 0,
            blocks: vec![],
        }
    }

    /// An empty splitting job producing `split_shards` shards.
    pub fn new_splitting(
        tenant: TenantId,
        key: impl Into<String>,
        split_shards: u64,
        shard_group: u64,
    ) -> Self {
        Self {
            use_splitting: true,
            split_shards,
            shard_group,
            ..Self::new(tenant, key)
        }
    }

    /// Insert `meta`, keeping blocks ordered by min time.
    pub fn add(&mut self, meta: BlockMeta) {
        let at = self
            .blocks
            .partition_point(|b| b.min_time <= meta.min_time);
        self.blocks.insert(at, meta);
    }

    /// The blocks of this job, ordered by min time.
    pub fn blocks(&self) -> &[BlockMeta] {
        &self.blocks
    }

    /// Minimum time covered by any block of the job.
    pub fn min_time(&self) -> i64 {
        self.blocks.first().map(|b| b.min_time).unwrap_or(0)
    }

    /// Maximum time covered by any block of the job.
    pub fn max_time(&self) -> i64 {
        self.blocks.iter().map(|b| b.max_time).max().unwrap_or(0)
    }

    /// The time range the job's envelope spans.
    pub fn range(&self) -> i64 {
        self.max_time() - self.min_time()
    }

    /// The key work for this job is sharded by across compactor replicas.
    ///
    /// Splitting and merging stages of the same group hash differently,
    /// so they can land on different instances.
    pub fn sharding_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.tenant,
            self.key,
            if self.use_splitting { "split" } else { "merge" },
            self.shard_group,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::meta;
    use ulid::Ulid;

    #[test]
    fn test_blocks_stay_ordered_by_min_time() {
        let mut job = Job::new(TenantId::new("t1").unwrap(), "0@1");
        job.add(meta(Ulid::new(), 200, 300));
        job.add(meta(Ulid::new(), 0, 100));
        job.add(meta(Ulid::new(), 100, 200));

        let mins: Vec<i64> = job.blocks().iter().map(|b| b.min_time).collect();
        assert_eq!(mins, vec![0, 100, 200]);
        assert_eq!(job.min_time(), 0);
        assert_eq!(job.max_time(), 300);
        assert_eq!(job.range(), 300);
    }

    #[test]
    fn test_sharding_key_distinguishes_stages() {
        let tenant = TenantId::new("t1").unwrap();
        let merge = Job::new(tenant.clone(), "0@1");
        let split = Job::new_splitting(tenant, "0@1", 4, 0);
        assert_ne!(merge.sharding_key(), split.sharding_key());
    }
}
