use std::collections::HashMap;
use std::fmt::{Debug, Display};

use data_types::{BlockMeta, TenantId};
use ulid::Ulid;

use crate::{Job, JobsOrder};

/// Clusters compatible blocks into compaction jobs.
pub trait Grouper: Debug + Display + Send + Sync {
    /// Build the jobs for one tenant's synced metas, in execution order.
    fn groups(&self, tenant: &TenantId, metas: &HashMap<Ulid, BlockMeta>) -> Vec<Job>;
}

fn sort_jobs(jobs: &mut Vec<Job>, order: JobsOrder) {
    match order {
        JobsOrder::SmallestRangeOldestFirst => {
            jobs.sort_by_key(|j| (j.range(), j.min_time()));
        }
        JobsOrder::NewestFirst => {
            jobs.sort_by_key(|j| std::cmp::Reverse(j.min_time()));
        }
    }
}

/// The default strategy: one job per `(resolution, external labels)`
/// group key, consumed smallest-range-oldest-first.
#[derive(Debug)]
pub struct DefaultGrouper;

impl DefaultGrouper {
    /// Create the grouper.
    pub fn new() -> Self {
        Self
    }
}

impl Default for DefaultGrouper {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DefaultGrouper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "default")
    }
}

impl Grouper for DefaultGrouper {
    fn groups(&self, tenant: &TenantId, metas: &HashMap<Ulid, BlockMeta>) -> Vec<Job> {
        let mut jobs: HashMap<String, Job> = HashMap::new();
        for meta in metas.values() {
            let key = meta.group_key();
            jobs.entry(key.clone())
                .or_insert_with(|| Job::new(tenant.clone(), key))
                .add(meta.clone());
        }

        let mut jobs: Vec<Job> = jobs.into_values().collect();
        sort_jobs(&mut jobs, JobsOrder::SmallestRangeOldestFirst);
        jobs
    }
}

/// The split-merge strategy: level-1 blocks without a shard id are first
/// split into `split_shards` shards (partitioned into `split_groups`
/// independent jobs); sharded blocks then merge per shard, which falls
/// out of the group key since the shard id is an external label.
#[derive(Debug)]
pub struct SplitMergeGrouper {
    split_shards: u64,
    split_groups: u64,
    order: JobsOrder,
}

impl SplitMergeGrouper {
    /// Create a grouper producing `split_shards`-way splits.
    pub fn new(split_shards: u64, split_groups: u64, order: JobsOrder) -> Self {
        Self {
            split_shards: split_shards.max(1),
            split_groups: split_groups.max(1),
            order,
        }
    }
}

impl Display for SplitMergeGrouper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "split-merge")
    }
}

impl Grouper for SplitMergeGrouper {
    fn groups(&self, tenant: &TenantId, metas: &HashMap<Ulid, BlockMeta>) -> Vec<Job> {
        let splitting_enabled = self.split_shards > 1;
        let mut split_jobs: HashMap<(String, u64), Job> = HashMap::new();
        let mut merge_jobs: HashMap<String, Job> = HashMap::new();

        for meta in metas.values() {
            let key = meta.group_key();
            let needs_split =
                splitting_enabled && meta.shard_id().is_none() && meta.compaction.level == 1;
            if needs_split {
                let group = ring::stable_hash64(&meta.id.to_string()) % self.split_groups;
                split_jobs
                    .entry((key.clone(), group))
                    .or_insert_with(|| {
                        Job::new_splitting(tenant.clone(), key.clone(), self.split_shards, group)
                    })
                    .add(meta.clone());
            } else {
                merge_jobs
                    .entry(key.clone())
                    .or_insert_with(|| Job::new(tenant.clone(), key))
                    .add(meta.clone());
            }
        }

        let mut jobs: Vec<Job> = split_jobs
            .into_values()
            .chain(merge_jobs.into_values())
            .collect();
        sort_jobs(&mut jobs, self.order);
        jobs
    }
}
