use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::time::Duration;

use async_trait::async_trait;
use data_types::{BlockMeta, DynError};
use observability_deps::tracing::debug;
use stratus_time::Time;
use ulid::Ulid;

use crate::{NoCompactMode, TenantBucket};

/// The synced meta set a filter chain operates on, plus the side state
/// filters accumulate for later stages.
#[derive(Debug, Default)]
pub struct FilteredMetas {
    /// Block metas surviving the chain so far, by ULID.
    pub metas: HashMap<Ulid, BlockMeta>,
    /// Duplicates found by the dedup filter, garbage-collected afterwards.
    pub duplicates: Vec<Ulid>,
    /// Blocks flagged no-compact for the planner.
    pub no_compact: HashSet<Ulid>,
}

/// One stage of the meta filter chain. Order matters; see
/// [`filter_chain`].
#[async_trait]
pub trait MetaFilter: Debug + Display + Send + Sync {
    /// Remove or flag metas in place.
    async fn filter(&self, now: Time, metas: &mut FilteredMetas) -> Result<(), DynError>;
}

/// Run `filters` over `metas` in order.
pub async fn filter_chain(
    filters: &[Box<dyn MetaFilter>],
    now: Time,
    metas: &mut FilteredMetas,
) -> Result<(), DynError> {
    for filter in filters {
        filter.filter(now, metas).await?;
    }
    Ok(())
}

/// Removes blocks already marked for deletion.
///
/// A deletion marker suppresses the block from all reads and from
/// compaction grouping.
#[derive(Debug)]
pub struct DeletionMarkFilter {
    bucket: TenantBucket,
}

impl DeletionMarkFilter {
    /// Create a filter reading markers from `bucket`.
    pub fn new(bucket: TenantBucket) -> Self {
        Self { bucket }
    }
}

impl Display for DeletionMarkFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deletion-mark")
    }
}

#[async_trait]
impl MetaFilter for DeletionMarkFilter {
    async fn filter(&self, _now: Time, metas: &mut FilteredMetas) -> Result<(), DynError> {
        let marked = self.bucket.deletion_marked_blocks().await?;
        metas.metas.retain(|id, _| !marked.contains(id));
        Ok(())
    }
}

/// Ignores blocks uploaded less than the consistency delay ago, so
/// partially-visible uploads never enter a compaction.
#[derive(Debug)]
pub struct ConsistencyDelayFilter {
    bucket: TenantBucket,
    delay: Duration,
}

impl ConsistencyDelayFilter {
    /// Create a filter with the configured `delay`.
    pub fn new(bucket: TenantBucket, delay: Duration) -> Self {
        Self { bucket, delay }
    }
}

impl Display for ConsistencyDelayFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "consistency-delay")
    }
}

#[async_trait]
impl MetaFilter for ConsistencyDelayFilter {
    async fn filter(&self, now: Time, metas: &mut FilteredMetas) -> Result<(), DynError> {
        if self.delay.is_zero() {
            return Ok(());
        }
        let cutoff = now - self.delay;
        let mut young = vec![];
        for id in metas.metas.keys() {
            let uploaded = self.bucket.block_upload_time(*id).await?;
            if uploaded > cutoff {
                young.push(*id);
            }
        }
        for id in young {
            debug!(block = %id, "ignoring block younger than consistency delay");
            metas.metas.remove(&id);
        }
        Ok(())
    }
}

/// Drops blocks whose time range and sources are fully covered by a
/// higher-compaction-level block, recording them for garbage collection.
#[derive(Debug, Default)]
pub struct DeduplicateFilter;

impl DeduplicateFilter {
    /// Create the filter.
    pub fn new() -> Self {
        Self
    }
}

impl Display for DeduplicateFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deduplicate")
    }
}

#[async_trait]
impl MetaFilter for DeduplicateFilter {
    async fn filter(&self, _now: Time, metas: &mut FilteredMetas) -> Result<(), DynError> {
        let mut duplicates: BTreeSet<Ulid> = BTreeSet::new();
        for (id, meta) in &metas.metas {
            let duplicate = metas.metas.values().any(|other| {
                other.id != *id
                    && other.compaction.level > meta.compaction.level
                    && other.covers(meta)
            });
            if duplicate {
                duplicates.insert(*id);
            }
        }
        for id in &duplicates {
            metas.metas.remove(id);
        }
        metas.duplicates.extend(duplicates);
        Ok(())
    }
}

/// Handles no-compact markers: drops the blocks from the synced set or
/// flags them for the planner, per configuration.
#[derive(Debug)]
pub struct NoCompactFilter {
    bucket: TenantBucket,
    mode: NoCompactMode,
}

impl NoCompactFilter {
    /// Create a filter with the configured `mode`.
    pub fn new(bucket: TenantBucket, mode: NoCompactMode) -> Self {
        Self { bucket, mode }
    }
}

impl Display for NoCompactFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no-compact-mark")
    }
}

#[async_trait]
impl MetaFilter for NoCompactFilter {
    async fn filter(&self, _now: Time, metas: &mut FilteredMetas) -> Result<(), DynError> {
        let marked = self.bucket.no_compact_marked_blocks().await?;
        match self.mode {
            NoCompactMode::DropFromSync => {
                metas.metas.retain(|id, _| !marked.contains(id));
            }
            NoCompactMode::FlagForPlanner => {
                metas
                    .no_compact
                    .extend(metas.metas.keys().filter(|id| marked.contains(id)));
            }
        }
        Ok(())
    }
}

/// Strips legacy external labels that are no longer used, so stale labels
/// never leak into group keys.
#[derive(Debug)]
pub struct LabelSanitizerFilter {
    legacy_labels: Vec<String>,
}

impl LabelSanitizerFilter {
    /// Create a filter removing `legacy_labels`.
    pub fn new(legacy_labels: Vec<String>) -> Self {
        Self { legacy_labels }
    }
}

impl Display for LabelSanitizerFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "label-sanitizer")
    }
}

#[async_trait]
impl MetaFilter for LabelSanitizerFilter {
    async fn filter(&self, _now: Time, metas: &mut FilteredMetas) -> Result<(), DynError> {
        for meta in metas.metas.values_mut() {
            for label in &self.legacy_labels {
                meta.external_labels.remove(label);
            }
        }
        Ok(())
    }
}
