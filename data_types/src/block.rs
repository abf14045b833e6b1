use std::collections::BTreeMap;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;
use ulid::Ulid;

/// The external label tagging a block with its split-merge shard.
pub const SHARD_ID_LABEL: &str = "__compactor_shard_id__";

/// Current version of the block meta file format.
pub const META_VERSION: u32 = 1;

/// Formats a shard-id external label value, 1-based.
pub fn shard_id_label_value(shard: u64, of: u64) -> String {
    format!("{shard}_of_{of}")
}

/// Compaction lineage of a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCompaction {
    /// Compaction level; freshly produced blocks are level 1.
    pub level: u32,
    /// ULIDs of the original (level 1) blocks this block was compacted
    /// from; a level 1 block lists itself.
    pub sources: Vec<Ulid>,
    /// ULIDs of the immediate parent blocks, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<Ulid>,
}

/// Metadata of one immutable block, persisted as `meta.json` alongside the
/// block contents.
///
/// A block is considered present in the object store iff its `meta.json`
/// is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// The block ULID.
    pub id: Ulid,
    /// Minimum sample timestamp, in milliseconds, inclusive.
    pub min_time: i64,
    /// Maximum sample timestamp, in milliseconds, exclusive.
    pub max_time: i64,
    /// Meta file format version.
    pub version: u32,
    /// Compaction lineage.
    pub compaction: BlockCompaction,
    /// Downsampling resolution in milliseconds; 0 for raw blocks.
    pub resolution: i64,
    /// External labels attached at upload time (tenant-level labels plus
    /// the optional [`SHARD_ID_LABEL`]).
    #[serde(default)]
    pub external_labels: BTreeMap<String, String>,
}

impl BlockMeta {
    /// The job group key: blocks sharing it are compactable together.
    pub fn group_key(&self) -> String {
        format!(
            "{}@{}",
            self.resolution,
            stable_hash_labels(&self.external_labels)
        )
    }

    /// The split-merge shard of this block, if tagged.
    pub fn shard_id(&self) -> Option<&str> {
        self.external_labels.get(SHARD_ID_LABEL).map(|s| s.as_str())
    }

    /// Whether this block's time range and source set fully cover
    /// `other`, i.e. `other` is redundant once this block exists.
    pub fn covers(&self, other: &Self) -> bool {
        self.min_time <= other.min_time
            && self.max_time >= other.max_time
            && other
                .compaction
                .sources
                .iter()
                .all(|s| self.compaction.sources.contains(s))
    }
}

/// A stable 64-bit hash of an external label map.
///
/// Stable across processes; used in the block group key.
pub fn stable_hash_labels(labels: &BTreeMap<String, String>) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    for (name, value) in labels {
        hasher.write(name.as_bytes());
        hasher.write(&[0xff]);
        hasher.write(value.as_bytes());
        hasher.write(&[0xff]);
    }
    hasher.finish()
}

/// A marker recording that a block is scheduled for deletion.
///
/// Written alongside the block; suppresses the block from reads and from
/// compaction grouping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    /// The marked block.
    pub id: Ulid,
    /// Unix milliseconds at which the block was marked.
    pub deletion_time: i64,
    /// Marker file format version.
    pub version: u32,
}

/// Why a block was marked as not compactable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoCompactReason {
    /// Marked by an operator.
    Manual,
    /// The block contains out-of-order chunks and was skipped.
    OutOfOrderChunks,
}

/// A marker excluding a block from compaction while keeping it queryable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoCompactMark {
    /// The marked block.
    pub id: Ulid,
    /// Unix milliseconds at which the block was marked.
    pub no_compact_time: i64,
    /// Why the block must not be compacted.
    pub reason: NoCompactReason,
    /// Marker file format version.
    pub version: u32,
}
