use std::collections::HashSet;
use std::fmt::{Debug, Display};

use data_types::BlockMeta;
use ulid::Ulid;

/// Chooses which blocks of a job to compact next.
pub trait Planner: Debug + Display + Send + Sync {
    /// The next set of blocks to merge, ordered by min time; empty when
    /// the job has nothing (more) to do.
    ///
    /// Blocks in `no_compact` must never be returned.
    fn plan(&self, blocks: &[BlockMeta], no_compact: &HashSet<Ulid>) -> Vec<BlockMeta>;
}

/// The default planner: within a group, return the oldest bucket of the
/// smallest block range holding at least two blocks that fit entirely.
///
/// Jobs are therefore consumed smallest-range-oldest-first, and a block
/// already spanning its whole range is never re-selected for that range.
#[derive(Debug)]
pub struct RangePlanner {
    ranges: Vec<i64>,
}

impl RangePlanner {
    /// Create a planner for the configured ranges, ascending, in ms.
    pub fn new(ranges: Vec<i64>) -> Self {
        Self { ranges }
    }
}

impl Display for RangePlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "range")
    }
}

impl Planner for RangePlanner {
    fn plan(&self, blocks: &[BlockMeta], no_compact: &HashSet<Ulid>) -> Vec<BlockMeta> {
        let mut blocks: Vec<&BlockMeta> = blocks
            .iter()
            .filter(|b| !no_compact.contains(&b.id))
            .collect();
        blocks.sort_by_key(|b| (b.min_time, b.max_time));

        for range in &self.ranges {
            let mut bucket: Vec<&BlockMeta> = vec![];
            let mut bucket_start = i64::MIN;

            for block in &blocks {
                // A block that already fills this whole range is complete
                // at this level; it must not be merged with itself.
                if block.max_time - block.min_time >= *range {
                    continue;
                }

                let start = block.min_time.div_euclid(*range) * range;
                let end = start + range;
                if block.max_time > end {
                    // Crosses the bucket boundary; not eligible at this
                    // range.
                    continue;
                }

                if start != bucket_start {
                    if bucket.len() >= 2 {
                        return bucket.into_iter().cloned().collect();
                    }
                    bucket = vec![];
                    bucket_start = start;
                }
                bucket.push(block);
            }

            if bucket.len() >= 2 {
                return bucket.into_iter().cloned().collect();
            }
        }

        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{compacted_meta, meta};
    use crate::RANGE_2H_MS;

    fn planner() -> RangePlanner {
        RangePlanner::new(vec![RANGE_2H_MS, 6 * RANGE_2H_MS, 12 * RANGE_2H_MS])
    }

    #[test]
    fn test_empty_input_plans_nothing() {
        assert!(planner().plan(&[], &HashSet::new()).is_empty());
    }

    #[test]
    fn test_single_block_per_bucket_plans_nothing() {
        // One block per 2h bucket, not enough to fill a larger bucket
        // either (different 12h buckets).
        let blocks = vec![
            meta(Ulid::new(), 0, RANGE_2H_MS),
            meta(Ulid::new(), 13 * RANGE_2H_MS, 14 * RANGE_2H_MS),
        ];
        assert!(planner().plan(&blocks, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_oldest_small_bucket_wins() {
        // Two fresh blocks inside the first 2h bucket, two in a later one.
        let old_a = meta(Ulid::new(), 0, RANGE_2H_MS / 2);
        let old_b = meta(Ulid::new(), RANGE_2H_MS / 2, RANGE_2H_MS);
        let new_a = meta(Ulid::new(), 4 * RANGE_2H_MS, 4 * RANGE_2H_MS + RANGE_2H_MS / 2);
        let new_b = meta(
            Ulid::new(),
            4 * RANGE_2H_MS + RANGE_2H_MS / 2,
            5 * RANGE_2H_MS,
        );

        let plan = planner().plan(
            &[new_a, new_b, old_a.clone(), old_b.clone()],
            &HashSet::new(),
        );
        assert_eq!(plan, vec![old_a, old_b]);
    }

    #[test]
    fn test_four_2h_blocks_fill_a_larger_bucket() {
        let sources: Vec<BlockMeta> = (0..4)
            .map(|i| {
                let id = Ulid::new();
                compacted_meta(id, i * RANGE_2H_MS, (i + 1) * RANGE_2H_MS, 2, vec![id])
            })
            .collect();

        // Each block fills its own 2h bucket, so only the 12h range can
        // take them, all four together.
        let plan = planner().plan(&sources, &HashSet::new());
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0].min_time, 0);
        assert_eq!(plan[3].max_time, 8 * RANGE_2H_MS);
    }

    #[test]
    fn test_no_compact_blocks_are_skipped() {
        let a = meta(Ulid::new(), 0, RANGE_2H_MS / 2);
        let b = meta(Ulid::new(), RANGE_2H_MS / 2, RANGE_2H_MS);
        let no_compact: HashSet<Ulid> = [b.id].into_iter().collect();

        assert!(planner().plan(&[a, b], &no_compact).is_empty());
    }

    #[test]
    fn test_instant_block_is_compactable() {
        let a = meta(Ulid::new(), 1_000, 1_000);
        let b = meta(Ulid::new(), 2_000, 3_000);
        let plan = planner().plan(&[a.clone(), b.clone()], &HashSet::new());
        assert_eq!(plan, vec![a, b]);
    }
}
