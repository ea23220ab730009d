//! Pure batch-plan computation: no device access, fully unit-testable.

/// One contiguous slice of the workload, in row indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    /// First row of the batch (global index).
    pub start: usize,
    /// Number of rows in the batch.
    pub count: usize,
}

/// The per-invocation split of `total_items` rows into batches.
///
/// Invariants: per-batch counts sum exactly to `total_items`; after
/// trailing-remainder merging no batch holds ≤ 2 rows unless the whole
/// workload does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Total rows in the invocation.
    pub total_items: usize,
    /// Nominal rows per batch (the last batch may differ).
    pub batch_size: usize,
    /// The batch ranges, in execution order.
    pub ranges: Vec<BatchRange>,
    /// Estimated device bytes per row, carried for stream provisioning.
    pub bytes_per_item: usize,
}

/// A batch this small is never worth a launch; it gets folded into its
/// predecessor (and the nominal size is clamped above it).
const MIN_BATCH_ITEMS: usize = 3;

impl BatchPlan {
    /// Everything fits: one batch covering the whole workload.
    pub fn single_pass(total_items: usize, bytes_per_item: usize) -> Self {
        Self {
            total_items,
            batch_size: total_items,
            ranges: vec![BatchRange {
                start: 0,
                count: total_items,
            }],
            bytes_per_item,
        }
    }

    /// Split `total_items` rows into batches of `ratio × total` rows.
    ///
    /// A trailing batch of ≤ 2 rows is merged into its predecessor rather
    /// than run standalone.
    pub fn multi_batch(total_items: usize, ratio: f64, bytes_per_item: usize) -> Self {
        let mut batch_size = ((total_items as f64 * ratio).round() as usize).max(1);
        if total_items > 2 {
            batch_size = batch_size.max(MIN_BATCH_ITEMS);
        }
        batch_size = batch_size.min(total_items);

        let mut ranges = Vec::with_capacity(total_items.div_ceil(batch_size));
        let mut start = 0;
        while start < total_items {
            let count = batch_size.min(total_items - start);
            ranges.push(BatchRange { start, count });
            start += count;
        }
        while ranges.len() > 1 && ranges[ranges.len() - 1].count <= 2 {
            let tail = ranges.pop().expect("len checked above");
            let prev = ranges.last_mut().expect("len checked above");
            prev.count += tail.count;
        }

        Self {
            total_items,
            batch_size,
            ranges,
            bytes_per_item,
        }
    }

    /// Number of batches in the plan.
    pub fn num_batches(&self) -> usize {
        self.ranges.len()
    }

    /// Rows in the largest batch; stream buffers and the transform plan
    /// are provisioned at this size.
    pub fn max_batch_items(&self) -> usize {
        self.ranges.iter().map(|r| r.count).max().unwrap_or(0)
    }

    /// Whether this plan is a single full-workload pass.
    pub fn is_single_pass(&self) -> bool {
        self.ranges.len() == 1 && self.batch_size == self.total_items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(plan: &BatchPlan) -> Vec<usize> {
        plan.ranges.iter().map(|r| r.count).collect()
    }

    #[test]
    fn test_quarter_ratio_divides_evenly() {
        // 256 rows at ratio 0.25: four batches of 64, last one unmerged.
        let plan = BatchPlan::multi_batch(256, 0.25, 100);
        assert_eq!(plan.batch_size, 64);
        assert_eq!(plan.num_batches(), 4);
        assert_eq!(counts(&plan), vec![64, 64, 64, 64]);
    }

    #[test]
    fn test_trailing_single_row_merges() {
        // 257 rows at ratio 0.25: raw split is 64×4 + 1, and the 1-row
        // tail folds into the previous batch.
        let plan = BatchPlan::multi_batch(257, 0.25, 100);
        assert_eq!(plan.batch_size, 64);
        assert_eq!(plan.num_batches(), 4);
        assert_eq!(counts(&plan), vec![64, 64, 64, 65]);
    }

    #[test]
    fn test_counts_always_sum_to_total() {
        for total in [1usize, 2, 3, 5, 7, 64, 100, 257, 1000, 4097] {
            for ratio in [0.01, 0.1, 0.25, 0.5, 0.9, 1.0] {
                let plan = BatchPlan::multi_batch(total, ratio, 8);
                let sum: usize = plan.ranges.iter().map(|r| r.count).sum();
                assert_eq!(sum, total, "total={total} ratio={ratio}");
            }
        }
    }

    #[test]
    fn test_no_tiny_batches_after_merge() {
        for total in [3usize, 4, 5, 10, 65, 66, 130, 257] {
            for ratio in [0.01, 0.1, 0.25, 0.5, 1.0] {
                let plan = BatchPlan::multi_batch(total, ratio, 8);
                for r in &plan.ranges {
                    assert!(
                        r.count > 2,
                        "batch of {} rows in total={total} ratio={ratio}",
                        r.count
                    );
                }
            }
        }
    }

    #[test]
    fn test_tiny_workloads_stay_whole() {
        let plan = BatchPlan::multi_batch(1, 0.25, 8);
        assert_eq!(counts(&plan), vec![1]);
        let plan = BatchPlan::multi_batch(2, 0.1, 8);
        assert_eq!(counts(&plan), vec![2]);
    }

    #[test]
    fn test_ranges_are_contiguous_and_ordered() {
        let plan = BatchPlan::multi_batch(1000, 0.3, 8);
        let mut expected_start = 0;
        for r in &plan.ranges {
            assert_eq!(r.start, expected_start);
            expected_start += r.count;
        }
        assert_eq!(expected_start, 1000);
    }

    #[test]
    fn test_single_pass_shape() {
        let plan = BatchPlan::single_pass(500, 64);
        assert!(plan.is_single_pass());
        assert_eq!(plan.num_batches(), 1);
        assert_eq!(plan.max_batch_items(), 500);
    }

    #[test]
    fn test_max_batch_items_after_merge() {
        let plan = BatchPlan::multi_batch(257, 0.25, 8);
        assert_eq!(plan.max_batch_items(), 65);
    }

    #[test]
    fn test_full_ratio_is_one_batch() {
        let plan = BatchPlan::multi_batch(100, 1.0, 8);
        assert_eq!(counts(&plan), vec![100]);
    }
}
