//! Splitting the top-level folder list into per-worker batches
//!
//! Every worker computes the same partition independently, so these functions are pure.
//!
//! When there are at least as many folders as workers the batches are contiguous, disjoint and
//! cover every folder, with the remainder going to the last worker. With more workers than folders
//! every worker still gets a batch of one and starting indices are spread over the folders, so some
//! folders are claimed by more than one worker. The duplicate work is absorbed by the done set.

/// Number of top-level folders owned by `worker_id`
pub fn batch_length(total_folders: usize, worker_count: usize, worker_id: usize) -> usize {
    if worker_count <= 1 {
        return total_folders;
    }
    if worker_count <= total_folders {
        let base = total_folders / worker_count;
        if worker_id == worker_count - 1 {
            return base + total_folders % worker_count;
        }
        return base;
    }
    1
}

/// Index of the first top-level folder owned by `worker_id`
pub fn batch_starting_index(total_folders: usize, worker_count: usize, worker_id: usize) -> usize {
    if worker_count <= 1 {
        return 0;
    }
    if worker_count <= total_folders {
        // must agree with batch_length, total * id / count would leave gaps
        return (total_folders / worker_count) * worker_id;
    }
    total_folders * worker_id / worker_count
}

/// Batch of `worker_id` as a range clamped to the folder list
pub fn batch_range(
    total_folders: usize,
    worker_count: usize,
    worker_id: usize,
) -> std::ops::Range<usize> {
    let start = std::cmp::min(
        batch_starting_index(total_folders, worker_count, worker_id),
        total_folders,
    );
    let end = std::cmp::min(
        start + batch_length(total_folders, worker_count, worker_id),
        total_folders,
    );
    start..end
}
