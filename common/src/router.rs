//! Fan-out of newly discovered work across the per-worker queues
//!
//! Folder trees are unbalanced, so a worker that discovers work does not keep it: folders and
//! files rotate over every worker's queue. Files larger than the threshold go to the shared
//! large-file queue instead.

use std::sync::{Arc, Mutex, PoisonError};

use crate::layout::QueueSet;
use crate::workitem::WorkItem;
use crate::workqueue::WorkQueue;

#[derive(Debug)]
pub struct WorkRouter {
    folder_queues: Vec<Arc<WorkQueue>>,
    file_queues: Vec<Arc<WorkQueue>>,
    large_queue: Arc<WorkQueue>,
    large_file_size: u64,
    folder_cursor: Mutex<usize>,
    file_cursor: Mutex<usize>,
}

/// Moves the cursor to the next queue and returns its position
fn advance(cursor: &Mutex<usize>, count: usize) -> usize {
    let mut cursor = cursor.lock().unwrap_or_else(PoisonError::into_inner);
    *cursor = (*cursor + 1) % count;
    *cursor
}

impl WorkRouter {
    /// Both cursors start at `worker_id`, the first submission goes to the next worker
    pub fn new(queues: &QueueSet, worker_id: usize, large_file_size: u64) -> Self {
        let count = std::cmp::max(1, queues.worker_count());
        Self {
            folder_queues: queues.folder_queues.clone(),
            file_queues: queues.file_queues.clone(),
            large_queue: queues.large_queue.clone(),
            large_file_size,
            folder_cursor: Mutex::new(worker_id % count),
            file_cursor: Mutex::new(worker_id % count),
        }
    }

    pub fn large_file_size(&self) -> u64 {
        self.large_file_size
    }

    pub fn is_large(&self, size: u64) -> bool {
        size > self.large_file_size
    }

    /// Ok(false) means the enqueue kept failing on the transport
    async fn submit(&self, queue: &WorkQueue, item: &WorkItem) -> store::Result<bool> {
        match queue.enqueue(item).await {
            Ok(()) => {
                tracing::debug!("submitted {:?} to {}", &item.source_path, queue.name());
                Ok(true)
            }
            Err(error) if error.is_transient() => {
                tracing::error!(
                    "failed submitting {:?} to {}: {}",
                    &item.source_path,
                    queue.name(),
                    error
                );
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    pub async fn submit_folder(&self, item: &WorkItem) -> store::Result<bool> {
        let index = advance(&self.folder_cursor, self.folder_queues.len());
        self.submit(&self.folder_queues[index], item).await
    }

    pub async fn submit_file(&self, item: &WorkItem) -> store::Result<bool> {
        let index = advance(&self.file_cursor, self.file_queues.len());
        self.submit(&self.file_queues[index], item).await
    }

    pub async fn submit_large_file(&self, item: &WorkItem) -> store::Result<bool> {
        self.submit(&self.large_queue, item).await
    }

    /// Routes a file by size, returns whether it went to the large-file queue
    pub async fn submit_sized_file(
        &self,
        item: &WorkItem,
        size: u64,
    ) -> store::Result<(bool, bool)> {
        if self.is_large(size) {
            Ok((self.submit_large_file(item).await?, true))
        } else {
            Ok((self.submit_file(item).await?, false))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::testutils;

    async fn queues(workers: usize) -> anyhow::Result<QueueSet> {
        let backend = store::memory::MemoryBackend::default();
        QueueSet::open(&backend, workers, RetryPolicy::default()).await
    }

    async fn sizes(queues: &[Arc<WorkQueue>]) -> anyhow::Result<Vec<usize>> {
        let mut sizes = vec![];
        for queue in queues {
            sizes.push(queue.outstanding().await?);
        }
        Ok(sizes)
    }

    #[tokio::test]
    async fn folders_rotate_evenly_past_own_queue() -> anyhow::Result<()> {
        let queues = queues(4).await?;
        let router = WorkRouter::new(&queues, 2, 1024);
        let first = WorkItem::new("/src/first", "first");
        assert!(router.submit_folder(&first).await?);
        // the cursor advances before the first submission
        assert_eq!(sizes(&queues.folder_queues).await?, vec![0, 0, 0, 1]);
        for index in 1..12 {
            let item = WorkItem::new(&format!("/src/{index}"), &index.to_string());
            assert!(router.submit_folder(&item).await?);
        }
        assert_eq!(sizes(&queues.folder_queues).await?, vec![3, 3, 3, 3]);
        assert_eq!(sizes(&queues.file_queues).await?, vec![0, 0, 0, 0]);
        Ok(())
    }

    #[tokio::test]
    async fn rotation_order_follows_cursor() -> anyhow::Result<()> {
        let queues = queues(3).await?;
        let router = WorkRouter::new(&queues, 1, 1024);
        for name in ["a", "b", "c"] {
            router
                .submit_file(&WorkItem::new(&format!("/src/{name}"), "t"))
                .await?;
        }
        let mut order = vec![];
        for queue in &queues.file_queues {
            let items = queue.fetch().await?.items;
            order.push(items[0].source_path.clone());
        }
        assert_eq!(order, vec!["/src/b", "/src/c", "/src/a"]);
        Ok(())
    }

    #[tokio::test]
    async fn large_files_go_to_shared_queue() -> anyhow::Result<()> {
        let queues = queues(2).await?;
        for worker in 0..2 {
            let router = WorkRouter::new(&queues, worker, 100);
            let item = WorkItem::new("/src/big.bin", "t");
            assert_eq!(router.submit_sized_file(&item, 101).await?, (true, true));
            let item = WorkItem::new("/src/edge.bin", "t");
            assert_eq!(router.submit_sized_file(&item, 100).await?, (true, false));
        }
        assert_eq!(queues.large_queue.outstanding().await?, 2);
        assert_eq!(sizes(&queues.file_queues).await?, vec![1, 1]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transport_reports_false() -> anyhow::Result<()> {
        let queues = testutils::failing_queue_set(2).await?;
        let router = WorkRouter::new(&queues, 0, 100);
        assert!(!router.submit_folder(&WorkItem::new("/src/a", "a")).await?);
        assert!(!router.submit_large_file(&WorkItem::new("/src/b", "b")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_submissions_stay_balanced() -> anyhow::Result<()> {
        let queues = queues(4).await?;
        let router = Arc::new(WorkRouter::new(&queues, 0, 100));
        let mut join_set = tokio::task::JoinSet::new();
        for task in 0..8 {
            let router = router.clone();
            join_set.spawn(async move {
                for index in 0..10 {
                    let item = WorkItem::new(&format!("/src/{task}/{index}"), "t");
                    router.submit_file(&item).await?;
                }
                Ok::<(), store::StoreError>(())
            });
        }
        while let Some(res) = join_set.join_next().await {
            res??;
        }
        assert_eq!(sizes(&queues.file_queues).await?, vec![20, 20, 20, 20]);
        Ok(())
    }
}
