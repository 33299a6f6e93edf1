//! Names and handles of the shared durable structures

use std::sync::Arc;

use anyhow::Context;
use store::{Backend, QueueKind, Set};

use crate::retry::RetryPolicy;
use crate::workqueue::WorkQueue;

pub const LARGE_FILES_QUEUE: &str = "large-files-queue";
pub const FOLDER_DONE_SET: &str = "folder-done-set";

pub fn folder_queue_name(worker: usize) -> String {
    format!("copy-folder-queue-{worker}")
}

pub fn file_queue_name(worker: usize) -> String {
    format!("copy-files-queue-{worker}")
}

/// Per-worker folder and file queues, the shared large-file queue and the done set
#[derive(Debug, Clone)]
pub struct QueueSet {
    pub folder_queues: Vec<Arc<WorkQueue>>,
    pub file_queues: Vec<Arc<WorkQueue>>,
    pub large_queue: Arc<WorkQueue>,
    pub done_set: Arc<dyn Set>,
}

impl QueueSet {
    /// Opens (creating if missing) every structure used by `worker_count` workers
    pub async fn open(
        backend: &dyn Backend,
        worker_count: usize,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(worker_count >= 1, "worker count must be at least 1");
        let mut folder_queues = Vec::with_capacity(worker_count);
        let mut file_queues = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let name = folder_queue_name(worker);
            let queue = backend
                .open_queue(&name, QueueKind::Standard)
                .await
                .with_context(|| format!("failed opening queue {name}"))?;
            folder_queues.push(Arc::new(WorkQueue::new(queue, retry)));
            let name = file_queue_name(worker);
            let queue = backend
                .open_queue(&name, QueueKind::Standard)
                .await
                .with_context(|| format!("failed opening queue {name}"))?;
            file_queues.push(Arc::new(WorkQueue::new(queue, retry)));
        }
        let large = backend
            .open_queue(LARGE_FILES_QUEUE, QueueKind::Large)
            .await
            .with_context(|| format!("failed opening queue {LARGE_FILES_QUEUE}"))?;
        let done_set = backend
            .open_set(FOLDER_DONE_SET)
            .await
            .with_context(|| format!("failed opening set {FOLDER_DONE_SET}"))?;
        tracing::debug!("opened queues for {} workers", worker_count);
        Ok(Self {
            folder_queues,
            file_queues,
            large_queue: Arc::new(WorkQueue::new(large, retry)),
            done_set,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.folder_queues.len()
    }

    pub fn folder_queue(&self, worker: usize) -> anyhow::Result<&Arc<WorkQueue>> {
        self.folder_queues
            .get(worker)
            .with_context(|| format!("no folder queue for worker {worker}"))
    }

    pub fn file_queue(&self, worker: usize) -> anyhow::Result<&Arc<WorkQueue>> {
        self.file_queues
            .get(worker)
            .with_context(|| format!("no file queue for worker {worker}"))
    }

    /// Every queue, folder queues first, then file queues, then the large-file queue
    pub fn all_queues(&self) -> impl Iterator<Item = &Arc<WorkQueue>> {
        self.folder_queues
            .iter()
            .chain(self.file_queues.iter())
            .chain(std::iter::once(&self.large_queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_named_structures() -> anyhow::Result<()> {
        let backend = store::memory::MemoryBackend::default();
        let queues = QueueSet::open(&backend, 3, RetryPolicy::default()).await?;
        assert_eq!(queues.worker_count(), 3);
        assert_eq!(queues.folder_queue(2)?.name(), "copy-folder-queue-2");
        assert_eq!(queues.file_queue(0)?.name(), "copy-files-queue-0");
        assert_eq!(queues.large_queue.name(), LARGE_FILES_QUEUE);
        assert_eq!(queues.large_queue.kind(), QueueKind::Large);
        assert_eq!(queues.done_set.name(), FOLDER_DONE_SET);
        assert_eq!(queues.all_queues().count(), 7);
        assert!(queues.folder_queue(3).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let backend = store::memory::MemoryBackend::default();
        assert!(
            QueueSet::open(&backend, 0, RetryPolicy::default())
                .await
                .is_err()
        );
    }
}
