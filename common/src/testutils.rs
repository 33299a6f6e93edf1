//! Fakes shared by the unit tests

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use store::{Message, Queue, QueueKind, Set, StoreError};

use crate::layout::QueueSet;
use crate::retry::RetryPolicy;
use crate::workqueue::WorkQueue;

/// In-memory source tree
#[derive(Debug, Default)]
pub struct FakeSource {
    folders: BTreeMap<String, Vec<String>>,
    files: BTreeMap<String, Vec<String>>,
    sizes: BTreeMap<String, u64>,
    broken: HashSet<String>,
    pub enumerations: AtomicUsize,
}

fn parent(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|parent| !parent.is_empty())
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `path` and links it to its parent folder
    pub fn folder(mut self, path: &str) -> Self {
        self.folders.entry(path.to_string()).or_default();
        self.files.entry(path.to_string()).or_default();
        if let Some(parent) = parent(path) {
            let children = self.folders.entry(parent.to_string()).or_default();
            if !children.iter().any(|child| child == path) {
                children.push(path.to_string());
                children.sort();
            }
            self.files.entry(parent.to_string()).or_default();
        }
        self
    }

    pub fn file(mut self, path: &str, size: u64) -> Self {
        if let Some(parent) = parent(path) {
            self.files
                .entry(parent.to_string())
                .or_default()
                .push(path.to_string());
        }
        self.sizes.insert(path.to_string(), size);
        self
    }

    /// Enumerating `path` fails
    pub fn broken(mut self, path: &str) -> Self {
        self.broken.insert(path.to_string());
        self
    }
}

#[async_trait::async_trait]
impl crate::source::SourceEnumerator for FakeSource {
    async fn enumerate_folders(&self, path: &str) -> anyhow::Result<Vec<String>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        if self.broken.contains(path) {
            return Err(anyhow::anyhow!("cannot open directory {path:?} for reading"));
        }
        Ok(self.folders.get(path).cloned().unwrap_or_default())
    }

    async fn enumerate_files(&self, path: &str) -> anyhow::Result<Vec<String>> {
        if self.broken.contains(path) {
            return Err(anyhow::anyhow!("cannot open directory {path:?} for reading"));
        }
        Ok(self.files.get(path).cloned().unwrap_or_default())
    }

    async fn file_size(&self, path: &str) -> anyhow::Result<u64> {
        self.sizes
            .get(path)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no such file {path:?}"))
    }
}

/// Target that records what was written
#[derive(Debug, Default)]
pub struct RecordingTarget {
    pub created: Mutex<Vec<String>>,
    pub copied: Mutex<Vec<(String, String)>>,
    failing: HashSet<String>,
}

impl RecordingTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copying or creating `path` reports failure
    pub fn failing(mut self, path: &str) -> Self {
        self.failing.insert(path.to_string());
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn copied(&self) -> Vec<(String, String)> {
        self.copied.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl crate::target::TargetWriter for RecordingTarget {
    async fn create_folder(&self, target_path: &str) -> anyhow::Result<bool> {
        if self.failing.contains(target_path) {
            return Ok(false);
        }
        self.created.lock().unwrap().push(target_path.to_string());
        Ok(true)
    }

    async fn copy_file(&self, source_path: &str, target_folder: &str) -> anyhow::Result<bool> {
        if self.failing.contains(source_path) {
            return Ok(false);
        }
        self.copied
            .lock()
            .unwrap()
            .push((source_path.to_string(), target_folder.to_string()));
        Ok(true)
    }
}

/// Queue failing with transport errors for the first `failures` calls
#[derive(Debug)]
pub struct FlakyQueue {
    inner: Arc<dyn Queue>,
    failures: AtomicUsize,
}

impl FlakyQueue {
    pub fn new(inner: Arc<dyn Queue>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }

    pub fn always_failing(inner: Arc<dyn Queue>) -> Self {
        Self::new(inner, usize::MAX)
    }

    fn check(&self) -> store::Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Transport {
                target: self.inner.name().to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Queue for FlakyQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> QueueKind {
        self.inner.kind()
    }

    async fn enqueue(&self, body: &str) -> store::Result<()> {
        self.check()?;
        self.inner.enqueue(body).await
    }

    async fn dequeue_batch(&self) -> store::Result<Vec<Message>> {
        self.check()?;
        self.inner.dequeue_batch().await
    }

    async fn delete(&self, id: &str, pop_token: &str) -> store::Result<()> {
        self.check()?;
        self.inner.delete(id, pop_token).await
    }

    async fn is_empty(&self) -> store::Result<bool> {
        self.check()?;
        self.inner.is_empty().await
    }

    async fn approx_size(&self) -> store::Result<usize> {
        self.check()?;
        self.inner.approx_size().await
    }

    async fn reset(&self) -> store::Result<()> {
        self.check()?;
        self.inner.reset().await
    }
}

/// Set whose membership checks of chosen values fail on the transport
#[derive(Debug)]
pub struct UnreachableMembers {
    inner: store::memory::MemorySet,
    unreachable: HashSet<String>,
}

impl UnreachableMembers {
    pub fn new(name: &str, unreachable: &[&str]) -> Self {
        Self {
            inner: store::memory::MemorySet::new(name),
            unreachable: unreachable.iter().map(|value| value.to_string()).collect(),
        }
    }
}

#[async_trait::async_trait]
impl Set for UnreachableMembers {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn add(&self, value: &str) -> store::Result<bool> {
        self.inner.add(value).await
    }

    async fn is_member(&self, value: &str) -> store::Result<bool> {
        if self.unreachable.contains(value) {
            return Err(StoreError::Transport {
                target: self.inner.name().to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.inner.is_member(value).await
    }

    async fn reset(&self) -> store::Result<()> {
        self.inner.reset().await
    }
}

pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        pause: std::time::Duration::from_millis(1),
    }
}

fn memory_queue(name: &str, kind: QueueKind) -> Arc<dyn Queue> {
    Arc::new(store::memory::MemoryQueue::new(
        name,
        kind,
        &store::QueueOptions::default(),
    ))
}

/// Queue set where every queue fails on the transport, the done set works
pub async fn failing_queue_set(workers: usize) -> anyhow::Result<QueueSet> {
    let wrap = |name: String, kind| {
        Arc::new(WorkQueue::new(
            Arc::new(FlakyQueue::always_failing(memory_queue(&name, kind))),
            quick_retry(),
        ))
    };
    Ok(QueueSet {
        folder_queues: (0..workers)
            .map(|w| wrap(crate::layout::folder_queue_name(w), QueueKind::Standard))
            .collect(),
        file_queues: (0..workers)
            .map(|w| wrap(crate::layout::file_queue_name(w), QueueKind::Standard))
            .collect(),
        large_queue: wrap(
            crate::layout::LARGE_FILES_QUEUE.to_string(),
            QueueKind::Large,
        ),
        done_set: Arc::new(store::memory::MemorySet::new(crate::layout::FOLDER_DONE_SET)),
    })
}

/// Working folder queues, file and large-file queues failing on the transport
pub async fn failing_file_queues(workers: usize) -> anyhow::Result<QueueSet> {
    let working = crate::layout::QueueSet::open(
        &store::memory::MemoryBackend::default(),
        workers,
        quick_retry(),
    )
    .await?;
    let failing = failing_queue_set(workers).await?;
    Ok(QueueSet {
        folder_queues: working.folder_queues,
        file_queues: failing.file_queues,
        large_queue: failing.large_queue,
        done_set: working.done_set,
    })
}
