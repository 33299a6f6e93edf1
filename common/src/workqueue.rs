//! Work item view of a durable queue
//!
//! [`WorkQueue`] encodes and decodes [`WorkItem`]s, wraps every transport call in the retry policy
//! and remembers the pop token of each delivery so completed items can be deleted later.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use store::{Queue, QueueKind, StoreError};

use crate::retry::RetryPolicy;
use crate::workitem::WorkItem;

/// One dequeued batch
#[derive(Debug, Default)]
pub struct Batch {
    pub items: Vec<WorkItem>,
    /// Messages whose body did not decode
    pub malformed: Vec<StoreError>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.malformed.is_empty()
    }
}

#[derive(Debug)]
pub struct WorkQueue {
    queue: Arc<dyn Queue>,
    retry: RetryPolicy,
    // message id -> pop token of deliveries not completed yet
    receipts: Mutex<HashMap<String, String>>,
}

impl WorkQueue {
    pub fn new(queue: Arc<dyn Queue>, retry: RetryPolicy) -> Self {
        Self {
            queue,
            retry,
            receipts: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn kind(&self) -> QueueKind {
        self.queue.kind()
    }

    fn receipts(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.receipts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn enqueue(&self, item: &WorkItem) -> store::Result<()> {
        let body = item.encode().map_err(|error| StoreError::Codec {
            queue: self.name().to_string(),
            id: String::new(),
            reason: format!("{error:#}"),
        })?;
        let what = format!("enqueue to {}", self.name());
        self.retry
            .run(&what, || self.queue.enqueue(&body))
            .await
    }

    /// Approximate, other consumers may take the work first
    pub async fn work_available(&self) -> store::Result<bool> {
        let what = format!("peek {}", self.name());
        let empty = self.retry.run(&what, || self.queue.is_empty()).await?;
        Ok(!empty)
    }

    /// Dequeues the next batch, each item carries the message id in [`WorkItem::id`]
    ///
    /// Every body is decoded on its own. Bodies that do not decode are reported in
    /// [`Batch::malformed`] and stay leased until their visibility timeout expires, the other
    /// messages of the batch are returned as usual.
    pub async fn fetch(&self) -> store::Result<Batch> {
        let what = format!("dequeue from {}", self.name());
        let messages = self.retry.run(&what, || self.queue.dequeue_batch()).await?;
        let mut batch = Batch {
            items: Vec::with_capacity(messages.len()),
            malformed: vec![],
        };
        let mut receipts = self.receipts();
        for message in messages {
            let mut item = match WorkItem::decode(&message.body) {
                Ok(item) => item,
                Err(error) => {
                    batch.malformed.push(StoreError::Codec {
                        queue: self.name().to_string(),
                        id: message.id,
                        reason: format!("{error:#}"),
                    });
                    continue;
                }
            };
            item.id = message.id.clone();
            item.succeeded = false;
            receipts.insert(message.id, message.pop_token);
            batch.items.push(item);
        }
        Ok(batch)
    }

    /// Deletes the items marked as succeeded, the others stay for redelivery
    ///
    /// Returns the number of deleted messages. Deliveries that expired in the meantime and deletes
    /// that keep failing on the transport are logged and skipped.
    pub async fn complete_work(&self, items: &[WorkItem]) -> store::Result<usize> {
        let mut deleted = 0;
        for item in items {
            let receipt = self.receipts().remove(&item.id);
            if !item.succeeded {
                tracing::debug!(
                    "leaving {:?} on {} for redelivery",
                    &item.source_path,
                    self.name()
                );
                continue;
            }
            let Some(pop_token) = receipt else {
                tracing::warn!(
                    "no receipt for message {} on {}, cannot delete",
                    &item.id,
                    self.name()
                );
                continue;
            };
            let what = format!("delete from {}", self.name());
            match self
                .retry
                .run(&what, || self.queue.delete(&item.id, &pop_token))
                .await
            {
                Ok(()) => deleted += 1,
                Err(error @ StoreError::StaleReceipt { .. }) => {
                    tracing::warn!("{}, it will be processed again", error);
                }
                Err(error) if error.is_transient() => {
                    tracing::error!("giving up on deleting {:?}: {}", &item.source_path, error);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(deleted)
    }

    /// Approximate number of outstanding messages, visible or in flight
    pub async fn outstanding(&self) -> store::Result<usize> {
        let what = format!("size of {}", self.name());
        self.retry.run(&what, || self.queue.approx_size()).await
    }

    pub async fn reset(&self) -> store::Result<()> {
        let what = format!("reset {}", self.name());
        self.retry.run(&what, || self.queue.reset()).await?;
        self.receipts().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::memory::MemoryQueue;

    fn work_queue(batch_size: usize) -> WorkQueue {
        let options = store::QueueOptions {
            batch_size,
            ..Default::default()
        };
        WorkQueue::new(
            Arc::new(MemoryQueue::new("copy-files-queue-0", QueueKind::Standard, &options)),
            RetryPolicy::default(),
        )
    }

    #[tokio::test]
    async fn only_succeeded_items_are_deleted() -> anyhow::Result<()> {
        let queue = work_queue(8);
        queue.enqueue(&WorkItem::new("/a", "a")).await?;
        queue.enqueue(&WorkItem::new("/b", "b")).await?;
        assert!(queue.work_available().await?);
        let mut items = queue.fetch().await?.items;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| !item.id.is_empty()));
        items[0].succeeded = true;
        assert_eq!(queue.complete_work(&items).await?, 1);
        assert_eq!(queue.outstanding().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_body_is_reported_apart_from_good_items() -> anyhow::Result<()> {
        let inner = Arc::new(MemoryQueue::new(
            "copy-folder-queue-0",
            QueueKind::Standard,
            &store::QueueOptions::default(),
        ));
        let queue = WorkQueue::new(inner.clone(), RetryPolicy::default());
        queue.enqueue(&WorkItem::new("/a", "a")).await?;
        inner.enqueue("{broken").await?;
        queue.enqueue(&WorkItem::new("/b", "b")).await?;
        let mut batch = queue.fetch().await?;
        let paths: Vec<_> = batch.items.iter().map(|item| item.source_path.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/b"]);
        assert_eq!(batch.malformed.len(), 1);
        assert!(matches!(
            batch.malformed[0],
            StoreError::Codec { ref id, .. } if !id.is_empty()
        ));
        for item in &mut batch.items {
            item.succeeded = true;
        }
        assert_eq!(queue.complete_work(&batch.items).await?, 2);
        // only the malformed message is left
        assert_eq!(queue.outstanding().await?, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_receipt_is_skipped() -> anyhow::Result<()> {
        let queue = work_queue(1);
        queue.enqueue(&WorkItem::new("/a", "a")).await?;
        let mut first = queue.fetch().await?.items;
        tokio::time::advance(store::QueueOptions::default().standard_visibility).await;
        // the same message is delivered again with a new receipt, the old one goes stale
        let mut second = queue.fetch().await?.items;
        assert_eq!(first[0].id, second[0].id);
        first[0].succeeded = true;
        second[0].succeeded = true;
        assert_eq!(queue.complete_work(&second).await?, 1);
        assert_eq!(queue.complete_work(&first).await?, 0);
        Ok(())
    }
}
