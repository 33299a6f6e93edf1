//! Read-only telemetry of the queue depths

use tokio_util::sync::CancellationToken;

use crate::layout::QueueSet;

/// Sampling more often than this only adds load on the queues
pub const MIN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar when stderr is a terminal, text updates otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    #[value(alias = "ProgressBar")]
    ProgressBar,
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

impl ProgressType {
    /// Resolves `Auto` against the terminal attached to stderr
    pub fn resolve(self) -> Self {
        use std::io::IsTerminal;
        match self {
            ProgressType::Auto if std::io::stderr().is_terminal() => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        }
    }
}

/// One sample of every queue depth
///
/// Large-file queue depth is included in the file totals.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub longest_folder_queue: usize,
    pub total_folders: usize,
    pub longest_file_queue: usize,
    pub total_files: usize,
    pub large_files: usize,
    /// Queues whose depth could not be read in this sample
    pub unreadable: usize,
}

impl QueueStats {
    pub fn all_empty(&self) -> bool {
        self.total_folders == 0 && self.total_files == 0 && self.unreadable == 0
    }
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "folders: {} queued (longest queue {}) | files: {} queued (longest queue {}, large {})",
            self.total_folders,
            self.longest_folder_queue,
            self.total_files,
            self.longest_file_queue,
            self.large_files
        )?;
        if self.unreadable > 0 {
            write!(f, " | {} queues unreadable", self.unreadable)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct QueueMonitor {
    queues: QueueSet,
    interval: std::time::Duration,
}

impl QueueMonitor {
    pub fn new(queues: QueueSet, interval: std::time::Duration) -> Self {
        if interval < MIN_INTERVAL {
            tracing::warn!(
                "monitor interval {:?} is below the minimum, using {:?}",
                interval,
                MIN_INTERVAL
            );
        }
        Self {
            queues,
            interval: std::cmp::max(interval, MIN_INTERVAL),
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        self.interval
    }

    /// Reads every queue depth, a queue that cannot be read is counted and skipped
    pub async fn sample(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for queue in &self.queues.folder_queues {
            match queue.outstanding().await {
                Ok(depth) => {
                    stats.longest_folder_queue = std::cmp::max(stats.longest_folder_queue, depth);
                    stats.total_folders += depth;
                }
                Err(error) => {
                    tracing::warn!("cannot read depth of {}: {}", queue.name(), error);
                    stats.unreadable += 1;
                }
            }
        }
        for queue in self
            .queues
            .file_queues
            .iter()
            .chain(std::iter::once(&self.queues.large_queue))
        {
            match queue.outstanding().await {
                Ok(depth) => {
                    stats.longest_file_queue = std::cmp::max(stats.longest_file_queue, depth);
                    stats.total_files += depth;
                    if std::sync::Arc::ptr_eq(queue, &self.queues.large_queue) {
                        stats.large_files = depth;
                    }
                }
                Err(error) => {
                    tracing::warn!("cannot read depth of {}: {}", queue.name(), error);
                    stats.unreadable += 1;
                }
            }
        }
        stats
    }

    fn render(stats: &QueueStats) -> String {
        if stats.all_empty() {
            format!("{stats}\nall queues look empty")
        } else {
            stats.to_string()
        }
    }

    /// Samples every interval and displays the result until cancelled
    pub async fn run(
        &self,
        progress_type: ProgressType,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let bar = match progress_type.resolve() {
            ProgressType::ProgressBar => {
                let bar = indicatif::ProgressBar::new_spinner();
                bar.set_style(
                    indicatif::ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}")?,
                );
                bar.enable_steady_tick(std::time::Duration::from_millis(200));
                Some(bar)
            }
            _ => None,
        };
        loop {
            let stats = self.sample().await;
            tracing::debug!("queue stats: {:?}", stats);
            let text = Self::render(&stats);
            match &bar {
                Some(bar) => bar.set_message(text),
                None => eprintln!("{text}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::workitem::WorkItem;

    #[tokio::test]
    async fn aggregates_longest_and_total() -> anyhow::Result<()> {
        let backend = store::memory::MemoryBackend::default();
        let queues = QueueSet::open(&backend, 3, RetryPolicy::default()).await?;
        for _ in 0..3 {
            queues.folder_queues[1]
                .enqueue(&WorkItem::new("/src/a", "a"))
                .await?;
        }
        queues.folder_queues[2]
            .enqueue(&WorkItem::new("/src/b", "b"))
            .await?;
        queues.file_queues[0]
            .enqueue(&WorkItem::new("/src/a/1", "a"))
            .await?;
        for _ in 0..2 {
            queues
                .large_queue
                .enqueue(&WorkItem::new("/src/a/big", "a"))
                .await?;
        }
        let stats = QueueMonitor::new(queues, MIN_INTERVAL).sample().await;
        assert_eq!(
            stats,
            QueueStats {
                longest_folder_queue: 3,
                total_folders: 4,
                longest_file_queue: 2,
                total_files: 3,
                large_files: 2,
                unreadable: 0,
            }
        );
        assert!(!stats.all_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_queues_do_not_stop_sampling() -> anyhow::Result<()> {
        let queues = crate::testutils::failing_file_queues(2).await?;
        queues.folder_queues[0]
            .enqueue(&WorkItem::new("/src/a", "a"))
            .await?;
        let stats = QueueMonitor::new(queues, MIN_INTERVAL).sample().await;
        assert_eq!(stats.total_folders, 1);
        assert_eq!(stats.unreadable, 3);
        Ok(())
    }

    #[tokio::test]
    async fn empty_queues_are_reported() -> anyhow::Result<()> {
        let backend = store::memory::MemoryBackend::default();
        let queues = QueueSet::open(&backend, 1, RetryPolicy::default()).await?;
        let monitor = QueueMonitor::new(queues, std::time::Duration::from_secs(1));
        assert_eq!(monitor.interval(), MIN_INTERVAL);
        let stats = monitor.sample().await;
        assert!(stats.all_empty());
        assert!(QueueMonitor::render(&stats).ends_with("all queues look empty"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() -> anyhow::Result<()> {
        let backend = store::memory::MemoryBackend::default();
        let queues = QueueSet::open(&backend, 1, RetryPolicy::default()).await?;
        let monitor = QueueMonitor::new(queues, MIN_INTERVAL);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(25)).await;
            stop.cancel();
        });
        monitor.run(ProgressType::TextUpdates, &cancel).await?;
        Ok(())
    }
}
