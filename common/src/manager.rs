//! Queue consumers
//!
//! A [`WorkManager`] is built once per process and shared by every runner of that process. It
//! holds the queues, the router, the done ledger and the source/target capabilities, so runners
//! need nothing but a queue to consume and a cancellation token.
//!
//! # Processing loop
//!
//! [`WorkManager::process_queue`] repeatedly peeks the queue, fetches a batch, dispatches every
//! item and then completes the batch, which deletes only the items that succeeded. Items that
//! failed stay leased and come back after the visibility timeout, which is how copies get retried.
//!
//! When a queue looks empty, folder runners count the miss and cool down, giving other workers
//! time to fill the queue; after `queue_max_retry` consecutive misses the loop reports
//! [`LoopExit::Drained`]. File and large-file runners never drain, they back off and poll again.
//!
//! An unexpected failure while dispatching (enumeration error, store error other than transport
//! exhaustion) ends the loop with [`LoopExit::Aborted`]. Items of the batch that already succeeded
//! are completed first; the failing item is left for redelivery. Malformed messages are left
//! leased as well, the loop aborts once the decodable items of their batch were processed.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::QueueSettings;
use crate::layout::QueueSet;
use crate::ledger::DoneLedger;
use crate::path::{PathSettings, adjust_target_path};
use crate::progress::Progress;
use crate::retry::RetryPolicy;
use crate::router::WorkRouter;
use crate::source::SourceEnumerator;
use crate::target::TargetWriter;
use crate::workitem::WorkItem;
use crate::workqueue::{Batch, WorkQueue};

/// Category of queue a runner consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    Folder,
    File,
    LargeFile,
}

impl std::fmt::Display for QueueRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueRole::Folder => write!(f, "folder"),
            QueueRole::File => write!(f, "file"),
            QueueRole::LargeFile => write!(f, "large-file"),
        }
    }
}

/// Why a processing loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Folder queue stayed empty for `queue_max_retry` fetches
    Drained,
    Cancelled,
    /// An unexpected error ended the loop, the failing item awaits redelivery
    Aborted,
}

/// Settings of one process' runners
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub worker_id: usize,
    pub large_file_size: u64,
    pub queue_max_retry: usize,
    pub folder_cooldown: std::time::Duration,
    pub empty_backoff_min: std::time::Duration,
    pub empty_backoff_max: std::time::Duration,
    pub runner_restart_jitter: std::time::Duration,
    pub retry: RetryPolicy,
    /// Bypass the done set and expand every folder again
    pub full_check: bool,
    pub paths: PathSettings,
}

impl ManagerSettings {
    pub fn new(
        settings: &QueueSettings,
        worker_id: usize,
        full_check: bool,
        paths: PathSettings,
    ) -> Self {
        Self {
            worker_id,
            large_file_size: settings.large_file_size_bytes,
            queue_max_retry: settings.queue_max_retry,
            folder_cooldown: std::time::Duration::from_millis(settings.folder_cooldown_ms),
            empty_backoff_min: std::time::Duration::from_millis(settings.empty_backoff_min_ms),
            empty_backoff_max: std::time::Duration::from_millis(settings.empty_backoff_max_ms),
            runner_restart_jitter: std::time::Duration::from_millis(
                settings.runner_restart_jitter_ms,
            ),
            retry: settings.retry_policy(),
            full_check,
            paths,
        }
    }
}

/// Random duration in `[min, max]`
fn jitter(min: std::time::Duration, max: std::time::Duration) -> std::time::Duration {
    use rand::Rng;
    if max <= min {
        return min;
    }
    let min_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    std::time::Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

/// Sleeps unless cancelled first, returns false on cancellation
async fn pause(cancel: &CancellationToken, duration: std::time::Duration) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Outcome of dispatching a single item
enum Dispatch {
    Done,
    /// Not succeeded, left for redelivery
    Retry,
}

#[derive(Debug)]
pub struct WorkManager {
    queues: QueueSet,
    router: WorkRouter,
    ledger: DoneLedger,
    source: Arc<dyn SourceEnumerator>,
    target: Arc<dyn TargetWriter>,
    settings: ManagerSettings,
    progress: Arc<Progress>,
}

impl WorkManager {
    pub fn new(
        queues: QueueSet,
        source: Arc<dyn SourceEnumerator>,
        target: Arc<dyn TargetWriter>,
        settings: ManagerSettings,
        progress: Arc<Progress>,
    ) -> Self {
        let router = WorkRouter::new(&queues, settings.worker_id, settings.large_file_size);
        let ledger = DoneLedger::new(queues.done_set.clone(), settings.retry);
        Self {
            queues,
            router,
            ledger,
            source,
            target,
            settings,
            progress,
        }
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn router(&self) -> &WorkRouter {
        &self.router
    }

    pub fn ledger(&self) -> &DoneLedger {
        &self.ledger
    }

    pub fn source(&self) -> &dyn SourceEnumerator {
        self.source.as_ref()
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn target_path(&self, source_path: &str) -> String {
        adjust_target_path(source_path, &self.settings.paths)
    }

    fn empty_backoff(&self) -> std::time::Duration {
        jitter(self.settings.empty_backoff_min, self.settings.empty_backoff_max)
    }

    /// Submits a folder unless the done set says it was already expanded
    ///
    /// Returns false if the done set lookup or the submission kept failing on the transport.
    pub async fn submit_folder(&self, source_path: &str) -> anyhow::Result<bool> {
        let already_processed = if self.settings.full_check {
            false
        } else {
            match self.ledger.was_folder_already_processed(source_path).await {
                Ok(done) => done,
                Err(error) if error.is_transient() => {
                    tracing::error!("cannot check whether {:?} is done: {}", source_path, error);
                    self.progress.submissions_failed.inc();
                    return Ok(false);
                }
                Err(error) => {
                    return Err(error).with_context(|| {
                        format!("failed checking whether {source_path:?} is done")
                    });
                }
            }
        };
        if already_processed {
            tracing::debug!("folder {:?} already processed, not submitting", source_path);
            self.progress.folders_skipped.inc();
            return Ok(true);
        }
        let item = WorkItem::new(source_path, &self.target_path(source_path));
        let submitted = self.router.submit_folder(&item).await?;
        if submitted {
            self.progress.folders_submitted.inc();
        } else {
            self.progress.submissions_failed.inc();
        }
        Ok(submitted)
    }

    /// Submits a file into `target_folder`, routing it by size
    ///
    /// A file that vanished since enumeration is skipped. Returns false if the submission kept
    /// failing on the transport.
    pub async fn submit_file(
        &self,
        source_path: &str,
        target_folder: &str,
    ) -> anyhow::Result<bool> {
        let size = match self.source.file_size(source_path).await {
            Ok(size) => size,
            Err(error) => {
                tracing::warn!("skipping file {:?}: {:#}", source_path, error);
                return Ok(true);
            }
        };
        let item = WorkItem::new(source_path, target_folder);
        let (submitted, large) = self.router.submit_sized_file(&item, size).await?;
        if !submitted {
            self.progress.submissions_failed.inc();
        } else if large {
            self.progress.large_files_submitted.inc();
        } else {
            self.progress.files_submitted.inc();
        }
        Ok(submitted)
    }

    async fn dispatch_folder(&self, item: &WorkItem) -> anyhow::Result<Dispatch> {
        let path = item.source_path.as_str();
        let already_processed = if self.settings.full_check {
            false
        } else {
            match self.ledger.was_folder_already_processed(path).await {
                Ok(done) => done,
                Err(error) if error.is_transient() => {
                    tracing::error!("cannot check whether {:?} is done: {}", path, error);
                    return Ok(Dispatch::Retry);
                }
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("failed checking whether {path:?} is done"));
                }
            }
        };
        if already_processed {
            tracing::info!("folder {:?} already processed, skipping", path);
            self.progress.folders_skipped.inc();
        } else {
            match self.target.create_folder(&item.target_path).await {
                Ok(true) => self.progress.folders_created.inc(),
                Ok(false) => tracing::error!("failed creating folder {:?}", &item.target_path),
                Err(error) => {
                    tracing::error!("failed creating folder {:?}: {:#}", &item.target_path, error)
                }
            }
            let folders = self
                .source
                .enumerate_folders(path)
                .await
                .with_context(|| format!("failed enumerating folders of {path:?}"))?;
            let files = self
                .source
                .enumerate_files(path)
                .await
                .with_context(|| format!("failed enumerating files of {path:?}"))?;
            let mut all_submitted = true;
            for folder in &folders {
                all_submitted &= self.submit_folder(folder).await?;
            }
            for file in &files {
                all_submitted &= self.submit_file(file, &item.target_path).await?;
            }
            if !all_submitted {
                tracing::error!(
                    "not all children of {:?} were submitted, leaving it for redelivery",
                    path
                );
                return Ok(Dispatch::Retry);
            }
            tracing::debug!(
                "folder {:?}: submitted {} folders and {} files",
                path,
                folders.len(),
                files.len()
            );
        }
        if !self.ledger.finished_processing_folder(path).await? {
            return Ok(Dispatch::Retry);
        }
        Ok(Dispatch::Done)
    }

    async fn dispatch_file(&self, item: &WorkItem) -> Dispatch {
        match self
            .target
            .copy_file(&item.source_path, &item.target_path)
            .await
        {
            Ok(true) => {
                self.progress.files_copied.inc();
                if let Ok(size) = self.source.file_size(&item.source_path).await {
                    self.progress.bytes_copied.add(size);
                }
                Dispatch::Done
            }
            Ok(false) => {
                tracing::error!(
                    "failed copying {:?} to {:?}",
                    &item.source_path,
                    &item.target_path
                );
                self.progress.copies_failed.inc();
                Dispatch::Retry
            }
            Err(error) => {
                tracing::error!(
                    "failed copying {:?} to {:?}: {:#}",
                    &item.source_path,
                    &item.target_path,
                    error
                );
                self.progress.copies_failed.inc();
                Dispatch::Retry
            }
        }
    }

    async fn dispatch(&self, item: &WorkItem, role: QueueRole) -> anyhow::Result<Dispatch> {
        if item.empty {
            tracing::debug!("dropping empty work item {}", &item.id);
            return Ok(Dispatch::Done);
        }
        match role {
            QueueRole::Folder => self.dispatch_folder(item).await,
            QueueRole::File | QueueRole::LargeFile => Ok(self.dispatch_file(item).await),
        }
    }

    /// Consumes `queue` until it drains, the token is cancelled or an unexpected error occurs
    #[instrument(skip(self, queue, cancel), fields(queue = queue.name()))]
    pub async fn process_queue(
        &self,
        queue: &WorkQueue,
        role: QueueRole,
        cancel: &CancellationToken,
    ) -> anyhow::Result<LoopExit> {
        let max_retry = std::cmp::max(1, self.settings.queue_max_retry);
        let mut retry_count = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(LoopExit::Cancelled);
            }
            let available = match queue.work_available().await {
                Ok(available) => available,
                Err(error) if error.is_transient() => {
                    tracing::error!("cannot peek {}: {}", queue.name(), error);
                    false
                }
                Err(error) => return Err(error).context("failed peeking queue"),
            };
            let batch = if available {
                match queue.fetch().await {
                    Ok(batch) => batch,
                    Err(error) if error.is_transient() => {
                        tracing::error!("cannot fetch from {}: {}", queue.name(), error);
                        Batch::default()
                    }
                    Err(error) => return Err(error).context("failed fetching work"),
                }
            } else {
                Batch::default()
            };
            if !batch.is_empty() {
                retry_count = 0;
                for error in &batch.malformed {
                    tracing::error!("poison message on {}: {}", queue.name(), error);
                }
                let mut items = batch.items;
                let mut aborted = None;
                for item in &mut items {
                    match self.dispatch(item, role).await {
                        Ok(Dispatch::Done) => item.succeeded = true,
                        Ok(Dispatch::Retry) => {}
                        Err(error) => {
                            aborted = Some((item.source_path.clone(), error));
                            break;
                        }
                    }
                }
                queue
                    .complete_work(&items)
                    .await
                    .context("failed completing work")?;
                if let Some((path, error)) = aborted {
                    tracing::error!(
                        "failed processing {:?}, stopping {} runner: {:#}",
                        path,
                        role,
                        error
                    );
                    return Ok(LoopExit::Aborted);
                }
                if !batch.malformed.is_empty() {
                    tracing::error!(
                        "stopping {} runner after {} malformed messages",
                        role,
                        batch.malformed.len()
                    );
                    return Ok(LoopExit::Aborted);
                }
                continue;
            }
            if role == QueueRole::Folder {
                retry_count += 1;
                if retry_count >= max_retry {
                    tracing::info!(
                        "{} looks drained after {} empty fetches",
                        queue.name(),
                        retry_count
                    );
                    return Ok(LoopExit::Drained);
                }
                tracing::debug!(
                    "{} empty ({}/{}), cooling down for {:?}",
                    queue.name(),
                    retry_count,
                    max_retry,
                    self.settings.folder_cooldown
                );
                if !pause(cancel, self.settings.folder_cooldown).await {
                    return Ok(LoopExit::Cancelled);
                }
            }
            if !pause(cancel, self.empty_backoff()).await {
                return Ok(LoopExit::Cancelled);
            }
        }
    }

    /// Consumes a folder queue once, until it drains
    pub async fn run_folder_runner(
        &self,
        queue: &WorkQueue,
        cancel: &CancellationToken,
    ) -> anyhow::Result<LoopExit> {
        tracing::info!("folder runner on {} starting", queue.name());
        let exit = self.process_queue(queue, QueueRole::Folder, cancel).await?;
        tracing::info!("folder runner on {} finished: {:?}", queue.name(), exit);
        Ok(exit)
    }

    /// Consumes a file or large-file queue until cancelled
    ///
    /// After an abort the runner pauses for a random time up to `runner_restart_jitter` and
    /// starts over, so a poison item cannot stop file copies for good.
    pub async fn run_file_runner(
        &self,
        queue: &WorkQueue,
        role: QueueRole,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        tracing::info!("{} runner on {} starting", role, queue.name());
        loop {
            let exit = match self.process_queue(queue, role, cancel).await {
                Ok(exit) => exit,
                Err(error) => {
                    tracing::error!("{} runner on {} failed: {:#}", role, queue.name(), error);
                    LoopExit::Aborted
                }
            };
            if exit == LoopExit::Cancelled {
                tracing::info!("{} runner on {} stopped", role, queue.name());
                return Ok(());
            }
            let delay = jitter(std::time::Duration::ZERO, self.settings.runner_restart_jitter);
            tracing::info!("restarting {} runner on {} in {:?}", role, queue.name(), delay);
            if !pause(cancel, delay).await {
                return Ok(());
            }
        }
    }
}
