//! Batch preparation and runner supervision
//!
//! In "all slots" mode one process hosts every runner as a tokio task, in "slot" mode a process
//! hosts only the runners bound to one worker index. Either way runners share one
//! [`WorkManager`] and stop through a [`CancellationToken`].

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::manager::{LoopExit, QueueRole, WorkManager};
use crate::monitor::{ProgressType, QueueMonitor};
use crate::workqueue::WorkQueue;

/// Runners hosted by a slot process
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Folder,
    File,
    LargeFile,
    #[default]
    All,
}

#[derive(Copy, Clone, Debug)]
pub struct MonitorSettings {
    pub progress_type: ProgressType,
    pub interval: std::time::Duration,
}

#[derive(Clone, Debug)]
pub struct CopySettings {
    /// Root of the source tree, its sub-folders are the units of batching
    pub source_root: String,
    pub large_file_workers: usize,
    /// Skip batch preparation, continue from what is already queued
    pub resume: bool,
    /// Keep file runners alive after all queues went idle
    pub daemon: bool,
    pub idle_poll: std::time::Duration,
    /// Give up waiting for the file queues once their depth has not shrunk for this long
    pub stall_timeout: std::time::Duration,
    pub monitor: Option<MonitorSettings>,
}

#[derive(Debug)]
pub struct Orchestrator {
    manager: Arc<WorkManager>,
    settings: CopySettings,
}

/// Token cancelled on Ctrl-C
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("interrupted, stopping runners");
                token.cancel();
            }
            Err(error) => tracing::error!("cannot listen for Ctrl-C: {}", error),
        }
    });
    cancel
}

fn spawn_file_runner(
    tasks: &mut tokio::task::JoinSet<anyhow::Result<()>>,
    manager: &Arc<WorkManager>,
    queue: &Arc<WorkQueue>,
    role: QueueRole,
    cancel: &CancellationToken,
) {
    let manager = manager.clone();
    let queue = queue.clone();
    let cancel = cancel.clone();
    tasks.spawn(async move { manager.run_file_runner(&queue, role, &cancel).await });
}

async fn join_all<T: 'static>(tasks: &mut tokio::task::JoinSet<anyhow::Result<T>>) -> Vec<T> {
    let mut results = vec![];
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(error)) => tracing::error!("runner failed: {:#}", error),
            Err(error) => tracing::error!("runner task failed: {}", error),
        }
    }
    results
}

impl Orchestrator {
    pub fn new(manager: Arc<WorkManager>, settings: CopySettings) -> Self {
        Self { manager, settings }
    }

    pub fn manager(&self) -> &Arc<WorkManager> {
        &self.manager
    }

    /// Submits the top-level folders in the batch of `worker_id`
    ///
    /// Worker 0 also submits the files directly under the root. Returns the number of folders in
    /// the batch.
    #[instrument(skip(self))]
    pub async fn prepare_batch(&self, worker_id: usize) -> anyhow::Result<usize> {
        let root = self.settings.source_root.as_str();
        let mut folders = self
            .manager
            .source()
            .enumerate_folders(root)
            .await
            .with_context(|| format!("failed listing top-level folders of {root:?}"))?;
        folders.sort();
        let worker_count = self.manager.queues().worker_count();
        let range = crate::partition::batch_range(folders.len(), worker_count, worker_id);
        tracing::info!(
            "worker {} of {}: top-level folders {:?} of {}",
            worker_id,
            worker_count,
            range,
            folders.len()
        );
        let batch = &folders[range];
        for folder in batch {
            if !self.manager.submit_folder(folder).await? {
                tracing::error!("failed submitting top-level folder {:?}", folder);
            }
        }
        if worker_id == 0 {
            let files = self
                .manager
                .source()
                .enumerate_files(root)
                .await
                .with_context(|| format!("failed listing files of {root:?}"))?;
            let target = self.manager.target_path(root);
            for file in &files {
                if !self.manager.submit_file(file, &target).await? {
                    tracing::error!("failed submitting root file {:?}", file);
                }
            }
        }
        Ok(batch.len())
    }

    async fn folder_outstanding(&self, queues: &[Arc<WorkQueue>]) -> usize {
        let mut total = 0;
        for queue in queues {
            match queue.outstanding().await {
                Ok(depth) => total += depth,
                Err(error) => tracing::warn!("cannot read depth of {}: {}", queue.name(), error),
            }
        }
        total
    }

    /// Runs folder runners on `queues` until they drain and no folder work is left
    ///
    /// Runners are relaunched while folder work reappears, but only for as long as the
    /// outstanding count keeps shrinking within `queue_max_retry` rounds.
    async fn run_folder_runners(
        &self,
        queues: &[Arc<WorkQueue>],
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let max_stalled = std::cmp::max(1, self.manager.settings().queue_max_retry);
        let mut stalled = 0;
        let mut previous = usize::MAX;
        loop {
            let mut tasks = tokio::task::JoinSet::new();
            for queue in queues {
                let manager = self.manager.clone();
                let queue = queue.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move { manager.run_folder_runner(&queue, &cancel).await });
            }
            let exits = join_all(&mut tasks).await;
            if cancel.is_cancelled() || exits.contains(&LoopExit::Cancelled) {
                return Ok(());
            }
            let outstanding = self.folder_outstanding(queues).await;
            if outstanding == 0 {
                tracing::info!("folder queues are empty");
                return Ok(());
            }
            if outstanding < previous {
                stalled = 0;
            } else {
                stalled += 1;
            }
            if stalled >= max_stalled {
                return Err(anyhow::anyhow!(
                    "{outstanding} folder items are stuck, giving up relaunching folder runners"
                ));
            }
            previous = outstanding;
            tracing::info!("{} folder items reappeared, relaunching folder runners", outstanding);
        }
    }

    /// Waits until the file queues report zero outstanding messages
    ///
    /// Returns false if cancelled, fails once the depth has not shrunk for `stall_timeout`.
    async fn wait_idle(&self, cancel: &CancellationToken) -> anyhow::Result<bool> {
        let queues = self.manager.queues();
        let mut lowest = usize::MAX;
        let mut last_progress = tokio::time::Instant::now();
        loop {
            let mut outstanding = 0;
            for queue in queues.file_queues.iter().chain([&queues.large_queue]) {
                match queue.outstanding().await {
                    Ok(depth) => outstanding += depth,
                    Err(error) => {
                        tracing::warn!("cannot read depth of {}: {}", queue.name(), error);
                        outstanding += 1;
                    }
                }
            }
            if outstanding == 0 {
                return Ok(true);
            }
            if outstanding < lowest {
                lowest = outstanding;
                last_progress = tokio::time::Instant::now();
            } else if last_progress.elapsed() >= self.settings.stall_timeout {
                return Err(anyhow::anyhow!(
                    "{outstanding} file items made no progress for {:?}, giving up",
                    self.settings.stall_timeout
                ));
            }
            tracing::debug!("{} messages outstanding", outstanding);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.settings.idle_poll) => {}
            }
        }
    }

    /// Hosts every runner of every slot in this process
    #[instrument(skip(self, cancel))]
    pub async fn run_all_slots(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let queues = self.manager.queues().clone();
        if self.settings.resume {
            tracing::info!("resuming, not submitting top-level folders");
        } else {
            for worker_id in 0..queues.worker_count() {
                self.prepare_batch(worker_id).await?;
            }
        }
        let runners_cancel = cancel.child_token();
        let mut tasks = tokio::task::JoinSet::new();
        for queue in &queues.file_queues {
            spawn_file_runner(&mut tasks, &self.manager, queue, QueueRole::File, &runners_cancel);
        }
        for _ in 0..self.settings.large_file_workers {
            spawn_file_runner(
                &mut tasks,
                &self.manager,
                &queues.large_queue,
                QueueRole::LargeFile,
                &runners_cancel,
            );
        }
        if let Some(monitor) = self.settings.monitor {
            let queue_monitor = QueueMonitor::new(queues.clone(), monitor.interval);
            let cancel = runners_cancel.clone();
            tasks.spawn(async move { queue_monitor.run(monitor.progress_type, &cancel).await });
        }
        let outcome = match self.run_folder_runners(&queues.folder_queues, cancel).await {
            Err(error) => Err(error),
            Ok(()) if self.settings.daemon => {
                tracing::info!("folder work done, file runners keep running until interrupted");
                cancel.cancelled().await;
                Ok(())
            }
            Ok(()) => match self.wait_idle(cancel).await {
                Ok(true) => {
                    tracing::info!("all queues are empty, stopping runners");
                    Ok(())
                }
                Ok(false) => Ok(()),
                Err(error) => Err(error),
            },
        };
        if let Err(error) = &outcome {
            tracing::error!("{:#}, stopping runners", error);
        }
        runners_cancel.cancel();
        join_all(&mut tasks).await;
        outcome
    }

    /// Hosts the runners of slot `worker_id` for `role`
    #[instrument(skip(self, cancel))]
    pub async fn run_slot(
        &self,
        worker_id: usize,
        role: Role,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let queues = self.manager.queues().clone();
        let folder_queue = queues.folder_queue(worker_id)?.clone();
        let file_queue = queues.file_queue(worker_id)?.clone();
        let runs_folders = matches!(role, Role::Folder | Role::All);
        if runs_folders && !self.settings.resume {
            self.prepare_batch(worker_id).await?;
        }
        let mut tasks = tokio::task::JoinSet::new();
        if matches!(role, Role::File | Role::All) {
            spawn_file_runner(&mut tasks, &self.manager, &file_queue, QueueRole::File, cancel);
        }
        if role == Role::LargeFile || (role == Role::All && worker_id == 0) {
            for _ in 0..std::cmp::max(1, self.settings.large_file_workers) {
                spawn_file_runner(
                    &mut tasks,
                    &self.manager,
                    &queues.large_queue,
                    QueueRole::LargeFile,
                    cancel,
                );
            }
        }
        let folders = if runs_folders {
            self.run_folder_runners(std::slice::from_ref(&folder_queue), cancel)
                .await
        } else {
            Ok(())
        };
        if !tasks.is_empty() {
            tracing::info!("file runners of slot {} keep running until interrupted", worker_id);
        }
        join_all(&mut tasks).await;
        folders
    }
}
