//! Teardown of every shared structure

use crate::layout::QueueSet;
use crate::ledger::DoneLedger;
use crate::retry::RetryPolicy;

/// Clears the done set and purges every queue
///
/// Must only run while no worker is active. Every structure is attempted even if an earlier one
/// failed, failures are logged and reported together.
pub async fn reset(queues: &QueueSet, retry: RetryPolicy) -> anyhow::Result<()> {
    let mut failed = vec![];
    let ledger = DoneLedger::new(queues.done_set.clone(), retry);
    match ledger.reset().await {
        Ok(()) => tracing::info!("cleared {}", queues.done_set.name()),
        Err(error) => {
            tracing::error!("failed clearing {}: {}", queues.done_set.name(), error);
            failed.push(queues.done_set.name().to_string());
        }
    }
    let ordered = queues
        .file_queues
        .iter()
        .chain(std::iter::once(&queues.large_queue))
        .chain(queues.folder_queues.iter());
    for queue in ordered {
        match queue.reset().await {
            Ok(()) => tracing::info!("purged {}", queue.name()),
            Err(error) => {
                tracing::error!("failed purging {}: {}", queue.name(), error);
                failed.push(queue.name().to_string());
            }
        }
    }
    if !failed.is_empty() {
        return Err(anyhow::anyhow!("failed resetting: {}", failed.join(", ")));
    }
    Ok(())
}
