//! Idempotency ledger over the folder done set

use std::sync::Arc;

use store::Set;

use crate::retry::RetryPolicy;

/// Records which folders already had their children submitted
///
/// Membership only grows until an explicit reset. There is no lock: two workers racing on the
/// same folder may both enumerate it, the set converges either way.
#[derive(Debug, Clone)]
pub struct DoneLedger {
    set: Arc<dyn Set>,
    retry: RetryPolicy,
}

impl DoneLedger {
    pub fn new(set: Arc<dyn Set>, retry: RetryPolicy) -> Self {
        Self { set, retry }
    }

    pub async fn was_folder_already_processed(&self, path: &str) -> store::Result<bool> {
        let what = format!("lookup of {path:?} in {}", self.set.name());
        self.retry.run(&what, || self.set.is_member(path)).await
    }

    /// Returns whether the folder was recorded, false when the transport kept failing
    pub async fn finished_processing_folder(&self, path: &str) -> store::Result<bool> {
        let what = format!("add of {path:?} to {}", self.set.name());
        match self.retry.run(&what, || self.set.add(path)).await {
            Ok(added) => {
                if !added {
                    tracing::debug!("folder {:?} was already marked done", path);
                }
                Ok(true)
            }
            Err(error) if error.is_transient() => {
                tracing::error!("failed marking folder {:?} done: {}", path, error);
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    pub async fn reset(&self) -> store::Result<()> {
        let what = format!("reset of {}", self.set.name());
        self.retry.run(&what, || self.set.reset()).await
    }
}
