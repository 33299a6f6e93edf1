//! Bounded retry of operations on durable structures

/// Retries transient failures a fixed number of times with a fixed pause in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: usize,
    pub pause: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            pause: std::time::Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Runs `operation` until it succeeds, fails with a non-transient error or attempts run out
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> store::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = store::Result<T>>,
    {
        let attempts = std::cmp::max(1, self.max_attempts);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt,
                        attempts,
                        self.pause,
                        &error
                    );
                    attempt += 1;
                    tokio::time::sleep(self.pause).await;
                }
                Err(error) => {
                    if error.is_transient() {
                        tracing::error!("{} failed after {} attempts: {}", what, attempts, &error);
                    }
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use store::StoreError;

    fn transport() -> StoreError {
        StoreError::Transport {
            target: "q".to_string(),
            reason: "connection reset".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() -> anyhow::Result<()> {
        let calls = &AtomicUsize::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            pause: std::time::Duration::from_secs(10),
        };
        let started = tokio::time::Instant::now();
        let value = policy
            .run("enqueue", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transport())
                } else {
                    Ok(7)
                }
            })
            .await?;
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), std::time::Duration::from_secs(20));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicUsize::new(0);
        let policy = RetryPolicy {
            max_attempts: 4,
            pause: std::time::Duration::from_millis(5),
        };
        let result: store::Result<()> = policy
            .run("dequeue", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transport())
            })
            .await;
        assert!(matches!(result, Err(ref error) if error.is_transient()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = &AtomicUsize::new(0);
        let result: store::Result<()> = RetryPolicy::default()
            .run("delete", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::StaleReceipt {
                    queue: "q".to_string(),
                    id: "1".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(StoreError::StaleReceipt { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
