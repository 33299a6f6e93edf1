//! Configuration types for runtime, output and queue settings

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Tunables of the queues and runners
///
/// Read from a JSON settings file, keys are SCREAMING_SNAKE_CASE and every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default, deny_unknown_fields)]
pub struct QueueSettings {
    /// Files strictly larger than this go to the large-file queue
    pub large_file_size_bytes: u64,
    /// Visibility timeout of folder and file queues, in seconds
    pub standard_queue_message_timeout: u64,
    /// Visibility timeout of the large-file queue, in minutes
    pub large_file_copy_timeout: u64,
    /// Consecutive empty fetches after which a folder runner drains
    pub queue_max_retry: usize,
    /// Attempts of every transport call
    pub max_retry: usize,
    pub number_of_messages_to_dequeue: usize,
    /// Pause between transport retries
    pub retry_pause_ms: u64,
    /// Sleep of a folder runner after an empty fetch
    pub folder_cooldown_ms: u64,
    /// Jittered sleep of every runner after an empty fetch
    pub empty_backoff_min_ms: u64,
    pub empty_backoff_max_ms: u64,
    /// Upper bound of the pause before a file runner restarts
    pub runner_restart_jitter_ms: u64,
    /// Poll interval while waiting for the queues to go idle
    pub idle_poll_ms: u64,
    pub redis_connection_string: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            large_file_size_bytes: 64 * 1024 * 1024,
            standard_queue_message_timeout: 300,
            large_file_copy_timeout: 120,
            queue_max_retry: 3,
            max_retry: 5,
            number_of_messages_to_dequeue: 32,
            retry_pause_ms: 10_000,
            folder_cooldown_ms: 60_000,
            empty_backoff_min_ms: 10_000,
            empty_backoff_max_ms: 20_000,
            runner_restart_jitter_ms: 30_000,
            idle_poll_ms: 5_000,
            redis_connection_string: None,
        }
    }
}

impl QueueSettings {
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("invalid settings file: {:?}", path))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let settings: Self = serde_json::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_retry >= 1, "MAX_RETRY must be at least 1");
        anyhow::ensure!(
            self.number_of_messages_to_dequeue >= 1,
            "NUMBER_OF_MESSAGES_TO_DEQUEUE must be at least 1"
        );
        anyhow::ensure!(
            self.empty_backoff_min_ms <= self.empty_backoff_max_ms,
            "EMPTY_BACKOFF_MIN_MS ({}) must not exceed EMPTY_BACKOFF_MAX_MS ({})",
            self.empty_backoff_min_ms,
            self.empty_backoff_max_ms
        );
        Ok(())
    }

    pub fn queue_options(&self) -> store::QueueOptions {
        store::QueueOptions {
            standard_visibility: std::time::Duration::from_secs(
                self.standard_queue_message_timeout,
            ),
            large_visibility: std::time::Duration::from_secs(self.large_file_copy_timeout * 60),
            batch_size: self.number_of_messages_to_dequeue,
        }
    }

    /// How long all-slots mode waits on file queues that stopped shrinking
    ///
    /// Long enough for every stuck message to be delivered `queue_max_retry` times.
    pub fn stall_timeout(&self) -> std::time::Duration {
        let options = self.queue_options();
        let longest = std::cmp::max(options.standard_visibility, options.large_visibility);
        longest * u32::try_from(std::cmp::max(1, self.queue_max_retry)).unwrap_or(u32::MAX)
    }

    pub fn retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_attempts: self.max_retry,
            pause: std::time::Duration::from_millis(self.retry_pause_ms),
        }
    }
}
