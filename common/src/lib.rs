//! Engine of the distributed copier
//!
//! A source tree is split into work items: folders to expand, files to copy and large files to
//! copy with a longer lease. Items travel through durable queues (see the `store` crate), one
//! folder queue and one file queue per worker plus a single large-file queue. A shared "done"
//! set records which folders already had their children submitted, which makes redelivered
//! folder items harmless.
//!
//! # Components
//!
//! - [`partition`] splits the sorted top-level folders into contiguous per-worker batches
//! - [`router::WorkRouter`] spreads newly discovered work round-robin over the worker queues
//! - [`manager::WorkManager`] is the per-process context running the queue consumer loop
//! - [`ledger::DoneLedger`] wraps the done set
//! - [`reset()`], [`monitor`] and [`orchestrator`] are the operator-facing pieces
//!
//! Every call into the durable structures goes through [`retry::RetryPolicy`], which retries
//! transport errors a bounded number of times with a fixed pause.

pub mod config;
pub mod filter;
pub mod layout;
pub mod ledger;
pub mod manager;
pub mod monitor;
pub mod orchestrator;
pub mod partition;
pub mod path;
pub mod progress;
pub mod reset;
pub mod retry;
pub mod router;
pub mod source;
pub mod target;
pub mod workitem;
pub mod workqueue;

#[cfg(test)]
pub mod testutils;

pub use config::{OutputConfig, QueueSettings, RuntimeConfig};
pub use monitor::ProgressType;
pub use orchestrator::Role;
pub use progress::{Progress, Summary};
pub use reset::reset;

fn init_tracing(output: &OutputConfig) {
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::new(level);
    // a subscriber may already be installed when embedded, keep that one
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_runtime(runtime: &RuntimeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build()
}

/// Sets up logging and the tokio runtime, then runs `func` to completion
///
/// Errors are printed with their full context chain unless `quiet`; the result is printed when
/// `print_summary` or any verbosity is requested. Returns `None` on failure, the caller is
/// expected to exit with a non-zero code.
pub fn run<T, Fut>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<T>
where
    T: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    init_tracing(&output);
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start the tokio runtime: {error}");
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(result) => {
            if output.print_summary || output.verbose > 0 {
                println!("{result}");
            }
            Some(result)
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
