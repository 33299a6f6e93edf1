use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dcp",
    version,
    about = "Copy large directory trees with many cooperating workers",
    long_about = "`dcp` copies a directory tree by splitting it into folder, file and large-file work items \
that travel through durable queues. Any number of processes (or hosts, with the Redis backend) \
consume the queues; folders already expanded are recorded in a shared done set so redelivered \
work is harmless.

EXAMPLES:
    # Copy with 4 worker slots in one process, in-process queues
    dcp copy /data/source /mnt/share --workers 4 --summary

    # One slot per host, coordinated through Redis
    dcp --redis redis://queue-host:6379 --workers 8 copy /data/source /mnt/share --worker-id 3

    # Watch queue depths, then clear everything
    dcp --redis redis://queue-host:6379 --workers 8 monitor
    dcp --redis redis://queue-host:6379 --workers 8 reset"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    // Queues
    /// Number of worker slots, each slot owns one folder queue and one file queue
    #[arg(
        short = 'w',
        long,
        default_value = "1",
        value_name = "N",
        global = true,
        help_heading = "Queues"
    )]
    workers: usize,

    /// Redis connection string, in-process queues are used when neither this nor the settings file
    /// provides one
    #[arg(
        long,
        env = "REDIS_CONNECTION_STRING",
        value_name = "URL",
        global = true,
        help_heading = "Queues"
    )]
    redis: Option<String>,

    /// Prefix of every Redis key
    #[arg(
        long,
        default_value = "dcp",
        value_name = "PREFIX",
        global = true,
        help_heading = "Queues"
    )]
    key_prefix: String,

    /// JSON settings file with queue tunables (keys like LARGE_FILE_SIZE_BYTES, MAX_RETRY, ...)
    #[arg(long, value_name = "PATH", global = true, help_heading = "Queues")]
    settings: Option<std::path::PathBuf>,

    /// Attempts of every queue operation failing on the transport (overrides MAX_RETRY)
    #[arg(long, value_name = "N", global = true, help_heading = "Queues")]
    max_retry: Option<usize>,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, global = true, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Submit the source tree and run the copy runners
    Copy(CopyArgs),
    /// Periodically print the depth of every queue until interrupted
    Monitor {
        /// Delay between samples, raised to 10s if lower
        ///
        /// This option accepts a human readable duration, e.g. "10s", "1min" etc.
        #[arg(long, default_value = "10s", value_name = "DELAY")]
        interval: String,

        /// Toggles the type of progress to show
        ///
        /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
        /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
        #[arg(long, value_name = "TYPE")]
        progress_type: Option<common::ProgressType>,
    },
    /// Clear the done set and purge every queue, run only while no worker is active
    Reset,
}

#[derive(clap::Args, Debug, Clone)]
struct CopyArgs {
    // Workers
    /// Run only the runners of this slot, all slots run in this process when not given
    #[arg(long, value_name = "ID", help_heading = "Workers")]
    worker_id: Option<usize>,

    /// Runners to host in slot mode
    #[arg(
        long,
        value_name = "ROLE",
        requires = "worker_id",
        help_heading = "Workers"
    )]
    role: Option<common::Role>,

    /// Number of large-file runners
    #[arg(long, default_value = "1", value_name = "N", help_heading = "Workers")]
    large_file_workers: usize,

    /// Do not submit the top-level folders, continue with the work already queued
    #[arg(long, help_heading = "Workers")]
    resume: bool,

    /// Expand every folder again, even those recorded as done
    #[arg(long, help_heading = "Workers")]
    full_check: bool,

    /// Keep file runners alive once all queues are empty
    #[arg(long, help_heading = "Workers")]
    daemon: bool,

    /// Files larger than this go to the large-file queue (overrides LARGE_FILE_SIZE_BYTES)
    #[arg(long, value_name = "SIZE", help_heading = "Workers")]
    large_file_size: Option<bytesize::ByteSize>,

    // Paths
    /// Folder under the destination root receiving the copy
    #[arg(long, default_value = "", value_name = "PATH", help_heading = "Paths")]
    destination_subfolder: String,

    /// Leading part of source paths dropped from target paths, defaults to the source root
    #[arg(long, value_name = "PATH", help_heading = "Paths")]
    path_to_remove: Option<String>,

    // Filtering
    /// Comma-separated glob patterns of folders to skip
    ///
    /// A leading / anchors the pattern to the source root, other patterns match the folder name
    /// or its path relative to the source root.
    #[arg(long, value_name = "PATTERNS", help_heading = "Filtering")]
    exclude_folders: Option<String>,

    /// Comma-separated glob patterns of files to skip
    #[arg(long, value_name = "PATTERNS", help_heading = "Filtering")]
    exclude_files: Option<String>,

    // Progress
    /// Show queue depths while copying
    #[arg(long, help_heading = "Progress & output")]
    monitor: bool,

    /// Toggles the type of progress to show, implies --monitor
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Delay between queue depth samples, implies --monitor
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    monitor_interval: Option<String>,

    // ARGUMENTS
    /// Source directory
    #[arg()]
    source: std::path::PathBuf,

    /// Destination root directory
    #[arg()]
    destination: std::path::PathBuf,
}

fn load_settings(args: &Args) -> Result<common::QueueSettings> {
    let mut settings = match &args.settings {
        Some(path) => common::QueueSettings::from_file(path)?,
        None => common::QueueSettings::default(),
    };
    if let Some(max_retry) = args.max_retry {
        settings.max_retry = max_retry;
    }
    if let Some(redis) = &args.redis {
        settings.redis_connection_string = Some(redis.clone());
    }
    if let Command::Copy(CopyArgs {
        large_file_size: Some(size),
        ..
    }) = &args.command
    {
        settings.large_file_size_bytes = size.as_u64();
    }
    settings.validate()?;
    Ok(settings)
}

async fn open_queues(
    args: &Args,
    settings: &common::QueueSettings,
) -> Result<common::layout::QueueSet> {
    anyhow::ensure!(args.workers >= 1, "--workers must be at least 1");
    let options = settings.queue_options();
    let backend: Box<dyn store::Backend> = match &settings.redis_connection_string {
        Some(url) => {
            tracing::info!("using redis queues with key prefix {:?}", &args.key_prefix);
            Box::new(
                store::redis_store::RedisBackend::connect(url, &args.key_prefix, options).await?,
            )
        }
        None => {
            tracing::info!("using in-process queues");
            Box::new(store::memory::MemoryBackend::new(options))
        }
    };
    common::layout::QueueSet::open(backend.as_ref(), args.workers, settings.retry_policy()).await
}

fn parse_delay(delay: &str) -> Result<std::time::Duration> {
    humantime::parse_duration(delay).with_context(|| format!("invalid duration {delay:?}"))
}

#[instrument(skip(args, copy))]
async fn run_copy(args: &Args, copy: &CopyArgs) -> Result<common::Summary> {
    let settings = load_settings(args)?;
    if settings.redis_connection_string.is_none() && copy.worker_id.is_some() {
        tracing::warn!("slot mode with in-process queues, other slots will not see this work");
    }
    let source_root = copy
        .source
        .to_str()
        .with_context(|| format!("source path {:?} is not valid UTF-8", &copy.source))?
        .to_string();
    let metadata = tokio::fs::metadata(&copy.source)
        .await
        .with_context(|| format!("cannot read source {:?}", &copy.source))?;
    anyhow::ensure!(
        metadata.is_dir(),
        "source {:?} is not a directory",
        &copy.source
    );
    let folder_filter = match &copy.exclude_folders {
        Some(list) => common::filter::ExcludeFilter::parse_list(list)?,
        None => common::filter::ExcludeFilter::new(),
    };
    let file_filter = match &copy.exclude_files {
        Some(list) => common::filter::ExcludeFilter::parse_list(list)?,
        None => common::filter::ExcludeFilter::new(),
    };
    let queues = open_queues(args, &settings).await?;
    let worker_id = copy.worker_id.unwrap_or(0);
    anyhow::ensure!(
        worker_id < args.workers,
        "--worker-id {} is out of range for {} workers",
        worker_id,
        args.workers
    );
    let paths = common::path::PathSettings {
        destination_subfolder: copy.destination_subfolder.clone(),
        path_to_remove: copy
            .path_to_remove
            .clone()
            .unwrap_or_else(|| source_root.clone()),
    };
    let progress = Arc::new(common::Progress::new());
    let manager = common::manager::WorkManager::new(
        queues,
        Arc::new(common::source::LocalSource::new(
            &copy.source,
            folder_filter,
            file_filter,
        )),
        Arc::new(common::target::FsTarget::new(&copy.destination)),
        common::manager::ManagerSettings::new(&settings, worker_id, copy.full_check, paths),
        progress.clone(),
    );
    let monitor = if copy.monitor || copy.progress_type.is_some() || copy.monitor_interval.is_some()
    {
        Some(common::orchestrator::MonitorSettings {
            progress_type: copy.progress_type.unwrap_or_default(),
            interval: match &copy.monitor_interval {
                Some(delay) => parse_delay(delay)?,
                None => common::monitor::MIN_INTERVAL,
            },
        })
    } else {
        None
    };
    let orchestrator = common::orchestrator::Orchestrator::new(
        Arc::new(manager),
        common::orchestrator::CopySettings {
            source_root,
            large_file_workers: copy.large_file_workers,
            resume: copy.resume,
            daemon: copy.daemon,
            idle_poll: std::time::Duration::from_millis(settings.idle_poll_ms),
            stall_timeout: settings.stall_timeout(),
            monitor,
        },
    );
    let cancel = common::orchestrator::cancel_on_ctrl_c();
    match copy.worker_id {
        Some(worker_id) => {
            orchestrator
                .run_slot(worker_id, copy.role.unwrap_or_default(), &cancel)
                .await?
        }
        None => orchestrator.run_all_slots(&cancel).await?,
    }
    Ok(progress.summary())
}

async fn run_monitor(
    args: &Args,
    interval: &str,
    progress_type: Option<common::ProgressType>,
) -> Result<String> {
    let settings = load_settings(args)?;
    let queues = open_queues(args, &settings).await?;
    let monitor = common::monitor::QueueMonitor::new(queues, parse_delay(interval)?);
    let cancel = common::orchestrator::cancel_on_ctrl_c();
    monitor
        .run(progress_type.unwrap_or_default(), &cancel)
        .await?;
    Ok("monitor stopped".to_string())
}

async fn run_reset(args: &Args) -> Result<String> {
    let settings = load_settings(args)?;
    let queues = open_queues(args, &settings).await?;
    common::reset(&queues, settings.retry_policy()).await?;
    Ok(format!(
        "cleared the done set and the queues of {} workers",
        args.workers
    ))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let succeeded = match args.command.clone() {
        Command::Copy(copy) => common::run(output, runtime, || async move {
            run_copy(&args, &copy).await
        })
        .is_some(),
        Command::Monitor {
            interval,
            progress_type,
        } => common::run(output, runtime, || async move {
            run_monitor(&args, &interval, progress_type).await
        })
        .is_some(),
        Command::Reset => {
            common::run(output, runtime, || async move { run_reset(&args).await }).is_some()
        }
    };
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
