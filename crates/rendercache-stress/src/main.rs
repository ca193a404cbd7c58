use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use rendercache_service::config::Config as RenderCacheConfig;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Enable `RUST_BACKTRACE=1`.
    #[arg(long)]
    backtraces: bool,

    /// Enable tracing output, which is written into the void.
    #[arg(long)]
    tracing: bool,

    /// Enable metrics, which are sent to a local sink.
    #[arg(long)]
    metrics: bool,

    /// Log and report metrics as set up in the configuration file.
    ///
    /// This takes precedence over `--backtraces`, `--tracing` and `--metrics`.
    #[arg(long)]
    configured: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            rendercache_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let service_config =
        RenderCacheConfig::get(cli.config.as_deref()).context("failed loading config")?;

    let logging_config = logging::Config {
        backtraces: cli.backtraces,
        tracing: cli.tracing,
        metrics: cli.metrics,
        configured: cli.configured,
    };
    // SAFETY: We are in a single-threaded context, the runtime is not started yet.
    let mut logging_guard = unsafe { logging::init(logging_config, &service_config)? };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let udp_sink = logging_guard.udp_sink.take();
    let result = runtime.block_on(async move {
        if let Some(udp_sink) = udp_sink {
            tokio::spawn(udp_sink);
        }

        perform_stresstest(service_config, workloads, cli.duration).await
    });

    drop(logging_guard);
    result
}
