use std::process::ExitCode;
use std::sync::Arc;

use clap::CommandFactory;

use config::PumpConfig;
use logs_pump::{LogsPump, PumpError};
use runtime::{DockerRuntime, RuntimeError};
use storage::{CheckpointStore, StoreError};

mod cli;
mod config;
mod container;
mod logs_pump;
mod message;
mod pump;
mod runtime;
mod signals;
mod sinks;
mod storage;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("Unable to open checkpoint store: {0}")]
    Store(#[from] StoreError),
    #[error("Unable to connect to the container runtime: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Unable to install signal handlers: {0}")]
    Signals(#[from] std::io::Error),
    #[error(transparent)]
    Pump(#[from] PumpError),
}

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = cli::get_cli_args();
    let Some(host) = args.host.as_deref() else {
        let _ = cli::Args::command().print_help();
        return ExitCode::SUCCESS;
    };

    let config = match PumpConfig::from_args(host, args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Unable to start tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, runtime.handle().clone())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: PumpConfig, rt_handle: tokio::runtime::Handle) -> Result<(), StartupError> {
    log::info!(
        "splunk-pump {} shipping to {}",
        env!("CARGO_PKG_VERSION"),
        config.destination
    );

    let store = CheckpointStore::open(&config.storage_path)?.with_lookback(config.lookback);
    let stats = store.stats()?;
    log::info!(
        "checkpoint store {:?}: {} checkpoints, {} bytes on disk",
        store.path(),
        stats.checkpoints,
        stats.size_on_disk
    );

    let runtime = DockerRuntime::connect(config.docker_host.as_deref())?;
    let pumps = Arc::new(
        LogsPump::new(Arc::new(runtime), Arc::new(store)).with_retry(config.retry),
    );
    pumps.register_sink(sinks::splunk::factory(config.sink.clone()), &config.destination);

    signals::handle_shutdown(Arc::clone(&pumps), rt_handle)?;

    pumps.run(signals::notify_ready).await?;
    Ok(())
}
