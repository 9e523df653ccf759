use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Ships container stdout/stderr to Splunk.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Splunk TCP input as `host:port`.
    #[arg(short = 'd', long, env = "SP_SPLUNK_HOST")]
    pub host: Option<String>,
    /// Path to an optional config file.
    #[arg(short, long, env = "SP_CONFIG")]
    pub config: Option<PathBuf>,
    /// Path to the checkpoint database. Overrides the config file.
    #[arg(long, env = "SP_STORAGE_PATH")]
    pub storage: Option<PathBuf>,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
