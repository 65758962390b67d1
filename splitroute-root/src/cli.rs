use clap::Parser;

use std::path::PathBuf;

use splitroute_lib::{config, logging, socket};

pub const ENV_VAR_TARGETS_FILE: &str = "SPLITROUTE_TARGETS_FILE";

/// SplitRoute system service - routes selected traffic via a tethered uplink while it is connected
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Socket path for communication with this service
    #[arg(
        short,
        long,
        env = socket::ENV_VAR,
        default_value = socket::DEFAULT_PATH
    )]
    pub socket_path: PathBuf,

    /// General configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
        )]
    pub config_path: PathBuf,

    /// Append logs to this file instead of stdout (enables scheduled log truncation)
    #[arg(long, env = logging::ENV_VAR_LOG_FILE)]
    pub log_file: Option<PathBuf>,

    /// Where the routed targets are persisted - defaults to the state directory
    #[arg(long, env = ENV_VAR_TARGETS_FILE)]
    pub targets_file: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
