use clap::{Parser, Subcommand};

use std::net::Ipv4Addr;
use std::path::PathBuf;

use splitroute_lib::command::{Action, Request};
use splitroute_lib::socket;

/// SplitRoute control - query and steer the split routing service
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Specify socket path
    #[arg(
        short,
        long,
        env = socket::ENV_VAR,
        default_value = socket::DEFAULT_PATH
    )]
    pub socket_path: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Query current service status
    #[command()]
    Status {
        /// Format output as json
        #[arg(long)]
        json: bool,
    },

    /// Enable automatic routing on interface changes
    #[command()]
    Enable,

    /// Disable automatic routing, applied routes are cleared on the next check
    #[command()]
    Disable,

    /// Apply routes now regardless of interface state
    #[command()]
    Apply,

    /// Clear routes now and disable automatic routing
    #[command()]
    Clear,

    /// Clear and reapply routes
    #[command()]
    Restart,

    /// Re-resolve configured domains if routes are applied
    #[command()]
    Refresh,

    /// Route a single address via the secondary uplink
    #[command()]
    AddRoute {
        /// IPv4 address to route
        ip: Ipv4Addr,
    },
}

impl Command {
    pub fn json(&self) -> bool {
        matches!(self, Command::Status { json: true })
    }
}

impl From<&Command> for Request {
    fn from(cmd: &Command) -> Self {
        match cmd {
            Command::Status { .. } => Request::new(Action::Status),
            Command::Enable => Request::new(Action::Enable),
            Command::Disable => Request::new(Action::Disable),
            Command::Apply => Request::new(Action::Apply),
            Command::Clear => Request::new(Action::Clear),
            Command::Restart => Request::new(Action::Restart),
            Command::Refresh => Request::new(Action::Refresh),
            Command::AddRoute { ip } => Request::new(Action::AddRoute).with_param("ip", ip.to_string()),
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
