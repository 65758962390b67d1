pub mod command;
pub mod config;
pub mod control;
pub mod dirs;
pub mod log_output;
pub mod logging;
pub mod maintenance;
pub mod monitor;
pub mod resolver;
pub mod routing;
pub mod schedule;
pub mod shell_command_ext;
pub mod socket;
pub mod state;
