use thiserror::Error;

use std::{fs, io, path::PathBuf};

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

pub const ENV_VAR_HOME: &str = "SPLITROUTE_HOME";
pub const DEFAULT_STATE_DIR_LINUX: &str = "/var/lib/splitroute";
pub const DEFAULT_STATE_DIR_MACOS: &str = "/Library/Application Support/SplitRoute";

/// Returns the path of `file` inside the state directory, creating the directory if needed.
pub fn state_file(file: &str) -> Result<PathBuf, Error> {
    let state_path = get_home();
    let state_file = state_path.join(file);
    tracing::debug!("Using state file: {}", state_file.display());
    fs::create_dir_all(&state_path)?;
    Ok(state_file)
}

fn get_home() -> PathBuf {
    if let Ok(home) = std::env::var(ENV_VAR_HOME) {
        return PathBuf::from(home);
    }

    #[cfg(target_os = "macos")]
    {
        PathBuf::from(DEFAULT_STATE_DIR_MACOS)
    }
    #[cfg(not(target_os = "macos"))]
    {
        PathBuf::from(DEFAULT_STATE_DIR_LINUX)
    }
}
