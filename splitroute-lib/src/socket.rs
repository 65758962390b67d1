//! Client side of the control socket.
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time;

use std::io;
use std::path::Path;
use std::time::Duration;

use crate::command::{Action, DEFAULT_TIMEOUT, Request, Response};

pub const DEFAULT_PATH: &str = "/var/run/splitroute.sock";
pub const ENV_VAR: &str = "SPLITROUTE_SOCKET_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("service not running")]
    ServiceNotRunning,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("failed serializing request: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Sends one request and waits for its response.
///
/// The wait is bounded by the action's timeout, see [`Action::timeout`].
pub async fn process_request(socket_path: &Path, req: &Request) -> Result<Response, Error> {
    let timeout = req
        .action
        .parse::<Action>()
        .map(|a| a.timeout())
        .unwrap_or(DEFAULT_TIMEOUT);
    process_request_with_timeout(socket_path, req, timeout).await
}

pub async fn process_request_with_timeout(
    socket_path: &Path,
    req: &Request,
    timeout: Duration,
) -> Result<Response, Error> {
    check_path(socket_path)?;
    time::timeout(timeout, exchange(socket_path, req))
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

async fn exchange(socket_path: &Path, req: &Request) -> Result<Response, Error> {
    let mut stream = UnixStream::connect(socket_path).await.map_err(|e| match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => Error::ServiceNotRunning,
        _ => Error::IO(e),
    })?;

    let json_req = serde_json::to_string(req)?;
    push_request(&mut stream, &json_req).await?;
    let str_resp = pull_response(&mut stream).await?;
    serde_json::from_str::<Response>(&str_resp).map_err(Error::Serialization)
}

fn check_path(socket_path: &Path) -> Result<(), Error> {
    match socket_path.try_exists() {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::ServiceNotRunning),
        Err(x) => Err(x.into()),
    }
}

async fn push_request(socket: &mut UnixStream, json_req: &str) -> Result<(), Error> {
    // flush is not enough to push the request
    // we need to shutdown the write channel to signal the other side that all data was transferred
    socket.write_all(json_req.as_bytes()).await?;
    socket.flush().await?;
    socket.shutdown().await.map_err(Error::from)
}

async fn pull_response(socket: &mut UnixStream) -> Result<String, Error> {
    let mut response = String::new();
    socket
        .read_to_string(&mut response)
        .await
        .map(|_size| response)
        .map_err(Error::from)
}
