//! Server side of the control socket.
//!
//! Each connection carries exactly one request: the client writes a single JSON
//! [`Request`], the server answers with one JSON [`Response`] and closes. The request
//! ends with its closing brace, clients may keep their write half open or shut it down. Status and flag changes are answered from shared state, everything that
//! touches routes is delegated to the monitor loop.
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time;
use tokio_util::sync::CancellationToken;

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::command::{Action, Request, Response};
use crate::monitor::MonitorHandle;

/// Upper bound for receiving a request.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Requests are tiny, anything bigger is not a request.
pub const MAX_REQUEST_SIZE: u64 = 64 * 1024;

const READ_CHUNK_SIZE: usize = 4096;

/// Accepts connections until `cancel` fires, serving each in its own task.
pub async fn serve(listener: UnixListener, handle: MonitorHandle, cancel: CancellationToken) {
    tracing::info!("control plane listening");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("control plane stopping");
                return;
            }
            res = listener.accept() => match res {
                Ok((stream, _addr)) => {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, &handle).await;
                    });
                }
                Err(e) => {
                    tracing::error!(error = ?e, "waiting for incoming connection");
                }
            }
        }
    }
}

pub async fn handle_connection(mut stream: UnixStream, handle: &MonitorHandle) {
    let resp = match read_request(&mut stream).await {
        Ok(req) => process_request(req, handle).await,
        Err(resp) => resp,
    };

    let str_resp = match serde_json::to_string(&resp) {
        Ok(res) => res,
        Err(e) => {
            tracing::error!(error = ?e, "error serializing response");
            return;
        }
    };
    if let Err(e) = stream.write_all(str_resp.as_bytes()).await {
        tracing::error!(error = ?e, "error writing response");
        return;
    }
    if let Err(e) = stream.flush().await {
        tracing::error!(error = ?e, "error flushing stream");
        return;
    }
    if let Err(e) = stream.shutdown().await {
        tracing::debug!(error = ?e, "error closing stream");
    }
}

async fn read_request(stream: &mut UnixStream) -> Result<Request, Response> {
    match time::timeout(READ_TIMEOUT, read_json(stream)).await {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!(timeout = ?READ_TIMEOUT, "timed out reading request");
            Err(Response::failure("Invalid request: timed out reading request"))
        }
    }
}

/// Reads until the first complete JSON value, the end of the stream or [`MAX_REQUEST_SIZE`].
async fn read_json(stream: &mut UnixStream) -> Result<Request, Response> {
    let mut buf = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let size = stream.read(&mut chunk).await.map_err(|e| {
            tracing::warn!(error = ?e, "error reading request");
            Response::failure(format!("Invalid request: {e}"))
        })?;
        let eof = size == 0;
        buf.extend_from_slice(&chunk[..size]);
        if buf.len() as u64 > MAX_REQUEST_SIZE {
            tracing::warn!(size = buf.len(), "request exceeds size limit");
            return Err(Response::failure("Invalid request: request too large"));
        }

        match serde_json::Deserializer::from_slice(&buf).into_iter::<Request>().next() {
            Some(Ok(req)) => return Ok(req),
            // incomplete value, wait for more bytes
            Some(Err(e)) if e.is_eof() && !eof => (),
            None if !eof => (),
            Some(Err(e)) => {
                tracing::warn!(error = %e, msg = %String::from_utf8_lossy(&buf), "error parsing request");
                return Err(Response::failure(format!("Invalid request: {e}")));
            }
            None => {
                tracing::warn!("connection closed without request");
                return Err(Response::failure("Invalid request: empty request"));
            }
        }
    }
}

pub async fn process_request(req: Request, handle: &MonitorHandle) -> Response {
    let action = match req.action.parse::<Action>() {
        Ok(action) => action,
        Err(e) => {
            tracing::warn!(action = %req.action, "unknown action");
            return Response::failure(e.to_string());
        }
    };
    if action == Action::Status {
        tracing::debug!("status request");
    } else {
        tracing::info!(%action, "incoming request");
    }

    match action {
        Action::Status => Response::status(handle.state().snapshot()),
        Action::Enable => {
            handle.state().set_auto_routing(true);
            Response::success("Auto-routing enabled")
        }
        Action::Disable => {
            handle.state().set_auto_routing(false);
            Response::success("Auto-routing disabled")
        }
        Action::Apply => match handle.force_apply().await {
            Ok(()) => Response::success("Routes applied successfully"),
            Err(e) => Response::failure(format!("Failed to apply routes: {e}")),
        },
        Action::Clear => {
            let was_enabled = handle.state().auto_routing_enabled();
            match handle.force_clear().await {
                Ok(()) if was_enabled => Response::success("Routes cleared successfully (auto-routing disabled)"),
                Ok(()) => Response::success("Routes cleared successfully"),
                Err(e) => Response::failure(format!("Failed to clear routes: {e}")),
            }
        }
        Action::Restart => {
            if let Err(e) = handle.force_clear().await {
                return Response::failure(format!("Restart failed at clear: {e}"));
            }
            match handle.force_apply().await {
                Ok(()) => Response::success("Routes restarted successfully"),
                Err(e) => Response::failure(format!("Restart failed at apply: {e}")),
            }
        }
        Action::Refresh => {
            handle.request_refresh();
            Response::success("Refresh triggered")
        }
        Action::AddRoute => {
            let ip = match req.param_str("ip").map(str::parse::<Ipv4Addr>) {
                Some(Ok(ip)) => ip,
                Some(Err(e)) => return Response::failure(format!("Invalid request: ip: {e}")),
                None => return Response::failure("Invalid request: missing parameter ip"),
            };
            match handle.add_dynamic_route(ip).await {
                Ok(true) => Response::success(format!("Route added for {ip}")),
                Ok(false) => Response::success(format!("{ip} is already routed")),
                Err(e) => Response::failure(e.to_string()),
            }
        }
    }
}
