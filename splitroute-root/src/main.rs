use tokio::fs;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use splitroute_lib::command::{Action, Request};
use splitroute_lib::monitor::{self, Monitor};
use splitroute_lib::resolver::SystemResolver;
use splitroute_lib::routing::{TargetStore, store};
use splitroute_lib::state::RoutingState;
use splitroute_lib::{config, control, dirs, logging, maintenance, socket};

mod cli;
mod routing;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Cancels `cancel` on the first SIGINT, SIGTERM or SIGHUP. A second signal exits immediately.
fn signal_channel(cancel: CancellationToken) -> Result<(), exitcode::ExitCode> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
        tracing::error!(error = ?e, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
        tracing::error!(error = ?e, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|e| {
        tracing::error!(error = ?e, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(_) = sigint.recv() => "SIGINT",
                Some(_) = sigterm.recv() => "SIGTERM",
                Some(_) = sighup.recv() => "SIGHUP",
                else => {
                    tracing::warn!("signal streams closed");
                    break;
                }
            };
            if cancel.is_cancelled() {
                tracing::info!(signal = name, "force shutdown immediately");
                process::exit(exitcode::OK);
            }
            tracing::info!(signal = name, "initiate shutdown");
            cancel.cancel();
        }
    });

    Ok(())
}

async fn socket_listener(socket_path: &Path) -> Result<UnixListener, exitcode::ExitCode> {
    match socket_path.try_exists() {
        Ok(true) => {
            tracing::info!("probing for running instance");
            match socket::process_request_with_timeout(socket_path, &Request::new(Action::Status), PROBE_TIMEOUT)
                .await
            {
                Ok(_) => {
                    tracing::error!("system service is already running - cannot start another instance");
                    return Err(exitcode::TEMPFAIL);
                }
                Err(e) => {
                    tracing::debug!(warn = ?e, "done probing for running instance");
                }
            };
            fs::remove_file(socket_path).await.map_err(|e| {
                tracing::error!(error = ?e, "error removing stale socket file");
                exitcode::IOERR
            })?;
        }
        Ok(false) => (),
        Err(e) => {
            tracing::error!(error = ?e, "error checking socket path");
            return Err(exitcode::IOERR);
        }
    };

    let socket_dir = socket_path.parent().ok_or_else(|| {
        tracing::error!("socket path has no parent");
        exitcode::UNAVAILABLE
    })?;
    fs::create_dir_all(socket_dir).await.map_err(|e| {
        tracing::error!(error = %e, "error creating socket directory");
        exitcode::IOERR
    })?;

    let listener = UnixListener::bind(socket_path).map_err(|e| {
        tracing::error!(error = ?e, "error binding socket");
        exitcode::OSFILE
    })?;

    // update permissions to allow unprivileged access
    fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "error setting socket permissions");
            exitcode::NOPERM
        })?;

    Ok(listener)
}

fn targets_path(args: &cli::Cli) -> Result<PathBuf, exitcode::ExitCode> {
    match &args.targets_file {
        Some(path) => Ok(path.clone()),
        None => dirs::state_file(store::DEFAULT_FILE).map_err(|e| {
            tracing::error!(error = %e, "error creating state directory");
            exitcode::CANTCREAT
        }),
    }
}

async fn daemon(args: cli::Cli) -> Result<(), exitcode::ExitCode> {
    // set up signal handler
    let cancel = CancellationToken::new();
    signal_channel(cancel.clone())?;

    let config = config::read(&args.config_path).await.map_err(|e| {
        tracing::error!(error = %e, path = %args.config_path.display(), "error reading configuration");
        exitcode::CONFIG
    })?;
    tracing::info!(
        domains = config.domains.len(),
        cidrs = config.cidrs.len(),
        primary = ?config.primary_keywords,
        secondary = ?config.secondary_keywords,
        "configuration loaded"
    );
    let config = Arc::new(config);
    let store = TargetStore::new(targets_path(&args)?);

    // set up system socket
    let socket_path = args.socket_path.clone();
    let listener = socket_listener(&socket_path).await?;

    let state = Arc::new(RoutingState::default());
    let (handle, inbox) = monitor::channel(state.clone());
    let monitor = Monitor::new(
        config.clone(),
        routing::RouteCommandBackend,
        SystemResolver,
        store,
        state,
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(monitor.run(inbox, cancel.clone()));
    tasks.spawn(control::serve(listener, handle.clone(), cancel.clone()));
    if let Some(schedule) = config.refresh_schedule.clone() {
        tasks.spawn(monitor::run_refresh_schedule(schedule, handle, cancel.clone()));
    }
    match (config.log_truncate_schedule.clone(), args.log_file.clone()) {
        (Some(schedule), Some(log_file)) => {
            tasks.spawn(maintenance::run_log_truncation(schedule, log_file, cancel.clone()));
        }
        (Some(_), None) => tracing::debug!("logging to stdout - log truncation disabled"),
        (None, _) => (),
    }

    let mut res = Ok(());
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = ?e, "task failed");
            cancel.cancel();
            res = Err(exitcode::SOFTWARE);
        }
    }

    let _ = fs::remove_file(&socket_path).await.map_err(|err| {
        tracing::error!(error = ?err, "failed removing socket");
    });
    res
}

#[tokio::main]
async fn main() {
    let args = cli::parse();

    match &args.log_file {
        Some(log_file) => {
            if let Err(e) = logging::setup_log_file(log_file) {
                eprintln!("error opening log file {}: {e}", log_file.display());
                process::exit(exitcode::CANTCREAT);
            }
        }
        None => logging::setup_stdout(),
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    match daemon(args).await {
        Ok(_) => tracing::info!("shutdown complete"),
        Err(exitcode::OK) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}
