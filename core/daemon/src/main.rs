//! Lidguard daemon entrypoint.
//!
//! Owns the single `StateController` for this machine and exposes it over a
//! Unix socket. SIGTERM/SIGINT disarm everything and remove the socket before
//! exiting, so a stopped daemon never leaves an alarm or inhibitor behind.

use fs_err as fs;
use std::env;
use std::io::ErrorKind;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lidguard_core::{load_config, GuardConfig, StateController};
use lidguard_daemon_protocol::{Response, SOCKET_FILE};

mod ipc;
mod shutdown;

const ACCEPT_POLL_MS: u64 = 50;
const MAX_ACTIVE_CONNECTIONS: usize = 16;

fn main() {
    init_logging();
    shutdown::install_handlers();

    let config = match load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            GuardConfig::default()
        }
    };
    info!(
        probe = ?config.probe.kind,
        sound = %config.audio.sound_path.display(),
        poll_interval_ms = config.monitor.poll_interval_ms,
        max_failures = config.alarm.max_consecutive_failures,
        "Config loaded"
    );

    let controller = StateController::from_config(&config);
    let swept = controller.sweep_stray_players();
    if swept > 0 {
        warn!(swept, "Stopped alarm players left by a previous run");
    }

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };
    if let Err(err) = listener.set_nonblocking(true) {
        error!(error = %err, "Failed to make daemon socket non-blocking");
        std::process::exit(1);
    }

    info!(path = %socket_path.display(), pid = std::process::id(), "Lidguard daemon started");
    serve(&listener, &controller);

    info!("Shutdown requested; disarming");
    controller.stop();
    if let Err(err) = remove_existing_socket(&socket_path) {
        warn!(error = %err, "Failed to remove daemon socket");
    }
    info!("Lidguard daemon stopped");
}

fn serve(listener: &UnixListener, controller: &StateController) {
    let active = Arc::new(AtomicUsize::new(0));

    while !shutdown::requested() {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
                continue;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
                thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
                continue;
            }
        };

        if let Err(err) = stream.set_nonblocking(false) {
            warn!(error = %err, "Failed to configure daemon connection");
            continue;
        }

        if active.fetch_add(1, Ordering::SeqCst) >= MAX_ACTIVE_CONNECTIONS {
            active.fetch_sub(1, Ordering::SeqCst);
            warn!("Too many active connections; rejecting");
            let mut stream = stream;
            let response = Response::error(
                None,
                "too_many_connections",
                "daemon is busy; retry shortly",
            );
            let _ = ipc::write_response(&mut stream, response);
            continue;
        }

        let controller = controller.clone();
        let active_for_thread = Arc::clone(&active);
        let spawned = thread::Builder::new()
            .name("lidguard-conn".to_string())
            .spawn(move || {
                ipc::handle_connection(stream, &controller);
                active_for_thread.fetch_sub(1, Ordering::SeqCst);
            });
        if let Err(err) = spawned {
            active.fetch_sub(1, Ordering::SeqCst);
            warn!(error = %err, "Failed to spawn connection handler");
        }
    }
    debug!("Accept loop exited");
}

fn init_logging() {
    let debug_enabled = env::var("LIDGUARD_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    let dir = lidguard_core::lidguard_dir().map_err(|err| err.to_string())?;
    Ok(dir.join(SOCKET_FILE))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}
