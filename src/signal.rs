//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
///
/// If a handler cannot be installed the error is logged and this future
/// falls back to waiting on Ctrl-C alone.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let handlers = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );

    let (mut sigint, mut sigterm, mut sigquit) = match handlers {
        (Ok(i), Ok(t), Ok(q)) => (i, t, q),
        (i, t, q) => {
            let err = [i.err(), t.err(), q.err()].into_iter().flatten().next();
            error!(error = ?err, "Failed to install signal handlers, falling back to Ctrl-C");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
        _ = sigquit.recv() => {
            info!(message = "Signal received.", signal = "SIGQUIT");
        }
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(message = "Signal received.", signal = "ctrl-c"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
    }
}

/// Cancel `shutdown` when a shutdown signal arrives.
pub fn spawn_shutdown_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });
}
