//! Termination signal handling for the control plane.
//!
//! SIGTERM and SIGINT resolve [`shutdown_signal`]; the caller then sends a
//! best-effort notification and exits without waiting on session tasks.
use tokio::signal::unix::{signal, SignalKind};

/// Resolves when SIGTERM or SIGINT is received.
///
/// If a handler cannot be installed, that signal is never observed and a
/// warning is logged.
pub async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            None
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGINT handler");
            None
        }
    };

    tokio::select! {
        Some(_) = recv(&mut sigterm) => {
            tracing::info!("received SIGTERM, shutting down");
        }
        Some(_) = recv(&mut sigint) => {
            tracing::info!("received SIGINT, shutting down");
        }
        else => std::future::pending::<()>().await,
    }
}

async fn recv(stream: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match stream {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}
