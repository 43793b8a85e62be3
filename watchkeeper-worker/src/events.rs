//! Translate OS signals into worker events at a single boundary.
//!
//! SIGTERM and SIGINT become [`WorkerEvent::Shutdown`]; SIGUSR1 becomes
//! [`WorkerEvent::ResetFailsafe`]. The work loop only ever sees events.
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    Shutdown,
    ResetFailsafe,
}

/// Install the signal handlers and forward events into `tx` until the receiver is dropped.
pub fn spawn_signal_listener(tx: mpsc::Sender<WorkerEvent>) -> std::io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(_) = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down gracefully");
                    WorkerEvent::Shutdown
                }
                Some(_) = sigint.recv() => {
                    tracing::info!("received SIGINT, shutting down gracefully");
                    WorkerEvent::Shutdown
                }
                Some(_) = sigusr1.recv() => WorkerEvent::ResetFailsafe,
                else => break,
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }))
}
