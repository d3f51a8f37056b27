//! Process lifecycle: service manager notifications and shutdown signals.

use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Ready,
    Stopping,
}

#[cfg(target_os = "linux")]
pub fn notify_service_manager(state: Lifecycle) {
    use libsystemd::daemon::{NotifyState, notify};

    let notify_state = match state {
        Lifecycle::Ready => NotifyState::Ready,
        Lifecycle::Stopping => NotifyState::Stopping,
    };
    match notify(false, &[notify_state]) {
        Ok(true) => debug!(?state, "notified systemd"),
        Ok(false) => debug!(?state, "no NOTIFY_SOCKET, systemd notification skipped"),
        Err(e) => error!(?state, error = %e, "failed to notify systemd"),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn notify_service_manager(state: Lifecycle) {
    debug!(?state, "service manager notifications unavailable on this platform");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    #[cfg(unix)]
    Terminate,
}

/// Resolve on SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_shutdown() -> ShutdownSignal {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return interrupt().await;
        }
    };

    let signal = tokio::select! {
        s = interrupt() => s,
        _ = sigterm.recv() => ShutdownSignal::Terminate,
    };
    info!(?signal, "shutdown signal received");
    signal
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown() -> ShutdownSignal {
    let signal = interrupt().await;
    info!(?signal, "shutdown signal received");
    signal
}

async fn interrupt() -> ShutdownSignal {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install CTRL+C handler");
        // Without a handler there is nothing to wait for; never resolve.
        std::future::pending::<()>().await;
    }
    ShutdownSignal::Interrupt
}
