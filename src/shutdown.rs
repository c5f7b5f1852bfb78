use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Token cancelled on the first SIGTERM or SIGINT.
///
/// Both node kinds stop on it: the coordinator stops its control loop, a
/// worker stops accepting jobs and drains the one it is running.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let shutdown = CancellationToken::new();
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        let received = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "Shutdown requested");
        trigger.cancel();
    });

    Ok(shutdown)
}
