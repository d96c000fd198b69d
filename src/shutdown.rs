use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Tokens cancelled by process termination signals.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignals {
    /// First SIGTERM/SIGINT: stop claiming and drain.
    pub graceful: CancellationToken,
    /// Second signal: abort whatever is still running.
    pub force: CancellationToken,
}

impl ShutdownSignals {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Install a handler that listens for SIGTERM and SIGINT.
///
/// The first signal cancels `graceful`; a second one cancels `force`.
pub fn install_shutdown_handler() -> std::io::Result<ShutdownSignals> {
    let signals = ShutdownSignals::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let handle = signals.clone();
    tokio::spawn(async move {
        for token in [&handle.graceful, &handle.force] {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT");
                }
            }
            if token.is_cancelled() {
                continue;
            }
            token.cancel();
            if handle.force.is_cancelled() {
                tracing::warn!("Second signal received, aborting in-flight work");
            } else {
                tracing::info!("Initiating graceful shutdown");
            }
        }
    });

    Ok(signals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_install_returns_live_tokens() {
        let signals = install_shutdown_handler().unwrap();
        assert!(!signals.graceful.is_cancelled());
        assert!(!signals.force.is_cancelled());
    }
}
