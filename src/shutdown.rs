use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Shutdown state shared between the signal adapter and the main loop.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    interrupted: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The operator interrupted the process (SIGINT).
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn interrupt(&self) {
        eprintln!("Killing/Dying");
        self.interrupted.store(true, Ordering::SeqCst);
        self.token.cancel();
    }
}

/// Install the signal adapter.
///
/// SIGTERM and SIGHUP both request a graceful shutdown. SIGINT does the same
/// but is remembered, so the caller can exit with the interrupt status.
pub fn install_shutdown_handler() -> std::io::Result<Shutdown> {
    let shutdown = Shutdown::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let handle = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                handle.token.cancel();
            }
            _ = sighup.recv() => {
                tracing::info!("Received SIGHUP, initiating graceful shutdown");
                handle.token.cancel();
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down");
                handle.interrupt();
            }
        }
    });

    Ok(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_cancels_and_is_remembered() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        assert!(!shutdown.interrupted());

        shutdown.interrupt();
        assert!(token.is_cancelled());
        assert!(shutdown.interrupted());
    }

    #[tokio::test]
    async fn test_handler_installs_inside_runtime() {
        let shutdown = install_shutdown_handler().unwrap();
        assert!(!shutdown.token().is_cancelled());
    }
}
