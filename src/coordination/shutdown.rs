//! Shutdown Signalling
//!
//! A watch-channel stop flag shared by every background loop. Triggering it
//! only prevents the next iteration; whatever a loop is doing finishes first.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM / SIGINT
    Signal,
    /// Requested programmatically
    Requested,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Signal => write!(f, "signal"),
            ShutdownReason::Requested => write!(f, "requested"),
        }
    }
}

/// Owner side of the stop flag
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown; repeated requests are ignored
    pub fn trigger(&self, reason: ShutdownReason) {
        if self.is_triggered() {
            warn!("Shutdown already requested, ignoring duplicate: {}", reason);
            return;
        }
        info!("Shutdown requested: {}", reason);
        self.tx.send_replace(Some(reason));
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Token for a background loop
    pub fn token(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Loop side of the stop flag
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&mut self) -> ShutdownReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped; treat as a request
                return ShutdownReason::Requested;
            }
        }
    }
}

/// Trigger `shutdown` on SIGINT/SIGTERM
pub fn install_signal_handlers(shutdown: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for kind in [SignalKind::terminate(), SignalKind::interrupt()] {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                match signal(kind) {
                    Ok(mut stream) => {
                        stream.recv().await;
                        info!("Received termination signal");
                        shutdown.trigger(ShutdownReason::Signal);
                    }
                    Err(e) => error!("Failed to install signal handler: {}", e),
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.trigger(ShutdownReason::Signal);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_observes_trigger() {
        let handle = ShutdownHandle::new();
        let mut token = handle.token();
        assert!(!token.is_triggered());

        handle.trigger(ShutdownReason::Requested);
        assert_eq!(token.wait().await, ShutdownReason::Requested);
        assert!(token.is_triggered());
    }

    #[tokio::test]
    async fn test_token_created_after_trigger() {
        let handle = ShutdownHandle::new();
        handle.trigger(ShutdownReason::Signal);
        handle.trigger(ShutdownReason::Requested);

        let mut token = handle.token();
        assert_eq!(token.wait().await, ShutdownReason::Signal);
    }
}
