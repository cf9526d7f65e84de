//! Shutdown coordination.
//!
//! One [`Shutdown`] is shared by everything the node runs. Any part can
//! trigger it (a signal, `quit` on the console, an embedding caller) and
//! every task waits on its own [`ShutdownGuard`]. A guard only sees triggers
//! sent after it was created, so tasks get theirs before they are spawned.

use std::fmt;

use tokio::sync::broadcast::{self, error::RecvError};

/// Why the node is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Process signal, by name.
    Signal(&'static str),
    /// `quit` typed on the console.
    ConsoleQuit,
    /// Requested through a [`Shutdown`] handle.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "{}", name),
            Self::ConsoleQuit => write!(f, "console quit"),
            Self::Requested => write!(f, "requested"),
        }
    }
}

/// Cloneable trigger shared by the node's tasks.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<ShutdownReason>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self { tx }
    }

    /// Subscribe a new guard.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard { rx: self.tx.subscribe() }
    }

    /// Wake every guard. Returns how many were listening.
    pub fn trigger(&self, reason: ShutdownReason) -> usize {
        tracing::info!(reason = %reason, "Shutdown triggered");
        self.tx.send(reason).unwrap_or(0)
    }
}

/// Waits for one [`Shutdown`] trigger.
pub struct ShutdownGuard {
    rx: broadcast::Receiver<ShutdownReason>,
}

impl ShutdownGuard {
    /// Wait for a trigger. `None` means every [`Shutdown`] handle is gone,
    /// which also ends the wait.
    pub async fn wait(&mut self) -> Option<ShutdownReason> {
        loop {
            match self.rx.recv().await {
                Ok(reason) => return Some(reason),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM (Ctrl+C off unix).
pub async fn wait_for_signal() -> std::io::Result<ShutdownReason> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        Ok(ShutdownReason::Signal(name))
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(ShutdownReason::Signal("Ctrl+C"))
    }
}
