//! Interrupt handling for SIGTERM and SIGINT.
//!
//! A run is never cancelled mid store call; the signal only decides that the
//! process gives up, releases its lock and exits non-zero.

use std::fmt;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownCoordinator {
    /// Install SIGINT/SIGTERM handlers. Must be called inside a Tokio runtime.
    ///
    /// Handlers are registered immediately, so a signal delivered between
    /// `install` and [`wait_for_signal`](Self::wait_for_signal) is not lost.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for SIGINT or SIGTERM.
    pub async fn wait_for_signal(&mut self) -> ShutdownSignal {
        let received = tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        };

        warn!(event = "signal_received", signal = %received, "Received signal, aborting run");
        received
    }
}
