// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Termination signal handling for workers and long-running commands.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

/// SIGTERM and SIGINT handlers, installed eagerly so a signal delivered
/// before anyone awaits is not lost.
pub struct TerminationSignals {
    terminate: Signal,
    interrupt: Signal,
}

impl TerminationSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Resolves on the next SIGTERM or SIGINT.
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.terminate.recv() => info!("Received SIGTERM"),
            _ = self.interrupt.recv() => info!("Received SIGINT"),
        }
    }
}
