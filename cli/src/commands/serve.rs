// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `pop serve`

use super::{block_on, CommandContext};
use anyhow::{Context, Result};
use pop_core::infrastructure::store::{InMemoryStore, StoreServer};
use pop_core::infrastructure::TerminationSignals;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve a fresh in-memory store until SIGTERM/SIGINT.
pub fn run(ctx: &CommandContext, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| ctx.config.store.address());
    block_on(async move {
        let server = StoreServer::bind(bind.as_str(), InMemoryStore::new())
            .await
            .with_context(|| format!("Failed to bind {}", bind))?;
        let mut signals = TerminationSignals::install().context("Failed to install signal handlers")?;

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            signals.recv().await;
            stopper.cancel();
        });

        server.serve(shutdown).await.context("Store server failed")?;
        info!("Store server stopped");
        Ok(())
    })
}
