// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `pop agent`
//!
//! The agent runs on a current-thread runtime so that `fork` happens in a
//! single-threaded process. A forked worker leaks the agent and its runtime
//! (dropping them would act on state shared with the parent) and continues
//! on a fresh runtime with its own store session.

use super::{block_on, CommandContext};
use anyhow::{Context, Result};
use pop_core::application::machine_agent::{AgentOutcome, MachineAgent};
use pop_core::domain::store::CoordinationStore;
use pop_core::infrastructure::store::RemoteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub fn run(ctx: &CommandContext, once: bool, interval: Option<u64>) -> Result<()> {
    let interval =
        Duration::from_secs(interval.unwrap_or(ctx.config.agent.reconcile_interval_secs));
    let addrs = ctx.store_addrs()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start agent runtime")?;

    let store: Arc<dyn CoordinationStore> = Arc::new(
        runtime
            .block_on(RemoteStore::connect(&addrs[..]))
            .with_context(|| format!("Failed to connect to store at {}", ctx.config.store.address()))?,
    );
    let mut agent = MachineAgent::new(
        Arc::clone(&store),
        ctx.namespace.clone(),
        ctx.machine_id.clone(),
        Arc::new(ctx.supervisor()),
    );
    info!(machine = %ctx.machine_id, "Starting machine agent");

    // No signal handlers here: tokio's signal state is process-wide and
    // would be shared with forked workers. SIGTERM ends the agent outright.
    let outcome = runtime.block_on(async {
        if once {
            agent.initialize().await?;
            return agent.reconcile().await;
        }
        agent.run(CancellationToken::new(), interval).await
    });

    match outcome? {
        AgentOutcome::Spawned(pids) => {
            if !pids.is_empty() {
                info!(workers = ?pids, "Workers running");
            }
            runtime.block_on(async {
                if let Err(e) = store.close().await {
                    warn!(error = %e, "Failed to close store session");
                }
            });
            Ok(())
        }
        AgentOutcome::Worker(service) => {
            std::mem::forget(agent);
            std::mem::forget(store);
            std::mem::forget(runtime);
            run_worker(ctx, &service)
        }
    }
}

/// Body of a forked worker: run `service` until it is told to stop.
fn run_worker(ctx: &CommandContext, service: &str) -> Result<()> {
    info!(service, pid = std::process::id(), "Worker starting");
    block_on(async {
        let store = ctx.connect().await?;
        let registry = ctx.registry(Arc::clone(&store));
        let running = registry.start(service).await?;
        running.wait_for_termination().await?;
        store.close().await?;
        info!(service, "Worker exiting");
        Ok(())
    })
}
