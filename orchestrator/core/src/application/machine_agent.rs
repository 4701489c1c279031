// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Machine Agent
//!
//! Per-machine reconciliation of desired placement against observed
//! liveness.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Spawns a worker for every service deployed here that has no
//!   live state node
//!
//! `initialize → scan → start_services`, repeatable and idempotent. Desired
//! placement comes from `services/<name>/machines`, observed liveness from
//! `services/<name>/state/<machine-id>`. Workers spawned by this agent that
//! have not published their state node yet count as observed while their
//! process is alive. Every spawned worker stays a tracked child until it has
//! been reaped.

use crate::application::hierarchy::require_initialized;
use crate::application::store_ops::ensure_node;
use crate::domain::errors::PopResult;
use crate::domain::namespace::Namespace;
use crate::domain::process::{ProcessControl, Spawn};
use crate::domain::settings::decode_list;
use crate::domain::store::{CoordinationStore, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a reconciliation round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    /// Still the agent. From a round, the worker pids it spawned; from
    /// [`MachineAgent::run`], the workers still running.
    Spawned(Vec<u32>),
    /// This process is now the worker for the named service and must not
    /// resume agent duties.
    Worker(String),
}

pub struct MachineAgent {
    store: Arc<dyn CoordinationStore>,
    namespace: Namespace,
    machine_id: String,
    process: Arc<dyn ProcessControl>,
    stopped: BTreeSet<String>,
    /// Spawned workers that have not been observed yet, by service.
    pending: BTreeMap<String, u32>,
    /// Every spawned worker not reaped yet.
    children: BTreeSet<u32>,
}

impl MachineAgent {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: Namespace,
        machine_id: impl Into<String>,
        process: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            store,
            namespace,
            machine_id: machine_id.into(),
            process,
            stopped: BTreeSet::new(),
            pending: BTreeMap::new(),
            children: BTreeSet::new(),
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Services found stopped by the last `scan`, not yet started.
    pub fn stopped(&self) -> &BTreeSet<String> {
        &self.stopped
    }

    /// Spawned workers that have not been reaped yet.
    pub fn children(&self) -> &BTreeSet<u32> {
        &self.children
    }

    /// Ensure `machines/<id>` and `machines/<id>/services` exist.
    pub async fn initialize(&self) -> PopResult<()> {
        let store = self.store.as_ref();
        require_initialized(store, &self.namespace).await?;
        ensure_node(store, &self.namespace.machine(&self.machine_id), b"", &[]).await?;
        ensure_node(
            store,
            &self.namespace.machine_services(&self.machine_id),
            b"",
            &[],
        )
        .await?;
        debug!(machine = %self.machine_id, "Machine registered");
        Ok(())
    }

    /// Recompute `stopped = desired − observed`.
    pub async fn scan(&mut self) -> PopResult<BTreeSet<String>> {
        debug!(machine = %self.machine_id, "Scanning machine");
        self.reap_children();
        let store = self.store.as_ref();

        let mut desired = BTreeSet::new();
        for name in store.get_children(&self.namespace.services()).await? {
            let path = self.namespace.service_machines(&name);
            let machines = match store.get(&path).await {
                Ok((data, _)) => decode_list(&path, &data)?,
                Err(StoreError::NoNode(_)) => {
                    warn!(service = %name, "Missing machines declaration for service");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if machines.iter().any(|m| m == &self.machine_id) {
                desired.insert(name);
            } else if machines.is_empty() {
                debug!(service = %name, "Service not configured for any machine");
            }
        }
        debug!(count = desired.len(), "Services configured for this machine");

        let mut observed = BTreeSet::new();
        for name in &desired {
            let state = self.namespace.service_state_for(name, &self.machine_id);
            if store.exists(&state).await?.is_some() {
                observed.insert(name.clone());
            }
        }

        let process = Arc::clone(&self.process);
        self.pending.retain(|name, pid| {
            if observed.contains(name) {
                return false;
            }
            if process.is_alive(*pid) {
                observed.insert(name.clone());
                true
            } else {
                warn!(service = %name, pid = *pid, "Worker exited before registering");
                false
            }
        });

        self.stopped = desired.difference(&observed).cloned().collect();
        if !self.stopped.is_empty() {
            debug!(services = ?self.stopped, "Services not running");
        } else if !observed.is_empty() {
            debug!("All services are up");
        }
        Ok(self.stopped.clone())
    }

    /// Collect exited workers, whether or not they ever registered.
    fn reap_children(&mut self) {
        let process = Arc::clone(&self.process);
        self.children.retain(|&pid| {
            let reaped = process.reap(pid);
            if reaped {
                debug!(pid, "Worker reaped");
            }
            !reaped
        });
    }

    /// Spawn a worker for every service found stopped by the last `scan`.
    ///
    /// Consumes the stopped set, so calling it again without a new `scan`
    /// spawns nothing. A failed spawn is logged and left for the next scan.
    /// Returns [`AgentOutcome::Worker`] as soon as this process turns out to
    /// be a freshly spawned worker.
    pub fn start_services(&mut self) -> PopResult<AgentOutcome> {
        let mut pids = Vec::new();
        for service in std::mem::take(&mut self.stopped) {
            debug!(service = %service, "Starting service");
            match self.process.spawn(&service) {
                Ok(Spawn::Parent { pid }) => {
                    info!(service = %service, pid, "Process started");
                    self.pending.insert(service, pid);
                    self.children.insert(pid);
                    pids.push(pid);
                }
                Ok(Spawn::Worker { service }) => return Ok(AgentOutcome::Worker(service)),
                Err(e) => error!(service = %service, error = %e, "Failed to start service"),
            }
        }
        Ok(AgentOutcome::Spawned(pids))
    }

    /// One `scan` + `start_services` round.
    pub async fn reconcile(&mut self) -> PopResult<AgentOutcome> {
        self.scan().await?;
        self.start_services()
    }

    /// `initialize`, then reconcile every `interval` until `cancel` fires or a
    /// round turns this process into a worker. When stopped, reports the
    /// workers that are still unreaped children.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        interval: Duration,
    ) -> PopResult<AgentOutcome> {
        self.initialize().await?;
        info!(machine = %self.machine_id, interval = ?interval, "Machine agent running");

        let mut spawned = 0;
        loop {
            match self.reconcile().await? {
                AgentOutcome::Worker(service) => return Ok(AgentOutcome::Worker(service)),
                AgentOutcome::Spawned(pids) => spawned += pids.len(),
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.store.closed() => {
                    warn!("Store session ended, stopping machine agent");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        self.reap_children();
        info!(spawned, running = self.children.len(), "Machine agent stopped");
        Ok(AgentOutcome::Spawned(self.children.iter().copied().collect()))
    }
}
