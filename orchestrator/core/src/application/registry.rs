// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Service Registry
//!
//! Operator-facing operations over the namespace: `add`, `deploy`, `start`,
//! `stop`, `status` and `dump`.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Use cases behind every CLI command except `init` and `agent`
//!
//! `start` runs inside a worker process. It publishes the service's
//! descriptor as an ephemeral `state/<machine-id>` node, so the node lives
//! exactly as long as the worker's session. `stop` signals the worker and
//! waits for that node to disappear.

use crate::application::await_presence::wait_for_absence;
use crate::application::hierarchy::require_initialized;
use crate::application::service_node::ServiceNode;
use crate::domain::errors::{PopError, PopResult};
use crate::domain::namespace::{validate_segment, Namespace};
use crate::domain::process::ProcessControl;
use crate::domain::service::{Service, ServiceCatalog};
use crate::domain::settings::{decode_mapping, decode_value, Change, Descriptor, Settings};
use crate::domain::store::{join_path, CoordinationStore, CreateMode, StoreError};
use crate::infrastructure::signals::TerminationSignals;
use futures::future::BoxFuture;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Output format of `dump`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpFormat {
    #[default]
    Yaml,
    Json,
}

impl FromStr for DumpFormat {
    type Err = PopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(DumpFormat::Yaml),
            "json" => Ok(DumpFormat::Json),
            other => Err(PopError::Usage(format!(
                "unknown dump format '{other}' (expected 'yaml' or 'json')"
            ))),
        }
    }
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub service_type: String,
    /// Desired placement, duplicates included.
    pub machines: Vec<String>,
    /// Machines with a live state node.
    pub running: BTreeSet<String>,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "service: {}", self.name)?;
        writeln!(f, "type: {}", self.service_type)?;
        writeln!(f, "deployed: {}", join_or_none(self.machines.iter()))?;
        write!(f, "running: {}", join_or_none(self.running.iter()))
    }
}

fn join_or_none<'a>(items: impl Iterator<Item = &'a String>) -> String {
    let joined = items.map(String::as_str).collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined
    }
}

pub struct ServiceRegistry {
    store: Arc<dyn CoordinationStore>,
    namespace: Namespace,
    catalog: Arc<ServiceCatalog>,
    process: Arc<dyn ProcessControl>,
    machine_id: String,
}

impl ServiceRegistry {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: Namespace,
        catalog: Arc<ServiceCatalog>,
        process: Arc<dyn ProcessControl>,
        machine_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            namespace,
            catalog,
            process,
            machine_id: machine_id.into(),
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn node(&self, name: &str) -> ServiceNode<'_> {
        ServiceNode::new(self.store.as_ref(), &self.namespace, name)
    }

    /// Register a new service of `service_type`, merge-writing `options`
    /// into its settings.
    pub async fn add(
        &self,
        name: &str,
        service_type: &str,
        options: &Settings,
    ) -> PopResult<Vec<Change>> {
        validate_segment("service", name)?;
        self.catalog.get(service_type)?;
        require_initialized(self.store.as_ref(), &self.namespace).await?;

        let node = self.node(name);
        node.create(service_type).await?;
        if options.is_empty() {
            return Ok(Vec::new());
        }
        node.update_settings(options).await
    }

    /// Append a machine (default: this one) to the service's placement.
    pub async fn deploy(&self, name: &str, machine_id: Option<&str>) -> PopResult<Vec<String>> {
        let machine_id = machine_id.unwrap_or(&self.machine_id);
        validate_segment("machine", machine_id)?;
        let node = self.node(name);
        node.require().await?;
        let machines = node.append_machine(machine_id).await?;
        info!(service = name, machine = machine_id, "Deployed");
        Ok(machines)
    }

    /// Start the service in this process and publish its state node.
    pub async fn start(&self, name: &str) -> PopResult<RunningService> {
        let node = self.node(name);
        node.require().await?;
        let service_type = node.service_type().await?;
        let mut service = self.catalog.instantiate(&service_type)?;
        let settings = node.settings(&service.defaults()).await?;

        let mut descriptor = service.start(&settings).await?;
        descriptor.insert("pid".into(), Value::from(std::process::id()));
        descriptor.insert(
            "started_at".into(),
            Value::from(chrono::Utc::now().to_rfc3339()),
        );

        let signals = match TerminationSignals::install() {
            Ok(signals) => signals,
            Err(e) => {
                stop_quietly(service.as_mut(), name).await;
                return Err(e.into());
            }
        };

        let state_path = self.namespace.service_state_for(name, &self.machine_id);
        let payload = match serde_yaml::to_string(&descriptor) {
            Ok(yaml) => yaml.into_bytes(),
            Err(e) => {
                stop_quietly(service.as_mut(), name).await;
                return Err(PopError::serialization(&state_path, e));
            }
        };
        match self
            .store
            .create(&state_path, &payload, CreateMode::Ephemeral, &[])
            .await
        {
            Ok(_) => {}
            Err(err) => {
                stop_quietly(service.as_mut(), name).await;
                return Err(match err {
                    StoreError::NodeExists(_) => PopError::State(format!(
                        "service '{}' is already running on machine {}",
                        name, self.machine_id
                    )),
                    StoreError::NoNode(_) => {
                        PopError::StateNotFound(self.namespace.service_state(name))
                    }
                    other => other.into(),
                });
            }
        }

        info!(service = name, path = %state_path, "Service started");
        Ok(RunningService {
            name: name.to_string(),
            state_path,
            descriptor,
            service,
            store: Arc::clone(&self.store),
            signals: Some(signals),
        })
    }

    /// Signal this machine's worker for `name` and wait until its state node
    /// is gone. Returns the signalled pid.
    pub async fn stop(&self, name: &str) -> PopResult<u32> {
        let state_dir = self.namespace.service_state(name);
        let state_path = join_path(&state_dir, &self.machine_id);
        let descriptor = match self.store.get(&state_path).await {
            Ok((data, _)) => decode_mapping(&state_path, &data)?,
            Err(StoreError::NoNode(_)) => return Err(PopError::StateNotFound(state_path)),
            Err(e) => return Err(e.into()),
        };
        let pid = descriptor_pid(&descriptor)
            .ok_or_else(|| PopError::State(format!("no pid recorded at {state_path}")))?;

        info!(service = name, pid, "Stopping service");
        self.process.terminate(pid)?;
        wait_for_absence(self.store.as_ref(), &state_dir, &self.machine_id).await?;
        info!(service = name, pid, "Service stopped");
        Ok(pid)
    }

    pub async fn status(&self, name: &str) -> PopResult<ServiceStatus> {
        let node = self.node(name);
        node.require().await?;
        Ok(ServiceStatus {
            name: name.to_string(),
            service_type: node.service_type().await?,
            machines: node.machines().await.or_else(|e| match e {
                PopError::StateNotFound(path) => {
                    warn!(path = %path, "Missing machines declaration");
                    Ok(Vec::new())
                }
                other => Err(other),
            })?,
            running: node.running_machines().await?,
        })
    }

    /// The whole namespace as a nested mapping.
    pub async fn snapshot(&self) -> PopResult<Value> {
        let tree = dump_node(self.store.as_ref(), self.namespace.prefix().to_string()).await?;
        Ok(tree.unwrap_or_else(|| Value::Mapping(Mapping::new())))
    }

    /// Render the whole namespace.
    pub async fn dump(&self, format: DumpFormat) -> PopResult<String> {
        let tree = self.snapshot().await?;
        let prefix = self.namespace.prefix();
        match format {
            DumpFormat::Yaml => {
                serde_yaml::to_string(&tree).map_err(|e| PopError::serialization(prefix, e))
            }
            DumpFormat::Json => serde_json::to_string_pretty(&tree)
                .map(|json| json + "\n")
                .map_err(|e| PopError::serialization(prefix, e)),
        }
    }
}

/// `None` when the node vanished while walking.
fn dump_node(
    store: &dyn CoordinationStore,
    path: String,
) -> BoxFuture<'_, PopResult<Option<Value>>> {
    Box::pin(async move {
        let children = match store.get_children(&path).await {
            Ok(children) => children,
            Err(StoreError::NoNode(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if children.is_empty() {
            return match store.get(&path).await {
                Ok((data, _)) => Ok(Some(decode_value(&path, &data).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&data).into_owned())
                }))),
                Err(StoreError::NoNode(_)) => Ok(None),
                Err(e) => Err(e.into()),
            };
        }
        let mut mapping = Mapping::new();
        for child in children {
            if let Some(value) = dump_node(store, join_path(&path, &child)).await? {
                mapping.insert(Value::String(child), value);
            }
        }
        Ok(Some(Value::Mapping(mapping)))
    })
}

fn descriptor_pid(descriptor: &Descriptor) -> Option<u32> {
    descriptor
        .get("pid")
        .and_then(Value::as_u64)
        .and_then(|pid| u32::try_from(pid).ok())
}

async fn stop_quietly(service: &mut dyn Service, name: &str) {
    if let Err(e) = service.stop().await {
        warn!(service = name, error = %e, "Failed to stop service");
    }
}

/// A service started by [`ServiceRegistry::start`] in this process.
pub struct RunningService {
    name: String,
    state_path: String,
    descriptor: Descriptor,
    service: Box<dyn Service>,
    store: Arc<dyn CoordinationStore>,
    signals: Option<TerminationSignals>,
}

impl fmt::Debug for RunningService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningService")
            .field("name", &self.name)
            .field("state_path", &self.state_path)
            .finish_non_exhaustive()
    }
}

impl RunningService {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn state_path(&self) -> &str {
        &self.state_path
    }

    /// Serve until `shutdown` resolves or the store session ends, then shut
    /// down in order.
    pub async fn run_until<F>(self, shutdown: F) -> PopResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let store = Arc::clone(&self.store);
        tokio::select! {
            _ = shutdown => debug!(service = %self.name, "Shutdown requested"),
            _ = store.closed() => warn!(service = %self.name, "Store session ended"),
        }
        self.shutdown().await
    }

    /// Serve until SIGTERM/SIGINT or session loss.
    pub async fn wait_for_termination(mut self) -> PopResult<()> {
        match self.signals.take() {
            Some(mut signals) => self.run_until(async move { signals.recv().await }).await,
            None => self.run_until(std::future::pending()).await,
        }
    }

    /// Stop the service and remove its state node.
    pub async fn shutdown(mut self) -> PopResult<()> {
        info!(service = %self.name, "Shutting down");
        let stopped = self.service.stop().await;
        match self.store.delete(&self.state_path, None).await {
            Ok(()) | Err(StoreError::NoNode(_)) | Err(StoreError::SessionClosed) => {}
            Err(e) => warn!(path = %self.state_path, error = %e, "Failed to remove state node"),
        }
        stopped
    }
}
