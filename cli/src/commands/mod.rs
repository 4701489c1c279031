// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the pop CLI

pub mod agent;
pub mod init;
pub mod serve;
pub mod service;

use crate::GlobalArgs;
use anyhow::{Context, Result};
use pop_core::application::registry::ServiceRegistry;
use pop_core::domain::namespace::Namespace;
use pop_core::domain::node_config::NodeConfig;
use pop_core::domain::store::CoordinationStore;
use pop_core::infrastructure::store::RemoteStore;
use pop_core::infrastructure::{builtin_catalog, resolve_machine_id, ProcessSupervisor};
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

/// Configuration resolved from the file, the environment and global flags,
/// in increasing precedence.
pub struct CommandContext {
    pub config: NodeConfig,
    pub namespace: Namespace,
    pub machine_id: String,
    pub force: bool,
}

impl CommandContext {
    pub fn from_args(args: &GlobalArgs) -> Result<Self> {
        let mut config = NodeConfig::load_or_default(args.config.clone())
            .context("Failed to load configuration")?;
        config.apply_env_overrides();

        if let Some(host) = &args.host {
            config.store.host = host.clone();
        }
        if let Some(port) = args.port {
            config.store.port = port;
        }
        if let Some(prefix) = &args.path_prefix {
            config.namespace.path_prefix = prefix.clone();
        }
        if let Some(id) = &args.machine_id {
            config.machine.id = Some(id.clone());
        }
        config.validate().context("Invalid configuration")?;

        let namespace = config.namespace()?;
        let machine_id = resolve_machine_id(config.machine.id.as_deref());
        Ok(Self {
            config,
            namespace,
            machine_id,
            force: args.force,
        })
    }

    /// Store address, resolved without touching the async runtime.
    pub fn store_addrs(&self) -> Result<Vec<SocketAddr>> {
        let address = self.config.store.address();
        let addrs: Vec<SocketAddr> = address
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve store address {}", address))?
            .collect();
        anyhow::ensure!(!addrs.is_empty(), "Store address {} resolved to nothing", address);
        Ok(addrs)
    }

    /// Open a new store session.
    pub async fn connect(&self) -> Result<Arc<dyn CoordinationStore>> {
        let addrs = self.store_addrs()?;
        let store = RemoteStore::connect(&addrs[..]).await.with_context(|| {
            format!("Failed to connect to store at {}", self.config.store.address())
        })?;
        Ok(Arc::new(store))
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new().with_privileges(self.config.agent.uid, self.config.agent.gid)
    }

    pub fn registry(&self, store: Arc<dyn CoordinationStore>) -> ServiceRegistry {
        ServiceRegistry::new(
            store,
            self.namespace.clone(),
            Arc::new(builtin_catalog()),
            Arc::new(self.supervisor()),
            self.machine_id.clone(),
        )
    }
}

/// Run `task` on a fresh multi-threaded runtime.
pub fn block_on<F, T>(task: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(task)
}

/// Connect, run `op` against a registry, and close the session.
pub fn with_registry<T, F, Fut>(ctx: &CommandContext, op: F) -> Result<T>
where
    F: FnOnce(ServiceRegistry) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    block_on(async {
        let store = ctx.connect().await?;
        let result = op(ctx.registry(Arc::clone(&store))).await;
        store.close().await?;
        result
    })
}
