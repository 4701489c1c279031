// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration file for a pop node:
// - Coordination store endpoint
// - Namespace prefix and admin identity
// - Machine identity override
// - Agent reconciliation and privilege settings

use crate::domain::namespace::Namespace;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub namespace: NamespaceConfig,

    #[serde(default)]
    pub machine: MachineConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

/// Coordination store endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl StoreConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Namespace root; `/` or a single segment such as `/t`
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// `user:password` granted full access by `init`
    #[serde(default = "default_admin_identity")]
    pub admin_identity: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_path_prefix(),
            admin_identity: default_admin_identity(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Overrides machine id detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Machine agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Drop workers to this uid after spawning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    /// Drop workers to this gid after spawning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            uid: None,
            gid: None,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    2181
}

fn default_path_prefix() -> String {
    "/".to_string()
}

fn default_admin_identity() -> String {
    "admin:admin".to_string()
}

fn default_reconcile_interval() -> u64 {
    5
}

impl NodeConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config: NodeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Discover configuration file
    ///
    /// Search order: `POP_CONFIG_PATH`, `./pop-config.yaml`,
    /// `~/.pop/config.yaml`, `/etc/pop/config.yaml`.
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("POP_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./pop-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".pop").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/pop/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::debug!("Loading configuration from explicit path: {:?}", path);
            return Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            });
        }

        if let Some(path) = Self::discover_config() {
            tracing::debug!("Loading configuration from discovered path: {:?}", path);
            return Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            });
        }

        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("POP_HOST") {
            tracing::debug!("Environment override: POP_HOST={}", val);
            self.store.host = val;
        }

        if let Ok(val) = std::env::var("POP_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::debug!("Environment override: POP_PORT={}", port);
                    self.store.port = port;
                }
                Err(_) => {
                    tracing::warn!("Invalid value for POP_PORT: '{}'. Ignoring.", val);
                }
            }
        }

        if let Ok(val) = std::env::var("POP_PATH_PREFIX") {
            tracing::debug!("Environment override: POP_PATH_PREFIX={}", val);
            self.namespace.path_prefix = val;
        }

        if let Ok(val) = std::env::var("POP_MACHINE_ID") {
            if !val.trim().is_empty() {
                tracing::debug!("Environment override: POP_MACHINE_ID={}", val);
                self.machine.id = Some(val.trim().to_string());
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.host.trim().is_empty() {
            anyhow::bail!("store.host cannot be empty");
        }

        Namespace::new(&self.namespace.path_prefix)?;

        if !self.namespace.admin_identity.contains(':') {
            anyhow::bail!(
                "Invalid namespace.admin_identity: expected 'user:password', got '{}'",
                self.namespace.admin_identity
            );
        }

        if let Some(id) = &self.machine.id {
            if id.is_empty() || id.contains('/') {
                anyhow::bail!("Invalid machine.id: '{}'", id);
            }
        }

        if self.agent.reconcile_interval_secs == 0 {
            anyhow::bail!("agent.reconcile_interval_secs must be greater than zero");
        }

        Ok(())
    }

    pub fn namespace(&self) -> anyhow::Result<Namespace> {
        Ok(Namespace::new(&self.namespace.path_prefix)?)
    }
}
