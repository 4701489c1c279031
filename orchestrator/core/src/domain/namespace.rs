// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Namespace
//!
//! Path scheme of the pop namespace inside the coordination store.
//!
//! ```text
//! <prefix>/
//!   machines/<machine-id>/services
//!   services/<name>/type
//!   services/<name>/machines
//!   services/<name>/settings
//!   services/<name>/state/<machine-id>   (ephemeral)
//! ```
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Single source of truth for node paths

use crate::domain::errors::{PopError, PopResult};
use crate::domain::store::join_path;

pub const MACHINES: &str = "machines";
pub const SERVICES: &str = "services";
pub const TYPE: &str = "type";
pub const SETTINGS: &str = "settings";
pub const STATE: &str = "state";

/// Root of a pop namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// Accepts `/`, `/t` and `/t/`. Anything deeper than one segment is
    /// rejected.
    pub fn new(prefix: &str) -> PopResult<Self> {
        let trimmed = prefix.trim();
        if !trimmed.starts_with('/') {
            return Err(PopError::Config(format!(
                "path prefix must be absolute: {prefix:?}"
            )));
        }
        let inner = trimmed.trim_matches('/');
        if inner.is_empty() {
            return Ok(Self {
                prefix: "/".to_string(),
            });
        }
        if inner.contains('/') {
            return Err(PopError::Config(format!(
                "path prefix must be at most one level deep: {prefix:?}"
            )));
        }
        Ok(Self {
            prefix: format!("/{inner}"),
        })
    }

    pub fn root() -> Self {
        Self {
            prefix: "/".to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_root(&self) -> bool {
        self.prefix == "/"
    }

    pub fn machines(&self) -> String {
        join_path(&self.prefix, MACHINES)
    }

    pub fn machine(&self, machine_id: &str) -> String {
        join_path(&self.machines(), machine_id)
    }

    pub fn machine_services(&self, machine_id: &str) -> String {
        join_path(&self.machine(machine_id), SERVICES)
    }

    pub fn services(&self) -> String {
        join_path(&self.prefix, SERVICES)
    }

    pub fn service(&self, name: &str) -> String {
        join_path(&self.services(), name)
    }

    pub fn service_type(&self, name: &str) -> String {
        join_path(&self.service(name), TYPE)
    }

    pub fn service_machines(&self, name: &str) -> String {
        join_path(&self.service(name), MACHINES)
    }

    pub fn service_settings(&self, name: &str) -> String {
        join_path(&self.service(name), SETTINGS)
    }

    pub fn service_state(&self, name: &str) -> String {
        join_path(&self.service(name), STATE)
    }

    pub fn service_state_for(&self, name: &str, machine_id: &str) -> String {
        join_path(&self.service_state(name), machine_id)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::root()
    }
}

/// Service and machine names become single path segments.
pub fn validate_segment(kind: &str, name: &str) -> PopResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(PopError::Usage(format!("invalid {kind} name: {name:?}")));
    }
    Ok(())
}
