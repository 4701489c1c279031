// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Service
//!
//! Capability contract for service plugins and the static catalog that maps a
//! service type to its constructor.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Plugin boundary between the registry and concrete services

use crate::domain::errors::{PopError, PopResult};
use crate::domain::settings::{Descriptor, Settings};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A runnable service instance.
///
/// One instance lives inside one worker process. `start` binds whatever the
/// service needs and returns a descriptor (`host`, `port`, ...) that is
/// published as the service's state node.
#[async_trait]
pub trait Service: Send {
    /// Settings applied beneath the stored overrides.
    fn defaults(&self) -> Settings;

    async fn start(&mut self, settings: &Settings) -> PopResult<Descriptor>;

    /// Orderly shutdown. Calling it twice, or before `start`, is a no-op.
    async fn stop(&mut self) -> PopResult<()>;
}

pub type ServiceConstructor = fn() -> Box<dyn Service>;

#[derive(Clone)]
pub struct ServiceType {
    pub name: &'static str,
    pub description: &'static str,
    pub create: ServiceConstructor,
}

impl std::fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceType")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Service type name → constructor. Populated explicitly at startup.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    types: BTreeMap<&'static str, ServiceType>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service_type: ServiceType) -> &mut Self {
        self.types.insert(service_type.name, service_type);
        self
    }

    pub fn with(mut self, service_type: ServiceType) -> Self {
        self.register(service_type);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn get(&self, name: &str) -> PopResult<&ServiceType> {
        self.types
            .get(name)
            .ok_or_else(|| PopError::Service(name.to_string()))
    }

    /// Construct a fresh instance of `name`.
    pub fn instantiate(&self, name: &str) -> PopResult<Box<dyn Service>> {
        Ok((self.get(name)?.create)())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.types.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Service for Noop {
        fn defaults(&self) -> Settings {
            Settings::new()
        }

        async fn start(&mut self, _settings: &Settings) -> PopResult<Descriptor> {
            Ok(Descriptor::new())
        }

        async fn stop(&mut self) -> PopResult<()> {
            Ok(())
        }
    }

    fn noop() -> Box<dyn Service> {
        Box::new(Noop)
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = ServiceCatalog::new().with(ServiceType {
            name: "noop",
            description: "does nothing",
            create: noop,
        });
        assert!(catalog.contains("noop"));
        assert!(catalog.instantiate("noop").is_ok());
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["noop"]);

        let err = catalog.instantiate("missing").err().unwrap();
        assert!(matches!(err, PopError::Service(name) if name == "missing"));
    }
}
