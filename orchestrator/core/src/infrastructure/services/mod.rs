// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Built-in Services
//!
//! Service plugins shipped with pop and the catalog that lists them.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Concrete `Service` implementations

pub mod echo;

use crate::domain::service::ServiceCatalog;

/// Catalog of every built-in service type.
pub fn builtin_catalog() -> ServiceCatalog {
    ServiceCatalog::new()
        .with(echo::ECHO)
        .with(echo::THREADED_ECHO)
}
