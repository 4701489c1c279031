// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application
//!
//! Coordination protocols and use cases built on the store contract.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Orchestrates domain types over a `CoordinationStore`

pub mod await_presence;
pub mod hierarchy;
pub mod machine_agent;
pub mod merge_writer;
pub mod registry;
pub mod service_node;
pub mod store_ops;
