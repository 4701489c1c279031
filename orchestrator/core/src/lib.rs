// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Pop Core
//!
//! Coordination protocols, service registry, machine agent and process
//! supervisor of the pop orchestrator, plus the coordination store they run
//! against.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Library entry point

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
