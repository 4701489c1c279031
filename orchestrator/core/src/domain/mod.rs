// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Types and contracts of the pop orchestrator: the coordination store
//! boundary, namespace layout, settings payloads, service plugins and process
//! control.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and traits, no I/O

pub mod errors;
pub mod namespace;
pub mod node_config;
pub mod process;
pub mod service;
pub mod settings;
pub mod store;
