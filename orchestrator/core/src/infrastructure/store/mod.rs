// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Coordination store adapters: the in-process tree, its TCP server and the
//! matching client.

pub mod memory;
pub mod protocol;
pub mod remote;
pub mod server;

pub use memory::{InMemoryStore, MemorySession};
pub use remote::RemoteStore;
pub use server::StoreServer;
