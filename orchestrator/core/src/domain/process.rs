// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Process
//!
//! Process-control boundary used by the machine agent and the registry.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Abstracts worker spawning and signalling behind a trait

use crate::domain::errors::PopResult;

/// Result of duplicating the current process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Spawn {
    /// Still the caller; a worker was created with this pid.
    Parent { pid: u32 },
    /// This process is the new worker and must run `service`, never resuming
    /// the caller's duties.
    Worker { service: String },
}

/// Spawns, checks and signals worker processes.
pub trait ProcessControl: Send + Sync {
    fn spawn(&self, service: &str) -> PopResult<Spawn>;

    /// Reaps the pid if it is a child that has exited.
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask a worker to shut down (SIGTERM).
    fn terminate(&self, pid: u32) -> PopResult<()>;

    /// Collect the exit status of a child without blocking. True once `pid`
    /// is gone and no longer needs reaping.
    fn reap(&self, pid: u32) -> bool;
}
