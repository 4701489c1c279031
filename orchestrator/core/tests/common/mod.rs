// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use parking_lot::Mutex;
use pop_core::application::hierarchy::initialize;
use pop_core::domain::errors::{PopError, PopResult};
use pop_core::domain::namespace::Namespace;
use pop_core::domain::process::{ProcessControl, Spawn};
use pop_core::domain::store::CoordinationStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Notify;

/// Records spawns and signals instead of touching real processes.
#[derive(Default)]
pub struct FakeProcesses {
    next_pid: Mutex<u32>,
    pub spawned: Mutex<Vec<String>>,
    pub alive: Mutex<BTreeSet<u32>>,
    pub terminated: Mutex<Vec<u32>>,
    pub reaped: Mutex<Vec<u32>>,
    /// Services whose spawn fails.
    pub failing: Mutex<BTreeSet<String>>,
    /// When set, `spawn` behaves as the child side.
    pub become_worker: Mutex<bool>,
    pub on_terminate: Notify,
}

impl FakeProcesses {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: Mutex::new(1000),
            ..Default::default()
        })
    }

    pub fn kill_all(&self) {
        self.alive.lock().clear();
    }
}

impl ProcessControl for FakeProcesses {
    fn spawn(&self, service: &str) -> PopResult<Spawn> {
        if self.failing.lock().contains(service) {
            return Err(PopError::Process(format!("cannot spawn {service}")));
        }
        self.spawned.lock().push(service.to_string());
        if *self.become_worker.lock() {
            return Ok(Spawn::Worker {
                service: service.to_string(),
            });
        }
        let mut next = self.next_pid.lock();
        *next += 1;
        self.alive.lock().insert(*next);
        Ok(Spawn::Parent { pid: *next })
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().contains(&pid)
    }

    fn terminate(&self, pid: u32) -> PopResult<()> {
        self.terminated.lock().push(pid);
        self.on_terminate.notify_one();
        Ok(())
    }

    fn reap(&self, pid: u32) -> bool {
        if self.alive.lock().contains(&pid) {
            return false;
        }
        self.reaped.lock().push(pid);
        true
    }
}

pub async fn initialized(store: &dyn CoordinationStore, prefix: &str) -> Namespace {
    let namespace = Namespace::new(prefix).unwrap();
    initialize(store, &namespace, "admin:admin", false)
        .await
        .unwrap();
    namespace
}
