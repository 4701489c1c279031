// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Machine agent reconciliation against a fake process table.

mod common;

use common::{initialized, FakeProcesses};
use pop_core::application::machine_agent::{AgentOutcome, MachineAgent};
use pop_core::application::service_node::ServiceNode;
use pop_core::domain::namespace::Namespace;
use pop_core::domain::store::{CoordinationStore, CreateMode};
use pop_core::infrastructure::store::InMemoryStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MACHINE: &str = "m1";

async fn deploy(store: &dyn CoordinationStore, namespace: &Namespace, name: &str, machines: &[&str]) {
    let node = ServiceNode::new(store, namespace, name);
    node.create("echo").await.unwrap();
    for machine in machines {
        node.append_machine(machine).await.unwrap();
    }
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

async fn agent_fixture() -> (
    InMemoryStore,
    Arc<dyn CoordinationStore>,
    Namespace,
    Arc<FakeProcesses>,
    MachineAgent,
) {
    let store = InMemoryStore::new();
    let session: Arc<dyn CoordinationStore> = Arc::new(store.connect());
    let namespace = initialized(session.as_ref(), "/").await;
    let processes = FakeProcesses::new();
    let agent = MachineAgent::new(
        Arc::clone(&session),
        namespace.clone(),
        MACHINE,
        processes.clone(),
    );
    (store, session, namespace, processes, agent)
}

#[tokio::test]
async fn test_initialize_registers_machine() {
    let (_store, session, _ns, _processes, agent) = agent_fixture().await;
    agent.initialize().await.unwrap();
    agent.initialize().await.unwrap();
    assert!(session
        .exists("/machines/m1/services")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_initialize_requires_hierarchy() {
    let store = InMemoryStore::new();
    let session: Arc<dyn CoordinationStore> = Arc::new(store.connect());
    let agent = MachineAgent::new(
        session,
        Namespace::root(),
        MACHINE,
        FakeProcesses::new(),
    );
    assert!(agent.initialize().await.unwrap_err().is_state_error());
}

#[tokio::test]
async fn test_scan_selects_only_local_stopped_services() {
    let (_store, session, ns, _processes, mut agent) = agent_fixture().await;
    deploy(session.as_ref(), &ns, "a", &[MACHINE]).await;
    deploy(session.as_ref(), &ns, "b", &["m2"]).await;
    deploy(session.as_ref(), &ns, "c", &["m2", MACHINE]).await;
    deploy(session.as_ref(), &ns, "d", &[]).await;
    deploy(session.as_ref(), &ns, "running", &[MACHINE]).await;
    session
        .create(
            &ns.service_state_for("running", MACHINE),
            b"pid: 1\n",
            CreateMode::Ephemeral,
            &[],
        )
        .await
        .unwrap();

    agent.initialize().await.unwrap();
    assert_eq!(agent.scan().await.unwrap(), set(&["a", "c"]));
    assert_eq!(agent.stopped(), &set(&["a", "c"]));
}

#[tokio::test]
async fn test_missing_machines_node_is_skipped() {
    let (_store, session, ns, processes, mut agent) = agent_fixture().await;
    deploy(session.as_ref(), &ns, "broken", &[MACHINE]).await;
    deploy(session.as_ref(), &ns, "ok", &[MACHINE]).await;
    session
        .delete(&ns.service_machines("broken"), None)
        .await
        .unwrap();

    agent.initialize().await.unwrap();
    let outcome = agent.reconcile().await.unwrap();
    assert!(matches!(outcome, AgentOutcome::Spawned(pids) if pids.len() == 1));
    assert_eq!(*processes.spawned.lock(), vec!["ok"]);
}

#[tokio::test]
async fn test_reconcile_spawns_once_while_worker_lives() {
    let (_store, session, ns, processes, mut agent) = agent_fixture().await;
    deploy(session.as_ref(), &ns, "echo", &[MACHINE]).await;
    agent.initialize().await.unwrap();

    assert!(matches!(
        agent.reconcile().await.unwrap(),
        AgentOutcome::Spawned(pids) if pids.len() == 1
    ));
    assert_eq!(
        agent.reconcile().await.unwrap(),
        AgentOutcome::Spawned(Vec::new())
    );
    assert_eq!(processes.spawned.lock().len(), 1);

    // Worker died before publishing its state node.
    processes.kill_all();
    assert!(matches!(
        agent.reconcile().await.unwrap(),
        AgentOutcome::Spawned(pids) if pids.len() == 1
    ));
    assert_eq!(processes.spawned.lock().len(), 2);
}

#[tokio::test]
async fn test_start_services_consumes_stopped_set() {
    let (_store, session, ns, processes, mut agent) = agent_fixture().await;
    deploy(session.as_ref(), &ns, "echo", &[MACHINE]).await;
    agent.initialize().await.unwrap();

    agent.scan().await.unwrap();
    agent.start_services().unwrap();
    assert!(agent.stopped().is_empty());
    assert_eq!(
        agent.start_services().unwrap(),
        AgentOutcome::Spawned(Vec::new())
    );
    assert_eq!(processes.spawned.lock().len(), 1);
}

#[tokio::test]
async fn test_published_state_counts_as_running() {
    let (_store, session, ns, processes, mut agent) = agent_fixture().await;
    deploy(session.as_ref(), &ns, "echo", &[MACHINE]).await;
    agent.initialize().await.unwrap();
    agent.reconcile().await.unwrap();

    session
        .create(
            &ns.service_state_for("echo", MACHINE),
            b"",
            CreateMode::Ephemeral,
            &[],
        )
        .await
        .unwrap();
    processes.kill_all();
    assert!(agent.scan().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_side_of_spawn() {
    let (_store, session, ns, processes, mut agent) = agent_fixture().await;
    deploy(session.as_ref(), &ns, "echo", &[MACHINE]).await;
    deploy(session.as_ref(), &ns, "other", &[MACHINE]).await;
    *processes.become_worker.lock() = true;

    agent.initialize().await.unwrap();
    assert_eq!(
        agent.reconcile().await.unwrap(),
        AgentOutcome::Worker("echo".into())
    );
    // The worker stops iterating at once.
    assert_eq!(processes.spawned.lock().len(), 1);
}

#[tokio::test]
async fn test_run_until_cancelled() {
    let (_store, session, ns, processes, mut agent) = agent_fixture().await;
    deploy(session.as_ref(), &ns, "echo", &[MACHINE]).await;

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        agent.run(cancel, Duration::from_millis(10)),
    )
    .await
    .expect("agent stopped")
    .unwrap();
    assert!(matches!(outcome, AgentOutcome::Spawned(pids) if pids.len() == 1));
    assert_eq!(processes.spawned.lock().len(), 1);
}

#[tokio::test]
async fn test_run_stops_when_session_ends() {
    let (store, session, _ns, _processes, mut agent) = agent_fixture().await;
    let id = session.session_id();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.expire_session(id);
    });

    tokio::time::timeout(
        Duration::from_secs(5),
        agent.run(CancellationToken::new(), Duration::from_secs(3600)),
    )
    .await
    .expect("agent stopped")
    .unwrap_or_else(|e| panic!("unexpected error: {e}"));
}

#[tokio::test]
async fn test_registered_worker_is_reaped_after_it_exits() {
    let (_store, session, ns, processes, mut agent) = agent_fixture().await;
    deploy(session.as_ref(), &ns, "echo", &[MACHINE]).await;
    agent.initialize().await.unwrap();
    agent.reconcile().await.unwrap();
    let pid = *agent.children().iter().next().unwrap();

    let state = ns.service_state_for("echo", MACHINE);
    session
        .create(&state, b"", CreateMode::Ephemeral, &[])
        .await
        .unwrap();
    // Registered and running: tracked, not reaped.
    assert!(agent.scan().await.unwrap().is_empty());
    assert!(agent.children().contains(&pid));
    assert!(processes.reaped.lock().is_empty());

    // Stopped: state node removed, then the process exits.
    session.delete(&state, None).await.unwrap();
    processes.kill_all();
    assert_eq!(agent.scan().await.unwrap(), set(&["echo"]));
    assert_eq!(*processes.reaped.lock(), vec![pid]);
    assert!(agent.children().is_empty());

    agent.scan().await.unwrap();
    assert_eq!(processes.reaped.lock().len(), 1);
}

#[tokio::test]
async fn test_failed_spawn_does_not_skip_other_services() {
    let (_store, session, ns, processes, mut agent) = agent_fixture().await;
    deploy(session.as_ref(), &ns, "a", &[MACHINE]).await;
    deploy(session.as_ref(), &ns, "b", &[MACHINE]).await;
    processes.failing.lock().insert("a".to_string());
    agent.initialize().await.unwrap();

    let outcome = agent.reconcile().await.unwrap();
    assert!(matches!(outcome, AgentOutcome::Spawned(pids) if pids.len() == 1));
    assert_eq!(*processes.spawned.lock(), vec!["b"]);

    // Retried on the next round.
    processes.failing.lock().clear();
    agent.reconcile().await.unwrap();
    assert_eq!(*processes.spawned.lock(), vec!["b", "a"]);
}

#[tokio::test]
async fn test_run_reports_only_unreaped_workers() {
    let (_store, session, ns, processes, mut agent) = agent_fixture().await;
    deploy(session.as_ref(), &ns, "echo", &[MACHINE]).await;

    // Every spawned worker dies at once, so each round spawns a new one.
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    let killer = Arc::clone(&processes);
    tokio::spawn(async move {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            killer.kill_all();
        }
        stopper.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        agent.run(cancel, Duration::from_millis(5)),
    )
    .await
    .expect("agent stopped")
    .unwrap();
    assert!(processes.spawned.lock().len() > 1);
    assert_eq!(outcome, AgentOutcome::Spawned(Vec::new()));
}
