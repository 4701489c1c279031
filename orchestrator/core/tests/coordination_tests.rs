// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Hierarchy initialization, merge-write convergence and presence waits
//! against the in-memory store.

use pop_core::application::await_presence::{wait_for, wait_for_absence};
use pop_core::application::hierarchy::{initialize, is_initialized};
use pop_core::application::merge_writer::MergeWriter;
use pop_core::domain::errors::PopError;
use pop_core::domain::namespace::Namespace;
use pop_core::domain::settings::decode_mapping;
use pop_core::domain::store::{CoordinationStore, CreateMode};
use pop_core::infrastructure::store::InMemoryStore;
use serde_yaml::Value;
use std::time::Duration;

#[tokio::test]
async fn test_initialize_root_namespace() {
    let store = InMemoryStore::new();
    let session = store.connect();
    let namespace = Namespace::root();

    assert!(!is_initialized(&session, &namespace).await.unwrap());
    initialize(&session, &namespace, "admin:admin", false)
        .await
        .unwrap();
    assert!(is_initialized(&session, &namespace).await.unwrap());

    let mut children = session.get_children("/").await.unwrap();
    children.sort();
    assert_eq!(children, vec!["machines", "services"]);

    let acl = session.get_acl("/services").await.unwrap();
    assert_eq!(acl.len(), 2);
    assert_eq!(acl[0].scheme, "digest");
    assert_eq!(acl[0].id, "admin:x1nq8J5GOJVPY6zgzhtTtA9izLc=");
    assert_eq!(acl[1].scheme, "world");
}

#[tokio::test]
async fn test_initialize_twice_requires_force() {
    let store = InMemoryStore::new();
    let session = store.connect();
    let namespace = Namespace::new("/test").unwrap();

    initialize(&session, &namespace, "admin:admin", false)
        .await
        .unwrap();
    session
        .create("/test/services/echo", b"", CreateMode::Persistent, &[])
        .await
        .unwrap();
    session
        .create("/test/services/echo/type", b"echo", CreateMode::Persistent, &[])
        .await
        .unwrap();

    let err = initialize(&session, &namespace, "admin:admin", false)
        .await
        .unwrap_err();
    assert!(err.is_state_error());
    assert!(err.to_string().contains("--force"));
    assert!(session.exists("/test/services/echo").await.unwrap().is_some());

    initialize(&session, &namespace, "admin:admin", true)
        .await
        .unwrap();
    assert!(session.get_children("/test/services").await.unwrap().is_empty());
    assert!(session.get_children("/test/machines").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_initialize_rejects_malformed_identity() {
    let store = InMemoryStore::new();
    let session = store.connect();
    let err = initialize(&session, &Namespace::root(), "admin", false)
        .await
        .unwrap_err();
    assert!(matches!(err, PopError::Config(_)));
}

#[tokio::test]
async fn test_concurrent_merge_writers_converge() {
    let store = InMemoryStore::new();
    let (s1, s2, s3) = (store.connect(), store.connect(), store.connect());
    let path = "/settings";

    let mut w1 = MergeWriter::new(&s1, path);
    let mut w2 = MergeWriter::new(&s2, path);
    let mut w3 = MergeWriter::new(&s3, path);
    for writer in [&mut w1, &mut w2, &mut w3] {
        writer.read(false).await.unwrap();
    }
    w1.set("a", 1).unwrap();
    w2.set("b", 2).unwrap();
    w3.set("c", 3).unwrap();

    let (r1, r2, r3) = tokio::join!(w1.write(), w2.write(), w3.write());
    for changes in [r1, r2, r3] {
        assert_eq!(changes.unwrap().len(), 1);
    }

    let (data, stat) = s1.get(path).await.unwrap();
    let merged = decode_mapping(path, &data).unwrap();
    assert_eq!(merged.len(), 3);
    assert_eq!(merged["a"], Value::from(1));
    assert_eq!(merged["b"], Value::from(2));
    assert_eq!(merged["c"], Value::from(3));
    assert!(stat.version >= 2);
}

#[tokio::test]
async fn test_merge_writer_keeps_foreign_keys() {
    let store = InMemoryStore::new();
    let session = store.connect();
    let path = "/settings";

    let mut stale = MergeWriter::new(&session, path);
    stale.read(false).await.unwrap();

    let mut other = MergeWriter::new(&session, path);
    other.read(false).await.unwrap();
    other.set("host", "0.0.0.0").unwrap();
    other.write().await.unwrap();

    stale.set("port", 9000).unwrap();
    stale.write().await.unwrap();

    let mut reader = MergeWriter::new(&session, path);
    reader.read(true).await.unwrap();
    assert_eq!(reader.keys().unwrap(), vec!["host", "port"]);
}

#[tokio::test]
async fn test_wait_for_sees_child_created_later() {
    let store = InMemoryStore::new();
    let waiter = store.connect();
    let writer = store.connect();
    writer
        .create("/state", b"", CreateMode::Persistent, &[])
        .await
        .unwrap();

    let wait = tokio::spawn(async move { wait_for(&waiter, "/state", "m1").await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    writer
        .create("/state/other", b"", CreateMode::Persistent, &[])
        .await
        .unwrap();
    writer
        .create("/state/m1", b"pid: 7\n", CreateMode::Ephemeral, &[])
        .await
        .unwrap();

    let data = tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("wait_for finished")
        .unwrap()
        .unwrap();
    assert_eq!(data, b"pid: 7\n");
    assert_eq!(store.watch_count(), 0);
}

#[tokio::test]
async fn test_wait_for_present_child_releases_watch() {
    let store = InMemoryStore::new();
    let session = store.connect();
    session
        .create("/state", b"", CreateMode::Persistent, &[])
        .await
        .unwrap();
    session
        .create("/state/m1", b"x", CreateMode::Persistent, &[])
        .await
        .unwrap();

    assert_eq!(wait_for(&session, "/state", "m1").await.unwrap(), b"x");
    assert_eq!(store.watch_count(), 0);
}

#[tokio::test]
async fn test_abandoned_wait_releases_watch() {
    let store = InMemoryStore::new();
    let session = store.connect();
    session
        .create("/state", b"", CreateMode::Persistent, &[])
        .await
        .unwrap();

    let timed_out =
        tokio::time::timeout(Duration::from_millis(50), wait_for(&session, "/state", "m1")).await;
    assert!(timed_out.is_err());
    assert_eq!(store.watch_count(), 0);
}

#[tokio::test]
async fn test_wait_for_absence_follows_session_close() {
    let store = InMemoryStore::new();
    let observer = store.connect();
    let worker = store.connect();
    observer
        .create("/state", b"", CreateMode::Persistent, &[])
        .await
        .unwrap();
    worker
        .create("/state/m1", b"", CreateMode::Ephemeral, &[])
        .await
        .unwrap();

    let wait = tokio::spawn(async move { wait_for_absence(&observer, "/state", "m1").await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(worker);

    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("wait_for_absence finished")
        .unwrap()
        .unwrap();
    assert_eq!(store.watch_count(), 0);
}

#[tokio::test]
async fn test_wait_for_absence_of_missing_parent() {
    let store = InMemoryStore::new();
    let session = store.connect();
    wait_for_absence(&session, "/nowhere", "m1").await.unwrap();
}
