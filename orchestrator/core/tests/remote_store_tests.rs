// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Coordination store served over TCP.

use pop_core::application::await_presence::wait_for;
use pop_core::domain::store::{CoordinationStore, CreateMode, StoreError, WatchEventKind};
use pop_core::infrastructure::store::{InMemoryStore, RemoteStore, StoreServer};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Server {
    store: InMemoryStore,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve() -> Server {
    let store = InMemoryStore::new();
    let server = StoreServer::bind("127.0.0.1:0", store.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(shutdown.clone()));
    Server {
        store,
        addr,
        shutdown,
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_basic_operations() {
    let server = serve().await;
    let client = RemoteStore::connect(server.addr).await.unwrap();

    let path = client
        .create("/a", b"one", CreateMode::Persistent, &[])
        .await
        .unwrap();
    assert_eq!(path, "/a");

    let (data, stat) = client.get("/a").await.unwrap();
    assert_eq!(data, b"one");
    assert_eq!(stat.version, 0);

    client.set("/a", b"two", Some(0)).await.unwrap();
    let err = client.set("/a", b"three", Some(0)).await.unwrap_err();
    assert!(matches!(err, StoreError::BadVersion { expected: 0, actual: 1, .. }));

    assert!(matches!(
        client.get("/missing").await,
        Err(StoreError::NoNode(p)) if p == "/missing"
    ));
    assert!(client.exists("/missing").await.unwrap().is_none());
    assert_eq!(client.get_children("/").await.unwrap(), vec!["a"]);

    client.delete("/a", None).await.unwrap();
    assert!(client.exists("/a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_ephemeral_node_dies_with_connection() {
    let server = serve().await;
    let observer = server.store.connect();
    observer
        .create("/state", b"", CreateMode::Persistent, &[])
        .await
        .unwrap();

    let worker = RemoteStore::connect(server.addr).await.unwrap();
    worker
        .create("/state/m1", b"pid: 1\n", CreateMode::Ephemeral, &[])
        .await
        .unwrap();
    let stat = observer.exists("/state/m1").await.unwrap().unwrap();
    assert_eq!(stat.ephemeral_owner, Some(worker.session_id()));

    drop(worker);
    let store = server.store.clone();
    eventually(|| store.session_count() == 1).await;
    assert!(observer.exists("/state/m1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_close_ends_session() {
    let server = serve().await;
    let client = RemoteStore::connect(server.addr).await.unwrap();
    client
        .create("/e", b"", CreateMode::Ephemeral, &[])
        .await
        .unwrap();

    client.close().await.unwrap();
    client.closed().await;
    assert!(matches!(
        client.get("/").await,
        Err(StoreError::SessionClosed)
    ));

    let observer = server.store.connect();
    assert!(observer.exists("/e").await.unwrap().is_none());
}

#[tokio::test]
async fn test_watches_cross_the_wire() {
    let server = serve().await;
    let client = RemoteStore::connect(server.addr).await.unwrap();
    let writer = server.store.connect();
    client
        .create("/node", b"v0", CreateMode::Persistent, &[])
        .await
        .unwrap();

    let (children, watch) = client.get_children_and_watch("/node").await.unwrap();
    assert!(children.is_empty());
    writer
        .create("/node/child", b"", CreateMode::Persistent, &[])
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), watch.fired())
        .await
        .expect("child watch fired")
        .unwrap();
    assert_eq!(event.kind, WatchEventKind::ChildrenChanged);
    assert_eq!(event.path, "/node");

    let (data, _, watch) = client.get_and_watch("/node").await.unwrap();
    assert_eq!(data, b"v0");
    writer.set("/node", b"v1", None).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), watch.fired())
        .await
        .expect("data watch fired")
        .unwrap();
    assert_eq!(event.kind, WatchEventKind::DataChanged);
}

#[tokio::test]
async fn test_dropped_watch_is_released_on_server() {
    let server = serve().await;
    let client = RemoteStore::connect(server.addr).await.unwrap();
    client
        .create("/node", b"", CreateMode::Persistent, &[])
        .await
        .unwrap();

    let (_, watch) = client.get_children_and_watch("/node").await.unwrap();
    assert_eq!(server.store.watch_count(), 1);
    drop(watch);

    let store = server.store.clone();
    eventually(|| store.watch_count() == 0).await;
}

#[tokio::test]
async fn test_wait_for_over_the_wire() {
    let server = serve().await;
    let client = RemoteStore::connect(server.addr).await.unwrap();
    let worker = RemoteStore::connect(server.addr).await.unwrap();
    client
        .create("/state", b"", CreateMode::Persistent, &[])
        .await
        .unwrap();

    let wait = tokio::spawn(async move { wait_for(&client, "/state", "m1").await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    worker
        .create("/state/m1", b"port: 8080\n", CreateMode::Ephemeral, &[])
        .await
        .unwrap();

    let data = tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("wait finished")
        .unwrap()
        .unwrap();
    assert_eq!(data, b"port: 8080\n");
}

#[tokio::test]
async fn test_expired_session_closes_client() {
    let server = serve().await;
    let client = RemoteStore::connect(server.addr).await.unwrap();
    let (_, watch) = client.get_children_and_watch("/").await.unwrap();

    server.store.expire_session(client.session_id());
    tokio::time::timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("client noticed");
    assert!(matches!(watch.fired().await, Err(StoreError::SessionClosed)));
}

#[tokio::test]
async fn test_connect_to_nothing() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    assert!(matches!(
        RemoteStore::connect(addr).await,
        Err(StoreError::ConnectionLoss(_))
    ));
}
