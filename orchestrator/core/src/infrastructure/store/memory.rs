// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-Memory Coordination Store
//!
//! A complete coordination store engine held in process memory. Every
//! operation runs under one mutex, which makes each request atomic and gives
//! `get_children_and_watch` / `get_and_watch` their snapshot-plus-arm
//! guarantee for free.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Backing engine for tests, the `serve` command and
//!   single-host deployments
//! - **Pattern:** Adapter (implements `CoordinationStore`)
//!
//! Sessions are cheap handles ([`MemorySession`]) onto a shared
//! [`InMemoryStore`]. Closing or dropping a session removes its ephemeral
//! nodes and its pending watches.

use crate::domain::store::{
    node_name, parent_path, validate_path, Acl, CoordinationStore, CreateMode, SessionId, Stat,
    StoreError, StoreResult, Version, Watch, WatchEvent, WatchEventKind, WatchId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const FIRST_SESSION_ID: u64 = 0x100;

struct Node {
    data: Vec<u8>,
    version: Version,
    children: BTreeSet<String>,
    ephemeral_owner: Option<SessionId>,
    acl: Vec<Acl>,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>, acl: Vec<Acl>) -> Self {
        Self {
            data,
            version: 0,
            children: BTreeSet::new(),
            ephemeral_owner,
            acl,
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            num_children: self.children.len(),
            ephemeral_owner: self.ephemeral_owner,
        }
    }
}

struct Watcher {
    id: WatchId,
    session: SessionId,
    sender: oneshot::Sender<WatchEvent>,
    token: CancellationToken,
}

struct SessionEntry {
    ephemerals: HashSet<String>,
    closed: CancellationToken,
}

struct Tree {
    nodes: HashMap<String, Node>,
    child_watches: HashMap<String, Vec<Watcher>>,
    data_watches: HashMap<String, Vec<Watcher>>,
    sessions: HashMap<SessionId, SessionEntry>,
    next_session: u64,
    next_watch: u64,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            "/".to_string(),
            Node::new(Vec::new(), None, vec![Acl::open_unsafe()]),
        );
        Self {
            nodes,
            child_watches: HashMap::new(),
            data_watches: HashMap::new(),
            sessions: HashMap::new(),
            next_session: FIRST_SESSION_ID,
            next_watch: 1,
        }
    }

    fn check_session(&self, session: SessionId) -> StoreResult<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(StoreError::SessionClosed)
        }
    }

    fn node(&self, path: &str) -> StoreResult<&Node> {
        validate_path(path)?;
        self.nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    fn fire(watches: &mut HashMap<String, Vec<Watcher>>, path: &str, kind: WatchEventKind) {
        let Some(watchers) = watches.remove(path) else {
            return;
        };
        for watcher in watchers {
            if watcher.token.is_cancelled() {
                continue;
            }
            trace!(watch_id = watcher.id.0, path, ?kind, "Watch fired");
            let _ = watcher.sender.send(WatchEvent {
                kind,
                path: path.to_string(),
            });
        }
    }

    fn create(
        &mut self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: &[Acl],
    ) -> StoreResult<String> {
        self.check_session(session)?;
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| StoreError::NodeExists(path.to_string()))?;
        if self.nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        let name = node_name(path).to_string();
        let parent_node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| StoreError::NoNode(parent.to_string()))?;
        if parent_node.ephemeral_owner.is_some() {
            return Err(StoreError::NoChildrenForEphemerals(parent.to_string()));
        }
        parent_node.children.insert(name);

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(session),
        };
        let acl = if acl.is_empty() {
            vec![Acl::open_unsafe()]
        } else {
            acl.to_vec()
        };
        self.nodes
            .insert(path.to_string(), Node::new(data.to_vec(), owner, acl));
        if let Some(owner) = owner {
            if let Some(entry) = self.sessions.get_mut(&owner) {
                entry.ephemerals.insert(path.to_string());
            }
        }
        Self::fire(&mut self.child_watches, parent, WatchEventKind::ChildrenChanged);
        Ok(path.to_string())
    }

    fn set(&mut self, session: SessionId, path: &str, data: &[u8], expected: Option<Version>) -> StoreResult<Stat> {
        self.check_session(session)?;
        validate_path(path)?;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if let Some(expected) = expected {
            if node.version != expected {
                return Err(StoreError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = data.to_vec();
        node.version += 1;
        let stat = node.stat();
        Self::fire(&mut self.data_watches, path, WatchEventKind::DataChanged);
        Ok(stat)
    }

    fn delete(&mut self, session: SessionId, path: &str, expected: Option<Version>) -> StoreResult<()> {
        self.check_session(session)?;
        self.remove_node(path, expected)
    }

    fn remove_node(&mut self, path: &str, expected: Option<Version>) -> StoreResult<()> {
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if let Some(expected) = expected {
            if node.version != expected {
                return Err(StoreError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        if !node.children.is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        let owner = node.ephemeral_owner;
        self.nodes.remove(path);
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node
                .children
                .remove(node_name(path));
        }
        if let Some(entry) = owner.and_then(|o| self.sessions.get_mut(&o)) {
            entry.ephemerals.remove(path);
        }
        Self::fire(&mut self.data_watches, path, WatchEventKind::NodeDeleted);
        Self::fire(&mut self.child_watches, path, WatchEventKind::NodeDeleted);
        Self::fire(&mut self.child_watches, parent, WatchEventKind::ChildrenChanged);
        Ok(())
    }

    fn arm(&mut self, session: SessionId, path: &str, data_watch: bool) -> Watch {
        let id = WatchId(self.next_watch);
        self.next_watch += 1;
        let (sender, receiver) = oneshot::channel();
        let token = CancellationToken::new();
        let watches = if data_watch {
            &mut self.data_watches
        } else {
            &mut self.child_watches
        };
        let slot = watches.entry(path.to_string()).or_default();
        slot.retain(|w| !w.token.is_cancelled());
        slot.push(Watcher {
            id,
            session,
            sender,
            token: token.clone(),
        });
        Watch::new(id, path, receiver, token)
    }

    /// Forget a watcher whose handle was cancelled before it fired.
    fn release(&mut self, path: &str, id: WatchId, data_watch: bool) {
        let watches = if data_watch {
            &mut self.data_watches
        } else {
            &mut self.child_watches
        };
        if let Some(slot) = watches.get_mut(path) {
            slot.retain(|w| w.id != id);
            if slot.is_empty() {
                watches.remove(path);
            }
            trace!(watch_id = id.0, path, "Watch released");
        }
    }

    fn open_session(&mut self) -> (SessionId, CancellationToken) {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        let closed = CancellationToken::new();
        self.sessions.insert(
            id,
            SessionEntry {
                ephemerals: HashSet::new(),
                closed: closed.clone(),
            },
        );
        (id, closed)
    }

    fn close_session(&mut self, session: SessionId) {
        let Some(entry) = self.sessions.remove(&session) else {
            return;
        };
        let ephemerals: Vec<String> = entry.ephemerals.into_iter().collect();
        for path in &ephemerals {
            if let Err(e) = self.remove_node(path, None) {
                debug!(path = %path, error = %e, "Ephemeral node already gone");
            }
        }
        for watches in [&mut self.child_watches, &mut self.data_watches] {
            for watchers in watches.values_mut() {
                watchers.retain(|w| w.session != session);
            }
            watches.retain(|_, v| !v.is_empty());
        }
        entry.closed.cancel();
        debug!(session = %session, removed = ephemerals.len(), "Session closed");
    }

    fn prune(&mut self) {
        for watches in [&mut self.child_watches, &mut self.data_watches] {
            for watchers in watches.values_mut() {
                watchers.retain(|w| !w.token.is_cancelled() && !w.sender.is_closed());
            }
            watches.retain(|_, v| !v.is_empty());
        }
    }
}

/// Shared in-memory store. Cloning yields another handle onto the same tree.
#[derive(Clone)]
pub struct InMemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// Open a new session.
    pub fn connect(&self) -> MemorySession {
        let (id, closed) = self.tree.lock().open_session();
        debug!(session = %id, "Session opened");
        MemorySession {
            store: self.clone(),
            id,
            closed,
        }
    }

    /// Number of live (armed, not cancelled) watches across all sessions.
    pub fn watch_count(&self) -> usize {
        let mut tree = self.tree.lock();
        tree.prune();
        tree.child_watches.values().map(Vec::len).sum::<usize>()
            + tree.data_watches.values().map(Vec::len).sum::<usize>()
    }

    pub fn session_count(&self) -> usize {
        self.tree.lock().sessions.len()
    }

    /// Forcibly end a session, as if its client vanished.
    pub fn expire_session(&self, session: SessionId) {
        self.tree.lock().close_session(session);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One session on an [`InMemoryStore`]. Dropping it closes the session.
pub struct MemorySession {
    store: InMemoryStore,
    id: SessionId,
    closed: CancellationToken,
}

impl MemorySession {
    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Drop the server-side watcher as soon as `watch` is cancelled. Ends with
    /// the session, which discards its watchers anyway.
    fn release_on_cancel(&self, watch: &Watch, data_watch: bool) {
        let token = watch.token();
        let closed = self.closed.clone();
        let tree = Arc::downgrade(&self.store.tree);
        let (id, path) = (watch.id(), watch.path().to_string());
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = token.cancelled() => {
                    if let Some(tree) = tree.upgrade() {
                        tree.lock().release(&path, id, data_watch);
                    }
                }
            }
        });
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed.is_cancelled() {
            self.store.tree.lock().close_session(self.id);
        }
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: &[Acl],
    ) -> StoreResult<String> {
        self.store.tree.lock().create(self.id, path, data, mode, acl)
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)> {
        let tree = self.store.tree.lock();
        tree.check_session(self.id)?;
        let node = tree.node(path)?;
        Ok((node.data.clone(), node.stat()))
    }

    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>> {
        let tree = self.store.tree.lock();
        tree.check_session(self.id)?;
        validate_path(path)?;
        Ok(tree.nodes.get(path).map(Node::stat))
    }

    async fn set(&self, path: &str, data: &[u8], expected: Option<Version>) -> StoreResult<Stat> {
        self.store.tree.lock().set(self.id, path, data, expected)
    }

    async fn delete(&self, path: &str, expected: Option<Version>) -> StoreResult<()> {
        self.store.tree.lock().delete(self.id, path, expected)
    }

    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let tree = self.store.tree.lock();
        tree.check_session(self.id)?;
        Ok(tree.node(path)?.children.iter().cloned().collect())
    }

    async fn get_children_and_watch(&self, path: &str) -> StoreResult<(Vec<String>, Watch)> {
        let mut tree = self.store.tree.lock();
        tree.check_session(self.id)?;
        let children = tree.node(path)?.children.iter().cloned().collect();
        let watch = tree.arm(self.id, path, false);
        drop(tree);
        self.release_on_cancel(&watch, false);
        Ok((children, watch))
    }

    async fn get_and_watch(&self, path: &str) -> StoreResult<(Vec<u8>, Stat, Watch)> {
        let mut tree = self.store.tree.lock();
        tree.check_session(self.id)?;
        let node = tree.node(path)?;
        let (data, stat) = (node.data.clone(), node.stat());
        let watch = tree.arm(self.id, path, true);
        drop(tree);
        self.release_on_cancel(&watch, true);
        Ok((data, stat, watch))
    }

    async fn get_acl(&self, path: &str) -> StoreResult<Vec<Acl>> {
        let tree = self.store.tree.lock();
        tree.check_session(self.id)?;
        Ok(tree.node(path)?.acl.clone())
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.store.tree.lock().close_session(self.id);
        Ok(())
    }
}
