// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordination Store Contract
//!
//! The hierarchical, versioned, watchable key-value tree every other component
//! is built on. Nodes are addressed by `/`-separated absolute paths and carry
//! an opaque byte payload, a version (the only CAS token), a set of child
//! names, an optional ephemeral owner session and an access-control list.
//!
//! | Type | Role |
//! |------|------|
//! | [`CoordinationStore`] | One client session against the store |
//! | [`Stat`] | Node metadata returned by reads and writes |
//! | [`Watch`] | One-shot subscription, cancellable via its token |
//! | [`StoreError`] | Store failures, serializable for the wire protocol |
//!
//! Implementations live in `crate::infrastructure::store`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Node version. Starts at 0 on create and increments on every data write.
pub type Version = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchId(pub u64);

/// Node metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub version: Version,
    pub num_children: usize,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<SessionId>,
}

impl Stat {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    #[default]
    Persistent,
    /// Bound to the creating session; removed when that session ends.
    Ephemeral,
}

/// Permission bits, ZooKeeper layout.
pub mod perms {
    pub const READ: u32 = 1;
    pub const WRITE: u32 = 2;
    pub const CREATE: u32 = 4;
    pub const DELETE: u32 = 8;
    pub const ADMIN: u32 = 16;
    pub const ALL: u32 = READ | WRITE | CREATE | DELETE | ADMIN;
}

/// Access-control entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub scheme: String,
    pub id: String,
    pub perms: u32,
}

impl Acl {
    pub fn new(scheme: impl Into<String>, id: impl Into<String>, perms: u32) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
            perms,
        }
    }

    /// `world:anyone` with every permission.
    pub fn open_unsafe() -> Self {
        Self::new("world", "anyone", perms::ALL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    /// A child was created or deleted.
    ChildrenChanged,
    /// The node's data was overwritten.
    DataChanged,
    /// The watched node itself was deleted.
    NodeDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: String,
}

/// One-shot subscription returned by the `*_and_watch` operations.
///
/// The watch owns a drop guard over its cancellation token: dropping or
/// cancelling it releases the subscription on the store side. A watch that
/// fires is released as well.
pub struct Watch {
    id: WatchId,
    path: String,
    event: oneshot::Receiver<WatchEvent>,
    token: CancellationToken,
    _guard: DropGuard,
}

impl Watch {
    pub fn new(
        id: WatchId,
        path: impl Into<String>,
        event: oneshot::Receiver<WatchEvent>,
        token: CancellationToken,
    ) -> Self {
        let guard = token.clone().drop_guard();
        Self {
            id,
            path: path.into(),
            event,
            token,
            _guard: guard,
        }
    }

    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Token observed by the store; cancelled when this watch is dropped.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Suspend until the watch fires.
    ///
    /// Fails with [`StoreError::SessionClosed`] when the session ends (or the
    /// subscription is released) before any event arrives.
    pub async fn fired(self) -> Result<WatchEvent, StoreError> {
        let Watch { event, _guard, .. } = self;
        let result = event.await.map_err(|_| StoreError::SessionClosed);
        drop(_guard);
        result
    }

    /// Release the subscription without waiting for it.
    pub fn cancel(self) {
        self.token.cancel();
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum StoreError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("no node: {0}")]
    NoNode(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("bad version for {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("ephemeral nodes may not have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("connection loss: {0}")]
    ConnectionLoss(String),

    #[error("session closed")]
    SessionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One client session against the coordination store.
///
/// Requests issued through one session are applied in order. Ephemeral nodes
/// created through it live exactly as long as the session.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    fn session_id(&self) -> SessionId;

    /// Create a node. The parent must exist. Returns the created path.
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: &[Acl],
    ) -> StoreResult<String>;

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)>;

    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>>;

    /// Overwrite a node's data. With `Some(version)` the write only succeeds
    /// when the node is still at that version.
    async fn set(&self, path: &str, data: &[u8], expected: Option<Version>) -> StoreResult<Stat>;

    /// Delete a childless node.
    async fn delete(&self, path: &str, expected: Option<Version>) -> StoreResult<()>;

    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// List children and arm a child watch in one atomic step: no mutation
    /// between the snapshot and the arming can be missed.
    async fn get_children_and_watch(&self, path: &str) -> StoreResult<(Vec<String>, Watch)>;

    /// Read data and arm a data watch in one atomic step.
    async fn get_and_watch(&self, path: &str) -> StoreResult<(Vec<u8>, Stat, Watch)>;

    async fn get_acl(&self, path: &str) -> StoreResult<Vec<Acl>>;

    /// Resolves once the session has ended, for whatever reason.
    async fn closed(&self);

    /// End the session, removing its ephemeral nodes.
    async fn close(&self) -> StoreResult<()>;
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of an absolute path; `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of an absolute path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Validate an absolute node path: leading `/`, no trailing `/` (except the
/// root), no empty segments.
pub fn validate_path(path: &str) -> StoreResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("/", "machines"), "/machines");
        assert_eq!(join_path("/t", "machines"), "/t/machines");
        assert_eq!(parent_path("/t/machines"), Some("/t"));
        assert_eq!(parent_path("/machines"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(node_name("/services/echo/type"), "type");
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a/b").is_ok());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
    }

    #[test]
    fn test_store_error_wire_format() {
        let err = StoreError::BadVersion {
            path: "/x".to_string(),
            expected: 1,
            actual: 2,
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: StoreError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[tokio::test]
    async fn test_dropping_watch_cancels_token() {
        let (_tx, rx) = oneshot::channel();
        let token = CancellationToken::new();
        let watch = Watch::new(WatchId(1), "/x", rx, token.clone());
        assert!(!token.is_cancelled());
        drop(watch);
        assert!(token.is_cancelled());
    }
}
