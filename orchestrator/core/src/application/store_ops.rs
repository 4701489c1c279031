// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Store Operations
//!
//! Idempotent helpers over [`CoordinationStore`] shared by the registry, the
//! hierarchy initializer and the machine agent. Expected already-exists and
//! not-found conditions are absorbed here.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Multi-step store recipes

use crate::domain::errors::{PopError, PopResult};
use crate::domain::store::{
    join_path, parent_path, Acl, CoordinationStore, CreateMode, StoreError,
};
use tracing::{debug, trace};

/// Create `path` if it is missing. Returns whether this call created it.
pub async fn ensure_node(
    store: &dyn CoordinationStore,
    path: &str,
    data: &[u8],
    acl: &[Acl],
) -> PopResult<bool> {
    match store.create(path, data, CreateMode::Persistent, acl).await {
        Ok(_) => Ok(true),
        Err(StoreError::NodeExists(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Create `path` and every missing ancestor.
pub async fn create_path(store: &dyn CoordinationStore, path: &str, acl: &[Acl]) -> PopResult<()> {
    let mut missing = Vec::new();
    let mut current = Some(path);
    while let Some(p) = current {
        if p == "/" || store.exists(p).await?.is_some() {
            break;
        }
        missing.push(p.to_string());
        current = parent_path(p);
    }
    for p in missing.iter().rev() {
        ensure_node(store, p, b"", acl).await?;
    }
    Ok(())
}

/// Delete every descendant of `path`, leaving `path` itself in place.
pub async fn clear_children(store: &dyn CoordinationStore, path: &str) -> PopResult<()> {
    for child in store.get_children(path).await? {
        recursive_delete(store, &join_path(path, &child)).await?;
    }
    Ok(())
}

/// Delete `path` and its whole subtree. A missing node is not an error.
///
/// Walks the tree with an explicit stack, then deletes deepest-first.
pub async fn recursive_delete(store: &dyn CoordinationStore, path: &str) -> PopResult<()> {
    let mut pending = vec![path.to_string()];
    let mut ordered = Vec::new();
    while let Some(current) = pending.pop() {
        match store.get_children(&current).await {
            Ok(children) => pending.extend(children.iter().map(|c| join_path(&current, c))),
            Err(StoreError::NoNode(_)) => continue,
            Err(e) => return Err(e.into()),
        }
        ordered.push(current);
    }
    for node in ordered.iter().rev() {
        match store.delete(node, None).await {
            Ok(()) | Err(StoreError::NoNode(_)) => trace!(path = %node, "Deleted"),
            Err(e) => return Err(e.into()),
        }
    }
    debug!(path, nodes = ordered.len(), "Subtree deleted");
    Ok(())
}

/// Read-modify-CAS-write loop over an existing node.
///
/// `change` receives the current payload and returns the new one; it is
/// re-run on every version conflict. A missing node is reported as
/// [`PopError::StateNotFound`].
pub async fn retry_change<F>(
    store: &dyn CoordinationStore,
    path: &str,
    mut change: F,
) -> PopResult<Vec<u8>>
where
    F: FnMut(&[u8]) -> PopResult<Vec<u8>> + Send,
{
    loop {
        let (current, stat) = match store.get(path).await {
            Ok(found) => found,
            Err(StoreError::NoNode(_)) => return Err(PopError::StateNotFound(path.to_string())),
            Err(e) => return Err(e.into()),
        };
        let updated = change(&current)?;
        match store.set(path, &updated, Some(stat.version)).await {
            Ok(_) => return Ok(updated),
            Err(StoreError::BadVersion { .. }) => {
                debug!(path, "Version conflict, retrying");
            }
            Err(StoreError::NoNode(_)) => return Err(PopError::StateNotFound(path.to_string())),
            Err(e) => return Err(e.into()),
        }
    }
}
