// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Await Presence
//!
//! Race-free waits for a child node to appear or disappear.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Liveness observation without polling
//!
//! Both waits rely on `get_children_and_watch` taking the snapshot and arming
//! the watch atomically, so a mutation landing between the check and the
//! subscription cannot be missed. A fire only says *some* child changed; the
//! snapshot is re-taken and the watch re-armed until the condition holds.
//! Watches that are no longer needed are cancelled, and dropping either
//! future releases its pending watch.

use crate::domain::errors::PopResult;
use crate::domain::store::{join_path, CoordinationStore, StoreError};
use tracing::trace;

/// Return `child`'s payload under `parent`, waiting for it to appear.
pub async fn wait_for(
    store: &dyn CoordinationStore,
    parent: &str,
    child: &str,
) -> PopResult<Vec<u8>> {
    let path = join_path(parent, child);
    loop {
        let (children, watch) = store.get_children_and_watch(parent).await?;
        if children.iter().any(|c| c == child) {
            watch.cancel();
            match store.get(&path).await {
                Ok((data, _)) => return Ok(data),
                // Gone again between the snapshot and the read.
                Err(StoreError::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        trace!(parent, child, "Waiting for child to appear");
        watch.fired().await?;
    }
}

/// Return once `child` is no longer listed under `parent`. A missing parent
/// counts as absent.
pub async fn wait_for_absence(
    store: &dyn CoordinationStore,
    parent: &str,
    child: &str,
) -> PopResult<()> {
    loop {
        let (children, watch) = match store.get_children_and_watch(parent).await {
            Ok(found) => found,
            Err(StoreError::NoNode(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !children.iter().any(|c| c == child) {
            watch.cancel();
            return Ok(());
        }
        trace!(parent, child, "Waiting for child to disappear");
        watch.fired().await?;
    }
}
