// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Hierarchy
//!
//! Idempotent initialization of the namespace root.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Creates `machines` and `services` under the prefix

use crate::application::store_ops::{clear_children, create_path};
use crate::domain::errors::{PopError, PopResult};
use crate::domain::namespace::Namespace;
use crate::domain::store::{perms, Acl, CoordinationStore, CreateMode, StoreError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use tracing::{info, warn};

/// Digest-scheme id for `user:password`: `user:base64(sha1(user:password))`.
pub fn digest_identity(identity: &str) -> PopResult<String> {
    let (user, _) = identity.split_once(':').ok_or_else(|| {
        PopError::Config(format!(
            "admin identity must be 'username:password', got {identity:?}"
        ))
    })?;
    if user.is_empty() {
        return Err(PopError::Config("admin identity has an empty username".into()));
    }
    let digest = Sha1::digest(identity.as_bytes());
    Ok(format!("{user}:{}", STANDARD.encode(digest)))
}

/// Full access for the admin identity plus an open world entry.
pub fn namespace_acl(admin_identity: &str) -> PopResult<Vec<Acl>> {
    Ok(vec![
        Acl::new("digest", digest_identity(admin_identity)?, perms::ALL),
        Acl::open_unsafe(),
    ])
}

/// Create `machines` and `services` under the namespace prefix.
///
/// Without `force` an existing node is a [`PopError::State`] error. With
/// `force` existing nodes are emptied instead of recreated.
pub async fn initialize(
    store: &dyn CoordinationStore,
    namespace: &Namespace,
    admin_identity: &str,
    force: bool,
) -> PopResult<()> {
    let acl = namespace_acl(admin_identity)?;

    if !namespace.is_root() {
        create_path(store, namespace.prefix(), &acl).await?;
    }

    if force {
        warn!("using '--force' to initialize hierarchy.");
    }

    for path in [namespace.machines(), namespace.services()] {
        match store.create(&path, b"", CreateMode::Persistent, &acl).await {
            Ok(_) => info!(path = %path, "Created"),
            Err(StoreError::NodeExists(_)) if force => {
                clear_children(store, &path).await?;
                info!(path = %path, "Cleared");
            }
            Err(err @ StoreError::NodeExists(_)) => {
                return Err(PopError::State(format!(
                    "{err}!\nIf you're sure, run command again with '--force'."
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Whether `initialize` has run for this namespace.
pub async fn is_initialized(store: &dyn CoordinationStore, namespace: &Namespace) -> PopResult<bool> {
    Ok(store.exists(&namespace.machines()).await?.is_some()
        && store.exists(&namespace.services()).await?.is_some())
}

/// Fail with [`PopError::State`] unless the namespace is initialized.
pub async fn require_initialized(
    store: &dyn CoordinationStore,
    namespace: &Namespace,
) -> PopResult<()> {
    if is_initialized(store, namespace).await? {
        Ok(())
    } else {
        Err(PopError::State(format!(
            "namespace {} is not initialized; run 'init' first",
            namespace.prefix()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_identity() {
        // Matches ZooKeeper's DigestAuthenticationProvider for admin:admin.
        assert_eq!(
            digest_identity("admin:admin").unwrap(),
            "admin:x1nq8J5GOJVPY6zgzhtTtA9izLc="
        );
        assert!(digest_identity("admin").is_err());
        assert!(digest_identity(":secret").is_err());
    }
}
