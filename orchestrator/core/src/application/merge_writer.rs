// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Merge Writer
//!
//! Optimistic-concurrency view over a mapping-valued node.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Lets independent writers update disjoint keys of one node
//!   without clobbering each other
//!
//! # Protocol
//!
//! `read()` takes a pristine snapshot and a local working copy. Local edits
//! touch only the working copy. `write()` classifies every key against the
//! pristine snapshot, then loops: fetch the node's current content and
//! version, replay the classified edits onto that fresh content, and
//! conditionally write it back. A version conflict (or losing a create race)
//! restarts the loop; any other store error propagates.

use crate::domain::errors::{PopError, PopResult};
use crate::domain::settings::{decode_mapping, encode_mapping, Change, Settings};
use crate::domain::store::{CoordinationStore, CreateMode, StoreError};
use serde_yaml::Value;
use std::collections::BTreeSet;
use tracing::debug;

enum Edit {
    Put(Value),
    Remove,
}

struct Loaded {
    pristine: Settings,
    local: Settings,
}

pub struct MergeWriter<'a> {
    store: &'a dyn CoordinationStore,
    path: String,
    loaded: Option<Loaded>,
}

impl<'a> MergeWriter<'a> {
    pub fn new(store: &'a dyn CoordinationStore, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            loaded: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Load the node. A missing node reads as empty unless `required`.
    pub async fn read(&mut self, required: bool) -> PopResult<()> {
        let pristine = match self.store.get(&self.path).await {
            Ok((data, _)) => decode_mapping(&self.path, &data)?,
            Err(StoreError::NoNode(_)) if required => {
                return Err(PopError::StateNotFound(self.path.clone()))
            }
            Err(StoreError::NoNode(_)) => Settings::new(),
            Err(e) => return Err(e.into()),
        };
        self.loaded = Some(Loaded {
            local: pristine.clone(),
            pristine,
        });
        Ok(())
    }

    fn loaded(&self) -> PopResult<&Loaded> {
        self.loaded.as_ref().ok_or_else(|| not_read(&self.path))
    }

    fn loaded_mut(&mut self) -> PopResult<&mut Loaded> {
        let path = &self.path;
        self.loaded.as_mut().ok_or_else(|| not_read(path))
    }

    pub fn get(&self, key: &str) -> PopResult<Option<&Value>> {
        Ok(self.loaded()?.local.get(key))
    }

    pub fn contains(&self, key: &str) -> PopResult<bool> {
        Ok(self.loaded()?.local.contains_key(key))
    }

    pub fn keys(&self) -> PopResult<Vec<String>> {
        Ok(self.loaded()?.local.keys().cloned().collect())
    }

    /// The working copy.
    pub fn local(&self) -> PopResult<&Settings> {
        Ok(&self.loaded()?.local)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> PopResult<()> {
        self.loaded_mut()?.local.insert(key.into(), value.into());
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> PopResult<Option<Value>> {
        Ok(self.loaded_mut()?.local.remove(key))
    }

    /// Merge the local edits into the node, retrying until the conditional
    /// write lands. Returns the applied changes in key order.
    pub async fn write(&mut self) -> PopResult<Vec<Change>> {
        let loaded = self.loaded()?;
        let keys: BTreeSet<&String> = loaded.pristine.keys().chain(loaded.local.keys()).collect();

        let mut edits = Vec::new();
        for key in keys {
            match (loaded.pristine.get(key), loaded.local.get(key)) {
                (old, Some(new)) if old != Some(new) => {
                    edits.push((key.clone(), old.cloned(), Edit::Put(new.clone())))
                }
                (Some(old), None) => edits.push((key.clone(), Some(old.clone()), Edit::Remove)),
                _ => {}
            }
        }

        let changes = loop {
            let (mut current, version) = match self.store.get(&self.path).await {
                Ok((data, stat)) => (decode_mapping(&self.path, &data)?, Some(stat.version)),
                Err(StoreError::NoNode(_)) => (Settings::new(), None),
                Err(e) => return Err(e.into()),
            };

            let mut changes = Vec::new();
            for (key, old, edit) in &edits {
                match edit {
                    Edit::Put(new) => {
                        current.insert(key.clone(), new.clone());
                        changes.push(match old {
                            Some(old) => Change::Modified {
                                key: key.clone(),
                                old: old.clone(),
                                new: new.clone(),
                            },
                            None => Change::Added {
                                key: key.clone(),
                                value: new.clone(),
                            },
                        });
                    }
                    Edit::Remove => {
                        if current.remove(key).is_some() {
                            changes.push(Change::Deleted {
                                key: key.clone(),
                                old: old.clone().unwrap_or(Value::Null),
                            });
                        }
                    }
                }
            }

            let payload = encode_mapping(&self.path, &current)?;
            let attempt = match version {
                Some(version) => self
                    .store
                    .set(&self.path, &payload, Some(version))
                    .await
                    .map(|_| ()),
                None => self
                    .store
                    .create(&self.path, &payload, CreateMode::Persistent, &[])
                    .await
                    .map(|_| ()),
            };
            match attempt {
                Ok(()) => break changes,
                Err(StoreError::BadVersion { .. }) | Err(StoreError::NodeExists(_)) => {
                    debug!(path = %self.path, "Merge write conflict, retrying");
                }
                // Deleted under us; a missing parent on create is fatal.
                Err(StoreError::NoNode(_)) if version.is_some() => {
                    debug!(path = %self.path, "Merge write conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(loaded) = self.loaded.as_mut() {
            loaded.pristine = loaded.local.clone();
        }
        Ok(changes)
    }
}

fn not_read(path: &str) -> PopError {
    PopError::Usage(format!(
        "read() must be called on the merge writer for {path} before use"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::memory::InMemoryStore;

    #[tokio::test]
    async fn test_use_before_read_is_usage_error() {
        let store = InMemoryStore::new();
        let s = store.connect();
        let mut writer = MergeWriter::new(&s, "/settings");
        assert!(matches!(writer.get("a"), Err(PopError::Usage(_))));
        assert!(matches!(writer.set("a", 1), Err(PopError::Usage(_))));
        assert!(matches!(writer.write().await, Err(PopError::Usage(_))));
    }

    #[tokio::test]
    async fn test_required_read_of_missing_node() {
        let store = InMemoryStore::new();
        let s = store.connect();
        let mut writer = MergeWriter::new(&s, "/settings");
        let err = writer.read(true).await.unwrap_err();
        assert!(matches!(err, PopError::StateNotFound(p) if p == "/settings"));

        writer.read(false).await.unwrap();
        assert!(writer.keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_creates_missing_node() {
        let store = InMemoryStore::new();
        let s = store.connect();
        let mut writer = MergeWriter::new(&s, "/settings");
        writer.read(false).await.unwrap();
        writer.set("port", 0).unwrap();
        let changes = writer.write().await.unwrap();
        assert_eq!(
            changes,
            vec![Change::Added {
                key: "port".into(),
                value: Value::from(0)
            }]
        );

        let mut reader = MergeWriter::new(&s, "/settings");
        reader.read(true).await.unwrap();
        assert_eq!(reader.get("port").unwrap(), Some(&Value::from(0)));
    }

    #[tokio::test]
    async fn test_second_write_without_edits_is_empty() {
        let store = InMemoryStore::new();
        let s = store.connect();
        let mut writer = MergeWriter::new(&s, "/settings");
        writer.read(false).await.unwrap();
        writer.set("a", 1).unwrap();
        writer.write().await.unwrap();
        assert!(writer.write().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_reported_only_when_present_remotely() {
        let store = InMemoryStore::new();
        let s = store.connect();
        s.create("/settings", b"a: 1\nb: 2\n", CreateMode::Persistent, &[])
            .await
            .unwrap();

        let mut first = MergeWriter::new(&s, "/settings");
        first.read(true).await.unwrap();
        let mut second = MergeWriter::new(&s, "/settings");
        second.read(true).await.unwrap();

        first.delete("b").unwrap();
        assert_eq!(first.write().await.unwrap().len(), 1);

        second.delete("b").unwrap();
        assert!(second.write().await.unwrap().is_empty());
    }
}
