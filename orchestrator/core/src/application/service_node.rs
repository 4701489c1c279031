// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Service Node
//!
//! Accessors over one `services/<name>` subtree.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Typed reads and CAS writes of a service definition

use crate::application::merge_writer::MergeWriter;
use crate::application::store_ops::retry_change;
use crate::domain::errors::{PopError, PopResult};
use crate::domain::namespace::Namespace;
use crate::domain::settings::{
    decode_list, decode_mapping, encode_list, layer, Change, Descriptor, Settings,
};
use crate::domain::store::{CoordinationStore, CreateMode, StoreError};
use std::collections::BTreeSet;
use tracing::info;

pub struct ServiceNode<'a> {
    store: &'a dyn CoordinationStore,
    namespace: &'a Namespace,
    name: String,
}

impl<'a> ServiceNode<'a> {
    pub fn new(
        store: &'a dyn CoordinationStore,
        namespace: &'a Namespace,
        name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            namespace,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> String {
        self.namespace.service(&self.name)
    }

    /// Fail with [`PopError::StateNotFound`] unless the service exists.
    pub async fn require(&self) -> PopResult<()> {
        let path = self.path();
        match self.store.exists(&path).await? {
            Some(_) => Ok(()),
            None => Err(PopError::StateNotFound(path)),
        }
    }

    /// Create the subtree: the service node, `type`, an empty `machines`
    /// list and an empty `state` collection.
    pub async fn create(&self, service_type: &str) -> PopResult<()> {
        let path = self.path();
        match self.store.create(&path, b"", CreateMode::Persistent, &[]).await {
            Ok(_) => {}
            Err(StoreError::NodeExists(_)) => {
                return Err(PopError::State(format!(
                    "service '{}' already exists",
                    self.name
                )))
            }
            Err(StoreError::NoNode(_)) => {
                return Err(PopError::State(format!(
                    "namespace {} is not initialized; run 'init' first",
                    self.namespace.prefix()
                )))
            }
            Err(e) => return Err(e.into()),
        }

        let machines_path = self.namespace.service_machines(&self.name);
        let empty = encode_list(&machines_path, &[])?;
        self.store
            .create(
                &self.namespace.service_type(&self.name),
                service_type.as_bytes(),
                CreateMode::Persistent,
                &[],
            )
            .await?;
        self.store
            .create(&machines_path, &empty, CreateMode::Persistent, &[])
            .await?;
        self.store
            .create(
                &self.namespace.service_state(&self.name),
                b"",
                CreateMode::Persistent,
                &[],
            )
            .await?;
        info!(service = %self.name, service_type, path = %path, "Registered service");
        Ok(())
    }

    pub async fn service_type(&self) -> PopResult<String> {
        let path = self.namespace.service_type(&self.name);
        match self.store.get(&path).await {
            Ok((data, _)) => String::from_utf8(data)
                .map(|s| s.trim().to_string())
                .map_err(|e| PopError::serialization(&path, e)),
            Err(StoreError::NoNode(_)) => Err(PopError::StateNotFound(path)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn machines(&self) -> PopResult<Vec<String>> {
        let path = self.namespace.service_machines(&self.name);
        match self.store.get(&path).await {
            Ok((data, _)) => decode_list(&path, &data),
            Err(StoreError::NoNode(_)) => Err(PopError::StateNotFound(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Append `machine_id` to the placement list. Duplicates are kept.
    pub async fn append_machine(&self, machine_id: &str) -> PopResult<Vec<String>> {
        let path = self.namespace.service_machines(&self.name);
        let mut updated = Vec::new();
        retry_change(self.store, &path, |current| {
            let mut machines = decode_list(&path, current)?;
            machines.push(machine_id.to_string());
            let payload = encode_list(&path, &machines)?;
            updated = machines;
            Ok(payload)
        })
        .await?;
        Ok(updated)
    }

    pub fn settings_writer(&self) -> MergeWriter<'a> {
        MergeWriter::new(self.store, self.namespace.service_settings(&self.name))
    }

    /// Merge-write `options` into `settings`, logging each change.
    pub async fn update_settings(&self, options: &Settings) -> PopResult<Vec<Change>> {
        let mut writer = self.settings_writer();
        writer.read(false).await?;
        for (key, value) in options {
            writer.set(key.clone(), value.clone())?;
        }
        let changes = writer.write().await?;
        for change in &changes {
            info!(service = %self.name, "{}", change);
        }
        Ok(changes)
    }

    /// Stored overrides layered over `defaults`.
    pub async fn settings(&self, defaults: &Settings) -> PopResult<Settings> {
        let mut writer = self.settings_writer();
        writer.read(false).await?;
        Ok(layer(defaults, writer.local()?))
    }

    /// Machines with a live state node.
    pub async fn running_machines(&self) -> PopResult<BTreeSet<String>> {
        let path = self.namespace.service_state(&self.name);
        match self.store.get_children(&path).await {
            Ok(children) => Ok(children.into_iter().collect()),
            Err(StoreError::NoNode(_)) => Ok(BTreeSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Descriptor published by `machine_id`, if it is running there.
    pub async fn state(&self, machine_id: &str) -> PopResult<Option<Descriptor>> {
        let path = self.namespace.service_state_for(&self.name, machine_id);
        match self.store.get(&path).await {
            Ok((data, _)) => decode_mapping(&path, &data).map(Some),
            Err(StoreError::NoNode(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
