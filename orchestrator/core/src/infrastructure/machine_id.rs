// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Local machine identity.
//!
//! Resolution order: explicit override, `/etc/machine-id`,
//! `/var/lib/dbus/machine-id`, then a name-based UUID derived from the host
//! name so the id is stable across restarts.

use std::path::Path;
use tracing::debug;
use uuid::Uuid;

const MACHINE_ID_FILES: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

pub fn resolve_machine_id(explicit: Option<&str>) -> String {
    if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    for file in MACHINE_ID_FILES {
        if let Some(id) = read_id_file(Path::new(file)) {
            debug!(source = file, machine_id = %id, "Resolved machine id");
            return id;
        }
    }
    let id = hostname_id(&local_hostname());
    debug!(machine_id = %id, "Derived machine id from host name");
    id
}

fn read_id_file(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let id = content.trim();
    (!id.is_empty() && !id.contains('/')).then(|| id.to_string())
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn hostname_id(hostname: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, hostname.as_bytes())
        .simple()
        .to_string()
}
