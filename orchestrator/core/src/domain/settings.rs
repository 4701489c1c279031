// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Settings
//!
//! Mapping-valued node payloads and the change records produced when they are
//! merge-written.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Payload codec for the structured mapping format (YAML)

use crate::domain::errors::{PopError, PopResult};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;

/// String-keyed mapping of scalars (or nested mappings).
pub type Settings = BTreeMap<String, Value>;

/// What a running service reports about itself under `state/<machine-id>`.
pub type Descriptor = Settings;

const RENDER_LIMIT: usize = 100;

/// One key-level difference applied by a merge-write.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Added { key: String, value: Value },
    Modified { key: String, old: Value, new: Value },
    Deleted { key: String, old: Value },
}

impl Change {
    pub fn key(&self) -> &str {
        match self {
            Change::Added { key, .. } | Change::Modified { key, .. } | Change::Deleted { key, .. } => {
                key
            }
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Added { key, value } => write!(
                f,
                "Setting changed: {}={} (was unset)",
                quote(key),
                render(value)
            ),
            Change::Modified { key, old, new } => write!(
                f,
                "Setting changed: {}={} (was {})",
                quote(key),
                render(new),
                render(old)
            ),
            Change::Deleted { key, old } => {
                write!(f, "Setting deleted: {} (was {})", quote(key), render(old))
            }
        }
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "\\'"))
}

/// Short single-line rendering of a value for audit logs.
pub fn render(value: &Value) -> String {
    let full = match value {
        Value::String(s) => quote(s),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{other:?}")),
    };
    truncate(&full, RENDER_LIMIT)
}

fn truncate(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

fn is_blank(data: &[u8]) -> bool {
    data.iter().all(|b| b.is_ascii_whitespace())
}

/// Decode a mapping payload. Empty payloads decode to an empty mapping.
pub fn decode_mapping(path: &str, data: &[u8]) -> PopResult<Settings> {
    if is_blank(data) {
        return Ok(Settings::new());
    }
    match serde_yaml::from_slice::<Value>(data).map_err(|e| PopError::serialization(path, e))? {
        Value::Null => Ok(Settings::new()),
        value => serde_yaml::from_value(value).map_err(|e| PopError::serialization(path, e)),
    }
}

pub fn encode_mapping(path: &str, settings: &Settings) -> PopResult<Vec<u8>> {
    serde_yaml::to_string(settings)
        .map(String::into_bytes)
        .map_err(|e| PopError::serialization(path, e))
}

/// Decode a list payload. Empty payloads decode to an empty list.
pub fn decode_list(path: &str, data: &[u8]) -> PopResult<Vec<String>> {
    if is_blank(data) {
        return Ok(Vec::new());
    }
    match serde_yaml::from_slice::<Value>(data).map_err(|e| PopError::serialization(path, e))? {
        Value::Null => Ok(Vec::new()),
        value => serde_yaml::from_value(value).map_err(|e| PopError::serialization(path, e)),
    }
}

pub fn encode_list(path: &str, items: &[String]) -> PopResult<Vec<u8>> {
    serde_yaml::to_string(items)
        .map(String::into_bytes)
        .map_err(|e| PopError::serialization(path, e))
}

/// Decode an arbitrary payload for `dump`. Empty payloads become `{}`.
pub fn decode_value(path: &str, data: &[u8]) -> PopResult<Value> {
    if is_blank(data) {
        return Ok(Value::Mapping(Default::default()));
    }
    serde_yaml::from_slice(data).map_err(|e| PopError::serialization(path, e))
}

/// Stored overrides layered over defaults.
pub fn layer(defaults: &Settings, overrides: &Settings) -> Settings {
    let mut merged = defaults.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Parse a `key=value` CLI option; the value is read as a YAML scalar so
/// `port=0` stores an integer.
pub fn parse_option(option: &str) -> PopResult<(String, Value)> {
    let (key, raw) = option
        .split_once('=')
        .ok_or_else(|| PopError::Usage(format!("expected key=value, got {option:?}")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(PopError::Usage(format!("empty key in option {option:?}")));
    }
    let value = if raw.is_empty() {
        Value::String(String::new())
    } else {
        serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    };
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payloads_decode_empty() {
        assert!(decode_mapping("/x", b"").unwrap().is_empty());
        assert!(decode_mapping("/x", b"\n").unwrap().is_empty());
        assert!(decode_list("/x", b"").unwrap().is_empty());
        assert_eq!(
            decode_value("/x", b"").unwrap(),
            Value::Mapping(Default::default())
        );
    }

    #[test]
    fn test_nested_mapping_roundtrip() {
        let yaml = b"host: 127.0.0.1\nport: 0\nnested:\n  a: 1\n  b: two\n";
        let decoded = decode_mapping("/x", yaml).unwrap();
        let encoded = encode_mapping("/x", &decoded).unwrap();
        assert_eq!(decode_mapping("/x", &encoded).unwrap(), decoded);
        assert_eq!(decoded["port"], Value::from(0));
    }

    #[test]
    fn test_non_mapping_payload_is_rejected() {
        let err = decode_mapping("/x", b"- a\n- b\n").unwrap_err();
        assert!(matches!(err, PopError::Serialization { .. }));
    }

    #[test]
    fn test_change_rendering() {
        let added = Change::Added {
            key: "port".into(),
            value: Value::from(0),
        };
        assert_eq!(added.to_string(), "Setting changed: 'port'=0 (was unset)");

        let modified = Change::Modified {
            key: "host".into(),
            old: Value::from("127.0.0.1"),
            new: Value::from("0.0.0.0"),
        };
        assert_eq!(
            modified.to_string(),
            "Setting changed: 'host'='0.0.0.0' (was '127.0.0.1')"
        );

        let deleted = Change::Deleted {
            key: "host".into(),
            old: Value::from("x".repeat(300)),
        };
        let rendered = deleted.to_string();
        assert!(rendered.starts_with("Setting deleted: 'host' (was 'xxx"));
        assert_eq!(rendered.len(), "Setting deleted: 'host' (was )".len() + 100);
    }

    #[test]
    fn test_layering_prefers_overrides() {
        let mut defaults = Settings::new();
        defaults.insert("host".into(), Value::from("127.0.0.1"));
        defaults.insert("port".into(), Value::from(8080));
        let mut overrides = Settings::new();
        overrides.insert("port".into(), Value::from(0));
        let merged = layer(&defaults, &overrides);
        assert_eq!(merged["host"], Value::from("127.0.0.1"));
        assert_eq!(merged["port"], Value::from(0));
    }

    #[test]
    fn test_parse_option() {
        assert_eq!(parse_option("port=0").unwrap(), ("port".into(), Value::from(0)));
        assert_eq!(
            parse_option("host=localhost").unwrap(),
            ("host".into(), Value::from("localhost"))
        );
        assert_eq!(
            parse_option("url=a=b").unwrap(),
            ("url".into(), Value::from("a=b"))
        );
        assert!(parse_option("novalue").is_err());
    }
}
