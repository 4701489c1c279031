// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Store wire protocol.
//!
//! Newline-delimited JSON over TCP. The server greets each connection with
//! `hello`, then answers `{xid, op}` requests with `response` frames carrying
//! the same `xid`. Watch events arrive as unsolicited `watch` frames, always
//! after the response that armed the watch. Payload bytes travel as base64.

use crate::domain::store::{Acl, CreateMode, SessionId, Stat, StoreError, Version, WatchEvent, WatchId};
use serde::{Deserialize, Serialize};

/// Longest accepted frame.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub xid: u64,
    pub op: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Create {
        path: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        mode: CreateMode,
        acl: Vec<Acl>,
    },
    Get {
        path: String,
    },
    Exists {
        path: String,
    },
    Set {
        path: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        version: Option<Version>,
    },
    Delete {
        path: String,
        version: Option<Version>,
    },
    GetChildren {
        path: String,
    },
    GetChildrenAndWatch {
        path: String,
    },
    GetAndWatch {
        path: String,
    },
    GetAcl {
        path: String,
    },
    CancelWatch {
        watch_id: WatchId,
    },
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Created {
        path: String,
    },
    Data {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        stat: Stat,
    },
    Exists {
        stat: Option<Stat>,
    },
    Stat {
        stat: Stat,
    },
    Done,
    Children {
        children: Vec<String>,
    },
    ChildrenWatch {
        children: Vec<String>,
        watch_id: WatchId,
    },
    DataWatch {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        stat: Stat,
        watch_id: WatchId,
    },
    Acl {
        acl: Vec<Acl>,
    },
}

impl Reply {
    pub fn watch_id(&self) -> Option<WatchId> {
        match self {
            Reply::ChildrenWatch { watch_id, .. } | Reply::DataWatch { watch_id, .. } => {
                Some(*watch_id)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Hello {
        session_id: SessionId,
    },
    Response {
        xid: u64,
        result: Result<Reply, StoreError>,
    },
    Watch {
        watch_id: WatchId,
        event: WatchEvent,
    },
}

pub fn encode<T: Serialize>(frame: &T) -> Result<String, StoreError> {
    serde_json::to_string(frame).map_err(|e| StoreError::Protocol(e.to_string()))
}

pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, StoreError> {
    serde_json::from_str(line).map_err(|e| StoreError::Protocol(format!("{e}: {line:.200}")))
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
