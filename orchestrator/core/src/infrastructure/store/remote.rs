// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Remote Store Client
//!
//! [`CoordinationStore`] over a TCP connection to a [`StoreServer`].
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Session-per-connection client adapter
//!
//! A reader task routes `response` frames to their waiting request by `xid`
//! and `watch` frames to the matching [`Watch`]. The watch sender is
//! registered while the arming response is handled, so an event can never
//! overtake the watch it belongs to.
//!
//! [`StoreServer`]: super::server::StoreServer

use super::protocol::{self, Reply, Request, RequestFrame, ServerFrame, MAX_FRAME};
use crate::domain::store::{
    Acl, CoordinationStore, CreateMode, SessionId, Stat, StoreError, StoreResult, Version, Watch,
    WatchEvent, WatchId,
};
use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Lines = SplitStream<Framed<TcpStream, LinesCodec>>;

struct Pending {
    reply: oneshot::Sender<StoreResult<Reply>>,
    watch: Option<oneshot::Sender<WatchEvent>>,
}

#[derive(Default)]
struct Routes {
    pending: HashMap<u64, Pending>,
    watches: HashMap<WatchId, oneshot::Sender<WatchEvent>>,
}

/// Client session on a remote coordination store.
pub struct RemoteStore {
    session_id: SessionId,
    outbound: mpsc::UnboundedSender<String>,
    routes: Arc<Mutex<Routes>>,
    next_xid: AtomicU64,
    closed: CancellationToken,
}

impl RemoteStore {
    pub async fn connect(addr: impl ToSocketAddrs) -> StoreResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| StoreError::ConnectionLoss(e.to_string()))?;
        let (mut sink, mut lines) =
            Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME)).split();

        let session_id = match lines.next().await {
            Some(Ok(line)) => match protocol::decode::<ServerFrame>(&line)? {
                ServerFrame::Hello { session_id } => session_id,
                other => {
                    return Err(StoreError::Protocol(format!(
                        "expected hello, got {other:?}"
                    )))
                }
            },
            Some(Err(e)) => return Err(StoreError::ConnectionLoss(e.to_string())),
            None => return Err(StoreError::ConnectionLoss("closed during handshake".into())),
        };

        let routes = Arc::new(Mutex::new(Routes::default()));
        let closed = CancellationToken::new();
        let (outbound, mut queue) = mpsc::unbounded_channel::<String>();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    line = queue.recv() => match line {
                        Some(line) => line,
                        None => break,
                    },
                };
                if let Err(e) = sink.send(line).await {
                    debug!(error = %e, "Store write failed");
                    writer_closed.cancel();
                    break;
                }
            }
        });

        tokio::spawn(read_loop(lines, Arc::clone(&routes), closed.clone()));

        debug!(session = %session_id, "Connected to coordination store");
        Ok(Self {
            session_id,
            outbound,
            routes,
            next_xid: AtomicU64::new(1),
            closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn call(
        &self,
        op: Request,
        watch: Option<oneshot::Sender<WatchEvent>>,
    ) -> StoreResult<Reply> {
        if self.closed.is_cancelled() {
            return Err(StoreError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        let line = protocol::encode(&RequestFrame { xid, op })?;
        self.routes
            .lock()
            .pending
            .insert(xid, Pending { reply: tx, watch });
        if self.outbound.send(line).is_err() {
            self.routes.lock().pending.remove(&xid);
            return Err(StoreError::SessionClosed);
        }
        rx.await
            .map_err(|_| StoreError::ConnectionLoss("connection closed".into()))?
    }

    /// Build the client half of a watch the server acknowledged.
    fn watch(&self, watch_id: WatchId, path: &str, event: oneshot::Receiver<WatchEvent>) -> Watch {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let routes = Arc::clone(&self.routes);
        let outbound = self.outbound.clone();
        let closed = self.closed.clone();
        let next_xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = cancelled.cancelled() => {
                    // Still routed means it never fired; tell the server.
                    if routes.lock().watches.remove(&watch_id).is_some() {
                        let frame = RequestFrame {
                            xid: next_xid,
                            op: Request::CancelWatch { watch_id },
                        };
                        if let Ok(line) = protocol::encode(&frame) {
                            let _ = outbound.send(line);
                        }
                    }
                }
            }
        });
        Watch::new(watch_id, path, event, token)
    }
}

fn unexpected(reply: Reply) -> StoreError {
    StoreError::Protocol(format!("unexpected reply: {reply:?}"))
}

async fn read_loop(mut lines: Lines, routes: Arc<Mutex<Routes>>, closed: CancellationToken) {
    loop {
        let line = tokio::select! {
            _ = closed.cancelled() => break,
            line = lines.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                debug!(error = %e, "Store read failed");
                break;
            }
            None => break,
        };
        match protocol::decode::<ServerFrame>(&line) {
            Ok(ServerFrame::Response { xid, result }) => {
                let mut routes = routes.lock();
                // Unknown xids are fire-and-forget requests.
                let Some(pending) = routes.pending.remove(&xid) else {
                    continue;
                };
                if let (Ok(reply), Some(sender)) = (&result, pending.watch) {
                    if let Some(watch_id) = reply.watch_id() {
                        routes.watches.insert(watch_id, sender);
                    }
                }
                let _ = pending.reply.send(result);
            }
            Ok(ServerFrame::Watch { watch_id, event }) => {
                if let Some(sender) = routes.lock().watches.remove(&watch_id) {
                    let _ = sender.send(event);
                }
            }
            Ok(ServerFrame::Hello { .. }) => warn!("Ignoring repeated hello"),
            Err(e) => {
                warn!(error = %e, "Malformed frame from store");
                break;
            }
        }
    }

    closed.cancel();
    let mut routes = routes.lock();
    for (_, pending) in routes.pending.drain() {
        let _ = pending
            .reply
            .send(Err(StoreError::ConnectionLoss("connection closed".into())));
    }
    // Dropping the senders fails every outstanding watch.
    routes.watches.clear();
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl CoordinationStore for RemoteStore {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: &[Acl],
    ) -> StoreResult<String> {
        let op = Request::Create {
            path: path.to_string(),
            data: data.to_vec(),
            mode,
            acl: acl.to_vec(),
        };
        match self.call(op, None).await? {
            Reply::Created { path } => Ok(path),
            other => Err(unexpected(other)),
        }
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)> {
        let op = Request::Get {
            path: path.to_string(),
        };
        match self.call(op, None).await? {
            Reply::Data { data, stat } => Ok((data, stat)),
            other => Err(unexpected(other)),
        }
    }

    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>> {
        let op = Request::Exists {
            path: path.to_string(),
        };
        match self.call(op, None).await? {
            Reply::Exists { stat } => Ok(stat),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&self, path: &str, data: &[u8], expected: Option<Version>) -> StoreResult<Stat> {
        let op = Request::Set {
            path: path.to_string(),
            data: data.to_vec(),
            version: expected,
        };
        match self.call(op, None).await? {
            Reply::Stat { stat } => Ok(stat),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, path: &str, expected: Option<Version>) -> StoreResult<()> {
        let op = Request::Delete {
            path: path.to_string(),
            version: expected,
        };
        match self.call(op, None).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let op = Request::GetChildren {
            path: path.to_string(),
        };
        match self.call(op, None).await? {
            Reply::Children { children } => Ok(children),
            other => Err(unexpected(other)),
        }
    }

    async fn get_children_and_watch(&self, path: &str) -> StoreResult<(Vec<String>, Watch)> {
        let (tx, rx) = oneshot::channel();
        let op = Request::GetChildrenAndWatch {
            path: path.to_string(),
        };
        match self.call(op, Some(tx)).await? {
            Reply::ChildrenWatch { children, watch_id } => {
                Ok((children, self.watch(watch_id, path, rx)))
            }
            other => Err(unexpected(other)),
        }
    }

    async fn get_and_watch(&self, path: &str) -> StoreResult<(Vec<u8>, Stat, Watch)> {
        let (tx, rx) = oneshot::channel();
        let op = Request::GetAndWatch {
            path: path.to_string(),
        };
        match self.call(op, Some(tx)).await? {
            Reply::DataWatch {
                data,
                stat,
                watch_id,
            } => Ok((data, stat, self.watch(watch_id, path, rx))),
            other => Err(unexpected(other)),
        }
    }

    async fn get_acl(&self, path: &str) -> StoreResult<Vec<Acl>> {
        let op = Request::GetAcl {
            path: path.to_string(),
        };
        match self.call(op, None).await? {
            Reply::Acl { acl } => Ok(acl),
            other => Err(unexpected(other)),
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        let result = self.call(Request::Close, None).await;
        self.closed.cancel();
        match result {
            Ok(_) | Err(StoreError::ConnectionLoss(_)) | Err(StoreError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
