// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Store Server
//!
//! Serves an [`InMemoryStore`] over TCP so that several `pop` processes on
//! one or more machines share a single hierarchy.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Network front for the coordination store
//!
//! Each connection owns exactly one store session. Closing or dropping the
//! connection closes that session, which removes its ephemeral nodes.

use super::memory::{InMemoryStore, MemorySession};
use super::protocol::{self, Reply, Request, RequestFrame, ServerFrame, MAX_FRAME};
use crate::domain::store::{CoordinationStore, StoreError, StoreResult, Watch, WatchId};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct StoreServer {
    store: InMemoryStore,
    listener: TcpListener,
}

impl StoreServer {
    pub async fn bind(addr: impl ToSocketAddrs, store: InMemoryStore) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { store, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> io::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, "Coordination store listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = self.store.connect();
                        debug!(%peer, session = %session.session_id(), "Store client connected");
                        connections.spawn(serve_connection(stream, session, shutdown.child_token()));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!("Coordination store shutting down");
        drop(self.listener);
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

struct Connection {
    session: MemorySession,
    outbound: mpsc::UnboundedSender<ServerFrame>,
    watches: HashMap<WatchId, CancellationToken>,
}

async fn serve_connection(stream: TcpStream, session: MemorySession, shutdown: CancellationToken) {
    let session_id = session.session_id();
    let (mut sink, mut lines) =
        Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME)).split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            let line = match protocol::encode(&frame) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                debug!(error = %e, "Store client write failed");
                break;
            }
        }
    });

    let mut conn = Connection {
        session,
        outbound,
        watches: HashMap::new(),
    };
    let _ = conn.outbound.send(ServerFrame::Hello { session_id });

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = conn.session.closed() => {
                debug!(session = %session_id, "Session closed under connection");
                break;
            }
            line = lines.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                debug!(session = %session_id, error = %e, "Store client read failed");
                break;
            }
            None => break,
        };
        let frame: RequestFrame = match protocol::decode(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session = %session_id, error = %e, "Malformed request");
                break;
            }
        };
        let closing = matches!(frame.op, Request::Close);
        conn.handle(frame).await;
        if closing {
            break;
        }
    }

    for (_, token) in conn.watches.drain() {
        token.cancel();
    }
    let _ = conn.session.close().await;
    debug!(session = %session_id, "Store client disconnected");
    drop(conn);
    let _ = writer.await;
}

impl Connection {
    async fn handle(&mut self, frame: RequestFrame) {
        let xid = frame.xid;
        let (result, watch) = match self.execute(frame.op).await {
            Ok((reply, watch)) => (Ok(reply), watch),
            Err(e) => (Err(e), None),
        };
        // The response is queued before the watch can forward anything, so a
        // client always learns the watch id before its event.
        let _ = self.outbound.send(ServerFrame::Response { xid, result });
        if let Some(watch) = watch {
            self.forward(watch);
        }
    }

    async fn execute(&mut self, op: Request) -> StoreResult<(Reply, Option<Watch>)> {
        let store = &self.session;
        let reply = match op {
            Request::Create {
                path,
                data,
                mode,
                acl,
            } => Reply::Created {
                path: store.create(&path, &data, mode, &acl).await?,
            },
            Request::Get { path } => {
                let (data, stat) = store.get(&path).await?;
                Reply::Data { data, stat }
            }
            Request::Exists { path } => Reply::Exists {
                stat: store.exists(&path).await?,
            },
            Request::Set {
                path,
                data,
                version,
            } => Reply::Stat {
                stat: store.set(&path, &data, version).await?,
            },
            Request::Delete { path, version } => {
                store.delete(&path, version).await?;
                Reply::Done
            }
            Request::GetChildren { path } => Reply::Children {
                children: store.get_children(&path).await?,
            },
            Request::GetChildrenAndWatch { path } => {
                let (children, watch) = store.get_children_and_watch(&path).await?;
                let reply = Reply::ChildrenWatch {
                    children,
                    watch_id: watch.id(),
                };
                return Ok((reply, Some(watch)));
            }
            Request::GetAndWatch { path } => {
                let (data, stat, watch) = store.get_and_watch(&path).await?;
                let reply = Reply::DataWatch {
                    data,
                    stat,
                    watch_id: watch.id(),
                };
                return Ok((reply, Some(watch)));
            }
            Request::GetAcl { path } => Reply::Acl {
                acl: store.get_acl(&path).await?,
            },
            Request::CancelWatch { watch_id } => {
                if let Some(token) = self.watches.remove(&watch_id) {
                    token.cancel();
                }
                Reply::Done
            }
            Request::Close => {
                store.close().await?;
                Reply::Done
            }
        };
        Ok((reply, None))
    }

    fn forward(&mut self, watch: Watch) {
        self.watches.retain(|_, token| !token.is_cancelled());
        let watch_id = watch.id();
        let token = watch.token();
        self.watches.insert(watch_id, token.clone());

        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                fired = watch.fired() => match fired {
                    Ok(event) => {
                        let _ = outbound.send(ServerFrame::Watch { watch_id, event });
                    }
                    Err(StoreError::SessionClosed) => {}
                    Err(e) => debug!(error = %e, "Watch ended"),
                },
            }
        });
    }
}
