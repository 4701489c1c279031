// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Line echo services.
//!
//! `echo` serves connections as tokio tasks; `threaded-echo` uses a blocking
//! listener with one OS thread per connection. Both echo every received
//! line back verbatim and report the bound address in their descriptor.

use crate::domain::errors::{PopError, PopResult};
use crate::domain::service::{Service, ServiceType};
use crate::domain::settings::{Descriptor, Settings};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_yaml::Value;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const MAX_LINE: usize = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const ECHO: ServiceType = ServiceType {
    name: "echo",
    description: "Line echo server on the async runtime",
    create: create_echo,
};

pub const THREADED_ECHO: ServiceType = ServiceType {
    name: "threaded-echo",
    description: "Line echo server with a thread per connection",
    create: create_threaded_echo,
};

fn create_echo() -> Box<dyn Service> {
    Box::new(EchoService::default())
}

fn create_threaded_echo() -> Box<dyn Service> {
    Box::new(ThreadedEchoService::default())
}

fn network_defaults() -> Settings {
    let mut defaults = Settings::new();
    defaults.insert("host".into(), Value::from(DEFAULT_HOST));
    defaults.insert("port".into(), Value::from(DEFAULT_PORT));
    defaults
}

fn bind_address(settings: &Settings) -> PopResult<(String, u16)> {
    let host = match settings.get("host") {
        Some(Value::String(host)) => host.clone(),
        Some(other) => {
            return Err(PopError::Config(format!("invalid host setting: {other:?}")))
        }
        None => DEFAULT_HOST.to_string(),
    };
    let port = match settings.get("port") {
        None => DEFAULT_PORT,
        Some(value) => value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| PopError::Config(format!("invalid port setting: {value:?}")))?,
    };
    Ok((host, port))
}

fn descriptor(addr: SocketAddr) -> Descriptor {
    let mut descriptor = Descriptor::new();
    descriptor.insert("host".into(), Value::from(addr.ip().to_string()));
    descriptor.insert("port".into(), Value::from(addr.port()));
    descriptor
}

struct Running {
    cancel: CancellationToken,
    accept: tokio::task::JoinHandle<()>,
}

/// Echo server on the async runtime.
#[derive(Default)]
pub struct EchoService {
    running: Option<Running>,
}

#[async_trait]
impl Service for EchoService {
    fn defaults(&self) -> Settings {
        network_defaults()
    }

    async fn start(&mut self, settings: &Settings) -> PopResult<Descriptor> {
        if self.running.is_some() {
            return Err(PopError::State("echo service already started".into()));
        }
        let (host, port) = bind_address(settings)?;
        let listener = TcpListener::bind((host.as_str(), port)).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(listener, cancel.clone()));
        info!(%addr, "Echo service listening");
        self.running = Some(Running { cancel, accept });
        Ok(descriptor(addr))
    }

    async fn stop(&mut self) -> PopResult<()> {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            if let Err(e) = running.accept.await {
                warn!(error = %e, "Echo accept loop ended abnormally");
            }
            info!("Echo service stopped");
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, cancel: CancellationToken) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Echo connection");
                    connections.spawn(echo_lines(stream, cancel.clone()));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    connections.shutdown().await;
}

async fn echo_lines(stream: tokio::net::TcpStream, cancel: CancellationToken) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = framed.next() => line,
        };
        match line {
            Some(Ok(line)) => {
                if let Err(e) = framed.send(line).await {
                    debug!(error = %e, "Echo write failed");
                    break;
                }
            }
            Some(Err(e)) => {
                debug!(error = %e, "Echo read failed");
                break;
            }
            None => break,
        }
    }
}

struct ThreadedRunning {
    stop: Arc<AtomicBool>,
    accept: JoinHandle<()>,
}

/// Echo server with a blocking listener and a thread per connection.
#[derive(Default)]
pub struct ThreadedEchoService {
    running: Option<ThreadedRunning>,
}

#[async_trait]
impl Service for ThreadedEchoService {
    fn defaults(&self) -> Settings {
        network_defaults()
    }

    async fn start(&mut self, settings: &Settings) -> PopResult<Descriptor> {
        if self.running.is_some() {
            return Err(PopError::State("threaded-echo service already started".into()));
        }
        let (host, port) = bind_address(settings)?;
        let listener = std::net::TcpListener::bind((host.as_str(), port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let accept = std::thread::Builder::new()
            .name("echo-accept".into())
            .spawn(move || blocking_accept_loop(listener, flag))?;
        info!(%addr, "Threaded echo service listening");
        self.running = Some(ThreadedRunning { stop, accept });
        Ok(descriptor(addr))
    }

    async fn stop(&mut self) -> PopResult<()> {
        if let Some(running) = self.running.take() {
            running.stop.store(true, Ordering::SeqCst);
            let joined = tokio::task::spawn_blocking(move || running.accept.join())
                .await
                .map_err(|e| PopError::Process(format!("join echo listener: {e}")))?;
            if joined.is_err() {
                warn!("Echo listener thread panicked");
            }
            info!("Threaded echo service stopped");
        }
        Ok(())
    }
}

fn blocking_accept_loop(listener: std::net::TcpListener, stop: Arc<AtomicBool>) {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "Echo connection");
                let flag = Arc::clone(&stop);
                match std::thread::Builder::new()
                    .name("echo-conn".into())
                    .spawn(move || blocking_echo(stream, flag))
                {
                    Ok(handle) => workers.push(handle),
                    Err(e) => warn!(error = %e, "Failed to spawn connection thread"),
                }
                workers.retain(|w| !w.is_finished());
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!(error = %e, "Accept failed");
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
    drop(listener);
    for worker in workers {
        let _ = worker.join();
    }
}

fn blocking_echo(stream: TcpStream, stop: Arc<AtomicBool>) {
    if let Err(e) = serve_blocking(stream, &stop) {
        debug!(error = %e, "Echo connection closed");
    }
}

fn serve_blocking(stream: TcpStream, stop: &AtomicBool) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL * 4))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while !stop.load(Ordering::SeqCst) {
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) if line.ends_with('\n') => {
                writer.write_all(line.as_bytes())?;
                writer.flush()?;
                line.clear();
            }
            // Partial line before a timeout; keep accumulating.
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as AsyncBufReader};

    fn ephemeral() -> Settings {
        let mut settings = network_defaults();
        settings.insert("port".into(), Value::from(0));
        settings
    }

    async fn roundtrip(port: u16) -> Vec<String> {
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = AsyncBufReader::new(read).lines();
        let mut echoed = Vec::new();
        for line in ["Hello world!", "What a fine day it is.", "Bye!"] {
            write.write_all(format!("{line}\n").as_bytes()).await.unwrap();
            echoed.push(lines.next_line().await.unwrap().unwrap());
        }
        echoed
    }

    fn port_of(descriptor: &Descriptor) -> u16 {
        descriptor["port"].as_u64().unwrap() as u16
    }

    #[tokio::test]
    async fn test_echo_service_roundtrip() {
        let mut service = EchoService::default();
        let descriptor = service.start(&ephemeral()).await.unwrap();
        let port = port_of(&descriptor);
        assert_ne!(port, 0);
        assert_eq!(descriptor["host"], Value::from("127.0.0.1"));

        assert_eq!(
            roundtrip(port).await,
            vec!["Hello world!", "What a fine day it is.", "Bye!"]
        );

        service.stop().await.unwrap();
        service.stop().await.unwrap();
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_threaded_echo_service_roundtrip() {
        let mut service = ThreadedEchoService::default();
        let descriptor = service.start(&ephemeral()).await.unwrap();
        let port = port_of(&descriptor);

        assert_eq!(
            roundtrip(port).await,
            vec!["Hello world!", "What a fine day it is.", "Bye!"]
        );

        service.stop().await.unwrap();
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[test]
    fn test_bind_address_parsing() {
        let mut settings = network_defaults();
        assert_eq!(bind_address(&settings).unwrap(), ("127.0.0.1".into(), 8080));
        settings.insert("port".into(), Value::from("9000"));
        assert_eq!(bind_address(&settings).unwrap().1, 9000);
        settings.insert("port".into(), Value::from(70_000));
        assert!(bind_address(&settings).is_err());
    }
}
