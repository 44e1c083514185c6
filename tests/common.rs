//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use bucketlink::core::config::{ClientConfig, ConfigMode};
use bucketlink::protocol::{Cas, Magic, Opcode, Packet, PacketDecoder};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub use bucketlink::protocol::Status;

pub const BUCKET: &str = "default";
pub const PASSWORD: &str = "secret";

/// Write `content` to a temporary config file.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    write_config(
        r#"
[cluster]
hosts = ["127.0.0.1:8091"]
"#,
    )
}

/// Create an in-band configuration file with custom settings.
pub fn create_config_with_settings(hosts: &str, bucket: &str, log_level: &str) -> NamedTempFile {
    write_config(&format!(
        r#"
[cluster]
hosts = [{}]
mode = "in_band"
bucket = "{}"

[telemetry]
log_level = "{}"
"#,
        hosts, bucket, log_level
    ))
}

/// Topology document for a one-node cluster with `partitions` partitions.
///
/// `$HOST` is left for the client to substitute.
pub fn single_node_doc(rev: i64, mgmt_port: u16, data_port: u16, partitions: usize) -> String {
    let map = vec!["[0]"; partitions].join(",");
    format!(
        r#"{{"rev":{rev},"name":"{BUCKET}",
            "nodes":[{{"hostname":"$HOST:{mgmt_port}","ports":{{"direct":{data_port}}}}}],
            "vBucketServerMap":{{"hashAlgorithm":"CRC","numReplicas":0,
                "serverList":["$HOST:{data_port}"],"vBucketMap":[{map}]}}}}"#
    )
}

/// Client configuration pointing at a mock node over in-band discovery.
pub fn in_band_config(addr: SocketAddr) -> ClientConfig {
    let mut config = ClientConfig::new([addr.to_string()])
        .with_mode(ConfigMode::InBand)
        .with_bucket(BUCKET)
        .with_password(PASSWORD)
        .with_operation_timeout(Duration::from_secs(2));
    config.timeouts.reschedule_delay_ms = 20;
    config
}

// ============================================================================
// Mock data node
// ============================================================================

#[derive(Debug, Clone)]
pub struct Item {
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

/// In-memory state of the mock node.
#[derive(Debug, Default)]
pub struct NodeState {
    pub items: HashMap<Vec<u8>, Item>,
    /// Keys answered once with "not my partition".
    pub not_my_partition_once: HashSet<Vec<u8>>,
    /// Keys answered once with "busy".
    pub busy_once: HashSet<Vec<u8>>,
    /// Opcodes received, in order.
    pub received: Vec<u8>,
    /// Topology served to in-band fetches.
    pub config: String,
    next_cas: u64,
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0)
}

fn be_u64(bytes: &[u8], offset: usize) -> u64 {
    bytes
        .get(offset..offset + 8)
        .map(|b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            u64::from_be_bytes(raw)
        })
        .unwrap_or(0)
}

impl NodeState {
    fn cas(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }

    /// Answer one request. `None` means a quiet success.
    pub fn handle(&mut self, request: &Packet) -> Option<Packet> {
        if request.magic != Magic::Request {
            return None;
        }
        self.received.push(request.opcode);
        let Some(opcode) = request.opcode() else {
            return None;
        };
        let reply = |status: Status| Packet::response(opcode, status).with_opaque(request.opaque);
        let key = request.key.to_vec();

        if self.not_my_partition_once.remove(&key) {
            return Some(reply(Status::NotMyVbucket).with_value(self.config.clone()));
        }
        if self.busy_once.remove(&key) {
            return Some(reply(Status::Busy));
        }

        let quiet = opcode.is_quiet();
        let response = match opcode.to_non_quiet() {
            Opcode::SaslAuth => {
                let expected = format!("\0{}\0{}", BUCKET, PASSWORD);
                if request.value.as_ref() == expected.as_bytes() {
                    reply(Status::Success)
                } else {
                    reply(Status::AuthError)
                }
            }
            Opcode::GetClusterConfig => reply(Status::Success).with_value(self.config.clone()),
            Opcode::Noop => reply(Status::Success),
            base @ (Opcode::Set | Opcode::Add | Opcode::Replace) => {
                let existing = self.items.get(&key).map(|item| item.cas);
                let status = match (base, existing) {
                    (Opcode::Add, Some(_)) => Some(Status::KeyExists),
                    (Opcode::Replace, None) => Some(Status::KeyNotFound),
                    (_, current) if !request.cas.is_zero() && current != Some(request.cas.0) => {
                        Some(if current.is_some() {
                            Status::KeyExists
                        } else {
                            Status::KeyNotFound
                        })
                    }
                    _ => None,
                };
                match status {
                    Some(status) => reply(status),
                    None => {
                        let cas = self.cas();
                        let item = Item {
                            value: request.value.clone(),
                            flags: be_u32(&request.extras, 0),
                            cas,
                        };
                        self.items.insert(key, item);
                        reply(Status::Success).with_cas(Cas(cas))
                    }
                }
            }
            base @ (Opcode::Append | Opcode::Prepend) => match self.items.get(&key).cloned() {
                Some(item) => {
                    let mut value = Vec::new();
                    if base == Opcode::Append {
                        value.extend_from_slice(&item.value);
                        value.extend_from_slice(&request.value);
                    } else {
                        value.extend_from_slice(&request.value);
                        value.extend_from_slice(&item.value);
                    }
                    let cas = self.cas();
                    self.items.insert(
                        key,
                        Item {
                            value: Bytes::from(value),
                            cas,
                            ..item
                        },
                    );
                    reply(Status::Success).with_cas(Cas(cas))
                }
                None => reply(Status::NotStored),
            },
            Opcode::Get | Opcode::Gat | Opcode::GetLocked => match self.items.get(&key) {
                Some(item) => reply(Status::Success)
                    .with_extras(item.flags.to_be_bytes().to_vec())
                    .with_value(item.value.clone())
                    .with_cas(Cas(item.cas)),
                None => reply(Status::KeyNotFound),
            },
            Opcode::Delete => match self.items.remove(&key) {
                Some(_) => {
                    let cas = self.cas();
                    reply(Status::Success).with_cas(Cas(cas))
                }
                None => reply(Status::KeyNotFound),
            },
            base @ (Opcode::Increment | Opcode::Decrement) => {
                let delta = be_u64(&request.extras, 0);
                let initial = be_u64(&request.extras, 8);
                let expiry = be_u32(&request.extras, 16);
                let current = self
                    .items
                    .get(&key)
                    .and_then(|item| std::str::from_utf8(&item.value).ok()?.parse::<u64>().ok());
                let next = match current {
                    Some(current) if base == Opcode::Increment => Some(current.wrapping_add(delta)),
                    Some(current) => Some(current.saturating_sub(delta)),
                    None if expiry == u32::MAX => None,
                    None => Some(initial),
                };
                match next {
                    Some(next) => {
                        let cas = self.cas();
                        let item = Item {
                            value: Bytes::from(next.to_string()),
                            flags: 0,
                            cas,
                        };
                        self.items.insert(key, item);
                        reply(Status::Success)
                            .with_value(next.to_be_bytes().to_vec())
                            .with_cas(Cas(cas))
                    }
                    None => reply(Status::KeyNotFound),
                }
            }
            _ => reply(Status::UnknownCommand),
        };

        if quiet && response.status() == u16::from(Status::Success) {
            return None;
        }
        Some(response)
    }
}

/// A data node on loopback speaking the binary protocol.
pub struct MockNode {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<NodeState>>,
    task: JoinHandle<()>,
}

impl MockNode {
    /// Start a node serving a single-node topology with four partitions.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(NodeState {
            config: single_node_doc(1, 8091, addr.port(), 4),
            ..Default::default()
        }));

        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_data(socket, shared.clone()));
            }
        });
        Self { addr, state, task }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_data(mut socket: TcpStream, state: Arc<Mutex<NodeState>>) {
    let mut decoder = PacketDecoder::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let Ok(requests) = decoder.feed(&buf[..n]) else {
            return;
        };
        for request in requests {
            let response = state.lock().unwrap().handle(&request);
            let Some(response) = response else {
                continue;
            };
            let Ok(frame) = response.encode() else {
                return;
            };
            if socket.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}

// ============================================================================
// Mock management node
// ============================================================================

/// Streams topology documents over HTTP the way a management port does.
pub struct MockStream {
    pub addr: SocketAddr,
    pub paths: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl MockStream {
    /// Serve `documents` (separated and never closed) to every stream request.
    pub async fn start(documents: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let paths = Arc::new(Mutex::new(Vec::new()));

        let seen = paths.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_stream(socket, documents.clone(), seen.clone()));
            }
        });
        Self { addr, paths, task }
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_stream(mut socket: TcpStream, documents: Vec<String>, paths: Arc<Mutex<Vec<String>>>) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    let text = String::from_utf8_lossy(&request);
    if let Some(path) = text.lines().next().and_then(|line| line.split(' ').nth(1)) {
        paths.lock().unwrap().push(path.to_string());
    }

    let header = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n";
    if socket.write_all(header.as_bytes()).await.is_err() {
        return;
    }
    for document in documents {
        let chunk = format!("{}\n\n\n\n", document);
        if socket.write_all(chunk.as_bytes()).await.is_err() {
            return;
        }
    }
    // Hold the stream open like a real server.
    let _ = socket.read(&mut buf).await;
}
