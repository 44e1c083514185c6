//! Per-server connection state.
//!
//! A [`ServerConnection`] is owned by the engine task. It never touches the
//! socket directly: frames go out through the writer channel of the transport
//! task, and frames coming back are handed to [`ServerConnection::handle_packet`]
//! by the engine. That keeps sequence allocation, waiter registration and
//! response matching single-threaded.
//!
//! # Quiet requests
//!
//! The server does not answer a quiet request that succeeds. Responses arrive
//! in request order, so any response for sequence `N` proves that every quiet
//! request with a lower sequence succeeded.

use super::transport::Endpoint;
use crate::client::operation::OpId;
use crate::protocol::extras;
use crate::protocol::{FeedEvent, Magic, Opcode, Packet, PacketError, ResponseBody, Status};
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// SASL mechanism used for bucket authentication.
pub const SASL_MECHANISM: &str = "PLAIN";

/// Connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is connecting.
    Connecting,
    /// Connected, SASL exchange in flight.
    Authenticating,
    /// Authenticated and usable.
    Ready,
    /// Authentication was rejected. Kept so the same credentials are not retried.
    AuthFailed,
}

/// Who is waiting for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Waiter {
    Operation(OpId),
    Auth,
    ConfigFetch,
    /// Trailing no-op that flushes quiet requests.
    Flush,
}

/// Registration options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendMode {
    /// Keep the registration after a successful response.
    pub persistent: bool,
    /// The request uses a quiet opcode.
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    waiter: Waiter,
    mode: SendMode,
}

/// Why a waiter did not get a successful body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    /// Nonzero status from the server.
    Status(u16),
    /// The connection closed first.
    Network,
    /// The body could not be interpreted.
    Malformed(PacketError),
}

/// Work produced by an incoming frame or a close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutput {
    Deliver {
        waiter: Waiter,
        result: Result<ResponseBody, ResponseError>,
    },
    /// A wrong-owner response carried a topology document.
    NotMyVbucket { config: String },
}

/// Send failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,
    #[error("failed to encode request: {0}")]
    Encode(#[from] PacketError),
}

/// Connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub bytes_sent: u64,
}

/// State of one connection to a data node.
///
/// Each registered waiter receives at most one delivery, except persistent
/// stream registrations, which stay until cancelled or closed. Quiet requests
/// are completed by implication, which assumes the server answers requests on
/// one connection in the order they were sent. Ordering is never assumed
/// across connections.
#[derive(Debug)]
pub struct ServerConnection {
    id: ConnId,
    endpoint: Endpoint,
    state: ConnectionState,
    next_seq: u32,
    waiters: BTreeMap<u32, Registration>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    stats: ConnectionStats,
}

impl ServerConnection {
    pub fn new(id: ConnId, endpoint: Endpoint, writer: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            id,
            endpoint,
            state: ConnectionState::Connecting,
            next_seq: 1,
            waiters: BTreeMap::new(),
            writer: Some(writer),
            stats: ConnectionStats::default(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Registered waiters.
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }

    /// Start the SASL `PLAIN` exchange. Called once the transport is up.
    pub fn authenticate(&mut self, bucket: &str, password: &str) -> Result<u32, ConnectionError> {
        self.state = ConnectionState::Authenticating;
        let packet = Packet::request(Opcode::SaslAuth, 0)
            .with_key(SASL_MECHANISM)
            .with_value(extras::sasl_plain(bucket, password));
        self.send(packet, Some(Waiter::Auth), SendMode::default())
    }

    /// Apply the outcome of the SASL exchange.
    pub fn auth_completed(&mut self, ok: bool) {
        self.state = if ok {
            ConnectionState::Ready
        } else {
            ConnectionState::AuthFailed
        };
        if !ok {
            self.writer = None;
        }
    }

    /// Write a request and register its waiter. Returns the sequence number.
    pub fn send(
        &mut self,
        packet: Packet,
        waiter: Option<Waiter>,
        mode: SendMode,
    ) -> Result<u32, ConnectionError> {
        let writer = self.writer.as_ref().ok_or(ConnectionError::Closed)?;
        let seq = self.next_seq;
        let frame = packet.with_opaque(seq).encode()?;
        let len = frame.len() as u64;
        writer.send(frame).map_err(|_| ConnectionError::Closed)?;

        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += len;
        if let Some(waiter) = waiter {
            self.waiters.insert(seq, Registration { waiter, mode });
        }
        Ok(seq)
    }

    /// Drop a registration. Bytes already written stay on the wire; a late
    /// response for `seq` is ignored.
    pub fn cancel(&mut self, seq: u32) -> bool {
        self.waiters.remove(&seq).is_some()
    }

    /// Match an incoming frame to its waiter.
    pub fn handle_packet(&mut self, packet: Packet) -> Vec<ConnectionOutput> {
        let seq = packet.opaque;
        let mut outputs = Vec::new();

        match packet.magic {
            Magic::Request => {
                let Some(registration) = self.waiters.get(&seq).copied() else {
                    tracing::debug!(conn = %self.id, seq, opcode = packet.opcode, "unsolicited request frame");
                    return outputs;
                };
                if !registration.mode.persistent {
                    self.waiters.remove(&seq);
                }
                let result = FeedEvent::from_request(&packet)
                    .map(ResponseBody::Feed)
                    .map_err(ResponseError::Malformed);
                outputs.push(ConnectionOutput::Deliver {
                    waiter: registration.waiter,
                    result,
                });
            }
            Magic::Response => {
                self.stats.responses_received += 1;
                self.complete_quiet_before(seq, &mut outputs);

                let status = packet.status();
                let registration = match self.waiters.get(&seq).copied() {
                    Some(r) if r.mode.persistent && status == u16::from(Status::Success) => Some(r),
                    Some(_) => self.waiters.remove(&seq),
                    None => None,
                };

                match registration {
                    Some(registration) => {
                        let result = if status == u16::from(Status::Success) {
                            ResponseBody::from_response(&packet).map_err(ResponseError::Malformed)
                        } else {
                            Err(ResponseError::Status(status))
                        };
                        outputs.push(ConnectionOutput::Deliver {
                            waiter: registration.waiter,
                            result,
                        });
                    }
                    None => {
                        tracing::debug!(conn = %self.id, seq, status, "response with no waiter");
                    }
                }

                if status == u16::from(Status::NotMyVbucket) && !packet.value.is_empty() {
                    outputs.push(ConnectionOutput::NotMyVbucket {
                        config: String::from_utf8_lossy(&packet.value).into_owned(),
                    });
                }
            }
        }
        outputs
    }

    fn complete_quiet_before(&mut self, seq: u32, outputs: &mut Vec<ConnectionOutput>) {
        let implied: Vec<u32> = self
            .waiters
            .range(..seq)
            .filter(|(_, r)| r.mode.quiet)
            .map(|(s, _)| *s)
            .collect();
        for s in implied {
            if let Some(registration) = self.waiters.remove(&s) {
                outputs.push(ConnectionOutput::Deliver {
                    waiter: registration.waiter,
                    result: Ok(ResponseBody::Empty),
                });
            }
        }
    }

    /// The transport is gone: fail every waiter with a network error.
    pub fn close(&mut self) -> Vec<ConnectionOutput> {
        self.writer = None;
        std::mem::take(&mut self.waiters)
            .into_values()
            .map(|registration| ConnectionOutput::Deliver {
                waiter: registration.waiter,
                result: Err(ResponseError::Network),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Cas, PacketDecoder};

    fn connection() -> (ServerConnection, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Endpoint::new("10.0.0.1", 11210, false);
        (ServerConnection::new(ConnId(1), endpoint, tx), rx)
    }

    fn written(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Packet> {
        let mut decoder = PacketDecoder::new();
        let mut packets = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            packets.extend(decoder.feed(&frame).unwrap());
        }
        packets
    }

    fn op(n: u64) -> Waiter {
        Waiter::Operation(OpId(n))
    }

    #[test]
    fn test_auth_payload() {
        let (mut conn, mut rx) = connection();
        let seq = conn.authenticate("beer", "secret").unwrap();
        assert_eq!(conn.state(), ConnectionState::Authenticating);

        let sent = written(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode(), Some(Opcode::SaslAuth));
        assert_eq!(sent[0].opaque, seq);
        assert_eq!(sent[0].key.as_ref(), b"PLAIN");
        assert_eq!(sent[0].value.as_ref(), b"\0beer\0secret");
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let (mut conn, _rx) = connection();
        let a = conn.send(Packet::request(Opcode::Noop, 0), None, SendMode::default());
        let b = conn.send(Packet::request(Opcode::Noop, 0), None, SendMode::default());
        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(2));
        assert_eq!(conn.stats().requests_sent, 2);
    }

    #[test]
    fn test_response_matched_by_sequence() {
        let (mut conn, _rx) = connection();
        let seq = conn
            .send(Packet::request(Opcode::Set, 0), Some(op(7)), SendMode::default())
            .unwrap();

        let response = Packet::response(Opcode::Set, Status::Success)
            .with_opaque(seq)
            .with_cas(Cas(5));
        assert_eq!(
            conn.handle_packet(response.clone()),
            vec![ConnectionOutput::Deliver {
                waiter: op(7),
                result: Ok(ResponseBody::Mutation { cas: Cas(5) }),
            }]
        );
        assert!(conn.handle_packet(response).is_empty());
    }

    #[test]
    fn test_cancelled_waiter_ignores_late_response() {
        let (mut conn, _rx) = connection();
        let seq = conn
            .send(Packet::request(Opcode::Get, 0), Some(op(1)), SendMode::default())
            .unwrap();
        assert!(conn.cancel(seq));
        let late = Packet::response(Opcode::Get, Status::Success).with_opaque(seq);
        assert!(conn.handle_packet(late).is_empty());
    }

    #[test]
    fn test_quiet_success_implied_by_later_response() {
        let (mut conn, _rx) = connection();
        let quiet = SendMode {
            quiet: true,
            ..SendMode::default()
        };
        conn.send(Packet::request(Opcode::SetQ, 0), Some(op(1)), quiet)
            .unwrap();
        conn.send(Packet::request(Opcode::SetQ, 0), Some(op(2)), quiet)
            .unwrap();
        let flush = conn
            .send(Packet::request(Opcode::Noop, 0), Some(Waiter::Flush), SendMode::default())
            .unwrap();

        let outputs =
            conn.handle_packet(Packet::response(Opcode::Noop, Status::Success).with_opaque(flush));
        assert_eq!(
            outputs,
            vec![
                ConnectionOutput::Deliver {
                    waiter: op(1),
                    result: Ok(ResponseBody::Empty),
                },
                ConnectionOutput::Deliver {
                    waiter: op(2),
                    result: Ok(ResponseBody::Empty),
                },
                ConnectionOutput::Deliver {
                    waiter: Waiter::Flush,
                    result: Ok(ResponseBody::Empty),
                },
            ]
        );
        assert_eq!(conn.pending(), 0);
    }

    #[test]
    fn test_quiet_error_still_delivered() {
        let (mut conn, _rx) = connection();
        let quiet = SendMode {
            quiet: true,
            ..SendMode::default()
        };
        let seq = conn
            .send(Packet::request(Opcode::AddQ, 0), Some(op(1)), quiet)
            .unwrap();
        let outputs = conn.handle_packet(
            Packet::response(Opcode::AddQ, Status::KeyExists).with_opaque(seq),
        );
        assert_eq!(
            outputs,
            vec![ConnectionOutput::Deliver {
                waiter: op(1),
                result: Err(ResponseError::Status(0x0002)),
            }]
        );
    }

    #[test]
    fn test_not_my_vbucket_emits_config_after_waiter() {
        let (mut conn, _rx) = connection();
        let seq = conn
            .send(Packet::request(Opcode::Get, 3), Some(op(4)), SendMode::default())
            .unwrap();
        let outputs = conn.handle_packet(
            Packet::response(Opcode::Get, Status::NotMyVbucket)
                .with_opaque(seq)
                .with_value(r#"{"rev":9}"#),
        );
        assert_eq!(
            outputs,
            vec![
                ConnectionOutput::Deliver {
                    waiter: op(4),
                    result: Err(ResponseError::Status(0x0007)),
                },
                ConnectionOutput::NotMyVbucket {
                    config: r#"{"rev":9}"#.to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_persistent_registration_survives_events() {
        let (mut conn, _rx) = connection();
        let persistent = SendMode {
            persistent: true,
            ..SendMode::default()
        };
        let seq = conn
            .send(Packet::request(Opcode::FeedStreamRequest, 5), Some(op(9)), persistent)
            .unwrap();

        let opened = conn.handle_packet(
            Packet::response(Opcode::FeedStreamRequest, Status::Success).with_opaque(seq),
        );
        assert_eq!(opened.len(), 1);

        let deletion = Packet::request(Opcode::FeedDeletion, 5)
            .with_extras(vec![0u8; 18])
            .with_key("gone")
            .with_opaque(seq);
        let outputs = conn.handle_packet(deletion);
        assert!(matches!(
            &outputs[..],
            [ConnectionOutput::Deliver {
                result: Ok(ResponseBody::Feed(FeedEvent::Deletion { .. })),
                ..
            }]
        ));
        assert_eq!(conn.pending(), 1);
    }

    #[test]
    fn test_close_fails_all_waiters() {
        let (mut conn, _rx) = connection();
        conn.send(Packet::request(Opcode::Get, 0), Some(op(1)), SendMode::default())
            .unwrap();
        conn.send(Packet::request(Opcode::Get, 0), Some(op(2)), SendMode::default())
            .unwrap();

        let outputs = conn.close();
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|o| matches!(
            o,
            ConnectionOutput::Deliver {
                result: Err(ResponseError::Network),
                ..
            }
        )));
        assert_eq!(
            conn.send(Packet::request(Opcode::Noop, 0), None, SendMode::default()),
            Err(ConnectionError::Closed)
        );
    }

    #[test]
    fn test_auth_failure_drops_writer() {
        let (mut conn, _rx) = connection();
        conn.auth_completed(false);
        assert_eq!(conn.state(), ConnectionState::AuthFailed);
        assert_eq!(
            conn.send(Packet::request(Opcode::Noop, 0), None, SendMode::default()),
            Err(ConnectionError::Closed)
        );
    }
}
