//! Response bodies shaped by opcode, and unsolicited change-feed events.

use super::extras::{read_u32, read_u64};
use super::packet::{Packet, PacketError};
use super::{Cas, Opcode};
use bytes::Bytes;

/// Body of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// get, get-and-touch, get-locked, get-replica.
    Value { value: Bytes, flags: u32, cas: Cas },
    /// Any mutation that only reports the new CAS.
    Mutation { cas: Cas },
    /// increment / decrement.
    Counter { value: u64, cas: Cas },
    /// get-cluster-config.
    Config(String),
    /// SASL exchange payload.
    Auth(Bytes),
    /// Change-feed traffic on a persistent registration.
    Feed(FeedEvent),
    /// No payload, or success implied for a quiet request.
    Empty,
}

impl ResponseBody {
    /// Shape the body of a zero-status response.
    pub fn from_response(packet: &Packet) -> Result<Self, PacketError> {
        let Some(opcode) = packet.opcode() else {
            return Ok(ResponseBody::Empty);
        };

        let body = match opcode.to_non_quiet() {
            Opcode::Get
            | Opcode::GetK
            | Opcode::Gat
            | Opcode::GetLocked
            | Opcode::GetReplica => ResponseBody::Value {
                value: packet.value.clone(),
                flags: read_u32(&packet.extras, 0).unwrap_or(0),
                cas: packet.cas,
            },
            Opcode::Set
            | Opcode::Add
            | Opcode::Replace
            | Opcode::Append
            | Opcode::Prepend
            | Opcode::Delete
            | Opcode::Touch
            | Opcode::UnlockKey => ResponseBody::Mutation { cas: packet.cas },
            Opcode::Increment | Opcode::Decrement => {
                let value = read_u64(&packet.value, 0).ok_or_else(|| {
                    PacketError::MalformedBody {
                        opcode,
                        reason: format!("counter value is {} bytes", packet.value.len()),
                    }
                })?;
                ResponseBody::Counter {
                    value,
                    cas: packet.cas,
                }
            }
            Opcode::GetClusterConfig => {
                ResponseBody::Config(String::from_utf8_lossy(&packet.value).into_owned())
            }
            Opcode::SaslListMechs | Opcode::SaslAuth | Opcode::SaslStep => {
                ResponseBody::Auth(packet.value.clone())
            }
            Opcode::FeedStreamRequest => ResponseBody::Feed(FeedEvent::StreamOpened),
            _ => ResponseBody::Empty,
        };
        Ok(body)
    }
}

/// Change-feed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The server accepted the stream request.
    StreamOpened,
    SnapshotMarker {
        partition: u16,
        start_seqno: u64,
        end_seqno: u64,
        flags: u32,
    },
    Mutation {
        partition: u16,
        key: Bytes,
        value: Bytes,
        cas: Cas,
        by_seqno: u64,
        rev_seqno: u64,
        flags: u32,
        expiry: u32,
        lock_time: u32,
    },
    Deletion {
        partition: u16,
        key: Bytes,
        cas: Cas,
        by_seqno: u64,
        rev_seqno: u64,
    },
    Expiration {
        partition: u16,
        key: Bytes,
        cas: Cas,
        by_seqno: u64,
        rev_seqno: u64,
    },
    /// The server closed the stream; no further events follow.
    StreamEnd { partition: u16, flags: u32 },
}

/// Minimum extras carried by a mutation event.
const MUTATION_EXTRAS_LEN: usize = 28;

impl FeedEvent {
    /// Decode a server-initiated (request magic) feed frame.
    pub fn from_request(packet: &Packet) -> Result<Self, PacketError> {
        let opcode = packet.opcode().ok_or_else(|| PacketError::MalformedBody {
            opcode: Opcode::FeedOpen,
            reason: format!("unknown feed opcode 0x{:02x}", packet.opcode),
        })?;
        let malformed = |reason: &str| PacketError::MalformedBody {
            opcode,
            reason: reason.to_string(),
        };
        let extras = &packet.extras;
        let partition = packet.vbucket();

        let event = match opcode {
            Opcode::FeedSnapshotMarker => FeedEvent::SnapshotMarker {
                partition,
                start_seqno: read_u64(extras, 0).ok_or_else(|| malformed("missing start"))?,
                end_seqno: read_u64(extras, 8).ok_or_else(|| malformed("missing end"))?,
                flags: read_u32(extras, 16).unwrap_or(0),
            },
            Opcode::FeedMutation => {
                if extras.len() < MUTATION_EXTRAS_LEN {
                    return Err(malformed("short mutation extras"));
                }
                FeedEvent::Mutation {
                    partition,
                    key: packet.key.clone(),
                    value: packet.value.clone(),
                    cas: packet.cas,
                    by_seqno: read_u64(extras, 0).unwrap_or(0),
                    rev_seqno: read_u64(extras, 8).unwrap_or(0),
                    flags: read_u32(extras, 16).unwrap_or(0),
                    expiry: read_u32(extras, 20).unwrap_or(0),
                    lock_time: read_u32(extras, 24).unwrap_or(0),
                }
            }
            Opcode::FeedDeletion | Opcode::FeedExpiration => {
                let by_seqno = read_u64(extras, 0).ok_or_else(|| malformed("missing seqno"))?;
                let rev_seqno = read_u64(extras, 8).unwrap_or(0);
                if opcode == Opcode::FeedDeletion {
                    FeedEvent::Deletion {
                        partition,
                        key: packet.key.clone(),
                        cas: packet.cas,
                        by_seqno,
                        rev_seqno,
                    }
                } else {
                    FeedEvent::Expiration {
                        partition,
                        key: packet.key.clone(),
                        cas: packet.cas,
                        by_seqno,
                        rev_seqno,
                    }
                }
            }
            Opcode::FeedStreamEnd => FeedEvent::StreamEnd {
                partition,
                flags: read_u32(extras, 0).unwrap_or(0),
            },
            _ => return Err(malformed("not a feed event")),
        };
        Ok(event)
    }

    pub fn is_end(&self) -> bool {
        matches!(self, FeedEvent::StreamEnd { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{extras, Status};
    use bytes::{BufMut, BytesMut};

    #[test]
    fn test_get_body_carries_flags_and_cas() {
        let packet = Packet::response(Opcode::Get, Status::Success)
            .with_extras(vec![0, 0, 0, 4])
            .with_value("text")
            .with_cas(Cas(99));
        assert_eq!(
            ResponseBody::from_response(&packet).unwrap(),
            ResponseBody::Value {
                value: Bytes::from_static(b"text"),
                flags: 4,
                cas: Cas(99),
            }
        );
    }

    #[test]
    fn test_counter_body() {
        let packet = Packet::response(Opcode::Decrement, Status::Success)
            .with_value(u64::MAX.to_be_bytes().to_vec())
            .with_cas(Cas(3));
        assert_eq!(
            ResponseBody::from_response(&packet).unwrap(),
            ResponseBody::Counter {
                value: u64::MAX,
                cas: Cas(3),
            }
        );
    }

    #[test]
    fn test_short_counter_body_is_malformed() {
        let packet = Packet::response(Opcode::Increment, Status::Success).with_value("12");
        assert!(ResponseBody::from_response(&packet).is_err());
    }

    #[test]
    fn test_quiet_opcode_shapes_like_loud() {
        let packet = Packet::response(Opcode::SetQ, Status::Success).with_cas(Cas(5));
        assert_eq!(
            ResponseBody::from_response(&packet).unwrap(),
            ResponseBody::Mutation { cas: Cas(5) }
        );
    }

    #[test]
    fn test_mutation_event() {
        let mut ext = BytesMut::new();
        ext.put_u64(10);
        ext.put_u64(2);
        ext.put_u32(0x04);
        ext.put_u32(300);
        ext.put_u32(0);
        ext.put_u16(0);
        ext.put_u8(0);
        let packet = Packet::request(Opcode::FeedMutation, 12)
            .with_extras(ext.freeze())
            .with_key("k")
            .with_value("v")
            .with_cas(Cas(8));

        match FeedEvent::from_request(&packet).unwrap() {
            FeedEvent::Mutation {
                partition,
                by_seqno,
                flags,
                expiry,
                ..
            } => {
                assert_eq!(partition, 12);
                assert_eq!(by_seqno, 10);
                assert_eq!(flags, 4);
                assert_eq!(expiry, 300);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_short_mutation_event_rejected() {
        let packet = Packet::request(Opcode::FeedMutation, 0).with_extras(vec![0u8; 12]);
        assert!(FeedEvent::from_request(&packet).is_err());
    }

    #[test]
    fn test_stream_end_event() {
        let packet = Packet::request(Opcode::FeedStreamEnd, 3).with_extras(extras::expiry(0));
        let event = FeedEvent::from_request(&packet).unwrap();
        assert!(event.is_end());
    }
}
