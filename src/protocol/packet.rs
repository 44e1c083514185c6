//! Frame encode and decode.

use super::{Cas, Opcode, Status, HEADER_SIZE, REQUEST_MAGIC, RESPONSE_MAGIC};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame-level protocol errors. Any of these closes the connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("invalid magic: 0x{0:02x}")]
    InvalidMagic(u8),

    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("extras ({extras}) and key ({key}) exceed body length {body}")]
    BodyMismatch { extras: usize, key: usize, body: usize },

    #[error("{field} length {len} exceeds the header field width")]
    FieldTooLarge { field: &'static str, len: usize },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed {opcode:?} body: {reason}")]
    MalformedBody { opcode: Opcode, reason: String },
}

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            REQUEST_MAGIC => Some(Magic::Request),
            RESPONSE_MAGIC => Some(Magic::Response),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Magic::Request => REQUEST_MAGIC,
            Magic::Response => RESPONSE_MAGIC,
        }
    }
}

/// Parsed fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: Magic,
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: Cas,
}

impl Header {
    /// Parse a header from the first 24 bytes of `data`.
    ///
    /// The magic byte is checked first so that garbage on the wire is
    /// rejected before waiting for a body that will never arrive.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if let Some(&first) = data.first() {
            if Magic::from_byte(first).is_none() {
                return Err(PacketError::InvalidMagic(first));
            }
        }
        if data.len() < HEADER_SIZE {
            return Err(PacketError::Truncated {
                needed: HEADER_SIZE,
                available: data.len(),
            });
        }

        let magic = Magic::from_byte(data[0]).ok_or(PacketError::InvalidMagic(data[0]))?;
        Ok(Self {
            magic,
            opcode: data[1],
            key_length: u16::from_be_bytes([data[2], data[3]]),
            extras_length: data[4],
            data_type: data[5],
            vbucket_or_status: u16::from_be_bytes([data[6], data[7]]),
            total_body_length: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            opaque: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            cas: Cas(u64::from_be_bytes([
                data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
            ])),
        })
    }

    /// Total size of the frame this header introduces.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.total_body_length as usize
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.magic.byte());
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_length);
        buf.put_u8(self.extras_length);
        buf.put_u8(self.data_type);
        buf.put_u16(self.vbucket_or_status);
        buf.put_u32(self.total_body_length);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas.0);
    }
}

/// One protocol frame.
///
/// Requests carry a vbucket id in `vbucket_or_status`, responses carry a
/// status code. The `opaque` field holds the connection-local sequence number
/// used to match responses to requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub opcode: u8,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: Cas,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Packet {
    /// Start a request frame for the given partition.
    pub fn request(opcode: Opcode, vbucket: u16) -> Self {
        Self {
            magic: Magic::Request,
            opcode: opcode.into(),
            data_type: 0,
            vbucket_or_status: vbucket,
            opaque: 0,
            cas: Cas::default(),
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Start a response frame with the given status.
    pub fn response(opcode: Opcode, status: Status) -> Self {
        Self {
            magic: Magic::Response,
            vbucket_or_status: status.into(),
            ..Self::request(opcode, 0)
        }
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_cas(mut self, cas: Cas) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    /// Known opcode, if the byte maps to one.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.opcode).ok()
    }

    /// Raw status word. Only meaningful for responses.
    pub fn status(&self) -> u16 {
        self.vbucket_or_status
    }

    pub fn vbucket(&self) -> u16 {
        self.vbucket_or_status
    }

    pub fn is_response(&self) -> bool {
        self.magic == Magic::Response
    }

    /// Body length as it will appear in the header.
    pub fn body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }

    /// Encode into one contiguous buffer. Header lengths come from the parts.
    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let key_length = u16::try_from(self.key.len()).map_err(|_| PacketError::FieldTooLarge {
            field: "key",
            len: self.key.len(),
        })?;
        let extras_length =
            u8::try_from(self.extras.len()).map_err(|_| PacketError::FieldTooLarge {
                field: "extras",
                len: self.extras.len(),
            })?;
        let body_len = self.body_len();
        let total_body_length =
            u32::try_from(body_len).map_err(|_| PacketError::FieldTooLarge {
                field: "body",
                len: body_len,
            })?;

        let header = Header {
            magic: self.magic,
            opcode: self.opcode,
            key_length,
            extras_length,
            data_type: self.data_type,
            vbucket_or_status: self.vbucket_or_status,
            total_body_length,
            opaque: self.opaque,
            cas: self.cas,
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
        header.write_to(&mut buf);
        buf.extend_from_slice(&self.extras);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        Ok(buf.freeze())
    }

    /// Decode exactly one frame. Trailing bytes past the declared body are an error.
    pub fn decode(frame: Bytes) -> Result<Self, PacketError> {
        let header = Header::parse(&frame)?;
        if frame.len() != header.frame_len() {
            return Err(PacketError::Truncated {
                needed: header.frame_len(),
                available: frame.len(),
            });
        }
        Self::from_parts(header, frame.slice(HEADER_SIZE..))
    }

    /// Split a body into extras, key and value according to the header.
    pub(crate) fn from_parts(header: Header, body: Bytes) -> Result<Self, PacketError> {
        let extras_end = header.extras_length as usize;
        let key_end = extras_end + header.key_length as usize;
        if key_end > body.len() {
            return Err(PacketError::BodyMismatch {
                extras: header.extras_length as usize,
                key: header.key_length as usize,
                body: body.len(),
            });
        }

        Ok(Self {
            magic: header.magic,
            opcode: header.opcode,
            data_type: header.data_type,
            vbucket_or_status: header.vbucket_or_status,
            opaque: header.opaque,
            cas: header.cas,
            extras: body.slice(..extras_end),
            key: body.slice(extras_end..key_end),
            value: body.slice(key_end..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a raw frame by hand, independent of the encoder.
    fn build_frame(magic: u8, opcode: u8, key: &[u8], extras: &[u8], value: &[u8]) -> Vec<u8> {
        let total_body_len = extras.len() + key.len() + value.len();
        let mut buf = Vec::with_capacity(HEADER_SIZE + total_body_len);

        buf.push(magic);
        buf.push(opcode);
        buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
        buf.push(extras.len() as u8);
        buf.push(0);
        buf.extend_from_slice(&0x0203u16.to_be_bytes());
        buf.extend_from_slice(&(total_body_len as u32).to_be_bytes());
        buf.extend_from_slice(&42u32.to_be_bytes());
        buf.extend_from_slice(&7u64.to_be_bytes());

        buf.extend_from_slice(extras);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf
    }

    #[test]
    fn test_encode_matches_wire_layout() {
        let packet = Packet::request(Opcode::Set, 0x0203)
            .with_extras(vec![0, 0, 0, 1, 0, 0, 0, 2])
            .with_key("mykey")
            .with_value("hello")
            .with_opaque(42)
            .with_cas(Cas(7));

        let encoded = packet.encode().unwrap();
        let expected = build_frame(
            REQUEST_MAGIC,
            Opcode::Set as u8,
            b"mykey",
            &[0, 0, 0, 1, 0, 0, 0, 2],
            b"hello",
        );
        assert_eq!(encoded.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_decode_response() {
        let frame = build_frame(RESPONSE_MAGIC, Opcode::Get as u8, b"", &[0, 0, 0, 4], b"{}");
        let packet = Packet::decode(Bytes::from(frame)).unwrap();

        assert!(packet.is_response());
        assert_eq!(packet.opcode(), Some(Opcode::Get));
        assert_eq!(packet.status(), 0x0203);
        assert_eq!(packet.opaque, 42);
        assert_eq!(packet.cas, Cas(7));
        assert_eq!(packet.extras.as_ref(), &[0, 0, 0, 4]);
        assert!(packet.key.is_empty());
        assert_eq!(packet.value.as_ref(), b"{}");
    }

    fn filled(len: usize, seed: u8) -> Bytes {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect::<Vec<u8>>().into()
    }

    #[test]
    fn test_encode_decode_is_byte_identical() {
        for extras_len in [0usize, 1, 255] {
            for key_len in [0usize, 1, 250, u16::MAX as usize] {
                for value_len in [0usize, 1, 70_000] {
                    for magic in [Magic::Request, Magic::Response] {
                        let packet = Packet {
                            magic,
                            opcode: Opcode::Set as u8,
                            data_type: 0x03,
                            vbucket_or_status: 0xfffe,
                            opaque: u32::MAX,
                            cas: Cas(u64::MAX),
                            extras: filled(extras_len, 1),
                            key: filled(key_len, 2),
                            value: filled(value_len, 3),
                        };

                        let encoded = packet.encode().unwrap();
                        assert_eq!(
                            encoded.len(),
                            HEADER_SIZE + extras_len + key_len + value_len
                        );
                        let decoded = Packet::decode(encoded.clone()).unwrap();
                        assert_eq!(
                            decoded, packet,
                            "extras={extras_len} key={key_len} value={value_len}"
                        );
                        assert_eq!(decoded.encode().unwrap(), encoded);
                    }
                }
            }
        }
    }

    #[test]
    fn test_invalid_magic() {
        let mut frame = build_frame(REQUEST_MAGIC, 0, b"k", &[], &[]);
        frame[0] = 0x42;
        assert_eq!(
            Packet::decode(Bytes::from(frame)),
            Err(PacketError::InvalidMagic(0x42))
        );
    }

    #[test]
    fn test_key_longer_than_body() {
        let mut frame = build_frame(REQUEST_MAGIC, 0, b"key", &[], &[]);
        frame[3] = 10;
        assert!(matches!(
            Packet::decode(Bytes::from(frame)),
            Err(PacketError::BodyMismatch { key: 10, .. })
        ));
    }

    #[test]
    fn test_oversized_extras_rejected() {
        let packet = Packet::request(Opcode::Set, 0).with_extras(vec![0u8; 300]);
        assert!(matches!(
            packet.encode(),
            Err(PacketError::FieldTooLarge { field: "extras", .. })
        ));
    }
}
