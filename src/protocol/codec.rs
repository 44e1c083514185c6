//! Stream reassembly.
//!
//! Transport reads arrive at arbitrary boundaries. The decoder accumulates
//! bytes and hands out whole frames as soon as they are complete.

use super::packet::{Header, Packet, PacketError};
use super::HEADER_SIZE;
use bytes::BytesMut;

/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Result of decoding a frame from the wire.
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// A complete frame was decoded.
    Complete(T),
    /// More data is needed to complete the frame.
    Incomplete,
    /// The input is invalid; the stream cannot be resynchronized.
    Invalid(PacketError),
}

/// Accumulating frame decoder.
#[derive(Debug)]
pub struct PacketDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Append a chunk read from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to take one frame off the front of the buffer.
    pub fn decode(&mut self) -> DecodeResult<Packet> {
        if self.buffer.is_empty() {
            return DecodeResult::Incomplete;
        }

        let header = match Header::parse(&self.buffer) {
            Ok(header) => header,
            Err(PacketError::Truncated { .. }) => return DecodeResult::Incomplete,
            Err(e) => return DecodeResult::Invalid(e),
        };

        let frame_len = header.frame_len();
        if frame_len > self.max_frame_size {
            return DecodeResult::Invalid(PacketError::FrameTooLarge {
                len: frame_len,
                max: self.max_frame_size,
            });
        }
        if self.buffer.len() < frame_len {
            self.buffer.reserve(frame_len - self.buffer.len());
            return DecodeResult::Incomplete;
        }

        let frame = self.buffer.split_to(frame_len).freeze();
        match Packet::from_parts(header, frame.slice(HEADER_SIZE..)) {
            Ok(packet) => DecodeResult::Complete(packet),
            Err(e) => DecodeResult::Invalid(e),
        }
    }

    /// Append a chunk and drain every frame it completes.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Packet>, PacketError> {
        self.extend(data);
        let mut packets = Vec::new();
        loop {
            match self.decode() {
                DecodeResult::Complete(packet) => packets.push(packet),
                DecodeResult::Incomplete => return Ok(packets),
                DecodeResult::Invalid(e) => return Err(e),
            }
        }
    }
}
