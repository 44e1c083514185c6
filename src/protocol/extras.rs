//! Extras layouts for the commands this client issues.
//!
//! | Command                      | Extras                                   |
//! |------------------------------|------------------------------------------|
//! | set / add / replace          | flags u32, expiry u32                    |
//! | increment / decrement        | delta u64, initial u64, expiry u32       |
//! | touch / gat / get-locked     | expiry (or lock time) u32                |
//! | feed open                    | seq u32, flags u32                       |
//! | feed stream request          | flags, reserved, start, end, uuid, high  |

use bytes::{BufMut, Bytes, BytesMut};

/// Expiry value that tells the server not to create a missing counter.
pub const COUNTER_NO_CREATE: u32 = 0xFFFF_FFFF;

/// Feed open flag requesting a producer channel.
pub const FEED_OPEN_PRODUCER: u32 = 0x01;

/// Size of the stream request extras.
pub const STREAM_REQUEST_EXTRAS_LEN: usize = 40;

pub fn store(flags: u32, expiry: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(flags);
    buf.put_u32(expiry);
    buf.freeze()
}

pub fn counter(delta: u64, initial: u64, expiry: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u64(delta);
    buf.put_u64(initial);
    buf.put_u32(expiry);
    buf.freeze()
}

/// Single u32 extras used by touch, get-and-touch and get-locked.
pub fn expiry(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

pub fn feed_open(seq: u32, flags: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(seq);
    buf.put_u32(flags);
    buf.freeze()
}

/// Stream request covering every sequence number from `start` onwards.
pub fn stream_request(start_seqno: u64, end_seqno: u64, partition_uuid: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(STREAM_REQUEST_EXTRAS_LEN);
    buf.put_u32(0); // flags
    buf.put_u32(0); // reserved
    buf.put_u64(start_seqno);
    buf.put_u64(end_seqno);
    buf.put_u64(partition_uuid);
    buf.put_u64(start_seqno); // snapshot start
    buf.freeze()
}

/// SASL `PLAIN` payload: empty authzid, then user and password, NUL separated.
pub fn sasl_plain(user: &str, password: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + user.len() + password.len());
    buf.put_u8(0);
    buf.put_slice(user.as_bytes());
    buf.put_u8(0);
    buf.put_slice(password.as_bytes());
    buf.freeze()
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_layout() {
        assert_eq!(store(42, 3600).as_ref(), &[0, 0, 0, 42, 0, 0, 0x0e, 0x10]);
    }

    #[test]
    fn test_counter_layout() {
        let extras = counter(5, 100, COUNTER_NO_CREATE);
        assert_eq!(extras.len(), 20);
        assert_eq!(read_u64(&extras, 0), Some(5));
        assert_eq!(read_u64(&extras, 8), Some(100));
        assert_eq!(read_u32(&extras, 16), Some(COUNTER_NO_CREATE));
    }

    #[test]
    fn test_stream_request_layout() {
        let extras = stream_request(0, u64::MAX, 0);
        assert_eq!(extras.len(), STREAM_REQUEST_EXTRAS_LEN);
        assert_eq!(read_u64(&extras, 16), Some(u64::MAX));
    }

    #[test]
    fn test_sasl_plain() {
        assert_eq!(sasl_plain("default", "pw").as_ref(), b"\0default\0pw");
        assert_eq!(sasl_plain("default", "").as_ref(), b"\0default\0");
    }

    #[test]
    fn test_read_out_of_range() {
        assert_eq!(read_u32(&[0, 1, 2], 0), None);
        assert_eq!(read_u64(&[0; 8], 1), None);
    }
}
