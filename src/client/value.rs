//! Document values and their on-the-wire formats.
//!
//! The format travels in the item flags:
//!
//! | Format | Flags | Stored bytes                     |
//! |--------|-------|----------------------------------|
//! | json   | 0     | serialized JSON                  |
//! | raw    | 2     | bytes as given                   |
//! | utf8   | 4     | UTF-8 text                       |
//!
//! `auto` picks the format from the value on writes and from the flags on
//! reads.

use crate::core::error::ErrorKind;
use bytes::Bytes;

pub const FLAGS_JSON: u32 = 0;
pub const FLAGS_RAW: u32 = 2;
pub const FLAGS_UTF8: u32 = 4;

/// Value format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Format {
    Json,
    Utf8,
    Raw,
    #[default]
    Auto,
}

impl Format {
    /// Flags stored for this format. `Auto` has none of its own.
    pub fn flags(self) -> Option<u32> {
        match self {
            Format::Json => Some(FLAGS_JSON),
            Format::Raw => Some(FLAGS_RAW),
            Format::Utf8 => Some(FLAGS_UTF8),
            Format::Auto => None,
        }
    }

    /// Format recorded in stored flags. Unknown flags read as raw bytes.
    pub fn from_flags(flags: u32) -> Self {
        match flags {
            FLAGS_JSON => Format::Json,
            FLAGS_UTF8 => Format::Utf8,
            _ => Format::Raw,
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Format::Json => "json",
            Format::Utf8 => "utf8",
            Format::Raw => "raw",
            Format::Auto => "auto",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Format::Json),
            "utf8" | "utf-8" => Ok(Format::Utf8),
            "raw" => Ok(Format::Raw),
            "auto" => Ok(Format::Auto),
            other => Err(format!("unknown value format: {}", other)),
        }
    }
}

/// Document value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Json(serde_json::Value),
    Utf8(String),
    Raw(Bytes),
    /// Result of a counter operation.
    Counter(u64),
}

impl Value {
    /// Encode for storage. Returns the bytes and the flags to store.
    pub fn encode(&self, format: Format) -> Result<(Bytes, u32), ErrorKind> {
        let format = match format {
            Format::Auto => self.natural_format(),
            explicit => explicit,
        };
        let bytes = match (format, self) {
            (Format::Raw, Value::Raw(bytes)) => bytes.clone(),
            (Format::Raw, _) => return Err(ErrorKind::InvalidArguments),

            (Format::Utf8, Value::Utf8(text)) => Bytes::from(text.clone()),
            (Format::Utf8, Value::Counter(n)) => Bytes::from(n.to_string()),
            (Format::Utf8, Value::Json(serde_json::Value::String(text))) => {
                Bytes::from(text.clone())
            }
            (Format::Utf8, Value::Json(json)) => Bytes::from(json.to_string()),
            (Format::Utf8, Value::Raw(bytes)) => {
                std::str::from_utf8(bytes).map_err(|_| ErrorKind::InvalidArguments)?;
                bytes.clone()
            }

            (Format::Json, Value::Json(json)) => Bytes::from(json.to_string()),
            (Format::Json, Value::Utf8(text)) => {
                Bytes::from(serde_json::Value::String(text.clone()).to_string())
            }
            (Format::Json, Value::Counter(n)) => Bytes::from(n.to_string()),
            (Format::Json, Value::Raw(_)) => return Err(ErrorKind::InvalidArguments),

            (Format::Auto, _) => return Err(ErrorKind::InvalidArguments),
        };
        let flags = format.flags().unwrap_or(FLAGS_RAW);
        Ok((bytes, flags))
    }

    /// Decode stored bytes. A forced format overrides the stored flags.
    pub fn decode(bytes: Bytes, flags: u32, format: Format) -> Value {
        let format = match format {
            Format::Auto => Format::from_flags(flags),
            explicit => explicit,
        };
        match format {
            Format::Json => match serde_json::from_slice(&bytes) {
                Ok(json) => Value::Json(json),
                // Legacy items default to flags 0 without being JSON.
                Err(_) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Value::Utf8(text),
                    Err(_) => Value::Raw(bytes),
                },
            },
            Format::Utf8 => Value::Utf8(String::from_utf8_lossy(&bytes).into_owned()),
            Format::Raw | Format::Auto => Value::Raw(bytes),
        }
    }

    fn natural_format(&self) -> Format {
        match self {
            Value::Json(_) => Format::Json,
            Value::Utf8(_) | Value::Counter(_) => Format::Utf8,
            Value::Raw(_) => Format::Raw,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8(text) => Some(text),
            Value::Json(serde_json::Value::String(text)) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(json) => Some(json),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<u64> {
        match self {
            Value::Counter(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Json(json) => write!(f, "{}", json),
            Value::Utf8(text) => f.write_str(text),
            Value::Raw(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            Value::Counter(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Utf8(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Utf8(text)
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Value::Raw(bytes)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Raw(Bytes::from(bytes))
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::Json(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auto_picks_format_from_value() {
        let (bytes, flags) = Value::from("hello").encode(Format::Auto).unwrap();
        assert_eq!((bytes.as_ref(), flags), (&b"hello"[..], FLAGS_UTF8));

        let (bytes, flags) = Value::from(vec![0xff, 0x00]).encode(Format::Auto).unwrap();
        assert_eq!((bytes.as_ref(), flags), (&[0xff, 0x00][..], FLAGS_RAW));

        let (bytes, flags) = Value::from(json!({"a": 1})).encode(Format::Auto).unwrap();
        assert_eq!((bytes.as_ref(), flags), (&br#"{"a":1}"#[..], FLAGS_JSON));
    }

    #[test]
    fn test_explicit_raw_requires_bytes() {
        assert_eq!(
            Value::from("text").encode(Format::Raw),
            Err(ErrorKind::InvalidArguments)
        );
        assert_eq!(
            Value::from(json!(1)).encode(Format::Raw),
            Err(ErrorKind::InvalidArguments)
        );
    }

    #[test]
    fn test_json_format_quotes_text() {
        let (bytes, flags) = Value::from("hi").encode(Format::Json).unwrap();
        assert_eq!(bytes.as_ref(), b"\"hi\"");
        assert_eq!(flags, FLAGS_JSON);
    }

    #[test]
    fn test_decode_by_stored_flags() {
        let json = Value::decode(Bytes::from_static(b"[1,2]"), FLAGS_JSON, Format::Auto);
        assert_eq!(json, Value::Json(json!([1, 2])));

        let text = Value::decode(Bytes::from_static(b"[1,2]"), FLAGS_UTF8, Format::Auto);
        assert_eq!(text, Value::Utf8("[1,2]".to_string()));

        let raw = Value::decode(Bytes::from_static(b"[1,2]"), 0x0100_0000, Format::Auto);
        assert_eq!(raw, Value::Raw(Bytes::from_static(b"[1,2]")));
    }

    #[test]
    fn test_forced_format_overrides_flags() {
        let value = Value::decode(Bytes::from_static(b"{}"), FLAGS_UTF8, Format::Raw);
        assert_eq!(value, Value::Raw(Bytes::from_static(b"{}")));
    }

    #[test]
    fn test_non_json_with_json_flags_reads_as_text() {
        let value = Value::decode(Bytes::from_static(b"plain"), FLAGS_JSON, Format::Auto);
        assert_eq!(value.as_str(), Some("plain"));
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("JSON".parse::<Format>(), Ok(Format::Json));
        assert_eq!("utf-8".parse::<Format>(), Ok(Format::Utf8));
        assert!("xml".parse::<Format>().is_err());
    }
}
