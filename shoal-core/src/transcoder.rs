//! Value transcoding boundary.
//!
//! The pipeline moves opaque bytes; how application values become bytes
//! is decided by a [`Transcoder`] injected at the collection boundary.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, ShoalError};
use crate::protocol::constants::{DATATYPE_JSON, DATATYPE_RAW};

/// Common format flags stored alongside a document.
pub mod flags {
    /// Value is JSON.
    pub const JSON: u32 = 0x0200_0000;
    /// Value is raw binary.
    pub const BINARY: u32 = 0x0300_0000;
}

/// Converts application values to and from stored bytes.
pub trait Transcoder: Send + Sync {
    /// Encodes a serializable value into bytes plus format flags.
    fn encode<T: Serialize>(&self, value: &T) -> Result<(Bytes, u32, u8)>;

    /// Decodes stored bytes back into a value, honoring the flags.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8], flags: u32) -> Result<T>;
}

/// Default transcoder storing values as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTranscoder;

impl Transcoder for JsonTranscoder {
    fn encode<T: Serialize>(&self, value: &T) -> Result<(Bytes, u32, u8)> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| ShoalError::InvalidArgument(format!("serialize: {e}")))?;
        Ok((Bytes::from(raw), flags::JSON, DATATYPE_JSON))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8], flags: u32) -> Result<T> {
        if flags != 0 && flags & 0x0f00_0000 != flags::JSON & 0x0f00_0000 {
            return Err(ShoalError::InvalidArgument(format!(
                "cannot decode non-JSON flags 0x{flags:08x} as JSON"
            )));
        }
        serde_json::from_slice(bytes)
            .map_err(|e| ShoalError::InvalidArgument(format!("deserialize: {e}")))
    }
}

/// Transcoder passing raw byte payloads through untouched.
///
/// `encode` accepts values that serialize to a JSON string or byte
/// sequence; anything else is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBinaryTranscoder;

impl Transcoder for RawBinaryTranscoder {
    fn encode<T: Serialize>(&self, value: &T) -> Result<(Bytes, u32, u8)> {
        let json = serde_json::to_value(value)
            .map_err(|e| ShoalError::InvalidArgument(format!("serialize: {e}")))?;
        match json {
            serde_json::Value::String(s) => Ok((Bytes::from(s), flags::BINARY, DATATYPE_RAW)),
            serde_json::Value::Array(items) => {
                let mut raw = Vec::with_capacity(items.len());
                for item in items {
                    let byte = item
                        .as_u64()
                        .filter(|b| *b <= u8::MAX as u64)
                        .ok_or_else(|| {
                            ShoalError::InvalidArgument("binary transcoder expects bytes".into())
                        })?;
                    raw.push(byte as u8);
                }
                Ok((Bytes::from(raw), flags::BINARY, DATATYPE_RAW))
            }
            _ => Err(ShoalError::InvalidArgument(
                "binary transcoder expects a string or byte sequence".into(),
            )),
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8], _flags: u32) -> Result<T> {
        serde_json::from_value(serde_json::Value::from(bytes.to_vec()))
            .map_err(|e| ShoalError::InvalidArgument(format!("deserialize: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn test_json_roundtrip() {
        let transcoder = JsonTranscoder;
        let doc = Doc { name: "fin".into(), count: 3 };

        let (bytes, flags, datatype) = transcoder.encode(&doc).unwrap();
        assert_eq!(flags, flags::JSON);
        assert_eq!(datatype, DATATYPE_JSON);

        let decoded: Doc = transcoder.decode(&bytes, flags).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn test_json_rejects_binary_flags() {
        let transcoder = JsonTranscoder;
        let result: Result<Doc> = transcoder.decode(b"{}", flags::BINARY);
        assert!(result.is_err());
    }

    #[test]
    fn test_json_accepts_legacy_zero_flags() {
        let transcoder = JsonTranscoder;
        let decoded: Doc = transcoder
            .decode(br#"{"name":"x","count":1}"#, 0)
            .unwrap();
        assert_eq!(decoded.count, 1);
    }

    #[test]
    fn test_binary_string_passthrough() {
        let transcoder = RawBinaryTranscoder;
        let (bytes, flags, _) = transcoder.encode(&"hello").unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(flags, flags::BINARY);
    }

    #[test]
    fn test_binary_rejects_structured_values() {
        let transcoder = RawBinaryTranscoder;
        let doc = Doc { name: "x".into(), count: 1 };
        assert!(transcoder.encode(&doc).is_err());
    }
}
