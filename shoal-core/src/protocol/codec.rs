//! Codec implementation for the binary key/value protocol.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::constants::*;
use super::header::ResponseHeader;
use super::request::KvRequest;
use super::response::KvResponse;
use crate::error::{Result, ShoalError};

/// Codec for encoding requests and decoding responses.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits for use
/// with tokio's framed I/O.
#[derive(Debug, Default)]
pub struct KvCodec;

impl KvCodec {
    /// Creates a new codec instance.
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<KvRequest> for KvCodec {
    type Error = ShoalError;

    fn encode(&mut self, item: KvRequest, dst: &mut BytesMut) -> Result<()> {
        item.write_to(dst);
        Ok(())
    }
}

impl Decoder for KvCodec {
    type Item = KvResponse;
    type Error = ShoalError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let body_length = match ResponseHeader::peek_body_length(src) {
            Some(length) => length,
            None => return Ok(None),
        };

        if src.len() < HEADER_SIZE + body_length {
            return Ok(None);
        }

        let magic = src[0];
        if magic != MAGIC_RESPONSE && magic != MAGIC_ALT_RESPONSE {
            return Err(ShoalError::Protocol(format!(
                "unexpected response magic 0x{magic:02x}"
            )));
        }

        let header = ResponseHeader::read_from(src)
            .ok_or_else(|| ShoalError::Protocol("failed to read response header".to_string()))?;
        let body = src.split_to(body_length).freeze();

        Ok(Some(KvResponse::from_parts(header, body)))
    }
}
