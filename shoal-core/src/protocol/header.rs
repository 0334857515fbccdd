//! Fixed 24-byte request and response headers.

use bytes::{Buf, BufMut, BytesMut};

use super::constants::*;

/// Header of an outgoing request frame.
///
/// Layout on the wire (big-endian):
/// magic, opcode, key length (u16), extras length (u8), datatype,
/// vBucket id (u16), total body length (u32), opaque (u32), CAS (u64).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Request magic (plain or flexible-framing).
    pub magic: u8,
    /// Operation code.
    pub opcode: u8,
    /// Length of the key section.
    pub key_length: u16,
    /// Length of the extras section.
    pub extras_length: u8,
    /// Length of the flexible framing extras (alt-request only).
    pub framing_extras_length: u8,
    /// Value datatype bits.
    pub datatype: u8,
    /// Target vBucket.
    pub vbucket_id: u16,
    /// Total body length: framing extras + extras + key + value.
    pub total_body_length: u32,
    /// Correlation id; the only key used to match the response.
    pub opaque: u32,
    /// Compare-and-swap token; 0 means "any".
    pub cas: u64,
}

impl RequestHeader {
    /// Writes this header to the buffer.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.magic);
        dst.put_u8(self.opcode);
        if self.magic == MAGIC_ALT_REQUEST {
            dst.put_u8(self.framing_extras_length);
            dst.put_u8(self.key_length as u8);
        } else {
            dst.put_u16(self.key_length);
        }
        dst.put_u8(self.extras_length);
        dst.put_u8(self.datatype);
        dst.put_u16(self.vbucket_id);
        dst.put_u32(self.total_body_length);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
    }
}

/// Header of an incoming response frame.
///
/// Identical geometry to [`RequestHeader`] except that the vBucket field
/// carries the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Response magic (plain or flexible-framing).
    pub magic: u8,
    /// Operation code echoed from the request.
    pub opcode: u8,
    /// Length of the key section.
    pub key_length: u16,
    /// Length of the extras section.
    pub extras_length: u8,
    /// Length of the flexible framing extras (alt-response only).
    pub framing_extras_length: u8,
    /// Value datatype bits.
    pub datatype: u8,
    /// Status word for this response.
    pub status: u16,
    /// Total body length: framing extras + extras + key + value.
    pub total_body_length: u32,
    /// Correlation id echoed from the request.
    pub opaque: u32,
    /// Server-assigned CAS of the document after the operation.
    pub cas: u64,
}

impl ResponseHeader {
    /// Reads a response header from the buffer.
    ///
    /// Returns `None` if fewer than [`HEADER_SIZE`] bytes are available.
    /// The buffer is only advanced on success.
    pub fn read_from(src: &mut BytesMut) -> Option<Self> {
        if src.len() < HEADER_SIZE {
            return None;
        }

        let magic = src.get_u8();
        let opcode = src.get_u8();
        let (framing_extras_length, key_length) = if magic == MAGIC_ALT_RESPONSE {
            let framing = src.get_u8();
            let key = src.get_u8() as u16;
            (framing, key)
        } else {
            (0, src.get_u16())
        };
        let extras_length = src.get_u8();
        let datatype = src.get_u8();
        let status = src.get_u16();
        let total_body_length = src.get_u32();
        let opaque = src.get_u32();
        let cas = src.get_u64();

        Some(Self {
            magic,
            opcode,
            key_length,
            extras_length,
            framing_extras_length,
            datatype,
            status,
            total_body_length,
            opaque,
            cas,
        })
    }

    /// Peeks the total body length without consuming the buffer.
    ///
    /// Returns `None` if the header is not yet complete.
    pub fn peek_body_length(src: &[u8]) -> Option<usize> {
        if src.len() < HEADER_SIZE {
            return None;
        }
        Some(u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_wire_size() {
        let header = RequestHeader {
            magic: MAGIC_REQUEST,
            opcode: OP_GET,
            key_length: 5,
            extras_length: 0,
            framing_extras_length: 0,
            datatype: DATATYPE_RAW,
            vbucket_id: 42,
            total_body_length: 5,
            opaque: 7,
            cas: 0,
        };

        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
    }

    #[test]
    fn test_response_header_short_buffer() {
        let mut buf = BytesMut::from(&[MAGIC_RESPONSE, OP_GET, 0, 0][..]);
        assert!(ResponseHeader::read_from(&mut buf).is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_request_response_field_alignment() {
        // A response header read from request-header bytes must land the
        // status word where the request carried the vBucket id.
        let request = RequestHeader {
            magic: MAGIC_REQUEST,
            opcode: OP_SET,
            key_length: 3,
            extras_length: 8,
            framing_extras_length: 0,
            datatype: DATATYPE_JSON,
            vbucket_id: 0x0007,
            total_body_length: 20,
            opaque: 0xdeadbeef,
            cas: 0x1122334455667788,
        };

        let mut buf = BytesMut::new();
        request.write_to(&mut buf);

        let response = ResponseHeader::read_from(&mut buf).unwrap();
        assert_eq!(response.opcode, OP_SET);
        assert_eq!(response.key_length, 3);
        assert_eq!(response.extras_length, 8);
        assert_eq!(response.status, 0x0007);
        assert_eq!(response.total_body_length, 20);
        assert_eq!(response.opaque, 0xdeadbeef);
        assert_eq!(response.cas, 0x1122334455667788);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_peek_body_length() {
        let header = RequestHeader {
            magic: MAGIC_REQUEST,
            opcode: OP_GET,
            key_length: 5,
            extras_length: 0,
            framing_extras_length: 0,
            datatype: DATATYPE_RAW,
            vbucket_id: 0,
            total_body_length: 99,
            opaque: 1,
            cas: 0,
        };

        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(ResponseHeader::peek_body_length(&buf), Some(99));
        assert_eq!(ResponseHeader::peek_body_length(&buf[..10]), None);
    }

    #[test]
    fn test_alt_response_header_framing_extras() {
        let mut buf = BytesMut::new();
        buf.put_u8(MAGIC_ALT_RESPONSE);
        buf.put_u8(OP_SET);
        buf.put_u8(3); // framing extras
        buf.put_u8(4); // key length
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u16(STATUS_SUCCESS);
        buf.put_u32(7);
        buf.put_u32(55);
        buf.put_u64(9);

        let header = ResponseHeader::read_from(&mut buf).unwrap();
        assert_eq!(header.framing_extras_length, 3);
        assert_eq!(header.key_length, 4);
        assert_eq!(header.opaque, 55);
    }
}
