//! Response frames and body section views.

use bytes::{Buf, Bytes};

use super::constants::*;
use super::header::ResponseHeader;

/// A decoded response frame.
#[derive(Debug, Clone)]
pub struct KvResponse {
    /// The fixed header.
    pub header: ResponseHeader,
    /// Flexible framing extras (alt-response only).
    pub framing_extras: Bytes,
    /// Extras section.
    pub extras: Bytes,
    /// Key section.
    pub key: Bytes,
    /// Value section.
    pub value: Bytes,
}

impl KvResponse {
    /// Splits a complete body into its sections per the header lengths.
    pub fn from_parts(header: ResponseHeader, mut body: Bytes) -> Self {
        let framing_extras = body.split_to(header.framing_extras_length as usize);
        let extras = body.split_to(header.extras_length as usize);
        let key = body.split_to(header.key_length as usize);
        Self { header, framing_extras, extras, key, value: body }
    }

    /// Returns the status word.
    pub fn status(&self) -> u16 {
        self.header.status
    }

    /// Returns the opaque echoed from the request.
    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    /// Returns the server-assigned CAS.
    pub fn cas(&self) -> u64 {
        self.header.cas
    }

    /// Returns `true` for a Success status.
    pub fn is_success(&self) -> bool {
        self.header.status == STATUS_SUCCESS
    }

    /// Returns the document flags from a Get-family response.
    pub fn flags(&self) -> Option<u32> {
        if self.extras.len() >= 4 {
            Some(u32::from_be_bytes([
                self.extras[0],
                self.extras[1],
                self.extras[2],
                self.extras[3],
            ]))
        } else {
            None
        }
    }

    /// Returns the counter value from an Increment/Decrement response.
    pub fn counter_value(&self) -> Option<u64> {
        if self.value.len() >= 8 {
            let mut slice = &self.value[..];
            Some(slice.get_u64())
        } else {
            None
        }
    }

    /// Returns the resolved collection id from a GetCid response.
    pub fn collection_id(&self) -> Option<u32> {
        // Extras carry manifest uid (u64) then collection id (u32).
        if self.extras.len() >= 12 {
            Some(u32::from_be_bytes([
                self.extras[8],
                self.extras[9],
                self.extras[10],
                self.extras[11],
            ]))
        } else {
            None
        }
    }

    /// Returns the embedded cluster config from a NotMyVBucket response.
    ///
    /// Servers attach the current config as a JSON body so the client can
    /// re-route without a separate fetch. Empty bodies yield `None`.
    pub fn embedded_config(&self) -> Option<&[u8]> {
        if self.header.status == STATUS_NOT_MY_VBUCKET && !self.value.is_empty() {
            Some(&self.value)
        } else {
            None
        }
    }

    /// Parses the per-path fields of a multi-path sub-document response.
    ///
    /// Lookup responses carry `status (u16), value length (u32), value`
    /// per path in spec order; mutation responses prefix each field with
    /// the index of the spec it answers.
    pub fn subdoc_fields(&self, mutation: bool) -> Vec<SubdocField> {
        let mut fields = Vec::new();
        let mut body = self.value.clone();

        while !body.is_empty() {
            let index = if mutation {
                if body.len() < 1 {
                    break;
                }
                body.get_u8()
            } else {
                fields.len() as u8
            };

            if body.len() < 6 {
                break;
            }
            let status = body.get_u16();
            let value_len = body.get_u32() as usize;
            if body.len() < value_len {
                break;
            }
            let value = body.split_to(value_len);

            fields.push(SubdocField { index, status, value });
        }

        fields
    }
}

/// One path's result within a multi-path sub-document response.
#[derive(Debug, Clone)]
pub struct SubdocField {
    /// Index of the spec this field answers.
    pub index: u8,
    /// Per-path status word.
    pub status: u16,
    /// Value at the path (empty for exists/mutations without content).
    pub value: Bytes,
}

impl SubdocField {
    /// Returns `true` if this path succeeded.
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}
