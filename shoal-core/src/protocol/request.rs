//! Request records and their wire encoding.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use super::constants::*;
use super::header::RequestHeader;
use super::subdoc::{LookupInSpec, MutateInSpec};

/// Global opaque counter.
static OPAQUE_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Returns the next process-wide opaque for a request.
pub fn next_opaque() -> u32 {
    OPAQUE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Durability requirement attached to a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityLevel {
    /// Replicate to a majority of nodes before acknowledging.
    Majority,
    /// Majority replication plus persistence on the active node.
    MajorityAndPersistActive,
    /// Persist to a majority of nodes before acknowledging.
    PersistToMajority,
}

impl DurabilityLevel {
    /// Returns the wire value for this level.
    pub fn value(self) -> u8 {
        match self {
            Self::Majority => 0x01,
            Self::MajorityAndPersistActive => 0x02,
            Self::PersistToMajority => 0x03,
        }
    }
}

/// A single key/value request ready for encoding.
///
/// Constructed through the per-opcode constructors below; the opaque is
/// assigned from the process-wide counter at construction time and never
/// reused within a connection's lifetime.
#[derive(Debug, Clone)]
pub struct KvRequest {
    /// Operation code.
    pub opcode: u8,
    /// Target vBucket; 0 for vBucket-less operations.
    pub vbucket_id: u16,
    /// Correlation id.
    pub opaque: u32,
    /// CAS precondition; 0 means unconditional.
    pub cas: u64,
    /// Value datatype bits.
    pub datatype: u8,
    /// Document key (without collection prefix).
    pub key: Bytes,
    /// Extras section.
    pub extras: Bytes,
    /// Value section.
    pub value: Bytes,
    /// Durability requirement; encodes as flexible framing extras.
    pub durability: Option<DurabilityLevel>,
    /// Durability timeout carried alongside the level.
    pub durability_timeout: Option<Duration>,
    /// Collection id; prefixes the key as unsigned LEB128 when set.
    pub collection_id: Option<u32>,
}

impl KvRequest {
    fn new(opcode: u8, key: Bytes, extras: Bytes, value: Bytes) -> Self {
        Self {
            opcode,
            vbucket_id: 0,
            opaque: next_opaque(),
            cas: 0,
            datatype: DATATYPE_RAW,
            key,
            extras,
            value,
            durability: None,
            durability_timeout: None,
            collection_id: None,
        }
    }

    /// Builds a Get request.
    pub fn get(key: impl Into<Bytes>) -> Self {
        Self::new(OP_GET, key.into(), Bytes::new(), Bytes::new())
    }

    /// Builds an unconditional store (upsert).
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>, flags: u32, expiry: u32) -> Self {
        Self::new(OP_SET, key.into(), store_extras(flags, expiry), value.into())
    }

    /// Builds an insert that fails if the key exists.
    pub fn add(key: impl Into<Bytes>, value: impl Into<Bytes>, flags: u32, expiry: u32) -> Self {
        Self::new(OP_ADD, key.into(), store_extras(flags, expiry), value.into())
    }

    /// Builds a replace that fails if the key is absent.
    pub fn replace(
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        flags: u32,
        expiry: u32,
    ) -> Self {
        Self::new(OP_REPLACE, key.into(), store_extras(flags, expiry), value.into())
    }

    /// Builds a Delete request.
    pub fn remove(key: impl Into<Bytes>) -> Self {
        Self::new(OP_DELETE, key.into(), Bytes::new(), Bytes::new())
    }

    /// Builds an Increment request.
    pub fn increment(key: impl Into<Bytes>, delta: u64, initial: u64, expiry: u32) -> Self {
        Self::new(OP_INCREMENT, key.into(), counter_extras(delta, initial, expiry), Bytes::new())
    }

    /// Builds a Decrement request.
    pub fn decrement(key: impl Into<Bytes>, delta: u64, initial: u64, expiry: u32) -> Self {
        Self::new(OP_DECREMENT, key.into(), counter_extras(delta, initial, expiry), Bytes::new())
    }

    /// Builds an Append request.
    pub fn append(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(OP_APPEND, key.into(), Bytes::new(), value.into())
    }

    /// Builds a Prepend request.
    pub fn prepend(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(OP_PREPEND, key.into(), Bytes::new(), value.into())
    }

    /// Builds a Touch request updating only the expiry.
    pub fn touch(key: impl Into<Bytes>, expiry: u32) -> Self {
        Self::new(OP_TOUCH, key.into(), expiry_extras(expiry), Bytes::new())
    }

    /// Builds a GetAndTouch request.
    pub fn get_and_touch(key: impl Into<Bytes>, expiry: u32) -> Self {
        Self::new(OP_GET_AND_TOUCH, key.into(), expiry_extras(expiry), Bytes::new())
    }

    /// Builds a GetAndLock request; `lock_time` is in seconds.
    pub fn get_and_lock(key: impl Into<Bytes>, lock_time: u32) -> Self {
        Self::new(OP_GET_AND_LOCK, key.into(), expiry_extras(lock_time), Bytes::new())
    }

    /// Builds an Unlock request for a previously locked document.
    pub fn unlock(key: impl Into<Bytes>, cas: u64) -> Self {
        let mut request = Self::new(OP_UNLOCK, key.into(), Bytes::new(), Bytes::new());
        request.cas = cas;
        request
    }

    /// Builds an Observe request for a key in a vBucket.
    pub fn observe(vbucket_id: u16, key: &[u8]) -> Self {
        let mut value = BytesMut::with_capacity(4 + key.len());
        value.put_u16(vbucket_id);
        value.put_u16(key.len() as u16);
        value.put_slice(key);
        let mut request = Self::new(OP_OBSERVE, Bytes::new(), Bytes::new(), value.freeze());
        request.vbucket_id = vbucket_id;
        request
    }

    /// Builds a Noop request (circuit-breaker canary, keepalive).
    pub fn noop() -> Self {
        Self::new(OP_NOOP, Bytes::new(), Bytes::new(), Bytes::new())
    }

    /// Builds a HELLO request advertising `features`.
    ///
    /// The key carries the client identifier string the server logs.
    pub fn hello(client_id: &str, features: &[u16]) -> Self {
        let mut value = BytesMut::with_capacity(features.len() * 2);
        for feature in features {
            value.put_u16(*feature);
        }
        Self::new(
            OP_HELLO,
            Bytes::copy_from_slice(client_id.as_bytes()),
            Bytes::new(),
            value.freeze(),
        )
    }

    /// Builds a SASL mechanism listing request.
    pub fn sasl_list_mechanisms() -> Self {
        Self::new(OP_SASL_LIST_MECHANISMS, Bytes::new(), Bytes::new(), Bytes::new())
    }

    /// Builds the first message of a SASL conversation.
    pub fn sasl_auth(mechanism: &str, payload: impl Into<Bytes>) -> Self {
        Self::new(
            OP_SASL_AUTH,
            Bytes::copy_from_slice(mechanism.as_bytes()),
            Bytes::new(),
            payload.into(),
        )
    }

    /// Builds a continuation message of a SASL conversation.
    pub fn sasl_step(mechanism: &str, payload: impl Into<Bytes>) -> Self {
        Self::new(
            OP_SASL_STEP,
            Bytes::copy_from_slice(mechanism.as_bytes()),
            Bytes::new(),
            payload.into(),
        )
    }

    /// Builds a SELECT_BUCKET request binding the session to `bucket`.
    pub fn select_bucket(bucket: &str) -> Self {
        Self::new(
            OP_SELECT_BUCKET,
            Bytes::copy_from_slice(bucket.as_bytes()),
            Bytes::new(),
            Bytes::new(),
        )
    }

    /// Builds a GetClusterConfig request.
    pub fn get_cluster_config() -> Self {
        Self::new(OP_GET_CLUSTER_CONFIG, Bytes::new(), Bytes::new(), Bytes::new())
    }

    /// Builds a GetErrorMap request for the given error map version.
    pub fn get_error_map(version: u16) -> Self {
        let mut value = BytesMut::with_capacity(2);
        value.put_u16(version);
        Self::new(OP_GET_ERROR_MAP, Bytes::new(), Bytes::new(), value.freeze())
    }

    /// Builds a GetCollectionsManifest request.
    pub fn get_collections_manifest() -> Self {
        Self::new(OP_GET_COLLECTIONS_MANIFEST, Bytes::new(), Bytes::new(), Bytes::new())
    }

    /// Builds a GetCid request resolving `"<scope>.<collection>"`.
    pub fn get_cid(qualified_name: &str) -> Self {
        Self::new(
            OP_GET_CID,
            Bytes::new(),
            Bytes::new(),
            Bytes::copy_from_slice(qualified_name.as_bytes()),
        )
    }

    /// Builds a multi-path sub-document lookup.
    pub fn lookup_in(key: impl Into<Bytes>, specs: &[LookupInSpec]) -> Self {
        let mut value = BytesMut::new();
        for spec in specs {
            spec.write_to(&mut value);
        }
        Self::new(OP_SUBDOC_MULTI_LOOKUP, key.into(), Bytes::new(), value.freeze())
    }

    /// Builds a multi-path sub-document mutation.
    pub fn mutate_in(key: impl Into<Bytes>, specs: &[MutateInSpec], expiry: u32) -> Self {
        let mut value = BytesMut::new();
        for spec in specs {
            spec.write_to(&mut value);
        }
        let extras = if expiry != 0 { expiry_extras(expiry) } else { Bytes::new() };
        Self::new(OP_SUBDOC_MULTI_MUTATION, key.into(), extras, value.freeze())
    }

    /// Sets the target vBucket.
    pub fn with_vbucket(mut self, vbucket_id: u16) -> Self {
        self.vbucket_id = vbucket_id;
        self
    }

    /// Sets the CAS precondition.
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Attaches a durability requirement.
    pub fn with_durability(mut self, level: DurabilityLevel, timeout: Option<Duration>) -> Self {
        self.durability = Some(level);
        self.durability_timeout = timeout;
        self
    }

    /// Sets the collection id; the key gains a LEB128 prefix on encode.
    pub fn with_collection_id(mut self, cid: u32) -> Self {
        self.collection_id = Some(cid);
        self
    }

    /// Returns `true` if a durability requirement is attached.
    pub fn has_durability(&self) -> bool {
        self.durability.is_some()
    }

    /// Returns `true` if this opcode mutates server state.
    ///
    /// Decides whether a timeout is surfaced as ambiguous.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self.opcode,
            OP_SET
                | OP_ADD
                | OP_REPLACE
                | OP_DELETE
                | OP_INCREMENT
                | OP_DECREMENT
                | OP_APPEND
                | OP_PREPEND
                | OP_TOUCH
                | OP_GET_AND_TOUCH
                | OP_UNLOCK
                | OP_SUBDOC_MULTI_MUTATION
        )
    }

    fn framing_extras(&self) -> Bytes {
        let level = match self.durability {
            Some(level) => level,
            None => return Bytes::new(),
        };

        let mut framing = BytesMut::with_capacity(4);
        match self.durability_timeout {
            Some(timeout) => {
                framing.put_u8(FRAME_EXTRA_DURABILITY << 4 | 3);
                framing.put_u8(level.value());
                framing.put_u16(timeout.as_millis().min(u16::MAX as u128) as u16);
            }
            None => {
                framing.put_u8(FRAME_EXTRA_DURABILITY << 4 | 1);
                framing.put_u8(level.value());
            }
        }
        framing.freeze()
    }

    fn encoded_key(&self) -> Bytes {
        match self.collection_id {
            Some(cid) => {
                let mut key = BytesMut::with_capacity(5 + self.key.len());
                put_unsigned_leb128(&mut key, cid);
                key.put_slice(&self.key);
                key.freeze()
            }
            None => self.key.clone(),
        }
    }

    /// Encodes the full frame into `dst` without intermediate allocation
    /// beyond the collection-id key rewrite.
    pub fn write_to(&self, dst: &mut BytesMut) {
        let framing = self.framing_extras();
        let key = self.encoded_key();

        let magic = if framing.is_empty() { MAGIC_REQUEST } else { MAGIC_ALT_REQUEST };
        let total_body =
            framing.len() + self.extras.len() + key.len() + self.value.len();

        let header = RequestHeader {
            magic,
            opcode: self.opcode,
            key_length: key.len() as u16,
            extras_length: self.extras.len() as u8,
            framing_extras_length: framing.len() as u8,
            datatype: self.datatype,
            vbucket_id: self.vbucket_id,
            total_body_length: total_body as u32,
            opaque: self.opaque,
            cas: self.cas,
        };

        dst.reserve(HEADER_SIZE + total_body);
        header.write_to(dst);
        dst.put_slice(&framing);
        dst.put_slice(&self.extras);
        dst.put_slice(&key);
        dst.put_slice(&self.value);
    }
}

fn store_extras(flags: u32, expiry: u32) -> Bytes {
    let mut extras = BytesMut::with_capacity(8);
    extras.put_u32(flags);
    extras.put_u32(expiry);
    extras.freeze()
}

fn expiry_extras(expiry: u32) -> Bytes {
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(expiry);
    extras.freeze()
}

fn counter_extras(delta: u64, initial: u64, expiry: u32) -> Bytes {
    let mut extras = BytesMut::with_capacity(20);
    extras.put_u64(delta);
    extras.put_u64(initial);
    extras.put_u32(expiry);
    extras.freeze()
}

fn put_unsigned_leb128(dst: &mut BytesMut, mut value: u32) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_uniqueness() {
        let a = next_opaque();
        let b = next_opaque();
        let c = next_opaque();
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn test_each_request_gets_fresh_opaque() {
        let first = KvRequest::get("a");
        let second = KvRequest::get("a");
        assert_ne!(first.opaque, second.opaque);
    }

    #[test]
    fn test_get_encoding() {
        let request = KvRequest::get("hello").with_vbucket(42);
        let mut buf = BytesMut::new();
        request.write_to(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE + 5);
        assert_eq!(buf[0], MAGIC_REQUEST);
        assert_eq!(buf[1], OP_GET);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 5);
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 42);
        assert_eq!(&buf[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_set_encoding_carries_extras_then_key_then_value() {
        let request = KvRequest::set("k", "v", 0x1000, 30);
        let mut buf = BytesMut::new();
        request.write_to(&mut buf);

        assert_eq!(buf[1], OP_SET);
        assert_eq!(buf[4], 8); // extras length
        let body = &buf[HEADER_SIZE..];
        assert_eq!(u32::from_be_bytes([body[0], body[1], body[2], body[3]]), 0x1000);
        assert_eq!(u32::from_be_bytes([body[4], body[5], body[6], body[7]]), 30);
        assert_eq!(&body[8..9], b"k");
        assert_eq!(&body[9..], b"v");
    }

    #[test]
    fn test_counter_extras_layout() {
        let request = KvRequest::increment("n", 2, 10, 0);
        assert_eq!(request.extras.len(), 20);
        assert_eq!(&request.extras[0..8], &2u64.to_be_bytes());
        assert_eq!(&request.extras[8..16], &10u64.to_be_bytes());
    }

    #[test]
    fn test_durability_switches_to_alt_magic() {
        let request = KvRequest::set("k", "v", 0, 0)
            .with_durability(DurabilityLevel::Majority, None);
        let mut buf = BytesMut::new();
        request.write_to(&mut buf);

        assert_eq!(buf[0], MAGIC_ALT_REQUEST);
        assert_eq!(buf[2], 2); // framing extras length
        assert_eq!(buf[3], 1); // key length (narrow field)
        let framing = &buf[HEADER_SIZE..HEADER_SIZE + 2];
        assert_eq!(framing[0] >> 4, FRAME_EXTRA_DURABILITY);
        assert_eq!(framing[1], DurabilityLevel::Majority.value());
    }

    #[test]
    fn test_durability_timeout_encoded() {
        let request = KvRequest::remove("k")
            .with_durability(DurabilityLevel::PersistToMajority, Some(Duration::from_millis(1500)));
        let mut buf = BytesMut::new();
        request.write_to(&mut buf);

        let framing = &buf[HEADER_SIZE..HEADER_SIZE + 4];
        assert_eq!(framing[0] & 0x0f, 3);
        assert_eq!(u16::from_be_bytes([framing[2], framing[3]]), 1500);
    }

    #[test]
    fn test_collection_id_prefixes_key() {
        let request = KvRequest::get("doc").with_collection_id(0x88);
        let mut buf = BytesMut::new();
        request.write_to(&mut buf);

        // 0x88 needs two LEB128 bytes: 0x88 0x01.
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 5);
        let body = &buf[HEADER_SIZE..];
        assert_eq!(body[0], 0x88);
        assert_eq!(body[1], 0x01);
        assert_eq!(&body[2..], b"doc");
    }

    #[test]
    fn test_small_collection_id_single_byte() {
        let request = KvRequest::get("doc").with_collection_id(9);
        let mut buf = BytesMut::new();
        request.write_to(&mut buf);
        assert_eq!(buf[HEADER_SIZE], 9);
    }

    #[test]
    fn test_unlock_carries_cas() {
        let request = KvRequest::unlock("k", 777);
        assert_eq!(request.cas, 777);
        assert_eq!(request.opcode, OP_UNLOCK);
    }

    #[test]
    fn test_hello_lists_features() {
        let request = KvRequest::hello("shoal-rs/0.3", &[FEATURE_XERROR, FEATURE_SELECT_BUCKET]);
        assert_eq!(request.value.len(), 4);
        assert_eq!(&request.value[..], &[0x00, 0x07, 0x00, 0x08]);
    }

    #[test]
    fn test_mutation_classification() {
        assert!(KvRequest::set("k", "v", 0, 0).is_mutation());
        assert!(KvRequest::remove("k").is_mutation());
        assert!(KvRequest::increment("k", 1, 0, 0).is_mutation());
        assert!(!KvRequest::get("k").is_mutation());
        assert!(!KvRequest::noop().is_mutation());
        assert!(!KvRequest::lookup_in("k", &[]).is_mutation());
    }
}
