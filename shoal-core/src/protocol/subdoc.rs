//! Sub-document path specs and their multi-path body encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::constants::*;

/// One path in a multi-path lookup.
///
/// Encodes as: per-path opcode, flag bits, path length (u16), path.
#[derive(Debug, Clone)]
pub struct LookupInSpec {
    /// Per-path opcode (`SUBDOC_GET`, `SUBDOC_EXISTS`, ...).
    pub opcode: u8,
    /// Path flag bits.
    pub flags: u8,
    /// JSON path within the document.
    pub path: String,
}

impl LookupInSpec {
    /// Reads the value at `path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self { opcode: SUBDOC_GET, flags: 0, path: path.into() }
    }

    /// Tests whether `path` exists.
    pub fn exists(path: impl Into<String>) -> Self {
        Self { opcode: SUBDOC_EXISTS, flags: 0, path: path.into() }
    }

    /// Counts the members at `path`.
    pub fn count(path: impl Into<String>) -> Self {
        Self { opcode: SUBDOC_GET_COUNT, flags: 0, path: path.into() }
    }

    /// Marks the path as addressing an extended attribute.
    pub fn xattr(mut self) -> Self {
        self.flags |= SUBDOC_FLAG_XATTR;
        self
    }

    /// Writes this spec into a multi-lookup body.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(4 + self.path.len());
        dst.put_u8(self.opcode);
        dst.put_u8(self.flags);
        dst.put_u16(self.path.len() as u16);
        dst.put_slice(self.path.as_bytes());
    }
}

/// One path in a multi-path mutation.
///
/// Encodes as: per-path opcode, flag bits, path length (u16),
/// value length (u32), path, value.
#[derive(Debug, Clone)]
pub struct MutateInSpec {
    /// Per-path opcode (`SUBDOC_DICT_UPSERT`, ...).
    pub opcode: u8,
    /// Path flag bits.
    pub flags: u8,
    /// JSON path within the document.
    pub path: String,
    /// Encoded JSON payload for the path.
    pub value: Bytes,
}

impl MutateInSpec {
    /// Inserts or replaces the dictionary entry at `path`.
    pub fn upsert(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self { opcode: SUBDOC_DICT_UPSERT, flags: 0, path: path.into(), value: value.into() }
    }

    /// Inserts at `path`, failing if it already exists.
    pub fn insert(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self { opcode: SUBDOC_DICT_ADD, flags: 0, path: path.into(), value: value.into() }
    }

    /// Replaces the value at `path`, failing if absent.
    pub fn replace(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self { opcode: SUBDOC_REPLACE, flags: 0, path: path.into(), value: value.into() }
    }

    /// Removes the value at `path`.
    pub fn remove(path: impl Into<String>) -> Self {
        Self { opcode: SUBDOC_DELETE, flags: 0, path: path.into(), value: Bytes::new() }
    }

    /// Appends to the array at `path`.
    pub fn array_append(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self { opcode: SUBDOC_ARRAY_PUSH_LAST, flags: 0, path: path.into(), value: value.into() }
    }

    /// Prepends to the array at `path`.
    pub fn array_prepend(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self { opcode: SUBDOC_ARRAY_PUSH_FIRST, flags: 0, path: path.into(), value: value.into() }
    }

    /// Adds to the array at `path` only if the value is not present.
    pub fn array_add_unique(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self { opcode: SUBDOC_ARRAY_ADD_UNIQUE, flags: 0, path: path.into(), value: value.into() }
    }

    /// Applies a signed delta to the number at `path`.
    pub fn counter(path: impl Into<String>, delta: i64) -> Self {
        Self {
            opcode: SUBDOC_COUNTER,
            flags: 0,
            path: path.into(),
            value: Bytes::from(delta.to_string()),
        }
    }

    /// Creates intermediate path components as needed.
    pub fn create_path(mut self) -> Self {
        self.flags |= SUBDOC_FLAG_CREATE_PATH;
        self
    }

    /// Marks the path as addressing an extended attribute.
    pub fn xattr(mut self) -> Self {
        self.flags |= SUBDOC_FLAG_XATTR;
        self
    }

    /// Writes this spec into a multi-mutation body.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(8 + self.path.len() + self.value.len());
        dst.put_u8(self.opcode);
        dst.put_u8(self.flags);
        dst.put_u16(self.path.len() as u16);
        dst.put_u32(self.value.len() as u32);
        dst.put_slice(self.path.as_bytes());
        dst.put_slice(&self.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_spec_layout() {
        let spec = LookupInSpec::get("name.first");
        let mut buf = BytesMut::new();
        spec.write_to(&mut buf);

        assert_eq!(buf[0], SUBDOC_GET);
        assert_eq!(buf[1], 0);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 10);
        assert_eq!(&buf[4..], b"name.first");
    }

    #[test]
    fn test_mutate_spec_layout() {
        let spec = MutateInSpec::upsert("age", &b"42"[..]);
        let mut buf = BytesMut::new();
        spec.write_to(&mut buf);

        assert_eq!(buf[0], SUBDOC_DICT_UPSERT);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 3);
        assert_eq!(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]), 2);
        assert_eq!(&buf[8..11], b"age");
        assert_eq!(&buf[11..], b"42");
    }

    #[test]
    fn test_xattr_flag() {
        let spec = LookupInSpec::get("_sync.rev").xattr();
        assert_eq!(spec.flags & SUBDOC_FLAG_XATTR, SUBDOC_FLAG_XATTR);
    }

    #[test]
    fn test_create_path_flag() {
        let spec = MutateInSpec::upsert("a.b.c", &b"1"[..]).create_path();
        assert_eq!(spec.flags & SUBDOC_FLAG_CREATE_PATH, SUBDOC_FLAG_CREATE_PATH);
    }

    #[test]
    fn test_counter_value_is_decimal_text() {
        let spec = MutateInSpec::counter("visits", -3);
        assert_eq!(&spec.value[..], b"-3");
    }
}
