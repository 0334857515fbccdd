//! Key-to-vBucket routing for document buckets.

/// Immutable key mapper derived from a cluster configuration's vBucket
/// server map.
///
/// Each vBucket entry lists the primary server index first, followed by
/// replica indices; `-1` marks an unassigned slot. Mappers are swapped
/// wholesale on topology change and never mutated in place, so readers
/// always observe a consistent snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VBucketKeyMapper {
    vbucket_map: Vec<Vec<i32>>,
    replica_count: usize,
}

impl VBucketKeyMapper {
    /// Builds a mapper from a vBucket map.
    ///
    /// The map length is expected to be a power of two; anything else is
    /// routed with `mod` semantics all the same.
    pub fn new(vbucket_map: Vec<Vec<i32>>, replica_count: usize) -> Self {
        Self { vbucket_map, replica_count }
    }

    /// Returns the number of vBuckets.
    pub fn vbucket_count(&self) -> usize {
        self.vbucket_map.len()
    }

    /// Returns the number of configured replicas.
    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    /// Computes the vBucket index for a key.
    // Standard IEEE CRC32 folded into the vBucket space. Any server-side
    // hash variant change lands here and nowhere else.
    pub fn vbucket_index(&self, key: &[u8]) -> u16 {
        if self.vbucket_map.is_empty() {
            return 0;
        }
        let hash = crc32fast::hash(key);
        (hash as usize % self.vbucket_map.len()) as u16
    }

    /// Returns the primary server index for a vBucket, or `None` if the
    /// slot is unassigned.
    pub fn primary_for_vbucket(&self, vbucket: u16) -> Option<usize> {
        let entry = self.vbucket_map.get(vbucket as usize)?;
        match entry.first() {
            Some(&index) if index >= 0 => Some(index as usize),
            _ => None,
        }
    }

    /// Returns the server index of replica `replica` (0-based) for a
    /// vBucket, or `None` when no replica is available.
    pub fn replica_for_vbucket(&self, vbucket: u16, replica: usize) -> Option<usize> {
        let entry = self.vbucket_map.get(vbucket as usize)?;
        match entry.get(replica + 1) {
            Some(&index) if index >= 0 => Some(index as usize),
            _ => None,
        }
    }

    /// Routes a key to its vBucket and primary server index.
    pub fn route(&self, key: &[u8]) -> (u16, Option<usize>) {
        let vbucket = self.vbucket_index(key);
        (vbucket, self.primary_for_vbucket(vbucket))
    }
}
