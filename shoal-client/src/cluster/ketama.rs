//! Consistent-hash key routing for memcached-style buckets.

use md5::{Digest, Md5};

/// Points placed on the ring per server, before the 4-way hash split.
const POINTS_PER_SERVER: usize = 40;

/// MD5-based consistent-hash ring.
///
/// Each server contributes 160 ring points (40 hashes, 4 points each).
/// A key routes to the first point at or clockwise of its own hash, so
/// adding or removing a server only remaps the keys adjacent to its
/// points.
#[derive(Debug, Clone)]
pub struct KetamaKeyMapper {
    ring: Vec<(u32, usize)>,
    server_count: usize,
}

impl KetamaKeyMapper {
    /// Builds a ring from server authority strings (`host:port`).
    pub fn new(servers: &[String]) -> Self {
        let mut ring = Vec::with_capacity(servers.len() * POINTS_PER_SERVER * 4);

        for (server_index, server) in servers.iter().enumerate() {
            for point in 0..POINTS_PER_SERVER {
                let digest = Md5::digest(format!("{server}-{point}").as_bytes());
                for chunk in 0..4 {
                    let offset = chunk * 4;
                    let value = u32::from_le_bytes([
                        digest[offset],
                        digest[offset + 1],
                        digest[offset + 2],
                        digest[offset + 3],
                    ]);
                    ring.push((value, server_index));
                }
            }
        }

        ring.sort_unstable_by_key(|(hash, _)| *hash);
        Self { ring, server_count: servers.len() }
    }

    /// Returns the number of servers on the ring.
    pub fn server_count(&self) -> usize {
        self.server_count
    }

    /// Routes a key to a server index, or `None` on an empty ring.
    pub fn server_for_key(&self, key: &[u8]) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }

        let digest = Md5::digest(key);
        let hash = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);

        let index = match self.ring.binary_search_by_key(&hash, |(h, _)| *h) {
            Ok(index) => index,
            Err(index) if index == self.ring.len() => 0,
            Err(index) => index,
        };

        Some(self.ring[index].1)
    }
}
