//! Collection-id cache and refresh.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio_util::sync::CancellationToken;

use shoal_core::{KvRequest, Result, ShoalError};

use super::node::ClusterNode;

/// Cache of `scope.collection` names to their numeric ids.
///
/// Ids can change server-side (collection dropped and recreated); a
/// stale id surfaces as a collection-outdated error, which triggers a
/// refresh against the node the operation was routed to.
#[derive(Debug, Default)]
pub struct CollectionCache {
    ids: RwLock<HashMap<String, u32>>,
}

impl CollectionCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached id for a qualified collection name.
    pub fn get(&self, qualified_name: &str) -> Option<u32> {
        self.ids.read().expect("cid lock").get(qualified_name).copied()
    }

    /// Stores a resolved collection id.
    pub fn store(&self, qualified_name: &str, cid: u32) {
        self.ids
            .write()
            .expect("cid lock")
            .insert(qualified_name.to_string(), cid);
    }

    /// Drops a cached id.
    pub fn invalidate(&self, qualified_name: &str) {
        self.ids.write().expect("cid lock").remove(qualified_name);
    }

    /// Resolves a collection id on the given node and caches it.
    pub async fn refresh(&self, node: &ClusterNode, qualified_name: &str) -> Result<u32> {
        let response = node
            .send(KvRequest::get_cid(qualified_name), CancellationToken::new())
            .await?;

        let cid = response.collection_id().ok_or_else(|| {
            ShoalError::Protocol(format!(
                "GET_CID response for '{qualified_name}' carries no collection id"
            ))
        })?;

        tracing::debug!(collection = qualified_name, cid, "refreshed collection id");
        self.store(qualified_name, cid);
        Ok(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cache_misses() {
        let cache = CollectionCache::new();
        assert_eq!(cache.get("app.users"), None);
    }

    #[test]
    fn test_store_and_get() {
        let cache = CollectionCache::new();
        cache.store("app.users", 0x1b);
        assert_eq!(cache.get("app.users"), Some(0x1b));
        assert_eq!(cache.get("app.orders"), None);
    }

    #[test]
    fn test_invalidate() {
        let cache = CollectionCache::new();
        cache.store("app.users", 9);
        cache.invalidate("app.users");
        assert_eq!(cache.get("app.users"), None);
    }

    #[test]
    fn test_store_overwrites() {
        let cache = CollectionCache::new();
        cache.store("app.users", 9);
        cache.store("app.users", 12);
        assert_eq!(cache.get("app.users"), Some(12));
    }
}
