//! Bucket state: node list, key mapper, and config application rules.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use shoal_core::{KvRequest, KvResponse, Result, ShoalError};

use super::collections::CollectionCache;
use super::ketama::KetamaKeyMapper;
use super::kv_map::ClusterMap;
use super::node::ClusterNode;
use super::vbucket::VBucketKeyMapper;

/// Whether a bucket stores documents or memcached-style values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    /// Sharded document bucket routed by vBucket hash.
    Document,
    /// Cache bucket routed by consistent hashing.
    Memcached,
}

/// Which copy of a document an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaTarget {
    /// The active copy.
    Primary,
    /// Replica `n` (0-based).
    Replica(usize),
}

/// Result of offering a configuration to a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigApplied {
    /// Whether the config was accepted at all.
    pub applied: bool,
    /// Whether the key mapper was rebuilt.
    pub vbucket_map_changed: bool,
    /// Whether the node set differs and the registry needs a diff.
    pub nodes_changed: bool,
}

impl ConfigApplied {
    fn dropped() -> Self {
        Self { applied: false, vbucket_map_changed: false, nodes_changed: false }
    }
}

/// One open bucket and its routing state.
///
/// The key mapper and node list are immutable snapshots swapped by
/// reference on each accepted revision, so routing reads never observe a
/// half-applied topology.
pub struct Bucket {
    name: String,
    kind: BucketKind,
    current_rev: AtomicU64,
    nodes: RwLock<Vec<Arc<ClusterNode>>>,
    key_mapper: RwLock<Option<Arc<VBucketKeyMapper>>>,
    ketama: RwLock<Option<Arc<KetamaKeyMapper>>>,
    last_map: RwLock<Option<ClusterMap>>,
    collections: CollectionCache,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("rev", &self.current_rev())
            .finish()
    }
}

impl Bucket {
    /// Creates an empty bucket record awaiting its first configuration.
    pub fn new(name: impl Into<String>, kind: BucketKind) -> Self {
        Self {
            name: name.into(),
            kind,
            current_rev: AtomicU64::new(0),
            nodes: RwLock::new(Vec::new()),
            key_mapper: RwLock::new(None),
            ketama: RwLock::new(None),
            last_map: RwLock::new(None),
            collections: CollectionCache::new(),
        }
    }

    /// Returns the bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the bucket kind.
    pub fn kind(&self) -> BucketKind {
        self.kind
    }

    /// Returns the collection-id cache.
    pub fn collections(&self) -> &CollectionCache {
        &self.collections
    }

    /// Returns the revision of the last accepted configuration.
    pub fn current_rev(&self) -> u64 {
        self.current_rev.load(Ordering::Acquire)
    }

    /// Returns the current key mapper snapshot.
    pub fn key_mapper(&self) -> Option<Arc<VBucketKeyMapper>> {
        self.key_mapper.read().expect("mapper lock").clone()
    }

    /// Returns the nodes serving this bucket, in server-list order.
    pub fn nodes(&self) -> Vec<Arc<ClusterNode>> {
        self.nodes.read().expect("nodes lock").clone()
    }

    /// Atomically replaces the node list.
    pub fn set_nodes(&self, nodes: Vec<Arc<ClusterNode>>) {
        if matches!(self.kind, BucketKind::Memcached) {
            let authorities: Vec<String> =
                nodes.iter().map(|n| n.authority().to_string()).collect();
            *self.ketama.write().expect("ketama lock") =
                Some(Arc::new(KetamaKeyMapper::new(&authorities)));
        }
        *self.nodes.write().expect("nodes lock") = nodes;
    }

    /// Adds a node if it is not already present.
    pub fn add_node(&self, node: Arc<ClusterNode>) {
        let mut nodes = self.nodes.write().expect("nodes lock");
        if !nodes.iter().any(|n| n.id() == node.id()) {
            nodes.push(node);
        }
    }

    /// Offers a configuration revision to this bucket.
    ///
    /// Apply rules, in order: drop stale or equal revisions; drop configs
    /// for other buckets; rebuild the key mapper when the vBucket map
    /// changed; report a node diff when the node set changed. Applying
    /// the same revision twice is a structural no-op.
    pub fn config_updated(&self, map: &ClusterMap) -> ConfigApplied {
        let current = self.current_rev();
        if map.rev <= current && current != 0 {
            tracing::debug!(
                bucket = %self.name,
                offered = map.rev,
                current,
                "dropping stale config revision"
            );
            return ConfigApplied::dropped();
        }

        if let Some(name) = &map.name {
            if name != &self.name {
                tracing::debug!(bucket = %self.name, config_for = %name, "dropping foreign config");
                return ConfigApplied::dropped();
            }
        }

        let last = self.last_map.read().expect("last map lock").clone();
        let vbucket_map_changed = match &last {
            Some(last) => !map.same_vbucket_map(last),
            None => map.vbucket_server_map.is_some(),
        };
        let nodes_changed = match &last {
            Some(last) => !map.same_nodes(last),
            None => true,
        };

        if vbucket_map_changed {
            let mapper = map.build_key_mapper().map(Arc::new);
            *self.key_mapper.write().expect("mapper lock") = mapper;
            tracing::info!(bucket = %self.name, rev = map.rev, "rebuilt key mapper");
        }

        self.current_rev.store(map.rev, Ordering::Release);
        *self.last_map.write().expect("last map lock") = Some(map.clone());

        tracing::debug!(
            bucket = %self.name,
            rev = map.rev,
            vbucket_map_changed,
            nodes_changed,
            "applied config"
        );

        ConfigApplied { applied: true, vbucket_map_changed, nodes_changed }
    }

    /// Routes a key to its vBucket id and server index.
    pub fn route(&self, key: &[u8]) -> Result<(u16, usize)> {
        match self.kind {
            BucketKind::Document => {
                let mapper = self
                    .key_mapper()
                    .ok_or_else(|| ShoalError::Config("bucket has no key mapper yet".to_string()))?;
                let (vbucket, primary) = mapper.route(key);
                let index = primary.ok_or(ShoalError::NotMyVBucket)?;
                Ok((vbucket, index))
            }
            BucketKind::Memcached => {
                let ketama = self.ketama.read().expect("ketama lock").clone();
                let ring = ketama
                    .ok_or_else(|| ShoalError::Config("bucket has no node ring yet".to_string()))?;
                let index = ring
                    .server_for_key(key)
                    .ok_or_else(|| ShoalError::Config("empty node ring".to_string()))?;
                Ok((0, index))
            }
        }
    }

    /// Routes a key to a replica's server index.
    pub fn route_replica(&self, key: &[u8], target: ReplicaTarget) -> Result<(u16, usize)> {
        match target {
            ReplicaTarget::Primary => self.route(key),
            ReplicaTarget::Replica(replica) => {
                let mapper = self
                    .key_mapper()
                    .ok_or_else(|| ShoalError::Config("bucket has no key mapper yet".to_string()))?;
                let vbucket = mapper.vbucket_index(key);
                let index = mapper
                    .replica_for_vbucket(vbucket, replica)
                    .ok_or_else(|| {
                        ShoalError::InvalidArgument(format!("no replica {replica} for key"))
                    })?;
                Ok((vbucket, index))
            }
        }
    }

    /// Resolves the node behind a server index.
    pub fn node_at(&self, index: usize) -> Option<Arc<ClusterNode>> {
        self.nodes.read().expect("nodes lock").get(index).cloned()
    }

    /// Routes and sends a request against the primary for its key.
    ///
    /// The request's key is used for routing; the vBucket id is stamped
    /// onto the request so the server can verify the dispatch.
    pub async fn send(
        &self,
        mut request: KvRequest,
        cancel: CancellationToken,
    ) -> Result<KvResponse> {
        let (vbucket, index) = self.route(&request.key)?;
        request.vbucket_id = vbucket;

        let node = self
            .node_at(index)
            .ok_or_else(|| ShoalError::Connection(format!("no node at index {index}")))?;
        node.send(request, cancel).await
    }

    /// Sends a collection-scoped request, refreshing the collection id
    /// and retrying once on the same node when it has gone stale.
    pub async fn send_in_collection(
        &self,
        request: KvRequest,
        qualified_name: &str,
        cancel: CancellationToken,
    ) -> Result<KvResponse> {
        let (vbucket, index) = self.route(&request.key)?;
        let node = self
            .node_at(index)
            .ok_or_else(|| ShoalError::Connection(format!("no node at index {index}")))?;

        let cid = match self.collections.get(qualified_name) {
            Some(cid) => cid,
            None => self.collections.refresh(&node, qualified_name).await?,
        };

        let attempt = request.clone().with_vbucket(vbucket).with_collection_id(cid);
        match node.send(attempt, cancel.clone()).await {
            Err(ShoalError::CollectionOutdated) => {
                let cid = self.collections.refresh(&node, qualified_name).await?;
                let retry = request.with_vbucket(vbucket).with_collection_id(cid);
                node.send(retry, cancel).await
            }
            other => other,
        }
    }

    /// Disposes every node serving this bucket.
    pub async fn dispose(&self) {
        let nodes = {
            let mut guard = self.nodes.write().expect("nodes lock");
            std::mem::take(&mut *guard)
        };
        for node in nodes {
            node.dispose().await;
        }
        tracing::debug!(bucket = %self.name, "bucket disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_json(rev: u64, name: &str, vbuckets: &[[i32; 2]], hosts: &[&str]) -> ClusterMap {
        let nodes: Vec<String> = hosts
            .iter()
            .map(|h| format!(r#"{{"hostname": "{h}", "services": {{"kv": 11210}}}}"#))
            .collect();
        let servers: Vec<String> = hosts.iter().map(|h| format!(r#""{h}:11210""#)).collect();
        let entries: Vec<String> = vbuckets
            .iter()
            .map(|[p, r]| format!("[{p}, {r}]"))
            .collect();
        let raw = format!(
            r#"{{
                "rev": {rev},
                "name": "{name}",
                "nodeLocator": "vbucket",
                "nodesExt": [{}],
                "vBucketServerMap": {{
                    "hashAlgorithm": "CRC",
                    "numReplicas": 1,
                    "serverList": [{}],
                    "vBucketMap": [{}]
                }}
            }}"#,
            nodes.join(","),
            servers.join(","),
            entries.join(",")
        );
        ClusterMap::parse(raw.as_bytes(), "h").unwrap()
    }

    #[test]
    fn test_first_config_applies() {
        let bucket = Bucket::new("orders", BucketKind::Document);
        let applied = bucket.config_updated(&map_json(7, "orders", &[[0, 1], [1, 0]], &["a", "b"]));

        assert!(applied.applied);
        assert!(applied.vbucket_map_changed);
        assert!(applied.nodes_changed);
        assert_eq!(bucket.current_rev(), 7);
        assert!(bucket.key_mapper().is_some());
    }

    #[test]
    fn test_revision_regression_ignored() {
        let bucket = Bucket::new("orders", BucketKind::Document);
        bucket.config_updated(&map_json(7, "orders", &[[0, 1], [1, 0]], &["a", "b"]));
        let mapper_at_seven = bucket.key_mapper().unwrap();

        let applied = bucket.config_updated(&map_json(5, "orders", &[[1, 0], [0, 1]], &["a"]));

        assert!(!applied.applied);
        assert_eq!(bucket.current_rev(), 7);
        assert!(Arc::ptr_eq(&bucket.key_mapper().unwrap(), &mapper_at_seven));
    }

    #[test]
    fn test_same_revision_is_idempotent() {
        let bucket = Bucket::new("orders", BucketKind::Document);
        let map = map_json(7, "orders", &[[0, 1], [1, 0]], &["a", "b"]);
        bucket.config_updated(&map);
        let mapper = bucket.key_mapper().unwrap();

        let applied = bucket.config_updated(&map);
        assert!(!applied.applied);
        assert!(Arc::ptr_eq(&bucket.key_mapper().unwrap(), &mapper));
    }

    #[test]
    fn test_foreign_bucket_config_dropped() {
        let bucket = Bucket::new("orders", BucketKind::Document);
        let applied = bucket.config_updated(&map_json(3, "sessions", &[[0, 1]], &["a"]));
        assert!(!applied.applied);
        assert_eq!(bucket.current_rev(), 0);
    }

    #[test]
    fn test_unchanged_vbucket_map_keeps_mapper_identity_decision() {
        let bucket = Bucket::new("orders", BucketKind::Document);
        bucket.config_updated(&map_json(7, "orders", &[[0, 1], [1, 0]], &["a", "b"]));

        // Same map contents at a higher revision: accepted, mapper not rebuilt.
        let applied = bucket.config_updated(&map_json(8, "orders", &[[0, 1], [1, 0]], &["a", "b"]));
        assert!(applied.applied);
        assert!(!applied.vbucket_map_changed);
        assert!(!applied.nodes_changed);
        assert_eq!(bucket.current_rev(), 8);
    }

    #[test]
    fn test_route_requires_mapper() {
        let bucket = Bucket::new("orders", BucketKind::Document);
        assert!(bucket.route(b"k").is_err());

        bucket.config_updated(&map_json(1, "orders", &[[0, -1], [0, -1]], &["a"]));
        let (vbucket, index) = bucket.route(b"k").unwrap();
        assert!(vbucket < 2);
        assert_eq!(index, 0);
    }

    #[test]
    fn test_route_is_stable_while_map_unchanged() {
        let bucket = Bucket::new("orders", BucketKind::Document);
        bucket.config_updated(&map_json(
            1,
            "orders",
            &[[0, 1], [1, 0], [0, 1], [1, 0]],
            &["a", "b"],
        ));

        let first = bucket.route(b"stable").unwrap();
        for _ in 0..50 {
            assert_eq!(bucket.route(b"stable").unwrap(), first);
        }
    }

    #[test]
    fn test_replica_routing() {
        let bucket = Bucket::new("orders", BucketKind::Document);
        bucket.config_updated(&map_json(1, "orders", &[[0, 1], [1, -1]], &["a", "b"]));

        let mapper = bucket.key_mapper().unwrap();
        for key in [&b"x"[..], b"y", b"z", b"w"] {
            let vbucket = mapper.vbucket_index(key);
            let result = bucket.route_replica(key, ReplicaTarget::Replica(0));
            if vbucket == 0 {
                assert_eq!(result.unwrap(), (0, 1));
            } else {
                // vBucket 1 has no replica assigned.
                assert!(result.is_err());
            }
        }
    }

    #[test]
    fn test_memcached_bucket_routes_by_ring() {
        let bucket = Bucket::new("cache", BucketKind::Memcached);
        assert!(bucket.route(b"k").is_err());
        // Ketama ring is derived from the node list; with no nodes the
        // bucket cannot route. Node-list-driven tests live in the
        // context tests where real nodes exist.
    }
}
