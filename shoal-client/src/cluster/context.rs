//! Cluster context: node registry, bootstrap, and config application.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shoal_core::protocol::constants::STATUS_SUCCESS;
use shoal_core::{KvRequest, Result, ShoalError};

use super::bucket::{Bucket, BucketKind};
use super::config_stream::ConfigStream;
use super::kv_map::ClusterMap;
use super::node::ClusterNode;
use crate::config::ClientConfig;
use crate::connection::{ConnectionPool, TcpConnectionFactory};
use crate::connstr::ConnectionString;

/// Capacity of the config publish channel.
const CONFIG_CHANNEL_CAPACITY: usize = 64;

/// The services a node may host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Binary key/value service.
    KeyValue,
    /// Query service.
    Query,
    /// Full-text search service.
    Search,
    /// Analytics service.
    Analytics,
    /// Views service (bucket-scoped).
    Views,
    /// Management (HTTP admin) service.
    Management,
}

impl ServiceKind {
    /// Returns the service's name in the cluster map.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::KeyValue => "kv",
            Self::Query => "query",
            Self::Search => "search",
            Self::Analytics => "analytics",
            Self::Views => "views",
            Self::Management => "mgmt",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// A configuration revision on its way to the buckets.
#[derive(Debug, Clone)]
pub struct ConfigPublish {
    /// The parsed cluster map.
    pub map: ClusterMap,
    /// The host the config was observed from (already substituted).
    pub source_host: String,
}

/// Creates cluster nodes; injected so topology tests can run without
/// sockets.
#[async_trait]
pub trait NodeFactory: Send + Sync + 'static {
    /// Creates, connects, and authenticates a node.
    ///
    /// When `bucket` is set the node's connections bind to it.
    async fn create(
        &self,
        host: &str,
        port: u16,
        config_tx: mpsc::Sender<ConfigPublish>,
        bucket: Option<&str>,
    ) -> Result<Arc<ClusterNode>>;
}

/// Production factory dialing TCP and running full initialization.
pub struct TcpNodeFactory {
    config: Arc<ClientConfig>,
}

impl TcpNodeFactory {
    /// Creates a factory for the given client configuration.
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NodeFactory for TcpNodeFactory {
    async fn create(
        &self,
        host: &str,
        port: u16,
        config_tx: mpsc::Sender<ConfigPublish>,
        bucket: Option<&str>,
    ) -> Result<Arc<ClusterNode>> {
        let authority = format!("{host}:{port}");
        let address = tokio::net::lookup_host(&authority)
            .await
            .map_err(|e| ShoalError::Connection(format!("resolve {authority}: {e}")))?
            .next()
            .ok_or_else(|| ShoalError::Connection(format!("no address for {authority}")))?;

        let factory = Arc::new(TcpConnectionFactory::new(address, Arc::clone(&self.config)));
        factory.set_bucket(bucket.map(str::to_string)).await;

        let pool = ConnectionPool::new(
            factory,
            self.config.pool_min_size(),
            self.config.pool_max_size(),
        );
        pool.initialize(CancellationToken::new()).await?;

        let node = Arc::new(ClusterNode::new(
            authority,
            host,
            Arc::clone(&self.config),
            pool,
            config_tx,
        ));
        if let Some(bucket) = bucket {
            node.assign_bucket(bucket).await?;
        }
        Ok(node)
    }
}

struct ContextShared {
    config: Arc<ClientConfig>,
    node_factory: Arc<dyn NodeFactory>,
    nodes: RwLock<HashMap<String, Arc<ClusterNode>>>,
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    config_tx: mpsc::Sender<ConfigPublish>,
    shutdown: CancellationToken,
}

/// The live view of one cluster.
///
/// Owns the node registry and bucket registry, runs the single
/// serialized config handler, and carries no ambient global state: the
/// application holds the context and threads it into what needs it.
pub struct ClusterContext {
    shared: Arc<ContextShared>,
    connstr: ConnectionString,
    handler: Mutex<Option<JoinHandle<()>>>,
    streams: Mutex<Vec<ConfigStream>>,
}

impl ClusterContext {
    /// Creates a context with the production node factory.
    pub fn new(config: ClientConfig, connstr: ConnectionString) -> Self {
        let config = Arc::new(config);
        let factory = Arc::new(TcpNodeFactory::new(Arc::clone(&config)));
        Self::with_node_factory(config, connstr, factory)
    }

    /// Creates a context with an injected node factory.
    pub fn with_node_factory(
        config: Arc<ClientConfig>,
        connstr: ConnectionString,
        node_factory: Arc<dyn NodeFactory>,
    ) -> Self {
        let (config_tx, config_rx) = mpsc::channel(CONFIG_CHANNEL_CAPACITY);

        let shared = Arc::new(ContextShared {
            config,
            node_factory,
            nodes: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
            config_tx,
            shutdown: CancellationToken::new(),
        });

        let handler = tokio::spawn(config_handler(Arc::clone(&shared), config_rx));

        Self {
            shared,
            connstr,
            handler: Mutex::new(Some(handler)),
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Returns the sender feeding the serialized config handler.
    pub fn config_publisher(&self) -> mpsc::Sender<ConfigPublish> {
        self.shared.config_tx.clone()
    }

    /// Returns the client configuration.
    pub fn client_config(&self) -> &Arc<ClientConfig> {
        &self.shared.config
    }

    /// Returns the node registered under an authority, if any.
    pub async fn node(&self, authority: &str) -> Option<Arc<ClusterNode>> {
        self.shared.nodes.read().await.get(authority).cloned()
    }

    /// Returns the number of registered nodes.
    pub async fn node_count(&self) -> usize {
        self.shared.nodes.read().await.len()
    }

    /// Returns an open bucket by name, if any.
    pub async fn bucket(&self, name: &str) -> Option<Arc<Bucket>> {
        self.shared.buckets.read().await.get(name).cloned()
    }

    /// Bootstraps the context from the connection string.
    ///
    /// Expands DNS-SRV when eligible, then walks the endpoints until one
    /// yields a global cluster map. Servers that reject the bucket-less
    /// config request are left for per-bucket bootstrap.
    pub async fn bootstrap(&mut self) -> Result<()> {
        let _ = self.connstr.resolve_srv().await;

        let kv_port = self.shared.config.effective_kv_port();
        let endpoints: Vec<(String, u16)> = self
            .connstr
            .endpoints
            .iter()
            .map(|e| (e.host.clone(), e.port.unwrap_or(kv_port)))
            .collect();

        let mut last_error = None;
        for (host, port) in &endpoints {
            match self.bootstrap_endpoint(host, *port).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(host = %host, port, error = %e, "bootstrap endpoint failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ShoalError::Connection("no bootstrap endpoints".to_string())))
    }

    async fn bootstrap_endpoint(&self, host: &str, port: u16) -> Result<()> {
        let authority = format!("{host}:{port}");
        let node = match self.node(&authority).await {
            Some(node) => node,
            None => {
                let node = self
                    .shared
                    .node_factory
                    .create(host, port, self.shared.config_tx.clone(), None)
                    .await?;
                self.shared
                    .nodes
                    .write()
                    .await
                    .insert(authority.clone(), Arc::clone(&node));
                node
            }
        };

        let response = node
            .send(KvRequest::get_cluster_config(), CancellationToken::new())
            .await?;

        if response.status() != STATUS_SUCCESS {
            // Older servers refuse a bucket-less config request; the
            // per-bucket path in get_or_create_bucket covers them.
            tracing::debug!(
                authority = %authority,
                status = response.status(),
                "global config unavailable, deferring to per-bucket bootstrap"
            );
            return Ok(());
        }

        let map = ClusterMap::parse(&response.value, host)?;
        self.register_global_nodes(&map).await?;
        Ok(())
    }

    /// Walks a global cluster map and registers every node, updating the
    /// bootstrap node in place rather than duplicating it.
    async fn register_global_nodes(&self, map: &ClusterMap) -> Result<()> {
        let resolution = self.shared.config.network_resolution();
        let tls = self.shared.config.tls_enabled();

        for entry in &map.nodes_ext {
            let Some(host) = entry.host(resolution) else { continue };
            let Some(port) = entry.kv_port(resolution, tls) else { continue };
            let authority = format!("{host}:{port}");

            let node = match self.node(&authority).await {
                Some(existing) => existing,
                None => {
                    let node = self
                        .shared
                        .node_factory
                        .create(host, port, self.shared.config_tx.clone(), None)
                        .await?;
                    self.shared
                        .nodes
                        .write()
                        .await
                        .insert(authority, Arc::clone(&node));
                    node
                }
            };

            populate_service_uris(&node, entry, resolution, host);
        }
        Ok(())
    }

    /// Returns the bucket, opening and bootstrapping it if needed.
    ///
    /// Tries every bootstrap endpoint and both bucket kinds before
    /// giving up with `BucketNotFound`.
    pub async fn get_or_create_bucket(&self, name: &str) -> Result<Arc<Bucket>> {
        if let Some(bucket) = self.bucket(name).await {
            return Ok(bucket);
        }

        let kv_port = self.shared.config.effective_kv_port();
        let endpoints: Vec<(String, u16)> = self
            .connstr
            .endpoints
            .iter()
            .map(|e| (e.host.clone(), e.port.unwrap_or(kv_port)))
            .collect();

        for (host, port) in &endpoints {
            for kind in [BucketKind::Document, BucketKind::Memcached] {
                match self.try_open_bucket(name, host, *port, kind).await {
                    Ok(bucket) => return Ok(bucket),
                    Err(e) => {
                        tracing::debug!(
                            bucket = name,
                            host = %host,
                            ?kind,
                            error = %e,
                            "bucket bootstrap attempt failed"
                        );
                    }
                }
            }
        }

        Err(ShoalError::BucketNotFound(name.to_string()))
    }

    async fn try_open_bucket(
        &self,
        name: &str,
        host: &str,
        port: u16,
        kind: BucketKind,
    ) -> Result<Arc<Bucket>> {
        let authority = format!("{host}:{port}");

        let node = match self.node(&authority).await {
            Some(node) => {
                node.assign_bucket(name).await?;
                node
            }
            None => {
                let node = self
                    .shared
                    .node_factory
                    .create(host, port, self.shared.config_tx.clone(), Some(name))
                    .await?;
                self.shared
                    .nodes
                    .write()
                    .await
                    .insert(authority, Arc::clone(&node));
                node
            }
        };

        // Older servers without collections simply refuse the manifest;
        // the bucket then runs with default-collection semantics.
        if let Ok(response) = node
            .send(KvRequest::get_collections_manifest(), CancellationToken::new())
            .await
        {
            if response.status() == STATUS_SUCCESS {
                tracing::debug!(bucket = name, bytes = response.value.len(), "fetched collections manifest");
            }
        }

        let response = node
            .send(KvRequest::get_cluster_config(), CancellationToken::new())
            .await?;
        if response.status() != STATUS_SUCCESS {
            return Err(ShoalError::from_status(response.status(), false, false));
        }

        let map = ClusterMap::parse(&response.value, host)?;
        let bucket = Arc::new(Bucket::new(name, kind));
        bucket.add_node(Arc::clone(&node));
        self.shared
            .buckets
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&bucket));

        // The first config flows through the same serialized handler as
        // every later revision; wait for it to land before returning a
        // routable bucket.
        self.shared
            .config_tx
            .send(ConfigPublish { map, source_host: host.to_string() })
            .await
            .map_err(|_| ShoalError::Connection("config handler stopped".to_string()))?;

        let deadline = tokio::time::Instant::now() + self.shared.config.kv_timeout();
        while bucket.current_rev() == 0 {
            if tokio::time::Instant::now() >= deadline {
                self.shared.buckets.write().await.remove(name);
                return Err(ShoalError::Protocol(
                    "initial configuration was never applied".to_string(),
                ));
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        self.start_config_stream(name).await;

        Ok(bucket)
    }

    /// Starts the HTTP streaming subscriber feeding this bucket.
    async fn start_config_stream(&self, bucket: &str) {
        let hosts: Vec<String> = self
            .connstr
            .endpoints
            .iter()
            .map(|e| e.host.clone())
            .collect();

        let stream = ConfigStream::spawn(
            bucket.to_string(),
            hosts,
            self.shared.config.bootstrap_http_port(),
            Arc::clone(&self.shared.config),
            self.shared.config_tx.clone(),
            self.shared.shutdown.child_token(),
        );
        self.streams.lock().await.push(stream);
    }

    /// Picks a URI for a service, uniformly at random over the nodes
    /// hosting it.
    ///
    /// `bucket_scope` restricts the candidates to nodes owned by that
    /// bucket (views are bucket-scoped).
    pub async fn service_uri(
        &self,
        service: ServiceKind,
        bucket_scope: Option<&str>,
    ) -> Result<String> {
        let nodes = self.shared.nodes.read().await;
        let candidates: Vec<String> = nodes
            .values()
            .filter(|node| match bucket_scope {
                Some(scope) => node.owning_bucket().as_deref() == Some(scope),
                None => true,
            })
            .filter_map(|node| node.service_uri(service))
            .collect();
        drop(nodes);

        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| ShoalError::ServiceMissing(service.wire_name().to_string()))
    }

    /// Probes `/pools/default` and returns the cluster compatibility
    /// version: the minimum `(major, minor)` across all nodes.
    pub async fn cluster_version(&self) -> Result<(u32, u32)> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.shared.config.management_timeout())
            .build()
            .map_err(|e| ShoalError::Connection(format!("HTTP client: {e}")))?;

        let port = self.shared.config.bootstrap_http_port();
        let mut last_error = None;

        for endpoint in &self.connstr.endpoints {
            let url = format!("http://{}:{port}/pools/default", endpoint.host);
            let mut request = client.get(&url);
            if !self.shared.config.username().is_empty() {
                request = request.basic_auth(
                    self.shared.config.username(),
                    Some(self.shared.config.password()),
                );
            }

            match request.send().await {
                Ok(response) => match response.json::<serde_json::Value>().await {
                    Ok(pools) => {
                        if let Some(version) = compat_version(&pools) {
                            return Ok(version);
                        }
                        last_error = Some(ShoalError::Protocol(
                            "pools payload carries no node versions".to_string(),
                        ));
                    }
                    Err(e) => last_error = Some(ShoalError::Protocol(e.to_string())),
                },
                Err(e) => last_error = Some(ShoalError::Connection(e.to_string())),
            }
        }

        Err(last_error
            .unwrap_or_else(|| ShoalError::Connection("no endpoints to probe".to_string())))
    }

    /// Shuts the context down: handler, streams, buckets, and nodes.
    pub async fn dispose(&self) {
        self.shared.shutdown.cancel();

        if let Some(handler) = self.handler.lock().await.take() {
            handler.abort();
        }
        for stream in self.streams.lock().await.drain(..) {
            stream.stop().await;
        }

        let buckets: Vec<Arc<Bucket>> =
            self.shared.buckets.write().await.drain().map(|(_, b)| b).collect();
        for bucket in buckets {
            bucket.dispose().await;
        }

        let nodes: Vec<Arc<ClusterNode>> =
            self.shared.nodes.write().await.drain().map(|(_, n)| n).collect();
        for node in nodes {
            node.dispose().await;
        }

        tracing::info!("cluster context disposed");
    }
}

/// Extracts the cluster compatibility version from a `/pools/default`
/// payload: the minimum version across all nodes.
pub fn compat_version(pools: &serde_json::Value) -> Option<(u32, u32)> {
    pools
        .get("nodes")?
        .as_array()?
        .iter()
        .filter_map(|node| {
            let version = node.get("version")?.as_str()?;
            let core = version.split('-').next()?;
            let mut parts = core.split('.');
            let major: u32 = parts.next()?.parse().ok()?;
            let minor: u32 = parts.next()?.parse().ok()?;
            Some((major, minor))
        })
        .min()
}

/// The single serialized config handler.
///
/// All config sources (streaming endpoint, NotMyVBucket bodies, initial
/// bootstrap) funnel through this task, so buckets observe revisions in
/// a single total order.
async fn config_handler(shared: Arc<ContextShared>, mut rx: mpsc::Receiver<ConfigPublish>) {
    loop {
        let publish = tokio::select! {
            publish = rx.recv() => match publish {
                Some(publish) => publish,
                None => return,
            },
            _ = shared.shutdown.cancelled() => return,
        };

        process_cluster_map(&shared, publish).await;
    }
}

/// Applies one configuration: bucket rules, node diff, prune.
async fn process_cluster_map(shared: &Arc<ContextShared>, publish: ConfigPublish) {
    let map = &publish.map;

    let buckets: Vec<Arc<Bucket>> = {
        let registry = shared.buckets.read().await;
        match &map.name {
            Some(name) => registry.get(name).cloned().into_iter().collect(),
            None => registry.values().cloned().collect(),
        }
    };

    for bucket in buckets {
        let applied = bucket.config_updated(map);
        if !applied.applied {
            continue;
        }

        if applied.nodes_changed {
            match rebuild_bucket_nodes(shared, &bucket, map).await {
                Ok(()) => prune_nodes(shared, map).await,
                Err(e) => {
                    tracing::warn!(bucket = %bucket.name(), error = %e, "node diff failed");
                }
            }
        } else if applied.vbucket_map_changed {
            tracing::debug!(bucket = %bucket.name(), rev = map.rev, "key mapper refreshed");
        }
    }
}

/// Creates missing nodes and atomically replaces the bucket's node list
/// in server-list order.
async fn rebuild_bucket_nodes(
    shared: &Arc<ContextShared>,
    bucket: &Arc<Bucket>,
    map: &ClusterMap,
) -> Result<()> {
    let resolution = shared.config.network_resolution();
    let tls = shared.config.tls_enabled();

    let mut ordered = Vec::new();
    for entry in &map.nodes_ext {
        let Some(host) = entry.host(resolution) else { continue };
        let Some(port) = entry.kv_port(resolution, tls) else { continue };
        let authority = format!("{host}:{port}");

        let existing = shared.nodes.read().await.get(&authority).cloned();
        let node = match existing {
            Some(node) => node,
            None => {
                tracing::info!(authority = %authority, bucket = %bucket.name(), "creating node from config diff");
                let node = shared
                    .node_factory
                    .create(host, port, shared.config_tx.clone(), Some(bucket.name()))
                    .await?;
                shared
                    .nodes
                    .write()
                    .await
                    .insert(authority, Arc::clone(&node));
                node
            }
        };

        populate_service_uris(&node, entry, resolution, host);
        ordered.push(node);
    }

    bucket.set_nodes(ordered);
    Ok(())
}

/// Removes and disposes registry nodes absent from the latest config.
async fn prune_nodes(shared: &Arc<ContextShared>, map: &ClusterMap) {
    let resolution = shared.config.network_resolution();
    let tls = shared.config.tls_enabled();

    let live: Vec<String> = map
        .kv_endpoints(resolution, tls)
        .into_iter()
        .map(|(host, port)| format!("{host}:{port}"))
        .collect();

    let doomed: Vec<(String, Arc<ClusterNode>)> = {
        let nodes = shared.nodes.read().await;
        nodes
            .iter()
            .filter(|(authority, _)| !live.contains(authority))
            .map(|(authority, node)| (authority.clone(), Arc::clone(node)))
            .collect()
    };

    for (authority, node) in doomed {
        tracing::info!(authority = %authority, "pruning node absent from config");
        shared.nodes.write().await.remove(&authority);
        node.dispose().await;
    }
}

/// Copies service URIs from a config entry onto a node.
fn populate_service_uris(
    node: &Arc<ClusterNode>,
    entry: &super::kv_map::NodeEntry,
    resolution: crate::config::NetworkResolution,
    host: &str,
) {
    for service in [
        ServiceKind::Query,
        ServiceKind::Search,
        ServiceKind::Analytics,
        ServiceKind::Views,
        ServiceKind::Management,
    ] {
        if let Some(port) = entry.service_port(service.wire_name(), resolution) {
            node.set_service_uri(service, format!("http://{host}:{port}"));
        }
    }
}
