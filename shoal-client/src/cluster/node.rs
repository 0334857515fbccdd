//! A single cluster node: identity, services, breaker, and send pipeline.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shoal_core::protocol::constants::{
    STATUS_NOT_MY_VBUCKET, STATUS_SUBDOC_MULTI_PATH_FAILURE, STATUS_SUCCESS,
};
use shoal_core::{ErrorMap, KvRequest, KvResponse, Result, ShoalError};

use super::breaker::{BreakerState, CircuitBreaker};
use super::context::{ConfigPublish, ServiceKind};
use super::kv_map::ClusterMap;
use crate::config::ClientConfig;
use crate::connection::ConnectionPool;

/// One server node and its key/value send pipeline.
///
/// The node owns a connection pool, a circuit breaker, the server's
/// error map, and the per-service URI book. It carries the owning
/// bucket only as a name; bucket lookups go through the context's
/// registry, never through a back-pointer.
pub struct ClusterNode {
    id: Uuid,
    authority: String,
    bootstrap_hostname: String,
    config: Arc<ClientConfig>,
    pool: ConnectionPool,
    breaker: CircuitBreaker,
    error_map: RwLock<Option<Arc<ErrorMap>>>,
    service_uris: RwLock<HashMap<ServiceKind, String>>,
    last_activity: RwLock<HashMap<ServiceKind, Instant>>,
    owning_bucket: RwLock<Option<String>>,
    config_tx: mpsc::Sender<ConfigPublish>,
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("id", &self.id)
            .field("authority", &self.authority)
            .field("owning_bucket", &*self.owning_bucket.read().expect("bucket lock"))
            .finish()
    }
}

impl ClusterNode {
    /// Creates a node wrapping an already-constructed pool.
    pub fn new(
        authority: impl Into<String>,
        bootstrap_hostname: impl Into<String>,
        config: Arc<ClientConfig>,
        pool: ConnectionPool,
        config_tx: mpsc::Sender<ConfigPublish>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            authority: authority.into(),
            bootstrap_hostname: bootstrap_hostname.into(),
            config,
            pool,
            breaker: CircuitBreaker::default(),
            error_map: RwLock::new(None),
            service_uris: RwLock::new(HashMap::new()),
            last_activity: RwLock::new(HashMap::new()),
            owning_bucket: RwLock::new(None),
            config_tx,
        }
    }

    /// Returns the node's stable identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the `host:port` authority of the key/value service.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Returns the hostname this node was bootstrapped from.
    ///
    /// Used for `$HOST` substitution in configs this node observes.
    pub fn bootstrap_hostname(&self) -> &str {
        &self.bootstrap_hostname
    }

    /// Returns the node's connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Returns the node's circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Stores the error map negotiated on this node's connections.
    pub fn set_error_map(&self, error_map: Arc<ErrorMap>) {
        *self.error_map.write().expect("error map lock") = Some(error_map);
    }

    /// Returns the server's error map, if one was negotiated.
    pub fn error_map(&self) -> Option<Arc<ErrorMap>> {
        self.error_map.read().expect("error map lock").clone()
    }

    /// Records a service URI advertised by the cluster map.
    pub fn set_service_uri(&self, service: ServiceKind, uri: String) {
        self.service_uris.write().expect("service lock").insert(service, uri);
    }

    /// Returns the URI of a service on this node, if it hosts it.
    pub fn service_uri(&self, service: ServiceKind) -> Option<String> {
        self.service_uris.read().expect("service lock").get(&service).cloned()
    }

    /// Returns `true` if this node hosts the given service.
    pub fn has_service(&self, service: ServiceKind) -> bool {
        self.service_uris.read().expect("service lock").contains_key(&service)
    }

    /// Returns when the given service last saw traffic.
    pub fn last_activity(&self, service: ServiceKind) -> Option<Instant> {
        self.last_activity.read().expect("activity lock").get(&service).copied()
    }

    fn touch(&self, service: ServiceKind) {
        self.last_activity
            .write()
            .expect("activity lock")
            .insert(service, Instant::now());
    }

    /// Returns the name of the owning bucket, or `None` if unassigned.
    pub fn owning_bucket(&self) -> Option<String> {
        self.owning_bucket.read().expect("bucket lock").clone()
    }

    /// Binds every pooled connection to `bucket` and records ownership.
    pub async fn assign_bucket(&self, bucket: &str) -> Result<()> {
        self.pool.select_bucket(bucket).await?;
        *self.owning_bucket.write().expect("bucket lock") = Some(bucket.to_string());
        tracing::debug!(node = %self.id, bucket, "node assigned to bucket");
        Ok(())
    }

    /// Sends a request using the durability-aware default timeout.
    pub async fn send(&self, request: KvRequest, cancel: CancellationToken) -> Result<KvResponse> {
        let timeout = if request.has_durability() {
            self.config.kv_durability_timeout()
        } else {
            self.config.kv_timeout()
        };
        self.send_with_timeout(request, cancel, timeout).await
    }

    /// Sends a request with an explicit timeout.
    ///
    /// The breaker is consulted first; a timeout is surfaced as a
    /// distinct error from caller cancellation, with the ambiguous
    /// flavor for mutations whose server-side outcome is unknown.
    pub async fn send_with_timeout(
        &self,
        request: KvRequest,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<KvResponse> {
        match self.breaker.state() {
            BreakerState::Closed => {}
            BreakerState::Open => return Err(ShoalError::CircuitBreakerOpen),
            BreakerState::HalfOpen => {
                if self.breaker.try_claim_canary() {
                    self.send_canary().await;
                }
                return Err(ShoalError::CircuitBreakerOpen);
            }
        }

        let is_mutation = request.is_mutation();
        let has_cas = request.cas != 0;

        let linked = cancel.child_token();
        let outcome =
            tokio::time::timeout(timeout, self.pool.queue_send(request, linked.clone())).await;

        self.touch(ServiceKind::KeyValue);

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                if matches!(e, ShoalError::Connection(_) | ShoalError::Io(_)) {
                    self.breaker.mark_failure();
                }
                return Err(e);
            }
            Err(_) => {
                // Unblock the queued operation so its opaque is reclaimed.
                linked.cancel();
                self.breaker.mark_failure();
                return Err(ShoalError::Timeout { ambiguous: is_mutation });
            }
        };

        // The server answered; whatever the status, the node is healthy.
        self.breaker.mark_success();

        match response.status() {
            STATUS_SUCCESS => Ok(response),
            // Per-path errors ride inside an overall success; callers see
            // them when reading the individual spec results.
            STATUS_SUBDOC_MULTI_PATH_FAILURE => Ok(response),
            STATUS_NOT_MY_VBUCKET => {
                self.publish_embedded_config(&response).await;
                Err(ShoalError::NotMyVBucket)
            }
            status => Err(self.translate_status(status, is_mutation, has_cas)),
        }
    }

    /// Runs the half-open canary probe and records its outcome.
    async fn send_canary(&self) {
        let result = tokio::time::timeout(
            self.breaker.canary_timeout(),
            self.pool.queue_send(KvRequest::noop(), CancellationToken::new()),
        )
        .await;

        match result {
            Ok(Ok(response)) if response.status() == STATUS_SUCCESS => {
                self.breaker.mark_success();
            }
            _ => {
                self.breaker.mark_failure();
            }
        }
    }

    /// Extracts and publishes the config embedded in a NotMyVBucket body.
    async fn publish_embedded_config(&self, response: &KvResponse) {
        let Some(raw) = response.embedded_config() else {
            return;
        };

        match ClusterMap::parse(raw, &self.bootstrap_hostname) {
            Ok(map) => {
                tracing::debug!(node = %self.id, rev = map.rev, "publishing config from NotMyVBucket");
                let publish = ConfigPublish {
                    map,
                    source_host: self.bootstrap_hostname.clone(),
                };
                if self.config_tx.send(publish).await.is_err() {
                    tracing::debug!("config handler gone, dropping embedded config");
                }
            }
            Err(e) => {
                tracing::warn!(node = %self.id, error = %e, "unparseable embedded config");
            }
        }
    }

    /// Maps a non-success status through the error map and the fixed
    /// status table.
    fn translate_status(&self, status: u16, is_mutation: bool, has_cas: bool) -> ShoalError {
        let error = ShoalError::from_status(status, is_mutation, has_cas);
        if let ShoalError::Server { status, message } = &error {
            if message.is_empty() {
                if let Some(map) = self.error_map() {
                    if let Some(attrs) = map.attributes(status.value()) {
                        return ShoalError::Server {
                            status: *status,
                            message: attrs.name.clone(),
                        };
                    }
                }
            }
        }
        error
    }

    /// Closes the pool and releases the node permanently.
    pub async fn dispose(&self) {
        self.pool.dispose().await;
        tracing::debug!(node = %self.id, authority = %self.authority, "node disposed");
    }
}
