//! Cluster configuration model as streamed from the server.
//!
//! Configurations arrive as newline-delimited JSON on the streaming
//! endpoint and embedded in NotMyVBucket responses. Server strings use a
//! `$HOST` placeholder that is substituted with the host the config was
//! observed from before parsing.

use std::collections::HashMap;

use serde::Deserialize;

use shoal_core::{Result, ShoalError};

use super::vbucket::VBucketKeyMapper;
use crate::config::NetworkResolution;

/// Placeholder servers use for "the address you reached me on".
const HOST_PLACEHOLDER: &str = "$HOST";

/// An immutable snapshot of the cluster's topology.
///
/// Identified by a monotonically increasing revision; a lower revision
/// must never overwrite a higher one.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterMap {
    /// Configuration revision.
    pub rev: u64,
    /// Bucket name; absent on global (bucket-less) cluster maps.
    #[serde(default)]
    pub name: Option<String>,
    /// Key routing algorithm: `vbucket` or `ketama`.
    #[serde(default, rename = "nodeLocator")]
    pub node_locator: Option<String>,
    /// Per-node service layout.
    #[serde(default, rename = "nodesExt")]
    pub nodes_ext: Vec<NodeEntry>,
    /// Sharding map for document buckets.
    #[serde(default, rename = "vBucketServerMap")]
    pub vbucket_server_map: Option<VBucketServerMap>,
}

impl ClusterMap {
    /// Parses a configuration, substituting `$HOST` with the host the
    /// bytes were observed from.
    pub fn parse(raw: &[u8], observed_host: &str) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| ShoalError::Protocol("cluster map is not UTF-8".to_string()))?;
        let substituted = text.replace(HOST_PLACEHOLDER, observed_host);
        serde_json::from_str(&substituted)
            .map_err(|e| ShoalError::Protocol(format!("invalid cluster map: {e}")))
    }

    /// Returns `true` when keys route through the vBucket hash.
    pub fn is_vbucket_locator(&self) -> bool {
        match self.node_locator.as_deref() {
            Some("ketama") => false,
            // Document buckets may omit the locator field.
            _ => true,
        }
    }

    /// Builds the key mapper for this configuration, if it carries one.
    pub fn build_key_mapper(&self) -> Option<VBucketKeyMapper> {
        let server_map = self.vbucket_server_map.as_ref()?;
        Some(VBucketKeyMapper::new(
            server_map.vbucket_map.clone(),
            server_map.num_replicas,
        ))
    }

    /// Returns every node's key/value authority under the given
    /// resolution mode, skipping nodes without a key/value service.
    pub fn kv_endpoints(&self, resolution: NetworkResolution, tls: bool) -> Vec<(String, u16)> {
        self.nodes_ext
            .iter()
            .filter_map(|node| {
                let host = node.host(resolution)?;
                let port = node.kv_port(resolution, tls)?;
                Some((host.to_string(), port))
            })
            .collect()
    }

    /// Returns `true` if the two revisions describe the same node set.
    pub fn same_nodes(&self, other: &Self) -> bool {
        let mine: Vec<_> = self
            .nodes_ext
            .iter()
            .map(|n| n.hostname.as_deref().unwrap_or(""))
            .collect();
        let theirs: Vec<_> = other
            .nodes_ext
            .iter()
            .map(|n| n.hostname.as_deref().unwrap_or(""))
            .collect();
        mine == theirs
    }

    /// Returns `true` if the two revisions share a vBucket map.
    pub fn same_vbucket_map(&self, other: &Self) -> bool {
        match (&self.vbucket_server_map, &other.vbucket_server_map) {
            (Some(a), Some(b)) => a.vbucket_map == b.vbucket_map && a.server_list == b.server_list,
            (None, None) => true,
            _ => false,
        }
    }
}

/// One node's entry in the cluster map.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    /// Advertised hostname; already `$HOST`-substituted.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Service name to port.
    #[serde(default)]
    pub services: NodeServices,
    /// Alternate address blocks keyed by network name (`external`).
    #[serde(default, rename = "alternateAddresses")]
    pub alternate_addresses: HashMap<String, AlternateAddress>,
}

impl NodeEntry {
    /// Returns the hostname for the given resolution mode.
    pub fn host(&self, resolution: NetworkResolution) -> Option<&str> {
        if resolution == NetworkResolution::External {
            if let Some(alternate) = self.alternate_addresses.get("external") {
                if let Some(hostname) = &alternate.hostname {
                    return Some(hostname);
                }
            }
        }
        self.hostname.as_deref()
    }

    /// Returns the key/value port for the resolution and TLS mode.
    pub fn kv_port(&self, resolution: NetworkResolution, tls: bool) -> Option<u16> {
        if resolution == NetworkResolution::External {
            if let Some(alternate) = self.alternate_addresses.get("external") {
                let port = if tls { alternate.ports.kv_tls } else { alternate.ports.kv };
                if port.is_some() {
                    return port;
                }
            }
        }
        if tls { self.services.kv_tls } else { self.services.kv }
    }

    /// Returns the port of a non-KV service, honoring alternates.
    pub fn service_port(&self, service: &str, resolution: NetworkResolution) -> Option<u16> {
        if resolution == NetworkResolution::External {
            if let Some(alternate) = self.alternate_addresses.get("external") {
                if let Some(port) = alternate.ports.by_name(service) {
                    return Some(port);
                }
            }
        }
        self.services.by_name(service)
    }
}

/// Service port layout advertised by one node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeServices {
    /// Key/value service.
    #[serde(default)]
    pub kv: Option<u16>,
    /// Key/value service over TLS.
    #[serde(default, rename = "kvTls")]
    pub kv_tls: Option<u16>,
    /// Management (HTTP) service.
    #[serde(default)]
    pub mgmt: Option<u16>,
    /// Query service.
    #[serde(default)]
    pub query: Option<u16>,
    /// Full-text search service.
    #[serde(default)]
    pub search: Option<u16>,
    /// Analytics service.
    #[serde(default)]
    pub analytics: Option<u16>,
    /// Views service.
    #[serde(default)]
    pub views: Option<u16>,
}

impl NodeServices {
    /// Looks up a service port by its wire name.
    pub fn by_name(&self, service: &str) -> Option<u16> {
        match service {
            "kv" => self.kv,
            "kvTls" => self.kv_tls,
            "mgmt" => self.mgmt,
            "query" => self.query,
            "search" => self.search,
            "analytics" => self.analytics,
            "views" => self.views,
            _ => None,
        }
    }
}

/// Alternate (external) address block for one node.
#[derive(Debug, Clone, Deserialize)]
pub struct AlternateAddress {
    /// Externally reachable hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Externally reachable ports.
    #[serde(default)]
    pub ports: NodeServices,
}

/// The sharding map for a document bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct VBucketServerMap {
    /// Hash algorithm label published by the server.
    #[serde(default, rename = "hashAlgorithm")]
    pub hash_algorithm: String,
    /// Number of replica copies per vBucket.
    #[serde(default, rename = "numReplicas")]
    pub num_replicas: usize,
    /// Server authorities indexed by the vBucket map entries.
    #[serde(rename = "serverList")]
    pub server_list: Vec<String>,
    /// Per-vBucket server indices: primary first, then replicas.
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}
