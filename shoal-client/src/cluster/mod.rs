//! Cluster topology: nodes, buckets, routing, and configuration flow.

mod breaker;
mod bucket;
mod collections;
mod config_stream;
mod context;
mod ketama;
mod kv_map;
mod node;
mod vbucket;

pub use breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use bucket::{Bucket, BucketKind, ConfigApplied, ReplicaTarget};
pub use collections::CollectionCache;
pub use config_stream::ConfigStream;
pub use context::{
    compat_version, ClusterContext, ConfigPublish, NodeFactory, ServiceKind, TcpNodeFactory,
};
pub use ketama::KetamaKeyMapper;
pub use kv_map::{AlternateAddress, ClusterMap, NodeEntry, NodeServices, VBucketServerMap};
pub use node::ClusterNode;
pub use vbucket::VBucketKeyMapper;
