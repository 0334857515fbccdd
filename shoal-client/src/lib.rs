//! Async Rust client core for Shoal — a distributed, sharded document
//! database speaking a binary key/value protocol over TCP.
//!
//! This crate owns the hard parts of talking to a live cluster: the
//! per-node connection pools, the binary operation pipeline, key-to-node
//! routing, and a cluster context that follows topology changes as the
//! server streams configuration revisions. It is built on
//! [Tokio](https://tokio.rs/) and exposes every operation as an `async fn`.
//!
//! # Architecture
//!
//! | Layer | Type | Role |
//! |-------|------|------|
//! | Context | [`ClusterContext`] | Node registry, bucket registry, config handler |
//! | Bucket | [`Bucket`] | Key mapper, node list, config apply rules |
//! | Node | [`ClusterNode`] | Circuit breaker, timeouts, status handling |
//! | Pool | [`ConnectionPool`] | Bounded elastic pool, shared intake queue |
//! | Connection | [`Connection`] | One authenticated session, opaque demux |
//!
//! A key/value operation flows caller → bucket → vBucket map → node →
//! pool → connection → wire; the response returns through the opaque
//! demultiplexer straight to the caller's future. Out of band, cluster
//! configuration revisions stream in over HTTP and from not-my-vBucket
//! responses, and the context reconfigures routing without stopping
//! traffic.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use shoal_client::{ClientConfig, ClusterContext, ConnectionString};
//! use shoal_core::KvRequest;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .credentials("app", "secret")
//!         .build()?;
//!     let connstr = ConnectionString::parse("shoal://db1.example.com/orders")?;
//!
//!     let mut context = ClusterContext::new(config, connstr);
//!     context.bootstrap().await?;
//!
//!     let bucket = context.get_or_create_bucket("orders").await?;
//!     let response = bucket
//!         .send(KvRequest::get("user::42"), CancellationToken::new())
//!         .await?;
//!     println!("cas: {}", response.cas());
//!
//!     context.dispose().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod cluster;
pub mod config;
pub mod connection;
pub mod connstr;
pub mod retry;

pub use cluster::{
    Bucket, BucketKind, CircuitBreaker, ClusterContext, ClusterMap, ClusterNode,
    KetamaKeyMapper, ReplicaTarget, ServiceKind, VBucketKeyMapper,
};
pub use config::{
    ClientConfig, ClientConfigBuilder, ConfigError, NetworkResolution, RetryConfig,
    RetryConfigBuilder,
};
pub use connection::{
    Connection, ConnectionFactory, ConnectionId, ConnectionPool, KvConnection,
    PoolFreezeGuard, TcpConnectionFactory,
};
pub use connstr::{ConnectionString, Endpoint};
pub use retry::RetryOrchestrator;
pub use shoal_core as core;
