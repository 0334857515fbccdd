//! Connection establishment, authentication, and pooling.

mod connection;
mod initializer;
mod pool;
mod scram;

pub use connection::{Connection, ConnectionId, KvConnection};
pub use initializer::{initialize, NegotiatedSession};
pub use pool::{ConnectionFactory, ConnectionPool, PoolFreezeGuard, TcpConnectionFactory};
pub use scram::ScramSha1;
