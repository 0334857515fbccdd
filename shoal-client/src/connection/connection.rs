//! Single authenticated connection to a cluster node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use shoal_core::protocol::constants::STATUS_SUCCESS;
use shoal_core::{KvCodec, KvRequest, KvResponse, Result, ShoalError};

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "kv-{}", self.0)
    }
}

/// A single session capable of dispatching key/value requests.
///
/// The pool and node layers work against this trait so tests can inject
/// scripted sessions in place of real sockets.
#[async_trait]
pub trait KvConnection: Send + Sync + 'static {
    /// Returns the connection's unique identifier.
    fn id(&self) -> ConnectionId;

    /// Returns `true` once the connection has failed. Never resurrected.
    fn is_dead(&self) -> bool;

    /// Returns how long the connection has sat without traffic.
    fn idle_time(&self) -> Duration;

    /// Returns the number of requests currently awaiting responses.
    fn in_flight(&self) -> usize;

    /// Sends a request and awaits its response or cancellation.
    async fn send(&self, request: KvRequest, cancel: CancellationToken) -> Result<KvResponse>;

    /// Binds this session to a bucket's namespace.
    async fn select_bucket(&self, bucket: &str) -> Result<()>;

    /// Stops intake, waits up to `grace` for in-flight, closes the socket.
    async fn close(&self, grace: Duration);
}

type PendingTable = Mutex<HashMap<u32, oneshot::Sender<KvResponse>>>;

/// A TCP connection to one node's key/value service.
///
/// Writes are serialized through a send lock; a reader task demultiplexes
/// responses back to their callers purely by opaque. Responses whose
/// opaque no longer has a pending entry (cancelled or timed-out requests)
/// are discarded.
pub struct Connection {
    id: ConnectionId,
    address: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<PendingTable>,
    dead: Arc<AtomicBool>,
    closing: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    last_activity: Mutex<Instant>,
    features: RwLock<Vec<u16>>,
    reader: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("dead", &self.is_dead())
            .finish()
    }
}

impl Connection {
    /// Establishes a new connection to the given address.
    pub async fn connect(address: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            ShoalError::Connection(format!("failed to connect to {address}: {e}"))
        })?;

        stream.set_nodelay(true).map_err(|e| {
            ShoalError::Connection(format!("failed to set TCP_NODELAY: {e}"))
        })?;

        tracing::debug!(address = %address, "established connection");
        Ok(Self::from_stream(stream, address))
    }

    /// Wraps an established TCP stream.
    pub fn from_stream(stream: TcpStream, address: SocketAddr) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending: Arc<PendingTable> = Arc::new(Mutex::new(HashMap::new()));
        let dead = Arc::new(AtomicBool::new(false));
        let id = ConnectionId::new();

        let reader = tokio::spawn(read_loop(
            id,
            read_half,
            Arc::clone(&pending),
            Arc::clone(&dead),
        ));

        Self {
            id,
            address,
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            dead,
            closing: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            last_activity: Mutex::new(Instant::now()),
            features: RwLock::new(Vec::new()),
            reader,
        }
    }

    /// Returns the remote address of this connection.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Records the features negotiated during HELLO.
    pub fn set_features(&self, features: Vec<u16>) {
        *self.features.write().expect("features lock") = features;
    }

    /// Returns `true` if the given feature was negotiated.
    pub fn has_feature(&self, feature: u16) -> bool {
        self.features.read().expect("features lock").contains(&feature)
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    fn fail(&self, context: &str) -> ShoalError {
        self.dead.store(true, Ordering::Release);
        ShoalError::Connection(format!("{} on {}: {context}", self.id, self.address))
    }
}

#[async_trait]
impl KvConnection for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn idle_time(&self) -> Duration {
        self.last_activity.lock().expect("activity lock").elapsed()
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    async fn send(&self, request: KvRequest, cancel: CancellationToken) -> Result<KvResponse> {
        if self.is_dead() {
            return Err(ShoalError::Connection(format!("{} is dead", self.id)));
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(ShoalError::Connection(format!("{} is closing", self.id)));
        }

        let opaque = request.opaque;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(opaque, tx);

        let mut frame = BytesMut::new();
        let mut codec = KvCodec::new();
        if let Err(e) = codec.encode(request, &mut frame) {
            self.pending.lock().expect("pending lock").remove(&opaque);
            return Err(e);
        }

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&frame).await {
                self.pending.lock().expect("pending lock").remove(&opaque);
                return Err(self.fail(&format!("write failed: {e}")));
            }
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.touch();

        let result = tokio::select! {
            response = rx => match response {
                Ok(response) => {
                    self.touch();
                    Ok(response)
                }
                // The reader task dropped the sender: connection died.
                Err(_) => Err(ShoalError::Connection(format!(
                    "{} closed while request {opaque} was in flight",
                    self.id
                ))),
            },
            _ = cancel.cancelled() => {
                self.pending.lock().expect("pending lock").remove(&opaque);
                Err(ShoalError::Cancelled)
            }
        };

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }

    async fn select_bucket(&self, bucket: &str) -> Result<()> {
        let response = self
            .send(KvRequest::select_bucket(bucket), CancellationToken::new())
            .await?;
        if response.status() == STATUS_SUCCESS {
            Ok(())
        } else {
            Err(ShoalError::from_status(response.status(), false, false))
        }
    }

    async fn close(&self, grace: Duration) {
        self.closing.store(true, Ordering::Release);

        let deadline = Instant::now() + grace;
        while self.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.reader.abort();
        self.dead.store(true, Ordering::Release);
        let _ = self.writer.lock().await.shutdown().await;
        self.pending.lock().expect("pending lock").clear();
        tracing::debug!(id = %self.id, address = %self.address, "connection closed");
    }
}

/// Drains response frames and completes pending requests by opaque.
async fn read_loop(
    id: ConnectionId,
    mut read_half: OwnedReadHalf,
    pending: Arc<PendingTable>,
    dead: Arc<AtomicBool>,
) {
    let mut codec = KvCodec::new();
    let mut buffer = BytesMut::with_capacity(8192);

    loop {
        match codec.decode(&mut buffer) {
            Ok(Some(response)) => {
                let opaque = response.opaque();
                let waiter = pending.lock().expect("pending lock").remove(&opaque);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::trace!(id = %id, opaque, "discarding response with no waiter");
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "protocol error, marking connection dead");
                break;
            }
        }

        match read_half.read_buf(&mut buffer).await {
            Ok(0) => {
                tracing::debug!(id = %id, "peer closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "read failed, marking connection dead");
                break;
            }
        }
    }

    dead.store(true, Ordering::Release);
    // Dropping the senders fails every in-flight future.
    pending.lock().expect("pending lock").clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use shoal_core::protocol::constants::*;
    use tokio::net::TcpListener;

    fn response_bytes(opcode: u8, status: u16, opaque: u32, cas: u64, value: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MAGIC_RESPONSE);
        buf.put_u8(opcode);
        buf.put_u16(0);
        buf.put_u8(0);
        buf.put_u8(DATATYPE_RAW);
        buf.put_u16(status);
        buf.put_u32(value.len() as u32);
        buf.put_u32(opaque);
        buf.put_u64(cas);
        buf.put_slice(value);
        buf.to_vec()
    }

    async fn read_request(socket: &mut TcpStream) -> (u8, u32, Vec<u8>) {
        let mut header = [0u8; HEADER_SIZE];
        socket.read_exact(&mut header).await.unwrap();
        let opcode = header[1];
        let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
        let mut body = vec![0u8; body_len];
        socket.read_exact(&mut body).await.unwrap();
        (opcode, opaque, body)
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId(42);
        assert_eq!(id.to_string(), "kv-42");
    }

    #[tokio::test]
    async fn test_send_receives_matching_opaque() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (opcode, opaque, _) = read_request(&mut socket).await;
            let reply = response_bytes(opcode, STATUS_SUCCESS, opaque, 77, b"doc");
            socket.write_all(&reply).await.unwrap();
        });

        let conn = Connection::connect(addr).await.unwrap();
        let response = conn
            .send(KvRequest::get("k"), CancellationToken::new())
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.cas(), 77);
        assert_eq!(&response.value[..], b"doc");
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_correlate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (op1, opaque1, _) = read_request(&mut socket).await;
            let (op2, opaque2, _) = read_request(&mut socket).await;
            // Answer the second request first.
            socket
                .write_all(&response_bytes(op2, STATUS_SUCCESS, opaque2, 2, b"second"))
                .await
                .unwrap();
            socket
                .write_all(&response_bytes(op1, STATUS_SUCCESS, opaque1, 1, b"first"))
                .await
                .unwrap();
        });

        let conn = Arc::new(Connection::connect(addr).await.unwrap());

        let c1 = Arc::clone(&conn);
        let first = tokio::spawn(async move {
            c1.send(KvRequest::get("a"), CancellationToken::new()).await
        });
        // Let the first request hit the wire before the second.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let c2 = Arc::clone(&conn);
        let second = tokio::spawn(async move {
            c2.send(KvRequest::get("b"), CancellationToken::new()).await
        });

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(&first.value[..], b"first");
        assert_eq!(&second.value[..], b"second");
    }

    #[tokio::test]
    async fn test_cancellation_completes_promptly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Server reads the request but never answers.
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let conn = Connection::connect(addr).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            let conn = Arc::new(conn);
            let c = Arc::clone(&conn);
            tokio::spawn(async move { c.send(KvRequest::get("k"), cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled send must complete in bounded time")
            .unwrap();
        assert!(matches!(result, Err(ShoalError::Cancelled)));
    }

    #[tokio::test]
    async fn test_peer_close_marks_dead_and_fails_in_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
            drop(socket);
        });

        let conn = Connection::connect(addr).await.unwrap();
        let result = conn.send(KvRequest::get("k"), CancellationToken::new()).await;

        assert!(result.is_err());
        // The reader observes EOF and flags the connection.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.is_dead());

        let again = conn.send(KvRequest::get("k"), CancellationToken::new()).await;
        assert!(matches!(again, Err(ShoalError::Connection(_))));
    }

    #[tokio::test]
    async fn test_features_stored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let conn = Connection::connect(addr).await.unwrap();
        conn.set_features(vec![FEATURE_XERROR, FEATURE_SELECT_BUCKET]);
        assert!(conn.has_feature(FEATURE_XERROR));
        assert!(!conn.has_feature(FEATURE_COLLECTIONS));
    }

    #[tokio::test]
    async fn test_close_is_final() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let conn = Connection::connect(addr).await.unwrap();
        conn.close(Duration::from_millis(50)).await;
        assert!(conn.is_dead());

        let result = conn.send(KvRequest::noop(), CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
