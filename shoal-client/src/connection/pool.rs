//! Bounded elastic connection pool for a single cluster node.
//!
//! Operations enter one shared intake queue. Every live connection owns a
//! consumer task that takes one operation at a time, so a connection never
//! dispatches more than one request concurrently while the pool as a
//! whole runs as wide as its connection count.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shoal_core::{KvRequest, KvResponse, Result, ShoalError};

use super::connection::{Connection, KvConnection};
use super::initializer;
use crate::config::ClientConfig;

/// Capacity of the shared intake queue.
const INTAKE_CAPACITY: usize = 1024;
/// Grace period granted to closing connections.
const CLOSE_GRACE: Duration = Duration::from_secs(5);
/// How often the maintenance task re-checks pool health.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Creates the connections a pool manages.
///
/// Injected so tests can supply scripted sessions; production pools use
/// [`TcpConnectionFactory`].
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Opens and fully initializes one connection.
    async fn create(&self) -> Result<Arc<dyn KvConnection>>;
}

/// Factory dialing TCP connections and running full initialization.
pub struct TcpConnectionFactory {
    address: SocketAddr,
    config: Arc<ClientConfig>,
    bucket: Mutex<Option<String>>,
}

impl TcpConnectionFactory {
    /// Creates a factory for the given node address.
    pub fn new(address: SocketAddr, config: Arc<ClientConfig>) -> Self {
        Self { address, config, bucket: Mutex::new(None) }
    }

    /// Sets the bucket newly created connections bind to.
    pub async fn set_bucket(&self, bucket: Option<String>) {
        *self.bucket.lock().await = bucket;
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn create(&self) -> Result<Arc<dyn KvConnection>> {
        let connection = Connection::connect(self.address).await?;
        let bucket = self.bucket.lock().await.clone();
        initializer::initialize(&connection, &self.config, bucket.as_deref()).await?;
        Ok(Arc::new(connection))
    }
}

/// One operation waiting in the intake queue.
struct QueuedOp {
    request: KvRequest,
    reply: oneshot::Sender<Result<KvResponse>>,
    cancel: CancellationToken,
}

/// A pooled connection together with its consumer task.
struct PoolMember {
    connection: Arc<dyn KvConnection>,
    stop: CancellationToken,
    consumer: JoinHandle<()>,
}

struct PoolCore {
    factory: Arc<dyn ConnectionFactory>,
    min_size: usize,
    max_size: usize,
    intake_tx: mpsc::Sender<QueuedOp>,
    intake_rx: Arc<Mutex<mpsc::Receiver<QueuedOp>>>,
    members: Arc<Mutex<Vec<PoolMember>>>,
    disposed: AtomicBool,
    cleanup: Arc<Notify>,
    shutdown: CancellationToken,
}

/// Scoped guard holding the pool's structural lock.
///
/// While a freeze guard is alive no scale, cleanup, or dispose can make
/// structural changes. Dropped on scope exit.
pub struct PoolFreezeGuard {
    guard: OwnedMutexGuard<Vec<PoolMember>>,
}

impl PoolFreezeGuard {
    /// Returns the connections frozen under this guard.
    pub fn connections(&self) -> Vec<Arc<dyn KvConnection>> {
        self.guard.iter().map(|m| Arc::clone(&m.connection)).collect()
    }

    /// Returns the frozen pool size.
    pub fn size(&self) -> usize {
        self.guard.len()
    }
}

/// Bounded elastic pool of connections to one node.
pub struct ConnectionPool {
    core: Arc<PoolCore>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("min_size", &self.core.min_size)
            .field("max_size", &self.core.max_size)
            .field("disposed", &self.core.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl ConnectionPool {
    /// Creates a pool; no connections are opened until [`initialize`].
    ///
    /// [`initialize`]: ConnectionPool::initialize
    pub fn new(factory: Arc<dyn ConnectionFactory>, min_size: usize, max_size: usize) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
        Self {
            core: Arc::new(PoolCore {
                factory,
                min_size,
                max_size,
                intake_tx,
                intake_rx: Arc::new(Mutex::new(intake_rx)),
                members: Arc::new(Mutex::new(Vec::new())),
                disposed: AtomicBool::new(false),
                cleanup: Arc::new(Notify::new()),
                shutdown: CancellationToken::new(),
            }),
            maintenance: Mutex::new(None),
        }
    }

    /// Opens the minimum number of connections in parallel.
    ///
    /// Partial success is retained; the call fails only if not a single
    /// connection could be opened. Also starts the maintenance task that
    /// replaces dead connections and re-fills the pool toward its
    /// minimum.
    pub async fn initialize(&self, cancel: CancellationToken) -> Result<()> {
        let attempts = (0..self.core.min_size).map(|_| self.core.factory.create());
        let results = tokio::select! {
            results = join_all(attempts) => results,
            _ = cancel.cancelled() => return Err(ShoalError::Cancelled),
        };

        let mut members = self.core.members.lock().await;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(connection) => members.push(self.core.spawn_member(connection)),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open pooled connection");
                    last_error = Some(e);
                }
            }
        }

        if members.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                ShoalError::Connection("no connections could be opened".to_string())
            }));
        }

        tracing::debug!(
            size = members.len(),
            min = self.core.min_size,
            max = self.core.max_size,
            "connection pool initialized"
        );
        drop(members);

        let core = Arc::clone(&self.core);
        *self.maintenance.lock().await = Some(tokio::spawn(maintenance_loop(core)));

        Ok(())
    }

    /// Returns the current pool size.
    pub async fn size(&self) -> usize {
        self.core.members.lock().await.len()
    }

    /// Returns the number of operations waiting in the intake queue.
    pub fn pending_sends(&self) -> usize {
        INTAKE_CAPACITY - self.core.intake_tx.capacity()
    }

    /// Returns `true` once the pool has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::Acquire)
    }

    /// Enqueues an operation and awaits its response.
    ///
    /// Suspends when the intake queue is full, preserving submission
    /// order. If `cancel` fires before dispatch the operation completes
    /// as cancelled without reaching a connection.
    pub async fn queue_send(
        &self,
        request: KvRequest,
        cancel: CancellationToken,
    ) -> Result<KvResponse> {
        if self.is_disposed() {
            return Err(ShoalError::Connection("pool is disposed".to_string()));
        }

        if self.size().await == 0 {
            tracing::debug!("pool empty, attempting recovery before enqueue");
            self.core.cleanup_dead_connections().await;
        }

        let (reply, rx) = oneshot::channel();
        let op = QueuedOp { request, reply, cancel: cancel.clone() };

        tokio::select! {
            sent = self.core.intake_tx.send(op) => {
                sent.map_err(|_| ShoalError::Connection("pool is disposed".to_string()))?;
            }
            _ = cancel.cancelled() => return Err(ShoalError::Cancelled),
        }

        tokio::select! {
            result = rx => match result {
                Ok(result) => result,
                Err(_) => Err(ShoalError::Cancelled),
            },
            _ = cancel.cancelled() => Err(ShoalError::Cancelled),
        }
    }

    /// Grows or shrinks the pool by `delta` connections.
    ///
    /// Growth is clamped to the maximum size. Shrinking stops the
    /// longest-idle connections first, never below the minimum, and never
    /// a connection with an in-flight operation; closures complete in the
    /// background.
    pub async fn scale(&self, delta: i64) {
        if self.is_disposed() || delta == 0 {
            return;
        }

        if delta > 0 {
            let mut members = self.core.members.lock().await;
            let room = self.core.max_size.saturating_sub(members.len());
            let to_add = (delta as usize).min(room);
            if to_add == 0 {
                return;
            }

            let attempts = (0..to_add).map(|_| self.core.factory.create());
            for result in join_all(attempts).await {
                match result {
                    Ok(connection) => members.push(self.core.spawn_member(connection)),
                    Err(e) => tracing::warn!(error = %e, "scale-up connection failed"),
                }
            }
            tracing::debug!(size = members.len(), "pool scaled up");
        } else {
            let mut members = self.core.members.lock().await;
            let removable = members.len().saturating_sub(self.core.min_size);
            let to_stop = ((-delta) as usize).min(removable);
            if to_stop == 0 {
                return;
            }

            // Longest idle first; id breaks ties deterministically.
            let mut candidates: Vec<usize> = (0..members.len())
                .filter(|i| members[*i].connection.in_flight() == 0)
                .collect();
            candidates.sort_by(|a, b| {
                let (a, b) = (&members[*a].connection, &members[*b].connection);
                b.idle_time()
                    .cmp(&a.idle_time())
                    .then(a.id().value().cmp(&b.id().value()))
            });
            candidates.truncate(to_stop);
            candidates.sort_unstable_by(|a, b| b.cmp(a));

            for index in candidates {
                let member = members.swap_remove(index);
                member.stop.cancel();
                let connection = member.connection;
                tracing::debug!(id = %connection.id(), idle = ?connection.idle_time(), "stopping idle connection");
                tokio::spawn(async move {
                    connection.close(CLOSE_GRACE).await;
                });
            }
            tracing::debug!(size = members.len(), "pool scaled down");
        }
    }

    /// Acquires the pool-exclusive lock as a scoped guard.
    ///
    /// While the guard is held no structural mutation (scale, dead
    /// cleanup, dispose) can run.
    pub async fn freeze(&self) -> PoolFreezeGuard {
        PoolFreezeGuard {
            guard: Arc::clone(&self.core.members).lock_owned().await,
        }
    }

    /// Issues SELECT_BUCKET on every pooled connection under a freeze.
    pub async fn select_bucket(&self, bucket: &str) -> Result<()> {
        let frozen = self.freeze().await;
        for connection in frozen.connections() {
            connection.select_bucket(bucket).await?;
        }
        Ok(())
    }

    /// Removes dead connections and refills the pool toward its minimum.
    pub async fn cleanup_dead_connections(&self) {
        self.core.cleanup_dead_connections().await;
    }

    /// Permanently shuts the pool down.
    ///
    /// Cancels the maintenance task, fails every queued operation,
    /// and closes every connection. The pool never leaves this state.
    pub async fn dispose(&self) {
        if self.core.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.core.shutdown.cancel();
        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.abort();
        }

        {
            let mut intake = self.core.intake_rx.lock().await;
            while let Ok(op) = intake.try_recv() {
                let _ = op.reply.send(Err(ShoalError::Cancelled));
            }
        }

        let mut members = self.core.members.lock().await;
        for member in members.drain(..) {
            member.stop.cancel();
            member.consumer.abort();
            member.connection.close(CLOSE_GRACE).await;
        }

        tracing::debug!("connection pool disposed");
    }
}

impl PoolCore {
    /// Spawns the consumer task for a new connection.
    fn spawn_member(&self, connection: Arc<dyn KvConnection>) -> PoolMember {
        let stop = self.shutdown.child_token();
        let consumer = tokio::spawn(consume_loop(
            Arc::clone(&connection),
            stop.clone(),
            Arc::clone(&self.intake_rx),
            self.intake_tx.clone(),
            Arc::clone(&self.members),
            Arc::clone(&self.cleanup),
        ));
        PoolMember { connection, stop, consumer }
    }

    async fn cleanup_dead_connections(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }

        let mut members = self.members.lock().await;

        let mut kept = Vec::with_capacity(members.len());
        for member in members.drain(..) {
            if member.connection.is_dead() {
                member.stop.cancel();
                let connection = member.connection;
                tracing::info!(id = %connection.id(), "removing dead connection");
                tokio::spawn(async move {
                    connection.close(CLOSE_GRACE).await;
                });
            } else {
                kept.push(member);
            }
        }
        *members = kept;

        while members.len() < self.min_size {
            match self.factory.create().await {
                Ok(connection) => {
                    tracing::info!(id = %connection.id(), "opened replacement connection");
                    let member = self.spawn_member(connection);
                    members.push(member);
                }
                Err(e) => {
                    // Stay below minimum; the maintenance tick retries.
                    tracing::warn!(error = %e, "failed to open replacement connection");
                    break;
                }
            }
        }
    }
}

/// Per-connection consumer: one operation at a time off the shared queue.
async fn consume_loop(
    connection: Arc<dyn KvConnection>,
    stop: CancellationToken,
    intake_rx: Arc<Mutex<mpsc::Receiver<QueuedOp>>>,
    requeue_tx: mpsc::Sender<QueuedOp>,
    members: Arc<Mutex<Vec<PoolMember>>>,
    cleanup: Arc<Notify>,
) {
    loop {
        let op = {
            let mut intake = tokio::select! {
                guard = intake_rx.lock() => guard,
                _ = stop.cancelled() => return,
            };
            tokio::select! {
                op = intake.recv() => op,
                _ = stop.cancelled() => return,
            }
        };

        let Some(op) = op else {
            return;
        };

        if op.cancel.is_cancelled() {
            continue;
        }

        if connection.is_dead() {
            // Hand the operation back and unlink from the queue; the
            // cleanup pass replaces this connection.
            tracing::debug!(id = %connection.id(), "dead connection observed, requeueing operation");
            if requeue_tx.send(op).await.is_err() {
                // Pool disposed while requeueing.
            }
            unlink_dead_member(&members, &connection).await;
            cleanup.notify_one();
            return;
        }

        let result = connection.send(op.request, op.cancel.clone()).await;
        let _ = op.reply.send(result);
    }
}

/// Removes the dead member so no further operations route to it.
async fn unlink_dead_member(members: &Arc<Mutex<Vec<PoolMember>>>, dead: &Arc<dyn KvConnection>) {
    let mut members = members.lock().await;
    if let Some(index) = members.iter().position(|m| m.connection.id() == dead.id()) {
        let member = members.swap_remove(index);
        member.stop.cancel();
        let connection = member.connection;
        tokio::spawn(async move {
            connection.close(CLOSE_GRACE).await;
        });
    }
}

/// Replaces dead connections and keeps the pool at or above its minimum.
async fn maintenance_loop(core: Arc<PoolCore>) {
    let start = tokio::time::Instant::now() + MAINTENANCE_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, MAINTENANCE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = core.cleanup.notified() => {
                core.cleanup_dead_connections().await;
            }
            _ = ticker.tick() => {
                let below_min = core.members.lock().await.len() < core.min_size;
                if below_min {
                    core.cleanup_dead_connections().await;
                }
            }
            _ = core.shutdown.cancelled() => {
                tracing::debug!("pool maintenance task shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use shoal_core::protocol::constants::*;
    use shoal_core::protocol::ResponseHeader;

    use crate::connection::ConnectionId;

    /// Scripted connection that answers every request successfully after
    /// an optional delay, echoing its own id in the CAS field.
    struct MockConnection {
        id: ConnectionId,
        dead: AtomicBool,
        closed: AtomicBool,
        idle: StdMutex<Duration>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: Arc<AtomicUsize>,
        pool_current: Arc<AtomicUsize>,
        pool_max: Arc<AtomicUsize>,
    }

    impl MockConnection {
        fn new(shared_current: Arc<AtomicUsize>, shared_max: Arc<AtomicUsize>) -> Self {
            Self {
                id: ConnectionId::new(),
                dead: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                idle: StdMutex::new(Duration::ZERO),
                delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
                pool_current: shared_current,
                pool_max: shared_max,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn with_idle(self, idle: Duration) -> Self {
            *self.idle.lock().unwrap() = idle;
            self
        }

        fn mark_dead(&self) {
            self.dead.store(true, Ordering::Release);
        }

        fn was_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }

        fn max_observed(&self) -> usize {
            self.max_in_flight.load(Ordering::Acquire)
        }

        fn success_response(&self, opaque: u32) -> KvResponse {
            KvResponse {
                header: ResponseHeader {
                    magic: MAGIC_RESPONSE,
                    opcode: OP_GET,
                    key_length: 0,
                    extras_length: 0,
                    framing_extras_length: 0,
                    datatype: DATATYPE_RAW,
                    status: STATUS_SUCCESS,
                    total_body_length: 0,
                    opaque,
                    cas: self.id.value(),
                },
                framing_extras: bytes::Bytes::new(),
                extras: bytes::Bytes::new(),
                key: bytes::Bytes::new(),
                value: bytes::Bytes::new(),
            }
        }
    }

    #[async_trait]
    impl KvConnection for MockConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn is_dead(&self) -> bool {
            self.dead.load(Ordering::Acquire)
        }

        fn idle_time(&self) -> Duration {
            *self.idle.lock().unwrap()
        }

        fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::Acquire)
        }

        async fn send(&self, request: KvRequest, _cancel: CancellationToken) -> Result<KvResponse> {
            let mine = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
            self.max_in_flight.fetch_max(mine, Ordering::AcqRel);
            let pool_wide = self.pool_current.fetch_add(1, Ordering::AcqRel) + 1;
            self.pool_max.fetch_max(pool_wide, Ordering::AcqRel);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            self.pool_current.fetch_sub(1, Ordering::AcqRel);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            Ok(self.success_response(request.opaque))
        }

        async fn select_bucket(&self, _bucket: &str) -> Result<()> {
            Ok(())
        }

        async fn close(&self, _grace: Duration) {
            self.closed.store(true, Ordering::Release);
        }
    }

    /// Factory handing out a scripted sequence of connection results.
    struct MockFactory {
        script: StdMutex<VecDeque<Result<Arc<MockConnection>>>>,
        created: AtomicUsize,
        current: Arc<AtomicUsize>,
        max: Arc<AtomicUsize>,
        default_delay: Duration,
    }

    impl MockFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(VecDeque::new()),
                created: AtomicUsize::new(0),
                current: Arc::new(AtomicUsize::new(0)),
                max: Arc::new(AtomicUsize::new(0)),
                default_delay: Duration::ZERO,
            })
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(VecDeque::new()),
                created: AtomicUsize::new(0),
                current: Arc::new(AtomicUsize::new(0)),
                max: Arc::new(AtomicUsize::new(0)),
                default_delay: delay,
            })
        }

        fn push(&self, connection: Arc<MockConnection>) {
            self.script.lock().unwrap().push_back(Ok(connection));
        }

        fn push_failure(&self) {
            self.script
                .lock()
                .unwrap()
                .push_back(Err(ShoalError::Connection("scripted failure".to_string())));
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::Acquire)
        }

        fn pool_wide_max(&self) -> usize {
            self.max.load(Ordering::Acquire)
        }

        fn build_connection(&self) -> MockConnection {
            MockConnection::new(Arc::clone(&self.current), Arc::clone(&self.max))
                .with_delay(self.default_delay)
        }

        fn fresh_connection(&self) -> Arc<MockConnection> {
            Arc::new(self.build_connection())
        }
    }

    #[async_trait]
    impl ConnectionFactory for MockFactory {
        async fn create(&self) -> Result<Arc<dyn KvConnection>> {
            self.created.fetch_add(1, Ordering::AcqRel);
            let scripted = self.script.lock().unwrap().pop_front();
            match scripted {
                Some(Ok(connection)) => Ok(connection),
                Some(Err(e)) => Err(e),
                None => Ok(self.fresh_connection()),
            }
        }
    }

    #[tokio::test]
    async fn test_initialize_opens_min_connections() {
        let factory = MockFactory::new();
        let pool = ConnectionPool::new(Arc::clone(&factory) as _, 3, 3);

        pool.initialize(CancellationToken::new()).await.unwrap();

        assert_eq!(pool.size().await, 3);
        assert_eq!(factory.created(), 3);
        pool.dispose().await;
    }

    #[tokio::test]
    async fn test_initialize_partial_success_is_retained() {
        let factory = MockFactory::new();
        factory.push(factory.fresh_connection());
        factory.push_failure();
        factory.push(factory.fresh_connection());
        let pool = ConnectionPool::new(Arc::clone(&factory) as _, 3, 3);

        pool.initialize(CancellationToken::new()).await.unwrap();

        assert_eq!(pool.size().await, 2);
        pool.dispose().await;
    }

    #[tokio::test]
    async fn test_initialize_fails_only_when_zero_connections() {
        let factory = MockFactory::new();
        factory.push_failure();
        factory.push_failure();
        let pool = ConnectionPool::new(Arc::clone(&factory) as _, 2, 2);

        let result = pool.initialize(CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(pool.size().await, 0);
    }

    #[tokio::test]
    async fn test_single_connection_serializes_ten_ops() {
        let factory = MockFactory::with_delay(Duration::from_millis(100));
        let connection = factory.fresh_connection();
        factory.push(Arc::clone(&connection));
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&factory) as _, 1, 1));
        pool.initialize(CancellationToken::new()).await.unwrap();

        let ops: Vec<_> = (0..10)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    pool.queue_send(KvRequest::get("k"), CancellationToken::new())
                        .await
                })
            })
            .collect();

        for op in ops {
            assert!(op.await.unwrap().is_ok());
        }

        assert_eq!(connection.max_observed(), 1);
        pool.dispose().await;
    }

    #[tokio::test]
    async fn test_four_connections_run_four_wide() {
        let factory = MockFactory::with_delay(Duration::from_millis(100));
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&factory) as _, 4, 4));
        pool.initialize(CancellationToken::new()).await.unwrap();

        let ops: Vec<_> = (0..10)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    pool.queue_send(KvRequest::get("k"), CancellationToken::new())
                        .await
                })
            })
            .collect();

        for op in ops {
            assert!(op.await.unwrap().is_ok());
        }

        assert_eq!(factory.pool_wide_max(), 4);
        pool.dispose().await;
    }

    #[tokio::test]
    async fn test_dead_connection_replaced_and_op_redispatched() {
        let factory = MockFactory::new();
        let dead = factory.fresh_connection();
        dead.mark_dead();
        let healthy = factory.fresh_connection();
        factory.push(Arc::clone(&dead));
        factory.push(Arc::clone(&healthy));

        let pool = ConnectionPool::new(Arc::clone(&factory) as _, 1, 1);
        pool.initialize(CancellationToken::new()).await.unwrap();

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            pool.queue_send(KvRequest::get("k"), CancellationToken::new()),
        )
        .await
        .expect("operation must not be lost when its connection dies")
        .unwrap();

        // The response carries the handling connection's id in CAS.
        assert_eq!(response.cas(), healthy.id().value());
        assert_eq!(factory.created(), 2);
        pool.dispose().await;
    }

    #[tokio::test]
    async fn test_scale_down_stops_longest_idle() {
        let factory = MockFactory::new();
        let one_min = Arc::new(factory.build_connection().with_idle(Duration::from_secs(60)));
        let two_min = Arc::new(factory.build_connection().with_idle(Duration::from_secs(120)));
        let three_min = Arc::new(factory.build_connection().with_idle(Duration::from_secs(180)));
        factory.push(Arc::clone(&one_min));
        factory.push(Arc::clone(&two_min));
        factory.push(Arc::clone(&three_min));

        let pool = ConnectionPool::new(Arc::clone(&factory) as _, 1, 3);
        pool.initialize(CancellationToken::new()).await.unwrap();
        pool.scale(2).await;
        assert_eq!(pool.size().await, 3);

        pool.scale(-1).await;

        assert_eq!(pool.size().await, 2);
        // Background closure; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(three_min.was_closed());
        assert!(!one_min.was_closed());
        assert!(!two_min.was_closed());
        pool.dispose().await;
    }

    #[tokio::test]
    async fn test_scale_up_clamped_to_max() {
        let factory = MockFactory::new();
        let pool = ConnectionPool::new(Arc::clone(&factory) as _, 2, 4);
        pool.initialize(CancellationToken::new()).await.unwrap();

        pool.scale(10).await;
        assert_eq!(pool.size().await, 4);
        pool.dispose().await;
    }

    #[tokio::test]
    async fn test_scale_down_never_below_min() {
        let factory = MockFactory::new();
        let pool = ConnectionPool::new(Arc::clone(&factory) as _, 2, 4);
        pool.initialize(CancellationToken::new()).await.unwrap();
        pool.scale(2).await;

        pool.scale(-10).await;
        assert_eq!(pool.size().await, 2);
        pool.dispose().await;
    }

    #[tokio::test]
    async fn test_freeze_blocks_scale() {
        let factory = MockFactory::new();
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&factory) as _, 1, 3));
        pool.initialize(CancellationToken::new()).await.unwrap();

        let frozen = pool.freeze().await;
        assert_eq!(frozen.size(), 1);

        let scaled = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.scale(1).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!scaled.is_finished(), "scale must wait for the freeze");

        drop(frozen);
        tokio::time::timeout(Duration::from_secs(1), scaled)
            .await
            .expect("scale proceeds once unfrozen")
            .unwrap();

        assert_eq!(pool.size().await, 2);
        pool.dispose().await;
    }

    #[tokio::test]
    async fn test_cancellation_before_dispatch() {
        let factory = MockFactory::with_delay(Duration::from_millis(200));
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&factory) as _, 1, 1));
        pool.initialize(CancellationToken::new()).await.unwrap();

        // Occupy the single connection.
        let blocker = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.queue_send(KvRequest::get("a"), CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancellationToken::new();
        let queued = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.queue_send(KvRequest::get("b"), cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), queued)
            .await
            .expect("cancelled op completes without waiting for dispatch")
            .unwrap();
        assert!(matches!(result, Err(ShoalError::Cancelled)));

        assert!(blocker.await.unwrap().is_ok());
        pool.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_is_permanent() {
        let factory = MockFactory::new();
        let pool = ConnectionPool::new(Arc::clone(&factory) as _, 1, 1);
        pool.initialize(CancellationToken::new()).await.unwrap();

        pool.dispose().await;
        assert!(pool.is_disposed());
        assert_eq!(pool.size().await, 0);

        let result = pool
            .queue_send(KvRequest::get("k"), CancellationToken::new())
            .await;
        assert!(result.is_err());

        // A second dispose is a no-op.
        pool.dispose().await;
        assert!(pool.is_disposed());
    }

    #[tokio::test]
    async fn test_select_bucket_broadcasts_under_freeze() {
        let factory = MockFactory::new();
        let pool = ConnectionPool::new(Arc::clone(&factory) as _, 2, 2);
        pool.initialize(CancellationToken::new()).await.unwrap();

        pool.select_bucket("orders").await.unwrap();
        pool.dispose().await;
    }

    #[tokio::test]
    async fn test_pending_sends_counts_queue_depth() {
        let factory = MockFactory::with_delay(Duration::from_millis(200));
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&factory) as _, 1, 1));
        pool.initialize(CancellationToken::new()).await.unwrap();

        assert_eq!(pool.pending_sends(), 0);

        let mut ops = Vec::new();
        for _ in 0..3 {
            let pool = Arc::clone(&pool);
            ops.push(tokio::spawn(async move {
                pool.queue_send(KvRequest::get("k"), CancellationToken::new())
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.pending_sends() >= 1);

        for op in ops {
            let _ = op.await.unwrap();
        }
        pool.dispose().await;
    }
}
