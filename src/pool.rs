//! Connection pool.
//!
//! At most `capacity` connections are live at once. A lease request that finds
//! neither an idle connection nor a free slot joins a FIFO queue of at most
//! `queue_capacity` waiters; beyond that it fails immediately.
//!
//! The queue is a fair semaphore holding one permit per slot. A lease owns its
//! permit, and dropping the lease first returns the connection to the idle set
//! (or discards it if it is no longer healthy), then releases the permit to
//! the next waiter.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionState};
use crate::error::{PgError, PgResult, Stage};
use crate::message::Message;
use crate::pipeline::{self, ResultSink};
use crate::transport::Transport;
use crate::types::TypeRegistry;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
///
/// Deserializes from e.g. `{"capacity": 8, "queue_capacity": 64,
/// "connect_timeout_ms": 2000}`; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live connections
    pub capacity: usize,
    /// Maximum number of queued lease requests (0 = fail fast)
    pub queue_capacity: usize,
    /// Connections opened by [`Pool::connect`]
    pub min_connections: usize,
    /// Upper bound on establishing one connection
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Deadline applied by [`Pool::execute`]
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            queue_capacity: 128,
            min_connections: 0,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn validate(&self) -> PgResult<()> {
        if self.capacity == 0 {
            return Err(PgError::Config("pool capacity must be positive".to_string()));
        }
        if self.min_connections > self.capacity {
            return Err(PgError::Config(format!(
                "min_connections ({}) exceeds capacity ({})",
                self.min_connections, self.capacity
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    pub waiting: usize,
}

// ============================================================================
// Pool Inner
// ============================================================================

struct Shared<T: Transport> {
    idle: Vec<Connection<T::Session>>,
    /// Idle plus leased connections, including ones still being opened.
    live: usize,
    /// Lease requests queued on the semaphore.
    waiting: usize,
}

struct PoolInner<T: Transport> {
    transport: T,
    config: PoolConfig,
    template: Arc<TypeRegistry>,
    /// Registry after the first catalog lookup, shared by later connections.
    resolved: OnceCell<Arc<TypeRegistry>>,
    shared: Mutex<Shared<T>>,
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
}

/// Undoes a `live` reservation unless the connection was opened.
struct LiveSlot<'a, T: Transport> {
    inner: &'a PoolInner<T>,
    armed: bool,
}

impl<T: Transport> Drop for LiveSlot<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.shared.lock().live -= 1;
        }
    }
}

/// Keeps `waiting` accurate even if the waiting future is dropped.
struct QueueSlot<'a, T: Transport> {
    inner: &'a PoolInner<T>,
}

impl<T: Transport> Drop for QueueSlot<'_, T> {
    fn drop(&mut self) {
        self.inner.shared.lock().waiting -= 1;
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Exclusive use of one pooled connection.
///
/// Dropping the lease hands the connection back to the pool.
pub struct Lease<T: Transport> {
    conn: Option<Connection<T::Session>>,
    pool: Pool<T>,
    _permit: OwnedSemaphorePermit,
}

impl<T: Transport> Lease<T> {
    pub fn pool(&self) -> &Pool<T> {
        &self.pool
    }
}

impl<T: Transport> Deref for Lease<T> {
    type Target = Connection<T::Session>;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("lease holds its connection until dropped")
    }
}

impl<T: Transport> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("lease holds its connection until dropped")
    }
}

impl<T: Transport> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
        // `_permit` is released after this, waking the next waiter.
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A bounded pool of connections opened through one transport.
pub struct Pool<T: Transport> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Transport> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Pool<T> {
    /// Create an empty pool. Connections are opened on demand.
    pub fn new(transport: T, config: PoolConfig, registry: TypeRegistry) -> PgResult<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.capacity)),
            transport,
            config,
            template: Arc::new(registry),
            resolved: OnceCell::new(),
            shared: Mutex::new(Shared {
                idle: Vec::new(),
                live: 0,
                waiting: 0,
            }),
            closed: AtomicBool::new(false),
        });

        Ok(Self { inner })
    }

    /// Create a pool and open `min_connections` up front.
    pub async fn connect(transport: T, config: PoolConfig, registry: TypeRegistry) -> PgResult<Self> {
        let pool = Self::new(transport, config, registry)?;

        let deadline = Instant::now() + pool.inner.config.connect_timeout;
        let mut warm = Vec::with_capacity(pool.inner.config.min_connections);
        for _ in 0..pool.inner.config.min_connections {
            warm.push(pool.acquire(deadline).await?);
        }
        drop(warm);

        Ok(pool)
    }

    /// Lease a connection, waiting no later than `deadline`.
    pub async fn acquire(&self, deadline: Instant) -> PgResult<Lease<T>> {
        if self.is_closed() {
            return Err(PgError::PoolClosed);
        }

        let permit = match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PgError::PoolClosed),
            Err(TryAcquireError::NoPermits) => self.wait_for_permit(deadline).await?,
        };

        let mut conn = match self.take_idle() {
            Some(conn) => conn,
            None => self.open_connection(deadline).await?,
        };
        conn.reset_error_context();

        Ok(Lease {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        })
    }

    async fn wait_for_permit(&self, deadline: Instant) -> PgResult<OwnedSemaphorePermit> {
        {
            let mut shared = self.inner.shared.lock();
            if shared.waiting >= self.inner.config.queue_capacity {
                warn!(
                    capacity = self.inner.config.capacity,
                    waiting = shared.waiting,
                    "connection pool exhausted"
                );
                return Err(PgError::PoolExhausted {
                    capacity: self.inner.config.capacity,
                    queue_capacity: self.inner.config.queue_capacity,
                });
            }
            shared.waiting += 1;
        }
        let _slot = QueueSlot { inner: &self.inner };

        if Instant::now() >= deadline {
            return Err(PgError::Timeout(Stage::Queue));
        }

        // Dropping the acquire future on timeout removes this waiter from the
        // semaphore queue, so a late permit goes to the next waiter instead.
        match timeout_at(deadline, Arc::clone(&self.inner.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(PgError::PoolClosed),
            Err(_) => {
                debug!("timed out waiting for a pooled connection");
                Err(PgError::Timeout(Stage::Queue))
            }
        }
    }

    /// Pop a healthy idle connection, evicting any that went bad while idle.
    fn take_idle(&self) -> Option<Connection<T::Session>> {
        let mut shared = self.inner.shared.lock();
        while let Some(conn) = shared.idle.pop() {
            if conn.is_good() && conn.state() == ConnectionState::Idle {
                return Some(conn);
            }
            shared.live -= 1;
            debug!(state = ?conn.state(), "evicting unhealthy idle connection");
        }
        None
    }

    async fn open_connection(&self, deadline: Instant) -> PgResult<Connection<T::Session>> {
        self.inner.shared.lock().live += 1;
        let mut slot = LiveSlot {
            inner: &self.inner,
            armed: true,
        };

        let connect_deadline = deadline.min(Instant::now() + self.inner.config.connect_timeout);
        let conn =
            Connection::connect(&self.inner.transport, self.registry(), connect_deadline).await?;

        let _ = self.inner.resolved.set(Arc::clone(conn.registry()));
        slot.armed = false;
        Ok(conn)
    }

    fn release(&self, mut conn: Connection<T::Session>) {
        let healthy = conn.is_good() && conn.state() == ConnectionState::Idle;
        let mut shared = self.inner.shared.lock();
        if healthy && !self.is_closed() {
            shared.idle.push(conn);
            return;
        }
        shared.live -= 1;
        drop(shared);

        debug!(state = ?conn.state(), "discarding connection");
        conn.mark_bad();
    }

    /// Registry new connections start from: the catalog-resolved one once a
    /// connection has loaded it, the template before that.
    pub fn registry(&self) -> Arc<TypeRegistry> {
        self.inner
            .resolved
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.inner.template))
    }

    /// Run `message` on a pooled connection under the configured request timeout.
    pub async fn execute<K: ResultSink>(&self, message: &Message, sink: K) -> PgResult<K::Output> {
        let deadline = Instant::now() + self.inner.config.request_timeout;
        pipeline::execute(self, message, deadline, sink).await
    }

    pub fn stats(&self) -> PoolStats {
        let shared = self.inner.shared.lock();
        PoolStats {
            capacity: self.inner.config.capacity,
            live: shared.live,
            idle: shared.idle.len(),
            busy: shared.live - shared.idle.len(),
            waiting: shared.waiting,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the pool: queued and future lease requests fail, idle
    /// connections are closed, and leased ones are closed when returned.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();

        let connections = {
            let mut shared = self.inner.shared.lock();
            let idle = std::mem::take(&mut shared.idle);
            shared.live -= idle.len();
            idle
        };

        for mut conn in connections {
            conn.close().await;
        }
    }
}
