//! Generation-tagged connection pool for one server endpoint.
//!
//! Checkout is bounded by a fair semaphore, so waiters are served in
//! submission order and no more than `max_size` connections are ever live.
//! Invalidation only bumps a generation counter; stale connections are
//! discovered and destroyed lazily at checkout and check-in, keeping
//! invalidation O(1). A single periodic maintenance task prunes stale idle
//! connections and keeps the pool topped up to its minimum size.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bson::oid::ObjectId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::connection::{Connection, Connector, EndpointId};
use crate::error::{Result, TransportError};

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live connections (idle plus checked out).
    pub max_size: usize,
    /// Minimum connections the maintenance task keeps open.
    pub min_size: usize,
    /// Destroy connections idle longer than this. `None` disables the check.
    pub max_idle_time: Option<Duration>,
    /// Destroy connections older than this. `None` disables the check.
    pub max_lifetime: Option<Duration>,
    /// How long a checkout may wait before failing with a timeout.
    pub wait_queue_timeout: Duration,
    /// How often the maintenance task runs.
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            min_size: 0,
            max_idle_time: None,
            max_lifetime: None,
            wait_queue_timeout: Duration::from_secs(120),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Why a checkout failed. Reported to listeners even when the caller-visible
/// error type coincides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutFailedReason {
    /// The wait-queue timeout elapsed.
    Timeout,
    /// The pool was closed.
    PoolClosed,
    /// Opening a new connection failed.
    ConnectionError,
}

/// Why a pooled connection was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClosedReason {
    /// Its generation predates an invalidation.
    Stale,
    /// It sat idle past the idle limit.
    Idle,
    /// It outlived the lifetime limit.
    Expired,
    /// It came back unhealthy (stream already closed).
    Error,
    /// The pool closed.
    PoolClosed,
}

/// Receives pool lifecycle events. All methods default to no-ops.
pub trait PoolListener: Send + Sync {
    /// A connection finished opening.
    fn connection_created(&self, _id: u64) {}
    /// A connection was destroyed.
    fn connection_closed(&self, _id: u64, _reason: ConnectionClosedReason) {}
    /// A checkout attempt began.
    fn checkout_started(&self) {}
    /// A checkout attempt produced a connection.
    fn checkout_succeeded(&self, _id: u64) {}
    /// A checkout attempt failed.
    fn checkout_failed(&self, _reason: CheckoutFailedReason) {}
    /// The pool's generation was bumped.
    fn pool_cleared(&self) {}
}

/// Statistics about the pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Live connections, idle plus checked out.
    pub total_connections: usize,
    /// Connections waiting in the idle set.
    pub idle: usize,
    /// Connections currently checked out.
    pub checked_out: usize,
    /// Checked-out connections pinned to cursors.
    pub cursor_pins: usize,
    /// Checked-out connections pinned to transactions.
    pub transaction_pins: usize,
    /// Current pool-wide generation.
    pub generation: u32,
}

struct PoolInner {
    endpoint: EndpointId,
    config: PoolConfig,
    connector: Connector,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Connection>>,
    generation: AtomicU32,
    service_generations: Mutex<HashMap<ObjectId, u32>>,
    next_id: AtomicU64,
    total: AtomicUsize,
    checked_out: AtomicUsize,
    cursor_pins: AtomicUsize,
    transaction_pins: AtomicUsize,
    closed: AtomicBool,
    maintenance_active: AtomicBool,
    maintenance_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    listener: Option<Arc<dyn PoolListener>>,
}

/// A bounded pool of connections to one endpoint.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool. No connections are opened until the first checkout or
    /// maintenance run.
    pub fn new(endpoint: EndpointId, connector: Connector, config: PoolConfig) -> Self {
        Self::with_listener(endpoint, connector, config, None)
    }

    /// Creates a pool that reports lifecycle events to `listener`.
    pub fn with_listener(
        endpoint: EndpointId,
        connector: Connector,
        config: PoolConfig,
        listener: Option<Arc<dyn PoolListener>>,
    ) -> Self {
        let max_size = config.max_size.max(1);
        let config = PoolConfig {
            max_size,
            min_size: config.min_size.min(max_size),
            ..config
        };
        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                config,
                connector,
                semaphore: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(VecDeque::new()),
                generation: AtomicU32::new(0),
                service_generations: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                total: AtomicUsize::new(0),
                checked_out: AtomicUsize::new(0),
                cursor_pins: AtomicUsize::new(0),
                transaction_pins: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                maintenance_active: AtomicBool::new(false),
                maintenance_task: Mutex::new(None),
                listener,
            }),
        }
    }

    /// The endpoint this pool serves.
    pub fn endpoint(&self) -> &EndpointId {
        &self.inner.endpoint
    }

    /// Current pool-wide generation.
    pub fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Checks a connection out, waiting up to the configured wait-queue
    /// timeout for capacity.
    ///
    /// Stale candidates (generation mismatch, past lifetime or idle limits)
    /// are destroyed and the search continues under the same deadline.
    pub async fn check_out(&self) -> Result<PooledConnection> {
        self.check_out_with_timeout(self.inner.config.wait_queue_timeout)
            .await
    }

    /// Checks a connection out with a caller-supplied wait deadline in place
    /// of the configured wait-queue timeout.
    pub async fn check_out_with_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        if let Some(listener) = &self.inner.listener {
            listener.checkout_started();
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.notify_checkout_failed(CheckoutFailedReason::PoolClosed);
            return Err(self.inner.pool_closed_error());
        }
        match tokio::time::timeout(timeout, self.inner.acquire()).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.notify_checkout_failed(CheckoutFailedReason::Timeout);
                Err(TransportError::CheckoutTimeout {
                    message: self.inner.timeout_message(timeout),
                })
            }
        }
    }

    /// Non-blocking checkout: returns `None` when no connection is idle and
    /// no capacity is immediately available.
    pub async fn try_check_out(&self) -> Result<Option<PooledConnection>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.notify_checkout_failed(CheckoutFailedReason::PoolClosed);
            return Err(self.inner.pool_closed_error());
        }
        let permit = match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Ok(None),
        };
        self.inner.acquire_with_permit(permit).await.map(Some)
    }

    /// Bumps the pool-wide generation. Existing connections are destroyed
    /// lazily as they pass through checkout or check-in.
    pub fn invalidate(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(listener) = &self.inner.listener {
            listener.pool_cleared();
        }
        debug!(endpoint = %self.inner.endpoint, generation, "pool invalidated");
    }

    /// Bumps the generation for one backing process in load-balanced mode.
    pub fn invalidate_service(&self, service_id: ObjectId) {
        {
            let mut map = self.inner.service_generations.lock().unwrap();
            *map.entry(service_id).or_insert(0) += 1;
        }
        if let Some(listener) = &self.inner.listener {
            listener.pool_cleared();
        }
        debug!(endpoint = %self.inner.endpoint, %service_id, "service invalidated");
    }

    /// Starts the periodic maintenance task. Only scheduled when pruning or a
    /// minimum size is configured; calling again is a no-op.
    pub fn start(&self) {
        let config = &self.inner.config;
        if config.min_size == 0 && config.max_idle_time.is_none() && config.max_lifetime.is_none()
        {
            return;
        }
        let mut slot = self.inner.maintenance_task.lock().unwrap();
        if slot.is_some() || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let interval = config.maintenance_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                inner.maintain().await;
            }
        }));
    }

    /// Runs one maintenance pass: destroys stale idle connections, then
    /// tops the pool up to its minimum size. Skipped if a pass is already
    /// running.
    pub async fn run_maintenance(&self) {
        self.inner.maintain().await;
    }

    /// Closes the pool: destroys idle connections, cancels maintenance, and
    /// fails current and future checkouts with `PoolClosed`. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.semaphore.close();
        if let Some(handle) = self.inner.maintenance_task.lock().unwrap().take() {
            handle.abort();
        }
        let drained: Vec<Connection> = self.inner.idle.lock().unwrap().drain(..).collect();
        for connection in drained {
            self.inner.destroy(connection, ConnectionClosedReason::PoolClosed);
        }
        debug!(endpoint = %self.inner.endpoint, "connection pool closed");
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_connections: self.inner.total.load(Ordering::SeqCst),
            idle: self.inner.idle.lock().unwrap().len(),
            checked_out: self.inner.checked_out.load(Ordering::SeqCst),
            cursor_pins: self.inner.cursor_pins.load(Ordering::SeqCst),
            transaction_pins: self.inner.transaction_pins.load(Ordering::SeqCst),
            generation: self.inner.generation.load(Ordering::SeqCst),
        }
    }
}

impl PoolInner {
    async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.notify_checkout_failed(CheckoutFailedReason::PoolClosed);
                return Err(self.pool_closed_error());
            }
        };
        self.acquire_with_permit(permit).await
    }

    async fn acquire_with_permit(
        self: &Arc<Self>,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledConnection> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                self.notify_checkout_failed(CheckoutFailedReason::PoolClosed);
                return Err(self.pool_closed_error());
            }
            let candidate = self.idle.lock().unwrap().pop_back();
            let connection = match candidate {
                Some(connection) => {
                    if let Some(reason) = self.staleness(&connection) {
                        self.destroy(connection, reason);
                        continue;
                    }
                    connection
                }
                None => match self.create_connection().await {
                    Ok(connection) => connection,
                    Err(err) => {
                        self.notify_checkout_failed(CheckoutFailedReason::ConnectionError);
                        return Err(err);
                    }
                },
            };
            self.checked_out.fetch_add(1, Ordering::SeqCst);
            if let Some(listener) = &self.listener {
                listener.checkout_succeeded(connection.id());
            }
            return Ok(PooledConnection {
                conn: Some(connection),
                pool: Arc::clone(self),
                permit: Some(permit),
                pinned_cursor: false,
                pinned_transaction: false,
            });
        }
    }

    async fn create_connection(&self) -> Result<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let generation = self.generation.load(Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        match self.connector.connect(id, &self.endpoint, generation).await {
            Ok(mut connection) => {
                // Load-balanced endpoints track generations per backing
                // process, known only after the handshake.
                if let Some(service_id) = connection.service_id() {
                    connection.set_generation(self.service_generation(service_id));
                }
                if let Some(listener) = &self.listener {
                    listener.connection_created(id);
                }
                debug!(id, endpoint = %self.endpoint, "pooled connection created");
                Ok(connection)
            }
            Err(err) => {
                self.total.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn staleness(&self, connection: &Connection) -> Option<ConnectionClosedReason> {
        if !connection.is_open() {
            return Some(ConnectionClosedReason::Error);
        }
        if connection.generation() != self.current_generation(connection.service_id()) {
            return Some(ConnectionClosedReason::Stale);
        }
        if let Some(lifetime) = self.config.max_lifetime {
            if connection.opened_at().elapsed() > lifetime {
                return Some(ConnectionClosedReason::Expired);
            }
        }
        if let Some(idle) = self.config.max_idle_time {
            if connection.last_used().elapsed() > idle {
                return Some(ConnectionClosedReason::Idle);
            }
        }
        None
    }

    fn current_generation(&self, service_id: Option<ObjectId>) -> u32 {
        match service_id {
            Some(service_id) => self
                .service_generations
                .lock()
                .unwrap()
                .get(&service_id)
                .copied()
                .unwrap_or(0),
            None => self.generation.load(Ordering::SeqCst),
        }
    }

    fn service_generation(&self, service_id: ObjectId) -> u32 {
        self.service_generations
            .lock()
            .unwrap()
            .get(&service_id)
            .copied()
            .unwrap_or(0)
    }

    fn destroy(&self, mut connection: Connection, reason: ConnectionClosedReason) {
        let id = connection.id();
        connection.close();
        self.total.fetch_sub(1, Ordering::SeqCst);
        if let Some(listener) = &self.listener {
            listener.connection_closed(id, reason);
        }
        debug!(id, ?reason, endpoint = %self.endpoint, "pooled connection destroyed");
    }

    fn check_in_inner(&self, connection: Connection) {
        self.checked_out.fetch_sub(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.destroy(connection, ConnectionClosedReason::PoolClosed);
            return;
        }
        if let Some(reason) = self.staleness(&connection) {
            self.destroy(connection, reason);
            return;
        }
        self.idle.lock().unwrap().push_back(connection);
    }

    async fn maintain(self: &Arc<Self>) {
        // Re-entrant runs are skipped, not queued.
        if self
            .maintenance_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let stale: Vec<(Connection, ConnectionClosedReason)> = {
            let mut idle = self.idle.lock().unwrap();
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut out = Vec::new();
            while let Some(connection) = idle.pop_front() {
                match self.staleness(&connection) {
                    Some(reason) => out.push((connection, reason)),
                    None => keep.push_back(connection),
                }
            }
            *idle = keep;
            out
        };
        for (connection, reason) in stale {
            self.destroy(connection, reason);
        }

        while !self.closed.load(Ordering::SeqCst)
            && self.total.load(Ordering::SeqCst) < self.config.min_size
        {
            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            match self.create_connection().await {
                Ok(connection) => {
                    self.idle.lock().unwrap().push_back(connection);
                    drop(permit);
                }
                Err(err) => {
                    warn!(error = %err, endpoint = %self.endpoint, "background connection create failed");
                    drop(permit);
                    break;
                }
            }
        }

        self.maintenance_active.store(false, Ordering::SeqCst);
    }

    fn notify_checkout_failed(&self, reason: CheckoutFailedReason) {
        if let Some(listener) = &self.listener {
            listener.checkout_failed(reason);
        }
    }

    fn pool_closed_error(&self) -> TransportError {
        TransportError::PoolClosed {
            addr: self.endpoint.address.clone(),
        }
    }

    fn timeout_message(&self, timeout: Duration) -> String {
        let checked_out = self.checked_out.load(Ordering::SeqCst);
        let cursor = self.cursor_pins.load(Ordering::SeqCst);
        let transaction = self.transaction_pins.load(Ordering::SeqCst);
        let other = checked_out.saturating_sub(cursor + transaction);
        format!(
            "timed out after {:?} waiting for a connection to {}; maxPoolSize: {}, \
             connections in use by cursors: {cursor}, \
             connections in use by transactions: {transaction}, \
             connections in use by other operations: {other}",
            timeout, self.endpoint, self.config.max_size,
        )
    }
}

/// A checked-out connection. Dropping it (or calling
/// [`PooledConnection::check_in`]) returns it to the pool; unhealthy or stale
/// connections are destroyed instead. Release is idempotent.
impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("pinned_cursor", &self.pinned_cursor)
            .field("pinned_transaction", &self.pinned_transaction)
            .finish()
    }
}

pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
    pinned_cursor: bool,
    pinned_transaction: bool,
}

impl PooledConnection {
    /// Marks this connection as dedicated to an open cursor.
    pub fn pin_cursor(&mut self) {
        if !self.pinned_cursor {
            self.pinned_cursor = true;
            self.pool.cursor_pins.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Clears the cursor pin.
    pub fn unpin_cursor(&mut self) {
        if self.pinned_cursor {
            self.pinned_cursor = false;
            self.pool.cursor_pins.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Marks this connection as dedicated to an open transaction.
    pub fn pin_transaction(&mut self) {
        if !self.pinned_transaction {
            self.pinned_transaction = true;
            self.pool.transaction_pins.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Clears the transaction pin.
    pub fn unpin_transaction(&mut self) {
        if self.pinned_transaction {
            self.pinned_transaction = false;
            self.pool.transaction_pins.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Returns the connection to the pool.
    pub fn check_in(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.unpin_cursor();
        self.unpin_transaction();
        if let Some(connection) = self.conn.take() {
            self.pool.check_in_inner(connection);
        }
        // The permit is released only after the connection is back in the
        // idle set, so a woken waiter always finds it.
        self.permit.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already returned")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already returned")
    }
}
