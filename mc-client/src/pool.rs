//! # Connection Pool
//!
//! Purpose: Reuse server connections across calls and threads, bounded by a
//! maximum size and kept warm at a minimum idle count.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A bounded set of reusable connections; `total`
//!    counts idle plus checked-out plus slots reserved for a dial in progress.
//! 2. **Minimal Locking**: The mutex guards bookkeeping only. Dialing and
//!    closing happen outside it.
//! 3. **RAII Return**: `PooledConnection` goes back to the pool on drop unless
//!    it was marked broken, in which case it is closed.
//! 4. **Background Sweeper**: A thread holding a weak handle evicts connections
//!    idle longer than `idle_timeout` and tops the pool back up to `min_idle`.

use std::collections::VecDeque;
use std::net::TcpStream;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::conn::{Connection, ConnectionFactory, Transport};
use crate::error::{ClientError, ClientResult};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Sizing and reuse policy for a `Pool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections the pool tries to keep idle and ready.
    pub min_idle: usize,
    /// Maximum total connections (idle + in use).
    pub max_size: usize,
    /// Idle connections older than this are closed; `None` keeps them forever.
    pub idle_timeout: Option<Duration>,
    /// When the pool is full, wait for a connection instead of failing with
    /// `PoolExhausted`.
    pub wait_for_connection: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_idle: 2,
            max_size: 16,
            idle_timeout: Some(Duration::from_secs(60)),
            wait_for_connection: true,
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub total: usize,
}

impl PoolStats {
    /// Connections currently checked out (or being dialed).
    pub fn in_use(&self) -> usize {
        self.total - self.idle
    }
}

struct IdleConn<T: Transport> {
    conn: Connection<T>,
    returned_at: Instant,
}

struct PoolState<T: Transport> {
    // Oldest at the front; checkout pops from the back.
    idle: VecDeque<IdleConn<T>>,
    total: usize,
    closed: bool,
}

struct PoolInner<T: Transport> {
    config: PoolConfig,
    factory: Box<dyn ConnectionFactory<T>>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

/// Shared handle to a connection pool.
pub struct Pool<T: Transport = TcpStream> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Transport> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Pool<T> {
    /// Builds a pool, dials `min_idle` connections and starts the sweeper.
    ///
    /// Warm-up dial failures are logged and otherwise ignored; the pool dials
    /// again on demand.
    pub fn new(factory: impl ConnectionFactory<T>, mut config: PoolConfig) -> Self {
        config.max_size = config.max_size.max(1);
        config.min_idle = config.min_idle.min(config.max_size);

        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_size),
            total: 0,
            closed: false,
        };
        let pool = Pool {
            inner: Arc::new(PoolInner {
                config,
                factory: Box::new(factory),
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        };

        pool.inner.fill_to_min_idle();
        if let Some(interval) = pool.inner.sweep_interval() {
            start_sweeper(Arc::downgrade(&pool.inner), interval);
        }
        pool
    }

    /// Takes a connection: the most recently returned idle one, else a fresh
    /// dial if under `max_size`, else waits until `deadline`.
    pub fn checkout(&self, deadline: Option<Instant>) -> ClientResult<PooledConnection<T>> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        loop {
            if state.closed {
                return Err(ClientError::PoolClosed);
            }
            if let Some(idle) = state.idle.pop_back() {
                drop(state);
                trace!("reusing pooled connection");
                return Ok(PooledConnection::new(Arc::clone(inner), idle.conn));
            }
            if state.total < inner.config.max_size {
                state.total += 1;
                drop(state);
                return match inner.factory.connect() {
                    Ok(conn) => Ok(PooledConnection::new(Arc::clone(inner), conn)),
                    Err(err) => {
                        inner.release_slot();
                        Err(err)
                    }
                };
            }
            if !inner.config.wait_for_connection {
                return Err(ClientError::PoolExhausted);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(ClientError::Timeout);
                    }
                    inner.available.wait_until(&mut state, deadline);
                }
                None => inner.available.wait(&mut state),
            }
        }
    }

    /// Closes idle connections and fails every later checkout with
    /// `PoolClosed`. Checked-out connections are closed when returned.
    pub fn close(&self) {
        let drained: Vec<IdleConn<T>> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        self.inner.available.notify_all();
        debug!(closed = drained.len(), "memcache pool closed");
        for idle in drained {
            idle.conn.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            total: state.total,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Runs one sweeper pass on the calling thread.
    #[cfg(test)]
    pub(crate) fn sweep(&self) {
        self.inner.sweep(Instant::now());
    }
}

impl<T: Transport> PoolInner<T> {
    fn sweep_interval(&self) -> Option<Duration> {
        match self.config.idle_timeout {
            Some(timeout) => Some((timeout / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)),
            None if self.config.min_idle > 0 => Some(MAX_SWEEP_INTERVAL),
            None => None,
        }
    }

    fn sweep(&self, now: Instant) {
        let mut expired = Vec::new();
        if let Some(timeout) = self.config.idle_timeout {
            let mut state = self.state.lock();
            while let Some(oldest) = state.idle.front() {
                if now.saturating_duration_since(oldest.returned_at) < timeout {
                    break;
                }
                if let Some(idle) = state.idle.pop_front() {
                    expired.push(idle.conn);
                }
            }
            state.total -= expired.len();
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "closing idle memcache connections");
            for conn in &expired {
                conn.close();
            }
            self.available.notify_all();
        }
        self.fill_to_min_idle();
    }

    /// Dials until `min_idle` connections are idle, within `max_size`.
    fn fill_to_min_idle(&self) {
        let wanted = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let missing = self.config.min_idle.saturating_sub(state.idle.len());
            let room = self.config.max_size.saturating_sub(state.total);
            let wanted = missing.min(room);
            state.total += wanted;
            wanted
        };

        for _ in 0..wanted {
            match self.factory.connect() {
                Ok(conn) => self.checkin(conn),
                Err(err) => {
                    warn!(error = %err, "failed to pre-dial memcache connection");
                    self.release_slot();
                }
            }
        }
    }

    fn checkin(&self, conn: Connection<T>) {
        let mut state = self.state.lock();
        if state.closed {
            state.total -= 1;
            drop(state);
            conn.close();
            return;
        }
        state.idle.push_back(IdleConn {
            conn,
            returned_at: Instant::now(),
        });
        drop(state);
        self.available.notify_one();
    }

    fn discard(&self, conn: Connection<T>) {
        conn.close();
        self.release_slot();
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

impl<T: Transport> Drop for PoolInner<T> {
    fn drop(&mut self) {
        for idle in self.state.get_mut().idle.drain(..) {
            idle.conn.close();
        }
    }
}

fn start_sweeper<T: Transport>(pool: Weak<PoolInner<T>>, interval: Duration) {
    let spawned = std::thread::Builder::new()
        .name("memcache-pool-sweeper".to_string())
        .spawn(move || loop {
            std::thread::sleep(interval);
            let Some(inner) = pool.upgrade() else {
                break;
            };
            if inner.state.lock().closed {
                break;
            }
            inner.sweep(Instant::now());
        });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to start pool sweeper");
    }
}

/// A checked-out connection that returns to its pool on drop.
pub struct PooledConnection<T: Transport = TcpStream> {
    pool: Arc<PoolInner<T>>,
    // `None` only after drop has handed the connection back.
    conn: Option<Connection<T>>,
    valid: bool,
}

impl<T: Transport> PooledConnection<T> {
    fn new(pool: Arc<PoolInner<T>>, conn: Connection<T>) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Marks the connection unusable; it is closed instead of returned.
    pub fn mark_broken(&mut self) {
        self.valid = false;
    }

    /// Returns the connection to the pool now.
    pub fn checkin(self) {}

    /// Closes the connection and frees its pool slot.
    pub fn discard(mut self) {
        self.valid = false;
    }
}

impl<T: Transport> Deref for PooledConnection<T> {
    type Target = Connection<T>;

    fn deref(&self) -> &Connection<T> {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<T: Transport> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut Connection<T> {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<T: Transport> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.valid {
            self.pool.checkin(conn);
        } else {
            self.pool.discard(conn);
        }
    }
}
