//! # Client Facade
//!
//! Purpose: Expose every command as one blocking call that checks a connection
//! out of the pool, bounds it by a deadline, runs the codec and decides whether
//! the connection may be reused.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pooling, deadlines and reuse policy.
//! 2. **Cheap Handles**: `with_deadline`/`with_timeout` return clones sharing
//!    the same pool, so a caller can scope a deadline to a unit of work.
//! 3. **Reuse Only When Synchronized**: A connection goes back to the pool only
//!    after a resumable outcome; anything else closes it.

use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use crate::conn::{Connection, TcpConnector, Transport};
use crate::error::{is_resumable, ClientError, ClientResult};
use crate::item::Item;
use crate::meta::{
    FlagRegistry, MetaArithmeticOptions, MetaDeleteOptions, MetaGetOptions, MetaResult,
    MetaSetOptions,
};
use crate::pool::{Pool, PoolConfig, PoolStats};

/// Configuration for a TCP client and its pool.
///
/// Durations are given in milliseconds when deserialized; missing fields take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:11211".
    pub addr: String,
    /// Connections kept idle and ready.
    pub min_idle: usize,
    /// Maximum total connections (idle + in use).
    pub max_size: usize,
    /// Idle connections older than this are closed; `null` keeps them.
    #[serde(deserialize_with = "millis::deserialize_opt")]
    pub idle_timeout: Option<Duration>,
    /// Default per-call deadline; zero means calls never time out.
    #[serde(deserialize_with = "millis::deserialize")]
    pub timeout: Duration,
    /// TCP connect timeout; zero means the OS default.
    #[serde(deserialize_with = "millis::deserialize")]
    pub connect_timeout: Duration,
    /// Wait for a free connection when the pool is full.
    pub wait_for_connection: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        ClientConfig {
            addr: "127.0.0.1:11211".to_string(),
            min_idle: pool.min_idle,
            max_size: pool.max_size,
            idle_timeout: pool.idle_timeout,
            timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            wait_for_connection: pool.wait_for_connection,
        }
    }
}

impl ClientConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_idle: self.min_idle,
            max_size: self.max_size,
            idle_timeout: self.idle_timeout,
            wait_for_connection: self.wait_for_connection,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_millis)
    }

    pub fn deserialize_opt<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(de)?.map(Duration::from_millis))
    }
}

/// Blocking memcached client backed by a connection pool.
pub struct Client<T: Transport = TcpStream> {
    pool: Pool<T>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Client {
            pool: self.pool.clone(),
            timeout: self.timeout,
            deadline: self.deadline,
        }
    }
}

impl Client<TcpStream> {
    /// Connects to `addr` with default settings.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        Self::with_config(ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        })
    }

    /// Builds a client with the standard response-flag registry.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        Self::with_registry(config, Arc::new(FlagRegistry::standard()))
    }

    /// Builds a client whose connections parse meta flags with `registry`.
    pub fn with_registry(config: ClientConfig, registry: Arc<FlagRegistry>) -> ClientResult<Self> {
        // Resolve once up front so a bad address fails here, not on first use.
        let resolves = config
            .addr
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false);
        if !resolves {
            return Err(ClientError::InvalidAddress(config.addr));
        }

        let connect_timeout = non_zero(config.connect_timeout);
        let connector = TcpConnector::new(config.addr.clone(), connect_timeout, registry);
        let pool = Pool::new(connector, config.pool_config());
        Ok(Self::from_pool(pool, non_zero(config.timeout)))
    }
}

impl<T: Transport> Client<T> {
    /// Wraps an existing pool; `timeout` bounds every call.
    pub fn from_pool(pool: Pool<T>, timeout: Option<Duration>) -> Self {
        Client {
            pool,
            timeout,
            deadline: None,
        }
    }

    /// Returns a handle on the same pool whose calls also stop at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Client {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Returns a handle on the same pool with a different per-call timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Client {
            timeout: non_zero(timeout),
            ..self.clone()
        }
    }

    pub fn get(&self, key: &str) -> ClientResult<Item> {
        self.exec("get", |conn| conn.get(key))
    }

    /// Fetches several keys at once; missing keys are absent from the map.
    pub fn get_multi<K: AsRef<str>>(&self, keys: &[K]) -> ClientResult<HashMap<String, Item>> {
        self.exec("gets", |conn| conn.get_multi(keys))
    }

    pub fn set(&self, item: &Item) -> ClientResult<()> {
        self.exec("set", |conn| conn.set(item))
    }

    pub fn add(&self, item: &Item) -> ClientResult<()> {
        self.exec("add", |conn| conn.add(item))
    }

    pub fn replace(&self, item: &Item) -> ClientResult<()> {
        self.exec("replace", |conn| conn.replace(item))
    }

    pub fn append(&self, item: &Item) -> ClientResult<()> {
        self.exec("append", |conn| conn.append(item))
    }

    pub fn prepend(&self, item: &Item) -> ClientResult<()> {
        self.exec("prepend", |conn| conn.prepend(item))
    }

    /// Writes `item` only if its CAS id (from `get_multi`) is still current.
    pub fn compare_and_swap(&self, item: &Item) -> ClientResult<()> {
        self.exec("cas", |conn| conn.compare_and_swap(item))
    }

    pub fn delete(&self, key: &str) -> ClientResult<()> {
        self.exec("delete", |conn| conn.delete(key))
    }

    pub fn increment(&self, key: &str, delta: u64) -> ClientResult<u64> {
        self.exec("incr", |conn| conn.increment(key, delta))
    }

    pub fn decrement(&self, key: &str, delta: u64) -> ClientResult<u64> {
        self.exec("decr", |conn| conn.decrement(key, delta))
    }

    pub fn touch(&self, key: &str, seconds: i32) -> ClientResult<()> {
        self.exec("touch", |conn| conn.touch(key, seconds))
    }

    pub fn flush_all(&self) -> ClientResult<()> {
        self.exec("flush_all", |conn| conn.flush_all())
    }

    pub fn version(&self) -> ClientResult<String> {
        self.exec("version", |conn| conn.version())
    }

    /// Health tap: a `version` round trip with the answer discarded.
    pub fn ping(&self) -> ClientResult<()> {
        self.version().map(|_| ())
    }

    pub fn meta_get(&self, opts: &MetaGetOptions) -> ClientResult<MetaResult> {
        self.exec("mg", |conn| conn.meta_get(opts))
    }

    pub fn meta_set(&self, opts: &MetaSetOptions) -> ClientResult<MetaResult> {
        self.exec("ms", |conn| conn.meta_set(opts))
    }

    pub fn meta_delete(&self, opts: &MetaDeleteOptions) -> ClientResult<MetaResult> {
        self.exec("md", |conn| conn.meta_delete(opts))
    }

    pub fn meta_arithmetic(&self, opts: &MetaArithmeticOptions) -> ClientResult<MetaResult> {
        self.exec("ma", |conn| conn.meta_arithmetic(opts))
    }

    pub fn meta_noop(&self) -> ClientResult<()> {
        self.exec("mn", |conn| conn.meta_noop())
    }

    /// Closes the shared pool; every handle on it stops working.
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn pool(&self) -> &Pool<T> {
        &self.pool
    }

    /// Earliest of the handle's deadline and `now + timeout`.
    fn call_deadline(&self) -> Option<Instant> {
        let by_timeout = self.timeout.map(|timeout| Instant::now() + timeout);
        match (self.deadline, by_timeout) {
            (Some(deadline), Some(by_timeout)) => Some(deadline.min(by_timeout)),
            (deadline, by_timeout) => deadline.or(by_timeout),
        }
    }

    fn exec<R>(
        &self,
        op: &'static str,
        call: impl FnOnce(&mut Connection<T>) -> ClientResult<R>,
    ) -> ClientResult<R> {
        let deadline = self.call_deadline();
        let mut conn = self.pool.checkout(deadline)?;

        if let Err(err) = conn.set_deadline(deadline) {
            // An already-elapsed deadline touches no bytes; keep the connection.
            if !matches!(err, ClientError::Timeout) {
                conn.mark_broken();
            }
            return Err(err);
        }

        let result = call(&mut *conn);
        match &result {
            Err(err) if !is_resumable(&result) => {
                debug!(op, error = %err, "discarding memcache connection");
                conn.mark_broken();
            }
            _ => {
                if let Err(err) = conn.clear_deadline() {
                    debug!(op, error = %err, "discarding memcache connection");
                    conn.mark_broken();
                }
            }
        }
        result
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
