use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, trace};

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::{Error, Result};

type Connector = Box<dyn Fn() -> BoxFuture<'static, Result<Connection>> + Send + Sync>;

/// A bounded set of connections leased out one caller at a time.
///
/// Connections are created lazily by the connector, up to `max_size`. A lease is returned when
/// its `PooledConnection` is dropped; broken connections and connections left inside a `MULTI`
/// block are thrown away instead, and the freed slot is filled with a new connection on demand.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Connector,
    idle: Mutex<Vec<Connection>>,
    // One permit per connection that may exist.
    permits: Arc<Semaphore>,
    max_size: usize,
    wait_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub leased: usize,
}

impl Pool {
    pub fn new<F, Fut>(config: PoolConfig, connector: F) -> Pool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Connection>> + Send + 'static,
    {
        let connector: Connector = Box::new(move || connector().boxed());

        Pool {
            inner: Arc::new(Inner {
                connector,
                idle: Mutex::new(Vec::with_capacity(config.max_size)),
                permits: Arc::new(Semaphore::new(config.max_size)),
                max_size: config.max_size,
                wait_timeout: config.wait_timeout,
            }),
        }
    }

    /// Leases a connection, waiting up to the configured wait timeout for one to be free.
    pub async fn get(&self) -> Result<PooledConnection> {
        self.get_timeout(self.inner.wait_timeout).await
    }

    /// Leases a connection, waiting at most `wait` for a free slot and for a new connection to be
    /// opened in it. A zero wait fails right away when every connection is leased.
    #[instrument(name = "pool_get", level = "debug", skip(self))]
    pub async fn get_timeout(&self, wait: Duration) -> Result<PooledConnection> {
        if wait.is_zero() {
            return self.try_get().await;
        }
        let deadline = Instant::now() + wait;

        let permit = match timeout_at(deadline, self.inner.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                debug!(max_size = self.inner.max_size, "pool exhausted");
                return Err(Error::PoolExhausted(wait));
            }
        };

        match timeout_at(deadline, self.lease(permit)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("no connection opened within the wait");
                Err(Error::PoolExhausted(wait))
            }
        }
    }

    /// Fails right away when every connection is leased. Opening a new connection in a free
    /// slot is not bounded.
    pub async fn try_get(&self) -> Result<PooledConnection> {
        let permit = match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(Error::PoolClosed),
            Err(TryAcquireError::NoPermits) => return Err(Error::PoolExhausted(Duration::ZERO)),
        };

        self.lease(permit).await
    }

    /// Fails every pending and future lease with `Error::PoolClosed` and drops the idle
    /// connections. Leased connections are dropped as they come back.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.idle().clear();
        debug!("pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.inner.idle().len();
        let leased = if self.is_closed() {
            0
        } else {
            self.inner.max_size - self.inner.permits.available_permits()
        };

        PoolStatus {
            max_size: self.inner.max_size,
            idle,
            leased,
        }
    }

    async fn lease(&self, permit: OwnedSemaphorePermit) -> Result<PooledConnection> {
        let reused = self.inner.idle().pop();

        let conn = match reused {
            Some(conn) => {
                trace!(connection_id = %conn.id, "reusing idle connection");
                conn
            }
            // On failure the permit is dropped with this future and the slot frees up.
            None => {
                let conn = (self.inner.connector)().await?;
                debug!(connection_id = %conn.id, "new pooled connection");
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }
}

impl Inner {
    fn idle(&self) -> MutexGuard<'_, Vec<Connection>> {
        // The list stays consistent even if a holder panicked.
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .field("wait_timeout", &self.inner.wait_timeout)
            .finish()
    }
}

/// Exclusive lease on a pooled connection. It derefs to the `Connection` and goes back to the
/// pool on drop.
pub struct PooledConnection {
    // Only taken in `drop`.
    conn: Option<Connection>,
    pool: Arc<Inner>,
    // Released after the connection is back in the idle list, so a waiter finds it there.
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
            .as_ref()
            .expect("connection is present until the lease is dropped")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
            .as_mut()
            .expect("connection is present until the lease is dropped")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if conn.is_broken() || conn.in_transaction() {
            debug!(connection_id = %conn.id, "discarding unusable connection");
            return;
        }

        // Checked under the lock, so a concurrent `close` either sees the connection and drops
        // it or is seen here.
        let mut idle = self.pool.idle();
        if self.pool.permits.is_closed() {
            return;
        }

        trace!(connection_id = %conn.id, "connection returned to the pool");
        idle.push(conn);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}
