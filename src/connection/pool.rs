//! Pool of idle connections to a single broker.
use std::collections::BTreeMap;
use std::future::{Future, poll_fn};
use std::sync::{Arc, Weak};
use std::task::Poll;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::debug;

use super::Connection;
use crate::protocol::error::RpcError;

/// Keeps up to `max_conns` idle connections to one broker and closes those that stay idle for longer than
/// `keep_alive`.
///
/// Idle connections are owned by the pool. A connection handed out by [`acquire`](Self::acquire) is owned by the
/// caller until it is given back via [`release`](Self::release).
///
/// All idle timers of a pool live in one [`DelayQueue`] that a single background task drains. The task is started by
/// the first release inside a tokio runtime. Connections released outside a runtime are kept but never evicted.
pub struct ConnectionPool<C> {
    addr: String,

    /// 0 means unlimited
    max_conns: usize,

    /// Zero disables idle eviction
    keep_alive: Duration,

    state: Arc<Mutex<PoolState<C>>>,
}

struct PoolState<C> {
    /// Idle connections by release order, oldest first.
    idle: BTreeMap<u64, Idle<C>>,

    /// Expiry of idle entries, keyed like `idle`.
    expirations: DelayQueue<u64>,

    evictor: Option<JoinHandle<()>>,

    next_key: u64,

    closed: bool,
}

struct Idle<C> {
    conn: Arc<C>,

    /// Entry in `expirations`, if the connection can be evicted.
    expiration: Option<delay_queue::Key>,
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new(addr: impl Into<String>, max_conns: usize, keep_alive: Duration) -> Self {
        Self {
            addr: addr.into(),
            max_conns,
            keep_alive,
            state: Arc::new(Mutex::new(PoolState {
                idle: BTreeMap::new(),
                expirations: DelayQueue::new(),
                evictor: None,
                next_key: 0,
                closed: false,
            })),
        }
    }

    /// Broker address this pool connects to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Returns an idle connection, or a new one from `factory` if there is none.
    pub async fn acquire<F, Fut>(&self, factory: F) -> Result<Arc<C>, RpcError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Arc<C>, RpcError>> + Send,
    {
        if let Some(conn) = self.take_idle() {
            return Ok(conn);
        }

        debug!(broker = self.addr.as_str(), "No idle connection, dialing");
        factory().await
    }

    fn take_idle(&self) -> Option<Arc<C>> {
        let mut state = self.state.lock();
        let (_, idle) = state.idle.pop_first()?;

        if let Some(expiration) = idle.expiration {
            state.expirations.try_remove(&expiration);
        }
        Some(idle.conn)
    }

    /// Gives a connection back to the pool.
    ///
    /// The connection is closed instead if the pool is full or closed.
    pub fn release(&self, conn: Arc<C>) {
        let mut state = self.state.lock();

        let full = self.max_conns != 0 && state.idle.len() >= self.max_conns;
        if state.closed || full {
            drop(state);
            debug!(
                broker = self.addr.as_str(),
                full, "Closing released connection"
            );
            conn.close();
            return;
        }

        let key = state.next_key;
        state.next_key += 1;
        let expiration = self.schedule_eviction(&mut state, key);
        state.idle.insert(key, Idle { conn, expiration });
    }

    fn schedule_eviction(&self, state: &mut PoolState<C>, key: u64) -> Option<delay_queue::Key> {
        if self.keep_alive.is_zero() {
            return None;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            debug!(
                broker = self.addr.as_str(),
                "Released outside a runtime, connection will not be evicted"
            );
            return None;
        }

        if state.evictor.is_none() {
            let evictor = evict_expired(Arc::downgrade(&self.state), self.addr.clone());
            state.evictor = Some(tokio::spawn(evictor));
        }
        Some(state.expirations.insert(key, self.keep_alive))
    }

    /// Closes every idle connection and cancels all pending evictions.
    ///
    /// Connections released afterwards are closed right away.
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            state.expirations.clear();
            if let Some(evictor) = state.evictor.take() {
                evictor.abort();
            }
            std::mem::take(&mut state.idle)
        };

        for idle in idle.into_values() {
            idle.conn.close();
        }
    }
}

/// Closes idle connections as their keep-alive runs out, until the pool is gone.
async fn evict_expired<C: Connection>(state: Weak<Mutex<PoolState<C>>>, addr: String) {
    loop {
        let expired = poll_fn(|cx| {
            let Some(state) = state.upgrade() else {
                return Poll::Ready(None);
            };
            let mut state = state.lock();

            // An empty queue keeps the waker and wakes us on the next insert.
            while let Poll::Ready(Some(expired)) = state.expirations.poll_expired(cx) {
                if let Some(idle) = state.idle.remove(expired.get_ref()) {
                    return Poll::Ready(Some(idle));
                }
            }
            Poll::Pending
        })
        .await;

        let Some(idle) = expired else {
            return;
        };
        debug!(broker = addr.as_str(), "Closing idle connection");
        idle.conn.close();
    }
}

impl<C> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        if let Some(evictor) = self.state.lock().evictor.take() {
            evictor.abort();
        }
    }
}

impl<C> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.addr)
            .field("max_conns", &self.max_conns)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}
