//! Keep-alive connection pool for HTTP/1.x.
//!
//! A socket is either idle in the pool or leased to exactly one
//! in-flight request. Leases are explicit: `acquire` (or `register`, for
//! a socket negotiated elsewhere and handed to the transport) hands out a
//! [`Lease`] that is settled with `checkin` or `discard`; a lease dropped
//! any other way (an abandoned request future) releases its accounting
//! slot without pooling a socket.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::alpn::Origin;
use crate::transport::connector::MaybeTlsStream;

/// Order in which idle sockets are handed back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheduling {
    /// Oldest idle socket first.
    #[default]
    Fifo,
    /// Most recently parked socket first.
    Lifo,
}

/// HTTP/1 pool tunables.
#[derive(Debug, Clone)]
pub struct H1Options {
    /// Reuse connections across requests.
    pub keep_alive: bool,
    /// Freshness window for an idle socket when `timeout` is unset.
    pub keep_alive_msecs: Duration,
    /// Maximum sockets per origin, leased plus idle. `None` = unbounded.
    pub max_sockets: Option<usize>,
    /// Maximum sockets across all origins. `None` = unbounded.
    pub max_total_sockets: Option<usize>,
    /// Maximum idle sockets kept across all origins.
    pub max_free_sockets: usize,
    /// Idle socket expiry; overrides `keep_alive_msecs` when set.
    pub timeout: Option<Duration>,
    /// Idle socket scheduling.
    pub scheduling: Scheduling,
}

impl Default for H1Options {
    fn default() -> Self {
        Self {
            keep_alive: true,
            keep_alive_msecs: Duration::from_millis(1000),
            max_sockets: None,
            max_total_sockets: None,
            max_free_sockets: 256,
            timeout: None,
            scheduling: Scheduling::Fifo,
        }
    }
}

impl H1Options {
    fn idle_expiry(&self) -> Duration {
        self.timeout.unwrap_or(self.keep_alive_msecs)
    }
}

/// Accounting token for one leased socket.
#[derive(Debug)]
pub struct Lease {
    origin: Origin,
    epoch: u64,
    pool: Weak<PoolShared>,
    settled: bool,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // The request future was abandoned; give the slot back so
        // capacity-bounded pools do not starve.
        if let Some(shared) = self.pool.upgrade() {
            let mut inner = shared.inner.lock().expect("pool mutex poisoned");
            release_locked(&mut inner, &self.origin);
            drop(inner);
            shared.released.notify_waiters();
        }
    }
}

struct IdleConn {
    stream: MaybeTlsStream,
    parked_at: Instant,
}

struct PoolInner {
    idle: HashMap<Origin, VecDeque<IdleConn>>,
    leased: HashMap<Origin, usize>,
    idle_total: usize,
    leased_total: usize,
    /// Bumped by `clear()`; leases from an earlier epoch may finish their
    /// request but their socket is never pooled again.
    epoch: u64,
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    released: Notify,
    options: H1Options,
}

/// The pool.
pub struct H1Pool {
    shared: Arc<PoolShared>,
}

impl H1Pool {
    /// Create a pool.
    pub fn new(options: H1Options) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(PoolInner {
                    idle: HashMap::new(),
                    leased: HashMap::new(),
                    idle_total: 0,
                    leased_total: 0,
                    epoch: 0,
                }),
                released: Notify::new(),
                options,
            }),
        }
    }

    /// The configured tunables.
    pub fn options(&self) -> &H1Options {
        &self.shared.options
    }

    /// Lease a socket for an origin. Returns an idle socket when one is
    /// fresh, or `None` when the caller should establish its own
    /// connection. Waits when `max_sockets`/`max_total_sockets` are
    /// exhausted until a lease is released.
    pub async fn acquire(&self, origin: &Origin) -> (Lease, Option<MaybeTlsStream>) {
        let options = &self.shared.options;
        loop {
            let released = self.shared.released.notified();
            {
                let mut inner = self.shared.inner.lock().expect("pool mutex poisoned");
                prune_locked(&mut inner, origin, options.idle_expiry());

                if let Some(stream) = pop_idle_locked(&mut inner, origin, options.scheduling)
                {
                    return (self.lease_locked(&mut inner, origin), Some(stream));
                }

                let per_origin = inner.leased.get(origin).copied().unwrap_or(0)
                    + inner.idle.get(origin).map(|q| q.len()).unwrap_or(0);
                let total = inner.leased_total + inner.idle_total;
                let under_origin_cap =
                    options.max_sockets.map(|m| per_origin < m).unwrap_or(true);
                let under_total_cap = options
                    .max_total_sockets
                    .map(|m| total < m)
                    .unwrap_or(true);

                if under_origin_cap && under_total_cap {
                    return (self.lease_locked(&mut inner, origin), None);
                }
            }
            released.await;
        }
    }

    /// Bill a socket that was negotiated outside the pool (the ALPN
    /// handoff path) against this pool's accounting.
    pub fn register(&self, origin: &Origin) -> Lease {
        let mut inner = self.shared.inner.lock().expect("pool mutex poisoned");
        self.lease_locked(&mut inner, origin)
    }

    /// Return a leased socket. It is parked for reuse when `reusable`,
    /// keep-alive is enabled, the free-socket cap has room, and the pool
    /// was not cleared since the lease was taken; otherwise it is closed
    /// by drop.
    pub fn checkin(&self, mut lease: Lease, stream: MaybeTlsStream, reusable: bool) {
        lease.settled = true;
        let mut inner = self.shared.inner.lock().expect("pool mutex poisoned");
        release_locked(&mut inner, &lease.origin);

        let poolable = reusable
            && self.shared.options.keep_alive
            && lease.epoch == inner.epoch
            && inner.idle_total < self.shared.options.max_free_sockets;
        if poolable {
            inner
                .idle
                .entry(lease.origin.clone())
                .or_default()
                .push_back(IdleConn {
                    stream,
                    parked_at: Instant::now(),
                });
            inner.idle_total += 1;
        }
        drop(inner);
        self.shared.released.notify_waiters();
    }

    /// Settle a lease whose socket died (error, abort, or never opened).
    pub fn discard(&self, mut lease: Lease) {
        lease.settled = true;
        let mut inner = self.shared.inner.lock().expect("pool mutex poisoned");
        release_locked(&mut inner, &lease.origin);
        drop(inner);
        self.shared.released.notify_waiters();
    }

    /// Close every idle socket and invalidate outstanding leases' right
    /// to pool theirs. Leased sockets belong to in-flight requests and
    /// are closed as those settle.
    pub fn clear(&self) {
        let mut inner = self.shared.inner.lock().expect("pool mutex poisoned");
        inner.idle.clear();
        inner.idle_total = 0;
        inner.epoch += 1;
        drop(inner);
        self.shared.released.notify_waiters();
    }

    /// Number of idle sockets parked for an origin.
    pub fn idle_count(&self, origin: &Origin) -> usize {
        let inner = self.shared.inner.lock().expect("pool mutex poisoned");
        inner.idle.get(origin).map(|q| q.len()).unwrap_or(0)
    }

    /// Number of sockets currently leased for an origin.
    pub fn leased_count(&self, origin: &Origin) -> usize {
        let inner = self.shared.inner.lock().expect("pool mutex poisoned");
        inner.leased.get(origin).copied().unwrap_or(0)
    }

    /// Total sockets tracked by the pool, idle plus leased.
    pub fn total_count(&self) -> usize {
        let inner = self.shared.inner.lock().expect("pool mutex poisoned");
        inner.idle_total + inner.leased_total
    }

    fn lease_locked(&self, inner: &mut PoolInner, origin: &Origin) -> Lease {
        *inner.leased.entry(origin.clone()).or_insert(0) += 1;
        inner.leased_total += 1;
        Lease {
            origin: origin.clone(),
            epoch: inner.epoch,
            pool: Arc::downgrade(&self.shared),
            settled: false,
        }
    }
}

fn release_locked(inner: &mut PoolInner, origin: &Origin) {
    if let Some(count) = inner.leased.get_mut(origin) {
        *count -= 1;
        if *count == 0 {
            inner.leased.remove(origin);
        }
    }
    inner.leased_total = inner.leased_total.saturating_sub(1);
}

fn pop_idle_locked(
    inner: &mut PoolInner,
    origin: &Origin,
    scheduling: Scheduling,
) -> Option<MaybeTlsStream> {
    let queue = inner.idle.get_mut(origin)?;
    let conn = match scheduling {
        Scheduling::Fifo => queue.pop_front(),
        Scheduling::Lifo => queue.pop_back(),
    }?;
    if queue.is_empty() {
        inner.idle.remove(origin);
    }
    inner.idle_total -= 1;
    Some(conn.stream)
}

fn prune_locked(inner: &mut PoolInner, origin: &Origin, expiry: Duration) {
    let Some(queue) = inner.idle.get_mut(origin) else {
        return;
    };
    let before = queue.len();
    queue.retain(|c| c.parked_at.elapsed() < expiry);
    let removed = before - queue.len();
    if queue.is_empty() {
        inner.idle.remove(origin);
    }
    inner.idle_total -= removed;
}
