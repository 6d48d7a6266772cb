//! Per-endpoint connection pool.
//!
//! Bounds how many connections to one endpoint are live at once. Acquisitions beyond
//! `host_connection_limit` wait in a FIFO queue of at most `queue_depth` entries; once that is
//! full they fail fast with [`DispatchError::PoolExhausted`].
//!
//! The bound is a tokio [`Semaphore`]: each live connection owns a permit and hands it back when
//! it is closed or dropped. Tokio's semaphore is fair, so a released permit goes to the
//! longest-waiting acquirer.

use crate::error::{ConfigError, DispatchError};
use crate::factory::{BoxConnection, Connection, ServiceFactory};
use crate::stats::ScopedStats;
use crate::status::Status;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

/// Limits for a [`ConnectionPool`]. The default is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolConfig {
    pub host_connection_limit: usize,
    pub queue_depth: usize,
}

impl PoolConfig {
    pub fn new(host_connection_limit: usize, queue_depth: usize) -> Result<Self, ConfigError> {
        if host_connection_limit == 0 {
            return Err(ConfigError::InvalidConnectionLimit(host_connection_limit));
        }
        Ok(Self { host_connection_limit, queue_depth })
    }

    pub const fn unbounded() -> Self {
        Self { host_connection_limit: usize::MAX, queue_depth: usize::MAX }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Factory wrapper enforcing [`PoolConfig`].
pub struct ConnectionPool<F> {
    underlying: F,
    semaphore: Arc<Semaphore>,
    limit: usize,
    queue_depth: usize,
    waiters: AtomicUsize,
    closed: AtomicBool,
    stats: ScopedStats,
}

impl<F> ConnectionPool<F> {
    pub fn new(underlying: F, config: PoolConfig) -> Self {
        let limit = config.host_connection_limit.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            underlying,
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            queue_depth: config.queue_depth,
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            stats: ScopedStats::null(),
        }
    }

    /// Record rejections under `stats` (as `{.., "pool", "rejected"}`).
    pub fn with_stats(mut self, stats: ScopedStats) -> Self {
        self.stats = stats.scope("pool");
        self
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.limit.saturating_sub(self.semaphore.available_permits())
    }

    /// Acquisitions currently queued for a permit.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn reserve_waiter(&self) -> Result<WaiterSlot<'_>, DispatchError> {
        let reserved = self.waiters.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < self.queue_depth).then(|| n + 1)
        });
        match reserved {
            Ok(_) => Ok(WaiterSlot { waiters: &self.waiters }),
            Err(_) => {
                self.stats.increment(&["rejected"]);
                tracing::debug!(
                    limit = self.limit,
                    queue_depth = self.queue_depth,
                    "connection pool exhausted"
                );
                Err(DispatchError::PoolExhausted { limit: self.limit, queue_depth: self.queue_depth })
            }
        }
    }

    async fn permit(&self) -> Result<OwnedSemaphorePermit, DispatchError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::Closed) => Err(DispatchError::Closed),
            Err(TryAcquireError::NoPermits) => {
                let _slot = self.reserve_waiter()?;
                Arc::clone(&self.semaphore).acquire_owned().await.map_err(|_| DispatchError::Closed)
            }
        }
    }
}

impl<F> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("limit", &self.limit)
            .field("queue_depth", &self.queue_depth)
            .field("in_use", &self.in_use())
            .field("waiters", &self.waiters())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Holds a place in the wait queue until dropped.
struct WaiterSlot<'a> {
    waiters: &'a AtomicUsize,
}

impl Drop for WaiterSlot<'_> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl<F, Req, Rep> ServiceFactory<Req, Rep> for ConnectionPool<F>
where
    F: ServiceFactory<Req, Rep>,
    Req: Send + 'static,
    Rep: Send + 'static,
{
    async fn acquire(&self) -> Result<BoxConnection<Req, Rep>, DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        let permit = self.permit().await?;
        let inner = self.underlying.acquire().await?;
        Ok(Box::new(PooledConnection { inner, permit: Mutex::new(Some(permit)) }))
    }

    fn status(&self) -> Status {
        if self.is_closed() {
            return Status::Closed;
        }
        let saturated =
            self.semaphore.available_permits() == 0 && self.waiters() >= self.queue_depth;
        let own = if saturated { Status::Busy } else { Status::Open };
        own.worst(self.underlying.status())
    }

    async fn close(&self, deadline: Instant) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.semaphore.close();
        if tokio::time::timeout_at(deadline, self.underlying.close(deadline)).await.is_err() {
            tracing::warn!(in_use = self.in_use(), "connection pool close deadline elapsed");
        }
    }
}

/// A checked-out connection. Returns its permit on close or drop.
struct PooledConnection<Req, Rep> {
    inner: BoxConnection<Req, Rep>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

#[async_trait]
impl<Req, Rep> Connection<Req, Rep> for PooledConnection<Req, Rep>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    async fn dispatch(&self, req: Req) -> Result<Rep, DispatchError> {
        self.inner.dispatch(req).await
    }

    fn status(&self) -> Status {
        self.inner.status()
    }

    async fn close(&self) {
        self.inner.close().await;
        let permit = self.permit.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(permit);
    }
}
