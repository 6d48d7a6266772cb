//! Connections, the factories that produce them, and the codec seam that builds leaf factories
//! for an endpoint.
//!
//! Every layer below the balancer is a [`ServiceFactory`]: the connection pool and failure
//! accrual wrap a leaf factory and pass `acquire`/`close` through, adding only their own
//! bookkeeping. `status()` is always computed on demand from the wrapper's own state and the
//! child's status.

use crate::error::DispatchError;
use crate::status::Status;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// A request/response handler bound to one live connection.
#[async_trait]
pub trait Connection<Req, Rep>: Send + Sync {
    async fn dispatch(&self, req: Req) -> Result<Rep, DispatchError>;

    fn status(&self) -> Status {
        Status::Open
    }

    /// Release the connection. Called once by whoever acquired it.
    async fn close(&self) {}
}

pub type BoxConnection<Req, Rep> = Box<dyn Connection<Req, Rep>>;

/// Produces connections to one endpoint.
#[async_trait]
pub trait ServiceFactory<Req, Rep>: Send + Sync {
    async fn acquire(&self) -> Result<BoxConnection<Req, Rep>, DispatchError>;

    fn status(&self) -> Status;

    /// Idempotent. Resolves when the factory has closed or `deadline` passes, whichever is first.
    async fn close(&self, deadline: Instant);
}

pub type SharedFactory<Req, Rep> = Arc<dyn ServiceFactory<Req, Rep>>;

#[async_trait]
impl<Req, Rep, T> ServiceFactory<Req, Rep> for Arc<T>
where
    T: ServiceFactory<Req, Rep> + ?Sized,
    Req: 'static,
    Rep: 'static,
{
    async fn acquire(&self) -> Result<BoxConnection<Req, Rep>, DispatchError> {
        (**self).acquire().await
    }

    fn status(&self) -> Status {
        (**self).status()
    }

    async fn close(&self, deadline: Instant) {
        (**self).close(deadline).await
    }
}

/// Connection built from an async closure.
pub struct ConnectionFn<F> {
    f: F,
}

impl<F> fmt::Debug for ConnectionFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFn").finish_non_exhaustive()
    }
}

/// Wrap `f` as a [`Connection`].
pub fn connection_fn<F>(f: F) -> ConnectionFn<F> {
    ConnectionFn { f }
}

#[async_trait]
impl<F, Fut, Req, Rep> Connection<Req, Rep> for ConnectionFn<F>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Rep, DispatchError>> + Send + 'static,
    Req: Send + 'static,
    Rep: Send + 'static,
{
    async fn dispatch(&self, req: Req) -> Result<Rep, DispatchError> {
        (self.f)(req).await
    }
}

/// Leaf factory built from an async closure that opens a connection.
///
/// Reports `Open` until closed; acquisitions after close fail with [`DispatchError::Closed`].
pub struct FactoryFn<F> {
    open: F,
    closed: AtomicBool,
}

impl<F> FactoryFn<F> {
    pub fn new(open: F) -> Self {
        Self { open, closed: AtomicBool::new(false) }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<F> fmt::Debug for FactoryFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryFn").field("closed", &self.is_closed()).finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut, Req, Rep> ServiceFactory<Req, Rep> for FactoryFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxConnection<Req, Rep>, DispatchError>> + Send + 'static,
    Req: Send + 'static,
    Rep: Send + 'static,
{
    async fn acquire(&self) -> Result<BoxConnection<Req, Rep>, DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        (self.open)().await
    }

    fn status(&self) -> Status {
        if self.is_closed() {
            Status::Closed
        } else {
            Status::Open
        }
    }

    async fn close(&self, _deadline: Instant) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Address of one endpoint. Immutable; the endpoint set itself is refreshed through the
/// balancer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct EndpointDescriptor {
    address: Arc<str>,
}

impl EndpointDescriptor {
    pub fn new(address: impl Into<Arc<str>>) -> Self {
        Self { address: address.into() }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn shared_address(&self) -> Arc<str> {
        Arc::clone(&self.address)
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

impl From<&str> for EndpointDescriptor {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for EndpointDescriptor {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}

/// Transport adapter: turns an endpoint into the leaf factory for it.
pub trait Codec<Req, Rep>: Send + Sync {
    fn prepare_connection_factory(&self, endpoint: &EndpointDescriptor) -> SharedFactory<Req, Rep>;
}

impl<F, Req, Rep> Codec<Req, Rep> for F
where
    F: Fn(&EndpointDescriptor) -> SharedFactory<Req, Rep> + Send + Sync,
{
    fn prepare_connection_factory(&self, endpoint: &EndpointDescriptor) -> SharedFactory<Req, Rep> {
        self(endpoint)
    }
}
