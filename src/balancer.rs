//! Status-aware load balancer over per-endpoint factories.
//!
//! Each call makes exactly one dispatch:
//!
//! 1. Candidates are the members whose status is `Open`. If there are none, the `Busy` members
//!    are used instead, so an endpoint whose accrual backoff is about to expire still gets the
//!    chance to admit its probe (or fail fast).
//! 2. A [`Selector`] breaks ties among candidates by in-flight load.
//! 3. A connection is acquired from the chosen factory, the request is dispatched on it, and the
//!    connection is closed again.
//!
//! The balancer never retries; that is the requeue and retry layers' job. With no usable member
//! the call fails with [`DispatchError::NoEndpointsAvailable`].
//!
//! The endpoint set is held in an [`ArcSwap`] so it can be refreshed while calls are in flight.

pub mod selector;

pub use selector::{LeastLoaded, PowerOfTwoChoices, RoundRobin, Selector};

use crate::error::DispatchError;
use crate::factory::{EndpointDescriptor, SharedFactory};
use crate::status::{Availability, Status};
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Instant;
use tower_service::Service;

struct Node<Req, Rep> {
    endpoint: EndpointDescriptor,
    factory: SharedFactory<Req, Rep>,
    load: AtomicUsize,
}

/// Counts a dispatch against its node for as long as it is alive.
struct LoadGuard<Req, Rep> {
    node: Arc<Node<Req, Rep>>,
}

impl<Req, Rep> LoadGuard<Req, Rep> {
    fn new(node: Arc<Node<Req, Rep>>) -> Self {
        node.load.fetch_add(1, Ordering::AcqRel);
        Self { node }
    }
}

impl<Req, Rep> Drop for LoadGuard<Req, Rep> {
    fn drop(&mut self) {
        self.node.load.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Shared<Req, Rep> {
    nodes: ArcSwap<Vec<Arc<Node<Req, Rep>>>>,
    selector: Arc<dyn Selector>,
    closed: AtomicBool,
}

/// Load balancer over a refreshable set of endpoints. Clones share the same set.
pub struct Balancer<Req, Rep> {
    shared: Arc<Shared<Req, Rep>>,
}

impl<Req, Rep> Clone for Balancer<Req, Rep> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<Req, Rep> Balancer<Req, Rep>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    pub fn new<S: Selector + 'static>(selector: S) -> Self {
        Self::with_selector(Arc::new(selector))
    }

    pub fn with_selector(selector: Arc<dyn Selector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                nodes: ArcSwap::from_pointee(Vec::new()),
                selector,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Add an endpoint. Returns `false` (and leaves the set untouched) if it is already present
    /// or the balancer is closed.
    pub fn add(&self, endpoint: EndpointDescriptor, factory: SharedFactory<Req, Rep>) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut added = false;
        self.shared.nodes.rcu(|nodes| {
            if nodes.iter().any(|n| n.endpoint == endpoint) {
                added = false;
                return Arc::clone(nodes);
            }
            added = true;
            let mut next = Vec::clone(nodes);
            next.push(Arc::new(Node {
                endpoint: endpoint.clone(),
                factory: Arc::clone(&factory),
                load: AtomicUsize::new(0),
            }));
            Arc::new(next)
        });
        if added {
            tracing::debug!(endpoint = %endpoint, "balancer: endpoint added");
        }
        added
    }

    /// Remove an endpoint, handing back its factory so the caller can close it.
    ///
    /// Calls already dispatched to the endpoint finish normally.
    pub fn remove(&self, endpoint: &EndpointDescriptor) -> Option<SharedFactory<Req, Rep>> {
        let mut removed = None;
        self.shared.nodes.rcu(|nodes| {
            removed =
                nodes.iter().find(|n| &n.endpoint == endpoint).map(|n| Arc::clone(&n.factory));
            let next: Vec<_> =
                nodes.iter().filter(|n| &n.endpoint != endpoint).map(Arc::clone).collect();
            Arc::new(next)
        });
        if removed.is_some() {
            tracing::debug!(endpoint = %endpoint, "balancer: endpoint removed");
        }
        removed
    }

    pub fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.shared.nodes.load().iter().map(|n| n.endpoint.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.shared.nodes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.nodes.load().is_empty()
    }

    /// In-flight dispatches per endpoint.
    pub fn loads(&self) -> Vec<(EndpointDescriptor, usize)> {
        self.shared
            .nodes
            .load()
            .iter()
            .map(|n| (n.endpoint.clone(), n.load.load(Ordering::Acquire)))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn pick(&self) -> Result<Arc<Node<Req, Rep>>, DispatchError> {
        let nodes = self.shared.nodes.load();
        let mut open = Vec::new();
        let mut busy = Vec::new();
        for node in nodes.iter() {
            match node.factory.status() {
                Status::Open => open.push(node),
                Status::Busy => busy.push(node),
                Status::Closed => {}
            }
        }
        let candidates = if open.is_empty() { busy } else { open };
        if candidates.is_empty() {
            tracing::debug!(endpoints = nodes.len(), "balancer: no endpoints available");
            return Err(DispatchError::NoEndpointsAvailable);
        }
        let loads: Vec<usize> = candidates.iter().map(|n| n.load.load(Ordering::Acquire)).collect();
        let index = self.shared.selector.select(&loads).min(candidates.len() - 1);
        let node = Arc::clone(candidates[index]);
        tracing::trace!(endpoint = %node.endpoint, load = loads[index], "balancer: selected");
        Ok(node)
    }

    /// Dispatch `req` to one endpoint.
    pub async fn dispatch(&self, req: Req) -> Result<Rep, DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        let node = self.pick()?;
        let guard = LoadGuard::new(node);
        let conn = guard.node.factory.acquire().await?;
        let result = conn.dispatch(req).await;
        conn.close().await;
        result
    }

    /// Close every member. Idempotent; resolves once all members closed or `deadline` passed.
    pub async fn close(&self, deadline: Instant) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let nodes = self.shared.nodes.load_full();
        let closing = futures::future::join_all(nodes.iter().map(|n| n.factory.close(deadline)));
        if tokio::time::timeout_at(deadline, closing).await.is_err() {
            tracing::warn!(endpoints = nodes.len(), "balancer close deadline elapsed");
        }
    }
}

impl<Req, Rep> Default for Balancer<Req, Rep>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    fn default() -> Self {
        Self::new(PowerOfTwoChoices)
    }
}

impl<Req, Rep> fmt::Debug for Balancer<Req, Rep> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoints: Vec<String> =
            self.shared.nodes.load().iter().map(|n| n.endpoint.to_string()).collect();
        f.debug_struct("Balancer")
            .field("endpoints", &endpoints)
            .field("selector", &self.shared.selector)
            .field("closed", &self.shared.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<Req, Rep> Availability for Balancer<Req, Rep> {
    /// Best member status; `Closed` when closed or empty.
    fn status(&self) -> Status {
        if self.shared.closed.load(Ordering::Acquire) {
            return Status::Closed;
        }
        self.shared.nodes.load().iter().map(|n| n.factory.status()).fold(Status::Closed, Status::best)
    }
}

impl<Req, Rep> Service<Req> for Balancer<Req, Rep>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    type Response = Rep;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<Rep, DispatchError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let balancer = self.clone();
        Box::pin(async move { balancer.dispatch(req).await })
    }
}
