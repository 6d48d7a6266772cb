//! Counters for the dispatch stack.
//!
//! A [`StatsReceiver`] accepts increments keyed by a label path such as
//! `["client", "tries", "requests"]`. Counters are monotonic; there is no decrement.
//!
//! The client records:
//!
//! - `{label, "tries", "requests"}` once per top-level call, however many attempts it took.
//! - `{label, "requests"}` once per pass through the balancer.
//! - `{label, "retries", "requeues"}` / `{label, "retries", "policy"}` per re-dispatch.
//! - `{label, "failure_accrual", "removals" | "revivals" | "probes"}` on accrual transitions.
//! - `{label, "pool", "rejected"}` when a pool turns an acquisition away.
//!
//! [`StatsLayer`] is how the two headline counters are wired into the tower stack:
//!
//! ```rust
//! use std::sync::Arc;
//! use dispatchline::stats::{InMemoryStatsReceiver, ScopedStats, StatsLayer};
//! use tower::{service_fn, Service, ServiceBuilder, ServiceExt};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let receiver = InMemoryStatsReceiver::new();
//! let stats = ScopedStats::new(Arc::new(receiver.clone()), "client");
//! let mut svc = ServiceBuilder::new()
//!     .layer(StatsLayer::new(stats, &["requests"]))
//!     .service(service_fn(|n: u32| async move { Ok::<_, std::convert::Infallible>(n) }));
//!
//! svc.ready().await.unwrap().call(1).await.unwrap();
//! assert_eq!(receiver.counter(&["client", "requests"]), 1);
//! # }
//! ```

use crate::status::{Availability, Status};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Sink for counter increments.
pub trait StatsReceiver: Send + Sync + fmt::Debug {
    fn increment(&self, path: &[&str]);
}

/// Discards every increment.
#[derive(Clone, Debug, Default)]
pub struct NullStatsReceiver;

impl StatsReceiver for NullStatsReceiver {
    fn increment(&self, _path: &[&str]) {}
}

/// Forwards increments to `tracing` at trace level.
#[derive(Clone, Debug, Default)]
pub struct LogStatsReceiver;

impl StatsReceiver for LogStatsReceiver {
    fn increment(&self, path: &[&str]) {
        tracing::trace!(counter = %path.join("/"), "stat_increment");
    }
}

/// Keeps counters in memory. Clones share the same counters.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStatsReceiver {
    counters: Arc<Mutex<HashMap<Vec<String>, u64>>>,
}

impl InMemoryStatsReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter; 0 if it was never incremented.
    pub fn counter(&self, path: &[&str]) -> u64 {
        let key: Vec<String> = path.iter().map(|s| (*s).to_owned()).collect();
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).get(&key).copied().unwrap_or(0)
    }

    /// Every counter, keyed by `/`-joined path.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.join("/"), *v))
            .collect()
    }
}

impl StatsReceiver for InMemoryStatsReceiver {
    fn increment(&self, path: &[&str]) {
        let key = path.iter().map(|s| (*s).to_owned()).collect();
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(key).or_insert(0) += 1;
    }
}

/// Sends every increment to two receivers.
#[derive(Clone, Debug)]
pub struct BroadcastStatsReceiver<A, B> {
    a: A,
    b: B,
}

impl<A, B> BroadcastStatsReceiver<A, B> {
    pub fn new(a: A, b: B) -> Self {
        Self { a, b }
    }
}

impl<A: StatsReceiver, B: StatsReceiver> StatsReceiver for BroadcastStatsReceiver<A, B> {
    fn increment(&self, path: &[&str]) {
        self.a.increment(path);
        self.b.increment(path);
    }
}

/// A receiver plus the label prefix every increment is recorded under.
#[derive(Clone)]
pub struct ScopedStats {
    receiver: Arc<dyn StatsReceiver>,
    prefix: Arc<[String]>,
}

impl ScopedStats {
    pub fn new(receiver: Arc<dyn StatsReceiver>, label: impl Into<String>) -> Self {
        Self { receiver, prefix: Arc::from(vec![label.into()]) }
    }

    pub fn null() -> Self {
        Self { receiver: Arc::new(NullStatsReceiver), prefix: Arc::from(Vec::new()) }
    }

    /// Extend the prefix by one segment.
    pub fn scope(&self, segment: impl Into<String>) -> Self {
        let mut prefix = self.prefix.to_vec();
        prefix.push(segment.into());
        Self { receiver: Arc::clone(&self.receiver), prefix: Arc::from(prefix) }
    }

    pub fn increment(&self, path: &[&str]) {
        let full: Vec<&str> =
            self.prefix.iter().map(String::as_str).chain(path.iter().copied()).collect();
        self.receiver.increment(&full);
    }
}

impl fmt::Debug for ScopedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedStats")
            .field("receiver", &self.receiver)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Layer that counts every call made through it.
#[derive(Clone, Debug)]
pub struct StatsLayer {
    stats: ScopedStats,
    path: Arc<[&'static str]>,
}

impl StatsLayer {
    pub fn new(stats: ScopedStats, path: &[&'static str]) -> Self {
        Self { stats, path: Arc::from(path) }
    }
}

impl<S> Layer<S> for StatsLayer {
    type Service = StatsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        StatsService { inner, stats: self.stats.clone(), path: Arc::clone(&self.path) }
    }
}

/// Service produced by [`StatsLayer`]. Increments once per `call`, before the inner service runs.
#[derive(Clone, Debug)]
pub struct StatsService<S> {
    inner: S,
    stats: ScopedStats,
    path: Arc<[&'static str]>,
}

impl<S, Req> Service<Req> for StatsService<S>
where
    S: Service<Req>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.stats.increment(&self.path);
        self.inner.call(req)
    }
}

impl<S: Availability> Availability for StatsService<S> {
    fn status(&self) -> Status {
        self.inner.status()
    }
}
