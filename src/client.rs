//! Client assembly: configuration, the builder, and the dispatch entry point.
//!
//! A [`Client`] owns one balancer and the layers above it:
//!
//! ```text
//! caller
//!   → stats {label, "tries", "requests"}   once per call
//!   → retry policy                          {label, "retries", "policy"}
//!   → requeue                               {label, "retries", "requeues"}
//!   → stats {label, "requests"}             once per balancer pass
//!   → balancer
//!     → failure accrual → connection pool → codec leaf factory   (per endpoint)
//! ```
//!
//! ```rust
//! use std::sync::Arc;
//! use dispatchline::{
//!     connection_fn, BoxConnection, ClientBuilder, DispatchError, EndpointDescriptor, FactoryFn,
//!     SharedFactory,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let client = ClientBuilder::<String, String>::new()
//!     .label("echo")
//!     .host_connection_limit(4)
//!     .codec(|_: &EndpointDescriptor| -> SharedFactory<String, String> {
//!         Arc::new(FactoryFn::new(|| async {
//!             let conn: BoxConnection<String, String> =
//!                 Box::new(connection_fn(|req: String| async move { Ok(req) }));
//!             Ok::<_, DispatchError>(conn)
//!         }))
//!     })
//!     .endpoint("127.0.0.1:7000")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(client.dispatch("ping".to_string()).await.unwrap(), "ping");
//! # }
//! ```

use crate::accrual::{
    FailureAccrualConfig, FailureAccrualFactory, DEFAULT_ACCRUAL_BACKOFF, DEFAULT_NUM_FAILURES,
};
use crate::backoff::Backoff;
use crate::balancer::{Balancer, PowerOfTwoChoices, Selector};
use crate::clock::{Clock, MonotonicClock};
use crate::context::capture;
use crate::error::{ConfigError, DispatchError};
use crate::factory::{Codec, EndpointDescriptor, SharedFactory};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::requeue::{RequeueLayer, RequeueService};
use crate::retry::{RetryLayer, RetryPolicy, RetryService};
use crate::stats::{NullStatsReceiver, ScopedStats, StatsLayer, StatsReceiver, StatsService};
use crate::status::{Availability, Status};
use futures::future::{AbortHandle, Abortable, BoxFuture};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::{ServiceBuilder, ServiceExt};
use tower_service::Service;

/// Plain client settings. Everything that is not a trait object lives here.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClientConfig {
    /// First segment of every counter path.
    pub label: String,
    /// Concurrent live connections per endpoint.
    pub host_connection_limit: usize,
    /// Acquisitions allowed to wait when an endpoint is at its limit.
    pub queue_depth: usize,
    /// Consecutive failures before an endpoint is marked busy.
    pub num_failures: usize,
    /// How long a marked endpoint stays busy before it is probed.
    pub accrual_backoff: Duration,
    /// When set, the accrual backoff doubles after each failed probe up to this cap.
    pub accrual_backoff_max: Option<Duration>,
    /// Total attempts per call, including the first. Ignored when a full retry policy is set on
    /// the builder.
    pub max_attempts: usize,
    /// Optional bound on automatic requeues per attempt. Unset, the cascade stops once failure
    /// accrual leaves no endpoint open.
    pub max_requeues: Option<usize>,
    /// Marks the client as not keeping the process alive. Informational only.
    pub daemon: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            label: "client".to_owned(),
            host_connection_limit: usize::MAX,
            queue_depth: usize::MAX,
            num_failures: DEFAULT_NUM_FAILURES,
            accrual_backoff: DEFAULT_ACCRUAL_BACKOFF,
            accrual_backoff_max: None,
            max_attempts: 1,
            max_requeues: None,
            daemon: false,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.label.is_empty() {
            return Err(ConfigError::EmptyLabel);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(0));
        }
        self.pool_config()?;
        self.accrual_config()?;
        Ok(())
    }

    pub fn pool_config(&self) -> Result<PoolConfig, ConfigError> {
        PoolConfig::new(self.host_connection_limit, self.queue_depth)
    }

    pub fn accrual_config(&self) -> Result<FailureAccrualConfig, ConfigError> {
        let backoff = match self.accrual_backoff_max {
            Some(max) => Backoff::exponential(self.accrual_backoff).with_max(max)?,
            None => Backoff::constant(self.accrual_backoff),
        };
        FailureAccrualConfig::with_backoff(self.num_failures, backoff)
    }
}

/// What every endpoint added to the client is wrapped in.
struct EndpointStack<Req, Rep> {
    codec: Arc<dyn Codec<Req, Rep>>,
    pool: PoolConfig,
    accrual: FailureAccrualConfig,
    stats: ScopedStats,
    clock: Arc<dyn Clock>,
    failure_predicate: Option<crate::accrual::FailurePredicate>,
}

impl<Req, Rep> EndpointStack<Req, Rep>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    fn factory(&self, endpoint: &EndpointDescriptor) -> SharedFactory<Req, Rep> {
        let leaf = self.codec.prepare_connection_factory(endpoint);
        let pool = ConnectionPool::new(leaf, self.pool).with_stats(self.stats.clone());
        let accrual = FailureAccrualFactory::new(pool, self.accrual.clone())
            .for_endpoint(endpoint)
            .with_clock(Arc::clone(&self.clock))
            .with_stats(self.stats.clone());
        match &self.failure_predicate {
            Some(predicate) => {
                let predicate = Arc::clone(predicate);
                Arc::new(accrual.with_failure_predicate(move |err| predicate(err)))
            }
            None => Arc::new(accrual),
        }
    }
}

type Stack<Req, Rep> =
    StatsService<RetryService<RequeueService<StatsService<Balancer<Req, Rep>>>, Rep>>;

struct Inner<Req, Rep> {
    config: ClientConfig,
    stack: Stack<Req, Rep>,
    balancer: Balancer<Req, Rep>,
    endpoints: EndpointStack<Req, Rep>,
}

/// Handle to a dispatch stack. Clones share the same endpoints and state.
pub struct Client<Req, Rep> {
    inner: Arc<Inner<Req, Rep>>,
}

impl<Req, Rep> Clone for Client<Req, Rep> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<Req, Rep> fmt::Debug for Client<Req, Rep> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("balancer", &self.inner.balancer)
            .finish()
    }
}

impl<Req, Rep> Client<Req, Rep>
where
    Req: Clone + Send + 'static,
    Rep: Send + 'static,
{
    pub fn builder() -> ClientBuilder<Req, Rep> {
        ClientBuilder::new()
    }

    /// Send `req` through the stack.
    ///
    /// The ambient context is captured now, when `dispatch` is called, and installed around
    /// every attempt, however late the returned future is polled. Dropping the future cancels
    /// the outstanding attempt and any retries not yet issued.
    pub fn dispatch(&self, req: Req) -> impl Future<Output = Result<Rep, DispatchError>> + Send {
        let stack = self.inner.stack.clone();
        capture().scope(stack.oneshot(req))
    }

    /// Like [`Client::dispatch`], with a handle that can cancel the call from elsewhere.
    pub fn dispatch_cancellable(
        &self,
        req: Req,
    ) -> (impl Future<Output = Result<Rep, DispatchError>> + Send, CancelHandle) {
        let (handle, registration) = AbortHandle::new_pair();
        let call = Abortable::new(self.dispatch(req), registration);
        let call = async move {
            match call.await {
                Ok(outcome) => outcome,
                Err(_aborted) => {
                    tracing::debug!("dispatch cancelled");
                    Err(DispatchError::Cancelled)
                }
            }
        };
        (call, CancelHandle { handle })
    }

    /// Add an endpoint, wrapping the codec's factory for it in a pool and failure accrual.
    /// Returns `false` if the endpoint is already present or the client is closed.
    pub fn add_endpoint(&self, endpoint: impl Into<EndpointDescriptor>) -> bool {
        let endpoint = endpoint.into();
        if self.inner.balancer.is_closed() || self.inner.balancer.endpoints().contains(&endpoint) {
            return false;
        }
        let factory = self.inner.endpoints.factory(&endpoint);
        self.inner.balancer.add(endpoint, factory)
    }

    /// Remove an endpoint and close its factory by `deadline`.
    pub async fn remove_endpoint(&self, endpoint: &EndpointDescriptor, deadline: Instant) -> bool {
        match self.inner.balancer.remove(endpoint) {
            Some(factory) => {
                if tokio::time::timeout_at(deadline, factory.close(deadline)).await.is_err() {
                    tracing::warn!(endpoint = %endpoint, "endpoint close deadline elapsed");
                }
                true
            }
            None => false,
        }
    }

    pub fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.inner.balancer.endpoints()
    }

    /// Close every endpoint. Idempotent; resolves by `deadline` at the latest.
    pub async fn close(&self, deadline: Instant) {
        self.inner.balancer.close(deadline).await;
    }
}

impl<Req, Rep> Client<Req, Rep> {
    pub fn status(&self) -> Status {
        self.inner.balancer.status()
    }

    pub fn label(&self) -> &str {
        &self.inner.config.label
    }

    pub fn is_daemon(&self) -> bool {
        self.inner.config.daemon
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl<Req, Rep> Availability for Client<Req, Rep> {
    fn status(&self) -> Status {
        self.inner.balancer.status()
    }
}

impl<Req, Rep> Service<Req> for Client<Req, Rep>
where
    Req: Clone + Send + 'static,
    Rep: Send + 'static,
{
    type Response = Rep;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<Rep, DispatchError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        Box::pin(self.dispatch(req))
    }
}

/// Cancels one call made with [`Client::dispatch_cancellable`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    handle: AbortHandle,
}

impl CancelHandle {
    /// The call resolves with [`DispatchError::Cancelled`] unless it already finished.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_aborted()
    }
}

/// Builder for [`Client`]. Validates on [`ClientBuilder::build`].
pub struct ClientBuilder<Req, Rep> {
    config: ClientConfig,
    codec: Option<Arc<dyn Codec<Req, Rep>>>,
    retry_policy: Option<RetryPolicy<Rep>>,
    stats: Arc<dyn StatsReceiver>,
    selector: Arc<dyn Selector>,
    clock: Arc<dyn Clock>,
    failure_predicate: Option<crate::accrual::FailurePredicate>,
    endpoints: Vec<EndpointDescriptor>,
}

impl<Req, Rep> ClientBuilder<Req, Rep>
where
    Req: Clone + Send + 'static,
    Rep: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            codec: None,
            retry_policy: None,
            stats: Arc::new(NullStatsReceiver),
            selector: Arc::new(PowerOfTwoChoices),
            clock: Arc::new(MonotonicClock::default()),
            failure_predicate: None,
            endpoints: Vec::new(),
        }
    }

    /// Replace all plain settings at once.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = label.into();
        self
    }

    pub fn host_connection_limit(mut self, limit: usize) -> Self {
        self.config.host_connection_limit = limit;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.queue_depth = depth;
        self
    }

    pub fn num_failures(mut self, n: usize) -> Self {
        self.config.num_failures = n;
        self
    }

    pub fn accrual_backoff(mut self, backoff: Duration) -> Self {
        self.config.accrual_backoff = backoff;
        self
    }

    pub fn accrual_backoff_max(mut self, max: Duration) -> Self {
        self.config.accrual_backoff_max = Some(max);
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn max_requeues(mut self, n: usize) -> Self {
        self.config.max_requeues = Some(n);
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.config.daemon = daemon;
        self
    }

    pub fn codec<C>(mut self, codec: C) -> Self
    where
        C: Codec<Req, Rep> + 'static,
    {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Full retry policy; takes precedence over `max_attempts`.
    pub fn retry_policy(mut self, policy: RetryPolicy<Rep>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn stats_receiver<S>(mut self, stats: S) -> Self
    where
        S: StatsReceiver + 'static,
    {
        self.stats = Arc::new(stats);
        self
    }

    pub fn selector<S>(mut self, selector: S) -> Self
    where
        S: Selector + 'static,
    {
        self.selector = Arc::new(selector);
        self
    }

    /// Clock used for accrual deadlines.
    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Which errors count against an endpoint in failure accrual.
    pub fn failure_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&DispatchError) -> bool + Send + Sync + 'static,
    {
        self.failure_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<EndpointDescriptor>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn endpoints<I, E>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EndpointDescriptor>,
    {
        self.endpoints.extend(endpoints.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<Client<Req, Rep>, ConfigError> {
        let config = self.config;
        config.validate()?;
        let codec = self.codec.ok_or(ConfigError::MissingCodec)?;
        let retry_policy = match self.retry_policy {
            Some(policy) => policy,
            None => RetryPolicy::builder().max_attempts(config.max_attempts).build()?,
        };

        let stats = ScopedStats::new(self.stats, config.label.clone());
        let balancer = Balancer::with_selector(self.selector);
        let stack = ServiceBuilder::new()
            .layer(StatsLayer::new(stats.clone(), &["tries", "requests"]))
            .layer(RetryLayer::new(retry_policy, stats.scope("retries")))
            .layer(RequeueLayer::new(config.max_requeues, stats.scope("retries")))
            .layer(StatsLayer::new(stats.clone(), &["requests"]))
            .service(balancer.clone());

        let endpoints = EndpointStack {
            codec,
            pool: config.pool_config()?,
            accrual: config.accrual_config()?,
            stats,
            clock: self.clock,
            failure_predicate: self.failure_predicate,
        };

        tracing::info!(
            label = %config.label,
            endpoints = self.endpoints.len(),
            daemon = config.daemon,
            "client built"
        );
        let client = Client { inner: Arc::new(Inner { config, stack, balancer, endpoints }) };
        for endpoint in self.endpoints {
            client.add_endpoint(endpoint);
        }
        Ok(client)
    }
}

impl<Req, Rep> Default for ClientBuilder<Req, Rep>
where
    Req: Clone + Send + 'static,
    Rep: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
