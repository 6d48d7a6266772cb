//! Policy-driven retries of whole dispatches.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (the initial try plus retries). `1` disables retries.
//! - The policy predicate sees the full outcome, success or failure, and decides whether the
//!   call is worth repeating. The default retries only failures that certainly never reached a
//!   peer ([`DispatchError::is_safe_to_retry`]).
//! - When the budget is spent or the predicate declines, the last outcome is returned unchanged.
//! - The backoff is consulted once per retry (`delay(1)` before the second attempt) and the
//!   sleeper applies it. Zero delays skip the sleeper entirely.
//!
//! [`RetryLayer`] wraps the requeue layer, so every retry is a fresh pass through requeue and
//! balancer, made under the ambient context captured when the call entered.
//!
//! ```rust
//! use dispatchline::{DispatchError, RetryPolicy};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<u32>::builder()
//!     .max_attempts(3)
//!     .retry_on(|e| matches!(e, DispatchError::TransportAmbiguous { .. }))
//!     .build()
//!     .unwrap();
//! let mut calls = 0;
//! let result = policy
//!     .execute(|| {
//!         calls += 1;
//!         let n = calls;
//!         async move { if n < 3 { Err(DispatchError::ambiguous("reset")) } else { Ok(n) } }
//!     })
//!     .await;
//! assert_eq!(result.unwrap(), 3);
//! # });
//! ```

use crate::backoff::Backoff;
use crate::context::capture;
use crate::error::{ConfigError, DispatchError};
use crate::requeue::attempt;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stats::ScopedStats;
use crate::status::{Availability, Status};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Decides whether an outcome should be retried.
pub type RetryPredicate<Rep> =
    Arc<dyn Fn(Result<&Rep, &DispatchError>) -> bool + Send + Sync + 'static>;

/// Retry budget, predicate, and pacing.
pub struct RetryPolicy<Rep> {
    max_attempts: usize,
    backoff: Backoff,
    should_retry: RetryPredicate<Rep>,
    sleeper: Arc<dyn Sleeper>,
}

impl<Rep> Clone for RetryPolicy<Rep> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            should_retry: Arc::clone(&self.should_retry),
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<Rep> fmt::Debug for RetryPolicy<Rep> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

fn safe_failures<Rep: 'static>() -> RetryPredicate<Rep> {
    Arc::new(|outcome: Result<&Rep, &DispatchError>| {
        matches!(outcome, Err(err) if err.is_safe_to_retry())
    })
}

impl<Rep: 'static> RetryPolicy<Rep> {
    pub fn builder() -> RetryPolicyBuilder<Rep> {
        RetryPolicyBuilder::new()
    }

    /// A single attempt, never retried.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::none(),
            should_retry: safe_failures(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Delay before the next attempt, given that `attempts` have been made and the last one
    /// produced `outcome`. `None` means stop and return `outcome`.
    pub fn next_delay(
        &self,
        attempts: usize,
        outcome: Result<&Rep, &DispatchError>,
    ) -> Option<Duration> {
        if attempts >= self.max_attempts || !(self.should_retry)(outcome) {
            return None;
        }
        Some(self.backoff.delay(attempts))
    }

    async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            self.sleeper.sleep(delay).await;
        }
    }

    /// Run `operation` under this policy.
    pub async fn execute<Fut, Op>(&self, mut operation: Op) -> Result<Rep, DispatchError>
    where
        Fut: Future<Output = Result<Rep, DispatchError>>,
        Op: FnMut() -> Fut,
    {
        let mut attempts = 1;
        loop {
            let outcome = operation().await;
            match self.next_delay(attempts, outcome.as_ref()) {
                None => return outcome,
                Some(delay) => {
                    self.pause(delay).await;
                    attempts += 1;
                }
            }
        }
    }
}

impl<Rep: 'static> Default for RetryPolicy<Rep> {
    fn default() -> Self {
        Self::none()
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder<Rep> {
    max_attempts: usize,
    backoff: Backoff,
    should_retry: RetryPredicate<Rep>,
    sleeper: Arc<dyn Sleeper>,
}

impl<Rep: 'static> RetryPolicyBuilder<Rep> {
    /// Three attempts, no delay between them, retrying failures that never reached a peer.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::none(),
            should_retry: safe_failures(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Retry failures matching `predicate`; successes are never retried.
    pub fn retry_on<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&DispatchError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(move |outcome: Result<&Rep, &DispatchError>| {
            matches!(outcome, Err(err) if predicate(err))
        });
        self
    }

    /// Retry any outcome matching `predicate`, including successful responses.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(Result<&Rep, &DispatchError>) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy<Rep>, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<Rep: 'static> Default for RetryPolicyBuilder<Rep> {
    fn default() -> Self {
        Self::new()
    }
}

/// Tower layer applying a [`RetryPolicy`].
pub struct RetryLayer<Rep> {
    policy: RetryPolicy<Rep>,
    stats: ScopedStats,
}

impl<Rep> RetryLayer<Rep> {
    /// Retries are counted as `{.., "policy"}` under `stats`.
    pub fn new(policy: RetryPolicy<Rep>, stats: ScopedStats) -> Self {
        Self { policy, stats }
    }
}

impl<Rep> Clone for RetryLayer<Rep> {
    fn clone(&self) -> Self {
        Self { policy: self.policy.clone(), stats: self.stats.clone() }
    }
}

impl<S, Rep> Layer<S> for RetryLayer<Rep> {
    type Service = RetryService<S, Rep>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService { inner, layer: self.clone() }
    }
}

/// Retry service produced by [`RetryLayer`].
pub struct RetryService<S, Rep> {
    inner: S,
    layer: RetryLayer<Rep>,
}

impl<S: Clone, Rep> Clone for RetryService<S, Rep> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S: Availability, Rep> Availability for RetryService<S, Rep> {
    fn status(&self) -> Status {
        self.inner.status()
    }
}

impl<S, Req, Rep> Service<Req> for RetryService<S, Rep>
where
    Req: Clone + Send + 'static,
    Rep: Send + 'static,
    S: Service<Req, Response = Rep, Error = DispatchError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Rep;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<Rep, DispatchError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let RetryLayer { policy, stats } = self.layer.clone();
        let mut inner = self.inner.clone();
        let ctx = capture();
        Box::pin(async move {
            let mut attempts = 1;
            loop {
                let outcome = attempt(&ctx, &mut inner, req.clone()).await;
                let Some(delay) = policy.next_delay(attempts, outcome.as_ref()) else {
                    return outcome;
                };
                stats.increment(&["policy"]);
                tracing::debug!(
                    attempt = attempts + 1,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    "retrying dispatch"
                );
                policy.pause(delay).await;
                attempts += 1;
            }
        })
    }
}
