//! Automatic re-dispatch of failures that never reached the peer.
//!
//! Sits directly above the balancer. A failure that is safe to repeat without asking the retry
//! policy (see [`DispatchError::is_requeueable`]) is sent through the balancer again, as long as:
//!
//! - the balancer below still reports `Open`, and
//! - no `max_requeues` cap is set, or fewer requeues than the cap have happened for this call.
//!
//! Once failure accrual marks the last healthy endpoint busy the balancer status drops to `Busy`
//! and the cascade stops, so a single dead endpoint costs exactly `num_failures` dispatches and
//! `N` dead endpoints cost at most `N * num_failures`.
//!
//! Each pass runs inside the ambient context captured when the call entered the layer.

use crate::context::{capture, AmbientContext};
use crate::error::DispatchError;
use crate::stats::ScopedStats;
use crate::status::{Availability, Status};
use futures::future::BoxFuture;
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// Layer producing [`RequeueService`].
#[derive(Clone, Debug)]
pub struct RequeueLayer {
    max_requeues: Option<usize>,
    stats: ScopedStats,
}

impl RequeueLayer {
    /// Requeues are counted as `{.., "requeues"}` under `stats`. With `max_requeues` unset the
    /// cascade is bounded by failure accrual alone.
    pub fn new(max_requeues: Option<usize>, stats: ScopedStats) -> Self {
        Self { max_requeues, stats }
    }
}

impl Default for RequeueLayer {
    fn default() -> Self {
        Self::new(None, ScopedStats::null())
    }
}

impl<S> Layer<S> for RequeueLayer {
    type Service = RequeueService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequeueService { inner, max_requeues: self.max_requeues, stats: self.stats.clone() }
    }
}

#[derive(Clone, Debug)]
pub struct RequeueService<S> {
    inner: S,
    max_requeues: Option<usize>,
    stats: ScopedStats,
}

impl<S: Availability> Availability for RequeueService<S> {
    fn status(&self) -> Status {
        self.inner.status()
    }
}

impl<S, Req> Service<Req> for RequeueService<S>
where
    Req: Clone + Send + 'static,
    S: Service<Req, Error = DispatchError> + Availability + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<S::Response, DispatchError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let mut inner = self.inner.clone();
        let max_requeues = self.max_requeues;
        let stats = self.stats.clone();
        let ctx = capture();
        Box::pin(async move {
            let mut requeues = 0;
            loop {
                let outcome = attempt(&ctx, &mut inner, req.clone()).await;
                match outcome {
                    Err(err)
                        if err.is_requeueable()
                            && max_requeues.map_or(true, |max| requeues < max)
                            && inner.status().is_open() =>
                    {
                        requeues += 1;
                        stats.increment(&["requeues"]);
                        tracing::trace!(requeues, error = %err, "requeueing dispatch");
                    }
                    other => return other,
                }
            }
        })
    }
}

/// One pass through `inner` with `ctx` installed.
pub(crate) async fn attempt<S, Req>(
    ctx: &AmbientContext,
    inner: &mut S,
    req: Req,
) -> Result<S::Response, S::Error>
where
    S: Service<Req>,
{
    ctx.clone().scope(async move { inner.ready().await?.call(req).await }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{Balancer, RoundRobin};
    use crate::factory::EndpointDescriptor;
    use crate::stats::InMemoryStatsReceiver;
    use crate::test_support::{Behavior, Leaf};
    use std::sync::Arc;

    fn stack(
        leaves: &[Leaf],
        max_requeues: Option<usize>,
    ) -> (RequeueService<Balancer<u32, u32>>, InMemoryStatsReceiver) {
        let receiver = InMemoryStatsReceiver::new();
        let balancer = Balancer::new(RoundRobin::new());
        for (i, leaf) in leaves.iter().enumerate() {
            balancer.add(EndpointDescriptor::new(format!("10.0.0.{i}:80")), Arc::new(leaf.clone()));
        }
        let stats = ScopedStats::new(Arc::new(receiver.clone()), "c").scope("retries");
        (RequeueLayer::new(max_requeues, stats).layer(balancer), receiver)
    }

    #[tokio::test]
    async fn requeues_pending_failures_onto_healthy_endpoint() {
        let bad = Leaf::new(Behavior::Pending);
        let good = Leaf::new(Behavior::Echo);
        let (svc, receiver) = stack(&[bad.clone(), good.clone()], None);

        assert_eq!(svc.oneshot(7).await.unwrap(), 7);
        assert_eq!(bad.dispatched(), 1);
        assert_eq!(good.dispatched(), 1);
        assert_eq!(receiver.counter(&["c", "retries", "requeues"]), 1);
    }

    #[tokio::test]
    async fn ambiguous_failures_are_not_requeued() {
        let leaf = Leaf::new(Behavior::Ambiguous);
        let (svc, receiver) = stack(&[leaf.clone()], None);
        let err = svc.oneshot(1).await.unwrap_err();
        assert!(matches!(err, DispatchError::TransportAmbiguous { .. }));
        assert_eq!(leaf.dispatched(), 1);
        assert_eq!(receiver.counter(&["c", "retries", "requeues"]), 0);
    }

    #[tokio::test]
    async fn requeue_cap_bounds_the_cascade() {
        let leaf = Leaf::new(Behavior::Pending);
        let (svc, receiver) = stack(&[leaf.clone()], Some(3));
        assert!(svc.oneshot(1).await.unwrap_err().is_transport_pending());
        assert_eq!(leaf.dispatched(), 4);
        assert_eq!(receiver.counter(&["c", "retries", "requeues"]), 3);
    }

    #[tokio::test]
    async fn stops_when_balancer_is_not_open() {
        let leaf = Leaf::new(Behavior::Pending);
        let (svc, _) = stack(&[leaf.clone()], None);
        let balancer = svc.inner.clone();
        balancer.close(tokio::time::Instant::now()).await;
        assert!(matches!(svc.oneshot(1).await, Err(DispatchError::Closed)));
        assert_eq!(leaf.dispatched(), 0);
    }
}
