//! Failure accrual: a per-endpoint circuit breaker sitting above the connection pool.
//!
//! Each dispatch outcome is classified by a failure predicate. A qualifying failure bumps the
//! consecutive-failure counter and any other outcome resets it. Once the counter reaches
//! `num_failures` the endpoint is marked dead until `now + backoff`:
//!
//! - While dead and unexpired, `status()` is `Busy` and `acquire()` fails fast with
//!   [`DispatchError::EndpointBusy`] without reaching the pool or transport.
//! - After the deadline, exactly one acquisition is let through as a probe. Others keep failing
//!   fast until the probe resolves.
//! - A successful probe revives the endpoint and clears the counter. A failed probe marks it
//!   dead again with the next delay from the backoff schedule.
//!
//! Local rejections (pool exhaustion, closed, cancelled) are not the endpoint's fault and are
//! ignored.

use crate::backoff::Backoff;
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, DispatchError, FailureKind};
use crate::factory::{BoxConnection, Connection, EndpointDescriptor, ServiceFactory};
use crate::stats::ScopedStats;
use crate::status::Status;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const STATE_ALIVE: u8 = 0;
const STATE_DEAD: u8 = 1;
const STATE_PROBING: u8 = 2;
/// Held by the one caller that won the transition to dead while it publishes the deadline.
const STATE_MARKING: u8 = 3;

/// Default consecutive failures before an endpoint is marked dead.
pub const DEFAULT_NUM_FAILURES: usize = 5;
/// Default time an endpoint stays dead before it is probed.
pub const DEFAULT_ACCRUAL_BACKOFF: Duration = Duration::from_secs(5);

/// Where an endpoint is in the accrual lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Taking traffic.
    Alive,
    /// Marked dead; waiting for the backoff to elapse.
    Dead,
    /// One probe is in flight.
    Probing,
}

fn u8_to_state(v: u8) -> BreakerState {
    match v {
        STATE_DEAD | STATE_MARKING => BreakerState::Dead,
        STATE_PROBING => BreakerState::Probing,
        _ => BreakerState::Alive,
    }
}

/// Validated accrual thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FailureAccrualConfig {
    num_failures: usize,
    backoff: Backoff,
}

impl FailureAccrualConfig {
    /// Mark dead after `num_failures` consecutive failures, for a constant `backoff`.
    pub fn new(num_failures: usize, backoff: Duration) -> Result<Self, ConfigError> {
        Self::with_backoff(num_failures, Backoff::constant(backoff))
    }

    /// Like [`FailureAccrualConfig::new`] but with a growing schedule between failed probes.
    pub fn with_backoff(num_failures: usize, backoff: Backoff) -> Result<Self, ConfigError> {
        if num_failures == 0 {
            return Err(ConfigError::InvalidFailureThreshold(num_failures));
        }
        if backoff.initial().is_zero() {
            return Err(ConfigError::InvalidAccrualBackoff);
        }
        Ok(Self { num_failures, backoff })
    }

    pub fn num_failures(&self) -> usize {
        self.num_failures
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}

impl Default for FailureAccrualConfig {
    fn default() -> Self {
        Self {
            num_failures: DEFAULT_NUM_FAILURES,
            backoff: Backoff::constant(DEFAULT_ACCRUAL_BACKOFF),
        }
    }
}

/// Decides whether an error counts against the endpoint.
pub type FailurePredicate = Arc<dyn Fn(&DispatchError) -> bool + Send + Sync>;

/// Transport failures count; application errors mean the endpoint answered.
pub fn transport_failures() -> FailurePredicate {
    Arc::new(|err: &DispatchError| {
        matches!(err.kind(), FailureKind::TransportPending | FailureKind::TransportAmbiguous)
    })
}

#[derive(Clone)]
struct Settings {
    config: FailureAccrualConfig,
    endpoint: Arc<str>,
    clock: Arc<dyn Clock>,
    is_failure: FailurePredicate,
    stats: ScopedStats,
}

struct Tracker {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    busy_until_millis: AtomicU64,
    dead_streak: AtomicUsize,
    settings: Settings,
}

impl Tracker {
    fn new(settings: Settings) -> Self {
        Self {
            state: AtomicU8::new(STATE_ALIVE),
            consecutive_failures: AtomicUsize::new(0),
            busy_until_millis: AtomicU64::new(0),
            dead_streak: AtomicUsize::new(0),
            settings,
        }
    }

    fn now(&self) -> u64 {
        self.settings.clock.now_millis()
    }

    fn busy(&self, remaining_millis: u64) -> DispatchError {
        DispatchError::EndpointBusy {
            endpoint: Arc::clone(&self.settings.endpoint),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            remaining: Duration::from_millis(remaining_millis),
        }
    }

    /// Returns whether the caller is the probe.
    fn admit(&self) -> Result<bool, DispatchError> {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_ALIVE => return Ok(false),
                STATE_DEAD => {
                    let until = self.busy_until_millis.load(Ordering::Acquire);
                    let now = self.now();
                    if now < until {
                        return Err(self.busy(until - now));
                    }
                    if self
                        .state
                        .compare_exchange(
                            STATE_DEAD,
                            STATE_PROBING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.settings.stats.increment(&["probes"]);
                        tracing::info!(endpoint = %self.settings.endpoint, "failure accrual → probing");
                        return Ok(true);
                    }
                }
                _ => return Err(self.busy(0)),
            }
        }
    }

    fn observe(&self, outcome: Result<(), &DispatchError>, probe: bool) {
        match outcome {
            Ok(()) => self.on_success(probe),
            Err(err) if err.is_local() => {
                if probe {
                    self.release_probe();
                }
            }
            Err(err) if (self.settings.is_failure)(err) => self.on_failure(probe),
            Err(_) => self.on_success(probe),
        }
    }

    fn on_success(&self, probe: bool) {
        self.consecutive_failures.store(0, Ordering::Release);
        if probe
            && self
                .state
                .compare_exchange(STATE_PROBING, STATE_ALIVE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.dead_streak.store(0, Ordering::Release);
            self.busy_until_millis.store(0, Ordering::Release);
            self.settings.stats.increment(&["revivals"]);
            tracing::info!(endpoint = %self.settings.endpoint, "failure accrual → alive");
        }
    }

    fn on_failure(&self, probe: bool) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if probe {
            self.mark_dead(STATE_PROBING, failures);
        } else if failures >= self.settings.config.num_failures {
            self.mark_dead(STATE_ALIVE, failures);
        }
    }

    /// Failures that lose the race out of `from` (stragglers on an already dead endpoint, or a
    /// stale connection while a probe is in flight) leave the deadline alone.
    fn mark_dead(&self, from: u8, failures: usize) {
        if self
            .state
            .compare_exchange(from, STATE_MARKING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let streak = self.dead_streak.load(Ordering::Acquire) + 1;
        let delay = self.settings.config.backoff.delay(streak);
        let delay_millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.busy_until_millis.store(self.now().saturating_add(delay_millis), Ordering::Release);
        self.dead_streak.store(streak, Ordering::Release);
        self.state.store(STATE_DEAD, Ordering::Release);
        if from == STATE_ALIVE {
            self.settings.stats.increment(&["removals"]);
            tracing::warn!(
                endpoint = %self.settings.endpoint,
                failures,
                backoff = ?delay,
                "failure accrual → dead"
            );
        } else {
            tracing::warn!(
                endpoint = %self.settings.endpoint,
                failures,
                backoff = ?delay,
                "failure accrual: probe failed → dead"
            );
        }
    }

    /// Hand an unused probe back; the deadline has already passed so the next acquisition
    /// probes instead.
    fn release_probe(&self) {
        let _ = self.state.compare_exchange(
            STATE_PROBING,
            STATE_DEAD,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn status(&self) -> Status {
        match self.state.load(Ordering::Acquire) {
            STATE_ALIVE => Status::Open,
            STATE_DEAD if self.now() >= self.busy_until_millis.load(Ordering::Acquire) => {
                Status::Open
            }
            _ => Status::Busy,
        }
    }
}

/// Factory wrapper that tracks consecutive failures of one endpoint.
pub struct FailureAccrualFactory<F> {
    underlying: F,
    tracker: Arc<Tracker>,
}

impl<F> FailureAccrualFactory<F> {
    pub fn new(underlying: F, config: FailureAccrualConfig) -> Self {
        let settings = Settings {
            config,
            endpoint: Arc::from("unknown"),
            clock: Arc::new(MonotonicClock::default()),
            is_failure: transport_failures(),
            stats: ScopedStats::null(),
        };
        Self { underlying, tracker: Arc::new(Tracker::new(settings)) }
    }

    /// Configuration methods start the tracker over; call them before dispatching.
    fn reconfigure(self, f: impl FnOnce(&mut Settings)) -> Self {
        let mut settings = self.tracker.settings.clone();
        f(&mut settings);
        Self { underlying: self.underlying, tracker: Arc::new(Tracker::new(settings)) }
    }

    /// Name used in logs and [`DispatchError::EndpointBusy`].
    pub fn for_endpoint(self, endpoint: &EndpointDescriptor) -> Self {
        let address = endpoint.shared_address();
        self.reconfigure(|s| s.endpoint = address)
    }

    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.reconfigure(|s| s.clock = Arc::new(clock))
    }

    /// Replace which errors count as failures. Errors the predicate rejects count as successes.
    pub fn with_failure_predicate<P>(self, predicate: P) -> Self
    where
        P: Fn(&DispatchError) -> bool + Send + Sync + 'static,
    {
        self.reconfigure(|s| s.is_failure = Arc::new(predicate))
    }

    /// Record transitions under `stats` (as `{.., "failure_accrual", ..}`).
    pub fn with_stats(self, stats: ScopedStats) -> Self {
        let stats = stats.scope("failure_accrual");
        self.reconfigure(|s| s.stats = stats)
    }

    pub fn breaker_state(&self) -> BreakerState {
        u8_to_state(self.tracker.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> usize {
        self.tracker.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &FailureAccrualConfig {
        &self.tracker.settings.config
    }

    pub fn underlying(&self) -> &F {
        &self.underlying
    }
}

impl<F> fmt::Debug for FailureAccrualFactory<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureAccrualFactory")
            .field("endpoint", &self.tracker.settings.endpoint)
            .field("state", &self.breaker_state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

/// Returns the probe slot if the acquisition is abandoned before a connection exists.
struct ProbeGuard<'a> {
    tracker: &'a Tracker,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.release_probe();
        }
    }
}

#[async_trait]
impl<F, Req, Rep> ServiceFactory<Req, Rep> for FailureAccrualFactory<F>
where
    F: ServiceFactory<Req, Rep>,
    Req: Send + 'static,
    Rep: Send + 'static,
{
    async fn acquire(&self) -> Result<BoxConnection<Req, Rep>, DispatchError> {
        let probe = self.tracker.admit()?;
        let mut guard = ProbeGuard { tracker: &self.tracker, armed: probe };
        let acquired = self.underlying.acquire().await;
        guard.disarm();
        match acquired {
            Ok(inner) => Ok(Box::new(AccrualConnection {
                inner,
                tracker: Arc::clone(&self.tracker),
                probe: AtomicBool::new(probe),
            })),
            Err(err) => {
                self.tracker.observe(Err(&err), probe);
                Err(err)
            }
        }
    }

    fn status(&self) -> Status {
        self.tracker.status().worst(self.underlying.status())
    }

    async fn close(&self, deadline: Instant) {
        self.underlying.close(deadline).await
    }
}

/// Connection that reports its outcomes back to the tracker.
struct AccrualConnection<Req, Rep> {
    inner: BoxConnection<Req, Rep>,
    tracker: Arc<Tracker>,
    probe: AtomicBool,
}

#[async_trait]
impl<Req, Rep> Connection<Req, Rep> for AccrualConnection<Req, Rep>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    async fn dispatch(&self, req: Req) -> Result<Rep, DispatchError> {
        let result = self.inner.dispatch(req).await;
        let probe = self.probe.swap(false, Ordering::AcqRel);
        self.tracker.observe(result.as_ref().map(|_| ()), probe);
        result
    }

    fn status(&self) -> Status {
        self.inner.status()
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

impl<Req, Rep> Drop for AccrualConnection<Req, Rep> {
    fn drop(&mut self) {
        if *self.probe.get_mut() {
            self.tracker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::stats::InMemoryStatsReceiver;
    use crate::test_support::{Behavior, Leaf};

    fn accrual(
        num_failures: usize,
        backoff: Backoff,
    ) -> (FailureAccrualFactory<Leaf>, Leaf, ManualClock, InMemoryStatsReceiver) {
        let leaf = Leaf::new(Behavior::Pending);
        let clock = ManualClock::new();
        let receiver = InMemoryStatsReceiver::new();
        let factory = FailureAccrualFactory::new(
            leaf.clone(),
            FailureAccrualConfig::with_backoff(num_failures, backoff).unwrap(),
        )
        .for_endpoint(&EndpointDescriptor::new("10.0.0.7:4000"))
        .with_clock(clock.clone())
        .with_stats(ScopedStats::new(Arc::new(receiver.clone()), "c"));
        (factory, leaf, clock, receiver)
    }

    async fn dispatch_once(factory: &FailureAccrualFactory<Leaf>) -> Result<u32, DispatchError> {
        let conn = factory.acquire().await?;
        let result = conn.dispatch(1).await;
        conn.close().await;
        result
    }

    #[test]
    fn config_validation() {
        assert_eq!(
            FailureAccrualConfig::new(0, Duration::from_secs(1)),
            Err(ConfigError::InvalidFailureThreshold(0))
        );
        assert_eq!(
            FailureAccrualConfig::new(3, Duration::ZERO),
            Err(ConfigError::InvalidAccrualBackoff)
        );
        let cfg = FailureAccrualConfig::default();
        assert_eq!(cfg.num_failures(), 5);
        assert_eq!(cfg.backoff().initial(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn marks_busy_after_threshold_and_fails_fast() {
        let (factory, leaf, _clock, receiver) = accrual(3, Backoff::constant(Duration::from_secs(5)));

        for _ in 0..3 {
            assert!(dispatch_once(&factory).await.unwrap_err().is_transport_pending());
        }
        assert_eq!(factory.breaker_state(), BreakerState::Dead);
        assert_eq!(factory.status(), Status::Busy);
        assert_eq!(receiver.counter(&["c", "failure_accrual", "removals"]), 1);

        let acquired_before = leaf.acquired();
        match factory.acquire().await.err().unwrap() {
            DispatchError::EndpointBusy { endpoint, consecutive_failures, remaining } => {
                assert_eq!(&*endpoint, "10.0.0.7:4000");
                assert_eq!(consecutive_failures, 3);
                assert_eq!(remaining, Duration::from_secs(5));
            }
            other => panic!("expected EndpointBusy, got {other:?}"),
        }
        assert_eq!(leaf.acquired(), acquired_before);
    }

    #[tokio::test]
    async fn success_resets_the_streak() {
        let (factory, leaf, _clock, _) = accrual(3, Backoff::constant(Duration::from_secs(1)));
        for _ in 0..2 {
            let _ = dispatch_once(&factory).await;
        }
        leaf.set(Behavior::Echo);
        dispatch_once(&factory).await.unwrap();
        assert_eq!(factory.consecutive_failures(), 0);
        leaf.set(Behavior::Pending);
        for _ in 0..2 {
            let _ = dispatch_once(&factory).await;
        }
        assert_eq!(factory.breaker_state(), BreakerState::Alive);
        assert_eq!(factory.status(), Status::Open);
    }

    #[tokio::test]
    async fn predicate_decides_what_counts() {
        let (factory, leaf, _clock, _) = accrual(2, Backoff::constant(Duration::from_secs(1)));
        let factory = factory.with_failure_predicate(DispatchError::is_transport_pending);
        leaf.set(Behavior::Ambiguous);
        for _ in 0..5 {
            let _ = dispatch_once(&factory).await;
        }
        assert_eq!(factory.breaker_state(), BreakerState::Alive);
        assert_eq!(factory.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn acquisition_failures_count() {
        let (factory, leaf, _clock, _) = accrual(2, Backoff::constant(Duration::from_secs(1)));
        leaf.set(Behavior::Refuse);
        for _ in 0..2 {
            assert!(factory.acquire().await.is_err());
        }
        assert_eq!(factory.breaker_state(), BreakerState::Dead);
        assert_eq!(leaf.dispatched(), 0);
    }

    #[tokio::test]
    async fn single_probe_revives_endpoint() {
        let (factory, leaf, clock, receiver) =
            accrual(2, Backoff::constant(Duration::from_secs(5)));
        for _ in 0..2 {
            let _ = dispatch_once(&factory).await;
        }
        clock.advance(Duration::from_millis(4_999));
        assert_eq!(factory.status(), Status::Busy);
        clock.advance(Duration::from_millis(1));
        assert_eq!(factory.status(), Status::Open);

        leaf.set(Behavior::Echo);
        let probe = factory.acquire().await.unwrap();
        assert_eq!(factory.breaker_state(), BreakerState::Probing);
        assert_eq!(factory.status(), Status::Busy);
        let second = factory.acquire().await.err().unwrap();
        assert!(second.is_endpoint_busy());

        assert_eq!(probe.dispatch(9).await.unwrap(), 9);
        assert_eq!(factory.breaker_state(), BreakerState::Alive);
        assert_eq!(factory.consecutive_failures(), 0);
        assert_eq!(factory.status(), Status::Open);
        assert_eq!(receiver.counter(&["c", "failure_accrual", "probes"]), 1);
        assert_eq!(receiver.counter(&["c", "failure_accrual", "revivals"]), 1);
    }

    #[tokio::test]
    async fn failed_probe_backs_off_further() {
        let backoff = Backoff::exponential(Duration::from_secs(1))
            .with_max(Duration::from_secs(8))
            .unwrap();
        let (factory, _leaf, clock, receiver) = accrual(1, backoff);

        let _ = dispatch_once(&factory).await;
        clock.advance(Duration::from_secs(1));
        assert!(dispatch_once(&factory).await.unwrap_err().is_transport_pending());
        assert_eq!(factory.breaker_state(), BreakerState::Dead);

        clock.advance(Duration::from_millis(1_999));
        assert_eq!(factory.status(), Status::Busy);
        clock.advance(Duration::from_millis(1));
        assert_eq!(factory.status(), Status::Open);
        assert_eq!(receiver.counter(&["c", "failure_accrual", "removals"]), 1);
    }

    #[tokio::test]
    async fn late_failures_do_not_push_the_deadline() {
        let (factory, _leaf, clock, receiver) =
            accrual(1, Backoff::constant(Duration::from_secs(5)));
        let first = factory.acquire().await.unwrap();
        let straggler = factory.acquire().await.unwrap();

        assert!(first.dispatch(1).await.is_err());
        assert_eq!(factory.breaker_state(), BreakerState::Dead);

        clock.advance(Duration::from_millis(4_999));
        assert!(straggler.dispatch(2).await.is_err());
        assert_eq!(factory.status(), Status::Busy);
        clock.advance(Duration::from_millis(1));
        assert_eq!(factory.status(), Status::Open);
        assert_eq!(receiver.counter(&["c", "failure_accrual", "removals"]), 1);
    }

    #[tokio::test]
    async fn stale_failure_during_probe_keeps_probe_outcome() {
        let (factory, leaf, clock, _) = accrual(1, Backoff::constant(Duration::from_secs(5)));
        let stale = factory.acquire().await.unwrap();
        let _ = dispatch_once(&factory).await;
        clock.advance(Duration::from_secs(5));

        leaf.set(Behavior::Echo);
        let probe = factory.acquire().await.unwrap();
        leaf.set(Behavior::Pending);
        assert!(stale.dispatch(1).await.is_err());
        assert_eq!(factory.breaker_state(), BreakerState::Probing);

        leaf.set(Behavior::Echo);
        assert_eq!(probe.dispatch(2).await.unwrap(), 2);
        assert_eq!(factory.breaker_state(), BreakerState::Alive);
        assert_eq!(factory.status(), Status::Open);
    }

    #[tokio::test]
    async fn unused_probe_is_handed_back() {
        let (factory, leaf, clock, _) = accrual(1, Backoff::constant(Duration::from_secs(1)));
        let _ = dispatch_once(&factory).await;
        clock.advance(Duration::from_secs(1));

        leaf.set(Behavior::Echo);
        let probe = factory.acquire().await.unwrap();
        drop(probe);
        assert_eq!(factory.breaker_state(), BreakerState::Dead);
        assert_eq!(factory.status(), Status::Open);

        dispatch_once(&factory).await.unwrap();
        assert_eq!(factory.breaker_state(), BreakerState::Alive);
    }

    #[tokio::test]
    async fn concurrent_acquisitions_admit_one_probe() {
        let (factory, leaf, clock, _) = accrual(1, Backoff::constant(Duration::from_secs(1)));
        let _ = dispatch_once(&factory).await;
        clock.advance(Duration::from_secs(2));
        leaf.set(Behavior::Echo);

        let results = futures::future::join_all((0..8).map(|_| factory.acquire())).await;
        let admitted = results.iter().filter(|r| r.is_ok()).count();
        let busy = results.iter().filter(|r| matches!(r, Err(e) if e.is_endpoint_busy())).count();
        assert_eq!(admitted, 1);
        assert_eq!(busy, 7);
    }
}
