#![allow(dead_code)]

use async_trait::async_trait;
use dispatchline::context::{AmbientContext, ContextKey};
use dispatchline::stats::InMemoryStatsReceiver;
use dispatchline::{
    BoxConnection, ClientBuilder, Codec, Connection, DispatchError, EndpointDescriptor,
    RoundRobin, ServiceFactory, SharedFactory, Status,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub static TRACE_ID: ContextKey<String> = ContextKey::new("trace_id");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Echo,
    /// Refused before anything was written.
    Pending,
    /// Reset after the request was written.
    Ambiguous,
    /// Never answers.
    Hang,
    /// Echo after a delay.
    Slow(Duration),
}

#[derive(Debug)]
struct State {
    mode: Mutex<Mode>,
    fail_next: AtomicUsize,
    acquired: AtomicUsize,
    dispatched: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
    closes: AtomicUsize,
    closed: AtomicBool,
    trace_ids: Mutex<Vec<Option<String>>>,
}

/// In-process endpoint standing in for a codec's leaf factory.
#[derive(Debug, Clone)]
pub struct FakeEndpoint {
    state: Arc<State>,
}

impl FakeEndpoint {
    pub fn new(mode: Mode) -> Self {
        Self {
            state: Arc::new(State {
                mode: Mutex::new(mode),
                fail_next: AtomicUsize::new(0),
                acquired: AtomicUsize::new(0),
                dispatched: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                trace_ids: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.state.mode.lock().unwrap() = mode;
    }

    /// The next `n` dispatches fail as pending, whatever the mode.
    pub fn fail_next(&self, n: usize) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.state.acquired.load(Ordering::SeqCst)
    }

    pub fn dispatched(&self) -> usize {
        self.state.dispatched.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Trace id seen by each dispatch, in order.
    pub fn trace_ids(&self) -> Vec<Option<String>> {
        self.state.trace_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceFactory<u32, u32> for FakeEndpoint {
    async fn acquire(&self) -> Result<BoxConnection<u32, u32>, DispatchError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Closed);
        }
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(FakeConnection { state: Arc::clone(&self.state) }))
    }

    fn status(&self) -> Status {
        if self.state.closed.load(Ordering::SeqCst) {
            Status::Closed
        } else {
            Status::Open
        }
    }

    async fn close(&self, _deadline: Instant) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

struct FakeConnection {
    state: Arc<State>,
}

#[async_trait]
impl Connection<u32, u32> for FakeConnection {
    async fn dispatch(&self, req: u32) -> Result<u32, DispatchError> {
        self.state.dispatched.fetch_add(1, Ordering::SeqCst);
        let trace_id = AmbientContext::current().get(&TRACE_ID).map(|id| id.to_string());
        self.state.trace_ids.lock().unwrap().push(trace_id);

        let forced = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Err(DispatchError::pending("connection refused"));
        }
        let mode = *self.state.mode.lock().unwrap();
        match mode {
            Mode::Echo => Ok(req),
            Mode::Pending => Err(DispatchError::pending("connection refused")),
            Mode::Ambiguous => Err(DispatchError::ambiguous("connection reset")),
            Mode::Hang => futures::future::pending().await,
            Mode::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(req)
            }
        }
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Codec handing out one [`FakeEndpoint`] per address; unknown addresses start in `Echo`.
#[derive(Debug, Clone, Default)]
pub struct FakeCodec {
    endpoints: Arc<Mutex<HashMap<String, FakeEndpoint>>>,
}

impl FakeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, address: &str, mode: Mode) -> Self {
        self.endpoint(address).set_mode(mode);
        self
    }

    pub fn endpoint(&self, address: &str) -> FakeEndpoint {
        self.endpoints
            .lock()
            .unwrap()
            .entry(address.to_owned())
            .or_insert_with(|| FakeEndpoint::new(Mode::Echo))
            .clone()
    }
}

impl Codec<u32, u32> for FakeCodec {
    fn prepare_connection_factory(&self, endpoint: &EndpointDescriptor) -> SharedFactory<u32, u32> {
        Arc::new(self.endpoint(endpoint.address()))
    }
}

/// Builder with the usual test topology: one connection per endpoint, round-robin selection.
pub fn builder(codec: &FakeCodec, receiver: &InMemoryStatsReceiver) -> ClientBuilder<u32, u32> {
    ClientBuilder::new()
        .label("client")
        .host_connection_limit(1)
        .selector(RoundRobin::new())
        .stats_receiver(receiver.clone())
        .codec(codec.clone())
}

pub fn tries(receiver: &InMemoryStatsReceiver) -> u64 {
    receiver.counter(&["client", "tries", "requests"])
}

pub fn requests(receiver: &InMemoryStatsReceiver) -> u64 {
    receiver.counter(&["client", "requests"])
}

pub fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(1)
}
