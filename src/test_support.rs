//! Fake leaf factory shared by the unit tests.

use crate::error::DispatchError;
use crate::factory::{BoxConnection, Connection, ServiceFactory};
use crate::status::Status;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    /// Connections echo the request.
    Echo,
    /// Dispatch fails before writing.
    Pending,
    /// Dispatch fails after writing.
    Ambiguous,
    /// `acquire` itself fails with a pending transport error.
    Refuse,
}

#[derive(Debug)]
struct LeafState {
    behavior: Mutex<Behavior>,
    acquired: AtomicUsize,
    dispatched: AtomicUsize,
    closes: AtomicUsize,
    closed: AtomicBool,
    stall_close: AtomicBool,
}

#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    state: Arc<LeafState>,
}

impl Leaf {
    pub(crate) fn new(behavior: Behavior) -> Self {
        Self {
            state: Arc::new(LeafState {
                behavior: Mutex::new(behavior),
                acquired: AtomicUsize::new(0),
                dispatched: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                stall_close: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn set(&self, behavior: Behavior) {
        *self.state.behavior.lock().unwrap() = behavior;
    }

    pub(crate) fn stalling_close(self) -> Self {
        self.state.stall_close.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn acquired(&self) -> usize {
        self.state.acquired.load(Ordering::SeqCst)
    }

    pub(crate) fn dispatched(&self) -> usize {
        self.state.dispatched.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    fn behavior(&self) -> Behavior {
        *self.state.behavior.lock().unwrap()
    }
}

struct LeafConnection {
    leaf: Leaf,
}

#[async_trait]
impl Connection<u32, u32> for LeafConnection {
    async fn dispatch(&self, req: u32) -> Result<u32, DispatchError> {
        self.leaf.state.dispatched.fetch_add(1, Ordering::SeqCst);
        match self.leaf.behavior() {
            Behavior::Echo | Behavior::Refuse => Ok(req),
            Behavior::Pending => Err(DispatchError::pending("connection refused")),
            Behavior::Ambiguous => Err(DispatchError::ambiguous("connection reset")),
        }
    }
}

#[async_trait]
impl ServiceFactory<u32, u32> for Leaf {
    async fn acquire(&self) -> Result<BoxConnection<u32, u32>, DispatchError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Closed);
        }
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        if self.behavior() == Behavior::Refuse {
            return Err(DispatchError::pending("connect timed out"));
        }
        Ok(Box::new(LeafConnection { leaf: self.clone() }))
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
        if self.state.stall_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}
