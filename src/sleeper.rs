//! Waiting between policy retries. Injected so retry tests never touch the timer.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, delay: Duration);
}

#[async_trait]
impl<S: Sleeper + ?Sized> Sleeper for Arc<S> {
    async fn sleep(&self, delay: Duration) {
        (**self).sleep(delay).await
    }
}

/// Waits on the tokio timer, so paused test time auto-advances through it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await
    }
}

/// Returns at once.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _delay: Duration) {}
}

/// Returns at once and keeps the schedule of delays a retry loop asked for.
/// Clones share the same schedule.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    schedule: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self) -> usize {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Sum of every recorded delay.
    pub fn total(&self) -> Duration {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner).iter().sum()
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, delay: Duration) {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner).push(delay);
    }
}
