#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # dispatchline
//!
//! Client-side request dispatch: a stack of composable service factories that sends each request
//! to one of several equivalent endpoints and survives their failures.
//!
//! ## Features
//!
//! - **Connection pools** with a per-endpoint limit and a bounded FIFO wait queue
//! - **Failure accrual** that marks an endpoint busy after consecutive failures and revives it
//!   through a single probe
//! - **Load balancing** across a refreshable endpoint set with pluggable selectors
//! - **Requeues** for failures that never reached the peer
//! - **Retry policies** bounded by attempt count, with backoff
//! - **Ambient context** captured at dispatch and restored around every attempt
//! - **Counters** for calls (`tries/requests`) and balancer passes (`requests`)
//!
//! ## Quick Start
//!
//! ```rust
//! use dispatchline::{Backoff, DispatchError, RetryPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = RetryPolicy::<u32>::builder()
//!         .max_attempts(3)
//!         .backoff(Backoff::exponential(Duration::from_millis(10)))
//!         .build()
//!         .unwrap();
//!
//!     let result = policy
//!         .execute(|| async { Err::<u32, _>(DispatchError::pending("connection refused")) })
//!         .await;
//!     assert!(result.unwrap_err().is_transport_pending());
//! }
//! ```
//!
//! See [`ClientBuilder`] for assembling the full stack.

pub mod accrual;
pub mod backoff;
pub mod balancer;
pub mod client;
pub mod clock;
pub mod context;
pub mod error;
pub mod factory;
pub mod pool;
pub mod prelude;
pub mod requeue;
pub mod retry;
pub mod sleeper;
pub mod stats;
pub mod status;

#[cfg(test)]
mod test_support;

// Re-exports
pub use accrual::{BreakerState, FailureAccrualConfig, FailureAccrualFactory};
pub use backoff::{Backoff, BackoffError};
pub use balancer::{Balancer, LeastLoaded, PowerOfTwoChoices, RoundRobin, Selector};
pub use client::{CancelHandle, Client, ClientBuilder, ClientConfig};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use context::{AmbientContext, ContextKey};
pub use error::{ConfigError, DispatchError, FailureKind};
pub use factory::{
    connection_fn, BoxConnection, Codec, Connection, EndpointDescriptor, FactoryFn,
    ServiceFactory, SharedFactory,
};
pub use pool::{ConnectionPool, PoolConfig};
pub use requeue::{RequeueLayer, RequeueService};
pub use retry::{RetryLayer, RetryPolicy, RetryPolicyBuilder, RetryService};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stats::{ScopedStats, StatsLayer, StatsReceiver};
pub use status::{Availability, Status};
