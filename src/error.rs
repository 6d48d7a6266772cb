//! Error types for the dispatch stack.
//!
//! Every layer resolves a call with a [`DispatchError`]; nothing in the stack is fatal to the
//! process. The variants mirror how far a request got before it failed, which is what the
//! requeue and retry layers key their decisions on:
//!
//! - [`DispatchError::TransportPending`]: failed before any bytes reached the peer. Safe to
//!   requeue automatically.
//! - [`DispatchError::TransportAmbiguous`] / [`DispatchError::Application`]: the peer may have
//!   seen the request. Only a retry policy that explicitly matches them re-issues the call.
//! - [`DispatchError::NoEndpointsAvailable`], [`DispatchError::PoolExhausted`],
//!   [`DispatchError::EndpointBusy`], [`DispatchError::Closed`]: rejected locally.
//! - [`DispatchError::Cancelled`]: the caller gave up.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure resolving a dispatch.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The transport failed before the request was written.
    #[error("transport failed before the request was written: {reason}")]
    TransportPending {
        /// Transport-provided description.
        reason: Arc<str>,
    },
    /// The transport failed after the request may have reached the peer.
    #[error("transport failed after the request may have been written: {reason}")]
    TransportAmbiguous {
        /// Transport-provided description.
        reason: Arc<str>,
    },
    /// The peer answered with a domain-level failure.
    #[error("application failure: {0}")]
    Application(Arc<dyn std::error::Error + Send + Sync + 'static>),
    /// The balancer had no Open or Busy endpoint to offer.
    #[error("no endpoints available")]
    NoEndpointsAvailable,
    /// The connection pool is at its limit and its wait queue is full.
    #[error("connection pool exhausted ({limit} connections, {queue_depth} waiters)")]
    PoolExhausted {
        /// Configured connection limit.
        limit: usize,
        /// Configured wait queue depth.
        queue_depth: usize,
    },
    /// Failure accrual marked the endpoint busy and rejected the acquisition without touching
    /// the transport.
    #[error(
        "endpoint {endpoint} is busy after {consecutive_failures} consecutive failures \
         (probe in {remaining:?})"
    )]
    EndpointBusy {
        /// Address of the rejecting endpoint.
        endpoint: Arc<str>,
        /// Consecutive failures observed when the endpoint was marked.
        consecutive_failures: usize,
        /// Time left until a probe is admitted; zero while a probe is in flight.
        remaining: Duration,
    },
    /// The factory or client has been closed.
    #[error("service closed")]
    Closed,
    /// The caller cancelled the call.
    #[error("dispatch cancelled")]
    Cancelled,
}

/// Coarse classification of a [`DispatchError`], handy for retry predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    TransportPending,
    TransportAmbiguous,
    Application,
    NoEndpointsAvailable,
    PoolExhausted,
    EndpointBusy,
    Closed,
    Cancelled,
}

impl DispatchError {
    /// Transport failure known to have happened before the request was written.
    pub fn pending(reason: impl Into<Arc<str>>) -> Self {
        Self::TransportPending { reason: reason.into() }
    }

    /// Transport failure after the request may have been written.
    pub fn ambiguous(reason: impl Into<Arc<str>>) -> Self {
        Self::TransportAmbiguous { reason: reason.into() }
    }

    /// Wrap a domain-level error returned by the peer.
    pub fn application<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Application(Arc::new(err))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::TransportPending { .. } => FailureKind::TransportPending,
            Self::TransportAmbiguous { .. } => FailureKind::TransportAmbiguous,
            Self::Application(_) => FailureKind::Application,
            Self::NoEndpointsAvailable => FailureKind::NoEndpointsAvailable,
            Self::PoolExhausted { .. } => FailureKind::PoolExhausted,
            Self::EndpointBusy { .. } => FailureKind::EndpointBusy,
            Self::Closed => FailureKind::Closed,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Whether the requeue layer may re-dispatch this failure on its own.
    ///
    /// Only failures that never reached the peer qualify: a transport-pending write failure,
    /// or a fail-fast rejection from an endpoint that failure accrual marked busy.
    pub fn is_requeueable(&self) -> bool {
        matches!(self, Self::TransportPending { .. } | Self::EndpointBusy { .. })
    }

    /// Whether the request certainly never reached a peer. The default retry policy retries
    /// exactly these.
    pub fn is_safe_to_retry(&self) -> bool {
        matches!(
            self,
            Self::TransportPending { .. }
                | Self::EndpointBusy { .. }
                | Self::NoEndpointsAvailable
                | Self::PoolExhausted { .. }
        )
    }

    /// Rejections produced inside the client without consulting the endpoint. Failure accrual
    /// ignores these.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::NoEndpointsAvailable
                | Self::PoolExhausted { .. }
                | Self::EndpointBusy { .. }
                | Self::Closed
                | Self::Cancelled
        )
    }

    pub fn is_transport_pending(&self) -> bool {
        matches!(self, Self::TransportPending { .. })
    }

    pub fn is_endpoint_busy(&self) -> bool {
        matches!(self, Self::EndpointBusy { .. })
    }

    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Invalid client or component configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `host_connection_limit` must be > 0.
    #[error("host_connection_limit must be > 0 (got {0})")]
    InvalidConnectionLimit(usize),
    /// `num_failures` must be > 0.
    #[error("num_failures must be > 0 (got {0})")]
    InvalidFailureThreshold(usize),
    /// The accrual backoff must produce a non-zero first delay.
    #[error("accrual backoff must be > 0")]
    InvalidAccrualBackoff,
    /// `max_attempts` must be > 0.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    /// The stats label must not be empty.
    #[error("client label must not be empty")]
    EmptyLabel,
    /// A client needs a codec to turn endpoints into factories.
    #[error("no codec configured")]
    MissingCodec,
    /// Backoff construction failed.
    #[error(transparent)]
    Backoff(#[from] crate::backoff::BackoffError),
}
