//! Convenient re-exports for common dispatchline types.
pub use crate::{
    accrual::{FailureAccrualConfig, FailureAccrualFactory},
    backoff::Backoff,
    balancer::{Balancer, LeastLoaded, PowerOfTwoChoices, RoundRobin, Selector},
    client::{CancelHandle, Client, ClientBuilder, ClientConfig},
    context::{AmbientContext, ContextKey},
    error::{ConfigError, DispatchError},
    factory::{
        connection_fn, BoxConnection, Codec, Connection, EndpointDescriptor, FactoryFn,
        ServiceFactory, SharedFactory,
    },
    pool::{ConnectionPool, PoolConfig},
    retry::{RetryLayer, RetryPolicy},
    requeue::RequeueLayer,
    stats::{InMemoryStatsReceiver, LogStatsReceiver, NullStatsReceiver, StatsReceiver},
    status::{Availability, Status},
};
