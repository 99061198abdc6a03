//! keyspace-broker - pattern-matched publish/subscribe broker
//!
//! Bridges a raw pub/sub stream (Redis `PSUBSCRIBE`, keyspace
//! notifications, or an in-process hub) into typed per-topic delivery
//! for multiple independent subscribers, with an optional transform
//! pipeline and an optional synthetic interval event source.

pub mod broker;
pub mod config;
pub mod keyspace;
pub mod pattern;
pub mod provider;
pub mod source;
pub mod transform;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use broker::{
    Broker, BrokerError, BrokerState, DecodedEvent, EventHandler, EventStream, Failure,
    FailureKind, FnHandler, SubscriptionHandle, SubscriptionId,
};
pub use config::Config;
pub use provider::{BrokerProvider, ExecutionContext};
pub use transform::{TransformError, Transforms};
