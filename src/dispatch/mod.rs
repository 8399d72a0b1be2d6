//! Dispatch module — the per-function data plane
//!
//! A [`WorkerBroker`] owns a pool of workers for one function, admits
//! requests through an optional token bucket, routes them to the
//! least-loaded worker, and parks overflow in a bounded-deadline pending
//! queue that drains as workers free up.

pub mod broker;
pub mod delegate;
pub mod pending;
pub mod token_bucket;
pub mod worker;

pub use broker::{BrokerStats, QueueStatus, WorkerBroker, WorkerStats};
pub use delegate::{Delegate, MockDelegate, RequestMetadata, TriggerResponse};
pub use pending::PendingRequest;
pub use token_bucket::TokenBucket;
pub use worker::{InvokeResponse, Worker};
