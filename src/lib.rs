//! # funclet
//!
//! Request-dispatch and autoscaling core for a function-as-a-service data
//! plane. Each registered function gets a broker that owns a pool of worker
//! processes and routes invocations onto them; a default controller reacts
//! to queue pressure and periodic traffic stats to expand or shrink pools
//! under a global memory budget.
//!
//! ## Architecture
//!
//! ```text
//! invoke → WorkerBroker (admission → selection → queue) → Worker → Delegate
//!             │ RequestQueueing / WorkerTrafficStats
//!             ▼
//! DefaultController → CapacityManager → WorkerLauncher / DataPlaneClient
//! ```
//!
//! ## Core Features
//!
//! - **Admission control**: per-function token bucket rate limiting
//! - **Least-loaded routing**: deterministic selection over bound workers
//! - **Pending queue**: FIFO with per-request deadlines and fast-fail
//! - **Worker lifecycle**: register → bind → serve → drain, with
//!   disposable (one-shot) worker semantics
//! - **Autoscaling**: queueing-driven expansion, idle-cycle shrink with
//!   pluggable victim selection (FIFO, FILO, LCC)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use funclet::config::FunctionProfile;
//! use funclet::dispatch::WorkerBroker;
//! use funclet::events::EventBus;
//! use funclet::observability::DispatchMetrics;
//! use std::sync::Arc;
//!
//! let (events, _rx) = EventBus::channel();
//! let metrics = Arc::new(DispatchMetrics::new());
//! let broker = WorkerBroker::new(
//!     FunctionProfile::new("echo"),
//!     false,
//!     delegate,
//!     events,
//!     metrics,
//! );
//! broker.start();
//! ```

pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod observability;

// Re-export main types
pub use control::DefaultController;
pub use dispatch::{Worker, WorkerBroker};
pub use error::{Error, Result};
pub use events::EventBus;
