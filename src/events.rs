//! Control/data plane events — queueing pressure, traffic stats, and
//! container status reports
//!
//! The data plane broadcasts state transitions over an mpsc channel; the
//! default controller consumes them. There is no global event singleton:
//! every broker holds a cloned [`EventBus`] handle.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Per-worker stats reported from the data plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    /// Stable worker name
    pub name: String,
    /// Credential addressing the worker process
    pub credential: String,
    /// In-flight requests on this worker
    pub active_request_count: usize,
    /// Concurrency cap for this worker
    pub max_activate_requests: usize,
    /// Whether the worker is draining
    pub traffic_off: bool,
    /// Epoch milliseconds when the worker was registered
    pub register_time_ms: u64,
}

/// Per-broker stats reported from the data plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    /// Function name
    pub function_name: String,
    /// Whether this is a debugger (inspector) pool
    pub inspector: bool,
    /// Whether workers serve one request then drain
    pub disposable: bool,
    /// Requests currently waiting in the broker queue
    pub queued_requests: usize,
    /// Bound workers
    pub workers: Vec<WorkerSnapshot>,
}

/// A request entered a broker queue
#[derive(Debug, Clone)]
pub struct RequestQueueingEvent {
    /// Function whose queue grew
    pub function_name: String,
    /// Whether the broker is an inspector pool
    pub inspector: bool,
    /// Id of the queued request
    pub request_id: String,
    /// Data-plane stats taken at enqueue time
    pub stats: Vec<BrokerSnapshot>,
}

/// Periodic traffic stats from the data plane
#[derive(Debug, Clone)]
pub struct WorkerTrafficStatsEvent {
    /// All broker snapshots in this reporting cycle
    pub brokers: Vec<BrokerSnapshot>,
}

/// Container lifecycle transition visible to monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEvent {
    /// Worker runtime initialized and bound
    ContainerInstalled,
    /// Draining worker reached zero in-flight requests
    RequestDrained,
}

impl std::fmt::Display for ContainerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ContainerInstalled => write!(f, "container-installed"),
            Self::RequestDrained => write!(f, "request-drained"),
        }
    }
}

/// Container status report broadcast by the data plane
#[derive(Debug, Clone)]
pub struct ContainerStatusReport {
    pub function_name: String,
    pub inspector: bool,
    pub worker_name: String,
    pub event: ContainerEvent,
}

/// A worker launch failure echoed back to the data plane
#[derive(Debug, Clone)]
pub struct LaunchFailure {
    /// Function whose launch failed
    pub function_name: String,
    /// Fatal failures fast-fail pending requests unconditionally
    pub fatal: bool,
    /// Opaque message delivered to rejected callers
    pub message: String,
}

/// Events flowing from the data plane to the controller
#[derive(Debug, Clone)]
pub enum ControlEvent {
    RequestQueueing(RequestQueueingEvent),
    WorkerTrafficStats(WorkerTrafficStatsEvent),
    ContainerStatusReport(ContainerStatusReport),
}

/// Cloneable sender half of the control event channel
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl EventBus {
    /// Create a bus and its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Notify the controller of queue pressure
    pub fn broadcast_request_queueing(&self, event: RequestQueueingEvent) {
        self.send(ControlEvent::RequestQueueing(event));
    }

    /// Publish a periodic traffic stats cycle
    pub fn broadcast_worker_traffic_stats(&self, brokers: Vec<BrokerSnapshot>) {
        self.send(ControlEvent::WorkerTrafficStats(WorkerTrafficStatsEvent {
            brokers,
        }));
    }

    /// Publish a container lifecycle transition
    pub fn broadcast_container_status(&self, report: ContainerStatusReport) {
        self.send(ControlEvent::ContainerStatusReport(report));
    }

    fn send(&self, event: ControlEvent) {
        // A dropped receiver means the controller is gone; the data plane
        // keeps serving regardless.
        if self.tx.send(event).is_err() {
            tracing::debug!("Control event dropped: no subscriber");
        }
    }
}
