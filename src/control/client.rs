//! Data-plane client — cross-plane RPC boundary
//!
//! The controller asks the data plane to drain workers ahead of a stop and
//! relays launch failures so brokers can fast-fail their queues. Transport
//! lives outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::events::LaunchFailure;

/// Addresses one worker in a capacity reduction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub name: String,
    pub credential: String,
}

/// One broker's share of a capacity reduction request or response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityReduction {
    pub function_name: String,
    pub inspector: bool,
    pub workers: Vec<WorkerHandle>,
}

/// RPC surface the controller needs from the data plane
#[async_trait]
pub trait DataPlaneClient: Send + Sync {
    /// Ask the data plane to drain the listed workers. Returns the subset
    /// it actually drained.
    async fn reduce_capacity(
        &self,
        requests: Vec<CapacityReduction>,
    ) -> Result<Vec<CapacityReduction>>;

    /// Relay a worker launch failure to the data plane
    async fn start_worker_fast_fail(&self, failure: &LaunchFailure) -> Result<()>;

    /// Client name (for logging)
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// MockDataPlaneClient — scripted drain results for testing
// ---------------------------------------------------------------------------

/// Mock data-plane client recording calls (test-only).
///
/// By default `reduce_capacity` echoes its request, i.e. every worker
/// drains. Tests can script a different drained subset.
pub struct MockDataPlaneClient {
    reduce_calls: Mutex<Vec<Vec<CapacityReduction>>>,
    drained: Mutex<Option<Vec<CapacityReduction>>>,
    reduce_failure: Mutex<Option<String>>,
    reduce_delay: Mutex<Option<std::time::Duration>>,
    fast_fails: Mutex<Vec<LaunchFailure>>,
}

impl MockDataPlaneClient {
    /// Create a mock where every requested worker drains
    pub fn new() -> Self {
        Self {
            reduce_calls: Mutex::new(Vec::new()),
            drained: Mutex::new(None),
            reduce_failure: Mutex::new(None),
            reduce_delay: Mutex::new(None),
            fast_fails: Mutex::new(Vec::new()),
        }
    }

    /// Delay every `reduce_capacity` call
    pub fn set_reduce_delay(&self, delay: std::time::Duration) {
        *self.reduce_delay.lock().unwrap() = Some(delay);
    }

    /// Script the drained subset returned by `reduce_capacity`
    pub fn set_drained(&self, drained: Vec<CapacityReduction>) {
        *self.drained.lock().unwrap() = Some(drained);
    }

    /// Make `reduce_capacity` fail
    pub fn fail_reduce(&self, message: &str) {
        *self.reduce_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Recorded reduce requests, one entry per call
    pub fn reduce_calls(&self) -> Vec<Vec<CapacityReduction>> {
        self.reduce_calls.lock().unwrap().clone()
    }

    /// Recorded launch failures
    pub fn fast_fails(&self) -> Vec<LaunchFailure> {
        self.fast_fails.lock().unwrap().clone()
    }
}

impl Default for MockDataPlaneClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataPlaneClient for MockDataPlaneClient {
    async fn reduce_capacity(
        &self,
        requests: Vec<CapacityReduction>,
    ) -> Result<Vec<CapacityReduction>> {
        if let Some(message) = self.reduce_failure.lock().unwrap().clone() {
            return Err(Error::ControlPlane(message));
        }
        self.reduce_calls.lock().unwrap().push(requests.clone());
        let delay = *self.reduce_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let drained = self.drained.lock().unwrap().clone();
        Ok(drained.unwrap_or(requests))
    }

    async fn start_worker_fast_fail(&self, failure: &LaunchFailure) -> Result<()> {
        self.fast_fails.lock().unwrap().push(failure.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
