//! Worker launcher — trait boundary to process spawning
//!
//! Spawning and sandboxing live outside this crate; the controller only
//! needs to request launches and stops.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Why a launch was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchReason {
    /// A request queued with no free worker
    RequestQueueExpand,
    /// Periodic autoscale decided to grow the pool
    AutoScale,
    /// The pool is below its reservation floor
    Reservation,
}

impl std::fmt::Display for LaunchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestQueueExpand => write!(f, "request-queue-expand"),
            Self::AutoScale => write!(f, "auto-scale"),
            Self::Reservation => write!(f, "reservation"),
        }
    }
}

/// Launch parameters for one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMetadata {
    pub function_name: String,
    pub inspect: bool,
    pub disposable: bool,
    pub to_reserve: bool,
}

/// Process lifecycle operations offered by the launcher
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Request one worker launch; the worker later registers its credential
    /// with the broker out of band
    async fn try_launch(&self, reason: LaunchReason, metadata: &WorkerMetadata) -> Result<()>;

    /// Stop a worker process
    async fn stop_worker(&self, function_name: &str, worker_name: &str) -> Result<()>;

    /// Launcher name (for logging)
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// MockLauncher — records launches and stops for testing
// ---------------------------------------------------------------------------

/// Mock launcher recording launch/stop requests (test-only)
pub struct MockLauncher {
    launches: Mutex<Vec<(LaunchReason, WorkerMetadata)>>,
    stops: Mutex<Vec<(String, String)>>,
    launch_failure: Mutex<Option<(bool, String)>>,
    stop_failure: Mutex<Option<String>>,
}

impl MockLauncher {
    /// Create a mock where every launch and stop succeeds
    pub fn new() -> Self {
        Self {
            launches: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            launch_failure: Mutex::new(None),
            stop_failure: Mutex::new(None),
        }
    }

    /// Make every `try_launch` fail
    pub fn fail_launches(&self, fatal: bool, message: &str) {
        *self.launch_failure.lock().unwrap() = Some((fatal, message.to_string()));
    }

    /// Make every `stop_worker` fail
    pub fn fail_stops(&self, message: &str) {
        *self.stop_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Recorded launches
    pub fn launches(&self) -> Vec<(LaunchReason, WorkerMetadata)> {
        self.launches.lock().unwrap().clone()
    }

    /// Recorded (function, worker) stops
    pub fn stops(&self) -> Vec<(String, String)> {
        self.stops.lock().unwrap().clone()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    async fn try_launch(&self, reason: LaunchReason, metadata: &WorkerMetadata) -> Result<()> {
        if let Some((fatal, message)) = self.launch_failure.lock().unwrap().clone() {
            return Err(Error::Launch { fatal, message });
        }
        self.launches
            .lock()
            .unwrap()
            .push((reason, metadata.clone()));
        Ok(())
    }

    async fn stop_worker(&self, function_name: &str, worker_name: &str) -> Result<()> {
        if let Some(message) = self.stop_failure.lock().unwrap().clone() {
            return Err(Error::ControlPlane(message));
        }
        self.stops
            .lock()
            .unwrap()
            .push((function_name.to_string(), worker_name.to_string()));
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
