//! Delegate — IPC facade between the broker and a worker process
//!
//! The broker never talks to a sandbox directly; it addresses workers by
//! credential through this trait. Transport, encoding, and the worker
//! runtime live behind it.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Request metadata carried alongside the input payload
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    /// Caller-supplied request id; generated when absent
    pub request_id: Option<String>,
    /// Absolute deadline as epoch milliseconds
    pub deadline_ms: Option<u64>,
    /// Debugger session tag; triggers inspector attach on disposable workers
    pub debugger_tag: Option<String>,
}

impl RequestMetadata {
    /// Metadata with a deadline at `epoch_ms`
    pub fn with_deadline(epoch_ms: u64) -> Self {
        Self {
            deadline_ms: Some(epoch_ms),
            ..Self::default()
        }
    }
}

/// Raw response from a worker process invoke
#[derive(Debug, Clone)]
pub struct TriggerResponse {
    /// Response body
    pub data: Bytes,
}

/// IPC operations a worker process must offer
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Initialize the worker runtime; must complete before `deadline`
    async fn init(&self, credential: &str, deadline: Instant) -> Result<()>;

    /// Forward one invocation to the worker process
    async fn trigger(
        &self,
        credential: &str,
        input: Bytes,
        metadata: &RequestMetadata,
    ) -> Result<TriggerResponse>;

    /// Attach a debugger to the worker process
    async fn inspector_start(&self, credential: &str) -> Result<()>;

    /// Tear down a peer after a failed initialization
    async fn reset_peer(&self, credential: &str) -> Result<()>;

    /// Delegate name (for logging)
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// MockDelegate — scripted worker process behavior for tests
// ---------------------------------------------------------------------------

/// Mock delegate that records calls and echoes inputs (test-only)
pub struct MockDelegate {
    /// Credentials whose `init` should fail
    failing_inits: Mutex<HashSet<String>>,
    /// Error message returned by every `trigger`, when set
    trigger_error: Mutex<Option<String>>,
    /// Artificial latency applied to `trigger`
    trigger_delay: Mutex<Option<Duration>>,
    init_calls: Mutex<Vec<String>>,
    trigger_calls: Mutex<Vec<(String, Bytes)>>,
    inspector_calls: Mutex<Vec<String>>,
    reset_calls: Mutex<Vec<String>>,
    triggered: AtomicU64,
}

impl MockDelegate {
    /// Create a well-behaved mock: init succeeds, trigger echoes the input
    pub fn new() -> Self {
        Self {
            failing_inits: Mutex::new(HashSet::new()),
            trigger_error: Mutex::new(None),
            trigger_delay: Mutex::new(None),
            init_calls: Mutex::new(Vec::new()),
            trigger_calls: Mutex::new(Vec::new()),
            inspector_calls: Mutex::new(Vec::new()),
            reset_calls: Mutex::new(Vec::new()),
            triggered: AtomicU64::new(0),
        }
    }

    /// Make `init` fail for one credential
    pub fn fail_init_for(&self, credential: &str) {
        self.failing_inits
            .lock()
            .unwrap()
            .insert(credential.to_string());
    }

    /// Make every `trigger` fail with the given message
    pub fn fail_trigger_with(&self, message: &str) {
        *self.trigger_error.lock().unwrap() = Some(message.to_string());
    }

    /// Delay every `trigger` by `delay`
    pub fn set_trigger_delay(&self, delay: Duration) {
        *self.trigger_delay.lock().unwrap() = Some(delay);
    }

    /// Credentials initialized so far
    pub fn init_calls(&self) -> Vec<String> {
        self.init_calls.lock().unwrap().clone()
    }

    /// (credential, input) pairs triggered so far
    pub fn trigger_calls(&self) -> Vec<(String, Bytes)> {
        self.trigger_calls.lock().unwrap().clone()
    }

    /// Number of triggers served
    pub fn trigger_count(&self) -> u64 {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Credentials with inspector sessions started
    pub fn inspector_calls(&self) -> Vec<String> {
        self.inspector_calls.lock().unwrap().clone()
    }

    /// Credentials reset after failed init
    pub fn reset_calls(&self) -> Vec<String> {
        self.reset_calls.lock().unwrap().clone()
    }
}

impl Default for MockDelegate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Delegate for MockDelegate {
    async fn init(&self, credential: &str, _deadline: Instant) -> Result<()> {
        self.init_calls.lock().unwrap().push(credential.to_string());
        if self.failing_inits.lock().unwrap().contains(credential) {
            return Err(Error::Ipc(format!(
                "init failed for credential '{}'",
                credential
            )));
        }
        Ok(())
    }

    async fn trigger(
        &self,
        credential: &str,
        input: Bytes,
        _metadata: &RequestMetadata,
    ) -> Result<TriggerResponse> {
        self.trigger_calls
            .lock()
            .unwrap()
            .push((credential.to_string(), input.clone()));

        let delay = *self.trigger_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.trigger_error.lock().unwrap().clone() {
            return Err(Error::Ipc(message));
        }

        self.triggered.fetch_add(1, Ordering::SeqCst);
        Ok(TriggerResponse { data: input })
    }

    async fn inspector_start(&self, credential: &str) -> Result<()> {
        self.inspector_calls
            .lock()
            .unwrap()
            .push(credential.to_string());
        Ok(())
    }

    async fn reset_peer(&self, credential: &str) -> Result<()> {
        self.reset_calls
            .lock()
            .unwrap()
            .push(credential.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
