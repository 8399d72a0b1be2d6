//! Dispatch metrics — lightweight per-function counters and histograms
//!
//! Provides in-process metrics tracking without external dependencies.
//! Metrics can be exported as a JSON snapshot for scraping.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Upper bounds (ms) of the queue-wait histogram buckets; the last bucket
/// is unbounded.
const WAIT_BUCKET_BOUNDS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1_000, 5_000, 30_000];

/// Queue-wait histogram for one function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueWaitHistogram {
    /// Sample counts per bucket; one extra slot for the overflow bucket
    pub buckets: Vec<u64>,
    /// Total samples recorded
    pub count: u64,
    /// Sum of all samples in milliseconds
    pub sum_ms: u64,
}

impl QueueWaitHistogram {
    fn new() -> Self {
        Self {
            buckets: vec![0; WAIT_BUCKET_BOUNDS_MS.len() + 1],
            count: 0,
            sum_ms: 0,
        }
    }

    fn record(&mut self, wait_ms: u64) {
        let idx = WAIT_BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| wait_ms <= *bound)
            .unwrap_or(WAIT_BUCKET_BOUNDS_MS.len());
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum_ms += wait_ms;
    }

    /// Mean wait in milliseconds, 0 when empty
    pub fn mean_ms(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum_ms / self.count
        }
    }
}

/// Metrics snapshot — a point-in-time view of all dispatch metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Requests enqueued, per function
    pub queued_requests: HashMap<String, u64>,
    /// Queue-wait distributions, per function
    pub queue_wait: HashMap<String, QueueWaitHistogram>,
}

/// Dispatch metrics collector, tagged by function name
pub struct DispatchMetrics {
    queued_requests: RwLock<HashMap<String, u64>>,
    queue_wait: RwLock<HashMap<String, QueueWaitHistogram>>,
}

impl DispatchMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            queued_requests: RwLock::new(HashMap::new()),
            queue_wait: RwLock::new(HashMap::new()),
        }
    }

    /// Count one enqueued request for a function
    pub fn record_queued(&self, function_name: &str) {
        let mut map = self.queued_requests.write().unwrap();
        *map.entry(function_name.to_string()).or_insert(0) += 1;
    }

    /// Record the wait between enqueue and terminal transition
    pub fn record_queue_wait(&self, function_name: &str, wait_ms: u64) {
        let mut map = self.queue_wait.write().unwrap();
        map.entry(function_name.to_string())
            .or_insert_with(QueueWaitHistogram::new)
            .record(wait_ms);
    }

    /// Total enqueued requests for a function
    pub fn queued_total(&self, function_name: &str) -> u64 {
        self.queued_requests
            .read()
            .unwrap()
            .get(function_name)
            .copied()
            .unwrap_or(0)
    }

    /// Number of queue-wait samples recorded for a function
    pub fn wait_count(&self, function_name: &str) -> u64 {
        self.queue_wait
            .read()
            .unwrap()
            .get(function_name)
            .map(|h| h.count)
            .unwrap_or(0)
    }

    /// Sum of queue-wait samples for a function, in milliseconds
    pub fn wait_sum_ms(&self, function_name: &str) -> u64 {
        self.queue_wait
            .read()
            .unwrap()
            .get(function_name)
            .map(|h| h.sum_ms)
            .unwrap_or(0)
    }

    /// Take a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queued_requests: self.queued_requests.read().unwrap().clone(),
            queue_wait: self.queue_wait.read().unwrap().clone(),
        }
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}
