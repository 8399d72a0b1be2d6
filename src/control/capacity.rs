//! Capacity manager — expand/shrink deltas under a global memory budget
//!
//! The default policy targets a fraction of per-worker concurrency
//! (`ceil(load / (capacity * scale_factor))`), holds reservation floors,
//! shrinks pools that stayed idle for enough consecutive cycles, and
//! drains pools whose function profile disappeared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::state::BrokerView;
use crate::config::{validate_capacity, CapacityConfig};
use crate::error::Result;
use crate::events::RequestQueueingEvent;

/// One scaling decision for one broker; positive counts expand, negative
/// counts shrink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleDelta {
    pub function_name: String,
    pub inspector: bool,
    pub count: i64,
}

impl ScaleDelta {
    pub fn new(function_name: impl Into<String>, inspector: bool, count: i64) -> Self {
        Self {
            function_name: function_name.into(),
            inspector,
            count,
        }
    }
}

/// Deltas for one autoscale pass
#[derive(Debug, Clone, Default)]
pub struct ScaleDeltas {
    pub expand: Vec<ScaleDelta>,
    pub shrink: Vec<ScaleDelta>,
}

/// Computes per-broker scaling deltas from the aggregated views
pub trait CapacityManager: Send + Sync {
    /// Whether a queueing event may trigger an expansion, given the global
    /// memory budget
    fn allow_expanding_on_request_queueing(&self, event: &RequestQueueingEvent) -> bool;

    /// Produce expand and shrink deltas for the current views
    fn evaluate_scale_deltas(&self, brokers: &[BrokerView]) -> ScaleDeltas;

    /// Manager name (for logging)
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// DefaultCapacityManager — budgeted concurrency-target policy
// ---------------------------------------------------------------------------

/// Default capacity policy bounded by the virtual memory pool
pub struct DefaultCapacityManager {
    config: CapacityConfig,
}

impl DefaultCapacityManager {
    /// Create a manager after validating the config
    pub fn new(config: CapacityConfig) -> Result<Self> {
        validate_capacity(&config)?;
        Ok(Self { config })
    }

    fn memory_per_worker(&self, view: &BrokerView) -> u64 {
        if view.worker_memory_limit_mb > 0 {
            view.worker_memory_limit_mb
        } else {
            self.config.default_worker_memory_limit_mb
        }
    }

    /// Replicas needed to hold load at the target utilization
    fn desired_replicas(&self, view: &BrokerView) -> usize {
        let load = (view.active_request_count() + view.queued_requests) as f64;
        if load == 0.0 {
            return 0;
        }
        let effective_capacity = view.worker_capacity as f64 * self.config.scale_factor;
        if effective_capacity <= 0.0 {
            return view.worker_count();
        }
        (load / effective_capacity).ceil() as usize
    }
}

impl CapacityManager for DefaultCapacityManager {
    fn allow_expanding_on_request_queueing(&self, event: &RequestQueueingEvent) -> bool {
        let used_mb: u64 = event
            .stats
            .iter()
            .map(|snapshot| {
                snapshot.workers.len() as u64 * self.config.default_worker_memory_limit_mb
            })
            .sum();
        let allowed =
            used_mb + self.config.default_worker_memory_limit_mb
                <= self.config.virtual_memory_pool_size_mb;
        if !allowed {
            tracing::warn!(
                function = event.function_name,
                used_mb,
                pool_mb = self.config.virtual_memory_pool_size_mb,
                "Memory pool exhausted; queueing expansion refused"
            );
        }
        allowed
    }

    fn evaluate_scale_deltas(&self, brokers: &[BrokerView]) -> ScaleDeltas {
        let mut deltas = ScaleDeltas::default();

        let used_mb: u64 = brokers
            .iter()
            .map(|view| view.worker_count() as u64 * self.memory_per_worker(view))
            .sum();
        let mut remaining_mb = self
            .config
            .virtual_memory_pool_size_mb
            .saturating_sub(used_mb);

        for view in brokers {
            let worker_count = view.worker_count();

            if !view.profiled {
                if worker_count > 0 {
                    deltas.shrink.push(ScaleDelta::new(
                        view.function_name.clone(),
                        view.inspector,
                        -(worker_count as i64),
                    ));
                }
                continue;
            }

            // Reservation floors are honored even when the budget is tight;
            // the controller routes these through the reservation path.
            if worker_count < view.reservation_count {
                deltas.expand.push(ScaleDelta::new(
                    view.function_name.clone(),
                    view.inspector,
                    (view.reservation_count - worker_count) as i64,
                ));
                continue;
            }

            let desired = self.desired_replicas(view);
            if desired > worker_count {
                let per_worker_mb = self.memory_per_worker(view);
                let affordable = (remaining_mb / per_worker_mb) as usize;
                let grow = (desired - worker_count).min(affordable);
                if grow > 0 {
                    remaining_mb -= grow as u64 * per_worker_mb;
                    deltas.expand.push(ScaleDelta::new(
                        view.function_name.clone(),
                        view.inspector,
                        grow as i64,
                    ));
                } else {
                    tracing::warn!(
                        function = view.function_name,
                        desired,
                        worker_count,
                        "Memory pool exhausted; expansion suppressed"
                    );
                }
            } else if view.active_request_count() == 0
                && view.queued_requests == 0
                && view.redundant_times >= self.config.redundant_times_threshold
                && worker_count > view.reservation_count
            {
                deltas.shrink.push(ScaleDelta::new(
                    view.function_name.clone(),
                    view.inspector,
                    -((worker_count - view.reservation_count) as i64),
                ));
            }
        }

        deltas
    }

    fn name(&self) -> &str {
        "default"
    }
}

// ---------------------------------------------------------------------------
// MockCapacityManager — scripted deltas for testing
// ---------------------------------------------------------------------------

/// Mock capacity manager returning scripted deltas (test-only)
pub struct MockCapacityManager {
    allow_expanding: AtomicBool,
    deltas: Mutex<ScaleDeltas>,
}

impl MockCapacityManager {
    /// Create a mock that allows expansion and returns no deltas
    pub fn new() -> Self {
        Self {
            allow_expanding: AtomicBool::new(true),
            deltas: Mutex::new(ScaleDeltas::default()),
        }
    }

    /// Script the expansion predicate
    pub fn set_allow_expanding(&self, allow: bool) {
        self.allow_expanding.store(allow, Ordering::SeqCst);
    }

    /// Script the deltas returned by `evaluate_scale_deltas`
    pub fn set_deltas(&self, deltas: ScaleDeltas) {
        *self.deltas.lock().unwrap() = deltas;
    }
}

impl Default for MockCapacityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CapacityManager for MockCapacityManager {
    fn allow_expanding_on_request_queueing(&self, _event: &RequestQueueingEvent) -> bool {
        self.allow_expanding.load(Ordering::SeqCst)
    }

    fn evaluate_scale_deltas(&self, _brokers: &[BrokerView]) -> ScaleDeltas {
        self.deltas.lock().unwrap().clone()
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::state::{WorkerRecord, WorkerRecordStatus};
    use crate::events::BrokerSnapshot;
    use std::collections::HashMap;

    fn view(function: &str, workers: usize, active_each: usize) -> BrokerView {
        let mut records = HashMap::new();
        for i in 0..workers {
            records.insert(
                format!("cred-{}", i),
                WorkerRecord {
                    name: format!("w-{}", i),
                    credential: format!("cred-{}", i),
                    register_time_ms: 1_000 + i as u64,
                    active_request_count: active_each,
                    max_activate_requests: 10,
                    status: WorkerRecordStatus::Running,
                },
            );
        }
        BrokerView {
            function_name: function.into(),
            inspector: false,
            disposable: false,
            profiled: true,
            reservation_count: 0,
            worker_capacity: 10,
            worker_memory_limit_mb: 512,
            shrink_strategy: None,
            redundant_times: 0,
            queued_requests: 0,
            workers: records,
        }
    }

    fn manager() -> DefaultCapacityManager {
        DefaultCapacityManager::new(CapacityConfig::default()).unwrap()
    }

    fn queueing_event(stats: Vec<BrokerSnapshot>) -> RequestQueueingEvent {
        RequestQueueingEvent {
            function_name: "echo".into(),
            inspector: false,
            request_id: "req-1".into(),
            stats,
        }
    }

    // --- expansion ---

    #[test]
    fn test_expand_under_load() {
        let m = manager();
        // 2 workers, 10 in-flight each; capacity 10, factor 0.7
        // desired = ceil(20 / 7) = 3
        let deltas = m.evaluate_scale_deltas(&[view("echo", 2, 10)]);
        assert_eq!(deltas.expand.len(), 1);
        assert_eq!(deltas.expand[0].count, 1);
        assert!(deltas.shrink.is_empty());
    }

    #[test]
    fn test_queued_requests_count_as_load() {
        let m = manager();
        let mut v = view("echo", 1, 0);
        v.queued_requests = 15;
        // desired = ceil(15 / 7) = 3
        let deltas = m.evaluate_scale_deltas(&[v]);
        assert_eq!(deltas.expand[0].count, 2);
    }

    #[test]
    fn test_no_delta_when_settled() {
        let m = manager();
        // 2 workers, 5 in-flight total; desired = ceil(10/7) = 2 = current
        let deltas = m.evaluate_scale_deltas(&[view("echo", 2, 5)]);
        assert!(deltas.expand.is_empty());
        assert!(deltas.shrink.is_empty());
    }

    #[test]
    fn test_expansion_capped_by_memory_pool() {
        let config = CapacityConfig {
            virtual_memory_pool_size_mb: 1536, // room for 3 x 512
            ..CapacityConfig::default()
        };
        let m = DefaultCapacityManager::new(config).unwrap();
        // 2 workers occupy 1024; huge load wants many more but only 1 fits
        let deltas = m.evaluate_scale_deltas(&[view("echo", 2, 100)]);
        assert_eq!(deltas.expand.len(), 1);
        assert_eq!(deltas.expand[0].count, 1);
    }

    #[test]
    fn test_expansion_suppressed_when_pool_full() {
        let config = CapacityConfig {
            virtual_memory_pool_size_mb: 1024,
            ..CapacityConfig::default()
        };
        let m = DefaultCapacityManager::new(config).unwrap();
        let deltas = m.evaluate_scale_deltas(&[view("echo", 2, 100)]);
        assert!(deltas.expand.is_empty());
    }

    #[test]
    fn test_reservation_floor_expands() {
        let m = manager();
        let mut v = view("echo", 1, 0);
        v.reservation_count = 3;
        let deltas = m.evaluate_scale_deltas(&[v]);
        assert_eq!(deltas.expand[0].count, 2);
    }

    // --- shrink ---

    #[test]
    fn test_idle_pool_shrinks_after_threshold() {
        let m = manager();
        let mut v = view("echo", 3, 0);
        v.redundant_times = 6;
        let deltas = m.evaluate_scale_deltas(&[v]);
        assert_eq!(deltas.shrink.len(), 1);
        assert_eq!(deltas.shrink[0].count, -3);
    }

    #[test]
    fn test_idle_pool_waits_for_threshold() {
        let m = manager();
        let mut v = view("echo", 3, 0);
        v.redundant_times = 5;
        let deltas = m.evaluate_scale_deltas(&[v]);
        assert!(deltas.shrink.is_empty());
    }

    #[test]
    fn test_idle_shrink_respects_reservation() {
        let m = manager();
        let mut v = view("echo", 3, 0);
        v.redundant_times = 10;
        v.reservation_count = 2;
        let deltas = m.evaluate_scale_deltas(&[v]);
        assert_eq!(deltas.shrink[0].count, -1);
    }

    #[test]
    fn test_unprofiled_pool_shrinks_to_zero() {
        let m = manager();
        let mut v = view("ghost", 5, 8);
        v.profiled = false;
        let deltas = m.evaluate_scale_deltas(&[v]);
        assert_eq!(deltas.shrink.len(), 1);
        assert_eq!(deltas.shrink[0].count, -5);
        assert!(deltas.expand.is_empty());
    }

    #[test]
    fn test_unprofiled_empty_pool_is_ignored() {
        let m = manager();
        let mut v = view("ghost", 0, 0);
        v.profiled = false;
        let deltas = m.evaluate_scale_deltas(&[v]);
        assert!(deltas.shrink.is_empty());
    }

    // --- queueing predicate ---

    #[test]
    fn test_allow_expanding_under_budget() {
        let m = manager();
        let event = queueing_event(vec![]);
        assert!(m.allow_expanding_on_request_queueing(&event));
    }

    #[test]
    fn test_refuse_expanding_over_budget() {
        let config = CapacityConfig {
            virtual_memory_pool_size_mb: 1024,
            ..CapacityConfig::default()
        };
        let m = DefaultCapacityManager::new(config).unwrap();
        let event = queueing_event(vec![BrokerSnapshot {
            function_name: "echo".into(),
            inspector: false,
            disposable: false,
            queued_requests: 1,
            workers: (0..2)
                .map(|i| crate::events::WorkerSnapshot {
                    name: format!("w-{}", i),
                    credential: format!("cred-{}", i),
                    active_request_count: 10,
                    max_activate_requests: 10,
                    traffic_off: false,
                    register_time_ms: 0,
                })
                .collect(),
        }]);
        assert!(!m.allow_expanding_on_request_queueing(&event));
    }

    // --- determinism ---

    #[test]
    fn test_evaluate_is_deterministic() {
        let m = manager();
        let views = vec![view("echo", 2, 10), view("resize", 1, 0)];
        let first = m.evaluate_scale_deltas(&views);
        let second = m.evaluate_scale_deltas(&views);
        assert_eq!(first.expand, second.expand);
        assert_eq!(first.shrink, second.shrink);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CapacityConfig {
            scale_factor: 0.0,
            ..CapacityConfig::default()
        };
        assert!(DefaultCapacityManager::new(config).is_err());
    }

    // --- mock ---

    #[test]
    fn test_mock_scripted_deltas() {
        let mock = MockCapacityManager::new();
        mock.set_deltas(ScaleDeltas {
            expand: vec![ScaleDelta::new("echo", false, 2)],
            shrink: vec![ScaleDelta::new("lambda", false, -2)],
        });
        let deltas = mock.evaluate_scale_deltas(&[]);
        assert_eq!(deltas.expand[0].count, 2);
        assert_eq!(deltas.shrink[0].count, -2);

        assert!(mock.allow_expanding_on_request_queueing(&queueing_event(vec![])));
        mock.set_allow_expanding(false);
        assert!(!mock.allow_expanding_on_request_queueing(&queueing_event(vec![])));
    }
}
