//! Control-plane state — function profiles and per-broker worker views
//!
//! The state manager is the control plane's mirror of the data plane:
//! views are created on first profile sync and mutated only by stats
//! ingest or control events.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::FunctionProfile;
use crate::events::BrokerSnapshot;

/// Control-plane status of a worker record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRecordStatus {
    /// Worker is serving traffic
    Running,
    /// Worker was drained by a shrink and awaits stop
    Shrink,
}

/// One worker as seen from the control plane
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub name: String,
    pub credential: String,
    pub register_time_ms: u64,
    pub active_request_count: usize,
    pub max_activate_requests: usize,
    pub status: WorkerRecordStatus,
}

/// Identifies one broker: function name plus inspector flag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerKey {
    pub function_name: String,
    pub inspector: bool,
}

impl BrokerKey {
    pub fn new(function_name: impl Into<String>, inspector: bool) -> Self {
        Self {
            function_name: function_name.into(),
            inspector,
        }
    }
}

/// Aggregated control-plane view of one broker
#[derive(Debug, Clone)]
pub struct BrokerView {
    pub function_name: String,
    pub inspector: bool,
    pub disposable: bool,
    /// False once the function's profile has been removed; the view
    /// survives until its workers are gone
    pub profiled: bool,
    /// Minimum worker count kept regardless of load
    pub reservation_count: usize,
    /// Effective per-worker concurrency cap
    pub worker_capacity: usize,
    /// Memory charged per worker, in MB
    pub worker_memory_limit_mb: u64,
    /// Shrink strategy name from the profile, if any
    pub shrink_strategy: Option<String>,
    /// Consecutive stats cycles observed fully idle
    pub redundant_times: u32,
    /// Requests parked in the data-plane queue at last sync
    pub queued_requests: usize,
    /// Worker records keyed by credential
    pub workers: HashMap<String, WorkerRecord>,
}

impl BrokerView {
    fn from_profile(profile: &FunctionProfile, inspector: bool) -> Self {
        Self {
            function_name: profile.name.clone(),
            inspector,
            disposable: profile.disposable,
            profiled: true,
            reservation_count: profile.reservation_count,
            worker_capacity: profile.worker_capacity(),
            worker_memory_limit_mb: profile.worker_memory_limit_mb,
            shrink_strategy: profile.shrink_strategy.clone(),
            redundant_times: 0,
            queued_requests: 0,
            workers: HashMap::new(),
        }
    }

    fn detached(snapshot: &BrokerSnapshot) -> Self {
        Self {
            function_name: snapshot.function_name.clone(),
            inspector: snapshot.inspector,
            disposable: snapshot.disposable,
            profiled: false,
            reservation_count: 0,
            worker_capacity: 1,
            worker_memory_limit_mb: 0,
            shrink_strategy: None,
            redundant_times: 0,
            queued_requests: 0,
            workers: HashMap::new(),
        }
    }

    /// Number of workers in this pool
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// In-flight requests summed across workers
    pub fn active_request_count(&self) -> usize {
        self.workers
            .values()
            .map(|record| record.active_request_count)
            .sum()
    }

    /// Total concurrency capacity summed across workers
    pub fn total_max_activate_requests(&self) -> usize {
        self.workers
            .values()
            .map(|record| record.max_activate_requests)
            .sum()
    }
}

struct StateInner {
    profiles: HashMap<String, FunctionProfile>,
    brokers: HashMap<BrokerKey, BrokerView>,
}

/// Control-plane mirror of data-plane broker state
pub struct StateManager {
    inner: Mutex<StateInner>,
}

impl StateManager {
    /// Create an empty state manager
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                profiles: HashMap::new(),
                brokers: HashMap::new(),
            }),
        }
    }

    /// Replace the function profile set.
    ///
    /// New profiles get a view; views whose profile disappeared are kept
    /// (unprofiled) while workers remain, so the autoscaler can drain them.
    pub fn set_profiles(&self, profiles: Vec<FunctionProfile>) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        inner.profiles = profiles
            .into_iter()
            .map(|profile| (profile.name.clone(), profile))
            .collect();

        for (name, profile) in &inner.profiles {
            let key = BrokerKey::new(name.clone(), false);
            match inner.brokers.entry(key) {
                Entry::Occupied(mut occupied) => {
                    let view = occupied.get_mut();
                    view.profiled = true;
                    view.disposable = profile.disposable;
                    view.reservation_count = profile.reservation_count;
                    view.worker_capacity = profile.worker_capacity();
                    view.worker_memory_limit_mb = profile.worker_memory_limit_mb;
                    view.shrink_strategy = profile.shrink_strategy.clone();
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(BrokerView::from_profile(profile, false));
                }
            }
        }

        let profiles = &inner.profiles;
        for view in inner.brokers.values_mut() {
            if !profiles.contains_key(&view.function_name) {
                view.profiled = false;
            }
        }
        inner
            .brokers
            .retain(|_, view| view.profiled || view.worker_count() > 0);
    }

    /// Look up one function profile
    pub fn get_profile(&self, function_name: &str) -> Option<FunctionProfile> {
        self.inner
            .lock()
            .unwrap()
            .profiles
            .get(function_name)
            .cloned()
    }

    /// Reconcile data-plane stats into the views.
    ///
    /// Worker records are upserted by credential (new credentials enter as
    /// `Running`, existing ones keep their status), vanished credentials are
    /// dropped, and idle cycles advance `redundant_times`.
    pub fn sync_worker_data(&self, stats: &[BrokerSnapshot]) {
        let mut inner = self.inner.lock().unwrap();
        for snapshot in stats {
            let key = BrokerKey::new(snapshot.function_name.clone(), snapshot.inspector);
            let view = inner
                .brokers
                .entry(key)
                .or_insert_with(|| BrokerView::detached(snapshot));

            view.disposable = snapshot.disposable;
            view.queued_requests = snapshot.queued_requests;

            let mut records = HashMap::with_capacity(snapshot.workers.len());
            for worker in &snapshot.workers {
                let status = view
                    .workers
                    .get(&worker.credential)
                    .map(|existing| existing.status)
                    .unwrap_or(WorkerRecordStatus::Running);
                records.insert(
                    worker.credential.clone(),
                    WorkerRecord {
                        name: worker.name.clone(),
                        credential: worker.credential.clone(),
                        register_time_ms: worker.register_time_ms,
                        active_request_count: worker.active_request_count,
                        max_activate_requests: worker.max_activate_requests,
                        status,
                    },
                );
            }
            view.workers = records;

            let idle = view.active_request_count() == 0 && view.queued_requests == 0;
            if idle && view.worker_count() > 0 {
                view.redundant_times += 1;
            } else {
                view.redundant_times = 0;
            }
        }
    }

    /// Clone all broker views
    pub fn views(&self) -> Vec<BrokerView> {
        let mut views: Vec<BrokerView> =
            self.inner.lock().unwrap().brokers.values().cloned().collect();
        views.sort_by(|a, b| {
            (a.function_name.as_str(), a.inspector).cmp(&(b.function_name.as_str(), b.inspector))
        });
        views
    }

    /// Clone one broker view
    pub fn view(&self, key: &BrokerKey) -> Option<BrokerView> {
        self.inner.lock().unwrap().brokers.get(key).cloned()
    }

    /// Mark a worker record `Shrink` if its credential still matches the
    /// live record. Returns false on a mismatch, which indicates the worker
    /// re-registered between the draw and the drain.
    pub fn mark_worker_shrink(
        &self,
        function_name: &str,
        inspector: bool,
        worker_name: &str,
        credential: &str,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let key = BrokerKey::new(function_name, inspector);
        let Some(view) = inner.brokers.get_mut(&key) else {
            return false;
        };
        for record in view.workers.values_mut() {
            if record.name == worker_name {
                if record.credential == credential && record.status == WorkerRecordStatus::Running {
                    record.status = WorkerRecordStatus::Shrink;
                    return true;
                }
                return false;
            }
        }
        false
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WorkerSnapshot;

    fn worker_snap(name: &str, credential: &str, active: usize) -> WorkerSnapshot {
        WorkerSnapshot {
            name: name.into(),
            credential: credential.into(),
            active_request_count: active,
            max_activate_requests: 10,
            traffic_off: false,
            register_time_ms: 1_000,
        }
    }

    fn broker_snap(function: &str, workers: Vec<WorkerSnapshot>) -> BrokerSnapshot {
        BrokerSnapshot {
            function_name: function.into(),
            inspector: false,
            disposable: false,
            queued_requests: 0,
            workers,
        }
    }

    #[test]
    fn test_profile_sync_creates_view() {
        let state = StateManager::new();
        state.set_profiles(vec![FunctionProfile::new("echo")]);

        let view = state.view(&BrokerKey::new("echo", false)).unwrap();
        assert!(view.profiled);
        assert_eq!(view.worker_count(), 0);
        assert_eq!(view.worker_capacity, 10);
    }

    #[test]
    fn test_profile_removal_keeps_populated_view() {
        let state = StateManager::new();
        state.set_profiles(vec![FunctionProfile::new("echo")]);
        state.sync_worker_data(&[broker_snap("echo", vec![worker_snap("w-0", "cred-0", 5)])]);

        state.set_profiles(vec![]);
        let view = state.view(&BrokerKey::new("echo", false)).unwrap();
        assert!(!view.profiled);
        assert_eq!(view.worker_count(), 1);
    }

    #[test]
    fn test_profile_removal_prunes_empty_view() {
        let state = StateManager::new();
        state.set_profiles(vec![FunctionProfile::new("echo")]);
        state.set_profiles(vec![]);
        assert!(state.view(&BrokerKey::new("echo", false)).is_none());
    }

    #[test]
    fn test_sync_upserts_and_drops_records() {
        let state = StateManager::new();
        state.set_profiles(vec![FunctionProfile::new("echo")]);

        state.sync_worker_data(&[broker_snap(
            "echo",
            vec![worker_snap("w-0", "cred-0", 2), worker_snap("w-1", "cred-1", 3)],
        )]);
        let view = state.view(&BrokerKey::new("echo", false)).unwrap();
        assert_eq!(view.worker_count(), 2);
        assert_eq!(view.active_request_count(), 5);
        assert_eq!(view.total_max_activate_requests(), 20);

        // w-0 vanishes, w-1 load changes
        state.sync_worker_data(&[broker_snap("echo", vec![worker_snap("w-1", "cred-1", 0)])]);
        let view = state.view(&BrokerKey::new("echo", false)).unwrap();
        assert_eq!(view.worker_count(), 1);
        assert_eq!(view.active_request_count(), 0);
    }

    #[test]
    fn test_sync_creates_detached_view_for_unknown_function() {
        let state = StateManager::new();
        state.sync_worker_data(&[broker_snap("ghost", vec![worker_snap("w-0", "cred-0", 1)])]);

        let view = state.view(&BrokerKey::new("ghost", false)).unwrap();
        assert!(!view.profiled);
        assert_eq!(view.worker_count(), 1);
    }

    #[test]
    fn test_redundant_times_counts_idle_cycles() {
        let state = StateManager::new();
        state.set_profiles(vec![FunctionProfile::new("echo")]);

        state.sync_worker_data(&[broker_snap("echo", vec![worker_snap("w-0", "cred-0", 0)])]);
        state.sync_worker_data(&[broker_snap("echo", vec![worker_snap("w-0", "cred-0", 0)])]);
        let view = state.view(&BrokerKey::new("echo", false)).unwrap();
        assert_eq!(view.redundant_times, 2);

        // Load resets the counter
        state.sync_worker_data(&[broker_snap("echo", vec![worker_snap("w-0", "cred-0", 4)])]);
        let view = state.view(&BrokerKey::new("echo", false)).unwrap();
        assert_eq!(view.redundant_times, 0);
    }

    #[test]
    fn test_redundant_times_requires_workers() {
        let state = StateManager::new();
        state.set_profiles(vec![FunctionProfile::new("echo")]);
        state.sync_worker_data(&[broker_snap("echo", vec![])]);
        let view = state.view(&BrokerKey::new("echo", false)).unwrap();
        assert_eq!(view.redundant_times, 0);
    }

    #[test]
    fn test_mark_worker_shrink_matches_credential() {
        let state = StateManager::new();
        state.set_profiles(vec![FunctionProfile::new("echo")]);
        state.sync_worker_data(&[broker_snap("echo", vec![worker_snap("w-0", "cred-0", 0)])]);

        assert!(state.mark_worker_shrink("echo", false, "w-0", "cred-0"));
        let view = state.view(&BrokerKey::new("echo", false)).unwrap();
        assert_eq!(
            view.workers.get("cred-0").unwrap().status,
            WorkerRecordStatus::Shrink
        );

        // Already shrinking; a second mark is refused
        assert!(!state.mark_worker_shrink("echo", false, "w-0", "cred-0"));
    }

    #[test]
    fn test_mark_worker_shrink_credential_mismatch() {
        let state = StateManager::new();
        state.set_profiles(vec![FunctionProfile::new("echo")]);
        state.sync_worker_data(&[broker_snap("echo", vec![worker_snap("w-0", "cred-9", 0)])]);

        // The worker re-registered under a fresh credential
        assert!(!state.mark_worker_shrink("echo", false, "w-0", "cred-0"));
        let view = state.view(&BrokerKey::new("echo", false)).unwrap();
        assert_eq!(
            view.workers.get("cred-9").unwrap().status,
            WorkerRecordStatus::Running
        );
    }

    #[test]
    fn test_shrink_status_survives_sync() {
        let state = StateManager::new();
        state.set_profiles(vec![FunctionProfile::new("echo")]);
        state.sync_worker_data(&[broker_snap("echo", vec![worker_snap("w-0", "cred-0", 0)])]);
        state.mark_worker_shrink("echo", false, "w-0", "cred-0");

        state.sync_worker_data(&[broker_snap("echo", vec![worker_snap("w-0", "cred-0", 0)])]);
        let view = state.view(&BrokerKey::new("echo", false)).unwrap();
        assert_eq!(
            view.workers.get("cred-0").unwrap().status,
            WorkerRecordStatus::Shrink
        );
    }

    #[test]
    fn test_views_are_sorted() {
        let state = StateManager::new();
        state.set_profiles(vec![
            FunctionProfile::new("zeta"),
            FunctionProfile::new("alpha"),
        ]);
        let views = state.views();
        assert_eq!(views[0].function_name, "alpha");
        assert_eq!(views[1].function_name, "zeta");
    }
}
