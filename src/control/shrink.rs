//! Shrink victim selection — FIFO, FILO, and LCC draws

use std::cmp::Reverse;

use super::state::{BrokerView, WorkerRecord, WorkerRecordStatus};
use crate::config::ShrinkStrategy;

/// Resolve the effective strategy for one broker: the profile value when
/// recognized, the controller default when absent, LCC on unknown names.
pub fn resolve_strategy(configured: Option<&str>, default: ShrinkStrategy) -> ShrinkStrategy {
    match configured {
        None => default,
        Some(value) => ShrinkStrategy::parse(value).unwrap_or_else(|| {
            tracing::warn!(strategy = value, "Unknown shrink strategy; falling back to LCC");
            ShrinkStrategy::Lcc
        }),
    }
}

/// Draw up to `n` shrink victims from a broker view.
///
/// Only `Running` workers are candidates; ties break lexicographically on
/// credential, so the draw is deterministic for a given view.
pub fn shrink_draw(view: &BrokerView, n: usize, strategy: ShrinkStrategy) -> Vec<WorkerRecord> {
    let mut candidates: Vec<&WorkerRecord> = view
        .workers
        .values()
        .filter(|record| record.status == WorkerRecordStatus::Running)
        .collect();

    match strategy {
        ShrinkStrategy::Fifo => candidates
            .sort_by_key(|record| (record.register_time_ms, record.credential.clone())),
        ShrinkStrategy::Filo => candidates
            .sort_by_key(|record| (Reverse(record.register_time_ms), record.credential.clone())),
        ShrinkStrategy::Lcc => candidates
            .sort_by_key(|record| (record.active_request_count, record.credential.clone())),
    }

    candidates.into_iter().take(n).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(
        name: &str,
        credential: &str,
        register_time_ms: u64,
        active: usize,
    ) -> WorkerRecord {
        WorkerRecord {
            name: name.into(),
            credential: credential.into(),
            register_time_ms,
            active_request_count: active,
            max_activate_requests: 10,
            status: WorkerRecordStatus::Running,
        }
    }

    fn view(records: Vec<WorkerRecord>) -> BrokerView {
        let workers: HashMap<String, WorkerRecord> = records
            .into_iter()
            .map(|r| (r.credential.clone(), r))
            .collect();
        BrokerView {
            function_name: "lambda".into(),
            inspector: false,
            disposable: false,
            profiled: true,
            reservation_count: 0,
            worker_capacity: 10,
            worker_memory_limit_mb: 512,
            shrink_strategy: None,
            redundant_times: 0,
            queued_requests: 0,
            workers,
        }
    }

    #[test]
    fn test_lcc_picks_least_concurrent() {
        let v = view(vec![
            record("coco", "coco", 10, 3),
            record("cocos", "cocos", 20, 1),
            record("alibaba", "alibaba", 30, 2),
        ]);
        let victims = shrink_draw(&v, 2, ShrinkStrategy::Lcc);
        let names: Vec<&str> = victims.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["cocos", "alibaba"]);
    }

    #[test]
    fn test_lcc_ties_break_on_credential() {
        let v = view(vec![
            record("b", "cred-b", 10, 5),
            record("a", "cred-a", 20, 5),
        ]);
        let victims = shrink_draw(&v, 1, ShrinkStrategy::Lcc);
        assert_eq!(victims[0].credential, "cred-a");
    }

    #[test]
    fn test_fifo_picks_oldest() {
        let v = view(vec![
            record("young", "young", 300, 0),
            record("old", "old", 100, 9),
            record("mid", "mid", 200, 4),
        ]);
        let victims = shrink_draw(&v, 2, ShrinkStrategy::Fifo);
        let names: Vec<&str> = victims.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["old", "mid"]);
    }

    #[test]
    fn test_filo_picks_newest() {
        let v = view(vec![
            record("young", "young", 300, 0),
            record("old", "old", 100, 9),
            record("mid", "mid", 200, 4),
        ]);
        let victims = shrink_draw(&v, 2, ShrinkStrategy::Filo);
        let names: Vec<&str> = victims.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["young", "mid"]);
    }

    #[test]
    fn test_draw_capped_by_running_workers() {
        let mut records = vec![
            record("a", "cred-a", 10, 0),
            record("b", "cred-b", 20, 0),
        ];
        records[1].status = WorkerRecordStatus::Shrink;
        let v = view(records);
        let victims = shrink_draw(&v, 5, ShrinkStrategy::Lcc);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].credential, "cred-a");
    }

    #[test]
    fn test_draw_is_deterministic() {
        let v = view(vec![
            record("a", "cred-a", 10, 2),
            record("b", "cred-b", 20, 2),
            record("c", "cred-c", 30, 2),
        ]);
        let first = shrink_draw(&v, 2, ShrinkStrategy::Lcc);
        let second = shrink_draw(&v, 2, ShrinkStrategy::Lcc);
        let creds = |victims: &[WorkerRecord]| {
            victims.iter().map(|r| r.credential.clone()).collect::<Vec<_>>()
        };
        assert_eq!(creds(&first), creds(&second));
        assert_eq!(creds(&first), vec!["cred-a", "cred-b"]);
    }

    #[test]
    fn test_resolve_strategy_profile_wins() {
        assert_eq!(
            resolve_strategy(Some("FIFO"), ShrinkStrategy::Lcc),
            ShrinkStrategy::Fifo
        );
    }

    #[test]
    fn test_resolve_strategy_default_when_absent() {
        assert_eq!(
            resolve_strategy(None, ShrinkStrategy::Filo),
            ShrinkStrategy::Filo
        );
    }

    #[test]
    fn test_resolve_strategy_unknown_falls_back_to_lcc() {
        assert_eq!(
            resolve_strategy(Some("NEWEST"), ShrinkStrategy::Filo),
            ShrinkStrategy::Lcc
        );
    }
}
