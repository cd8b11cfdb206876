use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::executor::{FailureKind, Outcome};

/// Counters kept by the dispatcher, keyed by topic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchMetrics {
    /// Tasks that reached an outcome (success or failure).
    pub tasks_executed: HashMap<String, u64>,
    /// Failed outcomes by topic and stage.
    pub tasks_failed: HashMap<String, HashMap<FailureKind, u64>>,
    /// Outcomes that ran with fewer overlays than requested.
    pub tasks_degraded: HashMap<String, u64>,
    /// Undecodable messages skipped.
    pub poison_skipped: HashMap<String, u64>,
    /// Priority tasks that ran in the middle of a normal batch.
    pub preemptions: u64,
    /// Tasks abandoned by shutdown.
    pub interrupted: u64,
    /// Mean wall time from dequeue to outcome.
    pub avg_task_duration: HashMap<String, Duration>,
    pub last_run: HashMap<String, DateTime<Utc>>,
}

pub type SharedMetrics = Arc<RwLock<DispatchMetrics>>;

impl DispatchMetrics {
    pub fn record_outcome(&mut self, topic: &str, outcome: &Outcome, duration: Duration) {
        *self.tasks_executed.entry(topic.to_string()).or_default() += 1;
        self.last_run.insert(topic.to_string(), Utc::now());

        if let Some(kind) = outcome.failure_kind() {
            *self
                .tasks_failed
                .entry(topic.to_string())
                .or_default()
                .entry(kind)
                .or_default() += 1;
        }
        if outcome.is_degraded() {
            *self.tasks_degraded.entry(topic.to_string()).or_default() += 1;
        }

        let count = self.tasks_executed[topic];
        let prev_avg = self
            .avg_task_duration
            .get(topic)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
        self.avg_task_duration.insert(topic.to_string(), new_avg);
    }

    pub fn record_poison(&mut self, topic: &str) {
        *self.poison_skipped.entry(topic.to_string()).or_default() += 1;
    }

    pub fn failed(&self, topic: &str, kind: FailureKind) -> u64 {
        self.tasks_failed
            .get(topic)
            .and_then(|by_kind| by_kind.get(&kind))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_executed(&self) -> u64 {
        self.tasks_executed.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::OutcomeResult;
    use crate::cache::Fidelity;
    use kiln_core::Artifact;

    fn ok(fidelity: Fidelity) -> Outcome {
        Outcome {
            task_id: "t".into(),
            attempts: 1,
            fidelity: Some(fidelity),
            result: OutcomeResult::Succeeded(Artifact::png("/tmp/t.png")),
        }
    }

    fn failed(kind: FailureKind) -> Outcome {
        Outcome {
            task_id: "t".into(),
            attempts: 5,
            fidelity: None,
            result: OutcomeResult::Failed {
                kind,
                error: "boom".into(),
            },
        }
    }

    #[test]
    fn record_single_outcome() {
        let mut m = DispatchMetrics::default();
        m.record_outcome("img", &ok(Fidelity::Exact), Duration::from_millis(100));

        assert_eq!(m.tasks_executed["img"], 1);
        assert!(m.last_run.contains_key("img"));
        assert_eq!(m.avg_task_duration["img"], Duration::from_millis(100));
        assert!(m.tasks_degraded.is_empty());
    }

    #[test]
    fn durations_are_averaged() {
        let mut m = DispatchMetrics::default();
        m.record_outcome("img", &ok(Fidelity::Exact), Duration::from_millis(100));
        m.record_outcome("img", &ok(Fidelity::Exact), Duration::from_millis(200));

        let avg = m.avg_task_duration["img"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn failures_and_degradation_are_split_out() {
        let mut m = DispatchMetrics::default();
        m.record_outcome("img", &failed(FailureKind::Synthesis), Duration::ZERO);
        m.record_outcome("img", &failed(FailureKind::Warmup), Duration::ZERO);
        m.record_outcome(
            "vip",
            &ok(Fidelity::Degraded {
                missing: vec!["A".into()],
            }),
            Duration::ZERO,
        );
        m.record_poison("img");

        assert_eq!(m.failed("img", FailureKind::Synthesis), 1);
        assert_eq!(m.failed("img", FailureKind::Delivery), 0);
        assert_eq!(m.failed("vip", FailureKind::Warmup), 0);
        assert_eq!(m.tasks_degraded["vip"], 1);
        assert_eq!(m.poison_skipped["img"], 1);
        assert_eq!(m.total_executed(), 3);
    }
}
