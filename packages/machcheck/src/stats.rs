//! Counters collected over one search.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Search-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchStatistics {
    /// Schedules run to completion (including those ending in a bug).
    pub iterations: usize,
    /// Messages dispatched across all schedules.
    pub total_steps: usize,
    /// Longest schedule, in dispatched messages.
    pub max_depth: usize,
    /// Most choices resolved by a single schedule.
    pub max_choice_depth: usize,
    /// Schedules that hit the step bound.
    pub step_bound_hits: usize,
    /// Schedules that ended in a bug.
    pub bugs: usize,
    /// Search tasks created.
    pub tasks_created: usize,
    /// Search tasks retired.
    pub tasks_finished: usize,
    /// Untried alternatives dropped because their task hit a bug.
    #[serde(default)]
    pub abandoned_choices: usize,
    /// Wall-clock time spent.
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    /// Peak resident memory observed, in megabytes.
    pub peak_memory_mb: f64,
}

impl SearchStatistics {
    /// Account for one finished schedule.
    pub fn record_schedule(&mut self, steps: usize, choices: usize, hit_bound: bool, bug: bool) {
        self.iterations += 1;
        self.total_steps += steps;
        self.max_depth = self.max_depth.max(steps);
        self.max_choice_depth = self.max_choice_depth.max(choices);
        if hit_bound {
            self.step_bound_hits += 1;
        }
        if bug {
            self.bugs += 1;
        }
    }

    pub fn observe_memory(&mut self, mb: Option<f64>) {
        if let Some(mb) = mb {
            self.peak_memory_mb = self.peak_memory_mb.max(mb);
        }
    }

    /// Fold a worker's statistics into these.
    pub fn merge(&mut self, other: &SearchStatistics) {
        self.iterations += other.iterations;
        self.total_steps += other.total_steps;
        self.max_depth = self.max_depth.max(other.max_depth);
        self.max_choice_depth = self.max_choice_depth.max(other.max_choice_depth);
        self.step_bound_hits += other.step_bound_hits;
        self.bugs += other.bugs;
        self.tasks_created += other.tasks_created;
        self.tasks_finished += other.tasks_finished;
        self.abandoned_choices += other.abandoned_choices;
        self.elapsed = self.elapsed.max(other.elapsed);
        self.peak_memory_mb = self.peak_memory_mb.max(other.peak_memory_mb);
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_merge() {
        let mut a = SearchStatistics::default();
        a.record_schedule(5, 7, false, false);
        a.record_schedule(9, 3, true, true);
        assert_eq!(a.iterations, 2);
        assert_eq!(a.total_steps, 14);
        assert_eq!(a.max_depth, 9);
        assert_eq!(a.max_choice_depth, 7);
        assert_eq!(a.step_bound_hits, 1);
        assert_eq!(a.bugs, 1);

        let mut b = SearchStatistics::default();
        b.record_schedule(20, 1, false, false);
        b.observe_memory(Some(12.5));
        b.abandoned_choices = 2;
        a.merge(&b);
        assert_eq!(a.iterations, 3);
        assert_eq!(a.abandoned_choices, 2);
        assert_eq!(a.max_depth, 20);
        assert_eq!(a.peak_memory_mb, 12.5);
    }

    #[test]
    fn test_serializes_elapsed_as_seconds() {
        let stats = SearchStatistics {
            elapsed: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["elapsed"], serde_json::json!(1.5));
        let back: SearchStatistics = serde_json::from_value(json).unwrap();
        assert_eq!(back.elapsed, Duration::from_millis(1500));
    }
}
