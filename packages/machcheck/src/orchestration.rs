//! Choice orchestration: the order in which fresh alternatives are tried.
//!
//! When exploration meets a choice point for the first time, the candidate
//! list is reordered by an [`Orchestrator`]. The first element is taken and
//! the rest become backtracks. Reordering is always a permutation, so it
//! only changes which bug is found first, never what the search covers.
//!
//! # Policies
//!
//! | Policy          | Order                                                 |
//! |-----------------|-------------------------------------------------------|
//! | `Program`       | as the scheduler produced it (creation order)         |
//! | `Random`        | seeded shuffle                                        |
//! | `EpsilonGreedy` | shuffle with probability ε, else best learned score   |
//!
//! The epsilon-greedy policy learns from a [`LearningTable`] shared by every
//! worker of a search. Updates are last-writer-wins and stale reads are fine.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Which orchestration policy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorKind {
    #[default]
    Program,
    Random,
    EpsilonGreedy,
}

const EPSILON_START: f64 = 1.0;
const EPSILON_MIN: f64 = 0.2;
const EPSILON_DECAY: f64 = 0.99999;
const LEARNING_RATE: f64 = 0.3;
const DISCOUNT: f64 = 0.7;
const STEP_REWARD: f64 = -1.0;

/// Learned `(state, action) → score` table shared across workers.
#[derive(Debug, Clone, Default)]
pub struct LearningTable {
    scores: Arc<DashMap<(u64, u64), f64>>,
}

impl LearningTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self, state: u64, action: u64) -> f64 {
        self.scores.get(&(state, action)).map(|s| *s).unwrap_or(0.0)
    }

    /// Apply one temporal-difference update along a path of `(state, action)` pairs.
    pub fn reward_path(&self, path: &[(u64, u64)]) {
        for (i, key) in path.iter().enumerate() {
            let next = path
                .get(i + 1)
                .map(|&(s, a)| self.score(s, a))
                .unwrap_or(0.0);
            let mut entry = self.scores.entry(*key).or_insert(0.0);
            let old = *entry;
            *entry = old + LEARNING_RATE * (STEP_REWARD + DISCOUNT * next - old);
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Hash of a candidate, used as the learning table's action key.
pub fn action_key<T: Hash>(candidate: &T) -> u64 {
    let mut h = DefaultHasher::new();
    candidate.hash(&mut h);
    h.finish()
}

/// Reorders fresh candidate lists.
#[derive(Debug)]
pub struct Orchestrator {
    kind: OrchestratorKind,
    rng: fastrand::Rng,
    epsilon: f64,
    table: LearningTable,
    path: Vec<(u64, u64)>,
}

impl Orchestrator {
    pub fn new(kind: OrchestratorKind, seed: u64, table: LearningTable) -> Self {
        Self {
            kind,
            rng: fastrand::Rng::with_seed(seed),
            epsilon: EPSILON_START,
            table,
            path: Vec::new(),
        }
    }

    pub fn kind(&self) -> OrchestratorKind {
        self.kind
    }

    /// Whether reordering depends on the global state key.
    pub fn wants_state_key(&self) -> bool {
        self.kind == OrchestratorKind::EpsilonGreedy
    }

    /// Permute `candidates` in place.
    pub fn reorder<T: Hash>(&mut self, state: u64, candidates: &mut [T]) {
        if candidates.len() < 2 {
            return;
        }
        match self.kind {
            OrchestratorKind::Program => {}
            OrchestratorKind::Random => self.rng.shuffle(candidates),
            OrchestratorKind::EpsilonGreedy => {
                let explore = self.rng.f64() < self.epsilon;
                self.epsilon = (self.epsilon * EPSILON_DECAY).max(EPSILON_MIN);
                if explore {
                    self.rng.shuffle(candidates);
                } else {
                    let table = &self.table;
                    // Stable, so equally scored candidates keep program order.
                    candidates.sort_by(|a, b| {
                        let sa = table.score(state, action_key(a));
                        let sb = table.score(state, action_key(b));
                        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
                    });
                }
                trace!(state, explore, epsilon = self.epsilon, "candidates reordered");
            }
        }
    }

    /// Note the candidate actually taken at `state`.
    pub fn record<T: Hash>(&mut self, state: u64, taken: &T) {
        if self.kind == OrchestratorKind::EpsilonGreedy {
            self.path.push((state, action_key(taken)));
        }
    }

    /// Feed the finished schedule's path into the learning table.
    pub fn finish_iteration(&mut self) {
        if !self.path.is_empty() {
            self.table.reward_path(&self.path);
            self.path.clear();
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut v: Vec<u32>) -> Vec<u32> {
        v.sort_unstable();
        v
    }

    #[test]
    fn test_every_policy_is_a_permutation() {
        let mut seeds = fastrand::Rng::with_seed(7);
        for kind in [
            OrchestratorKind::Program,
            OrchestratorKind::Random,
            OrchestratorKind::EpsilonGreedy,
        ] {
            let mut o = Orchestrator::new(kind, seeds.u64(..), LearningTable::new());
            for round in 0..50 {
                let n = seeds.usize(0..12);
                let original: Vec<u32> = (0..n as u32).collect();
                let mut v = original.clone();
                o.reorder(round, &mut v);
                assert_eq!(sorted(v), original, "{:?} changed the candidate set", kind);
            }
        }
    }

    #[test]
    fn test_program_order_is_identity() {
        let mut o = Orchestrator::new(OrchestratorKind::Program, 1, LearningTable::new());
        let mut v = vec![3, 1, 2];
        o.reorder(0, &mut v);
        assert_eq!(v, vec![3, 1, 2]);
    }

    #[test]
    fn test_random_is_seed_deterministic() {
        let mut a = Orchestrator::new(OrchestratorKind::Random, 42, LearningTable::new());
        let mut b = Orchestrator::new(OrchestratorKind::Random, 42, LearningTable::new());
        let mut va: Vec<u32> = (0..20).collect();
        let mut vb = va.clone();
        a.reorder(0, &mut va);
        b.reorder(0, &mut vb);
        assert_eq!(va, vb);
    }

    #[test]
    fn test_learning_table_penalizes_visited_actions() {
        let table = LearningTable::new();
        let path = vec![(1, action_key(&"a")), (2, action_key(&"b"))];
        table.reward_path(&path);
        assert!(table.score(1, action_key(&"a")) < 0.0);
        assert_eq!(table.score(1, action_key(&"c")), 0.0);
        assert_eq!(table.len(), 2);

        // Shared across clones.
        let clone = table.clone();
        clone.reward_path(&path);
        assert!(table.score(2, action_key(&"b")) < -0.3);
    }

    #[test]
    fn test_epsilon_decays_towards_floor() {
        let mut o = Orchestrator::new(OrchestratorKind::EpsilonGreedy, 3, LearningTable::new());
        let mut v = vec![1, 2];
        for _ in 0..10 {
            o.reorder(0, &mut v);
        }
        assert!(o.epsilon() < 1.0);
        assert!(o.epsilon() >= EPSILON_MIN);
        o.record(0, &v[0]);
        o.finish_iteration();
        assert!(!o.table.is_empty());
    }
}
