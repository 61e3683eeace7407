//! The recorded trace of one run: ordered choices plus a machine registry.
//!
//! # Overview
//!
//! A [`Schedule`] is the single artifact that makes a run reproducible. It
//! is flat and self-contained so it can be written to JSON, copied to
//! another worker, or loaded by a replay in a different process.
//!
//! - `choices[d]` is the decision taken at choice depth `d`
//! - the registry lists machines in creation order and per type, so that
//!   `(type, index)` resolves to the same machine on every replay
//! - `scheduler_depth` counts dispatched messages,
//!   `scheduler_choice_depth` counts resolved choices
//!
//! Choice lists may be longer than `scheduler_choice_depth` while a run is
//! replaying a prefix. The registry is append-only for the lifetime of a run
//! and is reset between runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::choice::Choice;
use crate::core::MachineId;
use crate::error::{CheckerError, Result};
use crate::value::Value;

/// Creation-ordered registry of the machines of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRegistry {
    order: Vec<MachineId>,
    by_type: BTreeMap<String, Vec<MachineId>>,
}

impl MachineRegistry {
    /// Machines in creation order.
    pub fn creation_order(&self) -> &[MachineId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn register(&mut self, id: MachineId) -> Result<()> {
        let per_type = self.by_type.entry(id.type_name().to_string()).or_default();
        if per_type.len() != id.index() {
            return Err(CheckerError::internal(format!(
                "machine {} registered out of order ({} of its type already registered)",
                id,
                per_type.len()
            )));
        }
        per_type.push(id.clone());
        self.order.push(id);
        Ok(())
    }
}

/// Ordered choices plus the machine registry of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    choices: Vec<Choice>,
    #[serde(default)]
    registry: MachineRegistry,
    #[serde(default)]
    scheduler_depth: usize,
    #[serde(default)]
    scheduler_choice_depth: usize,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schedule from previously recorded choices.
    pub fn from_choices(choices: Vec<Choice>) -> Self {
        Self {
            choices,
            ..Self::default()
        }
    }

    pub fn choices(&self) -> &[Choice] {
        &self.choices
    }

    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }

    pub fn choice(&self, depth: usize) -> Option<&Choice> {
        self.choices.get(depth)
    }

    pub fn choice_mut(&mut self, depth: usize) -> Option<&mut Choice> {
        self.choices.get_mut(depth)
    }

    fn choice_at(&mut self, depth: usize) -> &mut Choice {
        if depth >= self.choices.len() {
            self.choices.resize_with(depth + 1, Choice::default);
        }
        &mut self.choices[depth]
    }

    // -------------------------------------------------------------------------
    // Repeat / backtrack by depth
    // -------------------------------------------------------------------------

    pub fn set_repeat_schedule_choice(&mut self, choice: MachineId, depth: usize) {
        self.choice_at(depth).set_repeat_schedule_choice(choice);
    }

    pub fn set_repeat_data_choice(&mut self, choice: Value, depth: usize) {
        self.choice_at(depth).set_repeat_data_choice(choice);
    }

    pub fn add_backtrack_schedule_choices(&mut self, choices: Vec<MachineId>, depth: usize) {
        if choices.is_empty() && depth < self.choices.len() {
            return;
        }
        self.choice_at(depth).add_backtrack_schedule_choices(choices);
    }

    pub fn add_backtrack_data_choices(&mut self, choices: Vec<Value>, depth: usize) {
        if choices.is_empty() && depth < self.choices.len() {
            return;
        }
        self.choice_at(depth).add_backtrack_data_choices(choices);
    }

    pub fn repeat_schedule_choice(&self, depth: usize) -> Option<&MachineId> {
        self.choices.get(depth).and_then(Choice::repeat_schedule_choice)
    }

    pub fn repeat_data_choice(&self, depth: usize) -> Option<&Value> {
        self.choices.get(depth).and_then(Choice::repeat_data_choice)
    }

    pub fn backtrack_schedule_choices(&self, depth: usize) -> &[MachineId] {
        self.choices
            .get(depth)
            .map(Choice::backtrack_schedule_choices)
            .unwrap_or(&[])
    }

    pub fn backtrack_data_choices(&self, depth: usize) -> &[Value] {
        self.choices
            .get(depth)
            .map(Choice::backtrack_data_choices)
            .unwrap_or(&[])
    }

    pub fn clear_repeat(&mut self, depth: usize) {
        if let Some(c) = self.choices.get_mut(depth) {
            c.clear_repeat();
        }
    }

    pub fn clear_backtrack(&mut self, depth: usize) {
        if let Some(c) = self.choices.get_mut(depth) {
            c.clear_backtrack();
        }
    }

    pub fn clear_choice(&mut self, depth: usize) {
        if let Some(c) = self.choices.get_mut(depth) {
            c.clear();
        }
    }

    /// Drop every choice at index `len` and beyond.
    pub fn truncate(&mut self, len: usize) {
        self.choices.truncate(len);
    }

    /// Remaining alternatives across all depths.
    pub fn num_backtracks_in_schedule(&self) -> usize {
        self.choices.iter().map(Choice::num_backtracks).sum()
    }

    /// Remaining data alternatives across all depths.
    pub fn num_data_backtracks_in_schedule(&self) -> usize {
        self.choices
            .iter()
            .map(|c| c.backtrack_data_choices().len())
            .sum()
    }

    /// Remaining alternatives at depth `floor` and deeper.
    pub fn num_backtracks_from(&self, floor: usize) -> usize {
        self.choices.iter().skip(floor).map(Choice::num_backtracks).sum()
    }

    /// Remaining data alternatives at depth `floor` and deeper.
    pub fn num_data_backtracks_from(&self, floor: usize) -> usize {
        self.choices
            .iter()
            .skip(floor)
            .map(|c| c.backtrack_data_choices().len())
            .sum()
    }

    /// Deepest depth at or above `floor` that still has an alternative.
    pub fn deepest_backtrack(&self, floor: usize) -> Option<usize> {
        (floor..self.choices.len())
            .rev()
            .find(|&d| !self.choices[d].is_backtrack_empty())
    }

    // -------------------------------------------------------------------------
    // Machine registry
    // -------------------------------------------------------------------------

    /// Register a newly created machine.
    pub fn make_machine(&mut self, id: MachineId) -> Result<()> {
        self.registry.register(id)
    }

    pub fn has_machine(&self, type_name: &str, index: usize) -> bool {
        self.machine(type_name, index).is_some()
    }

    pub fn machine(&self, type_name: &str, index: usize) -> Option<&MachineId> {
        self.registry.by_type.get(type_name).and_then(|v| v.get(index))
    }

    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }

    // -------------------------------------------------------------------------
    // Run bookkeeping
    // -------------------------------------------------------------------------

    pub fn scheduler_depth(&self) -> usize {
        self.scheduler_depth
    }

    pub fn scheduler_choice_depth(&self) -> usize {
        self.scheduler_choice_depth
    }

    pub(crate) fn set_scheduler_depth(&mut self, depth: usize) {
        self.scheduler_depth = depth;
    }

    pub(crate) fn set_scheduler_choice_depth(&mut self, depth: usize) {
        self.scheduler_choice_depth = depth;
    }

    /// Forget the previous run's machines and counters, keep the choices.
    pub fn reset_run(&mut self) {
        self.registry = MachineRegistry::default();
        self.scheduler_depth = 0;
        self.scheduler_choice_depth = 0;
    }

    /// A replay-only copy of what this run actually did: repeat halves of the
    /// choices taken so far, and the machines it created.
    pub fn replayable(&self) -> Schedule {
        let taken = self.scheduler_choice_depth.min(self.choices.len());
        Schedule {
            choices: self.choices[..taken].iter().map(Choice::repeat_only).collect(),
            registry: self.registry.clone(),
            scheduler_depth: self.scheduler_depth,
            scheduler_choice_depth: self.scheduler_choice_depth,
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write the schedule as JSON to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json()?).map_err(CheckerError::from)
    }

    /// Read a schedule written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(i: usize) -> MachineId {
        MachineId::new("M", i)
    }

    #[test]
    fn test_setting_repeat_grows_choice_list() {
        let mut s = Schedule::new();
        s.set_repeat_schedule_choice(m(0), 2);
        assert_eq!(s.len(), 3);
        assert!(s.choice(0).unwrap().is_empty());
        assert_eq!(s.repeat_schedule_choice(2), Some(&m(0)));
        assert!(s.repeat_schedule_choice(7).is_none());
        assert!(s.backtrack_data_choices(7).is_empty());
    }

    #[test]
    fn test_backtrack_counts_and_deepest() {
        let mut s = Schedule::new();
        s.set_repeat_schedule_choice(m(0), 0);
        s.add_backtrack_schedule_choices(vec![m(1), m(2)], 0);
        s.set_repeat_data_choice(Value::Bool(false), 1);
        s.add_backtrack_data_choices(vec![Value::Bool(true)], 1);
        s.set_repeat_schedule_choice(m(0), 2);
        s.add_backtrack_schedule_choices(vec![], 2);

        assert_eq!(s.num_backtracks_in_schedule(), 3);
        assert_eq!(s.num_data_backtracks_in_schedule(), 1);
        assert_eq!(s.deepest_backtrack(0), Some(1));
        assert_eq!(s.deepest_backtrack(2), None);
        assert_eq!(s.num_backtracks_from(1), 1);
        assert_eq!(s.num_data_backtracks_from(1), 1);
        assert_eq!(s.num_backtracks_from(2), 0);

        s.clear_backtrack(1);
        assert_eq!(s.deepest_backtrack(0), Some(0));
        s.clear_choice(0);
        assert_eq!(s.num_backtracks_in_schedule(), 0);
        assert!(s.repeat_schedule_choice(0).is_none());
    }

    #[test]
    fn test_registry_resolves_by_type_and_index() {
        let mut s = Schedule::new();
        s.make_machine(MachineId::new("Client", 0)).unwrap();
        s.make_machine(MachineId::new("Server", 0)).unwrap();
        s.make_machine(MachineId::new("Client", 1)).unwrap();

        assert!(s.has_machine("Client", 1));
        assert!(!s.has_machine("Server", 1));
        assert_eq!(s.machine("Client", 1), Some(&MachineId::new("Client", 1)));
        assert_eq!(s.registry().creation_order().len(), 3);

        assert!(s.make_machine(MachineId::new("Client", 5)).is_err());
    }

    #[test]
    fn test_replayable_copy_strips_backtracks_and_truncates() {
        let mut s = Schedule::new();
        s.set_repeat_schedule_choice(m(0), 0);
        s.add_backtrack_schedule_choices(vec![m(1)], 0);
        s.set_repeat_data_choice(Value::Int(3), 1);
        s.set_repeat_data_choice(Value::Int(4), 2);
        s.set_scheduler_choice_depth(2);
        s.set_scheduler_depth(1);

        let r = s.replayable();
        assert_eq!(r.len(), 2);
        assert_eq!(r.num_backtracks_in_schedule(), 0);
        assert_eq!(r.repeat_data_choice(1), Some(&Value::Int(3)));
        assert_eq!(r.scheduler_depth(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bug.schedule.json");

        let mut s = Schedule::new();
        s.make_machine(MachineId::new("Client", 0)).unwrap();
        s.set_repeat_schedule_choice(MachineId::new("Client", 0), 0);
        s.set_repeat_data_choice(Value::Str("x".into()), 1);
        s.save(&path).unwrap();

        let loaded = Schedule::load(&path).unwrap();
        assert_eq!(loaded, s);

        let err = Schedule::load(dir.path().join("missing.json")).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Persistence);
    }

    #[test]
    fn test_reset_run_keeps_choices() {
        let mut s = Schedule::new();
        s.make_machine(m(0)).unwrap();
        s.set_repeat_schedule_choice(m(0), 0);
        s.set_scheduler_depth(4);
        s.reset_run();
        assert!(s.registry().is_empty());
        assert_eq!(s.scheduler_depth(), 0);
        assert_eq!(s.len(), 1);
    }
}
