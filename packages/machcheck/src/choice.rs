//! One recorded nondeterministic decision.
//!
//! A [`Choice`] sits at one index of a [`Schedule`](crate::Schedule) and is
//! either a schedule choice (which machine runs next) or a data choice
//! (which value a handler gets). It carries two halves:
//!
//! - the *repeat* value, the decision to take (again) at this depth
//! - the *backtrack* list, alternatives that existed but were not taken
//!
//! Exploration fills both: the first candidate becomes the repeat, the rest
//! become backtracks. Backtracking pops one alternative and turns it into the
//! new repeat. Replay only ever reads the repeat half.

use serde::{Deserialize, Serialize};

use crate::core::MachineId;
use crate::value::Value;

/// Which kind of decision a choice records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceKind {
    Schedule,
    Data,
}

/// One decision point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repeat_schedule: Option<MachineId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repeat_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    backtrack_schedule: Vec<MachineId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    backtrack_data: Vec<Value>,
}

impl Choice {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Repeat half
    // -------------------------------------------------------------------------

    pub fn set_repeat_schedule_choice(&mut self, choice: MachineId) {
        self.repeat_schedule = Some(choice);
    }

    pub fn set_repeat_data_choice(&mut self, choice: Value) {
        self.repeat_data = Some(choice);
    }

    pub fn repeat_schedule_choice(&self) -> Option<&MachineId> {
        self.repeat_schedule.as_ref()
    }

    pub fn repeat_data_choice(&self) -> Option<&Value> {
        self.repeat_data.as_ref()
    }

    pub fn is_repeat_empty(&self) -> bool {
        self.repeat_schedule.is_none() && self.repeat_data.is_none()
    }

    pub fn clear_repeat(&mut self) {
        self.repeat_schedule = None;
        self.repeat_data = None;
    }

    // -------------------------------------------------------------------------
    // Backtrack half
    // -------------------------------------------------------------------------

    pub fn add_backtrack_schedule_choices(&mut self, choices: impl IntoIterator<Item = MachineId>) {
        self.backtrack_schedule.extend(choices);
    }

    pub fn add_backtrack_data_choices(&mut self, choices: impl IntoIterator<Item = Value>) {
        self.backtrack_data.extend(choices);
    }

    pub fn backtrack_schedule_choices(&self) -> &[MachineId] {
        &self.backtrack_schedule
    }

    pub fn backtrack_data_choices(&self) -> &[Value] {
        &self.backtrack_data
    }

    pub fn is_backtrack_empty(&self) -> bool {
        self.backtrack_schedule.is_empty() && self.backtrack_data.is_empty()
    }

    /// Alternatives left at this point, both kinds.
    pub fn num_backtracks(&self) -> usize {
        self.backtrack_schedule.len() + self.backtrack_data.len()
    }

    pub fn clear_backtrack(&mut self) {
        self.backtrack_schedule.clear();
        self.backtrack_data.clear();
    }

    // -------------------------------------------------------------------------
    // Whole choice
    // -------------------------------------------------------------------------

    /// Reset both halves.
    pub fn clear(&mut self) {
        self.clear_repeat();
        self.clear_backtrack();
    }

    pub fn is_empty(&self) -> bool {
        self.is_repeat_empty() && self.is_backtrack_empty()
    }

    /// The kind of decision recorded here, if any.
    pub fn kind(&self) -> Option<ChoiceKind> {
        if self.repeat_schedule.is_some() || !self.backtrack_schedule.is_empty() {
            Some(ChoiceKind::Schedule)
        } else if self.repeat_data.is_some() || !self.backtrack_data.is_empty() {
            Some(ChoiceKind::Data)
        } else {
            None
        }
    }

    /// Replace the repeat with the first untried alternative.
    ///
    /// Returns `false` (and changes nothing) when no alternative is left.
    pub fn advance_to_next_backtrack(&mut self) -> bool {
        if !self.backtrack_schedule.is_empty() {
            let next = self.backtrack_schedule.remove(0);
            self.clear_repeat();
            self.repeat_schedule = Some(next);
            true
        } else if !self.backtrack_data.is_empty() {
            let next = self.backtrack_data.remove(0);
            self.clear_repeat();
            self.repeat_data = Some(next);
            true
        } else {
            false
        }
    }

    /// A copy carrying only the repeat half.
    pub fn repeat_only(&self) -> Choice {
        Choice {
            repeat_schedule: self.repeat_schedule.clone(),
            repeat_data: self.repeat_data.clone(),
            ..Choice::default()
        }
    }

    /// A copy carrying only the backtrack half.
    pub fn backtrack_only(&self) -> Choice {
        Choice {
            backtrack_schedule: self.backtrack_schedule.clone(),
            backtrack_data: self.backtrack_data.clone(),
            ..Choice::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<MachineId> {
        (0..n).map(|i| MachineId::new("M", i)).collect()
    }

    #[test]
    fn test_repeat_and_backtrack_are_exclusive_after_clears() {
        let mut c = Choice::new();
        c.set_repeat_schedule_choice(MachineId::new("M", 0));
        c.add_backtrack_schedule_choices(ids(3).into_iter().skip(1));
        assert_eq!(c.kind(), Some(ChoiceKind::Schedule));
        assert_eq!(c.num_backtracks(), 2);

        c.clear_repeat();
        c.clear_backtrack();
        assert!(c.repeat_schedule_choice().is_none());
        assert!(c.backtrack_schedule_choices().is_empty());
        assert!(c.is_empty());
        assert_eq!(c.kind(), None);
    }

    #[test]
    fn test_advance_consumes_alternatives_in_order() {
        let mut c = Choice::new();
        c.set_repeat_data_choice(Value::Int(0));
        c.add_backtrack_data_choices([Value::Int(1), Value::Int(2)]);

        assert!(c.advance_to_next_backtrack());
        assert_eq!(c.repeat_data_choice(), Some(&Value::Int(1)));
        assert!(c.advance_to_next_backtrack());
        assert_eq!(c.repeat_data_choice(), Some(&Value::Int(2)));
        assert!(c.is_backtrack_empty());
        assert!(!c.advance_to_next_backtrack());
        assert_eq!(c.repeat_data_choice(), Some(&Value::Int(2)));
    }

    #[test]
    fn test_halves_copy_independently() {
        let mut c = Choice::new();
        c.set_repeat_schedule_choice(MachineId::new("M", 0));
        c.add_backtrack_schedule_choices(ids(2));

        let r = c.repeat_only();
        assert!(r.is_backtrack_empty());
        assert_eq!(r.repeat_schedule_choice(), Some(&MachineId::new("M", 0)));

        let b = c.backtrack_only();
        assert!(b.is_repeat_empty());
        assert_eq!(b.backtrack_schedule_choices().len(), 2);
    }
}
