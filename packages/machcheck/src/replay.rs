//! Exact re-execution of a recorded schedule.
//!
//! A [`Replayer`] is a [`ChoicePolicy`] with no freedom: every schedule and
//! data choice must equal the recorded repeat at that depth, and every
//! machine must be created in the recorded order. Anything else raises a
//! [`ReplayDivergence`] naming the depth and what was expected.
//!
//! While replaying, the replayer can also build a receiver-ordered
//! translation of the trace: one schedule choice per dispatched message,
//! naming its target instead of its sender.

use tracing::{debug, info, warn};

use crate::config::CheckerConfig;
use crate::core::{MachineId, Message};
use crate::error::{BugFound, CheckerError, ReplayDivergence, Result};
use crate::program::Program;
use crate::report::Verdict;
use crate::schedule::Schedule;
use crate::scheduler::{CheckContext, ChoicePolicy, Scheduler, SchedulerState};
use crate::value::Value;

/// Strict choice policy driven by a recorded schedule.
#[derive(Debug, Default)]
pub struct Replayer {
    expected_machines: Vec<MachineId>,
    translation: Option<Translation>,
}

#[derive(Debug, Default)]
struct Translation {
    schedule: Schedule,
    depth: usize,
}

impl Replayer {
    /// Replay `schedule`, checking machine creation against its registry
    /// when it has one.
    pub fn new(schedule: &Schedule) -> Self {
        Self {
            expected_machines: schedule.registry().creation_order().to_vec(),
            translation: None,
        }
    }

    /// Also record the receiver-ordered translation.
    pub fn with_translation(mut self) -> Self {
        self.translation = Some(Translation::default());
        self
    }

    /// The translation recorded so far, if enabled.
    pub fn translation(&self) -> Option<&Schedule> {
        self.translation.as_ref().map(|t| &t.schedule)
    }

    pub fn into_translation(self) -> Option<Schedule> {
        self.translation.map(|mut t| {
            t.schedule.set_scheduler_choice_depth(t.depth);
            t.schedule
        })
    }
}

impl ChoicePolicy for Replayer {
    fn schedule_choice(
        &mut self,
        schedule: &mut Schedule,
        depth: usize,
        candidates: Vec<MachineId>,
        _state: u64,
    ) -> Result<Option<MachineId>> {
        if depth >= schedule.len() {
            return Ok(None);
        }
        match schedule.repeat_schedule_choice(depth) {
            Some(expected) if candidates.contains(expected) => Ok(Some(expected.clone())),
            expected => {
                let expected = expected.cloned();
                warn!(depth, ?expected, ?candidates, "replay diverged at schedule choice");
                Err(ReplayDivergence::ScheduleChoice {
                    depth,
                    expected,
                    candidates,
                }
                .into())
            }
        }
    }

    fn data_choice(&mut self, schedule: &mut Schedule, depth: usize, candidates: Vec<Value>, _state: u64) -> Result<Value> {
        match schedule.repeat_data_choice(depth) {
            Some(expected) if candidates.contains(expected) => {
                let value = expected.clone();
                if let Some(t) = self.translation.as_mut() {
                    t.schedule.set_repeat_data_choice(value.clone(), t.depth);
                    t.depth += 1;
                }
                Ok(value)
            }
            expected => {
                let expected = expected.cloned();
                warn!(depth, ?expected, ?candidates, "replay diverged at data choice");
                Err(ReplayDivergence::DataChoice {
                    depth,
                    expected,
                    candidates,
                }
                .into())
            }
        }
    }

    fn machine_created(&mut self, _schedule: &Schedule, position: usize, id: &MachineId) -> Result<()> {
        if !self.expected_machines.is_empty() && self.expected_machines.get(position) != Some(id) {
            return Err(ReplayDivergence::MachineCreation {
                position,
                expected: self.expected_machines.get(position).cloned(),
                actual: id.clone(),
            }
            .into());
        }
        if let Some(t) = self.translation.as_mut() {
            t.schedule.make_machine(id.clone())?;
        }
        Ok(())
    }

    fn message_delivered(&mut self, message: &Message) {
        if let Some(t) = self.translation.as_mut() {
            t.schedule.set_repeat_schedule_choice(message.target.clone(), t.depth);
            t.depth += 1;
        }
    }
}

/// What a replay reproduced.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    pub verdict: Verdict,
    pub bug: Option<BugFound>,
    /// Final scheduler state.
    pub state: SchedulerState,
    /// Messages dispatched.
    pub steps: usize,
    /// Receiver-ordered translation of the replayed trace.
    pub translation: Option<Schedule>,
}

/// Replay `schedule` against `program`.
///
/// A divergence, a specification error or an internal error is returned as
/// `Err`. Bugs the schedule reproduces are part of the outcome.
pub fn replay(
    program: &Program,
    config: &CheckerConfig,
    context: &CheckContext,
    schedule: &Schedule,
) -> Result<ReplayOutcome> {
    let mut working = Schedule::from_choices(schedule.choices().to_vec());
    let mut replayer = Replayer::new(schedule).with_translation();
    info!(program = program.name(), choices = schedule.len(), "replay started");

    let (state, result) = {
        let mut scheduler = Scheduler::new(program, config, context, &mut working, &mut replayer);
        let result = scheduler.run();
        (scheduler.state(), result)
    };

    let (verdict, bug) = match result {
        Ok(_) => {
            let consumed = working.scheduler_choice_depth();
            if consumed < schedule.len() {
                return Err(ReplayDivergence::ScheduleChoice {
                    depth: consumed,
                    expected: schedule.repeat_schedule_choice(consumed).cloned(),
                    candidates: Vec::new(),
                }
                .into());
            }
            (Verdict::Correct, None)
        }
        Err(CheckerError::Bug(bug)) => (Verdict::from(&bug), Some(bug)),
        Err(CheckerError::Resource(exceeded)) => (Verdict::from(&exceeded), None),
        Err(err) => return Err(err),
    };

    let mut translation = replayer.into_translation();
    if let Some(t) = translation.as_mut() {
        t.set_scheduler_depth(working.scheduler_depth());
    }
    debug!(%verdict, steps = working.scheduler_depth(), "replay finished");
    Ok(ReplayOutcome {
        verdict,
        bug,
        state,
        steps: working.scheduler_depth(),
        translation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::MachineType;

    fn chooser() -> Program {
        let ty = MachineType::builder("Chooser")
            .var("picked", 0)
            .start("S")
            .state("S", |s| {
                s.entry(|ctx, _| {
                    let n = ctx.choose_int(3)?;
                    ctx.assert(n != 2, "picked two")?;
                    ctx.set("picked", n)
                })
            })
            .build()
            .unwrap();
        Program::builder("chooser").machine(ty).start("Chooser").build().unwrap()
    }

    fn schedule_with(value: i64) -> Schedule {
        let mut schedule = Schedule::new();
        schedule.set_repeat_data_choice(Value::Int(value), 0);
        schedule
    }

    #[test]
    fn test_replay_reproduces_recorded_choice() {
        let outcome = replay(
            &chooser(),
            &CheckerConfig::default(),
            &CheckContext::unlimited(),
            &schedule_with(2),
        )
        .unwrap();
        assert_eq!(outcome.verdict, Verdict::AssertionFailed);
        assert_eq!(outcome.state, SchedulerState::BugFound);

        let outcome = replay(
            &chooser(),
            &CheckerConfig::default(),
            &CheckContext::unlimited(),
            &schedule_with(1),
        )
        .unwrap();
        assert_eq!(outcome.verdict, Verdict::Correct);
        assert_eq!(outcome.state, SchedulerState::Terminated);
        let translation = outcome.translation.unwrap();
        assert_eq!(translation.repeat_data_choice(0), Some(&Value::Int(1)));
    }

    #[test]
    fn test_out_of_range_value_diverges() {
        let err = replay(
            &chooser(),
            &CheckerConfig::default(),
            &CheckContext::unlimited(),
            &schedule_with(7),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CheckerError::ReplayDivergence(ReplayDivergence::DataChoice { depth: 0, .. })
        ));
    }

    #[test]
    fn test_missing_data_choice_diverges() {
        let err = replay(
            &chooser(),
            &CheckerConfig::default(),
            &CheckContext::unlimited(),
            &Schedule::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CheckerError::ReplayDivergence(ReplayDivergence::DataChoice { expected: None, .. })
        ));
    }

    #[test]
    fn test_unused_choices_diverge() {
        let mut schedule = schedule_with(0);
        schedule.set_repeat_schedule_choice(MachineId::new("Chooser", 0), 1);
        let err = replay(
            &chooser(),
            &CheckerConfig::default(),
            &CheckContext::unlimited(),
            &schedule,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CheckerError::ReplayDivergence(ReplayDivergence::ScheduleChoice { depth: 1, .. })
        ));
    }
}
