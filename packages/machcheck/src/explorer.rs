//! Systematic search driver.
//!
//! # Overview
//!
//! The [`Explorer`] runs schedule after schedule, each one a fresh
//! [`Scheduler`] over the same [`Schedule`], and moves through the choice
//! tree between them:
//!
//! ```text
//!            ┌──────────────── run one schedule ◄────────────────┐
//!            ▼                                                    │
//!   task over its schedule budget? ──yes──► split backtracks      │
//!            │no                            into child tasks ─┐   │
//!            ▼                                                │   │
//!   deepest alternative ≥ task depth? ──yes──► make it the ───┼───┘
//!            │no                                 repeat,      │
//!            ▼                                   truncate     │
//!   retire task ◄─────────────────────────────────────────────┘
//!            ▼
//!   pop next pending task (LIFO) ──none──► exhaustive
//! ```
//!
//! A bug ends the task it was found in: the task's untried alternatives are
//! dropped and the next pending task runs. The first bug is kept, together
//! with a replay-only copy of its schedule. The search stops on
//! `max_schedules`, when no task is left, or when the budget runs out. It is
//! exhaustive only if no alternative was dropped on the way.
//!
//! # Workers
//!
//! [`Explorer::run_parallel`] runs the root task once, splits its whole
//! frontier into tasks, deals them round-robin to workers and runs each
//! worker's private explorer on `rayon`. Workers share only the learning
//! table and the context's sink and budget.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::choice::{Choice, ChoiceKind};
use crate::config::CheckerConfig;
use crate::error::{BugFound, CheckerError, ResourceExceeded, Result};
use crate::orchestration::Orchestrator;
use crate::program::Program;
use crate::report::{BugReport, CheckReport, Verdict};
use crate::resource::resident_memory_mb;
use crate::schedule::Schedule;
use crate::scheduler::{CheckContext, ExplorationPolicy, Scheduler, SchedulerState};
use crate::stats::SearchStatistics;
use crate::strategy::{SearchStrategy, SearchTask};

/// How one schedule ended, from the search's point of view.
enum Iteration {
    Completed,
    Bug,
    OutOfBudget(ResourceExceeded),
}

/// Drives the search over one program.
pub struct Explorer {
    program: Arc<Program>,
    config: CheckerConfig,
    context: CheckContext,
    strategy: SearchStrategy,
    schedule: Schedule,
    orchestrator: Orchestrator,
    stats: SearchStatistics,
    first_bug: Option<BugReport>,
    aborted: Option<ResourceExceeded>,
    /// Alternative loaded into the schedule but not run yet.
    staged: Option<ChoiceKind>,
    run_id: Uuid,
}

impl Explorer {
    pub fn new(program: Arc<Program>, config: CheckerConfig, context: CheckContext) -> Self {
        let orchestrator = Orchestrator::new(config.orchestrator, config.random_seed, context.learning.clone());
        Self {
            program,
            strategy: SearchStrategy::new(config.strategy),
            config,
            context,
            schedule: Schedule::new(),
            orchestrator,
            stats: SearchStatistics::default(),
            first_bug: None,
            aborted: None,
            staged: None,
            run_id: Uuid::new_v4(),
        }
    }

    /// Explorer for one worker, seeded with tasks handed off by the root.
    fn worker(
        program: Arc<Program>,
        config: CheckerConfig,
        context: CheckContext,
        worker: usize,
        tasks: Vec<SearchTask>,
    ) -> Self {
        let seed = config.random_seed.wrapping_add(worker as u64 + 1);
        let mut explorer = Self::new(program, config.with_seed(seed), context);
        for task in tasks {
            explorer.strategy.adopt_task(task);
        }
        explorer
    }

    pub fn strategy(&self) -> &SearchStrategy {
        &self.strategy
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn stats(&self) -> &SearchStatistics {
        &self.stats
    }

    /// Run the search until `max_schedules`, exhaustion or the budget stops it.
    ///
    /// Specification, internal and persistence errors abort with `Err`.
    pub fn run(&mut self) -> Result<CheckReport> {
        let clock = Instant::now();
        let started_at = Utc::now();
        info!(
            program = self.program.name(),
            run_id = %self.run_id,
            orchestrator = ?self.config.orchestrator,
            "search started"
        );

        let result = self.search();
        self.stats.elapsed += clock.elapsed();
        self.stats.observe_memory(resident_memory_mb());
        let exhaustive = match result {
            Ok(exhaustive) => exhaustive,
            Err(err) => {
                error!(program = self.program.name(), error = %err, class = %err.class(), "search aborted");
                return Err(err);
            }
        };

        let report = self.report(started_at, exhaustive);
        info!(
            program = self.program.name(),
            verdict = %report.verdict,
            iterations = report.stats.iterations,
            exhaustive,
            "search finished"
        );
        Ok(report)
    }

    /// Returns whether the tree was exhausted.
    fn search(&mut self) -> Result<bool> {
        if self.strategy.current_task().is_none() {
            if self.strategy.all_tasks().is_empty() {
                self.strategy.create_first_task()?;
                self.stats.tasks_created += 1;
            } else if !self.next_task() {
                return Ok(true);
            }
        }

        loop {
            if self.config.max_schedules > 0 && self.stats.iterations >= self.config.max_schedules {
                info!(max_schedules = self.config.max_schedules, "schedule limit reached");
                return Ok(false);
            }
            let more = match self.run_iteration()? {
                Iteration::OutOfBudget(exceeded) => {
                    warn!(%exceeded, "search stopped");
                    self.aborted = Some(exceeded);
                    return Ok(false);
                }
                Iteration::Bug => {
                    self.abandon_current_task();
                    self.next_task()
                }
                Iteration::Completed => self.advance(),
            };
            if !more {
                return Ok(true);
            }
        }
    }

    /// Run one schedule and account for it.
    fn run_iteration(&mut self) -> Result<Iteration> {
        self.staged = None;
        let result = {
            let mut policy = ExplorationPolicy::new(&mut self.orchestrator);
            Scheduler::new(&self.program, &self.config, &self.context, &mut self.schedule, &mut policy).run()
        };

        let (iteration, bug, hit_bound) = match result {
            Ok(state) => (Iteration::Completed, None, state == SchedulerState::StepBoundExceeded),
            Err(CheckerError::Bug(bug)) => {
                let hit_bound = matches!(bug, BugFound::StepBoundExceeded { .. });
                (Iteration::Bug, Some(bug), hit_bound)
            }
            Err(CheckerError::Resource(exceeded)) => (Iteration::OutOfBudget(exceeded), None, false),
            Err(err) => return Err(err),
        };

        self.stats.record_schedule(
            self.schedule.scheduler_depth(),
            self.schedule.scheduler_choice_depth(),
            hit_bound,
            bug.is_some(),
        );
        self.strategy.record_schedule();
        self.orchestrator.finish_iteration();
        self.context
            .sink
            .on_finished_iteration(self.stats.iterations, self.schedule.scheduler_depth(), bug.as_ref());

        if let Some(bug) = bug {
            if self.first_bug.is_none() {
                warn!(iteration = self.stats.iterations, %bug, "first bug found");
                self.first_bug = Some(BugReport {
                    bug,
                    schedule: self.schedule.replayable(),
                    iteration: self.stats.iterations,
                });
            } else {
                debug!(iteration = self.stats.iterations, %bug, "bug found");
            }
        }
        Ok(iteration)
    }

    /// Move to the next schedule. `false` once nothing is left to explore.
    fn advance(&mut self) -> bool {
        let Some(task) = self.strategy.current_task() else {
            return self.next_task();
        };
        let (task_id, floor) = (task.id(), task.depth());

        if self.strategy.num_schedules_in_current_task() >= self.config.max_schedules_per_task {
            self.split_current_task(task_id, floor);
            self.retire_current_task();
            return self.next_task();
        }

        if let Some(depth) = self.schedule.deepest_backtrack(floor) {
            if let Some(choice) = self.schedule.choice_mut(depth) {
                choice.advance_to_next_backtrack();
                self.staged = choice.kind();
            }
            self.schedule.truncate(depth + 1);
            debug!(task = task_id, depth, "backtrack");
            return true;
        }

        self.retire_current_task();
        self.next_task()
    }

    /// Turn every alternative at or below `floor` into a child task.
    fn split_current_task(&mut self, parent: usize, floor: usize) {
        for depth in floor..self.schedule.len() {
            let branch = match self.schedule.choice(depth) {
                Some(choice) if !choice.is_backtrack_empty() => choice.backtrack_only(),
                _ => continue,
            };
            let prefix: Vec<Choice> = self.schedule.choices()[..depth]
                .iter()
                .map(Choice::repeat_only)
                .collect();
            self.strategy.create_task(branch, depth, prefix, Some(parent));
            self.schedule.clear_backtrack(depth);
            self.stats.tasks_created += 1;
        }
    }

    /// Retire the current task after a bug, dropping what it had left.
    fn abandon_current_task(&mut self) {
        let Some(task) = self.strategy.current_task() else {
            return;
        };
        let (task_id, floor) = (task.id(), task.depth());
        let dropped = self.schedule.num_backtracks_from(floor);
        debug!(task = task_id, dropped, "task stopped by bug");
        self.stats.abandoned_choices += dropped;
        self.retire_current_task();
    }

    fn retire_current_task(&mut self) {
        self.strategy.finish_current_task();
        self.stats.tasks_finished += 1;
    }

    /// Load the next pending task into the schedule.
    fn next_task(&mut self) -> bool {
        let Some(task) = self.strategy.set_next_task() else {
            return false;
        };
        let mut choices = task.prefix().to_vec();
        let mut branch = task.branch().clone();
        branch.advance_to_next_backtrack();
        self.staged = branch.kind();
        choices.push(branch);
        self.schedule = Schedule::from_choices(choices);
        true
    }

    fn report(&self, started_at: chrono::DateTime<Utc>, exhaustive: bool) -> CheckReport {
        let verdict = match (&self.first_bug, &self.aborted) {
            (Some(bug), _) => Verdict::from(&bug.bug),
            (None, Some(exceeded)) => Verdict::from(exceeded),
            (None, None) => Verdict::Correct,
        };
        let mut pending_choices = self.strategy.num_pending_choices();
        let mut pending_data_choices = self.strategy.num_pending_data_choices();
        if let Some(task) = self.strategy.current_task() {
            pending_choices += self.schedule.num_backtracks_from(task.depth());
            pending_data_choices += self.schedule.num_data_backtracks_from(task.depth());
            match self.staged {
                Some(ChoiceKind::Schedule) => pending_choices += 1,
                Some(ChoiceKind::Data) => {
                    pending_choices += 1;
                    pending_data_choices += 1;
                }
                None => {}
            }
        }
        CheckReport {
            run_id: self.run_id,
            started_at,
            program: self.program.name().to_string(),
            verdict,
            bug: self.first_bug.clone(),
            stats: self.stats.clone(),
            exhaustive: exhaustive && self.stats.abandoned_choices == 0,
            pending_choices,
            pending_data_choices,
        }
    }

    // -------------------------------------------------------------------------
    // Workers
    // -------------------------------------------------------------------------

    /// Split the search across `workers` explorers running on `rayon`.
    ///
    /// With one worker this is [`run`](Self::run). The schedule limit is
    /// divided between workers.
    pub fn run_parallel(mut self, workers: usize) -> Result<CheckReport> {
        if workers <= 1 {
            return self.run();
        }
        let clock = Instant::now();
        let started_at = Utc::now();
        info!(program = self.program.name(), run_id = %self.run_id, workers, "parallel search started");

        let root = self.strategy.create_first_task()?;
        self.stats.tasks_created += 1;
        match self.run_iteration()? {
            Iteration::OutOfBudget(exceeded) => {
                self.aborted = Some(exceeded);
                self.stats.elapsed += clock.elapsed();
                return Ok(self.report(started_at, false));
            }
            Iteration::Bug => {
                self.abandon_current_task();
                self.stats.elapsed += clock.elapsed();
                return Ok(self.report(started_at, true));
            }
            Iteration::Completed => {}
        }
        self.split_current_task(root, 0);
        self.retire_current_task();

        let tasks = self.strategy.hand_off_pending();
        debug!(tasks = tasks.len(), workers, "frontier handed to workers");
        let mut buckets: Vec<Vec<SearchTask>> = (0..workers).map(|_| Vec::new()).collect();
        for (i, task) in tasks.into_iter().enumerate() {
            buckets[i % workers].push(task);
        }

        let remaining = self.config.max_schedules.saturating_sub(self.stats.iterations);
        let mut worker_config = self.config.clone();
        if self.config.max_schedules > 0 {
            worker_config.max_schedules = remaining.div_ceil(workers).max(1);
        }

        let program = Arc::clone(&self.program);
        let context = self.context.clone();
        let reports: Vec<Result<CheckReport>> = buckets
            .into_par_iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(worker, bucket)| {
                let mut explorer =
                    Explorer::worker(Arc::clone(&program), worker_config.clone(), context.clone(), worker, bucket);
                explorer.run()
            })
            .collect();

        let mut exhaustive = true;
        let (mut worker_pending, mut worker_pending_data) = (0, 0);
        for report in reports {
            let report = report?;
            self.stats.merge(&report.stats);
            exhaustive &= report.exhaustive;
            worker_pending += report.pending_choices;
            worker_pending_data += report.pending_data_choices;
            if self.first_bug.is_none() {
                self.first_bug = report.bug;
            }
            if self.aborted.is_none() && matches!(report.verdict, Verdict::Timeout | Verdict::Memout) {
                self.aborted = Some(match report.verdict {
                    Verdict::Timeout => ResourceExceeded::Timeout {
                        limit_secs: self.config.time_limit_secs,
                    },
                    _ => ResourceExceeded::Memout {
                        limit_mb: self.config.mem_limit_mb,
                        used_mb: report.stats.peak_memory_mb,
                    },
                });
            }
        }
        if self.aborted.is_some() || (self.config.max_schedules > 0 && self.stats.iterations >= self.config.max_schedules) {
            exhaustive = false;
        }

        self.stats.elapsed = clock.elapsed();
        self.stats.observe_memory(resident_memory_mb());
        let mut report = self.report(started_at, exhaustive);
        report.pending_choices += worker_pending;
        report.pending_data_choices += worker_pending_data;
        info!(
            program = self.program.name(),
            verdict = %report.verdict,
            iterations = report.stats.iterations,
            exhaustive = report.exhaustive,
            "parallel search finished"
        );
        Ok(report)
    }
}
