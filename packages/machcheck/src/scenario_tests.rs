//! End-to-end scenarios: search, report, persist and replay whole programs.

#[cfg(test)]
mod scenario_tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use crate::config::{BufferSemantics, CheckerConfig};
    use crate::core::MachineId;
    use crate::error::{BugFound, CheckerError, ReplayDivergence, ResourceExceeded};
    use crate::explorer::Explorer;
    use crate::orchestration::{LearningTable, Orchestrator, OrchestratorKind};
    use crate::replay::replay;
    use crate::report::Verdict;
    use crate::resource::BudgetCheck;
    use crate::schedule::Schedule;
    use crate::scheduler::{CheckContext, ExplorationPolicy, Scheduler, SchedulerState};
    use crate::testing;
    use crate::trace::{RecordingSink, TraceEntry};
    use crate::value::Value;

    // ==========================================================================
    // Helpers
    // ==========================================================================

    fn explore(program: Arc<crate::program::Program>, config: CheckerConfig) -> crate::report::CheckReport {
        Explorer::new(program, config, CheckContext::unlimited()).run().unwrap()
    }

    /// Data choices of each finished iteration, in order.
    fn data_paths(sink: &RecordingSink) -> Vec<Vec<Value>> {
        let mut paths = vec![Vec::new()];
        for entry in sink.entries() {
            match entry {
                TraceEntry::DataChoice(_, v) => paths.last_mut().unwrap().push(v),
                TraceEntry::Finished { .. } => paths.push(Vec::new()),
                _ => {}
            }
        }
        paths.pop();
        paths
    }

    struct Exhausted;

    impl BudgetCheck for Exhausted {
        fn check(&self) -> Result<(), ResourceExceeded> {
            Err(ResourceExceeded::Timeout { limit_secs: 0.5 })
        }
    }

    // ==========================================================================
    // Termination, deadlock, liveness
    // ==========================================================================

    #[test]
    fn test_ping_pong_terminates_in_two_steps() {
        let program = testing::ping_pong().unwrap();
        let config = CheckerConfig::default();
        let context = CheckContext::unlimited();
        let mut schedule = Schedule::new();
        let mut orchestrator = Orchestrator::new(OrchestratorKind::Program, 0, LearningTable::new());
        let mut policy = ExplorationPolicy::new(&mut orchestrator);
        let mut scheduler = Scheduler::new(&program, &config, &context, &mut schedule, &mut policy);

        assert_eq!(scheduler.run().unwrap(), SchedulerState::Terminated);
        assert_eq!(scheduler.steps(), 2);

        let client = scheduler.machine(&MachineId::new("Client", 0)).unwrap();
        assert!(client.buffer().is_empty());
        assert_eq!(client.var("replies"), Some(&Value::Int(0)));
        let server = scheduler.machine(&MachineId::new("Server", 0)).unwrap();
        assert!(server.is_halted());
        assert_eq!(server.buffer().len(), 1);
    }

    #[test]
    fn test_ping_pong_search_is_correct_and_exhaustive() {
        let report = explore(testing::ping_pong().unwrap(), CheckerConfig::default());
        assert_eq!(report.verdict, Verdict::Correct);
        assert!(report.exhaustive);
        assert_eq!(report.stats.iterations, 1);
        assert_eq!(report.stats.max_depth, 2);
    }

    #[test]
    fn test_deferred_forever_is_deadlock() {
        let report = explore(testing::stuck_request().unwrap(), CheckerConfig::default());
        assert_eq!(report.verdict, Verdict::Deadlock);
        let bug = report.bug.unwrap();
        assert_eq!(
            bug.bug,
            BugFound::Deadlock {
                machines: vec![MachineId::new("Asker", 0)]
            }
        );

        let outcome = replay(
            &testing::stuck_request().unwrap(),
            &CheckerConfig::default(),
            &CheckContext::unlimited(),
            &bug.schedule,
        )
        .unwrap();
        assert_eq!(outcome.verdict, Verdict::Deadlock);
        assert_eq!(outcome.state, SchedulerState::Deadlocked);
    }

    #[test]
    fn test_deadlock_under_receiver_queues() {
        let config = CheckerConfig::default().with_buffer_semantics(BufferSemantics::ReceiverQueue);
        let report = explore(testing::stuck_request().unwrap(), config);
        assert_eq!(report.verdict, Verdict::Deadlock);
        // The deferred message sits in the receiver's own buffer.
        assert_eq!(
            report.bug.unwrap().bug,
            BugFound::Deadlock {
                machines: vec![MachineId::new("Busy", 0)]
            }
        );
    }

    #[test]
    fn test_hot_monitor_at_termination_is_liveness_bug() {
        let report = explore(testing::ping_pong_watched().unwrap(), CheckerConfig::default());
        assert_eq!(report.verdict, Verdict::Liveness);

        let report = explore(
            testing::ping_pong_watched().unwrap(),
            CheckerConfig::default().with_check_liveness(false),
        );
        assert_eq!(report.verdict, Verdict::Correct);
    }

    #[test]
    fn test_continuation_defers_until_reply() {
        let program = testing::request_reply().unwrap();
        let config = CheckerConfig::default();
        let sink = Arc::new(RecordingSink::new());
        let context = CheckContext::unlimited().with_sink(sink.clone());
        let mut schedule = Schedule::new();
        let mut orchestrator = Orchestrator::new(OrchestratorKind::Program, 0, LearningTable::new());
        let mut policy = ExplorationPolicy::new(&mut orchestrator);
        let mut scheduler = Scheduler::new(&program, &config, &context, &mut schedule, &mut policy);

        assert_eq!(scheduler.run().unwrap(), SchedulerState::Terminated);
        let caller = scheduler.machine(&MachineId::new("Caller", 0)).unwrap();
        assert_eq!(caller.current_state(), "Done");
        assert!(!caller.is_blocked());
        assert_eq!(caller.var("answer"), Some(&Value::Int(42)));
        assert_eq!(caller.var("notes"), Some(&Value::Int(1)));
        // Exit ran before the clear handler reset the scratch variable.
        assert_eq!(caller.var("scratch"), Some(&Value::Int(0)));

        let events: Vec<String> = sink
            .dispatches()
            .into_iter()
            .map(|(_, e)| e.name().to_string())
            .collect();
        assert_eq!(events, vec!["_create_machine", "Request", "Reply", "Note"]);
    }

    // ==========================================================================
    // Search coverage
    // ==========================================================================

    #[test]
    fn test_binary_tree_explores_every_leaf_once() {
        for per_task in [1, 100] {
            let sink = Arc::new(RecordingSink::new());
            let context = CheckContext::unlimited().with_sink(sink.clone());
            let config = CheckerConfig::default().with_max_schedules_per_task(per_task);
            let mut explorer = Explorer::new(testing::coin_flips(3).unwrap(), config, context);
            let report = explorer.run().unwrap();

            assert_eq!(report.stats.iterations, 8);
            assert!(report.exhaustive);
            let strategy = explorer.strategy();
            assert!(strategy.pending_tasks().is_empty());
            assert_eq!(strategy.finished_tasks().len(), strategy.all_tasks().len());

            let paths = data_paths(&sink);
            assert_eq!(paths.len(), 8);
            let distinct: BTreeSet<_> = paths.into_iter().collect();
            assert_eq!(distinct.len(), 8, "per_task = {}", per_task);
        }
    }

    #[test]
    fn test_orchestrators_preserve_coverage() {
        for kind in [OrchestratorKind::Random, OrchestratorKind::EpsilonGreedy] {
            let config = CheckerConfig::default().with_orchestrator(kind).with_seed(7);
            let report = explore(testing::coin_flips(3).unwrap(), config);
            assert_eq!(report.stats.iterations, 8, "{:?}", kind);
            assert!(report.exhaustive);
        }
    }

    #[test]
    fn test_first_bug_stops_its_task() {
        let mut explorer = Explorer::new(
            testing::racing_reporters(3).unwrap(),
            CheckerConfig::default(),
            CheckContext::unlimited(),
        );
        let report = explorer.run().unwrap();
        assert_eq!(report.verdict, Verdict::AssertionFailed);
        // (0, 1, 2) passes, (0, 2) fails and ends the only task.
        let bug = report.bug.unwrap();
        assert_eq!(bug.iteration, 2);
        assert_eq!(report.stats.iterations, bug.iteration);
        assert_eq!(report.stats.bugs, 1);
        assert_eq!(explorer.strategy().all_tasks().len(), 1);
        assert_eq!(explorer.strategy().finished_tasks().len(), 1);
        // Reporters 1 and 2 going first were never tried.
        assert_eq!(report.stats.abandoned_choices, 2);
        assert!(!report.exhaustive);
        assert_eq!(report.pending_choices, 0);
    }

    #[test]
    fn test_sibling_task_runs_after_bug() {
        let config = CheckerConfig::default().with_max_schedules_per_task(1);
        let mut explorer = Explorer::new(testing::racing_reporters(3).unwrap(), config, CheckContext::unlimited());
        let report = explorer.run().unwrap();

        // The root run splits into a task at depth 3 (reporters 1, 2) and one
        // at depth 4 (reporter 2). The deeper one runs first and fails; its
        // sibling still runs and fails on its own first schedule.
        assert_eq!(report.stats.iterations, 3);
        assert_eq!(report.stats.bugs, 2);
        assert_eq!(report.bug.unwrap().iteration, 2);
        let strategy = explorer.strategy();
        assert_eq!(strategy.all_tasks().len(), 3);
        assert_eq!(strategy.finished_tasks().len(), 3);
        assert!(strategy.pending_tasks().is_empty());
        assert_eq!(report.stats.abandoned_choices, 1);
        assert!(!report.exhaustive);
    }

    #[test]
    fn test_bug_on_last_alternative_keeps_search_exhaustive() {
        let report = explore(testing::racing_reporters(2).unwrap(), CheckerConfig::default());
        // (0, 1) passes, (1) fails with nothing left to try.
        assert_eq!(report.verdict, Verdict::AssertionFailed);
        assert_eq!(report.stats.iterations, 2);
        assert_eq!(report.stats.abandoned_choices, 0);
        assert!(report.exhaustive);
    }

    #[test]
    fn test_parallel_search_matches_split_sequential() {
        // Workers start from the root's fully split frontier, the same tasks
        // a sequential search makes with one schedule per task.
        let sequential = explore(
            testing::racing_reporters(3).unwrap(),
            CheckerConfig::default().with_max_schedules_per_task(1),
        );
        let parallel = Explorer::new(
            testing::racing_reporters(3).unwrap(),
            CheckerConfig::default(),
            CheckContext::unlimited(),
        )
        .run_parallel(4)
        .unwrap();
        assert_eq!(parallel.stats.iterations, sequential.stats.iterations);
        assert_eq!(parallel.stats.bugs, sequential.stats.bugs);
        assert_eq!(parallel.stats.abandoned_choices, sequential.stats.abandoned_choices);
        assert_eq!(parallel.verdict, Verdict::AssertionFailed);
        assert!(!parallel.exhaustive);
    }

    #[test]
    fn test_budget_exhaustion_stops_search() {
        let context = CheckContext::unlimited().with_budget(Arc::new(Exhausted));
        let report = Explorer::new(testing::racing_reporters(3).unwrap(), CheckerConfig::default(), context)
            .run()
            .unwrap();
        assert_eq!(report.verdict, Verdict::Timeout);
        assert!(!report.exhaustive);
        assert_eq!(report.stats.iterations, 1);
    }

    // ==========================================================================
    // Replay
    // ==========================================================================

    #[test]
    fn test_replay_is_deterministic() {
        let report = explore(testing::racing_reporters(3).unwrap(), CheckerConfig::default());
        let schedule = report.bug.unwrap().schedule;
        let program = testing::racing_reporters(3).unwrap();

        let mut traces = Vec::new();
        for _ in 0..2 {
            let sink = Arc::new(RecordingSink::new());
            let context = CheckContext::unlimited().with_sink(sink.clone());
            let outcome = replay(&program, &CheckerConfig::default(), &context, &schedule).unwrap();
            assert_eq!(outcome.verdict, Verdict::AssertionFailed);
            traces.push(sink.entries());
        }
        assert_eq!(traces[0], traces[1]);
        assert!(!traces[0].is_empty());
    }

    #[test]
    fn test_bug_schedule_survives_disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckerConfig::default().with_output_folder(dir.path());
        let report = explore(testing::racing_reporters(2).unwrap(), config.clone());
        assert!(report.found_bug());
        report.write_artifacts(&config.output_folder).unwrap();

        let loaded = Schedule::load(report.schedule_path(&config.output_folder)).unwrap();
        let outcome = replay(
            &testing::racing_reporters(2).unwrap(),
            &config,
            &CheckContext::unlimited(),
            &loaded,
        )
        .unwrap();
        assert_eq!(outcome.verdict, Verdict::AssertionFailed);
        assert_eq!(outcome.bug, report.bug.map(|b| b.bug));

        let translation = outcome.translation.unwrap();
        assert_eq!(translation.len(), outcome.steps);
        assert_eq!(translation.repeat_schedule_choice(0), Some(&MachineId::new("Reporter", 0)));
    }

    #[test]
    fn test_tampered_schedule_diverges() {
        let report = explore(testing::racing_reporters(2).unwrap(), CheckerConfig::default());
        let mut schedule = report.bug.unwrap().schedule;
        // Depth 0 is the first creation; only the collector can run it.
        schedule.set_repeat_schedule_choice(MachineId::new("Reporter", 1), 0);

        let err = replay(
            &testing::racing_reporters(2).unwrap(),
            &CheckerConfig::default(),
            &CheckContext::unlimited(),
            &schedule,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CheckerError::ReplayDivergence(ReplayDivergence::ScheduleChoice { depth: 0, .. })
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_replay_against_other_program_diverges_on_creation() {
        let report = explore(testing::stuck_request().unwrap(), CheckerConfig::default());
        let schedule = report.bug.unwrap().schedule;

        let err = replay(
            &testing::ping_pong().unwrap(),
            &CheckerConfig::default(),
            &CheckContext::unlimited(),
            &schedule,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CheckerError::ReplayDivergence(ReplayDivergence::MachineCreation { position: 0, .. })
        ));
    }
}
