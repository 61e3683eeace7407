use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::orchestration::OrchestratorKind;
use crate::strategy::StrategyKind;

/// Where outbound messages wait until they are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferSemantics {
    /// Each machine buffers what it sends; the scheduler picks a sender.
    #[default]
    SenderQueue,
    /// Each machine buffers what it receives; the scheduler picks a receiver.
    ReceiverQueue,
}

/// Checker configuration.
///
/// Loaded from `MACHCHECK_*` environment variables, from JSON, or built in
/// code with the `with_*` methods. Zero time/memory limits mean unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Stop after this many schedules (0 = unbounded).
    pub max_schedules: usize,
    /// Maximum dispatched messages per schedule.
    pub max_step_bound: usize,
    /// Treat hitting the step bound as a bug.
    pub fail_on_max_step_bound: bool,
    pub time_limit_secs: f64,
    pub mem_limit_mb: f64,
    pub random_seed: u64,
    pub strategy: StrategyKind,
    pub orchestrator: OrchestratorKind,
    pub buffer_semantics: BufferSemantics,
    /// Schedules run inside one task before its frontier is split into child tasks.
    pub max_schedules_per_task: usize,
    pub detect_cycles: bool,
    pub check_liveness: bool,
    /// Apply the program's do-not-interleave map when computing candidates.
    pub interleave_reduction: bool,
    /// Directory bug schedules and reports are written to.
    pub output_folder: PathBuf,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            max_schedules: 0,
            max_step_bound: 10_000,
            fail_on_max_step_bound: false,
            time_limit_secs: 0.0,
            mem_limit_mb: 0.0,
            random_seed: 0,
            strategy: StrategyKind::Dfs,
            orchestrator: OrchestratorKind::Program,
            buffer_semantics: BufferSemantics::SenderQueue,
            max_schedules_per_task: 100,
            detect_cycles: false,
            check_liveness: true,
            interleave_reduction: false,
            output_folder: PathBuf::from("output"),
        }
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be a valid value (got {:?})", name, raw)),
        Err(_) => Ok(None),
    }
}

impl CheckerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut config = Self::default();
        if let Some(v) = parse_var("MACHCHECK_MAX_SCHEDULES")? {
            config.max_schedules = v;
        }
        if let Some(v) = parse_var("MACHCHECK_MAX_STEPS")? {
            config.max_step_bound = v;
        }
        if let Some(v) = parse_var("MACHCHECK_FAIL_ON_MAX_STEPS")? {
            config.fail_on_max_step_bound = v;
        }
        if let Some(v) = parse_var("MACHCHECK_TIMEOUT_SECS")? {
            config.time_limit_secs = v;
        }
        if let Some(v) = parse_var("MACHCHECK_MEMOUT_MB")? {
            config.mem_limit_mb = v;
        }
        if let Some(v) = parse_var("MACHCHECK_SEED")? {
            config.random_seed = v;
        }
        if let Some(v) = parse_var("MACHCHECK_SCHEDULES_PER_TASK")? {
            config.max_schedules_per_task = v;
        }
        if let Some(v) = parse_var("MACHCHECK_DETECT_CYCLES")? {
            config.detect_cycles = v;
        }
        if let Some(v) = parse_var("MACHCHECK_CHECK_LIVENESS")? {
            config.check_liveness = v;
        }
        if let Some(v) = parse_var("MACHCHECK_INTERLEAVE_REDUCTION")? {
            config.interleave_reduction = v;
        }
        if let Ok(v) = env::var("MACHCHECK_STRATEGY") {
            config.strategy = serde_json::from_value(serde_json::Value::String(v.clone()))
                .with_context(|| format!("MACHCHECK_STRATEGY must be `dfs` (got {:?})", v))?;
        }
        if let Ok(v) = env::var("MACHCHECK_ORCHESTRATOR") {
            config.orchestrator = serde_json::from_value(serde_json::Value::String(v.clone()))
                .with_context(|| {
                    format!(
                        "MACHCHECK_ORCHESTRATOR must be program, random or epsilon_greedy (got {:?})",
                        v
                    )
                })?;
        }
        if let Ok(v) = env::var("MACHCHECK_BUFFER") {
            config.buffer_semantics = serde_json::from_value(serde_json::Value::String(v.clone()))
                .with_context(|| format!("MACHCHECK_BUFFER must be sender_queue or receiver_queue (got {:?})", v))?;
        }
        if let Ok(v) = env::var("MACHCHECK_OUTPUT") {
            config.output_folder = PathBuf::from(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid checker configuration JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot drive a search.
    pub fn validate(&self) -> Result<()> {
        if self.max_step_bound == 0 {
            bail!("max_step_bound must be positive");
        }
        if self.max_schedules_per_task == 0 {
            bail!("max_schedules_per_task must be positive");
        }
        if self.time_limit_secs < 0.0 || !self.time_limit_secs.is_finite() {
            bail!("time_limit_secs must be a non-negative number");
        }
        if self.mem_limit_mb < 0.0 || !self.mem_limit_mb.is_finite() {
            bail!("mem_limit_mb must be a non-negative number");
        }
        Ok(())
    }

    pub fn with_max_schedules(mut self, n: usize) -> Self {
        self.max_schedules = n;
        self
    }

    pub fn with_max_step_bound(mut self, n: usize) -> Self {
        self.max_step_bound = n;
        self
    }

    pub fn with_fail_on_max_step_bound(mut self, fail: bool) -> Self {
        self.fail_on_max_step_bound = fail;
        self
    }

    pub fn with_time_limit_secs(mut self, secs: f64) -> Self {
        self.time_limit_secs = secs;
        self
    }

    pub fn with_mem_limit_mb(mut self, mb: f64) -> Self {
        self.mem_limit_mb = mb;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_orchestrator(mut self, kind: OrchestratorKind) -> Self {
        self.orchestrator = kind;
        self
    }

    pub fn with_buffer_semantics(mut self, semantics: BufferSemantics) -> Self {
        self.buffer_semantics = semantics;
        self
    }

    pub fn with_max_schedules_per_task(mut self, n: usize) -> Self {
        self.max_schedules_per_task = n;
        self
    }

    pub fn with_detect_cycles(mut self, on: bool) -> Self {
        self.detect_cycles = on;
        self
    }

    pub fn with_check_liveness(mut self, on: bool) -> Self {
        self.check_liveness = on;
        self
    }

    pub fn with_interleave_reduction(mut self, on: bool) -> Self {
        self.interleave_reduction = on;
        self
    }

    pub fn with_output_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.output_folder = folder.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CheckerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_semantics, BufferSemantics::SenderQueue);
        assert!(!config.detect_cycles);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = CheckerConfig::from_json(
            r#"{ "max_schedules": 5, "orchestrator": "epsilon_greedy", "buffer_semantics": "receiver_queue" }"#,
        )
        .unwrap();
        assert_eq!(config.max_schedules, 5);
        assert_eq!(config.orchestrator, OrchestratorKind::EpsilonGreedy);
        assert_eq!(config.buffer_semantics, BufferSemantics::ReceiverQueue);
        assert_eq!(config.max_step_bound, CheckerConfig::default().max_step_bound);
    }

    #[test]
    fn test_validation_rejects_zero_bounds() {
        assert!(CheckerConfig::default().with_max_step_bound(0).validate().is_err());
        assert!(CheckerConfig::default().with_max_schedules_per_task(0).validate().is_err());
        assert!(CheckerConfig::default().with_time_limit_secs(-1.0).validate().is_err());
        assert!(CheckerConfig::from_json(r#"{ "max_step_bound": 0 }"#).is_err());
    }

    #[test]
    fn test_builder_methods() {
        let config = CheckerConfig::default()
            .with_max_schedules(10)
            .with_seed(9)
            .with_detect_cycles(true)
            .with_output_folder("/tmp/out");
        assert_eq!(config.max_schedules, 10);
        assert_eq!(config.random_seed, 9);
        assert!(config.detect_cycles);
        assert_eq!(config.output_folder, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn test_from_env_reads_prefixed_variables() {
        // Only this test touches MACHCHECK_* variables.
        env::set_var("MACHCHECK_MAX_SCHEDULES", "42");
        env::set_var("MACHCHECK_ORCHESTRATOR", "random");
        let config = CheckerConfig::from_env().unwrap();
        assert_eq!(config.max_schedules, 42);
        assert_eq!(config.orchestrator, OrchestratorKind::Random);

        env::set_var("MACHCHECK_MAX_SCHEDULES", "many");
        assert!(CheckerConfig::from_env().is_err());

        env::remove_var("MACHCHECK_MAX_SCHEDULES");
        env::remove_var("MACHCHECK_ORCHESTRATOR");
    }
}
