//! Search verdicts and the artifacts written for them.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{BugFound, ResourceExceeded};
use crate::schedule::Schedule;
use crate::stats::SearchStatistics;

/// Outcome of a search or a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No bug in the schedules explored.
    Correct,
    AssertionFailed,
    Deadlock,
    Cycle,
    Liveness,
    StepBoundExceeded,
    Memout,
    Timeout,
}

impl Verdict {
    pub fn is_bug(&self) -> bool {
        !matches!(self, Verdict::Correct | Verdict::Memout | Verdict::Timeout)
    }
}

impl From<&BugFound> for Verdict {
    fn from(bug: &BugFound) -> Self {
        match bug {
            BugFound::Assertion { .. } => Verdict::AssertionFailed,
            BugFound::Deadlock { .. } => Verdict::Deadlock,
            BugFound::Cycle { .. } => Verdict::Cycle,
            BugFound::StepBoundExceeded { .. } => Verdict::StepBoundExceeded,
            BugFound::Liveness { .. } => Verdict::Liveness,
        }
    }
}

impl From<&ResourceExceeded> for Verdict {
    fn from(exceeded: &ResourceExceeded) -> Self {
        match exceeded {
            ResourceExceeded::Timeout { .. } => Verdict::Timeout,
            ResourceExceeded::Memout { .. } => Verdict::Memout,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Correct => "correct",
            Verdict::AssertionFailed => "assertion failed",
            Verdict::Deadlock => "deadlock",
            Verdict::Cycle => "cycle",
            Verdict::Liveness => "liveness violation",
            Verdict::StepBoundExceeded => "step bound exceeded",
            Verdict::Memout => "memout",
            Verdict::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// A bug together with the schedule that reproduces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BugReport {
    pub bug: BugFound,
    /// Repeat-only copy of the failing schedule, ready for replay.
    pub schedule: Schedule,
    /// Iteration (1-based) in which the bug was found.
    pub iteration: usize,
}

/// Result of one search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub program: String,
    pub verdict: Verdict,
    /// First bug found, if any.
    pub bug: Option<BugReport>,
    pub stats: SearchStatistics,
    /// Every schedule of the tree was explored.
    pub exhaustive: bool,
    /// Alternatives left in pending tasks when the search stopped.
    pub pending_choices: usize,
    pub pending_data_choices: usize,
}

impl CheckReport {
    pub fn found_bug(&self) -> bool {
        self.bug.is_some()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize check report")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid check report JSON")
    }

    /// Write `<run_id>.report.json` and, when a bug was found,
    /// `<run_id>.schedule.json` into `folder`. Returns the report path.
    pub fn write_artifacts(&self, folder: impl AsRef<Path>) -> Result<PathBuf> {
        let folder = folder.as_ref();
        fs::create_dir_all(folder)
            .with_context(|| format!("failed to create output folder {}", folder.display()))?;

        if let Some(bug) = &self.bug {
            let path = self.schedule_path(folder);
            bug.schedule
                .save(&path)
                .with_context(|| format!("failed to write bug schedule {}", path.display()))?;
            info!(path = %path.display(), verdict = %self.verdict, "bug schedule written");
        }

        let path = folder.join(format!("{}.report.json", self.run_id));
        fs::write(&path, self.to_json()?)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        Ok(path)
    }

    /// Where [`write_artifacts`](Self::write_artifacts) puts the bug schedule.
    pub fn schedule_path(&self, folder: impl AsRef<Path>) -> PathBuf {
        folder.as_ref().join(format!("{}.schedule.json", self.run_id))
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} after {} schedules ({} steps, max depth {}){}",
            self.program,
            self.verdict,
            self.stats.iterations,
            self.stats.total_steps,
            self.stats.max_depth,
            if self.exhaustive { ", exhaustive" } else { "" }
        )?;
        if let Some(bug) = &self.bug {
            write!(f, "; {} in iteration {}", bug.bug, bug.iteration)?;
        }
        Ok(())
    }
}
