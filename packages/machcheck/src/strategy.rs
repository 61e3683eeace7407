//! Search tasks and the frontier that orders them.
//!
//! # Overview
//!
//! The choice tree is explored as a tree of [`SearchTask`]s. A task owns one
//! subtree: the repeat-only `prefix` leading to its branch point, and the
//! untried alternatives (`branch`) at that point. The explorer runs schedules
//! inside the current task until either its subtree is exhausted or it is
//! split, then asks the [`SearchStrategy`] for the next pending task.
//!
//! ```text
//! create_first_task ─► current ─┬─► finish_current_task ─► finished
//!                               └─► create_task(child) ─► pending ─► set_next_task ─► current
//! ```
//!
//! `all_tasks` is append-only. Pending and finished ids partition every
//! created id except the current one.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::choice::Choice;
use crate::error::{CheckerError, Result};

/// Order in which pending tasks are picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Most recently created first.
    #[default]
    Dfs,
}

/// One node of the backtracking tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTask {
    id: usize,
    parent: Option<usize>,
    depth: usize,
    prefix: Vec<Choice>,
    branch: Choice,
    num_schedules: usize,
}

impl SearchTask {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Choice depth of the branch point. Nothing shallower belongs to this task.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Repeat-only choices leading to the branch point.
    pub fn prefix(&self) -> &[Choice] {
        &self.prefix
    }

    /// Untried alternatives at the branch point.
    pub fn branch(&self) -> &Choice {
        &self.branch
    }

    pub fn num_unexplored_schedule_choices(&self) -> usize {
        self.branch.backtrack_schedule_choices().len()
    }

    pub fn num_unexplored_data_choices(&self) -> usize {
        self.branch.backtrack_data_choices().len()
    }

    /// Schedules run under this task so far.
    pub fn num_schedules(&self) -> usize {
        self.num_schedules
    }

    /// Whether this is the root task (empty prefix, nothing to branch on).
    pub fn is_root(&self) -> bool {
        self.depth == 0 && self.prefix.is_empty() && self.branch.is_empty()
    }
}

/// Owner of every search task and of the pending frontier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchStrategy {
    kind: StrategyKind,
    all_tasks: Vec<SearchTask>,
    pending: Vec<usize>,
    finished: Vec<usize>,
    current: Option<usize>,
}

impl SearchStrategy {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    /// Register a new pending task. Returns its id.
    pub fn create_task(&mut self, branch: Choice, depth: usize, prefix: Vec<Choice>, parent: Option<usize>) -> usize {
        let id = self.all_tasks.len();
        self.all_tasks.push(SearchTask {
            id,
            parent,
            depth,
            prefix,
            branch,
            num_schedules: 0,
        });
        self.pending.push(id);
        debug!(task = id, ?parent, depth, "search task created");
        id
    }

    /// Create the root task and make it current.
    pub fn create_first_task(&mut self) -> Result<usize> {
        if !self.all_tasks.is_empty() {
            return Err(CheckerError::internal("first search task created twice"));
        }
        let id = self.create_task(Choice::default(), 0, Vec::new(), None);
        self.set_current(id);
        Ok(id)
    }

    /// Adopt a task handed over from another strategy. It gets a fresh id here.
    pub fn adopt_task(&mut self, task: SearchTask) -> usize {
        self.create_task(task.branch, task.depth, task.prefix, None)
    }

    fn set_current(&mut self, id: usize) {
        self.pending.retain(|&p| p != id);
        self.current = Some(id);
    }

    fn pop_next_task(&mut self) -> Option<usize> {
        match self.kind {
            StrategyKind::Dfs => self.pending.pop(),
        }
    }

    /// Promote the next pending task to current. `None` when the frontier is empty.
    pub fn set_next_task(&mut self) -> Option<&SearchTask> {
        let next = self.pop_next_task()?;
        self.set_current(next);
        debug!(task = next, pending = self.pending.len(), "search task selected");
        self.all_tasks.get(next)
    }

    /// Retire the current task.
    pub fn finish_current_task(&mut self) {
        if let Some(id) = self.current.take() {
            self.finished.push(id);
            debug!(task = id, "search task finished");
        }
    }

    /// Remove every pending task and mark it finished here, returning copies
    /// for other workers to adopt.
    pub fn hand_off_pending(&mut self) -> Vec<SearchTask> {
        let ids = std::mem::take(&mut self.pending);
        self.finished.extend(ids.iter().copied());
        ids.into_iter()
            .filter_map(|id| self.all_tasks.get(id).cloned())
            .collect()
    }

    pub fn current_task(&self) -> Option<&SearchTask> {
        self.current.and_then(|id| self.all_tasks.get(id))
    }

    /// Count a finished schedule against the current task.
    pub fn record_schedule(&mut self) {
        if let Some(task) = self.current.and_then(|id| self.all_tasks.get_mut(id)) {
            task.num_schedules += 1;
        }
    }

    pub fn num_schedules_in_current_task(&self) -> usize {
        self.current_task().map(SearchTask::num_schedules).unwrap_or(0)
    }

    pub fn task(&self, id: usize) -> Option<&SearchTask> {
        self.all_tasks.get(id)
    }

    pub fn all_tasks(&self) -> &[SearchTask] {
        &self.all_tasks
    }

    /// Pending task ids, next to be picked last.
    pub fn pending_tasks(&self) -> &[usize] {
        &self.pending
    }

    pub fn finished_tasks(&self) -> &[usize] {
        &self.finished
    }

    pub fn current_task_id(&self) -> Option<usize> {
        self.current
    }

    /// Alternatives left across all pending tasks.
    pub fn num_pending_choices(&self) -> usize {
        self.pending
            .iter()
            .filter_map(|&id| self.all_tasks.get(id))
            .map(|t| t.num_unexplored_schedule_choices() + t.num_unexplored_data_choices())
            .sum()
    }

    /// Data alternatives left across all pending tasks.
    pub fn num_pending_data_choices(&self) -> usize {
        self.pending
            .iter()
            .filter_map(|&id| self.all_tasks.get(id))
            .map(SearchTask::num_unexplored_data_choices)
            .sum()
    }
}
