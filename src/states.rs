//! Task lifecycle states and the static transition table.
//!
//! Every state write made through the task store is validated here first.
//! The lease manager adds its own ownership edges on top (see `db::leases`).

use crate::error::{BoardError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Inbox,
    Planned,
    Running,
    Blocked,
    Review,
    Done,
}

impl TaskState {
    /// All states in board order.
    pub const ALL: [TaskState; 6] = [
        TaskState::Inbox,
        TaskState::Planned,
        TaskState::Running,
        TaskState::Blocked,
        TaskState::Review,
        TaskState::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Inbox => "inbox",
            TaskState::Planned => "planned",
            TaskState::Running => "running",
            TaskState::Blocked => "blocked",
            TaskState::Review => "review",
            TaskState::Done => "done",
        }
    }

    /// States reachable from this one through `transition`.
    pub fn allowed_exits(&self) -> &'static [TaskState] {
        match self {
            TaskState::Inbox => &[TaskState::Planned, TaskState::Running, TaskState::Done],
            TaskState::Planned => &[TaskState::Running, TaskState::Blocked],
            TaskState::Running => &[TaskState::Blocked, TaskState::Review, TaskState::Done],
            TaskState::Blocked => &[TaskState::Running, TaskState::Planned],
            TaskState::Review => &[TaskState::Done, TaskState::Blocked],
            TaskState::Done => &[],
        }
    }

    pub fn can_transition_to(&self, to: TaskState) -> bool {
        self.allowed_exits().contains(&to)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_exits().is_empty()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "inbox" => Ok(TaskState::Inbox),
            "planned" => Ok(TaskState::Planned),
            "running" => Ok(TaskState::Running),
            "blocked" => Ok(TaskState::Blocked),
            "review" => Ok(TaskState::Review),
            "done" => Ok(TaskState::Done),
            other => Err(BoardError::validation(
                "state",
                format!(
                    "unknown state '{}'; expected one of {}",
                    other,
                    format_states(&TaskState::ALL)
                ),
            )),
        }
    }
}

/// Check a requested move against the transition table.
pub fn validate_transition(task_id: &str, from: TaskState, to: TaskState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BoardError::InvalidTransition {
            task_id: task_id.to_string(),
            from,
            to,
        })
    }
}

/// Render a list of states as `a, b, c` (or `none`).
pub fn format_states(states: &[TaskState]) -> String {
    if states.is_empty() {
        return "none".to_string();
    }
    states
        .iter()
        .map(TaskState::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
