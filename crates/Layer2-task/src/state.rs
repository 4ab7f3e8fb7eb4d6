//! Task state machine

use pilot_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Possible states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting for an explicit run
    Pending,

    /// Task's step loop is live (possibly parked on an approval)
    Running,

    /// Every step completed
    Completed,

    /// A step failed or was rejected; `retry` resumes it
    Failed,

    /// Task was cancelled; only a fresh run re-enters it
    Cancelled,
}

impl TaskStatus {
    /// Terminal states: only a fresh run leaves them
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Check if task is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }

    /// States from which `run` starts a fresh pass at step 0
    pub fn can_run(&self) -> bool {
        !self.is_running()
    }

    /// Only a failed task can be resumed
    pub fn can_retry(&self) -> bool {
        matches!(self, TaskStatus::Failed)
    }

    /// Cancellation applies to tasks that have not finished yet
    pub fn can_cancel(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Get a symbol for the state (for terminal output)
    pub fn symbol(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "◯",
            TaskStatus::Running => "⟳",
            TaskStatus::Completed => "✓",
            TaskStatus::Failed => "✗",
            TaskStatus::Cancelled => "⊘",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::Validation(format!("unknown task status: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(TaskStatus::Pending.can_run());
        assert!(TaskStatus::Cancelled.can_run());
        assert!(TaskStatus::Completed.can_run());
        assert!(!TaskStatus::Running.can_run());

        assert!(TaskStatus::Failed.can_retry());
        assert!(!TaskStatus::Cancelled.can_retry());

        assert!(TaskStatus::Running.can_cancel());
        assert!(!TaskStatus::Completed.can_cancel());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }
}
