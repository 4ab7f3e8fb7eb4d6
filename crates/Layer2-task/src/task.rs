//! Task definition

use crate::action::{validate_plan, ActionStep};
use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use pilot_foundation::{ApprovalId, Error, Result, SessionId, TaskId};
use serde::{Deserialize, Serialize};

/// Error recorded when the operator rejects a gated step
pub const REJECTED_BY_OPERATOR: &str = "step rejected by operator";

/// Error recorded for tasks found running after a restart
pub const INTERRUPTED: &str = "interrupted";

/// One unit of planned work: a sequential list of steps
///
/// Invariants: `total_steps == plan.len()`, `current_step <= total_steps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,

    /// Session this task belongs to
    pub session_id: SessionId,

    pub title: String,

    /// Immutable once created
    pub plan: Vec<ActionStep>,

    /// Index of the next step to execute (= number of completed steps)
    pub current_step: usize,

    pub total_steps: usize,

    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub retry_count: u32,

    /// Set while the step loop is parked on an approval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<ApprovalId>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task from a validated plan
    pub fn new(
        session_id: SessionId,
        title: impl Into<String>,
        plan: Vec<ActionStep>,
    ) -> Result<Self> {
        let title = title.into().trim().to_string();
        if title.is_empty() {
            return Err(Error::Validation("task title must not be empty".into()));
        }
        validate_plan(&plan)?;

        Ok(Self {
            id: TaskId::new(),
            session_id,
            title,
            total_steps: plan.len(),
            plan,
            current_step: 0,
            status: TaskStatus::Pending,
            error: None,
            retry_count: 0,
            pending_approval: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    /// The step at `current_step`, if any remain
    pub fn current(&self) -> Option<&ActionStep> {
        self.plan.get(self.current_step)
    }

    pub fn is_done(&self) -> bool {
        self.current_step >= self.total_steps
    }

    /// Fresh run from step 0
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.current_step = 0;
        self.error = None;
        self.pending_approval = None;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
    }

    /// Resume a failed task from its recorded step
    pub fn resume(&mut self) {
        self.status = TaskStatus::Running;
        self.retry_count += 1;
        self.error = None;
        self.pending_approval = None;
        self.completed_at = None;
    }

    /// Record one completed step; completes the task after the last one
    pub fn advance(&mut self) {
        self.current_step = (self.current_step + 1).min(self.total_steps);
        if self.is_done() {
            self.status = TaskStatus::Completed;
            self.completed_at = Some(Utc::now());
        }
    }

    /// Mark task as failed; `current_step` is left as is
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.pending_approval = None;
        self.completed_at = Some(Utc::now());
    }

    /// Mark task as cancelled
    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.pending_approval = None;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            SessionId::new(),
            "demo",
            vec![ActionStep::check_tool("git"), ActionStep::shell_exec("echo hi")],
        )
        .unwrap()
    }

    #[test]
    fn test_new_task_invariants() {
        let task = task();
        assert_eq!(task.total_steps, task.plan.len());
        assert_eq!(task.current_step, 0);
        assert_eq!(task.status, TaskStatus::Pending);

        assert!(Task::new(SessionId::new(), "empty", vec![]).is_err());
        assert!(Task::new(SessionId::new(), " ", vec![ActionStep::check_tool("git")]).is_err());
    }

    #[test]
    fn test_advance_completes_on_last_step() {
        let mut task = task();
        task.start();
        task.advance();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.current_step, 1);
        task.advance();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.current_step, 2);
        task.advance();
        assert_eq!(task.current_step, 2);
    }

    #[test]
    fn test_fail_then_resume_keeps_progress() {
        let mut task = task();
        task.start();
        task.advance();
        task.fail("boom");
        assert_eq!(task.current_step, 1);

        task.resume();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.current_step, 1);
        assert!(task.error.is_none());

        task.cancel();
        task.start();
        assert_eq!(task.current_step, 0);
    }
}
