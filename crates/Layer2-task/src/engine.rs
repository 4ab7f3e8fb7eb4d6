//! Task Engine - 태스크 상태 머신과 스텝 루프
//!
//! ```text
//!   pending ──run──► running ──step──► running ──last step──► completed
//!      ▲                │  │                                     │
//!      │              fail cancel                                │
//!      │                ▼  ▼                                     │
//!      │            failed  cancelled ◄──────── run (fresh) ─────┘
//!      │              │ retry (resume)
//!      └──────────────┘
//! ```
//!
//! - 태스크마다 하나의 스텝 루프 (tokio task), 스텝은 엄격히 순차 실행
//! - 태스크 필드는 태스크별 async mutex로 직렬화
//! - 취소는 `CancellationToken` 신호, 다음 체크포인트에서 관찰
//! - 위험한 스텝은 승인 대기 중 해당 태스크만 멈춤

use crate::action::{ActionKind, ActionStep};
use crate::approval::{Allowlist, Approval, ApprovalGate, ApprovalOutcome};
use crate::executor::{StepContext, StepFailure, StepOutput, ToolInvoker};
use crate::lock::KeyedLocks;
use crate::log::{LogEntry, LogLevel};
use crate::state::TaskStatus;
use crate::store::Store;
use crate::task::{Task, INTERRUPTED, REJECTED_BY_OPERATOR};
use futures::future::join_all;
use parking_lot::Mutex;
use pilot_foundation::{
    ApprovalId, Error, EventBus, Result, Session, SessionId, StepMode, StreamEvent, TaskId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reason attached to an approval closed because its task was cancelled
pub const TASK_CANCELLED: &str = "task cancelled";

/// Whether a step must wait for the operator
///
/// Dry-run never gates: nothing is executed, so there is nothing to approve.
pub fn requires_approval(kind: ActionKind, mode: StepMode, allowlisted: bool) -> bool {
    kind.is_gated() && !mode.allow_destructive && !mode.dry_run && !allowlisted
}

/// A live step loop
struct ActiveRun {
    generation: u64,
    cancel: CancellationToken,
    /// Closed when the loop exits
    done: watch::Receiver<()>,
}

/// Drives tasks through their plans
pub struct TaskEngine {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    gate: Arc<ApprovalGate>,
    allowlist: Arc<Allowlist>,
    invoker: Arc<dyn ToolInvoker>,
    task_locks: KeyedLocks<TaskId, AsyncMutex<()>>,
    /// run/retry take the read side, `halt_session` the write side
    start_gates: KeyedLocks<SessionId, AsyncRwLock<()>>,
    runs: Mutex<HashMap<TaskId, ActiveRun>>,
    generation: AtomicU64,
}

impl TaskEngine {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        gate: Arc<ApprovalGate>,
        allowlist: Arc<Allowlist>,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Self {
        Self {
            store,
            bus,
            gate,
            allowlist,
            invoker,
            task_locks: KeyedLocks::new(),
            start_gates: KeyedLocks::new(),
            runs: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn allowlist(&self) -> &Arc<Allowlist> {
        &self.allowlist
    }

    // ========================================================================
    // Task records
    // ========================================================================

    /// Validate the plan and persist a pending task
    pub fn create_task(
        &self,
        session_id: SessionId,
        title: impl Into<String>,
        plan: Vec<ActionStep>,
    ) -> Result<Task> {
        self.store.get_session(session_id)?;
        let task = Task::new(session_id, title, plan)?;
        self.store.create_task(&task)?;

        info!(
            session_id = %session_id,
            task_id = %task.id,
            steps = task.total_steps,
            "Created task '{}'", task.title
        );
        Ok(task)
    }

    pub fn get(&self, task_id: TaskId) -> Result<Task> {
        self.store.get_task(task_id)
    }

    pub fn list(&self, session_id: SessionId) -> Result<Vec<Task>> {
        self.store.list_tasks(session_id)
    }

    /// Number of live step loops
    pub fn active_runs(&self) -> usize {
        self.runs.lock().len()
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Fresh run from step 0 (pending, completed, cancelled or failed)
    pub async fn run(self: &Arc<Self>, task_id: TaskId) -> Result<Task> {
        let session_id = self.store.get_task(task_id)?.session_id;
        let _start = self.start_gates.get(session_id).read_owned().await;
        let _guard = self.task_locks.get(task_id).lock_owned().await;

        let mut task = self.store.get_task(task_id)?;
        if !task.status.can_run() {
            return Err(Error::Conflict(format!("task {} is already running", task_id)));
        }
        self.store.get_session(session_id)?;

        task.start();
        self.store.update_task(&task)?;
        info!(session_id = %session_id, task_id = %task_id, "Task started");

        self.bus
            .publish(StreamEvent::task_start(
                session_id,
                task_id,
                task.current_step,
                task.total_steps,
                task.retry_count,
            ))
            .await;
        self.launch(task_id);
        Ok(task)
    }

    /// Resume a failed task from its recorded step
    pub async fn retry(self: &Arc<Self>, task_id: TaskId) -> Result<Task> {
        let session_id = self.store.get_task(task_id)?.session_id;
        let _start = self.start_gates.get(session_id).read_owned().await;
        let _guard = self.task_locks.get(task_id).lock_owned().await;

        let mut task = self.store.get_task(task_id)?;
        if !task.status.can_retry() {
            return Err(Error::Conflict(format!(
                "task {} is {}, only failed tasks can be retried",
                task_id, task.status
            )));
        }

        task.resume();
        self.store.update_task(&task)?;
        info!(
            session_id = %session_id,
            task_id = %task_id,
            step = task.current_step,
            retry = task.retry_count,
            "Task resumed"
        );

        self.bus
            .publish(StreamEvent::task_start(
                session_id,
                task_id,
                task.current_step,
                task.total_steps,
                task.retry_count,
            ))
            .await;
        self.launch(task_id);
        Ok(task)
    }

    /// Cancel a pending or running task
    ///
    /// The status changes immediately; the step loop stops at its next checkpoint.
    pub async fn cancel(&self, task_id: TaskId) -> Result<Task> {
        let _guard = self.task_locks.get(task_id).lock_owned().await;

        let mut task = self.store.get_task(task_id)?;
        if !task.status.can_cancel() {
            return Err(Error::Conflict(format!(
                "task {} is {}, cannot cancel",
                task_id, task.status
            )));
        }

        self.cancel_locked(&mut task).await?;
        self.log(
            task.session_id,
            Some(task_id),
            LogLevel::Warn,
            format!("Task '{}' cancelled at step {}", task.title, task.current_step),
        )
        .await;
        Ok(task)
    }

    /// Caller holds the task lock
    async fn cancel_locked(&self, task: &mut Task) -> Result<()> {
        let pending = task.pending_approval;
        task.cancel();
        self.store.update_task(task)?;

        let token = self.runs.lock().get(&task.id).map(|r| r.cancel.clone());
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(approval_id) = pending {
            self.gate.withdraw(approval_id, TASK_CANCELLED).await?;
        }

        info!(session_id = %task.session_id, task_id = %task.id, "Task cancelled");
        Ok(())
    }

    /// Cancel every running task of a session
    ///
    /// Holds the session's start gate, so no task of the session enters
    /// `running` until this returns. Returns the cancelled task ids.
    pub async fn halt_session(&self, session_id: SessionId) -> Result<Vec<TaskId>> {
        let _start = self.start_gates.get(session_id).write_owned().await;

        let mut cancelled = Vec::new();
        for task in self.store.list_tasks(session_id)? {
            if !task.status.is_running() {
                continue;
            }
            let _guard = self.task_locks.get(task.id).lock_owned().await;
            let mut task = self.store.get_task(task.id)?;
            if task.status.is_running() {
                self.cancel_locked(&mut task).await?;
                cancelled.push(task.id);
            }
        }

        warn!(
            session_id = %session_id,
            count = cancelled.len(),
            "Session halted"
        );
        Ok(cancelled)
    }

    /// Apply an operator decision to an approval and the task parked on it
    ///
    /// A rejection fails the task before this returns. `dont_ask_again`
    /// allowlists the action kind only when this call approved it.
    pub async fn resolve_approval(
        &self,
        approval_id: ApprovalId,
        approved: bool,
        dont_ask_again: bool,
    ) -> Result<Approval> {
        let task_id = self.gate.get(approval_id)?.task_id;
        let guard = match task_id {
            Some(task_id) => Some(self.task_locks.get(task_id).lock_owned().await),
            None => None,
        };

        let approval = self.gate.resolve(approval_id, approved).await?;
        if approved && dont_ask_again {
            self.allowlist.allow(approval.session_id, approval.action);
        }

        let Some(task_id) = task_id else {
            return Ok(approval);
        };
        let mut task = self.store.get_task(task_id)?;
        if !task.status.is_running() || task.pending_approval != Some(approval_id) {
            return Ok(approval);
        }

        if approved {
            task.pending_approval = None;
            self.store.update_task(&task)?;
        } else {
            // 루프의 fail_task는 이미 실패한 태스크를 건너뜀
            task.fail(REJECTED_BY_OPERATOR);
            self.store.update_task(&task)?;
            drop(guard);
            self.announce_failure(&task, REJECTED_BY_OPERATOR).await;
        }
        Ok(approval)
    }

    /// Wait until the task's current step loop exits
    pub async fn wait(&self, task_id: TaskId) -> Result<Task> {
        let done = self.runs.lock().get(&task_id).map(|r| r.done.clone());
        if let Some(mut done) = done {
            while done.changed().await.is_ok() {}
        }
        self.store.get_task(task_id)
    }

    /// Mark tasks left `running` by a previous process as failed
    ///
    /// `retry` then resumes them from their durable `current_step`.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for session in self.store.list_sessions()? {
            for task in self.store.list_tasks(session.id)? {
                if !task.status.is_running() || self.runs.lock().contains_key(&task.id) {
                    continue;
                }
                let _guard = self.task_locks.get(task.id).lock_owned().await;
                let mut task = self.store.get_task(task.id)?;
                if !task.status.is_running() {
                    continue;
                }

                let pending = task.pending_approval;
                task.fail(INTERRUPTED);
                self.store.update_task(&task)?;
                if let Some(approval_id) = pending {
                    self.gate.withdraw(approval_id, INTERRUPTED).await?;
                }
                info!(task_id = %task.id, step = task.current_step, "Recovered interrupted task");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Cancel every live step loop and wait for them to exit
    ///
    /// Task records are left as they are; `recover_interrupted` handles them
    /// on the next start.
    pub async fn shutdown(&self) {
        let runs: Vec<(TaskId, ActiveRun)> = self.runs.lock().drain().collect();
        for (_, run) in &runs {
            run.cancel.cancel();
        }
        join_all(runs.into_iter().map(|(task_id, run)| async move {
            let mut done = run.done;
            while done.changed().await.is_ok() {}
            debug!(task_id = %task_id, "Step loop stopped");
        }))
        .await;
        info!("Task engine shut down");
    }

    // ========================================================================
    // Step loop
    // ========================================================================

    /// Spawn a step loop; caller holds the task lock
    fn launch(self: &Arc<Self>, task_id: TaskId) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(());

        let previous = self.runs.lock().insert(
            task_id,
            ActiveRun {
                generation,
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        let previous = previous.map(|run| {
            run.cancel.cancel();
            run.done
        });

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine
                .run_loop(task_id, generation, cancel, previous)
                .await;
            engine.finish(task_id, generation);
            drop(done_tx);
        });
    }

    fn is_current(&self, task_id: TaskId, generation: u64) -> bool {
        self.runs
            .lock()
            .get(&task_id)
            .is_some_and(|run| run.generation == generation)
    }

    fn finish(&self, task_id: TaskId, generation: u64) {
        let mut runs = self.runs.lock();
        if runs.get(&task_id).is_some_and(|run| run.generation == generation) {
            runs.remove(&task_id);
        }
    }

    async fn run_loop(
        &self,
        task_id: TaskId,
        generation: u64,
        cancel: CancellationToken,
        previous: Option<watch::Receiver<()>>,
    ) {
        // 이전 루프가 진행 중이던 스텝을 마칠 때까지 대기
        if let Some(mut previous) = previous {
            while previous.changed().await.is_ok() {}
        }

        if let Err(e) = self.drive(task_id, generation, &cancel).await {
            error!(task_id = %task_id, error = %e, "Step loop failed");
            self.fail_task(task_id, generation, &e.to_string()).await;
        }
        debug!(task_id = %task_id, generation, "Step loop exited");
    }

    async fn drive(&self, task_id: TaskId, generation: u64, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let (task, session) = {
                let _guard = self.task_locks.get(task_id).lock_owned().await;
                let task = self.store.get_task(task_id)?;
                if !self.is_current(task_id, generation) || !task.status.is_running() {
                    return Ok(());
                }
                let session = self.store.get_session(task.session_id)?;
                (task, session)
            };

            let Some(step) = task.current().cloned() else {
                return Ok(());
            };
            let index = task.current_step;
            // 스텝 시작 시점의 모드를 캡처
            let mode = session.mode();

            let allowlisted = self.allowlist.contains(session.id, step.kind());
            if requires_approval(step.kind(), mode, allowlisted) {
                match self.await_approval(&task, generation, &step, cancel).await? {
                    ApprovalOutcome::Approved => {}
                    ApprovalOutcome::Rejected => {
                        self.fail_task(task_id, generation, REJECTED_BY_OPERATOR).await;
                        return Ok(());
                    }
                    ApprovalOutcome::Cancelled => return Ok(()),
                }
                if cancel.is_cancelled() {
                    return Ok(());
                }
            }

            self.log(
                session.id,
                Some(task_id),
                LogLevel::Info,
                format!("Step {}/{}: {}", index + 1, task.total_steps, step.details()),
            )
            .await;

            let result = if mode.dry_run {
                self.log(
                    session.id,
                    Some(task_id),
                    LogLevel::Info,
                    format!("[dry-run] {} simulated, no side effect", step.kind()),
                )
                .await;
                Ok(StepOutput::empty())
            } else {
                let ctx = StepContext {
                    session_id: session.id,
                    task_id,
                    step_index: index,
                    workspace_dir: session.workspace_dir.clone(),
                    mode,
                };
                self.invoker.invoke(&step, &ctx).await
            };

            // 취소된 루프의 스텝 결과는 버림 (진행 기록 없음)
            if cancel.is_cancelled() || !self.is_current(task_id, generation) {
                debug!(task_id = %task_id, step = index, "Abandoning step result after cancellation");
                return Ok(());
            }

            match result {
                Ok(output) => {
                    self.emit_output(&session, task_id, &output.stdout, &output.stderr)
                        .await;
                    if !self.record_step(task_id, generation, index, &step).await? {
                        return Ok(());
                    }
                }
                Err(failure) => {
                    if let StepFailure::NonZeroExit { stdout, stderr, .. } = &failure {
                        self.emit_output(&session, task_id, stdout, stderr).await;
                    }
                    let message = Error::step_execution(step.kind().as_str(), failure.to_string());
                    warn!(task_id = %task_id, step = index, error = %message, "Step failed");
                    self.fail_task(task_id, generation, &failure.to_string()).await;
                    return Ok(());
                }
            }
        }
    }

    /// Park the task on an approval
    async fn await_approval(
        &self,
        task: &Task,
        generation: u64,
        step: &ActionStep,
        cancel: &CancellationToken,
    ) -> Result<ApprovalOutcome> {
        // 태스크 잠금 안에서 생성해야 resolve가 pending_approval을 항상 봄
        let approval_id = {
            let _guard = self.task_locks.get(task.id).lock_owned().await;
            let mut current = self.store.get_task(task.id)?;
            if !self.is_current(task.id, generation) || !current.status.is_running() {
                return Ok(ApprovalOutcome::Cancelled);
            }
            let approval = self.gate.open(
                task.session_id,
                Some(task.id),
                step.kind(),
                step.details(),
            )?;
            current.pending_approval = Some(approval.id);
            self.store.update_task(&current)?;
            // 태스크 기록이 먼저 갱신된 뒤 알림
            self.gate.announce(&approval).await;
            approval.id
        };

        debug!(task_id = %task.id, approval_id = %approval_id, "Waiting for approval");
        let outcome = match self.gate.wait(approval_id, cancel).await? {
            // withdraw로 닫힌 승인은 운영자 거부가 아님
            ApprovalOutcome::Rejected if cancel.is_cancelled() => ApprovalOutcome::Cancelled,
            outcome => outcome,
        };

        if outcome == ApprovalOutcome::Approved {
            let _guard = self.task_locks.get(task.id).lock_owned().await;
            let mut current = self.store.get_task(task.id)?;
            if self.is_current(task.id, generation)
                && current.status.is_running()
                && current.pending_approval == Some(approval_id)
            {
                current.pending_approval = None;
                self.store.update_task(&current)?;
            }
        }
        Ok(outcome)
    }

    /// Durably advance past `index`; returns false when the loop should stop
    async fn record_step(
        &self,
        task_id: TaskId,
        generation: u64,
        index: usize,
        step: &ActionStep,
    ) -> Result<bool> {
        let _guard = self.task_locks.get(task_id).lock_owned().await;
        let mut task = self.store.get_task(task_id)?;
        if !self.is_current(task_id, generation)
            || !task.status.is_running()
            || task.current_step != index
        {
            return Ok(false);
        }

        task.advance();
        self.store.update_task(&task)?;

        self.bus
            .publish(StreamEvent::task_step(
                task.session_id,
                task_id,
                index,
                task.total_steps,
                step.kind().as_str(),
            ))
            .await;

        if task.status == TaskStatus::Completed {
            info!(session_id = %task.session_id, task_id = %task_id, "Task completed");
            self.bus
                .publish(StreamEvent::task_complete(
                    task.session_id,
                    task_id,
                    task.total_steps,
                ))
                .await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Fail the task if this loop still owns it
    async fn fail_task(&self, task_id: TaskId, generation: u64, error: &str) {
        let failed = {
            let _guard = self.task_locks.get(task_id).lock_owned().await;
            let task = match self.store.get_task(task_id) {
                Ok(task) => task,
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Cannot load task to record failure");
                    return;
                }
            };
            if !self.is_current(task_id, generation) || !task.status.is_running() {
                return;
            }
            let mut task = task;
            task.fail(error);
            if let Err(e) = self.store.update_task(&task) {
                error!(task_id = %task_id, error = %e, "Cannot record task failure");
                return;
            }
            task
        };
        self.announce_failure(&failed, error).await;
    }

    async fn announce_failure(&self, failed: &Task, error: &str) {
        warn!(
            session_id = %failed.session_id,
            task_id = %failed.id,
            step = failed.current_step,
            error,
            "Task failed"
        );
        self.bus
            .publish(StreamEvent::task_error(
                failed.session_id,
                failed.id,
                failed.current_step,
                error,
            ))
            .await;
        self.log(
            failed.session_id,
            Some(failed.id),
            LogLevel::Error,
            format!("Task '{}' failed: {}", failed.title, error),
        )
        .await;
    }

    async fn emit_output(&self, session: &Session, task_id: TaskId, stdout: &str, stderr: &str) {
        if !stdout.trim().is_empty() {
            self.log(session.id, Some(task_id), LogLevel::Stdout, stdout.trim_end())
                .await;
        }
        if !stderr.trim().is_empty() {
            self.log(session.id, Some(task_id), LogLevel::Stderr, stderr.trim_end())
                .await;
        }
    }

    /// Persist a log line and publish it
    pub async fn log(
        &self,
        session_id: SessionId,
        task_id: Option<TaskId>,
        level: LogLevel,
        message: impl Into<String>,
    ) {
        let entry = LogEntry::new(session_id, task_id, level, message);
        if let Err(e) = self.store.append_log(&entry) {
            warn!(session_id = %session_id, error = %e, "Failed to persist log line");
        }
        self.bus.publish(entry.to_event()).await;
    }
}
