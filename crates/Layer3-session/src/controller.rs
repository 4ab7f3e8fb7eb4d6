//! Session Controller - 세션 모드와 비상 정지
//!
//! 제어 표면(WebSocket 커맨드, CLI)이 호출하는 진입점입니다.
//!
//! - 세션 생성/수정, dry-run / allow-destructive 토글
//! - 태스크 run / cancel / retry (TaskEngine 위임)
//! - 승인 조회 및 결정 ("다시 묻지 않기" → Allowlist)
//! - `stop`: 세션의 모든 실행 중 태스크 취소 후 idle

use pilot_foundation::{
    ApprovalId, Error, EventBus, Result, Session, SessionDefaults, SessionId, SessionPatch,
    SessionStatus, StreamEvent, TaskId,
};
use pilot_task::{
    ActionStep, Allowlist, Approval, ApprovalGate, LogEntry, LogLevel, Store, Task, TaskEngine,
};
use pilot_task::lock::KeyedLocks;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Result of an emergency stop
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSummary {
    pub session: Session,
    pub cancelled: Vec<TaskId>,
}

/// Mutates sessions and drives their tasks
pub struct SessionController {
    engine: Arc<TaskEngine>,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    gate: Arc<ApprovalGate>,
    allowlist: Arc<Allowlist>,
    defaults: SessionDefaults,
    /// Serializes read-modify-write of one session record
    session_locks: KeyedLocks<SessionId, AsyncMutex<()>>,
}

impl SessionController {
    pub fn new(engine: Arc<TaskEngine>, defaults: SessionDefaults) -> Self {
        Self {
            store: Arc::clone(engine.store()),
            bus: Arc::clone(engine.bus()),
            gate: Arc::clone(engine.gate()),
            allowlist: Arc::clone(engine.allowlist()),
            engine,
            defaults,
            session_locks: KeyedLocks::new(),
        }
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    async fn lock_session(&self, session_id: SessionId) -> tokio::sync::OwnedMutexGuard<()> {
        self.session_locks.get(session_id).lock_owned().await
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Create an idle session with the configured default modes
    pub fn create_session(
        &self,
        name: impl Into<String>,
        workspace_dir: impl Into<PathBuf>,
    ) -> Result<Session> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(Error::Validation("session name must not be empty".into()));
        }

        let session = Session::new(name, workspace_dir)
            .with_dry_run(self.defaults.dry_run)
            .with_allow_destructive(self.defaults.allow_destructive);
        self.store.create_session(&session)?;

        info!(session_id = %session.id, name = %session.name, "Created session");
        Ok(session)
    }

    pub fn get_session(&self, session_id: SessionId) -> Result<Session> {
        self.store.get_session(session_id)
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        self.store.list_sessions()
    }

    /// Apply a partial update; mode changes affect only steps begun afterwards
    pub async fn update_session(&self, session_id: SessionId, patch: SessionPatch) -> Result<Session> {
        let _guard = self.lock_session(session_id).await;
        let mut session = self.store.get_session(session_id)?;
        if patch.is_empty() {
            return Ok(session);
        }

        let before = session.mode();
        patch.apply(&mut session)?;
        session.touch();
        self.store.update_session(&session)?;

        let after = session.mode();
        if before.dry_run != after.dry_run {
            self.log(
                session_id,
                LogLevel::Info,
                format!("Dry-run {}", if after.dry_run { "enabled" } else { "disabled" }),
            )
            .await;
        }
        if before.allow_destructive != after.allow_destructive {
            self.log(
                session_id,
                LogLevel::Warn,
                format!(
                    "Destructive actions {}",
                    if after.allow_destructive {
                        "allowed without approval"
                    } else {
                        "require approval"
                    }
                ),
            )
            .await;
        }
        Ok(session)
    }

    pub async fn toggle_dry_run(&self, session_id: SessionId, enabled: bool) -> Result<Session> {
        self.update_session(
            session_id,
            SessionPatch {
                dry_run_mode: Some(enabled),
                ..SessionPatch::default()
            },
        )
        .await
    }

    pub async fn set_allow_destructive(&self, session_id: SessionId, enabled: bool) -> Result<Session> {
        self.update_session(
            session_id,
            SessionPatch {
                allow_destructive: Some(enabled),
                ..SessionPatch::default()
            },
        )
        .await
    }

    /// Emergency stop
    ///
    /// Cancels every running task of the session and returns it to idle.
    /// No task of the session starts while the stop is in progress.
    pub async fn stop(&self, session_id: SessionId) -> Result<StopSummary> {
        let _guard = self.lock_session(session_id).await;
        let mut session = self.store.get_session(session_id)?;

        let cancelled = self.engine.halt_session(session_id).await?;

        session.status = SessionStatus::Idle;
        session.touch();
        self.store.update_session(&session)?;

        warn!(session_id = %session_id, cancelled = cancelled.len(), "Emergency stop");
        self.log(
            session_id,
            LogLevel::Warn,
            format!("Emergency stop: {} running task(s) cancelled", cancelled.len()),
        )
        .await;

        Ok(StopSummary { session, cancelled })
    }

    /// Operator marks the session finished
    pub async fn end_session(&self, session_id: SessionId, outcome: SessionStatus) -> Result<Session> {
        if !outcome.is_finished() {
            return Err(Error::Validation(format!(
                "session outcome must be completed or failed, got {}",
                outcome
            )));
        }

        let _guard = self.lock_session(session_id).await;
        let mut session = self.store.get_session(session_id)?;
        if session.status.is_finished() {
            return Err(Error::Conflict(format!(
                "session {} already ended as {}",
                session_id, session.status
            )));
        }

        let cancelled = self.engine.halt_session(session_id).await?;
        if !cancelled.is_empty() {
            debug!(session_id = %session_id, count = cancelled.len(), "Cancelled tasks at session end");
        }

        session.status = outcome;
        session.touch();
        self.store.update_session(&session)?;
        self.allowlist.clear(session_id);

        info!(session_id = %session_id, status = %outcome, "Session ended");
        self.bus
            .publish(StreamEvent::session_end(session_id, outcome.as_str()))
            .await;
        Ok(session)
    }

    /// Persisted log lines, oldest first
    pub fn logs(&self, session_id: SessionId, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        self.store.get_session(session_id)?;
        self.store.list_logs(session_id, limit)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    pub fn create_task(
        &self,
        session_id: SessionId,
        title: impl Into<String>,
        plan: Vec<ActionStep>,
    ) -> Result<Task> {
        let session = self.store.get_session(session_id)?;
        Self::ensure_open(&session)?;
        self.engine.create_task(session_id, title, plan)
    }

    pub fn get_task(&self, task_id: TaskId) -> Result<Task> {
        self.engine.get(task_id)
    }

    pub fn list_tasks(&self, session_id: SessionId) -> Result<Vec<Task>> {
        self.store.get_session(session_id)?;
        self.engine.list(session_id)
    }

    pub async fn run_task(&self, task_id: TaskId) -> Result<Task> {
        let session_id = self.open_session_of(task_id)?;
        let task = self.engine.run(task_id).await?;
        self.mark_running(session_id, task_id).await?;
        Ok(task)
    }

    pub async fn retry_task(&self, task_id: TaskId) -> Result<Task> {
        let session_id = self.open_session_of(task_id)?;
        let task = self.engine.retry(task_id).await?;
        self.mark_running(session_id, task_id).await?;
        Ok(task)
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> Result<Task> {
        self.engine.cancel(task_id).await
    }

    fn open_session_of(&self, task_id: TaskId) -> Result<SessionId> {
        let task = self.engine.get(task_id)?;
        let session = self.store.get_session(task.session_id)?;
        Self::ensure_open(&session)?;
        Ok(session.id)
    }

    fn ensure_open(session: &Session) -> Result<()> {
        if session.status.is_finished() {
            return Err(Error::Conflict(format!(
                "session {} has ended ({})",
                session.id, session.status
            )));
        }
        Ok(())
    }

    /// idle/paused → running, announced with `session_start`
    async fn mark_running(&self, session_id: SessionId, task_id: TaskId) -> Result<()> {
        let _guard = self.lock_session(session_id).await;
        let mut session = self.store.get_session(session_id)?;
        if !matches!(session.status, SessionStatus::Idle | SessionStatus::Paused) {
            return Ok(());
        }
        // stop이 끼어들어 이미 취소된 경우 세션은 idle 유지
        if !self.engine.get(task_id)?.status.is_running() {
            return Ok(());
        }

        session.status = SessionStatus::Running;
        session.touch();
        self.store.update_session(&session)?;

        debug!(session_id = %session_id, "Session running");
        self.bus
            .publish(StreamEvent::session_start(session_id, &session.name))
            .await;
        Ok(())
    }

    // ========================================================================
    // Approvals
    // ========================================================================

    pub fn list_approvals(&self, session_id: SessionId) -> Result<Vec<Approval>> {
        self.store.get_session(session_id)?;
        self.gate.list(session_id)
    }

    pub fn pending_approvals(&self, session_id: SessionId) -> Result<Vec<Approval>> {
        self.store.get_session(session_id)?;
        self.gate.pending_for(session_id)
    }

    /// Decide an approval; `dont_ask_again` with approval allowlists the action kind
    ///
    /// A rejected task is already `failed` when this returns.
    pub async fn resolve_approval(
        &self,
        approval_id: ApprovalId,
        approved: bool,
        dont_ask_again: bool,
    ) -> Result<Approval> {
        self.engine
            .resolve_approval(approval_id, approved, dont_ask_again)
            .await
    }

    async fn log(&self, session_id: SessionId, level: LogLevel, message: String) {
        self.engine.log(session_id, None, level, message).await;
    }
}
