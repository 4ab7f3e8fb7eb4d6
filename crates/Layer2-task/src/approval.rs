//! Approval gate
//!
//! 위험한 스텝은 운영자 승인 전까지 해당 태스크만 멈춥니다.
//!
//! - `request_approval`: pending 승인 생성 + `approval_required` 발행 (`open` + `announce`)
//! - `resolve`: pending → approved | rejected 정확히 한 번
//! - `wait`: 태스크 하나의 스텝 루프가 결정 또는 취소까지 대기
//!
//! 게이트는 자동 승인하지 않으며 과거 결정을 기억하지 않습니다.
//! "다시 묻지 않기"는 엔진이 [`Allowlist`]로 처리합니다.

use crate::action::ActionKind;
use crate::store::Store;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use pilot_foundation::{
    ApprovalId, Error, EventBus, Result, SessionId, StreamEvent, TaskId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// ============================================================================
// Approval record
// ============================================================================

/// Decision state of an approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ApprovalStatus::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(Error::Validation(format!("unknown approval status: {}", other))),
        }
    }
}

/// Operator decision request for one gated step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: ApprovalId,

    pub session_id: SessionId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    pub action: ActionKind,

    pub details: String,

    pub status: ApprovalStatus,

    /// Set when the approval was closed without an operator decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Approval {
    pub fn new(
        session_id: SessionId,
        task_id: Option<TaskId>,
        action: ActionKind,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: ApprovalId::new(),
            session_id,
            task_id,
            action,
            details: details.into(),
            status: ApprovalStatus::Pending,
            reason: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    fn close(&mut self, status: ApprovalStatus, reason: Option<String>) {
        self.status = status;
        self.reason = reason;
        self.resolved_at = Some(Utc::now());
    }

    fn resolved_event(&self) -> StreamEvent {
        StreamEvent::approval_resolved(
            self.session_id,
            self.task_id,
            self.id,
            self.status.as_str(),
            self.reason.as_deref(),
        )
    }
}

/// What a parked task observes when its wait ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    /// The task was cancelled while parked
    Cancelled,
}

// ============================================================================
// ApprovalGate
// ============================================================================

/// Creates, resolves and waits on approvals
pub struct ApprovalGate {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    /// Pending approvals and the channel their waiter listens on.
    /// Held across each store read-modify-write so one approval is resolved once.
    waiters: Mutex<HashMap<ApprovalId, watch::Sender<ApprovalStatus>>>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Create a pending approval and announce it
    pub async fn request_approval(
        &self,
        session_id: SessionId,
        task_id: Option<TaskId>,
        action: ActionKind,
        details: impl Into<String>,
    ) -> Result<ApprovalId> {
        let approval = self.open(session_id, task_id, action, details)?;
        self.announce(&approval).await;
        Ok(approval.id)
    }

    /// Persist a pending approval without announcing it yet
    pub fn open(
        &self,
        session_id: SessionId,
        task_id: Option<TaskId>,
        action: ActionKind,
        details: impl Into<String>,
    ) -> Result<Approval> {
        let approval = Approval::new(session_id, task_id, action, details);
        let mut waiters = self.waiters.lock();
        self.store.create_approval(&approval)?;
        waiters.insert(approval.id, watch::channel(ApprovalStatus::Pending).0);
        Ok(approval)
    }

    /// Publish `approval_required` for an opened approval
    pub async fn announce(&self, approval: &Approval) {
        info!(
            session_id = %approval.session_id,
            approval_id = %approval.id,
            action = %approval.action,
            "Approval required"
        );

        self.bus
            .publish(StreamEvent::approval_required(
                approval.session_id,
                approval.task_id,
                approval.id,
                approval.action.as_str(),
                &approval.details,
            ))
            .await;
    }

    /// Apply the operator's decision
    ///
    /// A second resolve of the same approval is a conflict and emits nothing.
    pub async fn resolve(&self, id: ApprovalId, approved: bool) -> Result<Approval> {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let approval = self.close(id, status, None)?;

        info!(
            session_id = %approval.session_id,
            approval_id = %id,
            status = %approval.status,
            "Approval resolved"
        );
        self.bus.publish(approval.resolved_event()).await;
        Ok(approval)
    }

    /// Close a pending approval whose task went away
    ///
    /// Returns `None` when the approval was already resolved.
    pub async fn withdraw(&self, id: ApprovalId, reason: &str) -> Result<Option<Approval>> {
        let approval = match self.close(id, ApprovalStatus::Rejected, Some(reason.to_string())) {
            Ok(approval) => approval,
            Err(Error::Conflict(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        debug!(approval_id = %id, reason, "Approval withdrawn");
        self.bus.publish(approval.resolved_event()).await;
        Ok(Some(approval))
    }

    fn close(
        &self,
        id: ApprovalId,
        status: ApprovalStatus,
        reason: Option<String>,
    ) -> Result<Approval> {
        let mut waiters = self.waiters.lock();
        let mut approval = self.store.get_approval(id)?;
        if !approval.status.is_pending() {
            return Err(Error::Conflict(format!(
                "approval {} is already {}",
                id, approval.status
            )));
        }

        approval.close(status, reason);
        self.store.update_approval(&approval)?;

        if let Some(tx) = waiters.remove(&id) {
            tx.send_replace(status);
        }
        Ok(approval)
    }

    /// Park until the approval is decided or `cancel` fires
    ///
    /// A decision made before the wait began is observed immediately.
    pub async fn wait(&self, id: ApprovalId, cancel: &CancellationToken) -> Result<ApprovalOutcome> {
        let mut rx = {
            let mut waiters = self.waiters.lock();
            let approval = self.store.get_approval(id)?;
            match approval.status {
                ApprovalStatus::Approved => return Ok(ApprovalOutcome::Approved),
                ApprovalStatus::Rejected => return Ok(ApprovalOutcome::Rejected),
                // 재시작 후 남은 pending 승인은 채널이 없을 수 있음
                ApprovalStatus::Pending => waiters
                    .entry(id)
                    .or_insert_with(|| watch::channel(ApprovalStatus::Pending).0)
                    .subscribe(),
            }
        };

        loop {
            match *rx.borrow_and_update() {
                ApprovalStatus::Approved => return Ok(ApprovalOutcome::Approved),
                ApprovalStatus::Rejected => return Ok(ApprovalOutcome::Rejected),
                ApprovalStatus::Pending => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(ApprovalOutcome::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() && rx.borrow().is_pending() {
                        return Err(Error::Internal(format!(
                            "approval {} closed without a decision",
                            id
                        )));
                    }
                }
            }
        }
    }

    pub fn get(&self, id: ApprovalId) -> Result<Approval> {
        self.store.get_approval(id)
    }

    /// Every approval of the session, oldest first
    pub fn list(&self, session_id: SessionId) -> Result<Vec<Approval>> {
        self.store.list_approvals(session_id)
    }

    /// Unresolved approvals of the session, oldest first
    pub fn pending_for(&self, session_id: SessionId) -> Result<Vec<Approval>> {
        Ok(self
            .store
            .list_approvals(session_id)?
            .into_iter()
            .filter(|a| a.status.is_pending())
            .collect())
    }
}

// ============================================================================
// Allowlist
// ============================================================================

/// Per-session "don't ask again" decisions
#[derive(Default)]
pub struct Allowlist {
    sessions: RwLock<HashMap<SessionId, BTreeSet<ActionKind>>>,
}

impl Allowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, session_id: SessionId, kind: ActionKind) {
        debug!(session_id = %session_id, action = %kind, "Action allowlisted");
        self.sessions.write().entry(session_id).or_default().insert(kind);
    }

    pub fn contains(&self, session_id: SessionId, kind: ActionKind) -> bool {
        self.sessions
            .read()
            .get(&session_id)
            .is_some_and(|kinds| kinds.contains(&kind))
    }

    pub fn clear(&self, session_id: SessionId) {
        self.sessions.write().remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pilot_foundation::{ChannelObserver, StreamEventType};
    use std::time::Duration;

    fn gate() -> (Arc<ApprovalGate>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let gate = Arc::new(ApprovalGate::new(Arc::new(MemoryStore::new()), bus.clone()));
        (gate, bus)
    }

    #[tokio::test]
    async fn test_request_and_resolve() {
        let (gate, bus) = gate();
        let session = SessionId::new();
        let (observer, mut rx) = ChannelObserver::pair("test", 16);
        bus.subscribe(session, observer).await;

        let id = gate
            .request_approval(session, None, ActionKind::DeleteFile, "delete_file /x")
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, StreamEventType::ApprovalRequired);
        assert_eq!(event.data["action"], "delete_file");

        assert_eq!(gate.pending_for(session).unwrap().len(), 1);

        let approval = gate.resolve(id, false).await.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Rejected);
        assert!(approval.resolved_at.is_some());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, StreamEventType::ApprovalResolved);
        assert_eq!(event.data["status"], "rejected");

        assert!(gate.pending_for(session).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_double_resolve_conflicts_without_event() {
        let (gate, bus) = gate();
        let session = SessionId::new();
        let id = gate
            .request_approval(session, None, ActionKind::GitPush, "push")
            .await
            .unwrap();

        gate.resolve(id, true).await.unwrap();
        let published = bus.published_count();

        let second = gate.resolve(id, false).await;
        assert!(matches!(second, Err(Error::Conflict(_))));
        assert_eq!(bus.published_count(), published);
        assert_eq!(gate.get(id).unwrap().status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_resolve_unknown() {
        let (gate, _) = gate();
        assert!(matches!(
            gate.resolve(ApprovalId::new(), true).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_unblocks_on_resolve() {
        let (gate, _) = gate();
        let id = gate
            .request_approval(SessionId::new(), None, ActionKind::ShellExec, "rm -rf build")
            .await
            .unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait(id, &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resolve(id, true).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn test_wait_after_resolution_returns_immediately() {
        let (gate, _) = gate();
        let id = gate
            .request_approval(SessionId::new(), None, ActionKind::WaitApproval, "checkpoint")
            .await
            .unwrap();
        gate.resolve(id, false).await.unwrap();

        let outcome = gate.wait(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_wait_is_cancellable_and_withdraw_closes() {
        let (gate, _) = gate();
        let id = gate
            .request_approval(SessionId::new(), Some(TaskId::new()), ActionKind::DockerRun, "run")
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait(id, &cancel).await })
        };
        cancel.cancel();
        assert_eq!(waiter.await.unwrap().unwrap(), ApprovalOutcome::Cancelled);

        let withdrawn = gate.withdraw(id, "task cancelled").await.unwrap().unwrap();
        assert_eq!(withdrawn.status, ApprovalStatus::Rejected);
        assert_eq!(withdrawn.reason.as_deref(), Some("task cancelled"));

        // 이미 닫힌 승인
        assert!(gate.withdraw(id, "again").await.unwrap().is_none());
        assert!(matches!(gate.resolve(id, true).await, Err(Error::Conflict(_))));
    }

    #[test]
    fn test_allowlist() {
        let allowlist = Allowlist::new();
        let session = SessionId::new();
        assert!(!allowlist.contains(session, ActionKind::ShellExec));

        allowlist.allow(session, ActionKind::ShellExec);
        assert!(allowlist.contains(session, ActionKind::ShellExec));
        assert!(!allowlist.contains(SessionId::new(), ActionKind::ShellExec));
        assert!(!allowlist.contains(session, ActionKind::GitPush));

        allowlist.clear(session);
        assert!(!allowlist.contains(session, ActionKind::ShellExec));
    }
}
