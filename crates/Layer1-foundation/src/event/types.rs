//! Event Types - 세션 스트림 이벤트 정의
//!
//! 옵저버에게 전달되는 모든 이벤트의 공통 구조입니다.
//! EventBus는 이벤트를 저장하지 않습니다 (휘발성).

use crate::core::{ApprovalId, SessionId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// Event Type
// ============================================================================

/// 스트림 이벤트 종류 (닫힌 집합)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    SessionStart,
    SessionEnd,
    TaskStart,
    TaskStep,
    TaskComplete,
    TaskError,
    LogLine,
    Stdout,
    Stderr,
    ApprovalRequired,
    ApprovalResolved,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::TaskStart => "task_start",
            Self::TaskStep => "task_step",
            Self::TaskComplete => "task_complete",
            Self::TaskError => "task_error",
            Self::LogLine => "log_line",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::ApprovalRequired => "approval_required",
            Self::ApprovalResolved => "approval_resolved",
        }
    }

    /// 태스크 진행과 관련된 이벤트인지
    pub fn is_task_event(&self) -> bool {
        matches!(
            self,
            Self::TaskStart | Self::TaskStep | Self::TaskComplete | Self::TaskError
        )
    }
}

impl std::fmt::Display for StreamEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// StreamEvent
// ============================================================================

/// 세션 스트림 이벤트
///
/// 전송 계층에는 `{type, sessionId, taskId?, timestamp, data}` JSON으로 나갑니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,

    pub session_id: SessionId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    /// ISO-8601 (RFC 3339)
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub data: Value,
}

impl StreamEvent {
    /// 새 이벤트 생성
    pub fn new(event_type: StreamEventType, session_id: SessionId) -> Self {
        Self {
            event_type,
            session_id,
            task_id: None,
            timestamp: Utc::now(),
            data: Value::Null,
        }
    }

    /// 태스크 ID 설정
    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// 데이터 설정
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// JSON 문자열 직렬화 (전송용)
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    // ========================================================================
    // 사전 정의된 이벤트
    // ========================================================================

    pub fn session_start(session_id: SessionId, name: &str) -> Self {
        Self::new(StreamEventType::SessionStart, session_id).with_data(json!({ "name": name }))
    }

    pub fn session_end(session_id: SessionId, status: &str) -> Self {
        Self::new(StreamEventType::SessionEnd, session_id).with_data(json!({ "status": status }))
    }

    pub fn task_start(
        session_id: SessionId,
        task_id: TaskId,
        current_step: usize,
        total_steps: usize,
        retry_count: u32,
    ) -> Self {
        Self::new(StreamEventType::TaskStart, session_id)
            .with_task(task_id)
            .with_data(json!({
                "currentStep": current_step,
                "totalSteps": total_steps,
                "retryCount": retry_count,
                "resumed": retry_count > 0 && current_step > 0,
            }))
    }

    pub fn task_step(
        session_id: SessionId,
        task_id: TaskId,
        step_index: usize,
        total_steps: usize,
        action: &str,
    ) -> Self {
        Self::new(StreamEventType::TaskStep, session_id)
            .with_task(task_id)
            .with_data(json!({
                "stepIndex": step_index,
                "totalSteps": total_steps,
                "action": action,
            }))
    }

    pub fn task_complete(session_id: SessionId, task_id: TaskId, total_steps: usize) -> Self {
        Self::new(StreamEventType::TaskComplete, session_id)
            .with_task(task_id)
            .with_data(json!({ "totalSteps": total_steps }))
    }

    pub fn task_error(
        session_id: SessionId,
        task_id: TaskId,
        current_step: usize,
        error: &str,
    ) -> Self {
        Self::new(StreamEventType::TaskError, session_id)
            .with_task(task_id)
            .with_data(json!({ "currentStep": current_step, "error": error }))
    }

    pub fn log_line(session_id: SessionId, task_id: Option<TaskId>, level: &str, message: &str) -> Self {
        let mut event = Self::new(StreamEventType::LogLine, session_id)
            .with_data(json!({ "level": level, "message": message }));
        event.task_id = task_id;
        event
    }

    pub fn stdout(session_id: SessionId, task_id: TaskId, text: &str) -> Self {
        Self::new(StreamEventType::Stdout, session_id)
            .with_task(task_id)
            .with_data(json!({ "text": text }))
    }

    pub fn stderr(session_id: SessionId, task_id: TaskId, text: &str) -> Self {
        Self::new(StreamEventType::Stderr, session_id)
            .with_task(task_id)
            .with_data(json!({ "text": text }))
    }

    pub fn approval_required(
        session_id: SessionId,
        task_id: Option<TaskId>,
        approval_id: ApprovalId,
        action: &str,
        details: &str,
    ) -> Self {
        let mut event = Self::new(StreamEventType::ApprovalRequired, session_id).with_data(json!({
            "approvalId": approval_id,
            "action": action,
            "details": details,
        }));
        event.task_id = task_id;
        event
    }

    pub fn approval_resolved(
        session_id: SessionId,
        task_id: Option<TaskId>,
        approval_id: ApprovalId,
        status: &str,
        reason: Option<&str>,
    ) -> Self {
        let mut data = json!({ "approvalId": approval_id, "status": status });
        if let Some(reason) = reason {
            data["reason"] = Value::String(reason.to_string());
        }
        let mut event = Self::new(StreamEventType::ApprovalResolved, session_id).with_data(data);
        event.task_id = task_id;
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let session = SessionId::new();
        let task = TaskId::new();
        let event = StreamEvent::task_step(session, task, 0, 2, "check_tool");
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "task_step");
        assert_eq!(value["sessionId"], session.to_string());
        assert_eq!(value["taskId"], task.to_string());
        assert_eq!(value["data"]["stepIndex"], 0);
        assert_eq!(value["data"]["action"], "check_tool");
        // RFC 3339 타임스탬프
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_session_event_omits_task_id() {
        let event = StreamEvent::session_start(SessionId::new(), "demo");
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("taskId").is_none());
        assert!(!event.event_type.is_task_event());
    }
}
