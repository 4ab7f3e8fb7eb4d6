//! Control Protocol - WebSocket 프레임 정의와 커맨드 디스패치
//!
//! ```text
//! client → server   {"type":"ping"}
//!                   {"type":"subscribe_task","taskId":"..."}      (예약, no-op)
//!                   {"type":"command","requestId":"1","command":{"op":"run_task","taskId":"..."}}
//!
//! server → client   StreamEvent {type, sessionId, taskId?, timestamp, data}
//!                   {"type":"pong","timestamp":"..."}
//!                   {"type":"response","requestId":"1","ok":true,"result":{...}}
//!                   {"type":"response","requestId":"1","ok":false,"error":{"kind":"conflict","message":"..."}}
//! ```

use chrono::Utc;
use pilot_foundation::{ApprovalId, Error, Result, SessionId, SessionPatch, SessionStatus, TaskId};
use pilot_session::SessionController;
use pilot_task::parse_plan;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;

// ============================================================================
// Connection target
// ============================================================================

/// Path observers connect to
pub const STREAM_PATH: &str = "/stream";

/// Session (and optional user) addressed by the upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub session_id: SessionId,
    pub user_id: Option<String>,
}

impl StreamTarget {
    /// Parse `/stream?session_id=<uuid>&user_id=<str>`
    ///
    /// Query values are percent-decoded.
    pub fn parse(path: &str, query: Option<&str>) -> Result<Self> {
        if path != STREAM_PATH {
            return Err(Error::not_found("endpoint", path));
        }

        let mut session_id = None;
        let mut user_id = None;
        let query = query.unwrap_or_default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "session_id" => session_id = Some(value.parse::<SessionId>()?),
                "user_id" if !value.is_empty() => user_id = Some(value.into_owned()),
                _ => {}
            }
        }

        let session_id = session_id
            .ok_or_else(|| Error::Validation("missing session_id query parameter".into()))?;
        Ok(Self {
            session_id,
            user_id,
        })
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Client → server frame
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    /// Reserved; accepted and ignored
    SubscribeTask {
        #[serde(default, rename = "taskId")]
        task_id: Option<TaskId>,
    },
    Command {
        #[serde(rename = "requestId")]
        request_id: String,
        command: Command,
    },
}

/// Control surface operations
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Command {
    CreateSession {
        name: String,
        #[serde(default)]
        workspace_dir: Option<PathBuf>,
    },
    GetSession {
        session_id: SessionId,
    },
    ListSessions,
    UpdateSession {
        session_id: SessionId,
        #[serde(flatten)]
        patch: SessionPatch,
    },
    ToggleDryRun {
        session_id: SessionId,
        enabled: bool,
    },
    SetAllowDestructive {
        session_id: SessionId,
        enabled: bool,
    },
    StopSession {
        session_id: SessionId,
    },
    EndSession {
        session_id: SessionId,
        outcome: SessionStatus,
    },
    Logs {
        session_id: SessionId,
        #[serde(default)]
        limit: Option<usize>,
    },
    CreateTask {
        session_id: SessionId,
        title: String,
        plan: Value,
    },
    GetTask {
        task_id: TaskId,
    },
    ListTasks {
        session_id: SessionId,
    },
    RunTask {
        task_id: TaskId,
    },
    CancelTask {
        task_id: TaskId,
    },
    RetryTask {
        task_id: TaskId,
    },
    ListApprovals {
        session_id: SessionId,
    },
    PendingApprovals {
        session_id: SessionId,
    },
    ResolveApproval {
        approval_id: ApprovalId,
        approved: bool,
        #[serde(default)]
        dont_ask_again: bool,
    },
}

impl Command {
    pub fn op(&self) -> &'static str {
        match self {
            Command::CreateSession { .. } => "create_session",
            Command::GetSession { .. } => "get_session",
            Command::ListSessions => "list_sessions",
            Command::UpdateSession { .. } => "update_session",
            Command::ToggleDryRun { .. } => "toggle_dry_run",
            Command::SetAllowDestructive { .. } => "set_allow_destructive",
            Command::StopSession { .. } => "stop_session",
            Command::EndSession { .. } => "end_session",
            Command::Logs { .. } => "logs",
            Command::CreateTask { .. } => "create_task",
            Command::GetTask { .. } => "get_task",
            Command::ListTasks { .. } => "list_tasks",
            Command::RunTask { .. } => "run_task",
            Command::CancelTask { .. } => "cancel_task",
            Command::RetryTask { .. } => "retry_task",
            Command::ListApprovals { .. } => "list_approvals",
            Command::PendingApprovals { .. } => "pending_approvals",
            Command::ResolveApproval { .. } => "resolve_approval",
        }
    }
}

/// Error body of a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Server → client answer to one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(request_id: Option<String>, result: Value) -> Self {
        Self {
            frame_type: "response".to_string(),
            request_id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(request_id: Option<String>, error: &Error) -> Self {
        Self {
            frame_type: "response".to_string(),
            request_id,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn from_result(request_id: Option<String>, result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self::success(request_id, value),
            Err(e) => Self::failure(request_id, &e),
        }
    }
}

/// `{"type":"pong"}` frame body
pub fn pong() -> Value {
    json!({ "type": "pong", "timestamp": Utc::now().to_rfc3339() })
}

// ============================================================================
// Dispatch
// ============================================================================

/// Run one command against the controller
///
/// Errors are returned to the caller and never broadcast.
pub async fn dispatch(controller: &SessionController, command: Command) -> Result<Value> {
    let value = match command {
        Command::CreateSession {
            name,
            workspace_dir,
        } => {
            let dir = match workspace_dir {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            serde_json::to_value(controller.create_session(name, dir)?)?
        }
        Command::GetSession { session_id } => {
            serde_json::to_value(controller.get_session(session_id)?)?
        }
        Command::ListSessions => serde_json::to_value(controller.list_sessions()?)?,
        Command::UpdateSession { session_id, patch } => {
            serde_json::to_value(controller.update_session(session_id, patch).await?)?
        }
        Command::ToggleDryRun {
            session_id,
            enabled,
        } => serde_json::to_value(controller.toggle_dry_run(session_id, enabled).await?)?,
        Command::SetAllowDestructive {
            session_id,
            enabled,
        } => serde_json::to_value(controller.set_allow_destructive(session_id, enabled).await?)?,
        Command::StopSession { session_id } => {
            serde_json::to_value(controller.stop(session_id).await?)?
        }
        Command::EndSession {
            session_id,
            outcome,
        } => serde_json::to_value(controller.end_session(session_id, outcome).await?)?,
        Command::Logs { session_id, limit } => {
            serde_json::to_value(controller.logs(session_id, limit)?)?
        }
        Command::CreateTask {
            session_id,
            title,
            plan,
        } => {
            let plan = parse_plan(plan)?;
            serde_json::to_value(controller.create_task(session_id, title, plan)?)?
        }
        Command::GetTask { task_id } => serde_json::to_value(controller.get_task(task_id)?)?,
        Command::ListTasks { session_id } => {
            serde_json::to_value(controller.list_tasks(session_id)?)?
        }
        Command::RunTask { task_id } => serde_json::to_value(controller.run_task(task_id).await?)?,
        Command::CancelTask { task_id } => {
            serde_json::to_value(controller.cancel_task(task_id).await?)?
        }
        Command::RetryTask { task_id } => {
            serde_json::to_value(controller.retry_task(task_id).await?)?
        }
        Command::ListApprovals { session_id } => {
            serde_json::to_value(controller.list_approvals(session_id)?)?
        }
        Command::PendingApprovals { session_id } => {
            serde_json::to_value(controller.pending_approvals(session_id)?)?
        }
        Command::ResolveApproval {
            approval_id,
            approved,
            dont_ask_again,
        } => serde_json::to_value(
            controller
                .resolve_approval(approval_id, approved, dont_ask_again)
                .await?,
        )?,
    };
    Ok(value)
}

/// Parse a text frame; malformed frames become a validation error
pub fn parse_client_message(text: &str) -> Result<ClientMessage> {
    serde_json::from_str(text).map_err(|e| Error::Validation(format!("malformed frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_target() {
        let id = SessionId::new();
        let query = format!("session_id={}&user_id=alice", id);
        let target = StreamTarget::parse("/stream", Some(&query)).unwrap();
        assert_eq!(target.session_id, id);
        assert_eq!(target.user_id.as_deref(), Some("alice"));

        let target = StreamTarget::parse("/stream", Some(&format!("session_id={}", id))).unwrap();
        assert!(target.user_id.is_none());

        let encoded = format!("user_id=ops%20team%2Fa&session_id={}", id);
        let target = StreamTarget::parse("/stream", Some(&encoded)).unwrap();
        assert_eq!(target.user_id.as_deref(), Some("ops team/a"));

        assert!(matches!(
            StreamTarget::parse("/stream", None),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            StreamTarget::parse("/stream", Some("session_id=nope")),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            StreamTarget::parse("/other", Some(&query)),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_parse_frames() {
        assert!(matches!(
            parse_client_message(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        ));
        assert!(matches!(
            parse_client_message(r#"{"type":"subscribe_task"}"#).unwrap(),
            ClientMessage::SubscribeTask { task_id: None }
        ));

        let session = SessionId::new();
        let text = format!(
            r#"{{"type":"command","requestId":"7","command":{{"op":"update_session","sessionId":"{}","dryRunMode":true}}}}"#,
            session
        );
        match parse_client_message(&text).unwrap() {
            ClientMessage::Command {
                request_id,
                command: Command::UpdateSession { session_id, patch },
            } => {
                assert_eq!(request_id, "7");
                assert_eq!(session_id, session);
                assert_eq!(patch.dry_run_mode, Some(true));
                assert!(patch.name.is_none());
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        let text = format!(
            r#"{{"type":"command","requestId":"8","command":{{"op":"resolve_approval","approvalId":"{}","approved":true}}}}"#,
            ApprovalId::new()
        );
        match parse_client_message(&text).unwrap() {
            ClientMessage::Command {
                command: command @ Command::ResolveApproval { .. },
                ..
            } => {
                assert_eq!(command.op(), "resolve_approval");
                assert!(matches!(
                    command,
                    Command::ResolveApproval {
                        dont_ask_again: false,
                        ..
                    }
                ));
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        assert!(matches!(
            parse_client_message(r#"{"type":"command","requestId":"9","command":{"op":"explode"}}"#),
            Err(Error::Validation(_))
        ));
        assert!(parse_client_message("not json").is_err());
    }

    #[test]
    fn test_response_shape() {
        let ok = serde_json::to_value(Response::success(Some("1".into()), json!({"a": 1}))).unwrap();
        assert_eq!(ok["type"], "response");
        assert_eq!(ok["requestId"], "1");
        assert_eq!(ok["ok"], true);
        assert!(ok.get("error").is_none());

        let err = Error::Conflict("approval already resolved".into());
        let failed = serde_json::to_value(Response::failure(Some("2".into()), &err)).unwrap();
        assert_eq!(failed["ok"], false);
        assert_eq!(failed["error"]["kind"], "conflict");
        assert!(failed.get("result").is_none());
    }
}
