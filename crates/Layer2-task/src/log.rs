//! Session log lines
//!
//! Every `log_line`, `stdout` and `stderr` event the engine publishes is also
//! persisted as a [`LogEntry`] so a reconnecting observer can re-fetch what it
//! missed through the control surface.

use chrono::{DateTime, Utc};
use pilot_foundation::{SessionId, StreamEvent, TaskId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Log level for session output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    /// Standard output of a step
    Stdout,
    /// Standard error of a step
    Stderr,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Stdout => "stdout",
            LogLevel::Stderr => "stderr",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, LogLevel::Stderr | LogLevel::Error)
    }
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: Uuid,

    pub session_id: SessionId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    pub level: LogLevel,

    pub message: String,

    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        session_id: SessionId,
        task_id: Option<TaskId>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            task_id,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(session_id: SessionId, task_id: Option<TaskId>, message: impl Into<String>) -> Self {
        Self::new(session_id, task_id, LogLevel::Info, message)
    }

    /// The stream event carrying this entry
    pub fn to_event(&self) -> StreamEvent {
        let mut event = match (self.level, self.task_id) {
            (LogLevel::Stdout, Some(task_id)) => {
                StreamEvent::stdout(self.session_id, task_id, &self.message)
            }
            (LogLevel::Stderr, Some(task_id)) => {
                StreamEvent::stderr(self.session_id, task_id, &self.message)
            }
            _ => StreamEvent::log_line(
                self.session_id,
                self.task_id,
                self.level.as_str(),
                &self.message,
            ),
        };
        event.timestamp = self.timestamp;
        event
    }

    /// Format for terminal output
    pub fn format_line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level.as_str(),
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_foundation::StreamEventType;

    #[test]
    fn test_event_mapping() {
        let session = SessionId::new();
        let task = TaskId::new();

        let out = LogEntry::new(session, Some(task), LogLevel::Stdout, "hi");
        assert_eq!(out.to_event().event_type, StreamEventType::Stdout);

        let err = LogEntry::new(session, Some(task), LogLevel::Stderr, "oops");
        assert_eq!(err.to_event().event_type, StreamEventType::Stderr);
        assert!(err.level.is_error());

        let info = LogEntry::info(session, None, "stopped");
        let event = info.to_event();
        assert_eq!(event.event_type, StreamEventType::LogLine);
        assert_eq!(event.data["level"], "info");
        assert!(info.format_line().ends_with("[info] stopped"));
    }
}
