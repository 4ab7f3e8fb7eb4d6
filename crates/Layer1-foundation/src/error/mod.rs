//! Error types for Pilot
//!
//! 모든 에러를 중앙에서 관리
//!
//! - Validation / NotFound / Conflict: 호출자에게 동기적으로 반환 (브로드캐스트 금지)
//! - StepExecution: 해당 태스크만 실패 처리
//! - Transport: 옵저버 제거로 끝남, 발행자에게 전달되지 않음

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// 옵저버 전송 에러
///
/// EventBus 내부에서만 소비되며 발행자에게는 절대 전달되지 않습니다.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("observer connection closed")]
    Closed,

    #[error("send timed out after {0}ms")]
    Timeout(u64),

    #[error("observer queue full")]
    Overflow,

    #[error("transport failure: {0}")]
    Io(String),
}

/// Pilot 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 요청 관련 (호출자에게 동기 반환)
    // ========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Step execution failed: {action} - {message}")]
    StepExecution { action: String, message: String },

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // 전송 관련
    // ========================================================================
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // ========================================================================
    // 저장소 / 설정
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// NotFound 에러 생성 헬퍼
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Step 실행 에러 생성 헬퍼
    pub fn step_execution(action: impl Into<String>, message: impl Into<String>) -> Self {
        Error::StepExecution {
            action: action.into(),
            message: message.into(),
        }
    }

    /// 사용자에게 그대로 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::NotFound { .. }
                | Error::Conflict(_)
                | Error::StepExecution { .. }
                | Error::Cancelled
        )
    }

    /// 제어 프로토콜 응답에 쓰이는 안정적인 에러 종류 문자열
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::StepExecution { .. } => "step_execution",
            Error::Cancelled => "cancelled",
            Error::Transport(_) => "transport",
            Error::Storage(_) | Error::Sqlite(_) => "storage",
            Error::Config(_) => "config",
            Error::Io(_) | Error::Json(_) | Error::Internal(_) => "internal",
        }
    }
}
