//! Core Types - 공용 타입 정의
//!
//! 모든 레이어에서 공통으로 사용하는 식별자와 세션 모델

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// 새 랜덤 ID 생성
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// 로그용 짧은 표기 (앞 8자리)
            pub fn short(&self) -> String {
                self.0.to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                Uuid::parse_str(s.trim()).map(Self).map_err(|e| {
                    crate::Error::Validation(format!(
                        "invalid {} '{}': {}",
                        stringify!($name),
                        s,
                        e
                    ))
                })
            }
        }
    };
}

define_id!(
    /// 세션 ID
    SessionId
);
define_id!(
    /// 태스크 ID
    TaskId
);
define_id!(
    /// 승인 요청 ID
    ApprovalId
);

// ============================================================================
// Session
// ============================================================================

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// 종료된 세션인지 확인
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::Validation(format!(
                "unknown session status: {}",
                other
            ))),
        }
    }
}

/// 에이전트 작업 단위 세션
///
/// 모드 플래그(dry-run, allow-destructive)와 태스크 이력을 가집니다.
/// SessionController만 변경합니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    /// 단계를 실제로 적용하지 않고 시뮬레이션
    pub dry_run_mode: bool,
    /// 파괴적 액션을 승인 없이 실행
    pub allow_destructive: bool,
    pub workspace_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// 새 세션 생성 (idle 상태)
    pub fn new(name: impl Into<String>, workspace_dir: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            name: name.into(),
            status: SessionStatus::Idle,
            dry_run_mode: false,
            allow_destructive: false,
            workspace_dir: workspace_dir.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_dry_run(mut self, enabled: bool) -> Self {
        self.dry_run_mode = enabled;
        self
    }

    pub fn with_allow_destructive(mut self, enabled: bool) -> Self {
        self.allow_destructive = enabled;
        self
    }

    /// 단계 시작 시점의 실행 모드 스냅샷
    pub fn mode(&self) -> StepMode {
        StepMode {
            dry_run: self.dry_run_mode,
            allow_destructive: self.allow_destructive,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 단계 실행 모드 (단계 시작 시 캡처되어 단계가 끝날 때까지 유지)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMode {
    pub dry_run: bool,
    pub allow_destructive: bool,
}

/// 세션 부분 업데이트
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_destructive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.dry_run_mode.is_none()
            && self.allow_destructive.is_none()
            && self.workspace_dir.is_none()
    }

    /// 패치 적용 (이름 검증 포함)
    pub fn apply(self, session: &mut Session) -> crate::Result<()> {
        if let Some(name) = self.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(crate::Error::Validation(
                    "session name must not be empty".to_string(),
                ));
            }
            session.name = name;
        }
        if let Some(dry_run) = self.dry_run_mode {
            session.dry_run_mode = dry_run;
        }
        if let Some(allow) = self.allow_destructive {
            session.allow_destructive = allow;
        }
        if let Some(dir) = self.workspace_dir {
            session.workspace_dir = dir;
        }
        session.touch();
        Ok(())
    }
}
