//! Core Module - 핵심 타입
//!
//! 모든 레이어가 공유하는 식별자와 세션 모델을 정의합니다.
//!
//! ```text
//! Session (모드 플래그: dry-run / allow-destructive)
//!   ├── Task ──── plan: [ActionStep, ...]     (pilot-task 레이어)
//!   ├── Approval  (파괴적 단계 게이트)          (pilot-task 레이어)
//!   └── LogEntry
//! ```

pub mod types;

pub use types::{ApprovalId, Session, SessionId, SessionPatch, SessionStatus, StepMode, TaskId};
