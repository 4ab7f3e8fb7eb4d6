//! # pilot-foundation
//!
//! Foundation layer for Pilot:
//! - Core: 식별자, 세션 모델
//! - Event: 세션별 스트림 이벤트와 EventBus
//! - Config: 통합 설정 (PilotConfig)
//! - Storage: JsonStore (설정 파일)
//! - Error: 에러 분류 (Validation / NotFound / Conflict / StepExecution / Transport)
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  SessionController (Layer3)                             │
//! │        │ stop / mode                                    │
//! │        ▼                                                │
//! │  TaskEngine ── ApprovalGate (Layer2)                    │
//! │        │ publish                                        │
//! │        ▼                                                │
//! │  EventBus (이 레이어) ──► Observer × N (WebSocket ...)   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod event;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result, TransportError};

// ============================================================================
// Core (식별자 및 세션)
// ============================================================================
pub use core::{ApprovalId, Session, SessionId, SessionPatch, SessionStatus, StepMode, TaskId};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    BusConfig, EngineConfig, PilotConfig, ServerConfig, SessionDefaults, StorageConfig,
    PILOT_CONFIG_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::JsonStore;

// ============================================================================
// Event (이벤트 시스템)
// ============================================================================
pub use event::{
    ChannelObserver, EventBus, EventBusConfig, Observer, ObserverId, StreamEvent,
    StreamEventType, SubscriptionHandle,
};
