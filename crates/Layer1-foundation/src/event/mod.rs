//! Event System - 세션 스트림 발행/구독
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EventBus                              │
//! │   publish(event) ── session_id로 옵저버 목록 선택             │
//! │         │                                                    │
//! │         ▼  (세션 잠금 안에서 enqueue, I/O 대기 없음)           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │  queue → 1   │  │  queue → 2   │  │  queue → N   │       │
//! │  │ (WebSocket)  │  │ (CLI stdout) │  │  (channel)   │       │
//! │  └──────────────┘  └──────────────┘  └──────────────┘       │
//! │   옵저버별 타임아웃, 실패하면 해당 옵저버만 제거               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod types;

// Re-exports
pub use bus::{
    ChannelObserver, EventBus, EventBusConfig, Observer, ObserverId, SubscriptionHandle,
};

pub use types::{StreamEvent, StreamEventType};
