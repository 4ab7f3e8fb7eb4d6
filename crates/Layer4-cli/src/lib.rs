//! # pilot-server
//!
//! Transport layer for Pilot:
//! - `server`: WebSocket 스트림 (`/stream?session_id=..`) + 제어 커맨드
//! - `protocol`: 클라이언트/서버 프레임과 커맨드 디스패치
//! - `runner`: 로컬 플랜 실행 (`pilot run`)

pub mod protocol;
pub mod runner;
pub mod server;

pub use protocol::{dispatch, ClientMessage, Command, ErrorBody, Response, StreamTarget, STREAM_PATH};
pub use runner::{run_plan, summary, Decision, RunOptions};
pub use server::{Server, WsObserver};
