//! Storage module for Pilot
//!
//! - `json`: JSON - 설정 파일 저장/로드
//!
//! 런타임 데이터(세션, 태스크, 승인, 로그)는 pilot-task의 `Store` 구현이 담당

mod json;

pub use json::JsonStore;
