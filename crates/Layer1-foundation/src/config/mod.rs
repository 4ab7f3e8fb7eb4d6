//! Config Module - 설정 관리
//!
//! - `pilot`: 통합 설정 (서버, 이벤트 버스, 실행기, 세션 기본값, 저장소)

mod pilot;

pub use pilot::{
    BusConfig, EngineConfig, PilotConfig, PilotConfigFile, ServerConfig, SessionDefaults,
    StorageConfig, PILOT_CONFIG_FILE,
};
