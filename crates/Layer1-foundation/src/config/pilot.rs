//! Pilot Config - 통합 설정
//!
//! 글로벌(<config_dir>/pilot/config.json) + 프로젝트(.pilot/config.json) 병합

use crate::event::EventBusConfig;
use crate::storage::JsonStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 설정 파일명
pub const PILOT_CONFIG_FILE: &str = "config.json";

// ============================================================================
// Pilot Config (통합)
// ============================================================================

/// Pilot 통합 설정
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotConfig {
    /// 버전 (마이그레이션용)
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// 새 세션의 기본 모드
    #[serde(default)]
    pub defaults: SessionDefaults,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_version() -> u32 {
    1
}

impl PilotConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// 글로벌 + 프로젝트 병합 로드
    pub fn load() -> Result<Self> {
        let global = JsonStore::global().ok();
        let project = JsonStore::current_project().ok();
        Self::load_from(global.as_ref(), project.as_ref())
    }

    /// 지정된 저장소에서 병합 로드 (project가 우선)
    pub fn load_from(global: Option<&JsonStore>, project: Option<&JsonStore>) -> Result<Self> {
        let mut config = Self::new();

        // 1. 글로벌 설정
        if let Some(store) = global {
            if let Some(global_config) = store.load_optional::<PilotConfigFile>(PILOT_CONFIG_FILE)? {
                config.merge(global_config);
            }
        }

        // 2. 프로젝트 설정
        if let Some(store) = project {
            if let Some(project_config) = store.load_optional::<PilotConfigFile>(PILOT_CONFIG_FILE)? {
                config.merge(project_config);
            }
        }

        Ok(config)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 파일에 명시된 값만 덮어쓰기
    pub fn merge(&mut self, other: PilotConfigFile) {
        if let Some(server) = other.server {
            if let Some(host) = server.host {
                self.server.host = host;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
        }
        if let Some(bus) = other.bus {
            if let Some(ms) = bus.send_timeout_ms {
                self.bus.send_timeout_ms = ms;
            }
            if let Some(queue) = bus.observer_queue {
                self.bus.observer_queue = queue;
            }
        }
        if let Some(engine) = other.engine {
            if let Some(shell) = engine.shell {
                self.engine.shell = shell;
            }
            if let Some(python) = engine.python {
                self.engine.python = python;
            }
            if let Some(secs) = engine.step_timeout_secs {
                self.engine.step_timeout_secs = secs;
            }
        }
        if let Some(defaults) = other.defaults {
            if let Some(dry_run) = defaults.dry_run {
                self.defaults.dry_run = dry_run;
            }
            if let Some(allow) = defaults.allow_destructive {
                self.defaults.allow_destructive = allow;
            }
        }
        if let Some(storage) = other.storage {
            self.storage = storage;
        }
    }

    /// EventBus 설정으로 변환
    pub fn bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            send_timeout: Duration::from_millis(self.bus.send_timeout_ms),
            observer_queue: self.bus.observer_queue,
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// WebSocket 서버 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7420,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 이벤트 버스 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// 옵저버별 전달 타임아웃 (ms)
    pub send_timeout_ms: u64,
    /// 옵저버별 대기 큐 크기
    pub observer_queue: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5_000,
            observer_queue: 256,
        }
    }
}

/// 로컬 도구 실행 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// shell_exec에 사용할 쉘
    pub shell: String,
    /// python_exec 인터프리터
    pub python: String,
    /// 단계별 실행 제한 시간 (초)
    pub step_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            python: "python3".to_string(),
            step_timeout_secs: 300,
        }
    }
}

/// 새 세션의 기본 모드
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDefaults {
    pub dry_run: bool,
    pub allow_destructive: bool,
}

/// 런타임 데이터 저장소 종류
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    Memory,
    Sqlite {
        #[serde(rename = "dataDir")]
        data_dir: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

// ============================================================================
// 파일 표현 (모든 필드 optional → 병합용)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotConfigFile {
    #[serde(default)]
    pub server: Option<ServerFile>,
    #[serde(default)]
    pub bus: Option<BusFile>,
    #[serde(default)]
    pub engine: Option<EngineFile>,
    #[serde(default)]
    pub defaults: Option<DefaultsFile>,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFile {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusFile {
    pub send_timeout_ms: Option<u64>,
    pub observer_queue: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineFile {
    pub shell: Option<String>,
    pub python: Option<String>,
    pub step_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultsFile {
    pub dry_run: Option<bool>,
    pub allow_destructive: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PilotConfig::new();
        assert_eq!(config.server.addr(), "127.0.0.1:7420");
        assert_eq!(config.bus_config().send_timeout, Duration::from_secs(5));
        assert_eq!(config.storage, StorageConfig::Memory);
        assert!(!config.defaults.dry_run);
    }

    #[test]
    fn test_project_overrides_global() {
        let global_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let global = JsonStore::new(global_dir.path());
        let project = JsonStore::new(project_dir.path());

        std::fs::write(
            global_dir.path().join(PILOT_CONFIG_FILE),
            r#"{"server": {"port": 9000}, "defaults": {"dryRun": true}}"#,
        )
        .unwrap();
        std::fs::write(
            project_dir.path().join(PILOT_CONFIG_FILE),
            r#"{"server": {"host": "0.0.0.0"}, "storage": {"kind": "sqlite", "dataDir": "/var/pilot"}}"#,
        )
        .unwrap();

        let config = PilotConfig::load_from(Some(&global), Some(&project)).unwrap();
        assert_eq!(config.server.addr(), "0.0.0.0:9000");
        assert!(config.defaults.dry_run);
        assert_eq!(
            config.storage,
            StorageConfig::Sqlite {
                data_dir: PathBuf::from("/var/pilot")
            }
        );
    }
}
