//! JSON 설정 파일 로더 (읽기 전용)

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::PathBuf;

/// 글로벌 설정 디렉토리 이름 (<config_dir>/pilot/)
const APP_DIR: &str = "pilot";

/// 프로젝트 설정 디렉토리 이름 (./.pilot/)
const PROJECT_DIR: &str = ".pilot";

/// 디렉토리 하나에 묶인 JSON 설정 파일들
#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn global() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?;
        Ok(Self::new(dir.join(APP_DIR)))
    }

    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
        Ok(Self::new(cwd.join(PROJECT_DIR)))
    }

    /// 파일이 없으면 `None`, 읽기/파싱 실패는 Config 에러
    pub fn load_optional<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        let path = self.dir.join(filename);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Config(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Sample {
        port: u16,
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("absent"));
        assert!(store.load_optional::<Sample>("x.json").unwrap().is_none());

        std::fs::write(dir.path().join("x.json"), r#"{"port": 9}"#).unwrap();
        let store = JsonStore::new(dir.path());
        assert_eq!(
            store.load_optional::<Sample>("x.json").unwrap(),
            Some(Sample { port: 9 })
        );
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = JsonStore::new(dir.path());
        assert!(matches!(
            store.load_optional::<Sample>("bad.json"),
            Err(Error::Config(_))
        ));
    }
}
