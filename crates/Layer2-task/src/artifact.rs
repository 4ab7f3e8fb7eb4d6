//! Artifact storage used by `save_artifact` / `get_artifact` steps
//!
//! Artifacts are opaque JSON values keyed by session, provider and reference.

use async_trait::async_trait;
use parking_lot::RwLock;
use pilot_foundation::{Error, Result, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Artifact address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactKey {
    pub session_id: SessionId,
    pub provider: String,
    pub reference: String,
}

impl ArtifactKey {
    pub fn new(
        session_id: SessionId,
        provider: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            provider: provider.into(),
            reference: reference.into(),
        }
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.reference)
    }
}

/// Artifact storage backend
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store (or replace) an artifact
    async fn save(&self, key: ArtifactKey, content: Value) -> Result<()>;

    /// Fetch an artifact; `Error::NotFound` if absent
    async fn get(&self, key: &ArtifactKey) -> Result<Value>;

    /// Keys stored for a session
    async fn list(&self, session_id: SessionId) -> Result<Vec<ArtifactKey>>;

    /// Remove an artifact, returning whether it existed
    async fn delete(&self, key: &ArtifactKey) -> Result<bool>;
}

/// In-process artifact store
#[derive(Default)]
pub struct MemoryArtifactStore {
    items: RwLock<HashMap<ArtifactKey, Value>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn save(&self, key: ArtifactKey, content: Value) -> Result<()> {
        self.items.write().insert(key, content);
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Value> {
        self.items
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("artifact", key))
    }

    async fn list(&self, session_id: SessionId) -> Result<Vec<ArtifactKey>> {
        let mut keys: Vec<ArtifactKey> = self
            .items
            .read()
            .keys()
            .filter(|k| k.session_id == session_id)
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<bool> {
        Ok(self.items.write().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_get_list_delete() {
        let store = MemoryArtifactStore::new();
        let session = SessionId::new();
        let key = ArtifactKey::new(session, "github", "report.json");

        assert!(matches!(store.get(&key).await, Err(Error::NotFound { .. })));

        store.save(key.clone(), json!({"ok": true})).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), json!({"ok": true}));
        assert_eq!(store.list(session).await.unwrap(), vec![key.clone()]);
        assert!(store.list(SessionId::new()).await.unwrap().is_empty());

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
    }
}
