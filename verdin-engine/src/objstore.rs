//! JSON-file-backed object store.
//!
//! A flat map of `(kind, key)` to arbitrary JSON, used for bookkeeping the
//! descriptor cannot carry: VM icons, screenshot cache records, and per
//! volume used-by lists. Consistency is best effort; callers log and carry
//! on when the store misbehaves, except where rollback correctness depends
//! on it.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use verdin_hypervisor::error::{EngineError, Result};

/// Object kind for VM records (icon).
pub const KIND_VM: &str = "vm";
/// Object kind for screenshot cache records.
pub const KIND_SCREENSHOT: &str = "screenshot";
/// Object kind for volume used-by lists, keyed by volume path.
pub const KIND_VOLUME: &str = "storagevolume";

pub struct ObjectStore {
    path: Option<PathBuf>,
    data: Mutex<HashMap<String, Value>>,
}

fn full_key(kind: &str, key: &str) -> String {
    format!("{kind}:{key}")
}

impl ObjectStore {
    /// A store that never touches disk. Used in tests and by the mock
    /// driver setup.
    pub fn in_memory() -> Self {
        Self { path: None, data: Mutex::new(HashMap::new()) }
    }

    /// Open (or create) a file-backed store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::failed("object store load", e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(EngineError::failed("object store load", e)),
        };
        Ok(Self { path: Some(path), data: Mutex::new(data) })
    }

    pub async fn get(&self, kind: &str, key: &str) -> Option<Value> {
        self.data.lock().await.get(&full_key(kind, key)).cloned()
    }

    pub async fn put(&self, kind: &str, key: &str, value: Value) -> Result<()> {
        let mut data = self.data.lock().await;
        data.insert(full_key(kind, key), value);
        self.persist(&data).await
    }

    pub async fn delete(&self, kind: &str, key: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.remove(&full_key(kind, key));
        self.persist(&data).await
    }

    /// All keys of a kind.
    pub async fn keys(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{kind}:");
        self.data
            .lock()
            .await
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Write-temp-then-rename so a crash never leaves a torn file.
    async fn persist(&self, data: &HashMap<String, Value>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(data)
            .map_err(|e| EngineError::failed("object store encode", e))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| EngineError::failed("object store write", e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| EngineError::failed("object store rename", e))?;
        debug!(path = %path.display(), entries = data.len(), "object store persisted");
        Ok(())
    }

    // --- volume used-by helpers ------------------------------------------

    /// VM names currently using the volume at `path`.
    pub async fn volume_used_by(&self, path: &str) -> Vec<String> {
        match self.get(KIND_VOLUME, path).await {
            Some(Value::Object(map)) => match map.get("used_by") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    pub async fn volume_add_user(&self, path: &str, vm: &str) -> Result<()> {
        let mut users = self.volume_used_by(path).await;
        if !users.iter().any(|u| u == vm) {
            users.push(vm.to_string());
        }
        self.put(KIND_VOLUME, path, serde_json::json!({ "used_by": users }))
            .await
    }

    pub async fn volume_remove_user(&self, path: &str, vm: &str) -> Result<()> {
        let users: Vec<String> = self
            .volume_used_by(path)
            .await
            .into_iter()
            .filter(|u| u != vm)
            .collect();
        if users.is_empty() {
            self.delete(KIND_VOLUME, path).await
        } else {
            self.put(KIND_VOLUME, path, serde_json::json!({ "used_by": users }))
                .await
        }
    }
}
