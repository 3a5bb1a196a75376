use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use scan_plugin::{EntryKind, PluginMetadata, PluginStatus};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

/// The authoritative copy of a plugin, as the registry keeps and persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PluginRecord {
    pub metadata: PluginMetadata,
    pub source_code: String,
    pub status: PluginStatus,
    #[serde(default)]
    pub compiled_entry_points: Vec<EntryKind>,
    #[serde(default)]
    pub last_validation_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginRecord {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}

/// Durable storage for plugin records.
#[async_trait]
pub trait PluginStoreType: Send + Sync {
    async fn load_all(&self) -> Result<Vec<PluginRecord>>;
    async fn save(&self, record: &PluginRecord) -> Result<()>;
    async fn delete(&self, plugin_id: &str) -> Result<()>;
    fn name(&self) -> &'static str;
    fn clone_box(&self) -> Arc<dyn PluginStoreType>;
    fn debug_box(&self) -> String;
}

pub struct PluginStore(pub Arc<dyn PluginStoreType>);

impl PluginStore {
    pub fn memory() -> Self {
        PluginStore(Arc::new(MemoryPluginStore::default()))
    }

    pub async fn load_all(&self) -> Result<Vec<PluginRecord>> {
        self.0.load_all().await
    }

    pub async fn save(&self, record: &PluginRecord) -> Result<()> {
        self.0.save(record).await
    }

    pub async fn delete(&self, plugin_id: &str) -> Result<()> {
        self.0.delete(plugin_id).await
    }
}

impl Clone for PluginStore {
    fn clone(&self) -> Self {
        PluginStore(self.0.clone_box())
    }
}

impl Debug for PluginStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process-lifetime store; clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryPluginStore {
    records: Arc<DashMap<String, PluginRecord>>,
}

#[async_trait]
impl PluginStoreType for MemoryPluginStore {
    async fn load_all(&self) -> Result<Vec<PluginRecord>> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        Ok(records)
    }

    async fn save(&self, record: &PluginRecord) -> Result<()> {
        self.records.insert(record.metadata.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, plugin_id: &str) -> Result<()> {
        self.records.remove(plugin_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn clone_box(&self) -> Arc<dyn PluginStoreType> {
        Arc::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MemoryPluginStore {{ records: {} }}", self.records.len())
    }
}

/// One `<id>.json` document per plugin under a directory.
#[derive(Debug, Clone)]
pub struct FilePluginStore {
    dir: PathBuf,
}

impl FilePluginStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, plugin_id: &str) -> PathBuf {
        // ids are user supplied; keep them from escaping the directory
        let safe: String = plugin_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe.trim_start_matches('.')))
    }
}

#[async_trait]
impl PluginStoreType for FilePluginStore {
    async fn load_all(&self) -> Result<Vec<PluginRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<PluginRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!(?path, "skipping unreadable plugin record: {e}"),
            }
        }
        records.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        info!(dir = %self.dir.display(), count = records.len(), "plugin records loaded");
        Ok(records)
    }

    async fn save(&self, record: &PluginRecord) -> Result<()> {
        let path = self.path_for(record.id());
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, plugin_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(plugin_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }

    fn clone_box(&self) -> Arc<dyn PluginStoreType> {
        Arc::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("FilePluginStore {{ dir: {} }}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> PluginRecord {
        PluginRecord {
            metadata: PluginMetadata::new(id, "Test", "1.0.0"),
            source_code: "function analyze(x) { 1 }\nglobalThis.analyze = analyze;".into(),
            status: PluginStatus::Enabled,
            compiled_entry_points: vec![EntryKind::Analyze],
            last_validation_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_store_survives_a_reopen() {
        let dir = TempDir::new().unwrap();
        let store = FilePluginStore::new(dir.path()).unwrap();
        store.save(&record("b")).await.unwrap();
        store.save(&record("a")).await.unwrap();
        store.delete("b").await.unwrap();
        store.delete("never-saved").await.unwrap();

        let reopened = FilePluginStore::new(dir.path()).unwrap();
        let records = reopened.load_all().await.unwrap();
        assert_eq!(records, vec![record_with_times("a", &records[0])]);
    }

    fn record_with_times(id: &str, like: &PluginRecord) -> PluginRecord {
        PluginRecord { created_at: like.created_at, updated_at: like.updated_at, ..record(id) }
    }

    #[tokio::test]
    async fn ids_cannot_escape_the_directory() {
        let dir = TempDir::new().unwrap();
        let store = FilePluginStore::new(dir.path()).unwrap();
        let path = store.path_for("../../etc/passwd");
        assert!(path.starts_with(dir.path()));
    }

    #[tokio::test]
    async fn memory_store_clones_share_records() {
        let store = PluginStore::memory();
        let other = store.clone();
        store.save(&record("x")).await.unwrap();
        assert_eq!(other.load_all().await.unwrap().len(), 1);
    }
}
