use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use scan_plugin::{EntryKind, PluginChange, PluginEvent, PluginMetadata, PluginStatus};
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::normalizer::{self, CompiledScript};
use crate::pool::WorkerPool;
use crate::stats::StatsBook;
use crate::store::{PluginRecord, PluginStore};

const EVENT_CAPACITY: usize = 256;

/// Catalog of known plugins; the only place their authoritative state lives.
///
/// Mutations are serialised, persisted before they are announced, and pushed
/// into the worker pool when they change what an enabled plugin runs.
#[derive(Debug)]
pub struct PluginRegistry {
    records: DashMap<String, PluginRecord>,
    pool: Arc<WorkerPool>,
    stats: Arc<StatsBook>,
    store: PluginStore,
    events: broadcast::Sender<PluginEvent>,
    mutations: Mutex<()>,
}

impl PluginRegistry {
    pub fn new(pool: Arc<WorkerPool>, stats: Arc<StatsBook>, store: PluginStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { records: DashMap::new(), pool, stats, store, events, mutations: Mutex::new(()) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, plugin_id: &str) -> Option<PluginRecord> {
        self.records.get(plugin_id).map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<PluginRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        records
    }

    /// Reload persisted records and bring enabled plugins back into the pool.
    #[tracing::instrument(skip(self))]
    pub async fn bootstrap(&self) -> Result<usize> {
        let _guard = self.mutations.lock().await;
        let records = self.store.load_all().await?;
        let count = records.len();
        for mut record in records {
            if record.status == PluginStatus::Enabled {
                if let Err(err) = self.activate(&mut record).await {
                    warn!(plugin_id = record.id(), "could not re-enable persisted plugin: {err}");
                    self.store.save(&record).await?;
                }
            }
            self.records.insert(record.metadata.id.clone(), record);
        }
        info!(count, "registry restored");
        Ok(count)
    }

    /// Register a new plugin, disabled.
    ///
    /// Source that fails validation is still stored, in `Error` status, and
    /// the validation error is returned.
    #[tracing::instrument(skip(self, metadata, source_code), fields(plugin_id = %metadata.id))]
    pub async fn create(&self, metadata: PluginMetadata, source_code: String) -> Result<PluginRecord> {
        let _guard = self.mutations.lock().await;
        if self.records.contains_key(&metadata.id) {
            return Err(EngineError::AlreadyExists(metadata.id));
        }

        let now = Utc::now();
        let mut record = PluginRecord {
            metadata,
            source_code,
            status: PluginStatus::Disabled,
            compiled_entry_points: Vec::new(),
            last_validation_error: None,
            created_at: now,
            updated_at: now,
        };
        let outcome = compile(&mut record).map(|_| ());

        self.store.save(&record).await?;
        self.records.insert(record.metadata.id.clone(), record.clone());
        self.announce(record.id(), PluginChange::Created, Some(record.status));
        outcome.map(|()| record)
    }

    /// Replace a plugin's metadata and source.
    ///
    /// An enabled plugin is hot-updated in every worker before this returns;
    /// a plugin in `Error` status that now validates becomes `Disabled`.
    #[tracing::instrument(skip(self, metadata, source_code), fields(plugin_id = %metadata.id))]
    pub async fn update(&self, metadata: PluginMetadata, source_code: String) -> Result<PluginRecord> {
        let _guard = self.mutations.lock().await;
        let plugin_id = metadata.id.clone();
        let mut record = self.get(&plugin_id).ok_or_else(|| EngineError::NotFound(plugin_id.clone()))?;
        let was_enabled = record.status == PluginStatus::Enabled;

        record.metadata = metadata;
        record.source_code = source_code;
        record.updated_at = Utc::now();

        let outcome = match compile(&mut record) {
            Ok(script) if was_enabled => match self.pool.hot_update(&plugin_id, Arc::new(script)).await {
                Ok(()) => Ok(PluginChange::HotUpdated),
                Err(err) => {
                    self.fail(&mut record, err.to_string()).await;
                    Err(EngineError::from(err))
                }
            },
            Ok(_) => {
                record.status = PluginStatus::Disabled;
                Ok(PluginChange::Updated)
            }
            Err(err) => {
                if was_enabled {
                    self.pool.unload(&plugin_id).await;
                }
                Err(err)
            }
        };

        self.store.save(&record).await?;
        self.records.insert(plugin_id.clone(), record.clone());
        match outcome {
            Ok(change) => {
                self.announce(&plugin_id, change, Some(record.status));
                Ok(record)
            }
            Err(err) => {
                self.announce(&plugin_id, PluginChange::Errored, Some(record.status));
                Err(err)
            }
        }
    }

    /// Load a plugin into every worker and mark it `Enabled`.
    #[tracing::instrument(skip(self))]
    pub async fn enable(&self, plugin_id: &str) -> Result<PluginRecord> {
        let _guard = self.mutations.lock().await;
        let mut record = self.get(plugin_id).ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))?;
        if record.status == PluginStatus::Enabled {
            return Ok(record);
        }

        let outcome = self.activate(&mut record).await;
        record.updated_at = Utc::now();
        self.store.save(&record).await?;
        self.records.insert(plugin_id.to_string(), record.clone());
        match outcome {
            Ok(()) => {
                self.announce(plugin_id, PluginChange::Enabled, Some(record.status));
                Ok(record)
            }
            Err(err) => {
                self.announce(plugin_id, PluginChange::Errored, Some(record.status));
                Err(err)
            }
        }
    }

    /// Unload a plugin from the workers. A plugin in `Error` status stays there.
    #[tracing::instrument(skip(self))]
    pub async fn disable(&self, plugin_id: &str) -> Result<PluginRecord> {
        let _guard = self.mutations.lock().await;
        let mut record = self.get(plugin_id).ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))?;

        self.pool.unload(plugin_id).await;
        if record.status == PluginStatus::Enabled {
            record.status = PluginStatus::Disabled;
            record.updated_at = Utc::now();
            self.store.save(&record).await?;
            self.records.insert(plugin_id.to_string(), record.clone());
        }
        self.announce(plugin_id, PluginChange::Disabled, Some(record.status));
        Ok(record)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, plugin_id: &str) -> Result<PluginRecord> {
        let _guard = self.mutations.lock().await;
        if !self.records.contains_key(plugin_id) {
            return Err(EngineError::NotFound(plugin_id.to_string()));
        }

        self.pool.unload(plugin_id).await;
        self.store.delete(plugin_id).await?;
        self.stats.remove_plugin(plugin_id);
        let (_, record) = self
            .records
            .remove(plugin_id)
            .ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))?;
        self.announce(plugin_id, PluginChange::Deleted, None);
        Ok(record)
    }

    /// Move plugins a rebuilt worker could not take back into `Error`.
    pub async fn settle_reload_failures(&self) -> Result<usize> {
        if !self.pool.has_reload_failures() {
            return Ok(0);
        }
        let _guard = self.mutations.lock().await;
        let mut settled = 0;
        for (plugin_id, message) in self.pool.take_reload_failures() {
            let Some(mut record) = self.get(&plugin_id) else {
                continue;
            };
            if record.status != PluginStatus::Enabled {
                continue;
            }
            self.fail(&mut record, message).await;
            record.updated_at = Utc::now();
            self.store.save(&record).await?;
            self.records.insert(plugin_id.clone(), record);
            self.announce(&plugin_id, PluginChange::Errored, Some(PluginStatus::Error));
            settled += 1;
        }
        Ok(settled)
    }

    /// Check that `kind` can be executed for `plugin_id` right now.
    pub fn ensure_runnable(&self, plugin_id: &str, kind: EntryKind) -> Result<()> {
        let record = self.records.get(plugin_id).ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))?;
        if record.status != PluginStatus::Enabled {
            return Err(EngineError::NotEnabled(plugin_id.to_string(), record.status));
        }
        if !record.compiled_entry_points.contains(&kind) {
            return Err(EngineError::MissingEntryPoint(plugin_id.to_string(), kind));
        }
        Ok(())
    }

    /// Compile and load into the pool; leaves the record `Enabled` or `Error`.
    async fn activate(&self, record: &mut PluginRecord) -> Result<()> {
        let script = compile(record)?;
        match self.pool.hot_update(&record.metadata.id, Arc::new(script)).await {
            Ok(()) => {
                record.status = PluginStatus::Enabled;
                Ok(())
            }
            Err(err) => {
                self.fail(record, err.to_string()).await;
                Err(err.into())
            }
        }
    }

    async fn fail(&self, record: &mut PluginRecord, message: String) {
        warn!(plugin_id = record.id(), "plugin failed to load: {message}");
        self.pool.unload(&record.metadata.id).await;
        record.status = PluginStatus::Error;
        record.last_validation_error = Some(message);
    }

    fn announce(&self, plugin_id: &str, change: PluginChange, status: Option<PluginStatus>) {
        info!(plugin_id, %change, ?status, "plugin changed");
        // nobody listening is fine
        let _ = self.events.send(PluginEvent::new(plugin_id, change, status));
    }
}

/// Normalise the record's source, updating its entry points and error fields.
fn compile(record: &mut PluginRecord) -> Result<CompiledScript> {
    match normalizer::normalize(&record.source_code) {
        Ok(script) => {
            record.compiled_entry_points = script.entry_points();
            record.last_validation_error = None;
            Ok(script)
        }
        Err(err) => {
            record.compiled_entry_points.clear();
            record.status = PluginStatus::Error;
            record.last_validation_error = Some(err.to_string());
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ValidationError;

    const GOOD: &str = "function analyze(input) { 1 }\nglobalThis.analyze = analyze;";

    fn registry() -> PluginRegistry {
        let stats = Arc::new(StatsBook::new(8));
        let cfg = EngineConfig { pool_size: 2, ..EngineConfig::default() };
        let pool = Arc::new(WorkerPool::new(cfg, stats.clone()).unwrap());
        PluginRegistry::new(pool, stats, PluginStore::memory())
    }

    #[tokio::test]
    async fn lifecycle_moves_through_every_status() {
        let reg = registry();
        let mut events = reg.subscribe();

        let created = reg.create(PluginMetadata::new("p", "P", "1"), GOOD.into()).await.unwrap();
        assert_eq!(created.status, PluginStatus::Disabled);
        assert_eq!(created.compiled_entry_points, vec![EntryKind::Analyze]);
        assert!(matches!(reg.ensure_runnable("p", EntryKind::Analyze), Err(EngineError::NotEnabled(..))));

        reg.enable("p").await.unwrap();
        reg.ensure_runnable("p", EntryKind::Analyze).unwrap();
        assert!(matches!(
            reg.ensure_runnable("p", EntryKind::ScanRequest),
            Err(EngineError::MissingEntryPoint(_, EntryKind::ScanRequest))
        ));

        reg.disable("p").await.unwrap();
        reg.delete("p").await.unwrap();
        assert!(reg.get("p").is_none());

        let changes: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).map(|e| e.change).collect();
        assert_eq!(
            changes,
            vec![PluginChange::Created, PluginChange::Enabled, PluginChange::Disabled, PluginChange::Deleted]
        );
    }

    #[tokio::test]
    async fn invalid_source_lands_in_error_and_recovers_via_update() {
        let reg = registry();
        let err = reg.create(PluginMetadata::new("p", "P", "1"), "let x = 1;".into()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::MissingEntryPoint)));

        let record = reg.get("p").unwrap();
        assert_eq!(record.status, PluginStatus::Error);
        assert!(record.last_validation_error.is_some());
        assert!(reg.enable("p").await.is_err());

        let fixed = reg.update(PluginMetadata::new("p", "P", "2"), GOOD.into()).await.unwrap();
        assert_eq!(fixed.status, PluginStatus::Disabled);
        assert!(fixed.last_validation_error.is_none());
    }

    #[tokio::test]
    async fn bad_update_of_an_enabled_plugin_unloads_it() {
        let reg = registry();
        reg.create(PluginMetadata::new("p", "P", "1"), GOOD.into()).await.unwrap();
        reg.enable("p").await.unwrap();

        let broken = "let y = missing();\nfunction analyze(x) { 1 }\nglobalThis.analyze = analyze;";
        assert!(matches!(reg.update(PluginMetadata::new("p", "P", "2"), broken.into()).await, Err(EngineError::Load(_))));
        assert_eq!(reg.get("p").unwrap().status, PluginStatus::Error);
        assert!(!reg.pool.is_loaded("p"));
    }

    #[tokio::test]
    async fn plugin_lost_by_a_restarted_worker_goes_to_error() {
        let reg = registry();
        reg.create(PluginMetadata::new("p", "P", "1"), GOOD.into()).await.unwrap();
        reg.enable("p").await.unwrap();
        let mut events = reg.subscribe();

        reg.pool.record_reload_failure("p", "evaluation failed".to_string());
        assert_eq!(reg.settle_reload_failures().await.unwrap(), 1);

        let record = reg.get("p").unwrap();
        assert_eq!(record.status, PluginStatus::Error);
        assert_eq!(record.last_validation_error.as_deref(), Some("evaluation failed"));
        assert!(!reg.pool.is_loaded("p"));
        assert!(matches!(reg.ensure_runnable("p", EntryKind::Analyze), Err(EngineError::NotEnabled(..))));
        assert_eq!(events.try_recv().unwrap().change, PluginChange::Errored);

        assert_eq!(reg.settle_reload_failures().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_ids_are_refused() {
        let reg = registry();
        reg.create(PluginMetadata::new("p", "P", "1"), GOOD.into()).await.unwrap();
        let err = reg.create(PluginMetadata::new("p", "P", "1"), GOOD.into()).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }
}
