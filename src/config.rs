use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};
use tracing::{debug, info, warn};

/// Prefix of every engine setting when read from a [`ConfigManager`].
pub const ENV_PREFIX: &str = "SCANHOST_";

/// Tunables of the plugin engine.
///
/// Every field can be overridden through a [`ConfigManager`] using the
/// upper-cased field name prefixed with `SCANHOST_`, e.g. `SCANHOST_POOL_SIZE=8`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of isolated workers (N).
    pub pool_size: usize,
    /// Tasks allowed to wait for a worker on top of the N running ones (Q).
    pub queue_depth: usize,
    pub call_timeout_ms: u64,
    /// How long past the deadline a worker gets before it is torn down.
    pub kill_grace_ms: u64,
    /// Upper bound on tearing down and replacing a worker's context.
    pub teardown_timeout_ms: u64,
    /// Per-worker accounted heap ceiling.
    pub max_memory_bytes: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_levels: usize,
    /// Hard operation budget per call, 0 means unlimited.
    pub max_operations: u64,
    /// Log ring capacity per execution.
    pub log_capacity: usize,
    pub max_log_line_bytes: usize,
    pub max_findings: usize,
    /// Samples kept for rolling latency averages.
    pub latency_window: usize,
    /// Executions served by a context before it is proactively recycled, 0 disables.
    pub recycle_after: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_depth: 64,
            call_timeout_ms: 5_000,
            kill_grace_ms: 250,
            teardown_timeout_ms: 2_000,
            max_memory_bytes: 64 * 1024 * 1024,
            max_string_size: 4 * 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 100_000,
            max_call_levels: 64,
            max_operations: 0,
            log_capacity: 256,
            max_log_line_bytes: 2_048,
            max_findings: 512,
            latency_window: 128,
            recycle_after: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Total number of tasks that may be admitted at once (N + Q).
    pub fn admission_capacity(&self) -> usize {
        self.pool_size + self.queue_depth
    }

    /// Read overrides from `mgr` on top of the defaults.
    pub async fn load(mgr: &ConfigManager) -> Self {
        let mut cfg = Self::default();
        override_from(mgr, "pool_size", &mut cfg.pool_size).await;
        override_from(mgr, "queue_depth", &mut cfg.queue_depth).await;
        override_from(mgr, "call_timeout_ms", &mut cfg.call_timeout_ms).await;
        override_from(mgr, "kill_grace_ms", &mut cfg.kill_grace_ms).await;
        override_from(mgr, "teardown_timeout_ms", &mut cfg.teardown_timeout_ms).await;
        override_from(mgr, "max_memory_bytes", &mut cfg.max_memory_bytes).await;
        override_from(mgr, "max_string_size", &mut cfg.max_string_size).await;
        override_from(mgr, "max_array_size", &mut cfg.max_array_size).await;
        override_from(mgr, "max_map_size", &mut cfg.max_map_size).await;
        override_from(mgr, "max_call_levels", &mut cfg.max_call_levels).await;
        override_from(mgr, "max_operations", &mut cfg.max_operations).await;
        override_from(mgr, "log_capacity", &mut cfg.log_capacity).await;
        override_from(mgr, "max_log_line_bytes", &mut cfg.max_log_line_bytes).await;
        override_from(mgr, "max_findings", &mut cfg.max_findings).await;
        override_from(mgr, "latency_window", &mut cfg.latency_window).await;
        override_from(mgr, "recycle_after", &mut cfg.recycle_after).await;
        debug!(?cfg, "engine configuration loaded");
        cfg
    }
}

async fn override_from<T>(mgr: &ConfigManager, field: &str, target: &mut T)
where
    T: FromStr,
{
    let key = format!("{ENV_PREFIX}{}", field.to_uppercase());
    let Some(raw) = mgr.0.get(&key).await else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(%key, value = %raw, "ignoring unparsable configuration value"),
    }
}

#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    async fn del(&self, key: &str);
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

/// Source of configuration values, wrapped so it can be cloned and serialized.
#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Reads the process environment, seeded from an optional `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        match dotenvy::from_path(&env_file) {
            Ok(()) => info!("loaded environment from {}", env_file.display()),
            Err(err) => debug!("no environment file at {}: {err}", env_file.display()),
        }
        Box::new(Self { env_file })
    }

    /// Rewrite the `.env` file, replacing or dropping `key`.
    fn rewrite_env_file(&self, key: &str, value: Option<&str>) -> Result<(), String> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = content
            .lines()
            .filter(|line| line.split_once('=').map(|(k, _)| k.trim() != key).unwrap_or(true))
            .map(str::to_string)
            .collect();
        if let Some(value) = value {
            lines.push(format!("{key}={value}"));
        }
        fs::write(&self.env_file, lines.join("\n")).map_err(|e| e.to_string())
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        }
        self.rewrite_env_file(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        }
        if self.env_file.exists() {
            if let Err(err) = self.rewrite_env_file(key, None) {
                warn!("could not update {}: {err}", self.env_file.display());
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory configuration, used when embedding the engine and in tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Box<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Box::new(Self { map })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn defaults_survive_an_empty_manager() {
        let mgr = ConfigManager(MapConfigManager::new());
        let cfg = EngineConfig::load(&mgr).await;
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.admission_capacity(), 68);
        assert_eq!(cfg.call_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn prefixed_keys_override_defaults() {
        let mgr = ConfigManager(MapConfigManager::from_pairs([
            ("SCANHOST_POOL_SIZE", "2"),
            ("SCANHOST_CALL_TIMEOUT_MS", " 150 "),
            ("SCANHOST_LOG_CAPACITY", "lots"),
            ("POOL_SIZE", "99"),
        ]));
        let cfg = EngineConfig::load(&mgr).await;
        assert_eq!(cfg.pool_size, 2);
        assert_eq!(cfg.call_timeout_ms, 150);
        // unparsable values keep the default
        assert_eq!(cfg.log_capacity, 256);
    }

    #[tokio::test]
    async fn map_manager_set_get_del() {
        let mgr = MapConfigManager::new();
        mgr.set("foo", "bar").await.unwrap();
        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);
        mgr.del("foo").await;
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn env_manager_reads_dotenv_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "SCANHOST_TEST_QUEUE_DEPTH=7\n").unwrap();

        let mgr = EnvConfigManager::new(env_path.clone());
        assert_eq!(mgr.get("SCANHOST_TEST_QUEUE_DEPTH").await, Some("7".to_string()));

        mgr.set("SCANHOST_TEST_EXTRA", "1").await.unwrap();
        let written = fs::read_to_string(&env_path).unwrap();
        assert!(written.contains("SCANHOST_TEST_EXTRA=1"));

        mgr.del("SCANHOST_TEST_EXTRA").await;
        mgr.del("SCANHOST_TEST_QUEUE_DEPTH").await;
        assert_eq!(std::env::var("SCANHOST_TEST_EXTRA").ok(), None);
        assert!(!fs::read_to_string(&env_path).unwrap().contains("SCANHOST_TEST_EXTRA"));
    }

    #[test]
    fn config_round_trips_with_partial_json() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"pool_size": 1}"#).unwrap();
        assert_eq!(cfg.pool_size, 1);
        assert_eq!(cfg.queue_depth, 64);
    }
}
