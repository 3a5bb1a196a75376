//! The entry points collaborators use: execution, validation and the plugin
//! lifecycle, plus the operational knobs (restarts, stats, worker views).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use scan_plugin::{
    AdvancedExecutionResult, EntryKind, ExecutionResult, PluginEvent, PluginMetadata, RunStat, ValidationResult,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result, ValidationError};
use crate::logger::TaskMetrics;
use crate::normalizer;
use crate::pool::{WorkerPool, WorkerSnapshot};
use crate::registry::PluginRegistry;
use crate::scheduler::Scheduler;
use crate::stats::{ExecutorStats, StatsBook};
use crate::store::{PluginRecord, PluginStore};

#[derive(Debug)]
pub struct PluginEngine {
    cfg: EngineConfig,
    pool: Arc<WorkerPool>,
    stats: Arc<StatsBook>,
    registry: PluginRegistry,
    scheduler: Scheduler,
}

impl PluginEngine {
    /// Start the worker pool. Failing to bring up every worker is fatal.
    pub fn new(cfg: EngineConfig, store: PluginStore) -> Result<Self> {
        let stats = Arc::new(StatsBook::new(cfg.latency_window));
        let pool = Arc::new(WorkerPool::new(cfg.clone(), stats.clone())?);
        let registry = PluginRegistry::new(pool.clone(), stats.clone(), store);
        let scheduler = Scheduler::new(cfg.clone(), pool.clone(), stats.clone(), TaskMetrics::new());
        Ok(Self { cfg, pool, stats, registry, scheduler })
    }

    /// [`PluginEngine::new`] followed by restoring persisted plugins.
    pub async fn start(cfg: EngineConfig, store: PluginStore) -> Result<Self> {
        let engine = Self::new(cfg, store)?;
        engine.registry.bootstrap().await?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    // ---- execution ----

    /// Run one entry point of an enabled plugin.
    ///
    /// Plugin failures come back as an unsuccessful result; `Err` means the
    /// task was never created.
    pub async fn submit_execution(&self, plugin_id: &str, kind: EntryKind, context: Value) -> Result<ExecutionResult> {
        self.registry.settle_reload_failures().await?;
        self.registry.ensure_runnable(plugin_id, kind)?;
        self.scheduler.submit(plugin_id, kind, context).await
    }

    /// Run the same call `runs` times, at most `concurrency` at once.
    #[tracing::instrument(skip(self, context))]
    pub async fn run_advanced(
        &self,
        plugin_id: &str,
        kind: EntryKind,
        context: Value,
        runs: usize,
        concurrency: usize,
    ) -> Result<AdvancedExecutionResult> {
        self.registry.settle_reload_failures().await?;
        self.registry.ensure_runnable(plugin_id, kind)?;
        let concurrency = concurrency.clamp(1, runs.max(1));
        let started = Instant::now();

        let mut outcomes: Vec<(usize, Result<ExecutionResult>)> = futures::stream::iter(0..runs)
            .map(|run_index| {
                let context = context.clone();
                async move { (run_index, self.scheduler.submit(plugin_id, kind, context).await) }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        outcomes.sort_by_key(|(run_index, _)| *run_index);

        let mut unique = HashSet::new();
        let mut total_findings = 0;
        let runs_stats: Vec<RunStat> = outcomes
            .into_iter()
            .map(|(run_index, outcome)| match outcome {
                Ok(result) => {
                    total_findings += result.findings.len();
                    unique.extend(result.findings.iter().map(|f| f.dedup_key()));
                    RunStat {
                        run_index,
                        duration_ms: result.execution_time_ms,
                        findings: result.findings.len(),
                        error: result.error,
                    }
                }
                Err(err) => RunStat { run_index, duration_ms: 0, findings: 0, error: Some(err.to_string()) },
            })
            .collect();

        let avg_duration_ms = if runs_stats.is_empty() {
            0.0
        } else {
            runs_stats.iter().map(|r| r.duration_ms as f64).sum::<f64>() / runs_stats.len() as f64
        };
        Ok(AdvancedExecutionResult {
            total_runs: runs,
            concurrency,
            total_duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            avg_duration_ms,
            total_findings,
            unique_findings: unique.len(),
            runs: runs_stats,
        })
    }

    // ---- validation ----

    /// Check source without loading it anywhere.
    pub fn validate_plugin_code(&self, source_code: &str) -> ValidationResult {
        validate_source(source_code)
    }

    // ---- lifecycle ----

    pub async fn create_plugin(&self, metadata: PluginMetadata, source_code: impl Into<String>) -> Result<PluginRecord> {
        self.registry.create(metadata, source_code.into()).await
    }

    pub async fn update_plugin(&self, metadata: PluginMetadata, source_code: impl Into<String>) -> Result<PluginRecord> {
        self.registry.update(metadata, source_code.into()).await
    }

    pub async fn enable_plugin(&self, plugin_id: &str) -> Result<PluginRecord> {
        self.registry.enable(plugin_id).await
    }

    pub async fn disable_plugin(&self, plugin_id: &str) -> Result<PluginRecord> {
        self.registry.disable(plugin_id).await
    }

    pub async fn delete_plugin(&self, plugin_id: &str) -> Result<PluginRecord> {
        self.registry.delete(plugin_id).await
    }

    pub fn plugin(&self, plugin_id: &str) -> Option<PluginRecord> {
        self.registry.get(plugin_id)
    }

    pub fn plugins(&self) -> Vec<PluginRecord> {
        self.registry.list()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.registry.subscribe()
    }

    // ---- workers and stats ----

    /// Rebuild one worker; its counters are zeroed only when `reset_stats` is set.
    pub async fn restart_worker(&self, worker_id: usize, reset_stats: bool) -> Result<()> {
        self.pool.restart(worker_id).await?;
        if reset_stats {
            self.stats.reset_worker(worker_id);
        }
        Ok(())
    }

    /// Full-pool recovery.
    pub async fn restart_all(&self, reset_stats: bool) -> Result<()> {
        self.pool.restart_all().await?;
        if reset_stats {
            self.stats.reset_all();
        }
        info!(reset_stats, "worker pool recovered");
        Ok(())
    }

    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.pool.snapshot()
    }

    pub fn worker(&self, worker_id: usize) -> Option<WorkerSnapshot> {
        self.pool.worker(worker_id)
    }

    pub fn plugin_stats(&self, plugin_id: &str) -> Option<ExecutorStats> {
        self.stats.plugin(plugin_id)
    }

    pub fn worker_stats(&self, worker_id: usize) -> Option<ExecutorStats> {
        self.stats.worker(worker_id)
    }

    pub fn aggregate_stats(&self) -> ExecutorStats {
        self.stats.aggregate()
    }

    pub fn reset_plugin_stats(&self, plugin_id: &str) -> Result<()> {
        if self.registry.get(plugin_id).is_none() {
            return Err(EngineError::NotFound(plugin_id.to_string()));
        }
        self.stats.reset_plugin(plugin_id);
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.scheduler.in_flight()
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

pub fn validate_source(source_code: &str) -> ValidationResult {
    let mut result = ValidationResult::default();

    match normalizer::normalize(source_code) {
        Ok(script) => {
            result.syntax_valid = true;
            result.has_required_functions = true;
            result.entry_points = script.entry_points();
            result.warnings.extend(script.warnings);
        }
        Err(err) => {
            result.syntax_valid = !matches!(err, ValidationError::Syntax(_) | ValidationError::Unterminated { .. });
            result.errors.push(err.to_string());
        }
    }

    let security = normalizer::security_scan(source_code);
    result.security_check_passed = security.passed();
    result.errors.extend(security.errors);
    result.warnings.extend(security.warnings);

    if !source_code.contains("emitFinding") {
        result.warnings.push("plugin never calls emitFinding, so it cannot report findings".to_string());
    }

    result.is_valid = result.syntax_valid && result.has_required_functions && result.security_check_passed;
    result
}
