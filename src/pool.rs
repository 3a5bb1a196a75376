use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, LoadError, Result};
use crate::normalizer::CompiledScript;
use crate::stats::StatsBook;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Restarting,
    Dead,
}

/// Why a worker's context is being rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RestartReason {
    Timeout,
    ResourceExceeded,
    WorkerLost,
    Recycle,
    Requested,
    Recovery,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkerSnapshot {
    pub worker_id: usize,
    pub state: WorkerState,
    pub loaded_plugin_ids: BTreeSet<String>,
    pub memory_high_water_mark: usize,
    pub restart_count: u64,
    pub created_at: DateTime<Utc>,
    pub generation: u64,
    pub executions_since_restart: u64,
}

#[derive(Debug)]
struct SlotInner {
    state: WorkerState,
    handle: Option<Arc<WorkerHandle>>,
    generation: u64,
    restart_count: u64,
    memory_high_water_mark: usize,
    created_at: DateTime<Utc>,
    executions: u64,
    loaded: BTreeSet<String>,
}

#[derive(Debug)]
struct Slot {
    id: usize,
    inner: Mutex<SlotInner>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> WorkerSnapshot {
        let inner = self.lock();
        WorkerSnapshot {
            worker_id: self.id,
            state: inner.state,
            loaded_plugin_ids: inner.loaded.clone(),
            memory_high_water_mark: inner.memory_high_water_mark,
            restart_count: inner.restart_count,
            created_at: inner.created_at,
            generation: inner.generation,
            executions_since_restart: inner.executions,
        }
    }
}

/// Exclusive use of one `Busy` worker.
///
/// Dropping a lease without [`WorkerPool::complete`] hands the worker back
/// as `Idle`, unless it was restarted in the meantime.
#[derive(Debug)]
pub struct WorkerLease {
    slot: Arc<Slot>,
    handle: Arc<WorkerHandle>,
    generation: u64,
    idle: Arc<Notify>,
    settled: bool,
}

impl WorkerLease {
    pub fn worker_id(&self) -> usize {
        self.slot.id
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut inner = self.slot.lock();
        if inner.generation == self.generation && inner.state == WorkerState::Busy {
            inner.state = WorkerState::Idle;
            drop(inner);
            self.idle.notify_one();
        }
    }
}

/// Fixed set of `N` isolated workers.
///
/// Every worker carries every plugin the registry wants loaded; the pool
/// keeps that wanted set so rebuilt contexts can be refilled.
#[derive(Debug)]
pub struct WorkerPool {
    cfg: EngineConfig,
    slots: Vec<Arc<Slot>>,
    desired: DashMap<String, Arc<CompiledScript>>,
    // plugins a rebuilt context could not take back, for the registry to settle
    reload_failures: DashMap<String, String>,
    idle: Arc<Notify>,
    stats: Arc<StatsBook>,
    // serialises script loading against context rebuilds
    reload: tokio::sync::Mutex<()>,
    cursor: AtomicUsize,
}

impl WorkerPool {
    /// Bring up `cfg.pool_size` workers, failing if any of them cannot start.
    pub fn new(cfg: EngineConfig, stats: Arc<StatsBook>) -> Result<Self> {
        if cfg.pool_size == 0 {
            return Err(EngineError::PoolInit("pool_size must be at least 1".to_string()));
        }

        let mut slots = Vec::with_capacity(cfg.pool_size);
        for id in 0..cfg.pool_size {
            let handle = WorkerHandle::spawn(id, 0, &cfg)
                .map_err(|e| EngineError::PoolInit(format!("worker {id} failed to start: {e}")))?;
            slots.push(Arc::new(Slot {
                id,
                inner: Mutex::new(SlotInner {
                    state: WorkerState::Idle,
                    handle: Some(Arc::new(handle)),
                    generation: 0,
                    restart_count: 0,
                    memory_high_water_mark: 0,
                    created_at: Utc::now(),
                    executions: 0,
                    loaded: BTreeSet::new(),
                }),
            }));
        }
        info!(size = cfg.pool_size, "worker pool ready");

        Ok(Self {
            cfg,
            slots,
            desired: DashMap::new(),
            reload_failures: DashMap::new(),
            idle: Arc::new(Notify::new()),
            stats,
            reload: tokio::sync::Mutex::new(()),
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Claim an `Idle` worker for `plugin_id`, or `None` if every worker is
    /// occupied.
    ///
    /// While the plugin is wanted, workers that do not carry it are passed over.
    pub fn dispatch(&self, plugin_id: &str) -> Option<WorkerLease> {
        let wanted = self.desired.contains_key(plugin_id);
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.slots.len() {
            let slot = &self.slots[(start + offset) % self.slots.len()];
            let mut inner = slot.lock();
            if inner.state != WorkerState::Idle || (wanted && !inner.loaded.contains(plugin_id)) {
                continue;
            }
            let Some(handle) = inner.handle.clone().filter(|h| h.is_alive()) else {
                continue;
            };
            inner.state = WorkerState::Busy;
            return Some(WorkerLease {
                slot: slot.clone(),
                handle,
                generation: inner.generation,
                idle: self.idle.clone(),
                settled: false,
            });
        }
        None
    }

    /// Wait for a worker carrying `plugin_id` until `deadline`.
    pub async fn acquire(&self, plugin_id: &str, deadline: Instant) -> Option<WorkerLease> {
        let deadline = tokio::time::Instant::from_std(deadline);
        loop {
            let notified = self.idle.notified();
            if let Some(lease) = self.dispatch(plugin_id) {
                return Some(lease);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.dispatch(plugin_id);
            }
        }
    }

    /// Return a worker after a task, rebuilding its context when asked to or
    /// when it has served `recycle_after` executions.
    pub async fn complete(&self, mut lease: WorkerLease, peak_bytes: usize, restart: Option<RestartReason>) {
        lease.settled = true;
        let reason = {
            let mut inner = lease.slot.lock();
            if inner.generation != lease.generation {
                // restarted underneath the task, nothing left to hand back
                return;
            }
            inner.memory_high_water_mark = inner.memory_high_water_mark.max(peak_bytes);
            inner.executions += 1;

            let recycle = self.cfg.recycle_after > 0 && inner.executions >= self.cfg.recycle_after;
            let reason = restart.or(recycle.then_some(RestartReason::Recycle));
            if reason.is_none() {
                inner.state = WorkerState::Idle;
            }
            reason
        };

        match reason {
            Some(reason) => {
                if let Err(err) = self.restart_slot(&lease.slot, reason).await {
                    error!(worker_id = lease.slot.id, %reason, "worker restart failed: {err}");
                }
            }
            None => self.idle.notify_one(),
        }
    }

    /// Rebuild one worker's context, whatever it is doing.
    ///
    /// A task running on it at that moment ends as `WorkerLost`.
    #[tracing::instrument(skip(self))]
    pub async fn restart(&self, worker_id: usize) -> Result<()> {
        let slot = self
            .slots
            .get(worker_id)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("no worker with id {worker_id}")))?;
        self.restart_slot(&slot, RestartReason::Requested).await
    }

    /// Rebuild every worker; fails unless all `N` come back `Idle`.
    #[tracing::instrument(skip(self))]
    pub async fn restart_all(&self) -> Result<()> {
        let mut failures = Vec::new();
        for slot in &self.slots {
            if let Err(err) = self.restart_slot(slot, RestartReason::Recovery).await {
                failures.push(format!("worker {}: {err}", slot.id));
            }
        }
        let healthy = self.slots.iter().filter(|s| s.lock().state == WorkerState::Idle).count();
        if !failures.is_empty() || healthy != self.slots.len() {
            return Err(EngineError::PoolInit(format!(
                "{healthy}/{} workers healthy after recovery: {}",
                self.slots.len(),
                failures.join("; ")
            )));
        }
        Ok(())
    }

    async fn restart_slot(&self, slot: &Arc<Slot>, reason: RestartReason) -> Result<()> {
        let _reload = self.reload.lock().await;

        // 1) take the old context out of service
        let (old, generation, loaded) = {
            let mut inner = slot.lock();
            inner.state = WorkerState::Restarting;
            inner.restart_count += 1;
            inner.memory_high_water_mark = 0;
            inner.executions = 0;
            inner.generation += 1;
            (inner.handle.take(), inner.generation, inner.loaded.clone())
        };
        debug!(worker_id = slot.id, %reason, generation, "restarting worker");

        // 2) tear it down, bounded in time
        let mut teardown_failed = false;
        if let Some(old) = old {
            if !old.terminate(self.cfg.teardown_timeout()).await {
                error!(worker_id = slot.id, "context did not stop within {:?}; abandoning its thread", self.cfg.teardown_timeout());
                slot.lock().state = WorkerState::Dead;
                teardown_failed = true;
            }
        }

        // 3) fresh context
        let handle = match WorkerHandle::spawn(slot.id, generation, &self.cfg) {
            Ok(handle) => Arc::new(handle),
            Err(err) => {
                slot.lock().state = WorkerState::Dead;
                return Err(EngineError::PoolInit(format!("worker {} failed to restart: {err}", slot.id)));
            }
        };

        // 4) reload what it had
        let mut reloaded = BTreeSet::new();
        for plugin_id in loaded {
            let Some(script) = self.desired.get(&plugin_id).map(|s| s.value().clone()) else {
                continue;
            };
            match handle.load(&plugin_id, script).await {
                Ok(()) => {
                    reloaded.insert(plugin_id);
                }
                Err(LoadError::WorkerGone(_)) => {}
                Err(err) => {
                    warn!(worker_id = slot.id, %plugin_id, "reload after restart failed: {err}");
                    self.record_reload_failure(&plugin_id, err.to_string());
                }
            }
        }

        // 5) back in service
        {
            let mut inner = slot.lock();
            inner.handle = Some(handle);
            inner.loaded = reloaded;
            inner.created_at = Utc::now();
            inner.state = WorkerState::Idle;
        }
        self.stats.worker_restarted(slot.id);
        self.idle.notify_one();

        if teardown_failed {
            return Err(EngineError::Internal(format!("worker {} teardown exceeded its time bound", slot.id)));
        }
        Ok(())
    }

    /// Replace a plugin's script in every worker.
    ///
    /// Workers pick the new script up after any call they are running, and
    /// all of them have it by the time this returns.
    #[tracing::instrument(skip(self, script))]
    pub async fn hot_update(&self, plugin_id: &str, script: Arc<CompiledScript>) -> Result<(), LoadError> {
        let _reload = self.reload.lock().await;
        self.desired.insert(plugin_id.to_string(), script.clone());
        self.reload_failures.remove(plugin_id);

        let mut first_error = None;
        for slot in &self.slots {
            let Some(handle) = slot.lock().handle.clone() else {
                continue;
            };
            match handle.load(plugin_id, script.clone()).await {
                Ok(()) => {
                    slot.lock().loaded.insert(plugin_id.to_string());
                }
                Err(LoadError::WorkerGone(id)) => {
                    debug!(worker_id = id, plugin_id, "worker went away during hot update");
                }
                Err(err) => {
                    slot.lock().loaded.remove(plugin_id);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop a plugin from every worker.
    #[tracing::instrument(skip(self))]
    pub async fn unload(&self, plugin_id: &str) {
        let _reload = self.reload.lock().await;
        self.desired.remove(plugin_id);
        self.reload_failures.remove(plugin_id);
        for slot in &self.slots {
            let handle = {
                let mut inner = slot.lock();
                inner.loaded.remove(plugin_id);
                inner.handle.clone()
            };
            if let Some(handle) = handle {
                handle.unload(plugin_id).await;
            }
        }
    }

    pub(crate) fn record_reload_failure(&self, plugin_id: &str, message: String) {
        self.reload_failures.insert(plugin_id.to_string(), message);
    }

    pub fn has_reload_failures(&self) -> bool {
        !self.reload_failures.is_empty()
    }

    /// Hand over plugins that failed to come back after a restart.
    pub fn take_reload_failures(&self) -> Vec<(String, String)> {
        let ids: Vec<String> = self.reload_failures.iter().map(|e| e.key().clone()).collect();
        ids.into_iter().filter_map(|id| self.reload_failures.remove(&id)).collect()
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.desired.contains_key(plugin_id)
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.slots.iter().map(|s| s.snapshot()).collect()
    }

    pub fn worker(&self, worker_id: usize) -> Option<WorkerSnapshot> {
        self.slots.get(worker_id).map(|s| s.snapshot())
    }

    /// Stop every worker; the pool is unusable afterwards.
    pub async fn shutdown(&self) {
        for slot in &self.slots {
            let handle = {
                let mut inner = slot.lock();
                inner.state = WorkerState::Dead;
                inner.handle.take()
            };
            if let Some(handle) = handle {
                if !handle.terminate(self.cfg.teardown_timeout()).await {
                    warn!(worker_id = slot.id, "worker did not stop in time during shutdown");
                }
            }
        }
        self.idle.notify_waiters();
    }
}
