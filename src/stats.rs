use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use scan_plugin::TaskStatus;
use serde::{Deserialize, Serialize};

/// Counters exposed per plugin, per worker and for the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutorStats {
    pub total_invocations: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub restart_count: u64,
    /// Mean over the most recent `latency_window` samples.
    pub avg_duration_ms: f64,
    pub last_reset_at: DateTime<Utc>,
}

/// One finished task, as seen by the stats book.
#[derive(Debug, Clone, Copy)]
pub struct TaskSample<'a> {
    pub plugin_id: &'a str,
    pub worker_id: Option<usize>,
    pub status: TaskStatus,
    pub duration_ms: u64,
    /// The task's worker had to be torn down afterwards.
    pub caused_restart: bool,
}

/// Fixed-size running mean.
#[derive(Debug, Clone)]
struct Window {
    samples: VecDeque<u64>,
    sum: u64,
    cap: usize,
}

impl Window {
    fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { samples: VecDeque::with_capacity(cap), sum: 0, cap }
    }

    fn push(&mut self, value: u64) {
        if self.samples.len() == self.cap {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum as f64 / self.samples.len() as f64
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0;
    }
}

#[derive(Debug, Clone)]
struct Counters {
    total: u64,
    errors: u64,
    timeouts: u64,
    restarts: u64,
    window: Window,
    last_reset_at: DateTime<Utc>,
}

impl Counters {
    fn new(window: usize) -> Self {
        Self { total: 0, errors: 0, timeouts: 0, restarts: 0, window: Window::new(window), last_reset_at: Utc::now() }
    }

    fn record(&mut self, sample: &TaskSample<'_>) {
        self.total += 1;
        match sample.status {
            TaskStatus::TimedOut => self.timeouts += 1,
            TaskStatus::Failed => self.errors += 1,
            _ => {}
        }
        if sample.caused_restart {
            self.restarts += 1;
        }
        self.window.push(sample.duration_ms);
    }

    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            total_invocations: self.total,
            error_count: self.errors,
            timeout_count: self.timeouts,
            restart_count: self.restarts,
            avg_duration_ms: self.window.mean(),
            last_reset_at: self.last_reset_at,
        }
    }
}

/// Live counters for every plugin and worker, plus the aggregate.
///
/// Each finished task is recorded exactly once. Rejected submissions never
/// reach the book.
#[derive(Debug)]
pub struct StatsBook {
    window: usize,
    plugins: DashMap<String, Counters>,
    workers: DashMap<usize, Counters>,
    aggregate: Mutex<Counters>,
}

impl StatsBook {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            plugins: DashMap::new(),
            workers: DashMap::new(),
            aggregate: Mutex::new(Counters::new(window)),
        }
    }

    pub fn record(&self, sample: TaskSample<'_>) {
        self.plugins
            .entry(sample.plugin_id.to_string())
            .or_insert_with(|| Counters::new(self.window))
            .record(&sample);
        if let Some(worker_id) = sample.worker_id {
            self.workers
                .entry(worker_id)
                .or_insert_with(|| Counters::new(self.window))
                .record(&sample);
        }
        self.aggregate.lock().unwrap_or_else(|e| e.into_inner()).record(&sample);
    }

    pub fn plugin(&self, plugin_id: &str) -> Option<ExecutorStats> {
        self.plugins.get(plugin_id).map(|c| c.snapshot())
    }

    pub fn worker(&self, worker_id: usize) -> Option<ExecutorStats> {
        self.workers.get(&worker_id).map(|c| c.snapshot())
    }

    pub fn aggregate(&self) -> ExecutorStats {
        self.aggregate.lock().unwrap_or_else(|e| e.into_inner()).snapshot()
    }

    /// A worker's context was rebuilt: its latency window starts over, its counters stay.
    pub fn worker_restarted(&self, worker_id: usize) {
        if let Some(mut counters) = self.workers.get_mut(&worker_id) {
            counters.window.clear();
        }
    }

    /// Zero a plugin's counters.
    pub fn reset_plugin(&self, plugin_id: &str) {
        if let Some(mut counters) = self.plugins.get_mut(plugin_id) {
            *counters = Counters::new(self.window);
        }
    }

    /// Zero a worker's counters.
    pub fn reset_worker(&self, worker_id: usize) {
        if let Some(mut counters) = self.workers.get_mut(&worker_id) {
            *counters = Counters::new(self.window);
        }
    }

    pub fn reset_all(&self) {
        for mut entry in self.plugins.iter_mut() {
            *entry.value_mut() = Counters::new(self.window);
        }
        for mut entry in self.workers.iter_mut() {
            *entry.value_mut() = Counters::new(self.window);
        }
        *self.aggregate.lock().unwrap_or_else(|e| e.into_inner()) = Counters::new(self.window);
    }

    pub fn remove_plugin(&self, plugin_id: &str) {
        self.plugins.remove(plugin_id);
    }
}
