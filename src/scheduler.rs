//! Admission, deadlines and outcome mapping for execution tasks.

use std::sync::Arc;
use std::time::Instant;

use scan_plugin::{EntryKind, ExecutionResult, FailureReason, TaskStatus};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bridge::SinkReport;
use crate::collector::{self, TaskIdentity, Verdict};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::logger::TaskMetrics;
use crate::pool::{RestartReason, WorkerPool};
use crate::stats::{StatsBook, TaskSample};
use crate::worker::{CallStatus, Invocation};

/// One admitted unit of work.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub task_id: String,
    pub plugin_id: String,
    pub kind: EntryKind,
    pub context: Arc<Value>,
    pub submitted_at: Instant,
    pub deadline: Instant,
    state: TaskStatus,
}

impl ExecutionTask {
    fn new(plugin_id: &str, kind: EntryKind, context: Value, cfg: &EngineConfig) -> Self {
        let submitted_at = Instant::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            plugin_id: plugin_id.to_string(),
            kind,
            context: Arc::new(context),
            submitted_at,
            deadline: submitted_at + cfg.call_timeout(),
            state: TaskStatus::Queued,
        }
    }

    pub fn state(&self) -> TaskStatus {
        self.state
    }

    /// Move forward; backwards or repeated transitions are ignored.
    fn advance(&mut self, next: TaskStatus) -> bool {
        if !self.state.can_advance_to(next) {
            warn!(task_id = %self.task_id, from = %self.state, to = %next, "ignoring illegal task transition");
            return false;
        }
        self.state = next;
        true
    }
}

/// Admits up to `N + Q` tasks at a time and drives each one to a final result.
#[derive(Debug)]
pub struct Scheduler {
    cfg: EngineConfig,
    pool: Arc<WorkerPool>,
    stats: Arc<StatsBook>,
    metrics: TaskMetrics,
    admission: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(cfg: EngineConfig, pool: Arc<WorkerPool>, stats: Arc<StatsBook>, metrics: TaskMetrics) -> Self {
        let admission = Arc::new(Semaphore::new(cfg.admission_capacity()));
        Self { cfg, pool, stats, metrics, admission }
    }

    /// Tasks currently admitted (running or waiting for a worker).
    pub fn in_flight(&self) -> usize {
        self.cfg.admission_capacity() - self.admission.available_permits()
    }

    /// Run one task to completion.
    ///
    /// `Err` means the task was never created; every admitted task ends in an
    /// `ExecutionResult`, whatever the plugin did.
    #[tracing::instrument(skip(self, context), fields(task_id = tracing::field::Empty))]
    pub async fn submit(&self, plugin_id: &str, kind: EntryKind, context: Value) -> Result<ExecutionResult> {
        // 1) admission, never waits
        let permit = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.metrics.rejected(plugin_id);
                return Err(EngineError::Backpressure { capacity: self.cfg.admission_capacity() });
            }
        };

        let task = ExecutionTask::new(plugin_id, kind, context, &self.cfg);
        tracing::Span::current().record("task_id", task.task_id.as_str());

        // 2) drive it on its own task so a dropped caller cannot strand a worker
        let run = TaskRun {
            cfg: self.cfg.clone(),
            pool: self.pool.clone(),
            stats: self.stats.clone(),
            metrics: self.metrics.clone(),
        };
        let joined = tokio::spawn(async move {
            let result = run.execute(task).await;
            drop(permit);
            result
        })
        .await;

        joined.map_err(|e| EngineError::Internal(format!("execution task aborted: {e}")))
    }
}

struct TaskRun {
    cfg: EngineConfig,
    pool: Arc<WorkerPool>,
    stats: Arc<StatsBook>,
    metrics: TaskMetrics,
}

impl TaskRun {
    async fn execute(self, mut task: ExecutionTask) -> ExecutionResult {
        // 1) wait for a worker, but not past the deadline
        let Some(lease) = self.pool.acquire(&task.plugin_id, task.deadline).await else {
            task.advance(TaskStatus::TimedOut);
            let verdict = Verdict::TimedOut { message: "no worker became available before the deadline".to_string() };
            return self.finish(&task, None, verdict, SinkReport::default(), false);
        };
        task.advance(TaskStatus::Running);
        self.metrics.started(&task.plugin_id);
        let worker_id = lease.worker_id();

        // 2) hand it over and race the reply against deadline + grace
        let invocation = Invocation {
            task_id: task.task_id.clone(),
            plugin_id: task.plugin_id.clone(),
            kind: task.kind,
            context: task.context.clone(),
            deadline: task.deadline,
        };
        let hard_deadline = tokio::time::Instant::from_std(task.deadline + self.cfg.kill_grace());
        let (status, report) = match lease.handle().invoke(invocation) {
            None => (worker_lost("worker stopped before accepting the task"), SinkReport::default()),
            Some(reply) => match tokio::time::timeout_at(hard_deadline, reply).await {
                Ok(Ok(outcome)) => (outcome.status, outcome.report),
                Ok(Err(_)) => (worker_lost("worker stopped while running the task"), SinkReport::default()),
                Err(_) => {
                    warn!(worker_id, task_id = %task.task_id, "worker did not yield after the deadline");
                    lease.handle().abort();
                    (CallStatus::TimedOut, SinkReport::default())
                }
            },
        };

        // 3) decide the worker's fate
        let restart = match &status {
            CallStatus::TimedOut => Some(RestartReason::Timeout),
            CallStatus::Failed { reason: FailureReason::ResourceExceeded, .. } => Some(RestartReason::ResourceExceeded),
            CallStatus::Failed { reason: FailureReason::WorkerLost, .. } => Some(RestartReason::WorkerLost),
            _ => None,
        };
        let caused_restart = matches!(restart, Some(RestartReason::Timeout | RestartReason::ResourceExceeded));
        let peak_bytes = report.peak_bytes;
        match restart {
            // rebuilding takes a while; the caller gets its answer first
            Some(reason) => {
                let pool = self.pool.clone();
                tokio::spawn(async move { pool.complete(lease, peak_bytes, Some(reason)).await });
            }
            None => self.pool.complete(lease, peak_bytes, None).await,
        }

        // 4) result
        let verdict = match status {
            CallStatus::Completed { output } => {
                task.advance(TaskStatus::Completed);
                Verdict::Completed { output }
            }
            CallStatus::TimedOut => {
                task.advance(TaskStatus::TimedOut);
                Verdict::TimedOut { message: format!("execution exceeded {} ms", self.cfg.call_timeout_ms) }
            }
            CallStatus::Failed { reason, message } => {
                task.advance(TaskStatus::Failed);
                Verdict::Failed { reason, message }
            }
        };
        self.finish(&task, Some(worker_id), verdict, report, caused_restart)
    }

    fn finish(
        &self,
        task: &ExecutionTask,
        worker_id: Option<usize>,
        verdict: Verdict,
        report: SinkReport,
        caused_restart: bool,
    ) -> ExecutionResult {
        let elapsed_ms = u64::try_from(task.submitted_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        let identity = TaskIdentity {
            task_id: &task.task_id,
            plugin_id: &task.plugin_id,
            kind: task.kind,
            context: &task.context,
            worker_id,
        };
        let result = collector::assemble(identity, verdict, report, elapsed_ms);

        self.stats.record(TaskSample {
            plugin_id: &task.plugin_id,
            worker_id,
            status: result.status,
            duration_ms: elapsed_ms,
            caused_restart,
        });
        self.metrics.finished(&result);
        debug!(task_id = %task.task_id, status = %result.status, elapsed_ms, "task finished");
        result
    }
}

fn worker_lost(message: &str) -> CallStatus {
    CallStatus::Failed { reason: FailureReason::WorkerLost, message: message.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_only_move_forward() {
        let mut task = ExecutionTask::new("p", EntryKind::Analyze, Value::Null, &EngineConfig::default());
        assert_eq!(task.state(), TaskStatus::Queued);
        assert!(task.advance(TaskStatus::Running));
        assert!(task.advance(TaskStatus::Failed));
        assert!(!task.advance(TaskStatus::Queued));
        assert_eq!(task.state(), TaskStatus::Failed);
    }

    #[test]
    fn deadline_is_submit_time_plus_timeout() {
        let cfg = EngineConfig { call_timeout_ms: 750, ..EngineConfig::default() };
        let task = ExecutionTask::new("p", EntryKind::ScanRequest, Value::Null, &cfg);
        assert_eq!(task.deadline - task.submitted_at, cfg.call_timeout());
    }
}
