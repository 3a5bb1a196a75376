use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::finding::Finding;
use crate::plugin::EntryKind;

/// Lifecycle of one execution task. Transitions only move forward:
/// `Queued -> Running -> {Completed | TimedOut | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    TimedOut,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::TimedOut | TaskStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Queued, TaskStatus::Running) => true,
            // a queued task may expire before it ever reaches a worker
            (TaskStatus::Queued, TaskStatus::TimedOut) => true,
            (TaskStatus::Queued, TaskStatus::Failed) => true,
            (TaskStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }
}

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureReason {
    /// The plugin threw, or called something that is not defined.
    RuntimeError,
    /// Memory, data-size or stack ceiling breached.
    ResourceExceeded,
    /// The worker was restarted underneath the task.
    WorkerLost,
    /// The plugin is not loaded in the worker, or the engine misbehaved.
    Internal,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Result of a single plugin execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionResult {
    pub task_id: String,
    pub plugin_id: String,
    pub kind: EntryKind,
    pub status: TaskStatus,
    pub success: bool,
    pub message: Option<String>,
    pub findings: Vec<Finding>,
    pub error: Option<String>,
    pub failure: Option<FailureReason>,
    pub execution_time_ms: u64,
    /// Value returned by an `analyze` entry point.
    pub output: Option<Value>,
    /// Most recent plugin log lines, oldest first.
    pub logs: Vec<LogEntry>,
    pub dropped_log_lines: u64,
    pub malformed_findings: u64,
    pub dropped_findings: u64,
    pub worker_id: Option<usize>,
}

/// One run of an advanced (repeated / concurrent) execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunStat {
    pub run_index: usize,
    pub duration_ms: u64,
    pub findings: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AdvancedExecutionResult {
    pub total_runs: usize,
    pub concurrency: usize,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
    pub total_findings: usize,
    pub unique_findings: usize,
    pub runs: Vec<RunStat>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_is_monotonic() {
        assert!(TaskStatus::Queued.can_advance_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_advance_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_advance_to(TaskStatus::TimedOut));
        assert!(!TaskStatus::Running.can_advance_to(TaskStatus::Queued));
        assert!(!TaskStatus::Completed.can_advance_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_advance_to(TaskStatus::Failed));
    }
}
