//! Types exchanged between the scanhost plugin engine and the surfaces that
//! drive it (editors, proxy pipeline, review dashboards).
//!
//! Collaborators submit plugin source and execution requests, and get back
//! [`ExecutionResult`]s carrying [`Finding`]s. Nothing in here depends on the
//! engine itself.

pub mod execution;
pub mod finding;
pub mod plugin;

pub use execution::{
    AdvancedExecutionResult, ExecutionResult, FailureReason, LogEntry, LogLevel, RunStat, TaskStatus,
};
pub use finding::{Confidence, Finding, RequestSummary, ResponseSummary, Severity};
pub use plugin::{
    EntryKind, PluginCategory, PluginChange, PluginEvent, PluginMetadata, PluginStatus, ValidationResult,
};
