use scan_plugin::{EntryKind, PluginStatus};
use thiserror::Error;

/// Why plugin source was rejected before it ever reached a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no entry point is bound on globalThis (expected scan_request, scan_response or analyze)")]
    MissingEntryPoint,

    #[error("unsupported import `{specifier}` on line {line}: only relative and builtin modules may be imported")]
    UnsupportedImport { specifier: String, line: usize },

    #[error("global binding on line {line} must assign a named function, e.g. `globalThis.scan_request = scan_request;`")]
    InvalidGlobalBinding { line: usize },

    #[error("`{entry}` is bound to `{function}`, which is not defined as a function taking at most one argument")]
    UndefinedEntryPoint { entry: EntryKind, function: String },

    #[error("unterminated {what} starting on line {line}")]
    Unterminated { what: &'static str, line: usize },

    #[error("syntax error: {0}")]
    Syntax(String),
}

/// Failure to bring a compiled script into a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("failed to compile plugin `{plugin_id}`: {message}")]
    Compile { plugin_id: String, message: String },

    #[error("plugin `{plugin_id}` failed while evaluating its top level: {message}")]
    Evaluation { plugin_id: String, message: String },

    #[error("plugin `{plugin_id}` binds `{entry}` to `{function}`, which is not a function taking at most one argument")]
    MissingFunction { plugin_id: String, entry: EntryKind, function: String },

    #[error("worker {0} went away before acknowledging the load")]
    WorkerGone(usize),
}

impl LoadError {
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            LoadError::Compile { plugin_id, .. }
            | LoadError::Evaluation { plugin_id, .. }
            | LoadError::MissingFunction { plugin_id, .. } => Some(plugin_id),
            LoadError::WorkerGone(_) => None,
        }
    }
}

/// Errors surfaced by the engine's public entry points.
///
/// Plugin failures during execution are not errors: they come back as an
/// `ExecutionResult` with `success == false`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("plugin `{0}` not found")]
    NotFound(String),

    #[error("plugin `{0}` already exists")]
    AlreadyExists(String),

    #[error("plugin `{0}` is not enabled (status: {1})")]
    NotEnabled(String, PluginStatus),

    #[error("plugin `{0}` does not provide the `{1}` entry point")]
    MissingEntryPoint(String, EntryKind),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("execution queue is full ({capacity} tasks in flight)")]
    Backpressure { capacity: usize },

    #[error("worker pool initialisation failed: {0}")]
    PoolInit(String),

    #[error("plugin store error: {0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> EngineError {
        EngineError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> EngineError {
        EngineError::Store(err.to_string())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
