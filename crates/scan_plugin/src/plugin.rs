use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::finding::Severity;

/// Traffic-analysis plugins look at intercepted requests and responses,
/// autonomous-tool plugins are called by an agent with a tool input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PluginCategory {
    #[default]
    #[serde(alias = "passive")]
    TrafficAnalysis,
    #[serde(alias = "agent")]
    AutonomousTool,
}

/// The entry point a task calls.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntryKind {
    ScanRequest,
    ScanResponse,
    Analyze,
}

impl EntryKind {
    pub const ALL: [EntryKind; 3] = [EntryKind::ScanRequest, EntryKind::ScanResponse, EntryKind::Analyze];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub category: PluginCategory,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_severity")]
    pub default_severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_severity() -> Severity {
    Severity::Medium
}

impl PluginMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            category: PluginCategory::default(),
            author: None,
            description: None,
            default_severity: default_severity(),
            tags: vec![],
        }
    }

    pub fn with_category(mut self, category: PluginCategory) -> Self {
        self.category = category;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PluginStatus {
    Enabled,
    Disabled,
    Error,
}

/// What happened to a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PluginChange {
    Created,
    Updated,
    HotUpdated,
    Enabled,
    Disabled,
    Errored,
    Deleted,
}

/// Broadcast after every registry mutation so the host UI can refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PluginEvent {
    pub plugin_id: String,
    pub change: PluginChange,
    /// `None` once the plugin has been deleted.
    pub status: Option<PluginStatus>,
    pub at: DateTime<Utc>,
}

impl PluginEvent {
    pub fn new(plugin_id: impl Into<String>, change: PluginChange, status: Option<PluginStatus>) -> Self {
        Self { plugin_id: plugin_id.into(), change, status, at: Utc::now() }
    }
}

/// Outcome of checking plugin source without loading it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub syntax_valid: bool,
    pub has_required_functions: bool,
    pub security_check_passed: bool,
    pub entry_points: Vec<EntryKind>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}
