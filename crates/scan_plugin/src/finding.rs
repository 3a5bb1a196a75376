use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// How bad a finding is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

/// How sure the plugin is about a finding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash,
    Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RequestSummary {
    pub method: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResponseSummary {
    pub status: u16,
}

/// A structured security observation, as handed back to collaborators.
///
/// `plugin_id`, `task_id` and `request_id` identify where the finding came
/// from; everything else was supplied by the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Finding {
    pub id: String,
    pub plugin_id: String,
    pub task_id: String,
    pub request_id: Option<String>,

    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub vuln_type: String,
    pub confidence: Confidence,

    pub evidence: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub param_name: Option<String>,
    pub param_value: Option<String>,
    pub request: Option<RequestSummary>,
    pub response: Option<ResponseSummary>,

    pub cwe: Option<String>,
    pub owasp: Option<String>,
    pub remediation: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Finding {
    /// Key used to count distinct findings across repeated runs.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.vuln_type,
            self.title,
            self.url.as_deref().unwrap_or_default(),
            self.location.as_deref().unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!(Severity::from_str("HIGH").unwrap(), Severity::High);
        assert_eq!(Severity::from_str("critical").unwrap(), Severity::Critical);
        assert!(Severity::from_str("severe").is_err());
        assert_eq!(Severity::Info.to_string(), "info");
    }

    #[test]
    fn confidence_serializes_lowercase() {
        let json = serde_json::to_string(&Confidence::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
        assert_eq!(Confidence::from_str("Low").unwrap(), Confidence::Low);
    }
}
