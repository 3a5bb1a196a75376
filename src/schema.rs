use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use scan_plugin::{AdvancedExecutionResult, ExecutionResult, Finding, PluginEvent, PluginMetadata, ValidationResult};
use schemars::{JsonSchema, schema_for};

use crate::config::EngineConfig;
use crate::pool::WorkerSnapshot;
use crate::stats::ExecutorStats;
use crate::store::PluginRecord;

/// Write one `<name>.schema.json` per collaborator-facing type into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let written = vec![
        write_one::<EngineConfig>(out_dir, "engine-config")?,
        write_one::<PluginMetadata>(out_dir, "plugin-metadata")?,
        write_one::<PluginRecord>(out_dir, "plugin-record")?,
        write_one::<PluginEvent>(out_dir, "plugin-event")?,
        write_one::<ValidationResult>(out_dir, "validation-result")?,
        write_one::<Finding>(out_dir, "finding")?,
        write_one::<ExecutionResult>(out_dir, "execution-result")?,
        write_one::<AdvancedExecutionResult>(out_dir, "advanced-execution-result")?,
        write_one::<ExecutorStats>(out_dir, "executor-stats")?,
        write_one::<WorkerSnapshot>(out_dir, "worker")?,
    ];
    Ok(written)
}

fn write_one<T: JsonSchema>(out_dir: &Path, name: &str) -> Result<String> {
    let schema = schema_for!(T);
    let file = format!("{name}.schema.json");
    fs::write(out_dir.join(&file), serde_json::to_string_pretty(&schema)?)
        .with_context(|| format!("writing {file}"))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemas_are_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_schema(dir.path()).unwrap();
        assert!(files.contains(&"execution-result.schema.json".to_string()));

        let raw = fs::read_to_string(dir.path().join("finding.schema.json")).unwrap();
        let schema: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(schema["properties"]["severity"].is_object());
    }
}
