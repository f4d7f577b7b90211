use crate::protocol::ToolDescriptor;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

// Built-in manifest; XCD_TOOL_MANIFEST points at a replacement file.
const EMBEDDED_MANIFEST: &str = include_str!("../manifests/workflows.json");

#[derive(Debug, Deserialize)]
struct Manifest {
    workflows: BTreeMap<String, Vec<ManifestTool>>,
}

#[derive(Debug, Deserialize)]
struct ManifestTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Value,
}

/// Read-only map from workflow id to the tools it enables.
///
/// Loaded once at startup; lookups are synchronous and side-effect free. An
/// unknown workflow id yields an empty set, and a manifest that fails to
/// parse fails daemon startup rather than silently enabling nothing.
pub struct ToolCatalog {
    workflows: BTreeMap<String, Vec<ToolDescriptor>>,
}

impl ToolCatalog {
    /// Load from the override path when set, otherwise the embedded manifest.
    pub fn load(manifest_override: Option<&str>) -> Result<Self> {
        let contents = match manifest_override {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("cannot read tool manifest {path}"))?,
            None => EMBEDDED_MANIFEST.to_string(),
        };
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self> {
        let manifest: Manifest =
            serde_json::from_str(contents).context("invalid tool manifest")?;
        let workflows = manifest
            .workflows
            .into_iter()
            .map(|(workflow, tools)| {
                let descriptors = tools
                    .into_iter()
                    .map(|t| ToolDescriptor {
                        name: t.name,
                        description: t.description,
                        input_schema: t.input_schema,
                    })
                    .collect();
                (workflow, descriptors)
            })
            .collect::<BTreeMap<_, _>>();
        debug!("Loaded tool manifest with {} workflows", workflows.len());
        Ok(Self { workflows })
    }

    /// Tools for one workflow. Unknown ids are empty, not an error.
    pub fn tools_for(&self, workflow: &str) -> Vec<ToolDescriptor> {
        self.workflows.get(workflow).cloned().unwrap_or_default()
    }

    /// All tools across all workflows, deduplicated by name.
    pub fn all_tools(&self) -> Vec<ToolDescriptor> {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        for tools in self.workflows.values() {
            for tool in tools {
                if seen.insert(tool.name.clone()) {
                    out.push(tool.clone());
                }
            }
        }
        out
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        self.workflows.keys().cloned().collect()
    }

    pub fn has_workflow(&self, workflow: &str) -> bool {
        self.workflows.contains_key(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_manifest_parses() {
        let catalog = ToolCatalog::load(None).unwrap();
        assert!(catalog.has_workflow("simulator"));
        assert!(catalog.has_workflow("ide-bridge"));
        assert!(!catalog.tools_for("simulator").is_empty());
    }

    #[test]
    fn unknown_workflow_is_empty_not_an_error() {
        let catalog = ToolCatalog::load(None).unwrap();
        assert!(catalog.tools_for("android").is_empty());
        assert!(!catalog.has_workflow("android"));
    }

    #[test]
    fn malformed_manifest_fails_closed() {
        assert!(ToolCatalog::parse("{\"workflows\": 42}").is_err());
        assert!(ToolCatalog::parse("not json").is_err());
    }

    #[test]
    fn all_tools_deduplicates_by_name() {
        let catalog = ToolCatalog::parse(
            r#"{
                "workflows": {
                    "a": [{ "name": "shared" }, { "name": "only_a" }],
                    "b": [{ "name": "shared" }]
                }
            }"#,
        )
        .unwrap();
        let names: Vec<_> = catalog.all_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["shared", "only_a"]);
    }

    #[test]
    fn override_path_missing_is_an_error() {
        assert!(ToolCatalog::load(Some("/nonexistent/manifest.json")).is_err());
    }
}
