use crate::job::ToolSelection;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown tool id: {0}")]
    UnknownTool(String),
    #[error("unknown profile id: {0}")]
    UnknownProfile(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Checkbox,
    Text,
    Number,
    Select,
    Textarea,
}

/// Schema for one declared CLI parameter of a tool. The parameter's
/// placeholder in the command template is `{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliParam {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Flag emitted when a checkbox param is on / off.
    #[serde(default)]
    pub cli_true: Option<String>,
    #[serde(default)]
    pub cli_false: Option<String>,
    /// Per-line rendering for textarea params; `{value}` is the quoted line.
    #[serde(default)]
    pub cli_format: Option<String>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub id: String,
    pub name: String,
    pub command_template: String,
    pub target_type: String,
    pub phase: String,
    pub category: String,
    #[serde(default)]
    pub category_display_name: String,
    #[serde(default)]
    pub category_icon_class: String,
    #[serde(default)]
    pub icon_class: String,
    /// Default per-unit timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub default_enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cli_params_config: Vec<CliParam>,
    #[serde(default)]
    pub allow_additional_args: bool,
    #[serde(default)]
    pub additional_args_placeholder: Option<String>,
    #[serde(default)]
    pub dangerous: bool,
    #[serde(default)]
    pub needs_shell: bool,
}

fn default_timeout() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_class: String,
    pub tools: Vec<String>,
    #[serde(default)]
    pub params_override: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub icon_class: String,
    pub order: u32,
}

/// Static tool configuration consumed read-only by the executor: available
/// tools, profile presets, and phase grouping for the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub tools: BTreeMap<String, ToolDef>,
    pub profiles: BTreeMap<String, Profile>,
    pub phases: BTreeMap<String, Phase>,
}

impl Catalog {
    /// Built-in tool set, used when no external catalog files are configured.
    pub fn builtin() -> Self {
        let json = include_str!("builtin_catalog.json");
        let mut catalog: Catalog =
            serde_json::from_str(json).expect("builtin catalog is valid JSON");
        catalog.assign_ids();
        catalog
    }

    /// Load, replacing the built-in tools and/or profiles with external JSON
    /// files when given.
    pub fn load(tools_file: Option<&Path>, profiles_file: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::builtin();
        if let Some(path) = tools_file {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read tools file: {:?}", path))?;
            catalog.tools = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse tools file: {:?}", path))?;
        }
        if let Some(path) = profiles_file {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read profiles file: {:?}", path))?;
            catalog.profiles = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse profiles file: {:?}", path))?;
        }
        catalog.assign_ids();
        Ok(catalog)
    }

    /// Keep each tool's `id` field in sync with its map key.
    fn assign_ids(&mut self) {
        for (id, tool) in self.tools.iter_mut() {
            tool.id = id.clone();
        }
    }

    pub fn get(&self, id: &str) -> Option<&ToolDef> {
        self.tools.get(id)
    }

    /// Validate submitted selections against the catalog and fill in declared
    /// parameter defaults the client omitted.
    pub fn resolve_selections(
        &self,
        selections: Vec<ToolSelection>,
    ) -> Result<Vec<ToolSelection>, CatalogError> {
        let mut resolved = Vec::with_capacity(selections.len());
        for mut sel in selections {
            let tool = self
                .get(&sel.id)
                .ok_or_else(|| CatalogError::UnknownTool(sel.id.clone()))?;
            for param in &tool.cli_params_config {
                if !sel.cli_params.contains_key(&param.name) {
                    if let Some(default) = &param.default {
                        sel.cli_params.insert(param.name.clone(), default.clone());
                    }
                }
            }
            resolved.push(sel);
        }
        Ok(resolved)
    }

    /// Expand a profile preset into concrete selections: tool defaults first,
    /// then the profile's per-tool overrides.
    pub fn expand_profile(&self, profile_id: &str) -> Result<Vec<ToolSelection>, CatalogError> {
        let profile = self
            .profiles
            .get(profile_id)
            .ok_or_else(|| CatalogError::UnknownProfile(profile_id.to_string()))?;

        let mut selections = Vec::new();
        for tool_id in &profile.tools {
            let tool = self
                .get(tool_id)
                .ok_or_else(|| CatalogError::UnknownTool(tool_id.clone()))?;

            let mut cli_params = BTreeMap::new();
            for param in &tool.cli_params_config {
                if let Some(default) = &param.default {
                    cli_params.insert(param.name.clone(), default.clone());
                }
            }

            let mut additional_args = String::new();
            if let Some(overrides) = profile.params_override.get(tool_id) {
                for (key, value) in overrides {
                    if key == "additional_args" {
                        if let Some(s) = value.as_str() {
                            additional_args = s.to_string();
                        }
                    } else {
                        cli_params.insert(key.clone(), value.clone());
                    }
                }
            }

            selections.push(ToolSelection {
                id: tool_id.clone(),
                cli_params,
                additional_args,
            });
        }
        Ok(selections)
    }
}
