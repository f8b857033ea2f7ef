//! Template instance model: one tenant's configured use of a template version.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ScreenDocument;

/// Declares that a section's data comes from an external content source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentBinding {
    pub section_id: String,
    pub binding_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
}

/// A tenant's live configuration of one pinned template version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInstance {
    pub id: String,
    pub creator_id: String,
    pub template_id: String,
    pub template_version_id: String,
    pub name: String,
    pub slug: String,
    pub content_bindings: Vec<ContentBinding>,
    pub theme_overrides: Map<String, Value>,
    pub section_overrides: BTreeMap<String, Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_css: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Bumped on every mutation for optimistic concurrency control
    pub revision: i64,
}

impl TemplateInstance {
    pub fn binding_for(&self, section_id: &str) -> Option<&ContentBinding> {
        self.content_bindings
            .iter()
            .find(|b| b.section_id == section_id)
    }

    /// Sections referenced by bindings or overrides that `screen` lacks.
    pub fn dangling_sections(&self, screen: &ScreenDocument) -> Vec<String> {
        let mut missing: Vec<String> = self
            .content_bindings
            .iter()
            .map(|b| b.section_id.as_str())
            .chain(self.section_overrides.keys().map(String::as_str))
            .filter(|id| !screen.has_section(id))
            .map(str::to_string)
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}

/// Request body for creating a new instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    pub template_id: String,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
}

/// Request body for replacing all content bindings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBindingsRequest {
    #[serde(default)]
    pub content_bindings: Vec<ContentBinding>,
    #[serde(default)]
    pub expected_revision: Option<i64>,
}

/// Request body for replacing theme overrides, section overrides and custom CSS.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateThemeRequest {
    #[serde(default)]
    pub theme_overrides: Map<String, Value>,
    #[serde(default)]
    pub section_overrides: Option<BTreeMap<String, Map<String, Value>>>,
    #[serde(default)]
    pub custom_css: Option<String>,
    #[serde(default)]
    pub expected_revision: Option<i64>,
}

/// Request body for moving an instance to another version of its template.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RepinRequest {
    /// Version number to pin; defaults to the template's current version
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub expected_revision: Option<i64>,
}

/// Check a full binding set against the pinned screen.
pub fn validate_bindings(
    bindings: &[ContentBinding],
    screen: &ScreenDocument,
) -> Result<(), String> {
    let mut seen = HashSet::new();
    for binding in bindings {
        if !screen.has_section(&binding.section_id) {
            return Err(format!(
                "Binding references unknown section '{}'",
                binding.section_id
            ));
        }
        if !seen.insert(binding.section_id.as_str()) {
            return Err(format!(
                "Section '{}' has more than one binding",
                binding.section_id
            ));
        }
        if !is_valid_binding_type(&binding.binding_type) {
            return Err(format!(
                "Invalid binding type '{}' for section '{}'",
                binding.binding_type, binding.section_id
            ));
        }
    }
    Ok(())
}

/// Check section overrides against the pinned screen.
pub fn validate_section_overrides(
    overrides: &BTreeMap<String, Map<String, Value>>,
    screen: &ScreenDocument,
) -> Result<(), String> {
    match overrides.keys().find(|id| !screen.has_section(id)) {
        Some(id) => Err(format!("Override references unknown section '{}'", id)),
        None => Ok(()),
    }
}

fn is_valid_binding_type(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}
