//! Template and template version models.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    Draft,
    Published,
    Archived,
}

impl TemplateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateStatus::Draft => "draft",
            TemplateStatus::Published => "published",
            TemplateStatus::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(TemplateStatus::Draft),
            "published" => Some(TemplateStatus::Published),
            "archived" => Some(TemplateStatus::Archived),
            _ => None,
        }
    }
}

/// One section of a screen: a type tag plus opaque props/style payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub style: Map<String, Value>,
    /// Static default for the data-carrying field, used when unbound or when
    /// a binding fails to resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Any other author-supplied keys, stored as sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `screenJson` document of a template version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScreenDocument {
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ScreenDocument {
    pub fn section(&self, id: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn has_section(&self, id: &str) -> bool {
        self.section(id).is_some()
    }

    /// Section ids must be present and unique within a document.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for (index, section) in self.sections.iter().enumerate() {
            if section.id.trim().is_empty() {
                return Err(format!("Section at index {} has an empty id", index));
            }
            if section.kind.trim().is_empty() {
                return Err(format!("Section '{}' has an empty type", section.id));
            }
            if !seen.insert(section.id.as_str()) {
                return Err(format!("Duplicate section id '{}'", section.id));
            }
        }
        Ok(())
    }
}

/// A reusable, versioned screen definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub creator_id: String,
    pub name: String,
    pub slug: String,
    pub category: String,
    pub status: TemplateStatus,
    pub is_starter: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Template {
    pub fn is_visible_to(&self, tenant: &str) -> bool {
        self.creator_id == tenant || self.is_starter
    }
}

/// An immutable snapshot of a template's screen and theme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVersion {
    pub id: String,
    pub template_id: String,
    pub version: i64,
    pub screen_json: ScreenDocument,
    pub theme_json: Map<String, Value>,
    pub component_versions: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
    pub created_at: String,
}

/// Template together with the version created alongside it, if any.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTemplate {
    pub template: Template,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<TemplateVersion>,
}

/// Request body for creating a new template.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateRequest {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub is_starter: bool,
    #[serde(default)]
    pub initial_screen_json: Option<ScreenDocument>,
    #[serde(default)]
    pub initial_theme_json: Option<Map<String, Value>>,
    #[serde(default)]
    pub component_versions: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub changelog: Option<String>,
}

/// Request body for publishing a new template version.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishVersionRequest {
    pub screen_json: ScreenDocument,
    #[serde(default)]
    pub theme_json: Map<String, Value>,
    #[serde(default)]
    pub component_versions: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub changelog: Option<String>,
}
