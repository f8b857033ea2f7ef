//! Build engine: merges a template version, an instance's bindings and
//! overrides, and captured content into one self-contained screen document.
//!
//! [`resolve`] performs no I/O. Content is fetched beforehand (see
//! [`crate::content::capture`]) and passed in, so the same inputs always
//! serialize to the same bytes. Rollback relies on this: a stored artifact is
//! as good as a rebuild.
//!
//! Precedence on conflicting keys, highest first:
//! 1. `sectionOverrides[sectionId]` (style namespace of that section only)
//! 2. instance `themeOverrides`
//! 3. the version's `themeJson`
//! 4. section defaults embedded in `screenJson`

pub mod merge;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{Platform, TemplateInstance, TemplateVersion};

/// Format version of the resolved document.
pub const RESOLVED_SCHEMA_VERSION: u32 = 1;

/// Outcome of fetching one binding at build time.
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedBinding {
    Data(Value),
    Failed(String),
}

/// Captured content keyed by section id.
pub type CapturedContent = BTreeMap<String, CapturedBinding>;

/// Where a resolved section's `data` came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SectionSource {
    Static,
    Bound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSection {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub props: Map<String, Value>,
    pub style: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub source: SectionSource,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The renderable artifact stored on a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedScreen {
    pub schema_version: u32,
    pub template_id: String,
    pub template_version: i64,
    pub instance_id: String,
    pub platform: Platform,
    pub theme: Map<String, Value>,
    pub sections: Vec<ResolvedSection>,
    pub component_versions: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_css: Option<String>,
    /// Root-level keys of `screenJson` other than `sections`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A section that fell back to its static defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildWarning {
    pub section_id: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub screen: ResolvedScreen,
    pub warnings: Vec<BuildWarning>,
}

impl Resolution {
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Serialized artifact. Object keys come out in a fixed order, so equal
    /// resolutions produce identical bytes.
    pub fn to_json(&self) -> Result<String, ResolveError> {
        serde_json::to_string(&self.screen).map_err(|e| ResolveError::Serialize(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveError {
    /// The instance pins a different version than the one supplied.
    VersionMismatch { pinned: String, supplied: String },
    Serialize(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::VersionMismatch { pinned, supplied } => write!(
                f,
                "instance pins version {} but version {} was supplied",
                pinned, supplied
            ),
            ResolveError::Serialize(msg) => write!(f, "could not serialize resolved screen: {}", msg),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Keys the resolver writes itself; author extras never shadow them.
const RESOLVED_SECTION_KEYS: &[&str] = &["source"];
const RESOLVED_SCREEN_KEYS: &[&str] = &[
    "schemaVersion",
    "templateId",
    "templateVersion",
    "instanceId",
    "platform",
    "theme",
    "componentVersions",
    "customCss",
];

fn without_keys(extra: &Map<String, Value>, reserved: &[&str]) -> Map<String, Value> {
    extra
        .iter()
        .filter(|(key, _)| !reserved.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Resolve a screen. Pure: identical arguments give identical output.
pub fn resolve(
    version: &TemplateVersion,
    instance: &TemplateInstance,
    platform: Platform,
    content: &CapturedContent,
) -> Result<Resolution, ResolveError> {
    if instance.template_version_id != version.id {
        return Err(ResolveError::VersionMismatch {
            pinned: instance.template_version_id.clone(),
            supplied: version.id.clone(),
        });
    }

    let mut warnings = Vec::new();

    let mut theme = version.theme_json.clone();
    merge::deep_merge(&mut theme, &instance.theme_overrides);

    let mut sections = Vec::with_capacity(version.screen_json.sections.len());
    for section in &version.screen_json.sections {
        let mut style = section.style.clone();
        merge::overlay_existing(&mut style, &theme);
        if let Some(section_override) = instance.section_overrides.get(&section.id) {
            merge::deep_merge(&mut style, section_override);
        }

        let (data, source) = match instance.binding_for(&section.id) {
            None => (section.data.clone(), SectionSource::Static),
            Some(binding) => match content.get(&section.id) {
                Some(CapturedBinding::Data(value)) => (Some(value.clone()), SectionSource::Bound),
                Some(CapturedBinding::Failed(reason)) => {
                    warnings.push(BuildWarning {
                        section_id: section.id.clone(),
                        message: format!(
                            "'{}' binding failed ({}); using static defaults",
                            binding.binding_type, reason
                        ),
                    });
                    (section.data.clone(), SectionSource::Static)
                }
                None => {
                    warnings.push(BuildWarning {
                        section_id: section.id.clone(),
                        message: format!(
                            "'{}' binding has no captured content; using static defaults",
                            binding.binding_type
                        ),
                    });
                    (section.data.clone(), SectionSource::Static)
                }
            },
        };

        sections.push(ResolvedSection {
            id: section.id.clone(),
            kind: section.kind.clone(),
            props: section.props.clone(),
            style,
            data,
            source,
            extra: without_keys(&section.extra, RESOLVED_SECTION_KEYS),
        });
    }

    for binding in &instance.content_bindings {
        if !version.screen_json.has_section(&binding.section_id) {
            warnings.push(BuildWarning {
                section_id: binding.section_id.clone(),
                message: "binding targets a section this version does not have; ignored"
                    .to_string(),
            });
        }
    }

    Ok(Resolution {
        screen: ResolvedScreen {
            schema_version: RESOLVED_SCHEMA_VERSION,
            template_id: version.template_id.clone(),
            template_version: version.version,
            instance_id: instance.id.clone(),
            platform,
            theme,
            sections,
            component_versions: version.component_versions.clone(),
            custom_css: instance.custom_css.clone(),
            extra: without_keys(&version.screen_json.extra, RESOLVED_SCREEN_KEYS),
        },
        warnings,
    })
}
