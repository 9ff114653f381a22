//! Canonical recipe representation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Weight used when metadata omits one or carries something unparsable.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// What an auxiliary resource contributes to a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    #[default]
    Lora,
    Embedding,
    /// Color-profile component.
    Vae,
    Other,
}

/// How a resource type label in metadata is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeLabel {
    BaseModel,
    Resource(ResourceKind),
}

impl TypeLabel {
    /// Classify a free-text type label such as `lora`, `LORA`, `checkpoint` or `TextualInversion`.
    pub(crate) fn parse(label: &str) -> Option<Self> {
        let label = label.trim().to_lowercase();
        let parsed = match label.as_str() {
            "" => return None,
            "checkpoint" | "model" => TypeLabel::BaseModel,
            "lora" | "locon" | "lycoris" | "lyco" | "dora" => TypeLabel::Resource(ResourceKind::Lora),
            "embed" | "embedding" | "textualinversion" | "ti" => {
                TypeLabel::Resource(ResourceKind::Embedding)
            }
            "vae" => TypeLabel::Resource(ResourceKind::Vae),
            _ => TypeLabel::Resource(ResourceKind::Other),
        };
        Some(parsed)
    }
}

/// One auxiliary resource referenced by a metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeResource {
    /// Lowercase content hash, full when a local file or registry record supplied it.
    pub hash: Option<String>,
    pub name: Option<String>,
    pub weight: f64,
    pub upstream_version_id: Option<i64>,
    pub kind: ResourceKind,
    /// Matched a local file or a registry name.
    pub resolved: bool,
    /// Relative filename of the matching local file.
    pub local_filename: Option<String>,
    pub model_id: Option<i64>,
}

impl RecipeResource {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            hash: None,
            name: None,
            weight: DEFAULT_WEIGHT,
            upstream_version_id: None,
            kind,
            resolved: false,
            local_filename: None,
            model_id: None,
        }
    }

    pub fn with_hash(mut self, hash: Option<&str>) -> Self {
        self.hash = hash
            .map(crate::inventory::normalize_hash)
            .filter(|h| !h.is_empty());
        self
    }

    pub fn with_name(mut self, name: Option<&str>) -> Self {
        self.name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Key used to aggregate the same resource across records.
    pub fn key(&self) -> Option<&str> {
        self.hash.as_deref().or(self.name.as_deref())
    }
}

/// Canonical recipe extracted from one metadata record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub base_model_hash: Option<String>,
    pub base_model_name: Option<String>,
    pub resources: Vec<RecipeResource>,
}

impl Recipe {
    pub fn is_empty(&self) -> bool {
        self.base_model_hash.is_none() && self.base_model_name.is_none() && self.resources.is_empty()
    }

    /// Resources of one kind, in discovery order.
    pub fn resources_of(&self, kind: ResourceKind) -> impl Iterator<Item = &RecipeResource> {
        self.resources.iter().filter(move |r| r.kind == kind)
    }

    /// Resources that matched neither a local file nor a registry name.
    pub fn unresolved(&self) -> impl Iterator<Item = &RecipeResource> {
        self.resources.iter().filter(|r| !r.resolved)
    }
}

/// Lenient float parsing for weights written as numbers or strings.
pub fn parse_weight(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(DEFAULT_WEIGHT),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(DEFAULT_WEIGHT),
        _ => DEFAULT_WEIGHT,
    }
}

/// Registry version id written as a number or a numeric string.
pub(crate) fn parse_version_id(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|id| *id > 0)
}
