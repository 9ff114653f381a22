//! Model categories known to the local inventory.

use crate::error::{ProvenanceError, Result};
use serde::{Deserialize, Serialize};

/// A category of local model files, matching the host's folder keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    Checkpoints,
    Loras,
    Vae,
    Embeddings,
    Hypernetworks,
}

impl ModelCategory {
    pub const ALL: [ModelCategory; 5] = [
        ModelCategory::Checkpoints,
        ModelCategory::Loras,
        ModelCategory::Vae,
        ModelCategory::Embeddings,
        ModelCategory::Hypernetworks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCategory::Checkpoints => "checkpoints",
            ModelCategory::Loras => "loras",
            ModelCategory::Vae => "vae",
            ModelCategory::Embeddings => "embeddings",
            ModelCategory::Hypernetworks => "hypernetworks",
        }
    }

    /// Model type label the registry uses for this category.
    pub fn registry_type(&self) -> &'static str {
        match self {
            ModelCategory::Checkpoints => "Checkpoint",
            ModelCategory::Loras => "LORA",
            ModelCategory::Vae => "VAE",
            ModelCategory::Embeddings => "TextualInversion",
            ModelCategory::Hypernetworks => "Hypernetwork",
        }
    }

    /// Settings key of the last full sync for this category.
    pub fn last_sync_key(&self) -> String {
        format!(
            "{}{}",
            crate::config::ScanConfig::LAST_SYNC_KEY_PREFIX,
            self.as_str()
        )
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "checkpoints" | "checkpoint" => Ok(ModelCategory::Checkpoints),
            "loras" | "lora" => Ok(ModelCategory::Loras),
            "vae" => Ok(ModelCategory::Vae),
            "embeddings" | "embedding" => Ok(ModelCategory::Embeddings),
            "hypernetworks" | "hypernetwork" => Ok(ModelCategory::Hypernetworks),
            other => Err(ProvenanceError::UnknownCategory(other.to_string())),
        }
    }
}

impl std::fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ModelCategory {
    type Err = ProvenanceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_singular_and_plural() {
        assert_eq!(ModelCategory::parse("lora").unwrap(), ModelCategory::Loras);
        assert_eq!(ModelCategory::parse("Loras").unwrap(), ModelCategory::Loras);
        assert_eq!(
            ModelCategory::parse("checkpoints").unwrap(),
            ModelCategory::Checkpoints
        );
        assert!(ModelCategory::parse("upscale_models").is_err());
    }

    #[test]
    fn test_last_sync_key() {
        assert_eq!(ModelCategory::Loras.last_sync_key(), "last_sync_loras");
    }
}
