//! Registry payload shapes.
//!
//! Only the fields the engine reads are modeled; the full payload is kept
//! verbatim in [`super::VersionRecord::raw_payload`].

use crate::inventory::hashing::normalize_hash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `GET /model-versions/{id}` and `/model-versions/by-hash/{hash}` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryVersion {
    pub id: i64,
    #[serde(default)]
    pub model_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<RegistryModelRef>,
    #[serde(default)]
    pub files: Vec<RegistryFile>,
    #[serde(default)]
    pub trained_words: Vec<String>,
    #[serde(default)]
    pub base_model: Option<String>,
}

/// Embedded model summary inside a version payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryModelRef {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub model_type: Option<String>,
}

/// One downloadable file of a version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub primary: Option<bool>,
    #[serde(default)]
    pub hashes: HashMap<String, String>,
}

impl RegistryFile {
    /// SHA256 of this file, lowercased.
    pub fn sha256(&self) -> Option<String> {
        self.hashes
            .iter()
            .find(|(algo, _)| algo.eq_ignore_ascii_case("sha256"))
            .map(|(_, hash)| normalize_hash(hash))
    }
}

impl RegistryVersion {
    /// Model family id, from the top level or the embedded model.
    pub fn resolved_model_id(&self) -> Option<i64> {
        self.model_id
            .or_else(|| self.model.as_ref().and_then(|m| m.id))
    }

    /// Choose the content hash this payload should be stored under.
    ///
    /// With an expected hash, only a file whose SHA256 matches is accepted.
    /// Without one, the primary file wins, then the first file with a hash.
    pub fn select_file_hash(&self, expected: Option<&str>) -> Option<String> {
        match expected {
            Some(expected) => {
                let expected = normalize_hash(expected);
                self.files
                    .iter()
                    .filter_map(|f| f.sha256())
                    .find(|h| *h == expected)
            }
            None => self
                .files
                .iter()
                .find(|f| f.primary == Some(true) && f.sha256().is_some())
                .or_else(|| self.files.iter().find(|f| f.sha256().is_some()))
                .and_then(|f| f.sha256()),
        }
    }
}

/// One sample output from `GET /images`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryImage {
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "type")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
    #[serde(default)]
    pub nsfw_level: Option<serde_json::Value>,
}

impl RegistryImage {
    pub fn is_video(&self) -> bool {
        self.media_type.as_deref() == Some("video")
    }

    /// Whether the image carries a non-empty metadata object.
    pub fn has_meta(&self) -> bool {
        matches!(&self.meta, Some(serde_json::Value::Object(map)) if !map.is_empty())
    }
}

/// A page of `GET /images`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryImagePage {
    #[serde(default)]
    pub items: Vec<RegistryImage>,
}

/// `sort` parameter of `GET /images`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ImageSort {
    #[default]
    MostReactions,
    MostComments,
    Newest,
}

impl ImageSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSort::MostReactions => "Most Reactions",
            ImageSort::MostComments => "Most Comments",
            ImageSort::Newest => "Newest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace(['_', '-'], " ").as_str() {
            "most reactions" | "reactions" => Some(ImageSort::MostReactions),
            "most comments" | "comments" => Some(ImageSort::MostComments),
            "newest" => Some(ImageSort::Newest),
            _ => None,
        }
    }
}

/// `nsfw` parameter of `GET /images`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NsfwLevel {
    #[default]
    None,
    Soft,
    Mature,
    X,
}

impl NsfwLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NsfwLevel::None => "None",
            NsfwLevel::Soft => "Soft",
            NsfwLevel::Mature => "Mature",
            NsfwLevel::X => "X",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" => Some(NsfwLevel::None),
            "soft" => Some(NsfwLevel::Soft),
            "mature" => Some(NsfwLevel::Mature),
            "x" => Some(NsfwLevel::X),
            _ => None,
        }
    }
}

/// Client-side media filter over fetched images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFilter {
    #[default]
    All,
    Image,
    Video,
}

impl MediaFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaFilter::All => "all",
            MediaFilter::Image => "image",
            MediaFilter::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "all" => Some(MediaFilter::All),
            "image" | "images" => Some(MediaFilter::Image),
            "video" | "videos" => Some(MediaFilter::Video),
            _ => None,
        }
    }

    pub fn accepts(&self, image: &RegistryImage) -> bool {
        match self {
            MediaFilter::All => true,
            MediaFilter::Image => !image.is_video(),
            MediaFilter::Video => image.is_video(),
        }
    }
}

/// Which sample outputs to fetch for a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageQuery {
    /// Maximum number of records with metadata to collect.
    pub limit: usize,
    pub sort: ImageSort,
    pub nsfw: NsfwLevel,
    pub media: MediaFilter,
}

impl Default for ImageQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            sort: ImageSort::default(),
            nsfw: NsfwLevel::default(),
            media: MediaFilter::default(),
        }
    }
}
