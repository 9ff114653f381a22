//! Directory providers: the host-owned view of which model files exist.
//!
//! The engine never walks arbitrary directories on its own. It asks a
//! [`ModelDirectories`] implementation for the relative paths it knows per
//! category and for the absolute path behind each of them.

use super::category::ModelCategory;
use crate::config::ScanConfig;
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Host collaborator listing model files per category.
pub trait ModelDirectories: Send + Sync {
    /// Relative paths (forward-slash separated) currently known for a category.
    fn list_files(&self, category: ModelCategory) -> Vec<String>;

    /// Absolute path for a relative path, if it resolves to an existing file.
    fn full_path(&self, category: ModelCategory, relative: &str) -> Option<PathBuf>;

    /// Whether the host has any directory configured for this category.
    fn is_configured(&self, category: ModelCategory) -> bool {
        let _ = category;
        true
    }
}

/// Filesystem-backed provider over a set of base directories per category.
#[derive(Debug, Clone, Default)]
pub struct FolderLayout {
    roots: HashMap<ModelCategory, Vec<PathBuf>>,
}

impl FolderLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard layout: one subdirectory per category under `models_root`.
    pub fn from_models_root(models_root: impl AsRef<Path>) -> Self {
        let models_root = models_root.as_ref();
        let mut layout = Self::new();
        for category in ModelCategory::ALL {
            layout = layout.with_dir(category, models_root.join(category.as_str()));
        }
        layout
    }

    /// Add a base directory for a category. Earlier directories win on conflicts.
    pub fn with_dir(mut self, category: ModelCategory, dir: impl Into<PathBuf>) -> Self {
        self.roots.entry(category).or_default().push(dir.into());
        self
    }

    /// Base directories for a category.
    pub fn dirs(&self, category: ModelCategory) -> &[PathBuf] {
        self.roots.get(&category).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

impl ModelDirectories for FolderLayout {
    fn list_files(&self, category: ModelCategory) -> Vec<String> {
        let mut seen = BTreeSet::new();
        for root in self.dirs(category) {
            if !root.is_dir() {
                continue;
            }
            for entry in WalkDir::new(root)
                .min_depth(1)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() || !is_model_file(entry.path()) {
                    continue;
                }
                if let Ok(relative) = entry.path().strip_prefix(root) {
                    seen.insert(to_relative_string(relative));
                }
            }
        }
        seen.into_iter().collect()
    }

    fn full_path(&self, category: ModelCategory, relative: &str) -> Option<PathBuf> {
        self.dirs(category)
            .iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.is_file())
            .map(|candidate| normalize_path(&candidate))
    }

    fn is_configured(&self, category: ModelCategory) -> bool {
        self.dirs(category).iter().any(|d| d.is_dir())
    }
}

/// Whether a path has one of the recognized model file extensions.
pub fn is_model_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            ScanConfig::MODEL_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Lexically normalize a path: drop `.` components and fold `..`.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn to_relative_string(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/models/./loras/../loras/a.safetensors")),
            PathBuf::from("/models/loras/a.safetensors")
        );
    }

    #[test]
    fn test_list_files_filters_extensions_and_nests() {
        let temp = TempDir::new().unwrap();
        let loras = temp.path().join("loras");
        std::fs::create_dir_all(loras.join("styles")).unwrap();
        std::fs::write(loras.join("a.safetensors"), b"a").unwrap();
        std::fs::write(loras.join("styles/b.pt"), b"b").unwrap();
        std::fs::write(loras.join("a.png"), b"preview").unwrap();

        let layout = FolderLayout::from_models_root(temp.path());
        let files = layout.list_files(ModelCategory::Loras);
        assert_eq!(files, vec!["a.safetensors".to_string(), "styles/b.pt".to_string()]);

        let full = layout
            .full_path(ModelCategory::Loras, "styles/b.pt")
            .unwrap();
        assert!(full.ends_with("styles/b.pt"));
        assert!(layout.full_path(ModelCategory::Loras, "missing.pt").is_none());
    }

    #[test]
    fn test_first_root_wins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(first.path().join("x.safetensors"), b"1").unwrap();
        std::fs::write(second.path().join("x.safetensors"), b"2").unwrap();

        let layout = FolderLayout::new()
            .with_dir(ModelCategory::Checkpoints, first.path())
            .with_dir(ModelCategory::Checkpoints, second.path());

        assert_eq!(layout.list_files(ModelCategory::Checkpoints).len(), 1);
        let full = layout
            .full_path(ModelCategory::Checkpoints, "x.safetensors")
            .unwrap();
        assert!(full.starts_with(normalize_path(first.path())));
        assert!(!layout.is_configured(ModelCategory::Vae));
    }
}
