//! Filename/hash lookup over the local inventory.

use super::hashing::{is_hex_hash, normalize_hash};
use std::collections::{BTreeMap, HashMap};

/// Bidirectional map between relative model filenames and content hashes.
///
/// Short hashes (the 10-character prefixes older tools embed) match a full
/// hash when exactly one local file starts with them.
#[derive(Debug, Clone, Default)]
pub struct LocalHashIndex {
    filename_to_hash: HashMap<String, String>,
    hash_to_filename: BTreeMap<String, String>,
}

impl LocalHashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, S, H>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, H)>,
        S: Into<String>,
        H: AsRef<str>,
    {
        let mut index = Self::new();
        for (filename, hash) in pairs {
            index.insert(filename, hash.as_ref());
        }
        index
    }

    pub fn insert(&mut self, relative_filename: impl Into<String>, hash: &str) {
        let filename = relative_filename.into();
        let hash = normalize_hash(hash);
        self.hash_to_filename.insert(hash.clone(), filename.clone());
        self.filename_to_hash.insert(filename, hash);
    }

    /// Add a filename without taking the reverse mapping from an earlier
    /// file with the same content.
    pub fn insert_alias(&mut self, relative_filename: impl Into<String>, hash: &str) {
        let filename = relative_filename.into();
        let hash = normalize_hash(hash);
        self.hash_to_filename
            .entry(hash.clone())
            .or_insert_with(|| filename.clone());
        self.filename_to_hash.insert(filename, hash);
    }

    /// Merge another index into this one; existing entries win.
    pub fn extend(&mut self, other: LocalHashIndex) {
        for (filename, hash) in other.filename_to_hash {
            self.filename_to_hash.entry(filename).or_insert(hash);
        }
        for (hash, filename) in other.hash_to_filename {
            self.hash_to_filename.entry(hash).or_insert(filename);
        }
    }

    pub fn len(&self) -> usize {
        self.filename_to_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filename_to_hash.is_empty()
    }

    /// Hash of a file named in metadata.
    ///
    /// Tries the exact relative path, then the name with `.safetensors`
    /// appended, then a unique file whose stem equals the name.
    pub fn hash_for_name(&self, name: &str) -> Option<&str> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(hash) = self.filename_to_hash.get(name) {
            return Some(hash.as_str());
        }
        if let Some(hash) = self.filename_to_hash.get(&format!("{}.safetensors", name)) {
            return Some(hash.as_str());
        }

        let mut matches = self
            .filename_to_hash
            .iter()
            .filter(|(filename, _)| file_stem(filename).eq_ignore_ascii_case(name));
        match (matches.next(), matches.next()) {
            (Some((_, hash)), None) => Some(hash.as_str()),
            _ => None,
        }
    }

    /// Full hash and relative filename for a full or short hash.
    pub fn resolve_hash(&self, hash: &str) -> Option<(&str, &str)> {
        let hash = normalize_hash(hash);
        if hash.is_empty() {
            return None;
        }
        if let Some((full, filename)) = self.hash_to_filename.get_key_value(&hash) {
            return Some((full.as_str(), filename.as_str()));
        }
        if !is_hex_hash(&hash) {
            return None;
        }

        let mut candidates = self
            .hash_to_filename
            .range(hash.clone()..)
            .take_while(|(full, _)| full.starts_with(&hash));
        match (candidates.next(), candidates.next()) {
            (Some((full, filename)), None) => Some((full.as_str(), filename.as_str())),
            _ => None,
        }
    }

    pub fn filename_for_hash(&self, hash: &str) -> Option<&str> {
        self.resolve_hash(hash).map(|(_, filename)| filename)
    }
}

fn file_stem(relative: &str) -> &str {
    let base = relative.rsplit('/').next().unwrap_or(relative);
    match base.rfind('.') {
        Some(pos) if pos > 0 => &base[..pos],
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> LocalHashIndex {
        LocalHashIndex::from_pairs([
            ("styleA.safetensors", "DEF4560000000000aaaa"),
            ("chars/hero.safetensors", "abc1230000000000bbbb"),
            ("abc.pt", "abc1230099999999cccc"),
        ])
    }

    #[test]
    fn test_alias_keeps_first_reverse_mapping() {
        let mut index = LocalHashIndex::new();
        index.insert_alias("a.safetensors", "AAAA1111");
        index.insert_alias("copy/a.safetensors", "aaaa1111");

        assert_eq!(index.filename_for_hash("aaaa1111"), Some("a.safetensors"));
        assert_eq!(index.hash_for_name("copy/a.safetensors"), Some("aaaa1111"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_name_lookup_order() {
        let index = index();
        assert_eq!(index.hash_for_name("styleA"), Some("def4560000000000aaaa"));
        assert_eq!(index.hash_for_name("styleA.safetensors"), Some("def4560000000000aaaa"));
        assert_eq!(index.hash_for_name("hero"), Some("abc1230000000000bbbb"));
        assert_eq!(index.hash_for_name("missing"), None);
    }

    #[test]
    fn test_short_hash_needs_unique_prefix() {
        let index = index();
        assert_eq!(
            index.resolve_hash("DEF4560000"),
            Some(("def4560000000000aaaa", "styleA.safetensors"))
        );
        assert_eq!(
            index.resolve_hash("abc1230000"),
            Some(("abc1230000000000bbbb", "chars/hero.safetensors"))
        );
        // Two files share this prefix.
        assert_eq!(index.resolve_hash("abc12300"), None);
        assert_eq!(index.resolve_hash("abc123"), None);
        assert_eq!(index.filename_for_hash("ffff0000"), None);
    }
}
