//! Recipe extraction from generation metadata.
//!
//! [`extract`] runs every [`Dialect`] over one metadata object and merges the
//! results into a single [`Recipe`]. Extraction is synchronous: registry
//! versions referenced by id must already sit in the [`ResolutionSession`],
//! which callers fill with [`ResolutionSession::prewarm`] using the ids from
//! [`referenced_version_ids`].

mod dialects;
mod types;

use crate::inventory::hashing::{is_hex_hash, normalize_hash};
use crate::inventory::LocalHashIndex;
use crate::resolution::ResolutionSession;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

pub use dialects::Dialect;
pub use types::{parse_weight, Recipe, RecipeResource, ResourceKind, DEFAULT_WEIGHT};

/// Accumulates what the dialects find for one record.
pub(crate) struct RecipeBuilder<'a> {
    index: &'a LocalHashIndex,
    session: &'a ResolutionSession,
    recipe: Recipe,
}

impl<'a> RecipeBuilder<'a> {
    fn new(index: &'a LocalHashIndex, session: &'a ResolutionSession) -> Self {
        Self {
            index,
            session,
            recipe: Recipe::default(),
        }
    }

    pub(crate) fn session(&self) -> &'a ResolutionSession {
        self.session
    }

    /// Offer a base model. The first non-empty hash and name stick.
    pub(crate) fn set_base(&mut self, hash: Option<&str>, name: Option<&str>) {
        if self.recipe.base_model_hash.is_none() {
            self.recipe.base_model_hash = hash.map(normalize_hash).filter(|h| !h.is_empty());
        }
        if self.recipe.base_model_name.is_none() {
            self.recipe.base_model_name = name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string);
        }
    }

    /// Add a resource, merging it into an earlier entry for the same resource.
    pub(crate) fn add(&mut self, mut resource: RecipeResource) {
        self.link_local(&mut resource);

        match self
            .recipe
            .resources
            .iter()
            .position(|existing| same_resource(existing, &resource))
        {
            Some(i) => merge_into(&mut self.recipe.resources[i], resource),
            None => self.recipe.resources.push(resource),
        }
    }

    fn link_local(&self, resource: &mut RecipeResource) {
        if resource.hash.is_none() {
            resource.hash = resource
                .name
                .as_deref()
                .and_then(|name| self.index.hash_for_name(name))
                .map(str::to_string);
        }

        let local = resource
            .hash
            .as_deref()
            .and_then(|hash| self.index.resolve_hash(hash))
            .map(|(full, filename)| (full.to_string(), filename.to_string()));
        if let Some((full, filename)) = local {
            resource.hash = Some(full);
            resource.local_filename = Some(filename);
            resource.resolved = true;
        }
    }

    fn finish(self) -> Recipe {
        self.recipe
    }
}

/// Equal hashes, or a short hash that prefixes the other one.
fn hashes_match(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short == long || (is_hex_hash(short) && long.starts_with(short))
}

fn same_resource(existing: &RecipeResource, candidate: &RecipeResource) -> bool {
    match (&existing.hash, &candidate.hash) {
        (Some(a), Some(b)) => hashes_match(a, b),
        _ => {
            existing.kind == candidate.kind
                && existing.name.is_some()
                && existing.name == candidate.name
        }
    }
}

fn merge_into(existing: &mut RecipeResource, other: RecipeResource) {
    if let Some(hash) = other.hash {
        let longer = existing
            .hash
            .as_ref()
            .map_or(true, |current| hash.len() > current.len());
        if longer {
            existing.hash = Some(hash);
        }
    }
    if existing.name.is_none() {
        existing.name = other.name;
    }
    if existing.upstream_version_id.is_none() {
        existing.upstream_version_id = other.upstream_version_id;
    }
    if existing.model_id.is_none() {
        existing.model_id = other.model_id;
    }
    if existing.local_filename.is_none() {
        existing.local_filename = other.local_filename;
    }
    existing.resolved |= other.resolved;
}

/// Extract the canonical recipe of one metadata record.
///
/// A record that is not a JSON object yields an empty recipe. Missing or
/// unresolvable references never fail; they are kept and marked unresolved.
pub fn extract(metadata: &Value, index: &LocalHashIndex, session: &ResolutionSession) -> Recipe {
    let Some(meta) = metadata.as_object() else {
        debug!("Metadata is not an object, nothing to extract");
        return Recipe::default();
    };

    let mut builder = RecipeBuilder::new(index, session);
    for dialect in Dialect::ALL {
        dialect.apply(meta, &mut builder);
    }
    builder.finish()
}

/// Registry version ids a record references, for pre-warming a session.
pub fn referenced_version_ids(metadata: &Value) -> BTreeSet<i64> {
    metadata
        .get("civitaiResources")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| types::parse_version_id(entry.get("modelVersionId")))
                .collect()
        })
        .unwrap_or_default()
}
