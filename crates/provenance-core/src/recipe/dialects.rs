//! Metadata dialects understood by the extractor.
//!
//! Each dialect reads its own fields from the metadata object and feeds the
//! shared [`RecipeBuilder`]. All of them run on every record, in
//! [`Dialect::ALL`] order; the builder merges what they find.

use super::types::{parse_version_id, parse_weight, RecipeResource, ResourceKind, TypeLabel};
use super::RecipeBuilder;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Highest numbered `AddNet` slot written by the old generation tool.
const ADDNET_SLOTS: usize = 9;

static ADDNET_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\w+)\)").expect("addnet hash regex must compile"));

/// A metadata schema some generator writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Top-level `Model hash` / `Model` strings.
    BaseModelFields,
    /// `civitaiResources[]` referencing registry versions by id.
    RegistryResources,
    /// `resources[]` with free-text names and optional hashes.
    LooseResources,
    /// `hashes` object keyed by type-prefixed labels.
    HashMap,
    /// `Lora hashes` / `TI hashes` text fields.
    InlineHashLists,
    /// Numbered `AddNet Module N` / `AddNet Model N` / `AddNet Weight A N` triplets.
    AddNetLegacy,
}

impl Dialect {
    pub const ALL: [Dialect; 6] = [
        Dialect::BaseModelFields,
        Dialect::RegistryResources,
        Dialect::LooseResources,
        Dialect::HashMap,
        Dialect::InlineHashLists,
        Dialect::AddNetLegacy,
    ];

    pub(crate) fn apply(&self, meta: &Map<String, Value>, builder: &mut RecipeBuilder<'_>) {
        match self {
            Dialect::BaseModelFields => base_model_fields(meta, builder),
            Dialect::RegistryResources => registry_resources(meta, builder),
            Dialect::LooseResources => loose_resources(meta, builder),
            Dialect::HashMap => hash_map(meta, builder),
            Dialect::InlineHashLists => inline_hash_lists(meta, builder),
            Dialect::AddNetLegacy => addnet_legacy(meta, builder),
        }
    }

    /// Whether the record carries any field this dialect reads.
    pub fn is_present(&self, meta: &Map<String, Value>) -> bool {
        match self {
            Dialect::BaseModelFields => meta.contains_key("Model hash") || meta.contains_key("Model"),
            Dialect::RegistryResources => meta.get("civitaiResources").is_some_and(Value::is_array),
            Dialect::LooseResources => meta.get("resources").is_some_and(Value::is_array),
            Dialect::HashMap => meta.get("hashes").is_some_and(Value::is_object),
            Dialect::InlineHashLists => {
                meta.contains_key("Lora hashes") || meta.contains_key("TI hashes")
            }
            Dialect::AddNetLegacy => {
                (1..=ADDNET_SLOTS).any(|i| meta.contains_key(&format!("AddNet Module {}", i)))
            }
        }
    }
}

fn str_field<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn base_model_fields(meta: &Map<String, Value>, builder: &mut RecipeBuilder<'_>) {
    builder.set_base(str_field(meta, "Model hash"), str_field(meta, "Model"));
}

fn registry_resources(meta: &Map<String, Value>, builder: &mut RecipeBuilder<'_>) {
    let Some(entries) = meta.get("civitaiResources").and_then(Value::as_array) else {
        return;
    };

    for entry in entries.iter().filter_map(Value::as_object) {
        let Some(version_id) = parse_version_id(entry.get("modelVersionId")) else {
            continue;
        };
        let record = builder.session().peek_version(version_id);

        let label = str_field(entry, "type")
            .map(str::to_string)
            .or_else(|| record.as_ref().and_then(|r| r.model_type().map(str::to_string)));
        let Some(label) = label.as_deref().and_then(TypeLabel::parse) else {
            continue;
        };

        let version_name = str_field(entry, "modelVersionName");
        let hash = record.as_ref().map(|r| r.content_hash.clone());

        match label {
            TypeLabel::BaseModel => builder.set_base(hash.as_deref(), version_name),
            TypeLabel::Resource(kind) => {
                let registry_name = record
                    .as_ref()
                    .and_then(|r| r.model_name().or(r.name.as_deref()));
                let mut resource = RecipeResource::new(kind)
                    .with_hash(hash.as_deref())
                    .with_name(version_name.or(registry_name))
                    .with_weight(parse_weight(entry.get("weight")));
                resource.upstream_version_id = Some(version_id);
                resource.model_id = record.as_ref().and_then(|r| r.model_id);
                resource.resolved = registry_name.is_some();
                builder.add(resource);
            }
        }
    }
}

fn loose_resources(meta: &Map<String, Value>, builder: &mut RecipeBuilder<'_>) {
    let Some(entries) = meta.get("resources").and_then(Value::as_array) else {
        return;
    };

    for entry in entries.iter().filter_map(Value::as_object) {
        let Some(label) = str_field(entry, "type").and_then(TypeLabel::parse) else {
            continue;
        };
        let name = str_field(entry, "name");
        let hash = str_field(entry, "hash");

        match label {
            TypeLabel::BaseModel => builder.set_base(hash, name),
            TypeLabel::Resource(kind) => builder.add(
                RecipeResource::new(kind)
                    .with_hash(hash)
                    .with_name(name)
                    .with_weight(parse_weight(entry.get("weight"))),
            ),
        }
    }
}

fn hash_map(meta: &Map<String, Value>, builder: &mut RecipeBuilder<'_>) {
    let Some(hashes) = meta.get("hashes").and_then(Value::as_object) else {
        return;
    };

    for (key, value) in hashes {
        if key.eq_ignore_ascii_case("lora") {
            if let Some(nested) = value.as_object() {
                for (hash, weight) in nested {
                    builder.add(
                        RecipeResource::new(ResourceKind::Lora)
                            .with_hash(Some(hash.as_str()))
                            .with_weight(parse_weight(Some(weight))),
                    );
                }
            }
            continue;
        }

        let Some(hash) = value.as_str() else {
            continue;
        };
        let (prefix, name) = match key.split_once(':') {
            Some((prefix, name)) => (prefix, Some(name)),
            None => (key.as_str(), None),
        };

        match prefix.trim().to_lowercase().as_str() {
            "model" => builder.set_base(Some(hash), None),
            "vae" => builder.add(
                RecipeResource::new(ResourceKind::Vae)
                    .with_hash(Some(hash))
                    .with_name(name),
            ),
            "lora" | "lyco" => builder.add(
                RecipeResource::new(ResourceKind::Lora)
                    .with_hash(Some(hash))
                    .with_name(name),
            ),
            "embed" => builder.add(
                RecipeResource::new(ResourceKind::Embedding)
                    .with_hash(Some(hash))
                    .with_name(name),
            ),
            _ => {}
        }
    }
}

fn inline_hash_lists(meta: &Map<String, Value>, builder: &mut RecipeBuilder<'_>) {
    for (field, kind) in [
        ("Lora hashes", ResourceKind::Lora),
        ("TI hashes", ResourceKind::Embedding),
    ] {
        let Some(list) = str_field(meta, field) else {
            continue;
        };
        for (name, hash) in parse_inline_list(list) {
            builder.add(
                RecipeResource::new(kind)
                    .with_hash(Some(hash))
                    .with_name(Some(name)),
            );
        }
    }
}

/// Split `"name: hash, name2: hash2"`, tolerating surrounding quotes.
pub(crate) fn parse_inline_list(list: &str) -> Vec<(&str, &str)> {
    list.trim()
        .trim_matches('"')
        .split(',')
        .filter_map(|pair| {
            let (name, hash) = pair.rsplit_once(':')?;
            let (name, hash) = (name.trim(), hash.trim());
            (!name.is_empty() && !hash.is_empty()).then_some((name, hash))
        })
        .collect()
}

fn addnet_legacy(meta: &Map<String, Value>, builder: &mut RecipeBuilder<'_>) {
    for slot in 1..=ADDNET_SLOTS {
        if str_field(meta, &format!("AddNet Module {}", slot)) != Some("LoRA") {
            continue;
        }
        let Some(model) = str_field(meta, &format!("AddNet Model {}", slot)) else {
            continue;
        };
        let Some(captures) = ADDNET_HASH.captures(model) else {
            continue;
        };
        let name = model.split('(').next().map(str::trim);

        builder.add(
            RecipeResource::new(ResourceKind::Lora)
                .with_hash(captures.get(1).map(|m| m.as_str()))
                .with_name(name)
                .with_weight(parse_weight(meta.get(&format!("AddNet Weight A {}", slot)))),
        );
    }
}
