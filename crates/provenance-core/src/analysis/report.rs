//! Aggregated results of a batch analysis.

use super::params::{tally_parameters, DominantParameters, ParameterCounts};
use crate::recipe::{Recipe, ResourceKind};
use crate::resolution::ResolutionSession;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static PROMPT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(.+?:\d+\.\d+\)|<[^>]+>|\[[^\]]+\]|\([^)]+\)|[^,]+")
        .expect("prompt tag regex must compile")
});

/// Split a prompt into tags, keeping weighted groups and `<lora:..>` blocks whole.
pub fn parse_prompt_tags(prompt: &str) -> Vec<&str> {
    PROMPT_TAG
        .find_iter(prompt)
        .map(|m| m.as_str().trim())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// How often one auxiliary resource appeared across the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Content hash, or the display name when no hash was known.
    pub key: String,
    pub name: String,
    pub kind: ResourceKind,
    pub count: usize,
    pub weights: Vec<f64>,
    pub model_id: Option<i64>,
    pub upstream_version_id: Option<i64>,
    pub local_filename: Option<String>,
}

impl ResourceUsage {
    pub fn average_weight(&self) -> f64 {
        if self.weights.is_empty() {
            return 0.0;
        }
        self.weights.iter().sum::<f64>() / self.weights.len() as f64
    }

    /// Share of analyzed records using this resource.
    pub fn usage_ratio(&self, total_records: usize) -> f64 {
        if total_records == 0 {
            return 0.0;
        }
        self.count as f64 / total_records as f64
    }

    pub fn is_local(&self) -> bool {
        self.local_filename.is_some()
    }
}

/// A prompt tag and how many times it was used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

/// Result of analyzing the sample outputs of one model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub subject_hash: String,
    pub version_id: i64,
    pub fingerprint: String,
    pub total_records: usize,
    /// Records that yielded neither resources nor generation parameters.
    pub skipped_records: usize,
    pub prewarm_failures: usize,
    /// Most used first.
    pub resources: Vec<ResourceUsage>,
    pub base_models: BTreeMap<String, usize>,
    pub parameters: ParameterCounts,
    /// Most used first.
    pub positive_tags: Vec<TagCount>,
    pub negative_tags: Vec<TagCount>,
    pub generated_at: DateTime<Utc>,
    /// Served from the analysis cache rather than computed.
    #[serde(skip)]
    pub from_cache: bool,
}

impl AnalysisReport {
    pub fn dominant_parameters(&self) -> DominantParameters {
        DominantParameters::from_counts(&self.parameters)
    }

    pub fn resources_of(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceUsage> {
        self.resources.iter().filter(move |r| r.kind == kind)
    }

    pub fn top_positive_tags(&self, n: usize) -> &[TagCount] {
        &self.positive_tags[..n.min(self.positive_tags.len())]
    }
}

/// Counts in first-seen order, sorted by count on output.
#[derive(Default)]
struct Counter {
    order: Vec<String>,
    counts: HashMap<String, usize>,
}

impl Counter {
    fn add(&mut self, tag: &str) {
        match self.counts.get_mut(tag) {
            Some(count) => *count += 1,
            None => {
                self.order.push(tag.to_string());
                self.counts.insert(tag.to_string(), 1);
            }
        }
    }

    fn into_sorted(self) -> Vec<TagCount> {
        let Counter { order, counts } = self;
        let mut tags: Vec<TagCount> = order
            .into_iter()
            .map(|tag| {
                let count = counts.get(&tag).copied().unwrap_or(0);
                TagCount { tag, count }
            })
            .collect();
        tags.sort_by(|a, b| b.count.cmp(&a.count));
        tags
    }
}

/// Folds records into an [`AnalysisReport`].
pub(crate) struct ReportBuilder<'a> {
    session: &'a ResolutionSession,
    resources: Vec<ResourceUsage>,
    resource_slots: HashMap<String, usize>,
    base_models: BTreeMap<String, usize>,
    parameters: ParameterCounts,
    positive: Counter,
    negative: Counter,
    total: usize,
    skipped: usize,
}

impl<'a> ReportBuilder<'a> {
    pub(crate) fn new(session: &'a ResolutionSession) -> Self {
        Self {
            session,
            resources: Vec::new(),
            resource_slots: HashMap::new(),
            base_models: BTreeMap::new(),
            parameters: ParameterCounts::new(),
            positive: Counter::default(),
            negative: Counter::default(),
            total: 0,
            skipped: 0,
        }
    }

    pub(crate) fn add_record(&mut self, meta: &Map<String, Value>, recipe: &Recipe) {
        self.total += 1;

        let parameters_found = tally_parameters(meta, &mut self.parameters);
        if recipe.is_empty() && parameters_found == 0 {
            self.skipped += 1;
        }

        if let Some(base) = recipe
            .base_model_hash
            .as_ref()
            .or(recipe.base_model_name.as_ref())
        {
            *self.base_models.entry(base.clone()).or_insert(0) += 1;
        }

        for resource in &recipe.resources {
            let Some(key) = resource.key() else {
                continue;
            };
            let slot = match self.resource_slots.get(key) {
                Some(&slot) => slot,
                None => {
                    let registry = resource
                        .upstream_version_id
                        .and_then(|id| self.session.peek_version(id));
                    let name = registry
                        .as_ref()
                        .and_then(|r| r.model_name().map(str::to_string))
                        .or_else(|| resource.name.clone())
                        .unwrap_or_else(|| key.to_string());
                    self.resources.push(ResourceUsage {
                        key: key.to_string(),
                        name,
                        kind: resource.kind,
                        count: 0,
                        weights: Vec::new(),
                        model_id: None,
                        upstream_version_id: None,
                        local_filename: None,
                    });
                    self.resource_slots
                        .insert(key.to_string(), self.resources.len() - 1);
                    self.resources.len() - 1
                }
            };

            let usage = &mut self.resources[slot];
            usage.count += 1;
            usage.weights.push(resource.weight);
            usage.model_id = usage.model_id.or(resource.model_id);
            usage.upstream_version_id = usage.upstream_version_id.or(resource.upstream_version_id);
            if usage.local_filename.is_none() {
                usage.local_filename = resource.local_filename.clone();
            }
        }

        if let Some(prompt) = meta.get("prompt").and_then(Value::as_str) {
            for tag in parse_prompt_tags(prompt) {
                self.positive.add(tag);
            }
        }
        if let Some(prompt) = meta.get("negativePrompt").and_then(Value::as_str) {
            for tag in parse_prompt_tags(prompt) {
                self.negative.add(tag);
            }
        }
    }

    pub(crate) fn finish(
        self,
        subject_hash: String,
        version_id: i64,
        fingerprint: String,
        prewarm_failures: usize,
    ) -> AnalysisReport {
        let mut resources = self.resources;
        resources.sort_by(|a, b| b.count.cmp(&a.count));

        AnalysisReport {
            subject_hash,
            version_id,
            fingerprint,
            total_records: self.total,
            skipped_records: self.skipped,
            prewarm_failures,
            resources,
            base_models: self.base_models,
            parameters: self.parameters,
            positive_tags: self.positive.into_sorted(),
            negative_tags: self.negative.into_sorted(),
            generated_at: Utc::now(),
            from_cache: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::LocalHashIndex;
    use crate::recipe::extract;
    use serde_json::json;

    #[test]
    fn test_prompt_tags_keep_groups() {
        let tags = parse_prompt_tags("masterpiece, (red hair:1.2), <lora:ink:0.8>, [blurry], plain");
        assert_eq!(
            tags,
            vec!["masterpiece", "(red hair:1.2)", "<lora:ink:0.8>", "[blurry]", "plain"]
        );
        assert!(parse_prompt_tags("  ").is_empty());
    }

    #[test]
    fn test_report_aggregates_records() {
        let session = ResolutionSession::new();
        let index = LocalHashIndex::from_pairs([("ink.safetensors", "aaaa1111")]);
        let records = [
            json!({
                "Model hash": "base01",
                "prompt": "cat, ink style",
                "sampler": "Euler a",
                "resources": [{"type": "lora", "name": "ink", "weight": 0.8}],
            }),
            json!({
                "Model hash": "base01",
                "prompt": "dog, ink style",
                "negativePrompt": "blurry",
                "resources": [{"type": "lora", "name": "ink", "weight": 0.6}],
            }),
            json!({"comment": "nothing useful"}),
        ];

        let mut builder = ReportBuilder::new(&session);
        for record in &records {
            let recipe = extract(record, &index, &session);
            builder.add_record(record.as_object().unwrap(), &recipe);
        }
        let report = builder.finish("subject".into(), 7, "fp".into(), 0);

        assert_eq!(report.total_records, 3);
        assert_eq!(report.skipped_records, 1);
        assert_eq!(report.base_models["base01"], 2);

        let ink = &report.resources[0];
        assert_eq!(ink.key, "aaaa1111");
        assert_eq!(ink.count, 2);
        assert!((ink.average_weight() - 0.7).abs() < 1e-9);
        assert!(ink.is_local());

        assert_eq!(report.positive_tags[0], TagCount { tag: "ink style".into(), count: 2 });
        assert_eq!(report.top_positive_tags(1).len(), 1);
        assert_eq!(report.negative_tags.len(), 1);
        assert_eq!(report.dominant_parameters().sampler, "euler_ancestral");
    }
}
