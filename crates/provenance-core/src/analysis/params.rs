//! Generation parameter tallies and their dominant values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Metadata fields whose values are tallied.
pub const TRACKED_PARAMETERS: [&str; 6] = [
    "sampler",
    "scheduler",
    "cfgScale",
    "steps",
    "Size",
    "Denoising strength",
];

/// Scheduler suffixes some tools append to the sampler name.
const SCHEDULER_SUFFIXES: [&str; 2] = ["Karras", "SGM Uniform"];

/// Display names of samplers and schedulers mapped to node input names.
const SAMPLER_NAMES: &[(&str, &str)] = &[
    ("Euler a", "euler_ancestral"),
    ("Euler", "euler"),
    ("LMS", "lms"),
    ("Heun", "heun"),
    ("DPM2", "dpm_2"),
    ("DPM2 a", "dpm_2_ancestral"),
    ("DPM++ 2S a", "dpmpp_2s_ancestral"),
    ("DPM++ 2M", "dpmpp_2m"),
    ("DPM++ SDE", "dpmpp_sde"),
    ("DPM++ 2M SDE", "dpmpp_2m_sde"),
    ("DPM fast", "dpm_fast"),
    ("DPM adaptive", "dpm_adaptive"),
    ("DDIM", "ddim"),
    ("PLMS", "plms"),
    ("UniPC", "uni_pc"),
    ("normal", "normal"),
    ("karras", "karras"),
    ("Karras", "karras"),
    ("exponential", "exponential"),
    ("sgm_uniform", "sgm_uniform"),
    ("simple", "simple"),
    ("ddim_uniform", "ddim_uniform"),
    ("turbo", "turbo"),
];

fn sampler_name(display: &str) -> Option<&'static str> {
    let display = display.trim();
    SAMPLER_NAMES
        .iter()
        .find(|(name, _)| *name == display)
        .map(|(_, mapped)| *mapped)
}

/// Value counts per tracked parameter.
pub type ParameterCounts = BTreeMap<String, BTreeMap<String, usize>>;

/// Count the tracked parameters present in one record. Returns how many were found.
pub(crate) fn tally_parameters(meta: &Map<String, Value>, counts: &mut ParameterCounts) -> usize {
    let mut found = 0;
    for key in TRACKED_PARAMETERS {
        let Some(value) = meta.get(key).and_then(parameter_text) else {
            continue;
        };
        *counts
            .entry(key.to_string())
            .or_default()
            .entry(value)
            .or_insert(0) += 1;
        found += 1;
    }
    found
}

/// Text form of a parameter value; empty, zero and false values count as absent.
fn parameter_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}

fn most_common<'a>(counts: &'a ParameterCounts, key: &str) -> Option<&'a str> {
    counts
        .get(key)?
        .iter()
        .fold(None, |best: Option<(&str, usize)>, (value, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((value.as_str(), count)),
        })
        .map(|(value, _)| value)
}

/// Most common generation settings, mapped to sampler node inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominantParameters {
    pub sampler: String,
    pub scheduler: String,
    pub steps: u32,
    pub cfg: f64,
    pub width: u32,
    pub height: u32,
    pub denoise: f64,
}

impl Default for DominantParameters {
    fn default() -> Self {
        Self {
            sampler: "euler_ancestral".to_string(),
            scheduler: "karras".to_string(),
            steps: 25,
            cfg: 7.0,
            width: 512,
            height: 512,
            denoise: 1.0,
        }
    }
}

impl DominantParameters {
    pub fn from_counts(counts: &ParameterCounts) -> Self {
        let defaults = Self::default();

        let sampler_raw = most_common(counts, "sampler").unwrap_or("Euler a");
        let scheduler_raw = most_common(counts, "scheduler").unwrap_or("Karras");
        let (sampler_raw, scheduler_raw) = SCHEDULER_SUFFIXES
            .iter()
            .find_map(|suffix| {
                sampler_raw
                    .strip_suffix(suffix)
                    .and_then(|rest| rest.strip_suffix(' '))
                    .map(|rest| (rest, *suffix))
            })
            .unwrap_or((sampler_raw, scheduler_raw));

        let (width, height) = most_common(counts, "Size")
            .and_then(parse_size)
            .unwrap_or((defaults.width, defaults.height));

        Self {
            sampler: sampler_name(sampler_raw)
                .unwrap_or("euler_ancestral")
                .to_string(),
            scheduler: sampler_name(scheduler_raw).unwrap_or("karras").to_string(),
            steps: most_common(counts, "steps")
                .and_then(|s| s.parse::<f64>().ok())
                .map(|s| s as u32)
                .unwrap_or(defaults.steps),
            cfg: most_common(counts, "cfgScale")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.cfg),
            width,
            height,
            denoise: most_common(counts, "Denoising strength")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.denoise),
        }
    }
}

fn parse_size(size: &str) -> Option<(u32, u32)> {
    let (width, height) = size.split_once('x')?;
    Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counts(records: &[Value]) -> ParameterCounts {
        let mut counts = ParameterCounts::new();
        for record in records {
            tally_parameters(record.as_object().unwrap(), &mut counts);
        }
        counts
    }

    #[test]
    fn test_tally_skips_empty_values() {
        let counts = counts(&[
            json!({"sampler": "Euler a", "steps": 30, "cfgScale": 0, "Size": ""}),
            json!({"sampler": "Euler a", "steps": 20}),
        ]);
        assert_eq!(counts["sampler"]["Euler a"], 2);
        assert_eq!(counts["steps"].len(), 2);
        assert!(!counts.contains_key("cfgScale"));
        assert!(!counts.contains_key("Size"));
    }

    #[test]
    fn test_dominant_parameters_split_karras_suffix() {
        let counts = counts(&[
            json!({"sampler": "DPM++ 2M Karras", "steps": 28, "cfgScale": 5.5, "Size": "832x1216"}),
            json!({"sampler": "DPM++ 2M Karras", "steps": 28, "Denoising strength": "0.4"}),
            json!({"sampler": "Euler", "steps": 20}),
        ]);
        let dominant = DominantParameters::from_counts(&counts);
        assert_eq!(dominant.sampler, "dpmpp_2m");
        assert_eq!(dominant.scheduler, "karras");
        assert_eq!(dominant.steps, 28);
        assert_eq!(dominant.cfg, 5.5);
        assert_eq!((dominant.width, dominant.height), (832, 1216));
        assert_eq!(dominant.denoise, 0.4);
    }

    #[test]
    fn test_dominant_parameters_fallbacks() {
        let counts = counts(&[json!({"sampler": "Mystery Sampler", "Size": "huge"})]);
        assert_eq!(
            DominantParameters::from_counts(&counts),
            DominantParameters::default()
        );
    }
}
