//! Model configuration parsing
//!
//! Each supported model family stores its preprocessing and inference
//! parameters in a different JSON layout. A [`ConfigParser`] implementation
//! per family extracts them into a uniform [`ModelConfig`]. Every accessor is
//! independently defensive: a missing key logs a warning and yields the
//! documented default, so an incomplete config still produces a usable model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const DEFAULT_PATCH_SIZE: [usize; 3] = [128, 128, 128];
pub const DEFAULT_SPACING: [f64; 3] = [1.0, 1.0, 1.0];
pub const DEFAULT_NORMALIZATION: &str = "CTNormalization";
pub const DEFAULT_NUM_CLASSES: usize = 2;

/// Intensity normalization applied before resampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NormalizationScheme {
    /// Percentile clip followed by z-score.
    Ct,
    /// Plain z-score over the whole volume.
    ZScore,
    /// Anything else; handled with foreground-based z-score.
    Other(String),
}

impl NormalizationScheme {
    pub fn parse(name: &str) -> Self {
        match name {
            "CTNormalization" => NormalizationScheme::Ct,
            "ZScoreNormalization" => NormalizationScheme::ZScore,
            other => NormalizationScheme::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NormalizationScheme::Ct => "CTNormalization",
            NormalizationScheme::ZScore => "ZScoreNormalization",
            NormalizationScheme::Other(name) => name,
        }
    }
}

/// Foreground intensity statistics recorded at training time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForegroundStats {
    pub percentile_00_5: Option<f64>,
    pub percentile_99_5: Option<f64>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Network input size, (Z, Y, X).
    pub patch_size: [usize; 3],
    /// Target voxel spacing, (Z, Y, X), in mm.
    pub spacing: [f64; 3],
    pub normalization_scheme: NormalizationScheme,
    pub foreground_stats: Option<ForegroundStats>,
    pub num_classes: usize,
    pub class_names: BTreeMap<u32, String>,
}

impl ModelConfig {
    pub fn from_parser(parser: &dyn ConfigParser) -> Self {
        Self {
            patch_size: parser.patch_size(),
            spacing: parser.spacing(),
            normalization_scheme: NormalizationScheme::parse(&parser.normalization_scheme()),
            foreground_stats: parser.foreground_stats(),
            num_classes: parser.num_classes(),
            class_names: parser.class_names(),
        }
    }

    /// Display name for a label, `class_<id>` when the config has none.
    pub fn class_name(&self, class_id: u32) -> String {
        self.class_names
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            patch_size: DEFAULT_PATCH_SIZE,
            spacing: DEFAULT_SPACING,
            normalization_scheme: NormalizationScheme::Ct,
            foreground_stats: None,
            num_classes: DEFAULT_NUM_CLASSES,
            class_names: BTreeMap::new(),
        }
    }
}

/// Capability interface implemented once per model family.
pub trait ConfigParser {
    fn patch_size(&self) -> [usize; 3];
    fn spacing(&self) -> [f64; 3];
    fn normalization_scheme(&self) -> String;
    fn foreground_stats(&self) -> Option<ForegroundStats>;
    fn num_classes(&self) -> usize;
    fn class_names(&self) -> BTreeMap<u32, String>;
}

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    NnUnet,
    MultiTalent,
}

impl ModelFamily {
    /// Maps a family tag to a family. Unknown tags fall back to nnU-Net,
    /// the most complete parser.
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "nnunet" => ModelFamily::NnUnet,
            "multitalent" => ModelFamily::MultiTalent,
            other => {
                warn!("Unknown model_type '{}', defaulting to nnUNet parser", other);
                ModelFamily::NnUnet
            }
        }
    }

    pub fn parser<'a>(&self, raw: &'a Value) -> Box<dyn ConfigParser + 'a> {
        match self {
            ModelFamily::NnUnet => Box::new(NnUnetConfigParser::new(raw)),
            ModelFamily::MultiTalent => Box::new(MultiTalentConfigParser),
        }
    }
}

/// Parses a raw JSON configuration into a [`ModelConfig`].
///
/// The family comes from the config's own `model_type` key, then from
/// `family_hint` (the model record's tag), then defaults to nnU-Net.
pub fn parse_model_config(raw: &Value, family_hint: Option<&str>) -> ModelConfig {
    let tag = raw
        .get("model_type")
        .and_then(Value::as_str)
        .or(family_hint)
        .unwrap_or("nnunet");
    let family = ModelFamily::from_tag(tag);
    let parser = family.parser(raw);
    ModelConfig::from_parser(parser.as_ref())
}

/// nnU-Net v2 layout: `model_parameters.*` and `dataset_parameters.*`.
pub struct NnUnetConfigParser<'a> {
    raw: &'a Value,
}

impl<'a> NnUnetConfigParser<'a> {
    pub fn new(raw: &'a Value) -> Self {
        Self { raw }
    }

    fn model_param(&self, key: &str) -> Option<&'a Value> {
        self.raw.get("model_parameters").and_then(|p| p.get(key))
    }

    fn dataset_param(&self, key: &str) -> Option<&'a Value> {
        self.raw.get("dataset_parameters").and_then(|p| p.get(key))
    }
}

fn triple<T: Copy>(value: &Value, convert: impl Fn(&Value) -> Option<T>) -> Option<[T; 3]> {
    let items = value.as_array()?;
    if items.len() != 3 {
        return None;
    }
    Some([convert(&items[0])?, convert(&items[1])?, convert(&items[2])?])
}

impl<'a> ConfigParser for NnUnetConfigParser<'a> {
    fn patch_size(&self) -> [usize; 3] {
        let parsed = self
            .model_param("patch_size")
            .and_then(|v| triple(v, |x| x.as_u64().filter(|&n| n > 0).map(|n| n as usize)));
        match parsed {
            Some(patch) => {
                info!("nnUNet patch_size: {:?}", patch);
                patch
            }
            None => {
                warn!("Could not find patch_size in nnUNet config, using default");
                DEFAULT_PATCH_SIZE
            }
        }
    }

    fn spacing(&self) -> [f64; 3] {
        let parsed = self
            .model_param("spacing")
            .and_then(|v| triple(v, |x| x.as_f64().filter(|&s| s > 0.0)));
        match parsed {
            Some(spacing) => {
                info!("nnUNet spacing: {:?}", spacing);
                spacing
            }
            None => {
                warn!("Could not find spacing in nnUNet config, using default");
                DEFAULT_SPACING
            }
        }
    }

    fn normalization_scheme(&self) -> String {
        let first = self
            .model_param("normalization_schemes")
            .and_then(Value::as_array)
            .and_then(|schemes| schemes.first())
            .and_then(Value::as_str);
        match first {
            Some(scheme) => {
                info!("nnUNet normalization scheme: {}", scheme);
                scheme.to_string()
            }
            None => {
                warn!("Could not find normalization scheme in nnUNet config, using CTNormalization");
                DEFAULT_NORMALIZATION.to_string()
            }
        }
    }

    fn foreground_stats(&self) -> Option<ForegroundStats> {
        let props = self
            .dataset_param("channels")
            .and_then(|c| c.get("0"))
            .and_then(|c| c.get("foreground_properties"))
            .and_then(Value::as_object)
            .filter(|props| !props.is_empty());

        let Some(props) = props else {
            info!("No foreground properties found in nnUNet config");
            return None;
        };

        let field = |key: &str| props.get(key).and_then(Value::as_f64);
        let stats = ForegroundStats {
            percentile_00_5: field("percentile_00_5"),
            percentile_99_5: field("percentile_99_5"),
            mean: field("mean"),
            std: field("std"),
        };
        info!("nnUNet foreground properties: {:?}", props.keys().collect::<Vec<_>>());
        Some(stats)
    }

    fn num_classes(&self) -> usize {
        match self
            .dataset_param("num_classes")
            .and_then(Value::as_u64)
            .filter(|&n| n > 0)
        {
            Some(n) => {
                info!("nnUNet num_classes: {}", n);
                n as usize
            }
            None => {
                warn!("Could not find num_classes in nnUNet config, using 2 (binary)");
                DEFAULT_NUM_CLASSES
            }
        }
    }

    fn class_names(&self) -> BTreeMap<u32, String> {
        let Some(names) = self.dataset_param("class_names").and_then(Value::as_object) else {
            warn!("Could not find class_names in nnUNet config");
            return BTreeMap::new();
        };

        let mut mapped = BTreeMap::new();
        for (id, name) in names {
            match (id.trim().parse::<u32>(), name.as_str()) {
                (Ok(id), Some(name)) => {
                    mapped.insert(id, name.to_string());
                }
                _ => warn!("Skipping malformed class_names entry {:?}: {}", id, name),
            }
        }
        info!("nnUNet class_names: {:?}", mapped);
        mapped
    }
}

/// MultiTalent models. Their config layout is not documented yet, so every
/// accessor returns the defaults.
pub struct MultiTalentConfigParser;

impl ConfigParser for MultiTalentConfigParser {
    fn patch_size(&self) -> [usize; 3] {
        warn!("MultiTalent config parser not yet implemented, using defaults");
        DEFAULT_PATCH_SIZE
    }

    fn spacing(&self) -> [f64; 3] {
        DEFAULT_SPACING
    }

    fn normalization_scheme(&self) -> String {
        DEFAULT_NORMALIZATION.to_string()
    }

    fn foreground_stats(&self) -> Option<ForegroundStats> {
        None
    }

    fn num_classes(&self) -> usize {
        DEFAULT_NUM_CLASSES
    }

    fn class_names(&self) -> BTreeMap<u32, String> {
        BTreeMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_config() -> Value {
        json!({
            "model_parameters": {
                "patch_size": [64, 96, 96],
                "spacing": [2.5, 0.8, 0.8],
                "normalization_schemes": ["ZScoreNormalization", "CTNormalization"]
            },
            "dataset_parameters": {
                "num_classes": 3,
                "class_names": {"1": "liver", "2": "tumor"},
                "channels": {"0": {"foreground_properties": {
                    "percentile_00_5": -100.0, "percentile_99_5": 240.0,
                    "mean": 90.5, "std": 40.0
                }}}
            }
        })
    }

    #[test]
    fn test_nnunet_full_config() {
        let config = parse_model_config(&full_config(), None);
        assert_eq!(config.patch_size, [64, 96, 96]);
        assert_eq!(config.spacing, [2.5, 0.8, 0.8]);
        assert_eq!(config.normalization_scheme, NormalizationScheme::ZScore);
        assert_eq!(config.num_classes, 3);
        assert_eq!(config.class_names.get(&2).map(String::as_str), Some("tumor"));
        let stats = config.foreground_stats.unwrap();
        assert_eq!(stats.percentile_00_5, Some(-100.0));
        assert_eq!(stats.std, Some(40.0));
    }

    #[test]
    fn test_empty_config_uses_documented_defaults() {
        let config = parse_model_config(&json!({}), None);
        assert_eq!(config, ModelConfig::default());
        assert_eq!(config.patch_size, [128, 128, 128]);
        assert_eq!(config.spacing, [1.0, 1.0, 1.0]);
        assert_eq!(config.num_classes, 2);
        assert_eq!(config.normalization_scheme, NormalizationScheme::Ct);
    }

    #[test]
    fn test_each_accessor_is_independent() {
        // A malformed patch_size must not hide a valid spacing.
        let raw = json!({"model_parameters": {"patch_size": [64, 64], "spacing": [3.0, 1.0, 1.0]}});
        let config = parse_model_config(&raw, None);
        assert_eq!(config.patch_size, DEFAULT_PATCH_SIZE);
        assert_eq!(config.spacing, [3.0, 1.0, 1.0]);
    }

    #[test]
    fn test_unknown_family_falls_back_to_nnunet() {
        let mut raw = full_config();
        raw["model_type"] = json!("totalsegmentator");
        let config = parse_model_config(&raw, None);
        assert_eq!(config.patch_size, [64, 96, 96]);
    }

    #[test]
    fn test_multitalent_returns_defaults() {
        let config = parse_model_config(&full_config(), Some("MultiTalent"));
        assert_eq!(config, ModelConfig::default());
    }

    #[test]
    fn test_empty_foreground_properties_is_none() {
        let raw = json!({"dataset_parameters": {"channels": {"0": {"foreground_properties": {}}}}});
        assert!(parse_model_config(&raw, None).foreground_stats.is_none());
    }

    #[test]
    fn test_class_name_fallback() {
        let config = parse_model_config(&full_config(), None);
        assert_eq!(config.class_name(1), "liver");
        assert_eq!(config.class_name(7), "class_7");
    }
}
