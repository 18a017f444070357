//! Canonical model catalog, tiers, and pricing table.
//!
//! Mirrors the longest-prefix pricing lookup and alias normalization the
//! teacher's cost module used for its hardcoded provider model list, but
//! keyed on z.ai's model names instead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse classification of request weight, determining candidate models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Heavy,
    Medium,
    Light,
    Free,
}

impl ModelTier {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Heavy => "heavy",
            Self::Medium => "medium",
            Self::Light => "light",
            Self::Free => "free",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_ascii_lowercase().as_str() {
            "heavy" => Some(Self::Heavy),
            "medium" => Some(Self::Medium),
            "light" => Some(Self::Light),
            "free" => Some(Self::Free),
            _ => None,
        }
    }

    pub const ALL: [ModelTier; 4] = [Self::Heavy, Self::Medium, Self::Light, Self::Free];
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Per-1M-token pricing for a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

/// A model the router may target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub tier: ModelTier,
    pub context_length: u32,
    pub supports_vision: bool,
    pub max_concurrency: usize,
    pub pricing: ModelPricing,
}

/// External override file shape: a flat list of additional/replacement models.
#[derive(Debug, Deserialize)]
struct ModelOverrideFile {
    models: Vec<Model>,
}

fn builtin_models() -> Vec<Model> {
    vec![
        Model {
            id: "glm-4.7".to_string(),
            tier: ModelTier::Heavy,
            context_length: 128_000,
            supports_vision: true,
            max_concurrency: 24,
            pricing: ModelPricing {
                input_per_1m: 3.0,
                output_per_1m: 12.0,
            },
        },
        Model {
            id: "glm-4.6".to_string(),
            tier: ModelTier::Heavy,
            context_length: 128_000,
            supports_vision: true,
            max_concurrency: 24,
            pricing: ModelPricing {
                input_per_1m: 2.5,
                output_per_1m: 10.0,
            },
        },
        Model {
            id: "glm-4-plus".to_string(),
            tier: ModelTier::Medium,
            context_length: 128_000,
            supports_vision: false,
            max_concurrency: 32,
            pricing: ModelPricing {
                input_per_1m: 1.0,
                output_per_1m: 3.0,
            },
        },
        Model {
            id: "glm-4-air".to_string(),
            tier: ModelTier::Light,
            context_length: 128_000,
            supports_vision: false,
            max_concurrency: 48,
            pricing: ModelPricing {
                input_per_1m: 0.2,
                output_per_1m: 0.6,
            },
        },
        Model {
            id: "glm-4-flash".to_string(),
            tier: ModelTier::Free,
            context_length: 128_000,
            supports_vision: false,
            max_concurrency: 64,
            pricing: ModelPricing {
                input_per_1m: 0.0,
                output_per_1m: 0.0,
            },
        },
    ]
}

/// Canonical model catalog plus pricing lookup.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<Model>,
    by_id: HashMap<String, usize>,
}

impl ModelCatalog {
    /// Loads the embedded default catalog, optionally extended/replaced by
    /// an external override file (exact-id match replaces; new ids append).
    pub fn load(override_path: Option<&std::path::Path>) -> Self {
        let mut models = builtin_models();

        if let Some(path) = override_path {
            match std::fs::read_to_string(path) {
                Ok(contents) => match serde_yaml::from_str::<ModelOverrideFile>(&contents) {
                    Ok(overrides) => {
                        for model in overrides.models {
                            if let Some(existing) =
                                models.iter_mut().find(|m| m.id == model.id)
                            {
                                *existing = model;
                            } else {
                                models.push(model);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            "failed to parse model override file {}: {}",
                            path.display(),
                            e
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        "could not read model override file {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }

        Self::from_models(models)
    }

    pub fn from_models(models: Vec<Model>) -> Self {
        let by_id = models
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.to_ascii_lowercase(), i))
            .collect();
        Self { models, by_id }
    }

    pub fn all(&self) -> &[Model] {
        &self.models
    }

    pub fn get(&self, id: &str) -> Option<&Model> {
        self.by_id.get(&id.to_ascii_lowercase()).map(|&i| &self.models[i])
    }

    pub fn by_tier(&self, tier: ModelTier) -> Vec<&Model> {
        self.models.iter().filter(|m| m.tier == tier).collect()
    }

    /// Exact match, then case-insensitive, then longest known-id prefix —
    /// e.g. a dated snapshot name falls back to its base model.
    pub fn resolve_pricing(&self, model_id: &str) -> Option<ModelPricing> {
        if let Some(m) = self.models.iter().find(|m| m.id == model_id) {
            return Some(m.pricing);
        }
        if let Some(m) = self.get(model_id) {
            return Some(m.pricing);
        }
        self.models
            .iter()
            .filter(|m| model_id.to_ascii_lowercase().starts_with(&m.id.to_ascii_lowercase()))
            .max_by_key(|m| m.id.len())
            .map(|m| m.pricing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_pricing() {
        let catalog = ModelCatalog::from_models(builtin_models());
        let pricing = catalog.resolve_pricing("glm-4.7").unwrap();
        assert_eq!(pricing.input_per_1m, 3.0);
    }

    #[test]
    fn longest_prefix_fallback() {
        let catalog = ModelCatalog::from_models(builtin_models());
        let pricing = catalog.resolve_pricing("glm-4.7-20250929-snapshot").unwrap();
        assert_eq!(pricing.input_per_1m, 3.0);
    }

    #[test]
    fn case_insensitive_match() {
        let catalog = ModelCatalog::from_models(builtin_models());
        let pricing = catalog.resolve_pricing("GLM-4-AIR").unwrap();
        assert_eq!(pricing.input_per_1m, 0.2);
    }

    #[test]
    fn unknown_model_has_no_pricing() {
        let catalog = ModelCatalog::from_models(builtin_models());
        assert!(catalog.resolve_pricing("totally-unknown-model").is_none());
    }

    #[test]
    fn tier_round_trips_through_id() {
        for tier in ModelTier::ALL {
            assert_eq!(ModelTier::from_id(tier.id()), Some(tier));
        }
    }
}
