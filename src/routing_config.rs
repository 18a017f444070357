//! Persisted, operator-editable routing configuration backing `/model-routing*`.
//!
//! The `ModelRouter` (`model_router.rs`) owns *runtime* state — cooldowns,
//! in-flight counts, per-key overrides actually consulted during selection.
//! This module owns the *declarative* config an operator edits through the
//! dashboard: tiers, rules, classifier thresholds, failover knobs. It
//! persists atomically (temp file + rename) like the cost tracker does,
//! extended here with a `.bak` sibling on every overwrite and a
//! content-hash check so an identical PUT doesn't touch disk.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::models::ModelCatalog;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    /// Matches if the client-supplied model name contains this substring.
    pub client_model_contains: Option<String>,
    pub min_messages: Option<usize>,
    pub requires_tools: Option<bool>,
    pub requires_vision: Option<bool>,
    pub target_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    pub heavy_min_messages: usize,
    pub heavy_min_system_length: usize,
    pub light_max_messages: usize,
    pub light_max_system_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownSettings {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub decay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverSettings {
    pub max_429_attempts_per_request: u32,
    pub max_429_retry_window_ms: u64,
    pub max_model_switches_per_request: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSettings {
    pub tier: crate::models::ModelTier,
    pub models: Vec<String>,
}

/// The normalized, persisted shape: `{version, enabled, defaultModel, tiers,
/// rules, classifier, cooldown, logDecisions, failover, shadowMode}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub version: u32,
    pub enabled: bool,
    pub default_model: String,
    pub tiers: Vec<TierSettings>,
    pub rules: Vec<RoutingRule>,
    pub classifier: ClassifierSettings,
    pub cooldown: CooldownSettings,
    pub log_decisions: bool,
    pub failover: FailoverSettings,
    /// When true, the router computes and logs a decision but the handler
    /// still uses the client-supplied model — useful for validating a new
    /// ruleset against live traffic before it takes effect.
    pub shadow_mode: bool,
}

impl RoutingConfig {
    pub fn default_for(catalog: &ModelCatalog) -> Self {
        let default_model = catalog
            .all()
            .iter()
            .find(|m| m.tier == crate::models::ModelTier::Medium)
            .or_else(|| catalog.all().first())
            .map(|m| m.id.clone())
            .unwrap_or_else(|| "glm-4-plus".to_string());

        Self {
            version: SCHEMA_VERSION,
            enabled: true,
            default_model,
            tiers: crate::models::ModelTier::ALL
                .iter()
                .map(|&tier| TierSettings {
                    tier,
                    models: catalog.by_tier(tier).iter().map(|m| m.id.clone()).collect(),
                })
                .collect(),
            rules: Vec::new(),
            classifier: ClassifierSettings {
                heavy_min_messages: 12,
                heavy_min_system_length: 4_000,
                light_max_messages: 2,
                light_max_system_length: 200,
            },
            cooldown: CooldownSettings {
                base_ms: 1_000,
                cap_ms: 60_000,
                decay_ms: 120_000,
            },
            log_decisions: true,
            failover: FailoverSettings {
                max_429_attempts_per_request: 3,
                max_429_retry_window_ms: 30_000,
                max_model_switches_per_request: 2,
            },
            shadow_mode: false,
        }
    }

    /// Every tier with models, every rule's target, and `defaultModel` must
    /// name a model in the catalog; an empty `tiers` list is allowed (the
    /// router then falls back to `defaultModel` unconditionally).
    pub fn validate(&self, catalog: &ModelCatalog) -> Result<(), String> {
        if catalog.get(&self.default_model).is_none() {
            return Err(format!("defaultModel '{}' is not a known model", self.default_model));
        }
        for tier in &self.tiers {
            for model in &tier.models {
                if catalog.get(model).is_none() {
                    return Err(format!("tier '{}' names unknown model '{}'", tier.tier, model));
                }
            }
        }
        for rule in &self.rules {
            if catalog.get(&rule.target_model).is_none() {
                return Err(format!(
                    "rule '{}' targets unknown model '{}'",
                    rule.name, rule.target_model
                ));
            }
        }
        Ok(())
    }
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Owns the single persisted `RoutingConfig`; every write goes through
/// `put`, which validates, normalizes (re-serializes with a stable field
/// order via `serde_json`), and persists atomically only if the content
/// actually changed.
pub struct RoutingConfigStore {
    path: PathBuf,
    catalog: Arc<ModelCatalog>,
    config: RwLock<RoutingConfig>,
    last_hash: RwLock<Option<String>>,
}

impl RoutingConfigStore {
    pub async fn load_or_default(path: PathBuf, catalog: Arc<ModelCatalog>) -> Arc<Self> {
        let initial = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<RoutingConfig>(&contents) {
                Ok(cfg) => {
                    if cfg.version > SCHEMA_VERSION {
                        tracing::warn!(
                            found = cfg.version,
                            known = SCHEMA_VERSION,
                            "routing config schema newer than this build; using it as-is"
                        );
                    }
                    cfg
                }
                Err(e) => {
                    tracing::warn!("failed to parse routing config {}: {}", path.display(), e);
                    RoutingConfig::default_for(&catalog)
                }
            },
            Err(_) => RoutingConfig::default_for(&catalog),
        };

        let hash = content_hash(serde_json::to_vec(&initial).unwrap_or_default().as_slice());
        Arc::new(Self {
            path,
            catalog,
            config: RwLock::new(initial),
            last_hash: RwLock::new(Some(hash)),
        })
    }

    pub async fn get(&self) -> RoutingConfig {
        self.config.read().await.clone()
    }

    /// Validates, then persists only if the normalized content hash
    /// differs from what's on disk — a PUT that resubmits the current
    /// config is a no-op write.
    pub async fn put(&self, mut new_config: RoutingConfig) -> Result<RoutingConfig, String> {
        new_config.version = SCHEMA_VERSION;
        new_config.validate(&self.catalog)?;

        let serialized = serde_json::to_vec_pretty(&new_config).map_err(|e| e.to_string())?;
        let hash = content_hash(&serialized);

        let unchanged = self.last_hash.read().await.as_deref() == Some(hash.as_str());
        if !unchanged {
            self.persist_atomic(&serialized).await.map_err(|e| e.to_string())?;
            *self.last_hash.write().await = Some(hash);
        }

        *self.config.write().await = new_config.clone();
        Ok(new_config)
    }

    pub async fn reset(&self) -> RoutingConfig {
        let defaults = RoutingConfig::default_for(&self.catalog);
        self.put(defaults).await.expect("default config always validates")
    }

    async fn persist_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if tokio::fs::metadata(&self.path).await.is_ok() {
            let bak_path = self.path.with_extension("json.bak");
            let _ = tokio::fs::copy(&self.path, &bak_path).await;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Arc<ModelCatalog> {
        Arc::new(crate::models::ModelCatalog::load(None))
    }

    #[tokio::test]
    async fn default_config_validates_against_its_own_catalog() {
        let catalog = catalog();
        let config = RoutingConfig::default_for(&catalog);
        assert!(config.validate(&catalog).is_ok());
    }

    #[tokio::test]
    async fn put_rejects_unknown_default_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = RoutingConfigStore::load_or_default(dir.path().join("routing.json"), catalog()).await;
        let mut bad = store.get().await;
        bad.default_model = "not-a-real-model".to_string();
        let result = store.put(bad).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn put_persists_atomically_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.json");
        let store = RoutingConfigStore::load_or_default(path.clone(), catalog()).await;

        let mut updated = store.get().await;
        updated.enabled = false;
        store.put(updated).await.unwrap();

        let reloaded = RoutingConfigStore::load_or_default(path, catalog()).await;
        assert!(!reloaded.get().await.enabled);
    }

    #[tokio::test]
    async fn identical_put_does_not_rewrite_unnecessarily() {
        let dir = tempfile::tempdir().unwrap();
        let store = RoutingConfigStore::load_or_default(dir.path().join("routing.json"), catalog()).await;
        let current = store.get().await;
        store.put(current.clone()).await.unwrap();
        let after = store.get().await;
        assert_eq!(current.version, after.version);
    }
}
