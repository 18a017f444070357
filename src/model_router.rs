//! Per-request model selection: tier classification, per-model cooldowns,
//! per-model concurrency gates, and the burst-dampening policy.
//!
//! There is a single upstream provider, so routing reduces to picking a
//! candidate model within a tier, filtered by per-model cooldown and
//! concurrency state, with a fallback order across tiers when the
//! preferred one is exhausted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::models::{ModelCatalog, ModelTier};
use crate::routing_config::RoutingRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingSource {
    Override,
    Rule,
    Classifier,
    Default,
    Failover,
    Pool,
}

#[derive(Debug, Clone)]
pub struct RoutingFeatures {
    pub message_count: usize,
    pub has_tools: bool,
    pub has_vision: bool,
    pub system_length: usize,
    pub client_model: String,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub target_model: String,
    pub tier: ModelTier,
    pub source: RoutingSource,
    pub failover_model: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ClassifierThresholds {
    pub heavy_min_messages: usize,
    pub heavy_min_system_length: usize,
    pub light_max_messages: usize,
    pub light_max_system_length: usize,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            heavy_min_messages: 12,
            heavy_min_system_length: 4_000,
            light_max_messages: 2,
            light_max_system_length: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRouterConfig {
    pub default_model: String,
    pub classifier: ClassifierThresholds,
    pub rules: Vec<RoutingRule>,
    pub burst_dampening_factor: f64,
    pub burst_dampening_window_limit: u32,
    pub retry_delay_floor_ms: u64,
}

struct ModelState {
    in_flight: usize,
    max_concurrency: usize,
    cooldown_until: Option<Instant>,
    burst_dampened: bool,
    rolling_429_count: u32,
    last_429_at: Option<Instant>,
}

pub struct AdmissionHoldPeek {
    pub tier: ModelTier,
    pub candidates: Vec<String>,
    pub min_cooldown_ms: u64,
    pub all_cooled: bool,
}

pub struct ModelAtCapacity;

pub struct ModelRouter {
    catalog: Arc<ModelCatalog>,
    state: RwLock<HashMap<String, ModelState>>,
    overrides: RwLock<HashMap<String, String>>,
    config: RwLock<ModelRouterConfig>,
}

impl ModelRouter {
    pub fn new(catalog: Arc<ModelCatalog>, config: ModelRouterConfig) -> Self {
        let mut state = HashMap::new();
        for model in catalog.all() {
            state.insert(
                model.id.clone(),
                ModelState {
                    in_flight: 0,
                    max_concurrency: model.max_concurrency,
                    cooldown_until: None,
                    burst_dampened: false,
                    rolling_429_count: 0,
                    last_429_at: None,
                },
            );
        }

        Self {
            catalog,
            state: RwLock::new(state),
            overrides: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
        }
    }

    /// Replaces the live default model, classifier thresholds, and rule set
    /// with a newly persisted routing config, so `PUT /model-routing` takes
    /// effect on the next selection rather than only after a restart.
    pub async fn update_config(
        &self,
        default_model: String,
        classifier: ClassifierThresholds,
        rules: Vec<RoutingRule>,
        retry_delay_floor_ms: u64,
    ) {
        let mut config = self.config.write().await;
        config.default_model = default_model;
        config.classifier = classifier;
        config.rules = rules;
        config.retry_delay_floor_ms = retry_delay_floor_ms;
    }

    async fn classify(&self, features: &RoutingFeatures) -> ModelTier {
        let c = self.config.read().await;
        let c = &c.classifier;
        if features.has_vision
            || features.has_tools
            || features.message_count >= c.heavy_min_messages
            || features.system_length >= c.heavy_min_system_length
            || features.max_tokens.unwrap_or(0) >= 8_000
        {
            ModelTier::Heavy
        } else if features.message_count <= c.light_max_messages
            && features.system_length <= c.light_max_system_length
        {
            ModelTier::Light
        } else {
            ModelTier::Medium
        }
    }

    fn rule_matches(rule: &RoutingRule, features: &RoutingFeatures) -> bool {
        if let Some(substr) = &rule.client_model_contains {
            if !features.client_model.contains(substr.as_str()) {
                return false;
            }
        }
        if let Some(min) = rule.min_messages {
            if features.message_count < min {
                return false;
            }
        }
        if let Some(requires_tools) = rule.requires_tools {
            if features.has_tools != requires_tools {
                return false;
            }
        }
        if let Some(requires_vision) = rule.requires_vision {
            if features.has_vision != requires_vision {
                return false;
            }
        }
        true
    }

    async fn is_cooled(&self, model_id: &str, now: Instant) -> bool {
        let state = self.state.read().await;
        match state.get(model_id) {
            Some(s) => s.cooldown_until.map(|d| now >= d).unwrap_or(true),
            None => true,
        }
    }

    async fn candidates_for_tier(&self, tier: ModelTier, exclude: &[String]) -> Vec<String> {
        self.catalog
            .by_tier(tier)
            .into_iter()
            .map(|m| m.id.clone())
            .filter(|id| !exclude.iter().any(|e| e == id))
            .collect()
    }

    /// Order of resolution: per-key override -> rule match -> classifier ->
    /// default model. `attempted_models` excludes previously-tried models;
    /// if the tier's candidate pool is then empty, falls back to the next
    /// less-heavy tier, then to the configured default model.
    pub async fn select_model(
        &self,
        features: &RoutingFeatures,
        override_key: Option<&str>,
        attempted_models: &[String],
    ) -> RoutingDecision {
        if let Some(key) = override_key {
            let overrides = self.overrides.read().await;
            if let Some(model_id) = overrides.get(key) {
                if !attempted_models.iter().any(|m| m == model_id) {
                    if let Some(model) = self.catalog.get(model_id) {
                        return RoutingDecision {
                            target_model: model.id.clone(),
                            tier: model.tier,
                            source: RoutingSource::Override,
                            failover_model: None,
                            reason: "per-key override".to_string(),
                        };
                    }
                }
            }
        }

        {
            let rules = self.config.read().await.rules.clone();
            for rule in &rules {
                if attempted_models.iter().any(|m| m == &rule.target_model) {
                    continue;
                }
                if Self::rule_matches(rule, features) {
                    if let Some(model) = self.catalog.get(&rule.target_model) {
                        return RoutingDecision {
                            target_model: model.id.clone(),
                            tier: model.tier,
                            source: RoutingSource::Rule,
                            failover_model: None,
                            reason: format!("rule '{}' matched", rule.name),
                        };
                    }
                }
            }
        }

        let tier = self.classify(features).await;
        let now = Instant::now();

        for candidate_tier in self.tier_fallback_order(tier) {
            let candidates = self.candidates_for_tier(candidate_tier, attempted_models).await;
            let mut best: Option<(&str, bool)> = None;
            for id in &candidates {
                let cooled = self.is_cooled(id, now).await;
                if cooled {
                    best = Some((id, true));
                    break;
                }
                if best.is_none() {
                    best = Some((id, false));
                }
            }
            if let Some((id, cooled)) = best {
                return RoutingDecision {
                    target_model: id.to_string(),
                    tier: candidate_tier,
                    source: if candidate_tier == tier {
                        RoutingSource::Classifier
                    } else {
                        RoutingSource::Failover
                    },
                    failover_model: None,
                    reason: if cooled {
                        "classifier selection".to_string()
                    } else {
                        "all tier candidates cooled, selecting least-bad".to_string()
                    },
                };
            }
        }

        RoutingDecision {
            target_model: self.config.read().await.default_model.clone(),
            tier,
            source: RoutingSource::Default,
            failover_model: None,
            reason: "no candidates available in any tier, using default".to_string(),
        }
    }

    fn tier_fallback_order(&self, start: ModelTier) -> Vec<ModelTier> {
        match start {
            ModelTier::Heavy => vec![ModelTier::Heavy, ModelTier::Medium, ModelTier::Light],
            ModelTier::Medium => vec![ModelTier::Medium, ModelTier::Light],
            ModelTier::Light => vec![ModelTier::Light, ModelTier::Medium],
            ModelTier::Free => vec![ModelTier::Free, ModelTier::Light],
        }
    }

    /// Inspects the tier the router would currently select and reports
    /// whether every candidate is cooled, for the handler's admission-hold
    /// decision.
    pub async fn peek_admission_hold(&self, features: &RoutingFeatures) -> Option<AdmissionHoldPeek> {
        let tier = self.classify(features).await;
        let now = Instant::now();
        let candidates = self.candidates_for_tier(tier, &[]).await;
        if candidates.is_empty() {
            return None;
        }

        let state = self.state.read().await;
        let mut min_cooldown_ms = u64::MAX;
        let mut all_cooled = true;

        for id in &candidates {
            match state.get(id).and_then(|s| s.cooldown_until) {
                Some(deadline) if deadline > now => {
                    let remaining = deadline.duration_since(now).as_millis() as u64;
                    min_cooldown_ms = min_cooldown_ms.min(remaining);
                }
                _ => {
                    all_cooled = false;
                }
            }
        }

        if min_cooldown_ms == u64::MAX {
            min_cooldown_ms = 0;
        }

        Some(AdmissionHoldPeek {
            tier,
            candidates,
            min_cooldown_ms,
            all_cooled,
        })
    }

    pub async fn acquire_model(&self, model_id: &str) -> Result<(), ModelAtCapacity> {
        let mut state = self.state.write().await;
        let entry = state.entry(model_id.to_string()).or_insert_with(|| ModelState {
            in_flight: 0,
            max_concurrency: 16,
            cooldown_until: None,
            burst_dampened: false,
            rolling_429_count: 0,
            last_429_at: None,
        });

        if entry.in_flight >= entry.max_concurrency {
            return Err(ModelAtCapacity);
        }
        entry.in_flight += 1;
        Ok(())
    }

    pub async fn release_model(&self, model_id: &str) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.get_mut(model_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    /// `cooldownUntil = max(existing, now + cooldownMs)`.
    pub async fn record_model_cooldown(&self, model_id: &str, cooldown_ms: u64, burst_dampened: bool) {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let entry = state.entry(model_id.to_string()).or_insert_with(|| ModelState {
            in_flight: 0,
            max_concurrency: 16,
            cooldown_until: None,
            burst_dampened: false,
            rolling_429_count: 0,
            last_429_at: None,
        });

        let candidate = now + Duration::from_millis(cooldown_ms);
        entry.cooldown_until = Some(match entry.cooldown_until {
            Some(existing) => existing.max(candidate),
            None => candidate,
        });
        entry.burst_dampened = burst_dampened;
    }

    /// Increments the per-model 429 counter used by the classifier and the
    /// burst-dampening policy, returning the updated rolling count.
    pub async fn record_pool_429(&self, model_id: &str) -> u32 {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let entry = state.entry(model_id.to_string()).or_insert_with(|| ModelState {
            in_flight: 0,
            max_concurrency: 16,
            cooldown_until: None,
            burst_dampened: false,
            rolling_429_count: 0,
            last_429_at: None,
        });
        entry.rolling_429_count += 1;
        entry.last_429_at = Some(now);
        entry.rolling_429_count
    }

    /// `n < 3` (transient burst) -> dampened cooldown, never below the
    /// retry-delay floor. `n >= 3` (persistent throttle) -> full cooldown
    /// so the router fails over on the next attempt.
    pub async fn burst_dampened_cooldown(&self, model_id: &str, full_cooldown_ms: u64) -> (u64, bool) {
        let state = self.state.read().await;
        let n = state.get(model_id).map(|s| s.rolling_429_count).unwrap_or(0);
        let config = self.config.read().await;
        if n < config.burst_dampening_window_limit {
            let dampened = (full_cooldown_ms as f64 * config.burst_dampening_factor) as u64;
            (dampened.max(config.retry_delay_floor_ms), true)
        } else {
            (full_cooldown_ms, false)
        }
    }

    pub async fn set_override(&self, key: String, model_id: String) {
        self.overrides.write().await.insert(key, model_id);
    }

    pub async fn clear_override(&self, key: &str) {
        self.overrides.write().await.remove(key);
    }

    pub async fn overrides_snapshot(&self) -> HashMap<String, String> {
        self.overrides.read().await.clone()
    }

    pub async fn reset_cooldowns(&self) {
        let mut state = self.state.write().await;
        for entry in state.values_mut() {
            entry.cooldown_until = None;
            entry.burst_dampened = false;
            entry.rolling_429_count = 0;
        }
        self.overrides.write().await.clear();
    }

    /// Same shape as the SSE `pool-status` payload: per-tier arrays of
    /// `{model, inFlight, maxConcurrency, available, cooldownMs}`.
    pub async fn pool_snapshot(&self) -> HashMap<String, Vec<ModelPoolEntry>> {
        let now = Instant::now();
        let state = self.state.read().await;
        let mut out: HashMap<String, Vec<ModelPoolEntry>> = HashMap::new();

        for model in self.catalog.all() {
            let s = state.get(&model.id);
            let cooldown_ms = s
                .and_then(|s| s.cooldown_until)
                .map(|d| d.saturating_duration_since(now).as_millis() as u64)
                .unwrap_or(0);
            let in_flight = s.map(|s| s.in_flight).unwrap_or(0);
            let max_concurrency = s.map(|s| s.max_concurrency).unwrap_or(model.max_concurrency);

            out.entry(model.tier.id().to_string())
                .or_default()
                .push(ModelPoolEntry {
                    model: model.id.clone(),
                    in_flight,
                    max_concurrency,
                    available: cooldown_ms == 0 && in_flight < max_concurrency,
                    cooldown_ms,
                });
        }

        out
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelPoolEntry {
    pub model: String,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub available: bool,
    pub cooldown_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Model, ModelPricing};

    fn catalog() -> Arc<ModelCatalog> {
        Arc::new(ModelCatalog::from_models(vec![
            Model {
                id: "heavy-a".to_string(),
                tier: ModelTier::Heavy,
                context_length: 100_000,
                supports_vision: true,
                max_concurrency: 4,
                pricing: ModelPricing { input_per_1m: 1.0, output_per_1m: 1.0 },
            },
            Model {
                id: "heavy-b".to_string(),
                tier: ModelTier::Heavy,
                context_length: 100_000,
                supports_vision: true,
                max_concurrency: 4,
                pricing: ModelPricing { input_per_1m: 1.0, output_per_1m: 1.0 },
            },
            Model {
                id: "light-a".to_string(),
                tier: ModelTier::Light,
                context_length: 32_000,
                supports_vision: false,
                max_concurrency: 8,
                pricing: ModelPricing { input_per_1m: 0.1, output_per_1m: 0.1 },
            },
        ]))
    }

    fn router() -> ModelRouter {
        ModelRouter::new(
            catalog(),
            ModelRouterConfig {
                default_model: "heavy-a".to_string(),
                classifier: ClassifierThresholds::default(),
                rules: Vec::new(),
                burst_dampening_factor: 0.5,
                burst_dampening_window_limit: 3,
                retry_delay_floor_ms: 500,
            },
        )
    }

    fn heavy_features() -> RoutingFeatures {
        RoutingFeatures {
            message_count: 20,
            has_tools: true,
            has_vision: false,
            system_length: 5_000,
            client_model: "claude-sonnet-4-5".to_string(),
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn selects_heavy_tier_for_heavy_features() {
        let r = router();
        let decision = r.select_model(&heavy_features(), None, &[]).await;
        assert_eq!(decision.tier, ModelTier::Heavy);
    }

    #[tokio::test]
    async fn excludes_attempted_models_on_retry() {
        let r = router();
        let first = r.select_model(&heavy_features(), None, &[]).await;
        let second = r
            .select_model(&heavy_features(), None, &[first.target_model.clone()])
            .await;
        assert_ne!(first.target_model, second.target_model);
    }

    #[tokio::test]
    async fn falls_back_to_lighter_tier_when_heavy_exhausted() {
        let r = router();
        let attempted = vec!["heavy-a".to_string(), "heavy-b".to_string()];
        let decision = r.select_model(&heavy_features(), None, &attempted).await;
        assert_eq!(decision.tier, ModelTier::Light);
        assert_eq!(decision.source, RoutingSource::Failover);
    }

    #[tokio::test]
    async fn acquire_model_respects_max_concurrency() {
        let r = router();
        for _ in 0..4 {
            assert!(r.acquire_model("heavy-a").await.is_ok());
        }
        assert!(r.acquire_model("heavy-a").await.is_err());
        r.release_model("heavy-a").await;
        assert!(r.acquire_model("heavy-a").await.is_ok());
    }

    #[tokio::test]
    async fn burst_dampening_applies_below_window_limit() {
        let r = router();
        r.record_pool_429("heavy-a").await;
        let (cooldown, dampened) = r.burst_dampened_cooldown("heavy-a", 10_000).await;
        assert!(dampened);
        assert!(cooldown <= 10_000);
        assert!(cooldown >= 500);
    }

    #[tokio::test]
    async fn burst_dampening_uses_full_cooldown_past_window_limit() {
        let r = router();
        for _ in 0..3 {
            r.record_pool_429("heavy-a").await;
        }
        let (cooldown, dampened) = r.burst_dampened_cooldown("heavy-a", 10_000).await;
        assert!(!dampened);
        assert_eq!(cooldown, 10_000);
    }

    #[tokio::test]
    async fn override_wins_over_classifier() {
        let r = router();
        r.set_override("tenant-1".to_string(), "light-a".to_string()).await;
        let decision = r
            .select_model(&heavy_features(), Some("tenant-1"), &[])
            .await;
        assert_eq!(decision.target_model, "light-a");
        assert_eq!(decision.source, RoutingSource::Override);
    }

    #[tokio::test]
    async fn rule_match_wins_over_classifier_but_loses_to_override() {
        let r = router();
        r.update_config(
            "heavy-a".to_string(),
            ClassifierThresholds::default(),
            vec![RoutingRule {
                name: "force-light".to_string(),
                client_model_contains: None,
                min_messages: None,
                requires_tools: None,
                requires_vision: None,
                target_model: "light-a".to_string(),
            }],
            500,
        )
        .await;

        let decision = r.select_model(&heavy_features(), None, &[]).await;
        assert_eq!(decision.target_model, "light-a");
        assert_eq!(decision.source, RoutingSource::Rule);

        r.set_override("tenant-1".to_string(), "heavy-b".to_string()).await;
        let overridden = r.select_model(&heavy_features(), Some("tenant-1"), &[]).await;
        assert_eq!(overridden.target_model, "heavy-b");
        assert_eq!(overridden.source, RoutingSource::Override);
    }

    #[tokio::test]
    async fn rule_is_skipped_when_its_feature_condition_does_not_match() {
        let r = router();
        r.update_config(
            "heavy-a".to_string(),
            ClassifierThresholds::default(),
            vec![RoutingRule {
                name: "vision-only".to_string(),
                client_model_contains: None,
                min_messages: None,
                requires_tools: None,
                requires_vision: Some(true),
                target_model: "light-a".to_string(),
            }],
            500,
        )
        .await;

        let decision = r.select_model(&heavy_features(), None, &[]).await;
        assert_ne!(decision.target_model, "light-a");
        assert_eq!(decision.source, RoutingSource::Classifier);
    }

    #[tokio::test]
    async fn peek_admission_hold_reports_available_when_one_candidate_is_free() {
        let r = router();
        // heavy-a cools down, heavy-b stays free: the tier is not fully cooled.
        r.record_model_cooldown("heavy-a", 10_000, false).await;
        let peek = r.peek_admission_hold(&heavy_features()).await.unwrap();
        assert_eq!(peek.tier, ModelTier::Heavy);
        assert!(!peek.all_cooled);
    }

    #[tokio::test]
    async fn peek_admission_hold_reports_all_cooled_when_every_candidate_cools() {
        let r = router();
        r.record_model_cooldown("heavy-a", 10_000, false).await;
        r.record_model_cooldown("heavy-b", 5_000, false).await;
        let peek = r.peek_admission_hold(&heavy_features()).await.unwrap();
        assert!(peek.all_cooled);
        assert!(peek.min_cooldown_ms > 0 && peek.min_cooldown_ms <= 5_000);
    }
}
