//! Configuration loading.
//!
//! Scalar options come from environment variables (`Config::from_env`). The
//! handful of nested, operator-tuned knobs (`poolCooldown`, `admissionHold`,
//! `modelRouting.failover`, `budget`) are awkward to flatten into env vars,
//! so they additionally load from an optional YAML file at
//! `ZAI_GATEWAY_CONFIG`, falling back to the defaults below when the file
//! is absent.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::ModelTier;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    FileParse {
        path: String,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone)]
pub struct PoolCooldownConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub decay_ms: u64,
    pub sleep_threshold_ms: u64,
    pub retry_jitter_ms: u64,
    pub max_cooldown_ms: u64,
}

impl Default for PoolCooldownConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 60_000,
            decay_ms: 120_000,
            sleep_threshold_ms: 2_000,
            retry_jitter_ms: 250,
            max_cooldown_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionHoldConfig {
    pub enabled: bool,
    pub tiers: Vec<ModelTier>,
    pub max_hold_ms: u64,
    pub max_concurrent_holds: usize,
    pub jitter_ms: u64,
    pub min_cooldown_to_hold_ms: u64,
}

impl Default for AdmissionHoldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tiers: vec![ModelTier::Heavy, ModelTier::Medium],
            max_hold_ms: 500,
            max_concurrent_holds: 8,
            jitter_ms: 50,
            min_cooldown_to_hold_ms: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub max_429_attempts_per_request: u32,
    pub max_429_retry_window_ms: u64,
    pub max_model_switches_per_request: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_429_attempts_per_request: 3,
            max_429_retry_window_ms: 30_000,
            max_model_switches_per_request: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub daily_cents: Option<u64>,
    pub monthly_cents: Option<u64>,
    pub alert_thresholds: Vec<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_cents: None,
            monthly_cents: None,
            alert_thresholds: vec![0.5, 0.8, 0.95, 1.0],
        }
    }
}

/// Partial config loaded from the optional YAML file; every field is
/// optional so an operator only needs to override what they care about.
#[derive(Debug, Default, serde::Deserialize)]
struct FileConfig {
    #[serde(default)]
    pool_cooldown: Option<FilePoolCooldown>,
    #[serde(default)]
    admission_hold: Option<FileAdmissionHold>,
    #[serde(default)]
    failover: Option<FileFailover>,
    #[serde(default)]
    budget: Option<FileBudget>,
    #[serde(default)]
    models_override_path: Option<PathBuf>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct FilePoolCooldown {
    base_ms: Option<u64>,
    cap_ms: Option<u64>,
    decay_ms: Option<u64>,
    sleep_threshold_ms: Option<u64>,
    retry_jitter_ms: Option<u64>,
    max_cooldown_ms: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct FileAdmissionHold {
    enabled: Option<bool>,
    tiers: Option<Vec<String>>,
    max_hold_ms: Option<u64>,
    max_concurrent_holds: Option<usize>,
    jitter_ms: Option<u64>,
    min_cooldown_to_hold_ms: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct FileFailover {
    max_429_attempts_per_request: Option<u32>,
    max_429_retry_window_ms: Option<u64>,
    max_model_switches_per_request: Option<u32>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct FileBudget {
    daily_cents: Option<u64>,
    monthly_cents: Option<u64>,
    alert_thresholds: Option<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Bearer token required on admin/write endpoints. `None` disables the check.
    pub proxy_secret: Option<String>,

    /// Raw z.ai API keys making up the credential pool.
    pub zai_api_keys: Vec<String>,
    pub zai_base_url: String,

    pub max_retries: u32,
    pub request_timeout_ms: u64,
    pub max_total_concurrency: usize,
    pub max_concurrent_upstream: usize,
    pub max_concurrency_per_key: usize,

    pub queue_size: usize,
    pub queue_timeout_ms: u64,

    pub pool_cooldown: PoolCooldownConfig,
    pub admission_hold: AdmissionHoldConfig,
    pub failover: FailoverConfig,
    pub budget: BudgetConfig,

    pub save_debounce_ms: u64,
    pub slow_save_threshold_ms: u64,

    pub models_override_path: Option<PathBuf>,
    pub working_dir: PathBuf,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            field: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn parse_tier(name: &str, value: &str) -> Result<ModelTier, ConfigError> {
    ModelTier::from_id(value).ok_or_else(|| ConfigError::InvalidValue {
        field: name.to_string(),
        value: value.to_string(),
    })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let working_dir = std::env::var("ZAI_GATEWAY_WORKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let zai_api_keys: Vec<String> = std::env::var("ZAI_API_KEYS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let mut config = Config {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8787u16)?,
            proxy_secret: std::env::var("PROXY_SECRET").ok(),
            zai_api_keys,
            zai_base_url: std::env::var("ZAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.z.ai/api/coding/paas/v4".to_string()),
            max_retries: env_parse("MAX_RETRIES", 3u32)?,
            request_timeout_ms: env_parse("REQUEST_TIMEOUT_MS", 300_000u64)?,
            max_total_concurrency: env_parse("MAX_TOTAL_CONCURRENCY", 256usize)?,
            max_concurrent_upstream: env_parse("MAX_CONCURRENT_UPSTREAM", 64usize)?,
            max_concurrency_per_key: env_parse("MAX_CONCURRENCY_PER_KEY", 16usize)?,
            queue_size: env_parse("QUEUE_SIZE", 128usize)?,
            queue_timeout_ms: env_parse("QUEUE_TIMEOUT_MS", 5_000u64)?,
            pool_cooldown: PoolCooldownConfig::default(),
            admission_hold: AdmissionHoldConfig::default(),
            failover: FailoverConfig::default(),
            budget: BudgetConfig::default(),
            save_debounce_ms: env_parse("SAVE_DEBOUNCE_MS", 5_000u64)?,
            slow_save_threshold_ms: env_parse("SLOW_SAVE_THRESHOLD_MS", 250u64)?,
            models_override_path: std::env::var("MODELS_OVERRIDE_PATH").ok().map(PathBuf::from),
            working_dir,
        };

        if let Ok(path) = std::env::var("ZAI_GATEWAY_CONFIG") {
            config.apply_file(&path)?;
        }

        Ok(config)
    }

    fn apply_file(&mut self, path: &str) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_string(),
            source: e,
        })?;
        let file: FileConfig =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::FileParse {
                path: path.to_string(),
                source: e,
            })?;

        if let Some(pc) = file.pool_cooldown {
            let d = PoolCooldownConfig::default();
            self.pool_cooldown = PoolCooldownConfig {
                base_ms: pc.base_ms.unwrap_or(d.base_ms),
                cap_ms: pc.cap_ms.unwrap_or(d.cap_ms),
                decay_ms: pc.decay_ms.unwrap_or(d.decay_ms),
                sleep_threshold_ms: pc.sleep_threshold_ms.unwrap_or(d.sleep_threshold_ms),
                retry_jitter_ms: pc.retry_jitter_ms.unwrap_or(d.retry_jitter_ms),
                max_cooldown_ms: pc.max_cooldown_ms.unwrap_or(d.max_cooldown_ms),
            };
        }

        if let Some(ah) = file.admission_hold {
            let d = AdmissionHoldConfig::default();
            let tiers = match ah.tiers {
                Some(names) => names
                    .iter()
                    .map(|n| parse_tier("admissionHold.tiers", n))
                    .collect::<Result<Vec<_>, _>>()?,
                None => d.tiers.clone(),
            };
            self.admission_hold = AdmissionHoldConfig {
                enabled: ah.enabled.unwrap_or(d.enabled),
                tiers,
                max_hold_ms: ah.max_hold_ms.unwrap_or(d.max_hold_ms),
                max_concurrent_holds: ah.max_concurrent_holds.unwrap_or(d.max_concurrent_holds),
                jitter_ms: ah.jitter_ms.unwrap_or(d.jitter_ms),
                min_cooldown_to_hold_ms: ah
                    .min_cooldown_to_hold_ms
                    .unwrap_or(d.min_cooldown_to_hold_ms),
            };
        }

        if let Some(fo) = file.failover {
            let d = FailoverConfig::default();
            self.failover = FailoverConfig {
                max_429_attempts_per_request: fo
                    .max_429_attempts_per_request
                    .unwrap_or(d.max_429_attempts_per_request),
                max_429_retry_window_ms: fo
                    .max_429_retry_window_ms
                    .unwrap_or(d.max_429_retry_window_ms),
                max_model_switches_per_request: fo
                    .max_model_switches_per_request
                    .unwrap_or(d.max_model_switches_per_request),
            };
        }

        if let Some(b) = file.budget {
            let d = BudgetConfig::default();
            self.budget = BudgetConfig {
                daily_cents: b.daily_cents.or(d.daily_cents),
                monthly_cents: b.monthly_cents.or(d.monthly_cents),
                alert_thresholds: b.alert_thresholds.unwrap_or(d.alert_thresholds),
            };
        }

        if let Some(p) = file.models_override_path {
            self.models_override_path = Some(p);
        }

        Ok(())
    }

    pub fn cost_state_path(&self) -> PathBuf {
        self.working_dir.join("cost_state.json")
    }

    pub fn routing_state_path(&self) -> PathBuf {
        self.working_dir.join("model_routing.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_cooldown_defaults_are_sane() {
        let d = PoolCooldownConfig::default();
        assert!(d.base_ms < d.cap_ms);
        assert!(d.sleep_threshold_ms < d.cap_ms);
    }

    #[test]
    fn budget_default_thresholds_are_ascending() {
        let d = BudgetConfig::default();
        let mut sorted = d.alert_thresholds.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(d.alert_thresholds, sorted);
    }

    #[test]
    fn env_parse_falls_back_to_default_when_unset() {
        std::env::remove_var("ZAI_GATEWAY_TEST_VALUE");
        let v: u32 = env_parse("ZAI_GATEWAY_TEST_VALUE", 42).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn env_parse_rejects_invalid_value() {
        std::env::set_var("ZAI_GATEWAY_TEST_BAD", "not-a-number");
        let result: Result<u32, ConfigError> = env_parse("ZAI_GATEWAY_TEST_BAD", 1);
        assert!(result.is_err());
        std::env::remove_var("ZAI_GATEWAY_TEST_BAD");
    }
}
