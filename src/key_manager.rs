//! Credential pool: circuit breakers, health scoring, per-key concurrency,
//! and pool-wide rate-limit tracking.
//!
//! Each credential circuit-breaks independently (closed/open/half-open) on
//! its own failure history, while the pool as a whole also tracks a rolling
//! count of 429s so it can back off as a unit when every key starts getting
//! rate-limited at once rather than just one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

const LATENCY_SAMPLE_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Success { latency_ms: u64 },
    Failure { latency_ms: u64 },
    RateLimited { retry_after_ms: Option<u64> },
}

#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    pub max_concurrency_per_key: usize,
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown_period: Duration,
    pub slow_key_latency_ms: u64,
    pub slow_key_relative_multiple: f64,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrency_per_key: 16,
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown_period: Duration::from_secs(30),
            slow_key_latency_ms: 8_000,
            slow_key_relative_multiple: 3.0,
        }
    }
}

/// One credential in the pool. The raw secret is never exposed via `Debug`
/// or any getter beyond `secret()`, which the upstream client calls
/// directly to build the Authorization header.
pub struct Credential {
    pub id: String,
    pub index: usize,
    secret: String,
    circuit: CircuitState,
    opened_at: Option<Instant>,
    recent_failures: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
    pub in_flight: usize,
    latency_samples: VecDeque<u64>,
    total_requests: u64,
    total_successes: u64,
    last_error_at: Option<Instant>,
    rate_limit_count: u32,
    rate_limit_last_hit: Option<Instant>,
    was_slow: bool,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("circuit", &self.circuit)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl Credential {
    fn new(index: usize, secret: String) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        let digest = hasher.finalize();
        let id = hex::encode(&digest[..8]);

        Self {
            id,
            index,
            secret,
            circuit: CircuitState::Closed,
            opened_at: None,
            recent_failures: VecDeque::new(),
            cooldown_until: None,
            in_flight: 0,
            latency_samples: VecDeque::new(),
            total_requests: 0,
            total_successes: 0,
            last_error_at: None,
            rate_limit_count: 0,
            rate_limit_last_hit: None,
            was_slow: false,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    fn is_usable(&self, now: Instant) -> bool {
        match self.circuit {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self
                .cooldown_until
                .map(|deadline| now >= deadline)
                .unwrap_or(true),
        }
    }

    fn p95_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).floor() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_requests as f64
    }

    /// `score = latencyComponent(40) + successComponent(40) + recencyComponent(20)`.
    pub fn health_score(&self, now: Instant) -> u8 {
        let p95 = self.p95_latency_ms() as f64;
        let latency_component = 40.0 * (1.0 - (p95 / 10_000.0).min(1.0));

        let success_component = 40.0 * self.success_rate();

        let recency_component = match self.last_error_at {
            None => 20.0,
            Some(at) => {
                let age_ms = now.duration_since(at).as_millis() as f64;
                20.0 * (age_ms / 300_000.0).min(1.0)
            }
        };

        (latency_component + success_component + recency_component)
            .clamp(0.0, 100.0) as u8
    }

    pub fn snapshot(&self, now: Instant) -> CredentialSnapshot {
        CredentialSnapshot {
            id: self.id.clone(),
            index: self.index,
            circuit: self.circuit,
            in_flight: self.in_flight,
            health_score: self.health_score(now),
            total_requests: self.total_requests,
            total_successes: self.total_successes,
            is_slow: self.was_slow,
            rate_limit_count: self.rate_limit_count,
            rate_limit_last_hit_ms_ago: self
                .rate_limit_last_hit
                .map(|at| now.duration_since(at).as_millis() as u64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialSnapshot {
    pub id: String,
    pub index: usize,
    pub circuit: CircuitState,
    pub in_flight: usize,
    pub health_score: u8,
    pub total_requests: u64,
    pub total_successes: u64,
    pub is_slow: bool,
    pub rate_limit_count: u32,
    pub rate_limit_last_hit_ms_ago: Option<u64>,
}

/// Handle returned by `acquire_key`; `release` must be called exactly once
/// for every successful `acquire_key`.
#[derive(Debug, Clone, Copy)]
pub struct CredentialHandle {
    pub index: usize,
    pub acquired_at: Instant,
}

#[derive(Debug, Default)]
struct Pool429State {
    count: u32,
    last_hit: Option<Instant>,
}

pub struct PoolRateLimitHit {
    pub model: String,
    pub retry_after_ms: Option<u64>,
    pub base_ms: u64,
    pub cap_ms: u64,
    pub decay_ms: u64,
}

pub struct PoolRateLimitOutcome {
    pub pool_429_count: u32,
    pub cooldown_ms: u64,
}

pub struct AccountLevelEvidence {
    pub quota_header_present: bool,
    pub body_mentions_quota: bool,
}

pub struct KeyManager {
    credentials: Arc<RwLock<Vec<Credential>>>,
    round_robin: AtomicUsize,
    pool_429: Arc<RwLock<Pool429State>>,
    pool_cooldown_until: Arc<RwLock<Option<Instant>>>,
    config: KeyManagerConfig,
}

impl KeyManager {
    pub fn new(secrets: Vec<String>, config: KeyManagerConfig) -> Self {
        let credentials = secrets
            .into_iter()
            .enumerate()
            .map(|(i, secret)| Credential::new(i, secret))
            .collect();

        Self {
            credentials: Arc::new(RwLock::new(credentials)),
            round_robin: AtomicUsize::new(0),
            pool_429: Arc::new(RwLock::new(Pool429State::default())),
            pool_cooldown_until: Arc::new(RwLock::new(None)),
            config,
        }
    }

    /// Selects the healthiest usable credential (round robin to break ties),
    /// increments its in-flight count, and returns a handle. Returns `None`
    /// if no credential currently has a closed/half-open circuit and spare
    /// capacity — the caller may queue.
    pub async fn acquire_key(&self) -> Option<CredentialHandle> {
        let now = Instant::now();
        let mut credentials = self.credentials.write().await;
        if credentials.is_empty() {
            return None;
        }

        let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % credentials.len();
        let mut best: Option<(usize, u8)> = None;

        for offset in 0..credentials.len() {
            let idx = (start + offset) % credentials.len();
            let cred = &credentials[idx];
            if !cred.is_usable(now) || cred.in_flight >= self.config.max_concurrency_per_key {
                continue;
            }
            let score = cred.health_score(now);
            if best.map(|(_, best_score)| score > best_score).unwrap_or(true) {
                best = Some((idx, score));
            }
        }

        let (idx, _) = best?;
        let cred = &mut credentials[idx];
        if cred.circuit == CircuitState::Open {
            // cooldown deadline has passed; admit exactly one probe
            cred.circuit = CircuitState::HalfOpen;
        }
        cred.in_flight += 1;
        cred.total_requests += 1;

        Some(CredentialHandle {
            index: idx,
            acquired_at: now,
        })
    }

    pub async fn release(&self, handle: CredentialHandle, outcome: Outcome) {
        let now = Instant::now();
        let mut credentials = self.credentials.write().await;
        let Some(cred) = credentials.get_mut(handle.index) else {
            return;
        };

        cred.in_flight = cred.in_flight.saturating_sub(1);

        match outcome {
            Outcome::Success { latency_ms } => {
                cred.total_successes += 1;
                cred.recent_failures.clear();
                cred.record_latency(latency_ms, &self.config);
                if cred.circuit == CircuitState::HalfOpen {
                    cred.circuit = CircuitState::Closed;
                    cred.cooldown_until = None;
                    tracing::info!(key = %cred.id, "circuit breaker closed after successful probe");
                }
            }
            Outcome::Failure { latency_ms } => {
                cred.record_latency(latency_ms, &self.config);
                cred.last_error_at = Some(now);
                cred.recent_failures.push_back(now);
                while let Some(&front) = cred.recent_failures.front() {
                    if now.duration_since(front) > self.config.failure_window {
                        cred.recent_failures.pop_front();
                    } else {
                        break;
                    }
                }
                if cred.circuit == CircuitState::HalfOpen
                    || cred.recent_failures.len() as u32 >= self.config.failure_threshold
                {
                    cred.circuit = CircuitState::Open;
                    cred.opened_at = Some(now);
                    cred.cooldown_until = Some(now + self.config.cooldown_period);
                    tracing::warn!(key = %cred.id, failures = cred.recent_failures.len(), "circuit breaker tripped");
                }
            }
            Outcome::RateLimited { retry_after_ms } => {
                cred.rate_limit_count += 1;
                cred.rate_limit_last_hit = Some(now);
                cred.last_error_at = Some(now);
                drop(credentials);
                self.bump_pool_429(retry_after_ms).await;
            }
        }
    }

    async fn bump_pool_429(&self, _retry_after_ms: Option<u64>) {
        let mut pool = self.pool_429.write().await;
        pool.count += 1;
        pool.last_hit = Some(Instant::now());
    }

    /// `cooldownMs = min(baseMs * 2^(count-1), capMs)`; the counter decays
    /// back toward zero over `decayMs` since the last hit.
    pub async fn record_pool_rate_limit_hit(&self, hit: PoolRateLimitHit) -> PoolRateLimitOutcome {
        let now = Instant::now();
        let mut pool = self.pool_429.write().await;

        if let Some(last_hit) = pool.last_hit {
            let elapsed = now.duration_since(last_hit).as_millis() as u64;
            if elapsed > hit.decay_ms && pool.count > 0 {
                pool.count = pool.count.saturating_sub(1);
            }
        }

        pool.count += 1;
        pool.last_hit = Some(now);

        let base = hit.retry_after_ms.unwrap_or(hit.base_ms).max(1);
        let cooldown_ms = base
            .saturating_mul(1u64 << pool.count.saturating_sub(1).min(20))
            .min(hit.cap_ms);

        drop(pool);
        let mut cooldown_until = self.pool_cooldown_until.write().await;
        let deadline = now + Duration::from_millis(cooldown_ms);
        *cooldown_until = Some(
            cooldown_until
                .map(|existing| existing.max(deadline))
                .unwrap_or(deadline),
        );

        tracing::debug!(model = %hit.model, cooldown_ms, "pool-wide rate limit recorded");

        PoolRateLimitOutcome {
            pool_429_count: self.pool_429.read().await.count,
            cooldown_ms,
        }
    }

    /// Heuristic: quota headers or a body shape that names an account-level
    /// limit (rather than a per-request burst) imply a longer, pool-wide
    /// cooldown rather than a per-model one.
    pub fn detect_account_level_rate_limit(
        &self,
        evidence: &AccountLevelEvidence,
    ) -> (bool, u64) {
        if evidence.quota_header_present || evidence.body_mentions_quota {
            (true, 60_000)
        } else {
            (false, 0)
        }
    }

    pub async fn get_pool_cooldown_remaining_ms(&self) -> u64 {
        let cooldown_until = self.pool_cooldown_until.read().await;
        match *cooldown_until {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    deadline.duration_since(now).as_millis() as u64
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    pub async fn snapshot_all(&self) -> Vec<CredentialSnapshot> {
        let now = Instant::now();
        let credentials = self.credentials.read().await;
        credentials.iter().map(|c| c.snapshot(now)).collect()
    }

    pub async fn credential_count(&self) -> usize {
        self.credentials.read().await.len()
    }

    /// Looks up the raw secret for a previously-acquired handle, for the
    /// upstream client to use as the bearer token. Returns `None` only if
    /// the credential vanished from under the handle, which cannot happen
    /// today since the pool is fixed at startup.
    pub async fn secret_for(&self, index: usize) -> Option<String> {
        self.credentials
            .read()
            .await
            .get(index)
            .map(|c| c.secret().to_string())
    }
}

impl Credential {
    fn record_latency(&mut self, latency_ms: u64, config: &KeyManagerConfig) {
        self.latency_samples.push_back(latency_ms);
        while self.latency_samples.len() > LATENCY_SAMPLE_CAP {
            self.latency_samples.pop_front();
        }
        let p95 = self.p95_latency_ms();
        self.was_slow = p95 > config.slow_key_latency_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> KeyManager {
        KeyManager::new(
            vec!["key-a".to_string(), "key-b".to_string()],
            KeyManagerConfig::default(),
        )
    }

    #[tokio::test]
    async fn acquire_increments_in_flight_and_release_decrements() {
        let km = manager();
        let handle = km.acquire_key().await.expect("a credential should be available");
        {
            let credentials = km.credentials.read().await;
            assert_eq!(credentials[handle.index].in_flight, 1);
        }
        km.release(handle, Outcome::Success { latency_ms: 100 }).await;
        let credentials = km.credentials.read().await;
        assert_eq!(credentials[handle.index].in_flight, 0);
    }

    #[tokio::test]
    async fn circuit_opens_after_failure_threshold() {
        let km = KeyManager::new(
            vec!["only-key".to_string()],
            KeyManagerConfig {
                failure_threshold: 2,
                ..KeyManagerConfig::default()
            },
        );

        for _ in 0..2 {
            let handle = km.acquire_key().await.unwrap();
            km.release(handle, Outcome::Failure { latency_ms: 10 }).await;
        }

        assert!(km.acquire_key().await.is_none());
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_circuit() {
        let km = KeyManager::new(
            vec!["only-key".to_string()],
            KeyManagerConfig {
                failure_threshold: 1,
                cooldown_period: Duration::from_millis(0),
                ..KeyManagerConfig::default()
            },
        );

        let handle = km.acquire_key().await.unwrap();
        km.release(handle, Outcome::Failure { latency_ms: 10 }).await;

        // cooldown already elapsed (zero duration) so circuit should admit a probe
        let handle = km.acquire_key().await.expect("half-open probe should be admitted");
        km.release(handle, Outcome::Success { latency_ms: 10 }).await;

        let credentials = km.credentials.read().await;
        assert_eq!(credentials[0].circuit, CircuitState::Closed);
    }

    #[tokio::test]
    async fn pool_429_cooldown_grows_exponentially_and_caps() {
        let km = manager();
        let hit = || PoolRateLimitHit {
            model: "glm-4.7".to_string(),
            retry_after_ms: None,
            base_ms: 1_000,
            cap_ms: 10_000,
            decay_ms: 120_000,
        };
        let first = km.record_pool_rate_limit_hit(hit()).await;
        let second = km.record_pool_rate_limit_hit(hit()).await;
        assert!(second.cooldown_ms >= first.cooldown_ms);
        assert!(second.cooldown_ms <= 10_000);
    }

    #[tokio::test]
    async fn pool_cooldown_remaining_reflects_recorded_hit() {
        let km = manager();
        km.record_pool_rate_limit_hit(PoolRateLimitHit {
            model: "glm-4.7".to_string(),
            retry_after_ms: Some(5_000),
            base_ms: 1_000,
            cap_ms: 60_000,
            decay_ms: 120_000,
        })
        .await;

        let remaining = km.get_pool_cooldown_remaining_ms().await;
        assert!(remaining > 0);
    }

    #[tokio::test]
    async fn snapshot_surfaces_rate_limit_history() {
        let km = manager();
        let handle = km.acquire_key().await.unwrap();
        km.release(handle, Outcome::RateLimited { retry_after_ms: Some(1_000) }).await;

        let snapshot = km.snapshot_all().await;
        let cred = &snapshot[handle.index];
        assert_eq!(cred.rate_limit_count, 1);
        assert!(cred.rate_limit_last_hit_ms_ago.is_some());
    }

    #[tokio::test]
    async fn no_credential_available_when_all_saturated() {
        let km = KeyManager::new(
            vec!["only-key".to_string()],
            KeyManagerConfig {
                max_concurrency_per_key: 1,
                ..KeyManagerConfig::default()
            },
        );
        let _handle = km.acquire_key().await.unwrap();
        assert!(km.acquire_key().await.is_none());
    }
}
