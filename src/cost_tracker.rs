//! Bounded-memory usage ledger: per-period cost aggregation, per-key/per-tenant
//! LRUs, hourly archive, hourly per-model cost time series, budget alert
//! thresholds, and debounced atomic persistence.
//!
//! Per-key and per-tenant maps are bounded with the `lru` crate rather than
//! growing unbounded HashMaps. Persistence is debounced: updates mark the
//! state dirty and a background task coalesces pending writes into a single
//! temp-file-then-rename save.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::models::ModelCatalog;

const SCHEMA_VERSION: u32 = 1;
const KEY_LRU_CAP: usize = 1000;
const TENANT_LRU_CAP: usize = 1000;
const HOURLY_HISTORY_CAP: usize = 24;
const TIME_SERIES_CAP: usize = 720;
const MAX_ID_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Today,
    ThisWeek,
    ThisMonth,
    AllTime,
}

/// One rolling period aggregate.
///
/// # Invariants
/// - `total_tokens == input_tokens + output_tokens`
/// - monotonically non-decreasing between resets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Aggregate {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub requests: u64,
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
}

impl Aggregate {
    fn record(&mut self, input_tokens: u64, output_tokens: u64, cost: f64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.total_tokens += input_tokens + output_tokens;
        self.cost += cost;
        self.requests += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageResult {
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub total_cost: f64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub key_id: String,
    pub input_tokens: f64,
    pub output_tokens: f64,
    pub model: Option<String>,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Warning,
    Exceeded,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetAlert {
    pub kind: AlertKind,
    pub period: &'static str,
    pub threshold: f64,
    pub percent_used: f64,
    pub current_cost: f64,
    pub budget_limit: f64,
    pub remaining: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct BudgetSettings {
    pub daily: Option<f64>,
    pub monthly: Option<f64>,
    pub alert_thresholds: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyArchiveEntry {
    pub period_key: String,
    pub aggregate: Aggregate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostTimeSeries {
    pub times: Vec<String>,
    pub models: HashMap<String, Vec<f64>>,
}

impl CostTimeSeries {
    fn record(&mut self, bucket: &str, model: &str, cost: f64) {
        let idx = match self.times.iter().position(|t| t == bucket) {
            Some(i) => i,
            None => {
                self.times.push(bucket.to_string());
                for values in self.models.values_mut() {
                    values.push(0.0);
                }
                self.times.len() - 1
            }
        };
        let entry = self
            .models
            .entry(model.to_string())
            .or_insert_with(|| vec![0.0; self.times.len()]);
        if entry.len() < self.times.len() {
            entry.resize(self.times.len(), 0.0);
        }
        entry[idx] += cost;

        if self.times.len() > TIME_SERIES_CAP {
            let drop = self.times.len() - TIME_SERIES_CAP;
            self.times.drain(0..drop);
            for values in self.models.values_mut() {
                if values.len() >= drop {
                    values.drain(0..drop);
                }
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedLruEntry {
    key: String,
    aggregate: Aggregate,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    schema_version: u32,
    usage: PeriodAggregates,
    by_key_id: Vec<PersistedLruEntry>,
    costs_by_tenant: Vec<PersistedLruEntry>,
    hourly_history: Vec<HourlyArchiveEntry>,
    cost_time_series: CostTimeSeries,
    last_reset: LastReset,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PeriodAggregates {
    #[serde(default)]
    today: Aggregate,
    #[serde(default)]
    this_week: Aggregate,
    #[serde(default)]
    this_month: Aggregate,
    #[serde(default)]
    all_time: Aggregate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LastReset {
    day_key: String,
    week_key: String,
    month_key: String,
}

struct CostState {
    usage: PeriodAggregates,
    by_key_id: LruCache<String, Aggregate>,
    costs_by_tenant: LruCache<String, Aggregate>,
    hourly_history: std::collections::VecDeque<HourlyArchiveEntry>,
    cost_time_series: CostTimeSeries,
    last_reset: LastReset,
    fired_daily_alerts: std::collections::HashSet<u32>,
    fired_monthly_alerts: std::collections::HashSet<u32>,
}

fn day_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

fn week_key(ts: DateTime<Utc>) -> String {
    format!("{}-W{:02}", ts.year(), ts.iso_week().week())
}

fn month_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m").to_string()
}

fn hour_bucket(ts: DateTime<Utc>) -> String {
    format!("{} {:02}:00", ts.format("%Y-%m-%d"), ts.hour())
}

fn threshold_key(threshold: f64) -> u32 {
    (threshold * 1000.0).round() as u32
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

fn truncate_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() > MAX_ID_LEN {
        trimmed.chars().take(MAX_ID_LEN).collect()
    } else {
        trimmed.to_string()
    }
}

/// Usage ledger with bounded-memory per-key/per-tenant tracking and a
/// debounced atomic persistence path.
pub struct CostTracker {
    state: RwLock<CostState>,
    budget: RwLock<BudgetSettings>,
    catalog: Arc<ModelCatalog>,
    rate_overrides: RwLock<HashMap<String, (f64, f64)>>,
    path: PathBuf,
    debounce_ms: u64,
    slow_save_threshold_ms: u64,
    save_handle: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    alert_cb: RwLock<Option<Arc<dyn Fn(BudgetAlert) + Send + Sync>>>,
}

impl CostTracker {
    pub fn new(path: PathBuf, catalog: Arc<ModelCatalog>, debounce_ms: u64, slow_save_threshold_ms: u64) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            state: RwLock::new(CostState {
                usage: PeriodAggregates::default(),
                by_key_id: LruCache::new(std::num::NonZeroUsize::new(KEY_LRU_CAP).unwrap()),
                costs_by_tenant: LruCache::new(std::num::NonZeroUsize::new(TENANT_LRU_CAP).unwrap()),
                hourly_history: std::collections::VecDeque::with_capacity(HOURLY_HISTORY_CAP),
                cost_time_series: CostTimeSeries::default(),
                last_reset: LastReset {
                    day_key: day_key(now),
                    week_key: week_key(now),
                    month_key: month_key(now),
                },
                fired_daily_alerts: Default::default(),
                fired_monthly_alerts: Default::default(),
            }),
            budget: RwLock::new(BudgetSettings::default()),
            catalog,
            rate_overrides: RwLock::new(HashMap::new()),
            path,
            debounce_ms,
            slow_save_threshold_ms,
            save_handle: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            alert_cb: RwLock::new(None),
        })
    }

    pub async fn set_alert_callback(&self, cb: Arc<dyn Fn(BudgetAlert) + Send + Sync>) {
        *self.alert_cb.write().await = Some(cb);
    }

    /// Loads persisted state if the file exists; missing file is not an
    /// error (first run). Malformed/partial payloads fall back to defaults
    /// field-by-field via `#[serde(default)]`; a newer `schemaVersion` is
    /// accepted with a warning.
    pub async fn load(self: &Arc<Self>) {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!("cost tracker: failed to read {}: {}", self.path.display(), e);
                return;
            }
        };

        let persisted: PersistedState = match serde_json::from_str(&contents) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("cost tracker: corrupted state file {}: {} — starting fresh", self.path.display(), e);
                return;
            }
        };

        if persisted.schema_version > SCHEMA_VERSION {
            tracing::warn!(
                "cost tracker: persisted schema_version {} is newer than this build's {}; loading best-effort",
                persisted.schema_version,
                SCHEMA_VERSION
            );
        }

        let mut state = self.state.write().await;
        state.usage = persisted.usage;
        state.last_reset = persisted.last_reset;
        for entry in persisted.by_key_id {
            state.by_key_id.put(entry.key, entry.aggregate);
        }
        for entry in persisted.costs_by_tenant {
            state.costs_by_tenant.put(entry.key, entry.aggregate);
        }
        state.hourly_history = persisted.hourly_history.into();
        state.cost_time_series = persisted.cost_time_series;
    }

    async fn pricing_for(&self, model: Option<&str>) -> (f64, f64) {
        if let Some(model) = model {
            // setRates overrides win over the catalog.
            if let Some((i, o)) = self.rate_overrides.read().await.get(model).copied() {
                return (i, o);
            }
            if let Some(p) = self.catalog.resolve_pricing(model) {
                return (p.input_per_1m, p.output_per_1m);
            }
        }
        (0.0, 0.0)
    }

    async fn compute_cost(&self, input_tokens: f64, output_tokens: f64, model: Option<&str>) -> f64 {
        let (rate_in, rate_out) = self.pricing_for(model).await;
        round6((input_tokens / 1_000_000.0) * rate_in + (output_tokens / 1_000_000.0) * rate_out)
    }

    /// Validates inputs (finite, non-negative), computes cost, updates all
    /// four period aggregates plus per-key/per-tenant/time-series state.
    /// Invalid input returns `None` without mutating any state.
    pub async fn record_usage(
        self: &Arc<Self>,
        key_id: &str,
        input_tokens: f64,
        output_tokens: f64,
        model: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Option<UsageResult> {
        if !input_tokens.is_finite() || !output_tokens.is_finite() {
            return None;
        }
        if input_tokens < 0.0 || output_tokens < 0.0 {
            return None;
        }
        if key_id.trim().is_empty() {
            return None;
        }

        let key_id = truncate_id(key_id);
        let tenant_id = tenant_id.map(truncate_id);
        let cost = self.compute_cost(input_tokens, output_tokens, model).await;
        let input_tokens = input_tokens as u64;
        let output_tokens = output_tokens as u64;

        self.apply(&key_id, input_tokens, output_tokens, cost, model, tenant_id.as_deref())
            .await;

        Some(UsageResult { cost, input_tokens, output_tokens })
    }

    async fn apply(
        self: &Arc<Self>,
        key_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
        model: Option<&str>,
        tenant_id: Option<&str>,
    ) {
        let now = Utc::now();
        {
            let mut state = self.state.write().await;
            self.roll_periods(&mut state, now);

            state.usage.today.record(input_tokens, output_tokens, cost);
            state.usage.this_week.record(input_tokens, output_tokens, cost);
            state.usage.this_month.record(input_tokens, output_tokens, cost);
            state.usage.all_time.record(input_tokens, output_tokens, cost);

            let key_agg = state.by_key_id.get_or_insert_mut(key_id.to_string(), Aggregate::default);
            key_agg.record(input_tokens, output_tokens, cost);

            if let Some(tenant) = tenant_id {
                let tenant_agg = state
                    .costs_by_tenant
                    .get_or_insert_mut(tenant.to_string(), Aggregate::default);
                tenant_agg.record(input_tokens, output_tokens, cost);
            }

            if let Some(model) = model {
                let bucket = hour_bucket(now);
                state.cost_time_series.record(&bucket, model, cost);
            }
        }

        self.mark_dirty();
        self.evaluate_budget_alerts().await;
    }

    fn roll_periods(&self, state: &mut CostState, now: DateTime<Utc>) {
        let day = day_key(now);
        let week = week_key(now);
        let month = month_key(now);

        if day != state.last_reset.day_key {
            if state.usage.today.requests > 0 {
                state.hourly_history.push_back(HourlyArchiveEntry {
                    period_key: state.last_reset.day_key.clone(),
                    aggregate: state.usage.today.clone(),
                });
                while state.hourly_history.len() > HOURLY_HISTORY_CAP {
                    state.hourly_history.pop_front();
                }
            }
            state.usage.today = Aggregate { started_at: now, ..Default::default() };
            state.last_reset.day_key = day;
            state.fired_daily_alerts.clear();
        }

        if week != state.last_reset.week_key {
            state.usage.this_week = Aggregate { started_at: now, ..Default::default() };
            state.last_reset.week_key = week;
        }

        if month != state.last_reset.month_key {
            state.usage.this_month = Aggregate { started_at: now, ..Default::default() };
            state.last_reset.month_key = month;
            state.fired_monthly_alerts.clear();
        }
    }

    /// Applies the same validation per record; triggers exactly one budget
    /// evaluation after the whole batch rather than per record.
    pub async fn record_batch(self: &Arc<Self>, records: &[UsageRecord]) -> BatchResult {
        let mut result = BatchResult { processed: 0, skipped: 0, errors: 0, total_cost: 0.0, total_tokens: 0 };
        if records.is_empty() {
            return result;
        }

        for record in records {
            if !record.input_tokens.is_finite()
                || !record.output_tokens.is_finite()
                || record.input_tokens < 0.0
                || record.output_tokens < 0.0
                || record.key_id.trim().is_empty()
            {
                result.errors += 1;
                result.skipped += 1;
                continue;
            }

            let key_id = truncate_id(&record.key_id);
            let tenant_id = record.tenant_id.as_deref().map(truncate_id);
            let cost = self.compute_cost(record.input_tokens, record.output_tokens, record.model.as_deref()).await;
            let input_tokens = record.input_tokens as u64;
            let output_tokens = record.output_tokens as u64;

            self.apply_no_alert(&key_id, input_tokens, output_tokens, cost, record.model.as_deref(), tenant_id.as_deref())
                .await;

            result.processed += 1;
            result.total_cost = round6(result.total_cost + cost);
            result.total_tokens += input_tokens + output_tokens;
        }

        self.evaluate_budget_alerts().await;
        result
    }

    async fn apply_no_alert(
        self: &Arc<Self>,
        key_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
        model: Option<&str>,
        tenant_id: Option<&str>,
    ) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        self.roll_periods(&mut state, now);
        state.usage.today.record(input_tokens, output_tokens, cost);
        state.usage.this_week.record(input_tokens, output_tokens, cost);
        state.usage.this_month.record(input_tokens, output_tokens, cost);
        state.usage.all_time.record(input_tokens, output_tokens, cost);
        let key_agg = state.by_key_id.get_or_insert_mut(key_id.to_string(), Aggregate::default);
        key_agg.record(input_tokens, output_tokens, cost);
        if let Some(tenant) = tenant_id {
            let tenant_agg = state.costs_by_tenant.get_or_insert_mut(tenant.to_string(), Aggregate::default);
            tenant_agg.record(input_tokens, output_tokens, cost);
        }
        if let Some(model) = model {
            let bucket = hour_bucket(now);
            state.cost_time_series.record(&bucket, model, cost);
        }
        drop(state);
        self.mark_dirty();
    }

    /// Fires each configured threshold at most once per period, the first
    /// time `currentCost/limit >= threshold` is observed in that period.
    async fn evaluate_budget_alerts(&self) {
        let budget = self.budget.read().await.clone();
        let cb = self.alert_cb.read().await.clone();
        let Some(cb) = cb else { return };

        let mut state = self.state.write().await;
        let now = Utc::now();

        if let Some(limit) = budget.daily {
            if limit > 0.0 {
                let current = state.usage.today.cost;
                let percent = current / limit;
                for &threshold in &budget.alert_thresholds {
                    let tk = threshold_key(threshold);
                    if percent >= threshold && !state.fired_daily_alerts.contains(&tk) {
                        state.fired_daily_alerts.insert(tk);
                        cb(BudgetAlert {
                            kind: if threshold >= 1.0 { AlertKind::Exceeded } else { AlertKind::Warning },
                            period: "daily",
                            threshold,
                            percent_used: percent,
                            current_cost: current,
                            budget_limit: limit,
                            remaining: (limit - current).max(0.0),
                            timestamp: now,
                        });
                    }
                }
            }
        }

        if let Some(limit) = budget.monthly {
            if limit > 0.0 {
                let current = state.usage.this_month.cost;
                let percent = current / limit;
                for &threshold in &budget.alert_thresholds {
                    let tk = threshold_key(threshold);
                    if percent >= threshold && !state.fired_monthly_alerts.contains(&tk) {
                        state.fired_monthly_alerts.insert(tk);
                        cb(BudgetAlert {
                            kind: if threshold >= 1.0 { AlertKind::Exceeded } else { AlertKind::Warning },
                            period: "monthly",
                            threshold,
                            percent_used: percent,
                            current_cost: current,
                            budget_limit: limit,
                            remaining: (limit - current).max(0.0),
                            timestamp: now,
                        });
                    }
                }
            }
        }
    }

    pub async fn get_stats(&self, period: Period) -> Aggregate {
        let state = self.state.read().await;
        match period {
            Period::Today => state.usage.today.clone(),
            Period::ThisWeek => state.usage.this_week.clone(),
            Period::ThisMonth => state.usage.this_month.clone(),
            Period::AllTime => state.usage.all_time.clone(),
        }
    }

    /// Simple linear projection of today's spend to a full day.
    pub async fn get_projection(&self) -> f64 {
        let state = self.state.read().await;
        let elapsed = (Utc::now() - state.usage.today.started_at).num_seconds().max(1) as f64;
        let day_seconds = 86_400.0;
        round6(state.usage.today.cost * (day_seconds / elapsed))
    }

    pub async fn get_full_report(&self) -> serde_json::Value {
        let state = self.state.read().await;
        serde_json::json!({
            "today": state.usage.today,
            "thisWeek": state.usage.this_week,
            "thisMonth": state.usage.this_month,
            "allTime": state.usage.all_time,
            "byKeyId": state.by_key_id.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<HashMap<_,_>>(),
            "costsByTenant": state.costs_by_tenant.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<HashMap<_,_>>(),
        })
    }

    pub async fn get_history(&self, n: usize) -> Vec<HourlyArchiveEntry> {
        let state = self.state.read().await;
        state.hourly_history.iter().rev().take(n).cloned().collect()
    }

    pub async fn get_cost_time_series(&self) -> CostTimeSeries {
        self.state.read().await.cost_time_series.clone()
    }

    pub async fn get_cost_by_key(&self) -> HashMap<String, Aggregate> {
        self.state
            .read()
            .await
            .by_key_id
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn get_all_tenant_costs(&self) -> HashMap<String, Aggregate> {
        self.state
            .read()
            .await
            .costs_by_tenant
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn set_budget(&self, daily: Option<f64>, monthly: Option<f64>, alert_thresholds: Option<Vec<f64>>) {
        let mut budget = self.budget.write().await;
        if let Some(d) = daily {
            budget.daily = Some(d);
        }
        if let Some(m) = monthly {
            budget.monthly = Some(m);
        }
        if let Some(t) = alert_thresholds {
            budget.alert_thresholds = t;
        }
    }

    pub async fn set_rates(&self, model: String, input_per_1m: f64, output_per_1m: f64) {
        self.rate_overrides.write().await.insert(model, (input_per_1m, output_per_1m));
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let now = Utc::now();
        state.usage = PeriodAggregates::default();
        state.usage.today.started_at = now;
        state.usage.this_week.started_at = now;
        state.usage.this_month.started_at = now;
        state.usage.all_time.started_at = now;
        state.by_key_id.clear();
        state.costs_by_tenant.clear();
        state.hourly_history.clear();
        state.cost_time_series = CostTimeSeries::default();
        state.fired_daily_alerts.clear();
        state.fired_monthly_alerts.clear();
        drop(state);
        self.mark_dirty();
    }

    /// Schedules a debounced save, coalescing any already-pending one.
    fn mark_dirty(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let mut handle_slot = match self.save_handle.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if handle_slot.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let debounce = std::time::Duration::from_millis(self.debounce_ms);
        *handle_slot = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            this.save_now().await;
            let mut slot = this.save_handle.lock().await;
            *slot = None;
        }));
    }

    async fn save_now(&self) {
        let started = std::time::Instant::now();
        let persisted = {
            let state = self.state.read().await;
            PersistedState {
                schema_version: SCHEMA_VERSION,
                usage: state.usage.clone(),
                by_key_id: state
                    .by_key_id
                    .iter()
                    .map(|(k, v)| PersistedLruEntry { key: k.clone(), aggregate: v.clone() })
                    .collect(),
                costs_by_tenant: state
                    .costs_by_tenant
                    .iter()
                    .map(|(k, v)| PersistedLruEntry { key: k.clone(), aggregate: v.clone() })
                    .collect(),
                hourly_history: state.hourly_history.iter().cloned().collect(),
                cost_time_series: state.cost_time_series.clone(),
                last_reset: state.last_reset.clone(),
                saved_at: Utc::now(),
            }
        };

        let result = self.write_atomic(&persisted).await;
        if let Err(e) = result {
            tracing::error!("cost tracker: failed to save {}: {}", self.path.display(), e);
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > self.slow_save_threshold_ms {
            tracing::warn!("cost tracker: save took {}ms (threshold {}ms)", elapsed_ms, self.slow_save_threshold_ms);
        }
    }

    async fn write_atomic(&self, persisted: &PersistedState) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(persisted)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    /// Cancels any pending debounce, awaits it, then performs exactly one
    /// final save with the current data.
    pub async fn flush(self: &Arc<Self>) {
        let mut slot = self.save_handle.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
            let _ = handle.await;
        }
        drop(slot);
        self.save_now().await;
    }

    /// Flushes then marks destroyed so no further saves occur.
    pub async fn destroy(self: &Arc<Self>) {
        self.flush().await;
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Model, ModelPricing, ModelTier};

    fn catalog() -> Arc<ModelCatalog> {
        Arc::new(ModelCatalog::from_models(vec![Model {
            id: "glm-4.7".to_string(),
            tier: ModelTier::Heavy,
            context_length: 128_000,
            supports_vision: true,
            max_concurrency: 8,
            pricing: ModelPricing { input_per_1m: 2.0, output_per_1m: 8.0 },
        }]))
    }

    async fn tracker() -> Arc<CostTracker> {
        let dir = tempfile::tempdir().unwrap();
        let tracker = CostTracker::new(dir.path().join("cost.json"), catalog(), 50_000, 250);
        std::mem::forget(dir);
        tracker
    }

    #[tokio::test]
    async fn record_usage_computes_cost_and_updates_all_periods() {
        let t = tracker().await;
        let result = t.record_usage("key-1", 1_000_000.0, 500_000.0, Some("glm-4.7"), None).await.unwrap();
        assert_eq!(result.cost, 2.0 + 4.0);

        let today = t.get_stats(Period::Today).await;
        assert_eq!(today.cost, 6.0);
        let all_time = t.get_stats(Period::AllTime).await;
        assert_eq!(all_time.cost, 6.0);
    }

    #[tokio::test]
    async fn record_usage_rejects_invalid_input() {
        let t = tracker().await;
        assert!(t.record_usage("key-1", f64::NAN, 1.0, None, None).await.is_none());
        assert!(t.record_usage("key-1", -1.0, 1.0, None, None).await.is_none());
        assert!(t.record_usage("", 1.0, 1.0, None, None).await.is_none());
        let today = t.get_stats(Period::Today).await;
        assert_eq!(today.requests, 0);
    }

    #[tokio::test]
    async fn record_batch_empty_is_a_no_op() {
        let t = tracker().await;
        let result = t.record_batch(&[]).await;
        assert_eq!(result.processed, 0);
        assert_eq!(result.total_cost, 0.0);
    }

    #[tokio::test]
    async fn budget_alerts_fire_each_threshold_once_per_day() {
        let t = tracker().await;
        t.set_budget(Some(1.0), None, None).await;
        let fired = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let fired_clone = Arc::clone(&fired);
        t.set_alert_callback(Arc::new(move |alert: BudgetAlert| {
            let fired = Arc::clone(&fired_clone);
            tokio::spawn(async move {
                fired.lock().await.push(alert.threshold);
            });
        }))
        .await;

        t.record_usage("k", 255_000.0, 0.0, Some("glm-4.7"), None).await; // $0.51
        t.record_usage("k", 150_000.0, 0.0, Some("glm-4.7"), None).await; // +$0.30 = 0.81
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let seen = fired.lock().await.clone();
        assert!(seen.contains(&0.5));
        assert!(seen.contains(&0.8));
    }

    #[tokio::test]
    async fn flush_after_mark_dirty_performs_exactly_one_save() {
        let t = tracker().await;
        t.record_usage("k", 1000.0, 1000.0, Some("glm-4.7"), None).await;
        t.flush().await;
        assert!(tokio::fs::metadata(&t.path).await.is_ok());
    }
}
