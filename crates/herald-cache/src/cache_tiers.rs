use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use herald_core::{current_unix_timestamp_ms, is_expired_unix_ms};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cache_value::{CachedValue, DEFAULT_WRAP_THRESHOLD_BYTES};

pub const TIER_MESSAGES: &str = "messages";
pub const TIER_MEDIA: &str = "media";
pub const TIER_RETRY_COUNTERS: &str = "retry_counters";
pub const TIER_GROUP_METADATA: &str = "group_metadata";
pub const TIER_USERS: &str = "users";

/// Errors surfaced by individual cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unknown cache tier '{0}'")]
    UnknownTier(String),
    #[error("failed to encode cache value: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode cache value: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Expiry and size policy for one named tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    pub name: String,
    /// Default time-to-live. `Duration::ZERO` disables expiry.
    pub ttl: Duration,
    pub max_keys: usize,
    pub sweep_period: Duration,
    /// Volatile tiers may be flushed completely under high memory pressure.
    pub volatile: bool,
}

impl TierPolicy {
    pub fn new(name: impl Into<String>, ttl: Duration, max_keys: usize) -> Self {
        Self {
            name: name.into(),
            ttl,
            max_keys: max_keys.max(1),
            sweep_period: Duration::from_secs(60),
            volatile: false,
        }
    }

    pub fn with_sweep_period(mut self, sweep_period: Duration) -> Self {
        self.sweep_period = sweep_period;
        self
    }

    pub fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }
}

/// Built-in tiers, from the sub-minute message tier to long-lived user data.
pub fn default_tier_policies() -> Vec<TierPolicy> {
    vec![
        TierPolicy::new(TIER_MESSAGES, Duration::from_secs(30), 1_000)
            .with_sweep_period(Duration::from_secs(10))
            .volatile(),
        TierPolicy::new(TIER_RETRY_COUNTERS, Duration::from_secs(60), 500)
            .with_sweep_period(Duration::from_secs(30))
            .volatile(),
        TierPolicy::new(TIER_MEDIA, Duration::from_secs(120), 100)
            .with_sweep_period(Duration::from_secs(30))
            .volatile(),
        TierPolicy::new(TIER_GROUP_METADATA, Duration::from_secs(300), 500)
            .with_sweep_period(Duration::from_secs(60)),
        TierPolicy::new(TIER_USERS, Duration::from_secs(600), 2_000)
            .with_sweep_period(Duration::from_secs(120)),
    ]
}

/// Construction parameters for [`CacheTierManager`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub tiers: Vec<TierPolicy>,
    pub wrap_threshold_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tiers: default_tier_policies(),
            wrap_threshold_bytes: DEFAULT_WRAP_THRESHOLD_BYTES,
        }
    }
}

/// Point-in-time counters for one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub name: String,
    pub volatile: bool,
    pub keys: usize,
    pub max_keys: usize,
    pub approx_bytes: usize,
    pub wrapped_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedValue,
    expires_unix_ms: Option<u64>,
    seq: u64,
    size_bytes: usize,
}

#[derive(Debug, Default)]
struct TierCounters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

#[derive(Debug)]
struct CacheTier {
    policy: TierPolicy,
    entries: HashMap<String, CacheEntry>,
    insertion_order: BTreeMap<u64, String>,
    next_seq: u64,
    approx_bytes: usize,
    last_sweep_unix_ms: u64,
    counters: TierCounters,
}

impl CacheTier {
    fn new(policy: TierPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            insertion_order: BTreeMap::new(),
            next_seq: 0,
            approx_bytes: 0,
            last_sweep_unix_ms: current_unix_timestamp_ms(),
            counters: TierCounters::default(),
        }
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.insertion_order.remove(&entry.seq);
        self.approx_bytes = self.approx_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn lookup(&mut self, key: &str, now_unix_ms: u64) -> Option<&CacheEntry> {
        let expired = match self.entries.get(key) {
            Some(entry) => is_expired_unix_ms(entry.expires_unix_ms, now_unix_ms),
            None => {
                self.counters.misses = self.counters.misses.saturating_add(1);
                return None;
            }
        };
        if expired {
            self.remove_entry(key);
            self.counters.expirations = self.counters.expirations.saturating_add(1);
            self.counters.misses = self.counters.misses.saturating_add(1);
            return None;
        }
        self.counters.hits = self.counters.hits.saturating_add(1);
        self.entries.get(key)
    }

    fn insert(
        &mut self,
        key: &str,
        value: CachedValue,
        size_bytes: usize,
        ttl: Option<Duration>,
        now_unix_ms: u64,
    ) {
        self.remove_entry(key);
        let ttl = ttl.unwrap_or(self.policy.ttl);
        let expires_unix_ms = if ttl.is_zero() {
            None
        } else {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            Some(now_unix_ms.saturating_add(ttl_ms))
        };
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.insertion_order.insert(seq, key.to_string());
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_unix_ms,
                seq,
                size_bytes,
            },
        );
        self.approx_bytes = self.approx_bytes.saturating_add(size_bytes);

        while self.entries.len() > self.policy.max_keys {
            if !self.evict_oldest() {
                break;
            }
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.insertion_order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.approx_bytes = self.approx_bytes.saturating_sub(entry.size_bytes);
        }
        self.counters.evictions = self.counters.evictions.saturating_add(1);
        true
    }

    fn sweep_expired(&mut self, now_unix_ms: u64) -> usize {
        let expired = self
            .entries
            .iter()
            .filter(|(_, entry)| is_expired_unix_ms(entry.expires_unix_ms, now_unix_ms))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in &expired {
            self.remove_entry(key);
        }
        self.counters.expirations = self
            .counters
            .expirations
            .saturating_add(expired.len() as u64);
        self.last_sweep_unix_ms = now_unix_ms;
        expired.len()
    }

    /// Evicts the oldest `floor(len * fraction)` entries; never empties a
    /// tier unless `fraction` is 1.0.
    fn evict_fraction(&mut self, fraction: f64) -> usize {
        let fraction = fraction.clamp(0.0, 1.0);
        let target = (self.entries.len() as f64 * fraction).floor() as usize;
        let mut evicted = 0;
        while evicted < target && self.evict_oldest() {
            evicted += 1;
        }
        evicted
    }

    fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.insertion_order.clear();
        self.approx_bytes = 0;
        removed
    }

    fn stats(&self) -> TierStats {
        TierStats {
            name: self.policy.name.clone(),
            volatile: self.policy.volatile,
            keys: self.entries.len(),
            max_keys: self.policy.max_keys,
            approx_bytes: self.approx_bytes,
            wrapped_entries: self
                .entries
                .values()
                .filter(|entry| entry.value.is_wrapped())
                .count(),
            hits: self.counters.hits,
            misses: self.counters.misses,
            evictions: self.counters.evictions,
            expirations: self.counters.expirations,
        }
    }
}

/// Owns every cache tier for the process.
///
/// Individual-key operations are safe to call from any task. Bulk eviction
/// (`evict_fraction`, `clear`, `flush_all`) is reserved for the resource
/// monitor and emergency cleanup.
#[derive(Debug)]
pub struct CacheTierManager {
    tiers: BTreeMap<String, Mutex<CacheTier>>,
    volatility_order: Vec<String>,
    wrap_threshold_bytes: usize,
}

impl CacheTierManager {
    pub fn new(config: CacheConfig) -> Self {
        let mut policies = config.tiers;
        policies.sort_by(|left, right| {
            left.ttl
                .cmp(&right.ttl)
                .then_with(|| left.name.cmp(&right.name))
        });
        let volatility_order = policies
            .iter()
            .map(|policy| policy.name.clone())
            .collect::<Vec<_>>();
        let tiers = policies
            .into_iter()
            .map(|policy| (policy.name.clone(), Mutex::new(CacheTier::new(policy))))
            .collect();
        Self {
            tiers,
            volatility_order,
            wrap_threshold_bytes: config.wrap_threshold_bytes,
        }
    }

    fn tier(&self, name: &str) -> Result<MutexGuard<'_, CacheTier>, CacheError> {
        let tier = self
            .tiers
            .get(name)
            .ok_or_else(|| CacheError::UnknownTier(name.to_string()))?;
        Ok(tier.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Tier names ordered from shortest to longest TTL.
    pub fn tiers_by_volatility(&self) -> &[String] {
        &self.volatility_order
    }

    pub fn policy(&self, tier: &str) -> Option<TierPolicy> {
        self.tier(tier).ok().map(|tier| tier.policy.clone())
    }

    pub fn get(&self, tier: &str, key: &str) -> Result<Option<Value>, CacheError> {
        self.get_at(tier, key, current_unix_timestamp_ms())
    }

    fn get_at(&self, tier: &str, key: &str, now_unix_ms: u64) -> Result<Option<Value>, CacheError> {
        let mut tier = self.tier(tier)?;
        match tier.lookup(key, now_unix_ms) {
            Some(entry) => entry.value.decode().map(Some),
            None => Ok(None),
        }
    }

    pub fn get_as<T: DeserializeOwned>(
        &self,
        tier: &str,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        match self.get(tier, key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(CacheError::Decode),
            None => Ok(None),
        }
    }

    /// Stores `value` under `key`. `ttl = None` applies the tier default.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        tier: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.set_at(tier, key, value, ttl, current_unix_timestamp_ms())
    }

    fn set_at<T: Serialize + ?Sized>(
        &self,
        tier: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        now_unix_ms: u64,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_value(value).map_err(CacheError::Encode)?;
        let (stored, size_bytes) = CachedValue::encode(value, self.wrap_threshold_bytes)?;
        self.tier(tier)?
            .insert(key, stored, size_bytes, ttl, now_unix_ms);
        Ok(())
    }

    pub fn del(&self, tier: &str, key: &str) -> Result<bool, CacheError> {
        Ok(self.tier(tier)?.remove_entry(key).is_some())
    }

    /// Removes and returns a live entry.
    pub fn take(&self, tier: &str, key: &str) -> Result<Option<Value>, CacheError> {
        let now_unix_ms = current_unix_timestamp_ms();
        let mut tier = self.tier(tier)?;
        match tier.remove_entry(key) {
            Some(entry) if !is_expired_unix_ms(entry.expires_unix_ms, now_unix_ms) => {
                entry.value.decode().map(Some)
            }
            _ => Ok(None),
        }
    }

    pub fn clear(&self, tier: &str) -> Result<usize, CacheError> {
        Ok(self.tier(tier)?.clear())
    }

    pub fn flush_all(&self) -> usize {
        self.tiers
            .values()
            .map(|tier| tier.lock().unwrap_or_else(PoisonError::into_inner).clear())
            .sum()
    }

    pub fn len(&self, tier: &str) -> Result<usize, CacheError> {
        Ok(self.tier(tier)?.entries.len())
    }

    pub fn keys(&self, tier: &str) -> Result<Vec<String>, CacheError> {
        let tier = self.tier(tier)?;
        Ok(tier.insertion_order.values().cloned().collect())
    }

    pub fn total_entries(&self) -> usize {
        self.tiers
            .values()
            .map(|tier| tier.lock().unwrap_or_else(PoisonError::into_inner).entries.len())
            .sum()
    }

    pub fn is_volatile(&self, tier: &str) -> bool {
        self.tier(tier)
            .map(|tier| tier.policy.volatile)
            .unwrap_or(false)
    }

    pub fn sweep_expired(&self, tier: &str) -> Result<usize, CacheError> {
        Ok(self.tier(tier)?.sweep_expired(current_unix_timestamp_ms()))
    }

    pub fn sweep_all(&self) -> usize {
        self.sweep_all_at(current_unix_timestamp_ms())
    }

    fn sweep_all_at(&self, now_unix_ms: u64) -> usize {
        self.tiers
            .values()
            .map(|tier| {
                tier.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .sweep_expired(now_unix_ms)
            })
            .sum()
    }

    /// Sweeps only the tiers whose sweep period has elapsed since their last sweep.
    pub fn sweep_due(&self, now_unix_ms: u64) -> usize {
        let mut swept = 0;
        for tier in self.tiers.values() {
            let mut tier = tier.lock().unwrap_or_else(PoisonError::into_inner);
            let period_ms = u64::try_from(tier.policy.sweep_period.as_millis()).unwrap_or(u64::MAX);
            if now_unix_ms.saturating_sub(tier.last_sweep_unix_ms) >= period_ms {
                swept += tier.sweep_expired(now_unix_ms);
            }
        }
        swept
    }

    pub fn evict_fraction(&self, tier: &str, fraction: f64) -> Result<usize, CacheError> {
        Ok(self.tier(tier)?.evict_fraction(fraction))
    }

    /// Releases spare map capacity after a large eviction pass.
    pub fn shrink_to_fit(&self) {
        for tier in self.tiers.values() {
            let mut tier = tier.lock().unwrap_or_else(PoisonError::into_inner);
            tier.entries.shrink_to_fit();
        }
    }

    pub fn stats(&self) -> Vec<TierStats> {
        self.volatility_order
            .iter()
            .filter_map(|name| self.tier(name).ok().map(|tier| tier.stats()))
            .collect()
    }

    fn min_sweep_period(&self) -> Option<Duration> {
        self.tiers
            .values()
            .map(|tier| tier.lock().unwrap_or_else(PoisonError::into_inner).policy.sweep_period)
            .filter(|period| !period.is_zero())
            .min()
    }
}

/// Handle for the background task that actively expires tier entries.
pub struct CacheSweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CacheSweeperHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Spawns the periodic expiry sweep, ticking at the shortest tier sweep period.
pub fn start_cache_sweeper(cache: Arc<CacheTierManager>) -> Result<CacheSweeperHandle> {
    start_cache_sweeper_with_clock(cache, current_unix_timestamp_ms)
}

fn start_cache_sweeper_with_clock<F>(
    cache: Arc<CacheTierManager>,
    now_unix_ms: F,
) -> Result<CacheSweeperHandle>
where
    F: Fn() -> u64 + Send + 'static,
{
    let Some(period) = cache.min_sweep_period() else {
        bail!("cache sweeper requires at least one tier with a non-zero sweep period");
    };
    let handle = tokio::runtime::Handle::try_current()
        .context("cache sweeper requires an active Tokio runtime")?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = handle.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let swept = cache.sweep_due(now_unix_ms());
                    if swept > 0 {
                        tracing::debug!(swept, "cache sweep expired entries");
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });
    Ok(CacheSweeperHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use herald_core::current_unix_timestamp_ms;

    use super::{CacheConfig, CacheError, CacheTierManager, TierPolicy, TIER_MESSAGES, TIER_USERS};

    fn small_config() -> CacheConfig {
        CacheConfig {
            tiers: vec![
                TierPolicy::new("fast", Duration::from_secs(10), 3).volatile(),
                TierPolicy::new("slow", Duration::from_secs(600), 100),
                TierPolicy::new("pinned", Duration::ZERO, 10),
            ],
            wrap_threshold_bytes: 64,
        }
    }

    #[test]
    fn unit_default_tiers_are_ordered_by_volatility() {
        let cache = CacheTierManager::new(CacheConfig::default());
        let order = cache.tiers_by_volatility();
        assert_eq!(order.first().map(String::as_str), Some(TIER_MESSAGES));
        assert_eq!(order.last().map(String::as_str), Some(TIER_USERS));
        assert!(cache.is_volatile(TIER_MESSAGES));
        assert!(!cache.is_volatile(TIER_USERS));
    }

    #[test]
    fn functional_set_get_del_round_trip_per_tier() {
        let cache = CacheTierManager::new(small_config());
        cache.set("fast", "k", &json!({"n": 1}), None).expect("set");
        assert_eq!(cache.get("fast", "k").expect("get"), Some(json!({"n": 1})));
        assert_eq!(cache.get("slow", "k").expect("get other tier"), None);
        assert!(cache.del("fast", "k").expect("del"));
        assert!(!cache.del("fast", "k").expect("second del"));
        assert_eq!(cache.get("fast", "k").expect("get after del"), None);
    }

    #[test]
    fn functional_large_values_are_wrapped_but_read_back_transparently() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct GroupInfo {
            subject: String,
            participants: Vec<String>,
        }

        let cache = CacheTierManager::new(small_config());
        let info = GroupInfo {
            subject: "weekend".to_string(),
            participants: (0..20).map(|index| format!("member-{index}")).collect(),
        };
        cache.set("slow", "group", &info, None).expect("set");
        let stats = cache.stats();
        let slow = stats.iter().find(|tier| tier.name == "slow").expect("slow stats");
        assert_eq!(slow.wrapped_entries, 1);

        let loaded: GroupInfo = cache.get_as("slow", "group").expect("get").expect("present");
        assert_eq!(loaded, info);
    }

    #[test]
    fn functional_max_keys_evicts_oldest_instead_of_refusing_writes() {
        let cache = CacheTierManager::new(small_config());
        for index in 0..5 {
            cache.set("fast", &format!("k{index}"), &index, None).expect("set");
        }
        assert_eq!(cache.len("fast").expect("len"), 3);
        assert_eq!(cache.keys("fast").expect("keys"), vec!["k2", "k3", "k4"]);
        let stats = cache.stats();
        let fast = stats.iter().find(|tier| tier.name == "fast").expect("fast");
        assert_eq!(fast.evictions, 2);
    }

    #[test]
    fn functional_passive_expiry_on_read() {
        let cache = CacheTierManager::new(small_config());
        cache
            .set_at("fast", "k", &"v", Some(Duration::from_millis(100)), 1_000)
            .expect("set");
        assert_eq!(cache.get_at("fast", "k", 1_050).expect("get"), Some(json!("v")));
        assert_eq!(cache.get_at("fast", "k", 1_100).expect("get expired"), None);
        assert_eq!(cache.len("fast").expect("len"), 0);
    }

    #[test]
    fn functional_active_sweep_removes_only_expired_entries() {
        let cache = CacheTierManager::new(small_config());
        cache
            .set_at("slow", "old", &1, Some(Duration::from_millis(10)), 1_000)
            .expect("set old");
        cache
            .set_at("slow", "new", &2, Some(Duration::from_secs(3600)), 1_000)
            .expect("set new");
        cache.set_at("pinned", "forever", &3, None, 1_000).expect("set pinned");

        let swept = cache.sweep_all_at(2_000);
        assert_eq!(swept, 1);
        assert_eq!(cache.keys("slow").expect("keys"), vec!["new"]);
        assert_eq!(cache.len("pinned").expect("pinned len"), 1);
    }

    #[test]
    fn unit_evict_fraction_never_empties_a_tier_below_one_full_step() {
        let cache = CacheTierManager::new(small_config());
        cache.set("slow", "only", &1, None).expect("set");
        assert_eq!(cache.evict_fraction("slow", 0.5).expect("evict"), 0);
        for index in 0..10 {
            cache.set("slow", &format!("k{index}"), &index, None).expect("set");
        }
        assert_eq!(cache.evict_fraction("slow", 0.2).expect("evict"), 2);
        assert_eq!(cache.len("slow").expect("len"), 9);
        assert_eq!(cache.keys("slow").expect("keys")[0], "k1");
    }

    #[test]
    fn functional_take_returns_value_and_removes_entry() {
        let cache = CacheTierManager::new(small_config());
        cache.set("slow", "k", &"v", None).expect("set");
        assert_eq!(cache.take("slow", "k").expect("take"), Some(json!("v")));
        assert_eq!(cache.get("slow", "k").expect("get"), None);
    }

    #[test]
    fn regression_unknown_tier_is_reported_not_created() {
        let cache = CacheTierManager::new(small_config());
        let error = cache.set("missing", "k", &1, None).expect_err("unknown tier");
        assert!(matches!(error, CacheError::UnknownTier(name) if name == "missing"));
        assert!(cache.policy("missing").is_none());
    }

    #[test]
    fn functional_flush_all_clears_every_tier() {
        let cache = CacheTierManager::new(small_config());
        cache.set("fast", "a", &1, None).expect("set");
        cache.set("slow", "b", &1, None).expect("set");
        cache.set("pinned", "c", &1, None).expect("set");
        assert_eq!(cache.flush_all(), 3);
        assert_eq!(cache.total_entries(), 0);
    }

    #[test]
    fn unit_hits_and_misses_are_counted() {
        let cache = CacheTierManager::new(small_config());
        cache.set("slow", "k", &1, None).expect("set");
        let _ = cache.get("slow", "k").expect("hit");
        let _ = cache.get("slow", "absent").expect("miss");
        let stats = cache.stats();
        let slow = stats.iter().find(|tier| tier.name == "slow").expect("slow");
        assert_eq!((slow.hits, slow.misses), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn integration_sweeper_task_expires_entries_in_the_background() {
        let cache = std::sync::Arc::new(CacheTierManager::new(CacheConfig {
            tiers: vec![TierPolicy::new("fast", Duration::from_millis(5), 10)
                .with_sweep_period(Duration::from_millis(20))],
            wrap_threshold_bytes: 1024,
        }));
        cache.set("fast", "k", &1, None).expect("set");
        let base_unix_ms = current_unix_timestamp_ms();
        let started = tokio::time::Instant::now();
        let clock = move || base_unix_ms + started.elapsed().as_millis() as u64;
        let mut handle =
            super::start_cache_sweeper_with_clock(cache.clone(), clock).expect("start sweeper");
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        let stats = cache.stats();
        assert_eq!(stats[0].keys, 0);
        assert_eq!(stats[0].expirations, 1);
    }
}
