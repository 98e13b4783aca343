use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cache_tiers::CacheTierManager;
use crate::emergency_cleanup::{EmergencyCleanup, EmergencyOutcome};

const DEFAULT_MONITOR_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_SOFT_LIMIT_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_HIGH_RATIO: f64 = 0.85;
const DEFAULT_CRITICAL_RATIO: f64 = 0.95;
const DEFAULT_MODERATE_EVICT_FRACTION: f64 = 0.2;
const DEFAULT_HIGH_EVICT_FRACTION: f64 = 0.5;

/// One memory reading. `limit_bytes` is the ceiling the ratio is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    pub rss_bytes: u64,
    pub limit_bytes: u64,
}

impl MemorySample {
    pub fn ratio(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.rss_bytes as f64 / self.limit_bytes as f64
    }
}

/// Source of process memory readings.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Option<MemorySample>;
}

/// Reads resident set size from `/proc/self/status`.
///
/// The limit is the configured value when present, otherwise `MemTotal`.
#[derive(Debug, Clone, Default)]
pub struct ProcessMemoryProbe {
    pub limit_bytes: Option<u64>,
}

impl MemoryProbe for ProcessMemoryProbe {
    fn sample(&self) -> Option<MemorySample> {
        let rss_bytes = read_proc_kb_field("/proc/self/status", "VmRSS:")?;
        let limit_bytes = match self.limit_bytes {
            Some(limit) if limit > 0 => limit,
            _ => read_proc_kb_field("/proc/meminfo", "MemTotal:")?,
        };
        Some(MemorySample {
            rss_bytes,
            limit_bytes,
        })
    }
}

#[cfg(target_os = "linux")]
fn read_proc_kb_field(path: &str, field: &str) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            // Format: "12345 kB"
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb.saturating_mul(1024));
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_proc_kb_field(_path: &str, _field: &str) -> Option<u64> {
    None
}

/// Probe returning a settable reading; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    rss_bytes: AtomicU64,
    limit_bytes: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(rss_bytes: u64, limit_bytes: u64) -> Self {
        Self {
            rss_bytes: AtomicU64::new(rss_bytes),
            limit_bytes: AtomicU64::new(limit_bytes),
        }
    }

    pub fn set_rss(&self, rss_bytes: u64) {
        self.rss_bytes.store(rss_bytes, Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn sample(&self) -> Option<MemorySample> {
        Some(MemorySample {
            rss_bytes: self.rss_bytes.load(Ordering::Relaxed),
            limit_bytes: self.limit_bytes.load(Ordering::Relaxed),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    /// Resident size is above the soft byte threshold.
    Moderate,
    /// Resident size is above the hard ratio of the limit.
    High,
    /// Resident size is above the critical ratio; emergency cleanup runs.
    Critical,
}

impl PressureLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Thresholds and cadence for the resource monitor.
pub struct ResourceMonitorConfig {
    pub interval: Duration,
    pub soft_limit_bytes: u64,
    pub high_ratio: f64,
    pub critical_ratio: f64,
    pub moderate_evict_fraction: f64,
    pub high_evict_fraction: f64,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECONDS),
            soft_limit_bytes: DEFAULT_SOFT_LIMIT_BYTES,
            high_ratio: DEFAULT_HIGH_RATIO,
            critical_ratio: DEFAULT_CRITICAL_RATIO,
            moderate_evict_fraction: DEFAULT_MODERATE_EVICT_FRACTION,
            high_evict_fraction: DEFAULT_HIGH_EVICT_FRACTION,
        }
    }
}

impl ResourceMonitorConfig {
    pub fn classify(&self, sample: &MemorySample) -> PressureLevel {
        let ratio = sample.ratio();
        if ratio >= self.critical_ratio {
            PressureLevel::Critical
        } else if ratio >= self.high_ratio {
            PressureLevel::High
        } else if sample.rss_bytes >= self.soft_limit_bytes {
            PressureLevel::Moderate
        } else {
            PressureLevel::Normal
        }
    }
}

/// What one optimization pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub level: Option<PressureLevel>,
    pub expired: usize,
    pub evicted: usize,
    pub flushed_tiers: Vec<String>,
    pub emergency_ran: bool,
}

/// Samples memory and applies graduated eviction to the cache tiers.
pub struct ResourceMonitor {
    config: ResourceMonitorConfig,
    cache: Arc<CacheTierManager>,
    emergency: Arc<EmergencyCleanup>,
    probe: Arc<dyn MemoryProbe>,
    cycles: AtomicU64,
}

impl ResourceMonitor {
    pub fn new(
        config: ResourceMonitorConfig,
        cache: Arc<CacheTierManager>,
        emergency: Arc<EmergencyCleanup>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            config,
            cache,
            emergency,
            probe,
            cycles: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ResourceMonitorConfig {
        &self.config
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Takes one sample and responds to it.
    pub fn run_cycle(&self) -> OptimizationReport {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let Some(sample) = self.probe.sample() else {
            tracing::debug!("memory probe returned no sample");
            return OptimizationReport::default();
        };
        let level = self.config.classify(&sample);
        if level != PressureLevel::Normal {
            tracing::info!(
                level = level.as_str(),
                rss_bytes = sample.rss_bytes,
                limit_bytes = sample.limit_bytes,
                ratio = sample.ratio(),
                "memory pressure detected"
            );
        }
        self.respond(level)
    }

    pub fn respond(&self, level: PressureLevel) -> OptimizationReport {
        let mut report = match level {
            PressureLevel::Normal => OptimizationReport::default(),
            PressureLevel::Moderate => self.optimize_moderate(),
            PressureLevel::High => self.optimize_high(),
            PressureLevel::Critical => {
                let emergency_ran = matches!(
                    self.emergency.trigger("memory_pressure_critical"),
                    EmergencyOutcome::Completed(_)
                );
                OptimizationReport {
                    emergency_ran,
                    ..OptimizationReport::default()
                }
            }
        };
        report.level = Some(level);
        report
    }

    fn optimize_moderate(&self) -> OptimizationReport {
        let mut report = OptimizationReport::default();
        for tier in self.cache.tiers_by_volatility() {
            report.expired += self.cache.sweep_expired(tier).unwrap_or(0);
            match self
                .cache
                .evict_fraction(tier, self.config.moderate_evict_fraction)
            {
                Ok(evicted) => report.evicted += evicted,
                Err(error) => tracing::warn!(tier = %tier, %error, "moderate eviction failed"),
            }
        }
        tracing::info!(
            expired = report.expired,
            evicted = report.evicted,
            "moderate memory optimization applied"
        );
        report
    }

    fn optimize_high(&self) -> OptimizationReport {
        let mut report = OptimizationReport::default();
        for tier in self.cache.tiers_by_volatility() {
            report.expired += self.cache.sweep_expired(tier).unwrap_or(0);
            let result = if self.cache.is_volatile(tier) {
                self.cache.clear(tier).map(|cleared| {
                    report.flushed_tiers.push(tier.clone());
                    cleared
                })
            } else {
                self.cache
                    .evict_fraction(tier, self.config.high_evict_fraction)
            };
            match result {
                Ok(evicted) => report.evicted += evicted,
                Err(error) => tracing::warn!(tier = %tier, %error, "high-pressure eviction failed"),
            }
        }
        self.cache.shrink_to_fit();
        tracing::warn!(
            expired = report.expired,
            evicted = report.evicted,
            flushed = ?report.flushed_tiers,
            "high memory optimization applied"
        );
        report
    }
}

/// Handle for the periodic resource monitor task.
pub struct ResourceMonitorHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ResourceMonitorHandle {
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

pub fn start_resource_monitor(monitor: Arc<ResourceMonitor>) -> Result<ResourceMonitorHandle> {
    if monitor.config.interval.is_zero() {
        bail!("resource monitor interval must be greater than zero");
    }
    let handle = tokio::runtime::Handle::try_current()
        .context("resource monitor requires an active Tokio runtime")?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let interval_period = monitor.config.interval;
    let task = handle.spawn(async move {
        let mut interval = tokio::time::interval(interval_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    monitor.run_cycle();
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });
    Ok(ResourceMonitorHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}
