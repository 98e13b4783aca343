use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use herald_cache::{CacheConfig, ResourceMonitorConfig};
use herald_migration::{MigrationConfig, ResolvePacing, DEFAULT_LEGACY_PATTERN};
use herald_session::{ConnectionManagerConfig, GatewayConnectorConfig};

use crate::bot_runtime::RuntimeConfig;

const BYTES_PER_MIB: u64 = 1024 * 1024;

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_ratio(value: &str) -> Result<f64, String> {
    let parsed = value
        .parse::<f64>()
        .map_err(|error| format!("failed to parse ratio: {error}"))?;
    if !parsed.is_finite() || parsed <= 0.0 || parsed > 1.0 {
        return Err("value must be in range (0, 1]".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "herald",
    about = "Long-running chat bot runtime with bounded ingestion and memory-aware caching",
    version
)]
pub struct Cli {
    #[arg(
        long = "gateway-url",
        env = "HERALD_GATEWAY_URL",
        help = "WebSocket URL of the messaging gateway"
    )]
    pub gateway_url: String,

    #[arg(
        long = "auth-dir",
        env = "HERALD_AUTH_DIR",
        default_value = ".herald/auth",
        help = "Directory holding session credentials"
    )]
    pub auth_dir: PathBuf,

    #[arg(
        long = "store-dir",
        env = "HERALD_STORE_DIR",
        default_value = ".herald/store",
        help = "Record store scanned by the identity migration"
    )]
    pub store_dir: PathBuf,

    #[arg(
        long = "media-dir",
        env = "HERALD_MEDIA_DIRS",
        value_delimiter = ',',
        help = "Media directories purged by emergency cleanup"
    )]
    pub media_dirs: Vec<PathBuf>,

    #[arg(
        long = "max-workers",
        env = "HERALD_MAX_WORKERS",
        default_value_t = 4,
        value_parser = parse_positive_usize,
        help = "Maximum concurrently processed inbound messages"
    )]
    pub max_workers: usize,

    #[arg(
        long = "capabilities",
        env = "HERALD_CAPABILITIES",
        value_delimiter = ',',
        default_value = "message-cache",
        help = "Capabilities enabled at startup"
    )]
    pub capabilities: Vec<String>,

    #[arg(
        long = "reconnect-delay-ms",
        env = "HERALD_RECONNECT_DELAY_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Fixed delay before reconnecting after a session close"
    )]
    pub reconnect_delay_ms: u64,

    #[arg(
        long = "resolve-timeout-ms",
        env = "HERALD_RESOLVE_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Timeout for one identifier lookup against the gateway"
    )]
    pub resolve_timeout_ms: u64,

    #[arg(
        long = "connect-timeout-ms",
        env = "HERALD_CONNECT_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Timeout for the gateway handshake on each connect attempt"
    )]
    pub connect_timeout_ms: u64,

    #[arg(
        long = "owner-id",
        env = "HERALD_OWNER_ID",
        help = "Legacy identifier of the bot owner, resolved on every open"
    )]
    pub owner_id: Option<String>,

    #[arg(
        long = "skip-migration",
        env = "HERALD_SKIP_MIGRATION",
        action = ArgAction::SetTrue,
        help = "Disable the identity migration on open"
    )]
    pub skip_migration: bool,

    #[arg(
        long = "migration-dry-run",
        env = "HERALD_MIGRATION_DRY_RUN",
        action = ArgAction::SetTrue,
        help = "Report identity migration effects without writing"
    )]
    pub migration_dry_run: bool,

    #[arg(
        long = "migration-pattern",
        env = "HERALD_MIGRATION_PATTERN",
        default_value = DEFAULT_LEGACY_PATTERN,
        help = "Regex matching legacy identifiers"
    )]
    pub migration_pattern: String,

    #[arg(
        long = "migration-batch-size",
        env = "HERALD_MIGRATION_BATCH_SIZE",
        default_value_t = 5,
        value_parser = parse_positive_usize,
        help = "Identifier lookups issued concurrently per batch"
    )]
    pub migration_batch_size: usize,

    #[arg(
        long = "migration-max-attempts",
        env = "HERALD_MIGRATION_MAX_ATTEMPTS",
        default_value_t = 3,
        value_parser = parse_positive_u32,
        help = "Attempts per identifier lookup before it becomes an orphan"
    )]
    pub migration_max_attempts: u32,

    #[arg(
        long = "migration-backoff-ms",
        env = "HERALD_MIGRATION_BACKOFF_MS",
        default_value_t = 100,
        help = "Linear backoff step between lookup attempts"
    )]
    pub migration_backoff_ms: u64,

    #[arg(
        long = "migration-batch-pause-ms",
        env = "HERALD_MIGRATION_BATCH_PAUSE_MS",
        default_value_t = 200,
        help = "Pause between lookup batches"
    )]
    pub migration_batch_pause_ms: u64,

    #[arg(
        long = "shutdown-grace-ms",
        env = "HERALD_SHUTDOWN_GRACE_MS",
        default_value_t = 10_000,
        help = "Grace window for in-flight messages on shutdown"
    )]
    pub shutdown_grace_ms: u64,

    #[arg(
        long = "monitor-interval-ms",
        env = "HERALD_MONITOR_INTERVAL_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Memory sampling interval"
    )]
    pub monitor_interval_ms: u64,

    #[arg(
        long = "memory-soft-limit-mb",
        env = "HERALD_MEMORY_SOFT_LIMIT_MB",
        default_value_t = 512,
        value_parser = parse_positive_u64,
        help = "Resident memory above which moderate eviction runs"
    )]
    pub memory_soft_limit_mb: u64,

    #[arg(
        long = "memory-limit-mb",
        env = "HERALD_MEMORY_LIMIT_MB",
        value_parser = parse_positive_u64,
        help = "Memory ceiling for pressure ratios (defaults to total system memory)"
    )]
    pub memory_limit_mb: Option<u64>,

    #[arg(
        long = "memory-high-ratio",
        env = "HERALD_MEMORY_HIGH_RATIO",
        default_value_t = 0.85,
        value_parser = parse_ratio,
        help = "Usage ratio that triggers the high-pressure pass"
    )]
    pub memory_high_ratio: f64,

    #[arg(
        long = "memory-critical-ratio",
        env = "HERALD_MEMORY_CRITICAL_RATIO",
        default_value_t = 0.95,
        value_parser = parse_ratio,
        help = "Usage ratio that triggers emergency cleanup"
    )]
    pub memory_critical_ratio: f64,

    #[arg(
        long = "cache-wrap-threshold-bytes",
        env = "HERALD_CACHE_WRAP_THRESHOLD_BYTES",
        default_value_t = 16 * 1024,
        value_parser = parse_positive_usize,
        help = "Serialized size above which cache values are stored wrapped"
    )]
    pub cache_wrap_threshold_bytes: usize,
}

impl Cli {
    pub fn gateway_config(&self) -> GatewayConnectorConfig {
        let mut config = GatewayConnectorConfig::new(self.gateway_url.clone());
        config.resolve_timeout = Duration::from_millis(self.resolve_timeout_ms);
        config.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        config
    }

    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        if self.memory_high_ratio >= self.memory_critical_ratio {
            bail!(
                "--memory-high-ratio ({}) must be lower than --memory-critical-ratio ({})",
                self.memory_high_ratio,
                self.memory_critical_ratio
            );
        }

        let monitor = ResourceMonitorConfig {
            interval: Duration::from_millis(self.monitor_interval_ms),
            soft_limit_bytes: self.memory_soft_limit_mb.saturating_mul(BYTES_PER_MIB),
            high_ratio: self.memory_high_ratio,
            critical_ratio: self.memory_critical_ratio,
            ..ResourceMonitorConfig::default()
        };
        let migration = (!self.skip_migration).then(|| MigrationConfig {
            store_root: self.store_dir.clone(),
            legacy_pattern: self.migration_pattern.clone(),
            pacing: ResolvePacing {
                batch_size: self.migration_batch_size,
                max_attempts: self.migration_max_attempts,
                backoff_step: Duration::from_millis(self.migration_backoff_ms),
                batch_pause: Duration::from_millis(self.migration_batch_pause_ms),
            },
            dry_run: self.migration_dry_run,
        });

        Ok(RuntimeConfig {
            max_workers: self.max_workers,
            cache: CacheConfig {
                wrap_threshold_bytes: self.cache_wrap_threshold_bytes,
                ..CacheConfig::default()
            },
            monitor,
            memory_limit_bytes: self
                .memory_limit_mb
                .map(|limit| limit.saturating_mul(BYTES_PER_MIB)),
            media_dirs: self.media_dirs.clone(),
            migration,
            owner_legacy_id: self
                .owner_id
                .as_ref()
                .map(|owner| owner.trim().to_string())
                .filter(|owner| !owner.is_empty()),
            session: ConnectionManagerConfig {
                reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            },
            credentials_dir: self.auth_dir.clone(),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            capabilities: self.capabilities.clone(),
        })
    }
}
