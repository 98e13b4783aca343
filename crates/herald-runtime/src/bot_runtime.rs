use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use herald_cache::{
    start_cache_sweeper, start_resource_monitor, CacheConfig, CacheSweeperHandle,
    CacheTierManager, EmergencyCleanup, MemoryProbe, ProcessMemoryProbe, ResourceMonitor,
    ResourceMonitorConfig, ResourceMonitorHandle, TIER_USERS,
};
use herald_ingest::{MessageQueue, QueueItemView, QueueStats, DEFAULT_MAX_WORKERS};
use herald_migration::{IdentityMigration, MigrationConfig, MigrationReport};
use herald_session::{
    AuthChallenge, ConnectionManager, ConnectionManagerConfig, CredentialStore,
    IdentifierResolver, InboundMessage, SessionConnector, SessionHooks,
};
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::capability_registry::{CapabilityContext, CapabilityDispatcher, CapabilityRegistry};

pub const OWNER_CACHE_KEY: &str = "owner";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_workers: usize,
    pub cache: CacheConfig,
    pub monitor: ResourceMonitorConfig,
    pub memory_limit_bytes: Option<u64>,
    pub media_dirs: Vec<PathBuf>,
    /// `None` disables the identity migration.
    pub migration: Option<MigrationConfig>,
    pub owner_legacy_id: Option<String>,
    pub session: ConnectionManagerConfig,
    pub credentials_dir: PathBuf,
    pub shutdown_grace: Duration,
    pub capabilities: Vec<String>,
}

impl RuntimeConfig {
    pub fn new(credentials_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            cache: CacheConfig::default(),
            monitor: ResourceMonitorConfig::default(),
            memory_limit_bytes: None,
            media_dirs: Vec::new(),
            migration: None,
            owner_legacy_id: None,
            session: ConnectionManagerConfig::default(),
            credentials_dir: credentials_dir.into(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            capabilities: vec![crate::MESSAGE_CACHE_CAPABILITY.to_string()],
        }
    }
}

#[derive(Default)]
struct RuntimeTimers {
    monitor: Option<ResourceMonitorHandle>,
    sweeper: Option<CacheSweeperHandle>,
}

/// What shutdown did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub drained: bool,
    pub abandoned_items: usize,
    pub flushed_entries: usize,
    pub queue: QueueStats,
}

/// Process-wide runtime context: caches, queue and bootstrap state.
///
/// Created once at startup and handed to the session driver as its hooks.
pub struct BotRuntime {
    cache: Arc<CacheTierManager>,
    emergency: Arc<EmergencyCleanup>,
    monitor: Arc<ResourceMonitor>,
    queue: MessageQueue<InboundMessage, ()>,
    dispatcher: Arc<CapabilityDispatcher>,
    migration: Option<IdentityMigration>,
    owner_legacy_id: Option<String>,
    shutdown_grace: Duration,
    timers: Mutex<RuntimeTimers>,
    listener_attached: AtomicBool,
    bootstrap_runs: AtomicU64,
    dropped_before_attach: AtomicU64,
    last_migration: std::sync::Mutex<Option<MigrationReport>>,
}

impl BotRuntime {
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        let probe: Arc<dyn MemoryProbe> = Arc::new(ProcessMemoryProbe {
            limit_bytes: config.memory_limit_bytes,
        });
        Self::with_probe(config, probe)
    }

    pub fn with_probe(config: RuntimeConfig, probe: Arc<dyn MemoryProbe>) -> Result<Arc<Self>> {
        validate_timer_config(&config)?;
        let cache = Arc::new(CacheTierManager::new(config.cache));
        let emergency = Arc::new(EmergencyCleanup::new(
            Arc::clone(&cache),
            config.media_dirs,
        ));
        let monitor = Arc::new(ResourceMonitor::new(
            config.monitor,
            Arc::clone(&cache),
            Arc::clone(&emergency),
            probe,
        ));
        let registry = CapabilityRegistry::from_names(&config.capabilities)
            .context("failed to build capability registry")?;
        tracing::info!(capabilities = ?registry.names(), "capability registry ready");
        let dispatcher = Arc::new(CapabilityDispatcher::new(
            registry,
            CapabilityContext {
                cache: Arc::clone(&cache),
            },
        ));
        let migration = config
            .migration
            .map(IdentityMigration::new)
            .transpose()
            .context("invalid identity migration config")?;

        let queue = MessageQueue::new(config.max_workers);
        let handler_emergency = Arc::clone(&emergency);
        queue.set_error_handler(Arc::new(
            move |item: &QueueItemView<'_, InboundMessage>, error: &anyhow::Error| {
                let rendered = format!("{error:#}");
                tracing::error!(
                    item_id = item.id,
                    message_id = %item.payload.id,
                    chat_id = %item.payload.chat_id,
                    error = %rendered,
                    "message processing failed"
                );
                if let Some(outcome) = handler_emergency.handle_error(&rendered) {
                    tracing::warn!(outcome = ?outcome, "resource exhaustion in message processing");
                }
            },
        ));

        Ok(Arc::new(Self {
            cache,
            emergency,
            monitor,
            queue,
            dispatcher,
            migration,
            owner_legacy_id: config.owner_legacy_id,
            shutdown_grace: config.shutdown_grace,
            timers: Mutex::new(RuntimeTimers::default()),
            listener_attached: AtomicBool::new(false),
            bootstrap_runs: AtomicU64::new(0),
            dropped_before_attach: AtomicU64::new(0),
            last_migration: std::sync::Mutex::new(None),
        }))
    }

    pub fn cache(&self) -> &Arc<CacheTierManager> {
        &self.cache
    }

    pub fn emergency(&self) -> &Arc<EmergencyCleanup> {
        &self.emergency
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn queue(&self) -> &MessageQueue<InboundMessage, ()> {
        &self.queue
    }

    pub fn is_listener_attached(&self) -> bool {
        self.listener_attached.load(Ordering::Acquire)
    }

    pub fn bootstrap_runs(&self) -> u64 {
        self.bootstrap_runs.load(Ordering::Relaxed)
    }

    pub fn dropped_before_attach(&self) -> u64 {
        self.dropped_before_attach.load(Ordering::Relaxed)
    }

    pub fn last_migration(&self) -> Option<MigrationReport> {
        self.last_migration
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub async fn timers_running(&self) -> bool {
        let timers = self.timers.lock().await;
        timers.monitor.as_ref().is_some_and(|handle| handle.is_running())
            && timers.sweeper.as_ref().is_some_and(|handle| handle.is_running())
    }

    async fn ensure_timers(&self) -> Result<()> {
        let mut timers = self.timers.lock().await;
        if timers.monitor.is_none() {
            timers.monitor = Some(start_resource_monitor(Arc::clone(&self.monitor))?);
            tracing::info!(
                interval_ms = self.monitor.config().interval.as_millis() as u64,
                "resource monitor started"
            );
        }
        if timers.sweeper.is_none() {
            timers.sweeper = Some(start_cache_sweeper(Arc::clone(&self.cache))?);
        }
        Ok(())
    }

    async fn run_migration(&self, resolver: &dyn IdentifierResolver) {
        let Some(migration) = self.migration.as_ref() else {
            return;
        };
        match migration.run(resolver).await {
            Ok(report) => {
                *self
                    .last_migration
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(report);
            }
            Err(error) => {
                tracing::error!(error = %format!("{error:#}"), "identity migration failed");
            }
        }
    }

    async fn resolve_owner(&self, resolver: &dyn IdentifierResolver) {
        let Some(owner) = self.owner_legacy_id.as_deref() else {
            return;
        };
        match resolver.resolve(owner).await {
            Ok(Some(new_id)) => {
                if let Err(error) = self.cache.set(TIER_USERS, OWNER_CACHE_KEY, &new_id, None) {
                    tracing::warn!(error = %error, "failed to cache owner identity");
                } else {
                    tracing::info!(owner = %new_id, "owner identity resolved");
                }
            }
            Ok(None) => tracing::warn!(owner, "owner identity has no new-scheme mapping"),
            Err(error) => {
                tracing::warn!(owner, error = %format!("{error:#}"), "owner identity lookup failed");
            }
        }
    }

    fn attach_listener(&self) {
        if self
            .listener_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!(
                max_workers = self.queue.max_workers(),
                "message listener attached"
            );
        }
    }

    /// Drains in-flight items within the grace window, stops timers and flushes caches.
    pub async fn shutdown(&self) -> ShutdownReport {
        let drained = self.queue.drain(self.shutdown_grace).await;
        let stats = self.queue.stats();
        let abandoned_items = stats.pending + stats.active_workers;
        if !drained {
            tracing::warn!(
                abandoned_items,
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "shutdown grace window elapsed with items in flight"
            );
        }
        {
            let mut timers = self.timers.lock().await;
            if let Some(mut monitor) = timers.monitor.take() {
                monitor.shutdown().await;
            }
            if let Some(mut sweeper) = timers.sweeper.take() {
                sweeper.shutdown().await;
            }
        }
        let flushed_entries = self.cache.flush_all();
        tracing::info!(
            drained,
            processed = stats.total_processed,
            errors = stats.total_errors,
            flushed_entries,
            "runtime stopped"
        );
        ShutdownReport {
            drained,
            abandoned_items,
            flushed_entries,
            queue: stats,
        }
    }
}

#[async_trait]
impl SessionHooks for BotRuntime {
    fn on_auth_challenge(&self, challenge: &AuthChallenge) {
        match challenge {
            AuthChallenge::Qr(payload) => {
                tracing::info!("authentication required; scan the QR payload");
                println!("herald auth qr: {payload}");
            }
            AuthChallenge::PairingCode(code) => {
                tracing::info!("authentication required; enter the pairing code");
                println!("herald pairing code: {code}");
            }
        }
    }

    async fn on_open(&self, resolver: Arc<dyn IdentifierResolver>) -> Result<()> {
        self.bootstrap_runs.fetch_add(1, Ordering::Relaxed);
        if let Err(error) = self.ensure_timers().await {
            tracing::error!(error = %format!("{error:#}"), "failed to start resource timers");
        }
        self.run_migration(resolver.as_ref()).await;
        self.resolve_owner(resolver.as_ref()).await;
        self.attach_listener();
        Ok(())
    }

    async fn on_inbound(&self, messages: Vec<InboundMessage>) {
        if !self.is_listener_attached() {
            self.dropped_before_attach
                .fetch_add(messages.len() as u64, Ordering::Relaxed);
            tracing::debug!(count = messages.len(), "inbound batch before listener attach");
            return;
        }
        for message in messages {
            // Failures are reported through the queue error handler.
            let _ticket = self
                .queue
                .enqueue(message, Arc::clone(&self.dispatcher) as _);
        }
    }
}

/// Runs the session until `shutdown` resolves, then shuts the runtime down.
pub async fn run_session<F>(
    runtime: Arc<BotRuntime>,
    connector: Arc<dyn SessionConnector>,
    session: ConnectionManagerConfig,
    credentials: CredentialStore,
    shutdown: F,
) -> Result<ShutdownReport>
where
    F: Future<Output = ()>,
{
    let hooks: Arc<dyn SessionHooks> = runtime.clone();
    let mut manager = ConnectionManager::new(session, connector, credentials, hooks);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut session_task = tokio::spawn(async move { manager.run(shutdown_rx).await });

    let mut session_finished = false;
    tokio::select! {
        _ = shutdown => {
            tracing::info!("shutdown requested");
        }
        result = &mut session_task => {
            session_finished = true;
            match result {
                Ok(Ok(())) => tracing::warn!("session driver exited"),
                Ok(Err(error)) => tracing::error!(error = %format!("{error:#}"), "session driver failed"),
                Err(error) => tracing::error!(error = %error, "session driver panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if !session_finished {
        match tokio::time::timeout(runtime.shutdown_grace, &mut session_task).await {
            Ok(Ok(result)) => result.context("session driver failed during shutdown")?,
            Ok(Err(error)) => return Err(error).context("session driver task failed"),
            Err(_) => {
                tracing::warn!(
                    grace_ms = runtime.shutdown_grace.as_millis() as u64,
                    "session driver did not stop within the grace window; aborting it"
                );
                session_task.abort();
            }
        }
    }
    Ok(runtime.shutdown().await)
}

fn validate_timer_config(config: &RuntimeConfig) -> Result<()> {
    if config.monitor.interval.is_zero() {
        bail!("resource monitor interval must be greater than zero");
    }
    if config
        .cache
        .tiers
        .iter()
        .all(|tier| tier.sweep_period.is_zero())
    {
        bail!("at least one cache tier needs a non-zero sweep period");
    }
    Ok(())
}
