use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use herald_cache::{CacheTierManager, TIER_MESSAGES};
use herald_ingest::ItemProcessor;
use herald_session::InboundMessage;

pub const MESSAGE_CACHE_CAPABILITY: &str = "message-cache";
pub const BUILTIN_CAPABILITIES: &[&str] = &[MESSAGE_CACHE_CAPABILITY];

/// Shared state handed to every capability invocation.
#[derive(Clone)]
pub struct CapabilityContext {
    pub cache: Arc<CacheTierManager>,
}

/// An optional feature that consumes inbound messages.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn accepts(&self, _message: &InboundMessage) -> bool {
        true
    }

    async fn handle(&self, message: &InboundMessage, context: &CapabilityContext) -> Result<()>;
}

/// Records every inbound message in the `messages` tier keyed by message id.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCacheCapability;

#[async_trait]
impl Capability for MessageCacheCapability {
    fn name(&self) -> &str {
        MESSAGE_CACHE_CAPABILITY
    }

    fn accepts(&self, message: &InboundMessage) -> bool {
        !message.id.is_empty()
    }

    async fn handle(&self, message: &InboundMessage, context: &CapabilityContext) -> Result<()> {
        context
            .cache
            .set(TIER_MESSAGES, &message.id, message, None)
            .with_context(|| format!("failed to cache message {}", message.id))
    }
}

/// Capabilities resolved once at startup, in registration order.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: Vec<Arc<dyn Capability>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.capabilities.iter().map(|capability| capability.name()))
            .finish()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from built-in capability names.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut registry = Self::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            let capability: Arc<dyn Capability> = match name {
                MESSAGE_CACHE_CAPABILITY => Arc::new(MessageCacheCapability),
                other => bail!(
                    "unknown capability '{other}' (available: {})",
                    BUILTIN_CAPABILITIES.join(", ")
                ),
            };
            registry.register(capability)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<()> {
        if self.get(capability.name()).is_some() {
            bail!("capability '{}' is already registered", capability.name());
        }
        self.capabilities.push(capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities
            .iter()
            .find(|capability| capability.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .map(|capability| capability.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<dyn Capability>> {
        self.capabilities.iter()
    }
}

/// Queue processor fanning each message out to the accepting capabilities.
pub struct CapabilityDispatcher {
    registry: CapabilityRegistry,
    context: CapabilityContext,
}

impl CapabilityDispatcher {
    pub fn new(registry: CapabilityRegistry, context: CapabilityContext) -> Self {
        Self { registry, context }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }
}

#[async_trait]
impl ItemProcessor<InboundMessage, ()> for CapabilityDispatcher {
    async fn process(&self, message: &InboundMessage) -> Result<()> {
        for capability in self.registry.iter() {
            if !capability.accepts(message) {
                continue;
            }
            capability
                .handle(message, &self.context)
                .await
                .with_context(|| {
                    format!(
                        "capability '{}' failed on message {}",
                        capability.name(),
                        message.id
                    )
                })?;
        }
        Ok(())
    }
}
