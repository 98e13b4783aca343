use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::credential_store::CredentialStore;
use crate::session_state::DisconnectReason;

/// One inbound chat event. The runtime is content-agnostic; `payload`
/// carries whatever the transport delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub timestamp_unix_ms: u64,
    #[serde(default)]
    pub payload: Value,
}

/// Credential bootstrap material surfaced to the operator while connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Qr(String),
    PairingCode(String),
}

/// Events emitted by a live transport session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    AuthChallenge(AuthChallenge),
    Open,
    Close(DisconnectReason),
    Inbound(Vec<InboundMessage>),
}

/// Resolves a legacy identifier to its new-scheme equivalent through the live session.
#[async_trait]
pub trait IdentifierResolver: Send + Sync {
    /// `Ok(None)` means the session has no mapping for `legacy_id`.
    async fn resolve(&self, legacy_id: &str) -> Result<Option<String>>;
}

/// A connected transport: its event stream plus the resolver bound to it.
pub struct LiveSession {
    pub events: mpsc::Receiver<SessionEvent>,
    pub resolver: Arc<dyn IdentifierResolver>,
}

/// Opens new transport sessions. Exactly one session is live at a time.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, credentials: &CredentialStore) -> Result<LiveSession>;
}

/// Resolver used before any session is open; resolves nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

#[async_trait]
impl IdentifierResolver for NullResolver {
    async fn resolve(&self, _legacy_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}
