use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::error::Elapsed;
use tokio::time::Instant;

use crate::credential_store::CredentialStore;
use crate::session_state::{
    DisconnectReason, SessionAction, SessionInput, SessionMachine, SessionStatus,
    DEFAULT_RECONNECT_DELAY,
};
use crate::session_transport::{
    AuthChallenge, IdentifierResolver, InboundMessage, NullResolver, SessionConnector,
    SessionEvent,
};

/// Callbacks invoked by the connection driver.
///
/// Errors returned from `on_open` are logged; they never stop the session.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    fn on_auth_challenge(&self, challenge: &AuthChallenge);
    async fn on_open(&self, resolver: Arc<dyn IdentifierResolver>) -> Result<()>;
    async fn on_inbound(&self, messages: Vec<InboundMessage>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionManagerConfig {
    pub reconnect_delay: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

enum Step {
    Shutdown,
    ReconnectDue,
    Event(SessionEvent),
}

/// Drives one external session through its lifecycle until shutdown.
pub struct ConnectionManager {
    connector: Arc<dyn SessionConnector>,
    credentials: CredentialStore,
    hooks: Arc<dyn SessionHooks>,
    machine: SessionMachine,
    status_tx: watch::Sender<SessionStatus>,
    connect_attempts: Arc<AtomicU64>,
    live: Option<mpsc::Receiver<SessionEvent>>,
    resolver: Arc<dyn IdentifierResolver>,
    reconnect_at: Option<Instant>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionManagerConfig,
        connector: Arc<dyn SessionConnector>,
        credentials: CredentialStore,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        let machine = SessionMachine::new(config.reconnect_delay);
        let (status_tx, _) = watch::channel(machine.status().clone());
        Self {
            connector,
            credentials,
            hooks,
            machine,
            status_tx,
            connect_attempts: Arc::new(AtomicU64::new(0)),
            live: None,
            resolver: Arc::new(NullResolver),
            reconnect_at: None,
            shutdown: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.machine.status().clone()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Shared counter of transport connect attempts, readable while `run` holds `&mut self`.
    pub fn connect_attempts_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.connect_attempts)
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.shutdown = Some(shutdown.clone());
        self.apply(SessionInput::Start).await?;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let deadline = self.reconnect_at;
            let step = {
                let live = self.live.as_mut();
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            Step::Shutdown
                        } else {
                            continue;
                        }
                    }
                    _ = sleep_until_deadline(deadline), if deadline.is_some() => Step::ReconnectDue,
                    event = recv_live(live) => match event {
                        Some(event) => Step::Event(event),
                        None => Step::Event(SessionEvent::Close(DisconnectReason::NetworkLoss)),
                    },
                }
            };

            match step {
                Step::Shutdown => break,
                Step::ReconnectDue => {
                    self.reconnect_at = None;
                    self.apply(SessionInput::ReconnectDue).await?;
                }
                Step::Event(SessionEvent::Inbound(messages)) => {
                    self.hooks.on_inbound(messages).await;
                }
                Step::Event(SessionEvent::AuthChallenge(challenge)) => {
                    self.apply_logged(SessionInput::AuthChallenge(challenge)).await;
                }
                Step::Event(SessionEvent::Open) => {
                    self.apply_logged(SessionInput::Opened).await;
                }
                Step::Event(SessionEvent::Close(reason)) => {
                    self.live = None;
                    self.resolver = Arc::new(NullResolver);
                    self.apply(SessionInput::Closed(reason)).await?;
                }
            }
        }

        self.live = None;
        self.reconnect_at = None;
        self.shutdown = None;
        self.apply(SessionInput::Shutdown).await?;
        tracing::info!("session manager stopped");
        Ok(())
    }

    async fn apply_logged(&mut self, input: SessionInput) {
        if let Err(error) = self.apply(input).await {
            tracing::warn!(error = %error, "session event ignored");
        }
    }

    async fn apply(&mut self, input: SessionInput) -> Result<()> {
        let mut next = Some(input);
        while let Some(input) = next.take() {
            let actions = self.machine.apply(input)?;
            self.publish();
            for action in actions {
                if let Some(follow_up) = self.perform(action).await {
                    next = Some(follow_up);
                }
            }
        }
        Ok(())
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.machine.status().clone());
    }

    /// Performs one side effect; returns an input to feed back into the machine.
    async fn perform(&mut self, action: SessionAction) -> Option<SessionInput> {
        match action {
            SessionAction::OpenTransport { attempt } => {
                self.connect_attempts.fetch_add(1, Ordering::Relaxed);
                tracing::info!(attempt, "opening session transport");
                match self.connector.connect(&self.credentials).await {
                    Ok(session) => {
                        self.live = Some(session.events);
                        self.resolver = session.resolver;
                    }
                    Err(error) => {
                        let reason = if error.downcast_ref::<Elapsed>().is_some() {
                            DisconnectReason::TimedOut
                        } else {
                            DisconnectReason::NetworkLoss
                        };
                        tracing::warn!(
                            attempt,
                            reason = reason.as_str(),
                            error = %format!("{error:#}"),
                            "session connect failed"
                        );
                        return Some(SessionInput::Closed(reason));
                    }
                }
            }
            SessionAction::SurfaceChallenge(challenge) => {
                self.hooks.on_auth_challenge(&challenge);
            }
            SessionAction::RunBootstrap => {
                tracing::info!("session open; running bootstrap");
                let bootstrap = self.hooks.on_open(Arc::clone(&self.resolver));
                // Shutdown abandons a bootstrap still waiting on remote lookups.
                let outcome = match self.shutdown.clone() {
                    Some(mut shutdown) => tokio::select! {
                        result = bootstrap => Some(result),
                        _ = shutdown.wait_for(|stop| *stop) => None,
                    },
                    None => Some(bootstrap.await),
                };
                match outcome {
                    Some(Ok(())) => {}
                    Some(Err(error)) => {
                        tracing::error!(error = %format!("{error:#}"), "session bootstrap failed");
                    }
                    None => tracing::warn!("shutdown requested; session bootstrap abandoned"),
                }
            }
            SessionAction::WipeCredentials => {
                tracing::warn!(
                    dir = %self.credentials.dir().display(),
                    "session rejected credentials; wiping credential store"
                );
                if let Err(error) = self.credentials.clear() {
                    tracing::error!(error = %format!("{error:#}"), "failed to wipe credentials");
                }
            }
            SessionAction::ScheduleReconnect { delay } => {
                let reason = self
                    .machine
                    .status()
                    .last_disconnect
                    .as_ref()
                    .map(|reason| reason.as_str().to_string())
                    .unwrap_or_default();
                tracing::warn!(
                    reason = %reason,
                    delay_ms = delay.as_millis() as u64,
                    retry_count = self.machine.status().retry_count,
                    "session closed; reconnect scheduled"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
        }
        None
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn recv_live(live: Option<&mut mpsc::Receiver<SessionEvent>>) -> Option<SessionEvent> {
    match live {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
