use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::session_transport::AuthChallenge;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Error returned when an input does not apply to the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionTransitionError {
    #[error("invalid session transition: {from:?} -> {to:?}")]
    Invalid { from: SessionState, to: SessionState },
    #[error("session input {input} ignored in state {state:?}")]
    Ignored {
        input: &'static str,
        state: SessionState,
    },
}

/// Lifecycle state of the single external session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    /// Returns true when this state can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Closed, Self::Connecting)
                | (Self::Connecting, Self::Connecting)
                | (Self::Connecting, Self::Open)
                | (Self::Open, Self::Connecting)
                | (_, Self::Closed)
        )
    }

    pub fn ensure_transition(self, next: Self) -> Result<(), SessionTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(SessionTransitionError::Invalid {
            from: self,
            to: next,
        })
    }
}

/// Why the transport closed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    NetworkLoss,
    Replaced,
    TimedOut,
    RestartRequired,
    LoggedOut,
    BadSession,
    Other(String),
}

impl DisconnectReason {
    /// Parses a transport reason code; unknown codes are kept verbatim.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "network_loss" | "connection_lost" | "connection_closed" => Self::NetworkLoss,
            "replaced" | "connection_replaced" => Self::Replaced,
            "timed_out" | "timeout" => Self::TimedOut,
            "restart_required" => Self::RestartRequired,
            "logged_out" => Self::LoggedOut,
            "bad_session" => Self::BadSession,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::NetworkLoss => "network_loss",
            Self::Replaced => "replaced",
            Self::TimedOut => "timed_out",
            Self::RestartRequired => "restart_required",
            Self::LoggedOut => "logged_out",
            Self::BadSession => "bad_session",
            Self::Other(code) => code.as_str(),
        }
    }

    /// Logged-out and bad-session closes invalidate stored credentials.
    pub fn requires_credential_reset(&self) -> bool {
        matches!(self, Self::LoggedOut | Self::BadSession)
    }
}

/// Observable session status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    pub last_disconnect: Option<DisconnectReason>,
    pub retry_count: u32,
    pub open_count: u64,
}

/// Inputs driving the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Start,
    AuthChallenge(AuthChallenge),
    Opened,
    Closed(DisconnectReason),
    ReconnectDue,
    Shutdown,
}

impl SessionInput {
    fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AuthChallenge(_) => "auth_challenge",
            Self::Opened => "opened",
            Self::Closed(_) => "closed",
            Self::ReconnectDue => "reconnect_due",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Side effects the driver performs after a transition, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    OpenTransport { attempt: u32 },
    SurfaceChallenge(AuthChallenge),
    RunBootstrap,
    WipeCredentials,
    ScheduleReconnect { delay: Duration },
}

/// Pure session state machine.
///
/// At most one reconnect is pending at any time; closes that arrive while a
/// reconnect is already scheduled produce no actions.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    status: SessionStatus,
    reconnect_delay: Duration,
    reconnect_pending: bool,
}

impl SessionMachine {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            status: SessionStatus::default(),
            reconnect_delay,
            reconnect_pending: false,
        }
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn state(&self) -> SessionState {
        self.status.state
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionTransitionError> {
        self.status.state.ensure_transition(next)?;
        self.status.state = next;
        Ok(())
    }

    fn ignored(&self, input: &SessionInput) -> SessionTransitionError {
        SessionTransitionError::Ignored {
            input: input.label(),
            state: self.status.state,
        }
    }

    pub fn apply(
        &mut self,
        input: SessionInput,
    ) -> Result<Vec<SessionAction>, SessionTransitionError> {
        match input {
            SessionInput::Start => {
                if !matches!(
                    self.status.state,
                    SessionState::Disconnected | SessionState::Closed
                ) {
                    return Err(SessionTransitionError::Invalid {
                        from: self.status.state,
                        to: SessionState::Connecting,
                    });
                }
                self.transition(SessionState::Connecting)?;
                self.reconnect_pending = false;
                Ok(vec![SessionAction::OpenTransport {
                    attempt: self.status.retry_count,
                }])
            }
            SessionInput::AuthChallenge(challenge) => {
                if self.status.state != SessionState::Connecting || self.reconnect_pending {
                    return Err(self.ignored(&SessionInput::AuthChallenge(challenge)));
                }
                Ok(vec![SessionAction::SurfaceChallenge(challenge)])
            }
            SessionInput::Opened => {
                if self.status.state != SessionState::Connecting || self.reconnect_pending {
                    return Err(self.ignored(&input));
                }
                self.transition(SessionState::Open)?;
                self.status.retry_count = 0;
                self.status.open_count = self.status.open_count.saturating_add(1);
                Ok(vec![SessionAction::RunBootstrap])
            }
            SessionInput::Closed(reason) => {
                if self.status.state == SessionState::Closed || self.reconnect_pending {
                    return Ok(Vec::new());
                }
                self.transition(SessionState::Connecting)?;
                self.reconnect_pending = true;
                let mut actions = Vec::with_capacity(2);
                if reason.requires_credential_reset() {
                    actions.push(SessionAction::WipeCredentials);
                }
                actions.push(SessionAction::ScheduleReconnect {
                    delay: self.reconnect_delay,
                });
                self.status.last_disconnect = Some(reason);
                Ok(actions)
            }
            SessionInput::ReconnectDue => {
                if self.status.state != SessionState::Connecting || !self.reconnect_pending {
                    return Ok(Vec::new());
                }
                self.reconnect_pending = false;
                self.status.retry_count = self.status.retry_count.saturating_add(1);
                Ok(vec![SessionAction::OpenTransport {
                    attempt: self.status.retry_count,
                }])
            }
            SessionInput::Shutdown => {
                self.transition(SessionState::Closed)?;
                self.reconnect_pending = false;
                Ok(Vec::new())
            }
        }
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_DELAY)
    }
}
