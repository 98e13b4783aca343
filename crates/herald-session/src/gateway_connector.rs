use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::credential_store::CredentialStore;
use crate::session_state::DisconnectReason;
use crate::session_transport::{
    AuthChallenge, IdentifierResolver, InboundMessage, LiveSession, SessionConnector,
    SessionEvent,
};

pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConnectorConfig {
    pub url: String,
    pub resolve_timeout: Duration,
    /// Bound on the TCP/WebSocket handshake plus the hello frame.
    pub connect_timeout: Duration,
}

impl GatewayConnectorConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Frames received from the gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GatewayFrame {
    AuthQr {
        code: String,
    },
    AuthPairingCode {
        code: String,
    },
    Credentials {
        credentials: Value,
    },
    Open,
    Close {
        #[serde(default)]
        reason: String,
    },
    Messages {
        #[serde(default)]
        items: Vec<InboundMessage>,
    },
    ResolveResult {
        request_id: u64,
        #[serde(default)]
        new_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Frames sent to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Hello { credentials: Option<Value> },
    Resolve { request_id: u64, legacy_id: String },
}

type PendingResolves = Arc<Mutex<HashMap<u64, oneshot::Sender<Option<String>>>>>;

fn lock_pending(
    pending: &Mutex<HashMap<u64, oneshot::Sender<Option<String>>>>,
) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Option<String>>>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// JSON-over-WebSocket bridge to an external messaging gateway.
#[derive(Debug, Clone)]
pub struct GatewayConnector {
    config: GatewayConnectorConfig,
}

impl GatewayConnector {
    pub fn new(config: GatewayConnectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for GatewayConnector {
    async fn connect(&self, credentials: &CredentialStore) -> Result<LiveSession> {
        let hello = ClientFrame::Hello {
            credentials: credentials.load()?,
        };
        let handshake = async {
            let (stream, _response) = connect_async(self.config.url.as_str())
                .await
                .with_context(|| format!("failed to connect gateway {}", self.config.url))?;
            let (mut sink, source) = stream.split();
            sink.send(WsMessage::Text(serde_json::to_string(&hello)?.into()))
                .await
                .context("failed to send gateway hello")?;
            Ok::<_, anyhow::Error>((sink, source))
        };
        let (mut sink, mut source) = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .with_context(|| {
                format!(
                    "gateway handshake with {} timed out after {}ms",
                    self.config.url,
                    self.config.connect_timeout.as_millis()
                )
            })??;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientFrame>(OUTBOUND_BUFFER);
        let pending: PendingResolves = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(error) => {
                        tracing::warn!(error = %error, "failed to encode gateway frame");
                        continue;
                    }
                };
                if let Err(error) = sink.send(WsMessage::Text(text.into())).await {
                    tracing::warn!(error = %error, "gateway write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_pending = Arc::clone(&pending);
        let store = credentials.clone();
        tokio::spawn(async move {
            let mut closed = false;
            while let Some(message) = source.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(error) => {
                        tracing::warn!(error = %error, "gateway read failed");
                        break;
                    }
                };
                let frame = match parse_gateway_message(message) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(error) => {
                        tracing::warn!(error = %format!("{error:#}"), "dropping malformed gateway frame");
                        continue;
                    }
                };
                let event = match frame {
                    GatewayFrame::AuthQr { code } => {
                        SessionEvent::AuthChallenge(AuthChallenge::Qr(code))
                    }
                    GatewayFrame::AuthPairingCode { code } => {
                        SessionEvent::AuthChallenge(AuthChallenge::PairingCode(code))
                    }
                    GatewayFrame::Credentials { credentials } => {
                        if let Err(error) = store.save(&credentials) {
                            tracing::error!(error = %format!("{error:#}"), "failed to store gateway credentials");
                        }
                        continue;
                    }
                    GatewayFrame::Open => SessionEvent::Open,
                    GatewayFrame::Close { reason } => {
                        closed = true;
                        SessionEvent::Close(close_reason(&reason))
                    }
                    GatewayFrame::Messages { items } => SessionEvent::Inbound(items),
                    GatewayFrame::ResolveResult { request_id, new_id } => {
                        match lock_pending(&reader_pending).remove(&request_id) {
                            Some(waiter) => {
                                let _ = waiter.send(new_id);
                            }
                            None => {
                                tracing::debug!(request_id, "late gateway resolve result");
                            }
                        }
                        continue;
                    }
                    GatewayFrame::Unknown => continue,
                };
                if events_tx.send(event).await.is_err() || closed {
                    break;
                }
            }
            if !closed {
                let _ = events_tx
                    .send(SessionEvent::Close(DisconnectReason::NetworkLoss))
                    .await;
            }
            lock_pending(&reader_pending).clear();
        });

        Ok(LiveSession {
            events: events_rx,
            resolver: Arc::new(GatewayResolver {
                outbound: outbound_tx,
                pending,
                next_request_id: AtomicU64::new(1),
                timeout: self.config.resolve_timeout,
            }),
        })
    }
}

/// Resolves identifiers by round-tripping `resolve` frames over the live socket.
struct GatewayResolver {
    outbound: mpsc::Sender<ClientFrame>,
    pending: PendingResolves,
    next_request_id: AtomicU64,
    timeout: Duration,
}

#[async_trait]
impl IdentifierResolver for GatewayResolver {
    async fn resolve(&self, legacy_id: &str) -> Result<Option<String>> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(request_id, tx);

        let frame = ClientFrame::Resolve {
            request_id,
            legacy_id: legacy_id.to_string(),
        };
        if self.outbound.send(frame).await.is_err() {
            lock_pending(&self.pending).remove(&request_id);
            bail!("gateway session closed");
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(new_id)) => Ok(new_id.filter(|id| !id.trim().is_empty())),
            Ok(Err(_)) => Err(anyhow!(
                "gateway session closed before resolving {legacy_id}"
            )),
            Err(_) => {
                lock_pending(&self.pending).remove(&request_id);
                Err(anyhow!(
                    "resolve of {legacy_id} timed out after {}ms",
                    self.timeout.as_millis()
                ))
            }
        }
    }
}

fn close_reason(raw: &str) -> DisconnectReason {
    if raw.trim().is_empty() {
        return DisconnectReason::NetworkLoss;
    }
    DisconnectReason::parse(raw)
}

fn parse_gateway_message(message: WsMessage) -> Result<Option<GatewayFrame>> {
    match message {
        WsMessage::Text(text) => {
            let frame = serde_json::from_str::<GatewayFrame>(text.as_str())
                .context("failed to parse gateway frame")?;
            Ok(Some(frame))
        }
        WsMessage::Binary(bytes) => {
            let frame = serde_json::from_slice::<GatewayFrame>(&bytes)
                .context("failed to parse gateway frame")?;
            Ok(Some(frame))
        }
        WsMessage::Close(_) => Ok(Some(GatewayFrame::Close {
            reason: String::new(),
        })),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage, WebSocketStream};

    use super::{
        parse_gateway_message, GatewayConnector, GatewayConnectorConfig, GatewayFrame,
    };
    use crate::credential_store::CredentialStore;
    use crate::session_state::DisconnectReason;
    use crate::session_transport::{AuthChallenge, SessionConnector, SessionEvent};

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            let message = ws.next().await.expect("frame").expect("frame ok");
            if let WsMessage::Text(text) = message {
                return serde_json::from_str(text.as_str()).expect("json frame");
            }
        }
    }

    async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
        ws.send(WsMessage::Text(value.to_string().into()))
            .await
            .expect("send frame");
    }

    #[test]
    fn unit_parse_gateway_message_handles_unknown_and_control_frames() {
        let unknown = parse_gateway_message(WsMessage::Text(
            json!({"type": "presence", "who": "x"}).to_string().into(),
        ))
        .expect("parse");
        assert_eq!(unknown, Some(GatewayFrame::Unknown));

        let close = parse_gateway_message(WsMessage::Close(None)).expect("parse close");
        assert_eq!(
            close,
            Some(GatewayFrame::Close {
                reason: String::new()
            })
        );
        assert!(parse_gateway_message(WsMessage::Text("not json".into())).is_err());
    }

    #[tokio::test]
    async fn integration_gateway_connector_bridges_events_credentials_and_resolves() {
        let temp = tempfile::tempdir().expect("tempdir");
        let credentials = CredentialStore::new(temp.path().join("auth"));
        credentials
            .save(&json!({"token": "stored"}))
            .expect("seed credentials");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(tcp).await.expect("handshake");
            let hello = next_json(&mut ws).await;
            assert_eq!(hello["type"], "hello");
            assert_eq!(hello["credentials"]["token"], "stored");

            send_json(&mut ws, json!({"type": "auth_qr", "code": "qr-1"})).await;
            send_json(
                &mut ws,
                json!({"type": "credentials", "credentials": {"token": "fresh"}}),
            )
            .await;
            send_json(&mut ws, json!({"type": "open"})).await;
            send_json(
                &mut ws,
                json!({"type": "messages", "items": [{"id": "m1", "chat_id": "c1"}]}),
            )
            .await;

            for _ in 0..2 {
                let request = next_json(&mut ws).await;
                assert_eq!(request["type"], "resolve");
                let new_id = match request["legacy_id"].as_str() {
                    Some("111111@s.whatsapp.net") => json!("abc@lid"),
                    _ => Value::Null,
                };
                send_json(
                    &mut ws,
                    json!({
                        "type": "resolve_result",
                        "request_id": request["request_id"],
                        "new_id": new_id,
                    }),
                )
                .await;
            }

            send_json(&mut ws, json!({"type": "close", "reason": "logged_out"})).await;
            while let Some(Ok(_)) = ws.next().await {}
        });

        let connector = GatewayConnector::new(GatewayConnectorConfig::new(format!("ws://{addr}")));
        let mut live = connector.connect(&credentials).await.expect("connect");

        assert_eq!(
            live.events.recv().await,
            Some(SessionEvent::AuthChallenge(AuthChallenge::Qr(
                "qr-1".to_string()
            )))
        );
        assert_eq!(live.events.recv().await, Some(SessionEvent::Open));
        assert_eq!(
            credentials.load().expect("load"),
            Some(json!({"token": "fresh"}))
        );
        match live.events.recv().await {
            Some(SessionEvent::Inbound(items)) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].id, "m1");
                assert_eq!(items[0].chat_id, "c1");
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert_eq!(
            live.resolver
                .resolve("111111@s.whatsapp.net")
                .await
                .expect("resolve"),
            Some("abc@lid".to_string())
        );
        assert_eq!(
            live.resolver
                .resolve("222222@s.whatsapp.net")
                .await
                .expect("resolve orphan"),
            None
        );
        assert_eq!(
            live.events.recv().await,
            Some(SessionEvent::Close(DisconnectReason::LoggedOut))
        );

        drop(live);
        server.await.expect("server");
    }

    #[tokio::test]
    async fn regression_resolve_times_out_when_gateway_never_answers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let credentials = CredentialStore::new(temp.path().join("auth"));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(tcp).await.expect("handshake");
            let hello = next_json(&mut ws).await;
            assert_eq!(hello["credentials"], Value::Null);
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut config = GatewayConnectorConfig::new(format!("ws://{addr}"));
        config.resolve_timeout = Duration::from_millis(50);
        let live = GatewayConnector::new(config)
            .connect(&credentials)
            .await
            .expect("connect");
        let error = live
            .resolver
            .resolve("333333@s.whatsapp.net")
            .await
            .expect_err("timeout");
        assert!(error.to_string().contains("timed out"));

        drop(live);
        server.await.expect("server");
    }

    #[tokio::test]
    async fn regression_stalled_handshake_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let credentials = CredentialStore::new(temp.path().join("auth"));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(tcp);
        });

        let mut config = GatewayConnectorConfig::new(format!("ws://{addr}"));
        config.connect_timeout = Duration::from_millis(50);
        let error = GatewayConnector::new(config)
            .connect(&credentials)
            .await
            .err()
            .expect("handshake timeout");
        assert!(error
            .downcast_ref::<tokio::time::error::Elapsed>()
            .is_some());
        assert!(error.to_string().contains("timed out"));

        server.await.expect("server");
    }
}
