//! WebSocket ingress/egress pipeline: accept loop, per-connection auth gate,
//! schema validation, handler dispatch, and batched response delivery.
//!
//! Grounded on the teacher's `ipc/mod.rs`: the per-IP connection rate
//! limiter, the peek-based accept loop with a biased `tokio::select!` against
//! a shutdown future, and the auth-challenge-on-first-frame pattern are all
//! reused here, reframed around this gateway's own `{type,data,timestamp}`
//! envelope instead of JSON-RPC.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::accept_async_with_config;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{ErrorTag, GatewayError};
use crate::protocol::{Message, Priority, RawFrame, Tag};
use crate::GatewayContext;

/// Max new WebSocket connections accepted per source IP per minute.
const MAX_CONNECTIONS_PER_MIN: usize = 60;

struct ConnectionRateLimiter {
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - Duration::from_secs(60);
        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);
        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

pub struct Server {
    ctx: Arc<GatewayContext>,
    active_connections: AtomicUsize,
}

impl Server {
    pub fn new(ctx: Arc<GatewayContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            active_connections: AtomicUsize::new(0),
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.ctx.config.server.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, "gateway listening");
        self.serve(listener).await
    }

    /// Runs the accept loop against an already-bound listener. Split out
    /// from [`Server::run`] so tests can bind to an OS-assigned ephemeral
    /// port and read back the real address before connecting.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));
        let shutdown = make_shutdown_future();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("shutdown signal received — no longer accepting new connections");
                    break;
                }

                conn = listener.accept() => {
                    let (stream, peer) = match conn {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(err = %e, "accept error");
                            continue;
                        }
                    };

                    {
                        let mut limiter = conn_limiter.lock().await;
                        if !limiter.check_and_record(peer.ip()) {
                            warn!(peer = %peer, "connection rate limit exceeded — rejecting");
                            drop(stream);
                            continue;
                        }
                    }

                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream).await {
                            debug!(peer = %peer, err = %e, "connection ended with error");
                        }
                    });
                }
            }
        }

        info!("gateway stopped");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(self.ctx.config.server.max_message_size),
            max_frame_size: Some(self.ctx.config.server.max_message_size),
            ..Default::default()
        };
        let ws = accept_async_with_config(stream, Some(ws_config)).await?;
        let (mut sink, mut stream) = ws.split();

        if self.active_connections.load(Ordering::Relaxed) >= self.ctx.config.server.max_connections {
            let err = Message::error(ErrorTag::ConnectionLimitReached, "connection limit reached");
            let _ = sink.send(WsMessage::Text(err.to_json_string())).await;
            return Ok(());
        }

        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.ctx.metrics.record_connection_opened();
        let client_id = Uuid::new_v4().to_string();

        let (batch_tx, mut batch_rx) = mpsc::channel::<Message>(self.ctx.config.batching.max_queue_size.max(16));
        self.ctx.batcher.register_client(&client_id, batch_tx).await;

        let ack = Message::connection_ack(&client_id);
        sink.send(WsMessage::Text(ack.to_json_string())).await.ok();

        let mut session = ClientSession {
            client_id: client_id.clone(),
            authenticated: false,
            token: None,
        };

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.ctx.metrics.record_message_in();
                            if text.len() > self.ctx.config.server.max_message_size {
                                let err = Message::error(ErrorTag::MessageTooLarge, "message exceeds maxMessageSize");
                                let _ = sink.send(WsMessage::Text(err.to_json_string())).await;
                                continue;
                            }
                            match self.dispatch_text(&text, &mut session).await {
                                Ok(Some(reply)) => {
                                    self.ctx.metrics.record_message_out();
                                    if sink.send(WsMessage::Text(reply.to_json_string())).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    self.ctx.metrics.record_error(e.tag).await;
                                    let close_after = to_error_message(e);
                                    self.ctx.metrics.record_message_out();
                                    let _ = sink.send(WsMessage::Text(close_after.to_json_string())).await;
                                    if close_after.code == Some(ErrorTag::RateLimitExceeded.as_str()) {
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = sink.send(WsMessage::Pong(data)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(err = %e, "ws error");
                            break;
                        }
                        _ => {}
                    }
                }
                batched = batch_rx.recv() => {
                    match batched {
                        Some(message) => {
                            self.ctx.metrics.record_message_out();
                            if sink.send(WsMessage::Text(message.to_json_string())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        self.ctx.batcher.remove_client(&client_id).await;
        if let Err(e) = self.ctx.handlers.dispatch_disconnect(&client_id).await {
            warn!(client_id, err = %e, "handler disconnect dispatch failed");
        }
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.ctx.metrics.record_connection_closed();
        Ok(())
    }

    /// Parses, validates, and dispatches one inbound frame. `Ok(Some(_))` is
    /// an immediate reply to send; `Ok(None)` means the response (if any)
    /// will arrive later via the batcher; `Err(_)` is a classified error —
    /// the caller records it in metrics, converts it to an `ERROR` frame,
    /// and decides whether it also closes the connection.
    async fn dispatch_text(&self, text: &str, session: &mut ClientSession) -> Result<Option<Message>, GatewayError> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|_| GatewayError::new(ErrorTag::InvalidMessage, "malformed JSON frame"))?;

        let type_str = raw.type_.as_deref().unwrap_or("");
        let tag = Tag::parse(type_str)
            .ok_or_else(|| GatewayError::new(ErrorTag::InvalidMessageType, format!("unknown type \"{type_str}\"")))?;

        self.ctx.validator.validate(tag.as_str(), &raw.data).await?;

        match tag {
            Tag::Authenticate => {
                self.ctx.auth.check_rate_limit(&session.client_id).await?;
                let api_key = raw.data.get("apiKey").and_then(Value::as_str).unwrap_or_default();
                let message = self.ctx.auth.authenticate(&session.client_id, api_key).await?;
                if let Some(token) = message.data.get("token").and_then(Value::as_str) {
                    session.authenticated = true;
                    session.token = Some(token.to_string());
                }
                Ok(Some(message))
            }
            Tag::SessionValid => {
                let token = raw.data.get("token").and_then(Value::as_str).unwrap_or_default();
                if self.ctx.auth.validate_session(token).await {
                    session.authenticated = true;
                    session.token = Some(token.to_string());
                    Ok(Some(Message::new(Tag::SessionValid, serde_json::json!({"valid": true}))))
                } else {
                    session.authenticated = false;
                    Err(GatewayError::new(ErrorTag::SessionExpired, "session token invalid or expired"))
                }
            }
            Tag::Logout => {
                if let Some(token) = &session.token {
                    self.ctx.auth.logout(token).await;
                }
                session.authenticated = false;
                session.token = None;
                Ok(Some(Message::new(Tag::LoggedOut, Value::Null)))
            }
            Tag::StartScan | Tag::StopScan | Tag::Connect | Tag::Disconnect
            | Tag::CharacteristicRead | Tag::CharacteristicWrite => {
                if !session.authenticated {
                    return Err(GatewayError::new(ErrorTag::NotAuthenticated, "authenticate before sending this message"));
                }
                let result = self
                    .ctx
                    .handlers
                    .dispatch(tag, &session.client_id, &raw.data)
                    .await?;

                let priority = raw
                    .data
                    .get("priority")
                    .and_then(|v| serde_json::from_value::<Priority>(v.clone()).ok())
                    .unwrap_or_default();

                self.ctx
                    .batcher
                    .add_message(&session.client_id, priority, serde_json::json!({"type": tag.as_str(), "result": result}))
                    .await?;
                Ok(None)
            }
            _ => Err(GatewayError::new(ErrorTag::InvalidMessageType, format!("\"{type_str}\" is not client-sendable"))),
        }
    }
}

struct ClientSession {
    client_id: String,
    authenticated: bool,
    token: Option<String>,
}

fn to_error_message(e: GatewayError) -> Message {
    Message::error(e.tag, e.detail)
}

async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
