//! Transport session: connect, authenticate, encrypt, heartbeat, reconnect.
//!
//! The session owns at most one connection at a time. Every connection gets a
//! generation number; background tasks (reader, heartbeat, reconnect timer)
//! carry the generation they were started for and do nothing once it is
//! stale, so a late close from an old connection can never tear down a newer
//! one.
//!
//! State lives behind a mutex that is never held across an await. Sends check
//! liveness under the same lock they write through, so check-then-use is
//! atomic even with a multi-threaded runtime.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use control_link_core::{
    EventStore, LinkConfig, LinkStatus, MessageSink, Phase, SessionSnapshot, SharedClock,
    SinkError, SystemClock,
};
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{
    TransportError,
    codec::{CodecError, MessageCodec},
    connection::{Connection, Connector, Frame, close_code},
    credentials::{AuthToken, CredentialError, Credentials, EncryptionKey, TokenIssuer},
    policy::{AccessPolicy, AllowAll},
    protocol::ControlMessage,
};

struct ActiveLink {
    outbound: mpsc::UnboundedSender<Frame>,
    reader: Option<JoinHandle<()>>,
}

impl ActiveLink {
    fn close(self, reason: &str) {
        let _ = self.outbound.send(Frame::close(close_code::NORMAL, reason));
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }
}

struct ReconnectTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SessionState {
    phase: Phase,
    authenticated: bool,
    encryption_enabled: bool,
    reconnect_attempts: u32,
    generation: u64,
    timer_seq: u64,
    link: Option<ActiveLink>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect_timer: Option<ReconnectTimer>,
    credentials: Credentials,
    codec: MessageCodec,
}

impl SessionState {
    const fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            authenticated: self.authenticated,
            encryption_enabled: self.encryption_enabled,
            reconnect_attempts: self.reconnect_attempts,
            has_connection: self.link.is_some(),
        }
    }

    /// Reset to `Disconnected`, stopping the heartbeat. The link is handed
    /// back so the caller decides whether to close it or just let it drop.
    fn clear_connection(&mut self) -> Option<ActiveLink> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.phase = Phase::Disconnected;
        self.authenticated = false;
        self.encryption_enabled = false;
        self.link.take()
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.handle.abort();
        }
    }
}

struct Inner {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    policy: Arc<dyn AccessPolicy>,
    token_issuer: Option<Arc<dyn TokenIssuer>>,
    clock: SharedClock,
    events: Arc<EventStore>,
    inbound_tx: mpsc::UnboundedSender<Value>,
    state: Mutex<SessionState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn publish_state(&self) {
        let snapshot = self.lock().snapshot();
        self.events.push_session(snapshot);
    }

    fn set_phase(&self, generation: u64, phase: Phase) {
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.phase = phase;
        }
        self.publish_state();
    }

    /// Drop back to `Disconnected` without scheduling a reconnect.
    fn abandon(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            drop(state.clear_connection());
        }
        self.publish_state();
    }

    fn send(&self, message: &Value) -> Result<(), SinkError> {
        let state = self.lock();
        if state.phase != Phase::Connected {
            return Err(SinkError::NotConnected);
        }
        let link = state.link.as_ref().ok_or(SinkError::NotConnected)?;
        let text = state
            .codec
            .encode(message, state.encryption_enabled)
            .map_err(|e| SinkError::Encode(e.to_string()))?;
        link.outbound
            .send(Frame::Text(text))
            .map_err(|_| SinkError::NotConnected)
    }

    /// Report a status locally and, when the link is up, to the controller.
    fn emit_status(&self, status: LinkStatus, data: Value) {
        let timestamp = self.clock.now_millis();
        self.events.push_status(status, data.clone(), timestamp);

        let message = ControlMessage::Status {
            status,
            data,
            timestamp,
        };
        match message.to_value() {
            Ok(value) => {
                if let Err(e) = self.send(&value) {
                    tracing::debug!(?status, error = %e, "Status not delivered to controller");
                }
            }
            Err(e) => tracing::error!("Failed to serialize status: {e}"),
        }
        self.publish_state();
    }

    fn connect(self: Arc<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            let generation = {
                let mut state = self.lock();
                if state.phase.is_active() {
                    tracing::debug!(
                        phase = %state.phase,
                        "Connect ignored, session already active"
                    );
                    return Ok(());
                }
                state.cancel_reconnect();
                state.phase = Phase::Connecting;
                state.generation += 1;
                state.generation
            };
            self.publish_state();

            let url = self.config.transport_url().to_string();
            if let Err(reason) = self.policy.check(&url) {
                tracing::warn!(%url, %reason, "Connection blocked by access policy");
                self.abandon(generation);
                self.emit_status(LinkStatus::Blocked, json!({ "url": url, "reason": reason }));
                return Err(TransportError::Blocked { url, reason });
            }

            let has_key = self.lock().credentials.encryption_key.is_some();
            if self.config.require_encryption && !has_key {
                tracing::error!("Encryption required but no key configured");
                self.abandon(generation);
                self.emit_status(
                    LinkStatus::Failed,
                    json!({ "reason": "encryption key missing" }),
                );
                return Err(TransportError::MissingEncryptionKey);
            }

            tracing::info!(%url, "Connecting to controller");
            let Connection {
                outbound,
                mut inbound,
            } = match self.connector.connect(&url).await {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!(error = %e, "Connection failed");
                    self.connection_lost(generation, &e.to_string());
                    return Err(e);
                }
            };

            {
                let mut state = self.lock();
                if state.generation != generation {
                    drop(state);
                    let _ = outbound.send(Frame::close(close_code::NORMAL, "superseded"));
                    return Err(TransportError::Superseded);
                }
                state.link = Some(ActiveLink {
                    outbound: outbound.clone(),
                    reader: None,
                });
            }

            if self.config.require_auth {
                self.set_phase(generation, Phase::Authenticating);
                if let Err(e) = self.authenticate(&outbound, &mut inbound).await {
                    tracing::warn!(error = %e, "Authentication failed");
                    let _ = outbound.send(Frame::close(e.close_code(), e.to_string()));
                    if self.is_current(generation) {
                        self.emit_status(LinkStatus::AuthFailed, json!({ "error": e.to_string() }));
                    }
                    self.connection_lost(generation, "authentication failed");
                    return Err(e);
                }
            }

            let reader = tokio::spawn(Arc::clone(&self).read_loop(generation, inbound));
            let heartbeat = tokio::spawn(Arc::clone(&self).heartbeat_loop(generation));
            let (authenticated, encrypted) = {
                let mut state = self.lock();
                // The reader may already have seen the peer go away.
                if state.generation != generation || state.link.is_none() {
                    reader.abort();
                    heartbeat.abort();
                    return Err(TransportError::Superseded);
                }
                state.phase = Phase::Connected;
                state.authenticated = self.config.require_auth;
                state.reconnect_attempts = 0;
                state.codec = MessageCodec::from_key(state.credentials.encryption_key.as_ref());
                state.encryption_enabled =
                    self.config.require_encryption && state.codec.has_cipher();
                if let Some(link) = state.link.as_mut() {
                    link.reader = Some(reader);
                }
                if let Some(old) = state.heartbeat.replace(heartbeat) {
                    old.abort();
                }
                (state.authenticated, state.encryption_enabled)
            };

            tracing::info!(authenticated, encrypted, "Connected to controller");
            self.emit_status(
                LinkStatus::Connected,
                json!({ "authenticated": authenticated, "encrypted": encrypted }),
            );
            Ok(())
        })
    }

    /// Run the handshake. The caller owns `inbound` for the duration, so
    /// normal message handling is not running; anything other than an auth
    /// verdict is dropped.
    async fn authenticate(
        &self,
        outbound: &mpsc::UnboundedSender<Frame>,
        inbound: &mut mpsc::UnboundedReceiver<Frame>,
    ) -> Result<(), TransportError> {
        let token = self.current_token().await?;
        let request = ControlMessage::Auth {
            token: token.value,
            timestamp: self.clock.now_millis(),
            capabilities: self.config.capabilities.clone(),
        };
        let text = serde_json::to_string(&request).map_err(CodecError::from)?;
        outbound
            .send(Frame::Text(text))
            .map_err(|_| TransportError::ConnectionClosed)?;

        let codec = {
            let state = self.lock();
            MessageCodec::from_key(state.credentials.encryption_key.as_ref())
        };

        let handshake = async {
            while let Some(frame) = inbound.recv().await {
                let text = match frame {
                    Frame::Text(text) => text,
                    Frame::Close { code, reason } => {
                        tracing::debug!(code, %reason, "Closed during handshake");
                        return Err(TransportError::ConnectionClosed);
                    }
                };
                let Ok(decoded) = codec.decode(&text) else {
                    continue;
                };
                match ControlMessage::auth_response(&decoded.message) {
                    Some((true, _)) => return Ok(()),
                    Some((false, error)) => {
                        return Err(TransportError::AuthRejected(
                            error.unwrap_or_else(|| "rejected by controller".to_string()),
                        ));
                    }
                    None => tracing::trace!("Ignoring non-auth message during handshake"),
                }
            }
            Err(TransportError::ConnectionClosed)
        };

        time::timeout(self.config.auth_timeout(), handshake)
            .await
            .unwrap_or(Err(TransportError::AuthTimeout(self.config.auth_timeout_ms)))
    }

    async fn current_token(&self) -> Result<AuthToken, TransportError> {
        let now = self.clock.now_millis();
        let held = self.lock().credentials.valid_token(now).cloned();
        if let Some(token) = held {
            return Ok(token);
        }

        let issuer = self
            .token_issuer
            .as_ref()
            .ok_or(CredentialError::MissingToken)?;
        let token = issuer.issue().await?;
        self.lock().credentials.auth_token = Some(token.clone());
        tracing::debug!("Issued fresh auth token");
        Ok(token)
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<Frame>,
    ) {
        let reason = loop {
            match inbound.recv().await {
                Some(Frame::Text(text)) => self.handle_inbound(&text),
                Some(Frame::Close { code, reason }) => {
                    break format!("closed by controller ({code}): {reason}");
                }
                None => break "connection dropped".to_string(),
            }
        };
        self.connection_lost(generation, &reason);
    }

    fn handle_inbound(&self, text: &str) {
        let codec = self.lock().codec.clone();
        match codec.decode(text) {
            Ok(decoded) => {
                if self.inbound_tx.send(decoded.message).is_err() {
                    tracing::debug!("Inbound message dropped, no consumer");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Dropping malformed inbound frame"),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, generation: u64) {
        let period = self.config.heartbeat_interval();
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.is_current(generation) {
                break;
            }
            let beat = ControlMessage::Heartbeat {
                timestamp: self.clock.now_millis(),
            };
            let sent = beat
                .to_value()
                .map_err(|e| SinkError::Encode(e.to_string()))
                .and_then(|value| self.send(&value));
            if let Err(e) = sent {
                tracing::debug!(error = %e, "Heartbeat stopped");
                break;
            }
            tracing::trace!("Heartbeat sent");
        }
    }

    fn connection_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        {
            let mut state = self.lock();
            if state.generation != generation || !state.phase.is_active() {
                return;
            }
            // Reader is finishing on its own; let the link drop.
            drop(state.clear_connection());
        }
        tracing::warn!(reason, "Connection lost");
        self.emit_status(LinkStatus::Disconnected, json!({ "reason": reason }));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let max = self.config.max_reconnect_attempts;
        let scheduled = {
            let mut state = self.lock();
            if state.reconnect_attempts >= max {
                None
            } else {
                let delay = self.config.reconnect_delay(state.reconnect_attempts);
                state.reconnect_attempts += 1;
                state.cancel_reconnect();
                state.timer_seq += 1;
                let id = state.timer_seq;

                let inner = Arc::clone(self);
                let handle = tokio::spawn(async move {
                    time::sleep(delay).await;
                    let fired = {
                        let mut state = inner.lock();
                        if state.reconnect_timer.as_ref().is_some_and(|t| t.id == id) {
                            state.reconnect_timer = None;
                            true
                        } else {
                            false
                        }
                    };
                    if fired {
                        if let Err(e) = Self::connect(inner).await {
                            tracing::debug!(error = %e, "Reconnect attempt failed");
                        }
                    }
                });
                state.reconnect_timer = Some(ReconnectTimer { id, handle });
                Some((state.reconnect_attempts, delay))
            }
        };

        match scheduled {
            Some((attempt, delay)) => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                tracing::info!(attempt, delay_ms, "Scheduling reconnect");
                self.emit_status(
                    LinkStatus::Reconnecting,
                    json!({ "attempt": attempt, "delay_ms": delay_ms }),
                );
            }
            None => {
                tracing::error!(attempts = max, "Reconnect attempts exhausted");
                self.emit_status(
                    LinkStatus::Failed,
                    json!({ "attempts": max, "reason": "max reconnect attempts reached" }),
                );
            }
        }
    }
}

/// Builder for a transport session.
pub struct TransportSessionBuilder {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    policy: Arc<dyn AccessPolicy>,
    token_issuer: Option<Arc<dyn TokenIssuer>>,
    clock: SharedClock,
    events: Arc<EventStore>,
}

impl TransportSessionBuilder {
    /// Set the access policy (default: allow all).
    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Set the token issuer consulted when no valid token is held.
    #[must_use]
    pub fn token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.token_issuer = Some(issuer);
        self
    }

    /// Override the clock.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Share an event store with other components.
    #[must_use]
    pub fn events(mut self, events: Arc<EventStore>) -> Self {
        self.events = events;
        self
    }

    /// Build the session.
    ///
    /// Returns the session and the receiver of decoded inbound messages.
    #[must_use]
    pub fn build(self) -> (TransportSession, mpsc::UnboundedReceiver<Value>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let state = SessionState {
            credentials: Credentials::from_config(&self.config),
            ..SessionState::default()
        };
        let inner = Inner {
            config: self.config,
            connector: self.connector,
            policy: self.policy,
            token_issuer: self.token_issuer,
            clock: self.clock,
            events: self.events,
            inbound_tx,
            state: Mutex::new(state),
        };
        (
            TransportSession {
                inner: Arc::new(inner),
            },
            inbound_rx,
        )
    }
}

/// Handle to the transport session.
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<Inner>,
}

impl TransportSession {
    /// Start building a session.
    #[must_use]
    pub fn builder(config: LinkConfig, connector: Arc<dyn Connector>) -> TransportSessionBuilder {
        TransportSessionBuilder {
            config,
            connector,
            policy: Arc::new(AllowAll),
            token_issuer: None,
            clock: SystemClock::shared(),
            events: Arc::new(EventStore::new()),
        }
    }

    /// Open the connection. No-op while a connection is opening or open.
    ///
    /// Failures have already been reported as status events (and a reconnect
    /// scheduled where applicable) when this returns.
    ///
    /// # Errors
    /// Returns the reason the connection was not established.
    pub async fn connect(&self) -> Result<(), TransportError> {
        Inner::connect(Arc::clone(&self.inner)).await
    }

    /// Close the connection and suppress automatic reconnection.
    pub fn disconnect(&self) {
        let (link, was_active) = {
            let mut state = self.inner.lock();
            state.cancel_reconnect();
            state.reconnect_attempts = self.inner.config.max_reconnect_attempts;
            state.generation += 1;
            let was_active = state.phase.is_active();
            (state.clear_connection(), was_active)
        };
        if let Some(link) = link {
            link.close("client disconnect");
        }
        if was_active {
            tracing::info!("Disconnected by request");
            self.inner.emit_status(
                LinkStatus::Disconnected,
                json!({ "reason": "client disconnect" }),
            );
        } else {
            self.inner.publish_state();
        }
    }

    /// Drop any current connection, reset the attempt counter, and connect.
    ///
    /// # Errors
    /// Returns the reason the connection was not established.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let link = {
            let mut state = self.inner.lock();
            state.cancel_reconnect();
            state.reconnect_attempts = 0;
            state.generation += 1;
            state.clear_connection()
        };
        if let Some(link) = link {
            link.close("reconnecting");
        }
        tracing::info!("Explicit reconnect requested");
        self.connect().await
    }

    /// Replace credential material. Takes effect on the next handshake.
    pub fn rotate_credentials(&self, token: Option<AuthToken>, key: Option<EncryptionKey>) {
        let mut state = self.inner.lock();
        if let Some(token) = token {
            state.credentials.auth_token = Some(token);
        }
        if let Some(key) = key {
            state.credentials.encryption_key = Some(key);
        }
        tracing::info!("Credentials rotated, effective on next handshake");
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.lock().snapshot()
    }

    /// Whether messages can be sent right now.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().phase == Phase::Connected
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Local observer channel.
    #[must_use]
    pub fn events(&self) -> &Arc<EventStore> {
        &self.inner.events
    }
}

impl MessageSink for TransportSession {
    fn send(&self, message: &Value) -> Result<(), SinkError> {
        self.inner.send(message)
    }
}
