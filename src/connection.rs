//! Protocol state machine for one server connection.
//!
//! [`MumbleConnection::open`] takes an already established byte stream
//! (normally TLS, see [`crate::transport`]), sends the client version and
//! starts two background tasks: a reader that decodes frames and dispatches
//! them, and a keepalive task that pings the server and detects silence.
//! Everything observable is published as [`MumbleEvent`]s on a broadcast
//! channel.

use std::io;
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::{timeout, Instant, MissedTickBehavior};

use crate::audio::{AudioBackend, VoicePayload};
use crate::config::ConnectionConfig;
use crate::error::MumbleError;
use crate::keepalive::Keepalive;
use crate::messages::{MessageEnvelope, MumbleMessage, TcpFrameDecoder, PROTOCOL_VERSION};
use crate::proto::mumble::{
    reject::RejectType, Authenticate, CodecVersion, CryptSetup, PermissionDenied,
    PermissionQuery, Reject, ServerConfig, ServerSync, SuggestConfig, TextMessage, UserState,
    Version,
};
use crate::state::{Channel, StateChange, StateTree, User, UserFlag};
use crate::voice::{VoicePacket, VoicePacketError, VoiceTarget};
use crate::voice_session::{OutboundVoice, VoiceActivity, VoiceRouter, VoiceStream};

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    /// Client version sent, waiting for the server's.
    Handshaking,
    /// Server version accepted, credentials not yet sent.
    Authenticating,
    /// Credentials sent, server is streaming its initial state.
    Synchronizing,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// True until teardown starts.
    pub fn is_live(self) -> bool {
        !matches!(
            self,
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed
        )
    }

    fn rank(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Handshaking => 1,
            ConnectionState::Authenticating => 2,
            ConnectionState::Synchronizing => 3,
            ConnectionState::Ready => 4,
            ConnectionState::Closing => 5,
            ConnectionState::Closed => 6,
            ConnectionState::Failed => 7,
        }
    }
}

/// Everything the connection reports to subscribers.
#[derive(Debug, Clone)]
pub enum MumbleEvent {
    /// Initial state fully received; emitted once per connection.
    Ready { session: u32 },
    /// Fatal failure; emitted at most once and followed by `Disconnected`.
    Error(Arc<MumbleError>),
    Disconnected,
    ServerVersion(Version),
    ChannelCreated(Channel),
    ChannelUpdated(Channel),
    ChannelMoved {
        channel: u32,
        from: Option<u32>,
        to: u32,
    },
    ChannelLinksAdded {
        channel: u32,
        links: Vec<u32>,
    },
    ChannelLinksRemoved {
        channel: u32,
        links: Vec<u32>,
    },
    ChannelRemoved(Channel),
    ChannelPermissions {
        channel: u32,
        permissions: u32,
    },
    UserConnected(User),
    UserUpdated(User),
    UserMoved {
        session: u32,
        from: u32,
        to: u32,
        actor: Option<u32>,
    },
    UserFlagChanged {
        session: u32,
        flag: UserFlag,
        value: bool,
    },
    UserDisconnected {
        user: User,
        actor: Option<u32>,
        reason: Option<String>,
        ban: bool,
    },
    TextMessage(TextMessage),
    PermissionDenied(PermissionDenied),
    VoiceStart {
        session: u32,
        target: VoiceTarget,
    },
    VoiceEnd {
        session: u32,
        target: VoiceTarget,
    },
    /// Any other known message.
    Generic(MumbleMessage),
}

impl From<StateChange> for MumbleEvent {
    fn from(change: StateChange) -> Self {
        match change {
            StateChange::ChannelCreated(channel) => MumbleEvent::ChannelCreated(channel),
            StateChange::ChannelUpdated(channel) => MumbleEvent::ChannelUpdated(channel),
            StateChange::ChannelMoved { channel, from, to } => {
                MumbleEvent::ChannelMoved { channel, from, to }
            }
            StateChange::ChannelLinksAdded { channel, links } => {
                MumbleEvent::ChannelLinksAdded { channel, links }
            }
            StateChange::ChannelLinksRemoved { channel, links } => {
                MumbleEvent::ChannelLinksRemoved { channel, links }
            }
            StateChange::ChannelRemoved(channel) => MumbleEvent::ChannelRemoved(channel),
            StateChange::ChannelPermissions {
                channel,
                permissions,
            } => MumbleEvent::ChannelPermissions {
                channel,
                permissions,
            },
            StateChange::UserConnected(user) => MumbleEvent::UserConnected(user),
            StateChange::UserUpdated(user) => MumbleEvent::UserUpdated(user),
            StateChange::UserMoved {
                session,
                from,
                to,
                actor,
            } => MumbleEvent::UserMoved {
                session,
                from,
                to,
                actor,
            },
            StateChange::UserFlagChanged {
                session,
                flag,
                value,
            } => MumbleEvent::UserFlagChanged {
                session,
                flag,
                value,
            },
            StateChange::UserDisconnected {
                user,
                actor,
                reason,
                ban,
            } => MumbleEvent::UserDisconnected {
                user,
                actor,
                reason,
                ban,
            },
        }
    }
}

impl From<VoiceActivity> for MumbleEvent {
    fn from(activity: VoiceActivity) -> Self {
        match activity {
            VoiceActivity::Start { session, target } => MumbleEvent::VoiceStart { session, target },
            VoiceActivity::End { session, target } => MumbleEvent::VoiceEnd { session, target },
        }
    }
}

/// Server-provided session details captured during and after the handshake.
#[derive(Clone, Debug, Default)]
pub struct SessionInfo {
    /// Session identifier assigned by the server.
    pub session: Option<u32>,
    pub server_version: Option<Version>,
    /// Server's max bandwidth allocation for this client.
    pub max_bandwidth: Option<u32>,
    /// Welcome text presented by the server.
    pub welcome_text: Option<String>,
    /// Permissions in the root channel, from `ServerSync`.
    pub root_permissions: Option<u64>,
    pub server_config: Option<ServerConfig>,
    pub codec_version: Option<CodecVersion>,
    pub suggest_config: Option<SuggestConfig>,
    /// Key material for the UDP channel; kept for completeness, voice uses the tunnel.
    pub crypt_setup: Option<CryptSetup>,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Shared {
    config: ConnectionConfig,
    phase: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<MumbleEvent>,
    /// Receiver created at open so the first subscriber sees every event.
    first_subscriber: std::sync::Mutex<Option<broadcast::Receiver<MumbleEvent>>>,
    writer: Mutex<Option<BoxedWriter>>,
    tree: RwLock<StateTree>,
    info: RwLock<SessionInfo>,
    voice: Mutex<VoiceRouter>,
    outbound: Mutex<OutboundVoice>,
    keepalive: Mutex<Keepalive>,
    failure: OnceLock<Arc<MumbleError>>,
}

/// Handle to a running connection. Clones share the same connection.
#[derive(Clone)]
pub struct MumbleConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MumbleConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MumbleConnection")
            .field("host", &self.shared.config.host)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MumbleConnection {
    /// Start the protocol on `stream` with the default audio backend.
    pub async fn open<S>(stream: S, config: ConnectionConfig) -> Result<Self, MumbleError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::open_with_audio(stream, config, AudioBackend::default()).await
    }

    pub async fn open_with_audio<S>(
        stream: S,
        config: ConnectionConfig,
        backend: AudioBackend,
    ) -> Result<Self, MumbleError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let encoder = backend.encoder(config.voice.samples_per_frame())?;
        let (reader, writer) = tokio::io::split(stream);

        let (phase, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown, _) = watch::channel(false);
        let (events, first) = broadcast::channel(config.event_capacity);
        let shared = Arc::new(Shared {
            phase,
            shutdown,
            events,
            first_subscriber: std::sync::Mutex::new(Some(first)),
            writer: Mutex::new(Some(Box::new(writer))),
            tree: RwLock::new(StateTree::new()),
            info: RwLock::new(SessionInfo::default()),
            voice: Mutex::new(VoiceRouter::new(config.voice.clone(), backend)),
            outbound: Mutex::new(OutboundVoice::new(encoder)),
            keepalive: Mutex::new(Keepalive::new(config.keepalive.clone(), Instant::now())),
            failure: OnceLock::new(),
            config,
        });

        shared.advance(ConnectionState::Connecting, ConnectionState::Handshaking);
        shared
            .send_now(&MumbleMessage::Version(build_version_message()))
            .await?;

        tokio::spawn(reader_loop(
            shared.clone(),
            reader,
            shared.shutdown.subscribe(),
        ));
        tokio::spawn(keepalive_loop(shared.clone(), shared.shutdown.subscribe()));

        tracing::debug!(host = %shared.config.host, "connection opened");
        Ok(Self { shared })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.phase.borrow()
    }

    /// Receiver observing every phase transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.phase.subscribe()
    }

    /// Subscribe to events. The first subscriber also receives everything
    /// emitted since the connection was opened.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MumbleEvent> {
        self.shared
            .first_subscriber
            .lock()
            .ok()
            .and_then(|mut first| first.take())
            .unwrap_or_else(|| self.shared.events.subscribe())
    }

    /// Receiver that only sees events emitted from now on.
    pub(crate) fn fresh_events(&self) -> broadcast::Receiver<MumbleEvent> {
        self.shared.events.subscribe()
    }

    /// Cause of the failure, once the connection has failed.
    pub fn failure(&self) -> Option<Arc<MumbleError>> {
        self.shared.failure.get().cloned()
    }

    /// Wait until `target` (or a later phase) is reached.
    ///
    /// Fails if the connection terminates first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), MumbleError> {
        let mut phase = self.shared.phase.subscribe();
        let reached = phase
            .wait_for(|state| state.rank() >= target.rank())
            .await
            .map(|state| *state)
            .map_err(|_| MumbleError::ConnectionLost("connection dropped"))?;
        match reached {
            state if state == target => Ok(()),
            ConnectionState::Failed => Err(self.failure_error()),
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(MumbleError::ConnectionLost("connection closed"))
            }
            _ => Ok(()),
        }
    }

    fn failure_error(&self) -> MumbleError {
        match self.failure() {
            Some(cause) => MumbleError::Failed(cause),
            None => MumbleError::ConnectionLost("connection failed"),
        }
    }

    /// Send credentials. Only valid once the server version was accepted.
    pub async fn authenticate(
        &self,
        username: &str,
        password: Option<&str>,
        tokens: &[String],
    ) -> Result<(), MumbleError> {
        // Move first so a fast ServerSync never races the transition.
        let mut previous = ConnectionState::Authenticating;
        let moved = self.shared.phase.send_if_modified(|state| {
            previous = *state;
            if *state == ConnectionState::Authenticating {
                *state = ConnectionState::Synchronizing;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(MumbleError::InvalidState {
                operation: "authenticate",
                state: previous,
            });
        }
        let message = Authenticate {
            username: Some(username.to_string()),
            password: password.map(str::to_string),
            tokens: tokens.to_vec(),
            opus: Some(true),
            client_type: Some(self.shared.config.client_type),
            ..Default::default()
        };
        tracing::debug!(username, "authenticating");
        self.shared.send_now(&MumbleMessage::Authenticate(message)).await
    }

    /// Authenticate with the credentials from the configuration.
    pub async fn authenticate_from_config(&self) -> Result<(), MumbleError> {
        let config = &self.shared.config;
        self.authenticate(&config.username, config.password.as_deref(), &config.tokens)
            .await
    }

    /// Send a typed control message. Requires `Ready`.
    pub async fn send_message(&self, message: MumbleMessage) -> Result<(), MumbleError> {
        self.require("send_message", |state| state == ConnectionState::Ready)?;
        self.shared.send_now(&message).await
    }

    /// Move ourselves to the channel at `path` (names separated by `/`).
    pub async fn join_path(&self, path: &str) -> Result<(), MumbleError> {
        self.require("join_path", |state| state == ConnectionState::Ready)?;
        let channel = self
            .shared
            .tree
            .read()
            .await
            .channel_by_path(path)
            .map(|c| c.id)
            .ok_or_else(|| MumbleError::Channel(format!("no channel at path {path:?}")))?;
        let session = self.session().await.ok_or(MumbleError::InvalidState {
            operation: "join_path",
            state: self.state(),
        })?;
        self.send_message(MumbleMessage::UserState(UserState {
            session: Some(session),
            channel_id: Some(channel),
            ..Default::default()
        }))
        .await
    }

    /// Encode and transmit audio to `target`.
    pub async fn send_voice(
        &self,
        payload: VoicePayload,
        target: VoiceTarget,
    ) -> Result<(), MumbleError> {
        self.require("send_voice", |state| state == ConnectionState::Ready)?;
        // Held across the writes so concurrent senders keep sequence order.
        let mut outbound = self.shared.outbound.lock().await;
        for packet in outbound.packets(payload, target)? {
            self.shared.send_voice_packet(&packet).await?;
        }
        Ok(())
    }

    /// Mark the end of the current transmission to `target`.
    pub async fn end_voice(&self, target: VoiceTarget) -> Result<(), MumbleError> {
        self.require("end_voice", |state| state == ConnectionState::Ready)?;
        let mut outbound = self.shared.outbound.lock().await;
        let packet = outbound.terminator(target);
        self.shared.send_voice_packet(&packet).await
    }

    pub async fn set_bitrate(&self, bitrate: i32) -> Result<(), MumbleError> {
        self.require("set_bitrate", ConnectionState::is_live)?;
        self.shared.outbound.lock().await.set_bitrate(bitrate)
    }

    /// Attach positional coordinates to subsequent outbound packets.
    pub async fn set_positional(&self, position: Option<[f32; 3]>) {
        self.shared.outbound.lock().await.set_positional(position);
    }

    /// Samples per outbound frame expected by the encoder.
    pub async fn frame_size(&self) -> usize {
        self.shared.outbound.lock().await.frame_size()
    }

    /// Decoded audio from one speaker on `target`.
    pub async fn voice_stream(
        &self,
        session: u32,
        target: VoiceTarget,
    ) -> Result<VoiceStream, MumbleError> {
        self.require("voice_stream", ConnectionState::is_live)?;
        Ok(self.shared.voice.lock().await.open_stream(session, target))
    }

    /// Decoded audio from every speaker on `target`.
    pub async fn shared_voice_stream(
        &self,
        target: VoiceTarget,
    ) -> Result<VoiceStream, MumbleError> {
        self.require("shared_voice_stream", ConnectionState::is_live)?;
        Ok(self.shared.voice.lock().await.open_shared_stream(target))
    }

    /// Our own audio as echoed back by the server.
    pub async fn loopback_stream(&self) -> Result<VoiceStream, MumbleError> {
        self.require("loopback_stream", ConnectionState::is_live)?;
        Ok(self.shared.voice.lock().await.open_loopback())
    }

    /// Close the connection, flushing pending writes within the configured
    /// grace period. Calling it again is a no-op.
    pub async fn disconnect(&self) -> Result<(), MumbleError> {
        let started = self.shared.phase.send_if_modified(|state| {
            if state.is_live() {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if !started {
            return Ok(());
        }
        tracing::info!(host = %self.shared.config.host, "disconnecting");
        self.shared.close_transport().await;
        self.shared
            .advance(ConnectionState::Closing, ConnectionState::Closed);
        self.shared.release().await;
        Ok(())
    }

    pub async fn session(&self) -> Option<u32> {
        self.shared.info.read().await.session
    }

    /// Snapshot of the server-provided session details.
    pub async fn info(&self) -> SessionInfo {
        self.shared.info.read().await.clone()
    }

    /// Run `f` against a consistent view of the state tree.
    pub async fn with_tree<R>(&self, f: impl FnOnce(&StateTree) -> R) -> R {
        let tree = self.shared.tree.read().await;
        f(&tree)
    }

    /// Most recent control channel round trip.
    pub async fn rtt(&self) -> Option<std::time::Duration> {
        self.shared.keepalive.lock().await.last_rtt()
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: impl Fn(ConnectionState) -> bool,
    ) -> Result<(), MumbleError> {
        let state = self.state();
        if allowed(state) {
            Ok(())
        } else {
            Err(MumbleError::InvalidState { operation, state })
        }
    }
}

impl Shared {
    fn emit(&self, event: MumbleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_all<E: Into<MumbleEvent>>(&self, events: impl IntoIterator<Item = E>) {
        for event in events {
            self.emit(event.into());
        }
    }

    fn state(&self) -> ConnectionState {
        *self.phase.borrow()
    }

    /// Move `from -> to`; false if the phase was something else.
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.phase.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    async fn send_now(&self, message: &MumbleMessage) -> Result<(), MumbleError> {
        let envelope = message.encode().map_err(|err| {
            MumbleError::Protocol(format!("encode {} failed: {err}", message.name()))
        })?;
        tracing::trace!(kind = message.name(), "sending");
        self.write_envelope(&envelope).await
    }

    async fn send_voice_packet(&self, packet: &VoicePacket) -> Result<(), MumbleError> {
        let bytes = packet.encode()?;
        self.write_envelope(&MumbleMessage::UdpTunnel(bytes).encode().map_err(|err| {
            MumbleError::Protocol(format!("encode UDPTunnel failed: {err}"))
        })?)
        .await
    }

    async fn write_envelope(&self, envelope: &MessageEnvelope) -> Result<(), MumbleError> {
        let result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => envelope.write_to(writer).await,
                None => return Err(MumbleError::ConnectionLost("transport already closed")),
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let copy = io::Error::new(err.kind(), err.to_string());
                self.fail(MumbleError::Network(copy)).await;
                Err(MumbleError::Network(err))
            }
        }
    }

    /// Enter `Failed` unless teardown already started, then tear down.
    async fn fail(&self, err: MumbleError) {
        let err = Arc::new(err);
        // The cause is stored before watchers can observe `Failed`.
        let won = self.phase.send_if_modified(|state| {
            if state.is_live() {
                let _ = self.failure.set(err.clone());
                *state = ConnectionState::Failed;
                true
            } else {
                false
            }
        });
        if !won {
            tracing::debug!(error = %err, "ignoring error after teardown started");
            return;
        }
        tracing::warn!(error = %err, "connection failed");
        self.emit(MumbleEvent::Error(err));
        self.close_transport().await;
        self.release().await;
    }

    /// Stop background tasks and shut the writer down within the grace period.
    async fn close_transport(&self) {
        self.shutdown.send_replace(true);
        let drain = async {
            let mut writer = self.writer.lock().await;
            if let Some(mut writer) = writer.take() {
                if let Err(err) = writer.shutdown().await {
                    tracing::debug!(error = %err, "writer shutdown failed");
                }
            }
        };
        if timeout(self.config.disconnect_grace, drain).await.is_err() {
            tracing::warn!("disconnect grace period elapsed, dropping transport");
        }
    }

    /// Drop voice sessions and state, then announce the disconnect.
    async fn release(&self) {
        let activity = self.voice.lock().await.clear();
        self.emit_all(activity);
        self.tree.write().await.clear();
        self.emit(MumbleEvent::Disconnected);
    }

    async fn dispatch(&self, envelope: MessageEnvelope) -> Result<(), MumbleError> {
        self.keepalive.lock().await.count_packet();
        let state = self.state();

        if envelope.kind.is_unknown() {
            let id = envelope.kind.as_id();
            if state == ConnectionState::Ready {
                tracing::debug!(id, "ignoring unknown message type");
                return Ok(());
            }
            return Err(MumbleError::Protocol(format!(
                "unknown message type {id} while {state:?}"
            )));
        }

        let message = MumbleMessage::try_from(envelope)
            .map_err(|err| MumbleError::Protocol(err.to_string()))?;
        tracing::trace!(kind = message.name(), "received");

        match message {
            MumbleMessage::Version(version) => self.on_version(version, state).await,
            MumbleMessage::Reject(reject) => Err(MumbleError::Rejected(reject_reason(&reject))),
            MumbleMessage::ServerSync(sync) => self.on_server_sync(sync, state).await,
            MumbleMessage::ChannelState(msg) => {
                let changes = self.tree.write().await.apply_channel_state(&msg);
                self.emit_all(changes);
                Ok(())
            }
            MumbleMessage::ChannelRemove(msg) => {
                let changes = self.tree.write().await.apply_channel_remove(&msg);
                self.emit_all(changes);
                Ok(())
            }
            MumbleMessage::UserState(msg) => {
                let changes = self.tree.write().await.apply_user_state(&msg);
                self.emit_all(changes);
                Ok(())
            }
            MumbleMessage::UserRemove(msg) => {
                let changes = self.tree.write().await.apply_user_remove(&msg);
                let ended = self.voice.lock().await.remove_session(msg.session);
                self.emit_all(ended);
                self.emit_all(changes);
                let own = self.info.read().await.session;
                if own == Some(msg.session) {
                    let reason = msg.reason.unwrap_or_else(|| "no reason given".to_string());
                    return Err(MumbleError::Rejected(format!("removed from server: {reason}")));
                }
                Ok(())
            }
            MumbleMessage::PermissionQuery(msg) => {
                self.apply_permissions(&msg).await;
                Ok(())
            }
            MumbleMessage::TextMessage(msg) => {
                self.emit(MumbleEvent::TextMessage(msg));
                Ok(())
            }
            MumbleMessage::PermissionDenied(msg) => {
                tracing::debug!(
                    permission = ?msg.permission,
                    channel = ?msg.channel_id,
                    "permission denied"
                );
                self.emit(MumbleEvent::PermissionDenied(msg));
                Ok(())
            }
            MumbleMessage::UdpTunnel(_) if state != ConnectionState::Ready => {
                Err(MumbleError::UnexpectedMessage {
                    kind: "UDPTunnel",
                    state,
                })
            }
            MumbleMessage::UdpTunnel(bytes) => {
                self.on_voice(&bytes).await;
                Ok(())
            }
            MumbleMessage::Ping(ping) => {
                if let Some(rtt) = self.keepalive.lock().await.on_ping(&ping, Instant::now()) {
                    tracing::trace!(rtt_ms = rtt.as_millis() as u64, "pong");
                }
                Ok(())
            }
            other => {
                self.record_generic(&other).await;
                self.emit(MumbleEvent::Generic(other));
                Ok(())
            }
        }
    }

    async fn on_version(
        &self,
        version: Version,
        state: ConnectionState,
    ) -> Result<(), MumbleError> {
        if state != ConnectionState::Handshaking {
            if state == ConnectionState::Ready {
                tracing::warn!("ignoring repeated server version");
                return Ok(());
            }
            return Err(MumbleError::UnexpectedMessage {
                kind: "Version",
                state,
            });
        }
        let (major, minor, patch) = version_triple(&version);
        tracing::debug!(major, minor, patch, release = ?version.release, "server version");
        if major != PROTOCOL_VERSION.0 {
            return Err(MumbleError::VersionMismatch {
                major,
                minor,
                patch,
            });
        }
        self.info.write().await.server_version = Some(version.clone());
        self.advance(ConnectionState::Handshaking, ConnectionState::Authenticating);
        self.emit(MumbleEvent::ServerVersion(version));
        Ok(())
    }

    async fn on_server_sync(
        &self,
        sync: ServerSync,
        state: ConnectionState,
    ) -> Result<(), MumbleError> {
        if state != ConnectionState::Synchronizing {
            if state == ConnectionState::Ready {
                tracing::warn!("ignoring repeated ServerSync");
                return Ok(());
            }
            return Err(MumbleError::UnexpectedMessage {
                kind: "ServerSync",
                state,
            });
        }
        let session = sync
            .session
            .ok_or_else(|| MumbleError::Protocol("ServerSync without session".into()))?;
        {
            let mut info = self.info.write().await;
            info.session = Some(session);
            info.max_bandwidth = sync.max_bandwidth;
            info.welcome_text = sync.welcome_text.clone();
            info.root_permissions = sync.permissions;
        }
        if let Some(permissions) = sync.permissions {
            self.apply_permissions(&PermissionQuery {
                channel_id: Some(crate::state::ROOT_CHANNEL),
                permissions: Some(permissions as u32),
                flush: None,
            })
            .await;
        }
        if self.advance(ConnectionState::Synchronizing, ConnectionState::Ready) {
            tracing::info!(session, "connection ready");
            self.emit(MumbleEvent::Ready { session });
        }
        Ok(())
    }

    async fn apply_permissions(&self, msg: &PermissionQuery) {
        let changes = self.tree.write().await.apply_permission_query(msg);
        self.emit_all(changes);
    }

    async fn on_voice(&self, bytes: &[u8]) {
        let packet = match VoicePacket::decode_clientbound(bytes) {
            Ok(packet) => packet,
            Err(VoicePacketError::Ping) => return,
            Err(err) => {
                tracing::debug!(error = %err, len = bytes.len(), "dropping malformed voice packet");
                return;
            }
        };
        let activity = self.voice.lock().await.route(packet);
        self.emit_all(activity);
    }

    async fn record_generic(&self, message: &MumbleMessage) {
        let mut info = self.info.write().await;
        match message {
            MumbleMessage::ServerConfig(config) => {
                if config.welcome_text.is_some() {
                    info.welcome_text = config.welcome_text.clone();
                }
                if config.max_bandwidth.is_some() {
                    info.max_bandwidth = config.max_bandwidth;
                }
                info.server_config = Some(config.clone());
            }
            MumbleMessage::CodecVersion(codec) => info.codec_version = Some(codec.clone()),
            MumbleMessage::SuggestConfig(suggest) => info.suggest_config = Some(suggest.clone()),
            MumbleMessage::CryptSetup(crypt) => info.crypt_setup = Some(crypt.clone()),
            _ => {}
        }
    }
}

async fn reader_loop<R>(
    shared: Arc<Shared>,
    mut reader: R,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = TcpFrameDecoder::with_max_frame_size(shared.config.max_frame_size);
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = decoder.read_next(&mut reader) => next,
        };
        match next {
            Ok(Some(envelope)) => {
                if let Err(err) = shared.dispatch(envelope).await {
                    shared.fail(err).await;
                    break;
                }
            }
            Ok(None) => {
                if shared.state() == ConnectionState::Ready {
                    tracing::info!("server closed the connection");
                    if shared.phase.send_if_modified(|state| {
                        if *state == ConnectionState::Ready {
                            *state = ConnectionState::Closing;
                            true
                        } else {
                            false
                        }
                    }) {
                        shared.close_transport().await;
                        shared.advance(ConnectionState::Closing, ConnectionState::Closed);
                        shared.release().await;
                    }
                } else {
                    shared
                        .fail(MumbleError::ConnectionLost("server closed the connection"))
                        .await;
                }
                break;
            }
            Err(err) => {
                shared.fail(err).await;
                break;
            }
        }
    }
    tracing::debug!("reader task finished");
}

async fn keepalive_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let interval = shared.config.keepalive.interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        let ping = {
            let mut keepalive = shared.keepalive.lock().await;
            if keepalive.is_expired(now) {
                None
            } else {
                Some(keepalive.build_ping(now))
            }
        };
        let Some(ping) = ping else {
            let silence = shared.config.keepalive.timeout();
            shared
                .fail(MumbleError::Timeout(format!(
                    "no ping from server within {silence:?}"
                )))
                .await;
            break;
        };
        if let Err(err) = shared.send_now(&MumbleMessage::Ping(ping)).await {
            tracing::debug!(error = %err, "keepalive ping not sent");
            break;
        }
    }
    tracing::debug!("keepalive task finished");
}

fn version_triple(version: &Version) -> (u32, u32, u32) {
    if let Some(v2) = version.version_v2 {
        return (
            ((v2 >> 48) & 0xFFFF) as u32,
            ((v2 >> 32) & 0xFFFF) as u32,
            ((v2 >> 16) & 0xFFFF) as u32,
        );
    }
    match version.version_v1 {
        Some(v1) => (v1 >> 16, (v1 >> 8) & 0xFF, v1 & 0xFF),
        None => (0, 0, 0),
    }
}

fn reject_reason(reject: &Reject) -> String {
    let mut reason = reject
        .reason
        .clone()
        .unwrap_or_else(|| "unknown reason".to_string());
    if let Some(value) = reject.r#type {
        if let Ok(kind) = RejectType::try_from(value) {
            reason = format!("{kind:?}: {reason}");
        }
    }
    reason
}

pub(crate) fn build_version_message() -> Version {
    let (major, minor, patch) = PROTOCOL_VERSION;
    let version_v1 = (major << 16) | (minor << 8) | patch.min(255);
    let version_v2 =
        (u64::from(major) << 48) | (u64::from(minor) << 32) | (u64::from(patch) << 16);
    Version {
        version_v1: Some(version_v1),
        version_v2: Some(version_v2),
        release: Some(format!("mumble-client {}", env!("CARGO_PKG_VERSION"))),
        os: Some(format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)),
        os_version: Some(format!("Rust {}", env!("CARGO_PKG_VERSION"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_message_advertises_both_encodings() {
        let version = build_version_message();
        assert_eq!(version.version_v1, Some((1 << 16) | (5 << 8) | 255));
        assert_eq!(version_triple(&version), (1, 5, 735));
    }

    #[test]
    fn legacy_version_is_unpacked() {
        let version = Version {
            version_v1: Some(0x0001_0204),
            ..Default::default()
        };
        assert_eq!(version_triple(&version), (1, 2, 4));
        assert_eq!(version_triple(&Version::default()), (0, 0, 0));
    }

    #[test]
    fn reject_reason_includes_type() {
        let reject = Reject {
            r#type: Some(RejectType::WrongUserPw as i32),
            reason: Some("bad password".into()),
        };
        assert_eq!(reject_reason(&reject), "WrongUserPw: bad password");
    }

    #[test]
    fn phases_are_ordered() {
        assert!(ConnectionState::Ready.rank() > ConnectionState::Synchronizing.rank());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Closing.is_live());
        assert!(ConnectionState::Handshaking.is_live());
    }
}
