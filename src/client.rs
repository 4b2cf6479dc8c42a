//! Application-facing client built on [`MumbleConnection`].
//!
//! Lookups return owned snapshots taken under the state lock, so callers
//! never observe a half-applied delta and never hold the lock themselves.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::audio::{AudioBackend, PcmFramer, VoicePayload};
use crate::config::ConnectionConfig;
use crate::connection::{ConnectionState, MumbleConnection, MumbleEvent, SessionInfo};
use crate::error::MumbleError;
use crate::messages::MumbleMessage;
use crate::proto::mumble::{
    voice_target, ChannelRemove, ChannelState, PermissionQuery, TextMessage, UserRemove,
    UserState, VoiceTarget as VoiceTargetMessage,
};
use crate::state::{Channel, StateTree, User, ROOT_CHANNEL};
use crate::voice::VoiceTarget;
use crate::voice_session::VoiceStream;

/// Addressees of a text message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients {
    pub sessions: Vec<u32>,
    pub channels: Vec<u32>,
    /// Channels whose whole subtree receives the message.
    pub trees: Vec<u32>,
}

impl Recipients {
    pub fn session(session: u32) -> Self {
        Self {
            sessions: vec![session],
            ..Default::default()
        }
    }

    pub fn channel(channel: u32) -> Self {
        Self {
            channels: vec![channel],
            ..Default::default()
        }
    }

    pub fn tree(channel: u32) -> Self {
        Self {
            trees: vec![channel],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.channels.is_empty() && self.trees.is_empty()
    }
}

/// Snapshot of a channel together with the users inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelView {
    pub channel: Channel,
    pub users: Vec<User>,
    /// `/`-separated names below the root; empty for the root itself.
    pub path: String,
}

impl ChannelView {
    fn capture(tree: &StateTree, channel: &Channel) -> Self {
        Self {
            channel: channel.clone(),
            users: tree.users_in(channel.id).into_iter().cloned().collect(),
            path: tree.channel_path(channel.id).unwrap_or_default(),
        }
    }
}

/// Recipient set of a registered whisper target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhisperTarget {
    Sessions(Vec<u32>),
    Channel {
        id: u32,
        links: bool,
        children: bool,
        group: Option<String>,
    },
}

impl From<WhisperTarget> for voice_target::Target {
    fn from(target: WhisperTarget) -> Self {
        match target {
            WhisperTarget::Sessions(session) => voice_target::Target {
                session,
                ..Default::default()
            },
            WhisperTarget::Channel {
                id,
                links,
                children,
                group,
            } => voice_target::Target {
                channel_id: Some(id),
                links: Some(links),
                children: Some(children),
                group,
                ..Default::default()
            },
        }
    }
}

/// High-level Mumble client.
#[derive(Debug, Clone)]
pub struct MumbleClient {
    connection: MumbleConnection,
}

impl MumbleClient {
    /// Run the handshake on `stream` with the configured credentials and
    /// wait for the server to finish synchronizing.
    pub async fn connect<S>(stream: S, config: ConnectionConfig) -> Result<Self, MumbleError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::connect_with_audio(stream, config, AudioBackend::default()).await
    }

    pub async fn connect_with_audio<S>(
        stream: S,
        config: ConnectionConfig,
        backend: AudioBackend,
    ) -> Result<Self, MumbleError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let limit = config.connect_timeout;
        let connection = MumbleConnection::open_with_audio(stream, config, backend).await?;
        let handshake = async {
            connection
                .wait_for_state(ConnectionState::Authenticating)
                .await?;
            connection.authenticate_from_config().await?;
            connection.wait_for_state(ConnectionState::Ready).await
        };
        match tokio::time::timeout(limit, handshake).await {
            Ok(Ok(())) => Ok(Self { connection }),
            Ok(Err(err)) => {
                connection.disconnect().await?;
                Err(err)
            }
            Err(_) => {
                connection.disconnect().await?;
                Err(MumbleError::Timeout(format!(
                    "server did not finish synchronizing within {limit:?}"
                )))
            }
        }
    }

    /// Connect over TLS using [`crate::transport::connect_tls`].
    pub async fn connect_tls(config: ConnectionConfig) -> Result<Self, MumbleError> {
        config.validate()?;
        let stream = crate::transport::connect_tls(&config).await?;
        Self::connect(stream, config).await
    }

    /// Wrap a connection that is driven manually.
    pub fn from_connection(connection: MumbleConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &MumbleConnection {
        &self.connection
    }

    pub async fn authenticate(
        &self,
        username: &str,
        password: Option<&str>,
        tokens: &[String],
    ) -> Result<(), MumbleError> {
        self.connection.authenticate(username, password, tokens).await
    }

    pub fn phase(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MumbleEvent> {
        self.connection.subscribe_events()
    }

    pub async fn disconnect(&self) -> Result<(), MumbleError> {
        self.connection.disconnect().await
    }

    pub async fn info(&self) -> SessionInfo {
        self.connection.info().await
    }

    pub async fn session(&self) -> Option<u32> {
        self.connection.session().await
    }

    pub async fn users(&self) -> Vec<User> {
        self.connection
            .with_tree(|tree| tree.users().cloned().collect())
            .await
    }

    pub async fn user_by_session(&self, session: u32) -> Option<User> {
        self.connection
            .with_tree(|tree| tree.user(session).cloned())
            .await
    }

    /// Look up a registered user by account id.
    pub async fn user_by_id(&self, user_id: u32) -> Option<User> {
        self.connection
            .with_tree(|tree| tree.user_by_id(user_id).cloned())
            .await
    }

    pub async fn user_by_name(&self, name: &str) -> Option<User> {
        self.connection
            .with_tree(|tree| tree.user_by_name(name).cloned())
            .await
    }

    pub async fn self_user(&self) -> Option<User> {
        let session = self.session().await?;
        self.user_by_session(session).await
    }

    pub async fn channel_by_id(&self, id: u32) -> Option<ChannelView> {
        self.connection
            .with_tree(|tree| tree.channel(id).map(|c| ChannelView::capture(tree, c)))
            .await
    }

    pub async fn channel_by_name(&self, name: &str) -> Option<ChannelView> {
        self.connection
            .with_tree(|tree| tree.channel_by_name(name).map(|c| ChannelView::capture(tree, c)))
            .await
    }

    pub async fn channel_by_path(&self, path: &str) -> Option<ChannelView> {
        self.connection
            .with_tree(|tree| tree.channel_by_path(path).map(|c| ChannelView::capture(tree, c)))
            .await
    }

    pub async fn root_channel(&self) -> ChannelView {
        self.connection
            .with_tree(|tree| ChannelView::capture(tree, tree.root()))
            .await
    }

    pub async fn channel_path(&self, id: u32) -> Option<String> {
        self.connection.with_tree(|tree| tree.channel_path(id)).await
    }

    /// Direct sub-channels in display order.
    pub async fn children(&self, id: u32) -> Vec<Channel> {
        self.connection
            .with_tree(|tree| tree.children(id).into_iter().cloned().collect())
            .await
    }

    /// Send a text message, honoring the server's length limit when known.
    pub async fn send_text(&self, text: &str, recipients: Recipients) -> Result<(), MumbleError> {
        if recipients.is_empty() {
            return Err(MumbleError::Protocol(
                "text message needs at least one recipient".into(),
            ));
        }
        let limit = self
            .info()
            .await
            .server_config
            .and_then(|config| config.message_length)
            .filter(|limit| *limit > 0);
        if let Some(limit) = limit {
            if text.len() > limit as usize {
                return Err(MumbleError::Protocol(format!(
                    "text message of {} bytes exceeds the server limit of {limit}",
                    text.len()
                )));
            }
        }
        self.send(MumbleMessage::TextMessage(TextMessage {
            session: recipients.sessions,
            channel_id: recipients.channels,
            tree_id: recipients.trees,
            message: text.to_string(),
            ..Default::default()
        }))
        .await
    }

    pub async fn voice_stream(
        &self,
        session: u32,
        target: VoiceTarget,
    ) -> Result<VoiceStream, MumbleError> {
        self.connection.voice_stream(session, target).await
    }

    /// Audio from every speaker talking to `target`.
    pub async fn shared_voice_stream(
        &self,
        target: VoiceTarget,
    ) -> Result<VoiceStream, MumbleError> {
        self.connection.shared_voice_stream(target).await
    }

    pub async fn loopback_stream(&self) -> Result<VoiceStream, MumbleError> {
        self.connection.loopback_stream().await
    }

    /// Outbound sink accepting raw s16le PCM bytes.
    pub async fn voice_sink(&self, target: VoiceTarget) -> Result<VoiceSink, MumbleError> {
        if self.phase() != ConnectionState::Ready {
            return Err(MumbleError::InvalidState {
                operation: "voice_sink",
                state: self.phase(),
            });
        }
        let frame_size = self.connection.frame_size().await;
        Ok(VoiceSink {
            connection: self.connection.clone(),
            target,
            framer: PcmFramer::new(frame_size),
        })
    }

    pub async fn send_voice(
        &self,
        payload: VoicePayload,
        target: VoiceTarget,
    ) -> Result<(), MumbleError> {
        self.connection.send_voice(payload, target).await
    }

    pub async fn end_voice(&self, target: VoiceTarget) -> Result<(), MumbleError> {
        self.connection.end_voice(target).await
    }

    pub async fn set_bitrate(&self, bitrate: i32) -> Result<(), MumbleError> {
        self.connection.set_bitrate(bitrate).await
    }

    /// Bind whisper target `id` (1..=30) to a set of recipients.
    pub async fn register_voice_target(
        &self,
        id: u8,
        targets: Vec<WhisperTarget>,
    ) -> Result<VoiceTarget, MumbleError> {
        let target = VoiceTarget::whisper(id).ok_or_else(|| {
            MumbleError::InvalidConfig(format!("whisper target id {id} outside 1..=30"))
        })?;
        self.send(MumbleMessage::VoiceTarget(VoiceTargetMessage {
            id: Some(u32::from(id)),
            targets: targets.into_iter().map(Into::into).collect(),
        }))
        .await?;
        Ok(target)
    }

    pub async fn move_user(&self, session: u32, channel: u32) -> Result<(), MumbleError> {
        self.send_user_state(UserState {
            session: Some(session),
            channel_id: Some(channel),
            ..Default::default()
        })
        .await
    }

    pub async fn join_channel(&self, channel: u32) -> Result<(), MumbleError> {
        let session = self.own_session("join_channel").await?;
        self.move_user(session, channel).await
    }

    pub async fn join_path(&self, path: &str) -> Result<(), MumbleError> {
        self.connection.join_path(path).await
    }

    pub async fn set_mute(&self, session: u32, mute: bool) -> Result<(), MumbleError> {
        self.send_user_state(UserState {
            session: Some(session),
            mute: Some(mute),
            ..Default::default()
        })
        .await
    }

    pub async fn set_deaf(&self, session: u32, deaf: bool) -> Result<(), MumbleError> {
        self.send_user_state(UserState {
            session: Some(session),
            deaf: Some(deaf),
            ..Default::default()
        })
        .await
    }

    pub async fn set_self_mute(&self, mute: bool) -> Result<(), MumbleError> {
        let session = self.own_session("set_self_mute").await?;
        self.send_user_state(UserState {
            session: Some(session),
            self_mute: Some(mute),
            ..Default::default()
        })
        .await
    }

    /// Deafening also mutes; the server enforces the same rule.
    pub async fn set_self_deaf(&self, deaf: bool) -> Result<(), MumbleError> {
        let session = self.own_session("set_self_deaf").await?;
        self.send_user_state(UserState {
            session: Some(session),
            self_deaf: Some(deaf),
            self_mute: deaf.then_some(true),
            ..Default::default()
        })
        .await
    }

    pub async fn kick(&self, session: u32, reason: Option<&str>) -> Result<(), MumbleError> {
        self.send(MumbleMessage::UserRemove(UserRemove {
            session,
            reason: reason.map(str::to_string),
            ..Default::default()
        }))
        .await
    }

    pub async fn ban(&self, session: u32, reason: Option<&str>) -> Result<(), MumbleError> {
        self.send(MumbleMessage::UserRemove(UserRemove {
            session,
            reason: reason.map(str::to_string),
            ban: Some(true),
            ..Default::default()
        }))
        .await
    }

    /// Ask the server to create a channel; it appears via `ChannelCreated`.
    pub async fn create_channel(
        &self,
        parent: u32,
        name: &str,
        temporary: bool,
    ) -> Result<(), MumbleError> {
        self.send(MumbleMessage::ChannelState(ChannelState {
            parent: Some(parent),
            name: Some(name.to_string()),
            temporary: Some(temporary),
            ..Default::default()
        }))
        .await
    }

    pub async fn remove_channel(&self, channel: u32) -> Result<(), MumbleError> {
        if channel == ROOT_CHANNEL {
            return Err(MumbleError::Channel("the root channel cannot be removed".into()));
        }
        self.send(MumbleMessage::ChannelRemove(ChannelRemove { channel_id: channel }))
            .await
    }

    pub async fn rename_channel(&self, channel: u32, name: &str) -> Result<(), MumbleError> {
        self.send_channel_state(ChannelState {
            channel_id: Some(channel),
            name: Some(name.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn move_channel(&self, channel: u32, parent: u32) -> Result<(), MumbleError> {
        let cyclic = self
            .connection
            .with_tree(|tree| tree.is_ancestor(channel, parent))
            .await;
        if cyclic {
            return Err(MumbleError::Channel(format!(
                "cannot move channel {channel} below its own subtree"
            )));
        }
        self.send_channel_state(ChannelState {
            channel_id: Some(channel),
            parent: Some(parent),
            ..Default::default()
        })
        .await
    }

    pub async fn link_channels(&self, channel: u32, other: u32) -> Result<(), MumbleError> {
        self.send_channel_state(ChannelState {
            channel_id: Some(channel),
            links_add: vec![other],
            ..Default::default()
        })
        .await
    }

    pub async fn unlink_channels(&self, channel: u32, other: u32) -> Result<(), MumbleError> {
        self.send_channel_state(ChannelState {
            channel_id: Some(channel),
            links_remove: vec![other],
            ..Default::default()
        })
        .await
    }

    /// Our permission bits in `channel`, from the cache or asked of the server.
    pub async fn channel_permissions(&self, channel: u32) -> Result<u32, MumbleError> {
        let cached = self
            .connection
            .with_tree(|tree| tree.channel(channel).map(|c| c.permissions))
            .await
            .ok_or_else(|| MumbleError::Channel(format!("unknown channel {channel}")))?;
        if let Some(permissions) = cached {
            return Ok(permissions);
        }

        let mut events = self.connection.fresh_events();
        self.send(MumbleMessage::PermissionQuery(PermissionQuery {
            channel_id: Some(channel),
            ..Default::default()
        }))
        .await?;
        let limit = self.connection.config().connect_timeout;
        let answer = async {
            loop {
                match events.recv().await {
                    Ok(MumbleEvent::ChannelPermissions {
                        channel: id,
                        permissions,
                    }) if id == channel => return Ok(permissions),
                    Ok(MumbleEvent::Disconnected) | Err(RecvError::Closed) => {
                        return Err(MumbleError::ConnectionLost("disconnected awaiting permissions"))
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        };
        tokio::time::timeout(limit, answer)
            .await
            .map_err(|_| MumbleError::Timeout(format!("permissions for channel {channel}")))?
    }

    async fn own_session(&self, operation: &'static str) -> Result<u32, MumbleError> {
        self.session().await.ok_or(MumbleError::InvalidState {
            operation,
            state: self.phase(),
        })
    }

    async fn send_user_state(&self, state: UserState) -> Result<(), MumbleError> {
        self.send(MumbleMessage::UserState(state)).await
    }

    async fn send_channel_state(&self, state: ChannelState) -> Result<(), MumbleError> {
        self.send(MumbleMessage::ChannelState(state)).await
    }

    async fn send(&self, message: MumbleMessage) -> Result<(), MumbleError> {
        self.connection.send_message(message).await
    }
}

/// Outbound audio sink: raw s16le PCM in, voice packets out.
///
/// Bytes are buffered until a whole encoder frame is available.
#[derive(Debug)]
pub struct VoiceSink {
    connection: MumbleConnection,
    target: VoiceTarget,
    framer: PcmFramer,
}

impl VoiceSink {
    pub fn target(&self) -> VoiceTarget {
        self.target
    }

    /// Linear gain applied to samples before encoding.
    pub fn set_gain(&mut self, gain: f32) {
        self.framer.set_gain(gain);
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), MumbleError> {
        for frame in self.framer.push(bytes) {
            self.connection
                .send_voice(VoicePayload::Pcm(frame), self.target)
                .await?;
        }
        Ok(())
    }

    /// Send any buffered audio padded with silence, then end the transmission.
    pub async fn close(mut self) -> Result<(), MumbleError> {
        if let Some(frame) = self.framer.flush() {
            self.connection
                .send_voice(VoicePayload::Pcm(frame), self.target)
                .await?;
        }
        self.connection.end_voice(self.target).await
    }
}

/// Wait for the first event matching `pred`, skipping lag notifications.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<MumbleEvent>,
    limit: Duration,
    mut pred: F,
) -> Option<MumbleEvent>
where
    F: FnMut(&MumbleEvent) -> bool,
{
    let search = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(limit, search).await.ok().flatten()
}
