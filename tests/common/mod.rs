#![allow(dead_code)]

use std::time::Duration;

use mumble_client::messages::{read_envelope, write_message, MessageEnvelope, TcpMessageKind};
use mumble_client::proto::mumble::{ChannelState, ServerSync, UserState, Version};
use mumble_client::{
    AudioBackend, ConnectionConfig, MumbleClient, MumbleEvent, MumbleMessage, VoicePacket,
};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;

pub const SELF_SESSION: u32 = 42;
pub const OTHER_SESSION: u32 = 7;
pub const LOBBY: u32 = 1;
pub const GAMES: u32 = 2;
pub const AFK: u32 = 3;

/// Scripted server side of an in-memory connection.
pub struct MockServer {
    pub io: DuplexStream,
}

impl MockServer {
    pub async fn recv(&mut self) -> MumbleMessage {
        let envelope = tokio::time::timeout(Duration::from_secs(5), read_envelope(&mut self.io))
            .await
            .expect("timed out waiting for client frame")
            .expect("client frame");
        MumbleMessage::try_from(envelope).expect("decodable client frame")
    }

    /// Next message that is not a keepalive ping.
    pub async fn recv_non_ping(&mut self) -> MumbleMessage {
        loop {
            match self.recv().await {
                MumbleMessage::Ping(_) => continue,
                other => return other,
            }
        }
    }

    /// Next tunnelled voice packet, parsed as sent by a client.
    pub async fn recv_voice(&mut self) -> VoicePacket {
        match self.recv_non_ping().await {
            MumbleMessage::UdpTunnel(bytes) => {
                VoicePacket::decode_serverbound(&bytes).expect("well formed voice packet")
            }
            other => panic!("expected UDPTunnel, got {}", other.name()),
        }
    }

    pub async fn send(&mut self, message: MumbleMessage) {
        write_message(&mut self.io, &message).await.expect("server write");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.expect("server write");
        self.io.flush().await.expect("server flush");
    }

    /// Frame with an id outside the protocol table.
    pub async fn send_unknown(&mut self, id: u16) {
        let envelope = MessageEnvelope::new(TcpMessageKind::from_id(id), vec![1, 2, 3]);
        self.send_raw(&envelope.to_bytes()).await;
    }

    pub async fn send_version(&mut self, major: u32, minor: u32, patch: u32) {
        self.send(MumbleMessage::Version(Version {
            version_v1: Some((major << 16) | (minor << 8) | patch.min(255)),
            release: Some("mock".into()),
            ..Default::default()
        }))
        .await;
    }

    /// Root, Lobby, Lobby/Games and AFK, with us and one other user in Lobby.
    pub async fn send_initial_state(&mut self) {
        let channels = [
            (0, None, "Root", 0),
            (LOBBY, Some(0), "Lobby", 1),
            (GAMES, Some(LOBBY), "Games", 0),
            (AFK, Some(0), "AFK", 2),
        ];
        for (id, parent, name, position) in channels {
            self.send(MumbleMessage::ChannelState(ChannelState {
                channel_id: Some(id),
                parent,
                name: Some(name.to_string()),
                position: Some(position),
                ..Default::default()
            }))
            .await;
        }
        for (session, name) in [(OTHER_SESSION, "bob"), (SELF_SESSION, "alice")] {
            self.send(MumbleMessage::UserState(UserState {
                session: Some(session),
                name: Some(name.to_string()),
                channel_id: Some(LOBBY),
                user_id: (session == OTHER_SESSION).then_some(12),
                ..Default::default()
            }))
            .await;
        }
    }

    pub async fn send_sync(&mut self, permissions: Option<u64>) {
        self.send(MumbleMessage::ServerSync(ServerSync {
            session: Some(SELF_SESSION),
            max_bandwidth: Some(72_000),
            welcome_text: Some("welcome".into()),
            permissions,
        }))
        .await;
    }

    /// Play the server half of a successful handshake.
    pub async fn accept(&mut self) {
        match self.recv_non_ping().await {
            MumbleMessage::Version(_) => {}
            other => panic!("expected Version, got {}", other.name()),
        }
        self.send_version(1, 5, 0).await;
        match self.recv_non_ping().await {
            MumbleMessage::Authenticate(auth) => {
                assert_eq!(auth.username.as_deref(), Some("alice"))
            }
            other => panic!("expected Authenticate, got {}", other.name()),
        }
        self.send_initial_state().await;
        self.send_sync(Some(0x0f)).await;
    }
}

pub fn config() -> ConnectionConfig {
    ConnectionConfig::builder("localhost")
        .username("alice")
        .connect_timeout(Duration::from_secs(5))
        .build()
}

pub fn pipe() -> (DuplexStream, MockServer) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    (client, MockServer { io: server })
}

/// Connected client plus the server side, after `Ready`.
pub async fn connected_with(config: ConnectionConfig) -> (MumbleClient, MockServer) {
    let (stream, mut server) = pipe();
    let (client, ()) = tokio::join!(
        MumbleClient::connect_with_audio(stream, config, AudioBackend::raw()),
        server.accept()
    );
    (client.expect("client connects"), server)
}

pub async fn connected() -> (MumbleClient, MockServer) {
    connected_with(config()).await
}

pub async fn wait_for<F>(events: &mut broadcast::Receiver<MumbleEvent>, pred: F) -> MumbleEvent
where
    F: FnMut(&MumbleEvent) -> bool,
{
    mumble_client::client::wait_for_event(events, Duration::from_secs(5), pred)
        .await
        .expect("expected event")
}

/// Collect events until one matches `stop`, inclusive.
pub async fn collect_until<F>(
    events: &mut broadcast::Receiver<MumbleEvent>,
    mut stop: F,
) -> Vec<MumbleEvent>
where
    F: FnMut(&MumbleEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out collecting events")
            .expect("event channel open");
        let done = stop(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}
