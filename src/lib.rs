//! Async client for the Mumble voice-chat protocol.
//!
//! The crate keeps an authenticated control connection alive, mirrors the
//! server's channel and user state locally, and carries voice over the
//! control stream (`UDPTunnel`).
//!
//! ## Example
//!
//! ```no_run
//! use mumble_client::{transport, ConnectionConfig, MumbleClient, Recipients};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::builder("mumble.example")
//!         .username("rust-bot")
//!         .accept_invalid_certs(true)
//!         .build();
//!
//!     let stream = transport::connect_tls(&config).await?;
//!     let client = MumbleClient::connect(stream, config).await?;
//!     let root = client.root_channel().await;
//!     client
//!         .send_text("hello", Recipients::channel(root.channel.id))
//!         .await?;
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod keepalive;
pub mod messages;
pub mod proto;
pub mod state;
pub mod transport;
mod varint;
pub mod voice;
pub mod voice_session;

pub use audio::{AudioBackend, AudioDecoder, AudioEncoder, AudioError, PcmFramer, VoicePayload};
pub use client::{ChannelView, MumbleClient, Recipients, VoiceSink, WhisperTarget};
pub use config::{ConnectionConfig, ConnectionConfigBuilder, KeepaliveConfig, VoiceConfig};
pub use connection::{ConnectionState, MumbleConnection, MumbleEvent, SessionInfo};
pub use error::MumbleError;
pub use messages::{MessageEnvelope, MumbleMessage, TcpFrameDecoder, TcpMessageKind};
pub use state::{Channel, StateChange, StateTree, User, UserFlag};
pub use voice::{VoiceCodec, VoicePacket, VoicePacketError, VoiceTarget};
pub use voice_session::{SequenceTracker, SequenceVerdict, VoiceFrame, VoiceStream};
