//! Control-channel framing.
//!
//! Every control message travels as a 6 byte preamble (big-endian `u16` type,
//! big-endian `u32` payload length) followed by the payload. Payloads are
//! protobuf except for `UDPTunnel`, which carries a raw voice packet.

use prost::{EncodeError, Message};
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::MumbleError;
use crate::proto::mumble::{
    Authenticate, ChannelRemove, ChannelState, CodecVersion, CryptSetup, PermissionDenied,
    PermissionQuery, Ping, Reject, ServerConfig, ServerSync, SuggestConfig, TextMessage,
    UserRemove, UserState, Version, VoiceTarget,
};

/// Protocol revision tuple (major, minor, patch) advertised to the server.
pub const PROTOCOL_VERSION: (u32, u32, u32) = (1, 5, 735);
/// Size of the Mumble TCP framing header in bytes.
pub const TCP_PREAMBLE_SIZE: usize = 6;
/// Largest payload accepted unless configured otherwise (murmur's own ceiling).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 0x7f_ffff;

const READ_CHUNK: usize = 4096;

/// Fatal framing conditions.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The length field announced more bytes than the configured limit.
    #[error("frame too large: {length} bytes (type={kind}, limit={limit})")]
    TooLarge {
        kind: u16,
        length: usize,
        limit: usize,
    },
}

/// Stateful, incremental TCP frame decoder.
///
/// Bytes are appended with [`feed`](Self::feed) and whole frames are taken out
/// with [`decode`](Self::decode). Partial input is retained across calls, so a
/// frame split over several reads (or a read cancelled by `select!`) never
/// desynchronizes the stream.
#[derive(Debug)]
pub struct TcpFrameDecoder {
    rxbuf: Vec<u8>,
    max_frame_size: usize,
}

impl Default for TcpFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpFrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            rxbuf: Vec::with_capacity(READ_CHUNK),
            max_frame_size,
        }
    }

    /// Number of bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.rxbuf.len()
    }

    /// Append raw transport bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rxbuf.extend_from_slice(bytes);
    }

    /// Take the next complete frame, or `Ok(None)` if more input is needed.
    pub fn decode(&mut self) -> Result<Option<MessageEnvelope>, FrameError> {
        if self.rxbuf.len() < TCP_PREAMBLE_SIZE {
            return Ok(None);
        }

        let msg_type = u16::from_be_bytes([self.rxbuf[0], self.rxbuf[1]]);
        let length = u32::from_be_bytes([
            self.rxbuf[2],
            self.rxbuf[3],
            self.rxbuf[4],
            self.rxbuf[5],
        ]) as usize;

        if length > self.max_frame_size {
            return Err(FrameError::TooLarge {
                kind: msg_type,
                length,
                limit: self.max_frame_size,
            });
        }

        let total = TCP_PREAMBLE_SIZE + length;
        if self.rxbuf.len() < total {
            return Ok(None);
        }

        let payload = self.rxbuf[TCP_PREAMBLE_SIZE..total].to_vec();
        self.rxbuf.drain(..total);
        Ok(Some(MessageEnvelope::new(
            TcpMessageKind::from_id(msg_type),
            payload,
        )))
    }

    /// Read from `reader` until a full frame is available.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a frame boundary. The
    /// future is cancellation safe: bytes already read stay buffered.
    pub async fn read_next<R>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<MessageEnvelope>, MumbleError>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(envelope) = self.decode()? {
                return Ok(Some(envelope));
            }

            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                if self.rxbuf.is_empty() {
                    return Ok(None);
                }
                return Err(MumbleError::ConnectionLost(
                    "unexpected EOF while reading Mumble frame",
                ));
            }
            self.feed(&chunk[..n]);
        }
    }
}

/// High-level message identifier for TCP traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpMessageKind {
    /// Protocol version exchange.
    Version,
    /// Voice packet tunnelled over the control stream.
    UdpTunnel,
    /// Authentication payload containing username, password, and tokens.
    Authenticate,
    /// Ping/Pong keepalive message.
    Ping,
    /// Server rejected the connection attempt.
    Reject,
    /// End of the initial state replay.
    ServerSync,
    /// Channel removal notification.
    ChannelRemove,
    /// Channel state update.
    ChannelState,
    /// User removal notification.
    UserRemove,
    /// User state update.
    UserState,
    BanList,
    /// Text message.
    TextMessage,
    /// Permission denied response.
    PermissionDenied,
    Acl,
    QueryUsers,
    /// Cryptographic setup for the UDP channel (unused by this client).
    CryptSetup,
    ContextActionModify,
    ContextAction,
    UserList,
    /// Whisper target registration.
    VoiceTarget,
    /// Effective permissions for a channel.
    PermissionQuery,
    /// Codec version negotiation.
    CodecVersion,
    UserStats,
    RequestBlob,
    /// Server-wide limits and settings.
    ServerConfig,
    /// Suggested client configuration.
    SuggestConfig,
    /// Identifier outside the protocol table.
    Unknown(u16),
}

impl TcpMessageKind {
    /// Construct a message kind from its wire identifier.
    pub fn from_id(value: u16) -> Self {
        match value {
            0 => TcpMessageKind::Version,
            1 => TcpMessageKind::UdpTunnel,
            2 => TcpMessageKind::Authenticate,
            3 => TcpMessageKind::Ping,
            4 => TcpMessageKind::Reject,
            5 => TcpMessageKind::ServerSync,
            6 => TcpMessageKind::ChannelRemove,
            7 => TcpMessageKind::ChannelState,
            8 => TcpMessageKind::UserRemove,
            9 => TcpMessageKind::UserState,
            10 => TcpMessageKind::BanList,
            11 => TcpMessageKind::TextMessage,
            12 => TcpMessageKind::PermissionDenied,
            13 => TcpMessageKind::Acl,
            14 => TcpMessageKind::QueryUsers,
            15 => TcpMessageKind::CryptSetup,
            16 => TcpMessageKind::ContextActionModify,
            17 => TcpMessageKind::ContextAction,
            18 => TcpMessageKind::UserList,
            19 => TcpMessageKind::VoiceTarget,
            20 => TcpMessageKind::PermissionQuery,
            21 => TcpMessageKind::CodecVersion,
            22 => TcpMessageKind::UserStats,
            23 => TcpMessageKind::RequestBlob,
            24 => TcpMessageKind::ServerConfig,
            25 => TcpMessageKind::SuggestConfig,
            other => TcpMessageKind::Unknown(other),
        }
    }

    /// Return the numeric identifier associated with this message kind.
    pub fn as_id(self) -> u16 {
        match self {
            TcpMessageKind::Version => 0,
            TcpMessageKind::UdpTunnel => 1,
            TcpMessageKind::Authenticate => 2,
            TcpMessageKind::Ping => 3,
            TcpMessageKind::Reject => 4,
            TcpMessageKind::ServerSync => 5,
            TcpMessageKind::ChannelRemove => 6,
            TcpMessageKind::ChannelState => 7,
            TcpMessageKind::UserRemove => 8,
            TcpMessageKind::UserState => 9,
            TcpMessageKind::BanList => 10,
            TcpMessageKind::TextMessage => 11,
            TcpMessageKind::PermissionDenied => 12,
            TcpMessageKind::Acl => 13,
            TcpMessageKind::QueryUsers => 14,
            TcpMessageKind::CryptSetup => 15,
            TcpMessageKind::ContextActionModify => 16,
            TcpMessageKind::ContextAction => 17,
            TcpMessageKind::UserList => 18,
            TcpMessageKind::VoiceTarget => 19,
            TcpMessageKind::PermissionQuery => 20,
            TcpMessageKind::CodecVersion => 21,
            TcpMessageKind::UserStats => 22,
            TcpMessageKind::RequestBlob => 23,
            TcpMessageKind::ServerConfig => 24,
            TcpMessageKind::SuggestConfig => 25,
            TcpMessageKind::Unknown(value) => value,
        }
    }

    /// True for identifiers that are not part of the protocol table.
    pub fn is_unknown(self) -> bool {
        matches!(self, TcpMessageKind::Unknown(_))
    }
}

/// A raw frame: message identifier plus undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Message identifier.
    pub kind: TcpMessageKind,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

impl MessageEnvelope {
    /// Build an envelope from raw parts.
    pub fn new(kind: TcpMessageKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Build an envelope from a protobuf message.
    pub fn try_from_message<M: Message>(
        kind: TcpMessageKind,
        message: &M,
    ) -> Result<Self, EncodeError> {
        let mut payload = Vec::with_capacity(message.encoded_len());
        message.encode(&mut payload)?;
        Ok(Self { kind, payload })
    }

    /// Serialize the envelope to the provided async writer and flush it.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), io::Error>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }

    /// Serialize the envelope into a contiguous byte buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TCP_PREAMBLE_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.kind.as_id().to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Read a single frame using the default size limit.
///
/// Unlike [`TcpFrameDecoder::read_next`] this keeps no state between calls and
/// is not cancellation safe; it suits the strictly sequential server side of
/// tests and tools.
pub async fn read_envelope<R>(reader: &mut R) -> Result<MessageEnvelope, io::Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; TCP_PREAMBLE_SIZE];
    reader.read_exact(&mut header).await?;

    let msg_type = u16::from_be_bytes([header[0], header[1]]);
    let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if length > DEFAULT_MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {length} bytes"),
        ));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(MessageEnvelope::new(
        TcpMessageKind::from_id(msg_type),
        payload,
    ))
}

/// Fully typed representation of a TCP control message.
#[derive(Debug, Clone)]
pub enum MumbleMessage {
    Version(Version),
    /// Raw voice packet; see [`crate::voice`].
    UdpTunnel(Vec<u8>),
    Authenticate(Authenticate),
    Ping(Ping),
    Reject(Reject),
    ServerSync(ServerSync),
    ChannelRemove(ChannelRemove),
    ChannelState(ChannelState),
    UserRemove(UserRemove),
    UserState(UserState),
    TextMessage(TextMessage),
    PermissionDenied(PermissionDenied),
    CryptSetup(CryptSetup),
    VoiceTarget(VoiceTarget),
    PermissionQuery(PermissionQuery),
    CodecVersion(CodecVersion),
    ServerConfig(ServerConfig),
    SuggestConfig(SuggestConfig),
    /// Message the client does not model, including ids outside the table.
    Unknown(MessageEnvelope),
}

impl MumbleMessage {
    /// Return the message identifier corresponding to this variant.
    pub fn kind(&self) -> TcpMessageKind {
        match self {
            MumbleMessage::Version(_) => TcpMessageKind::Version,
            MumbleMessage::UdpTunnel(_) => TcpMessageKind::UdpTunnel,
            MumbleMessage::Authenticate(_) => TcpMessageKind::Authenticate,
            MumbleMessage::Ping(_) => TcpMessageKind::Ping,
            MumbleMessage::Reject(_) => TcpMessageKind::Reject,
            MumbleMessage::ServerSync(_) => TcpMessageKind::ServerSync,
            MumbleMessage::ChannelRemove(_) => TcpMessageKind::ChannelRemove,
            MumbleMessage::ChannelState(_) => TcpMessageKind::ChannelState,
            MumbleMessage::UserRemove(_) => TcpMessageKind::UserRemove,
            MumbleMessage::UserState(_) => TcpMessageKind::UserState,
            MumbleMessage::TextMessage(_) => TcpMessageKind::TextMessage,
            MumbleMessage::PermissionDenied(_) => TcpMessageKind::PermissionDenied,
            MumbleMessage::CryptSetup(_) => TcpMessageKind::CryptSetup,
            MumbleMessage::VoiceTarget(_) => TcpMessageKind::VoiceTarget,
            MumbleMessage::PermissionQuery(_) => TcpMessageKind::PermissionQuery,
            MumbleMessage::CodecVersion(_) => TcpMessageKind::CodecVersion,
            MumbleMessage::ServerConfig(_) => TcpMessageKind::ServerConfig,
            MumbleMessage::SuggestConfig(_) => TcpMessageKind::SuggestConfig,
            MumbleMessage::Unknown(envelope) => envelope.kind,
        }
    }

    /// Short name used in log lines and errors.
    pub fn name(&self) -> &'static str {
        match self {
            MumbleMessage::Version(_) => "Version",
            MumbleMessage::UdpTunnel(_) => "UDPTunnel",
            MumbleMessage::Authenticate(_) => "Authenticate",
            MumbleMessage::Ping(_) => "Ping",
            MumbleMessage::Reject(_) => "Reject",
            MumbleMessage::ServerSync(_) => "ServerSync",
            MumbleMessage::ChannelRemove(_) => "ChannelRemove",
            MumbleMessage::ChannelState(_) => "ChannelState",
            MumbleMessage::UserRemove(_) => "UserRemove",
            MumbleMessage::UserState(_) => "UserState",
            MumbleMessage::TextMessage(_) => "TextMessage",
            MumbleMessage::PermissionDenied(_) => "PermissionDenied",
            MumbleMessage::CryptSetup(_) => "CryptSetup",
            MumbleMessage::VoiceTarget(_) => "VoiceTarget",
            MumbleMessage::PermissionQuery(_) => "PermissionQuery",
            MumbleMessage::CodecVersion(_) => "CodecVersion",
            MumbleMessage::ServerConfig(_) => "ServerConfig",
            MumbleMessage::SuggestConfig(_) => "SuggestConfig",
            MumbleMessage::Unknown(envelope) if envelope.kind.is_unknown() => "Unknown",
            MumbleMessage::Unknown(_) => "Unmodeled",
        }
    }

    /// Convert the message into a framed envelope ready to send on the wire.
    pub fn encode(&self) -> Result<MessageEnvelope, EncodeError> {
        let kind = self.kind();
        match self {
            MumbleMessage::Version(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::UdpTunnel(packet) => Ok(MessageEnvelope::new(kind, packet.clone())),
            MumbleMessage::Authenticate(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::Ping(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::Reject(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::ServerSync(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::ChannelRemove(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::ChannelState(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::UserRemove(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::UserState(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::TextMessage(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::PermissionDenied(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::CryptSetup(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::VoiceTarget(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::PermissionQuery(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::CodecVersion(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::ServerConfig(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::SuggestConfig(msg) => MessageEnvelope::try_from_message(kind, msg),
            MumbleMessage::Unknown(envelope) => Ok(envelope.clone()),
        }
    }
}

/// Errors that can occur while decoding a `MessageEnvelope` into a `MumbleMessage`.
#[derive(Debug, Error)]
pub enum MessageDecodeError {
    /// Protobuf decoding failed for the given message type.
    #[error("failed to decode {kind:?}: {source}")]
    Decode {
        /// Message identifier that failed to decode.
        kind: TcpMessageKind,
        /// Underlying protobuf decode error.
        #[source]
        source: prost::DecodeError,
    },
}

fn decode_as<M: Message + Default>(
    kind: TcpMessageKind,
    payload: &[u8],
) -> Result<M, MessageDecodeError> {
    M::decode(payload).map_err(|source| MessageDecodeError::Decode { kind, source })
}

impl TryFrom<MessageEnvelope> for MumbleMessage {
    type Error = MessageDecodeError;

    fn try_from(envelope: MessageEnvelope) -> Result<Self, Self::Error> {
        let kind = envelope.kind;
        let payload = envelope.payload.as_slice();
        let message = match kind {
            TcpMessageKind::Version => MumbleMessage::Version(decode_as(kind, payload)?),
            TcpMessageKind::UdpTunnel => MumbleMessage::UdpTunnel(envelope.payload),
            TcpMessageKind::Authenticate => MumbleMessage::Authenticate(decode_as(kind, payload)?),
            TcpMessageKind::Ping => MumbleMessage::Ping(decode_as(kind, payload)?),
            TcpMessageKind::Reject => MumbleMessage::Reject(decode_as(kind, payload)?),
            TcpMessageKind::ServerSync => MumbleMessage::ServerSync(decode_as(kind, payload)?),
            TcpMessageKind::ChannelRemove => {
                MumbleMessage::ChannelRemove(decode_as(kind, payload)?)
            }
            TcpMessageKind::ChannelState => MumbleMessage::ChannelState(decode_as(kind, payload)?),
            TcpMessageKind::UserRemove => MumbleMessage::UserRemove(decode_as(kind, payload)?),
            TcpMessageKind::UserState => MumbleMessage::UserState(decode_as(kind, payload)?),
            TcpMessageKind::TextMessage => MumbleMessage::TextMessage(decode_as(kind, payload)?),
            TcpMessageKind::PermissionDenied => {
                MumbleMessage::PermissionDenied(decode_as(kind, payload)?)
            }
            TcpMessageKind::CryptSetup => MumbleMessage::CryptSetup(decode_as(kind, payload)?),
            TcpMessageKind::VoiceTarget => MumbleMessage::VoiceTarget(decode_as(kind, payload)?),
            TcpMessageKind::PermissionQuery => {
                MumbleMessage::PermissionQuery(decode_as(kind, payload)?)
            }
            TcpMessageKind::CodecVersion => MumbleMessage::CodecVersion(decode_as(kind, payload)?),
            TcpMessageKind::ServerConfig => MumbleMessage::ServerConfig(decode_as(kind, payload)?),
            TcpMessageKind::SuggestConfig => {
                MumbleMessage::SuggestConfig(decode_as(kind, payload)?)
            }
            _ => MumbleMessage::Unknown(envelope),
        };
        Ok(message)
    }
}

/// Encode and write a typed message to the provided writer.
pub async fn write_message<W>(writer: &mut W, message: &MumbleMessage) -> Result<(), io::Error>
where
    W: AsyncWrite + Unpin,
{
    let envelope = message
        .encode()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    envelope.write_to(writer).await
}
