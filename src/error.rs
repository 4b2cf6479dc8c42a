use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::rustls;

use crate::connection::ConnectionState;

/// Crate-wide error type capturing common failure cases.
#[derive(Debug, Error)]
pub enum MumbleError {
    /// Input parameters failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Networking failure while communicating with the server.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    /// TLS handshake or certificate validation failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    /// The control stream carried a frame that cannot be delimited.
    #[error("framing error: {0}")]
    Framing(#[from] crate::messages::FrameError),
    /// Protocol-level violation or serialization failure.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A well-formed message arrived in a state where it is not allowed.
    #[error("unexpected {kind} message while {state:?}")]
    UnexpectedMessage {
        kind: &'static str,
        state: ConnectionState,
    },
    /// Server speaks an incompatible protocol major version.
    #[error("incompatible server version {major}.{minor}.{patch}")]
    VersionMismatch { major: u32, minor: u32, patch: u32 },
    /// Server rejected the authentication attempt.
    #[error("server rejected connection: {0}")]
    Rejected(String),
    /// Operation timed out waiting for a server response.
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// The connection dropped unexpectedly.
    #[error("connection lost: {0}")]
    ConnectionLost(&'static str),
    /// Operation is not permitted in the current connection state.
    #[error("{operation} is not allowed while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },
    /// Channel operation failed.
    #[error("channel error: {0}")]
    Channel(String),
    /// Voice packet could not be built or parsed.
    #[error("voice error: {0}")]
    Voice(#[from] crate::voice::VoicePacketError),
    /// The connection already failed; carries the original cause.
    #[error("connection failed: {0}")]
    Failed(Arc<MumbleError>),
    /// Audio encoder or decoder failure.
    #[error("audio error: {0}")]
    Audio(#[from] crate::audio::AudioError),
}

impl MumbleError {
    /// True for errors raised by the state machine precondition checks.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, MumbleError::InvalidState { .. })
    }
}
