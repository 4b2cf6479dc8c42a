use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::MumbleError;
use crate::messages::DEFAULT_MAX_FRAME_SIZE;
use crate::voice::MAX_OPUS_FRAME_LEN;

/// Connection parameters, credentials and protocol tuning.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Hostname or IP address of the server.
    pub host: String,
    /// TCP port, defaults to the public Mumble port.
    pub port: u16,
    /// Optional TLS server name override.
    pub tls_server_name: Option<String>,
    /// Time allowed for TCP connect and for reaching `Ready`.
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    /// Allow invalid or self-signed server certificates.
    pub accept_invalid_certs: bool,
    /// PEM bundle of trusted certificate authorities for server verification.
    pub ca_certificate: Option<PathBuf>,
    /// PEM certificate presented to the server (registered identities).
    pub client_certificate: Option<PathBuf>,
    /// PEM PKCS#8 key matching `client_certificate`.
    pub client_private_key: Option<PathBuf>,
    /// Username presented to the server during authentication.
    pub username: String,
    /// Optional password required by the server or user account.
    pub password: Option<String>,
    /// Additional access tokens supplied during authentication.
    pub tokens: Vec<String>,
    /// Client type flag (0 regular, 1 bot).
    pub client_type: i32,
    /// Largest control frame payload accepted from the server.
    pub max_frame_size: usize,
    /// How long `disconnect` waits for pending writes before closing.
    #[serde(rename = "disconnect_grace_ms", deserialize_with = "millis")]
    pub disconnect_grace: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    pub keepalive: KeepaliveConfig,
    pub voice: VoiceConfig,
}

/// Ping cadence and liveness timeout.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    #[serde(rename = "interval_ms", deserialize_with = "millis")]
    pub interval: Duration,
    /// The connection fails after `interval * timeout_multiplier` of silence.
    pub timeout_multiplier: u32,
}

impl KeepaliveConfig {
    pub fn timeout(&self) -> Duration {
        self.interval * self.timeout_multiplier
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout_multiplier: 2,
        }
    }
}

/// Voice sequencing policy and stream sizing.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Packets at most this far behind the newest accepted one are still played.
    pub late_tolerance: u64,
    /// A forward jump larger than this restarts the sequence baseline.
    pub reset_threshold: u64,
    /// Frames buffered per inbound stream before new frames are dropped.
    pub stream_capacity: usize,
    /// PCM sample rate used for outbound framing.
    pub sample_rate: u32,
    /// Outbound frame duration in milliseconds.
    pub frame_ms: u32,
    /// Interleaved PCM channel count.
    pub channels: u16,
}

impl VoiceConfig {
    /// Samples (all channels) making up one outbound frame.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize / 1000) * self.channels as usize
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            late_tolerance: 10,
            reset_threshold: 500,
            stream_capacity: 64,
            sample_rate: 48_000,
            frame_ms: 20,
            channels: 1,
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration for the given host, using the default port.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 64738,
            tls_server_name: None,
            connect_timeout: Duration::from_secs(10),
            accept_invalid_certs: false,
            ca_certificate: None,
            client_certificate: None,
            client_private_key: None,
            username: "mumble-client".to_string(),
            password: None,
            tokens: Vec::new(),
            client_type: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            disconnect_grace: Duration::from_secs(1),
            event_capacity: 256,
            keepalive: KeepaliveConfig::default(),
            voice: VoiceConfig::default(),
        }
    }

    pub fn builder(host: impl Into<String>) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            config: Self::new(host),
        }
    }

    /// Parse a TOML document, then apply `MUMBLE_*` environment overrides.
    pub fn from_toml_str(s: &str) -> Result<Self, MumbleError> {
        let mut cfg: ConnectionConfig =
            toml::from_str(s).map_err(|err| MumbleError::InvalidConfig(err.to_string()))?;
        if let Ok(v) = std::env::var("MUMBLE_HOST") {
            cfg.host = v;
        }
        if let Some(port) = std::env::var("MUMBLE_PORT").ok().and_then(|v| v.parse().ok()) {
            cfg.port = port;
        }
        if let Ok(v) = std::env::var("MUMBLE_TLS_SERVER_NAME") {
            cfg.tls_server_name = Some(v);
        }
        if let Ok(v) = std::env::var("MUMBLE_USERNAME") {
            cfg.username = v;
        }
        if let Ok(v) = std::env::var("MUMBLE_PASSWORD") {
            cfg.password = Some(v);
        }
        if let Some(accept) = std::env::var("MUMBLE_ACCEPT_INVALID_CERTS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            cfg.accept_invalid_certs = accept;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject combinations the connection cannot run with.
    pub fn validate(&self) -> Result<(), MumbleError> {
        if self.username.trim().is_empty() {
            return Err(MumbleError::InvalidConfig("username may not be empty".into()));
        }
        if self.keepalive.interval.is_zero() || self.keepalive.timeout_multiplier == 0 {
            return Err(MumbleError::InvalidConfig(
                "keepalive interval and multiplier must be positive".into(),
            ));
        }
        if self.voice.late_tolerance > self.voice.reset_threshold {
            return Err(MumbleError::InvalidConfig(
                "voice late_tolerance may not exceed reset_threshold".into(),
            ));
        }
        if self.voice.stream_capacity == 0 || self.event_capacity == 0 {
            return Err(MumbleError::InvalidConfig("capacities must be positive".into()));
        }
        if self.client_certificate.is_some() != self.client_private_key.is_some() {
            return Err(MumbleError::InvalidConfig(
                "client_certificate and client_private_key must be set together".into(),
            ));
        }
        let frame_bytes = self.voice.samples_per_frame() * 2;
        if frame_bytes == 0 {
            return Err(MumbleError::InvalidConfig("voice frame size is zero".into()));
        }
        if frame_bytes > MAX_OPUS_FRAME_LEN {
            return Err(MumbleError::InvalidConfig(format!(
                "voice frame of {frame_bytes} bytes exceeds the {MAX_OPUS_FRAME_LEN} byte limit"
            )));
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("localhost")
    }
}

/// Fluent construction of [`ConnectionConfig`].
#[derive(Clone, Debug)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.tls_server_name = Some(name.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.accept_invalid_certs = accept;
        self
    }

    pub fn ca_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_certificate = Some(path.into());
        self
    }

    pub fn client_certificate(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.config.client_certificate = Some(cert.into());
        self.config.client_private_key = Some(key.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn tokens(mut self, tokens: Vec<String>) -> Self {
        self.config.tokens = tokens;
        self
    }

    pub fn client_type(mut self, client_type: i32) -> Self {
        self.config.client_type = client_type;
        self
    }

    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.config.max_frame_size = max;
        self
    }

    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.config.disconnect_grace = grace;
        self
    }

    pub fn keepalive(mut self, interval: Duration, timeout_multiplier: u32) -> Self {
        self.config.keepalive = KeepaliveConfig {
            interval,
            timeout_multiplier,
        };
        self
    }

    pub fn voice(mut self, voice: VoiceConfig) -> Self {
        self.config.voice = voice;
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
