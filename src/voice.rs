//! Voice packet layout.
//!
//! A voice packet starts with one header byte, `codec << 5 | target`, followed
//! by the sender session (only in packets sent by the server), the sequence
//! number, the compressed frames and optionally three positional floats.
//! Integers use the encoding in [`crate::varint`].
//!
//! Frame delimiting depends on the codec. CELT and Speex prefix every frame
//! with a byte whose low 7 bits are the length and whose high bit announces
//! another frame; a trailing empty frame ends the transmission. Opus carries a
//! single frame behind a varint whose low 13 bits are the length and whose bit
//! `0x2000` ends the transmission.

use thiserror::Error;

use crate::varint::{self, VarintError};

/// Largest CELT/Speex frame expressible by the 7 bit length prefix.
pub const MAX_LEGACY_FRAME_LEN: usize = 0x7F;
/// Largest Opus frame expressible by the 13 bit length prefix.
pub const MAX_OPUS_FRAME_LEN: usize = 0x1FFF;

const LEGACY_CONTINUATION: u8 = 0x80;
const OPUS_TERMINATOR: u64 = 0x2000;
const CODEC_PING: u8 = 1;

/// Routing selector carried in the low 5 bits of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VoiceTarget {
    /// Speech to the speaker's current channel.
    Normal,
    /// Whisper target id in `1..=30`.
    Whisper(u8),
    /// Server echoes the packet back to the speaker.
    Loopback,
}

impl VoiceTarget {
    pub const LOOPBACK_ID: u8 = 31;

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x1F {
            0 => VoiceTarget::Normal,
            Self::LOOPBACK_ID => VoiceTarget::Loopback,
            id => VoiceTarget::Whisper(id),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            VoiceTarget::Normal => 0,
            VoiceTarget::Whisper(id) => id & 0x1F,
            VoiceTarget::Loopback => Self::LOOPBACK_ID,
        }
    }

    /// Build a whisper target, rejecting ids outside `1..=30`.
    pub fn whisper(id: u8) -> Option<Self> {
        (1..Self::LOOPBACK_ID).contains(&id).then_some(VoiceTarget::Whisper(id))
    }
}

/// Codec identifier carried in the high 3 bits of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceCodec {
    CeltAlpha,
    Speex,
    CeltBeta,
    Opus,
}

impl VoiceCodec {
    pub fn id(self) -> u8 {
        match self {
            VoiceCodec::CeltAlpha => 0,
            VoiceCodec::Speex => 2,
            VoiceCodec::CeltBeta => 3,
            VoiceCodec::Opus => 4,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, VoicePacketError> {
        match id {
            0 => Ok(VoiceCodec::CeltAlpha),
            2 => Ok(VoiceCodec::Speex),
            3 => Ok(VoiceCodec::CeltBeta),
            4 => Ok(VoiceCodec::Opus),
            CODEC_PING => Err(VoicePacketError::Ping),
            other => Err(VoicePacketError::UnsupportedCodec(other)),
        }
    }

    fn max_frame_len(self) -> usize {
        match self {
            VoiceCodec::Opus => MAX_OPUS_FRAME_LEN,
            _ => MAX_LEGACY_FRAME_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoicePacketError {
    #[error("empty voice packet")]
    Empty,
    #[error("tunnelled ping packet")]
    Ping,
    #[error("unsupported voice codec id {0}")]
    UnsupportedCodec(u8),
    #[error("malformed varint: {0}")]
    Varint(#[from] VarintError),
    #[error("voice frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("voice frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong { len: usize, max: usize },
    #[error("opus packets carry exactly one frame, got {0}")]
    OpusFrameCount(usize),
    #[error("voice packet carries no frames")]
    NoFrames,
    #[error("voice frame {0} is empty")]
    EmptyFrame(usize),
    #[error("sender session {0} out of range")]
    SessionOutOfRange(u64),
}

/// A decoded or to-be-encoded voice packet.
#[derive(Debug, Clone, PartialEq)]
pub struct VoicePacket {
    pub target: VoiceTarget,
    pub codec: VoiceCodec,
    /// Sender session; present only on packets relayed by the server.
    pub session: Option<u32>,
    pub sequence: u64,
    pub frames: Vec<Vec<u8>>,
    /// True if this packet ends the current transmission.
    pub terminator: bool,
    /// Optional XYZ positional coordinates.
    pub positional: Option<[f32; 3]>,
}

impl VoicePacket {
    /// Outbound packet; the server attributes it to the local session.
    pub fn outbound(
        target: VoiceTarget,
        codec: VoiceCodec,
        sequence: u64,
        frames: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            target,
            codec,
            session: None,
            sequence,
            frames,
            terminator: false,
            positional: None,
        }
    }

    pub fn header(&self) -> u8 {
        (self.codec.id() << 5) | self.target.bits()
    }

    /// Serialize the packet. The session id is written only when present.
    pub fn encode(&self) -> Result<Vec<u8>, VoicePacketError> {
        let max = self.codec.max_frame_len();
        if let Some(frame) = self.frames.iter().find(|frame| frame.len() > max) {
            return Err(VoicePacketError::FrameTooLong {
                len: frame.len(),
                max,
            });
        }
        // A zero-length frame would be read back as the terminator.
        if let Some(index) = self.frames.iter().position(Vec::is_empty) {
            return Err(VoicePacketError::EmptyFrame(index));
        }

        let payload_len: usize = self.frames.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(payload_len + self.frames.len() + 24);
        out.push(self.header());
        if let Some(session) = self.session {
            varint::encode_u64(&mut out, u64::from(session));
        }
        varint::encode_u64(&mut out, self.sequence);

        match self.codec {
            VoiceCodec::Opus => self.encode_opus_frame(&mut out)?,
            _ => self.encode_legacy_frames(&mut out)?,
        }

        if let Some(position) = self.positional {
            for axis in position {
                out.extend_from_slice(&axis.to_be_bytes());
            }
        }
        Ok(out)
    }

    fn encode_opus_frame(&self, out: &mut Vec<u8>) -> Result<(), VoicePacketError> {
        let frame: &[u8] = match self.frames.as_slice() {
            [frame] => frame.as_slice(),
            [] if self.terminator => &[],
            frames => return Err(VoicePacketError::OpusFrameCount(frames.len())),
        };
        let mut header = frame.len() as u64;
        if self.terminator {
            header |= OPUS_TERMINATOR;
        }
        varint::encode_u64(out, header);
        out.extend_from_slice(frame);
        Ok(())
    }

    fn encode_legacy_frames(&self, out: &mut Vec<u8>) -> Result<(), VoicePacketError> {
        if self.frames.is_empty() && !self.terminator {
            return Err(VoicePacketError::NoFrames);
        }
        let empty: &[u8] = &[];
        let mut frames: Vec<&[u8]> = self.frames.iter().map(Vec::as_slice).collect();
        if self.terminator {
            frames.push(empty);
        }
        let last = frames.len() - 1;
        for (index, frame) in frames.into_iter().enumerate() {
            let mut header = frame.len() as u8;
            if index < last {
                header |= LEGACY_CONTINUATION;
            }
            out.push(header);
            out.extend_from_slice(frame);
        }
        Ok(())
    }

    /// Parse a packet relayed by the server (carries the sender session).
    pub fn decode_clientbound(bytes: &[u8]) -> Result<Self, VoicePacketError> {
        Self::decode(bytes, true)
    }

    /// Parse a packet as sent by a client (no session field).
    pub fn decode_serverbound(bytes: &[u8]) -> Result<Self, VoicePacketError> {
        Self::decode(bytes, false)
    }

    fn decode(bytes: &[u8], with_session: bool) -> Result<Self, VoicePacketError> {
        let (&header, rest) = bytes.split_first().ok_or(VoicePacketError::Empty)?;
        let codec = VoiceCodec::from_id(header >> 5)?;
        let target = VoiceTarget::from_bits(header);
        let mut reader = PacketReader { buf: rest };

        let session = if with_session {
            let session = reader.varint()?;
            let session = u32::try_from(session)
                .map_err(|_| VoicePacketError::SessionOutOfRange(session))?;
            Some(session)
        } else {
            None
        };
        let sequence = reader.varint()?;

        let mut frames = Vec::new();
        let mut terminator = false;
        match codec {
            VoiceCodec::Opus => {
                let header = reader.varint()?;
                let len = (header & MAX_OPUS_FRAME_LEN as u64) as usize;
                terminator = header & OPUS_TERMINATOR != 0;
                if len > 0 {
                    frames.push(reader.bytes(len)?.to_vec());
                }
            }
            _ => loop {
                let header = reader.byte()?;
                let len = usize::from(header & 0x7F);
                let frame = reader.bytes(len)?;
                let more = header & LEGACY_CONTINUATION != 0;
                if !more && len == 0 {
                    terminator = true;
                } else {
                    frames.push(frame.to_vec());
                }
                if !more {
                    break;
                }
            },
        }

        let positional = reader.positional();
        Ok(Self {
            target,
            codec,
            session,
            sequence,
            frames,
            terminator,
            positional,
        })
    }
}

struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    fn varint(&mut self) -> Result<u64, VoicePacketError> {
        let (value, used) = varint::decode_u64(self.buf)?;
        self.buf = &self.buf[used..];
        Ok(value)
    }

    fn byte(&mut self) -> Result<u8, VoicePacketError> {
        Ok(self.bytes(1)?[0])
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], VoicePacketError> {
        if self.buf.len() < len {
            return Err(VoicePacketError::Truncated {
                needed: len,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn positional(&mut self) -> Option<[f32; 3]> {
        if self.buf.len() < 12 {
            if !self.buf.is_empty() {
                tracing::trace!(trailing = self.buf.len(), "ignoring short positional data");
            }
            return None;
        }
        let mut position = [0f32; 3];
        for axis in position.iter_mut() {
            let raw = self.bytes(4).ok()?;
            *axis = f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        }
        Some(position)
    }
}
