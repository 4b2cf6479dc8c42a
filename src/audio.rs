//! Audio codec seam.
//!
//! The connection never compresses audio itself; it drives an
//! [`AudioEncoder`] for outbound PCM and hands inbound frames to an
//! [`AudioDecoder`]. The default backend is [`RawCodec`], which ships PCM
//! samples unchanged inside Opus-typed frames. Enabling the `audio` feature
//! adds a libopus backend with the usual 48 kHz mono 20 ms settings.

use std::sync::Arc;

use thiserror::Error;

use crate::voice::VoiceCodec;

/// Errors raised by encoder and decoder implementations.
#[derive(Debug, Error)]
pub enum AudioError {
    /// Input slice did not match the expected frame size.
    #[error("invalid frame size: expected {expected} samples, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },
    /// The backend cannot decode frames of this codec.
    #[error("no decoder for {0:?} frames")]
    UnsupportedCodec(VoiceCodec),
    /// Encoded frame bytes are not a whole number of samples.
    #[error("encoded frame of {0} bytes is not sample aligned")]
    Misaligned(usize),
    #[cfg(feature = "audio")]
    #[error(transparent)]
    Opus(#[from] opus::Error),
}

/// Turns fixed-size PCM frames into compressed frames.
pub trait AudioEncoder: Send {
    /// Codec id stamped on packets produced from this encoder's output.
    fn codec(&self) -> VoiceCodec;

    /// Interleaved samples expected per call to [`AudioEncoder::encode`].
    fn frame_size(&self) -> usize;

    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, AudioError>;

    /// Adjust the target bitrate in bits per second. Backends without a
    /// bitrate notion accept and ignore it.
    fn set_bitrate(&mut self, _bitrate: i32) -> Result<(), AudioError> {
        Ok(())
    }
}

/// Turns compressed frames back into interleaved PCM.
pub trait AudioDecoder: Send {
    fn decode(&mut self, codec: VoiceCodec, frame: &[u8]) -> Result<Vec<i16>, AudioError>;
}

type EncoderFactory = dyn Fn(usize) -> Result<Box<dyn AudioEncoder>, AudioError> + Send + Sync;
type DecoderFactory = dyn Fn() -> Result<Box<dyn AudioDecoder>, AudioError> + Send + Sync;

/// Factories for the codec objects a connection needs.
///
/// One encoder is created per connection; one decoder per inbound stream,
/// since decoders carry per-speaker state.
#[derive(Clone)]
pub struct AudioBackend {
    encoder: Arc<EncoderFactory>,
    decoder: Arc<DecoderFactory>,
}

impl AudioBackend {
    pub fn new<E, D>(encoder: E, decoder: D) -> Self
    where
        E: Fn(usize) -> Result<Box<dyn AudioEncoder>, AudioError> + Send + Sync + 'static,
        D: Fn() -> Result<Box<dyn AudioDecoder>, AudioError> + Send + Sync + 'static,
    {
        Self {
            encoder: Arc::new(encoder),
            decoder: Arc::new(decoder),
        }
    }

    /// Passthrough backend; see [`RawCodec`].
    pub fn raw() -> Self {
        Self::new(
            |frame_size| Ok(Box::new(RawCodec::new(frame_size)) as Box<dyn AudioEncoder>),
            || Ok(Box::new(RawCodec::new(0)) as Box<dyn AudioDecoder>),
        )
    }

    /// libopus backend at 48 kHz.
    #[cfg(feature = "audio")]
    pub fn opus() -> Self {
        Self::new(
            |frame_size| {
                Ok(Box::new(opus_backend::OpusEncoder::new(frame_size)?) as Box<dyn AudioEncoder>)
            },
            || Ok(Box::new(opus_backend::OpusDecoder::new()?) as Box<dyn AudioDecoder>),
        )
    }

    /// Build an encoder for frames of `frame_size` interleaved samples.
    pub fn encoder(&self, frame_size: usize) -> Result<Box<dyn AudioEncoder>, AudioError> {
        (self.encoder)(frame_size)
    }

    pub fn decoder(&self) -> Result<Box<dyn AudioDecoder>, AudioError> {
        (self.decoder)()
    }
}

impl Default for AudioBackend {
    fn default() -> Self {
        #[cfg(feature = "audio")]
        {
            Self::opus()
        }
        #[cfg(not(feature = "audio"))]
        {
            Self::raw()
        }
    }
}

impl std::fmt::Debug for AudioBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBackend").finish_non_exhaustive()
    }
}

/// Passthrough codec carrying little-endian PCM as Opus-typed frames.
///
/// Useful against test servers and for pipelines that compress elsewhere.
#[derive(Debug, Clone, Default)]
pub struct RawCodec {
    frame_size: usize,
}

impl RawCodec {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }
}

impl AudioEncoder for RawCodec {
    fn codec(&self) -> VoiceCodec {
        VoiceCodec::Opus
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, AudioError> {
        if pcm.len() != self.frame_size {
            return Err(AudioError::InvalidFrameSize {
                expected: self.frame_size,
                actual: pcm.len(),
            });
        }
        Ok(pcm_to_bytes(pcm))
    }
}

impl AudioDecoder for RawCodec {
    fn decode(&mut self, _codec: VoiceCodec, frame: &[u8]) -> Result<Vec<i16>, AudioError> {
        bytes_to_pcm(frame)
    }
}

/// Serialize samples as 16-bit little endian.
pub fn pcm_to_bytes(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Parse 16-bit little endian samples.
pub fn bytes_to_pcm(bytes: &[u8]) -> Result<Vec<i16>, AudioError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::Misaligned(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Audio handed to the connection for transmission.
#[derive(Debug, Clone, PartialEq)]
pub enum VoicePayload {
    /// Interleaved PCM; compressed with the connection's encoder.
    Pcm(Vec<i16>),
    /// Frames already compressed by the caller.
    Encoded {
        codec: VoiceCodec,
        frames: Vec<Vec<u8>>,
    },
}

/// Accumulates arbitrary PCM byte chunks into whole encoder frames.
#[derive(Debug, Clone)]
pub struct PcmFramer {
    frame_size: usize,
    gain: f32,
    pending: Vec<u8>,
}

impl PcmFramer {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            gain: 1.0,
            pending: Vec::new(),
        }
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Append s16le bytes and return every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(bytes);
        let frame_bytes = self.frame_size * 2;
        let mut frames = Vec::new();
        if frame_bytes == 0 {
            return frames;
        }
        while self.pending.len() >= frame_bytes {
            let chunk: Vec<u8> = self.pending.drain(..frame_bytes).collect();
            frames.push(self.samples(&chunk));
        }
        frames
    }

    /// Pad and return the trailing partial frame, if any.
    pub fn flush(&mut self) -> Option<Vec<i16>> {
        if self.pending.is_empty() {
            return None;
        }
        // A dangling odd byte cannot form a sample.
        if self.pending.len() % 2 != 0 {
            self.pending.pop();
        }
        let mut chunk = std::mem::take(&mut self.pending);
        chunk.resize(self.frame_size * 2, 0);
        Some(self.samples(&chunk))
    }

    fn samples(&self, chunk: &[u8]) -> Vec<i16> {
        chunk
            .chunks_exact(2)
            .map(|pair| {
                let sample = i16::from_le_bytes([pair[0], pair[1]]);
                if self.gain == 1.0 {
                    sample
                } else {
                    (f32::from(sample) * self.gain).clamp(f32::from(i16::MIN), f32::from(i16::MAX))
                        as i16
                }
            })
            .collect()
    }
}

#[cfg(feature = "audio")]
mod opus_backend {
    use opus::{Application, Bitrate, Channels};

    use super::{AudioDecoder, AudioEncoder, AudioError};
    use crate::voice::VoiceCodec;

    const SAMPLE_RATE: u32 = 48_000;
    const MAX_COMPRESSED_SIZE: usize = 4 * 1024;
    // 120 ms at 48 kHz, the longest Opus frame.
    const MAX_DECODED_SAMPLES: usize = 5760;

    pub struct OpusEncoder {
        inner: opus::Encoder,
        frame_size: usize,
    }

    impl OpusEncoder {
        pub fn new(frame_size: usize) -> Result<Self, AudioError> {
            let mut inner = opus::Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)?;
            inner.set_bitrate(Bitrate::Auto)?;
            Ok(Self { inner, frame_size })
        }
    }

    impl AudioEncoder for OpusEncoder {
        fn codec(&self) -> VoiceCodec {
            VoiceCodec::Opus
        }

        fn frame_size(&self) -> usize {
            self.frame_size
        }

        fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, AudioError> {
            if pcm.len() != self.frame_size {
                return Err(AudioError::InvalidFrameSize {
                    expected: self.frame_size,
                    actual: pcm.len(),
                });
            }
            let mut buffer = vec![0u8; MAX_COMPRESSED_SIZE];
            let written = self.inner.encode(pcm, &mut buffer)?;
            buffer.truncate(written);
            Ok(buffer)
        }

        fn set_bitrate(&mut self, bitrate: i32) -> Result<(), AudioError> {
            self.inner.set_bitrate(Bitrate::Bits(bitrate))?;
            Ok(())
        }
    }

    pub struct OpusDecoder {
        inner: opus::Decoder,
    }

    impl OpusDecoder {
        pub fn new() -> Result<Self, AudioError> {
            Ok(Self {
                inner: opus::Decoder::new(SAMPLE_RATE, Channels::Mono)?,
            })
        }
    }

    impl AudioDecoder for OpusDecoder {
        fn decode(&mut self, codec: VoiceCodec, frame: &[u8]) -> Result<Vec<i16>, AudioError> {
            if codec != VoiceCodec::Opus {
                return Err(AudioError::UnsupportedCodec(codec));
            }
            let mut pcm = vec![0i16; MAX_DECODED_SAMPLES];
            let decoded = self.inner.decode(frame, &mut pcm, false)?;
            pcm.truncate(decoded);
            Ok(pcm)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codec_round_trips_samples() {
        let mut codec = RawCodec::new(4);
        let frame = AudioEncoder::encode(&mut codec, &[1, -1, 300, i16::MIN]).unwrap();
        assert_eq!(frame.len(), 8);
        let decoded = AudioDecoder::decode(&mut codec, VoiceCodec::Opus, &frame).unwrap();
        assert_eq!(decoded, vec![1, -1, 300, i16::MIN]);
    }

    #[test]
    fn raw_encoder_rejects_wrong_frame_size() {
        let mut codec = RawCodec::new(960);
        let err = AudioEncoder::encode(&mut codec, &[0; 10]).unwrap_err();
        assert!(matches!(
            err,
            AudioError::InvalidFrameSize {
                expected: 960,
                actual: 10
            }
        ));
    }

    #[test]
    fn misaligned_bytes_are_rejected() {
        assert!(matches!(bytes_to_pcm(&[1, 2, 3]), Err(AudioError::Misaligned(3))));
    }

    #[test]
    fn framer_splits_across_pushes() {
        let mut framer = PcmFramer::new(2);
        assert!(framer.push(&[1, 0, 2]).is_empty());
        assert_eq!(framer.pending(), 3);

        let frames = framer.push(&[0, 3, 0, 4, 0, 5]);
        assert_eq!(frames, vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(framer.pending(), 1);

        // Trailing odd byte is discarded, frame padded with silence.
        assert_eq!(framer.flush(), Some(vec![0, 0]));
        assert_eq!(framer.flush(), None);
    }

    #[test]
    fn framer_applies_gain_with_clamping() {
        let mut framer = PcmFramer::new(2);
        framer.set_gain(2.0);
        let bytes = pcm_to_bytes(&[100, 30_000]);
        assert_eq!(framer.push(&bytes), vec![vec![200, i16::MAX]]);
    }

    #[test]
    fn default_backend_builds_codecs() {
        let backend = AudioBackend::raw();
        let encoder = backend.encoder(960).unwrap();
        assert_eq!(encoder.frame_size(), 960);
        assert_eq!(encoder.codec(), VoiceCodec::Opus);
        assert!(backend.decoder().is_ok());
    }
}
