//! Inbound voice routing and outbound voice sequencing.
//!
//! The reader task hands every decoded [`VoicePacket`] to the
//! [`VoiceRouter`]. The router keeps one [`VoiceSession`] per remote speaker,
//! applies the sequence policy and forwards accepted packets to the streams
//! the application opened. Each stream owns a decode task fed by a bounded
//! queue, so a slow consumer loses frames instead of stalling the reader.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::audio::{pcm_to_bytes, AudioBackend, AudioDecoder, AudioEncoder, VoicePayload};
use crate::config::VoiceConfig;
use crate::error::MumbleError;
use crate::voice::{VoiceCodec, VoicePacket, VoiceTarget};

/// Outcome of checking a sequence number against a session's baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceVerdict {
    /// In order; the baseline moved forward.
    Accepted,
    /// Behind the baseline but within the late tolerance; baseline unchanged.
    Late,
    /// Too old or a duplicate; dropped, baseline unchanged.
    Stale,
    /// Discontinuity in either direction; baseline restarted at this packet.
    Reset,
}

impl SequenceVerdict {
    pub fn is_playable(self) -> bool {
        !matches!(self, SequenceVerdict::Stale)
    }
}

#[derive(Debug, Clone)]
pub struct SequenceTracker {
    last: Option<u64>,
    late_tolerance: u64,
    reset_threshold: u64,
}

impl SequenceTracker {
    pub fn new(late_tolerance: u64, reset_threshold: u64) -> Self {
        Self {
            last: None,
            late_tolerance,
            reset_threshold,
        }
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Forget the baseline; the next packet is accepted unconditionally.
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn accept(&mut self, sequence: u64) -> SequenceVerdict {
        let Some(last) = self.last else {
            self.last = Some(sequence);
            return SequenceVerdict::Accepted;
        };
        if sequence > last {
            self.last = Some(sequence);
            if sequence - last > self.reset_threshold {
                return SequenceVerdict::Reset;
            }
            return SequenceVerdict::Accepted;
        }
        // Packets behind the baseline never move it.
        let behind = last - sequence;
        if behind > 0 && behind <= self.late_tolerance {
            SequenceVerdict::Late
        } else {
            SequenceVerdict::Stale
        }
    }
}

/// Decoded audio delivered to a [`VoiceStream`].
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceFrame {
    pub session: u32,
    pub target: VoiceTarget,
    pub sequence: u64,
    /// Interleaved PCM; empty for a bare end-of-transmission marker.
    pub pcm: Vec<i16>,
    pub positional: Option<[f32; 3]>,
    pub end_of_transmission: bool,
}

impl VoiceFrame {
    /// PCM as 16-bit little endian bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        pcm_to_bytes(&self.pcm)
    }
}

/// Receiving half of an inbound voice stream.
///
/// Dropping or closing the stream stops its decode task; once every stream
/// of a session is gone the session itself is discarded.
#[derive(Debug)]
pub struct VoiceStream {
    session: Option<u32>,
    target: VoiceTarget,
    rx: mpsc::Receiver<VoiceFrame>,
}

impl VoiceStream {
    /// Speaker this stream follows; `None` for streams spanning all speakers.
    pub fn session(&self) -> Option<u32> {
        self.session
    }

    pub fn target(&self) -> VoiceTarget {
        self.target
    }

    /// Next decoded frame; `None` once the session or connection is gone.
    pub async fn recv(&mut self) -> Option<VoiceFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<VoiceFrame> {
        self.rx.try_recv().ok()
    }

    pub fn close(mut self) {
        self.rx.close();
    }
}

/// Start/end of a remote transmission, reported once each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceActivity {
    Start { session: u32, target: VoiceTarget },
    End { session: u32, target: VoiceTarget },
}

/// Per remote speaker state.
#[derive(Debug)]
pub struct VoiceSession {
    tracker: SequenceTracker,
    talking: Option<VoiceTarget>,
    sinks: HashMap<VoiceTarget, mpsc::Sender<VoicePacket>>,
}

impl VoiceSession {
    fn new(config: &VoiceConfig) -> Self {
        Self {
            tracker: SequenceTracker::new(config.late_tolerance, config.reset_threshold),
            talking: None,
            sinks: HashMap::new(),
        }
    }

    pub fn is_talking(&self) -> bool {
        self.talking.is_some()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.tracker.last()
    }
}

/// Routes inbound packets to sessions and streams.
#[derive(Debug)]
pub struct VoiceRouter {
    config: VoiceConfig,
    backend: AudioBackend,
    sessions: HashMap<u32, VoiceSession>,
    /// Streams receiving every speaker on a target.
    shared: HashMap<VoiceTarget, mpsc::Sender<VoicePacket>>,
    loopback: Option<mpsc::Sender<VoicePacket>>,
}

impl VoiceRouter {
    pub fn new(config: VoiceConfig, backend: AudioBackend) -> Self {
        Self {
            config,
            backend,
            sessions: HashMap::new(),
            shared: HashMap::new(),
            loopback: None,
        }
    }

    pub fn session(&self, session: u32) -> Option<&VoiceSession> {
        self.sessions.get(&session)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open a stream for one speaker's audio on `target`, creating the
    /// session if needed. Reopening replaces the previous stream.
    pub fn open_stream(&mut self, session: u32, target: VoiceTarget) -> VoiceStream {
        let capacity = self.config.stream_capacity;
        let (tx, stream) = spawn_stream(&self.backend, capacity, Some(session), target);
        self.sessions
            .entry(session)
            .or_insert_with(|| VoiceSession::new(&self.config))
            .sinks
            .insert(target, tx);
        stream
    }

    /// Open a stream receiving every speaker's audio on `target`.
    pub fn open_shared_stream(&mut self, target: VoiceTarget) -> VoiceStream {
        let (tx, stream) = spawn_stream(&self.backend, self.config.stream_capacity, None, target);
        self.shared.insert(target, tx);
        stream
    }

    /// Stream of our own packets echoed by the server.
    pub fn open_loopback(&mut self) -> VoiceStream {
        let (tx, stream) = spawn_stream(
            &self.backend,
            self.config.stream_capacity,
            None,
            VoiceTarget::Loopback,
        );
        self.loopback = Some(tx);
        stream
    }

    /// Route one inbound packet.
    pub fn route(&mut self, packet: VoicePacket) -> Vec<VoiceActivity> {
        if packet.target == VoiceTarget::Loopback {
            if let Some(tx) = &self.loopback {
                if !deliver(tx, packet) {
                    self.loopback = None;
                }
            }
            return Vec::new();
        }
        let Some(session_id) = packet.session else {
            tracing::debug!("voice packet without sender session dropped");
            return Vec::new();
        };

        let config = &self.config;
        let session = self
            .sessions
            .entry(session_id)
            .or_insert_with(|| VoiceSession::new(config));

        let verdict = session.tracker.accept(packet.sequence);
        if !verdict.is_playable() {
            tracing::trace!(
                session = session_id,
                sequence = packet.sequence,
                "stale voice packet dropped"
            );
            return Vec::new();
        }
        if verdict == SequenceVerdict::Reset {
            tracing::debug!(
                session = session_id,
                sequence = packet.sequence,
                "voice sequence discontinuity"
            );
        }

        let mut activity = Vec::new();
        let target = packet.target;
        match session.talking {
            Some(current) if current == target => {}
            Some(current) => {
                activity.push(VoiceActivity::End {
                    session: session_id,
                    target: current,
                });
                activity.push(VoiceActivity::Start {
                    session: session_id,
                    target,
                });
            }
            None => activity.push(VoiceActivity::Start {
                session: session_id,
                target,
            }),
        }
        session.talking = Some(target);

        let terminator = packet.terminator;
        if terminator {
            session.talking = None;
            session.tracker.reset();
            activity.push(VoiceActivity::End {
                session: session_id,
                target,
            });
        }

        if let Entry::Occupied(sink) = session.sinks.entry(target) {
            if !deliver(sink.get(), packet.clone()) {
                sink.remove();
                if session.sinks.is_empty() && session.talking.is_none() {
                    self.sessions.remove(&session_id);
                }
            }
        }
        if let Some(tx) = self.shared.get(&target) {
            if !deliver(tx, packet) {
                self.shared.remove(&target);
            }
        }
        activity
    }

    /// Drop a speaker's session and close its streams.
    pub fn remove_session(&mut self, session: u32) -> Option<VoiceActivity> {
        let removed = self.sessions.remove(&session)?;
        removed
            .talking
            .map(|target| VoiceActivity::End { session, target })
    }

    /// Drop every session and stream.
    pub fn clear(&mut self) -> Vec<VoiceActivity> {
        let sessions: Vec<u32> = self.sessions.keys().copied().collect();
        let activity = sessions
            .into_iter()
            .filter_map(|session| self.remove_session(session))
            .collect();
        self.shared.clear();
        self.loopback = None;
        activity
    }
}

/// Queue a packet for a stream; false once the stream is gone.
fn deliver(tx: &mpsc::Sender<VoicePacket>, packet: VoicePacket) -> bool {
    match tx.try_send(packet) {
        Ok(()) => true,
        Err(TrySendError::Full(packet)) => {
            tracing::debug!(
                session = ?packet.session,
                sequence = packet.sequence,
                "voice stream full, dropping packet"
            );
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

fn spawn_stream(
    backend: &AudioBackend,
    capacity: usize,
    session: Option<u32>,
    target: VoiceTarget,
) -> (mpsc::Sender<VoicePacket>, VoiceStream) {
    let (packet_tx, mut packet_rx) = mpsc::channel::<VoicePacket>(capacity);
    let (frame_tx, frame_rx) = mpsc::channel::<VoiceFrame>(capacity);
    let backend = backend.clone();

    tokio::spawn(async move {
        let mut decoders: HashMap<u32, Box<dyn AudioDecoder>> = HashMap::new();
        loop {
            let packet = tokio::select! {
                packet = packet_rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                _ = frame_tx.closed() => break,
            };
            let speaker = packet.session.unwrap_or_default();
            let decoder = match decoders.entry(speaker) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => match backend.decoder() {
                    Ok(decoder) => entry.insert(decoder),
                    Err(err) => {
                        tracing::warn!(
                            session = speaker,
                            error = %err,
                            "failed to create voice decoder"
                        );
                        continue;
                    }
                },
            };

            let mut pcm = Vec::new();
            for frame in packet.frames.iter().filter(|frame| !frame.is_empty()) {
                match decoder.decode(packet.codec, frame) {
                    Ok(samples) => pcm.extend(samples),
                    Err(err) => {
                        tracing::debug!(
                            session = speaker,
                            error = %err,
                            "dropping undecodable voice frame"
                        )
                    }
                }
            }
            if packet.terminator {
                decoders.remove(&speaker);
            }
            if pcm.is_empty() && !packet.terminator {
                continue;
            }

            let frame = VoiceFrame {
                session: speaker,
                target: packet.target,
                sequence: packet.sequence,
                pcm,
                positional: packet.positional,
                end_of_transmission: packet.terminator,
            };
            if frame_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    let stream = VoiceStream {
        session,
        target,
        rx: frame_rx,
    };
    (packet_tx, stream)
}

/// Outbound sequencing and encoding for the local speaker.
pub struct OutboundVoice {
    encoder: Box<dyn AudioEncoder>,
    sequence: u64,
    positional: Option<[f32; 3]>,
}

impl OutboundVoice {
    pub fn new(encoder: Box<dyn AudioEncoder>) -> Self {
        Self {
            encoder,
            sequence: 0,
            positional: None,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.encoder.frame_size()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_positional(&mut self, position: Option<[f32; 3]>) {
        self.positional = position;
    }

    pub fn set_bitrate(&mut self, bitrate: i32) -> Result<(), MumbleError> {
        self.encoder.set_bitrate(bitrate)?;
        Ok(())
    }

    /// Encode and packetize a payload. PCM shorter than a whole number of
    /// frames is padded with silence.
    pub fn packets(
        &mut self,
        payload: VoicePayload,
        target: VoiceTarget,
    ) -> Result<Vec<VoicePacket>, MumbleError> {
        let (codec, frames) = match payload {
            VoicePayload::Pcm(samples) => {
                let frame_size = self.encoder.frame_size();
                if frame_size == 0 {
                    return Err(MumbleError::InvalidConfig("encoder frame size is zero".into()));
                }
                let mut frames = Vec::with_capacity(samples.len().div_ceil(frame_size));
                for chunk in samples.chunks(frame_size) {
                    let frame = if chunk.len() == frame_size {
                        self.encoder.encode(chunk)?
                    } else {
                        let mut padded = chunk.to_vec();
                        padded.resize(frame_size, 0);
                        self.encoder.encode(&padded)?
                    };
                    frames.push(frame);
                }
                (self.encoder.codec(), frames)
            }
            VoicePayload::Encoded { codec, frames } => (codec, frames),
        };

        let mut packets = Vec::new();
        match codec {
            VoiceCodec::Opus => {
                for frame in frames {
                    packets.push(self.next_packet(target, codec, vec![frame]));
                }
            }
            _ if frames.is_empty() => {}
            _ => packets.push(self.next_packet(target, codec, frames)),
        }
        Ok(packets)
    }

    /// Packet that ends the current transmission.
    pub fn terminator(&mut self, target: VoiceTarget) -> VoicePacket {
        let codec = self.encoder.codec();
        let mut packet = self.next_packet(target, codec, Vec::new());
        packet.terminator = true;
        packet
    }

    fn next_packet(
        &mut self,
        target: VoiceTarget,
        codec: VoiceCodec,
        frames: Vec<Vec<u8>>,
    ) -> VoicePacket {
        let advance = frames.len().max(1) as u64;
        let mut packet = VoicePacket::outbound(target, codec, self.sequence, frames);
        packet.positional = self.positional;
        self.sequence = self.sequence.wrapping_add(advance);
        packet
    }
}

impl std::fmt::Debug for OutboundVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundVoice")
            .field("codec", &self.encoder.codec())
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::RawCodec;
    use std::time::Duration;
    use tokio::time::timeout;

    fn tracker() -> SequenceTracker {
        SequenceTracker::new(5, 100)
    }

    #[test]
    fn in_order_and_late_packets_are_playable() {
        let mut t = tracker();
        assert_eq!(t.accept(10), SequenceVerdict::Accepted);
        assert_eq!(t.accept(11), SequenceVerdict::Accepted);
        assert_eq!(t.accept(8), SequenceVerdict::Late);
        assert_eq!(t.last(), Some(11));
    }

    #[test]
    fn stale_packets_leave_baseline_alone() {
        let mut t = tracker();
        t.accept(50);
        assert_eq!(t.accept(40), SequenceVerdict::Stale);
        assert_eq!(t.accept(50), SequenceVerdict::Stale);
        assert_eq!(t.last(), Some(50));
    }

    #[test]
    fn large_jumps_reset_baseline() {
        let mut t = tracker();
        t.accept(10);
        assert_eq!(t.accept(500), SequenceVerdict::Reset);
        assert_eq!(t.last(), Some(500));
        assert_eq!(t.accept(501), SequenceVerdict::Accepted);
    }

    #[test]
    fn old_packets_leave_the_baseline_alone() {
        let mut t = SequenceTracker::new(10, 500);
        t.accept(1000);
        assert_eq!(t.accept(400), SequenceVerdict::Stale);
        assert_eq!(t.last(), Some(1000));
        assert_eq!(t.accept(0), SequenceVerdict::Stale);
        assert_eq!(t.accept(950), SequenceVerdict::Stale);
        assert_eq!(t.last(), Some(1000));
        assert_eq!(t.accept(1001), SequenceVerdict::Accepted);
    }

    fn router() -> VoiceRouter {
        VoiceRouter::new(
            VoiceConfig {
                late_tolerance: 5,
                reset_threshold: 100,
                ..Default::default()
            },
            AudioBackend::raw(),
        )
    }

    fn inbound(session: u32, target: VoiceTarget, sequence: u64, samples: &[i16]) -> VoicePacket {
        VoicePacket {
            target,
            codec: VoiceCodec::Opus,
            session: Some(session),
            sequence,
            frames: vec![pcm_to_bytes(samples)],
            terminator: false,
            positional: None,
        }
    }

    async fn next(stream: &mut VoiceStream) -> Option<VoiceFrame> {
        timeout(Duration::from_secs(1), stream.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn whisper_audio_only_reaches_whisper_stream() {
        let mut router = router();
        let mut normal = router.open_stream(7, VoiceTarget::Normal);
        let mut whisper = router.open_stream(7, VoiceTarget::Whisper(3));

        router.route(inbound(7, VoiceTarget::Whisper(3), 1, &[42]));
        let frame = next(&mut whisper).await.expect("whisper frame");
        assert_eq!(frame.pcm, vec![42]);
        assert_eq!(frame.target, VoiceTarget::Whisper(3));
        assert!(normal.try_recv().is_none());
    }

    #[tokio::test]
    async fn activity_is_reported_once_per_transmission() {
        let mut router = router();
        let mut stream = router.open_stream(7, VoiceTarget::Normal);

        let start = router.route(inbound(7, VoiceTarget::Normal, 1, &[1]));
        assert_eq!(
            start,
            vec![VoiceActivity::Start {
                session: 7,
                target: VoiceTarget::Normal
            }]
        );
        assert!(router.route(inbound(7, VoiceTarget::Normal, 2, &[2])).is_empty());

        let mut end = inbound(7, VoiceTarget::Normal, 3, &[]);
        end.frames.clear();
        end.terminator = true;
        assert_eq!(
            router.route(end),
            vec![VoiceActivity::End {
                session: 7,
                target: VoiceTarget::Normal
            }]
        );

        assert_eq!(next(&mut stream).await.map(|f| f.pcm), Some(vec![1]));
        assert_eq!(next(&mut stream).await.map(|f| f.pcm), Some(vec![2]));
        let last = next(&mut stream).await.expect("end marker");
        assert!(last.end_of_transmission);
        assert!(last.pcm.is_empty());
    }

    #[tokio::test]
    async fn stale_packets_are_not_delivered() {
        let mut router = router();
        let mut stream = router.open_stream(7, VoiceTarget::Normal);
        router.route(inbound(7, VoiceTarget::Normal, 50, &[1]));
        router.route(inbound(7, VoiceTarget::Normal, 30, &[2]));
        router.route(inbound(7, VoiceTarget::Normal, 51, &[3]));

        assert_eq!(next(&mut stream).await.map(|f| f.pcm), Some(vec![1]));
        assert_eq!(next(&mut stream).await.map(|f| f.pcm), Some(vec![3]));
        assert_eq!(router.session(7).and_then(|s| s.last_sequence()), Some(51));
    }

    #[tokio::test]
    async fn loopback_bypasses_sessions() {
        let mut router = router();
        let mut echo = router.open_loopback();
        let activity = router.route(inbound(1, VoiceTarget::Loopback, 9, &[5]));
        assert!(activity.is_empty());
        assert_eq!(router.session_count(), 0);
        assert_eq!(next(&mut echo).await.map(|f| f.pcm), Some(vec![5]));
    }

    #[tokio::test]
    async fn removing_session_ends_its_streams() {
        let mut router = router();
        let mut stream = router.open_stream(7, VoiceTarget::Normal);
        router.route(inbound(7, VoiceTarget::Normal, 1, &[1]));
        assert_eq!(
            router.remove_session(7),
            Some(VoiceActivity::End {
                session: 7,
                target: VoiceTarget::Normal
            })
        );
        assert_eq!(next(&mut stream).await.map(|f| f.pcm), Some(vec![1]));
        assert_eq!(next(&mut stream).await, None);
    }

    #[tokio::test]
    async fn shared_stream_sees_every_speaker() {
        let mut router = router();
        let mut all = router.open_shared_stream(VoiceTarget::Normal);
        router.route(inbound(7, VoiceTarget::Normal, 1, &[1]));
        router.route(inbound(8, VoiceTarget::Normal, 1, &[2]));
        let sessions: Vec<u32> = vec![
            next(&mut all).await.expect("first").session,
            next(&mut all).await.expect("second").session,
        ];
        assert_eq!(sessions, vec![7, 8]);
    }

    #[test]
    fn outbound_pcm_is_split_into_sequenced_packets() {
        let mut outbound = OutboundVoice::new(Box::new(RawCodec::new(4)));
        let packets = outbound
            .packets(VoicePayload::Pcm(vec![1; 6]), VoiceTarget::Normal)
            .unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].sequence, 0);
        assert_eq!(packets[1].sequence, 1);
        assert_eq!(packets[1].frames[0], pcm_to_bytes(&[1, 1, 0, 0]));

        let end = outbound.terminator(VoiceTarget::Normal);
        assert!(end.terminator);
        assert_eq!(end.sequence, 2);
        assert_eq!(outbound.sequence(), 3);
    }

    #[test]
    fn outbound_legacy_frames_share_a_packet() {
        let mut outbound = OutboundVoice::new(Box::new(RawCodec::new(4)));
        let packets = outbound
            .packets(
                VoicePayload::Encoded {
                    codec: VoiceCodec::Speex,
                    frames: vec![vec![1], vec![2], vec![3]],
                },
                VoiceTarget::Whisper(2),
            )
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].frames.len(), 3);
        assert_eq!(outbound.sequence(), 3);
    }
}
