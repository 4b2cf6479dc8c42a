//! Ping scheduling and liveness tracking for the control channel.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::KeepaliveConfig;
use crate::proto::mumble::Ping;

/// Tracks when the server was last heard from and builds outgoing pings.
///
/// Timestamps in pings are milliseconds since the tracker was created; the
/// server echoes them back unchanged, which yields the round-trip time.
#[derive(Debug, Clone)]
pub struct Keepalive {
    config: KeepaliveConfig,
    epoch: Instant,
    last_seen: Instant,
    last_rtt: Option<Duration>,
    average_rtt: Option<f32>,
    samples: u32,
    tcp_packets: u32,
}

impl Keepalive {
    pub fn new(config: KeepaliveConfig, now: Instant) -> Self {
        Self {
            config,
            epoch: now,
            last_seen: now,
            last_rtt: None,
            average_rtt: None,
            samples: 0,
            tcp_packets: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Instant after which the connection counts as dead.
    pub fn deadline(&self) -> Instant {
        self.last_seen + self.config.timeout()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Count a control frame received from the server.
    pub fn count_packet(&mut self) {
        self.tcp_packets = self.tcp_packets.wrapping_add(1);
    }

    pub fn build_ping(&mut self, now: Instant) -> Ping {
        Ping {
            timestamp: Some(now.duration_since(self.epoch).as_millis() as u64),
            tcp_packets: Some(self.tcp_packets),
            tcp_ping_avg: self.average_rtt,
            ..Default::default()
        }
    }

    /// Record an inbound ping; returns the round-trip sample if the echoed
    /// timestamp is one of ours.
    pub fn on_ping(&mut self, ping: &Ping, now: Instant) -> Option<Duration> {
        self.last_seen = now;
        let sent = Duration::from_millis(ping.timestamp?);
        let elapsed = now.duration_since(self.epoch);
        if sent > elapsed {
            return None;
        }
        let rtt = elapsed - sent;
        let ms = rtt.as_secs_f32() * 1000.0;
        self.samples = self.samples.saturating_add(1);
        self.average_rtt = Some(match self.average_rtt {
            None => ms,
            Some(avg) => avg + (ms - avg) / self.samples as f32,
        });
        self.last_rtt = Some(rtt);
        Some(rtt)
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Mean round-trip time in milliseconds.
    pub fn average_rtt_ms(&self) -> Option<f32> {
        self.average_rtt
    }
}
