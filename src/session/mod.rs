//! Session lifecycle and stream registry
//!
//! A [`Session`] is the explicit handle the monitor's signaling layer
//! opens once the media parameters are agreed and passes on every call;
//! there is no process-wide state. The registry inside is the only
//! cross-stream structure and sits behind one coarse lock, per the
//! concurrency model: streams themselves are exclusively owned values.

pub mod nat64;
mod stream;

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::buffer::jitter::JitterConfig;
use crate::buffer::reorder::{DEFAULT_GROUP_SIZE, DEFAULT_WINDOW, MAX_REORDER_WAIT_MS};
use crate::codec::{PlcMode, VoiceCodecConfig};
use crate::error::{Error, Result};
use crate::rtp::RtpPacket;
use crate::types::{
    payload_types, FinalStats, MediaFlow, PacketOutcome, PlayoutFrame, Sample, SessionStats,
    StreamId, StreamKey,
};

use stream::Stream;

/// Default cap on concurrent streams per session
pub const DEFAULT_MAX_STREAMS: usize = 32;

/// Default inactivity timeout before a stream is evictable, microseconds
pub const RTP_TIMEOUT_US: u64 = 30_000_000;

/// XOR parity configuration
#[derive(Debug, Clone)]
pub struct FecConfig {
    /// Media packets per parity group
    pub group_size: u16,
    /// Payload type that carries parity packets; `None` disables wire FEC
    pub payload_type: Option<u8>,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
            payload_type: Some(127),
        }
    }
}

/// Parameters supplied at session open
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Concurrent stream cap
    pub max_streams: usize,
    /// Inactivity timeout, microseconds
    pub rtp_timeout_us: u64,
    /// Jitter buffer thresholds
    pub jitter: JitterConfig,
    /// Voice engine parameters (per stream, sample rate follows the
    /// stream's clock)
    pub voice: VoiceCodecConfig,
    /// Concealment mode
    pub plc_mode: PlcMode,
    /// XOR parity settings
    pub fec: FecConfig,
    /// Reorder window size, packets
    pub reorder_window: usize,
    /// Reorder wait bound, milliseconds
    pub reorder_wait_ms: u64,
    /// Clock-rate overrides by payload type (signaling-bound dynamic types)
    pub clock_rates: HashMap<u8, u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            rtp_timeout_us: RTP_TIMEOUT_US,
            jitter: JitterConfig::default(),
            voice: VoiceCodecConfig::default(),
            plc_mode: PlcMode::default(),
            fec: FecConfig::default(),
            reorder_window: DEFAULT_WINDOW,
            reorder_wait_ms: MAX_REORDER_WAIT_MS,
            clock_rates: HashMap::new(),
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<()> {
        self.voice.validate()?;
        if self.max_streams == 0 {
            return Err(Error::invalid_config("max_streams must be at least 1"));
        }
        if self.reorder_window < usize::from(self.fec.group_size) {
            return Err(Error::invalid_config(
                "reorder window smaller than the FEC group",
            ));
        }
        if self.jitter.min_delay_ms > self.jitter.max_delay_ms {
            return Err(Error::invalid_config("jitter delay floor above ceiling"));
        }
        Ok(())
    }

    fn clock_rate_for(&self, pt: u8) -> u32 {
        self.clock_rates
            .get(&pt)
            .copied()
            .unwrap_or_else(|| payload_types::clock_rate(pt))
    }
}

#[derive(Default)]
struct Registry {
    streams: HashMap<StreamKey, Stream>,
    ids: HashMap<StreamId, StreamKey>,
    next_id: u32,
    total_packets: u64,
    invalid_rtp: u64,
}

impl Registry {
    fn stats(&self) -> SessionStats {
        let mut streams: Vec<_> = self.streams.values().map(Stream::stats).collect();
        streams.sort_by_key(|s| s.id);
        SessionStats {
            streams,
            total_packets: self.total_packets,
            invalid_rtp: self.invalid_rtp,
        }
    }
}

/// An open monitoring session
///
/// All methods take `&self`; the registry lock serializes them. Safe to
/// share across threads.
pub struct Session {
    config: SessionConfig,
    registry: Mutex<Registry>,
}

impl Session {
    /// Open a session with the given parameters
    ///
    /// Fails on invalid configuration; nothing is allocated in that case.
    pub fn open(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        info!(
            max_streams = config.max_streams,
            plc = ?config.plc_mode,
            fec_group = config.fec.group_size,
            "session opened"
        );
        Ok(Self {
            config,
            registry: Mutex::new(Registry::default()),
        })
    }

    /// Feed one demultiplexed UDP payload into the pipeline
    ///
    /// Non-blocking; every failure mode is an outcome value, not an error.
    pub fn on_rtp_packet(
        &self,
        arrival_us: u64,
        flow: &MediaFlow,
        payload: &[u8],
    ) -> PacketOutcome {
        let mut reg = self.lock();
        reg.total_packets += 1;

        let pkt = match RtpPacket::parse(payload) {
            Ok(pkt) => pkt,
            Err(e) => {
                reg.invalid_rtp += 1;
                debug!(error = %e, "packet rejected");
                return PacketOutcome::Failed;
            }
        };
        if let Err(e) = pkt.validate_audio() {
            reg.invalid_rtp += 1;
            debug!(error = %e, "packet rejected");
            return PacketOutcome::Failed;
        }

        let key = StreamKey {
            local_addr: nat64::normalize(flow.local.ip()),
            local_port: flow.local.port(),
            remote_addr: nat64::normalize(flow.remote.ip()),
            remote_port: flow.remote.port(),
            ssrc: pkt.ssrc,
            direction: flow.direction,
        };

        if !reg.streams.contains_key(&key) {
            if Some(pkt.payload_type) == self.config.fec.payload_type {
                // Parity with no media stream to attach to
                debug!(ssrc = pkt.ssrc, "parity packet before any media, dropped");
                return PacketOutcome::DroppedStale;
            }
            if reg.streams.len() >= self.config.max_streams
                && !self.evict_one_inactive(&mut reg, arrival_us)
            {
                warn!(
                    ssrc = pkt.ssrc,
                    capacity = self.config.max_streams,
                    "too many streams, flow rejected"
                );
                return PacketOutcome::Failed;
            }
            let id = StreamId(reg.next_id);
            reg.next_id += 1;
            let clock_rate = self.config.clock_rate_for(pkt.payload_type);
            let stream = Stream::new(id, key, pkt.payload_type, clock_rate, &self.config, arrival_us);
            reg.ids.insert(id, key);
            reg.streams.insert(key, stream);
        }

        match reg.streams.get_mut(&key) {
            Some(stream) => stream.on_packet(arrival_us, &pkt),
            None => PacketOutcome::Failed,
        }
    }

    /// Pull the next playout frame for one stream
    ///
    /// `out` must hold at least one frame (`frame_size` samples).
    pub fn next_playout_frame(
        &self,
        id: StreamId,
        now_us: u64,
        out: &mut [Sample],
    ) -> Result<PlayoutFrame> {
        let mut reg = self.lock();
        let key = *reg.ids.get(&id).ok_or(Error::StreamNotFound(id.0))?;
        let stream = reg
            .streams
            .get_mut(&key)
            .ok_or(Error::StreamNotFound(id.0))?;
        if out.len() < stream.frame_size() {
            return Err(Error::invalid_config(format!(
                "output buffer holds {} samples, frame needs {}",
                out.len(),
                stream.frame_size()
            )));
        }
        Ok(stream.playout(now_us, out))
    }

    /// PCM samples per playout frame for one stream
    pub fn frame_size(&self, id: StreamId) -> Result<usize> {
        let reg = self.lock();
        let key = reg.ids.get(&id).ok_or(Error::StreamNotFound(id.0))?;
        reg.streams
            .get(key)
            .map(Stream::frame_size)
            .ok_or(Error::StreamNotFound(id.0))
    }

    /// Copy current counters; callable from any thread
    pub fn snapshot(&self) -> SessionStats {
        self.lock().stats()
    }

    /// Mark streams idle past the timeout as inactive
    pub fn expire_inactive(&self, now_us: u64) {
        let mut reg = self.lock();
        let timeout = self.config.rtp_timeout_us;
        for stream in reg.streams.values_mut() {
            if now_us.saturating_sub(stream.last_arrival_us()) > timeout {
                stream.mark_expired();
            }
        }
    }

    /// Close the session: every stream is torn down and its buffers
    /// released; counters drain into the final snapshot
    pub fn close(self) -> FinalStats {
        let mut reg = self.lock();
        let stats = reg.stats();
        for stream in reg.streams.values_mut() {
            stream.teardown();
        }
        reg.streams.clear();
        reg.ids.clear();
        info!(
            streams = stats.streams.len(),
            packets = stats.total_packets,
            "session closed"
        );
        stats
    }

    fn evict_one_inactive(&self, reg: &mut Registry, now_us: u64) -> bool {
        let timeout = self.config.rtp_timeout_us;
        let victim = reg
            .streams
            .iter()
            .find(|(_, s)| {
                s.is_expired() || now_us.saturating_sub(s.last_arrival_us()) > timeout
            })
            .map(|(k, _)| *k);
        if let Some(key) = victim {
            if let Some(mut stream) = reg.streams.remove(&key) {
                debug!(ssrc = key.ssrc, "inactive stream evicted");
                reg.ids.remove(&stream.id());
                stream.teardown();
                return true;
            }
        }
        false
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use crate::types::Direction;

    fn flow() -> MediaFlow {
        MediaFlow {
            local: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 10_000),
            remote: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)), 20_000),
            direction: Direction::Incoming,
        }
    }

    fn pcmu_packet(seq: u16, ts: u32, ssrc: u32) -> Vec<u8> {
        let mut buf = vec![0x80, 0x00];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(&[0xFFu8; 160]);
        buf
    }

    #[test]
    fn test_open_rejects_bad_config() {
        let config = SessionConfig {
            max_streams: 0,
            ..Default::default()
        };
        assert!(Session::open(config).is_err());

        let config = SessionConfig {
            voice: VoiceCodecConfig::default().with_bitrate(1),
            ..Default::default()
        };
        assert!(Session::open(config).is_err());
    }

    #[test]
    fn test_stream_created_on_first_packet() {
        let session = Session::open(SessionConfig::default()).unwrap();
        let outcome = session.on_rtp_packet(0, &flow(), &pcmu_packet(100, 0, 0xAB));
        assert_eq!(outcome, PacketOutcome::Accepted);

        let stats = session.snapshot();
        assert_eq!(stats.streams.len(), 1);
        assert_eq!(stats.streams[0].ssrc, 0xAB);
        assert_eq!(stats.total_packets, 1);
    }

    #[test]
    fn test_malformed_packet_counted() {
        let session = Session::open(SessionConfig::default()).unwrap();
        let outcome = session.on_rtp_packet(0, &flow(), &[0x80, 0x00, 0x01]);
        assert_eq!(outcome, PacketOutcome::Failed);
        assert_eq!(session.snapshot().invalid_rtp, 1);
    }

    #[test]
    fn test_too_many_streams() {
        let config = SessionConfig {
            max_streams: 2,
            ..Default::default()
        };
        let session = Session::open(config).unwrap();
        for ssrc in 0..2u32 {
            let outcome = session.on_rtp_packet(0, &flow(), &pcmu_packet(1, 0, ssrc));
            assert_eq!(outcome, PacketOutcome::Accepted);
        }
        // Third SSRC while both streams are fresh: rejected
        let outcome = session.on_rtp_packet(1_000, &flow(), &pcmu_packet(1, 0, 99));
        assert_eq!(outcome, PacketOutcome::Failed);
        assert_eq!(session.snapshot().streams.len(), 2);
    }

    #[test]
    fn test_inactive_stream_evicted_for_new_flow() {
        let config = SessionConfig {
            max_streams: 1,
            ..Default::default()
        };
        let session = Session::open(config).unwrap();
        assert_eq!(
            session.on_rtp_packet(0, &flow(), &pcmu_packet(1, 0, 1)),
            PacketOutcome::Accepted
        );
        // 31 s later the old stream has timed out and gives way
        let later = 31_000_000;
        assert_eq!(
            session.on_rtp_packet(later, &flow(), &pcmu_packet(1, 0, 2)),
            PacketOutcome::Accepted
        );
        let stats = session.snapshot();
        assert_eq!(stats.streams.len(), 1);
        assert_eq!(stats.streams[0].ssrc, 2);
    }

    #[test]
    fn test_nat64_forms_share_a_stream() {
        let session = Session::open(SessionConfig::default()).unwrap();
        let v4 = flow();
        let nat64 = MediaFlow {
            remote: SocketAddr::new("64:ff9b::192.0.2.7".parse().unwrap(), 20_000),
            ..v4
        };
        session.on_rtp_packet(0, &v4, &pcmu_packet(1, 0, 7));
        session.on_rtp_packet(20_000, &nat64, &pcmu_packet(2, 160, 7));
        assert_eq!(session.snapshot().streams.len(), 1);
    }

    #[test]
    fn test_close_returns_final_stats() {
        let session = Session::open(SessionConfig::default()).unwrap();
        session.on_rtp_packet(0, &flow(), &pcmu_packet(1, 0, 5));
        let final_stats = session.close();
        assert_eq!(final_stats.streams.len(), 1);
        assert_eq!(final_stats.total_packets, 1);
    }

    #[test]
    fn test_playout_unknown_stream() {
        let session = Session::open(SessionConfig::default()).unwrap();
        let mut out = vec![0i16; 960];
        assert!(session
            .next_playout_frame(StreamId(9), 0, &mut out)
            .is_err());
    }

    #[test]
    fn test_expire_inactive_marks_stream() {
        let session = Session::open(SessionConfig::default()).unwrap();
        session.on_rtp_packet(0, &flow(), &pcmu_packet(1, 0, 5));
        session.expire_inactive(31_000_000);
        assert!(!session.snapshot().streams[0].active);
    }
}
