//! Statistics snapshot types for downstream renderers
//!
//! Field names are stable: the terminal renderer and trace tooling address
//! them by name.

use super::{Direction, FrameType, StreamId};

/// Per-stream statistics snapshot
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// Stream identifier assigned at creation
    pub id: StreamId,
    /// RTP synchronization source
    pub ssrc: u32,
    /// Negotiated payload type
    pub payload_type: u8,
    /// Flow direction
    pub direction: Direction,
    /// Stream still receiving (false once the inactivity timeout passed)
    pub active: bool,

    /// Total packets accepted, including probation
    pub packets_received: u64,
    /// Cumulative expected − received, per RFC 3550 accounting
    pub packets_lost: u64,
    /// Packets that arrived behind the highest sequence
    pub out_of_order: u64,
    /// Packets already seen and dropped
    pub duplicates: u64,
    /// Packets rebuilt from XOR parity
    pub recovered_by_fec: u64,
    /// Total audio synthesized by concealment, in milliseconds
    pub concealed_ms: u64,

    /// RFC 3550 interarrival jitter, in milliseconds
    pub current_jitter_ms: f64,
    /// Largest jitter observed, in milliseconds
    pub max_jitter_ms: f64,
    /// Current playout buffer depth, in milliseconds
    pub buffer_size_ms: u32,
    /// Playout buffer target, in milliseconds
    pub buffer_target_ms: u32,
    /// Short-term packet loss rate (0.0–1.0) over the sliding window
    pub packet_loss_rate: f64,
    /// Current encoder bitrate, in bits per second
    pub current_bitrate_bps: u32,

    /// Concealment has been used on this stream
    pub plc_used: bool,
    /// Forward error correction has been used on this stream
    pub fec_used: bool,
    /// Classification of the most recent frame
    pub last_frame_type: FrameType,

    /// Timestamps rewritten by the sanity check
    pub corrected_timestamps: u64,
    /// Interarrival spikes above the 10 ms threshold
    pub jitter_spikes: u64,
    /// Estimated mean opinion score (1.0–5.0)
    pub mos_score: f32,
}

/// Session-wide statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Per-stream snapshots, in stream-id order
    pub streams: Vec<StreamStats>,
    /// Total packets handed to the session, valid or not
    pub total_packets: u64,
    /// Packets rejected by RTP header validation
    pub invalid_rtp: u64,
}

impl SessionStats {
    /// Look up the snapshot for one stream
    pub fn stream(&self, id: StreamId) -> Option<&StreamStats> {
        self.streams.iter().find(|s| s.id == id)
    }
}

/// Final statistics delivered by session close
///
/// Same shape as a live snapshot; produced once, after which every
/// per-stream buffer has been released.
pub type FinalStats = SessionStats;
