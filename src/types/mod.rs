//! Core types shared across the receive pipeline

use std::net::{IpAddr, SocketAddr};

pub mod stats;

pub use stats::{FinalStats, SessionStats, StreamStats};

/// Media sample type (raw 16-bit PCM)
pub type Sample = i16;

/// Traffic direction of an RTP flow relative to the monitored endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Traffic from the remote party toward the monitored endpoint
    Incoming,
    /// Traffic from the monitored endpoint toward the remote party
    Outgoing,
}

/// A classified media flow: both UDP endpoints plus direction
///
/// Upstream demultiplexing has already decided which endpoint is local; the
/// core only keys on the tuple. NAT64-embedded addresses are normalized
/// before keying (see [`crate::session::nat64`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFlow {
    /// Local UDP endpoint
    pub local: SocketAddr,
    /// Remote UDP endpoint
    pub remote: SocketAddr,
    /// Classified direction
    pub direction: Direction,
}

/// Registry key for one RTP stream
///
/// One stream exists per unique (local endpoint, remote endpoint, SSRC,
/// direction). Addresses are stored normalized so that a NAT64 form and the
/// embedded IPv4 form of the same host hash and compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub ssrc: u32,
    pub direction: Direction,
}

/// Opaque per-stream identifier assigned at stream creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

/// Outcome of feeding one packet into the receive pipeline
///
/// This is a value, not an error: nothing on the packet path propagates past
/// the packet that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Packet accepted in order and queued for playout
    Accepted,
    /// Packet arrived out of order and is held in the reorder window
    OutOfOrderBuffered,
    /// This arrival completed a FEC group and a lost packet was rebuilt
    Recovered,
    /// Sequence outside the accepted window; dropped
    DroppedStale,
    /// Packet already seen; dropped
    DroppedDuplicate,
    /// Packet could not be processed (malformed, stream failed, or registry full)
    Failed,
}

/// Kind of frame produced by a playout tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Frame decoded from a normally received packet
    Decoded,
    /// Frame reconstructed through forward error correction
    Fec,
    /// Frame synthesized by packet loss concealment
    Plc,
    /// Nothing due yet at this tick
    NotReady,
}

/// Result of one playout tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutFrame {
    /// Number of PCM samples written to the output buffer
    pub samples_written: usize,
    /// How the frame was produced
    pub kind: FrameKind,
}

impl PlayoutFrame {
    /// A tick that produced no audio
    pub fn not_ready() -> Self {
        Self {
            samples_written: 0,
            kind: FrameKind::NotReady,
        }
    }
}

/// Classification of the most recent codec frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Active speech
    Voice,
    /// Discontinuous transmission (no speech encoded)
    Dtx,
    /// Comfort noise synthesized for a DTX interval
    ComfortNoise,
}

/// Standard payload type numbers and the clock rates they imply
pub mod payload_types {
    /// G.711 µ-law
    pub const PCMU: u8 = 0;
    /// G.711 A-law
    pub const PCMA: u8 = 8;
    /// G.722
    pub const G722: u8 = 9;
    /// Comfort noise (RFC 3389)
    pub const CN: u8 = 13;
    /// First dynamic payload type
    pub const DYNAMIC_START: u8 = 96;

    /// RTP clock rate implied by a payload type
    ///
    /// Dynamic types default to the Opus clock; G.722 is mapped at 16 kHz,
    /// matching the monitor's historical handling.
    pub fn clock_rate(pt: u8) -> u32 {
        match pt {
            PCMU | PCMA | CN => 8_000,
            G722 => 16_000,
            _ => 48_000,
        }
    }

    /// Plausibility filter for audio payload types: static audio range or
    /// dynamic range
    pub fn is_audio(pt: u8) -> bool {
        pt <= 34 || (96..=127).contains(&pt)
    }
}
