//! # CallMon media core
//!
//! `callmon-media-core` is the real-time RTP receive pipeline of the
//! CallMon VoIP call monitor: it ingests an unordered, lossy stream of
//! RTP packets and produces a smooth, de-jittered audio playout stream
//! together with a typed statistics snapshot.
//!
//! ## Core components
//!
//! - **Session & registry**: explicit session handle, coarse-locked
//!   stream registry keyed by 5-tuple + SSRC + direction, NAT64-aware
//! - **Sequence machine**: RFC 3550 validation with wrap tracking,
//!   probation, loss accounting, and jitter estimation
//! - **Reorder & FEC buffer**: short-window reordering plus XOR parity
//!   groups recovering a single loss per group
//! - **Adaptive jitter buffer**: time-ordered playout queue sized from
//!   smoothed jitter and loss
//! - **Codec & PLC engine**: voice engine with in-band FEC, DTX, and
//!   adaptive bitrate; four concealment modes for unrecoverable loss
//!
//! ## Quick start
//!
//! ```rust
//! use callmon_media_core::{Direction, MediaFlow, Session, SessionConfig};
//! use std::net::SocketAddr;
//!
//! # fn rtp_bytes() -> Vec<u8> { vec![0x80, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 9, 0xFF] }
//! let session = Session::open(SessionConfig::default()).unwrap();
//! let flow = MediaFlow {
//!     local: "10.0.0.1:10000".parse::<SocketAddr>().unwrap(),
//!     remote: "192.0.2.7:20000".parse::<SocketAddr>().unwrap(),
//!     direction: Direction::Incoming,
//! };
//! let _outcome = session.on_rtp_packet(0, &flow, &rtp_bytes());
//! let stats = session.close();
//! assert_eq!(stats.total_packets, 1);
//! ```

pub mod audio;
pub mod buffer;
pub mod codec;
pub mod error;
pub mod quality;
pub mod rtp;
pub mod session;
pub mod types;

// Re-export the session surface
pub use error::{CodecError, Error, Result};
pub use session::{FecConfig, Session, SessionConfig, DEFAULT_MAX_STREAMS, RTP_TIMEOUT_US};
pub use types::{
    Direction, FinalStats, FrameKind, FrameType, MediaFlow, PacketOutcome, PlayoutFrame, Sample,
    SessionStats, StreamId, StreamKey, StreamStats,
};

// Re-export the tuning knobs callers pass through SessionConfig
pub use buffer::jitter::JitterConfig;
pub use codec::{PlcMode, VoiceCodecConfig};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::buffer::jitter::JitterConfig;
    pub use crate::codec::{PlcMode, VoiceCodecConfig};
    pub use crate::error::{Error, Result};
    pub use crate::session::{FecConfig, Session, SessionConfig};
    pub use crate::types::{
        Direction, FrameKind, FrameType, MediaFlow, PacketOutcome, PlayoutFrame, Sample,
        SessionStats, StreamId, StreamStats,
    };
}
