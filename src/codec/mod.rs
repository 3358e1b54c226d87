//! Codec engines for the receive pipeline
//!
//! Wire payloads are decoded by the codec their payload type selects, then
//! re-encoded through the per-stream voice engine into the playout queue,
//! the same shape the monitor has always used: the engine's FEC, DTX, and
//! bitrate decisions apply uniformly no matter what arrived on the wire.

pub mod g711;
pub mod opus;
pub mod plc;

pub use g711::{G711Codec, G711Variant};
pub use opus::{CodecState, OpusCodec, VoiceCodecConfig};
pub use plc::{ConcealOutcome, Concealer, PlcMode};

use crate::types::payload_types;

/// Wire format implied by a payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// G.711 µ-law
    Pcmu,
    /// G.711 A-law
    Pcma,
    /// Voice-engine framing (dynamic payload types)
    Engine,
}

impl WireFormat {
    /// Select the wire format for a payload type
    pub fn for_payload_type(pt: u8) -> Self {
        match pt {
            payload_types::PCMU => Self::Pcmu,
            payload_types::PCMA => Self::Pcma,
            _ => Self::Engine,
        }
    }
}
