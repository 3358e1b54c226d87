//! Receive-side buffering: short-window reordering with XOR FEC groups,
//! and the adaptive jitter buffer that feeds playout.

pub mod jitter;
pub mod reorder;

pub use jitter::{EntryPayload, JitterBuffer, JitterConfig, JitterEntry, PopOutcome};
pub use reorder::{InsertOutcome, NextPacket, PacketRecord, ReorderBuffer};
