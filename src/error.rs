//! Error handling for the media core
//!
//! Control-path errors (session open/close, stream addressing, codec setup)
//! are reported through [`Error`]. Per-packet conditions on the receive path
//! are deliberately *not* errors: the hot path reports them as
//! [`PacketOutcome`](crate::types::PacketOutcome) values and counters so a
//! bad packet can never unwind past the packet that caused it.

use thiserror::Error;

/// Result type alias for media core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Control-path error for session and codec operations
#[derive(Error, Debug)]
pub enum Error {
    /// RTP header malformed or truncated
    #[error("Invalid RTP packet: {reason}")]
    InvalidRtp { reason: String },

    /// Stream registry at capacity
    #[error("Too many streams: session already tracks {capacity}")]
    TooManyStreams { capacity: usize },

    /// Codec initialization or processing failed
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration rejected at session open
    #[error("Invalid configuration: {details}")]
    InvalidConfig { details: String },

    /// Playout requested for a stream id the session does not know
    #[error("Unknown stream id {0}")]
    StreamNotFound(u32),
}

impl Error {
    /// Create a new invalid RTP error
    pub fn invalid_rtp(reason: impl Into<String>) -> Self {
        Self::InvalidRtp {
            reason: reason.into(),
        }
    }

    /// Create a new invalid configuration error
    pub fn invalid_config(details: impl Into<String>) -> Self {
        Self::InvalidConfig {
            details: details.into(),
        }
    }

    /// Check if this error is recoverable at the call site
    ///
    /// Recoverable errors leave the session usable; the caller drops the
    /// offending input and continues. Non-recoverable errors mean the
    /// session (or the stream's codec) cannot make further progress.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidRtp { .. } | Self::TooManyStreams { .. } | Self::StreamNotFound(_) => true,
            Self::Codec(e) => e.is_recoverable(),
            Self::InvalidConfig { .. } => false,
        }
    }
}

/// Error type for codec engine operations
#[derive(Error, Debug)]
pub enum CodecError {
    /// Codec could not be brought up with the given parameters
    #[error("Codec initialization failed: {reason}")]
    InitializationFailed { reason: String },

    /// Sample rate outside the supported set
    #[error("Invalid sample rate: {rate}Hz (supported: {supported:?})")]
    InvalidSampleRate { rate: u32, supported: Vec<u32> },

    /// Channel count outside the supported set
    #[error("Invalid channel count: {channels} (supported: {supported:?})")]
    InvalidChannelCount { channels: u8, supported: Vec<u8> },

    /// Bitrate outside the configured bounds
    #[error("Invalid bitrate: {bitrate}bps (range: {min}-{max})")]
    InvalidBitrate { bitrate: u32, min: u32, max: u32 },

    /// Input frame length does not match the codec frame size
    #[error("Invalid frame size: expected {expected}, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    /// Encoding operation failed
    #[error("Encoding failed: {reason}")]
    EncodingFailed { reason: String },

    /// Decoding operation failed
    #[error("Decoding failed: {reason}")]
    DecodingFailed { reason: String },

    /// Operation attempted while the codec is not in the Ready state
    #[error("Codec not ready: {state}")]
    NotReady { state: &'static str },
}

impl CodecError {
    /// Create a new initialization failed error
    pub fn initialization_failed(reason: impl Into<String>) -> Self {
        Self::InitializationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new decoding failed error
    pub fn decoding_failed(reason: impl Into<String>) -> Self {
        Self::DecodingFailed {
            reason: reason.into(),
        }
    }

    /// Create a new encoding failed error
    pub fn encoding_failed(reason: impl Into<String>) -> Self {
        Self::EncodingFailed {
            reason: reason.into(),
        }
    }

    /// Check if this error leaves the codec usable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Setup errors take the codec to Failed
            Self::InitializationFailed { .. }
            | Self::InvalidSampleRate { .. }
            | Self::InvalidChannelCount { .. }
            | Self::InvalidBitrate { .. }
            | Self::NotReady { .. } => false,

            // Per-frame errors drop the frame and continue
            Self::InvalidFrameSize { .. }
            | Self::EncodingFailed { .. }
            | Self::DecodingFailed { .. } => true,
        }
    }
}
