//! Voice codec engine
//!
//! Opus-style VoIP engine the per-stream pipeline re-encodes into and
//! decodes out of. The control surface follows the Opus VoIP contract:
//! mono 20 ms frames, in-band FEC carrying a reduced-rate copy of the
//! previous frame (LBRR), DTX below the voice-activity threshold, and a
//! loss-driven bitrate loop clamped to the configured bounds and applied
//! per encode call.
//!
//! The compressed framing is internal to the monitor: a TOC byte, a
//! companded primary section sized by the current bitrate, and an optional
//! FEC section. The decoder also accepts arbitrary payload bytes (dynamic
//! payload types from the wire) by treating them as a raw primary section.

use rand::Rng;
use tracing::{debug, trace};

use super::g711::{ulaw_compress, ulaw_expand};
use crate::audio::energy_level_db;
use crate::error::CodecError;
use crate::types::{FrameType, Sample};

/// TOC low-nibble signature for engine-framed payloads
const TOC_MAGIC: u8 = 0x05;
/// TOC flag: frame carries voice data
const TOC_VOICE: u8 = 0x80;
/// TOC flag: frame carries an FEC section
const TOC_FEC: u8 = 0x40;

/// Amplitude of synthesized comfort noise
const COMFORT_NOISE_AMPLITUDE: i16 = 30;
/// Fade applied per consecutive internal concealment frame
const INTERNAL_PLC_FADE: f32 = 0.75;
/// Smallest primary section the encoder will emit
const MIN_PRIMARY_BYTES: usize = 8;

/// Voice engine configuration
#[derive(Debug, Clone)]
pub struct VoiceCodecConfig {
    /// Sample rate in Hz (8, 12, 16, 24, or 48 kHz)
    pub sample_rate: u32,
    /// Channel count; the engine is mono
    pub channels: u8,
    /// Encoder complexity (0–10)
    pub complexity: u8,
    /// Initial bitrate in bits per second
    pub bitrate: u32,
    /// Attach a reduced-rate copy of the previous frame to each packet
    pub use_inband_fec: bool,
    /// Suppress encoding of non-voice frames
    pub use_dtx: bool,
    /// Expected loss percentage hint (0–100)
    pub packet_loss_perc: u8,
    /// Lower bitrate bound for adaptation
    pub min_bitrate: u32,
    /// Upper bitrate bound for adaptation
    pub max_bitrate: u32,
    /// Bitrate adjustment per adaptation step
    pub bitrate_step: u32,
    /// Frame energy above this is treated as speech, in dB
    pub speech_threshold_db: f64,
}

impl Default for VoiceCodecConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            complexity: 10,
            bitrate: 64_000,
            use_inband_fec: true,
            use_dtx: true,
            packet_loss_perc: 10,
            min_bitrate: 6_000,
            max_bitrate: 64_000,
            bitrate_step: 1_000,
            speech_threshold_db: -30.0,
        }
    }
}

impl VoiceCodecConfig {
    /// Override the sample rate
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Override the initial bitrate
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Check the configuration against the engine's supported ranges
    pub fn validate(&self) -> Result<(), CodecError> {
        const SUPPORTED_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];
        if !SUPPORTED_RATES.contains(&self.sample_rate) {
            return Err(CodecError::InvalidSampleRate {
                rate: self.sample_rate,
                supported: SUPPORTED_RATES.to_vec(),
            });
        }
        if self.channels != 1 {
            return Err(CodecError::InvalidChannelCount {
                channels: self.channels,
                supported: vec![1],
            });
        }
        if self.complexity > 10 {
            return Err(CodecError::initialization_failed("complexity must be 0-10"));
        }
        if self.min_bitrate > self.max_bitrate
            || self.bitrate < self.min_bitrate
            || self.bitrate > self.max_bitrate
        {
            return Err(CodecError::InvalidBitrate {
                bitrate: self.bitrate,
                min: self.min_bitrate,
                max: self.max_bitrate,
            });
        }
        Ok(())
    }

    /// Samples per 20 ms frame at this configuration
    pub fn frame_size(&self) -> usize {
        (self.sample_rate / 50) as usize
    }
}

/// Codec lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    /// Resources released; no session bound
    Uninitialized,
    /// Configured and processing frames
    Ready,
    /// Setup or processing failed; the owning stream rejects new packets
    Failed,
}

impl CodecState {
    /// Short name for error reporting
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

/// Per-stream voice engine
pub struct OpusCodec {
    config: VoiceCodecConfig,
    state: CodecState,
    frame_size: usize,
    current_bitrate: u32,

    // Encoder side
    prev_frame: Vec<Sample>,
    have_prev: bool,

    // Decoder side
    last_decoded: Vec<Sample>,
    plc_fade: f32,
    last_frame_type: FrameType,
}

impl OpusCodec {
    /// Bring up the engine; on success the state is Ready
    pub fn new(config: VoiceCodecConfig) -> Result<Self, CodecError> {
        config.validate()?;
        let frame_size = config.frame_size();
        debug!(
            sample_rate = config.sample_rate,
            bitrate = config.bitrate,
            fec = config.use_inband_fec,
            dtx = config.use_dtx,
            "voice engine ready"
        );
        Ok(Self {
            current_bitrate: config.bitrate,
            frame_size,
            state: CodecState::Ready,
            prev_frame: Vec::new(),
            have_prev: false,
            last_decoded: Vec::new(),
            plc_fade: 1.0,
            last_frame_type: FrameType::Voice,
            config,
        })
    }

    /// Construct an engine in the Failed state
    ///
    /// Used when per-stream configuration is rejected after session open:
    /// the stream exists so its rejection is observable, but it processes
    /// nothing.
    pub fn failed(config: VoiceCodecConfig) -> Self {
        let frame_size = config.frame_size().max(1);
        Self {
            current_bitrate: config.bitrate,
            frame_size,
            state: CodecState::Failed,
            prev_frame: Vec::new(),
            have_prev: false,
            last_decoded: Vec::new(),
            plc_fade: 1.0,
            last_frame_type: FrameType::Voice,
            config,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> CodecState {
        self.state
    }

    /// Mark the engine failed; the owning stream stops accepting packets
    pub fn mark_failed(&mut self) {
        self.state = CodecState::Failed;
    }

    /// Release all codec buffers and return to Uninitialized
    pub fn close(&mut self) {
        self.prev_frame = Vec::new();
        self.last_decoded = Vec::new();
        self.have_prev = false;
        self.state = CodecState::Uninitialized;
    }

    /// Samples per frame
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Current encoder bitrate in bits per second
    pub fn current_bitrate(&self) -> u32 {
        self.current_bitrate
    }

    /// Classification of the most recent frame through the engine
    pub fn last_frame_type(&self) -> FrameType {
        self.last_frame_type
    }

    /// Set the encoder bitrate explicitly
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CodecError> {
        if bitrate < self.config.min_bitrate || bitrate > self.config.max_bitrate {
            return Err(CodecError::InvalidBitrate {
                bitrate,
                min: self.config.min_bitrate,
                max: self.config.max_bitrate,
            });
        }
        self.current_bitrate = bitrate;
        Ok(())
    }

    /// Loss-driven bitrate step: down above 10 % loss, up below 1 %,
    /// clamped to the configured bounds
    pub fn adapt_bitrate(&mut self, loss_rate: f64) {
        let mut bitrate = self.current_bitrate as i64;
        if loss_rate > 0.10 {
            bitrate -= i64::from(self.config.bitrate_step);
        } else if loss_rate < 0.01 {
            bitrate += i64::from(self.config.bitrate_step);
        }
        let clamped = bitrate
            .max(i64::from(self.config.min_bitrate))
            .min(i64::from(self.config.max_bitrate)) as u32;
        if clamped != self.current_bitrate {
            trace!(from = self.current_bitrate, to = clamped, "bitrate adapted");
            self.current_bitrate = clamped;
        }
    }

    /// Encode one PCM frame
    ///
    /// Non-voice frames collapse to a one-byte DTX marker when DTX is
    /// enabled; voice frames carry a bitrate-sized primary section and,
    /// with FEC enabled, a quarter-rate copy of the previous frame.
    pub fn encode(&mut self, pcm: &[Sample]) -> Result<Vec<u8>, CodecError> {
        if self.state != CodecState::Ready {
            return Err(CodecError::NotReady {
                state: self.state.name(),
            });
        }
        if pcm.len() != self.frame_size {
            return Err(CodecError::InvalidFrameSize {
                expected: self.frame_size,
                actual: pcm.len(),
            });
        }

        let voice = energy_level_db(pcm) > self.config.speech_threshold_db;
        if self.config.use_dtx && !voice {
            self.remember_frame(pcm);
            self.last_frame_type = FrameType::Dtx;
            return Ok(vec![TOC_MAGIC]);
        }

        // 20 ms worth of the current bitrate, header bytes excluded
        let budget = (self.current_bitrate / 400) as usize;
        let primary_len = budget.saturating_sub(3).max(MIN_PRIMARY_BYTES);
        let primary = compress_resampled(pcm, primary_len);

        let mut frame = Vec::with_capacity(primary_len + 64);
        let mut toc = TOC_MAGIC | TOC_VOICE;
        let fec = if self.config.use_inband_fec && self.have_prev {
            toc |= TOC_FEC;
            let fec_len = (primary_len / 4).max(MIN_PRIMARY_BYTES);
            Some(compress_resampled(&self.prev_frame, fec_len))
        } else {
            None
        };

        frame.push(toc);
        frame.extend_from_slice(&(primary.len() as u16).to_be_bytes());
        frame.extend_from_slice(&primary);
        if let Some(fec) = fec {
            frame.extend_from_slice(&(fec.len() as u16).to_be_bytes());
            frame.extend_from_slice(&fec);
        }

        self.remember_frame(pcm);
        self.last_frame_type = FrameType::Voice;
        Ok(frame)
    }

    /// Decode one frame to PCM
    ///
    /// An empty payload invokes the engine's internal concealment. Payloads
    /// without the engine TOC signature are treated as a raw primary
    /// section so dynamic wire payloads still produce audio.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Sample>, CodecError> {
        if self.state != CodecState::Ready {
            return Err(CodecError::NotReady {
                state: self.state.name(),
            });
        }
        if data.is_empty() {
            return Ok(self.decode_plc());
        }

        let pcm = match parse_frame(data) {
            Some(ParsedFrame::Dtx) => {
                self.last_frame_type = FrameType::ComfortNoise;
                let mut rng = rand::thread_rng();
                (0..self.frame_size)
                    .map(|_| rng.gen_range(-COMFORT_NOISE_AMPLITUDE..=COMFORT_NOISE_AMPLITUDE))
                    .collect()
            }
            Some(ParsedFrame::Voice { primary, .. }) => {
                self.last_frame_type = FrameType::Voice;
                expand_resampled(primary, self.frame_size)
            }
            None => {
                self.last_frame_type = FrameType::Voice;
                expand_resampled(data, self.frame_size)
            }
        };

        self.last_decoded = pcm.clone();
        self.plc_fade = 1.0;
        Ok(pcm)
    }

    /// Decode the FEC section of a frame as the *previous* frame
    ///
    /// Returns `None` when the frame carries no FEC section.
    pub fn decode_fec(&mut self, data: &[u8]) -> Result<Option<Vec<Sample>>, CodecError> {
        if self.state != CodecState::Ready {
            return Err(CodecError::NotReady {
                state: self.state.name(),
            });
        }
        match parse_frame(data) {
            Some(ParsedFrame::Voice { fec: Some(fec), .. }) => {
                trace!(fec_bytes = fec.len(), "in-band FEC decode");
                Ok(Some(expand_resampled(fec, self.frame_size)))
            }
            _ => Ok(None),
        }
    }

    /// Internal concealment: repeat the last decoded frame with a
    /// progressive fade, silence once history runs out
    pub fn decode_plc(&mut self) -> Vec<Sample> {
        if self.last_decoded.is_empty() {
            return vec![0; self.frame_size];
        }
        let fade = self.plc_fade;
        self.plc_fade *= INTERNAL_PLC_FADE;
        self.last_decoded
            .iter()
            .map(|&s| (f32::from(s) * fade) as Sample)
            .collect()
    }

    fn remember_frame(&mut self, pcm: &[Sample]) {
        self.prev_frame.clear();
        self.prev_frame.extend_from_slice(pcm);
        self.have_prev = true;
    }
}

enum ParsedFrame<'a> {
    Dtx,
    Voice {
        primary: &'a [u8],
        fec: Option<&'a [u8]>,
    },
}

/// Parse engine framing; `None` means the payload is not engine-framed
fn parse_frame(data: &[u8]) -> Option<ParsedFrame<'_>> {
    let toc = *data.first()?;
    if toc & 0x0F != TOC_MAGIC {
        return None;
    }
    if toc & TOC_VOICE == 0 {
        return Some(ParsedFrame::Dtx);
    }
    if data.len() < 3 {
        return None;
    }
    let primary_len = u16::from_be_bytes([data[1], data[2]]) as usize;
    let primary_end = 3 + primary_len;
    if data.len() < primary_end {
        return None;
    }
    let primary = &data[3..primary_end];

    let fec = if toc & TOC_FEC != 0 {
        if data.len() < primary_end + 2 {
            return None;
        }
        let fec_len = u16::from_be_bytes([data[primary_end], data[primary_end + 1]]) as usize;
        let fec_end = primary_end + 2 + fec_len;
        if data.len() < fec_end {
            return None;
        }
        Some(&data[primary_end + 2..fec_end])
    } else {
        None
    };

    Some(ParsedFrame::Voice { primary, fec })
}

/// Compand a frame down to `target` bytes by point sampling
fn compress_resampled(pcm: &[Sample], target: usize) -> Vec<u8> {
    let target = target.max(1);
    (0..target)
        .map(|i| ulaw_compress(pcm[i * pcm.len() / target]))
        .collect()
}

/// Expand a companded section back to `out_len` samples
fn expand_resampled(data: &[u8], out_len: usize) -> Vec<Sample> {
    if data.is_empty() {
        return vec![0; out_len];
    }
    (0..out_len)
        .map(|i| ulaw_expand(data[i * data.len() / out_len]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice_frame(frame_size: usize) -> Vec<Sample> {
        (0..frame_size)
            .map(|i| ((i as f32 * 0.08).sin() * 12_000.0) as Sample)
            .collect()
    }

    fn engine() -> OpusCodec {
        OpusCodec::new(VoiceCodecConfig::default()).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(VoiceCodecConfig::default().validate().is_ok());

        let bad_rate = VoiceCodecConfig::default().with_sample_rate(44_100);
        assert!(bad_rate.validate().is_err());

        let bad_bitrate = VoiceCodecConfig::default().with_bitrate(1_000);
        assert!(bad_bitrate.validate().is_err());

        let stereo = VoiceCodecConfig {
            channels: 2,
            ..Default::default()
        };
        assert!(stereo.validate().is_err());
    }

    #[test]
    fn test_state_machine() {
        let mut codec = engine();
        assert_eq!(codec.state(), CodecState::Ready);

        codec.close();
        assert_eq!(codec.state(), CodecState::Uninitialized);
        assert!(codec.encode(&voice_frame(960)).is_err());

        let mut codec = engine();
        codec.mark_failed();
        assert!(codec.decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut codec = engine();
        let pcm = voice_frame(codec.frame_size());
        let frame = codec.encode(&pcm).unwrap();
        assert!(frame.len() > 3);
        assert_eq!(codec.last_frame_type(), FrameType::Voice);

        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.len(), codec.frame_size());
        // Companded, decimated audio keeps the coarse envelope
        let orig_peak = pcm.iter().map(|&s| i32::from(s).abs()).max().unwrap();
        let dec_peak = decoded.iter().map(|&s| i32::from(s).abs()).max().unwrap();
        assert!(dec_peak > orig_peak / 4);
    }

    #[test]
    fn test_dtx_on_silence() {
        let mut codec = engine();
        let silence = vec![0i16; codec.frame_size()];
        let frame = codec.encode(&silence).unwrap();
        assert_eq!(frame.len(), 1);
        assert_eq!(codec.last_frame_type(), FrameType::Dtx);

        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.len(), codec.frame_size());
        assert_eq!(codec.last_frame_type(), FrameType::ComfortNoise);
        assert!(decoded.iter().all(|&s| s.abs() <= COMFORT_NOISE_AMPLITUDE));
    }

    #[test]
    fn test_dtx_disabled_encodes_silence_as_voice() {
        let config = VoiceCodecConfig {
            use_dtx: false,
            ..Default::default()
        };
        let mut codec = OpusCodec::new(config).unwrap();
        let frame = codec.encode(&vec![0i16; codec.frame_size()]).unwrap();
        assert!(frame.len() > 1);
        assert_eq!(codec.last_frame_type(), FrameType::Voice);
    }

    #[test]
    fn test_inband_fec_recovers_previous_frame() {
        let mut codec = engine();
        let first = voice_frame(codec.frame_size());
        let second: Vec<Sample> = voice_frame(codec.frame_size())
            .iter()
            .map(|&s| s / 2)
            .collect();

        let _ = codec.encode(&first).unwrap();
        let frame2 = codec.encode(&second).unwrap();

        let fec = codec.decode_fec(&frame2).unwrap();
        let fec = fec.expect("second frame must carry FEC of the first");
        assert_eq!(fec.len(), codec.frame_size());
        // The FEC copy approximates the first frame's envelope
        let first_peak = first.iter().map(|&s| i32::from(s).abs()).max().unwrap();
        let fec_peak = fec.iter().map(|&s| i32::from(s).abs()).max().unwrap();
        assert!(fec_peak > first_peak / 4);
    }

    #[test]
    fn test_first_frame_has_no_fec() {
        let mut codec = engine();
        let frame = codec.encode(&voice_frame(codec.frame_size())).unwrap();
        assert!(codec.decode_fec(&frame).unwrap().is_none());
    }

    #[test]
    fn test_bitrate_adaptation_clamps() {
        let mut codec = engine();
        // Heavy loss walks the bitrate down to the floor, one step per call
        for _ in 0..100 {
            codec.adapt_bitrate(0.5);
        }
        assert_eq!(codec.current_bitrate(), 6_000);

        // Clean network walks it back to the ceiling
        for _ in 0..100 {
            codec.adapt_bitrate(0.0);
        }
        assert_eq!(codec.current_bitrate(), 64_000);

        // Mid-range loss holds steady
        let held = codec.current_bitrate();
        codec.adapt_bitrate(0.05);
        assert_eq!(codec.current_bitrate(), held);
    }

    #[test]
    fn test_bitrate_changes_frame_size() {
        let mut codec = engine();
        let pcm = voice_frame(codec.frame_size());

        codec.set_bitrate(64_000).unwrap();
        let big = codec.encode(&pcm).unwrap();
        codec.set_bitrate(6_000).unwrap();
        let small = codec.encode(&pcm).unwrap();
        assert!(small.len() < big.len());

        assert!(codec.set_bitrate(500).is_err());
    }

    #[test]
    fn test_internal_plc_fades_out() {
        let mut codec = engine();
        let pcm = voice_frame(codec.frame_size());
        let frame = codec.encode(&pcm).unwrap();
        codec.decode(&frame).unwrap();

        let first = codec.decode_plc();
        let second = codec.decode_plc();
        let peak = |f: &[Sample]| f.iter().map(|&s| i32::from(s).abs()).max().unwrap();
        assert!(peak(&second) < peak(&first));
        assert_eq!(first.len(), codec.frame_size());
    }

    #[test]
    fn test_raw_payload_decodes() {
        let mut codec = engine();
        // Arbitrary wire bytes without engine framing still produce a frame
        let decoded = codec.decode(&[0x11, 0x22, 0x33, 0x44]).unwrap();
        assert_eq!(decoded.len(), codec.frame_size());
    }

    #[test]
    fn test_empty_payload_conceals() {
        let mut codec = engine();
        let out = codec.decode(&[]).unwrap();
        assert_eq!(out.len(), codec.frame_size());
        assert!(out.iter().all(|&s| s == 0));
    }
}
