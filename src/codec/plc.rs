//! Packet loss concealment
//!
//! Synthesizes a replacement frame when a packet can be neither recovered
//! nor decoded. Four modes, selected per session; all of them work from a
//! rolling window of the most recent good PCM (up to 60 ms at 16 kHz).

use rand::Rng;
use tracing::trace;

use crate::audio::peak_amplitude;
use crate::types::Sample;

/// Maximum concealment history, in samples
pub const MAX_PREV_SAMPLES: usize = 960;

/// Leading window the pattern search correlates against, in samples
pub const ANALYSIS_WINDOW_SIZE: usize = 160;

/// Fade-out applied at the tail of a concealment frame, in milliseconds
pub const MAX_FADE_LENGTH_MS: u32 = 20;

/// Default comfort-noise amplitude (linear, out of 32768)
const DEFAULT_COMFORT_NOISE_LEVEL: i16 = 30;

/// Concealment strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlcMode {
    /// Zero-filled frame
    Silence,
    /// Repeat the last good frame with a tail fade
    Repeat,
    /// Waveform substitution by cross-correlation, with comfort noise
    Pattern,
    /// Pattern substitution plus psychoacoustic noise masking
    #[default]
    Advanced,
}

/// What the concealer produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcealOutcome {
    /// The output buffer holds a synthesized frame
    Concealed,
    /// No usable history; the caller should fall back to the codec's
    /// internal concealment
    NeedCodecPlc,
}

/// Per-stream concealment engine
pub struct Concealer {
    mode: PlcMode,
    sample_rate: u32,
    history: Vec<Sample>,
    comfort_noise_level: i16,
}

impl Concealer {
    /// Create a concealer for a stream at the given sample rate
    pub fn new(mode: PlcMode, sample_rate: u32) -> Self {
        Self {
            mode,
            sample_rate,
            history: Vec::with_capacity(MAX_PREV_SAMPLES),
            comfort_noise_level: DEFAULT_COMFORT_NOISE_LEVEL,
        }
    }

    /// Active mode
    pub fn mode(&self) -> PlcMode {
        self.mode
    }

    /// Feed one good frame into the history window
    pub fn record_frame(&mut self, pcm: &[Sample]) {
        self.history.extend_from_slice(pcm);
        if self.history.len() > MAX_PREV_SAMPLES {
            let excess = self.history.len() - MAX_PREV_SAMPLES;
            self.history.drain(..excess);
        }
    }

    /// Drop all history (stream reset)
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Synthesize one concealment frame into `out`
    pub fn conceal(&mut self, out: &mut [Sample]) -> ConcealOutcome {
        trace!(mode = ?self.mode, samples = out.len(), "concealing frame");
        match self.mode {
            PlcMode::Silence => {
                out.fill(0);
                ConcealOutcome::Concealed
            }
            PlcMode::Repeat => {
                self.conceal_repeat(out);
                ConcealOutcome::Concealed
            }
            PlcMode::Pattern => {
                if self.history.len() <= ANALYSIS_WINDOW_SIZE {
                    self.conceal_repeat(out);
                } else {
                    self.conceal_pattern(out, false);
                }
                ConcealOutcome::Concealed
            }
            PlcMode::Advanced => {
                if self.history.is_empty() {
                    return ConcealOutcome::NeedCodecPlc;
                }
                if self.history.len() <= ANALYSIS_WINDOW_SIZE {
                    self.conceal_repeat(out);
                } else {
                    self.conceal_pattern(out, true);
                }
                ConcealOutcome::Concealed
            }
        }
    }

    /// Repeat the tail of the history with a linear fade-out
    fn conceal_repeat(&self, out: &mut [Sample]) {
        if self.history.is_empty() {
            out.fill(0);
            return;
        }
        let start = self.history.len().saturating_sub(out.len());
        let tail = &self.history[start..];
        let fade_samples = self.fade_samples(out.len());
        let out_len = out.len();

        for (i, slot) in out.iter_mut().enumerate() {
            let sample = tail.get(i).copied().unwrap_or(0);
            *slot = (f32::from(sample) * self.fade_at(i, out_len, fade_samples)) as Sample;
        }
    }

    /// Waveform substitution: copy from the best-correlated history offset
    fn conceal_pattern(&self, out: &mut [Sample], psychoacoustic: bool) {
        let history = &self.history;
        let len = history.len();

        // Best offset by maximum inner product against the leading window
        let mut best_offset = 0usize;
        let mut best_correlation = i64::MIN;
        for offset in 0..len - ANALYSIS_WINDOW_SIZE {
            let mut correlation = 0i64;
            for i in 0..ANALYSIS_WINDOW_SIZE {
                correlation += i64::from(history[offset + i]) * i64::from(history[i]);
            }
            if correlation > best_correlation {
                best_correlation = correlation;
                best_offset = offset;
            }
        }

        let fade_samples = self.fade_samples(out.len());
        let noise_level = f32::from(self.comfort_noise_level) / 32768.0;
        let global_energy = history
            .iter()
            .map(|&s| f32::from(s).abs() / 32768.0)
            .sum::<f32>()
            / len as f32;
        let history_peak = peak_amplitude(history);
        let mut rng = rand::thread_rng();
        let out_len = out.len();

        for (i, slot) in out.iter_mut().enumerate() {
            let pattern_sample = history[(best_offset + i) % len];
            let fade = self.fade_at(i, out_len, fade_samples);

            let local_energy = if psychoacoustic {
                // Mask noise by the energy around this position
                let window_start = i.saturating_sub(ANALYSIS_WINDOW_SIZE / 2);
                let window_end = (i + ANALYSIS_WINDOW_SIZE / 2).min(len);
                let span = &history[window_start..window_end.max(window_start + 1)];
                span.iter().map(|&s| f32::from(s).abs() / 32768.0).sum::<f32>() / span.len() as f32
            } else {
                global_energy
            };

            let noise = rng.gen_range(-1.0f32..1.0) * noise_level * (1.0 - local_energy) * fade;
            let mut value = (f32::from(pattern_sample) * fade + noise * 32768.0) as i32;
            if psychoacoustic {
                value = value.clamp(-history_peak, history_peak);
            }
            *slot = value.clamp(i32::from(Sample::MIN), i32::from(Sample::MAX)) as Sample;
        }
    }

    fn fade_samples(&self, out_len: usize) -> usize {
        ((MAX_FADE_LENGTH_MS * self.sample_rate / 1_000) as usize).min(out_len)
    }

    fn fade_at(&self, i: usize, out_len: usize, fade_samples: usize) -> f32 {
        if fade_samples == 0 || i < out_len - fade_samples {
            1.0
        } else {
            (out_len - i) as f32 / fade_samples as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::peak_amplitude;

    const FRAME: usize = 160;

    fn speech_like(len: usize) -> Vec<Sample> {
        (0..len)
            .map(|i| ((i as f32 * 0.19).sin() * 9_000.0 + (i as f32 * 0.013).sin() * 2_000.0) as Sample)
            .collect()
    }

    fn filled(mode: PlcMode) -> Concealer {
        let mut c = Concealer::new(mode, 8_000);
        c.record_frame(&speech_like(MAX_PREV_SAMPLES));
        c
    }

    #[test]
    fn test_silence_mode() {
        let mut c = filled(PlcMode::Silence);
        let mut out = vec![99i16; FRAME];
        assert_eq!(c.conceal(&mut out), ConcealOutcome::Concealed);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_repeat_mode_fades() {
        let mut c = filled(PlcMode::Repeat);
        let mut out = vec![0i16; FRAME];
        assert_eq!(c.conceal(&mut out), ConcealOutcome::Concealed);
        // At 8 kHz the 20 ms fade spans the whole frame; the last samples
        // must be quieter than the first ones
        let head: i32 = out[..8].iter().map(|&s| i32::from(s).abs()).sum();
        let tail: i32 = out[FRAME - 8..].iter().map(|&s| i32::from(s).abs()).sum();
        assert!(tail < head, "tail {tail} not faded below head {head}");
    }

    #[test]
    fn test_pattern_mode_produces_audio() {
        let mut c = filled(PlcMode::Pattern);
        let mut out = vec![0i16; FRAME];
        assert_eq!(c.conceal(&mut out), ConcealOutcome::Concealed);
        assert!(out.iter().any(|&s| s != 0));
    }

    #[test]
    fn test_advanced_without_history_defers_to_codec() {
        let mut c = Concealer::new(PlcMode::Advanced, 8_000);
        let mut out = vec![0i16; FRAME];
        assert_eq!(c.conceal(&mut out), ConcealOutcome::NeedCodecPlc);
    }

    #[test]
    fn test_advanced_peak_bounded_by_history() {
        let mut c = filled(PlcMode::Advanced);
        let history_peak = peak_amplitude(&speech_like(MAX_PREV_SAMPLES));
        for _ in 0..8 {
            let mut out = vec![0i16; FRAME];
            assert_eq!(c.conceal(&mut out), ConcealOutcome::Concealed);
            assert_eq!(out.len(), FRAME);
            assert!(peak_amplitude(&out) <= history_peak);
        }
    }

    #[test]
    fn test_history_window_is_bounded() {
        let mut c = Concealer::new(PlcMode::Advanced, 8_000);
        for _ in 0..20 {
            c.record_frame(&speech_like(FRAME));
        }
        let mut out = vec![0i16; FRAME];
        assert_eq!(c.conceal(&mut out), ConcealOutcome::Concealed);
        // Window stays capped at MAX_PREV_SAMPLES
        assert!(c.history.len() <= MAX_PREV_SAMPLES);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut c = filled(PlcMode::Advanced);
        c.reset();
        let mut out = vec![0i16; FRAME];
        assert_eq!(c.conceal(&mut out), ConcealOutcome::NeedCodecPlc);
    }
}
