//! Short-term stream quality metrics
//!
//! Sliding-window loss rate, consecutive-loss run length, mean frame size,
//! and a MOS estimate. The windowed loss rate drives both the stats
//! snapshot and the encoder's adaptive-bitrate loop, so it reacts faster
//! than the cumulative RFC 3550 counters.

/// Packets in the sliding loss window
pub const LOSS_WINDOW_SIZE: usize = 100;

/// Frame-size EWMA weight on the previous mean
const FRAME_SIZE_SMOOTHING: f64 = 0.95;

/// Short-term quality tracker for one stream
#[derive(Debug, Default)]
pub struct QualityTracker {
    /// Smoothed loss rate over the sliding window (0.0–1.0)
    loss_rate: f64,
    /// Length of the current consecutive-loss run
    consecutive_losses: u32,
    /// Longest consecutive-loss run observed
    max_consecutive_losses: u32,
    /// Mean wire frame size, exponentially smoothed
    mean_frame_size: f64,
    received: u64,
    lost: u64,
}

impl QualityTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received media frame of `size` bytes
    pub fn record_received(&mut self, size: usize) {
        self.received += 1;
        self.consecutive_losses = 0;
        if self.mean_frame_size == 0.0 {
            self.mean_frame_size = size as f64;
        } else {
            self.mean_frame_size = FRAME_SIZE_SMOOTHING * self.mean_frame_size
                + (1.0 - FRAME_SIZE_SMOOTHING) * size as f64;
        }
        self.update_loss_rate();
    }

    /// Record `count` packets lost in a row
    pub fn record_lost(&mut self, count: u32) {
        self.lost += u64::from(count);
        self.consecutive_losses += count;
        if self.consecutive_losses > self.max_consecutive_losses {
            self.max_consecutive_losses = self.consecutive_losses;
        }
        self.update_loss_rate();
    }

    fn update_loss_rate(&mut self) {
        let total = self.received + self.lost;
        if total == 0 {
            return;
        }
        let current = self.lost as f64 / total as f64;
        let window = LOSS_WINDOW_SIZE as f64;
        self.loss_rate = (self.loss_rate * (window - 1.0) + current) / window;
    }

    /// Smoothed loss rate (0.0–1.0)
    pub fn loss_rate(&self) -> f64 {
        self.loss_rate
    }

    /// Length of the current loss run
    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    /// Mean wire frame size in bytes
    pub fn mean_frame_size(&self) -> f64 {
        self.mean_frame_size
    }

    /// MOS estimate from loss and jitter, clamped to 1.0–5.0
    pub fn mos_score(&self, jitter_ms: f64) -> f32 {
        let base = 4.5;
        let loss_penalty = self.loss_rate * 100.0 * 0.05;
        let jitter_penalty = (jitter_ms / 10.0) * 0.1;
        (base - loss_penalty - jitter_penalty).clamp(1.0, 5.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_stream_scores_high() {
        let mut q = QualityTracker::new();
        for _ in 0..200 {
            q.record_received(160);
        }
        assert!(q.loss_rate() < 0.001);
        assert!(q.mos_score(0.5) > 4.0);
        assert!((q.mean_frame_size() - 160.0).abs() < 1.0);
    }

    #[test]
    fn test_loss_raises_rate_and_lowers_mos() {
        let mut q = QualityTracker::new();
        for _ in 0..50 {
            q.record_received(160);
        }
        for _ in 0..150 {
            q.record_lost(1);
            q.record_received(160);
        }
        assert!(q.loss_rate() > 0.1);
        assert!(q.mos_score(0.5) < 4.0);
    }

    #[test]
    fn test_consecutive_run_tracking() {
        let mut q = QualityTracker::new();
        q.record_received(160);
        q.record_lost(3);
        assert_eq!(q.consecutive_losses(), 3);
        q.record_received(160);
        assert_eq!(q.consecutive_losses(), 0);
    }

    #[test]
    fn test_mos_clamps() {
        let mut q = QualityTracker::new();
        for _ in 0..500 {
            q.record_lost(5);
        }
        assert!(q.mos_score(500.0) >= 1.0);
        assert!(QualityTracker::new().mos_score(0.0) <= 5.0);
    }
}
