//! Adaptive jitter buffer
//!
//! Bounded, time-ordered playout queue. Every entry carries a scheduled
//! playout time computed from its arrival and the current adaptive delay;
//! the delay tracks smoothed jitter between a configured floor and
//! ceiling, growing fast (2 ms per tick) and shrinking slow (1 ms per
//! tick). Scheduled times are forced monotone so playout never observes a
//! sequence inversion.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace};

/// Jitter buffer configuration
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Playout delay floor, in milliseconds
    pub min_delay_ms: u32,
    /// Base playout target before the jitter term, in milliseconds
    pub base_target_ms: u32,
    /// Playout delay ceiling; packets older than this are late
    pub max_delay_ms: u32,
    /// Multiplier applied to smoothed jitter when computing the target
    pub jitter_factor: f64,
    /// Maximum queued packets
    pub max_packets: usize,
    /// Frame duration, in milliseconds
    pub frame_ms: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 20,
            base_target_ms: 40,
            max_delay_ms: 100,
            jitter_factor: 1.5,
            max_packets: 1_000,
            frame_ms: 20,
        }
    }
}

/// What a queue entry holds
#[derive(Debug, Clone)]
pub enum EntryPayload {
    /// An encoded frame ready for decode
    Media {
        /// Engine-framed payload
        payload: Bytes,
        /// Rebuilt from XOR parity rather than received
        is_fec_recovered: bool,
        /// Extended sequence whose audio this frame's FEC section carries
        fec_covers: Option<u64>,
    },
    /// A slot for a packet that never arrived; playout decides between
    /// in-band FEC from the successor and concealment
    Missing,
}

/// One queued playout slot
#[derive(Debug, Clone)]
pub struct JitterEntry {
    /// Extended sequence
    pub extended_seq: u64,
    /// Media timestamp (interpolated for missing slots)
    pub timestamp: u32,
    /// Where this frame sits on the stream's nominal playout timeline
    pub nominal_us: u64,
    /// Scheduled playout time
    pub play_at_us: u64,
    /// Payload or loss marker
    pub payload: EntryPayload,
}

/// Result of a playout tick against the queue head
#[derive(Debug)]
pub enum PopOutcome {
    /// Head not due yet (or queue empty)
    NotReady,
    /// Head due for decode
    Due(JitterEntry),
    /// Head fell more than the ceiling behind its timeline; dropped, the
    /// caller conceals instead
    Late(JitterEntry),
}

/// Bounded adaptive playout queue
pub struct JitterBuffer {
    config: JitterConfig,
    queue: VecDeque<JitterEntry>,
    adaptive_delay_us: u64,
    target_delay_us: u64,
    smoothed_jitter_ms: f64,
    last_play_at_us: u64,
    overflow_dropped: u64,
}

impl JitterBuffer {
    /// Create a queue with the given configuration
    pub fn new(config: JitterConfig) -> Self {
        let initial = u64::from(config.base_target_ms) * 1_000;
        Self {
            adaptive_delay_us: initial,
            target_delay_us: initial,
            smoothed_jitter_ms: 0.0,
            last_play_at_us: 0,
            overflow_dropped: 0,
            queue: VecDeque::new(),
            config,
        }
    }

    /// Current playout delay applied to new entries, in microseconds
    pub fn current_delay_us(&self) -> u64 {
        self.adaptive_delay_us
    }

    /// Queued entries
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Packets dropped because the queue was full
    pub fn overflow_dropped(&self) -> u64 {
        self.overflow_dropped
    }

    /// Current buffer depth for the stats snapshot, in milliseconds
    pub fn buffer_size_ms(&self) -> u32 {
        (self.adaptive_delay_us / 1_000) as u32
    }

    /// Current buffer target for the stats snapshot, in milliseconds
    pub fn buffer_target_ms(&self) -> u32 {
        (self.target_delay_us / 1_000) as u32
    }

    /// Smoothed jitter estimate driving the target, in milliseconds
    pub fn smoothed_jitter_ms(&self) -> f64 {
        self.smoothed_jitter_ms
    }

    /// Queue one entry at its scheduled position
    ///
    /// Scheduled times are clamped monotone against everything already
    /// queued; on overflow the newest entry loses.
    pub fn insert(&mut self, mut entry: JitterEntry) -> bool {
        entry.play_at_us = entry.play_at_us.max(self.last_play_at_us);

        if self.queue.len() >= self.config.max_packets {
            self.overflow_dropped += 1;
            debug!(seq = entry.extended_seq, "jitter buffer full, dropping newest");
            return false;
        }

        self.last_play_at_us = entry.play_at_us;
        let pos = self
            .queue
            .iter()
            .rposition(|e| e.play_at_us <= entry.play_at_us)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.queue.insert(pos, entry);
        true
    }

    /// Pull the head if it is due at `now_us`
    pub fn pop_due(&mut self, now_us: u64) -> PopOutcome {
        match self.queue.front() {
            Some(head) if head.play_at_us <= now_us => {}
            _ => return PopOutcome::NotReady,
        }
        let max_delay_us = u64::from(self.config.max_delay_ms) * 1_000;
        let Some(entry) = self.queue.pop_front() else {
            return PopOutcome::NotReady;
        };
        if now_us.saturating_sub(entry.nominal_us) > max_delay_us {
            trace!(seq = entry.extended_seq, "late frame dropped at playout");
            return PopOutcome::Late(entry);
        }
        PopOutcome::Due(entry)
    }

    /// Peek the head without consuming it
    pub fn peek(&self) -> Option<&JitterEntry> {
        self.queue.front()
    }

    /// Recompute the target from smoothed jitter and loss, then step the
    /// adaptive delay toward it (asymmetric: grow fast, shrink slow)
    pub fn adapt(&mut self, jitter_ms: f64, loss_rate: f64) {
        self.smoothed_jitter_ms += (jitter_ms - self.smoothed_jitter_ms) / 8.0;

        let loss_compensation_ms = if loss_rate > 0.05 { 5.0 } else { 0.0 };
        let target_ms = f64::from(self.config.base_target_ms)
            + self.smoothed_jitter_ms * self.config.jitter_factor
            + loss_compensation_ms;
        let target_ms = target_ms
            .max(f64::from(self.config.min_delay_ms))
            .min(f64::from(self.config.max_delay_ms));
        self.target_delay_us = (target_ms * 1_000.0) as u64;

        if self.target_delay_us > self.adaptive_delay_us {
            self.adaptive_delay_us = (self.adaptive_delay_us + 2_000).min(self.target_delay_us);
        } else if self.target_delay_us < self.adaptive_delay_us {
            self.adaptive_delay_us = (self.adaptive_delay_us - 1_000).max(self.target_delay_us);
        }

        let min = u64::from(self.config.min_delay_ms) * 1_000;
        let max = u64::from(self.config.max_delay_ms) * 1_000;
        self.adaptive_delay_us = self.adaptive_delay_us.clamp(min, max);
    }

    /// Drop everything queued (stream teardown)
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Frame duration in microseconds
    pub fn frame_us(&self) -> u64 {
        u64::from(self.config.frame_ms) * 1_000
    }

    /// Late threshold in microseconds
    pub fn max_delay_us(&self) -> u64 {
        u64::from(self.config.max_delay_ms) * 1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_entry(seq: u64, nominal_us: u64, play_at_us: u64) -> JitterEntry {
        JitterEntry {
            extended_seq: seq,
            timestamp: (seq * 160) as u32,
            nominal_us,
            play_at_us,
            payload: EntryPayload::Media {
                payload: Bytes::from_static(&[1, 2, 3]),
                is_fec_recovered: false,
                fec_covers: None,
            },
        }
    }

    #[test]
    fn test_not_ready_before_schedule() {
        let mut jb = JitterBuffer::new(JitterConfig::default());
        jb.insert(media_entry(1, 0, 40_000));
        assert!(matches!(jb.pop_due(10_000), PopOutcome::NotReady));
        assert!(matches!(jb.pop_due(40_000), PopOutcome::Due(_)));
    }

    #[test]
    fn test_monotone_schedule_preserves_order() {
        let mut jb = JitterBuffer::new(JitterConfig::default());
        // Second entry computed an earlier play time (it arrived first);
        // the clamp keeps delivery in sequence order
        jb.insert(media_entry(1, 20_000, 100_000));
        jb.insert(media_entry(2, 40_000, 80_000));

        match jb.pop_due(100_000) {
            PopOutcome::Due(e) => assert_eq!(e.extended_seq, 1),
            other => panic!("expected Due, got {other:?}"),
        }
        match jb.pop_due(100_000) {
            PopOutcome::Due(e) => assert_eq!(e.extended_seq, 2),
            other => panic!("expected Due, got {other:?}"),
        }
    }

    #[test]
    fn test_late_head_is_flagged() {
        let mut jb = JitterBuffer::new(JitterConfig::default());
        // Nominal time 20 ms, popped at 200 ms: 180 ms behind, over the
        // 100 ms ceiling
        jb.insert(media_entry(1, 20_000, 150_000));
        assert!(matches!(jb.pop_due(200_000), PopOutcome::Late(_)));
    }

    #[test]
    fn test_overflow_drops_newest() {
        let config = JitterConfig {
            max_packets: 3,
            ..Default::default()
        };
        let mut jb = JitterBuffer::new(config);
        for seq in 0..3u64 {
            assert!(jb.insert(media_entry(seq, seq * 20_000, seq * 20_000 + 40_000)));
        }
        assert!(!jb.insert(media_entry(3, 60_000, 100_000)));
        assert_eq!(jb.overflow_dropped(), 1);
        assert_eq!(jb.len(), 3);
    }

    #[test]
    fn test_adaptation_grows_fast_shrinks_slow() {
        let mut jb = JitterBuffer::new(JitterConfig::default());
        let start = jb.current_delay_us();

        // Sustained jitter drives the delay up 2 ms per tick
        jb.adapt(40.0, 0.0);
        let after_one = jb.current_delay_us();
        assert_eq!(after_one, start + 2_000);

        for _ in 0..100 {
            jb.adapt(40.0, 0.0);
        }
        let peak = jb.current_delay_us();
        assert!(peak <= 100_000);

        // Calm network: back down 1 ms per tick
        jb.adapt(0.0, 0.0);
        let coming_down = jb.current_delay_us();
        assert!(peak - coming_down <= 1_000);
    }

    #[test]
    fn test_delay_stays_clamped() {
        let mut jb = JitterBuffer::new(JitterConfig::default());
        for _ in 0..500 {
            jb.adapt(500.0, 0.5);
            let ms = jb.buffer_size_ms();
            assert!((20..=100).contains(&ms), "delay {ms} ms out of range");
        }
        for _ in 0..500 {
            jb.adapt(0.0, 0.0);
            let ms = jb.buffer_size_ms();
            assert!((20..=100).contains(&ms), "delay {ms} ms out of range");
        }
    }

    #[test]
    fn test_loss_compensation_raises_target() {
        let mut jb = JitterBuffer::new(JitterConfig::default());
        jb.adapt(0.0, 0.0);
        let clean = jb.buffer_target_ms();
        let mut lossy = JitterBuffer::new(JitterConfig::default());
        lossy.adapt(0.0, 0.2);
        assert!(lossy.buffer_target_ms() > clean);
    }
}
