//! RFC 3550 sequence and timestamp validation
//!
//! One [`SequenceTracker`] per stream translates the 16-bit wire sequence
//! into a monotone extended sequence, runs the probation state machine for
//! new sources, keeps the expected/received loss accounting, estimates
//! interarrival jitter (§6.4.1, gain 1/16), and applies the monitor's
//! timestamp sanity correction.

use tracing::{debug, warn};

use super::{MAX_DROPOUT, MAX_MISORDER, MIN_SEQUENTIAL, RTP_SEQ_MOD};

/// Backward distances above this udelta are reordering, not a restart
const MISORDER_THRESHOLD: u16 = (RTP_SEQ_MOD - MAX_MISORDER as u32) as u16;

/// Classification of one sequence number against the stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqStatus {
    /// Source still in probation; packet flows through but statistics are
    /// not reported yet
    Probation { extended: u64 },
    /// In order (with a permissible gap); `max_seq` advanced
    InOrder { extended: u64 },
    /// Behind `max_seq` within the misorder window; `max_seq` unchanged
    OutOfOrder { extended: u64 },
    /// Large jump matched `bad_seq`: the source restarted and tracking was
    /// re-initialized
    Restarted { extended: u64 },
    /// Large jump outside every window; dropped
    Stale,
}

impl SeqStatus {
    /// Extended sequence carried by an accepted packet
    pub fn extended(&self) -> Option<u64> {
        match *self {
            Self::Probation { extended }
            | Self::InOrder { extended }
            | Self::OutOfOrder { extended }
            | Self::Restarted { extended } => Some(extended),
            Self::Stale => None,
        }
    }
}

/// Per-stream sequence and timing state
#[derive(Debug)]
pub struct SequenceTracker {
    clock_rate: u32,

    started: bool,
    probation: u8,
    base_seq: u16,
    max_seq: u16,
    /// Count of 16-bit wraps since `base_seq`
    cycles: u32,
    bad_seq: Option<u16>,
    /// Packets counted since `base_seq` (statistics epoch)
    received: u64,
    out_of_order: u64,

    // Timing state
    have_timing: bool,
    last_rtp_ts: u32,
    last_arrival_us: u64,
    have_transit: bool,
    transit: i64,
    /// RFC 3550 jitter estimate, in clock ticks
    jitter: f64,
    max_jitter_ms: f64,
    jitter_spikes: u64,
    corrected_timestamps: u64,
    timestamp_warnings: u64,
}

impl SequenceTracker {
    /// Create a tracker for a stream with the given media clock
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            started: false,
            probation: MIN_SEQUENTIAL,
            base_seq: 0,
            max_seq: 0,
            cycles: 0,
            bad_seq: None,
            received: 0,
            out_of_order: 0,
            have_timing: false,
            last_rtp_ts: 0,
            last_arrival_us: 0,
            have_transit: false,
            transit: 0,
            jitter: 0.0,
            max_jitter_ms: 0.0,
            jitter_spikes: 0,
            corrected_timestamps: 0,
            timestamp_warnings: 0,
        }
    }

    /// Classify one sequence number and advance the state machine
    pub fn update(&mut self, seq: u16) -> SeqStatus {
        if !self.started {
            self.init_seq(seq);
            self.started = true;
            self.probation = MIN_SEQUENTIAL.saturating_sub(1);
            if self.probation == 0 {
                self.received = 1;
                return SeqStatus::InOrder {
                    extended: u64::from(seq),
                };
            }
            return SeqStatus::Probation {
                extended: u64::from(seq),
            };
        }

        if self.probation > 0 {
            return self.update_probation(seq);
        }

        let udelta = seq.wrapping_sub(self.max_seq);
        if udelta < MAX_DROPOUT {
            // In order, with permissible gap
            if seq < self.max_seq {
                self.cycles += 1;
            }
            self.max_seq = seq;
            self.received += 1;
            SeqStatus::InOrder {
                extended: self.extend(seq, false),
            }
        } else if udelta > MISORDER_THRESHOLD {
            // Behind max_seq within the small backward window
            let backward_across_wrap = seq > self.max_seq;
            if backward_across_wrap && self.cycles == 0 {
                // Would extend before the very first cycle; nothing to do
                return SeqStatus::Stale;
            }
            self.out_of_order += 1;
            self.received += 1;
            SeqStatus::OutOfOrder {
                extended: self.extend(seq, backward_across_wrap),
            }
        } else if Some(seq) == self.bad_seq {
            // Two sequential packets after a large jump: source restarted
            debug!(seq, "sequence restart accepted");
            self.init_seq(seq);
            self.received = 1;
            SeqStatus::Restarted {
                extended: u64::from(seq),
            }
        } else {
            self.bad_seq = Some(seq.wrapping_add(1));
            SeqStatus::Stale
        }
    }

    fn update_probation(&mut self, seq: u16) -> SeqStatus {
        if seq == self.max_seq.wrapping_add(1) {
            self.probation -= 1;
            self.max_seq = seq;
            if self.probation == 0 {
                // Source proven: statistics begin at this packet
                self.base_seq = seq;
                self.cycles = 0;
                self.bad_seq = None;
                self.received = 1;
                return SeqStatus::InOrder {
                    extended: u64::from(seq),
                };
            }
        } else {
            // Any mismatch restarts probation and adopts the new sequence
            // as max_seq, backward jumps included
            self.probation = MIN_SEQUENTIAL.saturating_sub(1).max(1);
            self.max_seq = seq;
        }
        SeqStatus::Probation {
            extended: self.extend(self.max_seq, false),
        }
    }

    fn init_seq(&mut self, seq: u16) {
        self.base_seq = seq;
        self.max_seq = seq;
        self.cycles = 0;
        self.bad_seq = None;
        self.received = 0;
    }

    fn extend(&self, seq: u16, previous_cycle: bool) -> u64 {
        let cycles = if previous_cycle {
            u64::from(self.cycles) - 1
        } else {
            u64::from(self.cycles)
        };
        cycles * u64::from(RTP_SEQ_MOD) + u64::from(seq)
    }

    /// Update timing state for an accepted packet and return the timestamp
    /// to use downstream (corrected when the sanity check rewrote it)
    pub fn update_timing(&mut self, rtp_ts: u32, arrival_us: u64) -> u32 {
        if !self.have_timing {
            self.have_timing = true;
            self.last_rtp_ts = rtp_ts;
            self.last_arrival_us = arrival_us;
            return rtp_ts;
        }

        let ts = self.sanitize_timestamp(rtp_ts, arrival_us);
        self.check_timestamp_jump(ts);

        if ts != self.last_rtp_ts {
            let arrival_ticks =
                (arrival_us as i64).wrapping_mul(i64::from(self.clock_rate)) / 1_000_000;
            let transit = arrival_ticks - i64::from(ts);
            if self.have_transit {
                let d = (transit - self.transit).abs() as f64;
                self.jitter += (d - self.jitter) / 16.0;
                let jitter_ms = self.jitter_ms();
                if jitter_ms > self.max_jitter_ms {
                    self.max_jitter_ms = jitter_ms;
                }
                if d > f64::from(self.clock_rate) / 100.0 {
                    self.jitter_spikes += 1;
                    debug!(
                        spike_ms = d * 1000.0 / f64::from(self.clock_rate),
                        "jitter spike"
                    );
                }
            }
            self.transit = transit;
            self.have_transit = true;
        }

        self.last_rtp_ts = ts;
        self.last_arrival_us = arrival_us;
        ts
    }

    /// Rewrite a timestamp that neither matches the arrival clock nor a
    /// frame-period pattern
    fn sanitize_timestamp(&mut self, rtp_ts: u32, arrival_us: u64) -> u32 {
        let elapsed_ms = arrival_us.saturating_sub(self.last_arrival_us) / 1_000;
        let expected_ts = self
            .last_rtp_ts
            .wrapping_add(((u64::from(self.clock_rate) / 1_000) * elapsed_ms) as u32);

        let deviation = self.clock_rate / 100; // 10 ms in ticks
        let fwd = rtp_ts.wrapping_sub(expected_ts);
        let diff = fwd.min(fwd.wrapping_neg());
        if diff <= deviation {
            return rtp_ts;
        }

        // A clean multiple of the frame period is a legitimate gap
        let pattern = self.clock_rate / 50;
        if pattern > 0 && diff % pattern <= deviation {
            return rtp_ts;
        }

        self.corrected_timestamps += 1;
        debug!(old = rtp_ts, new = expected_ts, "corrected RTP timestamp");
        expected_ts
    }

    /// Flag timestamp jumps no real source produces (below one frame worth
    /// of drift or above five seconds)
    fn check_timestamp_jump(&mut self, ts: u32) {
        let diff = ts.wrapping_sub(self.last_rtp_ts);
        let ms = u64::from(diff) * 1_000 / u64::from(self.clock_rate);
        if ts != self.last_rtp_ts && !(1..=5_000).contains(&ms) {
            self.timestamp_warnings += 1;
            warn!(prev = self.last_rtp_ts, curr = ts, "suspect timestamp jump");
        }
    }

    /// True when `seq` repeats the current highest sequence
    ///
    /// Used to short-circuit exact duplicates of the newest packet before
    /// they disturb the accounting.
    pub fn is_duplicate_of_max(&self, seq: u16) -> bool {
        self.started && self.probation == 0 && seq == self.max_seq
    }

    /// Undo the accounting for a backward packet that turned out to be a
    /// duplicate, so statistics read as if it never arrived
    pub fn retract_out_of_order(&mut self) {
        self.received = self.received.saturating_sub(1);
        self.out_of_order = self.out_of_order.saturating_sub(1);
    }

    /// Map a raw 16-bit sequence near the current position onto the
    /// extended sequence space
    pub fn extend_nearby(&self, seq: u16) -> u64 {
        let max = self.extended_max();
        let candidates = [
            u64::from(self.cycles) * u64::from(RTP_SEQ_MOD) + u64::from(seq),
            (u64::from(self.cycles) + 1) * u64::from(RTP_SEQ_MOD) + u64::from(seq),
            u64::from(self.cycles)
                .checked_sub(1)
                .map(|c| c * u64::from(RTP_SEQ_MOD) + u64::from(seq))
                .unwrap_or(u64::MAX),
        ];
        candidates
            .into_iter()
            .filter(|&c| c != u64::MAX)
            .min_by_key(|&c| c.abs_diff(max))
            .unwrap_or(u64::from(seq))
    }

    /// Highest extended sequence seen
    pub fn extended_max(&self) -> u64 {
        self.extend(self.max_seq, false)
    }

    /// Packets the source should have sent since the statistics epoch
    pub fn expected(&self) -> u64 {
        if self.probation > 0 || !self.started {
            return 0;
        }
        self.extended_max() - u64::from(self.base_seq) + 1
    }

    /// Cumulative expected − received; never negative
    pub fn lost(&self) -> u64 {
        self.expected().saturating_sub(self.received)
    }

    /// Packets counted since the statistics epoch
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Packets that arrived behind the highest sequence
    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    /// True while the source is still proving itself
    pub fn in_probation(&self) -> bool {
        self.probation > 0
    }

    /// First sequence of the statistics epoch
    pub fn base_seq(&self) -> u16 {
        self.base_seq
    }

    /// Highest raw sequence seen
    pub fn max_seq(&self) -> u16 {
        self.max_seq
    }

    /// Completed 16-bit wraps since the statistics epoch
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    /// Current jitter estimate in milliseconds
    pub fn jitter_ms(&self) -> f64 {
        self.jitter / f64::from(self.clock_rate) * 1_000.0
    }

    /// Largest jitter estimate seen, in milliseconds
    pub fn max_jitter_ms(&self) -> f64 {
        self.max_jitter_ms
    }

    /// Count of 10 ms-plus interarrival spikes
    pub fn jitter_spikes(&self) -> u64 {
        self.jitter_spikes
    }

    /// Count of timestamps rewritten by the sanity check
    pub fn corrected_timestamps(&self) -> u64 {
        self.corrected_timestamps
    }

    /// Count of implausible wall-clock timestamp jumps
    pub fn timestamp_warnings(&self) -> u64 {
        self.timestamp_warnings
    }
}
