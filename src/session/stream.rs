//! Per-stream receive state machine
//!
//! One `Stream` ties the whole arrival and playout pipeline together:
//! sequence validation, the reorder window with FEC groups, re-encode
//! through the voice engine, the adaptive jitter queue, and the
//! decode/FEC/PLC playout path. A stream exclusively owns every buffer it
//! touches; the registry holds streams by value and never hands out
//! aliases.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::buffer::{
    EntryPayload, InsertOutcome, JitterBuffer, JitterEntry, NextPacket, PacketRecord, PopOutcome,
    ReorderBuffer,
};
use crate::codec::{
    CodecState, ConcealOutcome, Concealer, G711Codec, G711Variant, OpusCodec, WireFormat,
};
use crate::quality::QualityTracker;
use crate::rtp::{RtpPacket, SeqStatus, SequenceTracker};
use crate::types::{
    FrameKind, PacketOutcome, PlayoutFrame, Sample, StreamId, StreamKey, StreamStats,
};

use super::SessionConfig;

/// Per-stream pipeline state
pub(crate) struct Stream {
    id: StreamId,
    key: StreamKey,
    payload_type: u8,
    clock_rate: u32,
    frame_size: usize,
    frame_ticks: u32,
    frame_ms: u64,

    wire: WireFormat,
    g711: G711Codec,
    engine: OpusCodec,
    concealer: Concealer,
    seq: SequenceTracker,
    reorder: ReorderBuffer,
    jitter: JitterBuffer,
    quality: QualityTracker,

    fec_payload_type: Option<u8>,

    next_deliver: Option<u64>,
    last_delivered: Option<(u64, u32)>,
    playout_ref: Option<(u32, u64)>,
    last_encoded_seq: Option<u64>,
    last_arrival_us: u64,
    expired: bool,

    packets_received: u64,
    duplicates: u64,
    recovered_by_fec: u64,
    concealed_ms: u64,
    dropped_stale: u64,
    reorder_dropped: u64,
    decode_errors: u64,
    plc_used: bool,
    fec_used: bool,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        key: StreamKey,
        payload_type: u8,
        clock_rate: u32,
        config: &SessionConfig,
        now_us: u64,
    ) -> Self {
        let voice = config.voice.clone().with_sample_rate(clock_rate);
        let engine = match OpusCodec::new(voice.clone()) {
            Ok(engine) => engine,
            Err(e) => {
                warn!(ssrc = key.ssrc, error = %e, "voice engine setup failed");
                OpusCodec::failed(voice)
            }
        };
        let frame_size = (clock_rate / 50) as usize;
        debug!(
            ssrc = key.ssrc,
            pt = payload_type,
            clock_rate,
            direction = ?key.direction,
            "stream created"
        );
        Self {
            id,
            key,
            payload_type,
            clock_rate,
            frame_size,
            frame_ticks: clock_rate / 50,
            frame_ms: u64::from(config.jitter.frame_ms),
            wire: WireFormat::for_payload_type(payload_type),
            g711: G711Codec::new(match payload_type {
                8 => G711Variant::ALaw,
                _ => G711Variant::MuLaw,
            }),
            engine,
            concealer: Concealer::new(config.plc_mode, clock_rate),
            seq: SequenceTracker::new(clock_rate),
            reorder: ReorderBuffer::new(
                config.reorder_window,
                config.fec.group_size,
                config.reorder_wait_ms,
            ),
            jitter: JitterBuffer::new(config.jitter.clone()),
            quality: QualityTracker::new(),
            fec_payload_type: config.fec.payload_type,
            next_deliver: None,
            last_delivered: None,
            playout_ref: None,
            last_encoded_seq: None,
            last_arrival_us: now_us,
            expired: false,
            packets_received: 0,
            duplicates: 0,
            recovered_by_fec: 0,
            concealed_ms: 0,
            dropped_stale: 0,
            reorder_dropped: 0,
            decode_errors: 0,
            plc_used: false,
            fec_used: false,
        }
    }

    pub(crate) fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub(crate) fn last_arrival_us(&self) -> u64 {
        self.last_arrival_us
    }

    pub(crate) fn mark_expired(&mut self) {
        self.expired = true;
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.expired
    }

    /// Feed one parsed packet through the arrival path
    pub(crate) fn on_packet(&mut self, arrival_us: u64, pkt: &RtpPacket) -> PacketOutcome {
        self.last_arrival_us = arrival_us;
        self.expired = false;

        if self.engine.state() != CodecState::Ready {
            return PacketOutcome::Failed;
        }
        if Some(pkt.payload_type) == self.fec_payload_type {
            return self.on_parity(arrival_us, pkt);
        }

        // Exact repeat of the newest packet; keep it away from accounting
        if self.seq.is_duplicate_of_max(pkt.sequence) {
            self.duplicates += 1;
            return PacketOutcome::DroppedDuplicate;
        }

        let prev_max = self.seq.max_seq();
        let was_in_probation = self.seq.in_probation() && self.next_deliver.is_some();
        let status = self.seq.update(pkt.sequence);
        if was_in_probation
            && matches!(status, SeqStatus::Probation { .. })
            && pkt.sequence != prev_max.wrapping_add(1)
        {
            // Probation mismatch adopted a new sequence; the buffered
            // timeline no longer applies
            self.reset_pipeline(status.extended());
        }
        let extended = match status.extended() {
            Some(e) => e,
            None => {
                self.dropped_stale += 1;
                return PacketOutcome::DroppedStale;
            }
        };

        if matches!(status, SeqStatus::OutOfOrder { .. }) {
            let already_delivered = self.next_deliver.map_or(false, |next| extended < next);
            if already_delivered || self.reorder.contains(extended) {
                self.seq.retract_out_of_order();
                self.duplicates += 1;
                return PacketOutcome::DroppedDuplicate;
            }
        }

        if matches!(status, SeqStatus::Restarted { .. }) {
            // Source restart: drop everything tied to the old timeline
            self.reset_pipeline(Some(extended));
        }

        self.packets_received += 1;
        let timestamp = self.seq.update_timing(pkt.timestamp, arrival_us);
        if self.next_deliver.is_none() {
            self.next_deliver = Some(extended);
        }

        let record = PacketRecord {
            sequence: pkt.sequence,
            extended_seq: extended,
            timestamp,
            arrival_us,
            payload: pkt.payload.clone(),
            is_fec_recovered: false,
        };
        match self.reorder.insert(record) {
            InsertOutcome::Stored => {}
            InsertOutcome::Duplicate => {
                self.packets_received -= 1;
                self.duplicates += 1;
                return PacketOutcome::DroppedDuplicate;
            }
            InsertOutcome::Full => {
                // Backpressure: drop newest, count as loss
                self.reorder_dropped += 1;
                self.quality.record_lost(1);
                debug!(seq = pkt.sequence, "reorder window full, packet dropped");
                return PacketOutcome::Failed;
            }
        }

        let recovered = self.drain(arrival_us);
        if recovered > 0 {
            PacketOutcome::Recovered
        } else {
            match status {
                SeqStatus::OutOfOrder { .. } => PacketOutcome::OutOfOrderBuffered,
                _ => PacketOutcome::Accepted,
            }
        }
    }

    /// Fold a wire parity payload into its FEC group
    ///
    /// Parity packets ride a dedicated payload type and carry the group's
    /// base sequence in their first two bytes; they never advance the
    /// media sequence state.
    fn on_parity(&mut self, arrival_us: u64, pkt: &RtpPacket) -> PacketOutcome {
        if pkt.payload.len() < 3 {
            self.dropped_stale += 1;
            return PacketOutcome::DroppedStale;
        }
        let base_raw = u16::from_be_bytes([pkt.payload[0], pkt.payload[1]]);
        let base_ext = self.seq.extend_nearby(base_raw);
        self.reorder.add_parity(base_ext, &pkt.payload[2..]);
        trace!(group = base_ext, "parity packet folded");

        let recovered = self.drain(arrival_us);
        if recovered > 0 {
            PacketOutcome::Recovered
        } else {
            PacketOutcome::Accepted
        }
    }

    /// Move everything deliverable from the reorder window into the
    /// playout queue; returns how many packets FEC rebuilt
    fn drain(&mut self, now_us: u64) -> u32 {
        let mut recovered = 0u32;
        loop {
            let Some(expected) = self.next_deliver else {
                break;
            };

            // A complete group needs no reorder wait: recovery is exact
            if !self.reorder.contains(expected) {
                let ts = self.interpolate_ts(expected);
                if let Some(rec) = self.reorder.try_recover(expected, ts, now_us) {
                    recovered += 1;
                    self.recovered_by_fec += 1;
                    self.fec_used = true;
                    self.enqueue_media(rec);
                    self.next_deliver = Some(expected + 1);
                    continue;
                }
            }

            match self.reorder.try_pop_next(expected, now_us) {
                NextPacket::Ready(rec) => {
                    let next = rec.extended_seq + 1;
                    self.enqueue_media(rec);
                    self.next_deliver = Some(next);
                }
                NextPacket::TimedOut(rec) => {
                    // The gap in front of this packet is now final
                    let mut missing = expected;
                    while missing < rec.extended_seq {
                        let ts = self.interpolate_ts(missing);
                        if let Some(r) = self.reorder.try_recover(missing, ts, now_us) {
                            recovered += 1;
                            self.recovered_by_fec += 1;
                            self.fec_used = true;
                            self.enqueue_media(r);
                        } else {
                            self.quality.record_lost(1);
                            self.enqueue_missing(missing, ts, now_us);
                        }
                        missing += 1;
                    }
                    let next = rec.extended_seq + 1;
                    self.enqueue_media(rec);
                    self.next_deliver = Some(next);
                }
                NextPacket::NotReady => break,
            }
        }
        if let Some(next) = self.next_deliver {
            self.reorder.prune_groups(next.saturating_sub(64));
        }
        recovered
    }

    /// Decode a delivered wire packet, run it through the voice engine,
    /// and queue the result for playout
    fn enqueue_media(&mut self, rec: PacketRecord) {
        let pcm = self.wire_decode(&rec.payload);
        let pcm = self.fit_frame(pcm);

        self.quality.record_received(rec.payload.len());
        self.engine.adapt_bitrate(self.quality.loss_rate());

        let fec_covers = self.last_encoded_seq;
        let frame = match self.engine.encode(&pcm) {
            Ok(frame) => frame,
            Err(e) => {
                self.decode_errors += 1;
                if !e.is_recoverable() {
                    self.engine.mark_failed();
                }
                debug!(seq = rec.extended_seq, error = %e, "engine encode failed");
                return;
            }
        };
        self.last_encoded_seq = Some(rec.extended_seq);
        self.last_delivered = Some((rec.extended_seq, rec.timestamp));

        let nominal = self.nominal_us(rec.timestamp, rec.arrival_us);
        let entry = JitterEntry {
            extended_seq: rec.extended_seq,
            timestamp: rec.timestamp,
            nominal_us: nominal,
            play_at_us: rec.arrival_us + self.jitter.current_delay_us(),
            payload: EntryPayload::Media {
                payload: Bytes::from(frame),
                is_fec_recovered: rec.is_fec_recovered,
                fec_covers,
            },
        };
        self.jitter.insert(entry);
    }

    /// Queue a loss marker so playout conceals at the right position
    fn enqueue_missing(&mut self, extended_seq: u64, timestamp: u32, now_us: u64) {
        let nominal = self.nominal_us(timestamp, now_us);
        let entry = JitterEntry {
            extended_seq,
            timestamp,
            nominal_us: nominal,
            play_at_us: nominal + self.jitter.current_delay_us(),
            payload: EntryPayload::Missing,
        };
        self.jitter.insert(entry);
    }

    /// One playout tick: pull the next due frame or synthesize one
    pub(crate) fn playout(&mut self, now_us: u64, out: &mut [Sample]) -> PlayoutFrame {
        if self.engine.state() != CodecState::Ready {
            return PlayoutFrame::not_ready();
        }
        self.drain(now_us);

        let frame = match self.jitter.pop_due(now_us) {
            PopOutcome::NotReady => return PlayoutFrame::not_ready(),
            PopOutcome::Late(entry) => {
                debug!(seq = entry.extended_seq, "frame late, concealing");
                self.conceal_into(out)
            }
            PopOutcome::Due(entry) => match entry.payload {
                EntryPayload::Media {
                    ref payload,
                    is_fec_recovered,
                    ..
                } => match self.engine.decode(payload) {
                    Ok(pcm) => {
                        let n = self.write_out(&pcm, out);
                        self.concealer.record_frame(&pcm);
                        PlayoutFrame {
                            samples_written: n,
                            kind: if is_fec_recovered {
                                FrameKind::Fec
                            } else {
                                FrameKind::Decoded
                            },
                        }
                    }
                    Err(e) => {
                        self.decode_errors += 1;
                        if !e.is_recoverable() {
                            self.engine.mark_failed();
                            return PlayoutFrame::not_ready();
                        }
                        self.conceal_into(out)
                    }
                },
                EntryPayload::Missing => self.conceal_missing(entry.extended_seq, out),
            },
        };

        self.jitter
            .adapt(self.seq.jitter_ms(), self.quality.loss_rate());
        frame
    }

    /// A missing slot: try the successor's in-band FEC, then conceal
    fn conceal_missing(&mut self, missing_seq: u64, out: &mut [Sample]) -> PlayoutFrame {
        let successor = match self.jitter.peek() {
            Some(next) if next.extended_seq == missing_seq + 1 => match &next.payload {
                EntryPayload::Media {
                    payload,
                    fec_covers: Some(covers),
                    ..
                } if *covers == missing_seq => Some(payload.clone()),
                _ => None,
            },
            _ => None,
        };

        if let Some(payload) = successor {
            if let Ok(Some(pcm)) = self.engine.decode_fec(&payload) {
                let n = self.write_out(&pcm, out);
                self.fec_used = true;
                self.concealer.record_frame(&pcm);
                return PlayoutFrame {
                    samples_written: n,
                    kind: FrameKind::Fec,
                };
            }
        }
        self.conceal_into(out)
    }

    /// Synthesize one concealment frame and account for it
    fn conceal_into(&mut self, out: &mut [Sample]) -> PlayoutFrame {
        let n = self.frame_size.min(out.len());
        let outcome = self.concealer.conceal(&mut out[..n]);
        if outcome == ConcealOutcome::NeedCodecPlc {
            let pcm = self.engine.decode_plc();
            self.write_out(&pcm, out);
        }
        self.concealed_ms += self.frame_ms;
        self.plc_used = true;
        PlayoutFrame {
            samples_written: n,
            kind: FrameKind::Plc,
        }
    }

    fn write_out(&self, pcm: &[Sample], out: &mut [Sample]) -> usize {
        let n = pcm.len().min(out.len());
        out[..n].copy_from_slice(&pcm[..n]);
        n
    }

    fn wire_decode(&mut self, payload: &[u8]) -> Vec<Sample> {
        match self.wire {
            WireFormat::Pcmu | WireFormat::Pcma => self.g711.decode(payload),
            WireFormat::Engine => self
                .engine
                .decode(payload)
                .unwrap_or_else(|_| vec![0; self.frame_size]),
        }
    }

    fn fit_frame(&self, mut pcm: Vec<Sample>) -> Vec<Sample> {
        pcm.resize(self.frame_size, 0);
        pcm
    }

    /// Position of a timestamp on the stream's nominal playout timeline
    fn nominal_us(&mut self, timestamp: u32, fallback_us: u64) -> u64 {
        match self.playout_ref {
            Some((ts0, n0)) => {
                let delta_ticks = u64::from(timestamp.wrapping_sub(ts0));
                n0 + delta_ticks * 1_000_000 / u64::from(self.clock_rate)
            }
            None => {
                self.playout_ref = Some((timestamp, fallback_us));
                fallback_us
            }
        }
    }

    /// Frame-period interpolation for a sequence that never arrived
    fn interpolate_ts(&self, extended_seq: u64) -> u32 {
        match self.last_delivered {
            Some((ext, ts)) => {
                let steps = extended_seq.saturating_sub(ext) as u32;
                ts.wrapping_add(steps.wrapping_mul(self.frame_ticks))
            }
            None => (extended_seq as u32).wrapping_mul(self.frame_ticks),
        }
    }

    /// Copy counters into a snapshot
    pub(crate) fn stats(&self) -> StreamStats {
        let jitter_ms = self.seq.jitter_ms();
        let lost = self
            .seq
            .lost()
            .saturating_sub(self.recovered_by_fec)
            .saturating_add(self.jitter.overflow_dropped())
            .saturating_add(self.reorder_dropped);
        StreamStats {
            id: self.id,
            ssrc: self.key.ssrc,
            payload_type: self.payload_type,
            direction: self.key.direction,
            active: !self.expired && self.engine.state() == CodecState::Ready,
            packets_received: self.packets_received,
            packets_lost: lost,
            out_of_order: self.seq.out_of_order(),
            duplicates: self.duplicates,
            recovered_by_fec: self.recovered_by_fec,
            concealed_ms: self.concealed_ms,
            current_jitter_ms: jitter_ms,
            max_jitter_ms: self.seq.max_jitter_ms(),
            buffer_size_ms: self.jitter.buffer_size_ms(),
            buffer_target_ms: self.jitter.buffer_target_ms(),
            packet_loss_rate: self.quality.loss_rate(),
            current_bitrate_bps: self.engine.current_bitrate(),
            plc_used: self.plc_used,
            fec_used: self.fec_used,
            last_frame_type: self.engine.last_frame_type(),
            corrected_timestamps: self.seq.corrected_timestamps(),
            jitter_spikes: self.seq.jitter_spikes(),
            mos_score: self.quality.mos_score(jitter_ms),
        }
    }

    fn reset_pipeline(&mut self, next_deliver: Option<u64>) {
        self.reorder.clear();
        self.jitter.clear();
        self.concealer.reset();
        self.playout_ref = None;
        self.last_delivered = None;
        self.last_encoded_seq = None;
        self.next_deliver = next_deliver;
    }

    /// Release every owned buffer (session close or eviction)
    pub(crate) fn teardown(&mut self) {
        debug!(
            ssrc = self.key.ssrc,
            received = self.packets_received,
            stale = self.dropped_stale,
            decode_errors = self.decode_errors,
            "stream torn down"
        );
        self.reorder.clear();
        self.jitter.clear();
        self.concealer.reset();
        self.engine.close();
    }
}
