//! Reorder window and XOR forward error correction
//!
//! A fixed ring of slots indexed from an advancing head holds packets that
//! cannot be delivered yet. Each contiguous group of `K` media packets is
//! tracked by an XOR accumulator that is refreshed whenever any member
//! changes; once a wire parity payload joins the accumulator, a single
//! missing member equals the accumulated XOR and can be rebuilt in place.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, trace};

/// Default reorder window size, in packets
pub const DEFAULT_WINDOW: usize = 128;

/// Default FEC group size
pub const DEFAULT_GROUP_SIZE: u16 = 5;

/// Default bound on how long an out-of-order packet may wait
pub const MAX_REORDER_WAIT_MS: u64 = 40;

/// One buffered packet, payload owned by the record
#[derive(Debug, Clone)]
pub struct PacketRecord {
    /// 16-bit wire sequence
    pub sequence: u16,
    /// Extended (wrap-corrected) sequence
    pub extended_seq: u64,
    /// RTP timestamp (possibly sanity-corrected)
    pub timestamp: u32,
    /// Monotonic arrival time, microseconds
    pub arrival_us: u64,
    /// Payload bytes
    pub payload: Bytes,
    /// Set when the record was rebuilt from parity rather than received
    pub is_fec_recovered: bool,
}

/// Result of inserting a packet into the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored in a free slot
    Stored,
    /// A record with this extended sequence is already buffered
    Duplicate,
    /// Window full of packets still inside their reorder wait
    Full,
}

/// Result of asking for the next deliverable packet
#[derive(Debug)]
pub enum NextPacket {
    /// The exact expected sequence is present
    Ready(PacketRecord),
    /// Expected sequence absent, but a later packet has waited out the
    /// reorder bound; the gap before it must now be resolved
    TimedOut(PacketRecord),
    /// Nothing deliverable at this time
    NotReady,
}

/// XOR accumulator for one FEC group
#[derive(Debug, Default)]
struct FecGroup {
    /// Byte-wise XOR of everything fed in, zero-padded to the longest
    xor: Vec<u8>,
    /// Bitmask of group members observed
    members: u8,
    /// A wire parity payload has been folded in
    parity_seen: bool,
    /// Guards against reconstructing the same member twice
    recovered: bool,
}

impl FecGroup {
    fn fold(&mut self, payload: &[u8]) {
        if payload.len() > self.xor.len() {
            self.xor.resize(payload.len(), 0);
        }
        for (acc, &b) in self.xor.iter_mut().zip(payload) {
            *acc ^= b;
        }
    }
}

/// Fixed-size reorder window with FEC group tracking
pub struct ReorderBuffer {
    slots: Vec<Option<PacketRecord>>,
    head: usize,
    group_size: u16,
    max_wait_us: u64,
    groups: HashMap<u64, FecGroup>,
}

impl ReorderBuffer {
    /// Create a window of `window` slots with FEC groups of `group_size`
    pub fn new(window: usize, group_size: u16, max_wait_ms: u64) -> Self {
        Self {
            slots: (0..window.max(1)).map(|_| None).collect(),
            head: 0,
            group_size: group_size.clamp(1, 8),
            max_wait_us: max_wait_ms * 1_000,
            groups: HashMap::new(),
        }
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// True when no packet is buffered
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// True when a packet with this extended sequence is buffered
    pub fn contains(&self, extended_seq: u64) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|r| r.extended_seq == extended_seq)
    }

    /// Store a media packet and refresh its FEC group
    pub fn insert(&mut self, record: PacketRecord) -> InsertOutcome {
        if self.contains(record.extended_seq) {
            return InsertOutcome::Duplicate;
        }

        let now = record.arrival_us;
        let mut idx = self.head;
        let mut free = None;
        for _ in 0..self.slots.len() {
            if self.slots[idx].is_none() {
                free = Some(idx);
                break;
            }
            idx = (idx + 1) % self.slots.len();
        }

        let idx = match free {
            Some(idx) => idx,
            None => {
                // Evict the oldest resident only once it has overstayed the
                // reorder wait; otherwise the window is genuinely full
                let Some(oldest) = self
                    .slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.as_ref().map(|r| r.arrival_us).unwrap_or(u64::MAX))
                    .map(|(i, _)| i)
                else {
                    return InsertOutcome::Full;
                };
                let age_ok = self.slots[oldest]
                    .as_ref()
                    .map(|r| now.saturating_sub(r.arrival_us) >= self.max_wait_us)
                    .unwrap_or(false);
                if !age_ok {
                    return InsertOutcome::Full;
                }
                debug!("reorder window full, evicting oldest resident");
                self.slots[oldest] = None;
                oldest
            }
        };

        self.fold_member(&record);
        self.slots[idx] = Some(record);
        InsertOutcome::Stored
    }

    /// Fold a wire parity payload into the group starting at
    /// `group_base_ext`
    pub fn add_parity(&mut self, group_base_ext: u64, parity: &[u8]) {
        let group = self.groups.entry(group_base_ext).or_default();
        group.fold(parity);
        group.parity_seen = true;
        trace!(group = group_base_ext, "FEC parity folded");
    }

    /// Return the next packet for the expected sequence, or a later packet
    /// that has waited out the reorder bound
    pub fn try_pop_next(&mut self, expected_seq: u64, now_us: u64) -> NextPacket {
        let mut ready: Option<usize> = None;
        let mut best: Option<(usize, u64)> = None;
        for i in 0..self.slots.len() {
            let seq = match self.slots[i].as_ref() {
                Some(record) => record.extended_seq,
                None => continue,
            };
            if seq == expected_seq {
                ready = Some(i);
                break;
            }
            if seq < expected_seq {
                // Residue behind the delivery point; release the slot
                self.slots[i] = None;
                continue;
            }
            if best.map_or(true, |(_, b)| seq < b) {
                best = Some((i, seq));
            }
        }

        if let Some(i) = ready {
            if let Some(record) = self.slots[i].take() {
                self.head = (i + 1) % self.slots.len();
                return NextPacket::Ready(record);
            }
        }
        if let Some((i, _)) = best {
            let expired = self.slots[i]
                .as_ref()
                .map(|r| now_us.saturating_sub(r.arrival_us) >= self.max_wait_us)
                .unwrap_or(false);
            if expired {
                if let Some(record) = self.slots[i].take() {
                    self.head = (i + 1) % self.slots.len();
                    return NextPacket::TimedOut(record);
                }
            }
        }
        NextPacket::NotReady
    }

    /// Attempt single-loss reconstruction for `missing_seq`
    ///
    /// Succeeds when the group's parity has arrived and every other member
    /// has been folded in: the accumulator then equals the missing payload.
    pub fn try_recover(&mut self, missing_seq: u64, timestamp: u32, now_us: u64) -> Option<PacketRecord> {
        let base = self.group_base(missing_seq)?;
        if missing_seq - base >= u64::from(self.group_size) {
            return None;
        }
        let member_bit = 1u8 << (missing_seq - base);
        let full_mask = ((1u16 << self.group_size) - 1) as u8;

        let group = self.groups.get_mut(&base)?;
        if !group.parity_seen || group.recovered || group.members != full_mask & !member_bit {
            return None;
        }
        group.recovered = true;

        // Trim trailing zero padding left over from shorter members
        let mut payload = group.xor.clone();
        while payload.len() > 1 && payload.last() == Some(&0) {
            payload.pop();
        }

        debug!(seq = missing_seq, "packet rebuilt from FEC parity");
        Some(PacketRecord {
            sequence: (missing_seq & 0xFFFF) as u16,
            extended_seq: missing_seq,
            timestamp,
            arrival_us: now_us,
            payload: Bytes::from(payload),
            is_fec_recovered: true,
        })
    }

    /// Extended sequence of the group boundary covering `seq`
    ///
    /// Boundaries sit where the raw 16-bit sequence is a multiple of the
    /// group size, so the scan is bounded by one group length.
    pub fn group_base(&self, seq: u64) -> Option<u64> {
        let k = u64::from(self.group_size);
        (0..=k).map(|d| seq.checked_sub(d)).flatten().find(|&base| {
            (base & 0xFFFF) % k == 0
        })
    }

    /// Drop group state older than `before_ext`
    pub fn prune_groups(&mut self, before_ext: u64) {
        self.groups.retain(|&base, _| base >= before_ext);
    }

    /// Release every buffered packet (stream teardown)
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.groups.clear();
        self.head = 0;
    }

    fn fold_member(&mut self, record: &PacketRecord) {
        let Some(base) = self.group_base(record.extended_seq) else {
            return;
        };
        let bit_index = record.extended_seq - base;
        if bit_index >= u64::from(self.group_size) {
            return;
        }
        let group = self.groups.entry(base).or_default();
        let bit = 1u8 << bit_index;
        if group.members & bit != 0 {
            return;
        }
        group.fold(&record.payload);
        group.members |= bit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, arrival_us: u64, payload: &[u8]) -> PacketRecord {
        PacketRecord {
            sequence: (seq & 0xFFFF) as u16,
            extended_seq: seq,
            timestamp: (seq * 160) as u32,
            arrival_us,
            payload: Bytes::copy_from_slice(payload),
            is_fec_recovered: false,
        }
    }

    fn buffer() -> ReorderBuffer {
        ReorderBuffer::new(16, 5, MAX_REORDER_WAIT_MS)
    }

    #[test]
    fn test_in_order_pop() {
        let mut b = buffer();
        b.insert(record(100, 0, &[1]));
        b.insert(record(101, 20_000, &[2]));

        assert!(matches!(b.try_pop_next(100, 20_000), NextPacket::Ready(r) if r.extended_seq == 100));
        assert!(matches!(b.try_pop_next(101, 20_000), NextPacket::Ready(r) if r.extended_seq == 101));
        assert!(matches!(b.try_pop_next(102, 20_000), NextPacket::NotReady));
    }

    #[test]
    fn test_gap_waits_for_reorder_bound() {
        let mut b = buffer();
        b.insert(record(101, 0, &[2]));

        // 100 is expected; 101 must sit out the reorder wait first
        assert!(matches!(b.try_pop_next(100, 10_000), NextPacket::NotReady));
        match b.try_pop_next(100, 41_000) {
            NextPacket::TimedOut(r) => assert_eq!(r.extended_seq, 101),
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_detected() {
        let mut b = buffer();
        assert_eq!(b.insert(record(7, 0, &[1])), InsertOutcome::Stored);
        assert_eq!(b.insert(record(7, 5, &[1])), InsertOutcome::Duplicate);
        assert!(b.contains(7));
    }

    #[test]
    fn test_window_overflow() {
        let mut b = ReorderBuffer::new(4, 5, MAX_REORDER_WAIT_MS);
        for seq in 0..4u64 {
            // Residents all fresh at t=0
            assert_eq!(b.insert(record(seq + 10, 0, &[0])), InsertOutcome::Stored);
        }
        // Fresh residents: full
        assert_eq!(b.insert(record(20, 1_000, &[0])), InsertOutcome::Full);
        // Once the oldest has overstayed the wait, it is evicted
        assert_eq!(b.insert(record(21, 50_000, &[0])), InsertOutcome::Stored);
    }

    #[test]
    fn test_group_base_alignment() {
        let b = buffer();
        assert_eq!(b.group_base(500), Some(500));
        assert_eq!(b.group_base(503), Some(500));
        assert_eq!(b.group_base(504), Some(500));
        assert_eq!(b.group_base(505), Some(505));
    }

    #[test]
    fn test_fec_recovery_single_loss() {
        let mut b = buffer();
        let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i + 1; 4]).collect();

        // 502 never arrives
        for seq in [500u64, 501, 503, 504] {
            b.insert(record(seq, seq * 20, &payloads[(seq - 500) as usize]));
        }
        // Parity is the XOR of all five members
        let mut parity = vec![0u8; 4];
        for p in &payloads {
            for (acc, &x) in parity.iter_mut().zip(p) {
                *acc ^= x;
            }
        }
        b.add_parity(500, &parity);

        let rec = b.try_recover(502, 502 * 160, 99_000).expect("recovery");
        assert!(rec.is_fec_recovered);
        assert_eq!(rec.extended_seq, 502);
        assert_eq!(rec.payload.as_ref(), &payloads[2][..]);

        // A group recovers at most once
        assert!(b.try_recover(502, 502 * 160, 99_000).is_none());
    }

    #[test]
    fn test_fec_recovery_needs_parity_and_all_other_members() {
        let mut b = buffer();
        for seq in [500u64, 501, 504] {
            b.insert(record(seq, 0, &[seq as u8]));
        }
        // No parity yet
        assert!(b.try_recover(502, 0, 0).is_none());

        b.add_parity(500, &[0xAA]);
        // Two members missing: cannot attribute the XOR to either
        assert!(b.try_recover(502, 0, 0).is_none());
        assert!(b.try_recover(503, 0, 0).is_none());
    }

    #[test]
    fn test_fec_recovery_pads_to_largest_member() {
        let mut b = buffer();
        b.insert(record(500, 0, &[0x10, 0x20, 0x30]));
        b.insert(record(501, 0, &[0x01]));
        b.insert(record(503, 0, &[0x03]));
        b.insert(record(504, 0, &[0x04]));

        let mut parity = vec![0x10 ^ 0x01 ^ 0x03 ^ 0x04 ^ 0x55, 0x20, 0x30];
        parity[1] ^= 0x00;
        b.add_parity(500, &parity);

        let rec = b.try_recover(502, 0, 0).expect("recovery");
        // 502's payload was [0x55]; zero padding is trimmed
        assert_eq!(rec.payload.as_ref(), &[0x55]);
    }

    #[test]
    fn test_prune_groups() {
        let mut b = buffer();
        b.insert(record(500, 0, &[1]));
        b.prune_groups(600);
        b.add_parity(500, &[0]);
        // Group state restarted after prune; single member + parity is not
        // enough for the 4-of-5 condition
        assert!(b.try_recover(501, 0, 0).is_none());
    }
}
