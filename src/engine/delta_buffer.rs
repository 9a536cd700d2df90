//! Per-source delta sequencing.
//!
//! The transport promises reliable delivery but only best-effort ordering
//! across implementations, so every state blob carries a wrapping u16
//! sequence number and this buffer releases blobs strictly in send order.
//! Until the first full-state blob from a source has been seen, the source
//! has no baseline: incrementals are parked, and whatever predates the
//! full is subsumed by it and dropped.

use crate::{
    engine::delta::{DeltaKind, DeltaPayload},
    types::DeltaIndex,
    wrapping_number::{sequence_greater_than, sequence_less_than},
};

pub(crate) struct DeltaBuffer {
    /// Next sequence number expected; None until a full blob establishes
    /// the baseline.
    next: Option<DeltaIndex>,
    /// Out-of-order arrivals, ascending in wrapping order.
    parked: Vec<(DeltaIndex, DeltaPayload)>,
    capacity: usize,
}

impl DeltaBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            next: None,
            parked: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Accept one decoded blob; returns every blob now ready to apply, in
    /// order. Stale and duplicate blobs return nothing.
    pub fn push(&mut self, payload: DeltaPayload) -> Vec<DeltaPayload> {
        let seq = payload.seq;
        match self.next {
            None => {
                if payload.kind == DeltaKind::Full {
                    let mut ready = vec![payload];
                    self.next = Some(seq.wrapping_add(1));
                    // Everything at or before the full is subsumed by it.
                    self.parked
                        .retain(|(parked_seq, _)| sequence_greater_than(*parked_seq, seq));
                    self.release_consecutive(&mut ready);
                    ready
                } else {
                    self.park(seq, payload);
                    if self.parked.len() > self.capacity {
                        // No baseline yet; the eventual full subsumes these.
                        self.parked.remove(0);
                    }
                    Vec::new()
                }
            }
            Some(next) => {
                if sequence_less_than(seq, next) {
                    // Duplicate or stale delivery.
                    return Vec::new();
                }
                if seq == next {
                    let mut ready = vec![payload];
                    self.next = Some(seq.wrapping_add(1));
                    self.release_consecutive(&mut ready);
                    ready
                } else {
                    self.park(seq, payload);
                    self.skip_on_overflow()
                }
            }
        }
    }

    /// A reliable transport should never leave a hole, but if one ever
    /// appears and the parked backlog exceeds capacity, jump the expected
    /// sequence forward rather than stalling the stream forever.
    fn skip_on_overflow(&mut self) -> Vec<DeltaPayload> {
        if self.parked.len() <= self.capacity {
            return Vec::new();
        }
        let oldest = self.parked[0].0;
        log::warn!(
            "delta buffer overflowed; skipping ahead to sequence {}",
            oldest
        );
        self.next = Some(oldest);
        let mut ready = Vec::new();
        self.release_consecutive(&mut ready);
        ready
    }

    fn release_consecutive(&mut self, ready: &mut Vec<DeltaPayload>) {
        while let Some(next) = self.next {
            match self.parked.first() {
                Some((seq, _)) if *seq == next => {
                    let (_, payload) = self.parked.remove(0);
                    self.next = Some(next.wrapping_add(1));
                    ready.push(payload);
                }
                _ => return,
            }
        }
    }

    /// Insert in ascending wrapping order, scanning from the back; drops
    /// duplicates.
    fn park(&mut self, seq: DeltaIndex, payload: DeltaPayload) {
        let mut index = self.parked.len();
        loop {
            if index == 0 {
                self.parked.insert(0, (seq, payload));
                return;
            }
            index -= 1;
            let (parked_seq, _) = &self.parked[index];
            if *parked_seq == seq {
                return;
            }
            if sequence_less_than(*parked_seq, seq) {
                self.parked.insert(index + 1, (seq, payload));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DeltaBuffer;
    use crate::engine::delta::{DeltaKind, DeltaPayload};

    fn full(seq: u16) -> DeltaPayload {
        DeltaPayload::new(DeltaKind::Full, seq)
    }

    fn incr(seq: u16) -> DeltaPayload {
        DeltaPayload::new(DeltaKind::Incremental, seq)
    }

    fn seqs(payloads: &[DeltaPayload]) -> Vec<u16> {
        payloads.iter().map(|p| p.seq).collect()
    }

    #[test]
    fn incrementals_park_until_full_arrives() {
        let mut buffer = DeltaBuffer::new(8);
        assert!(buffer.push(incr(5)).is_empty());
        assert!(buffer.push(incr(6)).is_empty());

        // The full at 5 subsumes the parked 5 and releases 6.
        let ready = buffer.push(full(5));
        assert_eq!(seqs(&ready), vec![5, 6]);
    }

    #[test]
    fn in_order_stream_flows_through() {
        let mut buffer = DeltaBuffer::new(8);
        assert_eq!(seqs(&buffer.push(full(0))), vec![0]);
        assert_eq!(seqs(&buffer.push(incr(1))), vec![1]);
        assert_eq!(seqs(&buffer.push(incr(2))), vec![2]);
    }

    #[test]
    fn out_of_order_arrivals_are_reordered() {
        let mut buffer = DeltaBuffer::new(8);
        buffer.push(full(0));
        assert!(buffer.push(incr(3)).is_empty());
        assert!(buffer.push(incr(2)).is_empty());
        assert_eq!(seqs(&buffer.push(incr(1))), vec![1, 2, 3]);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut buffer = DeltaBuffer::new(8);
        buffer.push(full(0));
        assert_eq!(seqs(&buffer.push(incr(1))), vec![1]);
        assert!(buffer.push(incr(1)).is_empty());
        assert!(buffer.push(full(0)).is_empty());
    }

    #[test]
    fn ordering_survives_sequence_wrap() {
        let mut buffer = DeltaBuffer::new(8);
        buffer.push(full(u16::MAX - 1));
        assert_eq!(seqs(&buffer.push(incr(u16::MAX))), vec![u16::MAX]);
        assert!(buffer.push(incr(1)).is_empty());
        assert_eq!(seqs(&buffer.push(incr(0))), vec![0, 1]);
    }

    #[test]
    fn overflow_skips_ahead_instead_of_stalling() {
        let mut buffer = DeltaBuffer::new(2);
        buffer.push(full(0));
        assert!(buffer.push(incr(2)).is_empty());
        assert!(buffer.push(incr(3)).is_empty());
        // Third parked blob exceeds capacity: expected sequence jumps to
        // the oldest parked entry and the run releases.
        assert_eq!(seqs(&buffer.push(incr(4))), vec![2, 3, 4]);
        // The skipped blob (1) is now stale.
        assert!(buffer.push(incr(1)).is_empty());
    }
}
