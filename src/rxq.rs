//! Receive reassembly queue.
//!
//! Orders inbound DATA packets by byte sequence, deduplicates, and commits
//! contiguous prefixes for delivery to the application.

use std::collections::VecDeque;

use bytes::Bytes;

/// One inbound DATA payload, pending reassembly or ready for delivery.
#[derive(Debug, Clone)]
pub struct RxPacket {
    pub seq: u32,
    pub data: Bytes,
}

impl RxPacket {
    fn end(&self) -> u32 {
        self.seq + self.data.len() as u32
    }
}

/// Per-tunnel receive reassembly state.
///
/// `pending` stays sorted by `seq`; `commit` accumulates packets that are
/// ready for the rx dispatcher to hand to the application, in delivery
/// order.
pub struct RxQueue {
    pending: VecDeque<RxPacket>,
    commit: VecDeque<RxPacket>,
    expected_seq: u32,
    max_pkt_num: usize,
}

impl RxQueue {
    pub fn new(max_pkt_num: usize, initial_expected_seq: u32) -> Self {
        RxQueue {
            pending: VecDeque::new(),
            commit: VecDeque::new(),
            expected_seq: initial_expected_seq,
            max_pkt_num,
        }
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    /// Packets buffered but not yet contiguous with `expected_seq`.
    pub fn cur_pkt_num(&self) -> usize {
        self.pending.len()
    }

    pub fn window_remaining(&self) -> u32 {
        (self.max_pkt_num.saturating_sub(self.pending.len())) as u32
    }

    /// Insert an inbound packet. Returns the (possibly unchanged)
    /// `expected_seq`, which is exactly the value to ACK.
    pub fn arrange(&mut self, pkt: RxPacket) -> u32 {
        if pkt.seq < self.expected_seq {
            // Duplicate of already-committed data.
            return self.expected_seq;
        }
        if self.pending.iter().any(|p| p.seq == pkt.seq) {
            // Idempotent under retransmit.
            return self.expected_seq;
        }

        let insert_at = self
            .pending
            .iter()
            .position(|p| p.seq > pkt.seq)
            .unwrap_or(self.pending.len());
        self.pending.insert(insert_at, pkt);

        if self.pending[0].seq == self.expected_seq {
            self.advance();
        }

        self.expected_seq
    }

    fn advance(&mut self) {
        loop {
            let contiguous = match self.pending.front() {
                Some(p) if p.seq == self.expected_seq => true,
                _ => false,
            };
            if !contiguous {
                break;
            }
            let pkt = self.pending.pop_front().unwrap();
            self.expected_seq = pkt.end();
            self.commit.push_back(pkt);
        }
    }

    /// Pop one committed packet, returning whether more remain (a hint to
    /// avoid a spurious re-wait on the rx dispatcher's condition).
    pub fn fetch(&mut self) -> Option<(RxPacket, bool)> {
        let pkt = self.commit.pop_front()?;
        let more = !self.commit.is_empty();
        Some((pkt, more))
    }
}
