//! Fixed-capacity wrap-around buffers for the two directions of a connection.
//!
//! Both rings are anchored at a head sequence number: slot offset k of the send ring holds
//!  the packet with sequence `head_seq + k`, slot offset k of the receive ring holds the
//!  packet with sequence `expected + k` where `expected` is the next sequence number to be
//!  handed to the application. Because the total of outstanding sends plus outstanding
//!  receives never exceeds the ring capacity, modular offsets are unambiguous.

use crate::packet::{flags, SeqNr};
use tokio::time::Instant;

/// `num_ack` sentinel: the peer reported this packet as received out of order, so it is
///  exempt from selective-ack retransmission until the window moves.
pub const SACKED: i32 = -1;

/// A buffered outbound packet plus its retransmission bookkeeping.
///
/// `num_ack` does double duty, as on the wire protocol side there is only one counter per
///  packet: on the head of the ring it counts duplicate cumulative acks (fast retransmit),
///  on later slots it counts selective-ack rounds that reported the packet as missing,
///  with [`SACKED`] marking it as held by the peer.
pub struct OutPacket {
    pub flags: u8,
    pub seq: SeqNr,
    pub payload: Vec<u8>,
    pub send_time: Instant,
    pub send_count: u32,
    pub num_ack: i32,
}

impl OutPacket {
    pub fn new(flags: u8, seq: SeqNr, payload: Vec<u8>) -> OutPacket {
        OutPacket {
            flags,
            seq,
            payload,
            send_time: Instant::now(),
            send_count: 0,
            num_ack: 0,
        }
    }
}

/// Outbound window: head = oldest unacknowledged packet.
pub struct SendRing {
    slots: Vec<Option<OutPacket>>,
    head_idx: usize,
    head_seq: SeqNr,
    len: usize,
}

impl SendRing {
    pub fn new(capacity: usize, initial_seq: SeqNr) -> SendRing {
        assert!(capacity > 0);
        SendRing {
            slots: (0..capacity).map(|_| None).collect(),
            head_idx: 0,
            head_seq: initial_seq,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn head_seq(&self) -> SeqNr {
        self.head_seq
    }

    /// the sequence number one past the newest buffered packet
    pub fn next_seq(&self) -> SeqNr {
        self.head_seq.plus(self.len as u16)
    }

    /// Append a packet; its sequence number must be the next in line. Returns the packet's
    ///  ring offset (distance from the head).
    pub fn push(&mut self, packet: OutPacket) -> u16 {
        assert!(!self.is_full());
        assert_eq!(packet.seq, self.next_seq());

        let offset = self.len;
        let idx = (self.head_idx + offset) % self.capacity();
        self.slots[idx] = Some(packet);
        self.len += 1;
        offset as u16
    }

    pub fn get(&self, offset: u16) -> Option<&OutPacket> {
        if offset as usize >= self.len {
            return None;
        }
        let idx = (self.head_idx + offset as usize) % self.capacity();
        self.slots[idx].as_ref()
    }

    pub fn get_mut(&mut self, offset: u16) -> Option<&mut OutPacket> {
        if offset as usize >= self.len {
            return None;
        }
        let capacity = self.capacity();
        let idx = (self.head_idx + offset as usize) % capacity;
        self.slots[idx].as_mut()
    }

    pub fn head_mut(&mut self) -> Option<&mut OutPacket> {
        self.get_mut(0)
    }

    /// true iff `ack` acknowledges a (possibly empty, possibly complete) prefix of the
    ///  outstanding window
    pub fn is_ackable(&self, ack: SeqNr) -> bool {
        (ack.offset_from(self.head_seq) as usize) <= self.len
    }

    /// Drop all packets with sequence number strictly below `ack`; returns how many were
    ///  released. `ack` must be ackable.
    pub fn release_below(&mut self, ack: SeqNr) -> usize {
        let n = (ack.offset_from(self.head_seq) as usize).min(self.len);
        for _ in 0..n {
            self.slots[self.head_idx] = None;
            self.head_idx = (self.head_idx + 1) % self.capacity();
            self.len -= 1;
        }
        self.head_seq = self.head_seq.plus(n as u16);
        n
    }
}

/// A buffered inbound packet. Only the flags that survive reassembly matter here.
pub struct InPacket {
    pub flags: u8,
    pub seq: SeqNr,
    pub payload: Vec<u8>,
}

impl InPacket {
    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN == flags::FIN
    }
}

/// Inbound window: slot offset 0 is always the next sequence number expected in order.
pub struct RecvRing {
    slots: Vec<Option<InPacket>>,
    head_idx: usize,
    /// highest occupied offset, if any
    highest_offset: Option<u16>,
}

impl RecvRing {
    pub fn new(capacity: usize) -> RecvRing {
        assert!(capacity > 0);
        RecvRing {
            slots: (0..capacity).map(|_| None).collect(),
            head_idx: 0,
            highest_offset: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Store a packet at the given offset from the expected sequence number, displacing a
    ///  duplicate if one is already there.
    pub fn insert(&mut self, offset: u16, packet: InPacket) {
        assert!((offset as usize) < self.capacity());
        let idx = (self.head_idx + offset as usize) % self.capacity();
        self.slots[idx] = Some(packet);
        self.highest_offset = Some(match self.highest_offset {
            Some(h) => h.max(offset),
            None => offset,
        });
    }

    /// Remove and return the packet at offset 0 if it has arrived; all other offsets shift
    ///  down by one.
    pub fn pop_head(&mut self) -> Option<InPacket> {
        let popped = self.slots[self.head_idx].take()?;
        self.head_idx = (self.head_idx + 1) % self.capacity();
        self.highest_offset = match self.highest_offset {
            Some(0) | None => None,
            Some(h) => Some(h - 1),
        };
        Some(popped)
    }

    /// true iff packets are buffered beyond a gap (offset 0 is empty but something higher
    ///  is occupied)
    pub fn has_hole(&self) -> bool {
        self.highest_offset.is_some() && self.slots[self.head_idx].is_none()
    }

    /// The selective-ack bitmap over the buffered window, LSB-first within each byte:
    ///  bit k is set iff the packet at offset k has arrived. Empty when nothing is buffered.
    pub fn sack_bitmap(&self) -> Vec<u8> {
        let highest = match self.highest_offset {
            Some(h) => h,
            None => return Vec::new(),
        };

        let mut bitmap = vec![0u8; highest as usize / 8 + 1];
        for offset in 0..=highest {
            let idx = (self.head_idx + offset as usize) % self.capacity();
            if self.slots[idx].is_some() {
                bitmap[offset as usize / 8] |= 1 << (offset % 8);
            }
        }
        bitmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn out_packet(seq: u16) -> OutPacket {
        OutPacket::new(flags::DATA | flags::ACK, SeqNr::from_raw(seq), vec![seq as u8])
    }

    fn in_packet(seq: u16) -> InPacket {
        InPacket {
            flags: flags::DATA | flags::ACK,
            seq: SeqNr::from_raw(seq),
            payload: vec![seq as u8],
        }
    }

    #[rstest]
    #[case::from_zero(0)]
    #[case::mid_range(1000)]
    #[case::across_wrap(65533)]
    fn test_send_ring_push_release(#[case] initial: u16) {
        let mut ring = SendRing::new(8, SeqNr::from_raw(initial));
        assert!(ring.is_empty());
        assert_eq!(ring.next_seq(), SeqNr::from_raw(initial));

        for i in 0..8u16 {
            let offset = ring.push(out_packet(initial.wrapping_add(i)));
            assert_eq!(offset, i);
        }
        assert!(ring.is_full());
        assert_eq!(ring.head_seq(), SeqNr::from_raw(initial));
        assert_eq!(ring.next_seq(), SeqNr::from_raw(initial.wrapping_add(8)));

        // partial ack of the first three
        let ack = SeqNr::from_raw(initial.wrapping_add(3));
        assert!(ring.is_ackable(ack));
        assert_eq!(ring.release_below(ack), 3);
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.head_seq(), ack);
        assert_eq!(ring.head_mut().unwrap().seq, ack);

        // freed capacity is reusable across the wrap boundary
        for i in 8..11u16 {
            ring.push(out_packet(initial.wrapping_add(i)));
        }
        assert!(ring.is_full());

        // cumulative ack of everything
        let all = SeqNr::from_raw(initial.wrapping_add(11));
        assert_eq!(ring.release_below(all), 8);
        assert!(ring.is_empty());
        assert_eq!(ring.next_seq(), all);
    }

    #[rstest]
    #[case::below_head(5, 3, false)]
    #[case::at_head(5, 5, true)]
    #[case::inside(5, 7, true)]
    #[case::all(5, 9, true)]
    #[case::beyond(5, 10, false)]
    fn test_send_ring_is_ackable(#[case] head: u16, #[case] ack: u16, #[case] expected: bool) {
        let mut ring = SendRing::new(8, SeqNr::from_raw(head));
        for i in 0..4 {
            ring.push(out_packet(head + i));
        }
        assert_eq!(ring.is_ackable(SeqNr::from_raw(ack)), expected);
    }

    #[test]
    fn test_send_ring_get_by_offset() {
        let mut ring = SendRing::new(4, SeqNr::from_raw(65534));
        for i in 0..4u16 {
            ring.push(out_packet(65534u16.wrapping_add(i)));
        }
        assert_eq!(ring.get(0).unwrap().seq, SeqNr::from_raw(65534));
        assert_eq!(ring.get(1).unwrap().seq, SeqNr::from_raw(65535));
        assert_eq!(ring.get(2).unwrap().seq, SeqNr::from_raw(0));
        assert_eq!(ring.get(3).unwrap().seq, SeqNr::from_raw(1));
        assert!(ring.get(4).is_none());
    }

    #[test]
    fn test_recv_ring_in_order() {
        let mut ring = RecvRing::new(4);
        assert!(ring.pop_head().is_none());
        assert!(!ring.has_hole());

        ring.insert(0, in_packet(9));
        assert!(!ring.has_hole());
        assert_eq!(ring.pop_head().unwrap().seq, SeqNr::from_raw(9));
        assert!(ring.pop_head().is_none());
        assert!(ring.sack_bitmap().is_empty());
    }

    #[test]
    fn test_recv_ring_gap_and_fill() {
        let mut ring = RecvRing::new(8);

        // sequences 10..14 with 11 missing: offsets 1 is the hole
        ring.insert(0, in_packet(10));
        ring.insert(2, in_packet(12));
        ring.insert(3, in_packet(13));

        assert_eq!(ring.pop_head().unwrap().seq, SeqNr::from_raw(10));
        assert!(ring.pop_head().is_none());
        assert!(ring.has_hole());
        // after absorbing 10, offsets shifted: hole at 0, held packets at 1 and 2
        assert_eq!(ring.sack_bitmap(), vec![0b110]);

        ring.insert(0, in_packet(11));
        assert!(!ring.has_hole());
        assert_eq!(ring.pop_head().unwrap().seq, SeqNr::from_raw(11));
        assert_eq!(ring.pop_head().unwrap().seq, SeqNr::from_raw(12));
        assert_eq!(ring.pop_head().unwrap().seq, SeqNr::from_raw(13));
        assert!(ring.pop_head().is_none());
        assert!(ring.sack_bitmap().is_empty());
    }

    #[test]
    fn test_recv_ring_duplicate_is_displaced() {
        let mut ring = RecvRing::new(4);
        ring.insert(1, in_packet(21));
        ring.insert(1, in_packet(21));
        ring.insert(0, in_packet(20));

        assert_eq!(ring.pop_head().unwrap().seq, SeqNr::from_raw(20));
        assert_eq!(ring.pop_head().unwrap().seq, SeqNr::from_raw(21));
        assert!(ring.pop_head().is_none());
    }

    #[test]
    fn test_recv_ring_bitmap_spans_bytes() {
        let mut ring = RecvRing::new(16);
        for offset in [1u16, 3, 8, 9] {
            ring.insert(offset, in_packet(offset));
        }
        assert_eq!(ring.sack_bitmap(), vec![0b0000_1010, 0b0000_0011]);
    }

    #[test]
    fn test_recv_ring_wraps_internally() {
        let mut ring = RecvRing::new(3);
        for round in 0u16..7 {
            ring.insert(0, in_packet(round));
            assert_eq!(ring.pop_head().unwrap().seq, SeqNr::from_raw(round));
        }
    }
}
