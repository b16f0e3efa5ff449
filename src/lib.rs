//! UDP+ is a reliability layer on top of a single unreliable UDP socket. It gives two peers
//!  TCP-style connections: an ordered, reliable, bidirectional stream of messages with a
//!  three-way handshake at the front and a FIN exchange at the back.
//!
//! ## Design goals
//!
//! * One UDP socket per endpoint carries all connections; an endpoint either listens and
//!   accepts inbound connections or initiates a single outbound one
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data), each
//!   carried in exactly one datagram
//! * Delivery is in-order and exactly-once from the application's point of view: packets have
//!   16-bit sequence numbers and are acknowledged, buffered across gaps, retransmitted on
//!   timeout, and deduplicated on receipt
//! * Duplicate cumulative acks trigger a fast retransmit of the oldest outstanding packet
//!   without waiting for the retransmission timeout
//! * A selective-ack bitmap reports out-of-order receipt so the sender retransmits only the
//!   packets that are actually missing
//! * A peer that stops acknowledging is declared dead after a bounded number of
//!   retransmissions, and an idle connection is reaped after a fixed timeout
//!
//! There is no congestion control beyond fast retransmit, no adaptive timer and no
//!  security layer - the protocol assumes a benign, possibly lossy network.
//!
//! ## Wire format
//!
//! Packet layout - all numbers in network byte order (BE):
//! ```ascii
//! 0:  flags (u8): DATA=0x80, ACK=0x40, SYN=0x20, FIN=0x10, OPT=0x08
//! 1:  header length (u8): 6, or 6 + length of the selective-ack field when OPT is set
//! 2:  sequence number (u16)
//! 4:  acknowledgment number (u16)
//! 6:  selective-ack bitmap (header length - 6 bytes, only when OPT is set)
//! *:  payload (rest of the datagram, starting at 'header length')
//! ```
//!
//! The selective-ack bitmap is LSB-first within each successive byte: bit k covers the
//!  sequence number `ack + k`. A set bit means "received out of order, do not retransmit".
//!
//! Packet kinds by flag combination:
//!
//! | kind | flags |
//! |------|-------|
//! | initial SYN | `SYN` |
//! | SYN-ACK     | `SYN \| ACK` |
//! | pure ack    | `ACK` |
//! | selective ack | `ACK \| OPT` |
//! | data        | `DATA \| ACK` |
//! | FIN         | `FIN \| ACK` |
//!
//! ## Structure
//!
//! [`endpoint::Endpoint`] owns the socket and a fixed-size table of live connections keyed by
//!  peer address. Its listener task is the only reader of the socket; it decodes datagrams and
//!  dispatches them to the owning [`connection::Connection`], or hands a SYN from an unknown
//!  peer to a waiting `accept` call. Each connection runs its own timer task driving
//!  retransmissions, delayed acks and the teardown timeouts.

pub mod carrier;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod packet;
pub mod ring;
pub mod state;
