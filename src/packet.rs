//! Wire codec: everything that goes onto or comes off a datagram lives here. No I/O.

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use std::fmt::{Display, Formatter};

/// Flag bits of the first header byte. A flag combination is considered set only if *all* its
///  bits are present (see [`Packet::has`]).
pub mod flags {
    pub const DATA: u8 = 0x80;
    pub const ACK: u8 = 0x40;
    pub const SYN: u8 = 0x20;
    pub const FIN: u8 = 0x10;
    pub const OPT: u8 = 0x08;
}

/// Header size without the optional selective-ack field.
pub const FIXED_HEADER_LEN: usize = 6;

/// A sequence (or acknowledgment) number in the modulo-2^16 space.
///
/// There is no `Ord` on purpose: absolute comparisons are meaningless in a wrap-around space.
///  All window logic goes through [`SeqNr::offset_from`] against the window anchor.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNr(u16);

impl SeqNr {
    pub const ZERO: SeqNr = SeqNr(0);

    pub fn from_raw(value: u16) -> SeqNr {
        SeqNr(value)
    }

    pub fn to_raw(self) -> u16 {
        self.0
    }

    pub fn next(self) -> SeqNr {
        SeqNr(self.0.wrapping_add(1))
    }

    pub fn plus(self, n: u16) -> SeqNr {
        SeqNr(self.0.wrapping_add(n))
    }

    /// modular distance from `base` up to `self`, i.e. the ring offset of `self` in a window
    ///  anchored at `base`
    pub fn offset_from(self, base: SeqNr) -> u16 {
        self.0.wrapping_sub(base.0)
    }
}

impl Display for SeqNr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded (or to-be-encoded) protocol packet.
///
/// `sack` is the selective-ack bitmap and is only on the wire when [`flags::OPT`] is set;
///  `payload` is the application data starting after the header.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Packet {
    pub flags: u8,
    pub seq: SeqNr,
    pub ack: SeqNr,
    pub sack: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(flags: u8, seq: SeqNr, ack: SeqNr) -> Packet {
        Packet {
            flags,
            seq,
            ack,
            sack: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// true iff *all* bits of `flags` are set - `has(SYN | ACK)` matches a SYN-ACK but
    ///  neither a plain SYN nor a plain ack
    pub fn has(&self, flags: u8) -> bool {
        self.flags & flags == flags
    }

    pub fn header_len(&self) -> usize {
        if self.has(flags::OPT) {
            FIXED_HEADER_LEN + self.sack.len()
        }
        else {
            FIXED_HEADER_LEN
        }
    }

    pub fn wire_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(self.header_len() <= u8::MAX as usize);
        debug_assert!(!self.has(flags::OPT) || !self.sack.is_empty());

        buf.put_u8(self.flags);
        buf.put_u8(self.header_len() as u8);
        buf.put_u16(self.seq.to_raw());
        buf.put_u16(self.ack.to_raw());
        if self.has(flags::OPT) {
            buf.put_slice(&self.sack);
        }
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.ser(&mut buf);
        buf
    }

    /// Decode a raw datagram. This fails only for datagrams shorter than the fixed header;
    ///  a declared header length pointing past the end of the buffer yields a packet with
    ///  empty selective-ack field and empty payload.
    pub fn deser(raw: &[u8]) -> anyhow::Result<Packet> {
        let mut buf = raw;
        let flags = buf.try_get_u8()?;
        let header_len = buf.try_get_u8()? as usize;
        let seq = SeqNr::from_raw(buf.try_get_u16()?);
        let ack = SeqNr::from_raw(buf.try_get_u16()?);

        // a header length below the fixed minimum is nonsensical; the fixed fields are
        //  decoded anyway, so treat the payload as starting right after them
        let header_len = header_len.max(FIXED_HEADER_LEN);

        let (sack, payload) = if header_len > raw.len() {
            (Vec::new(), Vec::new())
        }
        else {
            let sack = if flags & flags::OPT == flags::OPT {
                raw[FIXED_HEADER_LEN..header_len].to_vec()
            }
            else {
                Vec::new()
            };
            (sack, raw[header_len..].to_vec())
        };

        Ok(Packet {
            flags,
            seq,
            ack,
            sack,
            payload,
        })
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut sep = "";
        for (bit, name) in [
            (flags::DATA, "DATA"),
            (flags::ACK, "ACK"),
            (flags::SYN, "SYN"),
            (flags::FIN, "FIN"),
            (flags::OPT, "OPT"),
        ] {
            if self.flags & bit == bit {
                write!(f, "{}{}", sep, name)?;
                sep = "|";
            }
        }
        write!(f, "(seq={}, ack={}, len={})", self.seq, self.ack, self.payload.len())
    }
}

pub fn assert_payload_fits(payload_len: usize, max_datagram_size: usize) -> anyhow::Result<()> {
    if FIXED_HEADER_LEN + payload_len > max_datagram_size {
        bail!(
            "payload of {} bytes does not fit a datagram of at most {} bytes",
            payload_len,
            max_datagram_size
        );
    }
    Ok(())
}
