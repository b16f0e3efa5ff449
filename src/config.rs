use anyhow::bail;
use std::time::Duration;

/// Tuning knobs for an endpoint and its connections.
pub struct UdpPlusConfig {
    /// Number of connection slots. The listener drops SYNs from new peers once all slots
    ///  are in use; a slot is freed when its connection is fully closed.
    pub max_connections: usize,

    /// Capacity of the per-connection send and receive windows, in packets. This bounds the
    ///  number of unacknowledged sends and of buffered out-of-order receives.
    ///
    /// Must stay well below half the 16-bit sequence space so ring offsets remain
    ///  unambiguous across wrap-around.
    pub ring_capacity: usize,

    /// This is the datagram size UDP+ assumes the carrier supports end to end. Packets are
    ///  never fragmented by this protocol, so a payload may be at most this minus the 6-byte
    ///  header.
    ///
    /// With full Ethernet frames and no optional IP headers this is `1500 - 20 - 8 = 1472`
    ///  for IPv4. Choosing it too big causes datagrams to be dropped by the network;
    ///  choosing it too small wastes bandwidth.
    pub max_datagram_size: usize,

    /// Fixed retransmission timeout. Also paces delayed acks: an ack is emitted at most one
    ///  RTO after the data it covers.
    pub retransmit_timeout: Duration,

    /// How many times a single packet may be retransmitted before the peer is declared dead
    ///  and the connection transitions to CLOSED.
    pub max_retransmissions: u32,

    /// A connection with no inbound packets and no application sends for this long is
    ///  considered dead.
    pub idle_timeout: Duration,

    /// Pins the initial sequence number of every connection for reproducible tests.
    ///  Production endpoints leave this `None` and draw ISNs from a per-endpoint RNG.
    pub initial_seq_nr: Option<u16>,
}

impl UdpPlusConfig {
    pub fn default_ipv4() -> UdpPlusConfig {
        UdpPlusConfig {
            max_connections: 10,
            ring_capacity: 1024,
            max_datagram_size: 1472,
            retransmit_timeout: Duration::from_secs(1),
            max_retransmissions: 10,
            idle_timeout: Duration::from_secs(180),
            initial_seq_nr: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            bail!("an endpoint needs at least one connection slot");
        }
        if self.ring_capacity == 0 {
            bail!("ring capacity must be positive");
        }
        if self.ring_capacity > u16::MAX as usize / 2 {
            bail!(
                "ring capacity {} is too large for unambiguous 16-bit sequence arithmetic",
                self.ring_capacity
            );
        }
        if self.max_datagram_size <= crate::packet::FIXED_HEADER_LEN {
            bail!("max datagram size must leave room for a payload after the header");
        }
        if self.retransmit_timeout.is_zero() {
            bail!("retransmission timeout must be positive");
        }
        Ok(())
    }

    /// largest payload that fits a single datagram
    pub fn max_payload_len(&self) -> usize {
        self.max_datagram_size - crate::packet::FIXED_HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(UdpPlusConfig::default_ipv4().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_degenerate_configs() {
        let mut config = UdpPlusConfig::default_ipv4();
        config.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = UdpPlusConfig::default_ipv4();
        config.ring_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = UdpPlusConfig::default_ipv4();
        config.ring_capacity = 40_000;
        assert!(config.validate().is_err());

        let mut config = UdpPlusConfig::default_ipv4();
        config.max_datagram_size = 6;
        assert!(config.validate().is_err());
    }
}
