use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::error;

/// The unreliable datagram transport underneath the protocol. All egress goes through this
///  trait so the reliability machinery can be exercised against a scripted carrier in tests
///  instead of a live socket.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Carrier: Send + Sync + 'static {
    /// Fire one datagram at the peer. Loss is part of the carrier's contract, so send
    ///  failures are swallowed: an unsent packet and a dropped one look identical to the
    ///  retransmission machinery.
    async fn send_datagram(&self, peer: SocketAddr, datagram: &[u8]);
}

#[async_trait]
impl Carrier for UdpSocket {
    async fn send_datagram(&self, peer: SocketAddr, datagram: &[u8]) {
        if let Err(e) = self.send_to(datagram, peer).await {
            error!("sending {} bytes to {:?} failed: {}", datagram.len(), peer, e);
        }
    }
}
