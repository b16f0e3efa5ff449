//! The per-connection state machine. Transitions are pure functions on the enum so the
//!  connection logic cannot fall through into an unintended state.

use std::fmt::{Display, Formatter};

/// Lifecycle of a connection.
///
/// ```ascii
///              send SYN
/// (client) ──────────────→ SYN_SENT ──recv SYN|ACK──→ ESTABLISHED
///
/// (server)  LISTEN ──recv SYN, send SYN|ACK──→ ESTABLISHED
///
/// ESTABLISHED ──local close, send FIN──→ FIN_WAIT  ──recv FIN──→ TIME_WAIT ──2·RTO──→ CLOSED
/// ESTABLISHED ──recv FIN────────────────→ CLOSE_WAIT ──local close, send FIN──→ LAST_ACK
/// LAST_ACK    ──recv ack of our FIN────→ CLOSED
/// any state   ──retry cap / idle / endpoint teardown──→ CLOSED
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Listen,
    SynSent,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    TimeWait,
    Closed,
}

impl ConnectionState {
    /// handshake not finished yet - application sends must wait
    pub fn is_pre_established(self) -> bool {
        matches!(self, ConnectionState::Listen | ConnectionState::SynSent)
    }

    /// the local side has sent its FIN (or is past the point of sending anything)
    pub fn is_send_closed(self) -> bool {
        matches!(
            self,
            ConnectionState::FinWait
                | ConnectionState::LastAck
                | ConnectionState::TimeWait
                | ConnectionState::Closed
        )
    }

    /// states in which inbound data and FIN packets flow through the receive window
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            ConnectionState::Established | ConnectionState::FinWait | ConnectionState::CloseWait
        )
    }

    /// The state after the application closes its side, or `None` if close is a no-op.
    ///  `Closed` as a result means no FIN handshake is needed (nothing was established).
    pub fn after_local_close(self) -> Option<ConnectionState> {
        match self {
            ConnectionState::Established => Some(ConnectionState::FinWait),
            ConnectionState::CloseWait => Some(ConnectionState::LastAck),
            ConnectionState::Listen | ConnectionState::SynSent => Some(ConnectionState::Closed),
            _ => None,
        }
    }

    /// The state after the peer's FIN is received in order, or `None` if a FIN is not
    ///  meaningful in this state.
    pub fn after_peer_fin(self) -> Option<ConnectionState> {
        match self {
            ConnectionState::Established => Some(ConnectionState::CloseWait),
            ConnectionState::FinWait => Some(ConnectionState::TimeWait),
            _ => None,
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait => "FIN_WAIT",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::LastAck => "LAST_ACK",
            ConnectionState::TimeWait => "TIME_WAIT",
            ConnectionState::Closed => "CLOSED",
        };
        write!(f, "{}", s)
    }
}
