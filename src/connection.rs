//! The per-peer reliability engine: handshake, sliding windows, acknowledgment processing,
//!  retransmission, and the application-facing send / receive / close API.
//!
//! All mutable state lives in a single [`ConnectionInner`] behind one async mutex; the
//!  listener task, the timer task and application callers all serialize on it, so state
//!  machine transitions never race. A dedicated timer task per connection drives
//!  retransmissions, delayed acks and the teardown timeouts.

use crate::carrier::Carrier;
use crate::config::UdpPlusConfig;
use crate::endpoint::Endpoint;
use crate::packet::{self, flags, Packet, SeqNr};
use crate::ring::{InPacket, OutPacket, RecvRing, SendRing, SACKED};
use crate::state::ConnectionState;
use anyhow::bail;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

/// number of duplicate cumulative acks that trigger a fast retransmit of the head packet
const FAST_RETRANSMIT_THRESHOLD: i32 = 3;

/// number of selective-ack rounds reporting a packet as missing before it is resent
const SACK_RETRANSMIT_THRESHOLD: i32 = 3;

pub struct Connection {
    peer_addr: SocketAddr,
    config: Arc<UdpPlusConfig>,
    carrier: Arc<dyn Carrier>,
    endpoint: Weak<Endpoint>,
    inner: Mutex<ConnectionInner>,
    /// woken when the handshake completes, ring space frees up, or the connection dies
    send_cond: Notify,
    /// nudges the timer task into recomputing its deadline
    timer_cond: Arc<Notify>,
    delivery_rx: Mutex<UnboundedReceiver<Vec<u8>>>,
    timer_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct ConnectionInner {
    state: ConnectionState,
    out_ring: SendRing,
    in_ring: RecvRing,
    /// next sequence number expected from the peer == sequence of the next packet to be
    ///  handed to the application (the cumulative ack we advertise)
    new_ack_nr: SeqNr,
    /// last acknowledgment number observed from the peer
    last_ack_recv: SeqNr,
    /// sequence number of the peer's FIN once it has been absorbed in order
    peer_fin_seq: Option<SeqNr>,
    /// a delayed ack is pending since this instant
    ack_pending_since: Option<Instant>,
    time_wait_deadline: Option<Instant>,
    /// last inbound packet or application send; the idle reaper keys off this
    last_activity: Instant,
    delivery_tx: Option<UnboundedSender<Vec<u8>>>,
}

enum TimerVerdict {
    Sleep(Instant),
    Exit,
}

impl Connection {
    fn create(
        endpoint: Weak<Endpoint>,
        config: Arc<UdpPlusConfig>,
        carrier: Arc<dyn Carrier>,
        peer_addr: SocketAddr,
        initial_state: ConnectionState,
        isn: SeqNr,
    ) -> Arc<Connection> {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let inner = ConnectionInner {
            state: initial_state,
            out_ring: SendRing::new(config.ring_capacity, isn),
            in_ring: RecvRing::new(config.ring_capacity),
            new_ack_nr: SeqNr::ZERO,
            last_ack_recv: isn,
            peer_fin_seq: None,
            ack_pending_since: None,
            time_wait_deadline: None,
            last_activity: Instant::now(),
            delivery_tx: Some(delivery_tx),
        };

        let conn = Arc::new(Connection {
            peer_addr,
            config,
            carrier,
            endpoint,
            inner: Mutex::new(inner),
            send_cond: Notify::new(),
            timer_cond: Arc::new(Notify::new()),
            delivery_rx: Mutex::new(delivery_rx),
            timer_handle: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(Self::timer_loop(
            Arc::downgrade(&conn),
            conn.timer_cond.clone(),
        ));
        *conn.timer_handle.lock().unwrap() = Some(handle);

        conn
    }

    /// Client-role connection: starts in SYN_SENT. The caller registers it with the
    ///  endpoint's table and then kicks off the handshake via [`Connection::start_handshake`].
    pub(crate) fn client(
        endpoint: Weak<Endpoint>,
        config: Arc<UdpPlusConfig>,
        carrier: Arc<dyn Carrier>,
        peer_addr: SocketAddr,
        isn: SeqNr,
    ) -> Arc<Connection> {
        Self::create(
            endpoint,
            config,
            carrier,
            peer_addr,
            ConnectionState::SynSent,
            isn,
        )
    }

    /// Queue and emit the initial SYN.
    pub(crate) async fn start_handshake(&self) {
        {
            let mut inner = self.inner.lock().await;
            let seq = inner.out_ring.next_seq();
            let offset = inner.out_ring.push(OutPacket::new(flags::SYN, seq, Vec::new()));
            debug!("initiating handshake with {:?}, ISN {}", self.peer_addr, seq);
            self.send_ring_packet(&mut inner, offset).await;
        }
        self.timer_cond.notify_waiters();
    }

    /// Server-role connection: starts in LISTEN; the caller feeds it the SYN that created it
    ///  via [`Connection::handle_packet`].
    pub(crate) fn server(
        endpoint: Weak<Endpoint>,
        config: Arc<UdpPlusConfig>,
        carrier: Arc<dyn Carrier>,
        peer_addr: SocketAddr,
        isn: SeqNr,
    ) -> Arc<Connection> {
        Self::create(
            endpoint,
            config,
            carrier,
            peer_addr,
            ConnectionState::Listen,
            isn,
        )
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Send one message to the peer, blocking while the handshake is incomplete or the send
    ///  window is full. Fails once the local side is closing or the connection is dead.
    pub async fn send(&self, message: &[u8]) -> anyhow::Result<()> {
        packet::assert_payload_fits(message.len(), self.config.max_datagram_size)?;

        loop {
            let notified = self.send_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;

                if inner.state.is_send_closed() {
                    bail!("connection to {} is {}", self.peer_addr, inner.state);
                }
                if !inner.state.is_pre_established() && !inner.out_ring.is_full() {
                    let seq = inner.out_ring.next_seq();
                    let offset = inner.out_ring.push(OutPacket::new(
                        flags::DATA | flags::ACK,
                        seq,
                        message.to_vec(),
                    ));
                    inner.last_activity = Instant::now();
                    let first_outstanding = inner.out_ring.len() == 1;

                    trace!("queueing packet #{} with {} payload bytes for {:?}", seq, message.len(), self.peer_addr);
                    self.send_ring_packet(&mut inner, offset).await;

                    if first_outstanding {
                        self.timer_cond.notify_waiters();
                    }
                    return Ok(());
                }

                trace!("send to {:?} waiting ({} outstanding, state {})", self.peer_addr, inner.out_ring.len(), inner.state);
            }

            notified.await;
        }
    }

    /// Receive the next message in order. `None` means end of stream: the peer closed, the
    ///  connection timed out, or the endpoint was torn down - after all previously received
    ///  messages have been drained.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.delivery_rx.lock().await.recv().await
    }

    /// Initiate a graceful shutdown of the local side. Queued sends are still delivered and
    ///  retransmitted; inbound data can still be received until the peer closes too.
    pub async fn close(&self) {
        loop {
            let notified = self.send_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;

                let next = match inner.state.after_local_close() {
                    Some(next) => next,
                    None => return,
                };
                if next == ConnectionState::Closed {
                    self.transition_to_closed(&mut inner, "closed before establishment");
                    return;
                }
                if !inner.out_ring.is_full() {
                    let seq = inner.out_ring.next_seq();
                    let offset = inner.out_ring.push(OutPacket::new(
                        flags::FIN | flags::ACK,
                        seq,
                        Vec::new(),
                    ));
                    inner.state = next;
                    debug!("closing connection to {:?}: sent FIN #{}, now {}", self.peer_addr, seq, next);
                    self.send_ring_packet(&mut inner, offset).await;
                    self.timer_cond.notify_waiters();
                    return;
                }
            }

            notified.await;
        }
    }

    /// Immediate teardown without a FIN exchange, for endpoint shutdown.
    pub(crate) async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        self.transition_to_closed(&mut inner, "endpoint shut down");
    }

    /// Entry point for the endpoint's listener: one decoded inbound packet.
    pub(crate) async fn handle_packet(&self, pkt: Packet) {
        let mut inner = self.inner.lock().await;
        inner.last_activity = Instant::now();

        trace!("received {} from {:?} in state {}", pkt, self.peer_addr, inner.state);

        match inner.state {
            ConnectionState::Listen => self.handle_packet_listen(&mut inner, pkt).await,
            ConnectionState::SynSent => self.handle_packet_syn_sent(&mut inner, pkt).await,
            ConnectionState::Established
            | ConnectionState::FinWait
            | ConnectionState::CloseWait => self.handle_packet_streaming(&mut inner, pkt).await,
            ConnectionState::LastAck => {
                if pkt.has(flags::ACK) {
                    self.process_ack(&mut inner, &pkt).await;
                }
                if inner.out_ring.is_empty() {
                    self.transition_to_closed(&mut inner, "FIN acknowledged");
                }
                else if pkt.has(flags::FIN) {
                    // the peer retransmitted its FIN - our ack of it was lost
                    self.emit_ack(&mut inner).await;
                }
            }
            ConnectionState::TimeWait => {
                if pkt.has(flags::ACK) {
                    // the peer may still be acking our FIN; releasing it stops the timer
                    //  from retransmitting an already delivered packet
                    self.process_ack(&mut inner, &pkt).await;
                }
                if pkt.has(flags::FIN) {
                    // our final ack was lost; re-ack so the peer can leave LAST_ACK
                    self.emit_ack(&mut inner).await;
                }
            }
            ConnectionState::Closed => {
                trace!("dropping packet for closed connection to {:?}", self.peer_addr);
            }
        }
    }

    async fn handle_packet_listen(&self, inner: &mut ConnectionInner, pkt: Packet) {
        if !pkt.has(flags::SYN) || pkt.has(flags::ACK) {
            debug!("expected initial SYN from {:?}, got {} - dropping", self.peer_addr, pkt);
            return;
        }

        inner.new_ack_nr = pkt.seq.next();

        let seq = inner.out_ring.next_seq();
        let offset = inner
            .out_ring
            .push(OutPacket::new(flags::SYN | flags::ACK, seq, Vec::new()));
        inner.state = ConnectionState::Established;
        debug!("accepted handshake from {:?}: SYN|ACK #{} acking {}", self.peer_addr, seq, inner.new_ack_nr);

        self.send_ring_packet(inner, offset).await;
        self.send_cond.notify_waiters();
        self.timer_cond.notify_waiters();
    }

    async fn handle_packet_syn_sent(&self, inner: &mut ConnectionInner, pkt: Packet) {
        if !pkt.has(flags::SYN | flags::ACK) {
            debug!("expected SYN|ACK from {:?}, got {} - dropping", self.peer_addr, pkt);
            return;
        }
        if pkt.ack != inner.out_ring.next_seq() {
            debug!("SYN|ACK from {:?} acks {} instead of {} - dropping", self.peer_addr, pkt.ack, inner.out_ring.next_seq());
            return;
        }

        inner.out_ring.release_below(pkt.ack);
        inner.last_ack_recv = pkt.ack;
        inner.new_ack_nr = pkt.seq.next();
        inner.state = ConnectionState::Established;
        debug!("handshake with {:?} complete", self.peer_addr);

        self.emit_ack(inner).await;
        self.send_cond.notify_waiters();
    }

    async fn handle_packet_streaming(&self, inner: &mut ConnectionInner, pkt: Packet) {
        if pkt.has(flags::SYN) {
            // a retransmitted handshake packet - our reply was lost
            self.emit_ack(inner).await;
            return;
        }

        if pkt.has(flags::ACK) {
            self.process_ack(inner, &pkt).await;
        }
        if pkt.has(flags::DATA) || pkt.has(flags::FIN) {
            self.process_data(inner, pkt).await;
        }
    }

    /// Cumulative-ack handling: release acknowledged packets, count duplicates for fast
    ///  retransmit, then apply the selective-ack bitmap if one is attached.
    async fn process_ack(&self, inner: &mut ConnectionInner, pkt: &Packet) {
        let a = pkt.ack;

        if a == inner.out_ring.next_seq() && !inner.out_ring.is_empty() {
            let released = inner.out_ring.release_below(a);
            inner.last_ack_recv = a;
            trace!("ack {} from {:?} clears all {} outstanding packets", a, self.peer_addr, released);
            self.send_cond.notify_waiters();
            self.timer_cond.notify_waiters();
        }
        else if a == inner.last_ack_recv {
            let dup_count = match inner.out_ring.head_mut() {
                Some(head) => {
                    head.num_ack += 1;
                    head.num_ack
                }
                None => return,
            };
            if dup_count == FAST_RETRANSMIT_THRESHOLD {
                debug!("3 duplicate acks of {} from {:?} - fast retransmit", a, self.peer_addr);
                self.send_ring_packet(inner, 0).await;
            }
        }
        else if inner.out_ring.is_ackable(a) && a != inner.out_ring.head_seq() {
            let released = inner.out_ring.release_below(a);
            inner.last_ack_recv = a;
            if let Some(head) = inner.out_ring.head_mut() {
                head.num_ack = 0;
            }
            trace!("partial ack {} from {:?} releases {} packets", a, self.peer_addr, released);
            self.send_cond.notify_waiters();
            self.timer_cond.notify_waiters();
        }
        else {
            trace!("ack {} from {:?} is outside the window - ignoring", a, self.peer_addr);
        }

        if pkt.has(flags::OPT) && !pkt.sack.is_empty() {
            self.apply_sack(inner, &pkt.sack).await;
        }
    }

    /// Selective-ack bitmap: bit k covers the packet at ring offset k. Offset 0 is skipped -
    ///  the head is governed by duplicate-ack counting and the retransmission timer.
    async fn apply_sack(&self, inner: &mut ConnectionInner, bitmap: &[u8]) {
        let covered = (bitmap.len() * 8).min(inner.out_ring.len());

        let mut resend = Vec::new();
        for k in 1..covered as u16 {
            let held = bitmap[k as usize / 8] & (1 << (k % 8)) != 0;
            let Some(p) = inner.out_ring.get_mut(k) else { continue };
            if held {
                p.num_ack = SACKED;
            }
            else {
                p.num_ack += 1;
                if p.num_ack == SACK_RETRANSMIT_THRESHOLD {
                    resend.push(k);
                }
            }
        }

        for offset in resend {
            debug!("peer {:?} repeatedly reports ring offset {} missing - retransmitting", self.peer_addr, offset);
            self.send_ring_packet(inner, offset).await;
        }
    }

    /// Place an inbound data or FIN packet into the receive window, absorb the newly
    ///  contiguous prefix, and decide between a delayed and an immediate acknowledgment.
    async fn process_data(&self, inner: &mut ConnectionInner, pkt: Packet) {
        if inner.peer_fin_seq.is_some() && !pkt.has(flags::FIN) {
            trace!("data from {:?} after its FIN - dropping", self.peer_addr);
            return;
        }

        let offset = pkt.seq.offset_from(inner.new_ack_nr);
        if offset as usize >= inner.in_ring.capacity() {
            // duplicate of something already delivered, or far outside our window: the
            //  peer is missing an ack, so repeat the current cumulative one
            trace!("packet #{} from {:?} is outside the receive window - re-acking", pkt.seq, self.peer_addr);
            self.emit_ack(inner).await;
            return;
        }

        let had_pending_ack = inner.ack_pending_since.is_some();
        inner.in_ring.insert(
            offset,
            InPacket {
                flags: pkt.flags,
                seq: pkt.seq,
                payload: pkt.payload,
            },
        );

        let mut absorbed = 0usize;
        while let Some(p) = inner.in_ring.pop_head() {
            inner.new_ack_nr = inner.new_ack_nr.next();
            absorbed += 1;

            if p.is_fin() {
                inner.peer_fin_seq = Some(p.seq);
                // end of stream: wake the application reader once the queue drains
                inner.delivery_tx = None;

                match inner.state.after_peer_fin() {
                    Some(next) => {
                        debug!("peer {:?} closed its side (FIN #{}), now {}", self.peer_addr, p.seq, next);
                        inner.state = next;
                        if next == ConnectionState::TimeWait {
                            inner.time_wait_deadline =
                                Some(Instant::now() + 2 * self.config.retransmit_timeout);
                            self.timer_cond.notify_waiters();
                        }
                    }
                    None => {
                        warn!("in-order FIN from {:?} in state {} - ignoring the transition", self.peer_addr, inner.state);
                    }
                }
            }
            else if let Some(tx) = &inner.delivery_tx {
                // an application reader blocked in recv wakes up here
                tx.send(p.payload).ok();
            }
        }

        if absorbed == 1 && !inner.in_ring.has_hole() && !had_pending_ack {
            // a lone in-order packet: delay the ack to give a reverse-direction send the
            //  chance to piggyback it
            inner.ack_pending_since = Some(Instant::now());
            self.timer_cond.notify_waiters();
        }
        else {
            self.emit_ack(inner).await;
        }
    }

    /// Transmit the packet at the given ring offset, enforcing the retry cap. Every
    ///  transmission carries the current cumulative ack, so a pending delayed ack is
    ///  satisfied as a side effect.
    async fn send_ring_packet(&self, inner: &mut ConnectionInner, offset: u16) {
        if inner.state == ConnectionState::Closed {
            return;
        }

        let ack = inner.new_ack_nr;
        let buf = {
            let Some(p) = inner.out_ring.get_mut(offset) else {
                return;
            };
            if p.send_count > self.config.max_retransmissions {
                None
            }
            else {
                p.send_time = Instant::now();
                p.send_count += 1;
                p.num_ack = 0;
                Some(
                    Packet {
                        flags: p.flags,
                        seq: p.seq,
                        ack,
                        sack: Vec::new(),
                        payload: p.payload.clone(),
                    }
                    .to_bytes(),
                )
            }
        };

        match buf {
            Some(buf) => {
                inner.ack_pending_since = None;
                self.carrier.send_datagram(self.peer_addr, &buf).await;
            }
            None => {
                warn!(
                    "packet #{} to {:?} got no ack after {} transmissions - assuming the peer is dead",
                    inner.out_ring.get(offset).map(|p| p.seq).unwrap_or(SeqNr::ZERO),
                    self.peer_addr,
                    self.config.max_retransmissions + 1
                );
                self.transition_to_closed(inner, "retry cap exceeded");
            }
        }
    }

    /// Emit the current cumulative ack, with a selective-ack bitmap attached iff packets are
    ///  buffered beyond a gap. Not ring-buffered and never retransmitted.
    async fn emit_ack(&self, inner: &mut ConnectionInner) {
        if inner.state == ConnectionState::Closed {
            return;
        }

        let sack = inner.in_ring.sack_bitmap();
        let mut pkt = Packet::new(flags::ACK, inner.out_ring.next_seq(), inner.new_ack_nr);
        if !sack.is_empty() {
            pkt.flags |= flags::OPT;
            pkt.sack = sack;
        }

        trace!("acking to {:?}: {}", self.peer_addr, pkt);
        let buf = pkt.to_bytes();
        inner.ack_pending_since = None;
        self.carrier.send_datagram(self.peer_addr, &buf).await;
    }

    fn transition_to_closed(&self, inner: &mut ConnectionInner, reason: &str) {
        if inner.state == ConnectionState::Closed {
            return;
        }

        debug!("connection to {:?} is now closed ({})", self.peer_addr, reason);
        inner.state = ConnectionState::Closed;
        inner.delivery_tx = None;
        inner.ack_pending_since = None;

        self.send_cond.notify_waiters();
        self.timer_cond.notify_waiters();

        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.release_slot(self.peer_addr);
        }
    }

    /// The timer task: wakes at the earliest pending deadline (or when kicked), performs the
    ///  due work under the shared lock, and exits once the connection is closed.
    async fn timer_loop(this: Weak<Connection>, timer_cond: Arc<Notify>) {
        loop {
            let notified = timer_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let verdict = {
                let Some(conn) = this.upgrade() else { return };
                let mut inner = conn.inner.lock().await;
                conn.process_timer_events(&mut inner).await
            };

            match verdict {
                TimerVerdict::Exit => return,
                TimerVerdict::Sleep(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = notified.as_mut() => {}
                    }
                }
            }
        }
    }

    async fn process_timer_events(&self, inner: &mut ConnectionInner) -> TimerVerdict {
        let now = Instant::now();
        let rto = self.config.retransmit_timeout;

        match inner.state {
            ConnectionState::Closed => return TimerVerdict::Exit,
            ConnectionState::LastAck if inner.out_ring.is_empty() => {
                self.transition_to_closed(inner, "nothing left to deliver after local FIN");
                return TimerVerdict::Exit;
            }
            ConnectionState::TimeWait => {
                if let Some(deadline) = inner.time_wait_deadline {
                    if deadline <= now {
                        self.transition_to_closed(inner, "TIME_WAIT expired");
                        return TimerVerdict::Exit;
                    }
                }
            }
            _ => {}
        }

        let idle_deadline = inner.last_activity + self.config.idle_timeout;
        if idle_deadline <= now {
            self.transition_to_closed(inner, "idle timeout");
            return TimerVerdict::Exit;
        }

        if let Some(send_time) = inner.out_ring.head_mut().map(|head| head.send_time) {
            if send_time + rto <= now {
                trace!("retransmission timeout for head packet to {:?}", self.peer_addr);
                self.send_ring_packet(inner, 0).await;
                if inner.state == ConnectionState::Closed {
                    return TimerVerdict::Exit;
                }
            }
        }

        if let Some(pending_since) = inner.ack_pending_since {
            if pending_since + rto <= now {
                trace!("delayed ack for {:?} is due", self.peer_addr);
                self.emit_ack(inner).await;
            }
        }

        let mut deadline = idle_deadline;
        if let Some(head) = inner.out_ring.head_mut() {
            deadline = deadline.min(head.send_time + rto);
        }
        if let Some(pending_since) = inner.ack_pending_since {
            deadline = deadline.min(pending_since + rto);
        }
        if let Some(time_wait) = inner.time_wait_deadline {
            deadline = deadline.min(time_wait);
        }
        TimerVerdict::Sleep(deadline)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}
