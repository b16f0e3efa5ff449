//! The endpoint ties the protocol together: it owns the UDP socket and a fixed-capacity
//!  table of live connections keyed by peer address. Its listener task is the sole reader of
//!  the socket, dispatching each inbound datagram to the connection that owns the sender's
//!  address, or handing a SYN from an unknown peer to a blocked `accept` call.

use crate::config::UdpPlusConfig;
use crate::connection::Connection;
use crate::packet::{flags, Packet, SeqNr};
use anyhow::{anyhow, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;

pub struct Endpoint {
    config: Arc<UdpPlusConfig>,
    core: std::sync::Mutex<EndpointCore>,
    /// acceptors serialize here; the listener pushes freshly accepted connections through
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Connection>>>,
    acceptors_waiting: AtomicUsize,
    /// per-endpoint RNG for initial sequence numbers
    isn_rng: std::sync::Mutex<StdRng>,
}

/// Everything guarded by the endpoint mutex. The listener never holds this lock while
///  calling into a connection, and connections only take it through [`Endpoint::release_slot`]
///  which locks nothing else.
struct EndpointCore {
    socket: Option<Arc<UdpSocket>>,
    slots: Vec<Option<Arc<Connection>>>,
    listener: Option<JoinHandle<()>>,
    accept_tx: Option<mpsc::Sender<Arc<Connection>>>,
}

impl Endpoint {
    /// Create an endpoint with no socket yet; [`Endpoint::bind`] or [`Endpoint::connect`]
    ///  brings it to life.
    pub fn new(config: UdpPlusConfig) -> anyhow::Result<Arc<Endpoint>> {
        config.validate()?;

        let (accept_tx, accept_rx) = mpsc::channel(1);
        Ok(Arc::new(Endpoint {
            core: std::sync::Mutex::new(EndpointCore {
                socket: None,
                slots: vec![None; config.max_connections],
                listener: None,
                accept_tx: Some(accept_tx),
            }),
            config: Arc::new(config),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            acceptors_waiting: AtomicUsize::new(0),
            isn_rng: std::sync::Mutex::new(StdRng::from_entropy()),
        }))
    }

    /// Bind the socket to a local address and start the listener. Fails on the second call
    ///  and after [`Endpoint::connect`].
    pub async fn bind(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("bound receive socket to {:?}", socket.local_addr()?);
        self.install_socket(socket)
    }

    /// Open an outbound connection: binds an ephemeral socket, starts the listener and emits
    ///  the SYN. Fails on the second call and after [`Endpoint::bind`].
    pub async fn connect(self: &Arc<Self>, peer_addr: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        let bind_addr: SocketAddr = if peer_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        }
        else {
            "[::]:0".parse().unwrap()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        self.install_socket(socket.clone())?;

        let conn = Connection::client(
            Arc::downgrade(self),
            self.config.clone(),
            socket,
            peer_addr,
            self.next_isn(),
        );
        self.claim_slot(&conn)?;
        conn.start_handshake().await;
        Ok(conn)
    }

    /// Block until the listener hands over the next inbound connection. SYNs from unknown
    ///  peers are only answered while at least one acceptor is waiting here.
    pub async fn accept(&self) -> anyhow::Result<Arc<Connection>> {
        let mut accept_rx = self.accept_rx.lock().await;

        self.acceptors_waiting.fetch_add(1, Ordering::SeqCst);
        let received = accept_rx.recv().await;
        self.acceptors_waiting.fetch_sub(1, Ordering::SeqCst);

        received.ok_or_else(|| anyhow!("endpoint is shut down"))
    }

    /// Close every live connection (best-effort FIN, then hard teardown), then shut the
    ///  socket down. Blocked `send` / `recv` / `accept` callers wake and observe closure.
    pub async fn close_all(&self) {
        let (conns, listener) = {
            let mut core = self.core.lock().unwrap();
            core.accept_tx = None;
            let conns: Vec<_> = core.slots.iter_mut().filter_map(|slot| slot.take()).collect();
            (conns, core.listener.take())
        };

        for conn in &conns {
            conn.close().await;
            conn.shutdown().await;
        }

        if let Some(listener) = listener {
            listener.abort();
        }
        self.core.lock().unwrap().socket = None;
        debug!("endpoint shut down");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let core = self.core.lock().unwrap();
        core.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// A fully closed connection gives its table slot back for reuse.
    pub(crate) fn release_slot(&self, peer_addr: SocketAddr) {
        let mut core = self.core.lock().unwrap();
        for slot in core.slots.iter_mut() {
            if slot.as_ref().is_some_and(|c| c.peer_addr() == peer_addr) {
                trace!("freeing connection slot for {:?}", peer_addr);
                *slot = None;
                return;
            }
        }
    }

    fn install_socket(self: &Arc<Self>, socket: Arc<UdpSocket>) -> anyhow::Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.socket.is_some() {
            bail!("endpoint already has an active socket - bind/connect are once-only");
        }
        core.socket = Some(socket.clone());
        core.listener = Some(tokio::spawn(self.clone().listener_loop(socket)));
        Ok(())
    }

    fn claim_slot(&self, conn: &Arc<Connection>) -> anyhow::Result<()> {
        let mut core = self.core.lock().unwrap();

        if core
            .slots
            .iter()
            .flatten()
            .any(|c| c.peer_addr() == conn.peer_addr())
        {
            bail!("a connection to {} already exists", conn.peer_addr());
        }
        match core.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(conn.clone());
                Ok(())
            }
            None => bail!("connection table is full ({} slots)", self.config.max_connections),
        }
    }

    fn lookup(&self, peer_addr: SocketAddr) -> Option<Arc<Connection>> {
        let core = self.core.lock().unwrap();
        core.slots
            .iter()
            .flatten()
            .find(|c| c.peer_addr() == peer_addr)
            .cloned()
    }

    fn next_isn(&self) -> SeqNr {
        if let Some(fixed) = self.config.initial_seq_nr {
            return SeqNr::from_raw(fixed);
        }
        SeqNr::from_raw(self.isn_rng.lock().unwrap().gen())
    }

    async fn listener_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        info!("starting listener loop");

        let mut buf = vec![0u8; self.config.max_datagram_size];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {} - shutting down", e);
                    break;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
            let _entered = span.enter();

            let packet = match Packet::deser(&buf[..num_read]) {
                Ok(packet) => packet,
                Err(_) => {
                    warn!("received unparsable datagram from {:?} - dropping", from);
                    continue;
                }
            };

            if let Some(conn) = self.lookup(from) {
                conn.handle_packet(packet).instrument(Span::current()).await;
                continue;
            }

            if !packet.has(flags::SYN) {
                trace!("datagram from unknown peer {:?} is not a SYN - dropping", from);
                continue;
            }
            if self.acceptors_waiting.load(Ordering::SeqCst) == 0 {
                debug!("SYN from unknown peer {:?} but nobody is accepting - dropping", from);
                continue;
            }

            let conn = Connection::server(
                Arc::downgrade(&self),
                self.config.clone(),
                socket.clone(),
                from,
                self.next_isn(),
            );
            if let Err(e) = self.claim_slot(&conn) {
                debug!("dropping SYN from {:?}: {}", from, e);
                conn.shutdown().await;
                continue;
            }

            conn.handle_packet(packet).instrument(Span::current()).await;

            let accept_tx = self.core.lock().unwrap().accept_tx.clone();
            match accept_tx {
                Some(tx) => {
                    if tx.send(conn.clone()).await.is_err() {
                        conn.shutdown().await;
                    }
                }
                None => conn.shutdown().await,
            }
        }

        self.handle_listener_exit().await;
    }

    /// The socket died under the listener: tear everything down so blocked callers observe
    ///  closure instead of hanging.
    async fn handle_listener_exit(&self) {
        let conns = {
            let mut core = self.core.lock().unwrap();
            core.accept_tx = None;
            core.socket = None;
            core.slots.iter_mut().filter_map(|slot| slot.take()).collect::<Vec<_>>()
        };
        for conn in conns {
            conn.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionState;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time::timeout;

    fn test_config() -> UdpPlusConfig {
        UdpPlusConfig {
            ring_capacity: 32,
            ..UdpPlusConfig::default_ipv4()
        }
    }

    fn rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread().enable_all().build().unwrap()
    }

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn await_state(conn: &Arc<Connection>, expected: ConnectionState) {
        timeout(Duration::from_secs(5), async {
            loop {
                if conn.state().await == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("connection did not reach {}", expected));
    }

    #[test]
    fn test_bind_is_once_only() {
        rt().block_on(async {
            let endpoint = Endpoint::new(test_config()).unwrap();
            endpoint.bind(localhost()).await.unwrap();
            assert!(endpoint.bind(localhost()).await.is_err());

            let peer = SocketAddr::from(([127, 0, 0, 1], 19999));
            assert!(endpoint.connect(peer).await.is_err());

            endpoint.close_all().await;
        });
    }

    #[test]
    fn test_connect_is_once_only() {
        rt().block_on(async {
            let endpoint = Endpoint::new(test_config()).unwrap();
            let peer = SocketAddr::from(([127, 0, 0, 1], 19998));
            let conn = endpoint.connect(peer).await.unwrap();
            assert!(endpoint.connect(peer).await.is_err());
            assert!(endpoint.bind(localhost()).await.is_err());

            conn.shutdown().await;
            endpoint.close_all().await;
        });
    }

    #[test]
    fn test_end_to_end_ordered_delivery() {
        rt().block_on(async {
            let server = Endpoint::new(test_config()).unwrap();
            server.bind(localhost()).await.unwrap();
            let server_addr = server.local_addr().unwrap();

            let server_side = {
                let server = server.clone();
                tokio::spawn(async move { server.accept().await.unwrap() })
            };

            let client = Endpoint::new(test_config()).unwrap();
            let client_conn = client.connect(server_addr).await.unwrap();
            let server_conn = timeout(Duration::from_secs(5), server_side)
                .await
                .unwrap()
                .unwrap();

            for i in 0..20u8 {
                client_conn.send(&[i, i, i]).await.unwrap();
            }
            for i in 0..20u8 {
                let msg = timeout(Duration::from_secs(5), server_conn.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(msg, vec![i, i, i]);
            }

            // and the reverse direction
            server_conn.send(b"pong").await.unwrap();
            let msg = timeout(Duration::from_secs(5), client_conn.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg, b"pong".to_vec());

            client.close_all().await;
            server.close_all().await;
        });
    }

    #[test]
    fn test_graceful_close_reaches_both_sides() {
        rt().block_on(async {
            let server = Endpoint::new(test_config()).unwrap();
            server.bind(localhost()).await.unwrap();
            let server_addr = server.local_addr().unwrap();

            let server_side = {
                let server = server.clone();
                tokio::spawn(async move { server.accept().await.unwrap() })
            };

            let client = Endpoint::new(test_config()).unwrap();
            let client_conn = client.connect(server_addr).await.unwrap();
            let server_conn = timeout(Duration::from_secs(5), server_side)
                .await
                .unwrap()
                .unwrap();

            for msg in [&b"one"[..], b"two", b"three"] {
                client_conn.send(msg).await.unwrap();
            }
            for expected in [&b"one"[..], b"two", b"three"] {
                let msg = timeout(Duration::from_secs(5), server_conn.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(msg, expected.to_vec());
            }

            // server closes; the client sees end-of-stream after draining, then closes too
            server_conn.close().await;
            let eos = timeout(Duration::from_secs(5), client_conn.recv()).await.unwrap();
            assert_eq!(eos, None);

            client_conn.close().await;
            await_state(&server_conn, ConnectionState::Closed).await;
            await_state(&client_conn, ConnectionState::Closed).await;

            client.close_all().await;
            server.close_all().await;
        });
    }

    #[test]
    fn test_syn_dropped_without_acceptor_then_retried() {
        rt().block_on(async {
            let server = Endpoint::new(test_config()).unwrap();
            server.bind(localhost()).await.unwrap();
            let server_addr = server.local_addr().unwrap();

            // nobody is accepting yet: the client's first SYN is dropped
            let client = Endpoint::new(test_config()).unwrap();
            let client_conn = client.connect(server_addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(client_conn.state().await, ConnectionState::SynSent);

            // once an acceptor shows up, the client's SYN retransmission completes the
            //  handshake
            let server_conn = timeout(Duration::from_secs(5), server.accept()).await.unwrap().unwrap();
            assert_eq!(server_conn.peer_addr().port(), client.local_addr().unwrap().port());
            await_state(&client_conn, ConnectionState::Established).await;

            client.close_all().await;
            server.close_all().await;
        });
    }

    #[test]
    fn test_stray_datagrams_are_dropped() {
        rt().block_on(async {
            let config = UdpPlusConfig {
                initial_seq_nr: Some(700),
                ..test_config()
            };
            let server = Endpoint::new(config).unwrap();
            server.bind(localhost()).await.unwrap();
            let server_addr = server.local_addr().unwrap();

            let accept_task = {
                let server = server.clone();
                tokio::spawn(async move { server.accept().await })
            };

            let raw = UdpSocket::bind(localhost()).await.unwrap();
            // garbage and a non-SYN from an unknown peer are ignored
            raw.send_to(&[1, 2, 3], server_addr).await.unwrap();
            raw.send_to(&Packet::new(flags::ACK, SeqNr::from_raw(5), SeqNr::from_raw(9)).to_bytes(), server_addr)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!accept_task.is_finished());

            // a proper SYN is answered with a SYN|ACK carrying the pinned ISN
            raw.send_to(&Packet::new(flags::SYN, SeqNr::from_raw(41), SeqNr::ZERO).to_bytes(), server_addr)
                .await
                .unwrap();

            let mut buf = [0u8; 64];
            let (n, from) = timeout(Duration::from_secs(5), raw.recv_from(&mut buf)).await.unwrap().unwrap();
            assert_eq!(from, server_addr);
            let reply = Packet::deser(&buf[..n]).unwrap();
            assert!(reply.has(flags::SYN | flags::ACK));
            assert_eq!(reply.seq, SeqNr::from_raw(700));
            assert_eq!(reply.ack, SeqNr::from_raw(42));

            timeout(Duration::from_secs(5), accept_task).await.unwrap().unwrap().unwrap();
            server.close_all().await;
        });
    }

    #[test]
    fn test_duplicated_datagrams_leave_the_stream_unchanged() {
        rt().block_on(async {
            let config = UdpPlusConfig {
                initial_seq_nr: Some(100),
                ..test_config()
            };
            let server = Endpoint::new(config).unwrap();
            server.bind(localhost()).await.unwrap();
            let server_addr = server.local_addr().unwrap();

            let accept_task = {
                let server = server.clone();
                tokio::spawn(async move { server.accept().await })
            };

            // drive the client side by hand so every datagram can be sent twice
            let raw = UdpSocket::bind(localhost()).await.unwrap();
            let syn = Packet::new(flags::SYN, SeqNr::from_raw(10), SeqNr::ZERO).to_bytes();
            raw.send_to(&syn, server_addr).await.unwrap();
            raw.send_to(&syn, server_addr).await.unwrap();

            let mut buf = [0u8; 64];
            let (n, _) = timeout(Duration::from_secs(5), raw.recv_from(&mut buf)).await.unwrap().unwrap();
            let syn_ack = Packet::deser(&buf[..n]).unwrap();
            assert!(syn_ack.has(flags::SYN | flags::ACK));

            let server_conn = timeout(Duration::from_secs(5), accept_task).await.unwrap().unwrap().unwrap();

            let mut data = Packet::new(flags::DATA | flags::ACK, SeqNr::from_raw(11), syn_ack.seq.next());
            data.payload = b"only once".to_vec();
            let data = data.to_bytes();
            for _ in 0..3 {
                raw.send_to(&data, server_addr).await.unwrap();
            }

            let msg = timeout(Duration::from_secs(5), server_conn.recv()).await.unwrap().unwrap();
            assert_eq!(msg, b"only once".to_vec());

            // no second delivery: the queue stays empty until the peer sends something new
            let no_dup = timeout(Duration::from_millis(300), server_conn.recv()).await;
            assert!(no_dup.is_err());

            server.close_all().await;
        });
    }

    #[test]
    fn test_table_full_drops_additional_syns() {
        rt().block_on(async {
            let config = UdpPlusConfig {
                max_connections: 1,
                ..test_config()
            };
            let server = Endpoint::new(config).unwrap();
            server.bind(localhost()).await.unwrap();
            let server_addr = server.local_addr().unwrap();

            let accept_task = {
                let server = server.clone();
                tokio::spawn(async move { server.accept().await })
            };

            let first = UdpSocket::bind(localhost()).await.unwrap();
            first
                .send_to(&Packet::new(flags::SYN, SeqNr::from_raw(1), SeqNr::ZERO).to_bytes(), server_addr)
                .await
                .unwrap();
            timeout(Duration::from_secs(5), accept_task).await.unwrap().unwrap().unwrap();

            // the only slot is taken; a second peer's SYN goes unanswered
            let second_accept = {
                let server = server.clone();
                tokio::spawn(async move { server.accept().await })
            };
            let second = UdpSocket::bind(localhost()).await.unwrap();
            second
                .send_to(&Packet::new(flags::SYN, SeqNr::from_raw(2), SeqNr::ZERO).to_bytes(), server_addr)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(!second_accept.is_finished());

            second_accept.abort();
            server.close_all().await;
        });
    }

    #[test]
    fn test_close_all_wakes_blocked_accept() {
        rt().block_on(async {
            let server = Endpoint::new(test_config()).unwrap();
            server.bind(localhost()).await.unwrap();

            let accept_task = {
                let server = server.clone();
                tokio::spawn(async move { server.accept().await })
            };
            tokio::time::sleep(Duration::from_millis(50)).await;

            server.close_all().await;

            let result = timeout(Duration::from_secs(5), accept_task).await.unwrap().unwrap();
            assert!(result.is_err());
        });
    }
}
