//! Datagram transport: compact frames over UDP with per-channel
//! reliability.
//!
//! A server binds one socket for every peer. A demux task reads it and
//! routes each packet by source address to that peer's link driver; an
//! unknown address is only admitted through a `Connect` packet. A client
//! owns its own socket and reads it directly.
//!
//! ```text
//!  client                         server
//!    │ ── Connect(nonce) ───────────▶ │  (repeated until answered)
//!    │ ◀────────────── Accept(nonce) ─│
//!    │ ── Reliable(ch, seq, frame) ─▶ │
//!    │ ◀──────────── Ack(ch, seq) ────│
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use meshlink_protocol::{
    DEFAULT_CHANNEL_COUNT, DEFAULT_MAX_PACKET_SIZE, Frame, Route, WireFormat,
    decode_datagram,
};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::link::{
    self, LINK_HEADER_LEN, Link, LinkHeader, PacketKind, nonce_packet, read_nonce,
};
use crate::{Connector, Listener, Transport, TransportError, resolve};

/// Tuning for the datagram transport.
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    /// Largest frame (datagram header included), excluding the link header.
    pub max_packet_size: usize,
    /// Independent sequencing channels per peer.
    pub channel_count: u8,
    /// Time before an unacknowledged reliable packet is sent again.
    pub resend_interval: Duration,
    /// Resends before the peer is declared unreachable.
    pub max_resends: u32,
    /// Keep-alive period when nothing else is being sent.
    pub heartbeat_interval: Duration,
    /// Silence after which the peer is considered gone.
    pub idle_timeout: Duration,
    /// How long a client keeps retrying `Connect`.
    pub connect_timeout: Duration,
    /// How long `close` waits for outstanding acks before saying goodbye.
    pub close_linger: Duration,
    /// Accepted-but-unclaimed peers a listener holds.
    pub accept_backlog: usize,
    /// Packets buffered per peer between socket and link driver.
    pub inbound_queue: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            channel_count: DEFAULT_CHANNEL_COUNT,
            resend_interval: Duration::from_millis(100),
            max_resends: 20,
            heartbeat_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            close_linger: Duration::from_secs(1),
            accept_backlog: 64,
            inbound_queue: 256,
        }
    }
}

impl DatagramConfig {
    fn recv_buffer_len(&self) -> usize {
        // One spare byte so an oversize datagram is detectable instead of
        // silently truncated by the kernel.
        self.max_packet_size + LINK_HEADER_LEN + 1
    }

    fn is_oversize(&self, len: usize) -> bool {
        len > self.max_packet_size + LINK_HEADER_LEN
    }
}

// ---------------------------------------------------------------------------
// DatagramTransport
// ---------------------------------------------------------------------------

/// One peer's datagram session, on either side.
pub struct DatagramTransport {
    link: Arc<Link>,
    delivered: tokio::sync::Mutex<mpsc::Receiver<Result<Bytes, TransportError>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    reader: Option<JoinHandle<()>>,
}

impl DatagramTransport {
    fn start(
        link: Arc<Link>,
        raw: mpsc::Receiver<Bytes>,
        reader: Option<JoinHandle<()>>,
        on_exit: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        let (delivered_tx, delivered_rx) = mpsc::channel(link.config().inbound_queue);
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(link::drive(
            Arc::clone(&link),
            raw,
            delivered_tx,
            shutdown_rx,
            on_exit,
        ));
        Self {
            link,
            delivered: tokio::sync::Mutex::new(delivered_rx),
            shutdown,
            closed: AtomicBool::new(false),
            reader,
        }
    }

    /// Opens a session to `server` from a fresh ephemeral socket.
    ///
    /// Sends `Connect` every `resend_interval` until the server accepts or
    /// `connect_timeout` passes.
    pub async fn connect(server: SocketAddr, config: DatagramConfig) -> Result<Self, TransportError> {
        let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: bind_addr.to_owned(),
                source,
            })?;
        let socket = Arc::new(socket);

        let nonce: u64 = rand::rng().random();
        let hello = nonce_packet(PacketKind::Connect, nonce);
        let deadline = Instant::now() + config.connect_timeout;
        let mut buf = vec![0u8; config.recv_buffer_len()];

        'handshake: loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::ConnectTimeout {
                    addr: server.to_string(),
                    timeout: config.connect_timeout,
                });
            }
            socket
                .send_to(&hello, server)
                .await
                .map_err(|source| TransportError::Connect {
                    addr: server.to_string(),
                    source,
                })?;

            let wait_until = (now + config.resend_interval).min(deadline);
            while let Ok(received) =
                tokio::time::timeout_at(wait_until, socket.recv_from(&mut buf)).await
            {
                let (len, from) = match received {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(%server, error = %e, "connect receive failed");
                        continue;
                    }
                };
                let mut reply = Bytes::copy_from_slice(&buf[..len]);
                if from != server {
                    continue;
                }
                if let Some(header) = LinkHeader::split(&mut reply) {
                    if header.kind == PacketKind::Accept && read_nonce(&reply) == Some(nonce) {
                        break 'handshake;
                    }
                }
            }
        }

        tracing::debug!(%server, "datagram session established");

        let (raw_tx, raw_rx) = mpsc::channel(config.inbound_queue);
        let reader = tokio::spawn(read_socket(Arc::clone(&socket), server, config.clone(), raw_tx));
        let link = Arc::new(Link::new(socket, server, nonce, config));
        Ok(Self::start(link, raw_rx, Some(reader), None))
    }

    async fn linger(&self) {
        let limit = self.link.config().close_linger;
        let poll = self.link.config().resend_interval.max(Duration::from_millis(5)) / 2;
        let _ = tokio::time::timeout(limit, async {
            while self.link.unacked() > 0 && !self.shutdown.is_closed() {
                tokio::time::sleep(poll).await;
            }
        })
        .await;
    }
}

impl Transport for DatagramTransport {
    fn wire_format(&self) -> WireFormat {
        WireFormat::Datagram {
            max_packet: self.link.config().max_packet_size,
        }
    }

    async fn send_framed(&self, frame: Bytes, route: Route) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed("transport closed".into()));
        }
        self.link.send(frame, route).await
    }

    async fn recv_framed(&self) -> Result<Option<Frame>, TransportError> {
        let mut delivered = self.delivered.lock().await;
        match delivered.recv().await {
            None => Ok(None),
            Some(Ok(bytes)) => {
                let frame = decode_datagram(bytes, self.link.config().max_packet_size)?;
                Ok(Some(frame))
            }
            Some(Err(e)) => Err(e),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.linger().await;

        let goodbye = link::packet(PacketKind::Disconnect, 0, 0, &[]);
        if let Err(e) = self.link.send_raw(&goodbye).await {
            tracing::debug!(peer = %self.link.peer(), error = %e, "disconnect send failed");
        }
        self.shutdown.send_replace(true);
        if let Some(reader) = &self.reader {
            reader.abort();
        }
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.link.peer())
    }
}

impl Drop for DatagramTransport {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

/// Client-side socket reader: forwards packets from `server` to the driver.
async fn read_socket(
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    config: DatagramConfig,
    raw: mpsc::Sender<Bytes>,
) {
    let mut buf = vec![0u8; config.recv_buffer_len()];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(%server, error = %e, "datagram receive failed");
                continue;
            }
        };
        if from != server {
            continue;
        }
        if config.is_oversize(len) {
            tracing::warn!(%server, len, "dropping oversize datagram");
            continue;
        }
        if raw.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>;

/// Accepts datagram sessions on one shared UDP socket.
pub struct DatagramListener {
    socket: Arc<UdpSocket>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<DatagramTransport>>,
    shutdown: watch::Sender<bool>,
}

impl DatagramListener {
    /// Binds `addr` and starts the demux task.
    pub async fn bind(addr: &str, config: DatagramConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_owned(),
                source,
            })?;
        let socket = Arc::new(socket);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(demux(Arc::clone(&socket), config, incoming_tx, shutdown_rx));
        tracing::info!(addr, "UDP transport listening");

        Ok(Self {
            socket,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            shutdown,
        })
    }
}

impl Listener for DatagramListener {
    type Transport = DatagramTransport;

    async fn accept(&self) -> Result<Self::Transport, TransportError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Shutdown)
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr().map_err(TransportError::AcceptFailed)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.shutdown.send_replace(true);
        Ok(())
    }
}

impl Drop for DatagramListener {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn demux(
    socket: Arc<UdpSocket>,
    config: DatagramConfig,
    incoming: mpsc::Sender<DatagramTransport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peers: PeerMap = Arc::default();
    let mut buf = vec![0u8; config.recv_buffer_len()];

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(error = %e, "datagram receive failed");
                    continue;
                }
            },
        };
        if config.is_oversize(len) {
            tracing::warn!(%from, len, "dropping oversize datagram");
            continue;
        }
        let packet = Bytes::copy_from_slice(&buf[..len]);

        let known = peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&from)
            .cloned();
        if let Some(raw) = known {
            if let Err(TrySendError::Full(_)) = raw.try_send(packet) {
                tracing::warn!(%from, "peer queue full, dropping datagram");
            }
            continue;
        }

        let mut body = packet;
        let nonce = match LinkHeader::split(&mut body) {
            Some(header) if header.kind == PacketKind::Connect => read_nonce(&body),
            _ => None,
        };
        let Some(nonce) = nonce else {
            tracing::debug!(%from, "ignoring datagram from unknown address");
            continue;
        };

        // Without a backlog slot the peer is never admitted or answered.
        let permit = match incoming.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                tracing::warn!(%from, "accept backlog full, ignoring connect");
                continue;
            }
            Err(TrySendError::Closed(())) => break,
        };
        let transport = admit(&socket, &config, &peers, from, nonce);
        if let Err(e) = socket
            .send_to(&nonce_packet(PacketKind::Accept, nonce), from)
            .await
        {
            tracing::debug!(%from, error = %e, "accept send failed");
        }
        permit.send(transport);
        tracing::debug!(%from, "datagram peer admitted");
    }

    // Dropping every peer sender ends the link drivers.
    peers.lock().unwrap_or_else(PoisonError::into_inner).clear();
    tracing::debug!("datagram demux stopped");
}

fn admit(
    socket: &Arc<UdpSocket>,
    config: &DatagramConfig,
    peers: &PeerMap,
    from: SocketAddr,
    nonce: u64,
) -> DatagramTransport {
    let (raw_tx, raw_rx) = mpsc::channel(config.inbound_queue);
    let weak = raw_tx.downgrade();
    peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(from, raw_tx);

    let peers = Arc::clone(peers);
    let on_exit: Box<dyn FnOnce() + Send> = Box::new(move || {
        let mut peers = peers.lock().unwrap_or_else(PoisonError::into_inner);
        let ours = match (peers.get(&from), weak.upgrade()) {
            (Some(current), Some(mine)) => current.same_channel(&mine),
            _ => false,
        };
        if ours {
            peers.remove(&from);
        }
    });

    let link = Arc::new(Link::new(Arc::clone(socket), from, nonce, config.clone()));
    DatagramTransport::start(link, raw_rx, None, Some(on_exit))
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Dials datagram sessions.
#[derive(Debug, Clone, Default)]
pub struct UdpConnector {
    config: DatagramConfig,
}

impl UdpConnector {
    pub fn new(config: DatagramConfig) -> Self {
        Self { config }
    }
}

impl Connector for UdpConnector {
    type Transport = DatagramTransport;

    async fn dial(&self, host: &str, port: u16) -> Result<Self::Transport, TransportError> {
        let addrs = resolve(host, port).await?;
        // Prefer IPv4 when the name resolves to both families.
        let server = addrs
            .iter()
            .copied()
            .find(SocketAddr::is_ipv4)
            .unwrap_or(addrs[0]);
        DatagramTransport::connect(server, self.config.clone()).await
    }
}
