//! Per-peer reliability layer for the datagram transport.
//!
//! Every UDP packet starts with a 6-byte link header:
//!
//! ```text
//! ┌──────────┬─────────────┬───────────┬──────────────────────────┐
//! │ kind u8  │ channel u8  │ seq u32   │ body (frame, nonce, ...) │
//! └──────────┴─────────────┴───────────┴──────────────────────────┘
//! ```
//!
//! Reliable packets are acknowledged, retransmitted until acked, deduped,
//! and released in sequence order per channel. Unreliable packets carry a
//! per-channel sequence so stale ones can be dropped.
//!
//! The [`Link`] holds the state; [`drive`] is the per-peer task that feeds
//! it inbound packets and timer ticks.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use meshlink_protocol::Route;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::{DatagramConfig, TransportError};

pub(crate) const LINK_HEADER_LEN: usize = 6;

/// How far ahead of the next expected sequence a reliable packet may be
/// and still be buffered. Anything further is left unacked and resent.
const REORDER_WINDOW: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PacketKind {
    Connect = 1,
    Accept = 2,
    Reliable = 3,
    Unreliable = 4,
    Ack = 5,
    Heartbeat = 6,
    Disconnect = 7,
}

impl PacketKind {
    fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Connect,
            2 => Self::Accept,
            3 => Self::Reliable,
            4 => Self::Unreliable,
            5 => Self::Ack,
            6 => Self::Heartbeat,
            7 => Self::Disconnect,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkHeader {
    pub kind: PacketKind,
    pub channel: u8,
    pub seq: u32,
}

impl LinkHeader {
    /// Splits the header off `packet`, leaving the body.
    pub fn split(packet: &mut Bytes) -> Option<Self> {
        if packet.len() < LINK_HEADER_LEN {
            return None;
        }
        let kind = PacketKind::from_u8(packet[0])?;
        packet.advance(1);
        let channel = packet.get_u8();
        let seq = packet.get_u32_le();
        Some(Self { kind, channel, seq })
    }
}

/// Builds a complete packet.
pub(crate) fn packet(kind: PacketKind, channel: u8, seq: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LINK_HEADER_LEN + body.len());
    buf.put_u8(kind as u8);
    buf.put_u8(channel);
    buf.put_u32_le(seq);
    buf.put_slice(body);
    buf.freeze()
}

/// A connect or accept packet carrying the session nonce.
pub(crate) fn nonce_packet(kind: PacketKind, nonce: u64) -> Bytes {
    packet(kind, 0, 0, &nonce.to_le_bytes())
}

/// Reads the nonce out of a connect/accept body.
pub(crate) fn read_nonce(body: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = body.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

/// `true` if `a` comes after `b` in wrapping sequence space.
pub(crate) fn seq_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

// ---------------------------------------------------------------------------
// Link state
// ---------------------------------------------------------------------------

struct Unacked {
    packet: Bytes,
    sent_at: Instant,
    resends: u32,
}

struct LinkState {
    next_reliable: Vec<u32>,
    next_unreliable: Vec<u32>,
    unacked: HashMap<(u8, u32), Unacked>,
    expected: Vec<u32>,
    reorder: Vec<HashMap<u32, Bytes>>,
    newest_unreliable: Vec<Option<u32>>,
    last_heard: Instant,
    last_sent: Instant,
}

impl LinkState {
    fn new(channels: usize) -> Self {
        let now = Instant::now();
        Self {
            next_reliable: vec![0; channels],
            next_unreliable: vec![0; channels],
            unacked: HashMap::new(),
            expected: vec![0; channels],
            reorder: vec![HashMap::new(); channels],
            newest_unreliable: vec![None; channels],
            last_heard: now,
            last_sent: now,
        }
    }
}

/// What the driver must do after one inbound packet.
#[derive(Debug, Default)]
pub(crate) struct Inbound {
    /// Frames released to the application, in order.
    pub deliver: Vec<Bytes>,
    /// An ack or accept to send back.
    pub reply: Option<Bytes>,
    /// The peer said goodbye.
    pub disconnected: bool,
}

/// What the driver must do on a timer tick.
#[derive(Debug, Default)]
pub(crate) struct Tick {
    pub resend: Vec<Bytes>,
    pub heartbeat: bool,
    pub failure: Option<TransportError>,
}

/// One peer's end of a datagram session.
pub(crate) struct Link {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    nonce: u64,
    config: DatagramConfig,
    state: Mutex<LinkState>,
}

impl Link {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, nonce: u64, config: DatagramConfig) -> Self {
        let channels = usize::from(config.channel_count.max(1));
        Self {
            socket,
            peer,
            nonce,
            config,
            state: Mutex::new(LinkState::new(channels)),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn config(&self) -> &DatagramConfig {
        &self.config
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of reliable packets still waiting for an ack.
    pub fn unacked(&self) -> usize {
        self.lock_state().unacked.len()
    }

    pub async fn send_raw(&self, packet: &[u8]) -> io::Result<()> {
        self.lock_state().last_sent = Instant::now();
        self.socket.send_to(packet, self.peer).await.map(|_| ())
    }

    /// Sends one frame on `route`.
    pub async fn send(&self, frame: Bytes, route: Route) -> Result<usize, TransportError> {
        let count = self.config.channel_count;
        if route.channel >= count {
            return Err(TransportError::InvalidChannel {
                channel: route.channel,
                count,
            });
        }
        let ch = usize::from(route.channel);

        let packet = {
            let mut state = self.lock_state();
            if route.is_reliable() {
                let seq = state.next_reliable[ch];
                state.next_reliable[ch] = seq.wrapping_add(1);
                let packet = packet(PacketKind::Reliable, route.channel, seq, &frame);
                state.unacked.insert(
                    (route.channel, seq),
                    Unacked {
                        packet: packet.clone(),
                        sent_at: Instant::now(),
                        resends: 0,
                    },
                );
                packet
            } else {
                let seq = state.next_unreliable[ch];
                state.next_unreliable[ch] = seq.wrapping_add(1);
                packet(PacketKind::Unreliable, route.channel, seq, &frame)
            }
        };

        self.send_raw(&packet)
            .await
            .map_err(TransportError::SendFailed)?;
        Ok(frame.len())
    }

    /// Applies one inbound packet to the link state.
    pub fn on_packet(&self, mut packet: Bytes) -> Inbound {
        let mut inbound = Inbound::default();
        let Some(header) = LinkHeader::split(&mut packet) else {
            tracing::debug!(peer = %self.peer, "dropping malformed datagram");
            return inbound;
        };

        let mut state = self.lock_state();
        state.last_heard = Instant::now();

        let ch = usize::from(header.channel);
        let channel_ok = header.channel < self.config.channel_count;

        match header.kind {
            PacketKind::Connect => {
                // The client never saw our accept; repeat it.
                if read_nonce(&packet) == Some(self.nonce) {
                    inbound.reply = Some(nonce_packet(PacketKind::Accept, self.nonce));
                }
            }
            PacketKind::Accept | PacketKind::Heartbeat => {}
            PacketKind::Ack => {
                state.unacked.remove(&(header.channel, header.seq));
            }
            PacketKind::Reliable if channel_ok => {
                let expected = state.expected[ch];
                if header.seq == expected {
                    inbound.deliver.push(packet);
                    let mut next = expected.wrapping_add(1);
                    while let Some(buffered) = state.reorder[ch].remove(&next) {
                        inbound.deliver.push(buffered);
                        next = next.wrapping_add(1);
                    }
                    state.expected[ch] = next;
                } else if seq_newer(header.seq, expected) {
                    if header.seq.wrapping_sub(expected) >= REORDER_WINDOW {
                        // Leave it unacked; the sender will try again.
                        return inbound;
                    }
                    state.reorder[ch].insert(header.seq, packet);
                }
                // Duplicates are acked again: our earlier ack may have been lost.
                inbound.reply = Some(self::packet(
                    PacketKind::Ack,
                    header.channel,
                    header.seq,
                    &[],
                ));
            }
            PacketKind::Unreliable if channel_ok => {
                match state.newest_unreliable[ch] {
                    Some(newest) if !seq_newer(header.seq, newest) => {
                        tracing::trace!(peer = %self.peer, seq = header.seq, "dropping stale packet");
                    }
                    _ => {
                        state.newest_unreliable[ch] = Some(header.seq);
                        inbound.deliver.push(packet);
                    }
                }
            }
            PacketKind::Reliable | PacketKind::Unreliable => {
                tracing::warn!(
                    peer = %self.peer,
                    channel = header.channel,
                    "dropping packet on unknown channel"
                );
            }
            PacketKind::Disconnect => inbound.disconnected = true,
        }
        inbound
    }

    /// Resends overdue packets and checks liveness.
    pub fn poll_timers(&self, now: Instant) -> Tick {
        let mut tick = Tick::default();
        let mut state = self.lock_state();

        let silent = now.saturating_duration_since(state.last_heard);
        if silent >= self.config.idle_timeout {
            tick.failure = Some(TransportError::PeerTimedOut(silent));
            return tick;
        }

        for entry in state.unacked.values_mut() {
            if now.saturating_duration_since(entry.sent_at) < self.config.resend_interval {
                continue;
            }
            if entry.resends >= self.config.max_resends {
                tick.failure = Some(TransportError::PeerTimedOut(
                    self.config.resend_interval * (entry.resends + 1),
                ));
                return tick;
            }
            entry.resends += 1;
            entry.sent_at = now;
            tick.resend.push(entry.packet.clone());
        }

        if now.saturating_duration_since(state.last_sent) >= self.config.heartbeat_interval {
            tick.heartbeat = true;
        }
        tick
    }
}

/// How often the driver checks timers.
fn tick_period(config: &DatagramConfig) -> Duration {
    (config.resend_interval.min(config.heartbeat_interval) / 2).max(Duration::from_millis(1))
}

/// Runs one peer's link until it closes, fails, or is shut down locally.
///
/// Delivered frames (still datagram-framed) and a terminal error, if any,
/// go to `delivered`; dropping it signals a clean close to the reader.
pub(crate) async fn drive(
    link: Arc<Link>,
    mut raw: mpsc::Receiver<Bytes>,
    delivered: mpsc::Sender<Result<Bytes, TransportError>>,
    mut shutdown: watch::Receiver<bool>,
    on_exit: Option<Box<dyn FnOnce() + Send>>,
) {
    let mut ticker = tokio::time::interval(tick_period(link.config()));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'run: loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            packet = raw.recv() => {
                let Some(packet) = packet else {
                    let _ = delivered
                        .send(Err(TransportError::ConnectionClosed(
                            "datagram socket shut down".into(),
                        )))
                        .await;
                    break;
                };
                let inbound = link.on_packet(packet);
                if let Some(reply) = inbound.reply {
                    if let Err(e) = link.send_raw(&reply).await {
                        tracing::debug!(peer = %link.peer(), error = %e, "reply send failed");
                    }
                }
                for frame in inbound.deliver {
                    if delivered.send(Ok(frame)).await.is_err() {
                        break 'run;
                    }
                }
                if inbound.disconnected {
                    tracing::debug!(peer = %link.peer(), "peer disconnected");
                    break;
                }
            }
            _ = ticker.tick() => {
                let tick = link.poll_timers(Instant::now());
                if let Some(err) = tick.failure {
                    tracing::warn!(peer = %link.peer(), error = %err, "datagram link failed");
                    let _ = delivered.send(Err(err)).await;
                    break;
                }
                for packet in tick.resend {
                    if let Err(e) = link.send_raw(&packet).await {
                        tracing::debug!(peer = %link.peer(), error = %e, "resend failed");
                    }
                }
                if tick.heartbeat {
                    let beat = packet(PacketKind::Heartbeat, 0, 0, &[]);
                    if let Err(e) = link.send_raw(&beat).await {
                        tracing::debug!(peer = %link.peer(), error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }

    if let Some(on_exit) = on_exit {
        on_exit();
    }
}
