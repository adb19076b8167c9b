//! The server's table of connected peers.
//!
//! Every lookup takes the table lock briefly and clones what it needs; no
//! send or close ever happens while the lock is held.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use meshlink_protocol::PeerId;
use meshlink_transport::Transport;

use crate::{Connection, SessionError};

/// What the server knows about one peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Set by the handshake or by the application.
    pub name: Option<String>,
    pub addr: Option<SocketAddr>,
    pub connected_at: Instant,
    pub last_heard: Instant,
    pub handshaken: bool,
}

impl PeerInfo {
    fn new(id: PeerId, addr: Option<SocketAddr>) -> Self {
        let now = Instant::now();
        Self {
            id,
            name: None,
            addr,
            connected_at: now,
            last_heard: now,
            handshaken: false,
        }
    }
}

/// Outcome of a [`PeerTable::broadcast`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Peers whose send was rejected. The broadcast carries on past them.
    pub failed: Vec<PeerId>,
}

struct PeerEntry<T> {
    info: PeerInfo,
    connection: Connection<T>,
}

/// Connected peers keyed by [`PeerId`].
///
/// Ids come from a counter that starts at 1 and only grows, so an id is
/// never handed out twice for the life of the table.
pub struct PeerTable<T> {
    peers: Mutex<HashMap<PeerId, PeerEntry<T>>>,
    next_id: AtomicU64,
}

impl<T: Transport> Default for PeerTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> PeerTable<T> {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, PeerEntry<T>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out the next unused peer id.
    pub fn allocate_id(&self) -> PeerId {
        PeerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a connection under `id`.
    pub fn insert(&self, id: PeerId, connection: Connection<T>) {
        let info = PeerInfo::new(id, connection.peer_addr());
        self.lock().insert(id, PeerEntry { info, connection });
        tracing::debug!(peer = %id, "peer registered");
    }

    /// Removes a peer, returning its last known info.
    pub fn remove(&self, id: PeerId) -> Option<PeerInfo> {
        let removed = self.lock().remove(&id).map(|entry| entry.info);
        if removed.is_some() {
            tracing::debug!(peer = %id, "peer removed");
        }
        removed
    }

    pub fn connection(&self, id: PeerId) -> Option<Connection<T>> {
        self.lock().get(&id).map(|e| e.connection.clone())
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Connected ids in ascending order.
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn info(&self, id: PeerId) -> Option<PeerInfo> {
        self.lock().get(&id).map(|e| e.info.clone())
    }

    // -----------------------------------------------------------------------
    // Names and liveness
    // -----------------------------------------------------------------------

    /// Sets a peer's name. Returns `false` if the peer is gone.
    pub fn set_name(&self, id: PeerId, name: impl Into<String>) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                entry.info.name = Some(name.into());
                true
            }
            None => false,
        }
    }

    pub fn name_of(&self, id: PeerId) -> Option<String> {
        self.lock().get(&id).and_then(|e| e.info.name.clone())
    }

    /// The lowest id whose name is exactly `name`.
    ///
    /// Names aren't unique; taking the lowest id keeps the answer stable.
    pub fn find_by_name(&self, name: &str) -> Option<PeerId> {
        self.lock()
            .values()
            .filter(|e| e.info.name.as_deref() == Some(name))
            .map(|e| e.info.id)
            .min()
    }

    pub fn mark_handshaken(&self, id: PeerId) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                entry.info.handshaken = true;
                true
            }
            None => false,
        }
    }

    pub fn is_handshaken(&self, id: PeerId) -> bool {
        self.lock().get(&id).is_some_and(|e| e.info.handshaken)
    }

    /// Records that something was just heard from `id`.
    pub fn touch(&self, id: PeerId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.info.last_heard = Instant::now();
        }
    }

    /// Peers silent for longer than `max_idle`.
    pub fn stale_peers(&self, max_idle: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        let mut stale: Vec<PeerId> = self
            .lock()
            .values()
            .filter(|e| now.duration_since(e.info.last_heard) > max_idle)
            .map(|e| e.info.id)
            .collect();
        stale.sort_unstable();
        stale
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Sends to one peer.
    ///
    /// # Errors
    /// [`SessionError::PeerNotFound`] if `id` isn't connected, otherwise
    /// whatever [`Connection::send`] returns.
    pub fn send_to(&self, id: PeerId, type_id: u32, payload: &[u8]) -> Result<(), SessionError> {
        let connection = self.connection(id).ok_or(SessionError::PeerNotFound(id))?;
        connection.send(type_id, payload)
    }

    /// Sends to every peer except `exclude`.
    ///
    /// The recipient set is a snapshot taken when the call starts; a failed
    /// send is recorded and the rest still go out.
    pub fn broadcast(
        &self,
        type_id: u32,
        payload: &[u8],
        exclude: Option<PeerId>,
    ) -> BroadcastReport {
        let targets: Vec<(PeerId, Connection<T>)> = self
            .lock()
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(id, e)| (*id, e.connection.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, connection) in targets {
            match connection.send(type_id, payload) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(peer = %id, error = %e, "broadcast send failed");
                    report.failed.push(id);
                }
            }
        }
        report.failed.sort_unstable();
        report
    }

    /// Starts closing a peer's connection.
    ///
    /// The peer stays in the table until its close completes and the owner
    /// removes it.
    pub fn kick(&self, id: PeerId) -> Result<(), SessionError> {
        let connection = self.connection(id).ok_or(SessionError::PeerNotFound(id))?;
        tracing::info!(peer = %id, "kicking peer");
        connection.close();
        Ok(())
    }

    /// Empties the table, handing back every connection.
    pub fn drain(&self) -> Vec<(PeerId, Connection<T>)> {
        self.lock()
            .drain()
            .map(|(id, e)| (id, e.connection))
            .collect()
    }

    /// A snapshot of every connection.
    pub fn connections(&self) -> Vec<(PeerId, Connection<T>)> {
        self.lock()
            .iter()
            .map(|(id, e)| (*id, e.connection.clone()))
            .collect()
    }

    /// Total bytes sent and received across connected peers.
    pub fn traffic(&self) -> (u64, u64) {
        self.lock().values().fold((0, 0), |(sent, received), e| {
            (
                sent + e.connection.bytes_sent(),
                received + e.connection.bytes_received(),
            )
        })
    }
}

impl<T> std::fmt::Debug for PeerTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("PeerTable")
            .field("peers", &peers.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}
