//! A live link to one remote endpoint.
//!
//! A [`Connection`] owns a transport and runs two kinds of task on it:
//!
//! - one **reader** that pulls frames, checks them against the delivery
//!   policy, counts them, and hands them to the [`ConnectionObserver`];
//! - at most one **drain** at a time that writes queued frames in order.
//!
//! ```text
//!              send() ─┐                        ┌─▶ on_message
//!   (any task)         ▼                        │
//!            [ outgoing queue ] ──drain──▶ Transport ──reader──┘
//! ```
//!
//! Sends frame synchronously (oversize and unroutable messages fail right
//! at the call site) and never block on the socket.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start()──────────────▶ Open ──close()──▶ Closing ──▶ Closed
//!   └──connect()──▶ Connecting ──┘                              ▲
//!                        └──────────── dial failed ─────────────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use meshlink_protocol::{DeliveryPolicy, Route, TypeRegistry};
use meshlink_transport::{ConnectionId, Transport, TransportError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::SessionError;

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, not yet running.
    Idle,
    /// Dialing (initiating side only).
    Connecting,
    /// Reading and accepting sends.
    Open,
    /// Close requested; the outgoing queue is draining.
    Closing,
    /// Done. `on_close` has returned, unless the dial failed.
    Closed,
}

/// Receives a connection's events.
///
/// Called from the connection's reader task, so implementations should
/// hand heavy work off rather than do it inline. All methods may call back
/// into the connection (`send`, `close`) freely.
pub trait ConnectionObserver: Send + Sync + 'static {
    /// A frame arrived.
    fn on_message(&self, conn: ConnectionId, type_id: u32, payload: Bytes);

    /// The connection failed; `on_close` follows.
    fn on_error(&self, conn: ConnectionId, error: &TransportError) {
        let _ = (conn, error);
    }

    /// The connection reached [`ConnectionState::Closed`]. Fires exactly once.
    fn on_close(&self, conn: ConnectionId);
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Routes outbound frames and validates inbound type ids.
    pub policy: Arc<DeliveryPolicy>,
    /// How long `close` lets the outgoing queue drain.
    pub linger: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            policy: Arc::new(DeliveryPolicy::default()),
            linger: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct Outgoing {
    queue: VecDeque<(Bytes, Route)>,
    write_in_progress: bool,
    /// Set by `close`; nothing is queued afterwards.
    closing: bool,
}

struct Inner<T> {
    id: ConnectionId,
    transport: OnceLock<T>,
    observer: Arc<dyn ConnectionObserver>,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    outgoing: Mutex<Outgoing>,
    /// `true` while no drain task is running.
    idle: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    close_started: AtomicBool,
    close_notified: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// A handle to one connection. Clones share the same connection.
pub struct Connection<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Connection<T> {
    fn build(
        transport: Option<T>,
        observer: Arc<dyn ConnectionObserver>,
        config: ConnectionConfig,
    ) -> Self {
        let slot = OnceLock::new();
        if let Some(transport) = transport {
            let _ = slot.set(transport);
        }
        let id = ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(Inner {
                id,
                transport: slot,
                observer,
                config,
                state: watch::Sender::new(ConnectionState::Idle),
                outgoing: Mutex::new(Outgoing::default()),
                idle: watch::Sender::new(true),
                shutdown: watch::Sender::new(false),
                close_started: AtomicBool::new(false),
                close_notified: AtomicBool::new(false),
                reader: Mutex::new(None),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }),
        }
    }

    /// Wraps an accepted transport. Call [`start`](Self::start) once the
    /// connection is registered wherever its events will be routed.
    pub fn accept(
        transport: T,
        observer: Arc<dyn ConnectionObserver>,
        config: ConnectionConfig,
    ) -> Self {
        Self::build(Some(transport), observer, config)
    }

    /// Creates an idle connection with no transport yet, for
    /// [`connect`](Self::connect).
    pub fn new(observer: Arc<dyn ConnectionObserver>, config: ConnectionConfig) -> Self {
        Self::build(None, observer, config)
    }

    /// Moves an accepted connection from `Idle` to `Open` and starts reading.
    pub fn start(&self) {
        let opened = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Idle && self.inner.transport.get().is_some() {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        });
        if opened {
            self.spawn_reader();
        } else {
            tracing::debug!(id = %self.inner.id, state = ?self.state(), "start ignored");
        }
    }

    /// Dials with `dial` and opens the connection.
    ///
    /// # Errors
    /// - [`SessionError::NotOpen`] if the connection isn't idle.
    /// - [`SessionError::Transport`] if the dial fails or the connection
    ///   was closed while dialing.
    pub async fn connect<F>(&self, dial: F) -> Result<(), SessionError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let began = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Idle {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(self.not_open());
        }

        let transport = match dial.await {
            Ok(transport) => transport,
            Err(e) => {
                self.inner.state.send_replace(ConnectionState::Closed);
                return Err(e.into());
            }
        };

        if self.inner.transport.set(transport).is_err() {
            return Err(self.not_open());
        }

        let opened = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        });
        if !opened {
            // close() ran while we were dialing.
            if let Some(transport) = self.inner.transport.get() {
                let _ = transport.close().await;
            }
            return Err(TransportError::ConnectionClosed("closed while connecting".into()).into());
        }

        tracing::debug!(id = %self.inner.id, peer = ?self.peer_addr(), "connection open");
        self.spawn_reader();
        Ok(())
    }

    fn spawn_reader(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(read_loop(inner));
        *self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn not_open(&self) -> SessionError {
        SessionError::NotOpen {
            id: self.inner.id,
            state: self.state(),
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Frames `payload` under `type_id` and queues it for writing.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// - [`SessionError::NotOpen`] unless the connection is `Open`.
    /// - [`SessionError::Frame`] if the type has no route or the frame
    ///   exceeds the transport's size limit. Nothing is queued.
    pub fn send(&self, type_id: u32, payload: &[u8]) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Open {
            return Err(self.not_open());
        }
        let transport = self.inner.transport.get().ok_or_else(|| self.not_open())?;
        let route = self.inner.config.policy.route(type_id)?;
        let frame = transport.wire_format().encode(type_id, payload)?;
        if self.enqueue(frame, route) {
            Ok(())
        } else {
            Err(self.not_open())
        }
    }

    /// Serializes `value` through `registry` and sends it.
    pub fn send_typed<V: 'static>(
        &self,
        registry: &TypeRegistry,
        type_id: u32,
        value: &V,
    ) -> Result<(), SessionError> {
        let payload = registry.serialize(type_id, value)?;
        self.send(type_id, &payload)
    }

    /// Returns `false` if a close already sealed the queue.
    fn enqueue(&self, frame: Bytes, route: Route) -> bool {
        let start_drain = {
            let mut out = self.inner.lock_outgoing();
            if out.closing {
                return false;
            }
            out.queue.push_back((frame, route));
            if out.write_in_progress {
                false
            } else {
                out.write_in_progress = true;
                self.inner.idle.send_replace(false);
                true
            }
        };
        if start_drain {
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }
        true
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Starts a graceful close. Idempotent and non-blocking; safe to call
    /// from this connection's own observer.
    ///
    /// The close stops the reader, lets queued frames drain (bounded by the
    /// linger time), shuts the transport, and then fires `on_close` once.
    /// The state becomes `Closed` only after `on_close` returns.
    pub fn close(&self) {
        if self.inner.close_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.lock_outgoing().closing = true;
        // Sends are refused from here on.
        self.inner.state.send_if_modified(|state| match state {
            ConnectionState::Closed => false,
            _ => {
                *state = ConnectionState::Closing;
                true
            }
        });
        tokio::spawn(close_sequence(Arc::clone(&self.inner)));
    }

    /// Resolves once the connection is `Closed`.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Frame bytes written so far.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    /// Frame bytes read so far.
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.get().and_then(|t| t.peer_addr())
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl<T> Inner<T> {
    fn lock_outgoing(&self) -> std::sync::MutexGuard<'_, Outgoing> {
        self.outgoing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reports `error` and starts closing. Silent once `on_close` has run.
    fn fail(self: &Arc<Self>, error: &TransportError)
    where
        T: Transport,
    {
        if !self.close_notified.load(Ordering::Acquire) {
            self.observer.on_error(self.id, error);
        }
        Connection {
            inner: Arc::clone(self),
        }
        .close();
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn read_loop<T: Transport>(inner: Arc<Inner<T>>) {
    let Some(transport) = inner.transport.get() else {
        return;
    };
    let mut shutdown = inner.shutdown.subscribe();
    let format = transport.wire_format();

    loop {
        let received = tokio::select! {
            // Closed locally: the close sequence does the rest.
            _ = stop_requested(&mut shutdown) => return,
            received = transport.recv_framed() => received,
        };

        match received {
            Ok(Some(frame)) => {
                if let Err(e) = inner.config.policy.route(frame.type_id) {
                    tracing::warn!(id = %inner.id, type_id = frame.type_id, "unroutable frame");
                    inner.fail(&TransportError::Frame(e));
                    return;
                }
                inner
                    .bytes_received
                    .fetch_add(format.wire_len(frame.payload.len()) as u64, Ordering::Relaxed);
                tracing::trace!(id = %inner.id, type_id = frame.type_id, len = frame.payload.len(), "frame received");
                inner.observer.on_message(inner.id, frame.type_id, frame.payload);
            }
            Ok(None) => {
                tracing::debug!(id = %inner.id, "remote closed the connection");
                Connection {
                    inner: Arc::clone(&inner),
                }
                .close();
                return;
            }
            Err(e) => {
                tracing::warn!(id = %inner.id, error = %e, "read failed");
                inner.fail(&e);
                return;
            }
        }
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn drain<T: Transport>(inner: Arc<Inner<T>>) {
    let Some(transport) = inner.transport.get() else {
        return;
    };

    loop {
        let next = {
            let mut out = inner.lock_outgoing();
            match out.queue.pop_front() {
                Some(next) => next,
                None => {
                    out.write_in_progress = false;
                    inner.idle.send_replace(true);
                    return;
                }
            }
        };

        let (frame, route) = next;
        match transport.send_framed(frame, route).await {
            Ok(written) => {
                inner.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(id = %inner.id, error = %e, "write failed");
                {
                    let mut out = inner.lock_outgoing();
                    out.queue.clear();
                    out.write_in_progress = false;
                    inner.idle.send_replace(true);
                }
                inner.fail(&e);
                return;
            }
        }
    }
}

async fn close_sequence<T: Transport>(inner: Arc<Inner<T>>) {
    inner.shutdown.send_replace(true);

    let reader = inner
        .reader
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(reader) = reader {
        let _ = reader.await;
    }

    let mut idle = inner.idle.subscribe();
    if tokio::time::timeout(inner.config.linger, idle.wait_for(|idle| *idle))
        .await
        .is_err()
    {
        tracing::warn!(id = %inner.id, "outgoing queue not drained before linger elapsed");
    }

    if let Some(transport) = inner.transport.get() {
        if let Err(e) = transport.close().await {
            tracing::debug!(id = %inner.id, error = %e, "transport close failed");
        }
    }

    if !inner.close_notified.swap(true, Ordering::AcqRel) {
        inner.observer.on_close(inner.id);
    }
    inner.state.send_replace(ConnectionState::Closed);
    tracing::debug!(id = %inner.id, "connection closed");
}
