//! Matches replies to outbound requests.
//!
//! A request is an ordinary message whose payload starts with a 4-byte
//! request id. The reply echoes that id on the response type:
//!
//! ```text
//! request:  [request_type]  id u32 | body
//! reply:    [response_type] id u32 | body
//! ```
//!
//! Each pending request is resolved exactly once: by its reply, by its
//! timer, or by [`fail_all`](RequestCorrelator::fail_all) when the
//! connection closes. Whoever removes the entry from the pending map wins;
//! the callback runs after the lock is released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use meshlink_protocol::{encode_request, split_request};
use meshlink_transport::Transport;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{Connection, RequestError, SessionError};

/// Called once with the reply body or the reason there is none.
pub type ReplyCallback = Box<dyn FnOnce(Result<Bytes, RequestError>) + Send>;

/// How many timed-out ids are remembered so their late replies can be
/// recognized and dropped.
const EXPIRED_MEMORY: usize = 256;

/// What [`RequestCorrelator::try_resolve`] did with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// It answered a pending request; the callback has run.
    Resolved,
    /// It answered a request that already timed out; dropped.
    Discarded,
    /// Not a reply to anything we sent. Route it normally.
    Unmatched,
}

struct Pending {
    response_type: u32,
    callback: ReplyCallback,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    pending: HashMap<u32, Pending>,
    expired: VecDeque<(u32, u32)>,
    expired_index: HashSet<(u32, u32)>,
}

impl Table {
    fn remember_expired(&mut self, request_id: u32, response_type: u32) {
        let key = (request_id, response_type);
        if self.expired_index.insert(key) {
            self.expired.push_back(key);
        }
        while self.expired.len() > EXPIRED_MEMORY {
            if let Some(old) = self.expired.pop_front() {
                self.expired_index.remove(&old);
            }
        }
    }
}

struct Shared {
    table: Mutex<Table>,
    next_id: AtomicU32,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, request_id: u32) {
        let pending = {
            let mut table = self.lock();
            let pending = table.pending.remove(&request_id);
            if let Some(p) = &pending {
                table.remember_expired(request_id, p.response_type);
            }
            pending
        };
        if let Some(pending) = pending {
            tracing::debug!(request_id, "request timed out");
            (pending.callback)(Err(RequestError::TimedOut { request_id }));
        }
    }
}

/// Tracks requests awaiting replies on one connection.
///
/// Cheap to clone; clones share the same pending table.
#[derive(Clone)]
pub struct RequestCorrelator {
    shared: Arc<Shared>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table::default()),
                next_id: AtomicU32::new(1),
            }),
        }
    }

    /// Sends a request and calls `callback` with the reply or the failure.
    ///
    /// The pending entry and its timer exist before the request is sent, so
    /// even an immediate reply finds it. If the send is rejected, the entry
    /// is removed, the error is returned, and `callback` never runs.
    ///
    /// Returns the request id.
    pub fn async_request<T, F>(
        &self,
        conn: &Connection<T>,
        request_type: u32,
        response_type: u32,
        body: &[u8],
        timeout: Duration,
        callback: F,
    ) -> Result<u32, SessionError>
    where
        T: Transport,
        F: FnOnce(Result<Bytes, RequestError>) + Send + 'static,
    {
        let request_id = {
            let mut table = self.shared.lock();
            let request_id = self.allocate_id(&table);
            let weak: Weak<Shared> = Arc::downgrade(&self.shared);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(shared) = weak.upgrade() {
                    shared.expire(request_id);
                }
            });
            table.pending.insert(
                request_id,
                Pending {
                    response_type,
                    callback: Box::new(callback),
                    timer,
                },
            );
            request_id
        };

        if let Err(e) = conn.send(request_type, &encode_request(request_id, body)) {
            let pending = self.shared.lock().pending.remove(&request_id);
            if let Some(pending) = pending {
                pending.timer.abort();
            }
            return Err(e);
        }

        tracing::trace!(request_id, request_type, response_type, "request sent");
        Ok(request_id)
    }

    /// Sends a request and waits for the reply.
    ///
    /// # Errors
    /// Send errors as in [`async_request`](Self::async_request), then
    /// [`SessionError::Request`] on timeout or close.
    pub async fn request<T: Transport>(
        &self,
        conn: &Connection<T>,
        request_type: u32,
        response_type: u32,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Bytes, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.async_request(conn, request_type, response_type, body, timeout, move |result| {
            let _ = tx.send(result);
        })?;
        let reply = rx.await.unwrap_or(Err(RequestError::ConnectionClosed))?;
        Ok(reply)
    }

    /// Offers an inbound message to the pending table.
    pub fn try_resolve(&self, type_id: u32, payload: &Bytes) -> Correlation {
        let Some((request_id, body)) = split_request(payload) else {
            return Correlation::Unmatched;
        };

        let pending = {
            let mut table = self.shared.lock();
            match table.pending.get(&request_id) {
                Some(p) if p.response_type == type_id => table.pending.remove(&request_id),
                _ if table.expired_index.contains(&(request_id, type_id)) => {
                    tracing::debug!(request_id, "discarding late reply");
                    return Correlation::Discarded;
                }
                _ => None,
            }
        };

        match pending {
            Some(pending) => {
                pending.timer.abort();
                (pending.callback)(Ok(body));
                Correlation::Resolved
            }
            None => Correlation::Unmatched,
        }
    }

    /// Fails every pending request with [`RequestError::ConnectionClosed`].
    pub fn fail_all(&self) {
        let drained: Vec<Pending> = self.shared.lock().pending.drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending requests");
        }
        for pending in drained {
            pending.timer.abort();
            (pending.callback)(Err(RequestError::ConnectionClosed));
        }
    }

    /// Number of requests still waiting.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Next id: wraps around, never 0, never one still pending.
    fn allocate_id(&self, table: &Table) -> u32 {
        loop {
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !table.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use meshlink_transport::{ConnectionId, StreamTransport};
    use tokio::io::DuplexStream;

    use super::*;
    use crate::{ConnectionConfig, ConnectionObserver};

    struct Quiet;

    impl ConnectionObserver for Quiet {
        fn on_message(&self, _: ConnectionId, _: u32, _: Bytes) {}
        fn on_close(&self, _: ConnectionId) {}
    }

    /// An open connection whose far end never answers.
    fn silent_connection() -> (Connection<StreamTransport<DuplexStream>>, DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let conn = Connection::accept(
            StreamTransport::new(a, None, 1024),
            Arc::new(Quiet),
            ConnectionConfig::default(),
        );
        conn.start();
        (conn, b)
    }

    #[tokio::test]
    async fn test_try_resolve_matching_reply_fires_callback_once() {
        let (conn, _far) = silent_connection();
        let correlator = RequestCorrelator::new();
        let (tx, rx) = oneshot::channel();

        let id = correlator
            .async_request(&conn, 4, 6, b"ping", Duration::from_secs(5), move |r| {
                let _ = tx.send(r);
            })
            .unwrap();

        let reply = encode_request(id, b"pong");
        assert_eq!(correlator.try_resolve(6, &reply), Correlation::Resolved);
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"pong"));

        // A duplicate reply no longer matches anything.
        assert_eq!(correlator.try_resolve(6, &reply), Correlation::Unmatched);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_try_resolve_wrong_response_type_is_unmatched() {
        let (conn, _far) = silent_connection();
        let correlator = RequestCorrelator::new();
        let id = correlator
            .async_request(&conn, 4, 6, b"", Duration::from_secs(5), |_| {})
            .unwrap();
        assert_eq!(
            correlator.try_resolve(99, &encode_request(id, b"")),
            Correlation::Unmatched
        );
        assert_eq!(correlator.pending(), 1);
    }

    #[tokio::test]
    async fn test_timeout_fires_then_late_reply_discarded() {
        let (conn, _far) = silent_connection();
        let correlator = RequestCorrelator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let counter = Arc::clone(&calls);
        let started = tokio::time::Instant::now();
        let id = correlator
            .async_request(&conn, 4, 6, b"", Duration::from_millis(50), move |r| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(r);
            })
            .unwrap();

        let result = rx.await.unwrap();
        assert_eq!(result, Err(RequestError::TimedOut { request_id: id }));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(
            correlator.try_resolve(6, &encode_request(id, b"late")),
            Correlation::Discarded
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reply_racing_timeout_fires_exactly_once() {
        const ROUNDS: usize = 64;
        let (conn, _far) = silent_connection();
        let correlator = RequestCorrelator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let mut resolved = 0;

        for _ in 0..ROUNDS {
            let (calls_in, timeouts_in) = (Arc::clone(&calls), Arc::clone(&timeouts));
            let id = correlator
                .async_request(&conn, 4, 6, b"", Duration::from_millis(1), move |r| {
                    calls_in.fetch_add(1, Ordering::SeqCst);
                    if r.is_err() {
                        timeouts_in.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();

            let replier = {
                let correlator = correlator.clone();
                tokio::spawn(async move {
                    let reply = encode_request(id, b"pong");
                    loop {
                        match correlator.try_resolve(6, &reply) {
                            Correlation::Unmatched => tokio::task::yield_now().await,
                            outcome => return outcome,
                        }
                    }
                })
            };
            if replier.await.unwrap() == Correlation::Resolved {
                resolved += 1;
            }
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), ROUNDS);
        assert_eq!(resolved + timeouts.load(Ordering::SeqCst), ROUNDS);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_fails_every_pending_request() {
        let (conn, _far) = silent_connection();
        let correlator = RequestCorrelator::new();
        let failures = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let failures = Arc::clone(&failures);
            correlator
                .async_request(&conn, 4, 6, b"", Duration::from_secs(5), move |r| {
                    assert_eq!(r, Err(RequestError::ConnectionClosed));
                    failures.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        correlator.fail_all();
        assert_eq!(failures.load(Ordering::SeqCst), 3);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_rejected_send_removes_entry_without_callback() {
        let (conn, _far) = silent_connection();
        let correlator = RequestCorrelator::new();
        let called = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&called);

        // 2 KiB exceeds the 1 KiB frame limit of the test transport.
        let result = correlator.async_request(
            &conn,
            4,
            6,
            &vec![0; 2048],
            Duration::from_millis(10),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(matches!(result, Err(SessionError::Frame(_))));
        assert_eq!(correlator.pending(), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_ids_skip_zero_on_wrap() {
        let correlator = RequestCorrelator::new();
        correlator.shared.next_id.store(u32::MAX, Ordering::Relaxed);
        let table = Table::default();
        assert_eq!(correlator.allocate_id(&table), u32::MAX);
        assert_eq!(correlator.allocate_id(&table), 1);
    }

    #[tokio::test]
    async fn test_request_future_resolves_on_close() {
        let (conn, _far) = silent_connection();
        let correlator = RequestCorrelator::new();

        let waiter = {
            let correlator = correlator.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                correlator
                    .request(&conn, 4, 6, b"", Duration::from_secs(5))
                    .await
            })
        };
        while correlator.pending() == 0 {
            tokio::task::yield_now().await;
        }
        correlator.fail_all();

        let result = waiter.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Request(RequestError::ConnectionClosed))
        ));
    }
}
