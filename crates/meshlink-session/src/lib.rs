//! Session layer for Meshlink.
//!
//! This crate turns a raw [`Transport`](meshlink_transport::Transport) into
//! something applications can talk through:
//!
//! 1. **Connections** ([`Connection`]): a single-writer outgoing queue,
//!    a read loop feeding a [`ConnectionObserver`], byte counters, and an
//!    idempotent close.
//! 2. **Requests** ([`RequestCorrelator`]): match replies to outbound
//!    requests by id, with timeouts and cancellation on close.
//! 3. **Peers** ([`PeerTable`]): the server's view of who is connected,
//!    with names, broadcast, and kick.
//!
//! # How it fits in the stack
//!
//! ```text
//! Host (above)  <- servers and clients built from these pieces
//!     |
//! Session Layer (this crate)  <- connections, requests, peers
//!     |
//! Transport + Protocol (below)  <- frames on sockets
//! ```

mod connection;
mod correlator;
mod error;
mod peers;

pub use connection::{
    Connection, ConnectionConfig, ConnectionObserver, ConnectionState,
};
pub use correlator::{Correlation, ReplyCallback, RequestCorrelator};
pub use error::{RequestError, SessionError};
pub use peers::{BroadcastReport, PeerInfo, PeerTable};
