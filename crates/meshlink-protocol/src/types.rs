//! Identity and delivery types shared by every layer.
//!
//! - [`PeerId`]: who a connection belongs to on the server.
//! - [`PacketType`]: the built-in type ids the hosts understand themselves.
//! - [`Route`] / [`DeliveryPolicy`]: how each type id travels (reliable or
//!   not, on which channel).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Number of channels a datagram transport opens unless configured otherwise.
pub const DEFAULT_CHANNEL_COUNT: u8 = 3;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Server-assigned identifier for a connected peer.
///
/// Ids start at 1 and are never reused within one server run, so a stale id
/// held by application code can only miss, never hit the wrong peer.
///
/// `#[serde(transparent)]` keeps it a bare number when serialized:
/// `PeerId(42)` becomes `42`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub u64);

/// `tracing::info!(%peer_id, "joined")` prints `peer_id=peer-42`.
impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Built-in packet types
// ---------------------------------------------------------------------------

/// Type ids reserved by the hosts. Application ids should start above
/// these; datagram transports additionally cap every id at 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    /// Client announces its name; server answers with a `Welcome`.
    Handshake = 0,
    /// Player input, high rate, loss tolerated.
    Input = 1,
    /// World state, high rate, loss tolerated.
    State = 2,
    /// Server-originated peer lifecycle events.
    Event = 3,
    /// Echo request; payload comes back unchanged on [`PacketType::Pong`].
    Ping = 4,
    /// Orderly goodbye.
    Disconnect = 5,
    /// Echo reply.
    Pong = 6,
}

impl PacketType {
    /// All built-in types, in id order.
    pub const ALL: [PacketType; 7] = [
        Self::Handshake,
        Self::Input,
        Self::State,
        Self::Event,
        Self::Ping,
        Self::Disconnect,
        Self::Pong,
    ];

    /// The numeric type id.
    pub const fn id(self) -> u32 {
        self as u32
    }
}

impl From<PacketType> for u32 {
    fn from(packet: PacketType) -> Self {
        packet.id()
    }
}

impl TryFrom<u32> for PacketType {
    type Error = ProtocolError;

    fn try_from(type_id: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|packet| packet.id() == type_id)
            .ok_or(ProtocolError::UnknownPacketType(type_id))
    }
}

// ---------------------------------------------------------------------------
// Delivery policy
// ---------------------------------------------------------------------------

/// The delivery guarantee requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reliability {
    /// Acknowledged, retransmitted, delivered in order per channel.
    #[default]
    Reliable,
    /// Sequenced but fire-and-forget; stale packets are dropped.
    Unreliable,
}

/// Where and how one message type travels.
///
/// Stream transports are reliable by nature and ignore the route; datagram
/// transports use it to pick a channel and a reliability mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Route {
    pub reliability: Reliability,
    pub channel: u8,
}

impl Route {
    /// Reliable delivery on `channel`.
    pub const fn reliable(channel: u8) -> Self {
        Self {
            reliability: Reliability::Reliable,
            channel,
        }
    }

    /// Unreliable delivery on `channel`.
    pub const fn unreliable(channel: u8) -> Self {
        Self {
            reliability: Reliability::Unreliable,
            channel,
        }
    }

    /// `true` for [`Reliability::Reliable`].
    pub fn is_reliable(&self) -> bool {
        self.reliability == Reliability::Reliable
    }
}

/// Maps type ids to [`Route`]s.
///
/// A policy with a fallback routes every id; a strict policy (no fallback)
/// rejects ids it has no entry for, which the connection layer treats as a
/// protocol error on inbound frames.
///
/// The default policy routes the built-in types like this and sends
/// anything else reliably on channel 0:
///
/// | Type                                     | Route            |
/// |------------------------------------------|------------------|
/// | Handshake, Event, Disconnect, Ping, Pong | reliable, ch 0   |
/// | Input, State                             | unreliable, ch 1 |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    routes: HashMap<u32, Route>,
    fallback: Option<Route>,
}

impl DeliveryPolicy {
    /// A policy that knows only the built-in types and has no fallback.
    pub fn strict() -> Self {
        let mut routes = HashMap::new();
        for packet in PacketType::ALL {
            let route = match packet {
                PacketType::Input | PacketType::State => Route::unreliable(1),
                _ => Route::reliable(0),
            };
            routes.insert(packet.id(), route);
        }
        Self {
            routes,
            fallback: None,
        }
    }

    /// The built-in routes plus `fallback` for every other id.
    pub fn permissive(fallback: Route) -> Self {
        Self {
            fallback: Some(fallback),
            ..Self::strict()
        }
    }

    /// Builder-style [`set_route`](Self::set_route).
    pub fn with_route(mut self, type_id: u32, route: Route) -> Self {
        self.set_route(type_id, route);
        self
    }

    /// Assigns (or replaces) the route for `type_id`.
    pub fn set_route(&mut self, type_id: u32, route: Route) {
        self.routes.insert(type_id, route);
    }

    /// Removes the fallback, making unknown ids an error.
    pub fn without_fallback(mut self) -> Self {
        self.fallback = None;
        self
    }

    /// Looks up the route for `type_id`.
    ///
    /// # Errors
    /// [`ProtocolError::UnknownPacketType`] if the id has no entry and the
    /// policy has no fallback.
    pub fn route(&self, type_id: u32) -> Result<Route, ProtocolError> {
        self.routes
            .get(&type_id)
            .copied()
            .or(self.fallback)
            .ok_or(ProtocolError::UnknownPacketType(type_id))
    }

    /// `true` if `type_id` would be accepted.
    pub fn knows(&self, type_id: u32) -> bool {
        self.route(type_id).is_ok()
    }

    /// The highest channel index any route uses.
    pub fn max_channel(&self) -> u8 {
        self.routes
            .values()
            .chain(self.fallback.iter())
            .map(|route| route.channel)
            .max()
            .unwrap_or(0)
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::permissive(Route::reliable(0))
    }
}
