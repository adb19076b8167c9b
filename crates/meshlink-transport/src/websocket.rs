//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! Each streamed frame (header included) travels as one binary WebSocket
//! message. WebSocket is reliable and ordered, so routes are ignored.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use meshlink_protocol::{
    DEFAULT_MAX_PAYLOAD, Frame, ProtocolError, Route, WireFormat,
    decode_stream_message,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{Connector, Listener, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn ws_io_error(e: tokio_tungstenite::tungstenite::Error) -> std::io::Error {
    std::io::Error::other(e)
}

/// How long an accepted socket gets to finish the HTTP upgrade.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upgraded connections waiting for `accept`.
const ACCEPT_BACKLOG: usize = 64;

/// A WebSocket [`Listener`].
///
/// An acceptor task takes TCP connections and runs each HTTP upgrade in
/// its own task under a timeout, so a socket that never upgrades cannot
/// hold up the ones behind it. Finished transports queue for `accept`.
pub struct WebSocketListener {
    local_addr: SocketAddr,
    incoming: Mutex<mpsc::Receiver<WebSocketTransport>>,
    shutdown: watch::Sender<bool>,
}

impl WebSocketListener {
    /// Binds a new WebSocket listener to the given address.
    pub async fn bind(addr: &str, max_payload: usize) -> Result<Self, TransportError> {
        Self::bind_with_timeout(addr, max_payload, DEFAULT_UPGRADE_TIMEOUT).await
    }

    /// Like [`bind`](Self::bind), with a custom upgrade timeout.
    pub async fn bind_with_timeout(
        addr: &str,
        max_payload: usize,
        upgrade_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_owned(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)?;
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(acceptor(
            listener,
            max_payload,
            upgrade_timeout,
            incoming_tx,
            shutdown_rx,
        ));
        tracing::info!(addr, "WebSocket transport listening");

        Ok(Self {
            local_addr,
            incoming: Mutex::new(incoming_rx),
            shutdown,
        })
    }
}

impl Listener for WebSocketListener {
    type Transport = WebSocketTransport;

    async fn accept(&self) -> Result<Self::Transport, TransportError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Shutdown)
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.local_addr)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.shutdown.send_replace(true);
        Ok(())
    }
}

impl Drop for WebSocketListener {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn acceptor(
    listener: TcpListener,
    max_payload: usize,
    upgrade_timeout: Duration,
    incoming: mpsc::Sender<WebSocketTransport>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "TCP accept failed");
                    continue;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "set_nodelay failed");
        }

        let incoming = incoming.clone();
        tokio::spawn(async move {
            let upgrade = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream));
            let ws = match tokio::time::timeout(upgrade_timeout, upgrade).await {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    tracing::debug!(%addr, error = %e, "WebSocket upgrade failed");
                    return;
                }
                Err(_) => {
                    tracing::warn!(%addr, timeout = ?upgrade_timeout, "WebSocket upgrade timed out");
                    return;
                }
            };
            tracing::debug!(%addr, "accepted WebSocket connection");
            let transport = WebSocketTransport::new(ws, Some(addr), max_payload);
            if incoming.send(transport).await.is_err() {
                tracing::debug!(%addr, "listener gone, dropping upgraded connection");
            }
        });
    }
    tracing::debug!("WebSocket acceptor stopped");
}

/// A single WebSocket connection.
///
/// Sink and stream halves are locked separately so a pending `recv`
/// never holds up a `send`.
pub struct WebSocketTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    peer_addr: Option<SocketAddr>,
    max_payload: usize,
}

impl WebSocketTransport {
    fn new(ws: WsStream, peer_addr: Option<SocketAddr>, max_payload: usize) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            peer_addr,
            max_payload,
        }
    }
}

impl Transport for WebSocketTransport {
    fn wire_format(&self) -> WireFormat {
        WireFormat::Streamed {
            max_payload: self.max_payload,
        }
    }

    async fn send_framed(&self, frame: Bytes, _route: Route) -> Result<usize, TransportError> {
        let len = frame.len();
        self.sink
            .lock()
            .await
            .send(Message::binary(frame))
            .await
            .map_err(|e| TransportError::SendFailed(ws_io_error(e)))?;
        Ok(len)
    }

    async fn recv_framed(&self) -> Result<Option<Frame>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(decode_stream_message(data, self.max_payload)?));
                }
                Some(Ok(Message::Text(_))) => {
                    return Err(ProtocolError::InvalidMessage(
                        "text WebSocket message where a binary frame was expected".into(),
                    )
                    .into());
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // skip ping/pong/frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(ws_io_error(e)));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        match self.sink.lock().await.close().await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(ws_io_error(e))),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// Dials `ws://host:port/`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    max_payload: usize,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(max_payload: usize, connect_timeout: Duration) -> Self {
        Self {
            max_payload,
            connect_timeout,
        }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD, Duration::from_secs(5))
    }
}

impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn dial(&self, host: &str, port: u16) -> Result<Self::Transport, TransportError> {
        let url = format!("ws://{host}:{port}/");
        let (ws, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| TransportError::ConnectTimeout {
                    addr: url.clone(),
                    timeout: self.connect_timeout,
                })?
                .map_err(|e| TransportError::Connect {
                    addr: url.clone(),
                    source: ws_io_error(e),
                })?;

        let peer_addr = match ws.get_ref() {
            MaybeTlsStream::Plain(stream) => {
                let _ = stream.set_nodelay(true);
                stream.peer_addr().ok()
            }
            _ => None,
        };
        tracing::debug!(%url, "WebSocket connected");
        Ok(WebSocketTransport::new(ws, peer_addr, self.max_payload))
    }
}
