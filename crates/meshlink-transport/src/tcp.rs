//! Stream transport: streamed frames over TCP (or any byte stream).
//!
//! Reading is two-phase: exactly [`STREAM_HEADER_LEN`] bytes for the
//! header, then exactly `payload_len` bytes for the payload. The header is
//! validated before the payload buffer is allocated.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use meshlink_protocol::{
    DEFAULT_MAX_PAYLOAD, Frame, ProtocolError, Route, STREAM_HEADER_LEN,
    StreamHeader, WireFormat,
};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::{Connector, Listener, Transport, TransportError, resolve};

/// A [`Transport`] over a duplex byte stream.
///
/// Generic over the stream so tests can run it on `tokio::io::duplex`
/// pipes. The read and write halves sit behind separate locks, so a
/// pending read never blocks a send.
pub struct StreamTransport<S = TcpStream> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    peer_addr: Option<SocketAddr>,
    max_payload: usize,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps an already-connected stream.
    pub fn new(stream: S, peer_addr: Option<SocketAddr>, max_payload: usize) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer_addr,
            max_payload,
        }
    }
}

impl StreamTransport<TcpStream> {
    /// Wraps a TCP stream, disabling Nagle's algorithm.
    pub fn from_tcp(stream: TcpStream, max_payload: usize) -> Result<Self, TransportError> {
        stream
            .set_nodelay(true)
            .map_err(TransportError::AcceptFailed)?;
        let peer_addr = stream.peer_addr().ok();
        Ok(Self::new(stream, peer_addr, max_payload))
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn wire_format(&self) -> WireFormat {
        WireFormat::Streamed {
            max_payload: self.max_payload,
        }
    }

    async fn send_framed(&self, frame: Bytes, _route: Route) -> Result<usize, TransportError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(TransportError::SendFailed)?;
        writer.flush().await.map_err(TransportError::SendFailed)?;
        Ok(frame.len())
    }

    async fn recv_framed(&self) -> Result<Option<Frame>, TransportError> {
        let mut reader = self.reader.lock().await;

        let mut raw = [0u8; STREAM_HEADER_LEN];
        let got = read_full(&mut *reader, &mut raw)
            .await
            .map_err(TransportError::ReceiveFailed)?;
        if got == 0 {
            return Ok(None);
        }
        if got < STREAM_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                len: got,
                needed: STREAM_HEADER_LEN,
            }
            .into());
        }

        let header = StreamHeader::decode(&raw, self.max_payload)?;
        let len = header.payload_len as usize;
        let mut payload = BytesMut::zeroed(len);
        let got = read_full(&mut *reader, &mut payload)
            .await
            .map_err(TransportError::ReceiveFailed)?;
        if got < len {
            return Err(ProtocolError::Truncated {
                len: STREAM_HEADER_LEN + got,
                needed: STREAM_HEADER_LEN + len,
            }
            .into());
        }

        Ok(Some(Frame {
            type_id: header.type_id,
            payload: payload.freeze(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            // Already gone from the other side.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e)),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// Reads until `buf` is full or the stream ends. Returns the byte count.
///
/// Unlike `read_exact`, an early EOF is reported as a short count so the
/// caller can tell "closed between frames" (0) from "closed mid-frame".
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Listener / connector
// ---------------------------------------------------------------------------

/// Accepts TCP connections and wraps each in a [`StreamTransport`].
pub struct StreamListener {
    listener: TcpListener,
    max_payload: usize,
}

impl StreamListener {
    /// Binds to `addr` (e.g. `"0.0.0.0:27015"`, or port 0 for tests).
    pub async fn bind(addr: &str, max_payload: usize) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_owned(),
                source,
            })?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self {
            listener,
            max_payload,
        })
    }
}

impl Listener for StreamListener {
    type Transport = StreamTransport;

    async fn accept(&self) -> Result<Self::Transport, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::debug!(%addr, "accepted TCP connection");
        StreamTransport::from_tcp(stream, self.max_payload)
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Dials TCP connections.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    max_payload: usize,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(max_payload: usize, connect_timeout: Duration) -> Self {
        Self {
            max_payload,
            connect_timeout,
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD, Duration::from_secs(5))
    }
}

impl Connector for TcpConnector {
    type Transport = StreamTransport;

    async fn dial(&self, host: &str, port: u16) -> Result<Self::Transport, TransportError> {
        let addrs = resolve(host, port).await?;
        let target = format!("{host}:{port}");

        let attempt = async {
            let mut last_err = None;
            for addr in &addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        tracing::debug!(%addr, error = %e, "connect attempt failed");
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotFound)))
        };

        let stream = tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: target.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|source| TransportError::Connect {
                addr: target.clone(),
                source,
            })?;

        tracing::debug!(addr = %target, "TCP connected");
        StreamTransport::from_tcp(stream, self.max_payload)
    }
}
