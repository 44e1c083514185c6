//! Socket transport for data connections.
//!
//! Each connection runs in its own task. The engine writes encoded frames into
//! an unbounded channel and receives [`TransportEvent`]s back; it never awaits
//! socket I/O itself.
//!
//! ```text
//!   engine ──frames──► writer half ──► socket
//!   engine ◄─events─── reader half ◄── socket (PacketDecoder)
//! ```
//!
//! Dropping the frame sender shuts the write half down and ends the task.

use super::connection::ConnId;
use crate::protocol::{Packet, PacketDecoder, PacketError};
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const READ_CHUNK_SIZE: usize = 16 * 1024;

#[cfg(feature = "tls")]
type TlsOption = Option<tokio_rustls::TlsConnector>;
#[cfg(not(feature = "tls"))]
type TlsOption = ();

/// Address of a data node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Parse `host:port`. Brackets around an IPv6 host are stripped.
    pub fn parse(address: &str, tls: bool) -> Option<Self> {
        let (host, port) = address.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        let port = port.parse().ok()?;
        Some(Self::new(host, port, tls))
    }

    /// Name used as the connection pool key.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Why a transport ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the stream.
    Eof,
    /// The local side dropped the frame sender.
    Shutdown,
    ConnectFailed(String),
    Tls(String),
    Io(String),
    Protocol(PacketError),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "closed by peer"),
            CloseReason::Shutdown => write!(f, "shut down"),
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            CloseReason::Tls(e) => write!(f, "tls handshake failed: {}", e),
            CloseReason::Io(e) => write!(f, "io error: {}", e),
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

/// Event posted by a transport task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(ConnId),
    Frame(ConnId, Packet),
    Closed(ConnId, CloseReason),
}

/// Opens data connections.
///
/// `connect` must not block. It returns the sender the engine writes frames
/// into; progress is reported on `events`, and every connection ends with
/// exactly one [`TransportEvent::Closed`].
pub trait Connector: Send {
    fn connect(
        &mut self,
        id: ConnId,
        endpoint: &Endpoint,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> mpsc::UnboundedSender<Bytes>;
}

/// TCP connector with optional TLS.
pub struct TcpConnector {
    connect_timeout: Duration,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsConnector>,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, connector: tokio_rustls::TlsConnector) -> Self {
        self.tls = Some(connector);
        self
    }
}

impl Connector for TcpConnector {
    fn connect(
        &mut self,
        id: ConnId,
        endpoint: &Endpoint,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> mpsc::UnboundedSender<Bytes> {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        #[cfg(feature = "tls")]
        let tls: TlsOption = self.tls.clone();
        #[cfg(not(feature = "tls"))]
        let tls: TlsOption = ();
        tokio::spawn(run_connection(
            id,
            endpoint.clone(),
            self.connect_timeout,
            tls,
            frames_rx,
            events,
        ));
        frames_tx
    }
}

async fn run_connection(
    id: ConnId,
    endpoint: Endpoint,
    connect_timeout: Duration,
    tls: TlsOption,
    frames: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    tracing::debug!(conn = %id, endpoint = %endpoint, "connecting");
    let address = (endpoint.host.as_str(), endpoint.port);
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = events.send(TransportEvent::Closed(
                id,
                CloseReason::ConnectFailed(e.to_string()),
            ));
            return;
        }
        Err(_) => {
            let _ = events.send(TransportEvent::Closed(
                id,
                CloseReason::ConnectFailed(format!("timed out after {:?}", connect_timeout)),
            ));
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(conn = %id, error = %e, "failed to set TCP_NODELAY");
    }

    if endpoint.tls {
        pump_tls(id, &endpoint, stream, tls, frames, events).await;
    } else {
        pump(id, stream, frames, events).await;
    }
}

#[cfg(feature = "tls")]
async fn pump_tls(
    id: ConnId,
    endpoint: &Endpoint,
    stream: TcpStream,
    tls: TlsOption,
    frames: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    use tokio_rustls::rustls::pki_types::ServerName;

    let Some(connector) = tls else {
        let reason = CloseReason::Tls("no TLS connector configured".to_string());
        let _ = events.send(TransportEvent::Closed(id, reason));
        return;
    };
    let server_name = match ServerName::try_from(endpoint.host.clone()) {
        Ok(name) => name,
        Err(e) => {
            let _ = events.send(TransportEvent::Closed(id, CloseReason::Tls(e.to_string())));
            return;
        }
    };
    match connector.connect(server_name, stream).await {
        Ok(stream) => pump(id, stream, frames, events).await,
        Err(e) => {
            let _ = events.send(TransportEvent::Closed(id, CloseReason::Tls(e.to_string())));
        }
    }
}

#[cfg(not(feature = "tls"))]
async fn pump_tls(
    id: ConnId,
    _endpoint: &Endpoint,
    _stream: TcpStream,
    _tls: TlsOption,
    _frames: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let reason = CloseReason::Tls("built without the tls feature".to_string());
    let _ = events.send(TransportEvent::Closed(id, reason));
}

/// Move frames in both directions until either side ends.
async fn pump<S>(
    id: ConnId,
    stream: S,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if events.send(TransportEvent::Connected(id)).is_err() {
        return;
    }
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            writer.write_all(&frame).await?;
        }
        writer.shutdown().await
    });

    let reason = tokio::select! {
        reason = read_frames(id, &mut reader, &events) => reason,
        result = &mut write_task => match result {
            Ok(Ok(())) => CloseReason::Shutdown,
            Ok(Err(e)) => CloseReason::Io(e.to_string()),
            Err(e) => CloseReason::Io(e.to_string()),
        },
    };
    write_task.abort();

    tracing::debug!(conn = %id, reason = %reason, "connection closed");
    let _ = events.send(TransportEvent::Closed(id, reason));
}

async fn read_frames<R>(
    id: ConnId,
    reader: &mut R,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    let mut decoder = PacketDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => return CloseReason::Eof,
            Ok(n) => n,
            Err(e) => return CloseReason::Io(e.to_string()),
        };
        match decoder.feed(&chunk[..n]) {
            Ok(packets) => {
                for packet in packets {
                    if events.send(TransportEvent::Frame(id, packet)).is_err() {
                        return CloseReason::Shutdown;
                    }
                }
            }
            Err(e) => return CloseReason::Protocol(e),
        }
    }
}
