//! Framed protocol client.
//!
//! `ClientConnection` wraps any async byte stream with the frame codec:
//! `send` writes one complete frame, `recv` reads until one complete frame is
//! buffered and decodes it. Bytes never surface before the TLS layer reports
//! the stream encrypted, because the stream handed in here *is* the TLS
//! stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use latcheck_proto::{extract_frame, Message, MessageType, ProtoError};
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Time allowed for TCP connect and for the TLS handshake, each.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default limit on waiting for one response frame.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side transport failures.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed by server")]
    Closed,

    #[error("invalid server name {0:?}")]
    ServerName(String),

    #[error("server answered {got} where {expected} was expected")]
    Unexpected {
        expected: &'static str,
        got: MessageType,
    },
}

/// A framed protocol connection over any async stream.
pub struct ClientConnection<S> {
    stream: S,
    buf: BytesMut,
    response_timeout: Duration,
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            response_timeout: RESPONSE_TIMEOUT,
        }
    }

    pub fn with_response_timeout(mut self, limit: Duration) -> Self {
        self.response_timeout = limit;
        self
    }

    /// Write one frame.
    pub async fn send(&mut self, msg: &Message) -> Result<(), NetError> {
        let frame = msg.encode()?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read until one complete frame is available and decode it.
    pub async fn recv(&mut self) -> Result<Message, NetError> {
        loop {
            if let Some((msg_type, payload)) = extract_frame(&mut self.buf)? {
                return Ok(Message::decode(msg_type, payload)?);
            }
            let n = timeout(self.response_timeout, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| NetError::Timeout)??;
            if n == 0 {
                return Err(NetError::Closed);
            }
        }
    }

    /// Send a request and wait for the matching response.
    pub async fn request(&mut self, msg: Message) -> Result<Message, NetError> {
        self.send(&msg).await?;
        self.recv().await
    }

    /// Close the connection, draining pending writes.
    pub async fn shutdown(mut self) -> Result<(), NetError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Dial the collection server and complete the TLS handshake.
pub async fn connect_tls(
    host: &str,
    port: u16,
    tls: Arc<rustls::ClientConfig>,
) -> Result<ClientConnection<TlsStream<TcpStream>>, NetError> {
    let addr = format!("{host}:{port}");
    debug!(addr = %addr, "connecting to collection server");

    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| NetError::Timeout)??;
    tcp.set_nodelay(true).ok();
    let peer: SocketAddr = tcp.peer_addr()?;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| NetError::ServerName(host.to_string()))?;
    let connector = TlsConnector::from(tls);
    let stream = timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| NetError::Timeout)??;

    let (_, session) = stream.get_ref();
    info!(
        peer = %peer,
        version = ?session.protocol_version(),
        cipher = ?session.negotiated_cipher_suite().map(|s| s.suite()),
        "TLS session established"
    );

    Ok(ClientConnection::new(stream))
}

/// Dial + handshake + immediate close: reachability probe without a login.
pub async fn test_connection(
    host: &str,
    port: u16,
    tls: Arc<rustls::ClientConfig>,
) -> Result<(), NetError> {
    let conn = connect_tls(host, port, tls).await?;
    conn.shutdown().await
}
