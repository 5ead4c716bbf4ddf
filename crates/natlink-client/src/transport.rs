//! Byte-stream transport: TCP with optional in-place TLS upgrade.

use crate::config::TlsOptions;
use crate::endpoint::ServerEndpoint;
use crate::error::{NatsError, Result};
use crate::tls::TlsConnector;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};

/// Bytes requested from the socket per read.
pub const READ_LENGTH: usize = 20 * 1024;

/// Capacity of the outbound write buffer.
pub const WRITE_BUFFER_SIZE: usize = 32 * 1024;

/// Any bidirectional byte stream the engine can drive.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased stream, plain or TLS.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens streams to endpoints and upgrades them to TLS.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a plain stream to `endpoint`.
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<BoxedStream>;

    /// Runs the TLS handshake over an already open stream.
    async fn upgrade(&self, endpoint: &ServerEndpoint, stream: BoxedStream) -> Result<BoxedStream>;
}

/// TCP connector configuration.
#[derive(Debug, Clone)]
pub struct TcpConnectorConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            nodelay: true,
        }
    }
}

/// Default [`Connector`] over tokio TCP and rustls.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: TcpConnectorConfig,
    tls: Option<TlsConnector>,
}

impl TcpConnector {
    /// Creates a connector. TLS is available only when `tls` names a CA bundle or a validator.
    pub fn new(config: TcpConnectorConfig, tls: &TlsOptions) -> Result<Self> {
        let has_material =
            tls.ca_cert_pem.is_some() || tls.ca_cert_file.is_some() || tls.validator.is_some();
        let tls = if has_material {
            Some(TlsConnector::new(tls)?)
        } else {
            None
        };
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<BoxedStream> {
        let addr = endpoint.socket_addr();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                NatsError::connection(format!(
                    "connect to {} timed out after {}ms",
                    addr, self.config.connect_timeout_ms
                ))
            })??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr = %addr, "TCP connected");
        Ok(Box::new(stream))
    }

    async fn upgrade(&self, endpoint: &ServerEndpoint, stream: BoxedStream) -> Result<BoxedStream> {
        let tls = self.tls.as_ref().ok_or_else(|| NatsError::Tls {
            reason: "no TLS material configured".into(),
        })?;
        let stream = tls.connect(endpoint.host(), stream).await?;
        tracing::debug!(server = %endpoint, "TLS established");
        Ok(Box::new(stream))
    }
}

async fn read_into<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    buf.reserve(READ_LENGTH);
    let n = reader.read_buf(buf).await?;
    if n == 0 {
        return Err(NatsError::connection("connection closed by server"));
    }
    Ok(buf.split().freeze())
}

/// An open session stream used during the handshake, before it is split.
pub struct Transport {
    stream: BoxedStream,
    read_buf: BytesMut,
}

impl Transport {
    /// Wraps an open stream.
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_LENGTH),
        }
    }

    /// Reads the next segment. `Ok(None)` when `timeout` elapsed first.
    pub async fn read_segment(&mut self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        let read = read_into(&mut self.stream, &mut self.read_buf);
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(segment) => segment.map(Some),
                Err(_) => Ok(None),
            },
            None => read.await.map(Some),
        }
    }

    /// Writes and flushes `data`.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Upgrades the stream to TLS in place.
    pub async fn upgrade(
        self,
        connector: &dyn Connector,
        endpoint: &ServerEndpoint,
    ) -> Result<Self> {
        let stream = connector.upgrade(endpoint, self.stream).await?;
        Ok(Self::new(stream))
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        let (read, write) = tokio::io::split(self.stream);
        (
            TransportReader {
                half: read,
                buf: self.read_buf,
            },
            TransportWriter {
                half: BufWriter::with_capacity(WRITE_BUFFER_SIZE, write),
            },
        )
    }
}

/// Read half owned by the connection worker.
pub struct TransportReader {
    half: ReadHalf<BoxedStream>,
    buf: BytesMut,
}

impl TransportReader {
    /// Reads the next segment. Cancel-safe.
    pub async fn read_segment(&mut self) -> Result<Bytes> {
        read_into(&mut self.half, &mut self.buf).await
    }
}

/// Buffered write half, shared behind the writer lock.
pub struct TransportWriter {
    half: BufWriter<WriteHalf<BoxedStream>>,
}

impl TransportWriter {
    /// Writes all `parts` back to back, then flushes.
    pub async fn write_parts(&mut self, parts: &[&[u8]]) -> Result<()> {
        for part in parts {
            self.half.write_all(part).await?;
        }
        self.half.flush().await?;
        Ok(())
    }

    /// Flushes and closes the write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.half.shutdown().await?;
        Ok(())
    }
}
