//! Byte-stream abstraction consumed by the connection actor.
//!
//! Opening the socket (DNS, TCP connect, choosing a Unix socket) is left to the
//! caller; this module only knows how to read/write PostgreSQL messages on top
//! of whatever stream it is handed, and how to upgrade a plain TCP stream to
//! TLS when the connection state machine asks for it.

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[cfg(feature = "tls")]
use tokio_native_tls::TlsStream;

use crate::buffer::BufferSet;
use crate::error::{Error, Result};

/// A connected byte stream, plain or TLS-wrapped.
pub enum Stream {
    /// Plain TCP.
    Tcp(BufReader<TcpStream>),
    /// TLS over TCP.
    #[cfg(feature = "tls")]
    Tls(BufReader<TlsStream<TcpStream>>),
}

impl Stream {
    /// Wrap an already-connected TCP stream.
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(BufReader::new(stream))
    }

    /// Upgrade a plain TCP stream to TLS using the server name for verification.
    ///
    /// Only valid on a `Stream::Tcp`; called after the server has responded
    /// `'S'` to an `SSLRequest`.
    #[cfg(feature = "tls")]
    pub async fn upgrade_to_tls(self, host: &str) -> Result<Self> {
        match self {
            Stream::Tcp(reader) => {
                let tcp = reader.into_inner();
                let connector =
                    tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
                let tls = connector.connect(host, tcp).await.map_err(Error::from)?;
                Ok(Stream::Tls(BufReader::new(tls)))
            }
            Stream::Tls(_) => Err(Error::InvalidUsage("stream is already TLS".into())),
        }
    }

    async fn read_u8(&mut self) -> std::io::Result<u8> {
        match self {
            Stream::Tcp(r) => r.read_u8().await,
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.read_u8().await,
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.read_exact(buf).await.map(|_| ()),
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.read_exact(buf).await.map(|_| ()),
        }
    }

    /// Read a single byte, used for the SSL negotiation response.
    pub async fn read_ssl_response(&mut self) -> Result<u8> {
        Ok(self.read_u8().await?)
    }

    /// Read one PostgreSQL message (type byte + length-prefixed payload) into
    /// `buffer_set`.
    pub async fn read_message(&mut self, buffer_set: &mut BufferSet) -> Result<()> {
        buffer_set.type_byte = self.read_u8().await?;

        let mut length_bytes = [0u8; 4];
        self.read_exact(&mut length_bytes).await?;
        let length = u32::from_be_bytes(length_bytes) as usize;

        let payload_len = length.saturating_sub(4);
        buffer_set.read_buffer.clear();
        buffer_set.read_buffer.resize(payload_len, 0);
        self.read_exact(&mut buffer_set.read_buffer).await?;

        Ok(())
    }

    /// Write and flush `buf`.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().write_all(buf).await?,
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.get_mut().write_all(buf).await?,
        }
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().flush().await?,
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.get_mut().flush().await?,
        }
        Ok(())
    }
}
