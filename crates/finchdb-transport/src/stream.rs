//! Abstract byte-stream seam between connections and real transports.
//!
//! Connections never construct sockets or TLS sessions themselves; they
//! receive a [`ByteStream`] from a [`StreamFactory`]. Anything that can move
//! bytes (TCP, TLS, an in-memory duplex in tests) plugs in here.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// An open, ordered byte stream to one server.
#[async_trait]
pub trait ByteStream: Send {
    /// Writes the entire buffer.
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Fills the entire buffer, failing with `UnexpectedEof` if the peer
    /// closes mid-read.
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()>;

    /// Shuts the stream down. Idempotent.
    async fn close(&mut self) -> std::io::Result<()>;

    /// Whether the stream has been closed locally.
    fn is_closed(&self) -> bool;
}

/// Produces byte streams for a server address.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    /// Opens a stream to `address`.
    async fn create(&self, address: &str) -> std::io::Result<Box<dyn ByteStream>>;
}

/// Adapts any tokio I/O object into a [`ByteStream`].
pub struct IoByteStream<T> {
    io: T,
    closed: bool,
}

impl<T> IoByteStream<T> {
    /// Wraps an I/O object.
    pub fn new(io: T) -> Self {
        Self { io, closed: false }
    }
}

#[async_trait]
impl<T> ByteStream for IoByteStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.io.write_all(buf).await?;
        self.io.flush().await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.io.read_exact(buf).await.map(|_| ())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.io.shutdown().await
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_round_trip() {
        let (client, server) = tokio::io::duplex(256);
        let mut client = IoByteStream::new(client);
        let mut server = IoByteStream::new(server);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_read_after_peer_close_is_eof() {
        let (client, server) = tokio::io::duplex(256);
        let mut server = IoByteStream::new(server);
        drop(client);

        let mut buf = [0u8; 4];
        let err = server.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = tokio::io::duplex(256);
        let mut client = IoByteStream::new(client);
        assert!(!client.is_closed());
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());
    }
}
