//! TCP stream factory.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::stream::{ByteStream, IoByteStream, StreamFactory};

/// TCP connection settings.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// How long to wait for the TCP handshake.
    pub connect_timeout: Duration,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
        }
    }
}

/// Opens plain TCP streams.
#[derive(Debug, Clone, Default)]
pub struct TcpStreamFactory {
    config: TcpConfig,
}

impl TcpStreamFactory {
    /// Creates a factory with the given settings.
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StreamFactory for TcpStreamFactory {
    async fn create(&self, address: &str) -> std::io::Result<Box<dyn ByteStream>> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "connecting to {address} timed out after {:?}",
                        self.config.connect_timeout
                    ),
                )
            })??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        debug!(address, "TCP connected");
        Ok(Box::new(IoByteStream::new(stream)))
    }
}
