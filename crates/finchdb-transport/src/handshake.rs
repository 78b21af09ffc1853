//! Connection initialization seam.
//!
//! Opening a connection runs an initializer that learns the server's limits
//! and capabilities. The default implementation sends a `hello` command in
//! the legacy frame format (the only format guaranteed before the wire
//! version is known). Authentication mechanics live outside this crate;
//! custom initializers can layer them on top.

use async_trait::async_trait;
use bson::{doc, oid::ObjectId};

use crate::error::{Result, TransportError};
use crate::protocol::{
    decode_message, encode_command, Command, MessageHeader, MessageSettings, DEFAULT_MAX_BATCH_COUNT,
    DEFAULT_MAX_DOCUMENT_SIZE, DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN,
};
use crate::session::SessionState;
use crate::stream::ByteStream;

/// What the server told us about itself during initialization.
#[derive(Debug, Clone)]
pub struct ConnectionDescription {
    /// Server-assigned connection id, if advertised.
    pub connection_id: Option<i64>,
    /// Highest wire version the server speaks.
    pub max_wire_version: i32,
    /// Maximum total message size in bytes.
    pub max_message_size: usize,
    /// Maximum document size in bytes.
    pub max_document_size: usize,
    /// Maximum documents per write batch.
    pub max_write_batch_size: usize,
    /// Compressor names the server advertised, in its preference order.
    pub compressors: Vec<String>,
    /// Backing process identifier in load-balanced mode.
    pub service_id: Option<ObjectId>,
}

impl Default for ConnectionDescription {
    fn default() -> Self {
        Self {
            connection_id: None,
            max_wire_version: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_write_batch_size: DEFAULT_MAX_BATCH_COUNT,
            compressors: Vec::new(),
            service_id: None,
        }
    }
}

impl ConnectionDescription {
    /// Message settings derived from this description.
    pub fn message_settings(&self) -> MessageSettings {
        MessageSettings {
            max_wire_version: self.max_wire_version,
            max_message_size: self.max_message_size,
            max_document_size: self.max_document_size,
            max_batch_count: self.max_write_batch_size,
            ..MessageSettings::default()
        }
    }
}

/// Initializes a freshly opened byte stream into a usable connection.
#[async_trait]
pub trait ConnectionInitializer: Send + Sync {
    /// Runs the initialization exchange and returns the server description.
    async fn initialize(
        &self,
        stream: &mut dyn ByteStream,
        address: &str,
        request_id: i32,
    ) -> Result<ConnectionDescription>;
}

/// Default initializer: one `hello` round trip in the legacy frame format.
///
/// Optional fields absent from the reply silently fall back to defaults
/// rather than failing; servers that advertise nothing still connect.
#[derive(Debug, Clone, Default)]
pub struct HelloInitializer;

impl HelloInitializer {
    /// Creates the initializer.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionInitializer for HelloInitializer {
    async fn initialize(
        &self,
        stream: &mut dyn ByteStream,
        address: &str,
        request_id: i32,
    ) -> Result<ConnectionDescription> {
        let open_failure = |source: std::io::Error| TransportError::OpenFailure {
            addr: address.to_string(),
            source,
        };

        // The wire version is unknown until the reply arrives, so the
        // request must use the legacy format.
        let settings = MessageSettings {
            max_wire_version: 0,
            ..MessageSettings::default()
        };
        let command = Command::new("admin", doc! { "hello": 1 });
        let mut frame = Vec::new();
        let mut scratch = SessionState::new();
        encode_command(&mut frame, &command, request_id, &mut scratch, &settings)?;
        stream.write_all(&frame).await.map_err(open_failure)?;

        let mut header_buf = [0u8; HEADER_LEN];
        stream.read_exact(&mut header_buf).await.map_err(open_failure)?;
        let header = MessageHeader::read(&header_buf)?;
        if header.message_length as usize > DEFAULT_MAX_MESSAGE_SIZE + HEADER_LEN {
            return Err(TransportError::protocol(format!(
                "handshake reply declares {} bytes",
                header.message_length
            )));
        }
        if header.response_to != request_id {
            return Err(TransportError::protocol(format!(
                "handshake reply answers request {} but {} was sent",
                header.response_to, request_id
            )));
        }
        let mut reply = header_buf.to_vec();
        reply.resize(header.message_length as usize, 0);
        stream
            .read_exact(&mut reply[HEADER_LEN..])
            .await
            .map_err(open_failure)?;

        let decoded = decode_message(&reply)?;
        let response = decoded
            .document()
            .ok_or_else(|| TransportError::protocol("handshake reply holds no document"))?;
        crate::connection::check_ok("hello", response)?;

        Ok(ConnectionDescription {
            connection_id: response
                .get_i64("connectionId")
                .ok()
                .or_else(|| response.get_i32("connectionId").ok().map(i64::from)),
            max_wire_version: response.get_i32("maxWireVersion").unwrap_or(0),
            max_message_size: response
                .get_i32("maxMessageSizeBytes")
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            max_document_size: response
                .get_i32("maxBsonObjectSize")
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_MAX_DOCUMENT_SIZE),
            max_write_batch_size: response
                .get_i32("maxWriteBatchSize")
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_MAX_BATCH_COUNT),
            compressors: response
                .get_array("compression")
                .map(|names| {
                    names
                        .iter()
                        .filter_map(|name| name.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            service_id: response.get_object_id("serviceId").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageBody, OpCode};
    use crate::stream::IoByteStream;
    use bson::Bson;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn serve_hello(server: tokio::io::DuplexStream, reply_body: bson::Document) {
        let mut server = server;
        let mut header = [0u8; HEADER_LEN];
        server.read_exact(&mut header).await.unwrap();
        let parsed = MessageHeader::read(&header).unwrap();
        assert_eq!(parsed.op_code, OpCode::Query);
        let mut body = vec![0u8; parsed.message_length as usize - HEADER_LEN];
        server.read_exact(&mut body).await.unwrap();

        let mut frame = header.to_vec();
        frame.extend_from_slice(&body);
        let decoded = decode_message(&frame).unwrap();
        match decoded.body {
            MessageBody::Query {
                full_collection_name,
                document,
                ..
            } => {
                assert_eq!(full_collection_name, "admin.$cmd");
                assert_eq!(document.get_i32("hello").unwrap(), 1);
            }
            other => panic!("expected legacy query, got {other:?}"),
        }

        let mut reply = Vec::new();
        MessageHeader {
            message_length: 0,
            request_id: 1000,
            response_to: parsed.request_id,
            op_code: OpCode::Reply,
        }
        .write(&mut reply);
        reply.extend_from_slice(&0i32.to_le_bytes());
        reply.extend_from_slice(&0i64.to_le_bytes());
        reply.extend_from_slice(&0i32.to_le_bytes());
        reply.extend_from_slice(&1i32.to_le_bytes());
        reply_body.to_writer(&mut reply).unwrap();
        let len = reply.len() as i32;
        reply[0..4].copy_from_slice(&len.to_le_bytes());
        server.write_all(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_hello_reads_description() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let server_task = tokio::spawn(serve_hello(
            server,
            doc! {
                "ok": 1.0,
                "maxWireVersion": 17,
                "maxMessageSizeBytes": 48_000_000i32,
                "maxBsonObjectSize": 16_777_216i32,
                "maxWriteBatchSize": 100_000i32,
                "compression": ["zstd", "zlib"],
                "connectionId": 42i32,
            },
        ));

        let mut stream = IoByteStream::new(client);
        let description = HelloInitializer::new()
            .initialize(&mut stream, "db1:27017", 1)
            .await
            .unwrap();
        assert_eq!(description.max_wire_version, 17);
        assert_eq!(description.compressors, vec!["zstd", "zlib"]);
        assert_eq!(description.connection_id, Some(42));
        assert!(description.service_id.is_none());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hello_falls_back_to_defaults() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let server_task = tokio::spawn(serve_hello(server, doc! { "ok": 1.0 }));

        let mut stream = IoByteStream::new(client);
        let description = HelloInitializer::new()
            .initialize(&mut stream, "db1:27017", 1)
            .await
            .unwrap();
        assert_eq!(description.max_wire_version, 0);
        assert_eq!(description.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(description.max_document_size, DEFAULT_MAX_DOCUMENT_SIZE);
        assert!(description.compressors.is_empty());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hello_failure_surfaces_command_error() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let server_task = tokio::spawn(serve_hello(
            server,
            doc! { "ok": Bson::Double(0.0), "code": 18, "errmsg": "auth required" },
        ));

        let mut stream = IoByteStream::new(client);
        let err = HelloInitializer::new()
            .initialize(&mut stream, "db1:27017", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::CommandFailure { code: 18, .. }));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hello_peer_close_is_open_failure() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        drop(server);
        let mut stream = IoByteStream::new(client);
        let err = HelloInitializer::new()
            .initialize(&mut stream, "db1:27017", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::OpenFailure { .. }));
    }
}
