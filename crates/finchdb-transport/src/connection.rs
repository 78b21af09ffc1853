//! A single transport connection: one byte stream, framed send/receive,
//! negotiated compression, and command lifecycle events.
//!
//! The state machine is `Unopened -> Opening -> Open -> Closed`; `Closed` is
//! terminal and idempotent. Any stream-level failure closes the connection
//! before the error propagates, so a connection observed open has never
//! carried a torn frame. A command failure reported by the server leaves the
//! connection open.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::{doc, oid::ObjectId, Bson, Document};
use tracing::debug;

use crate::buffer::BufferPool;
use crate::compress::{self, Compressor};
use crate::error::{Result, TransportError};
use crate::events::{CommandEventSender, CommandMeta, CommandSpan};
use crate::handshake::{ConnectionDescription, ConnectionInitializer};
use crate::protocol::{
    decode_message, encode_command, Command, MessageHeader, MessageSettings, HEADER_LEN,
};
use crate::session::SessionState;
use crate::stream::{ByteStream, StreamFactory};

/// Identity of the server endpoint: the owning cluster plus its address.
/// Shared by a pool and every connection it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointId {
    /// The client/cluster this endpoint belongs to.
    pub cluster_id: ObjectId,
    /// Server address, host:port.
    pub address: String,
}

impl EndpointId {
    /// Creates an endpoint identity.
    pub fn new(cluster_id: ObjectId, address: impl Into<String>) -> Self {
        Self {
            cluster_id,
            address: address.into(),
        }
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (cluster {})", self.address, self.cluster_id)
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, no stream yet.
    Unopened,
    /// Stream and handshake in progress.
    Opening,
    /// Ready for traffic.
    Open,
    /// Terminal.
    Closed,
}

/// A reply to a command.
#[derive(Debug, Clone)]
pub struct CommandReply {
    /// The reply document.
    pub document: Document,
    /// Whether the server will stream further replies without a new request
    /// (exhaust mode).
    pub more_to_come: bool,
}

/// Builds and opens connections. The pool holds one of these as its item
/// factory; tests substitute fake stream factories and initializers.
#[derive(Clone)]
pub struct Connector {
    stream_factory: Arc<dyn StreamFactory>,
    initializer: Arc<dyn ConnectionInitializer>,
    buffers: Arc<BufferPool>,
    events: CommandEventSender,
    read_timeout: Option<Duration>,
}

impl Connector {
    /// Creates a connector.
    pub fn new(
        stream_factory: Arc<dyn StreamFactory>,
        initializer: Arc<dyn ConnectionInitializer>,
        buffers: Arc<BufferPool>,
        events: CommandEventSender,
    ) -> Self {
        Self {
            stream_factory,
            initializer,
            buffers,
            events,
            read_timeout: None,
        }
    }

    /// Applies a per-read timeout to connections built by this connector.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    /// Creates and opens a connection stamped with `generation`.
    pub async fn connect(
        &self,
        id: u64,
        endpoint: &EndpointId,
        generation: u32,
    ) -> Result<Connection> {
        let mut connection = Connection {
            id,
            endpoint: endpoint.clone(),
            generation,
            state: ConnectionState::Unopened,
            stream: None,
            description: ConnectionDescription::default(),
            settings: MessageSettings::default(),
            compressor: None,
            next_request_id: 1,
            last_request_id: 0,
            read_timeout: self.read_timeout,
            buffers: Arc::clone(&self.buffers),
            events: self.events.clone(),
            stream_factory: Arc::clone(&self.stream_factory),
            initializer: Arc::clone(&self.initializer),
            opened_at: Instant::now(),
            last_used: Instant::now(),
        };
        connection.open().await?;
        Ok(connection)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .finish()
    }
}

/// One pooled transport connection.
pub struct Connection {
    id: u64,
    endpoint: EndpointId,
    generation: u32,
    state: ConnectionState,
    stream: Option<Box<dyn ByteStream>>,
    description: ConnectionDescription,
    settings: MessageSettings,
    compressor: Option<Compressor>,
    next_request_id: i32,
    last_request_id: i32,
    read_timeout: Option<Duration>,
    buffers: Arc<BufferPool>,
    events: CommandEventSender,
    stream_factory: Arc<dyn StreamFactory>,
    initializer: Arc<dyn ConnectionInitializer>,
    opened_at: Instant,
    last_used: Instant,
}

impl Connection {
    /// Pool-local connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The endpoint this connection serves.
    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// The generation this connection was stamped with at creation.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u32) {
        self.generation = generation;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection is usable.
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// The server description learned during the handshake.
    pub fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    /// Backing process identifier in load-balanced mode.
    pub fn service_id(&self) -> Option<ObjectId> {
        self.description.service_id
    }

    /// The compressor negotiated for this connection, if any.
    pub fn compressor(&self) -> Option<Compressor> {
        self.compressor
    }

    /// When the connection finished opening.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// When the connection last carried traffic.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Opens the connection: stream, handshake, compressor negotiation.
    ///
    /// Any failure lands in `Closed`; the connection is never partially open.
    pub async fn open(&mut self) -> Result<()> {
        if self.state != ConnectionState::Unopened {
            return Err(TransportError::internal(format!(
                "open called on a connection in state {:?}",
                self.state
            )));
        }
        self.state = ConnectionState::Opening;
        match self.open_inner().await {
            Ok(()) => {
                self.state = ConnectionState::Open;
                self.opened_at = Instant::now();
                self.last_used = Instant::now();
                debug!(
                    id = self.id,
                    endpoint = %self.endpoint,
                    wire_version = self.settings.max_wire_version,
                    compressor = self.compressor.map(|c| c.name()).unwrap_or("none"),
                    "connection opened"
                );
                Ok(())
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    async fn open_inner(&mut self) -> Result<()> {
        let mut stream = self
            .stream_factory
            .create(&self.endpoint.address)
            .await
            .map_err(|source| TransportError::OpenFailure {
                addr: self.endpoint.address.clone(),
                source,
            })?;
        let request_id = self.take_request_id();
        let description = self
            .initializer
            .initialize(stream.as_mut(), &self.endpoint.address, request_id)
            .await?;
        self.compressor = Compressor::negotiate(&description.compressors);
        self.settings = description.message_settings();
        self.description = description;
        self.stream = Some(stream);
        Ok(())
    }

    /// Closes the connection and drops the stream. Idempotent.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        // Dropping the stream closes the underlying socket.
        self.stream = None;
        debug!(id = self.id, endpoint = %self.endpoint, "connection closed");
    }

    /// Sends a command and, unless it is fire-and-forget, reads its reply.
    ///
    /// Session cluster/operation time advance from the reply before the `ok`
    /// check, so even failed commands propagate causal-consistency state.
    pub async fn send_and_receive(
        &mut self,
        command: &Command,
        session: &mut SessionState,
    ) -> Result<CommandReply> {
        if self.state != ConnectionState::Open {
            return Err(TransportError::internal(format!(
                "send on a connection in state {:?}",
                self.state
            )));
        }
        let request_id = self.take_request_id();
        self.last_request_id = request_id;

        let mut buffer = self.buffers.acquire(1024);
        let out = buffer.as_mut_vec();
        out.clear();
        let encoded = encode_command(out, command, request_id, session, &self.settings)?;
        let sensitive = compress::is_security_sensitive(command.name(), &command.body);

        let meta = CommandMeta {
            connection_id: self.id,
            address: self.endpoint.address.clone(),
            request_id,
            database: command.database.clone(),
            command_name: command.name().to_string(),
        };
        // Started fires before the write; the encoded frame is only borrowed
        // for the duration of this call.
        let span = self
            .events
            .started(meta, buffer.as_slice(), encoded.command_range.clone(), sensitive);

        let write_result = if let Some(compressor) = self.compressor.filter(|_| !sensitive) {
            let mut wrapped = self.buffers.acquire(1024);
            let wrapped_out = wrapped.as_mut_vec();
            wrapped_out.clear();
            match compress::compress_message(buffer.as_slice(), compressor, wrapped_out) {
                Ok(()) => self.write_frame(wrapped.as_slice()).await,
                Err(err) => Err(err),
            }
        } else {
            self.write_frame(buffer.as_slice()).await
        };
        drop(buffer);
        if let Err(err) = write_result {
            self.events.failed(span, &err);
            return Err(err);
        }

        if !encoded.response_expected {
            self.last_used = Instant::now();
            self.events.succeeded_one_way(span);
            return Ok(CommandReply {
                document: doc! { "ok": 1 },
                more_to_come: false,
            });
        }

        let reply = match self.read_reply(request_id).await {
            Ok(reply) => reply,
            Err(err) => {
                self.events.failed(span, &err);
                return Err(err);
            }
        };
        self.finish_reply(command.name(), reply, session, Some(span))
    }

    /// Reads the next streamed reply of an exhaust exchange.
    pub async fn receive_more(&mut self, session: &mut SessionState) -> Result<CommandReply> {
        if self.state != ConnectionState::Open {
            return Err(TransportError::internal(format!(
                "receive on a connection in state {:?}",
                self.state
            )));
        }
        if self.last_request_id == 0 {
            return Err(TransportError::internal(
                "receive_more called before any exhaust request",
            ));
        }
        let reply = self.read_reply(self.last_request_id).await?;
        self.finish_reply("getMore", reply, session, None)
    }

    fn finish_reply(
        &mut self,
        command_name: &str,
        reply: CommandReply,
        session: &mut SessionState,
        span: Option<CommandSpan>,
    ) -> Result<CommandReply> {
        if let Some(Bson::Document(cluster_time)) = reply.document.get("$clusterTime") {
            session.advance_cluster_time(cluster_time);
        }
        if let Some(Bson::Timestamp(operation_time)) = reply.document.get("operationTime") {
            session.advance_operation_time(*operation_time);
        }
        match check_ok(command_name, &reply.document) {
            Ok(()) => {
                self.last_used = Instant::now();
                if let Some(span) = span {
                    self.events.succeeded(span, &reply.document);
                }
                Ok(reply)
            }
            Err(err) => {
                // The transport succeeded; the server reported the failure.
                // The connection stays open.
                self.last_used = Instant::now();
                if let Some(span) = span {
                    self.events.failed(span, &err);
                }
                Err(err)
            }
        }
    }

    async fn read_reply(&mut self, expected_response_to: i32) -> Result<CommandReply> {
        loop {
            let mut header_buf = [0u8; HEADER_LEN];
            self.read_exact_timed(&mut header_buf).await?;
            let header = match MessageHeader::read(&header_buf) {
                Ok(header) => header,
                Err(err) => {
                    self.close();
                    return Err(err);
                }
            };
            let total = header.message_length as usize;
            if total > self.settings.max_message_size + HEADER_LEN {
                self.close();
                return Err(TransportError::protocol(format!(
                    "reply declares {total} bytes, above the {}-byte limit",
                    self.settings.max_message_size
                )));
            }

            let mut frame = self.buffers.acquire(total);
            frame.as_mut_vec()[..HEADER_LEN].copy_from_slice(&header_buf);
            self.read_exact_timed(&mut frame.as_mut_vec()[HEADER_LEN..])
                .await?;

            if header.response_to != expected_response_to {
                // A stray reply to an earlier (fire-and-forget) request is
                // discarded; anything else means the stream is desynchronized.
                if header.response_to != 0 && header.response_to < expected_response_to {
                    debug!(
                        response_to = header.response_to,
                        expected = expected_response_to,
                        "discarding stray reply"
                    );
                    continue;
                }
                self.close();
                return Err(TransportError::protocol(format!(
                    "reply answers request {} but {} was expected",
                    header.response_to, expected_response_to
                )));
            }

            let decoded = match decode_message(frame.as_slice()) {
                Ok(decoded) => decoded,
                Err(err) => {
                    self.close();
                    return Err(err);
                }
            };
            let more_to_come = decoded.more_to_come();
            let document = match decoded.document() {
                Some(document) => document.clone(),
                None => {
                    self.close();
                    return Err(TransportError::protocol("reply holds no document"));
                }
            };
            return Ok(CommandReply {
                document,
                more_to_come,
            });
        }
    }

    async fn read_exact_timed(&mut self, buf: &mut [u8]) -> Result<()> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                return Err(TransportError::internal("connection has no stream"));
            }
        };
        let io_result = match self.read_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, stream.read_exact(buf)).await {
                Ok(result) => result,
                Err(_) => {
                    self.close();
                    return Err(TransportError::ReadTimeout {
                        addr: self.endpoint.address.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            },
            None => stream.read_exact(buf).await,
        };
        match io_result {
            Ok(()) => Ok(()),
            Err(source) => {
                self.close();
                if source.kind() == std::io::ErrorKind::UnexpectedEof {
                    Err(TransportError::PrematureEndOfStream {
                        addr: self.endpoint.address.clone(),
                    })
                } else {
                    Err(TransportError::ReadFailure {
                        addr: self.endpoint.address.clone(),
                        source,
                    })
                }
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                return Err(TransportError::internal("connection has no stream"));
            }
        };
        let result = stream.write_all(frame).await;
        match result {
            Ok(()) => Ok(()),
            Err(source) => {
                self.close();
                Err(TransportError::WriteFailure {
                    addr: self.endpoint.address.clone(),
                    source,
                })
            }
        }
    }

    fn take_request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }
}

/// Checks a reply's `ok` field, building a command failure from the embedded
/// error document when the server reported one.
pub(crate) fn check_ok(command_name: &str, response: &Document) -> Result<()> {
    let ok = match response.get("ok") {
        Some(Bson::Double(value)) => *value == 1.0,
        Some(Bson::Int32(value)) => *value == 1,
        Some(Bson::Int64(value)) => *value == 1,
        Some(Bson::Boolean(value)) => *value,
        // Absent or unexpected types pass; real servers always send ok.
        _ => true,
    };
    if ok {
        return Ok(());
    }
    let code = response.get_i32("code").unwrap_or(-1);
    let message = response
        .get_str("errmsg")
        .unwrap_or("command failed")
        .to_string();
    let labels = response
        .get_array("errorLabels")
        .map(|labels| {
            labels
                .iter()
                .filter_map(|label| label.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    Err(TransportError::CommandFailure {
        name: command_name.to_string(),
        code,
        message,
        labels,
        response: response.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::ConnectionInitializer;
    use crate::protocol::{msg_flags, MessageBody, OpCode};
    use crate::stream::IoByteStream;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct StaticInitializer(ConnectionDescription);

    #[async_trait]
    impl ConnectionInitializer for StaticInitializer {
        async fn initialize(
            &self,
            _stream: &mut dyn ByteStream,
            _address: &str,
            _request_id: i32,
        ) -> Result<ConnectionDescription> {
            Ok(self.0.clone())
        }
    }

    struct DuplexFactory {
        server_halves: Arc<Mutex<Vec<DuplexStream>>>,
    }

    impl DuplexFactory {
        fn new() -> (Self, Arc<Mutex<Vec<DuplexStream>>>) {
            let halves = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    server_halves: halves.clone(),
                },
                halves,
            )
        }
    }

    #[async_trait]
    impl StreamFactory for DuplexFactory {
        async fn create(&self, _address: &str) -> std::io::Result<Box<dyn ByteStream>> {
            let (client, server) = tokio::io::duplex(1024 * 1024);
            self.server_halves.lock().unwrap().push(server);
            Ok(Box::new(IoByteStream::new(client)))
        }
    }

    fn endpoint() -> EndpointId {
        EndpointId::new(ObjectId::new(), "db1:27017")
    }

    fn description(compressors: Vec<String>) -> ConnectionDescription {
        ConnectionDescription {
            max_wire_version: 17,
            compressors,
            ..ConnectionDescription::default()
        }
    }

    async fn open_connection(
        compressors: Vec<String>,
        read_timeout: Option<Duration>,
    ) -> (Connection, DuplexStream) {
        let (factory, halves) = DuplexFactory::new();
        let mut connector = Connector::new(
            Arc::new(factory),
            Arc::new(StaticInitializer(description(compressors))),
            BufferPool::with_defaults(),
            CommandEventSender::disabled(),
        );
        if let Some(timeout) = read_timeout {
            connector = connector.with_read_timeout(timeout);
        }
        let connection = connector.connect(1, &endpoint(), 0).await.unwrap();
        let server = halves.lock().unwrap().pop().unwrap();
        (connection, server)
    }

    async fn read_frame(server: &mut DuplexStream) -> Vec<u8> {
        let mut header = [0u8; HEADER_LEN];
        server.read_exact(&mut header).await.unwrap();
        let parsed = MessageHeader::read(&header).unwrap();
        let mut frame = header.to_vec();
        frame.resize(parsed.message_length as usize, 0);
        server.read_exact(&mut frame[HEADER_LEN..]).await.unwrap();
        frame
    }

    fn msg_reply(response_to: i32, document: &Document, flags: i32) -> Vec<u8> {
        let mut frame = Vec::new();
        MessageHeader {
            message_length: 0,
            request_id: 9000,
            response_to,
            op_code: OpCode::Msg,
        }
        .write(&mut frame);
        frame.extend_from_slice(&flags.to_le_bytes());
        frame.push(0);
        document.to_writer(&mut frame).unwrap();
        let len = frame.len() as i32;
        frame[0..4].copy_from_slice(&len.to_le_bytes());
        frame
    }

    async fn respond_once(server: &mut DuplexStream, document: Document) {
        let frame = read_frame(server).await;
        let decoded = decode_message(&frame).unwrap();
        let reply = msg_reply(decoded.header.request_id, &document, 0);
        server.write_all(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_negotiates_compressor() {
        let (connection, _server) =
            open_connection(vec!["snappy".to_string(), "zlib".to_string()], None).await;
        assert!(connection.is_open());
        assert_eq!(
            connection.compressor(),
            Some(Compressor::Zlib { level: 6 })
        );
    }

    #[tokio::test]
    async fn test_open_failure_closes() {
        struct FailingFactory;

        #[async_trait]
        impl StreamFactory for FailingFactory {
            async fn create(&self, _address: &str) -> std::io::Result<Box<dyn ByteStream>> {
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                ))
            }
        }

        let connector = Connector::new(
            Arc::new(FailingFactory),
            Arc::new(StaticInitializer(description(vec![]))),
            BufferPool::with_defaults(),
            CommandEventSender::disabled(),
        );
        let err = connector.connect(1, &endpoint(), 0).await.unwrap_err();
        assert!(matches!(err, TransportError::OpenFailure { .. }));
    }

    #[tokio::test]
    async fn test_send_and_receive_round_trip() {
        let (mut connection, mut server) = open_connection(vec![], None).await;
        let server_task = tokio::spawn(async move {
            respond_once(
                &mut server,
                doc! {
                    "ok": 1.0,
                    "n": 1,
                    "$clusterTime": { "clusterTime": Bson::Timestamp(bson::Timestamp { time: 88, increment: 1 }) },
                    "operationTime": Bson::Timestamp(bson::Timestamp { time: 88, increment: 1 }),
                },
            )
            .await;
            server
        });

        let mut session = SessionState::new();
        let command = Command::new("app", doc! { "insert": "users" });
        let reply = connection
            .send_and_receive(&command, &mut session)
            .await
            .unwrap();
        assert_eq!(reply.document.get_i32("n").unwrap(), 1);
        assert!(connection.is_open());
        assert!(session.cluster_time().is_some());
        assert_eq!(
            session.operation_time(),
            Some(bson::Timestamp { time: 88, increment: 1 })
        );
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_command_failure_keeps_connection_open() {
        let (mut connection, mut server) = open_connection(vec![], None).await;
        let server_task = tokio::spawn(async move {
            respond_once(
                &mut server,
                doc! { "ok": 0.0, "code": 11000, "errmsg": "duplicate key", "errorLabels": ["RetryableWriteError"] },
            )
            .await;
            server
        });

        let mut session = SessionState::new();
        let command = Command::new("app", doc! { "insert": "users" });
        let err = connection
            .send_and_receive(&command, &mut session)
            .await
            .unwrap_err();
        match err {
            TransportError::CommandFailure {
                code,
                message,
                labels,
                ..
            } => {
                assert_eq!(code, 11000);
                assert_eq!(message, "duplicate key");
                assert_eq!(labels, vec!["RetryableWriteError".to_string()]);
            }
            other => panic!("expected command failure, got {other:?}"),
        }
        assert!(connection.is_open());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_mid_frame_closes_connection() {
        let (mut connection, mut server) = open_connection(vec![], None).await;
        let server_task = tokio::spawn(async move {
            let _ = read_frame(&mut server).await;
            drop(server);
        });

        let mut session = SessionState::new();
        let command = Command::new("app", doc! { "ping": 1 });
        let err = connection
            .send_and_receive(&command, &mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PrematureEndOfStream { .. }));
        assert_eq!(connection.state(), ConnectionState::Closed);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_closes_connection() {
        let (mut connection, mut server) =
            open_connection(vec![], Some(Duration::from_millis(50))).await;
        let server_task = tokio::spawn(async move {
            // Swallow the request, never reply.
            let _ = read_frame(&mut server).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(server);
        });

        let mut session = SessionState::new();
        let command = Command::new("app", doc! { "ping": 1 });
        let err = connection
            .send_and_receive(&command, &mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ReadTimeout { .. }));
        assert_eq!(connection.state(), ConnectionState::Closed);
        server_task.abort();
    }

    #[tokio::test]
    async fn test_one_way_skips_read_and_sets_flag() {
        let (mut connection, mut server) = open_connection(vec![], None).await;

        let mut session = SessionState::new();
        let command = Command::new("app", doc! { "insert": "logs" }).fire_and_forget();
        let reply = connection
            .send_and_receive(&command, &mut session)
            .await
            .unwrap();
        assert_eq!(reply.document.get_i32("ok").unwrap(), 1);

        let frame = read_frame(&mut server).await;
        let decoded = decode_message(&frame).unwrap();
        match decoded.body {
            MessageBody::Msg { flags, .. } => {
                assert_ne!(flags & msg_flags::MORE_TO_COME, 0);
            }
            other => panic!("expected msg body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sensitive_command_bypasses_compression() {
        let (mut connection, mut server) = open_connection(vec!["zlib".to_string()], None).await;
        assert!(connection.compressor().is_some());

        let server_task = tokio::spawn(async move {
            // saslStart arrives uncompressed.
            let frame = read_frame(&mut server).await;
            let header = MessageHeader::read(&frame).unwrap();
            assert_eq!(header.op_code, OpCode::Msg);
            let decoded = decode_message(&frame).unwrap();
            let reply = msg_reply(decoded.header.request_id, &doc! { "ok": 1.0 }, 0);
            server.write_all(&reply).await.unwrap();

            // An ordinary command arrives wrapped in the compressed envelope.
            let frame = read_frame(&mut server).await;
            let header = MessageHeader::read(&frame).unwrap();
            assert_eq!(header.op_code, OpCode::Compressed);
            let decoded = decode_message(&frame).unwrap();
            let reply = msg_reply(decoded.header.request_id, &doc! { "ok": 1.0 }, 0);
            server.write_all(&reply).await.unwrap();
        });

        let mut session = SessionState::new();
        let sasl = Command::new("admin", doc! { "saslStart": 1, "mechanism": "SCRAM-SHA-256" });
        connection.send_and_receive(&sasl, &mut session).await.unwrap();

        let find = Command::new("app", doc! { "find": "users" });
        connection.send_and_receive(&find, &mut session).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stray_reply_is_discarded() {
        let (mut connection, mut server) = open_connection(vec![], None).await;
        let server_task = tokio::spawn(async move {
            let frame = read_frame(&mut server).await;
            let decoded = decode_message(&frame).unwrap();
            // A stale reply to an earlier request id arrives first.
            let stray = msg_reply(decoded.header.request_id - 1, &doc! { "ok": 1.0 }, 0);
            server.write_all(&stray).await.unwrap();
            let real = msg_reply(decoded.header.request_id, &doc! { "ok": 1.0, "n": 7 }, 0);
            server.write_all(&real).await.unwrap();
        });

        let mut session = SessionState::new();
        let command = Command::new("app", doc! { "ping": 1 });
        let reply = connection
            .send_and_receive(&command, &mut session)
            .await
            .unwrap();
        assert_eq!(reply.document.get_i32("n").unwrap(), 7);
        assert!(connection.is_open());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_exhaust_receive_more() {
        let (mut connection, mut server) = open_connection(vec![], None).await;
        let server_task = tokio::spawn(async move {
            let frame = read_frame(&mut server).await;
            let decoded = decode_message(&frame).unwrap();
            let request_id = decoded.header.request_id;
            let first = msg_reply(request_id, &doc! { "ok": 1.0, "batch": 1 }, msg_flags::MORE_TO_COME);
            server.write_all(&first).await.unwrap();
            let second = msg_reply(request_id, &doc! { "ok": 1.0, "batch": 2 }, 0);
            server.write_all(&second).await.unwrap();
        });

        let mut session = SessionState::new();
        let mut command = Command::new("app", doc! { "getMore": 42i64 });
        command.exhaust_allowed = true;
        let first = connection
            .send_and_receive(&command, &mut session)
            .await
            .unwrap();
        assert!(first.more_to_come);
        assert_eq!(first.document.get_i32("batch").unwrap(), 1);

        let second = connection.receive_more(&mut session).await.unwrap();
        assert!(!second.more_to_come);
        assert_eq!(second.document.get_i32("batch").unwrap(), 2);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_on_closed_connection_fails() {
        let (mut connection, _server) = open_connection(vec![], None).await;
        connection.close();
        connection.close(); // idempotent

        let mut session = SessionState::new();
        let command = Command::new("app", doc! { "ping": 1 });
        let err = connection
            .send_and_receive(&command, &mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Internal { .. }));
    }
}
