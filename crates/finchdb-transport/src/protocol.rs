//! Binary wire protocol codec.
//!
//! Commands are framed in one of three formats: the extensible message format
//! (opcode 2013) used at wire version 6 and above, the legacy query/reply pair
//! (2004/1) used below it, and a compressed envelope (2012) wrapping either.
//! Format selection is a pure function of the negotiated wire version and is
//! resolved once per connection, not per message.
//!
//! Session metadata (`$db`, `$clusterTime`, `lsid`, transaction fields,
//! `maxTimeMS`) is merged into the serialized command by splicing extra
//! elements before the document terminator; the caller's document is never
//! mutated.

use std::ops::Range;

use bson::{doc, Bson, Document};
use bytes::Buf;

use crate::error::{Result, TransportError};
use crate::session::SessionState;

/// Fixed message header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Wire version at which the extensible message format replaced legacy query.
pub const OP_MSG_WIRE_VERSION: i32 = 6;

/// Wire version at which multi-statement transactions became available.
pub const TRANSACTIONS_WIRE_VERSION: i32 = 7;

/// Default maximum total message size in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Default maximum size of a single document in bytes.
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum number of documents in one write batch.
pub const DEFAULT_MAX_BATCH_COUNT: usize = 100_000;

/// Extra bytes a command document may use beyond the document limit, covering
/// the elements this codec injects.
const DOCUMENT_HEADROOM: usize = 16 * 1024;

/// Flag bits for the extensible message format.
pub mod msg_flags {
    /// A CRC-32C checksum trails the body.
    pub const CHECKSUM_PRESENT: i32 = 1;
    /// No response is expected to this message.
    pub const MORE_TO_COME: i32 = 1 << 1;
    /// The server may reply with a stream of messages.
    pub const EXHAUST_ALLOWED: i32 = 1 << 16;
}

/// Flag bits for the legacy query format.
pub mod query_flags {
    /// The query may run against a non-primary member.
    pub const SECONDARY_OK: i32 = 1 << 2;
}

/// The closed set of message kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Legacy reply to a legacy query.
    Reply,
    /// Legacy query.
    Query,
    /// Compressed envelope wrapping another message.
    Compressed,
    /// Extensible message.
    Msg,
}

impl OpCode {
    /// The numeric opcode.
    pub fn as_i32(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Query => 2004,
            OpCode::Compressed => 2012,
            OpCode::Msg => 2013,
        }
    }

    /// Parses a numeric opcode.
    pub fn from_i32(raw: i32) -> Result<Self> {
        match raw {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2012 => Ok(OpCode::Compressed),
            2013 => Ok(OpCode::Msg),
            other => Err(TransportError::protocol(format!("unknown opcode {other}"))),
        }
    }
}

/// The fixed 16-byte little-endian message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total message length including this header.
    pub message_length: i32,
    /// Caller-assigned id, unique per outbound message on a connection.
    pub request_id: i32,
    /// For replies, the request id this message answers.
    pub response_to: i32,
    /// Message kind.
    pub op_code: OpCode,
}

impl MessageHeader {
    /// Parses a header from exactly [`HEADER_LEN`] bytes.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(TransportError::protocol(format!(
                "message header requires {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let message_length = buf.get_i32_le();
        let request_id = buf.get_i32_le();
        let response_to = buf.get_i32_le();
        let op_code = OpCode::from_i32(buf.get_i32_le())?;
        if (message_length as usize) < HEADER_LEN {
            return Err(TransportError::protocol(format!(
                "declared message length {message_length} is shorter than the header"
            )));
        }
        Ok(Self {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }

    /// Appends the header to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_length.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&self.op_code.as_i32().to_le_bytes());
    }
}

/// Per-connection limits and format inputs, derived from the handshake.
#[derive(Debug, Clone)]
pub struct MessageSettings {
    /// Highest wire version the server speaks. Selects the frame format.
    pub max_wire_version: i32,
    /// Maximum total message size in bytes.
    pub max_message_size: usize,
    /// Maximum size of a single document in bytes.
    pub max_document_size: usize,
    /// Maximum documents per write batch.
    pub max_batch_count: usize,
    /// Direct (single-server) connection to a replica-set member. Affects
    /// legacy read routing flags and read-preference injection.
    pub direct_to_replica_set_member: bool,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            max_wire_version: OP_MSG_WIRE_VERSION,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
            direct_to_replica_set_member: false,
        }
    }
}

impl MessageSettings {
    /// Whether the extensible message format is in effect.
    pub fn use_msg_format(&self) -> bool {
        self.max_wire_version >= OP_MSG_WIRE_VERSION
    }
}

/// A batch of documents sent as a wire-level document sequence, used for
/// bulk write payload splitting.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSequence {
    /// The wire-level field name the sequence is keyed by (e.g. `documents`).
    pub identifier: String,
    /// The batch documents. Never split across messages.
    pub documents: Vec<Document>,
}

/// A command to send to the server.
#[derive(Debug, Clone)]
pub struct Command {
    /// Target database, injected as `$db`.
    pub database: String,
    /// The command document. The first key names the command.
    pub body: Document,
    /// Optional bulk payload, written as a separate document-sequence section.
    pub payload: Option<DocumentSequence>,
    /// Whether the caller wants a reply. Fire-and-forget sends still consume
    /// a request id so stray replies can be detected and discarded.
    pub response_expected: bool,
    /// Whether the server may stream additional replies without further
    /// requests.
    pub exhaust_allowed: bool,
    /// Read routing preference, injected as `$readPreference`.
    pub read_preference: Option<crate::session::ReadPreference>,
}

impl Command {
    /// A command expecting a reply.
    pub fn new(database: impl Into<String>, body: Document) -> Self {
        Self {
            database: database.into(),
            body,
            payload: None,
            response_expected: true,
            exhaust_allowed: false,
            read_preference: None,
        }
    }

    /// Attaches a bulk payload.
    pub fn with_payload(mut self, identifier: impl Into<String>, documents: Vec<Document>) -> Self {
        self.payload = Some(DocumentSequence {
            identifier: identifier.into(),
            documents,
        });
        self
    }

    /// Marks the command fire-and-forget.
    pub fn fire_and_forget(mut self) -> Self {
        self.response_expected = false;
        self
    }

    /// The command name (the first key of the body).
    pub fn name(&self) -> &str {
        self.body.keys().next().map(String::as_str).unwrap_or("")
    }
}

/// Metadata about an encoded command frame.
#[derive(Debug, Clone)]
pub struct EncodedCommand {
    /// Request id stamped into the header.
    pub request_id: i32,
    /// Frame format that was selected.
    pub op_code: OpCode,
    /// Whether the server will send a reply.
    pub response_expected: bool,
    /// Byte range of the command document within the frame, for lazy
    /// re-decoding by event senders.
    pub command_range: Range<usize>,
    /// Number of payload documents written into this frame.
    pub payload_written: usize,
    /// Whether payload documents remain unsent; the caller must issue another
    /// round trip.
    pub more_payload: bool,
}

/// Encodes `command` as a complete frame appended to `out`.
///
/// `out` is expected to be empty; the frame starts at `out[0]`.
pub fn encode_command(
    out: &mut Vec<u8>,
    command: &Command,
    request_id: i32,
    session: &mut SessionState,
    settings: &MessageSettings,
) -> Result<EncodedCommand> {
    if command.body.is_empty() {
        return Err(TransportError::Encoding {
            reason: "command document is empty".to_string(),
        });
    }
    validate_top_level_keys(&command.body)?;

    if settings.use_msg_format() {
        encode_msg(out, command, request_id, session, settings)
    } else {
        encode_query(out, command, request_id, session, settings)
    }
}

fn encode_msg(
    out: &mut Vec<u8>,
    command: &Command,
    request_id: i32,
    session: &mut SessionState,
    settings: &MessageSettings,
) -> Result<EncodedCommand> {
    let frame_start = out.len();
    MessageHeader {
        message_length: 0,
        request_id,
        response_to: 0,
        op_code: OpCode::Msg,
    }
    .write(out);

    let flags_pos = out.len();
    out.extend_from_slice(&0i32.to_le_bytes());
    out.push(0); // section kind: single document

    let doc_start = out.len();
    command
        .body
        .to_writer(&mut *out)
        .map_err(TransportError::encoding)?;
    let extras = build_extra_elements(command, session, settings, true)?;
    append_elements(out, doc_start, &extras)?;
    let doc_end = out.len();
    if doc_end - doc_start > settings.max_document_size + DOCUMENT_HEADROOM {
        return Err(TransportError::Encoding {
            reason: format!(
                "command document of {} bytes exceeds the {}-byte limit",
                doc_end - doc_start,
                settings.max_document_size
            ),
        });
    }

    let mut payload_written = 0usize;
    let mut payload_total = 0usize;
    if let Some(sequence) = &command.payload {
        payload_total = sequence.documents.len();
        out.push(1); // section kind: document sequence
        let size_pos = out.len();
        out.extend_from_slice(&0i32.to_le_bytes());
        write_cstring(out, &sequence.identifier)?;

        for document in &sequence.documents {
            if payload_written == settings.max_batch_count {
                break;
            }
            validate_payload_document(document)?;
            let mark = out.len();
            document.to_writer(&mut *out).map_err(TransportError::encoding)?;
            let document_len = out.len() - mark;
            if document_len > settings.max_document_size {
                return Err(TransportError::Encoding {
                    reason: format!(
                        "payload document of {document_len} bytes exceeds the {}-byte limit",
                        settings.max_document_size
                    ),
                });
            }
            if payload_written > 0 && out.len() - frame_start > settings.max_message_size {
                out.truncate(mark);
                break;
            }
            payload_written += 1;
        }
        let out_len = out.len();
        patch_i32(out, size_pos, (out_len - size_pos) as i32);
    }
    let more_payload = payload_written < payload_total;

    let response_expected = command.response_expected || more_payload;
    let mut flags = 0i32;
    if !response_expected {
        flags |= msg_flags::MORE_TO_COME;
    }
    if command.exhaust_allowed && response_expected {
        flags |= msg_flags::EXHAUST_ALLOWED;
    }
    patch_i32(out, flags_pos, flags);
    let out_len = out.len();
    patch_i32(out, frame_start, (out_len - frame_start) as i32);

    Ok(EncodedCommand {
        request_id,
        op_code: OpCode::Msg,
        response_expected,
        command_range: doc_start..doc_end,
        payload_written,
        more_payload,
    })
}

fn encode_query(
    out: &mut Vec<u8>,
    command: &Command,
    request_id: i32,
    session: &mut SessionState,
    settings: &MessageSettings,
) -> Result<EncodedCommand> {
    let frame_start = out.len();
    MessageHeader {
        message_length: 0,
        request_id,
        response_to: 0,
        op_code: OpCode::Query,
    }
    .write(out);

    let secondary_ok = command
        .read_preference
        .map(|rp| rp.allows_secondary_reads())
        .unwrap_or(false)
        || settings.direct_to_replica_set_member;
    let flags = if secondary_ok { query_flags::SECONDARY_OK } else { 0 };
    out.extend_from_slice(&flags.to_le_bytes());
    write_cstring(out, &format!("{}.$cmd", command.database))?;
    out.extend_from_slice(&0i32.to_le_bytes()); // number to skip
    out.extend_from_slice(&(-1i32).to_le_bytes()); // number to return

    // Bulk payloads ride inline as an array field in the legacy format.
    let (body, payload_written, payload_total) =
        legacy_body_with_payload(command, frame_start, out.len(), settings)?;

    // Reads routed away from the primary wrap the command in $query.
    let wrap = command
        .read_preference
        .map(|rp| rp.allows_secondary_reads())
        .unwrap_or(false);
    let to_encode = if wrap {
        let rp = command.read_preference.unwrap_or_default();
        doc! { "$query": body, "$readPreference": rp.to_document() }
    } else {
        body
    };

    let doc_start = out.len();
    to_encode
        .to_writer(&mut *out)
        .map_err(TransportError::encoding)?;
    let extras = build_extra_elements(command, session, settings, false)?;
    append_elements(out, doc_start, &extras)?;
    let doc_end = out.len();
    if doc_end - doc_start > settings.max_document_size + DOCUMENT_HEADROOM {
        return Err(TransportError::Encoding {
            reason: format!(
                "command document of {} bytes exceeds the {}-byte limit",
                doc_end - doc_start,
                settings.max_document_size
            ),
        });
    }

    let out_len = out.len();
    patch_i32(out, frame_start, (out_len - frame_start) as i32);

    Ok(EncodedCommand {
        request_id,
        op_code: OpCode::Query,
        // The legacy protocol always produces a reply.
        response_expected: true,
        command_range: doc_start..doc_end,
        payload_written,
        more_payload: payload_written < payload_total,
    })
}

/// Builds the legacy command body, folding as many payload documents as fit
/// into an inline array field.
fn legacy_body_with_payload(
    command: &Command,
    frame_start: usize,
    written_so_far: usize,
    settings: &MessageSettings,
) -> Result<(Document, usize, usize)> {
    let sequence = match &command.payload {
        Some(sequence) if !sequence.documents.is_empty() => sequence,
        _ => return Ok((command.body.clone(), 0, 0)),
    };

    let base_len = document_len(&command.body)?;
    // type byte + field name cstring + array header and terminator
    let mut running = (written_so_far - frame_start) + base_len + 1 + sequence.identifier.len() + 1 + 5;
    let mut included = Vec::new();
    for (index, document) in sequence.documents.iter().enumerate() {
        if included.len() == settings.max_batch_count {
            break;
        }
        validate_payload_document(document)?;
        let document_len = document_len(document)?;
        if document_len > settings.max_document_size {
            return Err(TransportError::Encoding {
                reason: format!(
                    "payload document of {document_len} bytes exceeds the {}-byte limit",
                    settings.max_document_size
                ),
            });
        }
        // type byte + array index cstring + document
        let element_len = 1 + index.to_string().len() + 1 + document_len;
        if !included.is_empty() && running + element_len > settings.max_message_size {
            break;
        }
        running += element_len;
        included.push(Bson::Document(document.clone()));
    }

    let written = included.len();
    let mut body = command.body.clone();
    body.insert(sequence.identifier.clone(), Bson::Array(included));
    Ok((body, written, sequence.documents.len()))
}

/// Extra top-level elements merged into the command document at encode time.
fn build_extra_elements(
    command: &Command,
    session: &mut SessionState,
    settings: &MessageSettings,
    include_read_preference: bool,
) -> Result<Document> {
    let mut extras = Document::new();
    extras.insert("$db", command.database.clone());
    if let Some(cluster_time) = session.cluster_time() {
        extras.insert("$clusterTime", cluster_time.clone());
    }
    if session.session_id().is_some() && command.response_expected {
        let session_id = session.session_id().cloned().unwrap_or_default();
        extras.insert("lsid", session_id);
    }
    let first_in_transaction = session.notify_message_sent();
    if session.has_active_transaction() {
        if settings.max_wire_version < TRANSACTIONS_WIRE_VERSION {
            return Err(TransportError::TransactionsUnsupported {
                max_wire_version: settings.max_wire_version,
            });
        }
        if let Some(number) = session.transaction_number() {
            extras.insert("txnNumber", number);
        }
        if first_in_transaction {
            extras.insert("startTransaction", true);
            if let Some(read_concern) = session.read_concern() {
                extras.insert("readConcern", read_concern.clone());
            }
        }
        extras.insert("autocommit", false);
    }
    if include_read_preference {
        if let Some(rp) = command.read_preference {
            if rp.allows_secondary_reads() {
                extras.insert("$readPreference", rp.to_document());
            } else if settings.direct_to_replica_set_member {
                extras.insert(
                    "$readPreference",
                    crate::session::ReadPreference::PrimaryPreferred.to_document(),
                );
            }
        }
    }
    if let Some(remaining) = session.deadline().remaining() {
        let millis = remaining.as_millis() as i64;
        if millis > 0 {
            extras.insert("maxTimeMS", millis);
        }
    }
    Ok(extras)
}

/// Splices `extras` into the serialized document starting at `doc_start`,
/// preserving the original elements and fixing the length prefix.
fn append_elements(out: &mut Vec<u8>, doc_start: usize, extras: &Document) -> Result<()> {
    if extras.is_empty() {
        return Ok(());
    }
    let mut extra_bytes = Vec::new();
    extras
        .to_writer(&mut extra_bytes)
        .map_err(TransportError::encoding)?;
    // Strip the extras' own length prefix and terminator, keeping elements.
    let elements = &extra_bytes[4..extra_bytes.len() - 1];
    out.pop();
    out.extend_from_slice(elements);
    out.push(0);
    let out_len = out.len();
    patch_i32(out, doc_start, (out_len - doc_start) as i32);
    Ok(())
}

fn patch_i32(out: &mut [u8], pos: usize, value: i32) {
    out[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

fn document_len(document: &Document) -> Result<usize> {
    let mut bytes = Vec::new();
    document
        .to_writer(&mut bytes)
        .map_err(TransportError::encoding)?;
    Ok(bytes.len())
}

fn validate_top_level_keys(document: &Document) -> Result<()> {
    for key in document.keys() {
        if key.contains('\0') {
            return Err(TransportError::InvalidFieldName {
                name: key.clone(),
                reason: "contains an interior NUL byte".to_string(),
            });
        }
    }
    Ok(())
}

fn validate_payload_document(document: &Document) -> Result<()> {
    for key in document.keys() {
        if key.starts_with('$') {
            return Err(TransportError::InvalidFieldName {
                name: key.clone(),
                reason: "payload field names must not start with '$'".to_string(),
            });
        }
        if key.contains('\0') {
            return Err(TransportError::InvalidFieldName {
                name: key.clone(),
                reason: "contains an interior NUL byte".to_string(),
            });
        }
    }
    Ok(())
}

fn write_cstring(out: &mut Vec<u8>, value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(TransportError::InvalidFieldName {
            name: value.to_string(),
            reason: "contains an interior NUL byte".to_string(),
        });
    }
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    Ok(())
}

fn read_cstring(bytes: &mut &[u8]) -> Result<String> {
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TransportError::protocol("unterminated cstring"))?;
    let value = std::str::from_utf8(&bytes[..end])
        .map_err(|_| TransportError::protocol("cstring is not valid UTF-8"))?
        .to_string();
    *bytes = &bytes[end + 1..];
    Ok(value)
}

fn read_document(bytes: &mut &[u8]) -> Result<Document> {
    if bytes.len() < 5 {
        return Err(TransportError::protocol(
            "truncated document: fewer than 5 bytes remain",
        ));
    }
    let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if declared < 5 || declared > bytes.len() {
        return Err(TransportError::protocol(format!(
            "document declares {declared} bytes but {} remain",
            bytes.len()
        )));
    }
    let document = Document::from_reader(&mut &bytes[..declared])
        .map_err(|e| TransportError::protocol(format!("malformed document: {e}")))?;
    *bytes = &bytes[declared..];
    Ok(document)
}

/// A fully parsed inbound message.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    /// The (possibly unwrapped) header.
    pub header: MessageHeader,
    /// The parsed body.
    pub body: MessageBody,
}

/// Parsed message bodies, one variant per frame format.
#[derive(Debug, Clone)]
pub enum MessageBody {
    /// Extensible message.
    Msg {
        /// Raw flag bits.
        flags: i32,
        /// The single-document section.
        document: Document,
        /// Any document-sequence sections.
        sequences: Vec<DocumentSequence>,
    },
    /// Legacy query (seen when decoding our own outbound frames).
    Query {
        /// Raw flag bits.
        flags: i32,
        /// The `db.$cmd` namespace.
        full_collection_name: String,
        /// Documents to skip.
        number_to_skip: i32,
        /// Requested batch size.
        number_to_return: i32,
        /// The query document.
        document: Document,
        /// Optional field selector.
        selector: Option<Document>,
    },
    /// Legacy reply.
    Reply {
        /// Raw response flag bits.
        response_flags: i32,
        /// Server cursor id, zero when exhausted.
        cursor_id: i64,
        /// Position of the first returned document.
        starting_from: i32,
        /// Number of documents returned.
        number_returned: i32,
        /// The returned documents.
        documents: Vec<Document>,
    },
}

impl DecodedMessage {
    /// The primary document of the message, if any.
    pub fn document(&self) -> Option<&Document> {
        match &self.body {
            MessageBody::Msg { document, .. } => Some(document),
            MessageBody::Query { document, .. } => Some(document),
            MessageBody::Reply { documents, .. } => documents.first(),
        }
    }

    /// Whether the server will stream further replies without a new request.
    pub fn more_to_come(&self) -> bool {
        matches!(&self.body, MessageBody::Msg { flags, .. } if flags & msg_flags::MORE_TO_COME != 0)
    }
}

/// Decodes a complete frame, transparently unwrapping a compressed envelope.
pub fn decode_message(frame: &[u8]) -> Result<DecodedMessage> {
    let header = MessageHeader::read(frame)?;
    if header.message_length as usize != frame.len() {
        return Err(TransportError::protocol(format!(
            "header declares {} bytes but the frame holds {}",
            header.message_length,
            frame.len()
        )));
    }
    let body = &frame[HEADER_LEN..];
    if header.op_code == OpCode::Compressed {
        let (inner_header, inner_body) = crate::compress::unwrap_compressed(&header, body)?;
        decode_body(inner_header, &inner_body)
    } else {
        decode_body(header, body)
    }
}

fn decode_body(header: MessageHeader, body: &[u8]) -> Result<DecodedMessage> {
    let body = match header.op_code {
        OpCode::Msg => decode_msg_body(body)?,
        OpCode::Query => decode_query_body(body)?,
        OpCode::Reply => decode_reply_body(body)?,
        OpCode::Compressed => {
            return Err(TransportError::protocol(
                "compressed envelope wraps another compressed envelope",
            ))
        }
    };
    Ok(DecodedMessage { header, body })
}

fn decode_msg_body(mut body: &[u8]) -> Result<MessageBody> {
    if body.len() < 4 {
        return Err(TransportError::protocol("message body shorter than flags"));
    }
    let flags = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    body = &body[4..];
    if flags & msg_flags::CHECKSUM_PRESENT != 0 {
        if body.len() < 4 {
            return Err(TransportError::protocol("checksum flag set on short body"));
        }
        // Checksum is not validated; drop the trailing bytes.
        body = &body[..body.len() - 4];
    }

    let mut document = None;
    let mut sequences = Vec::new();
    while !body.is_empty() {
        let kind = body[0];
        body = &body[1..];
        match kind {
            0 => {
                let parsed = read_document(&mut body)?;
                if document.replace(parsed).is_some() {
                    return Err(TransportError::protocol(
                        "message holds more than one single-document section",
                    ));
                }
            }
            1 => {
                if body.len() < 4 {
                    return Err(TransportError::protocol("truncated document sequence"));
                }
                let declared = i32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
                if declared < 4 || declared > body.len() {
                    return Err(TransportError::protocol(format!(
                        "document sequence declares {declared} bytes but {} remain",
                        body.len()
                    )));
                }
                let mut section = &body[4..declared];
                body = &body[declared..];
                let identifier = read_cstring(&mut section)?;
                let mut documents = Vec::new();
                while !section.is_empty() {
                    documents.push(read_document(&mut section)?);
                }
                sequences.push(DocumentSequence {
                    identifier,
                    documents,
                });
            }
            other => {
                return Err(TransportError::protocol(format!(
                    "unknown section kind {other}"
                )))
            }
        }
    }

    let document = document
        .ok_or_else(|| TransportError::protocol("message has no single-document section"))?;
    Ok(MessageBody::Msg {
        flags,
        document,
        sequences,
    })
}

fn decode_query_body(mut body: &[u8]) -> Result<MessageBody> {
    if body.len() < 4 {
        return Err(TransportError::protocol("query body shorter than flags"));
    }
    let flags = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    body = &body[4..];
    let full_collection_name = read_cstring(&mut body)?;
    if body.len() < 8 {
        return Err(TransportError::protocol("truncated query body"));
    }
    let number_to_skip = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let number_to_return = i32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    body = &body[8..];
    let document = read_document(&mut body)?;
    let selector = if body.is_empty() {
        None
    } else {
        Some(read_document(&mut body)?)
    };
    if !body.is_empty() {
        return Err(TransportError::protocol("trailing bytes after query body"));
    }
    Ok(MessageBody::Query {
        flags,
        full_collection_name,
        number_to_skip,
        number_to_return,
        document,
        selector,
    })
}

fn decode_reply_body(mut body: &[u8]) -> Result<MessageBody> {
    if body.len() < 20 {
        return Err(TransportError::protocol("reply body shorter than its prologue"));
    }
    let response_flags = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let cursor_id = i64::from_le_bytes([
        body[4], body[5], body[6], body[7], body[8], body[9], body[10], body[11],
    ]);
    let starting_from = i32::from_le_bytes([body[12], body[13], body[14], body[15]]);
    let number_returned = i32::from_le_bytes([body[16], body[17], body[18], body[19]]);
    body = &body[20..];
    if number_returned < 0 {
        return Err(TransportError::protocol("negative document count in reply"));
    }
    let mut documents = Vec::with_capacity(number_returned as usize);
    for _ in 0..number_returned {
        documents.push(read_document(&mut body)?);
    }
    if !body.is_empty() {
        return Err(TransportError::protocol("trailing bytes after reply body"));
    }
    Ok(MessageBody::Reply {
        response_flags,
        cursor_id,
        starting_from,
        number_returned,
        documents,
    })
}
