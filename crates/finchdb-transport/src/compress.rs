//! Wire compression for command messages.
//!
//! A compressor is negotiated once per connection from the server's
//! advertised list. Only the message body is ever compressed; the 16-byte
//! header travels in the clear. Security-sensitive commands are always sent
//! uncompressed regardless of what was negotiated.

use std::io::Write;

use bson::Document;

use crate::error::{Result, TransportError};
use crate::protocol::{MessageHeader, OpCode, HEADER_LEN};

/// Wire id for the no-op compressor.
pub const COMPRESSOR_ID_NOOP: u8 = 0;
/// Wire id for snappy (recognized, not locally supported).
pub const COMPRESSOR_ID_SNAPPY: u8 = 1;
/// Wire id for zlib.
pub const COMPRESSOR_ID_ZLIB: u8 = 2;
/// Wire id for zstd.
pub const COMPRESSOR_ID_ZSTD: u8 = 3;

/// A negotiated body compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    /// zlib/deflate via flate2.
    Zlib {
        /// Compression level, 0-9.
        level: u32,
    },
    /// Zstandard.
    Zstd {
        /// Compression level; 0 selects the library default.
        level: i32,
    },
}

impl Compressor {
    /// The compressor's wire id.
    pub fn id(&self) -> u8 {
        match self {
            Compressor::Zlib { .. } => COMPRESSOR_ID_ZLIB,
            Compressor::Zstd { .. } => COMPRESSOR_ID_ZSTD,
        }
    }

    /// The compressor's negotiation name.
    pub fn name(&self) -> &'static str {
        match self {
            Compressor::Zlib { .. } => "zlib",
            Compressor::Zstd { .. } => "zstd",
        }
    }

    /// Picks the first server-advertised compressor that is supported
    /// locally, or `None` to send uncompressed.
    pub fn negotiate<S: AsRef<str>>(server_advertised: &[S]) -> Option<Compressor> {
        for name in server_advertised {
            match name.as_ref() {
                "zlib" => return Some(Compressor::Zlib { level: 6 }),
                "zstd" => return Some(Compressor::Zstd { level: 0 }),
                // Advertised but not supported locally: keep looking.
                _ => continue,
            }
        }
        None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::Zlib { level } => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(*level));
                encoder
                    .write_all(data)
                    .map_err(|e| TransportError::internal(format!("zlib compression failed: {e}")))?;
                encoder
                    .finish()
                    .map_err(|e| TransportError::internal(format!("zlib compression failed: {e}")))
            }
            Compressor::Zstd { level } => zstd::stream::encode_all(data, *level)
                .map_err(|e| TransportError::internal(format!("zstd compression failed: {e}"))),
        }
    }
}

fn decompress(id: u8, data: &[u8]) -> Result<Vec<u8>> {
    match id {
        COMPRESSOR_ID_NOOP => Ok(data.to_vec()),
        COMPRESSOR_ID_ZLIB => {
            let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
            decoder
                .write_all(data)
                .map_err(|e| TransportError::protocol(format!("zlib inflate failed: {e}")))?;
            decoder
                .finish()
                .map_err(|e| TransportError::protocol(format!("zlib inflate failed: {e}")))
        }
        COMPRESSOR_ID_ZSTD => zstd::stream::decode_all(data)
            .map_err(|e| TransportError::protocol(format!("zstd inflate failed: {e}"))),
        other => Err(TransportError::UnsupportedCompressor { id: other }),
    }
}

/// Wraps a complete frame in a compressed envelope.
///
/// The envelope body is: original opcode (`i32`), uncompressed body size
/// (`i32`), compressor id (`u8`), compressed body bytes.
pub fn compress_message(frame: &[u8], compressor: Compressor, out: &mut Vec<u8>) -> Result<()> {
    let header = MessageHeader::read(frame)?;
    let body = &frame[HEADER_LEN..];
    let compressed = compressor.compress(body)?;

    let message_length = (HEADER_LEN + 4 + 4 + 1 + compressed.len()) as i32;
    MessageHeader {
        message_length,
        request_id: header.request_id,
        response_to: header.response_to,
        op_code: OpCode::Compressed,
    }
    .write(out);
    out.extend_from_slice(&header.op_code.as_i32().to_le_bytes());
    out.extend_from_slice(&(body.len() as i32).to_le_bytes());
    out.push(compressor.id());
    out.extend_from_slice(&compressed);
    Ok(())
}

/// Unwraps a compressed envelope into the original header and body.
pub fn unwrap_compressed(header: &MessageHeader, body: &[u8]) -> Result<(MessageHeader, Vec<u8>)> {
    if body.len() < 9 {
        return Err(TransportError::protocol("truncated compressed envelope"));
    }
    let original_op = OpCode::from_i32(i32::from_le_bytes([body[0], body[1], body[2], body[3]]))?;
    if original_op == OpCode::Compressed {
        return Err(TransportError::protocol(
            "compressed envelope wraps another compressed envelope",
        ));
    }
    let uncompressed_size = i32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let compressor_id = body[8];
    let inflated = decompress(compressor_id, &body[9..])?;
    if inflated.len() != uncompressed_size as usize {
        return Err(TransportError::protocol(format!(
            "envelope declares {uncompressed_size} uncompressed bytes but inflated to {}",
            inflated.len()
        )));
    }
    let inner_header = MessageHeader {
        message_length: (HEADER_LEN + inflated.len()) as i32,
        request_id: header.request_id,
        response_to: header.response_to,
        op_code: original_op,
    };
    Ok((inner_header, inflated))
}

const SECURITY_SENSITIVE_COMMANDS: &[&str] = &[
    "authenticate",
    "saslStart",
    "saslContinue",
    "getnonce",
    "createUser",
    "updateUser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

const SECURITY_SENSITIVE_HELLO_COMMANDS: &[&str] = &["hello", "ismaster", "isMaster"];

/// Whether a command must never be compressed and must have its body redacted
/// from events and logs.
pub fn is_security_sensitive(command_name: &str, command: &Document) -> bool {
    if SECURITY_SENSITIVE_COMMANDS.contains(&command_name) {
        return true;
    }
    SECURITY_SENSITIVE_HELLO_COMMANDS.contains(&command_name)
        && command.contains_key("speculativeAuthenticate")
}
