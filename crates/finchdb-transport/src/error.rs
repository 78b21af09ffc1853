//! Error taxonomy for the transport core.
//!
//! Every failure a caller can observe maps to exactly one variant. I/O-class
//! errors (open, write, read, read timeout, premature end of stream) are fatal
//! to the connection that raised them; the connection closes itself before the
//! error propagates. A command failure leaves the connection usable.

use bson::Document;
use thiserror::Error;

/// Errors produced by connections, the pool, the codec, and the compressor.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Acquiring or initializing the underlying stream failed.
    #[error("failed to open connection to {addr}: {source}")]
    OpenFailure {
        /// Server address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing a frame failed; the connection is closed.
    #[error("failed to write to {addr}: {source}")]
    WriteFailure {
        /// Server address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Reading a frame failed; the connection is closed.
    #[error("failed to read from {addr}: {source}")]
    ReadFailure {
        /// Server address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No reply arrived within the read timeout. Retryable from the caller's
    /// perspective, but fatal to this connection.
    #[error("timed out after {timeout_ms}ms waiting to read from {addr}")]
    ReadTimeout {
        /// Server address.
        addr: String,
        /// The elapsed timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The peer closed the stream in the middle of a frame.
    #[error("prematurely reached end of stream from {addr}")]
    PrematureEndOfStream {
        /// Server address.
        addr: String,
    },

    /// The byte stream no longer frames valid messages. Fatal and
    /// non-retryable: the stream is desynchronized.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// What was malformed.
        reason: String,
    },

    /// A field name failed encode-time validation.
    #[error("invalid field name {name:?}: {reason}")]
    InvalidFieldName {
        /// The offending name.
        name: String,
        /// Which rule it broke.
        reason: String,
    },

    /// The server executed the command and reported a failure. The
    /// connection stays open.
    #[error("command {name} failed with code {code}: {message}")]
    CommandFailure {
        /// Command name.
        name: String,
        /// Server error code.
        code: i32,
        /// Server error message.
        message: String,
        /// Server-attached error labels.
        labels: Vec<String>,
        /// The full error document from the server.
        response: Document,
    },

    /// No connection became available within the wait-queue timeout.
    #[error("{message}")]
    CheckoutTimeout {
        /// Diagnostic message including the in-use breakdown by pin category.
        message: String,
    },

    /// The pool was closed before or during the checkout.
    #[error("connection pool for {addr} is closed")]
    PoolClosed {
        /// Server address.
        addr: String,
    },

    /// A reply used a compressor this build does not support.
    #[error("unsupported compressor id {id}")]
    UnsupportedCompressor {
        /// The wire id of the compressor.
        id: u8,
    },

    /// A transaction was attempted against a server that cannot run them.
    #[error("transactions require wire version 7, but the server supports at most {max_wire_version}")]
    TransactionsUnsupported {
        /// The server's advertised wire version.
        max_wire_version: i32,
    },

    /// Serializing a document failed.
    #[error("failed to encode document: {reason}")]
    Encoding {
        /// What failed.
        reason: String,
    },

    /// An internal invariant was broken (e.g. use of a closed connection).
    #[error("internal transport error: {reason}")]
    Internal {
        /// What happened.
        reason: String,
    },
}

impl TransportError {
    /// Whether this error indicates a broken byte stream.
    ///
    /// Stream errors always close the connection that raised them; the pool
    /// must never hand such a connection out again.
    pub fn is_stream_error(&self) -> bool {
        matches!(
            self,
            TransportError::OpenFailure { .. }
                | TransportError::WriteFailure { .. }
                | TransportError::ReadFailure { .. }
                | TransportError::ReadTimeout { .. }
                | TransportError::PrematureEndOfStream { .. }
        )
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        TransportError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    pub(crate) fn encoding(reason: impl std::fmt::Display) -> Self {
        TransportError::Encoding {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn internal(reason: impl Into<String>) -> Self {
        TransportError::Internal {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_errors_are_fatal() {
        let err = TransportError::PrematureEndOfStream {
            addr: "db1:27017".to_string(),
        };
        assert!(err.is_stream_error());

        let err = TransportError::ReadTimeout {
            addr: "db1:27017".to_string(),
            timeout_ms: 500,
        };
        assert!(err.is_stream_error());
    }

    #[test]
    fn test_command_failure_is_not_fatal() {
        let err = TransportError::CommandFailure {
            name: "find".to_string(),
            code: 11601,
            message: "operation was interrupted".to_string(),
            labels: vec![],
            response: Document::new(),
        };
        assert!(!err.is_stream_error());
    }

    #[test]
    fn test_display_includes_context() {
        let err = TransportError::ReadTimeout {
            addr: "db1:27017".to_string(),
            timeout_ms: 250,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("250ms"));
        assert!(rendered.contains("db1:27017"));
    }
}
