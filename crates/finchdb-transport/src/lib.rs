#![warn(missing_docs)]

//! FinchDB client transport core: connection pooling, binary wire protocol,
//! payload compression, and command lifecycle events.
//!
//! The pieces compose bottom-up: a [`buffer::BufferPool`] feeds reusable
//! byte buffers to the [`protocol`] codec; [`compress`] wraps encoded frames
//! in a negotiated envelope; a [`connection::Connection`] owns one byte
//! stream (supplied by a [`stream::StreamFactory`]) and drives framed
//! command/reply exchanges, reporting them through [`events`]; and a
//! [`pool::ConnectionPool`] hands connections out to callers with
//! generation-based bulk invalidation and idle/lifetime pruning.

pub mod buffer;
pub mod compress;
pub mod connection;
pub mod error;
pub mod events;
pub mod handshake;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod tcp;

pub use buffer::{BufferPool, BufferPoolConfig, PooledBuffer};
pub use compress::Compressor;
pub use connection::{CommandReply, Connection, ConnectionState, Connector, EndpointId};
pub use error::{Result, TransportError};
pub use events::{CommandEventSender, CommandListener};
pub use handshake::{ConnectionDescription, ConnectionInitializer, HelloInitializer};
pub use pool::{ConnectionPool, PoolConfig, PoolListener, PooledConnection};
pub use protocol::{Command, DocumentSequence, MessageSettings};
pub use session::{Deadline, ReadPreference, SessionState};
pub use stream::{ByteStream, StreamFactory};
pub use tcp::{TcpConfig, TcpStreamFactory};
