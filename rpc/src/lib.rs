//! Multiplexed request/response protocol and connection management for
//! gossiping peers.
//!
//! This crate runs many logically independent exchanges over one encrypted
//! [`mangrove_stream`] connection. Every message is a 9-byte header plus a
//! body; headers correlate requests and responses by signed integer id (the
//! requester allocates positive ids, responses carry the negation), and a
//! flag distinguishes single-shot **async** calls from streaming **source**
//! calls whose response is a lazily consumed sequence of values.
//!
//! # Design
//!
//! Each [`Connection`] runs two background loops: a sequential read loop
//! that parses frames in arrival order and routes them either to the
//! listener registered for their request id or to the supplied
//! [`RequestHandler`], and a watchdog that closes connections whose peer has
//! stopped answering (`answer_timeout`) or gone entirely silent
//! (`activity_timeout`). Closing the underlying connection is the single
//! cancellation primitive: it ends the read loop and settles every pending
//! listener, so no caller is ever left hanging.
//!
//! The [`manager`] module deduplicates connections per peer identity and
//! unifies inbound and outbound connection events for the components above
//! this layer (feed replication, blob exchange) that only care that *some*
//! authenticated session to a peer exists.

use thiserror::Error;

pub mod address;
mod connection;
mod handler;
mod header;
pub mod manager;
mod source;

pub use address::{Address, ParseError, TransportKind};
pub use connection::{Config, Connection};
pub use manager::Manager;
pub use handler::{Body, RequestHandler, SourceValues};
pub use header::{BodyType, Header, HEADER_LEN};
pub use source::SourceStream;

/// Errors surfaced by RPC calls and connection management.
#[derive(Error, Debug)]
pub enum Error {
    /// Failure in the underlying encrypted transport.
    #[error("stream: {0}")]
    Stream(#[from] mangrove_stream::Error),

    // Framing errors
    #[error("invalid body type: {0}")]
    InvalidBodyType(u8),
    #[error("body of {0} bytes exceeds limit")]
    BodyTooLarge(u32),

    // Request lifecycle errors
    #[error("request ids exhausted")]
    IdsExhausted,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("no response received within the answer timeout")]
    AnswerTimeout,
    #[error("no frames received within the activity timeout")]
    ActivityTimeout,

    /// The peer answered a request with an error payload. Isolated to the
    /// one call that triggered it.
    #[error("application error: {0}")]
    Application(String),

    // Body codec errors
    #[error("malformed json body")]
    InvalidJson(#[source] serde_json::Error),
    #[error("failed to encode json body")]
    EncodeJson(#[source] serde_json::Error),
    #[error("body is not valid utf-8")]
    InvalidUtf8(#[source] std::string::FromUtf8Error),
}
