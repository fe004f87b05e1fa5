//! The minimal duplex byte-stream contract every transport must satisfy.
//!
//! The connection layers above are generic over a [`Sink`] / [`Stream`] pair
//! and touch nothing else of the underlying socket, so any ordered,
//! reliable byte pipe (TCP, WebSocket, an in-memory channel) can carry a
//! connection by implementing these two traits.

use std::future::Future;
use thiserror::Error;

pub mod mocks;
pub mod tcp;

/// Errors produced by a transport implementation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("stream closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The write half of a duplex byte stream.
pub trait Sink: Send + 'static {
    /// Write the entire buffer.
    ///
    /// From the caller's perspective the write is atomic: when the future
    /// resolves successfully, every byte of `msg` has been accepted in order.
    fn send(&mut self, msg: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;

    /// Shut the write side down. Idempotent; errors are swallowed because
    /// there is nothing useful a caller can do with them.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// The read half of a duplex byte stream.
pub trait Stream: Send + 'static {
    /// Fill `buf` exactly.
    ///
    /// Resolves once every byte of `buf` has been read, with
    /// [`Error::Closed`] if the stream ends first.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<(), Error>> + Send;
}
