//! In-memory transport for tests.

use super::Error;
use tokio::sync::mpsc;

/// A unidirectional in-memory byte pipe.
///
/// [`Channel::init`] returns a connected `(Sink, Stream)` pair; a duplex
/// connection between two test peers is two channels crossed over.
pub struct Channel;

impl Channel {
    pub fn init() -> (Sink, Stream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Sink {
                sender: Some(sender),
            },
            Stream {
                receiver,
                pending: Vec::new(),
                offset: 0,
            },
        )
    }
}

/// The write half of an in-memory channel.
pub struct Sink {
    sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl super::Sink for Sink {
    async fn send(&mut self, msg: &[u8]) -> Result<(), Error> {
        let Some(sender) = &self.sender else {
            return Err(Error::Closed);
        };
        if msg.is_empty() {
            return Ok(());
        }
        sender.send(msg.to_vec()).map_err(|_| Error::Closed)
    }

    async fn close(&mut self) {
        self.sender = None;
    }
}

/// The read half of an in-memory channel.
pub struct Stream {
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl super::Stream for Stream {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.offset < self.pending.len() {
                let available = &self.pending[self.offset..];
                let n = available.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&available[..n]);
                self.offset += n;
                filled += n;
                continue;
            }
            match self.receiver.recv().await {
                Some(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                None => return Err(Error::Closed),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Sink as _, Stream as _};

    #[tokio::test]
    async fn test_round_trip() {
        let (mut sink, mut stream) = Channel::init();
        sink.send(b"hello world").await.unwrap();

        let mut buf = [0u8; 11];
        stream.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn test_partial_and_spanning_reads() {
        let (mut sink, mut stream) = Channel::init();
        sink.send(b"abc").await.unwrap();
        sink.send(b"defgh").await.unwrap();

        // One read smaller than a chunk, one spanning both chunks.
        let mut buf = [0u8; 2];
        stream.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");
        let mut buf = [0u8; 6];
        stream.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cdefgh");
    }

    #[tokio::test]
    async fn test_closed_sink_ends_stream() {
        let (mut sink, mut stream) = Channel::init();
        sink.send(b"bye").await.unwrap();
        sink.close().await;
        assert!(matches!(sink.send(b"more").await, Err(Error::Closed)));

        let mut buf = [0u8; 3];
        stream.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bye");
        assert!(matches!(stream.recv(&mut buf).await, Err(Error::Closed)));
    }
}
