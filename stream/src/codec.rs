//! Length-prefixed frame I/O over a raw transport.

use crate::{
    transport::{Sink, Stream},
    Error,
};
use bytes::Bytes;

/// Write `frame` to the sink with a 4-byte big-endian length prefix.
///
/// The prefix and payload go out as a single transport write so a frame can
/// never interleave with one composed concurrently by another task.
pub async fn send_frame<S: Sink>(
    sink: &mut S,
    frame: &[u8],
    max_frame_len: usize,
) -> Result<(), Error> {
    let n = frame.len();
    if n == 0 || n > max_frame_len {
        return Err(Error::InvalidFrameLength(n));
    }
    let len = u32::try_from(n).map_err(|_| Error::InvalidFrameLength(n))?;

    let mut buf = Vec::with_capacity(4 + n);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(frame);
    sink.send(&buf).await.map_err(Error::SendFailed)
}

/// Read one length-prefixed frame from the stream.
pub async fn recv_frame<T: Stream>(stream: &mut T, max_frame_len: usize) -> Result<Bytes, Error> {
    let mut prefix = [0u8; 4];
    stream.recv(&mut prefix).await.map_err(|e| match e {
        crate::transport::Error::Closed => Error::StreamClosed,
        e => Error::RecvFailed(e),
    })?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 || len > max_frame_len {
        return Err(Error::InvalidFrameLength(len));
    }

    let mut frame = vec![0u8; len];
    stream.recv(&mut frame).await.map_err(Error::RecvFailed)?;
    Ok(Bytes::from(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mocks;

    const MAX_FRAME_LEN: usize = 512;

    #[tokio::test]
    async fn test_round_trip() {
        let (mut sink, mut stream) = mocks::Channel::init();
        let frame: Vec<u8> = (0..=255).collect();

        send_frame(&mut sink, &frame, MAX_FRAME_LEN).await.unwrap();
        let received = recv_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_round_trip_at_limit() {
        let (mut sink, mut stream) = mocks::Channel::init();
        let frame = vec![7u8; MAX_FRAME_LEN];

        send_frame(&mut sink, &frame, MAX_FRAME_LEN).await.unwrap();
        let received = recv_frame(&mut stream, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(received.len(), MAX_FRAME_LEN);
    }

    #[tokio::test]
    async fn test_send_rejects_bad_sizes() {
        let (mut sink, _stream) = mocks::Channel::init();
        assert!(matches!(
            send_frame(&mut sink, &[], MAX_FRAME_LEN).await,
            Err(Error::InvalidFrameLength(0))
        ));
        let oversized = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(
            send_frame(&mut sink, &oversized, MAX_FRAME_LEN).await,
            Err(Error::InvalidFrameLength(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_rejects_oversized_prefix() {
        use crate::transport::Sink as _;
        let (mut sink, mut stream) = mocks::Channel::init();
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        sink.send(&len).await.unwrap();
        assert!(matches!(
            recv_frame(&mut stream, MAX_FRAME_LEN).await,
            Err(Error::InvalidFrameLength(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_on_closed_channel() {
        use crate::transport::Sink as _;
        let (mut sink, mut stream) = mocks::Channel::init();
        sink.close().await;
        assert!(matches!(
            recv_frame(&mut stream, MAX_FRAME_LEN).await,
            Err(Error::StreamClosed)
        ));
    }
}
