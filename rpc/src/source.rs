//! Pull-driven consumption of a source request's response stream.

use crate::{handler::Body, header::Header, Error};
use bytes::Bytes;
use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::mpsc;

/// What the read loop delivers to a registered listener.
#[derive(Debug)]
pub(crate) enum Event {
    Frame(Header, Bytes),
    Failed(Error),
}

/// The lazy sequence of values produced by a source request.
///
/// Values that arrive before they are demanded buffer in arrival order;
/// polling past the buffer suspends until the next frame for this request
/// id arrives. A terminal frame whose body is the literal `true` ends the
/// sequence cleanly; any other terminal body surfaces as
/// [`Error::Application`] carrying its decoded text. Once the sequence has
/// terminated (cleanly, by error, or because the connection closed) it
/// yields nothing further.
pub struct SourceStream {
    receiver: mpsc::UnboundedReceiver<Event>,
    done: bool,
}

impl SourceStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<Event>) -> Self {
        Self {
            receiver,
            done: false,
        }
    }
}

impl Stream for SourceStream {
    type Item = Result<Body, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Event::Frame(header, body))) => {
                if header.end_or_error {
                    self.done = true;
                    if body.as_ref() == b"true" {
                        Poll::Ready(None)
                    } else {
                        let text = String::from_utf8_lossy(&body).into_owned();
                        Poll::Ready(Some(Err(Error::Application(text))))
                    }
                } else {
                    // A value that fails to decode is an error for this item
                    // only; the stream continues with the next frame.
                    Poll::Ready(Some(Body::decode(header.body_type, body)))
                }
            }
            Poll::Ready(Some(Event::Failed(error))) => {
                self.done = true;
                Poll::Ready(Some(Err(error)))
            }
            // The listener vanished without a terminal frame: the connection
            // is gone.
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(Error::ConnectionClosed)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::BodyType;
    use futures::StreamExt as _;

    fn value_frame(body: &'static [u8]) -> Event {
        Event::Frame(
            Header {
                part_of_stream: true,
                end_or_error: false,
                body_type: BodyType::Json,
                body_length: body.len() as u32,
                request_id: -1,
            },
            Bytes::from_static(body),
        )
    }

    fn terminal_frame(body: &'static [u8]) -> Event {
        Event::Frame(
            Header {
                part_of_stream: true,
                end_or_error: true,
                body_type: BodyType::Json,
                body_length: body.len() as u32,
                request_id: -1,
            },
            Bytes::from_static(body),
        )
    }

    #[tokio::test]
    async fn test_buffered_values_then_clean_end() {
        let (sender, receiver) = mpsc::unbounded_channel();
        sender.send(value_frame(b"1")).unwrap();
        sender.send(value_frame(b"2")).unwrap();
        sender.send(terminal_frame(b"true")).unwrap();

        let mut stream = SourceStream::new(receiver);
        assert_eq!(stream.next().await.unwrap().unwrap(), Body::Json(1.into()));
        assert_eq!(stream.next().await.unwrap().unwrap(), Body::Json(2.into()));
        assert!(stream.next().await.is_none());
        // Terminated streams stay terminated.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_terminal_surfaces_text() {
        let (sender, receiver) = mpsc::unbounded_channel();
        sender.send(value_frame(b"1")).unwrap();
        sender.send(terminal_frame(b"boom")).unwrap();

        let mut stream = SourceStream::new(receiver);
        assert_eq!(stream.next().await.unwrap().unwrap(), Body::Json(1.into()));
        match stream.next().await.unwrap() {
            Err(Error::Application(text)) => assert!(text.contains("boom")),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_event_ends_stream() {
        let (sender, receiver) = mpsc::unbounded_channel();
        sender.send(Event::Failed(Error::ActivityTimeout)).unwrap();

        let mut stream = SourceStream::new(receiver);
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(Error::ActivityTimeout)
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_listener_is_connection_loss() {
        let (sender, receiver) = mpsc::unbounded_channel();
        drop(sender);

        let mut stream = SourceStream::new(receiver);
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(Error::ConnectionClosed)
        ));
        assert!(stream.next().await.is_none());
    }
}
