//! Encrypted framed connections over a raw duplex transport.

use crate::{
    cipher,
    codec::{recv_frame, send_frame},
    handshake::{self, SessionMaterial},
    identity::PublicKey,
    nonce::Counter,
    transport::{Sink, Stream},
    Config, Error,
};
use bytes::{Buf, Bytes};
use chacha20poly1305::{
    aead::{generic_array::typenum::Unsigned, Aead, AeadCore},
    ChaCha20Poly1305,
};
use rand::{CryptoRng, RngCore};
use std::sync::Arc;
use tokio::{sync::watch, time::timeout};

/// Maximum plaintext bytes carried by a single frame. Larger writes are
/// transparently split.
pub const MAX_FRAME_BODY: usize = 4096;

/// Size of the authentication tag appended to every frame.
const TAG_LEN: usize = <ChaCha20Poly1305 as AeadCore>::TagSize::USIZE;

/// Largest ciphertext a well-formed peer can produce.
const MAX_FRAME_LEN: usize = MAX_FRAME_BODY + TAG_LEN;

/// Shared closed flag of a connection.
///
/// Closing is the single cancellation primitive: it is idempotent, observable
/// from both halves (and anything holding a clone), and wakes a reader
/// blocked on the transport.
#[derive(Clone)]
pub struct Closed {
    flag: Arc<watch::Sender<bool>>,
}

impl Closed {
    fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    /// Mark the connection closed. Returns true only for the call that
    /// performed the transition.
    pub fn close(&self) -> bool {
        !self.flag.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the connection is closed.
    pub async fn wait(&self) {
        let mut subscription = self.flag.subscribe();
        // Cannot fail: we hold the sender ourselves.
        let _ = subscription.wait_for(|closed| *closed).await;
    }
}

/// An authenticated, encrypted connection to a peer.
pub struct Connection<Si: Sink, St: Stream> {
    sender: Sender<Si>,
    receiver: Receiver<St>,
}

impl<Si: Sink, St: Stream> Connection<Si, St> {
    /// Dial role: authenticate to a peer whose identity we already know.
    pub async fn connect<R: RngCore + CryptoRng>(
        rng: &mut R,
        config: Config,
        peer: PublicKey,
        mut sink: Si,
        mut stream: St,
    ) -> Result<Self, Error> {
        if peer == config.keypair.public() {
            return Err(Error::DialSelf);
        }
        let material = timeout(
            config.handshake_timeout,
            handshake::client(rng, &config, peer, &mut sink, &mut stream),
        )
        .await
        .map_err(|_| Error::HandshakeTimeout)??;
        Ok(Self::from_material(&material, sink, stream))
    }

    /// Accept role: authenticate a dialing peer, learning its identity.
    pub async fn accept<R: RngCore + CryptoRng>(
        rng: &mut R,
        config: Config,
        mut sink: Si,
        mut stream: St,
    ) -> Result<Self, Error> {
        let material = timeout(
            config.handshake_timeout,
            handshake::server(rng, &config, &mut sink, &mut stream),
        )
        .await
        .map_err(|_| Error::HandshakeTimeout)??;
        Ok(Self::from_material(&material, sink, stream))
    }

    /// Consume session material exactly once to key the two directions.
    fn from_material(material: &SessionMaterial, sink: Si, stream: St) -> Self {
        let ciphers = cipher::derive_directional(material);
        Self::from_preestablished(
            material.local_identity,
            material.remote_identity,
            sink,
            stream,
            ciphers.send,
            ciphers.recv,
        )
    }

    /// Assemble a connection from pre-established components.
    ///
    /// Useful in tests, or when upgrading a connection whose keys were
    /// negotiated elsewhere.
    pub fn from_preestablished(
        local: PublicKey,
        peer: PublicKey,
        sink: Si,
        stream: St,
        cipher_send: ChaCha20Poly1305,
        cipher_recv: ChaCha20Poly1305,
    ) -> Self {
        let closed = Closed::new();
        Self {
            sender: Sender {
                sink,
                cipher: cipher_send,
                nonce: Counter::default(),
                closed: closed.clone(),
                local,
                peer,
            },
            receiver: Receiver {
                stream,
                cipher: cipher_recv,
                nonce: Counter::default(),
                closed,
                buffered: Bytes::new(),
                ended: false,
            },
        }
    }

    /// The authenticated identity of the peer.
    pub fn peer(&self) -> PublicKey {
        self.sender.peer
    }

    /// Our own identity on this connection.
    pub fn local(&self) -> PublicKey {
        self.sender.local
    }

    /// A handle observing (and able to trigger) connection closure.
    pub fn closed(&self) -> Closed {
        self.sender.closed.clone()
    }

    /// Split into independently owned send and receive halves.
    pub fn split(self) -> (Sender<Si>, Receiver<St>) {
        (self.sender, self.receiver)
    }

    /// Close the connection. Idempotent.
    pub async fn close(&mut self) {
        self.sender.close().await;
    }
}

/// The sending half of a [`Connection`].
pub struct Sender<Si: Sink> {
    sink: Si,
    cipher: ChaCha20Poly1305,
    nonce: Counter,
    closed: Closed,
    local: PublicKey,
    peer: PublicKey,
}

impl<Si: Sink> Sender<Si> {
    pub fn peer(&self) -> PublicKey {
        self.peer
    }

    pub fn closed(&self) -> Closed {
        self.closed.clone()
    }

    /// Encrypt and send `msg`, splitting it into frames as needed.
    ///
    /// Returns the number of payload bytes written. An empty message is a
    /// no-op (the empty frame is reserved as the goodbye marker).
    pub async fn send(&mut self, msg: &[u8]) -> Result<usize, Error> {
        if self.closed.is_closed() {
            return Err(Error::StreamClosed);
        }
        if msg.is_empty() {
            return Ok(0);
        }
        for chunk in msg.chunks(MAX_FRAME_BODY) {
            if let Err(e) = self.send_frame(chunk).await {
                self.closed.close();
                return Err(e);
            }
        }
        Ok(msg.len())
    }

    async fn send_frame(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let nonce = self.nonce.next()?;
        let sealed = self
            .cipher
            .encrypt(&nonce, chunk)
            .map_err(|_| Error::EncryptionFailed)?;
        send_frame(&mut self.sink, &sealed, MAX_FRAME_LEN).await
    }

    /// Close the connection, sending the goodbye frame if we are the first
    /// to close, and release the underlying transport. Idempotent.
    pub async fn close(&mut self) {
        if self.closed.close() {
            // Best-effort goodbye so the peer's read side ends cleanly
            // instead of observing an abrupt transport error.
            let goodbye: &[u8] = &[];
            if let Ok(nonce) = self.nonce.next() {
                if let Ok(sealed) = self.cipher.encrypt(&nonce, goodbye) {
                    let _ = send_frame(&mut self.sink, &sealed, MAX_FRAME_LEN).await;
                }
            }
        }
        self.sink.close().await;
    }
}

/// The receiving half of a [`Connection`].
pub struct Receiver<St: Stream> {
    stream: St,
    cipher: ChaCha20Poly1305,
    nonce: Counter,
    closed: Closed,
    buffered: Bytes,
    ended: bool,
}

impl<St: Stream> Receiver<St> {
    pub fn closed(&self) -> Closed {
        self.closed.clone()
    }

    /// Read decrypted bytes into `buf`, returning how many were written.
    ///
    /// Frames are verified before any plaintext is released; a frame that
    /// fails authentication permanently closes the connection. After the
    /// peer's goodbye, reads return `Ok(0)` forever. Closing the connection
    /// from another task wakes a blocked read with [`Error::StreamClosed`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.buffered.is_empty() {
            return Ok(self.drain(buf));
        }
        if self.ended {
            return Ok(0);
        }
        if self.closed.is_closed() {
            return Err(Error::StreamClosed);
        }

        let closed = self.closed.clone();
        let frame = tokio::select! {
            _ = closed.wait() => return Err(Error::StreamClosed),
            frame = Self::next_frame(&mut self.stream, &mut self.nonce, &self.cipher) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                self.closed.close();
                return Err(e);
            }
        };
        if frame.is_empty() {
            // The peer said goodbye.
            self.ended = true;
            return Ok(0);
        }
        self.buffered = frame;
        Ok(self.drain(buf))
    }

    /// Fill `buf` completely, failing with [`Error::StreamClosed`] if the
    /// stream ends first.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::StreamClosed);
            }
            filled += n;
        }
        Ok(())
    }

    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let n = self.buffered.len().min(buf.len());
        buf[..n].copy_from_slice(&self.buffered[..n]);
        self.buffered.advance(n);
        n
    }

    async fn next_frame(
        stream: &mut St,
        nonce: &mut Counter,
        cipher: &ChaCha20Poly1305,
    ) -> Result<Bytes, Error> {
        let sealed = recv_frame(stream, MAX_FRAME_LEN).await?;
        if sealed.len() < TAG_LEN {
            return Err(Error::InvalidFrameLength(sealed.len()));
        }
        let nonce = nonce.next()?;
        cipher
            .decrypt(&nonce, sealed.as_ref())
            .map(Bytes::from)
            .map_err(|_| Error::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::{Keypair, NetworkIdentifier},
        transport::mocks,
    };
    use chacha20poly1305::KeyInit;
    use rand::{rngs::StdRng, SeedableRng};
    use std::time::Duration;

    fn config(seed: u64) -> Config {
        Config {
            keypair: Keypair::from_seed(seed),
            network: NetworkIdentifier::default(),
            handshake_timeout: Duration::from_secs(5),
        }
    }

    /// A connected pair with mirrored preestablished ciphers.
    fn preestablished_pair() -> (
        Connection<mocks::Sink, mocks::Stream>,
        Connection<mocks::Sink, mocks::Stream>,
    ) {
        let a = Keypair::from_seed(0).public();
        let b = Keypair::from_seed(1).public();
        let a_to_b = ChaCha20Poly1305::new(&[1u8; 32].into());
        let b_to_a = ChaCha20Poly1305::new(&[2u8; 32].into());

        let (a_sink, b_stream) = mocks::Channel::init();
        let (b_sink, a_stream) = mocks::Channel::init();
        (
            Connection::from_preestablished(a, b, a_sink, a_stream, a_to_b.clone(), b_to_a.clone()),
            Connection::from_preestablished(b, a, b_sink, b_stream, b_to_a, a_to_b),
        )
    }

    async fn established_pair() -> (
        Connection<mocks::Sink, mocks::Stream>,
        Connection<mocks::Sink, mocks::Stream>,
    ) {
        let client_config = config(0);
        let server_config = config(1);
        let server_identity = server_config.keypair.public();

        let (client_sink, server_stream) = mocks::Channel::init();
        let (server_sink, client_stream) = mocks::Channel::init();

        let server = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(20);
            Connection::accept(&mut rng, server_config, server_sink, server_stream)
                .await
                .unwrap()
        });

        let mut rng = StdRng::seed_from_u64(21);
        let client = Connection::connect(
            &mut rng,
            client_config,
            server_identity,
            client_sink,
            client_stream,
        )
        .await
        .unwrap();
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_connect_accept_and_exchange() {
        let (client, server) = established_pair().await;
        assert_eq!(client.peer(), server.local());
        assert_eq!(server.peer(), client.local());

        let (mut client_sender, mut client_receiver) = client.split();
        let (mut server_sender, mut server_receiver) = server.split();

        assert_eq!(client_sender.send(b"hello server").await.unwrap(), 12);
        let mut buf = [0u8; 12];
        server_receiver.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello server");

        assert_eq!(server_sender.send(b"hello client").await.unwrap(), 12);
        client_receiver.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello client");
    }

    #[tokio::test]
    async fn test_large_payload_spans_frames() {
        let (a, b) = preestablished_pair();
        let (mut sender, _) = a.split();
        let (_, mut receiver) = b.split();

        // Three frames: 4096 + 4096 + 1808.
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        assert_eq!(sender.send(&payload).await.unwrap(), payload.len());

        let mut received = vec![0u8; payload.len()];
        receiver.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_read_with_small_buffer() {
        let (a, b) = preestablished_pair();
        let (mut sender, _) = a.split();
        let (_, mut receiver) = b.split();

        sender.send(b"abcdef").await.unwrap();
        let mut out = Vec::new();
        while out.len() < 6 {
            let mut buf = [0u8; 2];
            let n = receiver.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn test_goodbye_ends_read_side_cleanly() {
        let (a, b) = preestablished_pair();
        let (mut sender, _) = a.split();
        let (_, mut receiver) = b.split();

        sender.send(b"last words").await.unwrap();
        sender.close().await;

        let mut buf = [0u8; 10];
        receiver.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"last words");

        // Not an error, now or later.
        assert_eq!(receiver.read(&mut buf).await.unwrap(), 0);
        assert_eq!(receiver.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = preestablished_pair();
        let (mut sender, _) = a.split();
        sender.close().await;
        sender.close().await;
        assert!(matches!(sender.send(b"x").await, Err(Error::StreamClosed)));
    }

    /// A sender whose wire is exposed, paired with a receiver fed manually:
    /// lets tests inspect, corrupt, or reorder frames in flight.
    fn tamperable_link() -> (
        Sender<mocks::Sink>,
        mocks::Stream,
        mocks::Sink,
        Receiver<mocks::Stream>,
    ) {
        let a = Keypair::from_seed(0).public();
        let b = Keypair::from_seed(1).public();
        let key = ChaCha20Poly1305::new(&[1u8; 32].into());

        let (a_sink, wire) = mocks::Channel::init();
        let (a_unused_sink, a_stream) = mocks::Channel::init();
        let (redeliver, b_stream) = mocks::Channel::init();
        let (b_unused_sink, b_unused_stream) = mocks::Channel::init();

        let conn_a =
            Connection::from_preestablished(a, b, a_sink, a_stream, key.clone(), key.clone());
        let conn_b = Connection::from_preestablished(
            b,
            a,
            b_unused_sink,
            b_stream,
            key.clone(),
            key,
        );
        drop((a_unused_sink, b_unused_stream));

        let (sender, _) = conn_a.split();
        let (_, receiver) = conn_b.split();
        (sender, wire, redeliver, receiver)
    }

    #[tokio::test]
    async fn test_tampered_frame_closes_connection() {
        use crate::transport::{Sink as _, Stream as _};
        let (mut sender, mut wire, mut b_sink, mut receiver) = tamperable_link();
        sender.send(b"payload").await.unwrap();

        // Lift the frame off the wire, flip one ciphertext bit, re-deliver.
        let mut prefix = [0u8; 4];
        wire.recv(&mut prefix).await.unwrap();
        let mut sealed = vec![0u8; u32::from_be_bytes(prefix) as usize];
        wire.recv(&mut sealed).await.unwrap();
        sealed[0] ^= 0x01;
        b_sink.send(&prefix).await.unwrap();
        b_sink.send(&sealed).await.unwrap();

        let mut buf = [0u8; 7];
        assert!(matches!(
            receiver.read(&mut buf).await,
            Err(Error::DecryptionFailed)
        ));
        // Tampering closes the connection permanently.
        assert!(receiver.closed().is_closed());
        assert!(matches!(
            receiver.read(&mut buf).await,
            Err(Error::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_reordered_frames_fail_authentication() {
        use crate::transport::{Sink as _, Stream as _};
        let (mut sender, mut wire, mut b_sink, mut receiver) = tamperable_link();

        // Two frames, delivered in swapped order: the nonce sequence no
        // longer matches and authentication fails.
        sender.send(b"first").await.unwrap();
        sender.send(b"second").await.unwrap();
        let mut frames = Vec::new();
        for _ in 0..2 {
            let mut prefix = [0u8; 4];
            wire.recv(&mut prefix).await.unwrap();
            let mut sealed = vec![0u8; u32::from_be_bytes(prefix) as usize];
            wire.recv(&mut sealed).await.unwrap();
            frames.push((prefix, sealed));
        }
        for (prefix, sealed) in frames.into_iter().rev() {
            b_sink.send(&prefix).await.unwrap();
            b_sink.send(&sealed).await.unwrap();
        }

        let mut buf = [0u8; 6];
        assert!(matches!(
            receiver.read(&mut buf).await,
            Err(Error::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (a, _b) = preestablished_pair();
        let (sender, mut receiver) = a.split();
        let closed = sender.closed();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            receiver.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        closed.close();
        assert!(matches!(reader.await.unwrap(), Err(Error::StreamClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let mut config = config(0);
        config.handshake_timeout = Duration::from_secs(1);
        let peer = Keypair::from_seed(1).public();

        // A peer that accepts the connection but never answers.
        let (sink, _their_stream) = mocks::Channel::init();
        let (_their_sink, stream) = mocks::Channel::init();

        let mut rng = StdRng::seed_from_u64(3);
        let result = Connection::connect(&mut rng, config, peer, sink, stream).await;
        assert!(matches!(result, Err(Error::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_dial_self_rejected() {
        let config = config(0);
        let own = config.keypair.public();
        let (sink, _s) = mocks::Channel::init();
        let (_k, stream) = mocks::Channel::init();

        let mut rng = StdRng::seed_from_u64(3);
        let result = Connection::connect(&mut rng, config, own, sink, stream).await;
        assert!(matches!(result, Err(Error::DialSelf)));
    }
}
