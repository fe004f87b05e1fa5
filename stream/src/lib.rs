//! Mutually authenticated, encrypted connections between gossiping peers.
//!
//! This crate provides the transport security layer for a peer-to-peer gossip
//! node: a mutual-authentication key exchange between long-term Ed25519
//! identities, followed by a framed, authenticated-encryption byte stream
//! ("box stream") over any duplex transport. Peers on the same logical network
//! share a 32-byte network identifier; handshakes are only answered when the
//! initiator proves knowledge of it, so nodes on unrelated networks (or plain
//! port scanners) learn nothing, not even that this protocol is spoken.
//!
//! # Design
//!
//! ## Handshake
//!
//! A four-message handshake authenticates both peers and derives a shared
//! secret. The **client** dials a peer whose public key it already knows; the
//! **server** accepts and learns the client's identity during the exchange.
//!
//! - Message 1 (client, 64 bytes): an HMAC over the client's fresh ephemeral
//!   X25519 key, keyed by the network identifier, followed by that key.
//! - Message 2 (server, 64 bytes): the same form for the server's ephemeral key.
//! - Message 3 (client, 112 bytes): the client's identity and a signature over
//!   the network identifier, the server's identity, and the ephemeral shared
//!   secret, sealed under a key derived from the secrets both sides can
//!   already compute.
//! - Message 4 (server, 80 bytes): the server's signature over the client's
//!   proof, sealed under a key that additionally requires the client's
//!   long-term key, which the server only has if message 3 verified.
//!
//! Long-term identities never travel in the clear: the client's appears only
//! inside the sealed third message, and the server's is never transmitted at
//! all (the client must already know it). Every verification failure aborts
//! the attempt; ephemeral keys are single-use.
//!
//! ## Encryption
//!
//! The handshake's combined secret is hashed together with each party's
//! long-term key to produce one ChaCha20-Poly1305 key per direction, so a
//! frame can never be reflected back to its sender. Each written payload is
//! split into frames of at most [`MAX_FRAME_BODY`] bytes, sealed with a
//! per-direction 96-bit counter nonce, and length-prefixed on the wire. A
//! frame that fails authentication permanently closes the connection; an
//! empty frame is the goodbye marker and ends the read side cleanly.
//!
//! # Security
//!
//! ## Provided
//!
//! - **Mutual Authentication**: both parties prove ownership of their
//!   long-term keys through signatures over the ephemeral shared secret.
//! - **Forward Secrecy**: ephemeral keys are generated per attempt and
//!   discarded once the session secret is derived.
//! - **Network Scoping**: the first message of either role is rejected
//!   without the shared network identifier.
//! - **Tamper Evidence**: every frame is independently authenticated;
//!   alteration, replay, and reordering all surface as decryption failures
//!   that close the connection.
//!
//! ## Not Provided
//!
//! - **Anonymity from the dialed peer**: the server learns the client's
//!   identity before the client has verified message 4.
//! - **Padding**: frame lengths are visible to observers, allowing traffic
//!   analysis.

use thiserror::Error;

mod cipher;
mod codec;
mod connection;
pub mod handshake;
pub mod identity;
mod nonce;
pub mod transport;

pub use connection::{Closed, Connection, Receiver, Sender, MAX_FRAME_BODY};
pub use handshake::SessionMaterial;
pub use identity::{Keypair, NetworkIdentifier, PublicKey};

use std::time::Duration;

/// Errors that can occur when establishing or using a connection.
#[derive(Error, Debug)]
pub enum Error {
    // Handshake errors
    #[error("handshake timeout")]
    HandshakeTimeout,
    #[error("cannot dial self")]
    DialSelf,
    #[error("hello failed network authentication")]
    HelloVerificationFailed,
    #[error("authentication message failed to open")]
    AuthDecryptionFailed,
    #[error("authentication message was malformed")]
    MalformedAuth,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid peer identity")]
    InvalidIdentity,
    #[error("malformed peer id")]
    MalformedPeerId,
    #[error("shared secret was not contributory")]
    SharedSecretNotContributory,

    // Transport errors
    #[error("send failed")]
    SendFailed(#[source] transport::Error),
    #[error("recv failed")]
    RecvFailed(#[source] transport::Error),
    #[error("connection closed")]
    StreamClosed,

    // Encryption errors
    #[error("nonce overflow")]
    NonceOverflow,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,

    // Framing errors
    #[error("invalid frame length: {0} bytes")]
    InvalidFrameLength(usize),
}

/// Configuration for establishing a connection.
///
/// # Warning
///
/// The network identifier must match on every peer of a logical network.
/// Peers carrying a different identifier refuse each other during the first
/// two handshake messages.
#[derive(Clone)]
pub struct Config {
    /// The long-term identity used to authenticate to peers.
    pub keypair: Keypair,

    /// Shared secret scoping peers to one network instance.
    pub network: NetworkIdentifier,

    /// Maximum time allowed for completing the handshake.
    pub handshake_timeout: Duration,
}
