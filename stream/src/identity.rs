//! Long-term peer identities and the shared network identifier.
//!
//! A peer's addressable identity is its Ed25519 public key, rendered in text
//! as `@<base64>.ed25519`. The corresponding [`Keypair`] signs handshake
//! proofs; its secret half additionally converts to an X25519 scalar so the
//! identity can participate in Diffie-Hellman exchanges during the handshake.

use crate::Error;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};
use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

/// Length of a serialized public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of a detached signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Suffix identifying the signature scheme in textual peer ids.
const KEY_SUFFIX: &str = ".ed25519";

/// A peer's long-term public key.
///
/// This is the canonical addressable identity of a peer: it keys connection
/// registries, appears in textual addresses, and is the value a dialer must
/// already hold to authenticate the peer it reaches.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// Parse a bare standard-base64 key.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let raw = BASE64.decode(encoded).map_err(|_| Error::MalformedPeerId)?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] =
            raw.try_into().map_err(|_| Error::MalformedPeerId)?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Verify a detached signature over `message`.
    ///
    /// Returns false for signatures that do not verify and for key bytes
    /// that do not decode to a valid curve point.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LENGTH]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(signature))
            .is_ok()
    }

    /// The X25519 (montgomery form) equivalent of this key, for
    /// Diffie-Hellman exchanges against an ephemeral secret.
    pub(crate) fn to_exchange_key(&self) -> Result<x25519_dalek::PublicKey, Error> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| Error::InvalidIdentity)?;
        Ok(x25519_dalek::PublicKey::from(key.to_montgomery().to_bytes()))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}{}", self.to_base64(), KEY_SUFFIX)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    /// Accepts both the decorated form (`@<base64>.ed25519`) and a bare
    /// base64 key.
    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.strip_prefix('@').unwrap_or(s);
        let s = s.strip_suffix(KEY_SUFFIX).unwrap_or(s);
        Self::from_base64(s)
    }
}

/// A long-term Ed25519 signing keypair.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh identity.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            signing: SigningKey::generate(rng),
        }
    }

    /// Derive a deterministic identity from a seed.
    ///
    /// Intended for tests and examples; real identities should come from
    /// [`Keypair::generate`] or stored key material.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::generate(&mut rng)
    }

    /// Restore an identity from its 32-byte secret seed.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&bytes),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Produce a detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing.sign(message).to_bytes()
    }

    /// The X25519 scalar equivalent of the secret key, for Diffie-Hellman
    /// exchanges against a peer's ephemeral key.
    pub(crate) fn to_exchange_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing.to_scalar_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("public", &self.public()).finish_non_exhaustive()
    }
}

/// Shared 32-byte secret scoping peers to one logical network instance.
///
/// Used as an HMAC key during the handshake: a peer that cannot produce the
/// identifier never gets past the first message. The default value is the
/// identifier of the public main network; private deployments should mint
/// their own random 32 bytes.
#[derive(Clone)]
pub struct NetworkIdentifier([u8; 32]);

impl NetworkIdentifier {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Default for NetworkIdentifier {
    fn default() -> Self {
        // The well-known main-network identifier.
        Self([
            0xd4, 0xa1, 0xcb, 0x88, 0xa6, 0x6f, 0x02, 0xf8, 0xdb, 0x63, 0x5c, 0xe2, 0x64, 0x41,
            0xcc, 0x5d, 0xac, 0x1b, 0x08, 0x42, 0x0c, 0xea, 0xac, 0x23, 0x08, 0x39, 0xb7, 0x55,
            0x84, 0x5a, 0x9f, 0xfb,
        ])
    }
}

impl fmt::Debug for NetworkIdentifier {
    // Private networks treat the identifier as a secret; never print it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkIdentifier(..)")
    }
}
