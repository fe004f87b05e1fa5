//! Directional traffic keys derived from session material.

use crate::{handshake::SessionMaterial, identity::PublicKey};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// SHA-256 over the concatenation of `parts`.
pub(crate) fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// The two traffic ciphers of a connection.
pub(crate) struct Directional {
    pub send: ChaCha20Poly1305,
    pub recv: ChaCha20Poly1305,
}

/// Derive the directional traffic ciphers from session material.
///
/// Each direction's key binds the receiving party's long-term identity, so
/// the two directions can never share a key (preventing reflection) while
/// both sides still derive the same pair: our send key is the peer's recv
/// key and vice versa.
pub(crate) fn derive_directional(material: &SessionMaterial) -> Directional {
    Directional {
        send: traffic_cipher(material.secret(), &material.remote_identity),
        recv: traffic_cipher(material.secret(), &material.local_identity),
    }
}

fn traffic_cipher(secret: &[u8; 32], recipient: &PublicKey) -> ChaCha20Poly1305 {
    let mut key = sha256(&[secret, recipient.as_ref()]);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    cipher
}
