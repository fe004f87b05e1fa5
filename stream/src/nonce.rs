//! Deterministic per-frame nonces.

use crate::Error;
use chacha20poly1305::Nonce;

/// Counter over the 96-bit ChaCha20-Poly1305 nonce space.
///
/// Each direction of a connection owns one counter, starting at zero and
/// advancing by one per frame. The directions use independent keys, so the
/// overlapping counter values are harmless; what matters is that a value is
/// never reused under the same key.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counter {
    value: u128,
}

/// First value that no longer fits in 96 bits.
const LIMIT: u128 = 1 << 96;

impl Counter {
    /// Encode the current value as a nonce and advance.
    ///
    /// Fails with [`Error::NonceOverflow`] once the 96-bit space is
    /// exhausted; the counter then stays pinned so the failure is permanent
    /// rather than wrapping back to reused values.
    pub fn next(&mut self) -> Result<Nonce, Error> {
        if self.value >= LIMIT {
            return Err(Error::NonceOverflow);
        }
        let mut nonce = Nonce::default();
        nonce.copy_from_slice(&self.value.to_be_bytes()[4..]);
        self.value += 1;
        Ok(nonce)
    }
}
