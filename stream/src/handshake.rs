//! The four-message mutual-authentication key exchange.
//!
//! | # | Sender | Bytes | Content                                            |
//! |---|--------|-------|----------------------------------------------------|
//! | 1 | client | 64    | HMAC(network, ephemeral) ‖ ephemeral               |
//! | 2 | server | 64    | HMAC(network, ephemeral) ‖ ephemeral               |
//! | 3 | client | 112   | sealed: sign_A ‖ client identity                   |
//! | 4 | server | 80    | sealed: sign_B                                     |
//!
//! Three Diffie-Hellman secrets accumulate over the exchange: ephemeral ×
//! ephemeral (`ee`), client ephemeral × server identity (`es`), and client
//! identity × server ephemeral (`se`). Each sealed message is keyed by
//! the hash of the network identifier and every secret available at that
//! point. An active attacker that cannot produce one of the secrets cannot
//! open or forge the corresponding message; a passive observer sees only
//! ephemeral keys and ciphertext.
//!
//! The derived [`SessionMaterial`] is consumed exactly once, by the
//! connection layer, to key the directional traffic ciphers.

use crate::{
    cipher::sha256,
    identity::{NetworkIdentifier, PublicKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH},
    transport::{Sink, Stream},
    Config, Error,
};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{PublicKey as ExchangeKey, SharedSecret, StaticSecret};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Length of messages 1 and 2.
pub const HELLO_LEN: usize = 64;
/// Length of message 3.
pub const CLIENT_AUTH_LEN: usize = 112;
/// Length of message 4.
pub const SERVER_ACCEPT_LEN: usize = 80;

const AUTH_PLAINTEXT_LEN: usize = SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH;
const HMAC_LEN: usize = 32;

/// Everything a completed handshake derives.
///
/// Owned briefly: the connection layer consumes it to derive directional
/// traffic keys, after which the secret is scrubbed on drop.
pub struct SessionMaterial {
    secret: [u8; 32],
    pub local_identity: PublicKey,
    pub remote_identity: PublicKey,
    pub local_ephemeral: [u8; 32],
    pub remote_ephemeral: [u8; 32],
}

impl SessionMaterial {
    pub(crate) fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    #[cfg(test)]
    pub(crate) fn for_tests(secret: [u8; 32], local: PublicKey, remote: PublicKey) -> Self {
        Self {
            secret,
            local_identity: local,
            remote_identity: remote,
            local_ephemeral: [0u8; 32],
            remote_ephemeral: [0u8; 32],
        }
    }
}

impl Drop for SessionMaterial {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for SessionMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMaterial")
            .field("local_identity", &self.local_identity)
            .field("remote_identity", &self.remote_identity)
            .finish_non_exhaustive()
    }
}

/// Build a hello message: an ephemeral key authenticated to the network.
fn encode_hello(network: &NetworkIdentifier, ephemeral: &ExchangeKey) -> [u8; HELLO_LEN] {
    let mut msg = [0u8; HELLO_LEN];
    msg[..HMAC_LEN].copy_from_slice(&network_mac(network, ephemeral.as_bytes()).finalize().into_bytes());
    msg[HMAC_LEN..].copy_from_slice(ephemeral.as_bytes());
    msg
}

/// Verify a hello and extract the peer's ephemeral key.
///
/// The HMAC must verify against the network identifier before the key is
/// trusted; this keeps us from responding to probes from peers on a
/// different network.
fn verify_hello(network: &NetworkIdentifier, msg: &[u8; HELLO_LEN]) -> Result<ExchangeKey, Error> {
    let (tag, key) = msg.split_at(HMAC_LEN);
    network_mac(network, key)
        .verify_slice(tag)
        .map_err(|_| Error::HelloVerificationFailed)?;
    let key: [u8; 32] = key.try_into().map_err(|_| Error::HelloVerificationFailed)?;
    Ok(ExchangeKey::from(key))
}

fn network_mac(network: &NetworkIdentifier, message: &[u8]) -> HmacSha256 {
    // A 32-byte key is always a valid HMAC key.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(network.as_bytes()).expect("fixed-length key");
    mac.update(message);
    mac
}

/// Seal a handshake payload under a derived key with the all-zero nonce.
///
/// The nonce is fixed because every handshake key is used for exactly one
/// message.
fn seal(mut key: [u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    cipher
        .encrypt(&Nonce::default(), plaintext)
        .map_err(|_| Error::EncryptionFailed)
}

fn open(mut key: [u8; 32], sealed: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    cipher
        .decrypt(&Nonce::default(), sealed)
        .map_err(|_| Error::AuthDecryptionFailed)
}

/// Reject Diffie-Hellman outputs where the peer's key contributed nothing
/// (low-order points force the shared secret to zero for any local key).
fn contributory(secret: SharedSecret) -> Result<SharedSecret, Error> {
    if !secret.was_contributory() {
        return Err(Error::SharedSecretNotContributory);
    }
    Ok(secret)
}

/// Run the client (initiating) role against a peer whose identity we know.
pub(crate) async fn client<R, Si, St>(
    rng: &mut R,
    config: &Config,
    peer: PublicKey,
    sink: &mut Si,
    stream: &mut St,
) -> Result<SessionMaterial, Error>
where
    R: RngCore + CryptoRng,
    Si: Sink,
    St: Stream,
{
    let network = &config.network;
    let local = config.keypair.public();

    // Message 1: our fresh ephemeral key, authenticated to the network.
    let ephemeral_secret = StaticSecret::random_from_rng(&mut *rng);
    let ephemeral = ExchangeKey::from(&ephemeral_secret);
    sink.send(&encode_hello(network, &ephemeral))
        .await
        .map_err(Error::SendFailed)?;

    // Message 2: the server's ephemeral key.
    let mut hello = [0u8; HELLO_LEN];
    stream.recv(&mut hello).await.map_err(Error::RecvFailed)?;
    let server_ephemeral = verify_hello(network, &hello)?;

    // Both hellos are exchanged; two of the three secrets are now in reach.
    let secret_ee = contributory(ephemeral_secret.diffie_hellman(&server_ephemeral))?;
    let secret_es = contributory(ephemeral_secret.diffie_hellman(&peer.to_exchange_key()?))?;
    let secret_ee_hash = sha256(&[secret_ee.as_bytes()]);

    // Message 3: prove who we are. The signature covers the server's
    // identity so it cannot be replayed toward another peer.
    let proof = [network.as_bytes() as &[u8], peer.as_ref(), &secret_ee_hash].concat();
    let signature = config.keypair.sign(&proof);
    let mut plaintext = [0u8; AUTH_PLAINTEXT_LEN];
    plaintext[..SIGNATURE_LENGTH].copy_from_slice(&signature);
    plaintext[SIGNATURE_LENGTH..].copy_from_slice(local.as_ref());
    let auth = seal(
        sha256(&[network.as_bytes(), secret_ee.as_bytes(), secret_es.as_bytes()]),
        &plaintext,
    )?;
    sink.send(&auth).await.map_err(Error::SendFailed)?;

    // The final secret requires our long-term key.
    let secret_se = contributory(
        config
            .keypair
            .to_exchange_secret()
            .diffie_hellman(&server_ephemeral),
    )?;

    // Message 4: the server accepts by countersigning our proof. Only a
    // server that opened message 3 can derive this key.
    let mut accept = [0u8; SERVER_ACCEPT_LEN];
    stream.recv(&mut accept).await.map_err(Error::RecvFailed)?;
    let opened = open(
        sha256(&[
            network.as_bytes(),
            secret_ee.as_bytes(),
            secret_es.as_bytes(),
            secret_se.as_bytes(),
        ]),
        &accept,
    )?;
    let server_signature: [u8; SIGNATURE_LENGTH] =
        opened.try_into().map_err(|_| Error::MalformedAuth)?;
    let countersigned = [
        network.as_bytes() as &[u8],
        &signature,
        local.as_ref(),
        &secret_ee_hash,
    ]
    .concat();
    if !peer.verify(&countersigned, &server_signature) {
        return Err(Error::InvalidSignature);
    }

    let mut combined = sha256(&[
        network.as_bytes(),
        secret_ee.as_bytes(),
        secret_es.as_bytes(),
        secret_se.as_bytes(),
    ]);
    let secret = sha256(&[&combined]);
    combined.zeroize();

    Ok(SessionMaterial {
        secret,
        local_identity: local,
        remote_identity: peer,
        local_ephemeral: ephemeral.to_bytes(),
        remote_ephemeral: server_ephemeral.to_bytes(),
    })
}

/// Run the server (accepting) role; the client's identity is learned from
/// message 3.
pub(crate) async fn server<R, Si, St>(
    rng: &mut R,
    config: &Config,
    sink: &mut Si,
    stream: &mut St,
) -> Result<SessionMaterial, Error>
where
    R: RngCore + CryptoRng,
    Si: Sink,
    St: Stream,
{
    let network = &config.network;
    let local = config.keypair.public();

    // Message 1: the client's ephemeral key. Nothing is sent until the
    // HMAC proves the dialer belongs to our network.
    let mut hello = [0u8; HELLO_LEN];
    stream.recv(&mut hello).await.map_err(Error::RecvFailed)?;
    let client_ephemeral = verify_hello(network, &hello)?;

    // Message 2: our ephemeral key.
    let ephemeral_secret = StaticSecret::random_from_rng(&mut *rng);
    let ephemeral = ExchangeKey::from(&ephemeral_secret);
    sink.send(&encode_hello(network, &ephemeral))
        .await
        .map_err(Error::SendFailed)?;

    let secret_ee = contributory(ephemeral_secret.diffie_hellman(&client_ephemeral))?;
    let secret_es = contributory(
        config
            .keypair
            .to_exchange_secret()
            .diffie_hellman(&client_ephemeral),
    )?;
    let secret_ee_hash = sha256(&[secret_ee.as_bytes()]);

    // Message 3: learn and verify the client's identity.
    let mut auth = [0u8; CLIENT_AUTH_LEN];
    stream.recv(&mut auth).await.map_err(Error::RecvFailed)?;
    let opened = open(
        sha256(&[network.as_bytes(), secret_ee.as_bytes(), secret_es.as_bytes()]),
        &auth,
    )?;
    if opened.len() != AUTH_PLAINTEXT_LEN {
        return Err(Error::MalformedAuth);
    }
    let (signature, identity) = opened.split_at(SIGNATURE_LENGTH);
    let client_signature: [u8; SIGNATURE_LENGTH] =
        signature.try_into().map_err(|_| Error::MalformedAuth)?;
    let client_bytes: [u8; PUBLIC_KEY_LENGTH] =
        identity.try_into().map_err(|_| Error::MalformedAuth)?;
    let client = PublicKey::from_bytes(client_bytes);
    let proof = [network.as_bytes() as &[u8], local.as_ref(), &secret_ee_hash].concat();
    if !client.verify(&proof, &client_signature) {
        return Err(Error::InvalidSignature);
    }

    let secret_se = contributory(ephemeral_secret.diffie_hellman(&client.to_exchange_key()?))?;

    // Message 4: countersign the client's proof under the full key schedule.
    let countersigned = [
        network.as_bytes() as &[u8],
        &client_signature,
        client.as_ref(),
        &secret_ee_hash,
    ]
    .concat();
    let server_signature = config.keypair.sign(&countersigned);
    let accept = seal(
        sha256(&[
            network.as_bytes(),
            secret_ee.as_bytes(),
            secret_es.as_bytes(),
            secret_se.as_bytes(),
        ]),
        &server_signature,
    )?;
    sink.send(&accept).await.map_err(Error::SendFailed)?;

    let mut combined = sha256(&[
        network.as_bytes(),
        secret_ee.as_bytes(),
        secret_es.as_bytes(),
        secret_se.as_bytes(),
    ]);
    let secret = sha256(&[&combined]);
    combined.zeroize();

    Ok(SessionMaterial {
        secret,
        local_identity: local,
        remote_identity: client,
        local_ephemeral: ephemeral.to_bytes(),
        remote_ephemeral: client_ephemeral.to_bytes(),
    })
}
