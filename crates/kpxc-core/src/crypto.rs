//! Cryptographic session: Curve25519 key pairs and the XSalsa20-Poly1305 box.
//!
//! The shared key is precomputed once from our secret key and the daemon's
//! public key. Every payload after the handshake is sealed and opened with
//! it under a fresh random 24-byte nonce.

use std::sync::OnceLock;

use crypto_box::aead::{generic_array::GenericArray, Aead};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::ClientError;

pub const NONCE_SIZE: usize = 24;
pub const KEY_SIZE: usize = 32;

pub type Nonce = [u8; NONCE_SIZE];

/// Random nonce from the OS CSPRNG.
pub fn generate_nonce() -> Result<Nonce, ClientError> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| ClientError::KeyGeneration(e.to_string()))?;
    Ok(nonce)
}

/// Little-endian increment with carry across every byte. All-0xFF wraps to
/// all-zero.
pub fn increment_nonce(nonce: &[u8]) -> Vec<u8> {
    let mut out = nonce.to_vec();
    for byte in out.iter_mut() {
        let (next, overflow) = byte.overflowing_add(1);
        *byte = next;
        if !overflow {
            break;
        }
    }
    out
}

/// Curve25519 key pair. The secret half is zeroized on drop.
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        *self.public.as_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; KEY_SIZE] {
        self.secret.to_bytes()
    }

    /// Precompute the box key shared with `peer`.
    pub fn shared_key(&self, peer: &[u8; KEY_SIZE]) -> SharedKey {
        SharedKey(SalsaBox::new(&PublicKey::from(*peer), &self.secret))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// Precomputed symmetric box key.
pub struct SharedKey(SalsaBox);

impl SharedKey {
    pub fn seal(&self, plaintext: &[u8], nonce: &Nonce) -> Result<Vec<u8>, ClientError> {
        self.0
            .encrypt(GenericArray::from_slice(nonce), plaintext)
            .map_err(|_| ClientError::Encode("box seal failed".into()))
    }

    /// Fails with [`ClientError::DecryptFailed`] when authentication fails;
    /// no partially decrypted data is returned.
    pub fn open(&self, ciphertext: &[u8], nonce: &Nonce) -> Result<Vec<u8>, ClientError> {
        self.0
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| ClientError::DecryptFailed)
    }
}

/// Per-client key material: the ephemeral key pair, the client id and the
/// shared key once the handshake has run.
#[derive(Debug)]
pub struct Session {
    keys: KeyPair,
    client_id: Nonce,
    shared: OnceLock<SharedKey>,
}

impl Session {
    pub fn generate() -> Result<Self, ClientError> {
        Ok(Self {
            keys: KeyPair::generate(),
            client_id: generate_nonce()?,
            shared: OnceLock::new(),
        })
    }

    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        self.keys.public_bytes()
    }

    pub fn client_id(&self) -> &Nonce {
        &self.client_id
    }

    /// Derive and cache the shared key. A second call keeps the first key.
    pub fn establish(&self, daemon_public: &[u8; KEY_SIZE]) {
        let _ = self.shared.get_or_init(|| self.keys.shared_key(daemon_public));
    }

    pub fn is_established(&self) -> bool {
        self.shared.get().is_some()
    }

    pub fn shared_key(&self) -> Result<&SharedKey, ClientError> {
        self.shared.get().ok_or(ClientError::HandshakeIncomplete)
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_wraps_all_ff() {
        assert_eq!(increment_nonce(&[0xff; NONCE_SIZE]), vec![0u8; NONCE_SIZE]);
    }

    #[test]
    fn increment_touches_minimal_bytes() {
        assert_eq!(increment_nonce(&[0x01, 0xff, 0x02]), vec![0x02, 0xff, 0x02]);
        assert_eq!(increment_nonce(&[0xff, 0xff, 0x02, 0x09]), vec![0x00, 0x00, 0x03, 0x09]);
        assert_eq!(increment_nonce(&[]), Vec::<u8>::new());
    }

    #[test]
    fn seal_open_between_peers() {
        let client = KeyPair::generate();
        let daemon = KeyPair::generate();
        let client_key = client.shared_key(&daemon.public_bytes());
        let daemon_key = daemon.shared_key(&client.public_bytes());

        let nonce = generate_nonce().unwrap();
        let sealed = client_key.seal(b"{\"action\":\"associate\"}", &nonce).unwrap();
        let opened = daemon_key.open(&sealed, &nonce).unwrap();
        assert_eq!(opened, b"{\"action\":\"associate\"}");

        let empty = daemon_key.seal(b"", &nonce).unwrap();
        assert!(client_key.open(&empty, &nonce).unwrap().is_empty());
    }

    #[test]
    fn flipped_bit_fails_to_open() {
        let client = KeyPair::generate();
        let daemon = KeyPair::generate();
        let nonce = generate_nonce().unwrap();
        let mut sealed = client
            .shared_key(&daemon.public_bytes())
            .seal(b"secret payload", &nonce)
            .unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let res = daemon.shared_key(&client.public_bytes()).open(&sealed, &nonce);
        assert!(matches!(res, Err(ClientError::DecryptFailed)));
    }

    #[test]
    fn wrong_nonce_fails_to_open() {
        let client = KeyPair::generate();
        let daemon = KeyPair::generate();
        let nonce = generate_nonce().unwrap();
        let sealed = client
            .shared_key(&daemon.public_bytes())
            .seal(b"payload", &nonce)
            .unwrap();
        let other: Nonce = increment_nonce(&nonce).try_into().unwrap();
        let res = daemon.shared_key(&client.public_bytes()).open(&sealed, &other);
        assert!(matches!(res, Err(ClientError::DecryptFailed)));
    }

    #[test]
    fn establish_is_idempotent() {
        let session = Session::generate().unwrap();
        assert!(matches!(session.shared_key(), Err(ClientError::HandshakeIncomplete)));

        let first = KeyPair::generate();
        let second = KeyPair::generate();
        session.establish(&first.public_bytes());
        session.establish(&second.public_bytes());

        let nonce = generate_nonce().unwrap();
        let sealed = session.shared_key().unwrap().seal(b"hi", &nonce).unwrap();
        let opened = first
            .shared_key(&session.public_key())
            .open(&sealed, &nonce)
            .unwrap();
        assert_eq!(opened, b"hi");
    }

    #[test]
    fn secret_bytes_round_trip() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(pair.secret_bytes());
        assert_eq!(pair.public_bytes(), restored.public_bytes());
    }
}
