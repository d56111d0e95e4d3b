//! Pre-shared-key payload cipher.
//!
//! Both handshake directions carry JSON payloads sealed under a key the two
//! ends were provisioned with out of band. The sealed layout is a random
//! 96-bit nonce followed by the AES-256-GCM ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Cipher errors
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("payload could not be opened with the pre-shared key")]
    Open,

    #[error("payload could not be sealed")]
    Seal,

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Seals and opens opaque byte payloads.
///
/// The handshake codec treats this as a capability; the concrete scheme only
/// has to be agreed on by both ends of a hop.
pub trait Cipher: Send + Sync {
    /// Seal a plaintext payload.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Open a sealed payload.
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// AES-256-GCM under a key derived from the pre-shared secret.
pub struct PresharedCipher {
    aead: Aes256Gcm,
}

impl PresharedCipher {
    /// The pre-shared secret may be any length; it is hashed onto the fixed
    /// AEAD key size.
    pub fn new(secret: &[u8]) -> Self {
        let digest = Sha256::digest(secret);
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            aead: Aes256Gcm::new(key),
        }
    }
}

impl Cipher for PresharedCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .aead
            .encrypt(nonce, plain)
            .map_err(|_| CipherError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < NONCE_LEN {
            return Err(CipherError::Open);
        }
        let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.aead.decrypt(nonce, body).map_err(|_| CipherError::Open)
    }
}

/// Serialize `value` as JSON and seal it.
pub fn encrypt_json<T: Serialize>(cipher: &dyn Cipher, value: &T) -> Result<Vec<u8>, CipherError> {
    let plain = serde_json::to_vec(value)?;
    cipher.encrypt(&plain)
}

/// Open `sealed` and deserialize the JSON plaintext.
pub fn decrypt_json<T: DeserializeOwned>(
    cipher: &dyn Cipher,
    sealed: &[u8],
) -> Result<T, CipherError> {
    let plain = cipher.decrypt(sealed)?;
    Ok(serde_json::from_slice(&plain)?)
}
