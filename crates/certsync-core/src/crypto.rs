//! AES-256-GCM envelope crypto
//!
//! Stored values may be encrypted before being written to the store. The
//! wire layout is:
//!
//! ```text
//! [ 12-byte IV ][ ciphertext ][ 16-byte tag ]
//! ```
//!
//! Decryption is pure and deterministic: a failure for a given input is
//! permanent, so callers never retry it.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{DecryptFailure, Error, Result};

/// Length of the IV prefix
pub const IV_LEN: usize = 12;

/// Length of the GCM authentication tag suffix
pub const TAG_LEN: usize = 16;

/// Length of an AES-256 key
pub const KEY_LEN: usize = 32;

/// Stateless AES-256-GCM decryptor (and encryptor, for writers)
#[derive(Clone)]
pub struct EnvelopeCrypto {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for EnvelopeCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCrypto").finish_non_exhaustive()
    }
}

impl EnvelopeCrypto {
    /// Create from raw key material
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Create from a configured secret
    ///
    /// The secret is used as-is when it is exactly 32 UTF-8 bytes; otherwise
    /// it must be base64 that decodes to 32 bytes.
    pub fn from_secret(secret: &str) -> Result<Self> {
        let raw = secret.as_bytes();
        if raw.len() == KEY_LEN {
            let cipher = Aes256Gcm::new_from_slice(raw)
                .map_err(|e| Error::validation(format!("invalid AES key: {}", e)))?;
            return Ok(Self { cipher });
        }

        let decoded = STANDARD
            .decode(secret.trim())
            .map_err(|_| Error::validation(format!(
                "AES key must be {} bytes or base64 of {} bytes, got {} bytes",
                KEY_LEN,
                KEY_LEN,
                raw.len()
            )))?;
        if decoded.len() != KEY_LEN {
            return Err(Error::validation(format!(
                "AES key must decode to {} bytes, got {}",
                KEY_LEN,
                decoded.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&decoded)
            .map_err(|e| Error::validation(format!("invalid AES key: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Decrypt `[IV][ciphertext][tag]`
    ///
    /// The returned failure carries the original input for diagnostics.
    pub fn decrypt(&self, input: &[u8]) -> std::result::Result<Vec<u8>, DecryptFailure> {
        if input.len() < IV_LEN + TAG_LEN {
            return Err(DecryptFailure::new(
                input,
                format!(
                    "ciphertext too short: {} bytes, need at least {}",
                    input.len(),
                    IV_LEN + TAG_LEN
                ),
            ));
        }

        let (iv, body) = input.split_at(IV_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(iv), body)
            .map_err(|e| DecryptFailure::new(input, e.to_string()))
    }

    /// Encrypt with a fresh random IV, producing `[IV][ciphertext][tag]`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Other(format!("Encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(IV_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}
