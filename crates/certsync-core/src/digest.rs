//! Content hashing
//!
//! Change detection compares [`ContentHash`] values only. A hash covers the
//! logical content (key + decrypted value for records, key fields + role
//! hashes for groups), never raw ciphertext, so re-encrypting identical
//! plaintext under a new IV does not register as a change.

use sha2::{Digest, Sha256};

/// SHA-256 digest of a sequence of length-prefixed fields
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash the given fields in order
    ///
    /// Each field is length-prefixed so `("ab", "c")` and `("a", "bc")`
    /// hash differently.
    pub fn of<I, F>(fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        let mut hasher = Sha256::new();
        for field in fields {
            let field = field.as_ref();
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

/// Anything that carries a content hash for diffing
pub trait Versioned {
    /// The hash that decides added/updated/unchanged
    fn content_hash(&self) -> ContentHash;
}

impl Versioned for ContentHash {
    fn content_hash(&self) -> ContentHash {
        *self
    }
}
