//! Content identity.
//!
//! Chunks are addressed by a 20-byte SHA-1 digest. A distinguished null
//! value stands for "not yet computed".

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of bytes in a [`Hash`].
pub const HASH_SIZE: usize = 20;

/// Errors from constructing a [`Hash`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    /// The input buffer does not hold exactly [`HASH_SIZE`] bytes.
    #[error("bad hash length: got {0} bytes, expected {HASH_SIZE}")]
    BadLength(usize),

    /// The input string is not valid hexadecimal.
    #[error("invalid hex string")]
    InvalidHex,
}

/// A 20-byte content hash.
///
/// The all-zero value is the distinguished null hash, meaning "unknown".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// The distinguished null value.
    pub const NULL: Hash = Hash([0u8; HASH_SIZE]);

    /// Creates a hash from a fixed-size array.
    pub fn from_array(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a hash from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`HashError::BadLength`] if the slice is not exactly
    /// [`HASH_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.len() != HASH_SIZE {
            return Err(HashError::BadLength(bytes.len()));
        }
        let mut arr = [0u8; HASH_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Parses a hash from a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        if s.len() != 2 * HASH_SIZE {
            return Err(HashError::BadLength(s.len() / 2));
        }
        let bytes = hex_decode(s).ok_or(HashError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }

    /// Computes the SHA-1 digest of `data`.
    pub fn digest(data: &[u8]) -> Self {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Generates a random hash, used for fresh shared-directory ids.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Returns `true` for the distinguished null value.
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Converts to a lowercase hexadecimal string.
    pub fn to_hex(&self) -> String {
        self.0
            .iter()
            .fold(String::with_capacity(2 * HASH_SIZE), |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{b:02x}");
                s
            })
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(D::Error::custom)
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
