use std::fmt;
use std::io::{self, Read};

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha512};

/// Length of a hex-encoded SHA-512 digest.
const ENCODED_LEN: usize = 128;

/// Lowercase hexadecimal SHA-512 digest of an object's plaintext bytes.
///
/// The first two characters shard the object repository directory layout:
/// `objects/<first_chunk>/<remainder>`. Every constructor guarantees the
/// inner string is exactly 128 lowercase hex characters, so the path layer
/// can slice it without further checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Hash(String);

/// A digest string that is not exactly 128 lowercase hex characters.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid content hash {text:?}: want {ENCODED_LEN} lowercase hex characters")]
pub struct InvalidHash {
    pub text: String,
}

impl Hash {
    /// Stream all bytes from `reader` through SHA-512.
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut hasher = Sha512::new();
        io::copy(reader, &mut hasher)?;
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha512::digest(bytes)))
    }

    /// Wrap an existing hex digest, e.g. one received over the wire or read
    /// from a manifest. Anything that is not a full lowercase digest is
    /// rejected.
    pub fn from_hex(hex_digest: impl Into<String>) -> Result<Self, InvalidHash> {
        let text = hex_digest.into();
        let valid = text.len() == ENCODED_LEN
            && text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(text))
        } else {
            Err(InvalidHash { text })
        }
    }

    /// First two hex characters; the shard directory name.
    pub fn first_chunk(&self) -> &str {
        &self.0[..2]
    }

    /// Everything after the shard prefix; the object file name stem.
    pub fn remainder(&self) -> &str {
        &self.0[2..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Hash::from_hex(text).map_err(serde::de::Error::custom)
    }
}
