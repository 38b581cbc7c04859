use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// The permanent identifier of a blob: the SHA-256 digest of its content.
///
/// Its textual form, used for keys, file names and locators, is always the
/// lowercase hexadecimal encoding, exactly 64 characters long.
#[derive(Copy, Clone, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// The length of the textual form.
    pub const HEX_LEN: usize = 64;

    /// Hash the specified data.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Return a byte array.
    pub const fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    /// Returns the first `len` characters of the textual form.
    ///
    /// # Errors
    ///
    /// If `len` is zero or exceeds the length of the textual form,
    /// `Error::InvalidHash` is returned.
    pub fn prefix(&self, len: usize) -> Result<String> {
        let mut hex = self.to_string();

        if len == 0 || len > hex.len() {
            return Err(Error::invalid_hash(
                hex,
                format!("cannot take a prefix of {} characters", len),
            ));
        }

        hex.truncate(len);

        Ok(hex)
    }
}

impl From<[u8; 32]> for ContentHash {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != Self::HEX_LEN {
            return Err(Error::invalid_hash(
                s,
                format!("expected {} characters, got {}", Self::HEX_LEN, s.len()),
            ));
        }

        // `hex` accepts both cases but only the lowercase form is canonical.
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::invalid_hash(s, "expected lowercase hexadecimal"));
        }

        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(|err| Error::invalid_hash(s, err.to_string()))?;

        Ok(Self(out))
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as _;

        let hex = String::deserialize(deserializer)?;

        hex.parse().map_err(D::Error::custom)
    }
}
