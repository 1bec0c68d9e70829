//! WireGuard key material.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};

pub const KEY_LEN: usize = 32;

/// A 32-byte WireGuard key (public, private or preshared).
///
/// Keys are carried around in their raw form and rendered as base64 only at
/// the edges (config files, log records).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; KEY_LEN] {
        self.0
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidKey {
    #[error("key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("key must decode to exactly {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

impl FromStr for Key {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD.decode(s.trim())?;
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| InvalidKey::Length(v.len()))?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_base64() {
        let encoded = "LlaygSDSany5T+/ft9TcaLlk83gGKrFc1gcG8VWAxtM=";
        let key = encoded.parse::<Key>().unwrap();
        assert_eq!(key.to_string(), encoded);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = "aGVsbG8=".parse::<Key>().unwrap_err();
        assert!(matches!(err, InvalidKey::Length(5)));
    }

    #[test]
    fn rejects_garbage() {
        assert!("not base64 at all!".parse::<Key>().is_err());
    }
}
