//! Consensus hash newtypes: double-SHA256 block/tx hashes and HASH160.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 32-byte double-SHA256 hash (binary form, consensus byte order).
///
/// Display and `FromStr` use the conventional reversed-hex form, so
/// `"{}"` of the genesis hash prints the familiar leading-zeros string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Sha256dHash(pub [u8; 32]);

impl Sha256dHash {
    /// Double-SHA256 of `data`.
    pub fn digest(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        Sha256dHash(out)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn into_bytes(self) -> [u8; 32] {
        self.0
    }

    /// The all-zero hash, used as the null previous-block reference and
    /// as the `hash_stop` wildcard in locator messages.
    #[inline]
    pub fn zero() -> Self {
        Sha256dHash([0u8; 32])
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Sha256dHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rev = self.0;
        rev.reverse();
        write!(f, "{}", hex::encode(rev))
    }
}

impl FromStr for Sha256dHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        arr.reverse();
        Ok(Sha256dHash(arr))
    }
}

/// Human-readable hex for JSON-ish formats, raw bytes for bincode.
impl Serialize for Sha256dHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Sha256dHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let v: Vec<u8> = serde_bytes::ByteBuf::deserialize(deserializer)?.into_vec();
            if v.len() != 32 {
                return Err(serde::de::Error::custom("expected 32 raw bytes"));
            }
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&v);
            Ok(Sha256dHash(arr))
        }
    }
}

/// 20-byte RIPEMD160(SHA256(x)) digest, the script-hash / pubkey-hash form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash160(pub [u8; 20]);

impl Hash160 {
    pub fn digest(data: &[u8]) -> Self {
        Hash160(crate::crypto::hash160(data))
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Hash160 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(self.0))
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Hash160 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v: Vec<u8> = if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(s).map_err(serde::de::Error::custom)?
        } else {
            serde_bytes::ByteBuf::deserialize(deserializer)?.into_vec()
        };
        if v.len() != 20 {
            return Err(serde::de::Error::custom("expected 20 bytes"));
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&v);
        Ok(Hash160(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_known_vector() {
        // sha256d("hello") from the reference client's hash tests.
        let h = Sha256dHash::digest(b"hello");
        assert_eq!(
            hex::encode(h.as_bytes()),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn display_reverses_byte_order() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xAB;
        let h = Sha256dHash::from_bytes(bytes);
        let s = h.to_string();
        assert!(s.ends_with("ab"));
        assert_eq!(s.parse::<Sha256dHash>().unwrap(), h);
    }

    #[test]
    fn genesis_hash_parses() {
        let h: Sha256dHash = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
            .parse()
            .unwrap();
        assert_eq!(h.to_string().len(), 64);
        assert!(!h.is_zero());
    }
}
