//! Hierarchical deterministic key derivation.
//!
//! Children derive via HMAC-SHA512 over the parent chain code; hardened
//! indices commit to the parent private key, normal indices to the
//! serialized public key. Arithmetically invalid child indices surface
//! as a typed error so callers can retry the next index.

use secp256k1::{PublicKey, Scalar, SecretKey};
use zeroize::Zeroizing;

use crate::crypto::ecdsa::{EcKey, SECP};
use crate::crypto::{hash160, hmac_sha512};

use super::KeyChainError;

/// Bit marking a hardened child number.
pub const HARDENED: u32 = 0x8000_0000;

/// An extended private key: secret plus chain code and position data.
#[derive(Clone)]
pub struct ExtendedPrivKey {
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
    pub chain_code: [u8; 32],
    key: SecretKey,
}

impl std::fmt::Debug for ExtendedPrivKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("ExtendedPrivKey")
            .field("depth", &self.depth)
            .field("child_number", &self.child_number)
            .finish_non_exhaustive()
    }
}

impl ExtendedPrivKey {
    /// Master key from a BIP32 seed.
    pub fn master(seed: &[u8]) -> Result<Self, KeyChainError> {
        let i = Zeroizing::new(hmac_sha512(b"Bitcoin seed", seed));
        let key = SecretKey::from_slice(&i[..32]).map_err(|_| KeyChainError::InvalidSeed)?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&i[32..]);
        Ok(ExtendedPrivKey {
            depth: 0,
            parent_fingerprint: [0u8; 4],
            child_number: 0,
            chain_code,
            key,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(&SECP, &self.key)
    }

    pub fn fingerprint(&self) -> [u8; 4] {
        let h = hash160(&self.public_key().serialize());
        [h[0], h[1], h[2], h[3]]
    }

    /// Derive one child, hardened when `index & HARDENED` is set.
    pub fn derive(&self, index: u32) -> Result<ExtendedPrivKey, KeyChainError> {
        let mut data = Zeroizing::new([0u8; 37]);
        if index & HARDENED != 0 {
            data[0] = 0;
            data[1..33].copy_from_slice(&self.key.secret_bytes());
        } else {
            data[..33].copy_from_slice(&self.public_key().serialize());
        }
        data[33..].copy_from_slice(&index.to_be_bytes());

        let i = Zeroizing::new(hmac_sha512(&self.chain_code, &*data));
        let tweak_bytes: [u8; 32] = i[..32].try_into().expect("fixed split");
        let tweak =
            Scalar::from_be_bytes(tweak_bytes).map_err(|_| KeyChainError::InvalidChildIndex(index))?;
        let key = self
            .key
            .add_tweak(&tweak)
            .map_err(|_| KeyChainError::InvalidChildIndex(index))?;

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&i[32..]);
        Ok(ExtendedPrivKey {
            depth: self.depth + 1,
            parent_fingerprint: self.fingerprint(),
            child_number: index,
            chain_code,
            key,
        })
    }

    /// Derive along a full path, e.g. `[44' , 0', 0']`.
    pub fn derive_path(&self, path: &[u32]) -> Result<ExtendedPrivKey, KeyChainError> {
        let mut key = self.clone();
        for &index in path {
            key = key.derive(index)?;
        }
        Ok(key)
    }

    pub fn to_ec_key(&self) -> EcKey {
        EcKey::from_secret_bytes(&self.key.secret_bytes()).expect("valid derived key")
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.key.secret_bytes()
    }

    /// The public half at the same position.
    pub fn to_extended_pub(&self) -> ExtendedPubKey {
        ExtendedPubKey {
            depth: self.depth,
            parent_fingerprint: self.parent_fingerprint,
            child_number: self.child_number,
            chain_code: self.chain_code,
            key: self.public_key(),
        }
    }
}

/// An extended public key: supports non-hardened derivation only, which
/// is what a locked (encrypted) wallet uses to keep its lookahead fresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedPubKey {
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
    pub chain_code: [u8; 32],
    pub key: PublicKey,
}

impl ExtendedPubKey {
    pub fn derive(&self, index: u32) -> Result<ExtendedPubKey, KeyChainError> {
        if index & HARDENED != 0 {
            return Err(KeyChainError::HardenedFromPublic(index));
        }
        let mut data = [0u8; 37];
        data[..33].copy_from_slice(&self.key.serialize());
        data[33..].copy_from_slice(&index.to_be_bytes());

        let i = hmac_sha512(&self.chain_code, &data);
        let tweak_bytes: [u8; 32] = i[..32].try_into().expect("fixed split");
        let tweak =
            Scalar::from_be_bytes(tweak_bytes).map_err(|_| KeyChainError::InvalidChildIndex(index))?;
        let key = self
            .key
            .add_exp_tweak(&SECP, &tweak)
            .map_err(|_| KeyChainError::InvalidChildIndex(index))?;

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&i[32..]);
        Ok(ExtendedPubKey {
            depth: self.depth + 1,
            parent_fingerprint: {
                let h = hash160(&self.key.serialize());
                [h[0], h[1], h[2], h[3]]
            },
            child_number: index,
            chain_code,
            key,
        })
    }

    pub fn to_ec_key(&self) -> EcKey {
        EcKey::from_public_bytes(&self.key.serialize()).expect("valid public key")
    }

    pub fn serialize_key(&self) -> [u8; 33] {
        self.key.serialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// BIP32 test vector 1: seed 000102030405060708090a0b0c0d0e0f.
    fn vector1_master() -> ExtendedPrivKey {
        ExtendedPrivKey::master(&hex::decode("000102030405060708090a0b0c0d0e0f").unwrap()).unwrap()
    }

    #[test]
    fn vector1_master_key() {
        let m = vector1_master();
        assert_eq!(
            hex::encode(m.secret_bytes()),
            "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35"
        );
        assert_eq!(
            hex::encode(m.chain_code),
            "873dff81c02f525623fd1fe5167eac3a55a049de3d314bb42ee227ffed37d508"
        );
    }

    #[test]
    fn vector1_m_0h() {
        let child = vector1_master().derive(HARDENED).unwrap();
        assert_eq!(
            hex::encode(child.secret_bytes()),
            "edb2e14f9ee77d26dd93b4ecede8d16ed408ce149b6cd80b0715a2d911a0afea"
        );
        assert_eq!(
            hex::encode(child.chain_code),
            "47fdacbd0f1097043b78c63c20c34ef4ed9a111d980047ad16282c7ae6236141"
        );
        assert_eq!(child.depth, 1);
        assert_eq!(child.child_number, HARDENED);
    }

    #[test]
    fn public_derivation_matches_private() {
        let m = vector1_master();
        let account = m.derive_path(&[44 | HARDENED, 0 | HARDENED, 0 | HARDENED]).unwrap();
        let external_priv = account.derive(0).unwrap();
        let external_pub = account.to_extended_pub().derive(0).unwrap();

        for i in 0..5 {
            let from_priv = external_priv.derive(i).unwrap().public_key();
            let from_pub = external_pub.derive(i).unwrap().key;
            assert_eq!(from_priv, from_pub, "index {}", i);
        }
    }

    #[test]
    fn hardened_from_public_is_typed_error() {
        let m = vector1_master().to_extended_pub();
        assert!(matches!(
            m.derive(HARDENED).unwrap_err(),
            KeyChainError::HardenedFromPublic(_)
        ));
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = vector1_master().derive_path(&[1, 2, 3]).unwrap();
        let b = vector1_master().derive_path(&[1, 2, 3]).unwrap();
        assert_eq!(a.secret_bytes(), b.secret_bytes());
        assert_eq!(a.chain_code, b.chain_code);
    }
}
