//! ECDSA keypairs over secp256k1.
//!
//! Signing is deterministic (RFC 6979) and always canonical low-S, which
//! is what libsecp256k1 produces after normalization.

use lazy_static::lazy_static;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;
use zeroize::Zeroizing;

use super::hash160;

lazy_static! {
    /// Shared signing+verification context. Construction is expensive;
    /// the context itself is immutable and thread-safe.
    pub(crate) static ref SECP: Secp256k1<All> = Secp256k1::new();
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("signature failed verification")]
    BadSignature,

    #[error("malformed DER signature")]
    BadEncoding,

    #[error("key has no private part")]
    MissingPrivateKey,

    #[error("decryption failed (wrong passphrase or corrupt data)")]
    Decryption,
}

/// A secp256k1 keypair. The private half is optional so watch-only keys
/// and encrypted-at-rest keys share the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcKey {
    secret: Option<SecretKey>,
    public: PublicKey,
}

impl EcKey {
    pub fn new_random<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        let secret = loop {
            rng.fill_bytes(&mut *bytes);
            if let Ok(sk) = SecretKey::from_slice(&*bytes) {
                break sk;
            }
        };
        let public = PublicKey::from_secret_key(&SECP, &secret);
        EcKey {
            secret: Some(secret),
            public,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let public = PublicKey::from_secret_key(&SECP, &secret);
        Ok(EcKey {
            secret: Some(secret),
            public,
        })
    }

    pub fn from_public_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let public = PublicKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(EcKey {
            secret: None,
            public,
        })
    }

    pub fn has_private(&self) -> bool {
        self.secret.is_some()
    }

    pub(crate) fn secret_key(&self) -> Option<&SecretKey> {
        self.secret.as_ref()
    }

    pub fn secret_bytes(&self) -> Option<[u8; 32]> {
        self.secret.as_ref().map(|sk| sk.secret_bytes())
    }

    /// Drop the private half, leaving a watch-only key.
    pub fn public_only(&self) -> Self {
        EcKey {
            secret: None,
            public: self.public,
        }
    }

    /// 33-byte compressed SEC encoding.
    pub fn serialize_public(&self) -> [u8; 33] {
        self.public.serialize()
    }

    /// HASH160 of the compressed pubkey, the P2PKH payment target.
    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.serialize_public())
    }

    /// Sign a 32-byte digest; returns the DER encoding (no sighash byte,
    /// callers append that themselves).
    pub fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        let secret = self.secret.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        let msg = Message::from_digest(*digest);
        let sig = SECP.sign_ecdsa(&msg, secret);
        Ok(sig.serialize_der().to_vec())
    }

    /// Verify a DER signature over a 32-byte digest.
    pub fn verify(&self, digest: &[u8; 32], der: &[u8]) -> Result<(), CryptoError> {
        let msg = Message::from_digest(*digest);
        let sig = Signature::from_der(der).map_err(|_| CryptoError::BadEncoding)?;
        SECP.verify_ecdsa(&msg, &sig, &self.public)
            .map_err(|_| CryptoError::BadSignature)
    }
}

/// True when `der` is a canonical low-S DER signature.
pub fn is_canonical_low_s(der: &[u8]) -> bool {
    match Signature::from_der(der) {
        Ok(sig) => {
            let mut normalized = sig;
            normalized.normalize_s();
            normalized == sig
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let key = EcKey::from_secret_bytes(&[0x42u8; 32]).unwrap();
        let digest = crate::crypto::sha256d(b"message");
        let der = key.sign(&digest).unwrap();
        key.verify(&digest, &der).unwrap();
        assert!(is_canonical_low_s(&der));

        let wrong = crate::crypto::sha256d(b"other message");
        assert_eq!(key.verify(&wrong, &der), Err(CryptoError::BadSignature));
    }

    #[test]
    fn deterministic_signatures() {
        let key = EcKey::from_secret_bytes(&[0x01u8; 32]).unwrap();
        let digest = [0x77u8; 32];
        assert_eq!(key.sign(&digest).unwrap(), key.sign(&digest).unwrap());
    }

    #[test]
    fn watch_only_cannot_sign() {
        let key = EcKey::from_secret_bytes(&[0x42u8; 32]).unwrap();
        let watch = key.public_only();
        assert!(!watch.has_private());
        assert_eq!(
            watch.sign(&[0u8; 32]),
            Err(CryptoError::MissingPrivateKey)
        );
        assert_eq!(watch.pubkey_hash(), key.pubkey_hash());
    }

    #[test]
    fn rejects_invalid_secret() {
        // The group order is not a valid secret key.
        let order =
            hex::decode("fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141")
                .unwrap();
        assert_eq!(
            EcKey::from_secret_bytes(&order).unwrap_err(),
            CryptoError::InvalidSecretKey
        );
    }
}
