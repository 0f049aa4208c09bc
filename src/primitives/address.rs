//! Base58Check addresses (P2PKH and P2SH).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::base58::{self, Base58Error};
use super::hash::Hash160;
use super::script::Script;
use crate::params::NetworkParameters;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("base58: {0}")]
    Base58(#[from] Base58Error),

    #[error("payload is {0} bytes, expected 21")]
    WrongLength(usize),

    #[error("version byte {0:#04x} does not belong to this network")]
    WrongNetwork(u8),
}

/// A parsed address: a version byte plus a 20-byte hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub version: u8,
    pub hash: Hash160,
}

impl Address {
    pub fn p2pkh(params: &NetworkParameters, hash: Hash160) -> Self {
        Address {
            version: params.p2pkh_version,
            hash,
        }
    }

    pub fn p2sh(params: &NetworkParameters, hash: Hash160) -> Self {
        Address {
            version: params.p2sh_version,
            hash,
        }
    }

    /// Parse and reject addresses from other networks.
    pub fn from_base58(params: &NetworkParameters, s: &str) -> Result<Self, AddressError> {
        let payload = base58::decode_check(s)?;
        if payload.len() != 21 {
            return Err(AddressError::WrongLength(payload.len()));
        }
        let version = payload[0];
        if version != params.p2pkh_version && version != params.p2sh_version {
            return Err(AddressError::WrongNetwork(version));
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        Ok(Address {
            version,
            hash: Hash160(hash),
        })
    }

    pub fn is_p2sh(&self, params: &NetworkParameters) -> bool {
        self.version == params.p2sh_version
    }

    /// The locking script paying to this address.
    pub fn script_pubkey(&self, params: &NetworkParameters) -> Script {
        if self.is_p2sh(params) {
            Script::pay_to_script_hash(&self.hash)
        } else {
            Script::pay_to_pubkey_hash(&self.hash)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut payload = Vec::with_capacity(21);
        payload.push(self.version);
        payload.extend_from_slice(self.hash.as_bytes());
        write!(f, "{}", base58::encode_check(&payload))
    }
}
