//! Locking/unlocking scripts: the opcode subset an SPV wallet needs to
//! build and recognize, not a script interpreter.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::hash::Hash160;

// Opcodes used by the standard output forms.
pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;

/// Standard output script shapes the wallet recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    PayToPubkeyHash,
    PayToScriptHash,
    PayToPubkey,
    OpReturn,
    Other,
}

/// An opaque script, with helpers for the standard forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Script(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl Script {
    pub fn new(bytes: Vec<u8>) -> Self {
        Script(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
    pub fn pay_to_pubkey_hash(hash: &Hash160) -> Self {
        let mut s = Vec::with_capacity(25);
        s.push(OP_DUP);
        s.push(OP_HASH160);
        s.push(20);
        s.extend_from_slice(hash.as_bytes());
        s.push(OP_EQUALVERIFY);
        s.push(OP_CHECKSIG);
        Script(s)
    }

    /// `OP_HASH160 <20> OP_EQUAL`
    pub fn pay_to_script_hash(hash: &Hash160) -> Self {
        let mut s = Vec::with_capacity(23);
        s.push(OP_HASH160);
        s.push(20);
        s.extend_from_slice(hash.as_bytes());
        s.push(OP_EQUAL);
        Script(s)
    }

    /// Unlocking script for a P2PKH input: `<sig+hashtype> <pubkey>`.
    pub fn script_sig(signature: &[u8], pubkey: &[u8]) -> Self {
        let mut s = Vec::with_capacity(2 + signature.len() + pubkey.len());
        push_data(&mut s, signature);
        push_data(&mut s, pubkey);
        Script(s)
    }

    pub fn kind(&self) -> ScriptKind {
        let b = &self.0;
        if b.len() == 25
            && b[0] == OP_DUP
            && b[1] == OP_HASH160
            && b[2] == 20
            && b[23] == OP_EQUALVERIFY
            && b[24] == OP_CHECKSIG
        {
            ScriptKind::PayToPubkeyHash
        } else if b.len() == 23 && b[0] == OP_HASH160 && b[1] == 20 && b[22] == OP_EQUAL {
            ScriptKind::PayToScriptHash
        } else if (b.len() == 35 && b[0] == 33 || b.len() == 67 && b[0] == 65)
            && b[b.len() - 1] == OP_CHECKSIG
        {
            ScriptKind::PayToPubkey
        } else if !b.is_empty() && b[0] == OP_RETURN {
            ScriptKind::OpReturn
        } else {
            ScriptKind::Other
        }
    }

    /// The 20-byte hash a P2PKH or P2SH output pays to.
    pub fn destination_hash(&self) -> Option<Hash160> {
        match self.kind() {
            ScriptKind::PayToPubkeyHash => {
                let mut h = [0u8; 20];
                h.copy_from_slice(&self.0[3..23]);
                Some(Hash160(h))
            }
            ScriptKind::PayToScriptHash => {
                let mut h = [0u8; 20];
                h.copy_from_slice(&self.0[2..22]);
                Some(Hash160(h))
            }
            _ => None,
        }
    }

    /// Every data push in the script, in order. Used for bloom-filter
    /// matching: a filter matches a transaction if any pushed element of
    /// any output script is in the filter.
    pub fn data_pushes(&self) -> Vec<&[u8]> {
        let mut pushes = Vec::new();
        let b = &self.0;
        let mut i = 0;
        while i < b.len() {
            let op = b[i];
            i += 1;
            let len = match op {
                1..=0x4b => op as usize,
                OP_PUSHDATA1 => {
                    if i >= b.len() {
                        break;
                    }
                    let l = b[i] as usize;
                    i += 1;
                    l
                }
                OP_PUSHDATA2 => {
                    if i + 2 > b.len() {
                        break;
                    }
                    let l = u16::from_le_bytes([b[i], b[i + 1]]) as usize;
                    i += 2;
                    l
                }
                OP_PUSHDATA4 => {
                    if i + 4 > b.len() {
                        break;
                    }
                    let l = u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]) as usize;
                    i += 4;
                    l
                }
                _ => continue,
            };
            if i + len > b.len() {
                break;
            }
            if len > 0 {
                pushes.push(&b[i..i + len]);
            }
            i += len;
        }
        pushes
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

fn push_data(out: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => out.push(OP_0),
        1..=0x4b => {
            out.push(data.len() as u8);
            out.extend_from_slice(data);
        }
        0x4c..=0xff => {
            out.push(OP_PUSHDATA1);
            out.push(data.len() as u8);
            out.extend_from_slice(data);
        }
        _ => {
            out.push(OP_PUSHDATA2);
            out.extend_from_slice(&(data.len() as u16).to_le_bytes());
            out.extend_from_slice(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h160() -> Hash160 {
        Hash160([0x11; 20])
    }

    #[test]
    fn p2pkh_shape() {
        let s = Script::pay_to_pubkey_hash(&h160());
        assert_eq!(s.len(), 25);
        assert_eq!(s.kind(), ScriptKind::PayToPubkeyHash);
        assert_eq!(s.destination_hash(), Some(h160()));
    }

    #[test]
    fn p2sh_shape() {
        let s = Script::pay_to_script_hash(&h160());
        assert_eq!(s.len(), 23);
        assert_eq!(s.kind(), ScriptKind::PayToScriptHash);
        assert_eq!(s.destination_hash(), Some(h160()));
    }

    #[test]
    fn script_sig_pushes() {
        let sig = vec![0xAA; 71];
        let pubkey = vec![0xBB; 33];
        let s = Script::script_sig(&sig, &pubkey);
        let pushes = s.data_pushes();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0], &sig[..]);
        assert_eq!(pushes[1], &pubkey[..]);
    }

    #[test]
    fn pushdata1_parses() {
        let data = vec![0xCC; 0x60];
        let mut raw = Vec::new();
        push_data(&mut raw, &data);
        assert_eq!(raw[0], OP_PUSHDATA1);
        let s = Script(raw);
        assert_eq!(s.data_pushes(), vec![&data[..]]);
    }

    #[test]
    fn truncated_push_does_not_panic() {
        // Claims a 10-byte push but only 2 bytes follow.
        let s = Script(vec![0x0a, 0x01, 0x02]);
        assert!(s.data_pushes().is_empty());
        assert_eq!(s.kind(), ScriptKind::Other);
    }
}
