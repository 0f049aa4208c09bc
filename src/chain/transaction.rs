//! Transactions: canonical serialization, txids, and the legacy sighash.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

use crate::crypto::sha256d;
use crate::primitives::encode::{read_list, write_bytes, write_list, Decodable, Encodable, ProtocolError};
use crate::primitives::{Script, Sha256dHash};

/// Signature-hash flag. Only ALL is produced by the wallet; the modifier
/// bit is understood so externally observed inputs parse.
pub const SIGHASH_ALL: u32 = 1;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Reference to a previous transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Sha256dHash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Sha256dHash, index: u32) -> Self {
        OutPoint { txid, index }
    }

    /// The null outpoint only a coinbase input carries.
    pub fn null() -> Self {
        OutPoint {
            txid: Sha256dHash::zero(),
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

impl Encodable for OutPoint {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.txid.encode(w)?;
        n += self.index.encode(w)?;
        Ok(n)
    }
}

impl Decodable for OutPoint {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(OutPoint {
            txid: Sha256dHash::decode(r)?,
            index: u32::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub outpoint: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxInput {
    pub fn new(outpoint: OutPoint) -> Self {
        TxInput {
            outpoint,
            script_sig: Script::default(),
            sequence: u32::MAX,
        }
    }
}

impl Encodable for TxInput {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.outpoint.encode(w)?;
        n += write_bytes(w, self.script_sig.as_bytes())?;
        n += self.sequence.encode(w)?;
        Ok(n)
    }
}

impl Decodable for TxInput {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(TxInput {
            outpoint: OutPoint::decode(r)?,
            script_sig: Script::new(crate::primitives::encode::read_bytes(r)?),
            sequence: u32::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in satoshis. Kept signed so malformed peer data is caught by
    /// range checks instead of wrapping.
    pub value: i64,
    pub script_pubkey: Script,
}

impl Encodable for TxOutput {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.value.encode(w)?;
        n += write_bytes(w, self.script_pubkey.as_bytes())?;
        Ok(n)
    }
}

impl Decodable for TxOutput {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(TxOutput {
            value: i64::decode(r)?,
            script_pubkey: Script::new(crate::primitives::encode::read_bytes(r)?),
        })
    }
}

/// A transaction in the pre-segwit canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
        }
    }

    /// Double-SHA256 of the canonical serialization.
    pub fn txid(&self) -> Sha256dHash {
        Sha256dHash::from_bytes(sha256d(&self.encode_to_vec()))
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].outpoint.is_null()
    }

    /// Serialized size in bytes, the basis of fee estimation.
    pub fn size(&self) -> usize {
        self.encode_to_vec().len()
    }

    pub fn total_output_value(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Legacy signature hash for `input_index`, with `script_code` being
    /// the locking script of the output being spent.
    ///
    /// Implements the ALL form plus the ANYONECANPAY modifier; the wallet
    /// only produces ALL.
    pub fn signature_hash(
        &self,
        input_index: usize,
        script_code: &Script,
        sighash_flags: u32,
    ) -> Result<[u8; 32], ProtocolError> {
        if input_index >= self.inputs.len() {
            return Err(ProtocolError::Malformed("sighash input index out of range"));
        }

        let mut tx = self.clone();
        for input in tx.inputs.iter_mut() {
            input.script_sig = Script::default();
        }
        tx.inputs[input_index].script_sig = script_code.clone();

        if sighash_flags & SIGHASH_ANYONECANPAY != 0 {
            let own = tx.inputs.swap_remove(input_index);
            tx.inputs = vec![own];
        }

        let mut preimage = tx.encode_to_vec();
        preimage.extend_from_slice(&sighash_flags.to_le_bytes());
        Ok(sha256d(&preimage))
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Encodable for Transaction {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.version.encode(w)?;
        n += write_list(w, &self.inputs)?;
        n += write_list(w, &self.outputs)?;
        n += self.lock_time.encode(w)?;
        Ok(n)
    }
}

impl Decodable for Transaction {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(Transaction {
            version: i32::decode(r)?,
            inputs: read_list(r, 100_000)?,
            outputs: read_list(r, 100_000)?,
            lock_time: u32::decode(r)?,
        })
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.txid())
    }
}
