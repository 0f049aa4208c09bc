//! Block headers, compact-target arithmetic, and work-weighted stored
//! blocks.

use num_bigint::BigUint;
use num_traits::{One, Zero};
use std::fmt;
use std::io::{Read, Write};

use crate::primitives::encode::{read_list, Decodable, Encodable, ProtocolError};
use crate::primitives::Sha256dHash;

use super::transaction::Transaction;

/// The 80-byte header. Hash is double-SHA256 of the serialization,
/// interpreted little-endian as a 256-bit integer for the target check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Sha256dHash,
    pub merkle_root: Sha256dHash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Sha256dHash {
        Sha256dHash::digest(&self.encode_to_vec())
    }

    /// Decode the compact `bits` field into a full 256-bit target.
    /// Returns `None` for negative or overflowing encodings.
    pub fn target_from_bits(bits: u32) -> Option<BigUint> {
        let exponent = (bits >> 24) as u32;
        let mantissa = bits & 0x007F_FFFF;
        if bits & 0x0080_0000 != 0 {
            return None; // sign bit set: negative target
        }
        if exponent > 34 {
            return None; // cannot fit in 256 bits
        }
        let target = if exponent <= 3 {
            BigUint::from(mantissa >> (8 * (3 - exponent)))
        } else {
            BigUint::from(mantissa) << (8 * (exponent - 3))
        };
        Some(target)
    }

    /// Re-encode a target in compact form, the inverse of
    /// `target_from_bits` up to precision loss in the mantissa.
    pub fn bits_from_target(target: &BigUint) -> u32 {
        if target.is_zero() {
            return 0;
        }
        let bytes = target.to_bytes_be();
        let mut size = bytes.len();
        let mut mantissa: u32 = if size <= 3 {
            let mut m = 0u32;
            for &b in &bytes {
                m = (m << 8) | b as u32;
            }
            m << (8 * (3 - size))
        } else {
            let mut m = 0u32;
            for &b in &bytes[..3] {
                m = (m << 8) | b as u32;
            }
            m
        };
        // Avoid setting the sign bit; shift the mantissa down instead.
        if mantissa & 0x0080_0000 != 0 {
            mantissa >>= 8;
            size += 1;
        }
        mantissa | ((size as u32) << 24)
    }

    pub fn target(&self) -> Option<BigUint> {
        Self::target_from_bits(self.bits)
    }

    /// Proof-of-work check: hash, as a little-endian integer, must not
    /// exceed the target claimed by `bits`.
    pub fn check_pow(&self) -> bool {
        match self.target() {
            Some(target) => BigUint::from_bytes_le(self.hash().as_bytes()) <= target,
            None => false,
        }
    }

    /// Work contributed by one block at this difficulty:
    /// `2^256 / (target + 1)`.
    pub fn work(&self) -> BigUint {
        match self.target() {
            Some(target) => (BigUint::one() << 256u32) / (target + BigUint::one()),
            None => BigUint::zero(),
        }
    }
}

impl Encodable for BlockHeader {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.version.encode(w)?;
        n += self.prev_hash.encode(w)?;
        n += self.merkle_root.encode(w)?;
        n += self.time.encode(w)?;
        n += self.bits.encode(w)?;
        n += self.nonce.encode(w)?;
        debug_assert_eq!(n, 80);
        Ok(n)
    }
}

impl Decodable for BlockHeader {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(BlockHeader {
            version: i32::decode(r)?,
            prev_hash: Sha256dHash::decode(r)?,
            merkle_root: Sha256dHash::decode(r)?,
            time: u32::decode(r)?,
            bits: u32::decode(r)?,
            nonce: u32::decode(r)?,
        })
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash())
    }
}

/// A full block: header plus transaction list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Merkle root over the txids, pairwise double-SHA256 with the odd
    /// node duplicated.
    pub fn compute_merkle_root(&self) -> Sha256dHash {
        merkle_root(&self.transactions.iter().map(|tx| tx.txid()).collect::<Vec<_>>())
    }
}

impl Encodable for Block {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.header.encode(w)?;
        n += crate::primitives::encode::write_list(w, &self.transactions)?;
        Ok(n)
    }
}

impl Decodable for Block {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let header = BlockHeader::decode(r)?;
        let transactions = read_list(r, 1_000_000)?;
        Ok(Block {
            header,
            transactions,
        })
    }
}

/// Merkle root over a list of already-computed leaf hashes.
pub fn merkle_root(hashes: &[Sha256dHash]) -> Sha256dHash {
    if hashes.is_empty() {
        return Sha256dHash::zero();
    }
    let mut level: Vec<Sha256dHash> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(left.as_bytes());
            buf[32..].copy_from_slice(right.as_bytes());
            next.push(Sha256dHash::digest(&buf));
        }
        level = next;
    }
    level[0]
}

/// A header attached to the chain: cumulative work and height alongside.
///
/// Invariant: `work = parent.work + 2^256 / (target + 1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub header: BlockHeader,
    pub work: BigUint,
    pub height: u32,
}

impl StoredBlock {
    /// Wrap a genesis (or checkpoint) header with explicit height/work.
    pub fn new(header: BlockHeader, work: BigUint, height: u32) -> Self {
        StoredBlock {
            header,
            work,
            height,
        }
    }

    pub fn genesis(header: BlockHeader) -> Self {
        let work = header.work();
        StoredBlock {
            header,
            work,
            height: 0,
        }
    }

    /// Construct the stored form of a child of `self`.
    pub fn build_next(&self, header: BlockHeader) -> StoredBlock {
        StoredBlock {
            work: &self.work + header.work(),
            height: self.height + 1,
            header,
        }
    }

    pub fn hash(&self) -> Sha256dHash {
        self.header.hash()
    }

    pub fn more_work_than(&self, other: &StoredBlock) -> bool {
        self.work > other.work
    }
}
