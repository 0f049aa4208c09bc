//! Partial merkle trees, the payload of `merkleblock` messages.
//!
//! A filtered block carries the header, the transaction count, a subset
//! of interior hashes, and a bit vector steering the descent. Extraction
//! recomputes the root and yields the matched txids.

use std::io::{Read, Write};
use thiserror::Error;

use crate::primitives::encode::{read_bytes, read_list, write_bytes, write_list, Decodable, Encodable, ProtocolError};
use crate::primitives::Sha256dHash;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("tree has no transactions")]
    Empty,

    #[error("more hashes than transactions")]
    TooManyHashes,

    #[error("flag bits or hashes left unconsumed")]
    NotFullyConsumed,

    #[error("ran out of flag bits or hashes during descent")]
    Truncated,

    #[error("duplicate interior hash (mutated tree)")]
    DuplicateHash,

    #[error("computed root does not match header")]
    RootMismatch,
}

/// Wire form of the BIP37 partial merkle tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialMerkleTree {
    pub total_transactions: u32,
    pub hashes: Vec<Sha256dHash>,
    pub flags: Vec<u8>,
}

struct Descent<'a> {
    tree: &'a PartialMerkleTree,
    bit: usize,
    hash: usize,
    matches: Vec<(u32, Sha256dHash)>,
}

impl PartialMerkleTree {
    fn tree_height(&self) -> u32 {
        let mut height = 0;
        while self.width_at(height) > 1 {
            height += 1;
        }
        height
    }

    fn width_at(&self, height: u32) -> u32 {
        (self.total_transactions + (1 << height) - 1) >> height
    }

    /// Walk the encoded tree; returns `(root, matched (index, txid))`.
    pub fn extract_matches(&self) -> Result<(Sha256dHash, Vec<(u32, Sha256dHash)>), MerkleError> {
        if self.total_transactions == 0 {
            return Err(MerkleError::Empty);
        }
        if self.hashes.len() as u32 > self.total_transactions {
            return Err(MerkleError::TooManyHashes);
        }

        let mut descent = Descent {
            tree: self,
            bit: 0,
            hash: 0,
            matches: Vec::new(),
        };
        let root = descent.traverse(self.tree_height(), 0)?;

        // Every hash and every flag byte must have been used (trailing
        // zero padding in the final byte is allowed).
        if descent.hash != self.hashes.len() {
            return Err(MerkleError::NotFullyConsumed);
        }
        if (descent.bit + 7) / 8 != self.flags.len() {
            return Err(MerkleError::NotFullyConsumed);
        }
        for i in descent.bit..self.flags.len() * 8 {
            if self.flags[i / 8] & (1 << (i % 8)) != 0 {
                return Err(MerkleError::NotFullyConsumed);
            }
        }

        Ok((root, descent.matches))
    }

    /// Build the partial tree for `txids` with `matched[i]` marking the
    /// transactions of interest. Used by the test harness peers.
    pub fn from_txids(txids: &[Sha256dHash], matched: &[bool]) -> Self {
        assert_eq!(txids.len(), matched.len());
        let mut tree = PartialMerkleTree {
            total_transactions: txids.len() as u32,
            hashes: Vec::new(),
            flags: Vec::new(),
        };
        let mut bits: Vec<bool> = Vec::new();
        let height = tree.tree_height();
        build(&mut tree, &mut bits, txids, matched, height, 0);
        let mut flags = vec![0u8; (bits.len() + 7) / 8];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                flags[i / 8] |= 1 << (i % 8);
            }
        }
        tree.flags = flags;
        tree
    }
}

fn hash_at(txids: &[Sha256dHash], height: u32, pos: u32) -> Sha256dHash {
    if height == 0 {
        return txids[pos as usize];
    }
    let left = hash_at(txids, height - 1, pos * 2);
    let width = ((txids.len() as u32) + (1 << (height - 1)) - 1) >> (height - 1);
    let right = if pos * 2 + 1 < width {
        hash_at(txids, height - 1, pos * 2 + 1)
    } else {
        left
    };
    combine(left, right)
}

fn build(
    tree: &mut PartialMerkleTree,
    bits: &mut Vec<bool>,
    txids: &[Sha256dHash],
    matched: &[bool],
    height: u32,
    pos: u32,
) {
    // Does any leaf under this node match?
    let start = (pos << height) as usize;
    let end = (((pos + 1) << height) as usize).min(txids.len());
    let parent_of_match = matched[start..end].iter().any(|&m| m);
    bits.push(parent_of_match);

    if height == 0 || !parent_of_match {
        tree.hashes.push(hash_at(txids, height, pos));
    } else {
        build(tree, bits, txids, matched, height - 1, pos * 2);
        if pos * 2 + 1 < tree.width_at(height - 1) {
            build(tree, bits, txids, matched, height - 1, pos * 2 + 1);
        }
    }
}

fn combine(left: Sha256dHash, right: Sha256dHash) -> Sha256dHash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    Sha256dHash::digest(&buf)
}

impl<'a> Descent<'a> {
    fn next_bit(&mut self) -> Result<bool, MerkleError> {
        let i = self.bit;
        if i >= self.tree.flags.len() * 8 {
            return Err(MerkleError::Truncated);
        }
        self.bit += 1;
        Ok(self.tree.flags[i / 8] & (1 << (i % 8)) != 0)
    }

    fn next_hash(&mut self) -> Result<Sha256dHash, MerkleError> {
        let h = self
            .tree
            .hashes
            .get(self.hash)
            .copied()
            .ok_or(MerkleError::Truncated)?;
        self.hash += 1;
        Ok(h)
    }

    fn traverse(&mut self, height: u32, pos: u32) -> Result<Sha256dHash, MerkleError> {
        let parent_of_match = self.next_bit()?;
        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                self.matches.push((pos, hash));
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < self.tree.width_at(height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1)?;
            // Guard against the duplicate-hash mutation (CVE-2012-2459).
            if right == left {
                return Err(MerkleError::DuplicateHash);
            }
            right
        } else {
            left
        };
        Ok(combine(left, right))
    }
}

impl Encodable for PartialMerkleTree {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.total_transactions.encode(w)?;
        n += write_list(w, &self.hashes)?;
        n += write_bytes(w, &self.flags)?;
        Ok(n)
    }
}

impl Decodable for PartialMerkleTree {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(PartialMerkleTree {
            total_transactions: u32::decode(r)?,
            hashes: read_list(r, 1_000_000)?,
            flags: read_bytes(r)?,
        })
    }
}
