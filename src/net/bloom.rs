//! BIP37 bloom filters: what we upload so peers relay only
//! wallet-relevant transactions (plus tunable noise).

use rand::Rng;

use crate::chain::transaction::Transaction;

use super::messages::FilterLoadMessage;

/// Consensus caps from BIP37.
const MAX_FILTER_BYTES: usize = 36_000;
const MAX_HASH_FUNCS: u32 = 50;

const LN2: f64 = std::f64::consts::LN_2;
const LN2_SQUARED: f64 = LN2 * LN2;

/// Filter update flag: the remote adds outpoints of matched outputs
/// automatically.
pub const BLOOM_UPDATE_ALL: u8 = 1;

/// A probabilistic membership set over arbitrary byte strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
}

impl BloomFilter {
    /// Size the filter for `elements` insertions at `fp_rate`. The
    /// tweak decorrelates this wallet's filter from everyone else's.
    pub fn new(elements: usize, fp_rate: f64, tweak: u32) -> Self {
        let n = elements.max(1) as f64;
        let bits = (-1.0 / LN2_SQUARED * n * fp_rate.ln()) as usize;
        let bytes = (bits / 8).clamp(1, MAX_FILTER_BYTES);
        let hash_funcs = ((bytes * 8) as f64 / n * LN2) as u32;
        BloomFilter {
            data: vec![0u8; bytes],
            hash_funcs: hash_funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
        }
    }

    pub fn random_tweak<R: Rng>(rng: &mut R) -> u32 {
        rng.gen()
    }

    fn bit_index(&self, hash_num: u32, data: &[u8]) -> usize {
        let seed = hash_num
            .wrapping_mul(0xFBA4_C795)
            .wrapping_add(self.tweak);
        murmur3_32(seed, data) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, data: &[u8]) {
        for i in 0..self.hash_funcs {
            let bit = self.bit_index(i, data);
            self.data[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.hash_funcs).all(|i| {
            let bit = self.bit_index(i, data);
            self.data[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    /// Would this filter match `tx`? Mirrors the remote node's test:
    /// txid, output script pushes, input outpoints, input script pushes.
    pub fn matches_transaction(&self, tx: &Transaction) -> bool {
        use crate::primitives::encode::Encodable;

        if self.contains(tx.txid().as_bytes()) {
            return true;
        }
        for output in &tx.outputs {
            if output
                .script_pubkey
                .data_pushes()
                .iter()
                .any(|p| self.contains(p))
            {
                return true;
            }
        }
        for input in &tx.inputs {
            if self.contains(&input.outpoint.encode_to_vec()) {
                return true;
            }
            if input
                .script_sig
                .data_pushes()
                .iter()
                .any(|p| self.contains(p))
            {
                return true;
            }
        }
        false
    }

    pub fn to_message(&self) -> FilterLoadMessage {
        FilterLoadMessage {
            filter: self.data.clone(),
            hash_funcs: self.hash_funcs,
            tweak: self.tweak,
            flags: BLOOM_UPDATE_ALL,
        }
    }
}

/// MurmurHash3 (x86 32-bit), the hash BIP37 fixes.
fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xCC9E_2D51;
    const C2: u32 = 0x1B87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes(chunk.try_into().expect("exact chunk"));
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 = (h1 ^ k1).rotate_left(13).wrapping_mul(5).wrapping_add(0xE654_6B64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k1 |= (b as u32) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85EB_CA6B);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xC2B2_AE35);
    h1 ^= h1 >> 16;
    h1
}
