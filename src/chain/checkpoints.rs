//! Trusted header seed points. A new wallet whose keys were born after a
//! checkpoint can start its header store there instead of at genesis.

use num_bigint::BigUint;
use num_traits::Zero;

use crate::params::{NetworkParameters, NetworkType};
use crate::primitives::Sha256dHash;

use super::block::StoredBlock;

/// A `(height, hash)` pair the implementation trusts without validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: &'static str,
}

/// Well-known mainnet checkpoints, mirroring the reference client's
/// hard-coded table.
const MAINNET_CHECKPOINTS: &[Checkpoint] = &[
    Checkpoint { height: 11_111, hash: "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d" },
    Checkpoint { height: 33_333, hash: "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6" },
    Checkpoint { height: 74_000, hash: "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20" },
    Checkpoint { height: 105_000, hash: "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97" },
    Checkpoint { height: 134_444, hash: "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe" },
    Checkpoint { height: 168_000, hash: "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763" },
    Checkpoint { height: 193_000, hash: "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317" },
    Checkpoint { height: 210_000, hash: "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e" },
];

const TESTNET_CHECKPOINTS: &[Checkpoint] = &[Checkpoint {
    height: 546,
    hash: "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
}];

/// Checkpoint table for one network.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    /// Nominal seconds between blocks, used to estimate a checkpoint's
    /// wall-clock time from its height.
    genesis_time: u32,
    checkpoints: &'static [Checkpoint],
}

impl CheckpointManager {
    pub fn for_params(params: &NetworkParameters) -> Self {
        let checkpoints = match params.network {
            NetworkType::Mainnet => MAINNET_CHECKPOINTS,
            NetworkType::Testnet => TESTNET_CHECKPOINTS,
            NetworkType::Regtest => &[],
        };
        CheckpointManager {
            genesis_time: params.genesis.time,
            checkpoints,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Estimated timestamp of a checkpoint, assuming nominal spacing.
    /// Always an underestimate is fine: picking an older checkpoint only
    /// costs extra header download, never missed transactions.
    fn estimated_time(&self, height: u32) -> u64 {
        self.genesis_time as u64 + height as u64 * 600
    }

    /// Newest checkpoint strictly older than `wallet_birth_time`, if
    /// any. The caller seeds the header store with the result.
    pub fn checkpoint_before(&self, wallet_birth_time: u64) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|cp| self.estimated_time(cp.height) < wallet_birth_time)
    }

    /// The checkpoint hash required at `height`, if that height is
    /// checkpointed. The chain refuses conflicting headers there.
    pub fn hash_at(&self, height: u32) -> Option<Sha256dHash> {
        self.checkpoints
            .iter()
            .find(|cp| cp.height == height)
            .map(|cp| cp.hash.parse().expect("static checkpoint hash"))
    }

    /// Wrap a checkpoint as a storable block seed.
    ///
    /// Work is seeded at zero: every block in the store descends from
    /// the checkpoint, so best-chain comparisons within the store only
    /// ever need work relative to it.
    pub fn seed_block(&self, cp: &Checkpoint, header: super::block::BlockHeader) -> StoredBlock {
        debug_assert_eq!(header.hash(), cp.hash.parse().expect("static checkpoint hash"));
        StoredBlock::new(header, BigUint::zero(), cp.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_table_is_ordered_and_parses() {
        let params = NetworkParameters::mainnet();
        let manager = CheckpointManager::for_params(&params);
        assert!(!manager.is_empty());
        let mut last = 0;
        for cp in MAINNET_CHECKPOINTS {
            assert!(cp.height > last);
            last = cp.height;
            let hash: Sha256dHash = cp.hash.parse().unwrap();
            assert!(!hash.is_zero());
        }
    }

    #[test]
    fn birth_time_selects_newest_older_checkpoint() {
        let params = NetworkParameters::mainnet();
        let manager = CheckpointManager::for_params(&params);

        // A wallet born before any block: no checkpoint applies.
        assert!(manager.checkpoint_before(params.genesis.time as u64).is_none());

        // A wallet born far in the future gets the newest checkpoint.
        let cp = manager.checkpoint_before(u64::MAX).unwrap();
        assert_eq!(cp.height, 210_000);

        // A wallet born shortly after height 33333's estimated time.
        let t = params.genesis.time as u64 + 40_000 * 600;
        assert_eq!(manager.checkpoint_before(t).unwrap().height, 33_333);
    }

    #[test]
    fn regtest_has_no_checkpoints() {
        let params = NetworkParameters::regtest();
        let manager = CheckpointManager::for_params(&params);
        assert!(manager.is_empty());
        assert!(manager.checkpoint_before(u64::MAX).is_none());
        assert!(manager.hash_at(0).is_none());
    }

    #[test]
    fn hash_at_checkpointed_height() {
        let params = NetworkParameters::mainnet();
        let manager = CheckpointManager::for_params(&params);
        assert!(manager.hash_at(11_111).is_some());
        assert!(manager.hash_at(11_112).is_none());
    }
}
