//! Immutable per-network descriptors: magic bytes, genesis header,
//! difficulty bounds, seeds, and policy constants.

use num_bigint::BigUint;
use std::net::{IpAddr, Ipv4Addr};

use crate::chain::block::BlockHeader;
use crate::primitives::Sha256dHash;

/// Seconds in the two-week retarget window.
pub const TARGET_TIMESPAN: u32 = 14 * 24 * 60 * 60;
/// Blocks between difficulty retargets.
pub const RETARGET_INTERVAL: u32 = 2016;
/// Blocks between subsidy halvings.
pub const SUBSIDY_DECAY_INTERVAL: u32 = 210_000;

/// Network selector, also the wallet-file network id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub enum NetworkType {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl NetworkType {
    pub fn id(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Regtest => "regtest",
        }
    }
}

/// Everything consensus- or policy-level that varies per network.
/// Constructed once and shared by `Arc`.
#[derive(Debug, Clone)]
pub struct NetworkParameters {
    pub network: NetworkType,
    /// First field of every wire envelope.
    pub magic: u32,
    pub default_port: u16,
    pub p2pkh_version: u8,
    pub p2sh_version: u8,
    pub genesis: BlockHeader,
    /// Difficulty floor as a compact target.
    pub max_target_bits: u32,
    pub retarget_interval: u32,
    pub target_timespan: u32,
    /// Regtest never retargets.
    pub no_retargeting: bool,
    pub subsidy_decay_interval: u32,
    pub dns_seeds: Vec<&'static str>,
    pub fixed_seeds: Vec<IpAddr>,
    /// Outputs below this many satoshis are rolled into the fee.
    pub dust_threshold: i64,
    /// Confirmations before a coinbase output is spendable.
    pub spendable_coinbase_depth: u32,
    /// Maximum tolerated clock skew for header timestamps.
    pub max_future_block_time: u32,
}

impl NetworkParameters {
    pub fn mainnet() -> Self {
        NetworkParameters {
            network: NetworkType::Mainnet,
            magic: 0xD9B4_BEF9,
            default_port: 8333,
            p2pkh_version: 0x00,
            p2sh_version: 0x05,
            genesis: BlockHeader {
                version: 1,
                prev_hash: Sha256dHash::zero(),
                merkle_root:
                    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                        .parse()
                        .expect("static hash"),
                time: 1_231_006_505,
                bits: 0x1d00_ffff,
                nonce: 2_083_236_893,
            },
            max_target_bits: 0x1d00_ffff,
            retarget_interval: RETARGET_INTERVAL,
            target_timespan: TARGET_TIMESPAN,
            no_retargeting: false,
            subsidy_decay_interval: SUBSIDY_DECAY_INTERVAL,
            dns_seeds: vec![
                "seed.bitcoin.sipa.be",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
                "seed.bitcoin.jonasschnelli.ch",
                "seed.btc.petertodd.org",
            ],
            fixed_seeds: vec![
                IpAddr::V4(Ipv4Addr::new(5, 9, 24, 81)),
                IpAddr::V4(Ipv4Addr::new(46, 166, 160, 25)),
                IpAddr::V4(Ipv4Addr::new(82, 64, 49, 18)),
                IpAddr::V4(Ipv4Addr::new(88, 99, 167, 186)),
            ],
            dust_threshold: 546,
            spendable_coinbase_depth: 100,
            max_future_block_time: 2 * 60 * 60,
        }
    }

    pub fn testnet() -> Self {
        NetworkParameters {
            network: NetworkType::Testnet,
            magic: 0x0709_110B,
            default_port: 18333,
            p2pkh_version: 0x6F,
            p2sh_version: 0xC4,
            genesis: BlockHeader {
                version: 1,
                prev_hash: Sha256dHash::zero(),
                merkle_root:
                    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                        .parse()
                        .expect("static hash"),
                time: 1_296_688_602,
                bits: 0x1d00_ffff,
                nonce: 414_098_458,
            },
            max_target_bits: 0x1d00_ffff,
            retarget_interval: RETARGET_INTERVAL,
            target_timespan: TARGET_TIMESPAN,
            no_retargeting: false,
            subsidy_decay_interval: SUBSIDY_DECAY_INTERVAL,
            dns_seeds: vec![
                "testnet-seed.bitcoin.jonasschnelli.ch",
                "seed.tbtc.petertodd.org",
                "testnet-seed.bluematt.me",
            ],
            fixed_seeds: Vec::new(),
            dust_threshold: 546,
            spendable_coinbase_depth: 100,
            max_future_block_time: 2 * 60 * 60,
        }
    }

    pub fn regtest() -> Self {
        NetworkParameters {
            network: NetworkType::Regtest,
            magic: 0xDAB5_BFFA,
            default_port: 18444,
            p2pkh_version: 0x6F,
            p2sh_version: 0xC4,
            genesis: BlockHeader {
                version: 1,
                prev_hash: Sha256dHash::zero(),
                merkle_root:
                    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                        .parse()
                        .expect("static hash"),
                time: 1_296_688_602,
                bits: 0x207f_ffff,
                nonce: 2,
            },
            max_target_bits: 0x207f_ffff,
            retarget_interval: RETARGET_INTERVAL,
            target_timespan: TARGET_TIMESPAN,
            no_retargeting: true,
            subsidy_decay_interval: SUBSIDY_DECAY_INTERVAL,
            dns_seeds: Vec::new(),
            fixed_seeds: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            dust_threshold: 546,
            spendable_coinbase_depth: 100,
            max_future_block_time: 2 * 60 * 60,
        }
    }

    /// Stable identifier persisted into wallet files.
    pub fn id(&self) -> &'static str {
        self.network.id()
    }

    /// Difficulty floor as a full target.
    pub fn max_target(&self) -> BigUint {
        BlockHeader::target_from_bits(self.max_target_bits).expect("static bits decode")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_hashes() {
        assert_eq!(
            NetworkParameters::mainnet().genesis.hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(
            NetworkParameters::testnet().genesis.hash().to_string(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
        assert_eq!(
            NetworkParameters::regtest().genesis.hash().to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn ids_are_distinct() {
        assert_ne!(NetworkParameters::mainnet().id(), NetworkParameters::testnet().id());
        assert_ne!(NetworkParameters::testnet().id(), NetworkParameters::regtest().id());
    }

    #[test]
    fn genesis_meets_its_own_target() {
        for params in [
            NetworkParameters::mainnet(),
            NetworkParameters::testnet(),
            NetworkParameters::regtest(),
        ] {
            assert!(params.genesis.check_pow(), "{:?}", params.network);
        }
    }
}
