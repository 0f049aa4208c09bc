//! Kestrel: an SPV wallet library.
//!
//! The pieces compose the way the data flows: a [`params::NetworkParameters`]
//! describes the network, a [`store::HeaderStore`] persists headers, a
//! [`chain::BlockChain`] validates and attaches them, a [`wallet::Wallet`]
//! tracks keys/coins/confidence, and a [`net::PeerGroup`] feeds the whole
//! stack from the peer-to-peer network and broadcasts what the wallet signs.

pub mod chain;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod keychain;
pub mod net;
pub mod params;
pub mod primitives;
pub mod store;
pub mod wallet;

pub use chain::{AttachResult, BlockChain, ChainError, CheckpointManager, VerificationError};
pub use error::Error;
pub use keychain::{DeterministicKeyChain, KeyChainError, KeyChainGroup, KeyPurpose};
pub use net::{
    BroadcastError, DnsDiscovery, FixedSeeds, PeerGroup, PeerGroupConfig, TransactionBroadcaster,
};
pub use params::{NetworkParameters, NetworkType};
pub use primitives::{Address, Hash160, Script, Sha256dHash};
pub use store::{FileBlockStore, HeaderStore, MemoryBlockStore, StoreError};
pub use wallet::{Balance, Confidence, SendRequest, Wallet, WalletError, WalletListener};
