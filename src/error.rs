//! Top-level error type, for callers that drive the whole stack and
//! want one `?`-able error.

use thiserror::Error;

use crate::chain::ChainError;
use crate::keychain::KeyChainError;
use crate::net::{BroadcastError, DiscoveryError};
use crate::primitives::ProtocolError;
use crate::store::StoreError;
use crate::wallet::WalletError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    KeyChain(#[from] KeyChainError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}
