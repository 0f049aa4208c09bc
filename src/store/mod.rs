//! Header storage: a pluggable store trait, an in-memory implementation
//! for tests and throwaway syncs, and a durable file-backed ring.

pub mod file;

use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

use crate::chain::block::StoredBlock;
use crate::primitives::Sha256dHash;

pub use file::FileBlockStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store is locked by another process")]
    Locked,

    #[error("not a block store file (bad magic)")]
    BadMagic,

    #[error("unsupported store version {0}")]
    VersionMismatch(u32),

    #[error("store corrupt: {0}")]
    Corrupt(&'static str),

    #[error("chain head references unknown block {0}")]
    MissingHead(Sha256dHash),
}

/// Storage API for attached headers. Implementations are internally
/// synchronized; the chain accesses them through a shared reference.
///
/// Failures here are fatal to the owning chain, never swallowed.
pub trait HeaderStore: Send + Sync {
    fn put(&self, block: &StoredBlock) -> Result<(), StoreError>;

    fn get(&self, hash: &Sha256dHash) -> Result<Option<StoredBlock>, StoreError>;

    fn chain_head(&self) -> Result<StoredBlock, StoreError>;

    fn set_chain_head(&self, block: &StoredBlock) -> Result<(), StoreError>;
}

/// Volatile store seeded with a genesis (or checkpoint) block.
#[derive(Debug)]
pub struct MemoryBlockStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    blocks: HashMap<Sha256dHash, StoredBlock>,
    head: Sha256dHash,
}

impl MemoryBlockStore {
    pub fn new(seed: StoredBlock) -> Self {
        let hash = seed.hash();
        let mut blocks = HashMap::new();
        blocks.insert(hash, seed);
        MemoryBlockStore {
            inner: Mutex::new(MemoryInner { blocks, head: hash }),
        }
    }
}

impl HeaderStore for MemoryBlockStore {
    fn put(&self, block: &StoredBlock) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.blocks.insert(block.hash(), block.clone());
        Ok(())
    }

    fn get(&self, hash: &Sha256dHash) -> Result<Option<StoredBlock>, StoreError> {
        Ok(self.inner.lock().blocks.get(hash).cloned())
    }

    fn chain_head(&self) -> Result<StoredBlock, StoreError> {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(&inner.head)
            .cloned()
            .ok_or(StoreError::MissingHead(inner.head))
    }

    fn set_chain_head(&self, block: &StoredBlock) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let hash = block.hash();
        inner.blocks.insert(hash, block.clone());
        inner.head = hash;
        Ok(())
    }
}
