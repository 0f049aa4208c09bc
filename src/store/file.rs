//! Durable header store: a fixed-slot ring file with a mutable tip
//! pointer and an in-memory hash index rebuilt on open.
//!
//! Layout:
//! ```text
//! header (4096 bytes): magic(4) | version(4) | capacity(4) | cursor(4)
//!                      | count(4) | tip_hash(32) | reserved
//! slots  (96 bytes each): header(80) | work(12, big-endian) | height(4)
//! ```
//!
//! Writes are ordered record -> fsync -> tip update -> fsync, so a crash
//! can lose the newest blocks but never corrupt the pointer structure.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use num_bigint::BigUint;

use crate::chain::block::{BlockHeader, StoredBlock};
use crate::primitives::encode::{Decodable, Encodable};
use crate::primitives::Sha256dHash;

use super::{HeaderStore, StoreError};

const MAGIC: u32 = 0x4B53_5056; // "KSPV"
const VERSION: u32 = 1;
const FILE_HEADER_LEN: u64 = 4096;
const SLOT_LEN: u64 = 96;

/// Default ring capacity: comfortably more than one retarget interval,
/// so reorg walks never fall off the ring.
pub const DEFAULT_CAPACITY: u32 = 5000;

#[derive(Debug)]
pub struct FileBlockStore {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    file: File,
    capacity: u32,
    cursor: u32,
    count: u32,
    tip: Sha256dHash,
    index: HashMap<Sha256dHash, u32>,
}

impl FileBlockStore {
    /// Open or create a store at `path`, seeding a fresh file with
    /// `seed` (genesis or a checkpoint) as the chain head.
    pub fn open(path: &Path, seed: StoredBlock) -> Result<Self, StoreError> {
        Self::open_with_capacity(path, seed, DEFAULT_CAPACITY)
    }

    pub fn open_with_capacity(
        path: &Path,
        seed: StoredBlock,
        capacity: u32,
    ) -> Result<Self, StoreError> {
        let exists = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        // Exclusive advisory lock for the process lifetime; released on
        // drop with the file handle.
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(StoreError::Locked),
            Err(TryLockError::Error(e)) => return Err(StoreError::Io(e)),
        }

        let mut inner = if exists && file.metadata()?.len() >= FILE_HEADER_LEN {
            Self::load(file)?
        } else {
            Self::create(file, capacity, &seed)?
        };

        if inner.index.is_empty() {
            // Empty-but-valid file (e.g. truncated create): reseed.
            Self::write_slot(&mut inner, &seed)?;
            Self::write_tip(&mut inner, seed.hash())?;
        }
        Ok(FileBlockStore {
            inner: Mutex::new(inner),
        })
    }

    fn create(mut file: File, capacity: u32, seed: &StoredBlock) -> Result<Inner, StoreError> {
        file.set_len(FILE_HEADER_LEN + capacity as u64 * SLOT_LEN)?;

        let mut inner = Inner {
            file,
            capacity,
            cursor: 0,
            count: 0,
            tip: Sha256dHash::zero(),
            index: HashMap::new(),
        };
        Self::write_file_header(&mut inner)?;
        Self::write_slot(&mut inner, seed)?;
        Self::write_tip(&mut inner, seed.hash())?;
        Ok(inner)
    }

    fn load(mut file: File) -> Result<Inner, StoreError> {
        file.seek(SeekFrom::Start(0))?;
        let mut head = [0u8; 52];
        file.read_exact(&mut head)?;

        let magic = u32::from_le_bytes(head[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(StoreError::BadMagic);
        }
        let version = u32::from_le_bytes(head[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(StoreError::VersionMismatch(version));
        }
        let capacity = u32::from_le_bytes(head[8..12].try_into().unwrap());
        let cursor = u32::from_le_bytes(head[12..16].try_into().unwrap());
        let count = u32::from_le_bytes(head[16..20].try_into().unwrap());
        if capacity == 0 || cursor >= capacity.max(1) || count > capacity {
            return Err(StoreError::Corrupt("header counters out of range"));
        }
        let mut tip_bytes = [0u8; 32];
        tip_bytes.copy_from_slice(&head[20..52]);
        let tip = Sha256dHash::from_bytes(tip_bytes);

        let mut inner = Inner {
            file,
            capacity,
            cursor,
            count,
            tip,
            index: HashMap::with_capacity(count as usize),
        };

        // Rebuild the hash index by decoding every occupied slot.
        for slot in 0..inner.count {
            let block = Self::read_slot(&mut inner, slot)?;
            inner.index.insert(block.hash(), slot);
        }
        Ok(inner)
    }

    fn write_file_header(inner: &mut Inner) -> Result<(), StoreError> {
        let mut buf = [0u8; 52];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&inner.capacity.to_le_bytes());
        buf[12..16].copy_from_slice(&inner.cursor.to_le_bytes());
        buf[16..20].copy_from_slice(&inner.count.to_le_bytes());
        buf[20..52].copy_from_slice(inner.tip.as_bytes());
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&buf)?;
        Ok(())
    }

    fn slot_offset(slot: u32) -> u64 {
        FILE_HEADER_LEN + slot as u64 * SLOT_LEN
    }

    fn read_slot(inner: &mut Inner, slot: u32) -> Result<StoredBlock, StoreError> {
        inner.file.seek(SeekFrom::Start(Self::slot_offset(slot)))?;
        let mut buf = [0u8; SLOT_LEN as usize];
        inner.file.read_exact(&mut buf)?;

        let header = BlockHeader::decode_all(&buf[0..80])
            .map_err(|_| StoreError::Corrupt("undecodable header slot"))?;
        let work = BigUint::from_bytes_be(&buf[80..92]);
        let height = u32::from_le_bytes(buf[92..96].try_into().unwrap());
        Ok(StoredBlock::new(header, work, height))
    }

    /// Append `block` at the cursor, evicting the oldest record once the
    /// ring is full. Record is synced before the header counters move.
    fn write_slot(inner: &mut Inner, block: &StoredBlock) -> Result<(), StoreError> {
        let slot = inner.cursor;

        if inner.count == inner.capacity {
            // Ring wrap: the slot being overwritten leaves the index.
            let evicted = Self::read_slot(inner, slot)?;
            inner.index.remove(&evicted.hash());
        }

        let mut buf = [0u8; SLOT_LEN as usize];
        block
            .header
            .encode(&mut &mut buf[0..80])
            .expect("fixed buffer encode");
        let work = block.work.to_bytes_be();
        if work.len() > 12 {
            return Err(StoreError::Corrupt("chain work exceeds 96 bits"));
        }
        buf[92 - work.len()..92].copy_from_slice(&work);
        buf[92..96].copy_from_slice(&block.height.to_le_bytes());

        inner.file.seek(SeekFrom::Start(Self::slot_offset(slot)))?;
        inner.file.write_all(&buf)?;
        inner.file.sync_data()?;

        inner.index.insert(block.hash(), slot);
        inner.cursor = (inner.cursor + 1) % inner.capacity;
        inner.count = (inner.count + 1).min(inner.capacity);
        Self::write_file_header(inner)?;
        inner.file.sync_data()?;
        Ok(())
    }

    fn write_tip(inner: &mut Inner, tip: Sha256dHash) -> Result<(), StoreError> {
        inner.tip = tip;
        Self::write_file_header(inner)?;
        inner.file.sync_data()?;
        Ok(())
    }
}

impl HeaderStore for FileBlockStore {
    fn put(&self, block: &StoredBlock) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&block.hash()) {
            return Ok(()); // duplicate put is informational, not an error
        }
        Self::write_slot(&mut inner, block)
    }

    fn get(&self, hash: &Sha256dHash) -> Result<Option<StoredBlock>, StoreError> {
        let mut inner = self.inner.lock();
        match inner.index.get(hash).copied() {
            Some(slot) => Ok(Some(Self::read_slot(&mut inner, slot)?)),
            None => Ok(None),
        }
    }

    fn chain_head(&self) -> Result<StoredBlock, StoreError> {
        let mut inner = self.inner.lock();
        let tip = inner.tip;
        match inner.index.get(&tip).copied() {
            Some(slot) => Self::read_slot(&mut inner, slot),
            None => Err(StoreError::MissingHead(tip)),
        }
    }

    fn set_chain_head(&self, block: &StoredBlock) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.index.contains_key(&block.hash()) {
            Self::write_slot(&mut inner, block)?;
        }
        Self::write_tip(&mut inner, block.hash())
    }
}
