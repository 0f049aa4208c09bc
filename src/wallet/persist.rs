//! Wallet persistence: a versioned bincode record behind a magic
//! header, written atomically (temp file, fsync, rename, dir fsync),
//! with rate-limited background auto-saves.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

use parking_lot::Mutex;

use crate::keychain::KeyChainState;
use crate::primitives::Sha256dHash;

use super::confidence::Confidence;

const WALLET_MAGIC: &[u8; 4] = b"KWLT";
const WALLET_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a wallet file")]
    BadMagic,

    #[error("unsupported wallet version {0}")]
    VersionMismatch(u32),

    #[error("wallet file does not decode: {0}")]
    Decode(String),

    #[error("wallet belongs to network {found}, expected {expected}")]
    NetworkMismatch { expected: String, found: String },

    #[error("unknown mandatory extension {0:?}")]
    UnknownMandatoryExtension(String),
}

/// One persisted transaction: raw consensus bytes plus wallet metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub raw: serde_bytes::ByteBuf,
    pub confidence: Confidence,
    /// Blocks (on any branch) that included this tx, with heights.
    pub appeared_in: Vec<(Sha256dHash, u32)>,
    pub from_self: bool,
}

/// Forward-compatibility escape hatch. Unknown optional extensions are
/// ignored on load; unknown mandatory ones reject the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
    pub id: String,
    pub mandatory: bool,
    pub data: serde_bytes::ByteBuf,
}

/// The full serialized wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletState {
    pub version: u32,
    pub network_id: String,
    pub last_block_hash: Sha256dHash,
    pub last_block_height: u32,
    pub keychains: Vec<KeyChainState>,
    pub txs: Vec<TxRecord>,
    pub extensions: Vec<Extension>,
}

/// Extension ids this build understands.
const KNOWN_EXTENSIONS: &[&str] = &[];

impl WalletState {
    /// Atomic write: temp file in the same directory, fsync, rename
    /// over the target, fsync the directory.
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(WALLET_MAGIC)?;
            file.write_all(&WALLET_VERSION.to_le_bytes())?;
            let body = bincode::serialize(self).map_err(|e| PersistError::Decode(e.to_string()))?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                File::open(parent)?.sync_all()?;
            }
        }
        Ok(())
    }

    pub fn load(path: &Path, expected_network: &str) -> Result<Self, PersistError> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != WALLET_MAGIC {
            return Err(PersistError::BadMagic);
        }
        let mut version_bytes = [0u8; 4];
        file.read_exact(&mut version_bytes)?;
        let version = u32::from_le_bytes(version_bytes);
        if version != WALLET_VERSION {
            return Err(PersistError::VersionMismatch(version));
        }

        let mut body = Vec::new();
        file.read_to_end(&mut body)?;
        let state: WalletState =
            bincode::deserialize(&body).map_err(|e| PersistError::Decode(e.to_string()))?;

        if state.network_id != expected_network {
            return Err(PersistError::NetworkMismatch {
                expected: expected_network.to_string(),
                found: state.network_id,
            });
        }
        for ext in &state.extensions {
            if ext.mandatory && !KNOWN_EXTENSIONS.contains(&ext.id.as_str()) {
                return Err(PersistError::UnknownMandatoryExtension(ext.id.clone()));
            }
        }
        Ok(state)
    }
}

/// Snapshot provider for the auto-saver; the wallet implements this.
pub trait Snapshot: Send + Sync {
    fn snapshot(&self) -> WalletState;
}

/// Rate-limited background saver. Mutations call `mark_dirty`; at most
/// one write happens per `interval`, the rest coalesce. `flush` forces
/// the pending write out (shutdown path).
pub struct AutoSave {
    path: PathBuf,
    interval: Duration,
    source: Weak<dyn Snapshot>,
    last_save: Mutex<Instant>,
    save_scheduled: Arc<AtomicBool>,
}

impl AutoSave {
    pub fn new(path: PathBuf, interval: Duration, source: Weak<dyn Snapshot>) -> Arc<Self> {
        Arc::new(AutoSave {
            path,
            interval,
            source,
            last_save: Mutex::new(Instant::now()),
            save_scheduled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Note a mutation. Saves immediately when outside the rate window,
    /// otherwise schedules exactly one deferred save at the window edge.
    pub fn mark_dirty(self: &Arc<Self>) {
        let elapsed = self.last_save.lock().elapsed();
        if elapsed >= self.interval {
            self.save_now();
            return;
        }
        if self.save_scheduled.swap(true, Ordering::SeqCst) {
            return; // a save is already pending
        }
        let remaining = self.interval - elapsed;
        let this = self.clone();
        std::thread::Builder::new()
            .name("wallet-autosave".into())
            .spawn(move || {
                std::thread::sleep(remaining);
                this.save_scheduled.store(false, Ordering::SeqCst);
                this.save_now();
            })
            .expect("spawn autosave thread");
    }

    /// Forced save, used on shutdown.
    pub fn flush(&self) {
        self.save_now();
    }

    fn save_now(&self) {
        let Some(source) = self.source.upgrade() else {
            return; // wallet already dropped
        };
        // Snapshot under the wallet lock, write without it.
        let state = source.snapshot();
        *self.last_save.lock() = Instant::now();
        if let Err(e) = state.save(&self.path) {
            log::error!("wallet auto-save to {:?} failed: {}", self.path, e);
        } else {
            log::debug!("wallet auto-saved to {:?}", self.path);
        }
    }
}
