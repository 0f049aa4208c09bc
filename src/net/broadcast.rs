//! Transaction broadcast bookkeeping: announce, await acceptance or
//! propagation evidence, fail on reject or timeout.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::chain::transaction::Transaction;
use crate::primitives::Sha256dHash;

use super::peer::PeerId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("rejected: {reason} (code {code:#04x})")]
    Rejected { code: u8, reason: String },

    #[error("no propagation evidence before the deadline")]
    Timeout,

    #[error("peer group shut down")]
    Shutdown,
}

/// The interface the wallet layer consumes; the peer group implements
/// it over real connections.
pub trait TransactionBroadcaster: Send + Sync {
    fn broadcast(&self, tx: Transaction) -> BoxFuture<'static, Result<Transaction, BroadcastError>>;
}

struct Entry {
    tx: Transaction,
    announced_to: HashSet<PeerId>,
    completion: Option<oneshot::Sender<Result<Transaction, BroadcastError>>>,
}

/// Outcome of a registry poke, for callers that need to react.
#[derive(Debug, PartialEq, Eq)]
pub enum PokeResult {
    /// Not one of our broadcasts.
    NotOurs,
    /// Evidence recorded; future completed (or already had been).
    Completed,
    /// Known broadcast but this event is not evidence (e.g. inv echo
    /// from a peer we announced to ourselves).
    Ignored,
}

/// Tracks in-flight and completed broadcasts. Entries survive
/// completion so reconnecting peers can re-request the tx bytes until
/// the wallet sees it confirm.
#[derive(Default)]
pub struct BroadcastRegistry {
    entries: Mutex<HashMap<Sha256dHash, Entry>>,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transaction about to be announced.
    pub fn register(&self, tx: Transaction) -> oneshot::Receiver<Result<Transaction, BroadcastError>> {
        let (sender, receiver) = oneshot::channel();
        self.entries.lock().insert(
            tx.txid(),
            Entry {
                tx,
                announced_to: HashSet::new(),
                completion: Some(sender),
            },
        );
        receiver
    }

    pub fn note_announced(&self, txid: &Sha256dHash, peers: &[PeerId]) {
        if let Some(entry) = self.entries.lock().get_mut(txid) {
            entry.announced_to.extend(peers.iter().copied());
        }
    }

    /// The transactions a freshly connected peer should hear about.
    pub fn all_transactions(&self) -> Vec<Transaction> {
        self.entries.lock().values().map(|e| e.tx.clone()).collect()
    }

    /// A peer asked for the tx bytes: acceptance evidence. Returns the
    /// transaction so the caller can serve it.
    pub fn on_getdata(&self, peer: PeerId, txid: &Sha256dHash) -> Option<Transaction> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(txid)?;
        if entry.announced_to.contains(&peer) {
            Self::complete(entry);
        }
        Some(entry.tx.clone())
    }

    /// A peer announced the tx back at us. Evidence only when that
    /// peer was not one we announced to (it heard it via the network).
    pub fn on_inv(&self, peer: PeerId, txid: &Sha256dHash) -> PokeResult {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(txid) else {
            return PokeResult::NotOurs;
        };
        if entry.announced_to.contains(&peer) {
            return PokeResult::Ignored;
        }
        Self::complete(entry);
        PokeResult::Completed
    }

    pub fn on_reject(&self, txid: &Sha256dHash, code: u8, reason: String) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(txid) {
            if let Some(sender) = entry.completion.take() {
                log::warn!("broadcast {} rejected: {} ({:#04x})", txid, reason, code);
                let _ = sender.send(Err(BroadcastError::Rejected { code, reason }));
            }
            // No point re-announcing a rejected tx.
            entries.remove(txid);
        }
    }

    /// Deadline passed; fails the future if still pending. The entry is
    /// kept for re-announcement on future connections.
    pub fn on_timeout(&self, txid: &Sha256dHash) {
        if let Some(entry) = self.entries.lock().get_mut(txid) {
            if let Some(sender) = entry.completion.take() {
                let _ = sender.send(Err(BroadcastError::Timeout));
            }
        }
    }

    /// Confirmed or dead transactions stop being re-announced.
    pub fn prune(&self, txid: &Sha256dHash) {
        self.entries.lock().remove(txid);
    }

    pub fn fail_all(&self, error: BroadcastError) {
        for entry in self.entries.lock().values_mut() {
            if let Some(sender) = entry.completion.take() {
                let _ = sender.send(Err(error.clone()));
            }
        }
    }

    fn complete(entry: &mut Entry) {
        if let Some(sender) = entry.completion.take() {
            // A dropped receiver means the caller cancelled; nothing
            // is owed to anyone.
            let _ = sender.send(Ok(entry.tx.clone()));
        }
    }
}
