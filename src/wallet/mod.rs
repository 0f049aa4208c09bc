//! The wallet state machine: key ownership, UTXO accounting across
//! reorgs, transaction confidence, coin selection, signing, and
//! persistence.

pub mod coinselect;
pub mod confidence;
pub mod persist;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::chain::block::StoredBlock;
use crate::chain::transaction::{OutPoint, Transaction, TxInput, TxOutput, SIGHASH_ALL};
use crate::chain::ChainListener;
use crate::executor::UserThread;
use crate::keychain::{DerivedKey, KeyChainError, KeyChainGroup, KeyPurpose};
use crate::params::NetworkParameters;
use crate::primitives::encode::{Decodable, Encodable, ProtocolError};
use crate::primitives::{Address, Script, Sha256dHash};

pub use coinselect::{Candidate, CoinSelector, DefaultCoinSelector};
pub use confidence::Confidence;
pub use persist::{AutoSave, PersistError, Snapshot, TxRecord, WalletState};

/// Default auto-save rate limit.
pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(3);

/// Default fee rate in satoshis per byte.
pub const DEFAULT_FEE_RATE: i64 = 5;

/// Size allowance per input for a P2PKH unlock script during fee
/// estimation: push(sig+hashtype) + push(compressed pubkey).
const SCRIPT_SIG_SIZE: usize = 107;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient money: required {required} sat, available {available} sat")]
    InsufficientMoney { required: i64, available: i64 },

    #[error("output of {value} sat is below the dust threshold")]
    OutputBelowDust { value: i64 },

    #[error(transparent)]
    KeyChain(#[from] KeyChainError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// An unspent confirmed output owned by this wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: i64,
    pub script_pubkey: Script,
    pub height: u32,
    pub coinbase: bool,
}

/// Spendable / total balances in satoshis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    /// Confirmed, mature, not reserved by a pending spend.
    pub available: i64,
    /// Available plus pending incoming (and minus pending outgoing).
    pub estimated: i64,
}

/// Everything needed to build an outgoing payment.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub to: Script,
    pub value: i64,
    /// Satoshis per serialized byte.
    pub fee_rate: i64,
    /// Override the change destination (default: a fresh internal key).
    pub change_script: Option<Script>,
    /// Send everything: `value` is ignored, one output gets
    /// `total - fee`.
    pub empty_wallet: bool,
}

impl SendRequest {
    pub fn to_address(params: &NetworkParameters, to: &Address, value: i64) -> Self {
        SendRequest {
            to: to.script_pubkey(params),
            value,
            fee_rate: DEFAULT_FEE_RATE,
            change_script: None,
            empty_wallet: false,
        }
    }

    pub fn empty_wallet_to(params: &NetworkParameters, to: &Address) -> Self {
        SendRequest {
            to: to.script_pubkey(params),
            value: 0,
            fee_rate: DEFAULT_FEE_RATE,
            change_script: None,
            empty_wallet: true,
        }
    }
}

/// User-facing wallet events, dispatched on the user callback thread.
pub trait WalletListener: Send + Sync {
    fn coins_received(&self, _tx: &Transaction, _balance: Balance) {}
    fn coins_sent(&self, _tx: &Transaction, _balance: Balance) {}
    fn confidence_changed(&self, _txid: Sha256dHash, _confidence: Confidence) {}
}

#[derive(Debug, Clone)]
struct WalletTx {
    tx: Transaction,
    confidence: Confidence,
    /// Best-chain block currently containing this tx, when BUILDING.
    block_hash: Option<Sha256dHash>,
    /// Every block (any branch) observed to include this tx.
    appeared_in: HashMap<Sha256dHash, u32>,
    from_self: bool,
}

struct WalletInner {
    keys: KeyChainGroup,
    utxos: HashMap<OutPoint, Utxo>,
    txs: HashMap<Sha256dHash, WalletTx>,
    /// Outpoints reserved by not-yet-confirmed spends, by spender txid.
    pending_spends: HashMap<OutPoint, Sha256dHash>,
    last_block_hash: Sha256dHash,
    last_block_height: u32,
}

enum Event {
    Received(Transaction, Balance),
    Sent(Transaction, Balance),
    Confidence(Sha256dHash, Confidence),
}

/// The wallet. All state mutation happens under one internal lock;
/// listener dispatch is queued after the lock is released.
pub struct Wallet {
    params: Arc<NetworkParameters>,
    inner: Mutex<WalletInner>,
    listeners: RwLock<Vec<Arc<dyn WalletListener>>>,
    selector: RwLock<Arc<dyn CoinSelector>>,
    user_thread: Arc<UserThread>,
    autosave: Mutex<Option<Arc<AutoSave>>>,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet").finish_non_exhaustive()
    }
}

impl Wallet {
    pub fn new(params: Arc<NetworkParameters>, keys: KeyChainGroup) -> Arc<Self> {
        let selector: Arc<dyn CoinSelector> = Arc::new(DefaultCoinSelector::new(
            1,
            params.spendable_coinbase_depth,
        ));
        Arc::new(Wallet {
            inner: Mutex::new(WalletInner {
                keys,
                utxos: HashMap::new(),
                txs: HashMap::new(),
                pending_spends: HashMap::new(),
                last_block_hash: params.genesis.hash(),
                last_block_height: 0,
            }),
            params,
            listeners: RwLock::new(Vec::new()),
            selector: RwLock::new(selector),
            user_thread: UserThread::new(),
            autosave: Mutex::new(None),
        })
    }

    /// Restore from a wallet file.
    pub fn load(params: Arc<NetworkParameters>, path: &Path) -> Result<Arc<Self>, WalletError> {
        let state = WalletState::load(path, params.id())?;
        let keys = KeyChainGroup::from_states(state.keychains)?;
        let wallet = Wallet::new(params, keys);
        {
            let mut inner = wallet.inner.lock();
            inner.last_block_hash = state.last_block_hash;
            inner.last_block_height = state.last_block_height;
            for record in state.txs {
                let tx = Transaction::decode_all(&record.raw)?;
                let txid = tx.txid();
                inner.txs.insert(
                    txid,
                    WalletTx {
                        tx,
                        confidence: record.confidence,
                        block_hash: record
                            .confidence
                            .height()
                            .and_then(|h| {
                                record
                                    .appeared_in
                                    .iter()
                                    .find(|(_, bh)| *bh == h)
                                    .map(|(hash, _)| *hash)
                            }),
                        appeared_in: record.appeared_in.into_iter().collect(),
                        from_self: record.from_self,
                    },
                );
            }
            Self::rebuild_from_txs(&mut inner);
        }
        Ok(wallet)
    }

    pub fn params(&self) -> &NetworkParameters {
        &self.params
    }

    pub fn add_listener(&self, listener: Arc<dyn WalletListener>) {
        self.listeners.write().push(listener);
    }

    pub fn set_coin_selector(&self, selector: Arc<dyn CoinSelector>) {
        *self.selector.write() = selector;
    }

    // ---- keys & addresses ----

    pub fn fresh_receive_key(&self) -> DerivedKey {
        let key = self.inner.lock().keys.fresh_key(KeyPurpose::Receive);
        self.mark_dirty();
        key
    }

    pub fn fresh_receive_address(&self) -> Address {
        Address::p2pkh(&self.params, self.fresh_receive_key().pubkey_hash())
    }

    pub fn current_receive_address(&self) -> Address {
        let key = self.inner.lock().keys.current_key(KeyPurpose::Receive);
        Address::p2pkh(&self.params, key.pubkey_hash())
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.lock().keys.is_encrypted()
    }

    pub fn encrypt(&self, passphrase: &str) -> Result<(), WalletError> {
        self.inner.lock().keys.encrypt(passphrase)?;
        self.mark_dirty();
        Ok(())
    }

    pub fn decrypt(&self, passphrase: &str) -> Result<(), WalletError> {
        self.inner.lock().keys.decrypt(passphrase)?;
        self.mark_dirty();
        Ok(())
    }

    /// Earliest key birth time, used to pick a sync checkpoint.
    pub fn earliest_key_time(&self) -> u64 {
        self.inner.lock().keys.earliest_creation_time()
    }

    // ---- bloom filter support ----

    /// Everything the network filter must match for this wallet: pubkeys
    /// and key hashes of every derived key, plus owned outpoints so
    /// spends of our coins are relayed too.
    pub fn bloom_elements(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock();
        let mut elements = inner.keys.bloom_elements();
        for outpoint in inner.utxos.keys() {
            elements.push(outpoint.encode_to_vec());
        }
        elements
    }

    /// Keys derived since the filter was last rebuilt; drives the
    /// peer group's rebuild policy.
    pub fn keys_added_since_filter(&self) -> u32 {
        self.inner.lock().keys.keys_added_since_filter()
    }

    pub fn filter_rebuilt(&self) {
        self.inner.lock().keys.filter_rebuilt();
    }

    // ---- balances & queries ----

    pub fn balance(&self) -> Balance {
        let inner = self.inner.lock();
        Self::balance_locked(&inner, &self.params)
    }

    fn balance_locked(inner: &WalletInner, params: &NetworkParameters) -> Balance {
        let tip = inner.last_block_height;
        let mut available = 0i64;
        for utxo in inner.utxos.values() {
            if inner.pending_spends.contains_key(&utxo.outpoint) {
                continue;
            }
            if utxo.coinbase && tip + 1 < utxo.height + params.spendable_coinbase_depth {
                continue;
            }
            available += utxo.value;
        }

        let mut estimated = available;
        for wtx in inner.txs.values() {
            if !wtx.confidence.is_pending() {
                continue;
            }
            let txid = wtx.tx.txid();
            for (i, out) in wtx.tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, i as u32);
                if inner.pending_spends.contains_key(&outpoint) {
                    continue;
                }
                if Self::output_is_mine(inner, out) {
                    estimated += out.value;
                }
            }
        }
        Balance {
            available,
            estimated,
        }
    }

    pub fn confidence(&self, txid: &Sha256dHash) -> Confidence {
        self.inner
            .lock()
            .txs
            .get(txid)
            .map(|w| w.confidence)
            .unwrap_or(Confidence::Unknown)
    }

    pub fn transaction(&self, txid: &Sha256dHash) -> Option<Transaction> {
        self.inner.lock().txs.get(txid).map(|w| w.tx.clone())
    }

    /// Pending transactions the broadcaster should keep announcing.
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.inner
            .lock()
            .txs
            .values()
            .filter(|w| w.confidence.is_pending() && w.from_self)
            .map(|w| w.tx.clone())
            .collect()
    }

    pub fn last_block_seen(&self) -> (Sha256dHash, u32) {
        let inner = self.inner.lock();
        (inner.last_block_hash, inner.last_block_height)
    }

    fn output_is_mine(inner: &WalletInner, output: &TxOutput) -> bool {
        output
            .script_pubkey
            .destination_hash()
            .map(|h| inner.keys.is_watching_hash(&h))
            .unwrap_or(false)
    }

    fn input_is_mine(inner: &WalletInner, input: &TxInput) -> bool {
        if inner.utxos.contains_key(&input.outpoint) {
            return true;
        }
        // Spends of our unconfirmed outputs (e.g. chained change).
        inner
            .txs
            .get(&input.outpoint.txid)
            .and_then(|w| w.tx.outputs.get(input.outpoint.index as usize))
            .map(|out| Self::output_is_mine(inner, out))
            .unwrap_or(false)
    }

    pub fn is_relevant(&self, tx: &Transaction) -> bool {
        let inner = self.inner.lock();
        Self::relevant_locked(&inner, tx)
    }

    fn relevant_locked(inner: &WalletInner, tx: &Transaction) -> bool {
        if inner.txs.contains_key(&tx.txid()) {
            return true;
        }
        tx.outputs.iter().any(|o| Self::output_is_mine(inner, o))
            || tx.inputs.iter().any(|i| Self::input_is_mine(inner, i))
    }

    // ---- incoming transaction paths ----

    /// A transaction observed in the mempool. Dependencies are accepted
    /// for interface compatibility; relevance alone decides admission.
    pub fn receive_pending(&self, tx: &Transaction, dependencies: &[Transaction]) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !Self::relevant_locked(&inner, tx) {
                return;
            }
            let txid = tx.txid();
            if inner.txs.contains_key(&txid) {
                log::debug!("duplicate pending tx {}", txid);
                return;
            }
            log::info!(
                "pending tx {} received ({} dependencies)",
                txid,
                dependencies.len()
            );
            Self::admit_pending(&mut inner, tx.clone(), false, &mut events, &self.params);
        }
        self.dispatch(events);
        self.mark_dirty();
    }

    fn admit_pending(
        inner: &mut WalletInner,
        tx: Transaction,
        from_self: bool,
        events: &mut Vec<Event>,
        params: &NetworkParameters,
    ) {
        let txid = tx.txid();
        for input in &tx.inputs {
            if Self::input_is_mine(inner, input) {
                inner.pending_spends.insert(input.outpoint, txid);
            }
        }
        for output in &tx.outputs {
            if let Some(hash) = output.script_pubkey.destination_hash() {
                if inner.keys.is_watching_hash(&hash) {
                    inner.keys.mark_used(&hash);
                }
            }
        }
        let received: i64 = tx
            .outputs
            .iter()
            .filter(|o| Self::output_is_mine(inner, o))
            .map(|o| o.value)
            .sum();
        let sends = tx.inputs.iter().any(|i| Self::input_is_mine(inner, i));

        inner.txs.insert(
            txid,
            WalletTx {
                tx: tx.clone(),
                confidence: Confidence::Pending,
                block_hash: None,
                appeared_in: HashMap::new(),
                from_self,
            },
        );

        let balance = Self::balance_locked(inner, params);
        if received > 0 && !from_self {
            events.push(Event::Received(tx.clone(), balance));
        }
        if sends {
            events.push(Event::Sent(tx, balance));
        }
        events.push(Event::Confidence(txid, Confidence::Pending));
    }

    /// A transaction confirmed by a best-chain block.
    fn receive_from_block(
        inner: &mut WalletInner,
        tx: &Transaction,
        block: &StoredBlock,
        events: &mut Vec<Event>,
        params: &NetworkParameters,
    ) {
        if !Self::relevant_locked(inner, tx) {
            return; // bloom false positive
        }
        let txid = tx.txid();
        let block_hash = block.hash();
        let newly_tracked = !inner.txs.contains_key(&txid);

        // Pending transactions double-spent by this one die atomically.
        let conflicts: Vec<Sha256dHash> = inner
            .txs
            .iter()
            .filter(|(other_id, w)| {
                **other_id != txid
                    && w.confidence.is_pending()
                    && w.tx
                        .inputs
                        .iter()
                        .any(|wi| tx.inputs.iter().any(|ti| ti.outpoint == wi.outpoint))
            })
            .map(|(id, _)| *id)
            .collect();
        for dead_id in conflicts {
            let w = inner.txs.get_mut(&dead_id).expect("collected above");
            w.confidence = Confidence::Dead {
                overridden_by: txid,
            };
            log::warn!("pending tx {} killed by confirmed double-spend {}", dead_id, txid);
            events.push(Event::Confidence(dead_id, w.confidence));
            let dead_inputs: Vec<OutPoint> = w.tx.inputs.iter().map(|i| i.outpoint).collect();
            for outpoint in dead_inputs {
                if inner.pending_spends.get(&outpoint) == Some(&dead_id) {
                    inner.pending_spends.remove(&outpoint);
                }
            }
        }

        // Spent inputs consume our UTXOs and release reservations.
        for input in &tx.inputs {
            inner.utxos.remove(&input.outpoint);
            if inner.pending_spends.get(&input.outpoint) == Some(&txid) {
                inner.pending_spends.remove(&input.outpoint);
            }
        }

        // Created outputs paying us become UTXOs.
        let coinbase = tx.is_coinbase();
        let mut received = 0i64;
        for (i, output) in tx.outputs.iter().enumerate() {
            if let Some(hash) = output.script_pubkey.destination_hash() {
                if inner.keys.is_watching_hash(&hash) {
                    inner.keys.mark_used(&hash);
                    inner.utxos.insert(
                        OutPoint::new(txid, i as u32),
                        Utxo {
                            outpoint: OutPoint::new(txid, i as u32),
                            value: output.value,
                            script_pubkey: output.script_pubkey.clone(),
                            height: block.height,
                            coinbase,
                        },
                    );
                    received += output.value;
                }
            }
        }
        let sends = tx.inputs.iter().any(|i| {
            inner.pending_spends.contains_key(&i.outpoint)
                || inner
                    .txs
                    .get(&i.outpoint.txid)
                    .and_then(|w| w.tx.outputs.get(i.outpoint.index as usize))
                    .map(|o| Self::output_is_mine(inner, o))
                    .unwrap_or(false)
        });

        let confidence = Confidence::Building {
            height: block.height,
            depth: 1,
        };
        let from_self = inner.txs.get(&txid).map(|w| w.from_self).unwrap_or(false);
        let entry = inner.txs.entry(txid).or_insert_with(|| WalletTx {
            tx: tx.clone(),
            confidence,
            block_hash: Some(block_hash),
            appeared_in: HashMap::new(),
            from_self,
        });
        let confidence_changed = entry.confidence != confidence;
        entry.confidence = confidence;
        entry.block_hash = Some(block_hash);
        entry.appeared_in.insert(block_hash, block.height);

        if confidence_changed || newly_tracked {
            events.push(Event::Confidence(txid, confidence));
        }
        let balance = Self::balance_locked(inner, params);
        if newly_tracked && received > 0 {
            events.push(Event::Received(tx.clone(), balance));
            if sends {
                events.push(Event::Sent(tx.clone(), balance));
            }
        }
        log::info!(
            "tx {} confirmed at height {}; balance {} sat",
            txid,
            block.height,
            balance.available
        );
    }

    /// Record a side-chain appearance without touching the UTXO set.
    fn receive_side_chain(
        inner: &mut WalletInner,
        tx: &Transaction,
        block: &StoredBlock,
        events: &mut Vec<Event>,
        params: &NetworkParameters,
    ) {
        if !Self::relevant_locked(inner, tx) {
            return;
        }
        let txid = tx.txid();
        if !inner.txs.contains_key(&txid) {
            Self::admit_pending(inner, tx.clone(), false, events, params);
        }
        let entry = inner.txs.get_mut(&txid).expect("inserted above");
        entry.appeared_in.insert(block.hash(), block.height);
    }

    /// Depth bookkeeping after the best chain extends. Historical
    /// filtered re-deliveries never move the pointer backwards.
    fn notify_new_best_block(
        inner: &mut WalletInner,
        block: &StoredBlock,
        events: &mut Vec<Event>,
    ) {
        if block.height >= inner.last_block_height || inner.last_block_hash == block.hash() {
            inner.last_block_hash = block.hash();
            inner.last_block_height = block.height;
        }
        let tip_height = inner.last_block_height;

        // Depth updates fire in block-height order.
        let mut building: Vec<(u32, Sha256dHash)> = inner
            .txs
            .iter()
            .filter_map(|(id, w)| w.confidence.height().map(|h| (h, *id)))
            .collect();
        building.sort_unstable();
        for (height, txid) in building {
            let depth = tip_height.saturating_sub(height) + 1;
            let w = inner.txs.get_mut(&txid).expect("iterated above");
            if w.confidence.depth() != depth {
                w.confidence = Confidence::Building { height, depth };
                events.push(Event::Confidence(txid, w.confidence));
            }
        }
    }

    /// Throw away derived state and replay it from the recorded
    /// transactions. Keeps the reorg path equivalent to a fresh replay
    /// of the best chain by construction.
    fn rebuild_from_txs(inner: &mut WalletInner) {
        inner.utxos.clear();
        inner.pending_spends.clear();

        let mut confirmed: Vec<(u32, Sha256dHash)> = inner
            .txs
            .iter()
            .filter_map(|(id, w)| w.confidence.height().map(|h| (h, *id)))
            .collect();
        confirmed.sort_unstable();

        for (height, txid) in confirmed {
            let (tx, coinbase) = {
                let w = &inner.txs[&txid];
                (w.tx.clone(), w.tx.is_coinbase())
            };
            for input in &tx.inputs {
                inner.utxos.remove(&input.outpoint);
            }
            for (i, output) in tx.outputs.iter().enumerate() {
                if Self::output_is_mine(inner, output) {
                    inner.utxos.insert(
                        OutPoint::new(txid, i as u32),
                        Utxo {
                            outpoint: OutPoint::new(txid, i as u32),
                            value: output.value,
                            script_pubkey: output.script_pubkey.clone(),
                            height,
                            coinbase,
                        },
                    );
                }
            }
        }

        let pending: Vec<(Sha256dHash, Vec<OutPoint>)> = inner
            .txs
            .iter()
            .filter(|(_, w)| w.confidence.is_pending())
            .map(|(id, w)| (*id, w.tx.inputs.iter().map(|i| i.outpoint).collect()))
            .collect();
        for (txid, outpoints) in pending {
            for outpoint in outpoints {
                if inner.utxos.contains_key(&outpoint) {
                    inner.pending_spends.insert(outpoint, txid);
                }
            }
        }
    }

    fn handle_reorg(
        &self,
        split: &StoredBlock,
        old_blocks: &[StoredBlock],
        new_blocks: &[StoredBlock],
    ) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            let old_set: Vec<Sha256dHash> = old_blocks.iter().map(|b| b.hash()).collect();

            // Disconnects, tip-first: demote to PENDING.
            for old_hash in &old_set {
                let demoted: Vec<Sha256dHash> = inner
                    .txs
                    .iter()
                    .filter(|(_, w)| w.block_hash.as_ref() == Some(old_hash))
                    .map(|(id, _)| *id)
                    .collect();
                for txid in demoted {
                    let w = inner.txs.get_mut(&txid).expect("collected above");
                    w.confidence = Confidence::Pending;
                    w.block_hash = None;
                    events.push(Event::Confidence(txid, Confidence::Pending));
                }
            }

            // Connects, ascending: promote txs known to live in the new
            // branch.
            let new_tip_height = new_blocks
                .last()
                .map(|b| b.height)
                .unwrap_or(split.height);
            for block in new_blocks {
                let block_hash = block.hash();
                let promoted: Vec<Sha256dHash> = inner
                    .txs
                    .iter()
                    .filter(|(_, w)| w.appeared_in.contains_key(&block_hash))
                    .map(|(id, _)| *id)
                    .collect();
                for txid in promoted {
                    let confidence = Confidence::Building {
                        height: block.height,
                        depth: new_tip_height.saturating_sub(block.height) + 1,
                    };
                    let w = inner.txs.get_mut(&txid).expect("collected above");
                    w.confidence = confidence;
                    w.block_hash = Some(block_hash);
                    events.push(Event::Confidence(txid, confidence));
                }
            }

            Self::rebuild_from_txs(&mut inner);
            if let Some(tip) = new_blocks.last() {
                inner.last_block_hash = tip.hash();
                inner.last_block_height = tip.height;
            } else {
                inner.last_block_hash = split.hash();
                inner.last_block_height = split.height;
            }
            log::info!(
                "wallet reorganized: {} disconnected, {} connected, height {}",
                old_blocks.len(),
                new_blocks.len(),
                inner.last_block_height
            );
        }
        self.dispatch(events);
        self.mark_dirty();
    }

    // ---- outgoing path ----

    /// Build, sign, and commit a payment. The returned transaction is
    /// in the pending pool; hand it to a broadcaster to announce.
    pub fn create_send(&self, request: SendRequest) -> Result<Transaction, WalletError> {
        let mut events = Vec::new();
        let tx = {
            let mut inner = self.inner.lock();
            let tx = Self::assemble_and_sign(&mut inner, &self.params, &*self.selector.read(), &request)?;
            Self::admit_pending(&mut inner, tx.clone(), true, &mut events, &self.params);
            tx
        };
        self.dispatch(events);
        self.mark_dirty();
        log::info!("created send {} ({} sat)", tx.txid(), request.value);
        Ok(tx)
    }

    fn spendable_candidates(inner: &WalletInner) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for utxo in inner.utxos.values() {
            if inner.pending_spends.contains_key(&utxo.outpoint) {
                continue;
            }
            let from_self = inner
                .txs
                .get(&utxo.outpoint.txid)
                .map(|w| w.from_self)
                .unwrap_or(false);
            candidates.push(Candidate {
                outpoint: utxo.outpoint,
                value: utxo.value,
                script_pubkey: utxo.script_pubkey.clone(),
                height: Some(utxo.height),
                from_self,
                coinbase: utxo.coinbase,
            });
        }
        // Unconfirmed change from our own pending sends.
        for (txid, wtx) in &inner.txs {
            if !wtx.confidence.is_pending() {
                continue;
            }
            for (i, output) in wtx.tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(*txid, i as u32);
                if inner.pending_spends.contains_key(&outpoint) {
                    continue;
                }
                if Self::output_is_mine(inner, output) {
                    candidates.push(Candidate {
                        outpoint,
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height: None,
                        from_self: wtx.from_self,
                        coinbase: false,
                    });
                }
            }
        }
        candidates
    }

    fn assemble_and_sign(
        inner: &mut WalletInner,
        params: &NetworkParameters,
        selector: &Arc<dyn CoinSelector>,
        request: &SendRequest,
    ) -> Result<Transaction, WalletError> {
        let tip = inner.last_block_height;
        let candidates = Self::spendable_candidates(inner);
        let available: i64 = candidates.iter().map(|c| c.value).sum();

        if request.empty_wallet {
            let selected = selector.select(i64::MAX, candidates, tip);
            return Self::finish_empty_wallet(inner, params, request, selected);
        }

        if request.value < params.dust_threshold {
            return Err(WalletError::OutputBelowDust {
                value: request.value,
            });
        }

        // Fee iteration: selection and size feed each other; repeat
        // until the fee lands in the same byte bucket.
        let mut fee: i64 = 0;
        for _round in 0..16 {
            let target = request.value + fee;
            let selected = selector.select(target, candidates.clone(), tip);
            let total: i64 = selected.iter().map(|c| c.value).sum();
            if total < target {
                // The shortfall may be exactly the change output we no
                // longer need: a change-free tx is smaller and the
                // sub-dust excess rolls into the fee.
                let fee_no_change =
                    Self::estimate_size(selected.len(), false) as i64 * request.fee_rate;
                if total >= request.value + fee_no_change
                    && total - request.value - fee_no_change < params.dust_threshold
                {
                    return Self::sign_transaction(inner, request, &selected, 0, None);
                }
                return Err(WalletError::InsufficientMoney {
                    required: target,
                    available,
                });
            }

            let change = total - request.value - fee;
            let with_change = change >= params.dust_threshold;
            let size = Self::estimate_size(selected.len(), with_change);
            let needed_fee = size as i64 * request.fee_rate;
            if needed_fee <= fee {
                // Stable: build and sign for real.
                let change_script = if with_change {
                    Some(match &request.change_script {
                        Some(script) => script.clone(),
                        None => {
                            let key = inner.keys.fresh_key(KeyPurpose::Change);
                            Script::pay_to_pubkey_hash(&key.pubkey_hash())
                        }
                    })
                } else {
                    None
                };
                return Self::sign_transaction(inner, request, &selected, change, change_script);
            }
            fee = needed_fee;
        }
        Err(WalletError::InsufficientMoney {
            required: request.value + fee,
            available,
        })
    }

    fn finish_empty_wallet(
        inner: &mut WalletInner,
        params: &NetworkParameters,
        request: &SendRequest,
        selected: Vec<Candidate>,
    ) -> Result<Transaction, WalletError> {
        let total: i64 = selected.iter().map(|c| c.value).sum();
        if total <= 0 {
            return Err(WalletError::InsufficientMoney {
                required: params.dust_threshold,
                available: total,
            });
        }
        let size = Self::estimate_size(selected.len(), false);
        let fee = size as i64 * request.fee_rate;
        let value = total - fee;
        if value < params.dust_threshold {
            return Err(WalletError::InsufficientMoney {
                required: fee + params.dust_threshold,
                available: total,
            });
        }
        let mut request = request.clone();
        request.value = value;
        Self::sign_transaction(inner, &request, &selected, 0, None)
    }

    /// Byte-size estimate for fee purposes: worst-case script sigs.
    fn estimate_size(inputs: usize, with_change: bool) -> usize {
        let outputs = if with_change { 2 } else { 1 };
        // version + locktime + list prefixes.
        10 + inputs * (36 + SCRIPT_SIG_SIZE + 4 + 1) + outputs * 34
    }

    fn sign_transaction(
        inner: &mut WalletInner,
        request: &SendRequest,
        selected: &[Candidate],
        change: i64,
        change_script: Option<Script>,
    ) -> Result<Transaction, WalletError> {
        let mut tx = Transaction::new();
        for candidate in selected {
            tx.inputs.push(TxInput::new(candidate.outpoint));
        }
        tx.outputs.push(TxOutput {
            value: request.value,
            script_pubkey: request.to.clone(),
        });
        if let Some(script) = change_script {
            tx.outputs.push(TxOutput {
                value: change,
                script_pubkey: script,
            });
        }

        for (i, candidate) in selected.iter().enumerate() {
            let hash = candidate
                .script_pubkey
                .destination_hash()
                .ok_or(KeyChainError::KeyMissing)?;
            let digest = tx.signature_hash(i, &candidate.script_pubkey, SIGHASH_ALL)?;
            let mut signature = inner.keys.sign(&digest, &hash)?;
            signature.push(SIGHASH_ALL as u8);
            let key = inner
                .keys
                .find_key_by_hash(&hash)
                .ok_or(KeyChainError::KeyMissing)?;
            tx.inputs[i].script_sig =
                Script::script_sig(&signature, &key.key.serialize_public());
        }
        Ok(tx)
    }

    // ---- persistence ----

    pub fn to_state(&self) -> WalletState {
        let inner = self.inner.lock();
        let mut txs: Vec<TxRecord> = inner
            .txs
            .values()
            .map(|w| TxRecord {
                raw: serde_bytes::ByteBuf::from(w.tx.encode_to_vec()),
                confidence: w.confidence,
                appeared_in: w.appeared_in.iter().map(|(h, ht)| (*h, *ht)).collect(),
                from_self: w.from_self,
            })
            .collect();
        txs.sort_by_key(|r| r.raw.clone());
        WalletState {
            version: 1,
            network_id: self.params.id().to_string(),
            last_block_hash: inner.last_block_hash,
            last_block_height: inner.last_block_height,
            keychains: inner.keys.to_states(),
            txs,
            extensions: Vec::new(),
        }
    }

    /// Synchronous save; refuses to run on the user callback thread.
    pub fn save(&self, path: &Path) -> Result<(), WalletError> {
        self.user_thread.check_not_user_thread("Wallet::save");
        Ok(self.to_state().save(path)?)
    }

    /// Enable coalesced background saves to `path`.
    pub fn autosave_to(self: &Arc<Self>, path: PathBuf, interval: Duration) {
        let weak: std::sync::Weak<dyn Snapshot> = {
            let strong: Arc<dyn Snapshot> = self.clone();
            Arc::downgrade(&strong)
        };
        *self.autosave.lock() = Some(AutoSave::new(path, interval, weak));
    }

    /// Force out any pending auto-save and stop the user thread.
    pub fn shutdown(&self) {
        self.user_thread.check_not_user_thread("Wallet::shutdown");
        if let Some(saver) = self.autosave.lock().as_ref() {
            saver.flush();
        }
        self.user_thread.shutdown();
    }

    fn mark_dirty(&self) {
        if let Some(saver) = self.autosave.lock().as_ref() {
            saver.mark_dirty();
        }
    }

    // ---- event plumbing ----

    /// Dispatch queued events on the user thread. Never called while
    /// the wallet lock is held.
    fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn WalletListener>> = self.listeners.read().clone();
        if listeners.is_empty() {
            return;
        }
        for event in events {
            let listeners = listeners.clone();
            self.user_thread.execute(move || {
                for listener in &listeners {
                    match &event {
                        Event::Received(tx, balance) => listener.coins_received(tx, *balance),
                        Event::Sent(tx, balance) => listener.coins_sent(tx, *balance),
                        Event::Confidence(txid, conf) => listener.confidence_changed(*txid, *conf),
                    }
                }
            });
        }
    }
}

impl Snapshot for Wallet {
    fn snapshot(&self) -> WalletState {
        self.to_state()
    }
}

/// The wallet participates in chain events as a listener; the chain
/// holds it only through this trait object.
impl ChainListener for Wallet {
    fn block_connected(&self, block: &StoredBlock, txs: &[Transaction]) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            for tx in txs {
                Self::receive_from_block(&mut inner, tx, block, &mut events, &self.params);
            }
            Self::notify_new_best_block(&mut inner, block, &mut events);
        }
        self.dispatch(events);
        self.mark_dirty();
    }

    fn block_side_chain(&self, block: &StoredBlock, txs: &[Transaction]) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            for tx in txs {
                Self::receive_side_chain(&mut inner, tx, block, &mut events, &self.params);
            }
        }
        self.dispatch(events);
    }

    fn reorganize(&self, split: &StoredBlock, old_blocks: &[StoredBlock], new_blocks: &[StoredBlock]) {
        self.handle_reorg(split, old_blocks, new_blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::block::BlockHeader;
    use crate::keychain::DeterministicKeyChain;

    fn test_wallet() -> Arc<Wallet> {
        let params = Arc::new(NetworkParameters::regtest());
        let chain =
            DeterministicKeyChain::from_seed(&params, &[0x5A; 32], 0, 1_400_000_000).unwrap();
        Wallet::new(params, KeyChainGroup::new(chain))
    }

    fn block_at(parent: &StoredBlock, salt: u32) -> StoredBlock {
        let header = BlockHeader {
            version: 1,
            prev_hash: parent.hash(),
            merkle_root: Sha256dHash::digest(&salt.to_le_bytes()),
            time: parent.header.time + 60,
            bits: parent.header.bits,
            nonce: salt,
        };
        parent.build_next(header)
    }

    fn genesis_block(wallet: &Wallet) -> StoredBlock {
        StoredBlock::genesis(wallet.params().genesis)
    }

    /// A non-coinbase transaction paying `value` to the wallet.
    fn funding_tx(wallet: &Wallet, value: i64, salt: u8) -> Transaction {
        let address = wallet.fresh_receive_address();
        let mut tx = Transaction::new();
        tx.inputs.push(TxInput::new(OutPoint::new(
            Sha256dHash::digest(&[salt]),
            0,
        )));
        tx.outputs.push(TxOutput {
            value,
            script_pubkey: address.script_pubkey(wallet.params()),
        });
        tx
    }

    #[test]
    fn pending_then_confirmed_moves_balance() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, 100_000, 1);

        wallet.receive_pending(&tx, &[]);
        let balance = wallet.balance();
        assert_eq!(balance.available, 0);
        assert_eq!(balance.estimated, 100_000);
        assert!(wallet.confidence(&tx.txid()).is_pending());

        let b1 = block_at(&genesis_block(&wallet), 1);
        wallet.block_connected(&b1, &[tx.clone()]);
        let balance = wallet.balance();
        assert_eq!(balance.available, 100_000);
        assert_eq!(balance.estimated, 100_000);
        assert_eq!(
            wallet.confidence(&tx.txid()),
            Confidence::Building {
                height: 1,
                depth: 1
            }
        );
    }

    #[test]
    fn depth_grows_with_new_best_blocks() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, 50_000, 1);
        let b1 = block_at(&genesis_block(&wallet), 1);
        wallet.block_connected(&b1, &[tx.clone()]);
        let b2 = block_at(&b1, 2);
        wallet.block_connected(&b2, &[]);
        let b3 = block_at(&b2, 3);
        wallet.block_connected(&b3, &[]);
        assert_eq!(wallet.confidence(&tx.txid()).depth(), 3);
        assert_eq!(wallet.last_block_seen().1, 3);
    }

    #[test]
    fn irrelevant_tx_ignored() {
        let wallet = test_wallet();
        let mut tx = Transaction::new();
        tx.inputs
            .push(TxInput::new(OutPoint::new(Sha256dHash::digest(b"x"), 0)));
        tx.outputs.push(TxOutput {
            value: 1000,
            script_pubkey: Script::pay_to_pubkey_hash(&crate::primitives::Hash160([9; 20])),
        });
        wallet.receive_pending(&tx, &[]);
        assert_eq!(wallet.confidence(&tx.txid()), Confidence::Unknown);
        assert_eq!(wallet.balance().estimated, 0);
    }

    #[test]
    fn insufficient_funds_is_typed() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, 5_000, 1);
        let b1 = block_at(&genesis_block(&wallet), 1);
        wallet.block_connected(&b1, &[tx]);

        let to = Address::p2pkh(wallet.params(), crate::primitives::Hash160([7; 20]));
        let request = SendRequest::to_address(wallet.params(), &to, 10_000);
        match wallet.create_send(request).unwrap_err() {
            WalletError::InsufficientMoney {
                required,
                available,
            } => {
                assert!(required >= 10_000);
                assert_eq!(available, 5_000);
            }
            other => panic!("expected InsufficientMoney, got {other}"),
        }
    }

    #[test]
    fn send_builds_signed_tx_with_change() {
        let wallet = test_wallet();
        let funding = funding_tx(&wallet, 1_000_000, 1);
        let b1 = block_at(&genesis_block(&wallet), 1);
        wallet.block_connected(&b1, &[funding.clone()]);

        let to = Address::p2pkh(wallet.params(), crate::primitives::Hash160([7; 20]));
        let request = SendRequest::to_address(wallet.params(), &to, 300_000);
        let fee_rate = request.fee_rate;
        let tx = wallet.create_send(request).unwrap();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].value, 300_000);

        // Fee matches the size-based formula and value is conserved.
        let fee = 1_000_000 - tx.total_output_value();
        assert!(fee >= tx.size() as i64 * fee_rate);
        assert!(fee < (tx.size() as i64 + 50) * fee_rate);

        // Change pays back to a wallet-owned (internal) key.
        let change_hash = tx.outputs[1].script_pubkey.destination_hash().unwrap();
        assert!(wallet.inner.lock().keys.is_watching_hash(&change_hash));

        // The signature is canonical and verifies against the spent
        // output's script.
        let spent_script = funding.outputs[0].script_pubkey.clone();
        let digest = tx.signature_hash(0, &spent_script, SIGHASH_ALL).unwrap();
        let pushes: Vec<Vec<u8>> = tx.inputs[0]
            .script_sig
            .data_pushes()
            .iter()
            .map(|p| p.to_vec())
            .collect();
        assert_eq!(pushes.len(), 2);
        let (sig_with_type, pubkey) = (&pushes[0], &pushes[1]);
        assert_eq!(*sig_with_type.last().unwrap(), SIGHASH_ALL as u8);
        let der = &sig_with_type[..sig_with_type.len() - 1];
        assert!(crate::crypto::ecdsa::is_canonical_low_s(der));
        crate::crypto::EcKey::from_public_bytes(pubkey)
            .unwrap()
            .verify(&digest, der)
            .unwrap();

        // The spent coin is reserved; the tx sits in the pending pool.
        assert!(wallet.confidence(&tx.txid()).is_pending());
        assert_eq!(wallet.balance().available, 0);
        assert_eq!(
            wallet.balance().estimated,
            1_000_000 - 300_000 - fee
        );
        assert_eq!(wallet.pending_transactions().len(), 1);
    }

    #[test]
    fn dust_change_rolls_into_fee() {
        let wallet = test_wallet();
        let funding = funding_tx(&wallet, 100_000, 1);
        let b1 = block_at(&genesis_block(&wallet), 1);
        wallet.block_connected(&b1, &[funding]);

        let to = Address::p2pkh(wallet.params(), crate::primitives::Hash160([7; 20]));
        let mut request = SendRequest::to_address(wallet.params(), &to, 98_900);
        request.fee_rate = 5;
        let tx = wallet.create_send(request).unwrap();
        // 100000 - 98900 ~ 1100 sat: fee eats it all, no dust change.
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].value, 98_900);
    }

    #[test]
    fn empty_wallet_sends_everything_minus_fee() {
        let wallet = test_wallet();
        let b1 = block_at(&genesis_block(&wallet), 1);
        wallet.block_connected(&b1, &[funding_tx(&wallet, 40_000, 1)]);
        let b2 = block_at(&b1, 2);
        wallet.block_connected(&b2, &[funding_tx(&wallet, 60_000, 2)]);

        let to = Address::p2pkh(wallet.params(), crate::primitives::Hash160([7; 20]));
        let request = SendRequest::empty_wallet_to(wallet.params(), &to);
        let tx = wallet.create_send(request).unwrap();
        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.outputs.len(), 1);
        let fee = 100_000 - tx.outputs[0].value;
        assert!(fee > 0 && fee < 3_000);
        assert_eq!(wallet.balance().estimated, 0);
    }

    #[test]
    fn confirmed_double_spend_kills_pending() {
        let wallet = test_wallet();
        let funding = funding_tx(&wallet, 200_000, 1);
        let b1 = block_at(&genesis_block(&wallet), 1);
        wallet.block_connected(&b1, &[funding.clone()]);

        // Our own pending spend of the coin.
        let to = Address::p2pkh(wallet.params(), crate::primitives::Hash160([7; 20]));
        let ours = wallet
            .create_send(SendRequest::to_address(wallet.params(), &to, 150_000))
            .unwrap();

        // A rival spend of the same outpoint confirms instead.
        let mut rival = Transaction::new();
        rival
            .inputs
            .push(TxInput::new(OutPoint::new(funding.txid(), 0)));
        rival.outputs.push(TxOutput {
            value: 199_000,
            script_pubkey: Script::pay_to_pubkey_hash(&crate::primitives::Hash160([8; 20])),
        });
        let b2 = block_at(&b1, 2);
        wallet.block_connected(&b2, &[rival.clone()]);

        assert_eq!(
            wallet.confidence(&ours.txid()),
            Confidence::Dead {
                overridden_by: rival.txid()
            }
        );
        // The coin is gone either way.
        assert_eq!(wallet.balance().available, 0);
        assert_eq!(wallet.balance().estimated, 0);
    }

    #[test]
    fn reorg_matches_fresh_replay() {
        let wallet = test_wallet();
        let genesis = genesis_block(&wallet);
        let funding = funding_tx(&wallet, 500_000, 1);

        // Original chain: funding confirms in B1, tip B2.
        let b1 = block_at(&genesis, 1);
        wallet.block_connected(&b1, &[funding.clone()]);
        let b2 = block_at(&b1, 2);
        wallet.block_connected(&b2, &[]);
        assert_eq!(wallet.balance().available, 500_000);

        // Competing branch: empty B1', funding moves to B2', tip B3'.
        let b1p = block_at(&genesis, 10);
        let b2p = block_at(&b1p, 11);
        let b3p = block_at(&b2p, 12);
        wallet.block_side_chain(&b1p, &[]);
        wallet.block_side_chain(&b2p, &[funding.clone()]);
        wallet.block_side_chain(&b3p, &[]);
        wallet.reorganize(
            &genesis,
            &[b2.clone(), b1.clone()],
            &[b1p.clone(), b2p.clone(), b3p.clone()],
        );

        assert_eq!(
            wallet.confidence(&funding.txid()),
            Confidence::Building {
                height: 2,
                depth: 2
            }
        );
        assert_eq!(wallet.last_block_seen().1, 3);
        assert_eq!(wallet.balance().available, 500_000);

        // A fresh wallet replaying only the final chain agrees.
        let fresh = test_wallet();
        let fresh_funding = {
            // Same value to the fresh wallet's own key.
            funding_tx(&fresh, 500_000, 1)
        };
        let f1 = block_at(&genesis_block(&fresh), 10);
        fresh.block_connected(&f1, &[]);
        let f2 = block_at(&f1, 11);
        fresh.block_connected(&f2, &[fresh_funding.clone()]);
        let f3 = block_at(&f2, 12);
        fresh.block_connected(&f3, &[]);

        assert_eq!(fresh.balance(), wallet.balance());
        assert_eq!(
            fresh.confidence(&fresh_funding.txid()).height(),
            wallet.confidence(&funding.txid()).height()
        );
        assert_eq!(
            fresh.confidence(&fresh_funding.txid()).depth(),
            wallet.confidence(&funding.txid()).depth()
        );
    }

    #[test]
    fn reorg_dropping_tx_demotes_to_pending() {
        let wallet = test_wallet();
        let genesis = genesis_block(&wallet);
        let funding = funding_tx(&wallet, 77_000, 1);

        let b1 = block_at(&genesis, 1);
        wallet.block_connected(&b1, &[funding.clone()]);

        let b1p = block_at(&genesis, 20);
        let b2p = block_at(&b1p, 21);
        wallet.block_side_chain(&b1p, &[]);
        wallet.block_side_chain(&b2p, &[]);
        wallet.reorganize(&genesis, &[b1.clone()], &[b1p, b2p]);

        // The funding tx fell out of the chain: back to pending, coin
        // no longer spendable.
        assert!(wallet.confidence(&funding.txid()).is_pending());
        assert_eq!(wallet.balance().available, 0);
        assert_eq!(wallet.balance().estimated, 77_000);
    }

    #[test]
    fn locked_wallet_cannot_sign() {
        let wallet = test_wallet();
        let b1 = block_at(&genesis_block(&wallet), 1);
        wallet.block_connected(&b1, &[funding_tx(&wallet, 100_000, 1)]);

        wallet.encrypt("secret").unwrap();
        let to = Address::p2pkh(wallet.params(), crate::primitives::Hash160([7; 20]));
        let err = wallet
            .create_send(SendRequest::to_address(wallet.params(), &to, 50_000))
            .unwrap_err();
        assert!(matches!(err, WalletError::KeyChain(KeyChainError::Locked)));

        wallet.decrypt("secret").unwrap();
        wallet
            .create_send(SendRequest::to_address(wallet.params(), &to, 50_000))
            .unwrap();
    }

    #[test]
    fn listener_order_received_before_sent_and_confidence() {
        let wallet = test_wallet();

        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);
        impl WalletListener for Recorder {
            fn coins_received(&self, _tx: &Transaction, _b: Balance) {
                self.0.lock().push("received".into());
            }
            fn coins_sent(&self, _tx: &Transaction, _b: Balance) {
                self.0.lock().push("sent".into());
            }
            fn confidence_changed(&self, _txid: Sha256dHash, c: Confidence) {
                self.0.lock().push(format!("confidence:{}", c.depth()));
            }
        }
        let recorder = Arc::new(Recorder::default());
        wallet.add_listener(recorder.clone());

        // A tx that both pays us and spends our coin in one step.
        let funding = funding_tx(&wallet, 100_000, 1);
        let b1 = block_at(&genesis_block(&wallet), 1);
        wallet.block_connected(&b1, &[funding]);

        wallet.shutdown(); // drains the user thread
        let events = recorder.0.lock().clone();
        assert_eq!(events[0], "confidence:1");
        assert_eq!(events[1], "received");
    }

    #[test]
    fn save_load_roundtrip_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.kwlt");

        let wallet = test_wallet();
        let funding = funding_tx(&wallet, 250_000, 1);
        let b1 = block_at(&genesis_block(&wallet), 1);
        wallet.block_connected(&b1, &[funding.clone()]);
        wallet.receive_pending(&funding_tx(&wallet, 10_000, 2), &[]);
        wallet.save(&path).unwrap();

        let restored = Wallet::load(wallet.params.clone(), &path).unwrap();
        assert_eq!(restored.balance(), wallet.balance());
        assert_eq!(
            restored.confidence(&funding.txid()),
            wallet.confidence(&funding.txid())
        );
        assert_eq!(restored.last_block_seen(), wallet.last_block_seen());
        // Restored wallet can still spend.
        let to = Address::p2pkh(restored.params(), crate::primitives::Hash160([7; 20]));
        restored
            .create_send(SendRequest::to_address(restored.params(), &to, 100_000))
            .unwrap();
    }

    #[test]
    fn wrong_network_wallet_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.kwlt");
        let wallet = test_wallet();
        wallet.save(&path).unwrap();

        let mainnet = Arc::new(NetworkParameters::mainnet());
        assert!(matches!(
            Wallet::load(mainnet, &path).unwrap_err(),
            WalletError::Persist(PersistError::NetworkMismatch { .. })
        ));
    }

    #[test]
    fn bloom_elements_cover_keys_and_outpoints() {
        let wallet = test_wallet();
        let funding = funding_tx(&wallet, 9_000, 1);
        let b1 = block_at(&genesis_block(&wallet), 1);
        wallet.block_connected(&b1, &[funding.clone()]);

        let elements = wallet.bloom_elements();
        let key_hash = funding.outputs[0]
            .script_pubkey
            .destination_hash()
            .unwrap();
        assert!(elements.iter().any(|e| e[..] == key_hash.as_bytes()[..]));
        let outpoint = OutPoint::new(funding.txid(), 0).encode_to_vec();
        assert!(elements.iter().any(|e| e[..] == outpoint[..]));
    }
}
