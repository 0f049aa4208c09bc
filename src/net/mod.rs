//! The peer group: discovery, a bounded connection pool, the bloom
//! filter lifecycle, chain download coordination, and transaction
//! broadcast.
//!
//! All peer I/O happens on per-peer tokio tasks; every resulting event
//! funnels through one worker (`handle_event`) so chain and wallet
//! mutations are never interleaved.

pub mod addrbook;
pub mod bloom;
pub mod broadcast;
pub mod codec;
pub mod discovery;
pub mod messages;
pub mod peer;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::chain::block::BlockHeader;
use crate::chain::transaction::Transaction;
use crate::chain::{unix_time, AttachResult, BlockChain, ChainError};
use crate::primitives::Sha256dHash;
use crate::wallet::Wallet;

use addrbook::{AddressBook, MAX_ADDR_AGE};
use bloom::BloomFilter;
use broadcast::{BroadcastRegistry, PokeResult};
use discovery::PeerDiscovery;
use messages::{
    GetHeadersMessage, InvItem, NetworkMessage, INV_BLOCK, INV_FILTERED_BLOCK, INV_TX,
};
use peer::{HandshakeConfig, PeerEvent, PeerHandle, PeerId, PeerState};

pub use broadcast::{BroadcastError, TransactionBroadcaster};
pub use discovery::{DiscoveryError, DnsDiscovery, FixedSeeds};

/// Maximum headers per `headers` message; a full batch means more are
/// waiting.
const MAX_HEADERS_PER_MSG: usize = 2000;
/// Filtered blocks requested per `getdata`.
const FILTERED_BATCH: usize = 500;

#[derive(Debug, Clone)]
pub struct PeerGroupConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub user_agent: String,
    /// Bloom false-positive rate uploaded to peers.
    pub bloom_fp_rate: f64,
    /// Filter re-upload rate limit: wait this long unless enough new
    /// elements accumulated.
    pub filter_min_interval: Duration,
    /// Element count that forces an immediate filter re-upload.
    pub filter_element_batch: u32,
    pub broadcast_redundancy: usize,
    pub broadcast_timeout: Duration,
    /// No download progress for this long rotates the download peer.
    pub stall_timeout: Duration,
    pub ban_duration: Duration,
    pub backoff_start: Duration,
    pub backoff_cap: Duration,
    pub ping_interval: Duration,
}

impl Default for PeerGroupConfig {
    fn default() -> Self {
        PeerGroupConfig {
            min_connections: 1,
            max_connections: 8,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            user_agent: format!("/kestrel:{}/", env!("CARGO_PKG_VERSION")),
            bloom_fp_rate: 1e-5,
            filter_min_interval: Duration::from_secs(30),
            filter_element_batch: 25,
            broadcast_redundancy: 2,
            broadcast_timeout: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(30),
            ban_duration: Duration::from_secs(24 * 60 * 60),
            backoff_start: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30 * 60),
            ping_interval: Duration::from_secs(120),
        }
    }
}

/// Chain download progress callbacks (dispatched inline on the worker;
/// keep them cheap).
pub trait DownloadListener: Send + Sync {
    fn progress(&self, _blocks_remaining: u32, _chain_height: u32) {}
    fn done(&self, _chain_height: u32) {}
}

/// A filtered block being reassembled from `merkleblock` + `tx`.
struct PendingFilteredBlock {
    header: BlockHeader,
    expecting: Vec<Sha256dHash>,
    txs: Vec<Transaction>,
    from: PeerId,
}

struct GroupState {
    peers: HashMap<PeerId, PeerHandle>,
    addresses: AddressBook,
    download_peer: Option<PeerId>,
    filter: Option<BloomFilter>,
    filter_tweak: u32,
    filter_uploaded_at: Option<Instant>,
    pending_block: Option<PendingFilteredBlock>,
    headers_synced: bool,
    /// Height up to which filtered blocks (transaction visibility)
    /// have been delivered. Starts at the wallet's last-seen height;
    /// the wallet's own pointer moves during header sync and cannot
    /// serve as the cursor.
    filtered_height: u32,
    last_progress: Instant,
    download_done_reported: bool,
}

/// Manages a pool of peers on behalf of one chain and one wallet.
pub struct PeerGroup {
    params: Arc<crate::params::NetworkParameters>,
    chain: Arc<BlockChain>,
    wallet: Arc<Wallet>,
    config: PeerGroupConfig,
    state: Mutex<GroupState>,
    broadcasts: Arc<BroadcastRegistry>,
    discoveries: Mutex<Vec<Arc<dyn PeerDiscovery>>>,
    download_listeners: RwLock<Vec<Arc<dyn DownloadListener>>>,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    /// Our handshake nonce, for self-connection detection.
    nonce: u64,
    next_peer_id: AtomicU64,
    running: AtomicBool,
}

impl PeerGroup {
    pub fn new(chain: Arc<BlockChain>, wallet: Arc<Wallet>, config: PeerGroupConfig) -> Arc<Self> {
        let params = Arc::new(chain.params().clone());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let addresses = AddressBook::new(
            config.backoff_start,
            config.backoff_cap,
            config.ban_duration,
        );
        let filtered_height = wallet.last_block_seen().1;
        Arc::new(PeerGroup {
            params,
            chain,
            wallet,
            config,
            state: Mutex::new(GroupState {
                peers: HashMap::new(),
                addresses,
                download_peer: None,
                filter: None,
                filter_tweak: rand::thread_rng().gen(),
                filter_uploaded_at: None,
                pending_block: None,
                headers_synced: false,
                filtered_height,
                last_progress: Instant::now(),
                download_done_reported: false,
            }),
            broadcasts: Arc::new(BroadcastRegistry::new()),
            discoveries: Mutex::new(Vec::new()),
            download_listeners: RwLock::new(Vec::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            nonce: rand::thread_rng().gen(),
            next_peer_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
        })
    }

    pub fn add_discovery(&self, discovery: Arc<dyn PeerDiscovery>) {
        self.discoveries.lock().push(discovery);
    }

    pub fn add_download_listener(&self, listener: Arc<dyn DownloadListener>) {
        self.download_listeners.write().push(listener);
    }

    /// Seed the address book with explicitly configured peers; these
    /// take priority over discovered ones by recency.
    pub fn add_address(&self, addr: SocketAddr) {
        self.state.lock().addresses.add(addr, unix_time());
    }

    pub fn connected_count(&self) -> usize {
        self.state
            .lock()
            .peers
            .values()
            .filter(|p| p.state == PeerState::Ready)
            .count()
    }

    /// Spawn the worker and maintenance tasks. Requires a tokio
    /// runtime.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut rx = self
            .event_rx
            .lock()
            .take()
            .expect("PeerGroup started twice");

        let worker = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                worker.handle_event(event);
                if !worker.running.load(Ordering::SeqCst) {
                    break;
                }
            }
        });

        let maintainer = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tick.tick().await;
                if !maintainer.running.load(Ordering::SeqCst) {
                    break;
                }
                maintainer.maintain().await;
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.broadcasts.fail_all(BroadcastError::Shutdown);
        // Dropping the handles closes each peer's outbound channel,
        // which winds the peer tasks down.
        self.state.lock().peers.clear();
        log::info!("peer group stopped");
    }

    // ---- maintenance ----

    async fn maintain(self: &Arc<Self>) {
        self.maybe_discover().await;
        self.fill_connections();
        self.ping_peers();
        self.maybe_update_filter();
        self.check_stall();
    }

    async fn maybe_discover(&self) {
        let needs = {
            let state = self.state.lock();
            let ready = state
                .peers
                .values()
                .filter(|p| p.state == PeerState::Ready)
                .count();
            ready < self.config.min_connections
                || state.addresses.len() < self.config.max_connections * 4
        };
        if !needs {
            return;
        }
        let discoveries: Vec<Arc<dyn PeerDiscovery>> = self.discoveries.lock().clone();
        for discovery in discoveries {
            match discovery
                .peers(messages::NODE_NETWORK, Duration::from_secs(10))
                .await
            {
                Ok(addrs) => {
                    let now = unix_time();
                    let mut state = self.state.lock();
                    for addr in addrs {
                        state.addresses.add(addr, now);
                    }
                    break;
                }
                Err(e) => log::debug!("discovery failed: {}", e),
            }
        }
    }

    fn fill_connections(self: &Arc<Self>) {
        let targets = {
            let state = self.state.lock();
            let have = state.peers.len();
            if have >= self.config.max_connections {
                return;
            }
            let want = self.config.max_connections - have;
            let connected: Vec<SocketAddr> = state.peers.values().map(|p| p.addr).collect();
            state.addresses.pick(want, &connected)
        };
        for addr in targets {
            self.connect_to(addr);
        }
    }

    fn connect_to(self: &Arc<Self>, addr: SocketAddr) {
        let id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            state.peers.insert(
                id,
                PeerHandle {
                    id,
                    addr,
                    sender,
                    state: PeerState::Connecting,
                    best_height: 0,
                    latency: None,
                    filter_loaded: false,
                    ping_sent: None,
                },
            );
        }
        let start_height = self.chain.height().unwrap_or(0) as i32;
        let handshake = HandshakeConfig {
            user_agent: self.config.user_agent.clone(),
            start_height,
            nonce: self.nonce,
            handshake_timeout: self.config.handshake_timeout,
        };
        log::debug!("connecting to {} as peer {}", addr, id);
        tokio::spawn(peer::run_peer(
            id,
            addr,
            self.config.connect_timeout,
            self.params.clone(),
            handshake,
            receiver,
            self.event_tx.clone(),
        ));
    }

    fn ping_peers(&self) {
        let mut state = self.state.lock();
        for handle in state.peers.values_mut() {
            if handle.state != PeerState::Ready {
                continue;
            }
            let due = handle
                .ping_sent
                .map(|(_, at)| at.elapsed() >= self.config.ping_interval)
                .unwrap_or(true);
            if due {
                let nonce: u64 = rand::thread_rng().gen();
                handle.ping_sent = Some((nonce, Instant::now()));
                handle.send(NetworkMessage::Ping(nonce));
            }
        }
    }

    fn check_stall(&self) {
        let mut state = self.state.lock();
        if state.headers_synced && state.pending_block.is_none() {
            return;
        }
        if state.last_progress.elapsed() < self.config.stall_timeout {
            return;
        }
        if let Some(stalled) = state.download_peer.take() {
            log::warn!("download peer {} stalled; rotating", stalled);
            state.peers.remove(&stalled);
            state.pending_block = None;
            state.last_progress = Instant::now();
            Self::elect_download_peer(&mut state, &self.chain);
        }
    }

    // ---- bloom filter lifecycle ----

    /// Rebuild policy: only when new elements exist, and only when the
    /// rate limit elapsed or a batch of elements accumulated (filter
    /// churn is a linkability leak).
    fn maybe_update_filter(&self) {
        let added = self.wallet.keys_added_since_filter();
        let mut state = self.state.lock();
        let must_build = state.filter.is_none();
        if !must_build {
            if added == 0 {
                return;
            }
            let elapsed_ok = state
                .filter_uploaded_at
                .map(|at| at.elapsed() >= self.config.filter_min_interval)
                .unwrap_or(true);
            if !elapsed_ok && added < self.config.filter_element_batch {
                return;
            }
        }
        Self::rebuild_and_upload_filter(&mut state, &self.wallet, &self.config);
    }

    fn rebuild_and_upload_filter(
        state: &mut GroupState,
        wallet: &Wallet,
        config: &PeerGroupConfig,
    ) {
        let elements = wallet.bloom_elements();
        state.filter_tweak = state.filter_tweak.wrapping_add(1);
        let mut filter = BloomFilter::new(elements.len(), config.bloom_fp_rate, state.filter_tweak);
        for element in &elements {
            filter.insert(element);
        }
        let message = NetworkMessage::FilterLoad(filter.to_message());
        for handle in state.peers.values_mut() {
            if handle.state == PeerState::Ready {
                handle.send(message.clone());
                handle.filter_loaded = true;
            }
        }
        log::debug!(
            "bloom filter rebuilt: {} elements, tweak {}",
            elements.len(),
            state.filter_tweak
        );
        state.filter = Some(filter);
        state.filter_uploaded_at = Some(Instant::now());
        wallet.filter_rebuilt();
    }

    // ---- event handling (single worker) ----

    fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Connected { peer, version } => self.on_connected(peer, version),
            PeerEvent::Message { peer, message } => self.on_message(peer, message),
            PeerEvent::Disconnected {
                peer,
                misbehaved,
                reason,
            } => self.on_disconnected(peer, misbehaved, &reason),
        }
    }

    fn on_connected(self: &Arc<Self>, peer: PeerId, version: messages::VersionMessage) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(handle) = state.peers.get_mut(&peer) else {
            return; // already evicted
        };
        handle.state = PeerState::Ready;
        handle.best_height = version.start_height;
        let addr = handle.addr;
        state.addresses.record_success(addr);

        // Filter first, then ask for the mempool through it.
        if state.filter.is_none() {
            Self::rebuild_and_upload_filter(state, &self.wallet, &self.config);
        } else if let Some(filter) = &state.filter {
            let message = NetworkMessage::FilterLoad(filter.to_message());
            let handle = state.peers.get_mut(&peer).expect("present above");
            handle.send(message);
            handle.filter_loaded = true;
        }
        if let Some(handle) = state.peers.get(&peer) {
            handle.send(NetworkMessage::Mempool);
            handle.send(NetworkMessage::GetAddr);

            // Re-announce anything still pending; reconnects are how
            // broadcasts survive flaky peers.
            let pending: Vec<InvItem> = self
                .wallet
                .pending_transactions()
                .iter()
                .map(|tx| InvItem::tx(tx.txid()))
                .collect();
            if !pending.is_empty() {
                handle.send(NetworkMessage::Inv(pending));
            }
        }

        Self::elect_download_peer(state, &self.chain);
    }

    /// Highest advertised height wins; latency breaks ties.
    fn elect_download_peer(state: &mut GroupState, chain: &Arc<BlockChain>) {
        let current_ok = state
            .download_peer
            .and_then(|id| state.peers.get(&id))
            .map(|h| h.state == PeerState::Ready)
            .unwrap_or(false);
        if current_ok {
            return;
        }
        let best = state
            .peers
            .values()
            .filter(|h| h.state == PeerState::Ready)
            .max_by(|a, b| {
                a.best_height.cmp(&b.best_height).then(
                    // Lower latency is better; unknown sorts last.
                    b.latency
                        .unwrap_or(Duration::MAX)
                        .cmp(&a.latency.unwrap_or(Duration::MAX)),
                )
            })
            .map(|h| h.id);

        if let Some(id) = best {
            state.download_peer = Some(id);
            state.headers_synced = false;
            state.last_progress = Instant::now();
            state.download_done_reported = false;
            if let Ok(locator) = chain.block_locator() {
                let handle = state.peers.get(&id).expect("chosen above");
                log::info!("peer {} elected for chain download", handle.addr);
                handle.send(NetworkMessage::GetHeaders(GetHeadersMessage::new(locator)));
            }
        }
    }

    fn on_disconnected(self: &Arc<Self>, peer: PeerId, misbehaved: bool, reason: &str) {
        let mut state = self.state.lock();
        let Some(handle) = state.peers.remove(&peer) else {
            return;
        };
        log::info!("peer {} disconnected: {}", handle.addr, reason);
        if misbehaved {
            state.addresses.ban(handle.addr);
        } else {
            state.addresses.record_failure(handle.addr);
        }

        // Partial filtered blocks from the lost peer are discarded and
        // re-requested from whoever replaces it.
        let lost_pending = state
            .pending_block
            .as_ref()
            .map(|p| p.from == peer)
            .unwrap_or(false);
        if lost_pending {
            state.pending_block = None;
        }

        if state.download_peer == Some(peer) {
            state.download_peer = None;
            Self::elect_download_peer(&mut state, &self.chain);
        } else if lost_pending {
            drop(state);
            self.request_filtered_blocks();
        }
    }

    fn penalize(self: &Arc<Self>, peer: PeerId, why: &str) {
        log::warn!("penalizing peer {}: {}", peer, why);
        let mut state = self.state.lock();
        if let Some(handle) = state.peers.remove(&peer) {
            state.addresses.ban(handle.addr);
        }
        if state.download_peer == Some(peer) {
            state.download_peer = None;
            state.pending_block = None;
            Self::elect_download_peer(&mut state, &self.chain);
        }
    }

    fn on_message(self: &Arc<Self>, peer: PeerId, message: NetworkMessage) {
        match message {
            NetworkMessage::Ping(nonce) => {
                let state = self.state.lock();
                if let Some(handle) = state.peers.get(&peer) {
                    handle.send(NetworkMessage::Pong(nonce));
                }
            }
            NetworkMessage::Pong(nonce) => {
                let mut state = self.state.lock();
                if let Some(handle) = state.peers.get_mut(&peer) {
                    if let Some((sent_nonce, at)) = handle.ping_sent {
                        if sent_nonce == nonce {
                            handle.latency = Some(at.elapsed());
                            handle.ping_sent = None;
                        }
                    }
                }
            }
            NetworkMessage::Headers(entries) => self.on_headers(peer, entries),
            NetworkMessage::MerkleBlock(m) => self.on_merkleblock(peer, m),
            NetworkMessage::Tx(tx) => self.on_tx(peer, tx),
            NetworkMessage::Inv(items) => self.on_inv(peer, items),
            NetworkMessage::GetData(items) => self.on_getdata(peer, items),
            NetworkMessage::NotFound(items) => self.on_notfound(peer, items),
            NetworkMessage::Addr(addrs) => {
                let now = unix_time();
                let mut state = self.state.lock();
                for entry in addrs {
                    if now.saturating_sub(entry.time as u64) <= MAX_ADDR_AGE.as_secs() {
                        state.addresses.add(entry.addr.socket_addr(), entry.time as u64);
                    }
                }
            }
            NetworkMessage::Reject(reject) => {
                log::debug!(
                    "reject from peer {}: {} {} ({:#04x})",
                    peer,
                    reject.message,
                    reject.reason,
                    reject.code
                );
                if let Some(hash) = reject.data {
                    self.broadcasts.on_reject(&hash, reject.code, reject.reason);
                }
            }
            // Deprecated alert payloads are deliberately not parsed.
            NetworkMessage::Alert => {}
            // We are a client; peers should not be querying us.
            NetworkMessage::Version(_)
            | NetworkMessage::Verack
            | NetworkMessage::GetAddr
            | NetworkMessage::GetHeaders(_)
            | NetworkMessage::GetBlocks(_)
            | NetworkMessage::Mempool
            | NetworkMessage::FilterLoad(_)
            | NetworkMessage::FilterAdd(_)
            | NetworkMessage::FilterClear
            | NetworkMessage::Block(_)
            | NetworkMessage::Unknown { .. } => {}
        }
    }

    fn on_headers(self: &Arc<Self>, peer: PeerId, entries: Vec<messages::HeadersEntry>) {
        {
            let state = self.state.lock();
            if state.download_peer != Some(peer) {
                // Only the download peer drives getheaders.
                return;
            }
        }

        let count = entries.len();
        for entry in entries {
            match self.chain.attach_header(entry.0) {
                Ok(_) => {}
                Err(ChainError::Verification(e)) => {
                    self.penalize(peer, &format!("invalid header: {}", e));
                    return;
                }
                Err(ChainError::Store(e)) => {
                    // Data-integrity failures halt the subsystem.
                    log::error!("header store failure, stopping peer group: {}", e);
                    self.stop();
                    return;
                }
            }
        }

        let height = self.chain.height().unwrap_or(0);
        let (remaining, best) = {
            let mut state = self.state.lock();
            state.last_progress = Instant::now();
            let best = state
                .peers
                .get(&peer)
                .map(|h| h.best_height.max(0) as u32)
                .unwrap_or(0);
            (best.saturating_sub(height), best)
        };
        for listener in self.download_listeners.read().iter() {
            listener.progress(remaining, height);
        }
        log::debug!(
            "attached {} headers, height {}/{} ({} left)",
            count,
            height,
            best,
            remaining
        );

        if count >= MAX_HEADERS_PER_MSG {
            // Full batch: keep walking.
            if let Ok(locator) = self.chain.block_locator() {
                let state = self.state.lock();
                if let Some(handle) = state.peers.get(&peer) {
                    handle.send(NetworkMessage::GetHeaders(GetHeadersMessage::new(locator)));
                }
            }
        } else {
            self.state.lock().headers_synced = true;
            self.request_filtered_blocks();
        }
    }

    /// Ask the download peer for filtered blocks covering the span the
    /// wallet has not seen transactions for.
    fn request_filtered_blocks(self: &Arc<Self>) {
        let base_height = self.state.lock().filtered_height;
        let head = match self.chain.head() {
            Ok(head) => head,
            Err(e) => {
                log::error!("chain head unavailable: {}", e);
                return;
            }
        };

        let mut hashes = Vec::new();
        let mut cursor = head.clone();
        while cursor.height > base_height && hashes.len() < FILTERED_BATCH {
            hashes.push(cursor.hash());
            match self.chain.store().get(&cursor.header.prev_hash) {
                Ok(Some(prev)) => cursor = prev,
                _ => break,
            }
        }
        hashes.reverse();

        let mut state = self.state.lock();
        if hashes.is_empty() {
            if !state.download_done_reported {
                state.download_done_reported = true;
                drop(state);
                for listener in self.download_listeners.read().iter() {
                    listener.done(head.height);
                }
                log::info!("chain download complete at height {}", head.height);
            }
            return;
        }

        let target = state
            .download_peer
            .and_then(|id| state.peers.get(&id))
            .or_else(|| {
                state
                    .peers
                    .values()
                    .find(|h| h.state == PeerState::Ready)
            });
        if let Some(handle) = target {
            log::debug!(
                "requesting {} filtered blocks from {}",
                hashes.len(),
                handle.addr
            );
            handle.send(NetworkMessage::GetData(
                hashes.into_iter().map(InvItem::filtered_block).collect(),
            ));
        }
    }

    fn on_merkleblock(self: &Arc<Self>, peer: PeerId, m: messages::MerkleBlockMessage) {
        // A new merkleblock closes out any previous partial one.
        self.flush_pending_block();

        let (root, matches) = match m.tree.extract_matches() {
            Ok(extracted) => extracted,
            Err(e) => {
                self.penalize(peer, &format!("bad partial merkle tree: {}", e));
                return;
            }
        };
        if root != m.header.merkle_root {
            self.penalize(peer, "merkleblock root mismatch");
            return;
        }

        let expecting: Vec<Sha256dHash> = matches.into_iter().map(|(_, txid)| txid).collect();
        if expecting.is_empty() {
            self.deliver_block(m.header, Vec::new());
        } else {
            let mut state = self.state.lock();
            state.pending_block = Some(PendingFilteredBlock {
                header: m.header,
                expecting,
                txs: Vec::new(),
                from: peer,
            });
        }
    }

    fn on_tx(self: &Arc<Self>, peer: PeerId, tx: Transaction) {
        let txid = tx.txid();

        // A tx completing a filtered block under assembly.
        let (absorbed, completed) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut absorbed = false;
            let mut complete = false;
            if let Some(pending) = state.pending_block.as_mut() {
                if let Some(pos) = pending.expecting.iter().position(|h| *h == txid) {
                    pending.expecting.remove(pos);
                    pending.txs.push(tx.clone());
                    absorbed = true;
                    complete = pending.expecting.is_empty();
                }
            }
            let completed = if complete {
                state.pending_block.take()
            } else {
                None
            };
            (absorbed, completed)
        };
        if let Some(done) = completed {
            self.deliver_block(done.header, done.txs);
            self.continue_filtered_download();
            return;
        }
        if absorbed {
            return; // block still assembling
        }

        // Unsolicited tx: mempool relay through our filter. A full tx
        // echo is as good as an inv echo for propagation evidence.
        self.broadcasts.on_inv(peer, &txid);
        self.wallet.receive_pending(&tx, &[]);
    }

    /// Flush an incomplete filtered block (peers interleave nothing
    /// between merkleblock and its txs, so this means loss or the next
    /// block starting).
    fn flush_pending_block(self: &Arc<Self>) {
        let flushed = self.state.lock().pending_block.take();
        if let Some(pending) = flushed {
            if pending.expecting.is_empty() {
                self.deliver_block(pending.header, pending.txs);
            } else {
                log::debug!(
                    "discarding partial filtered block {} ({} txs missing)",
                    pending.header.hash(),
                    pending.expecting.len()
                );
            }
        }
    }

    fn deliver_block(self: &Arc<Self>, header: BlockHeader, txs: Vec<Transaction>) {
        let delivered_hash = header.hash();
        match self.chain.attach(header, txs) {
            Ok(AttachResult::Orphan) => {
                // Lost the thread; re-locate from our tip.
                if let Ok(locator) = self.chain.block_locator() {
                    let state = self.state.lock();
                    if let Some(handle) = state
                        .download_peer
                        .and_then(|id| state.peers.get(&id))
                    {
                        handle.send(NetworkMessage::GetHeaders(GetHeadersMessage::new(locator)));
                    }
                }
            }
            Ok(_) => {
                {
                    let mut state = self.state.lock();
                    state.last_progress = Instant::now();
                    if let Ok(Some(stored)) = self.chain.store().get(&delivered_hash) {
                        state.filtered_height = state.filtered_height.max(stored.height);
                    }
                }
                // Confirmed (or killed) broadcasts stop being
                // re-announced.
                for tx in self.broadcasts.all_transactions() {
                    let txid = tx.txid();
                    let confidence = self.wallet.confidence(&txid);
                    if confidence.is_building() || confidence.is_dead() {
                        self.broadcasts.prune(&txid);
                    }
                }
            }
            Err(ChainError::Verification(e)) => {
                let offender = self.state.lock().download_peer;
                if let Some(peer) = offender {
                    self.penalize(peer, &format!("invalid filtered block: {}", e));
                }
            }
            Err(ChainError::Store(e)) => {
                log::error!("store failure during block delivery: {}", e);
                self.stop();
            }
        }
    }

    fn continue_filtered_download(self: &Arc<Self>) {
        let synced = self.state.lock().headers_synced;
        if synced {
            self.request_filtered_blocks();
        }
    }

    fn on_inv(self: &Arc<Self>, peer: PeerId, items: Vec<InvItem>) {
        let mut want: Vec<InvItem> = Vec::new();
        let mut new_block = false;
        for item in items {
            match item.kind {
                INV_TX => {
                    match self.broadcasts.on_inv(peer, &item.hash) {
                        PokeResult::NotOurs => {
                            // Relayed through our filter: fetch it
                            // unless the wallet already has it.
                            if self.wallet.transaction(&item.hash).is_none() {
                                want.push(item);
                            }
                        }
                        PokeResult::Completed => {
                            log::info!("broadcast {} seen propagating", item.hash);
                        }
                        PokeResult::Ignored => {}
                    }
                }
                INV_BLOCK | INV_FILTERED_BLOCK => {
                    if self
                        .chain
                        .store()
                        .get(&item.hash)
                        .ok()
                        .flatten()
                        .is_none()
                    {
                        new_block = true;
                    }
                }
                _ => {}
            }
        }

        let state = self.state.lock();
        if let Some(handle) = state.peers.get(&peer) {
            if !want.is_empty() {
                handle.send(NetworkMessage::GetData(want));
            }
        }
        if new_block {
            // Someone mined something we lack: pull headers.
            if let (Some(handle), Ok(locator)) = (
                state
                    .download_peer
                    .and_then(|id| state.peers.get(&id)),
                self.chain.block_locator(),
            ) {
                handle.send(NetworkMessage::GetHeaders(GetHeadersMessage::new(locator)));
            }
        }
    }

    fn on_getdata(self: &Arc<Self>, peer: PeerId, items: Vec<InvItem>) {
        let mut replies = Vec::new();
        let mut not_found = Vec::new();
        for item in items {
            if item.kind == INV_TX {
                if let Some(tx) = self.broadcasts.on_getdata(peer, &item.hash) {
                    log::info!("peer {} accepted broadcast {}", peer, item.hash);
                    replies.push(NetworkMessage::Tx(tx));
                    continue;
                }
            }
            not_found.push(item);
        }
        let state = self.state.lock();
        if let Some(handle) = state.peers.get(&peer) {
            for reply in replies {
                handle.send(reply);
            }
            if !not_found.is_empty() {
                handle.send(NetworkMessage::NotFound(not_found));
            }
        }
    }

    fn on_notfound(self: &Arc<Self>, peer: PeerId, items: Vec<InvItem>) {
        let wants_blocks = items
            .iter()
            .any(|i| i.kind == INV_FILTERED_BLOCK || i.kind == INV_BLOCK);
        if !wants_blocks {
            return;
        }
        log::debug!("peer {} lacks requested blocks; re-routing", peer);
        // Prefer any other ready peer for the retry.
        {
            let mut state = self.state.lock();
            if state.download_peer == Some(peer) {
                let other = state
                    .peers
                    .values()
                    .filter(|h| h.id != peer && h.state == PeerState::Ready)
                    .map(|h| h.id)
                    .next();
                if let Some(other) = other {
                    state.download_peer = Some(other);
                }
            }
        }
        self.request_filtered_blocks();
    }
}

impl TransactionBroadcaster for PeerGroup {
    /// Announce to `min(connected, redundancy)` random ready peers and
    /// resolve on acceptance (`getdata`) or third-party propagation
    /// (`inv` echo). Dropping the future cancels cleanly: completion is
    /// simply discarded.
    fn broadcast(&self, tx: Transaction) -> BoxFuture<'static, Result<Transaction, BroadcastError>> {
        let txid = tx.txid();
        let receiver = self.broadcasts.register(tx);

        let chosen: Vec<PeerId> = {
            let state = self.state.lock();
            let ready: Vec<PeerId> = state
                .peers
                .values()
                .filter(|h| h.state == PeerState::Ready)
                .map(|h| h.id)
                .collect();
            ready
                .choose_multiple(&mut rand::thread_rng(), self.config.broadcast_redundancy)
                .copied()
                .collect()
        };
        self.broadcasts.note_announced(&txid, &chosen);
        {
            let state = self.state.lock();
            for id in &chosen {
                if let Some(handle) = state.peers.get(id) {
                    log::info!("announcing {} to {}", txid, handle.addr);
                    handle.send(NetworkMessage::Inv(vec![InvItem::tx(txid)]));
                }
            }
        }

        let registry = self.broadcasts.clone();
        let deadline = self.config.broadcast_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            registry.on_timeout(&txid);
        });

        async move {
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(BroadcastError::Shutdown),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::block::StoredBlock;
    use crate::chain::merkle::PartialMerkleTree;
    use crate::chain::transaction::{OutPoint, TxInput, TxOutput};
    use crate::keychain::{DeterministicKeyChain, KeyChainGroup};
    use crate::params::NetworkParameters;
    use crate::store::MemoryBlockStore;
    use messages::{HeadersEntry, MerkleBlockMessage, RejectMessage, VersionMessage};
    use std::net::{IpAddr, Ipv4Addr};

    fn fixture() -> (Arc<BlockChain>, Arc<Wallet>, Arc<PeerGroup>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let params = Arc::new(NetworkParameters::regtest());
        let store = Arc::new(MemoryBlockStore::new(StoredBlock::genesis(params.genesis)));
        let chain = Arc::new(BlockChain::new(params.clone(), store));
        let keys = DeterministicKeyChain::from_seed(&params, &[0x33; 32], 0, 1_400_000_000).unwrap();
        let wallet = Wallet::new(params, KeyChainGroup::new(keys));
        chain.add_listener(wallet.clone());

        let mut config = PeerGroupConfig::default();
        config.broadcast_timeout = Duration::from_millis(200);
        let group = PeerGroup::new(chain.clone(), wallet.clone(), config);
        (chain, wallet, group)
    }

    fn version_at(height: i32) -> VersionMessage {
        let addr = messages::NetAddr {
            services: messages::NODE_NETWORK,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 18444,
        };
        VersionMessage {
            version: messages::PROTOCOL_VERSION,
            services: messages::NODE_NETWORK,
            timestamp: 1_700_000_000,
            receiver: addr,
            sender: addr,
            nonce: 9999,
            user_agent: "/sim:1.0/".into(),
            start_height: height,
            relay: false,
        }
    }

    /// Insert a simulated ready peer and return its outbound stream.
    fn install_peer(
        group: &Arc<PeerGroup>,
        height: i32,
    ) -> (PeerId, mpsc::UnboundedReceiver<NetworkMessage>) {
        let id = group.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        group.state.lock().peers.insert(
            id,
            PeerHandle {
                id,
                addr: format!("127.0.0.1:{}", 20000 + id).parse().unwrap(),
                sender,
                state: PeerState::Connecting,
                best_height: 0,
                latency: None,
                filter_loaded: false,
                ping_sent: None,
            },
        );
        group.handle_event(PeerEvent::Connected {
            peer: id,
            version: version_at(height),
        });
        (id, receiver)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<NetworkMessage>) -> Vec<NetworkMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn mine_on(parent: &StoredBlock, merkle_root: Sha256dHash) -> BlockHeader {
        let mut header = BlockHeader {
            version: 1,
            prev_hash: parent.hash(),
            merkle_root,
            time: parent.header.time + 60,
            bits: parent.header.bits,
            nonce: 0,
        };
        while !header.check_pow() {
            header.nonce += 1;
        }
        header
    }

    fn dummy_tx(salt: u8) -> Transaction {
        let mut tx = Transaction::new();
        tx.inputs
            .push(TxInput::new(OutPoint::new(Sha256dHash::digest(&[salt]), 0)));
        tx.outputs.push(TxOutput {
            value: 1000,
            script_pubkey: crate::primitives::Script::new(vec![0x51]),
        });
        tx
    }

    #[tokio::test]
    async fn connected_peer_gets_filter_then_mempool_then_getheaders() {
        let (_, _, group) = fixture();
        let (_, mut rx) = install_peer(&group, 10);
        let messages = drain(&mut rx);
        let kinds: Vec<&str> = messages.iter().map(|m| m.command()).collect();
        assert_eq!(kinds, vec!["filterload", "mempool", "getaddr", "getheaders"]);
    }

    #[tokio::test]
    async fn broadcast_reaches_redundancy_and_resolves_on_getdata() {
        let (_, _, group) = fixture();
        let (id1, mut rx1) = install_peer(&group, 0);
        let (id2, mut rx2) = install_peer(&group, 0);
        let (id3, mut rx3) = install_peer(&group, 0);
        drain(&mut rx1);
        drain(&mut rx2);
        drain(&mut rx3);

        let tx = dummy_tx(1);
        let txid = tx.txid();
        let future = group.broadcast(tx.clone());

        // Exactly two of the three peers hear the inv.
        let mut recipients = Vec::new();
        for (id, rx) in [(id1, &mut rx1), (id2, &mut rx2), (id3, &mut rx3)] {
            let got_inv = drain(rx).iter().any(|m| {
                matches!(m, NetworkMessage::Inv(items)
                    if items.iter().any(|i| i.kind == INV_TX && i.hash == txid))
            });
            if got_inv {
                recipients.push(id);
            }
        }
        assert_eq!(recipients.len(), 2);

        // One recipient fetches the tx: acceptance.
        group.handle_event(PeerEvent::Message {
            peer: recipients[0],
            message: NetworkMessage::GetData(vec![InvItem::tx(txid)]),
        });
        let sent = future.await.unwrap();
        assert_eq!(sent.txid(), txid);

        // And the tx bytes were served back.
        let rx = if recipients[0] == id1 {
            &mut rx1
        } else if recipients[0] == id2 {
            &mut rx2
        } else {
            &mut rx3
        };
        assert!(drain(rx)
            .iter()
            .any(|m| matches!(m, NetworkMessage::Tx(t) if t.txid() == txid)));
    }

    #[tokio::test]
    async fn broadcast_resolves_on_third_party_inv_echo() {
        let (_, _, group) = fixture();
        let (id1, mut rx1) = install_peer(&group, 0);
        let (id2, mut rx2) = install_peer(&group, 0);
        let (id3, mut rx3) = install_peer(&group, 0);

        let tx = dummy_tx(2);
        let txid = tx.txid();
        let future = group.broadcast(tx);

        let mut recipients = Vec::new();
        for (id, rx) in [(id1, &mut rx1), (id2, &mut rx2), (id3, &mut rx3)] {
            if drain(rx).iter().any(|m| matches!(m, NetworkMessage::Inv(items)
                if items.iter().any(|i| i.hash == txid)))
            {
                recipients.push(id);
            }
        }
        let outsider = [id1, id2, id3]
            .into_iter()
            .find(|id| !recipients.contains(id))
            .unwrap();

        group.handle_event(PeerEvent::Message {
            peer: outsider,
            message: NetworkMessage::Inv(vec![InvItem::tx(txid)]),
        });
        assert!(future.await.is_ok());
    }

    #[tokio::test]
    async fn broadcast_without_evidence_times_out() {
        let (_, _, group) = fixture();
        let (_, mut rx) = install_peer(&group, 0);
        drain(&mut rx);

        let future = group.broadcast(dummy_tx(3));
        assert_eq!(future.await.unwrap_err(), BroadcastError::Timeout);
    }

    #[tokio::test]
    async fn broadcast_fails_on_reject() {
        let (_, _, group) = fixture();
        let (id, mut rx) = install_peer(&group, 0);
        drain(&mut rx);

        let tx = dummy_tx(4);
        let txid = tx.txid();
        let future = group.broadcast(tx);
        group.handle_event(PeerEvent::Message {
            peer: id,
            message: NetworkMessage::Reject(RejectMessage {
                message: "tx".into(),
                code: messages::REJECT_INSUFFICIENT_FEE,
                reason: "fee too low".into(),
                data: Some(txid),
            }),
        });
        assert!(matches!(
            future.await.unwrap_err(),
            BroadcastError::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn headers_then_filtered_blocks_reach_wallet() {
        let (chain, wallet, group) = fixture();
        let genesis = chain.head().unwrap();

        // Block 1 carries an unrelated tx, block 2 pays the wallet.
        let other_tx = dummy_tx(9);
        let funding = {
            let address = wallet.fresh_receive_address();
            let mut tx = Transaction::new();
            tx.inputs
                .push(TxInput::new(OutPoint::new(Sha256dHash::digest(b"f"), 0)));
            tx.outputs.push(TxOutput {
                value: 250_000,
                script_pubkey: address.script_pubkey(wallet.params()),
            });
            tx
        };

        let h1 = mine_on(&genesis, other_tx.txid());
        let b1 = genesis.build_next(h1);
        let h2 = mine_on(&b1, funding.txid());

        let (id, mut rx) = install_peer(&group, 2);
        drain(&mut rx);

        group.handle_event(PeerEvent::Message {
            peer: id,
            message: NetworkMessage::Headers(vec![HeadersEntry(h1), HeadersEntry(h2)]),
        });
        assert_eq!(chain.height().unwrap(), 2);

        // Short batch means headers are done; filtered blocks follow.
        let requests = drain(&mut rx);
        let getdata = requests
            .iter()
            .find_map(|m| match m {
                NetworkMessage::GetData(items) => Some(items.clone()),
                _ => None,
            })
            .expect("filtered block request");
        assert_eq!(getdata.len(), 2);
        assert!(getdata.iter().all(|i| i.kind == INV_FILTERED_BLOCK));
        assert_eq!(getdata[0].hash, h1.hash());
        assert_eq!(getdata[1].hash, h2.hash());

        // Block 1: nothing matched.
        group.handle_event(PeerEvent::Message {
            peer: id,
            message: NetworkMessage::MerkleBlock(MerkleBlockMessage {
                header: h1,
                tree: PartialMerkleTree::from_txids(&[other_tx.txid()], &[false]),
            }),
        });
        assert_eq!(wallet.balance().available, 0);

        // Block 2: the funding tx matched, then arrives.
        group.handle_event(PeerEvent::Message {
            peer: id,
            message: NetworkMessage::MerkleBlock(MerkleBlockMessage {
                header: h2,
                tree: PartialMerkleTree::from_txids(&[funding.txid()], &[true]),
            }),
        });
        group.handle_event(PeerEvent::Message {
            peer: id,
            message: NetworkMessage::Tx(funding.clone()),
        });

        assert_eq!(wallet.balance().available, 250_000);
        assert_eq!(wallet.confidence(&funding.txid()).height(), Some(2));
        assert_eq!(group.state.lock().filtered_height, 2);
    }

    #[tokio::test]
    async fn bad_merkleblock_bans_peer() {
        let (chain, _, group) = fixture();
        let genesis = chain.head().unwrap();
        let tx = dummy_tx(5);
        let header = mine_on(&genesis, Sha256dHash::digest(b"not the root"));

        let (id, mut rx) = install_peer(&group, 1);
        drain(&mut rx);
        let addr = group.state.lock().peers[&id].addr;

        group.handle_event(PeerEvent::Message {
            peer: id,
            message: NetworkMessage::MerkleBlock(MerkleBlockMessage {
                header,
                tree: PartialMerkleTree::from_txids(&[tx.txid()], &[true]),
            }),
        });

        let state = group.state.lock();
        assert!(!state.peers.contains_key(&id));
        assert!(state.addresses.is_banned(&addr));
    }

    #[tokio::test]
    async fn invalid_header_penalizes_download_peer() {
        let (chain, _, group) = fixture();
        let genesis = chain.head().unwrap();
        let mut bad = mine_on(&genesis, Sha256dHash::digest(b"m"));
        bad.bits = 0x1d00ffff; // claims far more work than the hash has

        let (id, mut rx) = install_peer(&group, 1);
        drain(&mut rx);

        group.handle_event(PeerEvent::Message {
            peer: id,
            message: NetworkMessage::Headers(vec![HeadersEntry(bad)]),
        });
        assert!(!group.state.lock().peers.contains_key(&id));
        assert_eq!(chain.height().unwrap(), 0);
    }

    #[tokio::test]
    async fn tallest_peer_becomes_download_peer() {
        let (_, _, group) = fixture();
        let (short, mut rx1) = install_peer(&group, 5);
        assert_eq!(group.state.lock().download_peer, Some(short));
        drain(&mut rx1);

        // A taller peer does not displace a live download peer...
        let (_tall, mut rx2) = install_peer(&group, 50);
        assert_eq!(group.state.lock().download_peer, Some(short));
        drain(&mut rx2);

        // ...until the current one goes away.
        group.handle_event(PeerEvent::Disconnected {
            peer: short,
            misbehaved: false,
            reason: "test".into(),
        });
        let state = group.state.lock();
        let elected = state.download_peer.unwrap();
        assert_eq!(state.peers[&elected].best_height, 50);
    }

    #[tokio::test]
    async fn gossiped_addresses_enter_the_book() {
        let (_, _, group) = fixture();
        let (id, mut rx) = install_peer(&group, 0);
        drain(&mut rx);

        let now = unix_time() as u32;
        let fresh = messages::TimestampedAddr {
            time: now,
            addr: messages::NetAddr {
                services: messages::NODE_NETWORK,
                ip: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
                port: 18444,
            },
        };
        let stale = messages::TimestampedAddr {
            time: 1, // 1970: far past the freshness window
            addr: messages::NetAddr {
                services: messages::NODE_NETWORK,
                ip: IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9)),
                port: 18444,
            },
        };
        let before = group.state.lock().addresses.len();
        group.handle_event(PeerEvent::Message {
            peer: id,
            message: NetworkMessage::Addr(vec![fresh, stale]),
        });
        assert_eq!(group.state.lock().addresses.len(), before + 1);
    }
}
