//! Deterministic keychains: BIP44 account derivation, issued/lookahead
//! bookkeeping, at-rest encryption, and the script index the wallet and
//! bloom filter are built from.

pub mod bip32;
pub mod mnemonic;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{
    CryptoError, EcKey, EncryptedData, KeyCrypter, ScryptKeyCrypter,
};
use crate::params::{NetworkParameters, NetworkType};
use crate::primitives::Hash160;

use bip32::{ExtendedPrivKey, ExtendedPubKey, HARDENED};

pub use mnemonic::mnemonic_to_seed;

/// Default number of pre-derived keys kept past the highest issued one.
pub const DEFAULT_LOOKAHEAD_SIZE: u32 = 100;
/// Batch size of newly derived keys that triggers a filter rebuild hint.
pub const DEFAULT_LOOKAHEAD_THRESHOLD: u32 = 33;

#[derive(Debug, Error)]
pub enum KeyChainError {
    #[error("seed does not produce a valid master key")]
    InvalidSeed,

    #[error("child index {0} is arithmetically invalid")]
    InvalidChildIndex(u32),

    #[error("cannot derive hardened child {0} from a public key")]
    HardenedFromPublic(u32),

    #[error("no key known for the requested hash")]
    KeyMissing,

    #[error("keychain is encrypted; decrypt before signing")]
    Locked,

    #[error("keychain is not encrypted")]
    NotEncrypted,

    #[error("keychain is already encrypted")]
    AlreadyEncrypted,

    #[error("wrong passphrase")]
    WrongPassphrase,

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

/// Which subchain a key belongs to: receive keys are handed out to
/// senders, change keys stay internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyPurpose {
    Receive,
    Change,
}

impl KeyPurpose {
    fn subchain_index(self) -> u32 {
        match self {
            KeyPurpose::Receive => 0,
            KeyPurpose::Change => 1,
        }
    }
}

/// One derived key with its position in the tree.
#[derive(Debug, Clone)]
pub struct DerivedKey {
    pub key: EcKey,
    pub purpose: KeyPurpose,
    /// Child number under the subchain parent.
    pub child_number: u32,
}

impl DerivedKey {
    pub fn pubkey_hash(&self) -> Hash160 {
        Hash160(self.key.pubkey_hash())
    }
}

/// BIP44 coin type for a network.
fn coin_type(network: NetworkType) -> u32 {
    match network {
        NetworkType::Mainnet => 0,
        NetworkType::Testnet | NetworkType::Regtest => 1,
    }
}

struct Subchain {
    parent_pub: ExtendedPubKey,
    parent_priv: Option<ExtendedPrivKey>,
    keys: Vec<DerivedKey>,
    /// Next child number to try; may run ahead of `keys.len()` when an
    /// invalid index was skipped.
    next_child: u32,
    issued: u32,
}

impl Subchain {
    fn new(parent_priv: ExtendedPrivKey) -> Self {
        Subchain {
            parent_pub: parent_priv.to_extended_pub(),
            parent_priv: Some(parent_priv),
            keys: Vec::new(),
            next_child: 0,
            issued: 0,
        }
    }

    fn watch_only(parent_pub: ExtendedPubKey) -> Self {
        Subchain {
            parent_pub,
            parent_priv: None,
            keys: Vec::new(),
            next_child: 0,
            issued: 0,
        }
    }

    /// Derive one more key, skipping arithmetically invalid indices.
    fn derive_next(&mut self, purpose: KeyPurpose) -> DerivedKey {
        loop {
            let child = self.next_child;
            self.next_child += 1;
            let derived = match &self.parent_priv {
                Some(parent) => parent.derive(child).map(|k| k.to_ec_key()),
                None => self.parent_pub.derive(child).map(|k| k.to_ec_key()),
            };
            match derived {
                Ok(key) => {
                    let dk = DerivedKey {
                        key,
                        purpose,
                        child_number: child,
                    };
                    self.keys.push(dk.clone());
                    return dk;
                }
                // Invalid index: retry with the next one.
                Err(_) => continue,
            }
        }
    }
}

enum SeedState {
    Plain(Zeroizing<Vec<u8>>),
    Encrypted(EncryptedData),
}

/// A BIP44 account keychain with external (receive) and internal
/// (change) subchains.
///
/// Invariant: each subchain holds `issued + lookahead_size` derived keys
/// at all times, all of them present in the hash index.
pub struct DeterministicKeyChain {
    account_path: [u32; 3],
    /// Unix time the seed was created; bounds checkpointed sync.
    pub creation_time: u64,
    seed: SeedState,
    crypter: Option<ScryptKeyCrypter>,
    external: Subchain,
    internal: Subchain,
    by_hash: HashMap<[u8; 20], (KeyPurpose, u32)>,
    lookahead_size: u32,
    lookahead_threshold: u32,
    keys_added_since_filter: u32,
}

impl DeterministicKeyChain {
    /// Build from a raw 16..64-byte seed at account `m/44'/coin'/account'`.
    pub fn from_seed(
        params: &NetworkParameters,
        seed: &[u8],
        account: u32,
        creation_time: u64,
    ) -> Result<Self, KeyChainError> {
        let path = [
            44 | HARDENED,
            coin_type(params.network) | HARDENED,
            account | HARDENED,
        ];
        let master = ExtendedPrivKey::master(seed)?;
        let account_key = master.derive_path(&path)?;
        let external = Subchain::new(account_key.derive(0)?);
        let internal = Subchain::new(account_key.derive(1)?);

        let mut chain = DeterministicKeyChain {
            account_path: path,
            creation_time,
            seed: SeedState::Plain(Zeroizing::new(seed.to_vec())),
            crypter: None,
            external,
            internal,
            by_hash: HashMap::new(),
            lookahead_size: DEFAULT_LOOKAHEAD_SIZE,
            lookahead_threshold: DEFAULT_LOOKAHEAD_THRESHOLD,
            keys_added_since_filter: 0,
        };
        chain.maintain_lookahead();
        Ok(chain)
    }

    /// Build from a BIP39 mnemonic sentence.
    pub fn from_mnemonic(
        params: &NetworkParameters,
        sentence: &str,
        passphrase: &str,
        account: u32,
        creation_time: u64,
    ) -> Result<Self, KeyChainError> {
        let seed = mnemonic_to_seed(sentence, passphrase);
        Self::from_seed(params, &*seed, account, creation_time)
    }

    fn subchain(&self, purpose: KeyPurpose) -> &Subchain {
        match purpose {
            KeyPurpose::Receive => &self.external,
            KeyPurpose::Change => &self.internal,
        }
    }

    fn subchain_mut(&mut self, purpose: KeyPurpose) -> &mut Subchain {
        match purpose {
            KeyPurpose::Receive => &mut self.external,
            KeyPurpose::Change => &mut self.internal,
        }
    }

    /// Top up both subchains so the lookahead invariant holds, indexing
    /// every new key.
    fn maintain_lookahead(&mut self) {
        for purpose in [KeyPurpose::Receive, KeyPurpose::Change] {
            loop {
                let sub = self.subchain(purpose);
                if sub.keys.len() as u32 >= sub.issued + self.lookahead_size {
                    break;
                }
                let dk = self.subchain_mut(purpose).derive_next(purpose);
                let position = self.subchain(purpose).keys.len() as u32 - 1;
                self.by_hash
                    .insert(dk.key.pubkey_hash(), (purpose, position));
                self.keys_added_since_filter += 1;
            }
        }
    }

    /// The next unissued key; advances the issued counter and refills
    /// the lookahead.
    pub fn fresh_key(&mut self, purpose: KeyPurpose) -> DerivedKey {
        let sub = self.subchain_mut(purpose);
        let key = sub.keys[sub.issued as usize].clone();
        sub.issued += 1;
        self.maintain_lookahead();
        key
    }

    /// The most recently issued key, issuing the first if none is.
    pub fn current_key(&mut self, purpose: KeyPurpose) -> DerivedKey {
        let sub = self.subchain(purpose);
        if sub.issued == 0 {
            return self.fresh_key(purpose);
        }
        sub.keys[sub.issued as usize - 1].clone()
    }

    pub fn find_key_by_hash(&self, hash: &Hash160) -> Option<&DerivedKey> {
        let (purpose, position) = self.by_hash.get(hash.as_bytes())?;
        Some(&self.subchain(*purpose).keys[*position as usize])
    }

    pub fn is_watching_hash(&self, hash: &Hash160) -> bool {
        self.by_hash.contains_key(hash.as_bytes())
    }

    /// A chain-relevant transaction touched `hash`: the key counts as
    /// issued (restored wallets discover use this way) and the lookahead
    /// refills past it.
    pub fn mark_used(&mut self, hash: &Hash160) {
        if let Some(&(purpose, position)) = self.by_hash.get(hash.as_bytes()) {
            let sub = self.subchain_mut(purpose);
            if position >= sub.issued {
                sub.issued = position + 1;
            }
            self.maintain_lookahead();
        }
    }

    pub fn issued_count(&self, purpose: KeyPurpose) -> u32 {
        self.subchain(purpose).issued
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.seed, SeedState::Encrypted(_))
    }

    /// Number of keys derived since the caller last rebuilt its bloom
    /// filter; reset by `filter_rebuilt`.
    pub fn keys_added_since_filter(&self) -> u32 {
        self.keys_added_since_filter
    }

    pub fn filter_rebuilt(&mut self) {
        self.keys_added_since_filter = 0;
    }

    pub fn lookahead_threshold(&self) -> u32 {
        self.lookahead_threshold
    }

    /// Encrypt the seed and drop all private key material. Derivation
    /// continues through the public subchain parents.
    pub fn encrypt(&mut self, passphrase: &str) -> Result<(), KeyChainError> {
        if self.is_encrypted() {
            return Err(KeyChainError::AlreadyEncrypted);
        }
        let crypter = ScryptKeyCrypter::new(&mut rand::thread_rng());
        let key = crypter.derive_key(passphrase)?;
        let plain = match &self.seed {
            SeedState::Plain(seed) => seed.clone(),
            SeedState::Encrypted(_) => unreachable!("checked above"),
        };
        let blob = crypter.encrypt(&plain, &key)?;

        self.seed = SeedState::Encrypted(blob);
        self.crypter = Some(crypter);
        for sub in [&mut self.external, &mut self.internal] {
            sub.parent_priv = None;
            for dk in sub.keys.iter_mut() {
                dk.key = dk.key.public_only();
            }
        }
        Ok(())
    }

    /// Decrypt the seed and restore private keys for every derived
    /// position.
    pub fn decrypt(&mut self, passphrase: &str) -> Result<(), KeyChainError> {
        let blob = match &self.seed {
            SeedState::Encrypted(blob) => blob.clone(),
            SeedState::Plain(_) => return Err(KeyChainError::NotEncrypted),
        };
        let crypter = self.crypter.as_ref().expect("encrypted chain has crypter");
        let key = crypter.derive_key(passphrase)?;
        let seed = Zeroizing::new(
            crypter
                .decrypt(&blob, &key)
                .map_err(|_| KeyChainError::WrongPassphrase)?
                .to_vec(),
        );

        let master = ExtendedPrivKey::master(&seed).map_err(|_| KeyChainError::WrongPassphrase)?;
        let account_key = master.derive_path(&self.account_path)?;

        // A wrong passphrase that still decrypts cleanly is caught by
        // comparing the regenerated public parent.
        let external_parent = account_key.derive(0)?;
        if external_parent.to_extended_pub().key != self.external.parent_pub.key {
            return Err(KeyChainError::WrongPassphrase);
        }
        let internal_parent = account_key.derive(1)?;

        for (sub, parent) in [
            (&mut self.external, external_parent),
            (&mut self.internal, internal_parent),
        ] {
            for dk in sub.keys.iter_mut() {
                dk.key = parent.derive(dk.child_number)?.to_ec_key();
            }
            sub.parent_priv = Some(parent);
        }
        self.seed = SeedState::Plain(Zeroizing::new(seed.to_vec()));
        self.crypter = None;
        Ok(())
    }

    /// Deterministic ECDSA over `digest` with the key owning
    /// `pubkey_hash`; DER bytes without the sighash suffix.
    pub fn sign(&self, digest: &[u8; 32], pubkey_hash: &Hash160) -> Result<Vec<u8>, KeyChainError> {
        let dk = self
            .find_key_by_hash(pubkey_hash)
            .ok_or(KeyChainError::KeyMissing)?;
        if !dk.key.has_private() {
            return Err(KeyChainError::Locked);
        }
        Ok(dk.key.sign(digest)?)
    }

    /// Everything the bloom filter must match: each key's serialized
    /// pubkey and its HASH160.
    pub fn bloom_elements(&self) -> Vec<Vec<u8>> {
        let mut elements = Vec::with_capacity(2 * (self.external.keys.len() + self.internal.keys.len()));
        for sub in [&self.external, &self.internal] {
            for dk in &sub.keys {
                elements.push(dk.key.serialize_public().to_vec());
                elements.push(dk.key.pubkey_hash().to_vec());
            }
        }
        elements
    }

    /// Snapshot for wallet persistence.
    pub fn to_state(&self) -> KeyChainState {
        KeyChainState {
            account_path: self.account_path.to_vec(),
            creation_time: self.creation_time,
            seed_plain: match &self.seed {
                SeedState::Plain(s) => Some(serde_bytes::ByteBuf::from(s.to_vec())),
                SeedState::Encrypted(_) => None,
            },
            seed_encrypted: match &self.seed {
                SeedState::Encrypted(blob) => Some(blob.clone()),
                SeedState::Plain(_) => None,
            },
            crypter: self.crypter.clone(),
            external_parent: XpubState::from(&self.external.parent_pub),
            internal_parent: XpubState::from(&self.internal.parent_pub),
            issued_external: self.external.issued,
            issued_internal: self.internal.issued,
            lookahead_size: self.lookahead_size,
            lookahead_threshold: self.lookahead_threshold,
        }
    }

    /// Rebuild from a persisted snapshot, re-deriving issued plus
    /// lookahead keys.
    pub fn from_state(state: KeyChainState) -> Result<Self, KeyChainError> {
        if state.account_path.len() != 3 {
            return Err(KeyChainError::InvalidSeed);
        }
        let path = [
            state.account_path[0],
            state.account_path[1],
            state.account_path[2],
        ];

        let (seed, external, internal) = match (&state.seed_plain, &state.seed_encrypted) {
            (Some(plain), _) => {
                let master = ExtendedPrivKey::master(plain)?;
                let account_key = master.derive_path(&path)?;
                (
                    SeedState::Plain(Zeroizing::new(plain.to_vec())),
                    Subchain::new(account_key.derive(0)?),
                    Subchain::new(account_key.derive(1)?),
                )
            }
            (None, Some(blob)) => (
                SeedState::Encrypted(blob.clone()),
                Subchain::watch_only(state.external_parent.to_xpub()?),
                Subchain::watch_only(state.internal_parent.to_xpub()?),
            ),
            (None, None) => return Err(KeyChainError::InvalidSeed),
        };

        let mut chain = DeterministicKeyChain {
            account_path: path,
            creation_time: state.creation_time,
            seed,
            crypter: state.crypter,
            external,
            internal,
            by_hash: HashMap::new(),
            lookahead_size: state.lookahead_size,
            lookahead_threshold: state.lookahead_threshold,
            keys_added_since_filter: 0,
        };
        chain.external.issued = state.issued_external;
        chain.internal.issued = state.issued_internal;
        chain.maintain_lookahead();
        chain.keys_added_since_filter = 0;
        Ok(chain)
    }
}

impl std::fmt::Debug for DeterministicKeyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeterministicKeyChain")
            .field("issued_external", &self.external.issued)
            .field("issued_internal", &self.internal.issued)
            .field("encrypted", &self.is_encrypted())
            .finish_non_exhaustive()
    }
}

/// Serialized public parent of a subchain, enough to keep a locked
/// wallet's lookahead alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XpubState {
    pub pubkey: serde_bytes::ByteBuf,
    pub chain_code: [u8; 32],
    pub depth: u8,
    pub child_number: u32,
}

impl XpubState {
    fn from(xpub: &ExtendedPubKey) -> Self {
        XpubState {
            pubkey: serde_bytes::ByteBuf::from(xpub.serialize_key().to_vec()),
            chain_code: xpub.chain_code,
            depth: xpub.depth,
            child_number: xpub.child_number,
        }
    }

    fn to_xpub(&self) -> Result<ExtendedPubKey, KeyChainError> {
        Ok(ExtendedPubKey {
            depth: self.depth,
            parent_fingerprint: [0u8; 4],
            child_number: self.child_number,
            chain_code: self.chain_code,
            key: secp256k1::PublicKey::from_slice(&self.pubkey)
                .map_err(|_| KeyChainError::InvalidSeed)?,
        })
    }
}

/// Persisted keychain record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyChainState {
    pub account_path: Vec<u32>,
    pub creation_time: u64,
    pub seed_plain: Option<serde_bytes::ByteBuf>,
    pub seed_encrypted: Option<EncryptedData>,
    pub crypter: Option<ScryptKeyCrypter>,
    pub external_parent: XpubState,
    pub internal_parent: XpubState,
    pub issued_external: u32,
    pub issued_internal: u32,
    pub lookahead_size: u32,
    pub lookahead_threshold: u32,
}

/// The ordered set of keychains a wallet owns. New keys come from the
/// most recently added (active) chain; lookups fan out across all.
#[derive(Debug, Default)]
pub struct KeyChainGroup {
    chains: Vec<DeterministicKeyChain>,
}

impl KeyChainGroup {
    pub fn new(chain: DeterministicKeyChain) -> Self {
        KeyChainGroup {
            chains: vec![chain],
        }
    }

    pub fn add_chain(&mut self, chain: DeterministicKeyChain) {
        self.chains.push(chain);
    }

    pub fn chains(&self) -> &[DeterministicKeyChain] {
        &self.chains
    }

    fn active_mut(&mut self) -> &mut DeterministicKeyChain {
        self.chains.last_mut().expect("group always has a chain")
    }

    /// Earliest seed birth across chains, for checkpoint selection.
    pub fn earliest_creation_time(&self) -> u64 {
        self.chains
            .iter()
            .map(|c| c.creation_time)
            .min()
            .unwrap_or(0)
    }

    pub fn fresh_key(&mut self, purpose: KeyPurpose) -> DerivedKey {
        self.active_mut().fresh_key(purpose)
    }

    pub fn current_key(&mut self, purpose: KeyPurpose) -> DerivedKey {
        self.active_mut().current_key(purpose)
    }

    pub fn find_key_by_hash(&self, hash: &Hash160) -> Option<&DerivedKey> {
        self.chains.iter().find_map(|c| c.find_key_by_hash(hash))
    }

    pub fn is_watching_hash(&self, hash: &Hash160) -> bool {
        self.chains.iter().any(|c| c.is_watching_hash(hash))
    }

    pub fn mark_used(&mut self, hash: &Hash160) {
        for chain in self.chains.iter_mut() {
            chain.mark_used(hash);
        }
    }

    pub fn sign(&self, digest: &[u8; 32], pubkey_hash: &Hash160) -> Result<Vec<u8>, KeyChainError> {
        for chain in &self.chains {
            match chain.sign(digest, pubkey_hash) {
                Err(KeyChainError::KeyMissing) => continue,
                other => return other,
            }
        }
        Err(KeyChainError::KeyMissing)
    }

    pub fn is_encrypted(&self) -> bool {
        self.chains.iter().any(|c| c.is_encrypted())
    }

    pub fn encrypt(&mut self, passphrase: &str) -> Result<(), KeyChainError> {
        for chain in self.chains.iter_mut() {
            chain.encrypt(passphrase)?;
        }
        Ok(())
    }

    pub fn decrypt(&mut self, passphrase: &str) -> Result<(), KeyChainError> {
        for chain in self.chains.iter_mut() {
            chain.decrypt(passphrase)?;
        }
        Ok(())
    }

    pub fn bloom_elements(&self) -> Vec<Vec<u8>> {
        self.chains.iter().flat_map(|c| c.bloom_elements()).collect()
    }

    pub fn keys_added_since_filter(&self) -> u32 {
        self.chains.iter().map(|c| c.keys_added_since_filter()).sum()
    }

    pub fn filter_rebuilt(&mut self) {
        for chain in self.chains.iter_mut() {
            chain.filter_rebuilt();
        }
    }

    pub fn to_states(&self) -> Vec<KeyChainState> {
        self.chains.iter().map(|c| c.to_state()).collect()
    }

    pub fn from_states(states: Vec<KeyChainState>) -> Result<Self, KeyChainError> {
        let mut chains = Vec::with_capacity(states.len());
        for state in states {
            chains.push(DeterministicKeyChain::from_state(state)?);
        }
        if chains.is_empty() {
            return Err(KeyChainError::InvalidSeed);
        }
        Ok(KeyChainGroup { chains })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::Address;

    const VECTOR_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon \
                                   abandon abandon abandon abandon about";

    fn vector_chain() -> DeterministicKeyChain {
        let params = NetworkParameters::mainnet();
        DeterministicKeyChain::from_mnemonic(&params, VECTOR_MNEMONIC, "", 0, 1_400_000_000)
            .unwrap()
    }

    #[test]
    fn bip44_first_external_address_matches_published_value() {
        let params = NetworkParameters::mainnet();
        let mut chain = vector_chain();
        let key = chain.fresh_key(KeyPurpose::Receive);
        let addr = Address::p2pkh(&params, key.pubkey_hash());
        // m/44'/0'/0'/0/0 for the standard test mnemonic.
        assert_eq!(addr.to_string(), "1LqBGSKuX5yYUonjxT5qGfpUsXKYYWeabA");
    }

    #[test]
    fn address_sequence_is_deterministic() {
        let mut a = vector_chain();
        let mut b = vector_chain();
        for purpose in [KeyPurpose::Receive, KeyPurpose::Change] {
            for _ in 0..5 {
                assert_eq!(
                    a.fresh_key(purpose).pubkey_hash(),
                    b.fresh_key(purpose).pubkey_hash()
                );
            }
        }
    }

    #[test]
    fn lookahead_invariant_holds() {
        let mut chain = vector_chain();
        assert_eq!(chain.external.keys.len() as u32, DEFAULT_LOOKAHEAD_SIZE);

        for _ in 0..7 {
            chain.fresh_key(KeyPurpose::Receive);
        }
        assert_eq!(
            chain.external.keys.len() as u32,
            chain.external.issued + DEFAULT_LOOKAHEAD_SIZE
        );
        // Every derived key is in the index.
        assert_eq!(
            chain.by_hash.len(),
            chain.external.keys.len() + chain.internal.keys.len()
        );
    }

    #[test]
    fn mark_used_advances_issued_and_refills() {
        let mut chain = vector_chain();
        // A restored wallet sees a payment to lookahead position 40.
        let hash = chain.external.keys[40].pubkey_hash();
        chain.mark_used(&hash);
        assert_eq!(chain.issued_count(KeyPurpose::Receive), 41);
        assert_eq!(chain.external.keys.len() as u32, 41 + DEFAULT_LOOKAHEAD_SIZE);
        assert!(chain.keys_added_since_filter() >= 41);
    }

    #[test]
    fn current_key_does_not_advance() {
        let mut chain = vector_chain();
        let first = chain.fresh_key(KeyPurpose::Receive);
        assert_eq!(
            chain.current_key(KeyPurpose::Receive).pubkey_hash(),
            first.pubkey_hash()
        );
        assert_eq!(chain.issued_count(KeyPurpose::Receive), 1);
    }

    #[test]
    fn encrypt_locks_signing_and_decrypt_restores() {
        let mut chain = vector_chain();
        let key = chain.fresh_key(KeyPurpose::Receive);
        let digest = crate::crypto::sha256d(b"spend");

        chain.encrypt("hunter2").unwrap();
        assert!(chain.is_encrypted());
        assert!(matches!(
            chain.sign(&digest, &key.pubkey_hash()),
            Err(KeyChainError::Locked)
        ));

        // Lookahead still works from public parents while locked.
        let before = chain.external.keys.len();
        let last_hash = chain.external.keys[before - 1].pubkey_hash();
        chain.mark_used(&last_hash);
        assert!(chain.external.keys.len() > before);

        assert!(matches!(
            chain.decrypt("wrong"),
            Err(KeyChainError::WrongPassphrase)
        ));
        chain.decrypt("hunter2").unwrap();
        chain.sign(&digest, &key.pubkey_hash()).unwrap();
    }

    #[test]
    fn state_roundtrip_preserves_addresses() {
        let mut chain = vector_chain();
        let issued: Vec<_> = (0..3)
            .map(|_| chain.fresh_key(KeyPurpose::Receive).pubkey_hash())
            .collect();

        let restored = DeterministicKeyChain::from_state(chain.to_state()).unwrap();
        assert_eq!(restored.issued_count(KeyPurpose::Receive), 3);
        for (i, hash) in issued.iter().enumerate() {
            assert_eq!(restored.external.keys[i].pubkey_hash(), *hash);
        }
        assert_eq!(
            restored.external.keys.len() as u32,
            3 + DEFAULT_LOOKAHEAD_SIZE
        );
    }

    #[test]
    fn encrypted_state_roundtrip_is_watch_only() {
        let mut chain = vector_chain();
        let key = chain.fresh_key(KeyPurpose::Receive);
        chain.encrypt("pw").unwrap();

        let mut restored = DeterministicKeyChain::from_state(chain.to_state()).unwrap();
        assert!(restored.is_encrypted());
        assert_eq!(restored.external.keys[0].pubkey_hash(), key.pubkey_hash());

        restored.decrypt("pw").unwrap();
        restored
            .sign(&crate::crypto::sha256d(b"x"), &key.pubkey_hash())
            .unwrap();
    }

    #[test]
    fn group_signs_across_chains() {
        let params = NetworkParameters::mainnet();
        let mut group = KeyChainGroup::new(vector_chain());
        group.add_chain(
            DeterministicKeyChain::from_seed(&params, &[7u8; 32], 0, 1_500_000_000).unwrap(),
        );
        let old_key = group.chains[0].external.keys[0].clone();
        let digest = crate::crypto::sha256d(b"m");
        group.sign(&digest, &old_key.pubkey_hash()).unwrap();
        assert!(matches!(
            group.sign(&digest, &Hash160([0xEE; 20])),
            Err(KeyChainError::KeyMissing)
        ));
    }
}
