//! Key derivation registry with purpose-specific wallet branches
//!
//! This module provides functionality for:
//! - BIP-86 style derivation across the wallet's fixed key branches
//! - Per-branch current-key caching and index bookkeeping
//! - Imported (external) and collection key registries
//! - Bounded historical search for collection root keys
//! - Address ownership challenges signed with branch keys

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::key::{Keypair, TapTweak};
use bitcoin::{Address, Network, XOnlyPublicKey};
use log::{debug, info};
use rand::RngCore;
use secp256k1::{All, Message, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};

use crate::engine::ContractEngine;
use crate::error::WalletError;
use crate::network::coin_type;
use crate::util::{sha256d, unix_timestamp};

/// Sentinel account/change/coin value reserved for the auth branch.
const AUTH_SENTINEL: u32 = 214_748_364;

/// Fixed-purpose key derivation branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WalletBranch {
    /// Compatibility addresses for other wallet systems
    #[serde(rename = "oth")]
    Other,
    /// Funding value
    #[serde(rename = "fund")]
    Fund,
    /// Ordinal (inscription-holding) addresses
    #[serde(rename = "ord")]
    Ord,
    /// Unspendable single-use script keys
    #[serde(rename = "uns")]
    Unspendable,
    /// Taproot internal keys for inscription commitments
    #[serde(rename = "intsk")]
    InternalScript,
    /// Taproot script keys for inscription envelopes and swap legs
    #[serde(rename = "scrsk")]
    Script,
    /// Authentication keys for the remote marketplace
    #[serde(rename = "auth")]
    Auth,
}

impl WalletBranch {
    pub const ALL: [WalletBranch; 7] = [
        WalletBranch::Other,
        WalletBranch::Fund,
        WalletBranch::Ord,
        WalletBranch::Unspendable,
        WalletBranch::InternalScript,
        WalletBranch::Script,
        WalletBranch::Auth,
    ];

    /// Short branch code used in storage keys and the remote address list.
    pub fn code(self) -> &'static str {
        match self {
            WalletBranch::Other => "oth",
            WalletBranch::Fund => "fund",
            WalletBranch::Ord => "ord",
            WalletBranch::Unspendable => "uns",
            WalletBranch::InternalScript => "intsk",
            WalletBranch::Script => "scrsk",
            WalletBranch::Auth => "auth",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.code() == code)
    }

    /// Hardened account number, fixed per branch.
    pub fn account(self) -> u32 {
        match self {
            WalletBranch::Other => 0,
            WalletBranch::Fund => 1,
            WalletBranch::Ord => 2,
            WalletBranch::Unspendable => 3,
            WalletBranch::InternalScript => 4,
            WalletBranch::Script => 5,
            WalletBranch::Auth => AUTH_SENTINEL,
        }
    }

    pub fn change(self) -> u32 {
        match self {
            WalletBranch::Auth => AUTH_SENTINEL,
            _ => 0,
        }
    }

    /// Branches whose keys are used inside Taproot scripts and therefore
    /// request for-script derivation.
    pub fn for_script(self) -> bool {
        matches!(
            self,
            WalletBranch::Unspendable
                | WalletBranch::InternalScript
                | WalletBranch::Script
                | WalletBranch::Auth
        )
    }
}

impl fmt::Display for WalletBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Per-branch mutable state: the next-unused derivation index and the key
/// cached for it.
#[derive(Debug, Default)]
struct BranchState {
    index: u32,
    key: Option<DerivedKey>,
}

/// A derived or imported keypair.
///
/// Non-script keys sign with the Taproot output key (key-path tweak, no
/// script tree); script keys sign with the raw untweaked key.
#[derive(Clone)]
pub struct DerivedKey {
    secret: SecretKey,
    x_only: XOnlyPublicKey,
    for_script: bool,
    path: Option<String>,
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("pubkey", &self.pubkey_hex())
            .field("for_script", &self.for_script)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DerivedKey {
    fn from_secret(
        secp: &Secp256k1<All>,
        secret: SecretKey,
        for_script: bool,
        path: Option<String>,
    ) -> Self {
        let (x_only, _) = Keypair::from_secret_key(secp, &secret).x_only_public_key();
        Self {
            secret,
            x_only,
            for_script,
            path,
        }
    }

    /// Build a key from a raw 32-byte secret in hex.
    pub fn from_secret_hex(secret_hex: &str, for_script: bool) -> Result<Self, WalletError> {
        let bytes = hex::decode(secret_hex)
            .map_err(|e| WalletError::Derivation(format!("malformed secret key hex: {e}")))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| WalletError::Derivation(format!("invalid secret key: {e}")))?;
        let secp = Secp256k1::new();
        Ok(Self::from_secret(&secp, secret, for_script, None))
    }

    /// X-only public key as 64 hex characters.
    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.x_only.serialize())
    }

    /// Secret key as 64 hex characters. Only ever handed to the engine's
    /// signing calls or the export path.
    pub fn privkey_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    pub fn for_script(&self) -> bool {
        self.for_script
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Key-path P2TR address for this key on the given network.
    pub fn p2tr_address(&self, network: Network) -> String {
        let secp = Secp256k1::new();
        Address::p2tr(&secp, self.x_only, None, network).to_string()
    }

    /// Schnorr-sign a 32-byte digest. Output-key signing applies the Taproot
    /// key-path tweak; script keys sign untweaked.
    pub fn sign_schnorr(&self, digest: [u8; 32]) -> String {
        let secp = Secp256k1::new();
        let mut keypair = Keypair::from_secret_key(&secp, &self.secret);
        if !self.for_script {
            keypair = keypair.tap_tweak(&secp, None).to_inner();
        }
        let message = Message::from_digest(digest);
        let signature = secp.sign_schnorr(&message, &keypair);
        hex::encode(signature.serialize())
    }
}

/// An imported, non-derived keypair, identified by its P2TR address.
#[derive(Debug, Clone)]
pub struct ExternalKey {
    pub key: DerivedKey,
    pub address: String,
    /// Persisted representation: `"{enc_flag}/{hex-or-ciphertext}"`.
    pub stored_repr: String,
}

/// A bare collection root public key ("xord").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionKey {
    pub address: String,
    pub pub_key: String,
    pub tag: String,
}

/// The script and internal keys recovered for a historical collection root.
#[derive(Debug, Clone)]
pub struct CollectionRootKeys {
    pub script: DerivedKey,
    pub internal: DerivedKey,
    pub index: u32,
}

/// Ownership proof attached to addresses sent to the remote side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressChallenge {
    pub challenge: String,
    pub public_key: String,
    pub signature: String,
}

/// Owner of the root seed and all branch key derivation.
///
/// Derivation is deterministic: the same seed, path, and for-script flag
/// always produce byte-identical keys. The registry caches only the current
/// key of each branch; persisted indices are owned by the address book.
pub struct KeyRegistry {
    network: Network,
    secp: Secp256k1<All>,
    seed: Option<Vec<u8>>,
    master: Option<Xpriv>,
    branches: BTreeMap<WalletBranch, BranchState>,
    cached_keys: Vec<DerivedKey>,
    external_keys: Vec<ExternalKey>,
    collection_keys: Vec<CollectionKey>,
}

impl KeyRegistry {
    pub fn new(network: Network) -> Self {
        let branches = WalletBranch::ALL
            .iter()
            .map(|b| (*b, BranchState::default()))
            .collect();
        Self {
            network,
            secp: Secp256k1::new(),
            seed: None,
            master: None,
            branches,
            cached_keys: Vec::new(),
            external_keys: Vec::new(),
            collection_keys: Vec::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn has_seed(&self) -> bool {
        self.seed.is_some()
    }

    pub fn seed_hex(&self) -> Option<String> {
        self.seed.as_ref().map(hex::encode)
    }

    /// Install the root seed and build the master key. Clears all cached
    /// branch keys so they are re-derived from the new seed.
    pub fn set_seed(&mut self, seed: Vec<u8>) -> Result<(), WalletError> {
        let master = Xpriv::new_master(self.network, &seed)
            .map_err(|e| WalletError::Derivation(format!("failed to build master key: {e}")))?;
        info!("root key installed for network {:?}", self.network);
        self.seed = Some(seed);
        self.master = Some(master);
        for state in self.branches.values_mut() {
            state.key = None;
        }
        Ok(())
    }

    /// Drop all key material and registries. Used on wallet reset.
    pub fn clear(&mut self) {
        self.seed = None;
        self.master = None;
        for state in self.branches.values_mut() {
            *state = BranchState::default();
        }
        self.cached_keys.clear();
        self.external_keys.clear();
        self.collection_keys.clear();
    }

    fn master(&self) -> Result<&Xpriv, WalletError> {
        self.master
            .as_ref()
            .ok_or_else(|| WalletError::Derivation("seed is not set".into()))
    }

    /// Derivation path of a branch at an explicit index:
    /// `m/86'/{coin_type}'/{account}'/{change}/{index}`.
    pub fn path_at(&self, branch: WalletBranch, index: u32) -> String {
        let coin = if branch == WalletBranch::Auth {
            AUTH_SENTINEL
        } else {
            coin_type(self.network)
        };
        format!(
            "m/86'/{}'/{}'/{}/{}",
            coin,
            branch.account(),
            branch.change(),
            index
        )
    }

    /// Derivation path of a branch at its current index.
    pub fn path(&self, branch: WalletBranch) -> String {
        self.path_at(branch, self.branch_index(branch))
    }

    /// Derive a keypair at an explicit path. Deterministic; does not touch
    /// the branch cache.
    pub fn derive_path(&self, path: &str, for_script: bool) -> Result<DerivedKey, WalletError> {
        let master = self.master()?;
        let parsed = DerivationPath::from_str(path)
            .map_err(|e| WalletError::Derivation(format!("bad derivation path {path:?}: {e}")))?;
        let child = master
            .derive_priv(&self.secp, &parsed)
            .map_err(|e| WalletError::Derivation(format!("derivation at {path:?} failed: {e}")))?;
        debug!("derived key at {path} (for_script: {for_script})");
        Ok(DerivedKey::from_secret(
            &self.secp,
            child.private_key,
            for_script,
            Some(path.to_string()),
        ))
    }

    /// Derive the branch key at the branch's current index and cache it on
    /// the branch slot.
    pub fn derive_branch(&mut self, branch: WalletBranch) -> Result<DerivedKey, WalletError> {
        let path = self.path(branch);
        let key = self.derive_path(&path, branch.for_script())?;
        let state = self.branches.get_mut(&branch).ok_or_else(|| {
            WalletError::Derivation(format!("unrecognized wallet branch {branch}"))
        })?;
        state.key = Some(key.clone());
        Ok(key)
    }

    /// Derive a branch key at an arbitrary historical index. No caching.
    pub fn derive_at_index(
        &self,
        branch: WalletBranch,
        index: u32,
    ) -> Result<DerivedKey, WalletError> {
        let path = self.path_at(branch, index);
        self.derive_path(&path, branch.for_script())
    }

    /// The key cached for the branch's current index, if any.
    pub fn current_key(&self, branch: WalletBranch) -> Option<&DerivedKey> {
        self.branches.get(&branch).and_then(|s| s.key.as_ref())
    }

    pub fn branch_index(&self, branch: WalletBranch) -> u32 {
        self.branches.get(&branch).map(|s| s.index).unwrap_or(0)
    }

    /// Raise a branch index. Lowering is refused: indices only move forward.
    pub fn set_branch_index(&mut self, branch: WalletBranch, index: u32) -> bool {
        let state = match self.branches.get_mut(&branch) {
            Some(state) => state,
            None => return false,
        };
        if index <= state.index {
            return false;
        }
        state.index = index;
        state.key = None;
        true
    }

    /// Advance a branch to its next index, invalidating the cached key.
    /// Returns the new index.
    pub fn advance_index(&mut self, branch: WalletBranch) -> u32 {
        let state = self.branches.entry(branch).or_default();
        state.index += 1;
        state.key = None;
        state.index
    }

    /// Remember a one-off secret (e.g. the intermediate Taproot script key of
    /// a finished inscription build) so later lookups by address resolve it.
    pub fn add_key_to_cache(&mut self, secret_hex: &str) -> Result<(), WalletError> {
        let key = DerivedKey::from_secret_hex(secret_hex, true)?;
        if self
            .cached_keys
            .iter()
            .any(|k| k.pubkey_hex() == key.pubkey_hex())
        {
            return Ok(());
        }
        self.cached_keys.push(key);
        Ok(())
    }

    /// Find a key whose P2TR address matches, among branch keys and cached
    /// one-off keys.
    pub fn lookup_by_address(&self, address: &str) -> Option<&DerivedKey> {
        self.branches
            .values()
            .filter_map(|s| s.key.as_ref())
            .chain(self.cached_keys.iter())
            .find(|k| k.p2tr_address(self.network) == address)
    }

    /// P2TR address of a bare x-only public key.
    pub fn pubkey_to_p2tr(&self, pubkey_hex: &str) -> Result<String, WalletError> {
        let bytes = hex::decode(pubkey_hex)
            .map_err(|e| WalletError::Derivation(format!("malformed public key hex: {e}")))?;
        let x_only = XOnlyPublicKey::from_slice(&bytes)
            .map_err(|e| WalletError::Derivation(format!("invalid public key: {e}")))?;
        Ok(Address::p2tr(&self.secp, x_only, None, self.network).to_string())
    }

    /// Import an external keypair, de-duplicated by address. `stored_repr` is
    /// the representation persisted for restore (possibly encrypted).
    /// Returns whether the key was new.
    pub fn add_external_key(
        &mut self,
        privkey_hex: &str,
        stored_repr: String,
    ) -> Result<bool, WalletError> {
        let key = DerivedKey::from_secret_hex(privkey_hex, false)?;
        let address = key.p2tr_address(self.network);
        if self.external_keys.iter().any(|k| k.address == address) {
            return Ok(false);
        }
        info!("imported external key with address {address}");
        self.external_keys.push(ExternalKey {
            key,
            address,
            stored_repr,
        });
        Ok(true)
    }

    pub fn external_keys(&self) -> &[ExternalKey] {
        &self.external_keys
    }

    pub fn external_key_by_address(&self, address: &str) -> Option<&ExternalKey> {
        self.external_keys.iter().find(|k| k.address == address)
    }

    /// Register a collection root public key, de-duplicated by address.
    /// Returns whether the key was new.
    pub fn add_collection_key(&mut self, pub_key: &str, tag: String) -> Result<bool, WalletError> {
        let address = self.pubkey_to_p2tr(pub_key)?;
        if self.collection_keys.iter().any(|k| k.address == address) {
            return Ok(false);
        }
        self.collection_keys.push(CollectionKey {
            address,
            pub_key: pub_key.to_string(),
            tag,
        });
        Ok(true)
    }

    pub fn collection_keys(&self) -> &[CollectionKey] {
        &self.collection_keys
    }

    /// Search for the script/internal key pair whose combined collection
    /// Taproot key matches `target_pk`, walking indices from `max_index` down
    /// to 0 and returning on first match.
    ///
    /// This is a real linear scan, not a cache lookup: the collection root
    /// key is a function of two derived keys, so each step must re-derive
    /// both and recombine them through the engine. Worst case O(max_index)
    /// derivation pairs.
    pub fn find_collection_root(
        &self,
        engine: &dyn ContractEngine,
        collection_id: &str,
        target_pk: &str,
        max_index: u32,
    ) -> Result<Option<CollectionRootKeys>, WalletError> {
        for index in (0..=max_index).rev() {
            let script = self.derive_at_index(WalletBranch::Script, index)?;
            let internal = self.derive_at_index(WalletBranch::InternalScript, index)?;
            let combined = engine
                .collection_taproot_pubkey(
                    collection_id,
                    &script.pubkey_hex(),
                    &internal.pubkey_hex(),
                )
                .map_err(|e| WalletError::from_engine_message(e.0))?;
            if combined == target_pk {
                debug!("collection root key matched at index {index}");
                return Ok(Some(CollectionRootKeys {
                    script,
                    internal,
                    index,
                }));
            }
        }
        Ok(None)
    }

    /// Produce a signed ownership challenge for the given key.
    pub fn ownership_challenge(&self, key: &DerivedKey) -> AddressChallenge {
        let mut salt_bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = u64::from_be_bytes(salt_bytes);
        let challenge = format!(
            "Verify address salt: {} Requested at: {}",
            salt,
            unix_timestamp()
        );
        let digest = sha256d(&challenge);
        AddressChallenge {
            public_key: key.pubkey_hex(),
            signature: key.sign_schnorr(digest),
            challenge,
        }
    }
}
