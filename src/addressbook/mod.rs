//! Address book for wallet branches, external keys, and collection keys
//!
//! This module provides functionality for:
//! - Maintaining one current address entry per wallet branch
//! - Advancing branch derivation indices with forward-only persistence
//! - Reconciling local indices against the remote source of truth
//! - Routing remote external/collection entries to key imports

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::WalletError;
use crate::keyring::{KeyRegistry, WalletBranch};
use crate::storage::WalletStore;

/// What an address entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// A wallet branch's current receive address
    Branch(WalletBranch),
    /// An imported external key
    External,
    /// A collection root key ("xord")
    Collection,
}

impl AddressKind {
    /// Wire code used by the remote address list.
    pub fn code(&self) -> &'static str {
        match self {
            AddressKind::Branch(branch) => branch.code(),
            AddressKind::External => "ext",
            AddressKind::Collection => "xord",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "ext" => Some(AddressKind::External),
            "xord" => Some(AddressKind::Collection),
            other => WalletBranch::from_code(other).map(AddressKind::Branch),
        }
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Serialize the kind as its wire code.
impl Serialize for AddressKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for AddressKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        AddressKind::from_code(&code)
            .ok_or_else(|| D::Error::custom(format!("unknown address kind {code:?}")))
    }
}

/// One exposed wallet address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressEntry {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: AddressKind,
    /// Derivation path for branch addresses; import tag otherwise
    #[serde(rename = "index")]
    pub derivation_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Address entry as reported by the remote side during reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAddressEntry {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "index", default)]
    pub derivation_path: String,
    #[serde(default)]
    pub pub_key: Option<String>,
}

/// Result of a full key regeneration.
#[derive(Debug, Clone, Serialize)]
pub struct KeyBundle {
    pub addresses: Vec<AddressEntry>,
    /// Public keys of entries created by this regeneration
    pub public_keys: Vec<NewPublicKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewPublicKey {
    pub pub_key_str: String,
    pub branch: WalletBranch,
}

/// The authoritative list of addresses the wallet exposes, plus branch index
/// bookkeeping against the external store.
pub struct AddressBook {
    entries: Vec<AddressEntry>,
    store: Arc<dyn WalletStore>,
}

impl AddressBook {
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self {
            entries: Vec::new(),
            store,
        }
    }

    pub fn entries(&self) -> &[AddressEntry] {
        &self.entries
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.entries.iter().any(|e| e.address == address)
    }

    /// Re-derive every branch's current key and rebuild the entry list.
    /// Each branch keeps at most one live entry, overwritten in place so the
    /// list position is preserved; external and collection keys get one entry
    /// each. Returns the full list plus the public keys of new entries.
    pub fn regenerate_all(&mut self, registry: &mut KeyRegistry) -> Result<KeyBundle, WalletError> {
        let network = registry.network();
        let mut public_keys = Vec::new();

        for branch in WalletBranch::ALL {
            let key = registry.derive_branch(branch)?;
            // Auth keys are used for marketplace handshakes only and never
            // appear in the exposed address list.
            if branch == WalletBranch::Auth {
                continue;
            }
            let address = key.p2tr_address(network);
            let path = registry.path(branch);
            let kind = AddressKind::Branch(branch);

            match self.entries.iter().position(|e| e.kind == kind) {
                Some(position) => {
                    let entry = &mut self.entries[position];
                    entry.address = address;
                    entry.derivation_path = path;
                    entry.public_key = Some(key.pubkey_hex());
                }
                None => {
                    let challenge = registry.ownership_challenge(&key);
                    debug!("new {branch} address entry: {address}");
                    self.entries.push(AddressEntry {
                        address,
                        kind,
                        derivation_path: path,
                        public_key: Some(challenge.public_key.clone()),
                        challenge: Some(challenge.challenge),
                        signature: Some(challenge.signature),
                    });
                    public_keys.push(NewPublicKey {
                        pub_key_str: key.pubkey_hex(),
                        branch,
                    });
                }
            }
        }

        for external in registry.external_keys() {
            if !self.has_address(&external.address) {
                self.entries.push(AddressEntry {
                    address: external.address.clone(),
                    kind: AddressKind::External,
                    derivation_path: external.stored_repr.clone(),
                    public_key: Some(external.key.pubkey_hex()),
                    challenge: None,
                    signature: None,
                });
            }
        }

        for collection in registry.collection_keys() {
            if !self.has_address(&collection.address) {
                self.entries.push(AddressEntry {
                    address: collection.address.clone(),
                    kind: AddressKind::Collection,
                    derivation_path: collection.tag.clone(),
                    public_key: Some(collection.pub_key.clone()),
                    challenge: None,
                    signature: None,
                });
            }
        }

        Ok(KeyBundle {
            addresses: self.entries.clone(),
            public_keys,
        })
    }

    /// Advance a branch index by exactly one and persist it. Callers invoke
    /// this once per consumed key; every call advances further.
    pub async fn advance_index(
        &mut self,
        registry: &mut KeyRegistry,
        branch: WalletBranch,
    ) -> Result<u32, WalletError> {
        let index = registry.advance_index(branch);
        self.store.set_branch_index(branch, index).await?;
        info!("branch {branch} advanced to index {index}");
        Ok(index)
    }

    /// Load persisted branch indices into the registry, keeping whichever of
    /// the two is larger.
    pub async fn restore_indices(&self, registry: &mut KeyRegistry) -> Result<(), WalletError> {
        for branch in WalletBranch::ALL {
            let stored = self.store.branch_index(branch).await?;
            registry.set_branch_index(branch, stored);
        }
        Ok(())
    }

    /// Reconcile branch indices against the remote address list: every
    /// branch adopts `max(local, stored, remote)`, persisted forward-only.
    /// Remote external/collection entries are key imports, not index
    /// bookkeeping. Finishes with a full key regeneration.
    pub async fn reconcile_indices(
        &mut self,
        registry: &mut KeyRegistry,
        remote: &[RemoteAddressEntry],
    ) -> Result<KeyBundle, WalletError> {
        for branch in WalletBranch::ALL {
            let local = registry.branch_index(branch);
            let stored = self.store.branch_index(branch).await?;
            let remote_max = remote
                .iter()
                .filter(|entry| entry.kind == branch.code())
                .filter_map(|entry| entry.derivation_path.rsplit('/').next())
                .filter_map(|last| last.parse::<u32>().ok())
                .max()
                .unwrap_or(0);

            let target = local.max(stored).max(remote_max);
            if target > local {
                registry.set_branch_index(branch, target);
            }
            if target > stored {
                self.store.set_branch_index(branch, target).await?;
            }
        }

        for entry in remote {
            match AddressKind::from_code(&entry.kind) {
                Some(AddressKind::External) => self.import_remote_external(registry, entry)?,
                Some(AddressKind::Collection) => {
                    if let Some(pub_key) = &entry.pub_key {
                        registry.add_collection_key(pub_key, entry.derivation_path.clone())?;
                    } else {
                        warn!(
                            "collection entry {} has no public key; skipping import",
                            entry.address
                        );
                    }
                }
                Some(AddressKind::Branch(_)) => {}
                None => warn!("ignoring remote address of unknown kind {:?}", entry.kind),
            }
        }

        self.regenerate_all(registry)
    }

    /// Import a remote external-key entry. The stored representation is
    /// `"{enc_flag}/{hex-or-ciphertext}"`; encrypted keys cannot be restored
    /// without the wallet password and are skipped here.
    fn import_remote_external(
        &mut self,
        registry: &mut KeyRegistry,
        entry: &RemoteAddressEntry,
    ) -> Result<(), WalletError> {
        match entry.derivation_path.split_once('/') {
            Some(("0", key_hex)) => {
                registry.add_external_key(key_hex, entry.derivation_path.clone())?;
                Ok(())
            }
            Some(("1", _)) => {
                warn!(
                    "external key {} is password-encrypted; import it explicitly",
                    entry.address
                );
                Ok(())
            }
            _ => {
                warn!(
                    "malformed external key representation for {}",
                    entry.address
                );
                Ok(())
            }
        }
    }

    /// Entries destined for remote persistence, with refreshed ownership
    /// challenges on every branch entry.
    pub fn entries_for_save(&mut self, registry: &KeyRegistry) -> Vec<AddressEntry> {
        for entry in &mut self.entries {
            if let AddressKind::Branch(branch) = entry.kind {
                if let Some(key) = registry.current_key(branch) {
                    let challenge = registry.ownership_challenge(key);
                    entry.public_key = Some(challenge.public_key);
                    entry.challenge = Some(challenge.challenge);
                    entry.signature = Some(challenge.signature);
                }
            }
        }
        self.entries.clone()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use bitcoin::Network;

    const TEST_SEED: &str = "b37f263befa23efb352f0ba45a5e452363963fabc64c946a75df155244630ebaa1ac8056b873e79232486d5dd36809f8925c9c5ac8322f5380940badc64cc6fe";

    fn registry() -> KeyRegistry {
        let mut registry = KeyRegistry::new(Network::Testnet);
        registry.set_seed(hex::decode(TEST_SEED).unwrap()).unwrap();
        registry
    }

    fn book() -> AddressBook {
        AddressBook::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_regenerate_all_one_entry_per_branch() {
        let mut registry = registry();
        let mut book = book();

        let bundle = book.regenerate_all(&mut registry).unwrap();
        // Every branch except auth gets exactly one entry
        assert_eq!(bundle.addresses.len(), WalletBranch::ALL.len() - 1);
        assert_eq!(bundle.public_keys.len(), WalletBranch::ALL.len() - 1);
        assert!(!bundle
            .addresses
            .iter()
            .any(|e| e.kind == AddressKind::Branch(WalletBranch::Auth)));

        // Regenerating without index changes keeps the same entries in place
        let again = book.regenerate_all(&mut registry).unwrap();
        assert_eq!(again.addresses.len(), bundle.addresses.len());
        assert!(again.public_keys.is_empty());
        for (a, b) in bundle.addresses.iter().zip(again.addresses.iter()) {
            assert_eq!(a.address, b.address);
            assert_eq!(a.kind, b.kind);
        }
    }

    #[tokio::test]
    async fn test_advance_index_increments_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = registry();
        let mut book = AddressBook::new(Arc::clone(&store) as Arc<dyn WalletStore>);

        book.regenerate_all(&mut registry).unwrap();
        let fund_before = registry.current_key(WalletBranch::Fund).unwrap().pubkey_hex();

        assert_eq!(
            book.advance_index(&mut registry, WalletBranch::Fund)
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.branch_index(WalletBranch::Fund).await.unwrap(), 1);

        // Replacement happens in place: the fund entry keeps its position
        let bundle = book.regenerate_all(&mut registry).unwrap();
        let fund_pos = bundle
            .addresses
            .iter()
            .position(|e| e.kind == AddressKind::Branch(WalletBranch::Fund))
            .unwrap();
        assert_eq!(fund_pos, 1);
        let fund_after = registry.current_key(WalletBranch::Fund).unwrap().pubkey_hex();
        assert_ne!(fund_before, fund_after);
    }

    #[tokio::test]
    async fn test_reconcile_adopts_maximum_index() {
        let store = Arc::new(MemoryStore::new());
        store.set_branch_index(WalletBranch::Ord, 2).await.unwrap();

        let mut registry = registry();
        registry.set_branch_index(WalletBranch::Ord, 1);
        let mut book = AddressBook::new(Arc::clone(&store) as Arc<dyn WalletStore>);

        let remote = vec![RemoteAddressEntry {
            address: "tb1p-remote".into(),
            kind: "ord".into(),
            derivation_path: "m/86'/1'/2'/0/5".into(),
            pub_key: None,
        }];
        book.reconcile_indices(&mut registry, &remote).await.unwrap();

        assert_eq!(registry.branch_index(WalletBranch::Ord), 5);
        assert_eq!(store.branch_index(WalletBranch::Ord).await.unwrap(), 5);

        // A stale remote list never lowers an index
        let stale = vec![RemoteAddressEntry {
            address: "tb1p-remote".into(),
            kind: "ord".into(),
            derivation_path: "m/86'/1'/2'/0/3".into(),
            pub_key: None,
        }];
        book.reconcile_indices(&mut registry, &stale).await.unwrap();
        assert_eq!(registry.branch_index(WalletBranch::Ord), 5);
        assert_eq!(store.branch_index(WalletBranch::Ord).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_reconcile_routes_external_imports() {
        let mut registry = registry();
        let mut book = book();

        let secret = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let remote = vec![
            RemoteAddressEntry {
                address: "tb1p-ext".into(),
                kind: "ext".into(),
                derivation_path: format!("0/{secret}"),
                pub_key: None,
            },
            // Encrypted representations are skipped, not index-tracked
            RemoteAddressEntry {
                address: "tb1p-enc".into(),
                kind: "ext".into(),
                derivation_path: "1/deadbeef".into(),
                pub_key: None,
            },
        ];
        let bundle = book.reconcile_indices(&mut registry, &remote).await.unwrap();

        assert_eq!(registry.external_keys().len(), 1);
        assert!(bundle
            .addresses
            .iter()
            .any(|e| e.kind == AddressKind::External));
        // No branch index moved
        for branch in WalletBranch::ALL {
            assert_eq!(registry.branch_index(branch), 0);
        }
    }

    #[test]
    fn test_address_kind_codes() {
        assert_eq!(AddressKind::Branch(WalletBranch::Fund).code(), "fund");
        assert_eq!(AddressKind::External.code(), "ext");
        assert_eq!(AddressKind::Collection.code(), "xord");
        assert_eq!(
            AddressKind::from_code("scrsk"),
            Some(AddressKind::Branch(WalletBranch::Script))
        );
        assert_eq!(AddressKind::from_code("nope"), None);
    }
}
