//! Wallet service with an explicit, dependency-injected lifecycle
//!
//! This module handles:
//! - Opening a wallet against an engine and a storage backend
//! - Seed installation from a mnemonic phrase
//! - Key regeneration, index advancement, and remote reconciliation
//! - Balance ingestion and summary
//! - Password setup, verification, and wallet lock state
//!
//! The service is the single logical owner of all wallet state: every
//! mutation goes through `&mut self`, and at most one contract build is in
//! flight per instance. The contract flows live in [`contracts`].

mod contracts;

pub use contracts::{
    BuySwapTerms, CollectionReference, CommitBuyPayload, CommitBuyResult,
    CreateInscriptionPayload, InscriptionContractResult, SellContractVariant,
    SellInscriptionPayload, SellInscriptionResult, SignSwapPayload, SignSwapResult, SwapOrdTerms,
    UtxoRef, COMMIT_FUNDS_HEADROOM_SATS, DEFAULT_PROTOCOL_VERSION,
};

use std::sync::Arc;

use bip39::Mnemonic;
use bitcoin::Network;
use log::{info, warn};
use serde::Serialize;

use crate::addressbook::{AddressBook, AddressEntry, KeyBundle, RemoteAddressEntry};
use crate::coinselect;
use crate::crypto::WalletCrypto;
use crate::engine::ContractEngine;
use crate::error::WalletError;
use crate::keyring::{CollectionRootKeys, KeyRegistry, WalletBranch};
use crate::ledger::{sum_funds, sum_inscriptions, BalancesSnapshot, FundingUtxo, UtxoLedger};
use crate::storage::WalletStore;

/// How many times an unclassified build failure is retried before giving up.
const BUILD_RETRY_LIMIT: u32 = 3;

/// Wallet balance totals derived from the current ledger.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    /// Spendable, confirmed funding value
    pub confirmed: u64,
    /// Funding value still waiting in the queue (unconfirmed change)
    pub unconfirmed: u64,
    /// Value carried by inscription outputs
    pub used_for_inscriptions: u64,
    pub inscription_count: usize,
}

/// The wallet engine core. Owns the key registry, address book, and UTXO
/// ledger; collaborates with the injected contract engine and store.
pub struct WalletService {
    network: Network,
    registry: KeyRegistry,
    book: AddressBook,
    ledger: UtxoLedger,
    crypto: WalletCrypto,
    engine: Arc<dyn ContractEngine>,
    store: Arc<dyn WalletStore>,
    secret_token: Option<String>,
    encrypted: bool,
    build_retry_limit: u32,
}

impl WalletService {
    /// Open a wallet: load the seed, branch indices, imported keys, and
    /// password state from storage, then regenerate keys if a seed exists.
    pub async fn open(
        network: Network,
        engine: Arc<dyn ContractEngine>,
        store: Arc<dyn WalletStore>,
    ) -> Result<Self, WalletError> {
        info!("opening wallet on {network:?}");
        let mut registry = KeyRegistry::new(network);
        let book = AddressBook::new(Arc::clone(&store));

        if let Some(seed_hex) = store.seed().await? {
            let seed = hex::decode(&seed_hex)
                .map_err(|e| WalletError::Derivation(format!("stored seed is not hex: {e}")))?;
            registry.set_seed(seed)?;
        }

        for repr in store.external_keys().await? {
            match repr.split_once('/') {
                Some(("0", key_hex)) => {
                    registry.add_external_key(key_hex, repr.clone())?;
                }
                Some(("1", _)) => {
                    warn!("skipping password-encrypted external key until unlock");
                }
                _ => warn!("skipping malformed external key representation"),
            }
        }
        for collection in store.collection_keys().await? {
            registry.add_collection_key(&collection.pub_key, collection.tag)?;
        }

        book.restore_indices(&mut registry).await?;
        let secret_token = store.secret_token().await?;
        let encrypted = store.encrypted_flag().await?;

        let mut service = Self {
            network,
            registry,
            book,
            ledger: UtxoLedger::new(),
            crypto: WalletCrypto::new(),
            engine,
            store,
            secret_token,
            encrypted,
            build_retry_limit: BUILD_RETRY_LIMIT,
        };
        if service.registry.has_seed() {
            service.gen_keys()?;
        }
        Ok(service)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn has_seed(&self) -> bool {
        self.registry.has_seed()
    }

    /// Install the root seed from a mnemonic phrase and regenerate keys.
    /// Mnemonic validation beyond BIP-39 parsing is the caller's concern.
    pub async fn set_up_seed(
        &mut self,
        mnemonic: &str,
        passphrase: &str,
    ) -> Result<KeyBundle, WalletError> {
        let mnemonic = Mnemonic::parse_normalized(mnemonic)
            .map_err(|e| WalletError::Payload(format!("invalid mnemonic phrase: {e}")))?;
        let seed = mnemonic.to_seed(passphrase);
        self.registry.set_seed(seed.to_vec())?;
        self.store.set_seed(&hex::encode(seed)).await?;
        self.gen_keys()
    }

    /// Re-derive every branch's current key and rebuild the address list.
    pub fn gen_keys(&mut self) -> Result<KeyBundle, WalletError> {
        self.book.regenerate_all(&mut self.registry)
    }

    /// Advance one branch index by exactly one, persisting it.
    pub async fn generate_new_index(&mut self, branch: WalletBranch) -> Result<u32, WalletError> {
        if !self.registry.has_seed() {
            return Err(WalletError::Derivation("seed is not set".into()));
        }
        self.book.advance_index(&mut self.registry, branch).await
    }

    /// Advance several branch indices, then regenerate keys.
    pub async fn generate_new_indexes(
        &mut self,
        branches: &[WalletBranch],
    ) -> Result<KeyBundle, WalletError> {
        for branch in branches {
            self.generate_new_index(*branch).await?;
        }
        self.gen_keys()
    }

    /// Reconcile branch indices against the remote address list.
    pub async fn reconcile_indices(
        &mut self,
        remote: &[RemoteAddressEntry],
    ) -> Result<KeyBundle, WalletError> {
        self.book
            .reconcile_indices(&mut self.registry, remote)
            .await
    }

    /// Ingest a balances snapshot, rebuilding the funding and inscription
    /// sets.
    pub fn set_balances(&mut self, snapshot: BalancesSnapshot) -> Result<(), WalletError> {
        self.ledger.set_balances(&self.registry, snapshot)
    }

    /// Deterministic coin selection over the current funding set.
    pub fn select_keys_by_funds(
        &self,
        target: u64,
        exclude: &[(String, u32)],
        use_funds_in_queue: bool,
    ) -> Vec<FundingUtxo> {
        coinselect::select(target, &self.ledger.fundings, exclude, use_funds_in_queue)
    }

    pub fn balance_summary(&self) -> BalanceSummary {
        let available: u64 = self
            .ledger
            .fundings_by_flags(false, false)
            .iter()
            .map(|u| u.amount)
            .sum();
        let queued: u64 = self
            .ledger
            .fundings_by_flags(false, true)
            .iter()
            .map(|u| u.amount)
            .sum();
        BalanceSummary {
            confirmed: available,
            unconfirmed: queued,
            used_for_inscriptions: sum_inscriptions(&self.ledger.inscriptions),
            inscription_count: self.ledger.inscriptions.len(),
        }
    }

    /// Total funding value, regardless of flags.
    pub fn total_funds(&self) -> u64 {
        sum_funds(&self.ledger.fundings)
    }

    pub fn ledger(&self) -> &UtxoLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut UtxoLedger {
        &mut self.ledger
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn addresses(&self) -> &[AddressEntry] {
        self.book.entries()
    }

    /// Address entries with refreshed ownership challenges, for remote save.
    pub fn addresses_for_save(&mut self) -> Vec<AddressEntry> {
        self.book.entries_for_save(&self.registry)
    }

    /// Import an external private key, optionally encrypting its persisted
    /// representation under the given password. Returns whether it was new.
    pub async fn add_external_key(
        &mut self,
        privkey_hex: &str,
        password: Option<&str>,
    ) -> Result<bool, WalletError> {
        let stored_repr = match password {
            Some(password) => format!("1/{}", self.crypto.encrypt(privkey_hex, password)?),
            None => format!("0/{privkey_hex}"),
        };
        let added = self.registry.add_external_key(privkey_hex, stored_repr)?;
        if added {
            let reprs = self
                .registry
                .external_keys()
                .iter()
                .map(|k| k.stored_repr.clone())
                .collect();
            self.store.set_external_keys(reprs).await?;
            self.gen_keys()?;
        }
        Ok(added)
    }

    /// Register a collection root public key. Returns whether it was new.
    pub async fn add_collection_key(
        &mut self,
        pub_key: &str,
        tag: &str,
    ) -> Result<bool, WalletError> {
        let added = self.registry.add_collection_key(pub_key, tag.to_string())?;
        if added {
            self.store
                .set_collection_keys(self.registry.collection_keys().to_vec())
                .await?;
            self.gen_keys()?;
        }
        Ok(added)
    }

    /// Search for the script/internal key pair of a historical collection
    /// root. Linear in `max_index`; see the registry for the cost note.
    pub fn find_collection_root(
        &self,
        collection_id: &str,
        target_pk: &str,
        max_index: u32,
    ) -> Result<Option<CollectionRootKeys>, WalletError> {
        self.registry
            .find_collection_root(self.engine.as_ref(), collection_id, target_pk, max_index)
    }

    /// Set or rotate the wallet password. Overwrites the check token
    /// unconditionally.
    pub async fn set_up_password(&mut self, password: &str) -> Result<(), WalletError> {
        let token = self.crypto.make_check_token(password)?;
        self.store.set_secret_token(&token).await?;
        self.store.set_encrypted_flag(true).await?;
        self.secret_token = Some(token);
        self.encrypted = true;
        Ok(())
    }

    /// Verify a password against the stored check token. A wallet with no
    /// token set accepts any password, matching first-run behavior.
    pub fn check_password(&self, password: &str) -> bool {
        match &self.secret_token {
            Some(token) => self.crypto.verify_check_token(token, password),
            None => true,
        }
    }

    /// Lock the wallet under the given password if it is not already locked.
    pub async fn encrypt_wallet(&mut self, password: &str) -> Result<bool, WalletError> {
        if self.encrypted {
            return Ok(true);
        }
        self.set_up_password(password).await?;
        Ok(true)
    }

    /// Unlock the wallet. Returns false (and stays locked) on a wrong
    /// password.
    pub async fn decrypt_wallet(&mut self, password: &str) -> Result<bool, WalletError> {
        if !self.check_password(password) {
            warn!("wallet unlock rejected: wrong password");
            return Ok(false);
        }
        self.encrypted = false;
        self.store.set_encrypted_flag(false).await?;
        Ok(true)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Decrypt an external key's persisted representation for export.
    pub fn export_external_key(
        &self,
        address: &str,
        password: Option<&str>,
    ) -> Result<String, WalletError> {
        let external = self
            .registry
            .external_key_by_address(address)
            .ok_or_else(|| WalletError::Payload(format!("no external key for {address}")))?;
        match external.stored_repr.split_once('/') {
            Some(("1", ciphertext)) => {
                let password = password.ok_or(WalletError::WalletLocked)?;
                self.crypto.decrypt(ciphertext, password)
            }
            _ => Ok(external.key.privkey_hex()),
        }
    }

    /// Wipe all wallet state, in memory and in storage.
    pub async fn reset(&mut self) -> Result<(), WalletError> {
        info!("resetting wallet state");
        self.store.clear().await?;
        self.registry.clear();
        self.book.clear();
        self.ledger.clear();
        self.secret_token = None;
        self.encrypted = false;
        Ok(())
    }

    pub(crate) fn build_retry_limit(&self) -> u32 {
        self.build_retry_limit
    }

    pub(crate) fn engine(&self) -> &dyn ContractEngine {
        self.engine.as_ref()
    }

    pub(crate) fn registry_mut(&mut self) -> &mut KeyRegistry {
        &mut self.registry
    }

    pub(crate) async fn advance_after_signing(&mut self, branches: &[WalletBranch]) {
        for branch in branches {
            if let Err(e) = self.book.advance_index(&mut self.registry, *branch).await {
                warn!("failed to advance {branch} index after signing: {e}");
            }
        }
        if let Err(e) = self.gen_keys() {
            warn!("failed to regenerate keys after signing: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::ledger::{AddressBalance, FeedUtxo};
    use crate::storage::MemoryStore;

    const MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    async fn open_service() -> WalletService {
        WalletService::open(
            Network::Testnet,
            Arc::new(MockEngine::new()),
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_seed_setup_and_reopen() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(MockEngine::new());

        let mut service = WalletService::open(
            Network::Testnet,
            engine.clone() as Arc<dyn ContractEngine>,
            store.clone() as Arc<dyn WalletStore>,
        )
        .await
        .unwrap();
        assert!(!service.has_seed());

        let bundle = service.set_up_seed(MNEMONIC, "").await.unwrap();
        assert!(!bundle.addresses.is_empty());
        let fund_address = bundle.addresses[1].address.clone();

        // Reopening from the same store restores identical keys
        let reopened = WalletService::open(
            Network::Testnet,
            engine as Arc<dyn ContractEngine>,
            store as Arc<dyn WalletStore>,
        )
        .await
        .unwrap();
        assert!(reopened.has_seed());
        assert_eq!(reopened.addresses()[1].address, fund_address);
    }

    #[tokio::test]
    async fn test_invalid_mnemonic_rejected() {
        let mut service = open_service().await;
        assert!(matches!(
            service.set_up_seed("definitely not a mnemonic", "").await,
            Err(WalletError::Payload(_))
        ));
    }

    #[tokio::test]
    async fn test_password_lifecycle() {
        let mut service = open_service().await;
        assert!(!service.is_encrypted());
        // No token set: any password passes
        assert!(service.check_password("anything"));

        service.set_up_password("first").await.unwrap();
        assert!(service.is_encrypted());
        assert!(service.check_password("first"));
        assert!(!service.check_password("second"));

        // Rotation overwrites unconditionally
        service.set_up_password("second").await.unwrap();
        assert!(service.check_password("second"));
        assert!(!service.check_password("first"));

        assert!(!service.decrypt_wallet("wrong").await.unwrap());
        assert!(service.is_encrypted());
        assert!(service.decrypt_wallet("second").await.unwrap());
        assert!(!service.is_encrypted());
    }

    #[tokio::test]
    async fn test_balance_summary_from_snapshot() {
        let mut service = open_service().await;
        service.set_up_seed(MNEMONIC, "").await.unwrap();

        let key = service.registry().derive_path("m/86'/1'/1'/0/0", false).unwrap();
        let address = key.p2tr_address(Network::Testnet);
        let snapshot = BalancesSnapshot {
            addresses: vec![AddressBalance {
                address,
                index: "m/86'/1'/1'/0/0".into(),
                utxo_set: vec![
                    FeedUtxo {
                        txid: "a".repeat(64),
                        nout: 0,
                        amount: 10_000,
                        ..Default::default()
                    },
                    FeedUtxo {
                        txid: "b".repeat(64),
                        nout: 0,
                        amount: 700,
                        in_queue: true,
                        ..Default::default()
                    },
                ],
            }],
            my_inscriptions: vec![],
        };
        service.set_balances(snapshot).unwrap();

        let summary = service.balance_summary();
        assert_eq!(summary.confirmed, 10_000);
        assert_eq!(summary.unconfirmed, 700);
        assert_eq!(summary.used_for_inscriptions, 0);
    }

    #[tokio::test]
    async fn test_external_key_import_and_export() {
        let mut service = open_service().await;
        service.set_up_seed(MNEMONIC, "").await.unwrap();

        let secret = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        assert!(service.add_external_key(secret, None).await.unwrap());
        assert!(!service.add_external_key(secret, None).await.unwrap());

        let address = service.registry().external_keys()[0].address.clone();
        assert_eq!(service.export_external_key(&address, None).unwrap(), secret);

        // Encrypted import round-trips through the password
        let secret2 = "11223344556677889900aabbccddeeff00112233445566778899aabbccddee00";
        assert!(service
            .add_external_key(secret2, Some("pass"))
            .await
            .unwrap());
        let address2 = service
            .registry()
            .external_keys()
            .iter()
            .find(|k| k.stored_repr.starts_with("1/"))
            .unwrap()
            .address
            .clone();
        assert_eq!(
            service.export_external_key(&address2, Some("pass")).unwrap(),
            secret2
        );
        assert!(service.export_external_key(&address2, None).is_err());
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let store = Arc::new(MemoryStore::new());
        let mut service = WalletService::open(
            Network::Testnet,
            Arc::new(MockEngine::new()) as Arc<dyn ContractEngine>,
            store.clone() as Arc<dyn WalletStore>,
        )
        .await
        .unwrap();

        service.set_up_seed(MNEMONIC, "").await.unwrap();
        service.set_up_password("pw").await.unwrap();
        service.reset().await.unwrap();

        assert!(!service.has_seed());
        assert!(service.addresses().is_empty());
        assert!(!service.is_encrypted());
        assert_eq!(store.seed().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_generate_new_index_requires_seed() {
        let mut service = open_service().await;
        assert!(service.generate_new_index(WalletBranch::Ord).await.is_err());

        service.set_up_seed(MNEMONIC, "").await.unwrap();
        assert_eq!(
            service.generate_new_index(WalletBranch::Ord).await.unwrap(),
            1
        );
        assert_eq!(
            service.generate_new_index(WalletBranch::Ord).await.unwrap(),
            2
        );
    }
}
