//! UTXO ledger built from the remote balances snapshot
//!
//! This module handles:
//! - Typed snapshot structures for the external balances/indexer feed
//! - Deriving the funding and inscription UTXO sets from a snapshot
//! - Annotating every entry with its spending key via the key registry
//! - First-match lookups by address and by output

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::WalletError;
use crate::keyring::{DerivedKey, KeyRegistry};

/// One balances snapshot from the remote indexer, stored in full and replaced
/// wholesale on every update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancesSnapshot {
    /// Per-address UTXO sets
    #[serde(default)]
    pub addresses: Vec<AddressBalance>,
    /// Inscriptions the remote side attributes to this wallet, matched
    /// against UTXO-set entries by `(txid, nout)`
    #[serde(default)]
    pub my_inscriptions: Vec<InscriptionLocation>,
}

/// UTXO set of a single wallet address.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressBalance {
    pub address: String,
    /// Derivation path of the address, or an import tag for external keys
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub utxo_set: Vec<FeedUtxo>,
}

/// One output as reported by the balances feed. Amounts are satoshis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedUtxo {
    pub txid: String,
    pub nout: u32,
    pub amount: u64,
    #[serde(default)]
    pub is_inscription: bool,
    #[serde(default)]
    pub is_rune: bool,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub in_queue: bool,
}

/// Location metadata of an inscription owned by this wallet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InscriptionLocation {
    pub txid: String,
    pub nout: u32,
    #[serde(default)]
    pub owner_txid: Option<String>,
    #[serde(default)]
    pub owner_nout: Option<u32>,
    #[serde(default)]
    pub genesis_txid: Option<String>,
    #[serde(default)]
    pub genesis_nout: Option<u32>,
    #[serde(default)]
    pub creator_address: Option<String>,
}

/// A spendable, non-inscription output with its resolved spending key.
#[derive(Debug, Clone)]
pub struct FundingUtxo {
    pub txid: String,
    pub nout: u32,
    pub amount: u64,
    pub address: String,
    pub derivation_path: String,
    pub is_locked: bool,
    pub in_queue: bool,
    pub key: Option<DerivedKey>,
}

/// An inscription-bearing output owned by this wallet.
#[derive(Debug, Clone)]
pub struct InscriptionUtxo {
    pub txid: String,
    pub nout: u32,
    pub amount: u64,
    pub address: String,
    pub derivation_path: String,
    pub owner_txid: Option<String>,
    pub owner_nout: Option<u32>,
    pub genesis_txid: Option<String>,
    pub genesis_nout: Option<u32>,
    pub creator_address: Option<String>,
    pub key: Option<DerivedKey>,
}

/// Locally known funding and inscription UTXOs, rebuilt from each balances
/// snapshot.
#[derive(Default)]
pub struct UtxoLedger {
    pub fundings: Vec<FundingUtxo>,
    pub inscriptions: Vec<InscriptionUtxo>,
    snapshot: Option<BalancesSnapshot>,
}

impl UtxoLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the snapshot and rebuild both derived sets. An output lands in
    /// exactly one of the two sets; entries whose derivation path resolves to
    /// a key that does not encode back to the reported address are dropped
    /// with a logged skip.
    pub fn set_balances(
        &mut self,
        registry: &KeyRegistry,
        snapshot: BalancesSnapshot,
    ) -> Result<(), WalletError> {
        let mut fundings = Vec::new();
        let mut inscriptions = Vec::new();

        for entry in &snapshot.addresses {
            let key = match self.resolve_key(registry, &entry.index, &entry.address) {
                Ok(key) => key,
                Err(reason) => {
                    warn!(
                        "skipping UTXOs of address {}: {}",
                        entry.address, reason
                    );
                    continue;
                }
            };

            for utxo in &entry.utxo_set {
                if !utxo.is_inscription && !utxo.is_rune {
                    if utxo.is_locked {
                        continue;
                    }
                    fundings.push(FundingUtxo {
                        txid: utxo.txid.clone(),
                        nout: utxo.nout,
                        amount: utxo.amount,
                        address: entry.address.clone(),
                        derivation_path: entry.index.clone(),
                        is_locked: utxo.is_locked,
                        in_queue: utxo.in_queue,
                        key: key.clone(),
                    });
                } else {
                    let location = snapshot
                        .my_inscriptions
                        .iter()
                        .find(|l| l.txid == utxo.txid && l.nout == utxo.nout);
                    inscriptions.push(InscriptionUtxo {
                        txid: utxo.txid.clone(),
                        nout: utxo.nout,
                        amount: utxo.amount,
                        address: entry.address.clone(),
                        derivation_path: entry.index.clone(),
                        owner_txid: location.and_then(|l| l.owner_txid.clone()),
                        owner_nout: location.and_then(|l| l.owner_nout),
                        genesis_txid: location.and_then(|l| l.genesis_txid.clone()),
                        genesis_nout: location.and_then(|l| l.genesis_nout),
                        creator_address: location.and_then(|l| l.creator_address.clone()),
                        key: key.clone(),
                    });
                }
            }
        }

        debug!(
            "balances updated: {} funding UTXOs, {} inscription UTXOs",
            fundings.len(),
            inscriptions.len()
        );
        self.fundings = fundings;
        self.inscriptions = inscriptions;
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Resolve the spending key for an address entry. Branch addresses carry
    /// their derivation path; external keys are looked up by address.
    fn resolve_key(
        &self,
        registry: &KeyRegistry,
        path: &str,
        address: &str,
    ) -> Result<Option<DerivedKey>, String> {
        if path.starts_with("m/") {
            let key = registry
                .derive_path(path, false)
                .map_err(|e| e.to_string())?;
            let derived_address = key.p2tr_address(registry.network());
            if derived_address != address {
                return Err(format!(
                    "derived address {derived_address} does not match ledger address"
                ));
            }
            return Ok(Some(key));
        }
        if let Some(external) = registry.external_key_by_address(address) {
            return Ok(Some(external.key.clone()));
        }
        if let Some(key) = registry.lookup_by_address(address) {
            return Ok(Some(key.clone()));
        }
        Err("no key resolves to this address".into())
    }

    pub fn last_snapshot(&self) -> Option<&BalancesSnapshot> {
        self.snapshot.as_ref()
    }

    /// First funding UTXO at the given address. If duplicates exist, the
    /// first match wins; callers must not rely on any other ordering.
    pub fn find_funding_by_address(&self, address: &str) -> Option<&FundingUtxo> {
        self.fundings.iter().find(|u| u.address == address)
    }

    /// First funding UTXO with the given outpoint. First match wins.
    pub fn find_funding_by_output(&self, txid: &str, nout: u32) -> Option<&FundingUtxo> {
        self.fundings
            .iter()
            .find(|u| u.txid == txid && u.nout == nout)
    }

    /// First inscription UTXO at the given address. First match wins.
    pub fn find_inscription_by_address(&self, address: &str) -> Option<&InscriptionUtxo> {
        self.inscriptions.iter().find(|u| u.address == address)
    }

    /// First inscription UTXO with the given outpoint. First match wins.
    pub fn find_inscription_by_output(&self, txid: &str, nout: u32) -> Option<&InscriptionUtxo> {
        self.inscriptions
            .iter()
            .find(|u| u.txid == txid && u.nout == nout)
    }

    /// Funding UTXOs filtered by the locked/queued flags.
    pub fn fundings_by_flags(&self, locked: bool, in_queue: bool) -> Vec<&FundingUtxo> {
        self.fundings
            .iter()
            .filter(|u| u.is_locked == locked && u.in_queue == in_queue)
            .collect()
    }

    /// Record the change output of a just-built contract so chained builds
    /// can opt into spending it before confirmation.
    pub fn register_pending_change(
        &mut self,
        registry: &KeyRegistry,
        address: &str,
        txid: &str,
        nout: u32,
        amount: u64,
    ) {
        let key = registry.lookup_by_address(address).cloned();
        self.fundings.push(FundingUtxo {
            txid: txid.to_string(),
            nout,
            amount,
            address: address.to_string(),
            derivation_path: String::new(),
            is_locked: false,
            in_queue: true,
            key,
        });
    }

    /// Record the inscription output of a just-built contract.
    pub fn register_pending_ord(
        &mut self,
        registry: &KeyRegistry,
        address: &str,
        txid: &str,
        nout: u32,
        amount: u64,
    ) {
        let key = registry.lookup_by_address(address).cloned();
        self.inscriptions.push(InscriptionUtxo {
            txid: txid.to_string(),
            nout,
            amount,
            address: address.to_string(),
            derivation_path: String::new(),
            owner_txid: None,
            owner_nout: None,
            genesis_txid: None,
            genesis_nout: None,
            creator_address: None,
            key,
        });
    }

    pub fn clear(&mut self) {
        self.fundings.clear();
        self.inscriptions.clear();
        self.snapshot = None;
    }
}

/// Total value of a funding UTXO list.
pub fn sum_funds(utxos: &[FundingUtxo]) -> u64 {
    utxos.iter().map(|u| u.amount).sum()
}

/// Total value carried by inscription UTXOs.
pub fn sum_inscriptions(utxos: &[InscriptionUtxo]) -> u64 {
    utxos.iter().map(|u| u.amount).sum()
}
