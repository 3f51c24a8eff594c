//! Ordvault - a non-custodial HD wallet engine for Bitcoin Taproot
//! inscriptions
//!
//! The crate covers the wallet core behind an inscription marketplace:
//! deterministic key derivation over purpose-specific branches, UTXO
//! bookkeeping and coin selection, and the staged construction and signing
//! of inscription and swap contracts against an external
//! transaction-construction engine.
//!
//! The UI shell, storage backend, balances indexer, and the contract engine
//! itself are external collaborators reached through the narrow interfaces
//! in [`storage`], [`ledger`], and [`engine`].

pub mod addressbook;
pub mod coinselect;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod keyring;
pub mod ledger;
pub mod network;
pub mod service;
pub mod storage;
pub mod util;
pub mod watchdog;

pub use addressbook::{AddressBook, AddressEntry, AddressKind, KeyBundle, RemoteAddressEntry};
pub use error::WalletError;
pub use keyring::{DerivedKey, KeyRegistry, WalletBranch};
pub use ledger::{BalancesSnapshot, FundingUtxo, InscriptionUtxo, UtxoLedger};
pub use service::{BalanceSummary, WalletService};
pub use storage::{FileStore, MemoryStore, WalletStore};
