//! Shared harness for the contract flow tests

use std::sync::Arc;

use bitcoin::Network;
use ordvault::engine::mock::MockEngine;
use ordvault::engine::ContractEngine;
use ordvault::ledger::{AddressBalance, BalancesSnapshot, FeedUtxo, InscriptionLocation};
use ordvault::storage::{MemoryStore, WalletStore};
use ordvault::WalletService;

pub const MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

pub const FUND_PATH: &str = "m/86'/1'/1'/0/0";
pub const ORD_PATH: &str = "m/86'/1'/2'/0/0";

/// Open a testnet wallet over the mock engine with the seed installed.
pub async fn open_wallet() -> (Arc<MockEngine>, WalletService) {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = Arc::new(MockEngine::new());
    let mut service = WalletService::open(
        Network::Testnet,
        Arc::clone(&engine) as Arc<dyn ContractEngine>,
        Arc::new(MemoryStore::new()) as Arc<dyn WalletStore>,
    )
    .await
    .expect("wallet must open");
    service.set_up_seed(MNEMONIC, "").await.expect("seed setup");
    (engine, service)
}

/// Current fund-branch address of the wallet.
pub fn fund_address(service: &WalletService) -> String {
    service
        .registry()
        .derive_path(FUND_PATH, false)
        .unwrap()
        .p2tr_address(Network::Testnet)
}

/// Current ord-branch address of the wallet.
pub fn ord_address(service: &WalletService) -> String {
    service
        .registry()
        .derive_path(ORD_PATH, false)
        .unwrap()
        .p2tr_address(Network::Testnet)
}

/// A balances snapshot with one funding UTXO per amount, all at the current
/// fund address.
pub fn funding_snapshot(service: &WalletService, amounts: &[u64]) -> BalancesSnapshot {
    BalancesSnapshot {
        addresses: vec![AddressBalance {
            address: fund_address(service),
            index: FUND_PATH.to_string(),
            utxo_set: amounts
                .iter()
                .enumerate()
                .map(|(i, amount)| FeedUtxo {
                    txid: format!("{:0>64}", i + 1),
                    nout: 0,
                    amount: *amount,
                    ..Default::default()
                })
                .collect(),
        }],
        my_inscriptions: vec![],
    }
}

/// Add an owned inscription UTXO to a snapshot, at the current ord address.
pub fn add_inscription(
    snapshot: &mut BalancesSnapshot,
    service: &WalletService,
    txid: &str,
    nout: u32,
    amount: u64,
) {
    snapshot.addresses.push(AddressBalance {
        address: ord_address(service),
        index: ORD_PATH.to_string(),
        utxo_set: vec![FeedUtxo {
            txid: txid.to_string(),
            nout,
            amount,
            is_inscription: true,
            ..Default::default()
        }],
    });
    snapshot.my_inscriptions.push(InscriptionLocation {
        txid: txid.to_string(),
        nout,
        genesis_txid: Some("9".repeat(64)),
        genesis_nout: Some(0),
        ..Default::default()
    });
}
