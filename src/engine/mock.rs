//! Deterministic in-memory contract engine used by the test suites
//!
//! The mock reproduces the engine's observable behavior closely enough for
//! flow tests: funding estimates that grow with committed inputs and present
//! signatures, phase-tag checks on deserialized contracts, tagged error text,
//! and native-object accounting. Fee numbers are synthetic but deterministic.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{
    ContractEngine, ContractPhase, EngineError, EngineResult, FundingOptions, InscribeKind,
    InscriptionContract, SwapContract,
};
use crate::util::{btc_string_to_sat, sat_to_btc_string};

const TX_BASE_VSIZE: u64 = 200;
const INPUT_VSIZE: u64 = 58;
const CHANGE_VSIZE: u64 = 43;
const COLLECTION_VSIZE: u64 = 160;
const SIG_VSIZE_PER_INPUT: u64 = 16;
const GENESIS_BASE_VSIZE: u64 = 100;

const SWAP_BASE_FEE: u64 = 750;
const SWAP_INPUT_FEE: u64 = 600;
const SWAP_INPUT_SIG_FEE: u64 = 100;

/// Mock transaction-construction engine.
///
/// Tracks every contract object it hands out; [`MockEngine::live_contracts`]
/// must read zero once a flow has finished, mirroring the mandatory release
/// of native objects.
#[derive(Clone, Default)]
pub struct MockEngine {
    live: Arc<AtomicUsize>,
    fail_queue: Arc<Mutex<VecDeque<String>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of contract objects currently alive.
    pub fn live_contracts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Queue an error to be raised by the next contract construction.
    pub fn fail_next_build(&self, message: impl Into<String>) {
        self.fail_queue.lock().unwrap().push_back(message.into());
    }

    fn take_injected_failure(&self) -> Option<String> {
        self.fail_queue.lock().unwrap().pop_front()
    }
}

impl ContractEngine for MockEngine {
    fn new_inscription(
        &self,
        kind: InscribeKind,
        expect_amount_btc: &str,
    ) -> EngineResult<Box<dyn InscriptionContract>> {
        if let Some(message) = self.take_injected_failure() {
            return Err(EngineError(message));
        }
        let expect_amount = btc_string_to_sat(expect_amount_btc)
            .map_err(|e| EngineError(format!("ContractTermWrongFormat: {e}")))?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockInscription {
            live: Arc::clone(&self.live),
            kind,
            expect_amount,
            market_fee: 0,
            fee_rate: None,
            content: None,
            metadata: None,
            script_pk: None,
            internal_pk: None,
            inscribe_addr: None,
            change_addr: None,
            collection: None,
            utxos: Vec::new(),
            commit_sigs: BTreeMap::new(),
            collection_sig: None,
            inscription_sig: None,
            contract: None,
        }))
    }

    fn new_swap(
        &self,
        ord_price_btc: &str,
        market_fee_btc: &str,
    ) -> EngineResult<Box<dyn SwapContract>> {
        if let Some(message) = self.take_injected_failure() {
            return Err(EngineError(message));
        }
        let ord_price = btc_string_to_sat(ord_price_btc)
            .map_err(|e| EngineError(format!("ContractTermWrongFormat: {e}")))?;
        let market_fee = btc_string_to_sat(market_fee_btc)
            .map_err(|e| EngineError(format!("ContractTermWrongFormat: {e}")))?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSwap {
            live: Arc::clone(&self.live),
            ord_price,
            market_fee,
            contract: None,
            loaded_phase: None,
            ord: None,
            funds: Vec::new(),
            funds_payoff_addr: None,
            ord_payoff_addr: None,
            change_addr: None,
            script_pk_a: None,
            script_pk_b: None,
            ord_swap_sig: None,
            funds_commit_sigs: BTreeMap::new(),
            funds_swap_sig: None,
        }))
    }

    fn collection_taproot_pubkey(
        &self,
        inscription_id: &str,
        script_pk: &str,
        internal_pk: &str,
    ) -> EngineResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(inscription_id.as_bytes());
        hasher.update(script_pk.as_bytes());
        hasher.update(internal_pk.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

struct MockUtxo {
    txid: String,
    nout: u32,
    amount: u64,
    address: String,
}

struct MockInscription {
    live: Arc<AtomicUsize>,
    kind: InscribeKind,
    expect_amount: u64,
    market_fee: u64,
    fee_rate: Option<u64>,
    content: Option<(String, String)>,
    metadata: Option<String>,
    script_pk: Option<String>,
    internal_pk: Option<String>,
    inscribe_addr: Option<String>,
    change_addr: Option<String>,
    collection: Option<Value>,
    utxos: Vec<MockUtxo>,
    commit_sigs: BTreeMap<u32, String>,
    collection_sig: Option<String>,
    inscription_sig: Option<String>,
    contract: Option<Value>,
}

impl MockInscription {
    fn content_bytes(&self) -> u64 {
        self.content
            .as_ref()
            .map(|(_, hex)| (hex.len() / 2) as u64)
            .unwrap_or(0)
    }

    fn fee_rate(&self) -> EngineResult<u64> {
        self.fee_rate
            .ok_or_else(|| EngineError("ContractStateError: mining fee rate is not set".into()))
    }
}

impl Drop for MockInscription {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InscriptionContract for MockInscription {
    fn deserialize(&mut self, contract_json: &str, phase: ContractPhase) -> EngineResult<()> {
        let value: Value = serde_json::from_str(contract_json)
            .map_err(|e| EngineError(format!("ContractTermWrongFormat: {e}")))?;
        if let Some(tag) = value.get("phase").and_then(Value::as_str) {
            if tag != phase.tag() {
                return Err(EngineError(format!(
                    "ContractProtocolError: expected {} contract, got {}",
                    phase.tag(),
                    tag
                )));
            }
        }
        if let Some(fee) = value
            .pointer("/params/market_fee/amount")
            .and_then(Value::as_u64)
        {
            self.market_fee = fee;
        }
        self.contract = Some(value);
        Ok(())
    }

    fn supported_versions(&self) -> Vec<u32> {
        vec![8]
    }

    fn mining_fee_rate(&mut self, rate_btc: &str) -> EngineResult<()> {
        let rate = btc_string_to_sat(rate_btc)
            .map_err(|e| EngineError(format!("ContractTermWrongFormat: {e}")))?;
        self.fee_rate = Some(rate);
        Ok(())
    }

    fn data(&mut self, content_type: &str, content_hex: &str) -> EngineResult<()> {
        if content_hex.len() % 2 != 0 || !content_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EngineError("ContractTermWrongFormat: content".into()));
        }
        self.content = Some((content_type.to_string(), content_hex.to_string()));
        Ok(())
    }

    fn meta_data(&mut self, metadata_hex: &str) -> EngineResult<()> {
        self.metadata = Some(metadata_hex.to_string());
        Ok(())
    }

    fn inscribe_script_pubkey(&mut self, pubkey_hex: &str) -> EngineResult<()> {
        self.script_pk = Some(pubkey_hex.to_string());
        Ok(())
    }

    fn inscribe_internal_pubkey(&mut self, pubkey_hex: &str) -> EngineResult<()> {
        self.internal_pk = Some(pubkey_hex.to_string());
        Ok(())
    }

    fn inscribe_address(&mut self, address: &str) -> EngineResult<()> {
        self.inscribe_addr = Some(address.to_string());
        Ok(())
    }

    fn change_address(&mut self, address: &str) -> EngineResult<()> {
        self.change_addr = Some(address.to_string());
        Ok(())
    }

    fn add_to_collection(
        &mut self,
        collection_id: &str,
        owner_txid: &str,
        owner_nout: u32,
        amount_btc: &str,
        owner_address: &str,
    ) -> EngineResult<()> {
        let amount = btc_string_to_sat(amount_btc)
            .map_err(|e| EngineError(format!("ContractTermWrongFormat: {e}")))?;
        self.collection = Some(json!({
            "collection_id": collection_id,
            "owner_txid": owner_txid,
            "owner_nout": owner_nout,
            "amount": amount,
            "owner_address": owner_address,
        }));
        Ok(())
    }

    fn add_utxo(
        &mut self,
        txid: &str,
        nout: u32,
        amount_btc: &str,
        address: &str,
    ) -> EngineResult<()> {
        let amount = btc_string_to_sat(amount_btc)
            .map_err(|e| EngineError(format!("ContractTermWrongFormat: {e}")))?;
        self.utxos.push(MockUtxo {
            txid: txid.to_string(),
            nout,
            amount,
            address: address.to_string(),
        });
        Ok(())
    }

    fn sign_commit(
        &mut self,
        index: u32,
        privkey_hex: &str,
        _script_pubkey_hex: &str,
    ) -> EngineResult<()> {
        if index as usize >= self.utxos.len() {
            return Err(EngineError(format!(
                "ContractTermWrongValue: no utxo at input index {index}"
            )));
        }
        if privkey_hex.len() != 64 {
            return Err(EngineError("KeyError: malformed secret key".into()));
        }
        self.commit_sigs.insert(index, format!("commit-sig-{index}"));
        Ok(())
    }

    fn sign_collection(&mut self, privkey_hex: &str) -> EngineResult<()> {
        if self.collection.is_none() {
            return Err(EngineError("ContractStateError: no collection attached".into()));
        }
        if privkey_hex.len() != 64 {
            return Err(EngineError("KeyError: malformed secret key".into()));
        }
        self.collection_sig = Some("collection-sig".into());
        Ok(())
    }

    fn sign_inscription(&mut self, script_privkey_hex: &str) -> EngineResult<()> {
        if self.script_pk.is_none() {
            return Err(EngineError("ContractTermMissing: inscribe_script_pk".into()));
        }
        if script_privkey_hex.len() != 64 {
            return Err(EngineError("KeyError: malformed secret key".into()));
        }
        self.inscription_sig = Some("inscription-sig".into());
        Ok(())
    }

    fn min_funding_amount(&self, options: FundingOptions) -> EngineResult<String> {
        let rate = self.fee_rate()?;
        if self.content.is_none() {
            return Err(EngineError("ContractTermMissing: content".into()));
        }
        let mut vsize = TX_BASE_VSIZE
            + self.content_bytes() / 4
            + self.utxos.len() as u64 * INPUT_VSIZE;
        if options.has_collection() {
            vsize += COLLECTION_VSIZE;
        }
        if options.has_change() {
            vsize += CHANGE_VSIZE;
        }
        if self.inscription_sig.is_some() {
            vsize += self.utxos.len().max(1) as u64 * SIG_VSIZE_PER_INPUT;
        }
        let fee = rate * vsize / 1000;
        Ok(sat_to_btc_string(self.expect_amount + self.market_fee + fee))
    }

    fn genesis_tx_mining_fee(&self) -> EngineResult<String> {
        let rate = self.fee_rate()?;
        let fee = rate * (GENESIS_BASE_VSIZE + self.content_bytes() / 4) / 1000;
        Ok(sat_to_btc_string(fee))
    }

    fn intermediate_taproot_seckey(&self) -> EngineResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(b"intermediate-taproot-sk");
        if let Some((_, content)) = &self.content {
            hasher.update(content.as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn make_inscription_id(&self) -> EngineResult<String> {
        let txid = self
            .utxos
            .first()
            .map(|u| u.txid.clone())
            .unwrap_or_else(|| "0".repeat(64));
        Ok(format!("{txid}i0"))
    }

    fn serialize(&self, version: u32, phase: ContractPhase) -> EngineResult<String> {
        if phase == ContractPhase::InscriptionSignature && self.inscription_sig.is_none() {
            return Err(EngineError(
                "ContractStateError: inscription is not signed".into(),
            ));
        }
        let inputs: Vec<Value> = self
            .utxos
            .iter()
            .enumerate()
            .map(|(i, u)| {
                json!({
                    "txid": u.txid,
                    "nout": u.nout,
                    "amount": u.amount,
                    "address": u.address,
                    "signature": self.commit_sigs.get(&(i as u32)),
                })
            })
            .collect();
        Ok(json!({
            "contract_type": "CreateInscription",
            "market_terms": self.contract,
            "params": {
                "protocol_version": version,
                "phase": phase.tag(),
                "kind": format!("{:?}", self.kind),
                "ord_amount": self.expect_amount,
                "market_fee": { "amount": self.market_fee },
                "content_type": self.content.as_ref().map(|(t, _)| t.clone()),
                "metadata": self.metadata,
                "inscribe_script_pk": self.script_pk,
                "inscribe_int_pk": self.internal_pk,
                "inscribe_address": self.inscribe_addr,
                "change_address": self.change_addr,
                "collection": self.collection,
                "utxo": inputs,
                "collection_sig": self.collection_sig,
                "inscription_sig": self.inscription_sig,
            }
        })
        .to_string())
    }
}

struct MockSwap {
    live: Arc<AtomicUsize>,
    ord_price: u64,
    market_fee: u64,
    contract: Option<Value>,
    loaded_phase: Option<String>,
    ord: Option<MockUtxo>,
    funds: Vec<MockUtxo>,
    funds_payoff_addr: Option<String>,
    ord_payoff_addr: Option<String>,
    change_addr: Option<String>,
    script_pk_a: Option<String>,
    script_pk_b: Option<String>,
    ord_swap_sig: Option<String>,
    funds_commit_sigs: BTreeMap<u32, String>,
    funds_swap_sig: Option<String>,
}

impl Drop for MockSwap {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SwapContract for MockSwap {
    fn deserialize(&mut self, contract_json: &str, phase: ContractPhase) -> EngineResult<()> {
        let value: Value = serde_json::from_str(contract_json)
            .map_err(|e| EngineError(format!("ContractTermWrongFormat: {e}")))?;
        if let Some(tag) = value.pointer("/params/phase").and_then(Value::as_str) {
            if tag != phase.tag() {
                return Err(EngineError(format!(
                    "ContractProtocolError: expected {} contract, got {}",
                    phase.tag(),
                    tag
                )));
            }
        }
        if let Some(price) = value.pointer("/params/ord_price").and_then(Value::as_u64) {
            self.ord_price = price;
        }
        if let Some(fee) = value
            .pointer("/params/market_fee/amount")
            .and_then(Value::as_u64)
        {
            self.market_fee = fee;
        }
        self.loaded_phase = Some(phase.tag().to_string());
        self.contract = Some(value);
        Ok(())
    }

    fn check_contract_terms(&self, phase: ContractPhase) -> EngineResult<()> {
        match &self.loaded_phase {
            Some(tag) if tag == phase.tag() => Ok(()),
            Some(tag) => Err(EngineError(format!(
                "ContractProtocolError: expected {} contract, got {}",
                phase.tag(),
                tag
            ))),
            None => Err(EngineError(
                "ContractStateError: no contract deserialized".into(),
            )),
        }
    }

    fn supported_versions(&self) -> Vec<u32> {
        vec![8]
    }

    fn ord_utxo(
        &mut self,
        txid: &str,
        nout: u32,
        amount_btc: &str,
        address: &str,
    ) -> EngineResult<()> {
        let amount = btc_string_to_sat(amount_btc)
            .map_err(|e| EngineError(format!("ContractTermWrongFormat: {e}")))?;
        self.ord = Some(MockUtxo {
            txid: txid.to_string(),
            nout,
            amount,
            address: address.to_string(),
        });
        Ok(())
    }

    fn add_funds_utxo(
        &mut self,
        txid: &str,
        nout: u32,
        amount_btc: &str,
        address: &str,
    ) -> EngineResult<()> {
        let amount = btc_string_to_sat(amount_btc)
            .map_err(|e| EngineError(format!("ContractTermWrongFormat: {e}")))?;
        self.funds.push(MockUtxo {
            txid: txid.to_string(),
            nout,
            amount,
            address: address.to_string(),
        });
        Ok(())
    }

    fn funds_payoff_address(&mut self, address: &str) -> EngineResult<()> {
        self.funds_payoff_addr = Some(address.to_string());
        Ok(())
    }

    fn ord_payoff_address(&mut self, address: &str) -> EngineResult<()> {
        self.ord_payoff_addr = Some(address.to_string());
        Ok(())
    }

    fn change_address(&mut self, address: &str) -> EngineResult<()> {
        self.change_addr = Some(address.to_string());
        Ok(())
    }

    fn swap_script_pubkey_a(&mut self, pubkey_hex: &str) -> EngineResult<()> {
        self.script_pk_a = Some(pubkey_hex.to_string());
        Ok(())
    }

    fn swap_script_pubkey_b(&mut self, pubkey_hex: &str) -> EngineResult<()> {
        self.script_pk_b = Some(pubkey_hex.to_string());
        Ok(())
    }

    fn sign_ord_swap(&mut self, privkey_hex: &str) -> EngineResult<()> {
        if self.ord.is_none() {
            return Err(EngineError("ContractStateError: ord utxo is not set".into()));
        }
        if privkey_hex.len() != 64 {
            return Err(EngineError("KeyError: malformed secret key".into()));
        }
        self.ord_swap_sig = Some("ord-swap-sig".into());
        Ok(())
    }

    fn sign_funds_commitment(&mut self, index: u32, privkey_hex: &str) -> EngineResult<()> {
        if index as usize >= self.funds.len() {
            return Err(EngineError(format!(
                "ContractTermWrongValue: no funds utxo at input index {index}"
            )));
        }
        if privkey_hex.len() != 64 {
            return Err(EngineError("KeyError: malformed secret key".into()));
        }
        self.funds_commit_sigs
            .insert(index, format!("funds-commit-sig-{index}"));
        Ok(())
    }

    fn sign_funds_swap(&mut self, privkey_hex: &str) -> EngineResult<()> {
        if privkey_hex.len() != 64 {
            return Err(EngineError("KeyError: malformed secret key".into()));
        }
        self.funds_swap_sig = Some("funds-swap-sig".into());
        Ok(())
    }

    fn min_funding_amount(&self) -> EngineResult<String> {
        let mut amount = self.ord_price + self.market_fee + SWAP_BASE_FEE;
        amount += self.funds.len() as u64 * SWAP_INPUT_FEE;
        amount += self.funds_commit_sigs.len() as u64 * SWAP_INPUT_SIG_FEE;
        Ok(sat_to_btc_string(amount))
    }

    fn serialize(&self, version: u32, phase: ContractPhase) -> EngineResult<String> {
        let funds: Vec<Value> = self
            .funds
            .iter()
            .enumerate()
            .map(|(i, u)| {
                json!({
                    "txid": u.txid,
                    "nout": u.nout,
                    "amount": u.amount,
                    "address": u.address,
                    "signature": self.funds_commit_sigs.get(&(i as u32)),
                })
            })
            .collect();
        Ok(json!({
            "contract_type": "SwapInscription",
            "terms": self.contract,
            "params": {
                "protocol_version": version,
                "phase": phase.tag(),
                "ord_price": self.ord_price,
                "market_fee": { "amount": self.market_fee },
                "ord_utxo": self.ord.as_ref().map(|u| json!({
                    "txid": u.txid,
                    "nout": u.nout,
                    "amount": u.amount,
                    "address": u.address,
                })),
                "funds_utxo": funds,
                "funds_payoff_address": self.funds_payoff_addr,
                "ord_payoff_address": self.ord_payoff_addr,
                "change_address": self.change_addr,
                "swap_script_pk_a": self.script_pk_a,
                "swap_script_pk_b": self.script_pk_b,
                "ord_swap_sig": self.ord_swap_sig,
                "funds_swap_sig": self.funds_swap_sig,
            }
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_objects_are_released() {
        let engine = MockEngine::new();
        {
            let _contract = engine
                .new_inscription(InscribeKind::Inscription, "0.00001000")
                .unwrap();
            assert_eq!(engine.live_contracts(), 1);
        }
        assert_eq!(engine.live_contracts(), 0);
    }

    #[test]
    fn test_min_funding_grows_after_signing() {
        let engine = MockEngine::new();
        let mut contract = engine
            .new_inscription(InscribeKind::Inscription, "0.00001000")
            .unwrap();
        contract.mining_fee_rate("0.00001000").unwrap();
        contract.data("text/plain", "00ff").unwrap();
        contract.inscribe_script_pubkey(&"ab".repeat(32)).unwrap();
        contract
            .add_utxo(&"11".repeat(32), 0, "0.00010000", "tb1p-test")
            .unwrap();

        let before = btc_string_to_sat(
            &contract.min_funding_amount(FundingOptions::None).unwrap(),
        )
        .unwrap();
        contract.sign_commit(0, &"22".repeat(32), "51").unwrap();
        contract.sign_inscription(&"33".repeat(32)).unwrap();
        let after = btc_string_to_sat(
            &contract.min_funding_amount(FundingOptions::None).unwrap(),
        )
        .unwrap();
        assert!(after > before, "signatures must increase the estimate");
    }

    #[test]
    fn test_swap_phase_checks() {
        let engine = MockEngine::new();
        let mut swap = engine.new_swap("0.00005000", "0.00000500").unwrap();
        let contract = json!({
            "contract_type": "SwapInscription",
            "params": { "protocol_version": 8, "phase": "FUNDS_TERMS" }
        })
        .to_string();
        // Deserializing under the wrong phase tag fails with a protocol error
        let err = swap
            .deserialize(&contract, ContractPhase::OrdTerms)
            .unwrap_err();
        assert!(err.0.contains("ContractProtocolError"));
        swap.deserialize(&contract, ContractPhase::FundsTerms).unwrap();
        swap.check_contract_terms(ContractPhase::FundsTerms).unwrap();
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let engine = MockEngine::new();
        engine.fail_next_build("transient wasm load failure");
        assert!(engine
            .new_inscription(InscribeKind::Inscription, "0.00001000")
            .is_err());
        // The failed construction must not leak a live object
        assert_eq!(engine.live_contracts(), 0);
        let contract = engine.new_inscription(InscribeKind::Inscription, "0.00001000");
        assert!(contract.is_ok());
        assert_eq!(engine.live_contracts(), 1);
    }
}
