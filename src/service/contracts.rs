//! Staged contract construction and signing flows
//!
//! This module handles:
//! - The create-inscription flow (plain and collection-linked)
//! - The sell-side swap signing flow over counterparty fee variants
//! - The buy-side funds commitment and final swap signature flows
//! - The bounded retry policy around unclassified engine failures
//!
//! Every public flow returns a result struct carrying either populated
//! contract data or a non-null `error_message`, never both and never
//! neither; nothing panics across this boundary. Engine contract objects
//! are boxed handles released on drop, so every path out of a flow, success
//! or failure, releases its native resources.

use std::str::FromStr;

use bitcoin::{Address, Network};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::WalletService;
use crate::coinselect;
use crate::engine::{ContractPhase, FundingOptions, InscribeKind};
use crate::error::WalletError;
use crate::keyring::{DerivedKey, WalletBranch};
use crate::ledger::{sum_funds, FundingUtxo};
use crate::util::{btc_string_to_sat, parse_outpoint, sat_to_btc_string};

/// Protocol version used when the payload carries no market terms.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 8;

/// Extra satoshis added to the buy-side selection target, compensating for
/// estimation slack between the unsigned and signed funding estimates.
pub const COMMIT_FUNDS_HEADROOM_SATS: u64 = 682;

/// Reference to the collection an inscription is minted into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionReference {
    pub genesis_txid: String,
    pub owner_txid: String,
    pub owner_nout: u32,
    pub btc_owner_address: String,
}

/// Request to build and sign an inscription contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInscriptionPayload {
    pub content_type: String,
    /// Inscription content, hex encoded
    pub content: String,
    /// Amount the inscription output should carry, satoshis
    pub expect_amount: u64,
    /// Mining fee rate, satoshis per kvB
    pub fee_rate: u64,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub collection: Option<CollectionReference>,
    #[serde(default)]
    pub inscription_destination_address: Option<String>,
    /// Market terms supplied by the marketplace, if any
    #[serde(default)]
    pub contract: Option<Value>,
    /// Allow spending unconfirmed change from earlier builds
    #[serde(default)]
    pub use_funds_in_queue: bool,
}

/// A funding input reference returned to the caller. Carries no key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoRef {
    pub txid: String,
    pub nout: u32,
    pub amount: u64,
    pub address: String,
    #[serde(default)]
    pub path: String,
}

impl From<&FundingUtxo> for UtxoRef {
    fn from(utxo: &FundingUtxo) -> Self {
        Self {
            txid: utxo.txid.clone(),
            nout: utxo.nout,
            amount: utxo.amount,
            address: utxo.address.clone(),
            path: utxo.derivation_path.clone(),
        }
    }
}

/// Outcome of the create-inscription flow.
#[derive(Debug, Clone, Serialize)]
pub struct InscriptionContractResult {
    /// Serialized signed contract; `None` on failure
    pub data: Option<String>,
    /// Authoritative minimum funding amount, satoshis
    pub amount: u64,
    /// Sum of the selected inputs, satoshis
    pub inputs_sum: u64,
    pub utxo_list: Vec<UtxoRef>,
    pub expect_amount: u64,
    pub fee_rate: u64,
    /// Content plus content-type size, bytes
    pub size: usize,
    /// Mining fee of the genesis transaction alone, satoshis
    pub genesis_fee: u64,
    /// Intermediate Taproot script secret, kept for a fallback spend
    pub signing_key_secret: Option<String>,
    /// Inscription id (`<genesis_txid>i<envelope_index>`) of the build
    pub inscription_id: Option<String>,
    pub error_message: Option<String>,
}

impl InscriptionContractResult {
    fn new(payload: &CreateInscriptionPayload) -> Self {
        Self {
            data: None,
            amount: 0,
            inputs_sum: 0,
            utxo_list: Vec::new(),
            expect_amount: payload.expect_amount,
            fee_rate: payload.fee_rate,
            size: payload.content.len() / 2 + payload.content_type.len(),
            genesis_fee: 0,
            signing_key_secret: None,
            inscription_id: None,
            error_message: None,
        }
    }
}

/// One counterparty fee variant offered to the seller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellContractVariant {
    /// Market fee of this variant, satoshis
    pub market_fee: u64,
    pub contract: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapOrdTerms {
    pub contract_uuid: String,
    #[serde(default)]
    pub market_fee: u64,
    pub contracts: Vec<SellContractVariant>,
}

/// Request to sign the seller's leg of a swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellInscriptionPayload {
    /// `txid:nout` of the inscription being sold
    pub utxo_id: String,
    /// Asking price, satoshis
    pub ord_price: u64,
    pub swap_ord_terms: SwapOrdTerms,
}

#[derive(Debug, Clone, Serialize)]
pub struct SellInscriptionResult {
    pub contract_uuid: String,
    /// One signed contract per fee variant
    pub contracts: Vec<Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuySwapTerms {
    pub contract_uuid: String,
    pub contract: Value,
}

/// Request to commit the buyer's funds into a swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitBuyPayload {
    pub swap_ord_terms: BuySwapTerms,
    /// Market fee, satoshis
    pub market_fee: u64,
    /// Inscription price, satoshis
    pub ord_price: u64,
    #[serde(default)]
    pub inscription_destination_address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitBuyResult {
    pub data: Option<String>,
    /// Minimum funding amount, satoshis; populated even on insufficient
    /// funds so the caller can display the required top-up
    pub min_fund_amount: u64,
    /// Mining fee share of the minimum, satoshis
    pub mining_fee: i64,
    pub market_fee: u64,
    pub ord_price: u64,
    pub utxo_list: Vec<UtxoRef>,
    pub error_message: Option<String>,
}

impl CommitBuyResult {
    fn new(payload: &CommitBuyPayload) -> Self {
        Self {
            data: None,
            min_fund_amount: 0,
            mining_fee: 0,
            market_fee: payload.market_fee,
            ord_price: payload.ord_price,
            utxo_list: Vec::new(),
            error_message: None,
        }
    }
}

/// Request to finalize the buyer's swap signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignSwapPayload {
    pub swap_ord_terms: BuySwapTerms,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignSwapResult {
    pub contract_uuid: String,
    pub contract: Option<Value>,
    pub error_message: Option<String>,
}

fn default_market_terms() -> Value {
    json!({
        "contract_type": "CreateInscription",
        "params": {
            "protocol_version": DEFAULT_PROTOCOL_VERSION,
            "market_fee": { "amount": 0 },
            "author_fee": { "amount": 0 },
        }
    })
}

fn contract_version(contract: &Value) -> u32 {
    contract
        .pointer("/params/protocol_version")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION)
}

fn script_pubkey_hex(address: &str, network: Network) -> Result<String, WalletError> {
    let address = Address::from_str(address)
        .map_err(|e| WalletError::Payload(format!("invalid address {address:?}: {e}")))?
        .require_network(network)
        .map_err(|e| WalletError::Payload(format!("address {address:?}: {e}")))?;
    Ok(address.script_pubkey().to_hex_string())
}

fn spending_key(utxo: &FundingUtxo) -> Result<&DerivedKey, WalletError> {
    utxo.key.as_ref().ok_or_else(|| {
        WalletError::Derivation(format!(
            "no spending key for input {}:{}",
            utxo.txid, utxo.nout
        ))
    })
}

/// Give up after an unclassified failure exhausted the retry cap.
fn terminal_error(err: WalletError, attempts: u32) -> WalletError {
    if err.is_retryable() {
        WalletError::BuildFailed {
            attempts,
            last_error: err.to_string(),
        }
    } else {
        err
    }
}

impl WalletService {
    /// Build, fund, and sign an inscription contract. Returns a populated
    /// result or one carrying `error_message`; never fails across the
    /// boundary.
    pub async fn create_inscription_contract(
        &mut self,
        payload: CreateInscriptionPayload,
    ) -> InscriptionContractResult {
        debug!(
            "create inscription: {} bytes of {}, expect {} sat",
            payload.content.len() / 2,
            payload.content_type,
            payload.expect_amount
        );
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut out = InscriptionContractResult::new(&payload);
            match self.try_create_inscription(&payload, &mut out) {
                Ok(()) => return out,
                Err(err) if err.is_retryable() && attempt < self.build_retry_limit() => {
                    warn!("inscription build attempt {attempt} failed: {err}; retrying");
                }
                Err(err) => {
                    out.error_message = Some(terminal_error(err, attempt).to_string());
                    return out;
                }
            }
        }
    }

    /// Cost preview: runs the create flow over zero-filled content of the
    /// requested length.
    pub async fn estimate_inscription(
        &mut self,
        mut payload: CreateInscriptionPayload,
        content_length: usize,
    ) -> InscriptionContractResult {
        payload.content = "00".repeat(content_length);
        self.create_inscription_contract(payload).await
    }

    fn try_create_inscription(
        &mut self,
        payload: &CreateInscriptionPayload,
        out: &mut InscriptionContractResult,
    ) -> Result<(), WalletError> {
        let network = self.network();
        let terms = payload
            .contract
            .clone()
            .unwrap_or_else(default_market_terms);
        let version = contract_version(&terms);

        let mut contract = self
            .engine()
            .new_inscription(
                InscribeKind::Inscription,
                &sat_to_btc_string(payload.expect_amount),
            )
            .map_err(WalletError::from)?;
        if !contract.supported_versions().contains(&version) {
            return Err(WalletError::UnsupportedProtocolVersion);
        }
        contract.deserialize(&terms.to_string(), ContractPhase::MarketTerms)?;

        if let Some(metadata) = &payload.metadata {
            contract.meta_data(&hex::encode(metadata.to_string()))?;
        }
        contract.mining_fee_rate(&sat_to_btc_string(payload.fee_rate))?;

        let mut options = FundingOptions::default();
        let mut collection_key = None;
        if let Some(collection) = &payload.collection {
            let utxo = self
                .ledger()
                .find_inscription_by_output(&collection.owner_txid, collection.owner_nout)
                .cloned()
                .ok_or(WalletError::CollectionNotFound)?;
            // Inscription id: genesis txid + envelope number
            contract.add_to_collection(
                &format!("{}i0", collection.genesis_txid),
                &collection.owner_txid,
                collection.owner_nout,
                &sat_to_btc_string(utxo.amount),
                &collection.btc_owner_address,
            )?;
            collection_key = utxo.key;
            options = options.with_collection();
        }

        contract.data(&payload.content_type, &payload.content)?;

        let script_key = self.registry_mut().derive_branch(WalletBranch::Script)?;
        let internal_key = self
            .registry_mut()
            .derive_branch(WalletBranch::InternalScript)?;
        contract.inscribe_script_pubkey(&script_key.pubkey_hex())?;
        contract.inscribe_internal_pubkey(&internal_key.pubkey_hex())?;
        // A fresh unspendable-branch key backs the single-use commit script
        let _unspendable = self
            .registry_mut()
            .derive_branch(WalletBranch::Unspendable)?;

        let fund_address = self
            .registry_mut()
            .derive_branch(WalletBranch::Fund)?
            .p2tr_address(network);
        let ord_address = self
            .registry_mut()
            .derive_branch(WalletBranch::Ord)?
            .p2tr_address(network);
        let destination = payload
            .inscription_destination_address
            .clone()
            .unwrap_or(ord_address);
        contract.inscribe_address(&destination)?;
        contract.change_address(&fund_address)?;

        let min_fund_amount = btc_string_to_sat(&contract.min_funding_amount(options)?)?;
        out.amount = min_fund_amount;
        if self.ledger().fundings.is_empty() {
            return Err(WalletError::InsufficientFunds);
        }

        let utxo_list = coinselect::select(
            min_fund_amount,
            &self.ledger().fundings,
            &[],
            payload.use_funds_in_queue,
        );
        out.utxo_list = utxo_list.iter().map(UtxoRef::from).collect();
        let inputs_sum = sum_funds(&utxo_list);
        out.inputs_sum = inputs_sum;
        if utxo_list.is_empty() {
            return Err(WalletError::InsufficientFunds);
        }
        if inputs_sum > payload.expect_amount {
            options = options.with_change();
        }

        for utxo in &utxo_list {
            contract.add_utxo(
                &utxo.txid,
                utxo.nout,
                &sat_to_btc_string(utxo.amount),
                &utxo.address,
            )?;
        }
        for (index, utxo) in utxo_list.iter().enumerate() {
            let key = spending_key(utxo)?;
            contract.sign_commit(
                index as u32,
                &key.privkey_hex(),
                &script_pubkey_hex(&utxo.address, network)?,
            )?;
        }
        if payload.collection.is_some() {
            let key = collection_key.ok_or_else(|| {
                WalletError::Derivation("no spending key for the collection output".into())
            })?;
            contract.sign_collection(&key.privkey_hex())?;
        }
        contract.sign_inscription(&script_key.privkey_hex())?;

        // Signatures changed the weight: re-estimate and re-select for the
        // authoritative funding amount and input list
        let final_amount = btc_string_to_sat(&contract.min_funding_amount(options)?)?;
        out.amount = final_amount;
        let final_list = coinselect::select(
            final_amount,
            &self.ledger().fundings,
            &[],
            payload.use_funds_in_queue,
        );
        out.utxo_list = final_list.iter().map(UtxoRef::from).collect();

        out.data = Some(contract.serialize(version, ContractPhase::InscriptionSignature)?);
        out.genesis_fee = btc_string_to_sat(&contract.genesis_tx_mining_fee()?)?;
        out.inscription_id = Some(contract.make_inscription_id()?);

        let intermediate_sk = contract.intermediate_taproot_seckey()?;
        self.registry_mut().add_key_to_cache(&intermediate_sk)?;
        out.signing_key_secret = Some(intermediate_sk);

        info!(
            "inscription contract built: {} inputs, {} sat minimum",
            out.utxo_list.len(),
            out.amount
        );
        Ok(())
    }

    /// Sign the seller's leg of a swap, once per counterparty fee variant.
    /// All variants share one pass over the same inscription UTXO.
    pub async fn sell_inscription_contract(
        &mut self,
        payload: SellInscriptionPayload,
    ) -> SellInscriptionResult {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut out = SellInscriptionResult {
                contract_uuid: payload.swap_ord_terms.contract_uuid.clone(),
                contracts: Vec::new(),
                error_message: None,
            };
            match self.try_sell_inscription(&payload, &mut out) {
                Ok(()) => return out,
                Err(err) if err.is_retryable() && attempt < self.build_retry_limit() => {
                    warn!("sell signing attempt {attempt} failed: {err}; retrying");
                }
                Err(err) => {
                    out.error_message = Some(terminal_error(err, attempt).to_string());
                    return out;
                }
            }
        }
    }

    fn try_sell_inscription(
        &mut self,
        payload: &SellInscriptionPayload,
        out: &mut SellInscriptionResult,
    ) -> Result<(), WalletError> {
        let network = self.network();
        let (txid, nout) = parse_outpoint(&payload.utxo_id)?;
        let utxo = self
            .ledger()
            .find_inscription_by_output(&txid, nout)
            .cloned()
            .ok_or_else(|| {
                WalletError::Payload(format!(
                    "inscription {txid}:{nout} is not found in balances"
                ))
            })?;
        let ord_key = utxo.key.clone().ok_or_else(|| {
            WalletError::Derivation(format!("no spending key for inscription {txid}:{nout}"))
        })?;
        let funds_payoff = self
            .registry_mut()
            .derive_branch(WalletBranch::Fund)?
            .p2tr_address(network);

        for variant in &payload.swap_ord_terms.contracts {
            let version = contract_version(&variant.contract);
            let mut swap = self
                .engine()
                .new_swap(
                    &sat_to_btc_string(payload.ord_price),
                    &sat_to_btc_string(variant.market_fee),
                )
                .map_err(WalletError::from)?;
            if !swap.supported_versions().contains(&version) {
                return Err(WalletError::UnsupportedProtocolVersion);
            }
            swap.deserialize(&variant.contract.to_string(), ContractPhase::OrdTerms)?;
            swap.check_contract_terms(ContractPhase::OrdTerms)?;
            swap.ord_utxo(&txid, nout, &sat_to_btc_string(utxo.amount), &utxo.address)?;
            swap.funds_payoff_address(&funds_payoff)?;
            swap.sign_ord_swap(&ord_key.privkey_hex())?;

            let data = swap.serialize(version, ContractPhase::OrdSwapSig)?;
            let value: Value = serde_json::from_str(&data)
                .map_err(|e| WalletError::Payload(format!("engine returned bad JSON: {e}")))?;
            out.contracts.push(value);
        }
        info!(
            "sell leg signed for {} fee variants of {}",
            out.contracts.len(),
            payload.utxo_id
        );
        Ok(())
    }

    /// Commit the buyer's funding inputs into a swap. On insufficient funds
    /// the unsigned estimate stays populated so the caller can display the
    /// required top-up.
    pub async fn commit_buy_inscription_contract(
        &mut self,
        payload: CommitBuyPayload,
    ) -> CommitBuyResult {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut out = CommitBuyResult::new(&payload);
            match self.try_commit_buy(&payload, &mut out) {
                Ok(()) => return out,
                Err(err) if err.is_retryable() && attempt < self.build_retry_limit() => {
                    warn!("buy commitment attempt {attempt} failed: {err}; retrying");
                }
                Err(err) => {
                    out.error_message = Some(terminal_error(err, attempt).to_string());
                    return out;
                }
            }
        }
    }

    fn try_commit_buy(
        &mut self,
        payload: &CommitBuyPayload,
        out: &mut CommitBuyResult,
    ) -> Result<(), WalletError> {
        let network = self.network();
        let contract_json = payload.swap_ord_terms.contract.to_string();
        let version = contract_version(&payload.swap_ord_terms.contract);
        let price_btc = sat_to_btc_string(payload.ord_price);
        let fee_btc = sat_to_btc_string(payload.market_fee);

        // Simulate first to learn the unsigned funding estimate
        let min_fund_amount = {
            let mut sim = self
                .engine()
                .new_swap(&price_btc, &fee_btc)
                .map_err(WalletError::from)?;
            if !sim.supported_versions().contains(&version) {
                return Err(WalletError::UnsupportedProtocolVersion);
            }
            sim.deserialize(&contract_json, ContractPhase::FundsTerms)?;
            sim.check_contract_terms(ContractPhase::FundsTerms)?;
            btc_string_to_sat(&sim.min_funding_amount()?)?
        };
        out.min_fund_amount = min_fund_amount;
        out.mining_fee =
            min_fund_amount as i64 - payload.market_fee as i64 - payload.ord_price as i64;

        if self.ledger().fundings.is_empty() {
            return Err(WalletError::InsufficientFunds);
        }
        let utxo_list = coinselect::select(
            min_fund_amount + COMMIT_FUNDS_HEADROOM_SATS,
            &self.ledger().fundings,
            &[],
            false,
        );
        if utxo_list.is_empty() {
            return Err(WalletError::InsufficientFunds);
        }

        let mut swap = self
            .engine()
            .new_swap(&price_btc, &fee_btc)
            .map_err(WalletError::from)?;
        swap.deserialize(&contract_json, ContractPhase::FundsTerms)?;
        for utxo in &utxo_list {
            swap.add_funds_utxo(
                &utxo.txid,
                utxo.nout,
                &sat_to_btc_string(utxo.amount),
                &utxo.address,
            )?;
        }

        let fund_address = self
            .registry_mut()
            .derive_branch(WalletBranch::Fund)?
            .p2tr_address(network);
        swap.change_address(&fund_address)?;
        let script_key = self.registry_mut().derive_branch(WalletBranch::Script)?;
        swap.swap_script_pubkey_b(&script_key.pubkey_hex())?;

        for (index, utxo) in utxo_list.iter().enumerate() {
            let key = spending_key(utxo)?;
            swap.sign_funds_commitment(index as u32, &key.privkey_hex())?;
        }

        let ord_address = self
            .registry_mut()
            .derive_branch(WalletBranch::Ord)?
            .p2tr_address(network);
        let destination = payload
            .inscription_destination_address
            .clone()
            .unwrap_or(ord_address);
        swap.ord_payoff_address(&destination)?;

        // Signed inputs weigh more: the re-queried minimum is authoritative
        let final_amount = btc_string_to_sat(&swap.min_funding_amount()?)?;
        out.min_fund_amount = final_amount;
        out.mining_fee =
            final_amount as i64 - payload.market_fee as i64 - payload.ord_price as i64;
        out.utxo_list = utxo_list.iter().map(UtxoRef::from).collect();
        out.data = Some(swap.serialize(version, ContractPhase::FundsCommitSig)?);

        info!(
            "buy commitment built: {} inputs, {} sat minimum",
            out.utxo_list.len(),
            out.min_fund_amount
        );
        Ok(())
    }

    /// Sign the buyer's funds-swap leg of a fully assembled contract, then
    /// rotate the consumed script and ordinal keys.
    pub async fn sign_swap_inscription(&mut self, payload: SignSwapPayload) -> SignSwapResult {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut out = SignSwapResult {
                contract_uuid: payload.swap_ord_terms.contract_uuid.clone(),
                contract: None,
                error_message: None,
            };
            match self.try_sign_swap(&payload, &mut out) {
                Ok(()) => {
                    // The script and ordinal keys are consumed by the swap
                    self.advance_after_signing(&[WalletBranch::Script, WalletBranch::Ord])
                        .await;
                    return out;
                }
                Err(err) if err.is_retryable() && attempt < self.build_retry_limit() => {
                    warn!("swap signing attempt {attempt} failed: {err}; retrying");
                }
                Err(err) => {
                    out.error_message = Some(terminal_error(err, attempt).to_string());
                    return out;
                }
            }
        }
    }

    fn try_sign_swap(
        &mut self,
        payload: &SignSwapPayload,
        out: &mut SignSwapResult,
    ) -> Result<(), WalletError> {
        let contract_json = payload.swap_ord_terms.contract.to_string();
        let version = contract_version(&payload.swap_ord_terms.contract);

        let mut swap = self
            .engine()
            .new_swap("0.00000000", "0.00000000")
            .map_err(WalletError::from)?;
        if !swap.supported_versions().contains(&version) {
            return Err(WalletError::UnsupportedProtocolVersion);
        }
        swap.deserialize(&contract_json, ContractPhase::MarketPayoffSig)?;
        swap.check_contract_terms(ContractPhase::MarketPayoffSig)?;

        let script_key = self.registry_mut().derive_branch(WalletBranch::Script)?;
        swap.sign_funds_swap(&script_key.privkey_hex())?;

        let data = swap.serialize(version, ContractPhase::FundsSwapSig)?;
        let value: Value = serde_json::from_str(&data)
            .map_err(|e| WalletError::Payload(format!("engine returned bad JSON: {e}")))?;
        out.contract = Some(value);
        info!("funds swap leg signed");
        Ok(())
    }
}
