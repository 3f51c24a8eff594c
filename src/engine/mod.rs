//! Facade over the external transaction-construction library
//!
//! This module provides:
//! - Object-safe traits covering the capability surface the wallet core
//!   consumes from the inscription/swap contract engine
//! - Contract phase tags checked when (de)serializing partial contracts
//! - The closed set of fee-option flags understood by the engine's fee
//!   estimator
//!
//! Every call crosses one `Result` boundary ([`EngineResult`]); the engine
//! reports failures as tagged text messages which are classified upstream
//! (see [`crate::error`]). Contract objects returned by the engine wrap
//! native resources that are not garbage collected: the boxed handles release
//! them in `Drop`, so acquisition is always scoped to one operation.

pub mod mock;

use thiserror::Error;

/// Raw error reported by the engine. The message starts with one of the
/// engine's error tags when the failure is terminal.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for crate::error::WalletError {
    fn from(err: EngineError) -> Self {
        crate::error::WalletError::from_engine_message(err.0)
    }
}

/// Kind of inscription contract to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InscribeKind {
    /// A single inscription, optionally linked to an existing collection
    Inscription,
    /// A collection root inscription
    Collection,
}

/// Construction phase tags. A deserialized partial contract carries the tag
/// of the phase it was serialized at; signing stages check the tag before
/// adding their signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractPhase {
    MarketTerms,
    OrdTerms,
    FundsTerms,
    FundsCommitSig,
    MarketPayoffTerms,
    MarketPayoffSig,
    OrdSwapSig,
    FundsSwapSig,
    InscriptionSignature,
}

impl ContractPhase {
    pub fn tag(self) -> &'static str {
        match self {
            ContractPhase::MarketTerms => "MARKET_TERMS",
            ContractPhase::OrdTerms => "ORD_TERMS",
            ContractPhase::FundsTerms => "FUNDS_TERMS",
            ContractPhase::FundsCommitSig => "FUNDS_COMMIT_SIG",
            ContractPhase::MarketPayoffTerms => "MARKET_PAYOFF_TERMS",
            ContractPhase::MarketPayoffSig => "MARKET_PAYOFF_SIG",
            ContractPhase::OrdSwapSig => "ORD_SWAP_SIG",
            ContractPhase::FundsSwapSig => "FUNDS_SWAP_SIG",
            ContractPhase::InscriptionSignature => "INSCRIPTION_SIGNATURE",
        }
    }
}

/// Fee-option flags passed to the engine's funding estimator. The engine
/// parses a comma-joined, order-sensitive string; only these four
/// combinations occur, and the collection flag always precedes change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FundingOptions {
    #[default]
    None,
    Collection,
    Change,
    CollectionAndChange,
}

impl FundingOptions {
    pub fn with_collection(self) -> Self {
        match self {
            FundingOptions::None | FundingOptions::Collection => FundingOptions::Collection,
            FundingOptions::Change | FundingOptions::CollectionAndChange => {
                FundingOptions::CollectionAndChange
            }
        }
    }

    pub fn with_change(self) -> Self {
        match self {
            FundingOptions::None | FundingOptions::Change => FundingOptions::Change,
            FundingOptions::Collection | FundingOptions::CollectionAndChange => {
                FundingOptions::CollectionAndChange
            }
        }
    }

    pub fn has_collection(self) -> bool {
        matches!(
            self,
            FundingOptions::Collection | FundingOptions::CollectionAndChange
        )
    }

    pub fn has_change(self) -> bool {
        matches!(
            self,
            FundingOptions::Change | FundingOptions::CollectionAndChange
        )
    }

    /// The exact string the engine's fee estimator parses.
    pub fn as_str(self) -> &'static str {
        match self {
            FundingOptions::None => "",
            FundingOptions::Collection => "collection",
            FundingOptions::Change => "change",
            FundingOptions::CollectionAndChange => "collection,change",
        }
    }
}

/// Entry point to the transaction-construction engine. Amounts at this
/// boundary are 8-decimal BTC strings, per the engine's calling convention.
pub trait ContractEngine: Send + Sync {
    /// Start a new inscription contract expecting the given ordinal amount.
    fn new_inscription(
        &self,
        kind: InscribeKind,
        expect_amount_btc: &str,
    ) -> EngineResult<Box<dyn InscriptionContract>>;

    /// Start a new swap contract over the given price and market fee.
    fn new_swap(
        &self,
        ord_price_btc: &str,
        market_fee_btc: &str,
    ) -> EngineResult<Box<dyn SwapContract>>;

    /// Compute the Taproot public key identifying a collection, from the
    /// collection's inscription id and its script/internal key components.
    fn collection_taproot_pubkey(
        &self,
        inscription_id: &str,
        script_pk: &str,
        internal_pk: &str,
    ) -> EngineResult<String>;
}

/// One in-flight inscription contract build.
pub trait InscriptionContract: Send {
    /// Load counterparty-provided contract terms, checking the phase tag.
    fn deserialize(&mut self, contract_json: &str, phase: ContractPhase) -> EngineResult<()>;

    /// Contract protocol versions this engine build can produce.
    fn supported_versions(&self) -> Vec<u32>;

    fn mining_fee_rate(&mut self, rate_btc: &str) -> EngineResult<()>;
    fn data(&mut self, content_type: &str, content_hex: &str) -> EngineResult<()>;
    fn meta_data(&mut self, metadata_hex: &str) -> EngineResult<()>;
    fn inscribe_script_pubkey(&mut self, pubkey_hex: &str) -> EngineResult<()>;
    fn inscribe_internal_pubkey(&mut self, pubkey_hex: &str) -> EngineResult<()>;
    fn inscribe_address(&mut self, address: &str) -> EngineResult<()>;
    fn change_address(&mut self, address: &str) -> EngineResult<()>;

    /// Link the inscription into an existing collection.
    fn add_to_collection(
        &mut self,
        collection_id: &str,
        owner_txid: &str,
        owner_nout: u32,
        amount_btc: &str,
        owner_address: &str,
    ) -> EngineResult<()>;

    /// Commit a funding UTXO as a contract input.
    fn add_utxo(
        &mut self,
        txid: &str,
        nout: u32,
        amount_btc: &str,
        address: &str,
    ) -> EngineResult<()>;

    /// Sign the committed input at `index` with its owning key.
    fn sign_commit(
        &mut self,
        index: u32,
        privkey_hex: &str,
        script_pubkey_hex: &str,
    ) -> EngineResult<()>;

    /// Sign the collection-membership attestation with the collection
    /// output's owning key.
    fn sign_collection(&mut self, privkey_hex: &str) -> EngineResult<()>;

    /// Sign the inscription envelope with the single-use script key.
    fn sign_inscription(&mut self, script_privkey_hex: &str) -> EngineResult<()>;

    /// Minimum funding needed under the given fee options. Signature sizes
    /// count once the corresponding signatures are present, so callers
    /// re-query after signing.
    fn min_funding_amount(&self, options: FundingOptions) -> EngineResult<String>;

    /// Mining fee of the genesis transaction alone.
    fn genesis_tx_mining_fee(&self) -> EngineResult<String>;

    /// The intermediate Taproot script secret key, needed for a fallback
    /// spend of the commit output.
    fn intermediate_taproot_seckey(&self) -> EngineResult<String>;

    /// Inscription id (`<genesis_txid>i<envelope_index>`) of the build.
    fn make_inscription_id(&self) -> EngineResult<String>;

    fn serialize(&self, version: u32, phase: ContractPhase) -> EngineResult<String>;
}

/// One in-flight swap contract build.
pub trait SwapContract: Send {
    fn deserialize(&mut self, contract_json: &str, phase: ContractPhase) -> EngineResult<()>;

    /// Verify the deserialized contract carries the expected phase tag.
    fn check_contract_terms(&self, phase: ContractPhase) -> EngineResult<()>;

    fn supported_versions(&self) -> Vec<u32>;

    /// Attach the inscription-bearing UTXO being sold.
    fn ord_utxo(
        &mut self,
        txid: &str,
        nout: u32,
        amount_btc: &str,
        address: &str,
    ) -> EngineResult<()>;

    /// Attach a buyer funding UTXO.
    fn add_funds_utxo(
        &mut self,
        txid: &str,
        nout: u32,
        amount_btc: &str,
        address: &str,
    ) -> EngineResult<()>;

    fn funds_payoff_address(&mut self, address: &str) -> EngineResult<()>;
    fn ord_payoff_address(&mut self, address: &str) -> EngineResult<()>;
    fn change_address(&mut self, address: &str) -> EngineResult<()>;
    fn swap_script_pubkey_a(&mut self, pubkey_hex: &str) -> EngineResult<()>;
    fn swap_script_pubkey_b(&mut self, pubkey_hex: &str) -> EngineResult<()>;

    /// Seller leg: sign the ordinal swap with the ord output's owning key.
    fn sign_ord_swap(&mut self, privkey_hex: &str) -> EngineResult<()>;

    /// Buyer leg: sign the committed funds input at `index`.
    fn sign_funds_commitment(&mut self, index: u32, privkey_hex: &str) -> EngineResult<()>;

    /// Buyer leg: sign the funds swap with the buyer's script key.
    fn sign_funds_swap(&mut self, privkey_hex: &str) -> EngineResult<()>;

    fn min_funding_amount(&self) -> EngineResult<String>;

    fn serialize(&self, version: u32, phase: ContractPhase) -> EngineResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_funding_options_strings() {
        assert_eq!(FundingOptions::None.as_str(), "");
        assert_eq!(FundingOptions::Collection.as_str(), "collection");
        assert_eq!(FundingOptions::Change.as_str(), "change");
        // Order matters to the engine parser: collection precedes change.
        assert_eq!(FundingOptions::CollectionAndChange.as_str(), "collection,change");
    }

    #[test]
    fn test_funding_options_composition() {
        let options = FundingOptions::default().with_collection().with_change();
        assert_eq!(options, FundingOptions::CollectionAndChange);
        // Re-applying a flag is a no-op
        assert_eq!(options.with_change(), FundingOptions::CollectionAndChange);
        assert_eq!(FundingOptions::Change.with_collection(), FundingOptions::CollectionAndChange);
    }
}
