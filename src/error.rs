//! Domain error taxonomy and engine-error tag classification.
//!
//! The wallet core speaks a single error type, [`WalletError`], to its
//! callers. Failures reported by the external contract engine arrive as
//! tagged text messages (see [`crate::engine::EngineError`]); they are
//! classified here by [`WalletError::from_engine_message`] against the known
//! non-retryable tag set (spec §7). Recognized tags are terminal and abort
//! the build immediately; unrecognized messages are transient and let the
//! bounded retry loop in [`crate::service`] try again, eventually surfacing a
//! generic [`WalletError::BuildFailed`].

use thiserror::Error;

/// Error tags emitted by the contract engine that identify a terminal,
/// non-retryable failure. A message carrying any of these aborts the build at
/// once rather than being retried.
pub const KNOWN_ENGINE_ERROR_TAGS: &[&str] = &[
    "ContractTermMissing",
    "ContractTermWrongValue",
    "ContractValueMismatch",
    "ContractTermWrongFormat",
    "ContractStateError",
    "ContractProtocolError",
    "SignatureError",
    "WrongKeyError",
    "KeyError",
    "TransactionError",
];

/// The wallet core's domain error taxonomy.
#[derive(Debug, Error)]
pub enum WalletError {
    /// Encryption/decryption or key-material handling failure.
    #[error("{0}")]
    Crypto(String),

    /// Key derivation failure (bad seed, path, or key material).
    #[error("{0}")]
    Derivation(String),

    /// Malformed or unacceptable caller-supplied payload.
    #[error("{0}")]
    Payload(String),

    /// Not enough funding UTXOs to cover the target amount.
    #[error("Insufficient funds")]
    InsufficientFunds,

    /// The referenced collection output is not present in the ledger.
    #[error("Collection is not found in balances.")]
    CollectionNotFound,

    /// The contract declares a protocol version this wallet cannot handle.
    #[error("Please update the wallet to the latest version.")]
    UnsupportedProtocolVersion,

    /// An operation requiring the decrypted seed ran while the wallet was
    /// locked.
    #[error("wallet is locked")]
    WalletLocked,

    /// A classified, non-retryable engine failure; the message carries one of
    /// the known engine error tags.
    #[error("{0}")]
    Engine(String),

    /// An unclassified engine failure; treated as transient and retried.
    #[error("{0}")]
    EngineTransient(String),

    /// A transient build exhausted its retry budget.
    #[error("build failed after {attempts} attempts: {last_error}")]
    BuildFailed { attempts: u32, last_error: String },

    /// A failure surfaced by the storage backend (which reports `anyhow`
    /// errors across the store interface).
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl WalletError {
    /// Classify a raw engine error message. Messages carrying a known
    /// terminal tag map to [`WalletError::Engine`] (non-retryable); everything
    /// else is treated as [`WalletError::EngineTransient`] (retryable).
    pub fn from_engine_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if KNOWN_ENGINE_ERROR_TAGS
            .iter()
            .any(|tag| message.contains(tag))
        {
            WalletError::Engine(message)
        } else {
            WalletError::EngineTransient(message)
        }
    }

    /// Whether the build loop should retry after this error. Only unclassified
    /// engine failures are transient; every other variant is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::EngineTransient(_))
    }
}
