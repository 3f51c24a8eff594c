//! Shared conversion and hashing helpers
//!
//! This module provides:
//! - Satoshi <-> 8-decimal BTC string conversion used at the engine boundary
//! - Double-SHA256 for address ownership challenges
//! - Outpoint string parsing for `txid:nout` identifiers

use bitcoin::{Amount, Denomination};
use sha2::{Digest, Sha256};

use crate::error::WalletError;

/// Format a satoshi amount as the 8-decimal BTC string the engine expects.
/// Formatting is done in integer arithmetic so the output is exact.
pub fn sat_to_btc_string(sat: u64) -> String {
    format!("{}.{:08}", sat / 100_000_000, sat % 100_000_000)
}

/// Parse an 8-decimal BTC string from the engine back into satoshis.
pub fn btc_string_to_sat(btc: &str) -> Result<u64, WalletError> {
    Amount::from_str_in(btc, Denomination::Bitcoin)
        .map(|amount| amount.to_sat())
        .map_err(|e| WalletError::Payload(format!("invalid BTC amount {btc:?}: {e}")))
}

/// Double-SHA256 of a UTF-8 message, used for address ownership challenges.
pub fn sha256d(message: &str) -> [u8; 32] {
    let first = Sha256::digest(message.as_bytes());
    let second = Sha256::digest(first);
    second.into()
}

/// Split a `txid:nout` identifier into its parts.
pub fn parse_outpoint(utxo_id: &str) -> Result<(String, u32), WalletError> {
    let (txid, nout) = utxo_id
        .split_once(':')
        .ok_or_else(|| WalletError::Payload(format!("malformed outpoint id {utxo_id:?}")))?;
    let nout = nout
        .parse::<u32>()
        .map_err(|e| WalletError::Payload(format!("malformed output index in {utxo_id:?}: {e}")))?;
    Ok((txid.to_string(), nout))
}

/// Seconds since the Unix epoch.
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sat_to_btc_string() {
        assert_eq!(sat_to_btc_string(0), "0.00000000");
        assert_eq!(sat_to_btc_string(546), "0.00000546");
        assert_eq!(sat_to_btc_string(10_000), "0.00010000");
        assert_eq!(sat_to_btc_string(150_000_000), "1.50000000");
    }

    #[test]
    fn test_btc_string_round_trip() {
        for sat in [0u64, 1, 546, 9_999, 100_000_000, 2_100_000_000_000_000] {
            let btc = sat_to_btc_string(sat);
            assert_eq!(btc_string_to_sat(&btc).unwrap(), sat);
        }
    }

    #[test]
    fn test_btc_string_rejects_garbage() {
        assert!(btc_string_to_sat("not-a-number").is_err());
    }

    #[test]
    fn test_parse_outpoint() {
        let (txid, nout) = parse_outpoint("ab12:3").unwrap();
        assert_eq!(txid, "ab12");
        assert_eq!(nout, 3);
        assert!(parse_outpoint("missing-separator").is_err());
        assert!(parse_outpoint("txid:notanumber").is_err());
    }

    #[test]
    fn test_sha256d_is_stable() {
        // Hashing the same message twice yields identical digests
        let a = sha256d("Verify address salt: 42");
        let b = sha256d("Verify address salt: 42");
        assert_eq!(a, b);
        assert_ne!(a, sha256d("Verify address salt: 43"));
    }
}
