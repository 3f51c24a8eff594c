//! Network parameters for the supported Bitcoin networks
//!
//! This module provides functionality for mapping between network presets,
//! the one-letter network codes used by the remote wallet protocol, and the
//! BIP-44 coin type used in derivation paths.

use bitcoin::Network;

/// Network parameters for address encoding
#[derive(Clone, Debug)]
pub struct NetworkParams {
    /// Bech32 prefix (e.g., "bc" for mainnet, "tb" for testnet)
    pub bech32_prefix: String,
    /// Bitcoin network (mainnet, testnet, signet, regtest)
    pub network: Network,
}

impl NetworkParams {
    /// Create network parameters for mainnet
    pub fn mainnet() -> Self {
        Self {
            bech32_prefix: String::from("bc"),
            network: Network::Bitcoin,
        }
    }

    /// Create network parameters for testnet
    pub fn testnet() -> Self {
        Self {
            bech32_prefix: String::from("tb"),
            network: Network::Testnet,
        }
    }

    /// Create network parameters for signet (uses testnet address encoding)
    pub fn signet() -> Self {
        Self {
            bech32_prefix: String::from("tb"),
            network: Network::Signet,
        }
    }

    /// Create network parameters for regtest
    pub fn regtest() -> Self {
        Self {
            bech32_prefix: String::from("bcrt"),
            network: Network::Regtest,
        }
    }

    /// Create network parameters from a network name
    pub fn from_name(name: &str) -> Result<Self, String> {
        match name.to_lowercase().as_str() {
            "mainnet" => Ok(Self::mainnet()),
            "testnet" => Ok(Self::testnet()),
            "signet" => Ok(Self::signet()),
            "regtest" | "localhost" => Ok(Self::regtest()),
            _ => Err(format!(
                "Unknown network: {}. Supported networks: mainnet, testnet, signet, regtest",
                name
            )),
        }
    }
}

/// Resolve a network from the one-letter code used by the remote protocol.
/// Unknown codes fall back to testnet, matching the remote side.
pub fn network_from_code(code: char) -> Network {
    match code {
        'm' => Network::Bitcoin,
        't' => Network::Testnet,
        'r' => Network::Regtest,
        _ => Network::Testnet,
    }
}

/// One-letter code for a network, as expected by the remote protocol.
pub fn network_code(network: Network) -> char {
    match network {
        Network::Bitcoin => 'm',
        Network::Regtest => 'r',
        _ => 't',
    }
}

/// Human-readable label shown next to balances for non-mainnet networks.
pub fn network_label(network: Network) -> &'static str {
    match network {
        Network::Testnet | Network::Signet => "TestNet",
        Network::Regtest => "RegTest",
        _ => "",
    }
}

/// BIP-44 coin type for derivation paths on the given network.
pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1, // Testnet, Signet, Regtest
    }
}
