//! Network definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Network type enumeration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Mainnet
    #[default]
    Mainnet,
    /// Testnet
    Testnet,
    /// Regtest (local development)
    Regtest,
}

impl NetworkType {
    /// Short name used in file names and logs
    pub const fn name(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Regtest => "regtest",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(NetworkType::Mainnet),
            "testnet" | "test" => Ok(NetworkType::Testnet),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone)]
pub struct Network {
    /// Network type
    pub network_type: NetworkType,
    /// Human-readable name
    pub name: &'static str,
    /// Default lightwalletd gRPC port
    pub lightwalletd_port: u16,
    /// Sapling activation height; no compact block exists below it
    pub sapling_activation_height: u64,
    /// Orchard activation height (if activated)
    pub orchard_activation_height: Option<u64>,
    /// Default birthday height (wallet creation)
    pub default_birthday_height: u64,
}

impl Network {
    /// Get mainnet parameters
    pub const fn mainnet() -> Self {
        Self {
            network_type: NetworkType::Mainnet,
            name: "mainnet",
            lightwalletd_port: 9067,
            sapling_activation_height: 419_200,
            orchard_activation_height: Some(1_687_104),
            default_birthday_height: 419_200,
        }
    }

    /// Get testnet parameters
    pub const fn testnet() -> Self {
        Self {
            network_type: NetworkType::Testnet,
            name: "testnet",
            lightwalletd_port: 9067,
            sapling_activation_height: 280_000,
            orchard_activation_height: Some(1_842_420),
            default_birthday_height: 280_000,
        }
    }

    /// Get regtest parameters
    pub const fn regtest() -> Self {
        Self {
            network_type: NetworkType::Regtest,
            name: "regtest",
            lightwalletd_port: 9067,
            sapling_activation_height: 1,
            orchard_activation_height: None,
            default_birthday_height: 1,
        }
    }

    /// Get network by type
    pub const fn from_type(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Check if Sapling is activated at given height
    pub const fn is_sapling_active(&self, height: u64) -> bool {
        height >= self.sapling_activation_height
    }

    /// Check if Orchard is activated at given height
    pub const fn is_orchard_active(&self, height: u64) -> bool {
        if let Some(activation_height) = self.orchard_activation_height {
            height >= activation_height
        } else {
            false
        }
    }
}
