use alloy::primitives::{address, Address};
use std::str::FromStr;

// ERC-8004 registries are CREATE2 deployments and share an address across
// chains; the deploy block differs per chain.
const IDENTITY_REGISTRY: Address = address!("8004a169fb4a3325136eb29fbe1b6a70f9e34cd0");
const REPUTATION_REGISTRY: Address = address!("8004b663056a597dffe9eccc1965cbc9aa545bc9");

const ETHEREUM_FACILITATORS: &[Address] = &[address!("df1cc6bd6872af06e9ab29a2b7c0b0184d3f40ab")];
const BASE_FACILITATORS: &[Address] = &[
    address!("2bab0da23ca9c0fef8ff0ba16e8f6a8a4acecc6e"),
    address!("df1cc6bd6872af06e9ab29a2b7c0b0184d3f40ab"),
];
const ARBITRUM_FACILITATORS: &[Address] = &[address!("2bab0da23ca9c0fef8ff0ba16e8f6a8a4acecc6e")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Ethereum,
    Base,
    Arbitrum,
}

impl Chain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ethereum => "ethereum",
            Self::Base => "base",
            Self::Arbitrum => "arbitrum",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => Some(Self::Ethereum),
            "base" => Some(Self::Base),
            "arbitrum" | "arb" => Some(Self::Arbitrum),
            _ => None,
        }
    }

    /// Short form used in scanner ids ("erc8004_identity_base", "x402_arb").
    pub fn slug(self) -> &'static str {
        match self {
            Self::Ethereum => "eth",
            Self::Base => "base",
            Self::Arbitrum => "arb",
        }
    }

    pub fn all() -> &'static [Chain] {
        &[Chain::Ethereum, Chain::Base, Chain::Arbitrum]
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain: Chain,
    pub chain_id: u64,
    pub name: String,
    /// Provider network slug used to expand the RPC URL template.
    pub network: &'static str,
    pub usdc: Address,
    pub identity_registry: Address,
    pub reputation_registry: Address,
    pub identity_deploy_block: u64,
    pub reputation_deploy_block: u64,
    pub payments_genesis_block: u64,
    /// Gas payers recognized as x402 settlement facilitators.
    pub facilitators: Vec<Address>,
    pub block_time_ms: u64,
    /// Delay between successful scan batches.
    pub pacing_ms: u64,
}

fn address_env(var: &str) -> Option<Address> {
    std::env::var(var)
        .ok()
        .and_then(|raw| Address::from_str(raw.trim()).ok())
}

fn block_env(var: &str) -> Option<u64> {
    std::env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}

fn facilitators_env(var: &str) -> Option<Vec<Address>> {
    let raw = std::env::var(var).ok()?;
    let parsed: Vec<Address> = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| Address::from_str(entry).ok())
        .collect();
    if parsed.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

impl ChainConfig {
    pub fn get(chain: Chain) -> Self {
        let mut config = match chain {
            Chain::Ethereum => Self::ethereum(),
            Chain::Base => Self::base(),
            Chain::Arbitrum => Self::arbitrum(),
        };
        config.apply_env_overrides();
        config
    }

    pub fn ethereum() -> Self {
        Self {
            chain: Chain::Ethereum,
            chain_id: 1,
            name: "Ethereum Mainnet".to_string(),
            network: "eth-mainnet",
            usdc: address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
            identity_registry: IDENTITY_REGISTRY,
            reputation_registry: REPUTATION_REGISTRY,
            identity_deploy_block: 21_200_000,
            reputation_deploy_block: 21_200_000,
            payments_genesis_block: 21_000_000,
            facilitators: ETHEREUM_FACILITATORS.to_vec(),
            block_time_ms: 12_000,
            pacing_ms: 100,
        }
    }

    pub fn base() -> Self {
        Self {
            chain: Chain::Base,
            chain_id: 8453,
            name: "Base".to_string(),
            network: "base-mainnet",
            usdc: address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            identity_registry: IDENTITY_REGISTRY,
            reputation_registry: REPUTATION_REGISTRY,
            identity_deploy_block: 23_500_000,
            reputation_deploy_block: 23_650_000,
            payments_genesis_block: 21_500_000,
            facilitators: BASE_FACILITATORS.to_vec(),
            block_time_ms: 2_000,
            pacing_ms: 100,
        }
    }

    pub fn arbitrum() -> Self {
        Self {
            chain: Chain::Arbitrum,
            chain_id: 42161,
            name: "Arbitrum One".to_string(),
            network: "arb-mainnet",
            usdc: address!("af88d065e77c8cC2239327C5EDb3A432268e5831"),
            identity_registry: IDENTITY_REGISTRY,
            reputation_registry: REPUTATION_REGISTRY,
            identity_deploy_block: 275_000_000,
            reputation_deploy_block: 278_000_000,
            payments_genesis_block: 270_000_000,
            facilitators: ARBITRUM_FACILITATORS.to_vec(),
            block_time_ms: 250,
            pacing_ms: 50,
        }
    }

    fn apply_env_overrides(&mut self) {
        let suffix = self.chain.as_str().to_ascii_uppercase();
        if let Some(addr) = address_env(&format!("IDENTITY_REGISTRY_{suffix}")) {
            self.identity_registry = addr;
        }
        if let Some(addr) = address_env(&format!("REPUTATION_REGISTRY_{suffix}")) {
            self.reputation_registry = addr;
        }
        if let Some(block) = block_env(&format!("IDENTITY_DEPLOY_BLOCK_{suffix}")) {
            self.identity_deploy_block = block;
        }
        if let Some(block) = block_env(&format!("REPUTATION_DEPLOY_BLOCK_{suffix}")) {
            self.reputation_deploy_block = block;
        }
        if let Some(block) = block_env(&format!("PAYMENTS_GENESIS_BLOCK_{suffix}")) {
            self.payments_genesis_block = block;
        }
        if let Some(list) = facilitators_env(&format!("X402_FACILITATORS_{suffix}")) {
            self.facilitators = list;
        }
    }

    pub fn is_facilitator(&self, sender: Address) -> bool {
        self.facilitators.contains(&sender)
    }

    /// Translate an operator `--days` window into a block count using the
    /// chain's average block time.
    pub fn blocks_for_days(&self, days: u64) -> u64 {
        let block_time = self.block_time_ms.max(1);
        days.saturating_mul(86_400_000) / block_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_parse_accepts_aliases() {
        assert_eq!(Chain::parse("ethereum"), Some(Chain::Ethereum));
        assert_eq!(Chain::parse("ETH"), Some(Chain::Ethereum));
        assert_eq!(Chain::parse("base"), Some(Chain::Base));
        assert_eq!(Chain::parse("arb"), Some(Chain::Arbitrum));
        assert_eq!(Chain::parse("solana"), None);
    }

    #[test]
    fn test_blocks_for_days_uses_block_time() {
        let eth = ChainConfig::ethereum();
        assert_eq!(eth.blocks_for_days(1), 7_200);
        let base = ChainConfig::base();
        assert_eq!(base.blocks_for_days(1), 43_200);
        let arb = ChainConfig::arbitrum();
        assert_eq!(arb.blocks_for_days(1), 345_600);
    }

    #[test]
    fn test_facilitator_membership() {
        let base = ChainConfig::base();
        let facilitator = base.facilitators[0];
        assert!(base.is_facilitator(facilitator));
        assert!(!base.is_facilitator(Address::ZERO));
    }
}
