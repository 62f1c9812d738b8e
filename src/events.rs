//! On-chain event surface: typed definitions and decoders for the two event
//! families the pipeline harvests.
//!
//! The identity registry is an ERC-721 whose mints (`Transfer` from the zero
//! address) assign agent ids. The reputation registry emits `NewFeedback`.
//! Payments are EIP-3009 `AuthorizationUsed` settlements on the chain's USDC
//! contract, with the economic flow in the receipt's ERC-20 `Transfer` logs.

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;

// The two Transfer shapes share a topic0 but differ in indexing, so they
// live in separate modules.
pub mod erc721 {
    alloy::sol! {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
    }
}

pub mod erc20 {
    alloy::sol! {
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

alloy::sol! {
    /// ERC-8004 reputation registry feedback event.
    event NewFeedback(
        uint256 indexed agentId,
        address indexed clientAddress,
        uint64 feedbackIndex,
        int128 value,
        uint8 valueDecimals,
        string indexed indexedTag1,
        string tag1,
        string tag2,
        string endpoint,
        string feedbackURI,
        bytes32 feedbackHash
    );

    /// EIP-3009 settlement marker emitted by USDC.
    event AuthorizationUsed(address indexed authorizer, bytes32 indexed nonce);
}

pub fn transfer_topic() -> B256 {
    erc20::Transfer::SIGNATURE_HASH
}

pub fn new_feedback_topic() -> B256 {
    NewFeedback::SIGNATURE_HASH
}

pub fn authorization_used_topic() -> B256 {
    AuthorizationUsed::SIGNATURE_HASH
}

#[derive(Debug, Clone)]
pub struct IdentityMint {
    pub owner: Address,
    pub agent_id: u64,
    pub block_number: u64,
    pub block_timestamp: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FeedbackRecord {
    pub tx_hash: B256,
    pub feedback_index: u64,
    pub agent_id: u64,
    pub client_address: Address,
    /// Signed fixed-point value; exact, with `value_decimals` fraction digits.
    pub value: i128,
    pub value_decimals: u8,
    pub tag1: String,
    pub tag2: String,
    pub endpoint: String,
    pub feedback_uri: String,
    pub feedback_hash: B256,
    pub block_number: u64,
    pub block_timestamp: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct UsdcTransfer {
    pub payer: Address,
    pub recipient: Address,
    pub amount_raw: U256,
}

fn u256_to_u64_saturating(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.to::<u64>()
    }
}

/// Decode an identity-registry mint. Returns `None` for transfers that are
/// not mints (non-zero `from`); errors on malformed logs.
pub fn decode_identity_mint(log: &Log) -> anyhow::Result<Option<IdentityMint>> {
    let decoded = erc721::Transfer::decode_log_validate(&log.inner)
        .map_err(|err| anyhow::anyhow!("malformed identity Transfer log: {err}"))?;
    if decoded.data.from != Address::ZERO {
        return Ok(None);
    }
    let block_number = log
        .block_number
        .ok_or_else(|| anyhow::anyhow!("identity Transfer log missing block number"))?;
    Ok(Some(IdentityMint {
        owner: decoded.data.to,
        agent_id: u256_to_u64_saturating(decoded.data.tokenId),
        block_number,
        block_timestamp: log.block_timestamp,
    }))
}

pub fn decode_feedback(log: &Log) -> anyhow::Result<FeedbackRecord> {
    let decoded = NewFeedback::decode_log_validate(&log.inner)
        .map_err(|err| anyhow::anyhow!("malformed NewFeedback log: {err}"))?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| anyhow::anyhow!("NewFeedback log missing transaction hash"))?;
    let block_number = log
        .block_number
        .ok_or_else(|| anyhow::anyhow!("NewFeedback log missing block number"))?;
    let data = decoded.data;
    Ok(FeedbackRecord {
        tx_hash,
        feedback_index: data.feedbackIndex,
        agent_id: u256_to_u64_saturating(data.agentId),
        client_address: data.clientAddress,
        value: data.value,
        value_decimals: data.valueDecimals,
        tag1: data.tag1,
        tag2: data.tag2,
        endpoint: data.endpoint,
        feedback_uri: data.feedbackURI,
        feedback_hash: data.feedbackHash,
        block_number,
        block_timestamp: log.block_timestamp,
    })
}

pub fn decode_authorization_used(log: &Log) -> anyhow::Result<Address> {
    let decoded = AuthorizationUsed::decode_log_validate(&log.inner)
        .map_err(|err| anyhow::anyhow!("malformed AuthorizationUsed log: {err}"))?;
    Ok(decoded.data.authorizer)
}

pub fn decode_usdc_transfer(log: &Log) -> anyhow::Result<UsdcTransfer> {
    let decoded = erc20::Transfer::decode_log_validate(&log.inner)
        .map_err(|err| anyhow::anyhow!("malformed USDC Transfer log: {err}"))?;
    Ok(UsdcTransfer {
        payer: decoded.data.from,
        recipient: decoded.data.to,
        amount_raw: decoded.data.value,
    })
}

/// Normalize a fixed-point feedback value to micro-units (6 fraction digits),
/// saturating at the i64 range.
pub fn feedback_value_micro(value: i128, decimals: u8) -> i64 {
    let scaled = if decimals <= 6 {
        let factor = 10i128.pow(u32::from(6 - decimals));
        value.saturating_mul(factor)
    } else {
        let factor = 10i128.pow(u32::from(decimals.min(38) - 6));
        value / factor
    };
    scaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Scale a raw USDC amount (6 decimals) to exact integer micro-units,
/// saturating at the i64 range.
pub fn usdc_amount_micro(amount_raw: U256) -> i64 {
    if amount_raw > U256::from(i64::MAX as u64) {
        i64::MAX
    } else {
        amount_raw.to::<u64>() as i64
    }
}
