use crate::error::WatchError;
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, U256};
use serde::Serialize;

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);

    function name() external view returns (string);
    function symbol() external view returns (string);
    function decimals() external view returns (uint8);
}

/// One decoded transfer, full precision. `raw_value` stays a `U256`;
/// scaling by `token_decimals` happens only when a notice is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub raw_value: U256,
    pub token_decimals: u8,
}

/// Which side(s) of a transfer hit the watch list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Outgoing,
    Incoming,
    Internal,
}

impl MatchKind {
    pub fn classify(from_watched: bool, to_watched: bool) -> Option<MatchKind> {
        match (from_watched, to_watched) {
            (true, true) => Some(MatchKind::Internal),
            (true, false) => Some(MatchKind::Outgoing),
            (false, true) => Some(MatchKind::Incoming),
            (false, false) => None,
        }
    }
}

/// The frame pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferNotice {
    pub block: u64,
    pub from: Address,
    pub to: Address,
    pub amount: String,
    pub tx_hash: B256,
    pub explorer_url: String,
    pub kind: MatchKind,
}

impl TransferNotice {
    pub fn from_event(event: &TransferEvent, kind: MatchKind, explorer_base: &str) -> Self {
        TransferNotice {
            block: event.block_number,
            from: event.from,
            to: event.to,
            amount: format_token_amount(event.raw_value, event.token_decimals),
            tx_hash: event.tx_hash,
            explorer_url: format!("{}{:?}", explorer_base, event.tx_hash),
            kind,
        }
    }
}

pub fn decode_transfer(log: &Log, token_decimals: u8) -> Result<TransferEvent, WatchError> {
    let log_data = log.data();
    let decoded = Transfer::decode_raw_log(log.topics(), &log_data.data)
        .map_err(|e| WatchError::Decode(e.to_string()))?;

    let block_number = log
        .block_number
        .ok_or_else(|| WatchError::Decode("log is missing a block number".to_string()))?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| WatchError::Decode("log is missing a transaction hash".to_string()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| WatchError::Decode("log is missing a log index".to_string()))?;

    Ok(TransferEvent {
        block_number,
        log_index,
        tx_hash,
        from: decoded.from,
        to: decoded.to,
        raw_value: decoded.value,
        token_decimals,
    })
}

/// Scales a raw token amount into a decimal string. Trailing zeros are
/// trimmed but at least one fractional digit is kept, so 5_000_000 at six
/// decimals renders as "5.0".
pub fn format_token_amount(value: U256, decimals: u8) -> String {
    let digits = value.to_string();
    let decimals = decimals as usize;

    let (int_part, frac_part) = if digits.len() > decimals {
        let split = digits.len() - decimals;
        (digits[..split].to_string(), digits[split..].to_string())
    } else {
        ("0".to_string(), format!("{digits:0>decimals$}"))
    };

    let frac_trimmed = frac_part.trim_end_matches('0');
    if frac_trimmed.is_empty() {
        format!("{int_part}.0")
    } else {
        format!("{int_part}.{frac_trimmed}")
    }
}
