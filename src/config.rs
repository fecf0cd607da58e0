use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_urls: Vec<String>,
    pub token_address: Address,
    pub watch_addresses_file: PathBuf,
    /// Scan origin. None means start at the chain height seen at startup.
    pub start_block: Option<u64>,
    /// Poll interval while live-tailing.
    pub scan_delay: Duration,
    /// Catch-up chunk size in blocks.
    pub max_block_span: u64,
    pub ws_listen_addr: String,
    /// Bound on a single subscriber send.
    pub send_timeout: Duration,
    /// First backoff tier after a failure.
    pub retry_delay: Duration,
    /// Backoff tier for repeated failures.
    pub error_retry_delay: Duration,
    pub explorer_tx_url: String,
    /// Overrides the on-chain decimals() lookup when set.
    pub token_decimals: Option<u8>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let rpc_urls: Vec<String> = std::env::var("RPC_URLS")
            .context("RPC_URLS must be set in .env")?
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if rpc_urls.is_empty() {
            anyhow::bail!("RPC_URLS must contain at least one URL");
        }

        let token_address_str =
            std::env::var("TOKEN_ADDRESS").context("TOKEN_ADDRESS must be set in .env")?;
        let token_address =
            Address::from_str(token_address_str.trim()).context("Invalid TOKEN_ADDRESS format")?;

        let watch_addresses_file = PathBuf::from(
            std::env::var("WATCH_ADDRESSES_FILE").unwrap_or_else(|_| "addresses.txt".to_string()),
        );

        let start_block = optional_var::<u64>("START_BLOCK")?;
        let token_decimals = optional_var::<u8>("TOKEN_DECIMALS")?;

        let scan_delay = Duration::from_millis(var_or("SCAN_DELAY_MS", 1000)?);
        let max_block_span = var_or("MAX_BLOCK_SPAN", 100)?;
        let send_timeout = Duration::from_millis(var_or("SEND_TIMEOUT_MS", 5000)?);
        let retry_delay = Duration::from_millis(var_or("RETRY_DELAY_MS", 1000)?);
        let error_retry_delay = Duration::from_millis(var_or("ERROR_RETRY_DELAY_MS", 5000)?);

        let ws_listen_addr =
            std::env::var("WS_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let explorer_tx_url = std::env::var("EXPLORER_TX_URL")
            .unwrap_or_else(|_| "https://etherscan.io/tx/".to_string());

        Ok(Config {
            rpc_urls,
            token_address,
            watch_addresses_file,
            start_block,
            scan_delay,
            max_block_span,
            ws_listen_addr,
            send_timeout,
            retry_delay,
            error_retry_delay,
            explorer_tx_url,
            token_decimals,
        })
    }
}

fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => {
            let parsed = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {name} value {raw:?}"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(optional_var(name)?.unwrap_or(default))
}
