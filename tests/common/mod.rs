#![allow(dead_code)]

use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, Bytes, LogData, U256, address};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use transfer_watch::config::Config;
use transfer_watch::error::WatchError;
use transfer_watch::events::Transfer;
use transfer_watch::rpc::LogSource;

pub const TOKEN: Address = address!("dac17f958d2ee523a2206206994597c13d831ec7");
pub const ALICE: Address = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
pub const BOB: Address = address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
pub const CAROL: Address = address!("cccccccccccccccccccccccccccccccccccccccc");

/// Scripted stand-in for the RPC client. Heights are consumed one per call
/// and the last one repeats forever; log outcomes are consumed one per
/// range request, then every further range is empty. Clones share state,
/// so a test keeps one clone to inspect while the scan loop owns another.
#[derive(Clone, Default)]
pub struct MockLogSource {
    heights: Arc<Mutex<VecDeque<u64>>>,
    outcomes: Arc<Mutex<VecDeque<Result<Vec<Log>, WatchError>>>>,
    requested: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl MockLogSource {
    pub fn with_height(height: u64) -> Self {
        let source = Self::default();
        source.push_height(height);
        source
    }

    pub fn push_height(&self, height: u64) {
        self.heights.lock().unwrap().push_back(height);
    }

    pub fn push_logs(&self, logs: Vec<Log>) {
        self.outcomes.lock().unwrap().push_back(Ok(logs));
    }

    pub fn push_fetch_error(&self, message: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Err(WatchError::Fetch(message.to_string())));
    }

    pub fn requested_ranges(&self) -> Vec<(u64, u64)> {
        self.requested.lock().unwrap().clone()
    }

    /// Polls until at least `count` ranges were requested, or gives up after
    /// the deadline and returns whatever arrived.
    pub async fn wait_for_requests(&self, count: usize, deadline: Duration) -> Vec<(u64, u64)> {
        let give_up = tokio::time::Instant::now() + deadline;
        loop {
            let ranges = self.requested_ranges();
            if ranges.len() >= count || tokio::time::Instant::now() >= give_up {
                return ranges;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl LogSource for MockLogSource {
    async fn latest_block_number(&self) -> Result<u64, WatchError> {
        // A real client would hit the network here; the yield keeps a
        // caught-up scan loop from starving the test task.
        tokio::task::yield_now().await;
        let mut heights = self.heights.lock().unwrap();
        match heights.len() {
            0 => Err(WatchError::Fetch("no height scripted".to_string())),
            1 => Ok(heights[0]),
            _ => Ok(heights.pop_front().unwrap()),
        }
    }

    async fn transfer_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, WatchError> {
        tokio::task::yield_now().await;
        self.requested.lock().unwrap().push((from_block, to_block));
        let next = self.outcomes.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// A well-formed transfer log of the test token. The transaction hash is
/// derived from the position so every log gets a distinct one.
pub fn transfer_log(from: Address, to: Address, value: u64, block: u64, log_index: u64) -> Log {
    let topics = vec![Transfer::SIGNATURE_HASH, from.into_word(), to.into_word()];
    let data = Bytes::from(U256::from(value).to_be_bytes::<32>().to_vec());
    let tx_hash = B256::from(U256::from(block * 1_000 + log_index).to_be_bytes::<32>());
    Log {
        inner: alloy_primitives::Log {
            address: TOKEN,
            data: LogData::new_unchecked(topics, data),
        },
        block_hash: None,
        block_number: Some(block),
        block_timestamp: None,
        transaction_hash: Some(tx_hash),
        transaction_index: Some(0),
        log_index: Some(log_index),
        removed: false,
    }
}

/// A log whose topics do not decode as a transfer.
pub fn undecodable_log(block: u64, log_index: u64) -> Log {
    let mut log = transfer_log(ALICE, BOB, 1, block, log_index);
    log.inner.data = LogData::new_unchecked(
        vec![Transfer::SIGNATURE_HASH],
        log.inner.data.data.clone(),
    );
    log
}

/// Config with delays shrunk far enough that tests finish in milliseconds.
pub fn test_config(start_block: Option<u64>, max_block_span: u64) -> Config {
    Config {
        rpc_urls: vec!["http://127.0.0.1:1".to_string()],
        token_address: TOKEN,
        watch_addresses_file: PathBuf::from("addresses.txt"),
        start_block,
        scan_delay: Duration::from_millis(10),
        max_block_span,
        ws_listen_addr: "127.0.0.1:0".to_string(),
        send_timeout: Duration::from_millis(200),
        retry_delay: Duration::from_millis(20),
        error_retry_delay: Duration::from_millis(40),
        explorer_tx_url: "https://etherscan.io/tx/".to_string(),
        token_decimals: Some(6),
    }
}
