use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::WatchError;
use crate::events::{MatchKind, decode_transfer};
use crate::rpc::LogSource;
use crate::watchlist::WatchSet;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Next unprocessed block. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    next_block: u64,
}

impl ScanCursor {
    pub fn new(start_block: u64) -> Self {
        ScanCursor {
            next_block: start_block,
        }
    }

    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Marks everything through `processed_through` as done. A stale or
    /// repeated call cannot move the cursor backwards.
    pub fn advance_to(&mut self, processed_through: u64) {
        self.next_block = self.next_block.max(processed_through.saturating_add(1));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    CatchingUp,
    LiveTailing,
    Backoff,
}

/// Two-tier retry delay: the first failure in a streak waits the short
/// delay, every further failure the long one. Pure, no clock inside.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    first_delay: Duration,
    repeat_delay: Duration,
    failures: u32,
}

impl RetryBackoff {
    pub fn new(first_delay: Duration, repeat_delay: Duration) -> Self {
        RetryBackoff {
            first_delay,
            repeat_delay,
            failures: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.failures += 1;
        if self.failures == 1 {
            self.first_delay
        } else {
            self.repeat_delay
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Which regime the next range belongs to: chunked catch-up while more than
/// one block is pending, single-block tailing otherwise.
pub fn scan_phase(next_block: u64, latest: u64) -> ScanState {
    if next_block < latest {
        ScanState::CatchingUp
    } else {
        ScanState::LiveTailing
    }
}

/// Inclusive bounds of the next range, or None when there is nothing to
/// fetch yet.
pub fn plan_range(
    state: ScanState,
    next_block: u64,
    latest: u64,
    max_block_span: u64,
) -> Option<(u64, u64)> {
    if next_block > latest {
        return None;
    }
    let span = match state {
        ScanState::LiveTailing => 1,
        _ => max_block_span.max(1),
    };
    let end = next_block.saturating_add(span - 1).min(latest);
    Some((next_block, end))
}

/// The single sequential scan loop: advances a monotonic cursor over the
/// chain, decodes transfer logs, filters them against the watch set and
/// hands matches to the dispatcher. Never processes two ranges at once.
pub struct Scanner<S: LogSource> {
    source: S,
    watch: Arc<WatchSet>,
    dispatcher: Dispatcher,
    cursor: ScanCursor,
    state: ScanState,
    // Separate streaks: a healthy height probe must not hide that the same
    // range keeps failing.
    range_backoff: RetryBackoff,
    height_backoff: RetryBackoff,
    start_block: Option<u64>,
    scan_delay: Duration,
    max_block_span: u64,
    token_decimals: u8,
}

impl<S: LogSource> Scanner<S> {
    pub fn new(
        source: S,
        watch: Arc<WatchSet>,
        dispatcher: Dispatcher,
        config: &Config,
        token_decimals: u8,
    ) -> Self {
        Scanner {
            source,
            watch,
            dispatcher,
            cursor: ScanCursor::new(config.start_block.unwrap_or_default()),
            state: ScanState::Idle,
            range_backoff: RetryBackoff::new(config.retry_delay, config.error_retry_delay),
            height_backoff: RetryBackoff::new(config.retry_delay, config.error_retry_delay),
            start_block: config.start_block,
            scan_delay: config.scan_delay,
            max_block_span: config.max_block_span,
            token_decimals,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let Some(initial_height) = self.wait_for_height(&shutdown).await else {
            return Ok(());
        };

        let start = self.start_block.unwrap_or(initial_height);
        self.cursor = ScanCursor::new(start);
        self.state = scan_phase(start, initial_height);
        info!(
            "Starting scan at block {} (chain height {})",
            start, initial_height
        );

        while !shutdown.is_cancelled() {
            let Some(latest) = self.wait_for_height(&shutdown).await else {
                break;
            };

            if self.cursor.next_block() > latest {
                if self.state != ScanState::LiveTailing {
                    info!("Caught up to block {}. Watching for new blocks...", latest);
                    self.state = ScanState::LiveTailing;
                }
                if !self.pause(self.scan_delay, &shutdown).await {
                    break;
                }
                continue;
            }

            self.state = scan_phase(self.cursor.next_block(), latest);
            let Some((from_block, to_block)) =
                plan_range(self.state, self.cursor.next_block(), latest, self.max_block_span)
            else {
                continue;
            };

            debug!("Fetching logs for blocks {} to {}", from_block, to_block);
            match self.process_range(from_block, to_block).await {
                Ok(matched) => {
                    self.range_backoff.reset();
                    self.cursor.advance_to(to_block);
                    if matched > 0 {
                        info!(
                            "Matched {} transfer(s) in blocks {} to {}",
                            matched, from_block, to_block
                        );
                    }
                }
                Err(e) => {
                    // Cursor stays put: the identical range is retried.
                    let delay = self.range_backoff.next_delay();
                    warn!(
                        "Failed to process blocks {} to {}: {}. Retrying in {:?}",
                        from_block, to_block, e, delay
                    );
                    self.state = ScanState::Backoff;
                    if !self.pause(delay, &shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Scanner stopped before block {}", self.cursor.next_block());
        Ok(())
    }

    /// Fetches, decodes, filters and dispatches one range. Undecodable logs
    /// are skipped; a fetch failure leaves the whole range unprocessed.
    /// Returns how many transfers matched the watch set.
    async fn process_range(&self, from_block: u64, to_block: u64) -> Result<usize, WatchError> {
        let mut logs = self.source.transfer_logs(from_block, to_block).await?;
        debug!(
            "Received {} logs for blocks {} to {}",
            logs.len(),
            from_block,
            to_block
        );
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        let mut matched = 0;
        for log in &logs {
            match decode_transfer(log, self.token_decimals) {
                Ok(event) => {
                    let kind = MatchKind::classify(
                        self.watch.contains(event.from),
                        self.watch.contains(event.to),
                    );
                    if let Some(kind) = kind {
                        self.dispatcher.dispatch(&event, kind).await;
                        matched += 1;
                    }
                }
                Err(e) => {
                    warn!("Skipping log in blocks {} to {}: {}", from_block, to_block, e);
                }
            }
        }
        Ok(matched)
    }

    /// Current chain height, retrying with backoff until it succeeds or the
    /// token fires. None means shutdown.
    async fn wait_for_height(&mut self, shutdown: &CancellationToken) -> Option<u64> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            match self.source.latest_block_number().await {
                Ok(height) => {
                    self.height_backoff.reset();
                    return Some(height);
                }
                Err(e) => {
                    let delay = self.height_backoff.next_delay();
                    warn!("Failed to fetch chain height: {}. Retrying in {:?}", e, delay);
                    self.state = ScanState::Backoff;
                    if !self.pause(delay, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleeps unless the shutdown token fires first. False means shutdown.
    async fn pause(&self, delay: Duration, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}
