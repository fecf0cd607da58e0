use thiserror::Error;

/// Failure modes of the watch pipeline. None of these are fatal: the scan
/// loop backs off on fetch errors, skips bad logs and bad watch-list
/// entries, and drops individual subscriber connections on delivery errors.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Network or RPC failure talking to the log source.
    #[error("log source error: {0}")]
    Fetch(String),

    /// A raw log did not match the transfer event shape.
    #[error("undecodable transfer log: {0}")]
    Decode(String),

    /// A watch-list entry could not be parsed as an address.
    #[error("invalid watch address {entry:?}: {reason}")]
    InvalidAddress { entry: String, reason: String },

    /// A subscriber send failed or timed out.
    #[error("delivery to connection {connection_id} failed: {reason}")]
    Delivery { connection_id: u64, reason: String },
}

impl WatchError {
    /// Whether the scanner should back off and retry the same range.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WatchError::Fetch(_))
    }
}
