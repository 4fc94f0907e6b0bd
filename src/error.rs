//! Error taxonomy for scan sessions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid port range {start}-{end} (need 1 <= start <= end <= 65535)")]
    InvalidRange { start: i64, end: i64 },

    #[error("no target address supplied")]
    MissingAddress,

    #[error("unable to resolve {0}")]
    Unresolvable(String),

    #[error("bogon address: {0}")]
    Bogon(std::net::IpAddr),

    /// Aggregated counts disagree with the configured range. Always fatal.
    #[error("accounting invariant violated: {0}")]
    Accounting(String),

    #[error("cannot reconfigure while a scan is active")]
    ScanActive,

    #[error("scan cancelled")]
    Cancelled,

    #[error("failed to start worker {index}: {reason}")]
    WorkerSpawn { index: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, ScanError>;
