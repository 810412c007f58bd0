use std::net::Ipv4Addr;
use thiserror::Error;

use crate::types::HostId;

/// Rejections raised before a scan touches the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("scanning is only allowed for private IPv4 addresses, got {0}")]
    PublicAddress(Ipv4Addr),

    #[error("timeout_ms must be within {min}..={max}, got {got}")]
    TimeoutOutOfRange { got: u64, min: u64, max: u64 },

    #[error("concurrency must be within {min}..={max}, got {got}")]
    ConcurrencyOutOfRange { got: usize, min: usize, max: usize },
}

/// Failures of the host registry collaborator.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("unknown host id {0}")]
    UnknownHost(HostId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A bounded-pool job that did not produce a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobFault {
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The task ended without reporting, e.g. it was aborted.
    #[error("job did not complete")]
    Aborted,
}
