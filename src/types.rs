use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use time::OffsetDateTime;

/// Transport used to classify an open port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolHint {
    Tcp,
    Tls,
}

/// Outcome of probing one `address:port` pair. Never persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub address: Ipv4Addr,
    pub port: u16,
    pub open: bool,
    pub rtt_ms: u64,
    pub protocol_hint: ProtocolHint,
    pub banner: Option<String>,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl ProbeResult {
    /// Degraded result for a probe that failed outside the normal closed/open paths.
    pub fn failed(address: Ipv4Addr, port: u16, cause: impl Into<String>) -> Self {
        Self {
            address,
            port,
            open: false,
            rtt_ms: 0,
            protocol_hint: ProtocolHint::for_port(port),
            banner: None,
            error: Some(cause.into()),
            timed_out: false,
        }
    }
}

impl ProtocolHint {
    pub fn for_port(port: u16) -> Self {
        if crate::config::TLS_PORTS.contains(&port) {
            ProtocolHint::Tls
        } else {
            ProtocolHint::Tcp
        }
    }
}

/// Aggregate of one on-demand scan.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub address: Ipv4Addr,
    pub scanned: usize,
    pub open_count: usize,
    /// Open ports only, ascending by port.
    pub open: Vec<ProbeResult>,
    /// Every attempted port in completion order.
    pub raw: Vec<ProbeResult>,
}

impl ScanReport {
    pub fn from_results(address: Ipv4Addr, raw: Vec<ProbeResult>) -> Self {
        let mut open: Vec<ProbeResult> = raw.iter().filter(|r| r.open).cloned().collect();
        open.sort_by_key(|r| r.port);
        Self {
            address,
            scanned: raw.len(),
            open_count: open.len(),
            open,
            raw,
        }
    }
}

pub type HostId = u64;

/// A registered host as stored by the registry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: HostId,
    pub address: Ipv4Addr,
    pub sort_key: u32,
    pub is_online: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_checked: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_status_change: Option<OffsetDateTime>,
}

impl Host {
    pub fn new(id: HostId, address: Ipv4Addr) -> Self {
        Self {
            id,
            address,
            sort_key: crate::addr::sort_key(address),
            is_online: false,
            last_checked: None,
            last_status_change: None,
        }
    }

    pub fn state(&self) -> HostState {
        HostState {
            id: self.id,
            address: self.address,
            is_online: self.is_online,
        }
    }
}

/// The projection the sweep reads on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostState {
    pub id: HostId,
    pub address: Ipv4Addr,
    pub is_online: bool,
}

/// One row of a sweep's batched write.
///
/// `last_checked` is always written; `is_online`/`last_status_change` only when
/// `transition` is `Some`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostUpdate {
    pub id: HostId,
    pub last_checked: OffsetDateTime,
    pub transition: Option<bool>,
}

impl HostUpdate {
    pub fn from_observation(prev: &HostState, alive: bool, now: OffsetDateTime) -> Self {
        Self {
            id: prev.id,
            last_checked: now,
            transition: (prev.is_online != alive).then_some(alive),
        }
    }
}

/// Counters for a finished sweep tick.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    pub checked: usize,
    pub online: usize,
    pub went_online: usize,
    pub went_offline: usize,
    pub failed_writes: usize,
    /// Reachability checks that errored rather than answered.
    pub check_errors: usize,
    /// How many of those were logged before the per-tick budget ran out.
    pub errors_logged: usize,
}
