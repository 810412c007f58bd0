use serde::Deserialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::addr;
use crate::config::{
    DEFAULT_SCAN_CONCURRENCY, DEFAULT_SCAN_TIMEOUT_MS, SCAN_CONCURRENCY, SCAN_TIMEOUT_MS,
};
use crate::error::ScanError;
use crate::pool::BoundedPool;
use crate::ports;
use crate::probe::PortProber;
use crate::types::{ProbeResult, ScanReport};

/// Caller-supplied scan parameters, as they arrive over the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    #[serde(alias = "address")]
    pub ip: String,
    #[serde(default)]
    pub ports: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_SCAN_TIMEOUT_MS
}

fn default_concurrency() -> usize {
    DEFAULT_SCAN_CONCURRENCY
}

impl ScanRequest {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ports: None,
            timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            concurrency: DEFAULT_SCAN_CONCURRENCY,
        }
    }

    pub fn ports(mut self, spec: impl Into<String>) -> Self {
        self.ports = Some(spec.into());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    /// Check every bound and the address policy. Performs no I/O.
    pub fn validate(&self) -> Result<ScanPlan, ScanError> {
        let address = addr::parse_private_ipv4(&self.ip)?;
        if !SCAN_TIMEOUT_MS.contains(&self.timeout_ms) {
            return Err(ScanError::TimeoutOutOfRange {
                got: self.timeout_ms,
                min: *SCAN_TIMEOUT_MS.start(),
                max: *SCAN_TIMEOUT_MS.end(),
            });
        }
        if !SCAN_CONCURRENCY.contains(&self.concurrency) {
            return Err(ScanError::ConcurrencyOutOfRange {
                got: self.concurrency,
                min: *SCAN_CONCURRENCY.start(),
                max: *SCAN_CONCURRENCY.end(),
            });
        }
        Ok(ScanPlan {
            address,
            ports: ports::parse_port_spec(self.ports.as_deref()),
            timeout: Duration::from_millis(self.timeout_ms),
            concurrency: self.concurrency,
        })
    }
}

/// A validated scan, ready to run.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub address: Ipv4Addr,
    pub ports: Vec<u16>,
    pub timeout: Duration,
    pub concurrency: usize,
}

/// Validate `req`, then probe every requested port of the target with bounded concurrency.
///
/// Nothing touches the network unless validation passes. Resolves only once every
/// port has a terminal result; a probe that blows up is reported as a closed port
/// carrying the error instead of failing the scan.
pub async fn scan_ports(
    prober: Arc<dyn PortProber>,
    req: &ScanRequest,
) -> Result<ScanReport, ScanError> {
    let plan = req.validate()?;
    Ok(run_plan(prober, plan).await)
}

pub async fn run_plan(prober: Arc<dyn PortProber>, plan: ScanPlan) -> ScanReport {
    let ScanPlan {
        address,
        ports,
        timeout,
        concurrency,
    } = plan;
    let started = Instant::now();

    let raw = BoundedPool::new(concurrency)
        .run(
            ports,
            |port| {
                let prober = prober.clone();
                async move { prober.probe(address, port, timeout).await }
            },
            |port, fault| ProbeResult::failed(address, port, fault.to_string()),
        )
        .await;

    let report = ScanReport::from_results(address, raw);
    info!(
        %address,
        scanned = report.scanned,
        open = report.open_count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "port scan finished"
    );
    report
}
