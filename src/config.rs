use std::ops::RangeInclusive;
use std::time::Duration;

/// Accepted per-probe timeout for on-demand scans, in milliseconds.
pub const SCAN_TIMEOUT_MS: RangeInclusive<u64> = 100..=20_000;
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 100;

/// Accepted number of in-flight probes for on-demand scans.
pub const SCAN_CONCURRENCY: RangeInclusive<usize> = 1..=1024;
pub const DEFAULT_SCAN_CONCURRENCY: usize = 64;

/// Ports that get a TLS handshake after connect.
pub const TLS_PORTS: &[u16] = &[443, 8443, 9443, 6443];

/// Ports that get a plaintext `HEAD /` after connect.
pub const HTTP_PORTS: &[u16] = &[80, 8080, 8000, 8888];

/// How long an otherwise unrecognised open port is watched for unsolicited data.
pub const LISTEN_GRACE: Duration = Duration::from_millis(500);
pub const HTTP_GRACE: Duration = Duration::from_millis(500);
pub const LINE_PROBE_GRACE: Duration = Duration::from_millis(300);
pub const TLS_HANDSHAKE_GRACE: Duration = Duration::from_millis(1800);

/// Upper bound on the whole post-connect phase; settles a connected probe as open.
pub const POST_CONNECT_CEILING: Duration = Duration::from_millis(2500);

pub const BANNER_MAX_CHARS: usize = 800;

/// Tunables of the periodic liveness sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Target spacing between tick starts.
    pub interval: Duration,
    /// Maximum reachability probes in flight.
    pub concurrency: usize,
    /// Per-host probe timeout.
    pub probe_timeout: Duration,
    /// Per-tick number of probe errors that get logged individually.
    pub error_log_budget: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            concurrency: 50,
            probe_timeout: Duration::from_secs(1),
            error_log_budget: 10,
        }
    }
}
