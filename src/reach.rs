use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;

/// "Is this host up" check used by the liveness sweep.
#[async_trait]
pub trait Reachability: Send + Sync {
    /// `Ok(false)` is a normal answer; `Err` means the check itself could not run.
    async fn is_alive(&self, ip: Ipv4Addr, timeout: Duration) -> Result<bool>;
}

/// ICMP echo through the system `ping` binary, so no raw-socket privileges are needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingProbe;

/// Extra time granted to the child process on top of the reply timeout.
const PROCESS_SLACK: Duration = Duration::from_secs(1);

#[async_trait]
impl Reachability for PingProbe {
    async fn is_alive(&self, ip: Ipv4Addr, timeout: Duration) -> Result<bool> {
        let mut cmd = Command::new("ping");
        cmd.args(ping_args(ip, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match time::timeout(timeout + PROCESS_SLACK, cmd.status()).await {
            Ok(status) => Ok(status
                .with_context(|| format!("failed to run ping for {ip}"))?
                .success()),
            Err(_) => Ok(false),
        }
    }
}

/// Single echo request, reply deadline derived from `timeout`.
pub fn ping_args(ip: Ipv4Addr, timeout: Duration) -> Vec<String> {
    let secs = timeout.as_secs().max(1).to_string();
    let ip = ip.to_string();
    if cfg!(windows) {
        let ms = timeout.as_millis().max(1).to_string();
        vec!["-n".into(), "1".into(), "-w".into(), ms, ip]
    } else if cfg!(target_os = "macos") {
        vec!["-c".into(), "1".into(), "-t".into(), secs, ip]
    } else {
        vec!["-c".into(), "1".into(), "-W".into(), secs, ip]
    }
}
