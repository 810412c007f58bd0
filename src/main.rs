use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use netdesk_probe::config::{SweepConfig, DEFAULT_SCAN_CONCURRENCY, DEFAULT_SCAN_TIMEOUT_MS};
use netdesk_probe::probe::TcpProber;
use netdesk_probe::reach::PingProbe;
use netdesk_probe::registry::MemoryRegistry;
use netdesk_probe::scanner::{self, ScanRequest};
use netdesk_probe::server::{self, AppState};
use netdesk_probe::sweep::LivenessSweep;
use netdesk_probe::types::ScanReport;

/// netdesk-probe — private-network port scanner and host liveness sweeper.
#[derive(Debug, Clone, Parser)]
#[command(name = "netdesk-probe", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Serve the scan API and run the liveness sweep over the host registry.
    Serve {
        /// Address to bind the HTTP API to.
        #[arg(long, env = "NETDESK_BIND", default_value = "0.0.0.0:5138")]
        bind: String,

        /// JSON file with the registered hosts (`[{"id": 1, "address": "10.0.0.5"}]`).
        #[arg(long, env = "NETDESK_HOSTS")]
        hosts: Option<PathBuf>,

        /// Seconds between liveness tick starts.
        #[arg(long, env = "NETDESK_SWEEP_INTERVAL_SECS", default_value_t = 30)]
        sweep_interval_secs: u64,

        /// Max concurrent pings per tick.
        #[arg(long, env = "NETDESK_SWEEP_CONCURRENCY", default_value_t = 50)]
        sweep_concurrency: usize,

        /// Per-host ping timeout in seconds.
        #[arg(long, env = "NETDESK_PING_TIMEOUT_SECS", default_value_t = 1)]
        ping_timeout_secs: u64,

        /// Do not start the liveness sweep.
        #[arg(long, default_value_t = false)]
        no_sweep: bool,
    },

    /// Scan one private IPv4 host and print the open ports.
    Scan {
        /// Target address (RFC1918 only).
        ip: String,

        /// Ports, e.g. `22,80,1000-1010`. Omit for all ports.
        #[arg(long)]
        ports: Option<String>,

        /// Per-probe connect timeout in milliseconds.
        #[arg(long = "timeout-ms", default_value_t = DEFAULT_SCAN_TIMEOUT_MS)]
        timeout_ms: u64,

        /// Max concurrent probes.
        #[arg(long, default_value_t = DEFAULT_SCAN_CONCURRENCY)]
        concurrency: usize,

        /// Write the full report as pretty JSON to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            bind,
            hosts,
            sweep_interval_secs,
            sweep_concurrency,
            ping_timeout_secs,
            no_sweep,
        } => {
            let registry = match hosts {
                Some(path) => Arc::new(
                    MemoryRegistry::from_json_file(&path)
                        .await
                        .with_context(|| format!("failed to load hosts file: {}", path.display()))?,
                ),
                None => {
                    warn!("no hosts file given; registry starts empty");
                    Arc::new(MemoryRegistry::default())
                }
            };

            let sweep = (!no_sweep).then(|| {
                LivenessSweep::new(
                    registry.clone(),
                    Arc::new(PingProbe),
                    SweepConfig {
                        interval: Duration::from_secs(sweep_interval_secs),
                        concurrency: sweep_concurrency,
                        probe_timeout: Duration::from_secs(ping_timeout_secs),
                        ..SweepConfig::default()
                    },
                )
                .start()
            });

            let state = AppState {
                prober: Arc::new(TcpProber),
                registry,
            };
            let served = server::serve(&bind, state, shutdown_signal()).await;

            if let Some(sweep) = sweep {
                sweep.stop();
                sweep.join().await;
            }
            served
        }
        Command::Scan {
            ip,
            ports,
            timeout_ms,
            concurrency,
            output,
        } => {
            let mut req = ScanRequest::new(ip)
                .timeout_ms(timeout_ms)
                .concurrency(concurrency);
            req.ports = ports;
            let report = scanner::scan_ports(Arc::new(TcpProber), &req).await?;
            print_report_table(&report);
            if let Some(path) = output.as_deref() {
                write_report_json(path, &report)
                    .with_context(|| format!("failed to write JSON to {}", path.display()))?;
                info!(path = %path.display(), "wrote JSON report");
            }
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}

fn print_report_table(report: &ScanReport) {
    let port_w = 5usize;
    let proto_w = 5usize;
    let rtt_w = "rtt_ms".len();
    let mut banner_w = "banner".len();
    for r in &report.open {
        if let Some(b) = &r.banner {
            banner_w = banner_w.max(b.chars().count().min(60));
        }
    }

    println!(
        "\n{}: {} open of {} scanned",
        report.address, report.open_count, report.scanned
    );
    println!(
        "{:>port_w$}  {:<proto_w$}  {:>rtt_w$}  {:<banner_w$}",
        "port", "proto", "rtt_ms", "banner"
    );
    println!(
        "{:-<port_w$}  {:-<proto_w$}  {:-<rtt_w$}  {:-<banner_w$}",
        "", "", "", ""
    );
    for r in &report.open {
        let bsnip: String = r.banner.as_deref().unwrap_or_default().chars().take(60).collect();
        let proto = format!("{:?}", r.protocol_hint).to_lowercase();
        println!(
            "{:>port_w$}  {:<proto_w$}  {:>rtt_w$}  {:<banner_w$}",
            r.port, proto, r.rtt_ms, bsnip
        );
    }
}

fn write_report_json(path: &std::path::Path, report: &ScanReport) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
