//! Periodic liveness sweep over every registered host.
//!
//! ```text
//! start() ─► Running(tick) ─► Idle ─(interval − elapsed)─► Running(tick) ─► …
//!                                │
//!                           stop() ─► Stopped
//! ```
//!
//! - The first tick runs immediately.
//! - A tick loads all hosts, pings them through a [`BoundedPool`], diffs against the
//!   stored state and writes one batched update.
//! - The next tick is armed only after the current one (write included) has finished,
//!   so ticks never overlap. Its delay is the interval minus the time the tick took.
//! - A failing tick is logged and the loop carries on.
//! - Reachability errors are logged up to [`ErrorLogBudget`] per tick; the rest are
//!   only counted.
//! - [`SweepHandle::stop`] prevents further ticks; an in-flight tick finishes.

use futures::FutureExt;
use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use ::time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::config::SweepConfig;
use crate::error::RegistryError;
use crate::pool::BoundedPool;
use crate::reach::Reachability;
use crate::registry::HostRegistry;
use crate::types::{HostState, HostUpdate, TickSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Running,
    Stopped,
}

/// Published after every state change of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepStatus {
    pub state: SweepState,
    /// Ticks finished so far, failed ones included.
    pub ticks: u64,
    pub last: Option<TickSummary>,
}

pub struct LivenessSweep {
    registry: Arc<dyn HostRegistry>,
    reach: Arc<dyn Reachability>,
    config: SweepConfig,
}

impl LivenessSweep {
    pub fn new(
        registry: Arc<dyn HostRegistry>,
        reach: Arc<dyn Reachability>,
        config: SweepConfig,
    ) -> Self {
        Self {
            registry,
            reach,
            config,
        }
    }

    /// Spawn the loop. The returned handle owns it.
    pub fn start(self) -> SweepHandle {
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(SweepStatus {
            state: SweepState::Idle,
            ticks: 0,
            last: None,
        });
        let task = tokio::spawn(self.run(cancel.clone(), status_tx));
        SweepHandle {
            cancel,
            status: status_rx,
            task,
        }
    }

    async fn run(self, cancel: CancellationToken, status: watch::Sender<SweepStatus>) {
        info!(
            interval_secs = self.config.interval.as_secs_f64(),
            concurrency = self.config.concurrency,
            timeout_ms = self.config.probe_timeout.as_millis() as u64,
            "liveness sweep started"
        );

        while !cancel.is_cancelled() {
            let started = Instant::now();
            status.send_modify(|s| s.state = SweepState::Running);

            let outcome = AssertUnwindSafe(self.tick_at(OffsetDateTime::now_utc()))
                .catch_unwind()
                .await;
            let last = match outcome {
                Ok(Ok(summary)) => Some(summary),
                Ok(Err(e)) => {
                    error!(error = %e, "liveness tick failed");
                    None
                }
                Err(_) => {
                    error!("liveness tick panicked");
                    None
                }
            };
            status.send_modify(|s| {
                s.state = SweepState::Idle;
                s.ticks += 1;
                if last.is_some() {
                    s.last = last;
                }
            });

            let delay = self.config.interval.saturating_sub(started.elapsed());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = time::sleep(delay) => {}
            }
        }

        status.send_modify(|s| s.state = SweepState::Stopped);
        info!("liveness sweep stopped");
    }

    /// Run one tick, stamping every write with `now`.
    pub async fn tick_at(&self, now: OffsetDateTime) -> Result<TickSummary, RegistryError> {
        let hosts = self.registry.load_states().await?;
        let budget = Arc::new(ErrorLogBudget::new(self.config.error_log_budget));
        let timeout = self.config.probe_timeout;

        let observed = BoundedPool::new(self.config.concurrency)
            .run(
                hosts,
                |host: HostState| {
                    let reach = self.reach.clone();
                    let budget = budget.clone();
                    async move {
                        let alive = match reach.is_alive(host.address, timeout).await {
                            Ok(alive) => alive,
                            Err(e) => {
                                budget.record(host.address, &e);
                                false
                            }
                        };
                        (host, alive)
                    }
                },
                |host, _| (host, false),
            )
            .await;

        let mut summary = TickSummary {
            checked: observed.len(),
            check_errors: budget.seen(),
            errors_logged: budget.logged(),
            ..TickSummary::default()
        };
        let mut updates = Vec::with_capacity(observed.len());
        for (host, alive) in &observed {
            let update = HostUpdate::from_observation(host, *alive, now);
            match update.transition {
                Some(true) => {
                    summary.went_online += 1;
                    info!(address = %host.address, id = host.id, "host went online");
                }
                Some(false) => {
                    summary.went_offline += 1;
                    info!(address = %host.address, id = host.id, "host went offline");
                }
                None => {}
            }
            if *alive {
                summary.online += 1;
            }
            updates.push(update);
        }

        if !updates.is_empty() {
            let outcome = self.registry.apply_updates(updates).await?;
            summary.failed_writes = outcome.failed.len();
            for (id, e) in &outcome.failed {
                warn!(id, error = %e, "host liveness update failed");
            }
        }

        debug!(
            checked = summary.checked,
            online = summary.online,
            went_online = summary.went_online,
            went_offline = summary.went_offline,
            failed_writes = summary.failed_writes,
            check_errors = summary.check_errors,
            "liveness tick finished"
        );
        Ok(summary)
    }
}

/// Caps how many reachability errors one tick writes to the log.
#[derive(Debug)]
pub struct ErrorLogBudget {
    remaining: AtomicUsize,
    seen: AtomicUsize,
    logged: AtomicUsize,
}

impl ErrorLogBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(limit),
            seen: AtomicUsize::new(0),
            logged: AtomicUsize::new(0),
        }
    }

    /// Count the error and log it while budget remains. Returns whether it was logged.
    pub fn record(&self, ip: Ipv4Addr, e: &anyhow::Error) -> bool {
        self.seen.fetch_add(1, Ordering::Relaxed);
        let Ok(prev) = self
            .remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| b.checked_sub(1))
        else {
            return false;
        };
        self.logged.fetch_add(1, Ordering::Relaxed);
        warn!(address = %ip, error = %e, "reachability check failed");
        if prev == 1 {
            warn!("further reachability errors suppressed for this tick");
        }
        true
    }

    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::Relaxed)
    }

    pub fn logged(&self) -> usize {
        self.logged.load(Ordering::Relaxed)
    }
}

/// Owner of a running sweep.
pub struct SweepHandle {
    cancel: CancellationToken,
    status: watch::Receiver<SweepStatus>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Prevent any further tick. Idempotent; an in-flight tick runs to completion.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("stopping liveness sweep");
        }
        self.cancel.cancel();
    }

    pub fn status(&self) -> SweepStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SweepStatus> {
        self.status.clone()
    }

    /// Wait for the loop to exit. Call after [`stop`](Self::stop).
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "liveness sweep task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_logs_until_exhausted() {
        let budget = ErrorLogBudget::new(2);
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let e = anyhow::anyhow!("ping binary missing");
        let logged: Vec<bool> = (0..4).map(|_| budget.record(ip, &e)).collect();
        assert_eq!(logged, vec![true, true, false, false]);
        assert_eq!(budget.seen(), 4);
        assert_eq!(budget.logged(), 2);
    }

    #[test]
    fn zero_budget_logs_nothing() {
        let budget = ErrorLogBudget::new(0);
        assert!(!budget.record(Ipv4Addr::new(10, 0, 0, 1), &anyhow::anyhow!("x")));
        assert_eq!(budget.seen(), 1);
        assert_eq!(budget.logged(), 0);
    }
}
