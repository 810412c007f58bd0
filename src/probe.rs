//! Single `address:port` reachability probe.
//!
//! A probe is driven by two independent tasks that race to settle it:
//! - the I/O task connects, then runs a protocol follow-up (TLS handshake,
//!   `HEAD /`, a one-line ping) or just waits for unsolicited data;
//! - the deadline task fires the connect timeout and, later, the post-connect ceiling.
//!
//! Both report [`ProbeEvent`]s into a shared [`ProbeLatch`]. The latch walks
//! `Pending → Connected → {Resolved | TimedOut | Errored}` and hands exactly one
//! [`Settlement`] to the waiting caller; every event after that is ignored.
//! Once settled, both tasks are aborted, which drops (and closes) the socket.

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::trace;

use crate::config::{
    BANNER_MAX_CHARS, HTTP_GRACE, HTTP_PORTS, LINE_PROBE_GRACE, LISTEN_GRACE,
    POST_CONNECT_CEILING, TLS_HANDSHAKE_GRACE, TLS_PORTS,
};
use crate::types::{ProbeResult, ProtocolHint};

/// Probe lifecycle. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    Pending,
    Connected,
    Resolved,
    TimedOut,
    Errored,
}

impl ProbePhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProbePhase::Resolved | ProbePhase::TimedOut | ProbePhase::Errored
        )
    }
}

/// Things that can happen to a probe, in whatever order the network delivers them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    Connected,
    /// Bytes read from the peer, already sanitised.
    Data(String),
    /// A protocol follow-up finished, with or without a banner.
    FollowUp(Option<String>),
    /// A post-connect wait ran out without data.
    GraceElapsed,
    ConnectTimeout,
    SocketError(String),
}

/// Whether an event moved the latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fired {
    Advanced,
    Settled,
    Ignored,
}

/// Terminal outcome handed to the waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub phase: ProbePhase,
    pub open: bool,
    pub banner: Option<String>,
    pub error: Option<String>,
    pub timed_out: bool,
    pub rtt_ms: u64,
}

struct LatchInner {
    phase: ProbePhase,
    started: Instant,
    waiter: Option<oneshot::Sender<Settlement>>,
}

/// One-shot settlement guard shared by every event source of a probe.
#[derive(Clone)]
pub struct ProbeLatch {
    inner: Arc<Mutex<LatchInner>>,
}

impl ProbeLatch {
    pub fn new() -> (Self, oneshot::Receiver<Settlement>) {
        let (tx, rx) = oneshot::channel();
        let latch = Self {
            inner: Arc::new(Mutex::new(LatchInner {
                phase: ProbePhase::Pending,
                started: Instant::now(),
                waiter: Some(tx),
            })),
        };
        (latch, rx)
    }

    pub fn phase(&self) -> ProbePhase {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .phase
    }

    /// Apply `event`. Returns [`Fired::Settled`] for exactly one call over the latch's life.
    pub fn fire(&self, event: ProbeEvent) -> Fired {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(next) = transition(inner.phase, event) else {
            return Fired::Ignored;
        };

        match next {
            Step::Advance(phase) => {
                inner.phase = phase;
                Fired::Advanced
            }
            Step::Settle(outcome) => {
                inner.phase = outcome.phase;
                let settlement = Settlement {
                    phase: outcome.phase,
                    open: outcome.open,
                    banner: outcome.banner,
                    error: outcome.error,
                    timed_out: outcome.timed_out,
                    rtt_ms: inner.started.elapsed().as_millis() as u64,
                };
                if let Some(tx) = inner.waiter.take() {
                    // The waiter may have given up; the probe is still settled.
                    let _ = tx.send(settlement);
                }
                Fired::Settled
            }
        }
    }
}

struct Outcome {
    phase: ProbePhase,
    open: bool,
    banner: Option<String>,
    error: Option<String>,
    timed_out: bool,
}

enum Step {
    Advance(ProbePhase),
    Settle(Outcome),
}

fn transition(phase: ProbePhase, event: ProbeEvent) -> Option<Step> {
    use ProbeEvent as E;
    use ProbePhase as P;

    let open = |banner: Option<String>| {
        Step::Settle(Outcome {
            phase: P::Resolved,
            open: true,
            banner,
            error: None,
            timed_out: false,
        })
    };

    match (phase, event) {
        (P::Pending, E::Connected) => Some(Step::Advance(P::Connected)),
        (P::Pending, E::ConnectTimeout) => Some(Step::Settle(Outcome {
            phase: P::TimedOut,
            open: false,
            banner: None,
            error: None,
            timed_out: true,
        })),
        (P::Pending, E::SocketError(e)) => Some(Step::Settle(Outcome {
            phase: P::Errored,
            open: false,
            banner: None,
            error: Some(e),
            timed_out: false,
        })),
        // Nothing can be read before the connect completes.
        (P::Pending, E::Data(_) | E::FollowUp(_) | E::GraceElapsed) => None,

        (P::Connected, E::Data(b)) => Some(open(Some(b))),
        (P::Connected, E::FollowUp(b)) => Some(open(b)),
        // A connected port stays open no matter how the conversation ends.
        (P::Connected, E::GraceElapsed | E::SocketError(_)) => Some(open(None)),
        // The connect timeout only governs the connect phase.
        (P::Connected, E::ConnectTimeout | E::Connected) => None,

        (_, _) => None,
    }
}

/// What to do with a socket once it is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    Tls,
    Http,
    Line {
        payload: &'static [u8],
        grace: Duration,
    },
    Listen(Duration),
}

impl FollowUp {
    pub fn for_port(port: u16) -> Self {
        if TLS_PORTS.contains(&port) {
            return FollowUp::Tls;
        }
        if HTTP_PORTS.contains(&port) {
            return FollowUp::Http;
        }
        match port {
            6379 => FollowUp::Line {
                payload: b"*1\r\n$4\r\nPING\r\n",
                grace: LINE_PROBE_GRACE,
            },
            11211 => FollowUp::Line {
                payload: b"version\r\n",
                grace: LINE_PROBE_GRACE,
            },
            _ => FollowUp::Listen(LISTEN_GRACE),
        }
    }
}

/// Probe `ip:port`, bounding the connect phase by `connect_timeout`.
///
/// Always resolves; refused, unreachable and timed-out connects are encoded in the
/// result rather than returned as errors.
pub async fn probe_port(ip: Ipv4Addr, port: u16, connect_timeout: Duration) -> ProbeResult {
    probe_port_with(ip, port, FollowUp::for_port(port), connect_timeout).await
}

/// [`probe_port`] with an explicit follow-up instead of the per-port table.
pub async fn probe_port_with(
    ip: Ipv4Addr,
    port: u16,
    follow_up: FollowUp,
    connect_timeout: Duration,
) -> ProbeResult {
    let connect = TcpStream::connect(SocketAddrV4::new(ip, port));
    settle(ip, port, follow_up, connect_timeout, connect).await
}

async fn settle<C>(
    ip: Ipv4Addr,
    port: u16,
    follow_up: FollowUp,
    connect_timeout: Duration,
    connect: C,
) -> ProbeResult
where
    C: Future<Output = io::Result<TcpStream>> + Send + 'static,
{
    let (latch, settled) = ProbeLatch::new();
    let mut tasks = JoinSet::new();

    let deadline = latch.clone();
    tasks.spawn(async move {
        time::sleep(connect_timeout).await;
        deadline.fire(ProbeEvent::ConnectTimeout);
        time::sleep(POST_CONNECT_CEILING).await;
        deadline.fire(ProbeEvent::GraceElapsed);
    });
    tasks.spawn(drive(ip, follow_up, connect, latch));

    let settlement = settled.await;
    // Dropping the I/O task closes the socket on every exit path.
    tasks.abort_all();

    let protocol_hint = match follow_up {
        FollowUp::Tls => ProtocolHint::Tls,
        _ => ProtocolHint::Tcp,
    };
    match settlement {
        Ok(s) => {
            trace!(%ip, port, phase = ?s.phase, open = s.open, "probe settled");
            ProbeResult {
                address: ip,
                port,
                open: s.open,
                rtt_ms: s.rtt_ms,
                protocol_hint,
                banner: s.banner,
                error: s.error,
                timed_out: s.timed_out,
            }
        }
        Err(_) => ProbeResult::failed(ip, port, "probe abandoned before settling"),
    }
}

async fn drive<C>(ip: Ipv4Addr, follow_up: FollowUp, connect: C, latch: ProbeLatch)
where
    C: Future<Output = io::Result<TcpStream>>,
{
    let mut stream = match connect.await {
        Ok(s) => s,
        Err(e) => {
            latch.fire(ProbeEvent::SocketError(e.to_string()));
            return;
        }
    };
    if latch.fire(ProbeEvent::Connected) != Fired::Advanced {
        return;
    }

    let event = match follow_up {
        FollowUp::Tls => tls_banner(ip, stream).await,
        FollowUp::Http => {
            let request = format!("HEAD / HTTP/1.0\r\nHost: {ip}\r\n\r\n");
            match stream.write_all(request.as_bytes()).await {
                Ok(()) => read_banner(&mut stream, HTTP_GRACE).await,
                Err(e) => ProbeEvent::SocketError(e.to_string()),
            }
        }
        FollowUp::Line { payload, grace } => match stream.write_all(payload).await {
            Ok(()) => read_banner(&mut stream, grace).await,
            Err(e) => ProbeEvent::SocketError(e.to_string()),
        },
        FollowUp::Listen(grace) => read_banner(&mut stream, grace).await,
    };
    latch.fire(event);
}

/// Wait up to `grace` for the peer to say something.
async fn read_banner(stream: &mut TcpStream, grace: Duration) -> ProbeEvent {
    let mut buf = vec![0u8; 1024];
    match time::timeout(grace, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => ProbeEvent::Data(sanitize_banner(&buf[..n])),
        Ok(Ok(_)) => ProbeEvent::GraceElapsed,
        Ok(Err(e)) => ProbeEvent::SocketError(e.to_string()),
        Err(_) => ProbeEvent::GraceElapsed,
    }
}

/// Best-effort TLS handshake with verification off; only used to label the port.
async fn tls_banner(ip: Ipv4Addr, stream: TcpStream) -> ProbeEvent {
    let connector = match native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .use_sni(false)
        .build()
    {
        Ok(c) => tokio_native_tls::TlsConnector::from(c),
        Err(_) => return ProbeEvent::FollowUp(None),
    };

    match time::timeout(TLS_HANDSHAKE_GRACE, connector.connect(&ip.to_string(), stream)).await {
        Ok(Ok(tls)) => {
            let cn = tls
                .get_ref()
                .peer_certificate()
                .ok()
                .flatten()
                .and_then(|cert| cert.to_der().ok())
                .and_then(|der| common_name(&der));
            ProbeEvent::FollowUp(Some(format!("TLS · CN={}", cn.as_deref().unwrap_or("?"))))
        }
        _ => ProbeEvent::FollowUp(None),
    }
}

fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

/// Lossy UTF-8, CR/LF escaped, capped in length.
pub fn sanitize_banner(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .chars()
        .take(BANNER_MAX_CHARS)
        .collect()
}

/// Seam between the scan orchestrator and the network.
#[async_trait]
pub trait PortProber: Send + Sync {
    async fn probe(&self, ip: Ipv4Addr, port: u16, timeout: Duration) -> ProbeResult;
}

/// Real TCP/TLS prober.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl PortProber for TcpProber {
    async fn probe(&self, ip: Ipv4Addr, port: u16, timeout: Duration) -> ProbeResult {
        probe_port(ip, port, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permutations(events: &[ProbeEvent]) -> Vec<Vec<ProbeEvent>> {
        if events.len() <= 1 {
            return vec![events.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..events.len() {
            let mut rest = events.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn overlapping_events_settle_exactly_once() {
        let events = [
            ProbeEvent::Connected,
            ProbeEvent::Data("SSH-2.0-OpenSSH".into()),
            ProbeEvent::ConnectTimeout,
            ProbeEvent::SocketError("connection reset".into()),
        ];
        for order in permutations(&events) {
            let (latch, mut rx) = ProbeLatch::new();
            let settled = order
                .iter()
                .cloned()
                .map(|e| latch.fire(e))
                .filter(|f| *f == Fired::Settled)
                .count();
            assert_eq!(settled, 1, "order {order:?}");
            assert!(latch.phase().is_terminal());
            assert!(rx.try_recv().is_ok());
        }
    }

    #[test]
    fn first_terminal_event_wins() {
        let (latch, mut rx) = ProbeLatch::new();
        latch.fire(ProbeEvent::Connected);
        assert_eq!(latch.fire(ProbeEvent::Data("+PONG".into())), Fired::Settled);
        assert_eq!(latch.fire(ProbeEvent::SocketError("late".into())), Fired::Ignored);
        assert_eq!(latch.fire(ProbeEvent::GraceElapsed), Fired::Ignored);

        let s = rx.try_recv().unwrap();
        assert_eq!(s.phase, ProbePhase::Resolved);
        assert!(s.open);
        assert_eq!(s.banner.as_deref(), Some("+PONG"));
        assert!(s.error.is_none());
    }

    #[test]
    fn connect_timeout_ignored_once_connected() {
        let (latch, mut rx) = ProbeLatch::new();
        latch.fire(ProbeEvent::Connected);
        assert_eq!(latch.fire(ProbeEvent::ConnectTimeout), Fired::Ignored);
        assert_eq!(latch.phase(), ProbePhase::Connected);
        assert_eq!(latch.fire(ProbeEvent::GraceElapsed), Fired::Settled);
        let s = rx.try_recv().unwrap();
        assert!(s.open);
        assert!(s.banner.is_none());
    }

    #[test]
    fn pending_timeout_and_error_are_closed() {
        let (latch, mut rx) = ProbeLatch::new();
        assert_eq!(latch.fire(ProbeEvent::Data("ghost".into())), Fired::Ignored);
        latch.fire(ProbeEvent::ConnectTimeout);
        let s = rx.try_recv().unwrap();
        assert_eq!(s.phase, ProbePhase::TimedOut);
        assert!(!s.open && s.timed_out);

        let (latch, mut rx) = ProbeLatch::new();
        latch.fire(ProbeEvent::SocketError("connection refused".into()));
        let s = rx.try_recv().unwrap();
        assert_eq!(s.phase, ProbePhase::Errored);
        assert_eq!(s.error.as_deref(), Some("connection refused"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_firing_settles_once() {
        let (latch, _rx) = ProbeLatch::new();
        latch.fire(ProbeEvent::Connected);
        let mut set = JoinSet::new();
        for i in 0..64 {
            let latch = latch.clone();
            set.spawn(async move {
                let event = match i % 3 {
                    0 => ProbeEvent::Data(format!("d{i}")),
                    1 => ProbeEvent::GraceElapsed,
                    _ => ProbeEvent::SocketError(format!("e{i}")),
                };
                latch.fire(event)
            });
        }
        let mut settled = 0;
        while let Some(res) = set.join_next().await {
            if res.unwrap() == Fired::Settled {
                settled += 1;
            }
        }
        assert_eq!(settled, 1);
    }

    #[test]
    fn banner_is_escaped_and_capped() {
        assert_eq!(sanitize_banner(b"HTTP/1.0 200 OK\r\n"), "HTTP/1.0 200 OK\\r\\n");
        let long = vec![b'a'; BANNER_MAX_CHARS * 2];
        assert_eq!(sanitize_banner(&long).len(), BANNER_MAX_CHARS);
    }

    #[test]
    fn follow_up_table() {
        assert_eq!(FollowUp::for_port(8443), FollowUp::Tls);
        assert_eq!(FollowUp::for_port(8080), FollowUp::Http);
        assert!(matches!(FollowUp::for_port(6379), FollowUp::Line { .. }));
        assert_eq!(FollowUp::for_port(22), FollowUp::Listen(LISTEN_GRACE));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connect_times_out_closed() {
        let stalled = std::future::pending::<io::Result<TcpStream>>();
        let ip = Ipv4Addr::new(10, 0, 0, 9);
        let started = Instant::now();
        let r = settle(ip, 9, FollowUp::for_port(9), Duration::from_millis(100), stalled).await;
        assert!(!r.open);
        assert!(r.timed_out);
        assert!(r.error.is_none());
        assert!(r.banner.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < POST_CONNECT_CEILING);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_reports_error() {
        let refused = async {
            Err::<TcpStream, _>(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        };
        let ip = Ipv4Addr::new(10, 0, 0, 9);
        let r = settle(ip, 443, FollowUp::Tls, Duration::from_secs(1), refused).await;
        assert!(!r.open);
        assert!(!r.timed_out);
        assert_eq!(r.error.as_deref(), Some("refused"));
        assert_eq!(r.protocol_hint, ProtocolHint::Tls);
    }
}
