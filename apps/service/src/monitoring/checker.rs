use std::io;
use std::net::IpAddr;
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use socket2::Type;
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::types::{ArpOutcome, Probe};

/// IPv4 + ICMP header bytes included in a device's configured packet size
const HEADER_BYTES: u16 = 28;

/// Reachability probes a monitor loop can issue.
///
/// Implementations never fail for unreachable targets: a timeout, a send
/// error or an unusable address is reported as a lost packet.
#[async_trait::async_trait]
pub trait PingProvider: Send + Sync {
    /// Send one ICMP echo request of `packet_size` bytes
    async fn probe_icmp(&self, ip: &str, packet_size: u16) -> Probe;

    /// Send one ARP request, or report that ARP is not available on this host
    async fn probe_arp(&self, ip: &str) -> ArpOutcome;
}

/// ICMP echo checker backed by surge-ping.
///
/// Raw sockets are tried first; without the privilege for them the checker
/// falls back to unprivileged datagram ICMP sockets. The choice is made once
/// per address family.
pub struct IcmpChecker {
    timeout_duration: Duration,
    v4: OnceCell<Client>,
    v6: OnceCell<Client>,
    socket_warned: AtomicBool,
}

impl IcmpChecker {
    pub fn new(timeout_seconds: u64) -> Self {
        Self {
            timeout_duration: Duration::from_secs(timeout_seconds.max(1)),
            v4: OnceCell::new(),
            v6: OnceCell::new(),
            socket_warned: AtomicBool::new(false),
        }
    }

    async fn client(&self, kind: ICMP) -> io::Result<&Client> {
        let cell = match kind {
            ICMP::V4 => &self.v4,
            ICMP::V6 => &self.v6,
        };
        cell.get_or_try_init(|| async move { open_client(kind) }).await
    }

    pub async fn check(&self, ip: &str, packet_size: u16) -> Probe {
        let addr: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(e) => {
                debug!("ICMP: invalid address {ip:?}: {e}");
                return Probe::lost();
            }
        };
        let kind = if addr.is_ipv4() { ICMP::V4 } else { ICMP::V6 };

        let client = match self.client(kind).await {
            Ok(client) => client,
            Err(e) => {
                if !self.socket_warned.swap(true, Ordering::Relaxed) {
                    warn!("ICMP: cannot open a ping socket, ICMP probes will report loss: {e}");
                }
                return Probe::lost();
            }
        };

        let payload = vec![0u8; usize::from(packet_size.saturating_sub(HEADER_BYTES))];
        let mut pinger = client.pinger(addr, PingIdentifier(rand::random())).await;
        pinger.timeout(self.timeout_duration);

        match pinger.ping(PingSequence(0), &payload).await {
            Ok((_packet, rtt)) => Probe::reply(rtt.as_secs_f64() * 1000.0),
            Err(e) => {
                debug!("ICMP: no reply from {addr}: {e}");
                Probe::lost()
            }
        }
    }
}

fn open_client(kind: ICMP) -> io::Result<Client> {
    let raw = Config::builder().kind(kind).sock_type_hint(Type::RAW).build();
    match Client::new(&raw) {
        Ok(client) => {
            info!("ICMP: using privileged (raw) sockets");
            Ok(client)
        }
        Err(e) => {
            info!("ICMP: raw sockets unavailable ({e}), using unprivileged sockets");
            let dgram = Config::builder().kind(kind).sock_type_hint(Type::DGRAM).build();
            Client::new(&dgram)
        }
    }
}

/// ARP checker that drives the system `arping` utility.
///
/// Whether `arping` can run at all is found out once, on first use, by a
/// trial run against the loopback address. A missing binary or a permission
/// error, then or on any later probe, marks ARP as unavailable for the rest
/// of the process lifetime.
pub struct ArpChecker {
    program: String,
    timeout_duration: Duration,
    capability: OnceCell<bool>,
    unavailable: AtomicBool,
}

impl ArpChecker {
    pub fn new(timeout_seconds: u64) -> Self {
        Self::with_program("arping", timeout_seconds)
    }

    pub fn with_program(program: impl Into<String>, timeout_seconds: u64) -> Self {
        Self {
            program: program.into(),
            timeout_duration: Duration::from_secs(timeout_seconds.max(1)),
            capability: OnceCell::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Whether ARP probes can be sent; the first call runs the capability check
    pub async fn is_available(&self) -> bool {
        let capable = *self.capability.get_or_init(|| self.detect()).await;
        capable && !self.unavailable.load(Ordering::Relaxed)
    }

    async fn detect(&self) -> bool {
        let reason = match self.run_arping("127.0.0.1").await {
            Err(e) => match self.spawn_failure(&e) {
                Some(reason) => reason,
                None => {
                    debug!("ARP: trial run of `{}` failed: {e}", self.program);
                    return true;
                }
            },
            Ok(Some(output)) if is_permission_error(&String::from_utf8_lossy(&output.stderr)) => {
                "no raw socket privilege".to_string()
            }
            Ok(_) => {
                info!("ARP: using `{}`", self.program);
                return true;
            }
        };
        warn!("ARP: {reason}, ARP probes disabled");
        false
    }

    fn mark_unavailable(&self, reason: &str) {
        if !self.unavailable.swap(true, Ordering::Relaxed) {
            warn!("ARP: {reason}, ARP probes disabled");
        }
    }

    /// Why a spawn error means `arping` can never run here, if it does
    fn spawn_failure(&self, e: &io::Error) -> Option<String> {
        match e.kind() {
            io::ErrorKind::NotFound => Some(format!("`{}` not found", self.program)),
            io::ErrorKind::PermissionDenied => Some(format!("not permitted to run `{}`", self.program)),
            _ => None,
        }
    }

    /// Run `arping` once against `ip`; `None` when it outlives its deadline
    async fn run_arping(&self, ip: &str) -> io::Result<Option<Output>> {
        let deadline = self.timeout_duration.as_secs().to_string();
        let child = Command::new(&self.program)
            .args(["-c", "1", "-w", deadline.as_str(), ip])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // One extra second over arping's own deadline before giving up on it
        let limit = self.timeout_duration.saturating_add(Duration::from_secs(1));
        match timeout(limit, child.wait_with_output()).await {
            Ok(output) => output.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub async fn check(&self, ip: &str) -> ArpOutcome {
        if !self.is_available().await {
            return ArpOutcome::Unavailable;
        }
        if ip.parse::<std::net::Ipv4Addr>().is_err() {
            debug!("ARP: {ip:?} is not an IPv4 address");
            return ArpOutcome::Probed(Probe::lost());
        }

        let start = Instant::now();
        let output = match self.run_arping(ip).await {
            Ok(Some(output)) => output,
            Ok(None) => return ArpOutcome::Probed(Probe::lost()),
            Err(e) => {
                if let Some(reason) = self.spawn_failure(&e) {
                    self.mark_unavailable(&reason);
                    return ArpOutcome::Unavailable;
                }
                warn!("ARP ping failed for {ip}: {e}");
                return ArpOutcome::Probed(Probe::lost());
            }
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_permission_error(&stderr) {
            self.mark_unavailable("no raw socket privilege");
            return ArpOutcome::Unavailable;
        }

        if output.status.success() {
            let latency = parse_arping_latency(&stdout).unwrap_or(elapsed_ms);
            ArpOutcome::Probed(Probe::reply(latency))
        } else {
            ArpOutcome::Probed(Probe::lost())
        }
    }
}

fn is_permission_error(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("not permitted") || stderr.contains("permission")
}

/// Pull the round-trip time out of arping's reply line.
///
/// Understands both `time=1.234 msec` and `[aa:bb:..]  1.234ms`.
fn parse_arping_latency(stdout: &str) -> Option<f64> {
    for line in stdout.lines() {
        if let Some((_, rest)) = line.split_once("time=") {
            let number: String =
                rest.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if let Ok(value) = number.parse() {
                return Some(value);
            }
        }

        if line.contains("reply from") {
            let value = line
                .split_whitespace()
                .filter_map(|token| token.strip_suffix("ms"))
                .find_map(|number| number.parse().ok());
            if value.is_some() {
                return value;
            }
        }
    }
    None
}

/// The ping provider used in production: surge-ping ICMP plus `arping`
pub struct NetworkPingProvider {
    icmp: IcmpChecker,
    arp: ArpChecker,
}

impl NetworkPingProvider {
    pub fn new(timeout_seconds: u64) -> Self {
        Self { icmp: IcmpChecker::new(timeout_seconds), arp: ArpChecker::new(timeout_seconds) }
    }

    pub async fn is_arp_available(&self) -> bool {
        self.arp.is_available().await
    }
}

#[async_trait::async_trait]
impl PingProvider for NetworkPingProvider {
    async fn probe_icmp(&self, ip: &str, packet_size: u16) -> Probe {
        self.icmp.check(ip, packet_size).await
    }

    async fn probe_arp(&self, ip: &str) -> ArpOutcome {
        self.arp.check(ip).await
    }
}
