//! The probe engine: a concurrent UDP transmit/receive loop that runs
//! several client sockets against every (server IP, port) destination at
//! once, then probes firewall state from a fresh socket using
//! varied-source responses from the first destination that proved itself.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, trace};

use crate::error::Error;
use crate::types::{FirewallProbe, MappingProbe, ProbeResult};
use crate::wire;

/// Default ports that both the prober and the reflector use. Together they
/// cover each of the three IANA port ranges ("well known", "registered",
/// "dynamic") with at least two ports each.
pub const DEFAULT_PORTS: [u16; 12] = [
    // A random port in the dynamic range.
    60000,
    // HTTP/QUIC, likely to be open even on restrictive networks.
    80, 443,
    // VPN protocols, likely to be open on restrictive but
    // business-friendly networks: IKE, L2TP, IPSec ESP over UDP, PPTP,
    // OpenVPN, Wireguard.
    500, 1701, 4500, 1723, 1194, 51820,
    // VoIP: STUN, SIP cleartext, SIP TLS.
    3478, 5060, 5061,
];

/// Default reflector servers.
pub const DEFAULT_SERVERS: [&str; 2] = ["reflector1.natscope.dev.", "reflector2.natscope.dev."];

/// Probe configuration. `Default` gives a sensible complete setup.
#[derive(Debug, Clone)]
pub struct Options {
    /// Hostnames of the reflector servers.
    pub servers: Vec<String>,
    /// UDP ports to probe on every server IP.
    pub ports: Vec<u16>,
    /// How long server name resolution may take, in total.
    pub resolve_timeout: Duration,
    /// How long the mapping phase runs.
    pub mapping_duration: Duration,
    /// Transmit interval per destination during the mapping phase.
    pub mapping_interval: Duration,
    /// Number of client sockets probing in parallel. More than one socket
    /// yields independent samples, which is what exposes port-randomizing
    /// NATs and multiple public IPs.
    pub mapping_sockets: usize,
    /// How long the firewall phase runs.
    pub firewall_duration: Duration,
    /// Transmit interval during the firewall phase.
    pub firewall_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            servers: DEFAULT_SERVERS.iter().map(|s| s.to_string()).collect(),
            ports: DEFAULT_PORTS.to_vec(),
            resolve_timeout: Duration::from_secs(3),
            mapping_duration: Duration::from_secs(3),
            mapping_interval: Duration::from_millis(200),
            mapping_sockets: 3,
            firewall_duration: Duration::from_secs(3),
            firewall_interval: Duration::from_millis(50),
        }
    }
}

/// Runs a full probe: resolves the servers, maps the NAT, then probes the
/// firewall via a destination that is known to respond. Fatal I/O errors
/// abort the run; no partial result is returned in that case.
pub async fn probe(opts: &Options) -> Result<ProbeResult, Error> {
    let local_ips = local_ipv4s()?;

    let ips = resolve_servers(&opts.servers, opts.resolve_timeout).await?;
    let dests = destinations(&ips, &opts.ports);
    debug!(servers = ips.len(), destinations = dests.len(), "probe targets assembled");

    // Single-slot handoff from the mapping workers to the firewall prober.
    // Offers are non-blocking, so only the first working destination lands.
    let (working_tx, working_rx) = mpsc::channel::<SocketAddrV4>(1);

    // The firewall prober starts first and blocks on the handoff.
    let firewall_task = tokio::spawn(probe_firewall(
        working_rx,
        opts.firewall_duration,
        opts.firewall_interval,
    ));

    let mapping_probes = probe_mapping(
        &dests,
        opts.mapping_sockets,
        opts.mapping_duration,
        opts.mapping_interval,
        working_tx,
    )
    .await?;

    let firewall_probe = firewall_task.await.map_err(Error::Task)??;

    Ok(ProbeResult {
        local_ips,
        mapping_probes,
        firewall_probe,
    })
}

/// The host's IPv4 addresses, loopback included; `no_nat` needs them all.
fn local_ipv4s() -> Result<Vec<Ipv4Addr>, Error> {
    let ifas = local_ip_address::list_afinet_netifas().map_err(Error::LocalAddrs)?;
    Ok(ifas
        .into_iter()
        .filter_map(|(_, ip)| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect())
}

/// Resolves every server hostname to its IPv4 addresses, in order, under
/// one shared deadline.
async fn resolve_servers(servers: &[String], timeout: Duration) -> Result<Vec<Ipv4Addr>, Error> {
    let deadline = Instant::now() + timeout;
    let mut ips = Vec::new();

    for host in servers {
        let resolved = timeout_at(deadline, lookup_host((host.as_str(), 0u16)))
            .await
            .map_err(|_| Error::ResolveTimeout { host: host.clone() })?
            .map_err(|source| Error::Resolve {
                host: host.clone(),
                source,
            })?;

        for addr in resolved {
            if let SocketAddr::V4(v4) = addr {
                ips.push(*v4.ip());
            }
        }
    }

    if ips.is_empty() {
        return Err(Error::NoServerAddrs);
    }
    Ok(ips)
}

/// Cartesian product of server IPs and probe ports. The order is stable
/// (IPs in resolution order, ports in configured order) so reruns are
/// comparable.
fn destinations(ips: &[Ipv4Addr], ports: &[u16]) -> Vec<SocketAddrV4> {
    let mut dests = Vec::with_capacity(ips.len() * ports.len());
    for &ip in ips {
        for &port in ports {
            dests.push(SocketAddrV4::new(ip, port));
        }
    }
    dests
}

/// Runs the mapping phase across N parallel sockets. Sockets are awaited
/// in spawn order, keeping each socket's probes contiguous in the output;
/// the varies-by analysis depends on that grouping.
async fn probe_mapping(
    dests: &[SocketAddrV4],
    sockets: usize,
    duration: Duration,
    interval: Duration,
    working_tx: mpsc::Sender<SocketAddrV4>,
) -> Result<Vec<MappingProbe>, Error> {
    let mut workers = Vec::with_capacity(sockets);
    for _ in 0..sockets {
        workers.push(tokio::spawn(probe_one_socket(
            dests.to_vec(),
            duration,
            interval,
            working_tx.clone(),
        )));
    }
    // Once the last worker exits, the handoff closes and a still-waiting
    // firewall prober finalizes empty-handed.
    drop(working_tx);

    let mut probes = Vec::new();
    for worker in workers {
        probes.extend(worker.await.map_err(Error::Task)??);
    }
    Ok(probes)
}

/// One socket's mapping phase: a transmitter per destination, a single
/// receiver, one deadline for everything.
async fn probe_one_socket(
    dests: Vec<SocketAddrV4>,
    duration: Duration,
    interval: Duration,
    working_tx: mpsc::Sender<SocketAddrV4>,
) -> Result<Vec<MappingProbe>, Error> {
    let socket = Arc::new(bind_any().await?);
    let local = local_v4(&socket)?;
    let deadline = Instant::now() + duration;

    let send_errors = Arc::new(AtomicU64::new(0));
    let transmitters: Vec<_> = dests
        .iter()
        .map(|&dest| {
            tokio::spawn(transmit(
                socket.clone(),
                dest,
                interval,
                deadline,
                false,
                send_errors.clone(),
            ))
        })
        .collect();

    let mut probes = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut responded: HashSet<SocketAddrV4> = HashSet::new();
    let mut buf = [0u8; 1500];

    loop {
        let (n, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            // The deadline is how the phase ends, never an error.
            Err(_) => break,
            Ok(Err(err)) => return Err(Error::Receive(err)),
            Ok(Ok(recv)) => recv,
        };
        let SocketAddr::V4(from) = from else { continue };
        let Some(mapped) = wire::decode_reflection(&buf[..n]) else { continue };

        let probe = MappingProbe {
            local,
            mapped: Some(mapped),
            remote: from,
            timeout: false,
        };
        if seen.insert(probe.key()) {
            responded.insert(from);
            // Non-blocking offer; the slot keeps only the first.
            let _ = working_tx.try_send(from);
            probes.push(probe);
        }
    }

    join_all(transmitters).await;
    let failed = send_errors.load(Ordering::Relaxed);
    if failed > 0 {
        debug!(local = %local, count = failed, "transmit failures during mapping phase");
    }

    // One timeout record per destination that never answered this socket.
    for &dest in &dests {
        if !responded.contains(&dest) {
            probes.push(MappingProbe {
                local,
                mapped: None,
                remote: dest,
                timeout: true,
            });
        }
    }

    Ok(probes)
}

/// The firewall phase. Waits for the mapping phase to hand over a working
/// destination, then transmits with the vary flags cycling through every
/// combination, recording which varied-source responses make it back in.
async fn probe_firewall(
    mut working_rx: mpsc::Receiver<SocketAddrV4>,
    duration: Duration,
    interval: Duration,
) -> Result<Option<FirewallProbe>, Error> {
    let Some(dest) = working_rx.recv().await else {
        debug!("no working destination, skipping firewall probe");
        return Ok(None);
    };

    let socket = Arc::new(bind_any().await?);
    let local = local_v4(&socket)?;
    let deadline = Instant::now() + duration;

    let send_errors = Arc::new(AtomicU64::new(0));
    let transmitter = tokio::spawn(transmit(
        socket.clone(),
        dest,
        interval,
        deadline,
        true,
        send_errors.clone(),
    ));

    let mut received = Vec::new();
    let mut seen: HashSet<SocketAddrV4> = HashSet::new();
    let mut buf = [0u8; 1500];

    loop {
        let (n, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(err)) => return Err(Error::Receive(err)),
            Ok(Ok(recv)) => recv,
        };
        if n != wire::REFLECTION_LEN {
            continue;
        }
        let SocketAddr::V4(from) = from else { continue };
        if seen.insert(from) {
            received.push(from);
        }
    }

    let _ = transmitter.await;

    Ok(Some(FirewallProbe {
        local,
        remote: dest,
        received,
    }))
}

/// Sends a request to `dest` immediately and then every `interval` until
/// the deadline. With `cycle_flags`, byte 0 walks 0, 1, 2, 3, 0, … so the
/// server is asked for every combination of varied source IP and port.
/// Send failures are counted, not surfaced: a failed send against a
/// filtered port is an expected outcome.
async fn transmit(
    socket: Arc<UdpSocket>,
    dest: SocketAddrV4,
    interval: Duration,
    deadline: Instant,
    cycle_flags: bool,
    send_errors: Arc<AtomicU64>,
) {
    let mut flags = 0u8;
    loop {
        let frame = wire::request(if cycle_flags { flags } else { 0 });
        if cycle_flags {
            flags = (flags + 1) % 4;
        }
        if let Err(err) = socket.send_to(&frame, dest).await {
            send_errors.fetch_add(1, Ordering::Relaxed);
            trace!(%dest, %err, "transmit failed");
        }
        if timeout_at(deadline, sleep(interval)).await.is_err() {
            return;
        }
    }
}

async fn bind_any() -> Result<UdpSocket, Error> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(Error::Bind)
}

fn local_v4(socket: &UdpSocket) -> Result<SocketAddrV4, Error> {
    match socket.local_addr().map_err(Error::Bind)? {
        SocketAddr::V4(addr) => Ok(addr),
        SocketAddr::V6(addr) => Err(Error::Bind(io::Error::other(format!(
            "socket unexpectedly bound to IPv6 address {addr}"
        )))),
    }
}
