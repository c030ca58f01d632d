//! Raw probe results.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use serde::Serialize;

/// The outcome of a single NAT mapping discovery attempt: one request sent
/// from `local` to `remote`, and the public endpoint the server reported
/// seeing it from. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingProbe {
    /// The probing socket's local endpoint.
    pub local: SocketAddrV4,
    /// The public endpoint the server observed, or `None` on timeout.
    pub mapped: Option<SocketAddrV4>,
    /// The destination the probe was sent to.
    pub remote: SocketAddrV4,
    /// True iff no valid reply arrived from `remote` on this socket.
    pub timeout: bool,
}

impl MappingProbe {
    /// Identity for deduplication, so repeated reflections from the same
    /// server don't inflate the sample.
    pub(crate) fn key(&self) -> String {
        let mapped = match self.mapped {
            Some(m) => m.to_string(),
            None => "-".to_string(),
        };
        format!("{} {} {} {}", self.local, mapped, self.remote, self.timeout)
    }
}

/// The outcome of the firewall probe: every distinct source endpoint that
/// got a response through to us while we were transmitting to `remote`.
#[derive(Debug, Clone, Serialize)]
pub struct FirewallProbe {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub received: Vec<SocketAddrV4>,
}

/// The raw, uninterpreted result of a probe run.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub local_ips: Vec<Ipv4Addr>,
    pub mapping_probes: Vec<MappingProbe>,
    pub firewall_probe: Option<FirewallProbe>,
}

impl ProbeResult {
    /// Replaces every IP address in the result with a generated one, so the
    /// result can be shared publicly. The substitution is consistent: the
    /// same input IP maps to the same generated IP everywhere in the
    /// result. Unspecified addresses pass through unchanged.
    pub fn anonymize(&mut self) {
        let mut anon = Anonymizer::new();

        for ip in &mut self.local_ips {
            *ip = anon.ip(*ip);
        }
        for probe in &mut self.mapping_probes {
            probe.local = anon.endpoint(probe.local);
            probe.mapped = probe.mapped.map(|m| anon.endpoint(m));
            probe.remote = anon.endpoint(probe.remote);
        }
        if let Some(fw) = &mut self.firewall_probe {
            fw.local = anon.endpoint(fw.local);
            fw.remote = anon.endpoint(fw.remote);
            for addr in &mut fw.received {
                *addr = anon.endpoint(*addr);
            }
        }
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mapping_probes.is_empty() {
            return write!(f, "No data (did the probe fail?)");
        }

        writeln!(f, "Local IPs on the client:")?;
        for ip in &self.local_ips {
            writeln!(f, "    {ip}")?;
        }

        writeln!(f, "Mapping probes:")?;
        for probe in &self.mapping_probes {
            match probe.mapped {
                Some(mapped) if !probe.timeout => {
                    writeln!(f, "    {} -> {} -> {}", probe.local, mapped, probe.remote)?
                }
                _ => writeln!(f, "    {} -> ??? -> {} (timeout)", probe.local, probe.remote)?,
            }
        }

        match &self.firewall_probe {
            None => writeln!(f, "No firewall probe data.")?,
            Some(fw) => {
                writeln!(
                    f,
                    "Firewall probe with outbound traffic {} -> {}",
                    fw.local, fw.remote
                )?;
                for addr in &fw.received {
                    writeln!(f, "    {addr}")?;
                }
            }
        }

        Ok(())
    }
}

/// Hands out generated IPs of the form a.a.b.b, in encounter order,
/// starting from 1.1.1.1. The low counter wraps with carry into the high
/// one, which caps a run at 65,025 distinct IPs.
struct Anonymizer {
    assigned: HashMap<Ipv4Addr, Ipv4Addr>,
    hi: u8,
    lo: u8,
}

impl Anonymizer {
    fn new() -> Self {
        Self {
            assigned: HashMap::new(),
            hi: 1,
            lo: 1,
        }
    }

    fn ip(&mut self, ip: Ipv4Addr) -> Ipv4Addr {
        if ip.is_unspecified() {
            // Nothing to anonymize.
            return ip;
        }
        if let Some(&fresh) = self.assigned.get(&ip) {
            return fresh;
        }
        let fresh = Ipv4Addr::new(self.hi, self.hi, self.lo, self.lo);
        self.lo = self.lo.wrapping_add(1);
        if self.lo == 0 {
            self.hi = self.hi.wrapping_add(1);
        }
        self.assigned.insert(ip, fresh);
        fresh
    }

    fn endpoint(&mut self, ep: SocketAddrV4) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip(*ep.ip()), ep.port())
    }
}
