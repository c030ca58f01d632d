//! Distills raw probe results into a fixed set of facts about the NAT and
//! firewall. Every predicate is a pure function of the result.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};

use serde::Serialize;

use crate::types::{MappingProbe, ProbeResult};

/// High level "feature" analysis of NAT behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Analysis {
    /// There is no data to analyze.
    pub no_data: bool,
    /// There is no NAT, at least one local IP appears to be a public IP.
    pub no_nat: bool,
    /// Assigned public ip:port depends on the destination IP.
    pub mapping_varies_by_dest_ip: bool,
    /// Assigned public ip:port depends on the destination port.
    pub mapping_varies_by_dest_port: bool,
    /// Firewall requires outbound traffic to an IP before allowing inbound
    /// traffic from that IP.
    pub firewall_enforces_dest_ip: bool,
    /// Firewall requires outbound traffic to a port before allowing
    /// inbound traffic from that port.
    pub firewall_enforces_dest_port: bool,
    /// Assigned public port tries to be the same as the LAN port.
    pub mapping_preserves_source_port: bool,
    /// Observed multiple assigned public IPs.
    pub multiple_public_ips: bool,
    /// Destination ports that never produced a reply on any socket,
    /// sorted ascending.
    pub filtered_egress: Vec<u16>,
}

/// Reduces a raw result to its analysis. Running this twice on the same
/// result yields an identical analysis.
pub fn analyze(result: &ProbeResult) -> Analysis {
    Analysis {
        no_data: no_data(result),
        no_nat: no_nat(result),
        mapping_varies_by_dest_ip: varies_by(&result.mapping_probes, |p| *p.remote.ip()),
        mapping_varies_by_dest_port: varies_by(&result.mapping_probes, |p| p.remote.port()),
        firewall_enforces_dest_ip: firewall_enforces(result, |recv, out| recv.ip() == out.ip()),
        firewall_enforces_dest_port: firewall_enforces(result, |recv, out| {
            recv.port() == out.port()
        }),
        mapping_preserves_source_port: preserves_source_port(result),
        multiple_public_ips: multiple_public_ips(result),
        filtered_egress: filtered_egress(result),
    }
}

fn no_data(result: &ProbeResult) -> bool {
    result.mapping_probes.iter().all(|p| p.timeout)
}

fn no_nat(result: &ProbeResult) -> bool {
    let local: HashSet<Ipv4Addr> = result.local_ips.iter().copied().collect();
    result
        .mapping_probes
        .iter()
        .filter_map(|p| if p.timeout { None } else { p.mapped })
        .all(|mapped| local.contains(mapped.ip()))
}

/// Walks the probes in emission order, anchored per local socket. Within a
/// socket, a probe that changes only the axis under test (remote IP or
/// remote port) must not move the public mapping under an
/// address/port-independent NAT; any movement is the defining evidence.
fn varies_by<K: PartialEq>(probes: &[MappingProbe], axis: impl Fn(&MappingProbe) -> K) -> bool {
    let mut anchor: Option<(SocketAddrV4, K, SocketAddrV4)> = None;

    for probe in probes {
        if probe.timeout {
            continue;
        }
        let Some(mapped) = probe.mapped else { continue };

        match &anchor {
            Some((local, key, anchor_mapped)) if *local == probe.local => {
                if axis(probe) == *key {
                    // Same axis value, uninformative.
                    continue;
                }
                if mapped != *anchor_mapped {
                    return true;
                }
            }
            _ => anchor = Some((probe.local, axis(probe), mapped)),
        }
    }
    false
}

/// True iff every received firewall-probe source satisfies `matches`
/// against the probed remote. An empty received set is true: no
/// counterexample was observed, so the strict interpretation stands.
fn firewall_enforces(
    result: &ProbeResult,
    matches: impl Fn(&SocketAddrV4, &SocketAddrV4) -> bool,
) -> bool {
    match &result.firewall_probe {
        None => false,
        Some(fw) => fw.received.iter().all(|recv| matches(recv, &fw.remote)),
    }
}

fn preserves_source_port(result: &ProbeResult) -> bool {
    let mut total = 0usize;
    let mut preserved = 0usize;
    for probe in &result.mapping_probes {
        if probe.timeout {
            continue;
        }
        let Some(mapped) = probe.mapped else { continue };
        total += 1;
        if probe.local.port() == mapped.port() {
            preserved += 1;
        }
    }
    if total == 0 {
        // No samples, no preservation to assert.
        return false;
    }
    // Port-preserving if >=80% of probes kept their port.
    preserved as f64 / total as f64 >= 0.8
}

fn multiple_public_ips(result: &ProbeResult) -> bool {
    let ips: HashSet<Ipv4Addr> = result
        .mapping_probes
        .iter()
        .filter_map(|p| if p.timeout { None } else { p.mapped })
        .map(|m| *m.ip())
        .collect();
    ips.len() > 1
}

fn filtered_egress(result: &ProbeResult) -> Vec<u16> {
    let mut working: HashSet<u16> = result
        .mapping_probes
        .iter()
        .filter(|p| !p.timeout)
        .map(|p| p.remote.port())
        .collect();

    let mut blocked = Vec::new();
    for probe in &result.mapping_probes {
        if probe.timeout && !working.contains(&probe.remote.port()) {
            blocked.push(probe.remote.port());
            working.insert(probe.remote.port());
        }
    }
    blocked.sort_unstable();
    blocked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FirewallProbe;

    fn ep(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    fn hit(local: &str, mapped: &str, remote: &str) -> MappingProbe {
        MappingProbe {
            local: ep(local),
            mapped: Some(ep(mapped)),
            remote: ep(remote),
            timeout: false,
        }
    }

    fn miss(local: &str, remote: &str) -> MappingProbe {
        MappingProbe {
            local: ep(local),
            mapped: None,
            remote: ep(remote),
            timeout: true,
        }
    }

    fn result(probes: Vec<MappingProbe>) -> ProbeResult {
        ProbeResult {
            local_ips: vec![],
            mapping_probes: probes,
            firewall_probe: None,
        }
    }

    #[test]
    fn empty_result_is_no_data() {
        let analysis = analyze(&result(vec![]));
        assert!(analysis.no_data);
    }

    #[test]
    fn all_timeouts_is_no_data() {
        let analysis = analyze(&result(vec![
            miss("10.0.0.2:5000", "8.8.8.8:443"),
            miss("10.0.0.2:5000", "8.8.8.8:80"),
        ]));
        assert!(analysis.no_data);
    }

    #[test]
    fn mapped_to_local_ip_means_no_nat() {
        let mut r = result(vec![hit("1.2.3.4:5000", "1.2.3.4:5000", "8.8.8.8:443")]);
        r.local_ips = vec![Ipv4Addr::new(1, 2, 3, 4)];
        let analysis = analyze(&r);
        assert!(analysis.no_nat);
        assert!(!analysis.no_data);
    }

    #[test]
    fn mapping_varies_by_dest_ip_only() {
        // Same socket, same remote port, different remote IP, and the
        // mapped IP moved: address-dependent mapping.
        let analysis = analyze(&result(vec![
            hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:443"),
            hit("10.0.0.2:5000", "100.0.0.2:6000", "9.9.9.9:443"),
        ]));
        assert!(analysis.mapping_varies_by_dest_ip);
        assert!(!analysis.mapping_varies_by_dest_port);
    }

    #[test]
    fn mapping_varies_by_dest_port_only() {
        let analysis = analyze(&result(vec![
            hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:80"),
            hit("10.0.0.2:5000", "100.0.0.1:6001", "8.8.8.8:443"),
        ]));
        assert!(analysis.mapping_varies_by_dest_port);
        assert!(!analysis.mapping_varies_by_dest_ip);
    }

    #[test]
    fn stable_mapping_varies_by_nothing() {
        let analysis = analyze(&result(vec![
            hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:443"),
            hit("10.0.0.2:5000", "100.0.0.1:6000", "9.9.9.9:443"),
            hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:80"),
        ]));
        assert!(!analysis.mapping_varies_by_dest_ip);
        assert!(!analysis.mapping_varies_by_dest_port);
    }

    #[test]
    fn anchor_resets_per_socket() {
        // Each socket gets its own mapping; as long as the mapping is
        // stable within a socket, nothing varies.
        let analysis = analyze(&result(vec![
            hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:443"),
            hit("10.0.0.2:5000", "100.0.0.1:6000", "9.9.9.9:443"),
            hit("10.0.0.2:5001", "100.0.0.1:6001", "8.8.8.8:443"),
            hit("10.0.0.2:5001", "100.0.0.1:6001", "9.9.9.9:443"),
        ]));
        assert!(!analysis.mapping_varies_by_dest_ip);
    }

    #[test]
    fn firewall_predicates_follow_received_set() {
        let mut r = result(vec![hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:443")]);

        r.firewall_probe = Some(FirewallProbe {
            local: ep("0.0.0.0:5001"),
            remote: ep("8.8.8.8:443"),
            received: vec![ep("8.8.8.8:443")],
        });
        let analysis = analyze(&r);
        assert!(analysis.firewall_enforces_dest_ip);
        assert!(analysis.firewall_enforces_dest_port);

        r.firewall_probe = Some(FirewallProbe {
            local: ep("0.0.0.0:5001"),
            remote: ep("8.8.8.8:443"),
            received: vec![ep("8.8.8.8:443"), ep("8.8.8.8:1000")],
        });
        let analysis = analyze(&r);
        assert!(analysis.firewall_enforces_dest_ip);
        assert!(!analysis.firewall_enforces_dest_port);
    }

    #[test]
    fn missing_firewall_probe_enforces_nothing() {
        let analysis = analyze(&result(vec![hit(
            "10.0.0.2:5000",
            "100.0.0.1:6000",
            "8.8.8.8:443",
        )]));
        assert!(!analysis.firewall_enforces_dest_ip);
        assert!(!analysis.firewall_enforces_dest_port);
    }

    #[test]
    fn empty_received_set_counts_as_strict() {
        let mut r = result(vec![hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:443")]);
        r.firewall_probe = Some(FirewallProbe {
            local: ep("0.0.0.0:5001"),
            remote: ep("8.8.8.8:443"),
            received: vec![],
        });
        let analysis = analyze(&r);
        // No counterexample observed.
        assert!(analysis.firewall_enforces_dest_ip);
        assert!(analysis.firewall_enforces_dest_port);
    }

    #[test]
    fn source_port_preservation_uses_80_percent_threshold() {
        let preserved = |n| hit(&format!("10.0.0.2:{n}"), &format!("100.0.0.1:{n}"), "8.8.8.8:443");
        let randomized = |n: u16| {
            hit(
                &format!("10.0.0.2:{n}"),
                &format!("100.0.0.1:{}", n + 1),
                "8.8.8.8:443",
            )
        };

        let four_of_five = vec![
            preserved(5000),
            preserved(5001),
            preserved(5002),
            preserved(5003),
            randomized(5004),
        ];
        assert!(analyze(&result(four_of_five)).mapping_preserves_source_port);

        let three_of_five = vec![
            preserved(5000),
            preserved(5001),
            preserved(5002),
            randomized(5003),
            randomized(5004),
        ];
        assert!(!analyze(&result(three_of_five)).mapping_preserves_source_port);
    }

    #[test]
    fn zero_samples_preserve_nothing() {
        let analysis = analyze(&result(vec![miss("10.0.0.2:5000", "8.8.8.8:443")]));
        assert!(!analysis.mapping_preserves_source_port);
    }

    #[test]
    fn multiple_public_ips_counts_distinct_mapped_ips() {
        let one = analyze(&result(vec![
            hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:443"),
            hit("10.0.0.2:5001", "100.0.0.1:6001", "8.8.8.8:443"),
        ]));
        assert!(!one.multiple_public_ips);

        let two = analyze(&result(vec![
            hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:443"),
            hit("10.0.0.2:5001", "100.0.0.2:6001", "8.8.8.8:443"),
        ]));
        assert!(two.multiple_public_ips);
    }

    #[test]
    fn filtered_egress_lists_ports_that_never_worked() {
        // 5060 times out against both servers and never works anywhere;
        // 443 and 80 work on at least one socket.
        let analysis = analyze(&result(vec![
            hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:443"),
            hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:80"),
            miss("10.0.0.2:5000", "8.8.8.8:5060"),
            miss("10.0.0.2:5000", "9.9.9.9:5060"),
            miss("10.0.0.2:5001", "8.8.8.8:5060"),
        ]));
        assert_eq!(analysis.filtered_egress, vec![5060]);
    }

    #[test]
    fn filtered_egress_ignores_ports_that_work_elsewhere() {
        // 443 timed out on one socket but worked on another, so it is not
        // egress-filtered.
        let analysis = analyze(&result(vec![
            miss("10.0.0.2:5000", "8.8.8.8:443"),
            hit("10.0.0.2:5001", "100.0.0.1:6000", "8.8.8.8:443"),
            miss("10.0.0.2:5001", "8.8.8.8:1194"),
        ]));
        assert_eq!(analysis.filtered_egress, vec![1194]);
    }

    #[test]
    fn filtered_egress_is_sorted() {
        let analysis = analyze(&result(vec![
            miss("10.0.0.2:5000", "8.8.8.8:51820"),
            miss("10.0.0.2:5000", "8.8.8.8:80"),
            miss("10.0.0.2:5000", "8.8.8.8:5060"),
            hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:443"),
        ]));
        assert_eq!(analysis.filtered_egress, vec![80, 5060, 51820]);
    }

    #[test]
    fn analyze_is_deterministic() {
        let mut r = result(vec![
            hit("10.0.0.2:5000", "100.0.0.1:6000", "8.8.8.8:443"),
            miss("10.0.0.2:5000", "8.8.8.8:5060"),
        ]);
        r.local_ips = vec![Ipv4Addr::new(10, 0, 0, 2)];
        assert_eq!(analyze(&r), analyze(&r));
    }
}
