//! Human-readable reporting.

use std::fmt;

use serde::Serialize;

use crate::analysis::Analysis;

/// Renders any serializable report as pretty JSON.
pub fn render_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}

impl fmt::Display for Analysis {
    /// The narrative: a deterministic mapping from the analysis to
    /// paragraphs a person can act on. Never fails.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.no_data {
            return write!(
                f,
                "Probing got no useful data at all. Either the probe servers are down, or extremely strict UDP filtering is in place on your LAN."
            );
        }

        if self.no_nat {
            return write!(
                f,
                "There doesn't seem to be a NAT between you and the internet. Good for you!"
            );
        }

        let mut paragraphs: Vec<String> = Vec::new();

        paragraphs.push(
            match (self.mapping_varies_by_dest_ip, self.mapping_varies_by_dest_port) {
                (true, true) => "NAT allocates a new ip:port for every unique 5-tuple (protocol, source ip, source port, destination ip, destination port).\n    This makes NAT traversal more difficult.",
                (true, false) => "NAT allocates a new ip:port for every unique IP 4-tuple (protocol, source ip, source port, destination ip).\n    This makes NAT traversal more difficult.",
                (false, true) => "NAT allocates a new ip:port for every unique port 4-tuple (protocol, source ip, source port, destination port).\n    This is unusual!\n    This makes NAT traversal more difficult.",
                (false, false) => "NAT allocates a new ip:port for every unique 3-tuple (protocol, source ip, source ports).\n    This is best practice for NAT devices.\n    This makes NAT traversal easier.",
            }
            .to_string(),
        );

        paragraphs.push(
            match (self.firewall_enforces_dest_ip, self.firewall_enforces_dest_port) {
                (true, true) => "Firewall requires outbound traffic to an ip:port before allowing inbound traffic from that ip:port.\n    This is common practice for NAT gateways.\n    This makes NAT traversal more difficult.",
                (true, false) => "Firewall requires outbound traffic to an ip before allowing inbound traffic from that ip, but the ports don't have to match.\n    This makes NAT traversal more difficult.",
                (false, true) => "Firewall requires outbound traffic to a port before allowing inbound traffic from that port, but the IPs don't have to match.\n    This is unusual!\n    This makes NAT traversal more difficult.",
                (false, false) => "Firewall allows inbound traffic from any source, with no prerequisites.\n    This is best practice for \"traversal-friendly\" NAT devices.",
            }
            .to_string(),
        );

        paragraphs.push(
            if self.mapping_preserves_source_port {
                "NAT seems to try and make the public port number match the LAN port number."
            } else {
                "NAT seems to randomize the public port when allocating a new mapping."
            }
            .to_string(),
        );

        paragraphs.push(
            if self.multiple_public_ips {
                "NAT seems to use different public IPs for different mappings.\n    This makes NAT traversal more difficult."
            } else {
                "NAT seems to only use one public IP for this client."
            }
            .to_string(),
        );

        match self.filtered_egress.as_slice() {
            [] => {}
            [port] => paragraphs.push(format!("Outbound UDP port {port} seems to be blocked.")),
            ports => {
                let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
                paragraphs.push(format!(
                    "Outbound UDP ports {} seem to be blocked.",
                    ports.join(", ")
                ));
            }
        }

        write!(f, "{}", paragraphs.join("\n"))
    }
}
