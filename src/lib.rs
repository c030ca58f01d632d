//! Probe the NAT and stateful firewall between this host and the internet.
//!
//! The probe drives a small UDP protocol against a pair of reflector
//! servers, each listening on several public IPs and ports. From the
//! reflected responses it works out how the NAT maps traffic, how strict
//! the firewall is about inbound packets, and which outbound UDP ports are
//! filtered.

pub mod analysis;
pub mod display;
pub mod error;
pub mod probe;
pub mod server;
pub mod types;
pub mod wire;

pub use analysis::Analysis;
pub use error::Error;
pub use probe::{probe, Options, DEFAULT_PORTS};
pub use server::Reflector;
pub use types::{FirewallProbe, MappingProbe, ProbeResult};
