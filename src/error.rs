use std::io;

use thiserror::Error;

/// Errors that abort a probe or prevent the reflector from starting.
///
/// Read timeouts are not errors anywhere in this crate: they are how a
/// probe phase ends. Transmit failures are counted and logged at trace
/// level, because a send against a filtered port is an expected outcome.
#[derive(Debug, Error)]
pub enum Error {
    #[error("resolving {host:?}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("resolving {host:?}: timed out")]
    ResolveTimeout { host: String },

    #[error("no IPv4 addresses found for any probe server")]
    NoServerAddrs,

    #[error("binding UDP socket: {0}")]
    Bind(#[source] io::Error),

    #[error("reading from UDP socket: {0}")]
    Receive(#[source] io::Error),

    #[error("enumerating local addresses: {0}")]
    LocalAddrs(#[source] local_ip_address::Error),

    #[error("probe task died: {0}")]
    Task(#[source] tokio::task::JoinError),

    #[error("not enough public IPs to run a useful reflector (need 2, have {0})")]
    NotEnoughPublicIps(usize),
}
