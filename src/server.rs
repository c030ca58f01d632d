//! The reflector server.
//!
//! Listens on every (public IP, port) pair in its configured set. For each
//! valid request it reports the client's observed public endpoint back,
//! from whichever of its listeners matches the source variation the
//! client's request asked for.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::wire;

pub struct Reflector {
    sockets: Vec<Arc<UdpSocket>>,
    addrs: Vec<SocketAddrV4>,
}

impl Reflector {
    /// Enumerates the host's public IPv4 addresses and binds the full
    /// address x port product. A reflector on a single public IP cannot
    /// vary its source address, so fewer than two is refused.
    pub async fn bind_public(ports: &[u16]) -> Result<Self, Error> {
        let ips = public_ips()?;
        if ips.len() < 2 {
            return Err(Error::NotEnoughPublicIps(ips.len()));
        }
        Self::bind(&ips, ports).await
    }

    /// Binds one listener per (address, port) pair, as given. Port 0 asks
    /// the kernel for an ephemeral port, which tests use to run a
    /// reflector on loopback.
    pub async fn bind(ips: &[Ipv4Addr], ports: &[u16]) -> Result<Self, Error> {
        let mut sockets = Vec::new();
        let mut addrs = Vec::new();
        for &ip in ips {
            for &port in ports {
                let socket = UdpSocket::bind(SocketAddrV4::new(ip, port))
                    .await
                    .map_err(Error::Bind)?;
                let addr = match socket.local_addr().map_err(Error::Bind)? {
                    SocketAddr::V4(addr) => addr,
                    SocketAddr::V6(_) => continue,
                };
                info!(local = %addr, "created UDP listener");
                sockets.push(Arc::new(socket));
                addrs.push(addr);
            }
        }
        Ok(Self { sockets, addrs })
    }

    /// The bound listener endpoints, in bind order.
    pub fn local_addrs(&self) -> &[SocketAddrV4] {
        &self.addrs
    }

    /// Serves until a listener hits a fatal read error.
    pub async fn run(self) -> Result<(), Error> {
        let sockets = Arc::new(self.sockets);
        let addrs = Arc::new(self.addrs);

        let mut handlers = Vec::with_capacity(sockets.len());
        for idx in 0..sockets.len() {
            handlers.push(tokio::spawn(handle(sockets.clone(), addrs.clone(), idx)));
        }
        info!("startup complete");

        for handler in handlers {
            handler.await.map_err(Error::Task)??;
        }
        Ok(())
    }
}

/// Serves one listener: read a request, pick the listener matching the
/// requested source variation, reflect the client's endpoint from it.
async fn handle(
    sockets: Arc<Vec<Arc<UdpSocket>>>,
    addrs: Arc<Vec<SocketAddrV4>>,
    idx: usize,
) -> Result<(), Error> {
    let socket = &sockets[idx];
    let recv_on = addrs[idx];
    let mut buf = [0u8; 1500];

    loop {
        let (n, from) = socket.recv_from(&mut buf).await.map_err(Error::Receive)?;
        let SocketAddr::V4(from) = from else { continue };

        let Some((vary_ip, vary_port)) = wire::request_flags(&buf[..n]) else {
            debug!(local = %recv_on, remote = %from, size = n, "ignoring packet of unexpected length");
            continue;
        };

        let Some(responder) = pick_responder(&addrs, recv_on, vary_ip, vary_port) else {
            debug!(local = %recv_on, vary_ip, vary_port, "no listener satisfies requested variation, dropping");
            continue;
        };

        let frame = wire::reflection(from);
        if let Err(err) = sockets[responder].send_to(&frame, from).await {
            warn!(remote = %from, %err, "failed to send reflection");
            continue;
        }

        info!(local = %addrs[responder], remote = %from, vary_ip, vary_port, "provided NAT mapping");
    }
}

/// Picks a listener whose address equality against the receiving listener
/// matches the requested variation: same IP iff the client did not ask
/// for a varied IP, same port iff it did not ask for a varied port.
fn pick_responder(
    addrs: &[SocketAddrV4],
    recv_on: SocketAddrV4,
    vary_ip: bool,
    vary_port: bool,
) -> Option<usize> {
    addrs.iter().position(|addr| {
        (addr.ip() == recv_on.ip()) != vary_ip && (addr.port() == recv_on.port()) != vary_port
    })
}

/// The host's public IPv4 addresses. RFC 1918 space and anything that is
/// not global unicast (loopback, link-local, multicast, broadcast,
/// unspecified) does not count.
pub fn public_ips() -> Result<Vec<Ipv4Addr>, Error> {
    let ifas = local_ip_address::list_afinet_netifas().map_err(Error::LocalAddrs)?;
    Ok(ifas
        .into_iter()
        .filter_map(|(_, ip)| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .filter(is_public)
        .collect())
}

fn is_public(ip: &Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified())
}
