use local_ip_address::list_afinet_netifas;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use str0m::Candidate;
use systemstat::{Platform, System};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` wins; otherwise this crate logs
/// at info.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("livecast_rtc=info,livecast=info"));
    // A second call (tests, embedding apps) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();
    let networks = match system.networks() {
        Ok(n) => n,
        Err(e) => {
            warn!("Could not list network interfaces: {}", e);
            return None;
        }
    };

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    return Some(IpAddr::V4(v));
                }
            }
        }
    }

    None
}

/// Host candidates for every routable IPv4 interface, on the port of
/// `socket`. Falls back to loopback so a connection to a local endpoint is
/// still possible on hosts without a routable interface.
pub fn host_candidates(socket: &UdpSocket) -> Vec<Candidate> {
    let port = match socket.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            warn!("UDP socket has no local address: {}", e);
            return vec![];
        }
    };

    let mut candidates: Vec<Candidate> = vec![];
    if let Ok(network_interfaces) = list_afinet_netifas() {
        for (name, ip) in network_interfaces {
            debug!("iface: {} / {:?}", name, ip);
            if let IpAddr::V4(ip4) = ip {
                if !ip4.is_loopback() && !ip4.is_link_local() {
                    push_host(&mut candidates, SocketAddr::new(ip, port));
                }
            }
        }
    }

    if candidates.is_empty() {
        info!("No routable interface, offering loopback candidate");
        push_host(&mut candidates, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }

    candidates
}

fn push_host(candidates: &mut Vec<Candidate>, addr: SocketAddr) {
    match Candidate::host(addr, "udp") {
        Ok(c) => candidates.push(c),
        Err(e) => warn!("Skipping host candidate {}: {:?}", addr, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_offers_a_candidate() {
        let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
        assert!(!host_candidates(&socket).is_empty());
    }
}
