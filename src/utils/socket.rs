use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use ipnet::Ipv4Net;
use tokio::net::TcpSocket;

use super::constants::ANY_HOST;

pub fn make_subnet_vec(subnet: Ipv4Net) -> Vec<Ipv4Addr> {
  let mut addrs = vec![subnet.network()];
  for host in subnet.hosts() {
    addrs.push(host);
  }
  // Broadcast address is never yielded by hosts().
  addrs
}

/// Addresses that can never carry customer egress traffic.
pub fn is_reserved(ip: &IpAddr) -> bool {
  match ip {
    IpAddr::V4(v4) => v4.is_loopback() || v4.is_unspecified() || v4.is_link_local(),
    IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xffc0) == 0xfe80,
  }
}

pub fn is_public(ip: &IpAddr) -> bool {
  match ip {
    IpAddr::V4(v4) => {
      let [a, b, ..] = v4.octets();
      !(is_reserved(ip) || v4.is_private() || v4.is_broadcast() || v4.is_documentation() || (a == 100 && (64..128).contains(&b)))
    }
    IpAddr::V6(v6) => !(is_reserved(ip) || (v6.segments()[0] & 0xfe00) == 0xfc00),
  }
}

/// IPv4 before IPv6, then by address.
pub fn ip_sort_key(ip: &IpAddr) -> (u8, IpAddr) {
  match ip {
    IpAddr::V4(_) => (0, *ip),
    IpAddr::V6(_) => (1, *ip),
  }
}

/// Checks that the engine will be able to listen on `port` on every interface.
pub async fn probe_port_free(port: u16) -> Result<(), tokio::io::Error> {
  let socket = TcpSocket::new_v4()?;
  socket.set_reuseaddr(true)?;
  socket.bind(SocketAddr::new(ANY_HOST, port))?;
  let listener = socket.listen(1)?;
  drop(listener);
  Ok(())
}
