//! The upstream forwarder (C4): one best-effort UDP socket to up to five
//! configured resolvers.
//!
//! Follows the same `Actor`/`Fwd` wiring style as `net/src/udp/mod.rs` and
//! `net/src/dns/mod.rs`, but talks to the real OS network through
//! `runtime::Io` rather than a virtual TUN-backed UDP stack, since this
//! forwards to resolvers outside the tunnel entirely.
use core::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::{error, warn};
use runtime::FrameMode;
use stakker::Fwd;

const MAX_UPSTREAMS: usize = 5;
const DEFAULT_PORT: u16 = 53;
/// Oversized upstream responses are dropped rather than reassembled; see C4.
const RECV_BUDGET: usize = 1024;

pub struct Upstream {
	io: runtime::Io<std::net::UdpSocket>,
	is_v6: bool,
	servers: Vec<SocketAddr>,
}

impl Upstream {
	pub fn init(on_packet: Fwd<Vec<u8>>) -> Option<Self> {
		let (socket, is_v6) = match std::net::UdpSocket::bind("[::]:0") {
			Ok(s) => (s, true),
			Err(err) => {
				warn!("IPv6 bind for upstream forwarder failed ({err}), falling back to IPv4");
				match std::net::UdpSocket::bind("0.0.0.0:0") {
					Ok(s) => (s, false),
					Err(err) => {
						error!("Failed to bind upstream forwarder socket: {err}");
						return None;
					}
				}
			}
		};

		if let Err(err) = socket.set_nonblocking(true) {
			error!("Failed to set upstream forwarder socket nonblocking: {err}");
			return None;
		}

		Some(Self { io: runtime::Io::new(socket, FrameMode::Datagram, on_packet), is_v6, servers: Vec::new() })
	}

	/// Replaces the configured upstream set (at most `MAX_UPSTREAMS`),
	/// mapping IPv4 addresses into `::ffff:a.b.c.d` when the socket is
	/// bound to an IPv6 wildcard. Returns the number of servers configured.
	pub fn set_upstreams(&mut self, hosts: &[(IpAddr, Option<u16>)]) -> usize {
		self.servers = hosts
			.iter()
			.take(MAX_UPSTREAMS)
			.map(|(addr, port)| {
				let addr = match (addr, self.is_v6) {
					(IpAddr::V4(v4), true) => IpAddr::V6(v4.to_ipv6_mapped()),
					(addr, _) => *addr,
				};
				SocketAddr::new(addr, port.unwrap_or(DEFAULT_PORT))
			})
			.collect();

		self.servers.len()
	}

	pub fn is_configured(&self) -> bool {
		!self.servers.is_empty()
	}

	/// Sends `query` to every configured upstream via non-blocking
	/// `sendto`. Returns true if at least one send succeeded; the engine
	/// must synthesize `REFUSED` otherwise. No retransmission happens at
	/// this layer — an unanswered query times out via the client session's
	/// idle timeout.
	pub fn send(&self, query: &[u8]) -> bool {
		let mut any = false;

		for server in &self.servers {
			match self.io.inner().send_to(query, server) {
				Ok(_) => any = true,
				Err(err) => warn!("sendto upstream {server} failed: {err}"),
			}
		}

		any
	}
}

/// Trims an oversized or empty upstream datagram; `None` means drop it.
pub fn accept_response(bytes: Vec<u8>) -> Option<Vec<u8>> {
	if bytes.is_empty() || bytes.len() > RECV_BUDGET {
		warn!("Dropping oversized upstream response ({} bytes)", bytes.len());
		return None;
	}

	Some(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn drops_oversized_responses() {
		assert!(accept_response(vec![0u8; RECV_BUDGET + 1]).is_none());
		assert!(accept_response(Vec::new()).is_none());
		assert!(accept_response(vec![0u8; 64]).is_some());
	}

	#[test]
	fn maps_v4_upstreams_into_v6_space_when_needed() {
		// The mapping itself doesn't require a live socket; exercised via
		// the public `Ipv4Addr::to_ipv6_mapped` the constructor uses.
		let v4 = Ipv4Addr::new(8, 8, 8, 8);
		assert_eq!(v4.to_ipv6_mapped().to_string(), "::ffff:8.8.8.8");
	}
}
