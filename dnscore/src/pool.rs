//! Synthetic IPv4 address allocation from a CIDR range (C2).
//!
//! Grounded in `ziti_dns_setup`/`next_ipv4` (`original_source/lib/ziti-tunnel-cbs/ziti_dns.c`):
//! a rolling counter over the host bits of a CIDR, reset to 1 rather than 0
//! once it reaches the all-ones host value, which has the effect of never
//! handing out the broadcast address. Combined with the counter starting at
//! 1 (never 0, the network address), this gives the `2^(32-prefixlen) - 2`
//! capacity named in the data model without a separate reserved-address
//! check inside the allocator itself.
use core::net::Ipv4Addr;

use crate::error::{DnsError, Result};

pub struct AddressPool {
	/// Network prefix with all host bits cleared.
	base: u32,
	/// All-ones mask covering the host portion.
	host_mask: u32,
	capacity: u32,
	counter: u32,
}

impl AddressPool {
	/// Parses `a.b.c.d/p` and seeds the rolling counter. `p` must leave at
	/// least two usable host addresses.
	pub fn seed(cidr: &str) -> Result<Self> {
		let (addr, prefix) = cidr.split_once('/').ok_or(DnsError::BadCidr)?;
		let addr: Ipv4Addr = addr.parse().map_err(|_| DnsError::BadCidr)?;
		let prefix: u32 = prefix.parse().map_err(|_| DnsError::BadCidr)?;

		if prefix > 30 {
			return Err(DnsError::BadCidr);
		}

		let host_bits = 32 - prefix;
		let host_mask = (1u32 << host_bits) - 1;
		let base = u32::from(addr) & !host_mask;
		let capacity = (1u32 << host_bits) - 2;

		Ok(Self { base, host_mask, capacity, counter: 1 })
	}

	/// The literal address passed to `seed`, reserved by convention as the
	/// tun interface's own address.
	pub fn tun_ip(&self) -> Ipv4Addr {
		Ipv4Addr::from(self.base)
	}

	pub fn capacity(&self) -> u32 {
		self.capacity
	}

	/// Advances the rolling counter, skipping addresses for which
	/// `is_taken` returns true, for at most `capacity` probes.
	pub fn allocate(&mut self, is_taken: impl Fn(Ipv4Addr) -> bool) -> Result<Ipv4Addr> {
		for _ in 0..self.capacity {
			let host_bits = self.counter & self.host_mask;
			let candidate = Ipv4Addr::from(self.base | host_bits);

			self.counter = self.counter.wrapping_add(1);
			if self.counter == self.host_mask {
				self.counter = 1;
			}

			if !is_taken(candidate) {
				return Ok(candidate);
			}
		}

		Err(DnsError::PoolExhausted)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use super::*;

	#[test]
	fn seeds_capacity_from_prefix_length() {
		let pool = AddressPool::seed("10.0.0.1/30").unwrap();
		assert_eq!(pool.capacity(), 2);
		assert_eq!(pool.tun_ip(), Ipv4Addr::new(10, 0, 0, 1));
	}

	#[test]
	fn rejects_malformed_cidr() {
		assert_eq!(AddressPool::seed("not-a-cidr").unwrap_err(), DnsError::BadCidr);
		assert_eq!(AddressPool::seed("10.0.0.1/31").unwrap_err(), DnsError::BadCidr);
	}

	#[test]
	fn never_allocates_the_network_or_broadcast_address() {
		let mut pool = AddressPool::seed("10.0.0.0/24").unwrap();
		let mut seen = HashSet::new();

		for _ in 0..pool.capacity() {
			let ip = pool.allocate(|ip| seen.contains(&ip)).unwrap();
			assert_ne!(ip, Ipv4Addr::new(10, 0, 0, 0));
			assert_ne!(ip, Ipv4Addr::new(10, 0, 0, 255));
			seen.insert(ip);
		}

		assert_eq!(seen.len(), pool.capacity() as usize);
	}

	#[test]
	fn exhausts_after_capacity_probes() {
		let mut pool = AddressPool::seed("10.0.0.1/30").unwrap();
		assert!(pool.allocate(|_| true).is_err());
	}

	#[test]
	fn released_addresses_can_be_reused() {
		let mut pool = AddressPool::seed("10.0.0.1/30").unwrap();
		let mut taken: HashSet<Ipv4Addr> = HashSet::new();

		let a = pool.allocate(|ip| taken.contains(&ip)).unwrap();
		taken.insert(a);
		let b = pool.allocate(|ip| taken.contains(&ip)).unwrap();
		taken.insert(b);
		assert_ne!(a, b);

		taken.remove(&a);
		let c = pool.allocate(|ip| taken.contains(&ip)).unwrap();
		assert!(c == a || !taken.contains(&c));
	}
}
