//! The name catalog (C3): hostnames, reverse IP lookup, and wildcard
//! domains, backed by the address pool (C2).
//!
//! Grounded in the `ziti_dns_t` struct and its `hostnames`/`ip_addresses`/
//! `domains` maps plus `ziti_dns_register_hostname`/`ziti_dns_lookup`/
//! `ziti_dns_deregister_intercept` (`original_source/lib/ziti-tunnel-cbs/ziti_dns.c`).
//! The original keeps the pool and the maps in one struct because allocation
//! needs to consult the reverse map to skip taken addresses; `Catalog` does
//! the same here, with `AddressPool::allocate` taking the membership check
//! as a closure so C2 itself stays a pure, independently testable component.
use core::net::Ipv4Addr;
use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use crate::error::{DnsError, Result};
use crate::pool::AddressPool;

/// An opaque handle identifying whatever claimed a name or domain — in
/// practice an intercept registered by C7 against a loaded identity.
pub type ClaimantId = u64;

pub struct NameEntry {
	pub name: String,
	pub ip: Ipv4Addr,
	pub claimants: HashSet<ClaimantId>,
	pub parent_domain: Option<String>,
}

pub struct WildcardDomain {
	pub suffix: String,
	pub claimants: HashSet<ClaimantId>,
}

pub struct Catalog {
	pool: AddressPool,
	hostnames: HashMap<String, NameEntry>,
	/// `None` marks a reserved sentinel (tun IP, DNS server IP) rather than
	/// a claimed name, mirroring the original's empty placeholder entries.
	addresses: HashMap<Ipv4Addr, Option<String>>,
	domains: HashMap<String, WildcardDomain>,
}

impl Catalog {
	/// Seeds the pool from `cidr` and reserves the tun IP and `dns_ip` as
	/// empty catalog entries so the allocator's linear probe skips them for
	/// free.
	pub fn seed(cidr: &str, dns_ip: Ipv4Addr) -> Result<Self> {
		let pool = AddressPool::seed(cidr)?;
		let tun_ip = pool.tun_ip();

		let mut cat = Self { pool, hostnames: HashMap::new(), addresses: HashMap::new(), domains: HashMap::new() };
		cat.addresses.insert(tun_ip, None);
		cat.addresses.insert(dns_ip, None);
		Ok(cat)
	}

	pub fn tun_ip(&self) -> Ipv4Addr {
		self.pool.tun_ip()
	}

	pub fn capacity(&self) -> u32 {
		self.pool.capacity()
	}

	/// Lowercases, strips a trailing dot, and rejects names over 255 bytes.
	/// Returns the cleaned name and whether it carries a leading `*.`
	/// wildcard marker, mirroring `check_name`'s single-pass validation.
	fn clean_name(raw: &str) -> Result<(String, bool)> {
		let name = raw.trim_end_matches('.').to_lowercase();

		if name.is_empty() || name.len() > 255 {
			return Err(DnsError::MalformedQuery);
		}

		Ok((name.clone(), name.starts_with("*.")))
	}

	/// If `addr` is a CIDR, returns `None` (IP blocks are intercepted by the
	/// TCP/IP stack collaborator, not the name catalog). If `addr` begins
	/// with `*.`, registers a wildcard domain and returns `None`. Otherwise
	/// ensures a name entry exists, allocating an IP on first registration,
	/// adds `claimant`, and returns the entry's IP.
	pub fn register_hostname(&mut self, addr: &str, claimant: ClaimantId) -> Option<Ipv4Addr> {
		if addr.contains('/') {
			return None;
		}

		let (clean, is_wildcard) = match Self::clean_name(addr) {
			Ok(v) => v,
			Err(_) => {
				warn!("Rejecting invalid intercept address {addr:?}");
				return None;
			}
		};

		if is_wildcard {
			let suffix = clean[2..].to_string();
			self.domains.entry(suffix.clone()).or_insert_with(|| WildcardDomain { suffix, claimants: HashSet::new() }).claimants.insert(claimant);
			return None;
		}

		if let Some(entry) = self.hostnames.get_mut(&clean) {
			entry.claimants.insert(claimant);
			return Some(entry.ip);
		}

		let ip = self.allocate_entry(clean.clone(), None)?;
		self.hostnames.get_mut(&clean).unwrap().claimants.insert(claimant);
		Some(ip)
	}

	fn allocate_entry(&mut self, name: String, parent_domain: Option<String>) -> Option<Ipv4Addr> {
		let Catalog { pool, addresses, .. } = self;

		let ip = match pool.allocate(|ip| addresses.contains_key(&ip)) {
			Ok(ip) => ip,
			Err(_) => {
				warn!("Address pool exhausted allocating for {name:?}");
				return None;
			}
		};

		self.addresses.insert(ip, Some(name.clone()));
		self.hostnames.insert(name.clone(), NameEntry { name, ip, claimants: HashSet::new(), parent_domain });
		Some(ip)
	}

	/// Removes `claimant` from every entry and domain, prunes entries and
	/// domains whose claimant set has become empty, and releases their IPs
	/// back to the pool (by forgetting the reverse mapping).
	pub fn deregister(&mut self, claimant: ClaimantId) {
		for domain in self.domains.values_mut() {
			domain.claimants.remove(&claimant);
		}

		let mut freed = Vec::new();
		{
			let domains = &self.domains;
			self.hostnames.retain(|_, entry| {
				entry.claimants.remove(&claimant);

				let parent_active = entry.parent_domain.as_ref().is_some_and(|d| domains.get(d).is_some_and(|dm| !dm.claimants.is_empty()));
				let keep = !entry.claimants.is_empty() || parent_active;

				if !keep {
					freed.push(entry.ip);
				}

				keep
			});
		}

		for ip in freed {
			self.addresses.remove(&ip);
		}

		self.domains.retain(|suffix, domain| {
			let keep = !domain.claimants.is_empty();
			if !keep {
				debug!("wildcard domain *.{suffix} has no remaining claimants");
			}
			keep
		});
	}

	/// Walks the longest dot-separated suffix of `name` registered in
	/// `domains`; the match must land on a label boundary.
	fn find_domain(&self, name: &str) -> Option<String> {
		let labels: Vec<&str> = name.split('.').collect();

		for start in 0..labels.len() {
			let suffix = labels[start..].join(".");
			if self.domains.contains_key(&suffix) {
				return Some(suffix);
			}
		}

		None
	}

	fn entry_active(&self, entry: &NameEntry) -> bool {
		!entry.claimants.is_empty() || entry.parent_domain.as_ref().is_some_and(|d| self.domains.get(d).is_some_and(|dm| !dm.claimants.is_empty()))
	}

	/// Exact match first; otherwise a longest-suffix wildcard-domain match,
	/// lazily creating the entry on first query. Rejects names containing
	/// `*` outright (including the lookup path ever seeing a literal
	/// wildcard marker, which is never a valid query name).
	pub fn lookup(&mut self, name: &str) -> Option<&NameEntry> {
		let (clean, _) = Self::clean_name(name).ok()?;

		if clean.contains('*') {
			return None;
		}

		if let Some(entry) = self.hostnames.get(&clean) {
			// `deregister` prunes entries the moment their effective
			// claimant set empties, so in practice `entry` is always
			// active here; the check stays so a stale entry falls through
			// to the domain search rather than being returned anyway.
			if self.entry_active(entry) {
				return self.hostnames.get(&clean);
			}
		}

		let domain_suffix = self.find_domain(&clean)?;
		if self.domains.get(&domain_suffix).is_some_and(|d| !d.claimants.is_empty()) {
			self.allocate_entry(clean.clone(), Some(domain_suffix));
		}

		self.hostnames.get(&clean)
	}

	/// Finds a claimed wildcard domain matching `name` by longest suffix,
	/// without creating a name entry — used by the engine to route
	/// MX/SRV/TXT queries to C5 (`find_domain` is private to keep the
	/// lazy-creation behavior out of the non-A/AAAA routing path).
	pub fn lookup_domain(&self, name: &str) -> Option<&str> {
		let (clean, _) = Self::clean_name(name).ok()?;
		if clean.contains('*') {
			return None;
		}

		let suffix = self.find_domain(&clean)?;
		let domain = self.domains.get(&suffix)?;
		(!domain.claimants.is_empty()).then_some(domain.suffix.as_str())
	}

	pub fn reverse(&self, ip: Ipv4Addr) -> Option<&str> {
		self.addresses.get(&ip).and_then(|o| o.as_deref())
	}

	/// The wildcard domain suffix of a synthetic IP's entry, if any. Not
	/// named in the distilled routing table but kept from
	/// `ziti_dns_reverse_lookup_domain`; cheap, and used by diagnostics
	/// (`ZitiDump`/`IpDump`).
	pub fn reverse_domain(&self, ip: Ipv4Addr) -> Option<&str> {
		let name = self.reverse(ip)?;
		self.hostnames.get(name)?.parent_domain.as_deref()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn catalog() -> Catalog {
		Catalog::seed("100.64.0.1/24", Ipv4Addr::new(100, 64, 0, 2)).unwrap()
	}

	#[test]
	fn reserved_addresses_are_never_handed_out() {
		let mut cat = catalog();
		let tun_ip = cat.tun_ip();

		// The tun IP coincides with the pool's own network address, which
		// the allocator already never yields; the DNS IP sentinel consumes
		// one real slot out of capacity, so only `capacity - 1` are free.
		for claimant in 0..cat.capacity() as u64 - 1 {
			let ip = cat.register_hostname(&format!("host{claimant}.example.com"), claimant).unwrap();
			assert_ne!(ip, tun_ip);
			assert_ne!(ip, Ipv4Addr::new(100, 64, 0, 2));
		}
	}

	#[test]
	fn register_is_idempotent_under_the_same_claimant() {
		let mut cat = catalog();
		let a = cat.register_hostname("host.example.com", 1).unwrap();
		let b = cat.register_hostname("host.example.com", 1).unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn cidr_and_blank_inputs_are_not_registered() {
		let mut cat = catalog();
		assert!(cat.register_hostname("10.0.0.0/8", 1).is_none());
	}

	#[test]
	fn wildcard_domain_matches_on_label_boundary() {
		let mut cat = catalog();
		assert!(cat.register_hostname("*.example.com", 1).is_none());

		assert!(cat.lookup("foo.example.com").is_some());
		assert!(cat.lookup("a.b.example.com").is_some());
		// "ample.com" must not match the "example.com" suffix.
		assert!(cat.lookup("ample.com").is_none());
	}

	#[test]
	fn lookup_rejects_names_containing_a_wildcard_marker() {
		let mut cat = catalog();
		cat.register_hostname("*.example.com", 1);
		assert!(cat.lookup("*.example.com").is_none());
	}

	#[test]
	fn deregister_prunes_entries_with_no_remaining_claim() {
		let mut cat = catalog();
		let ip = cat.register_hostname("host.example.com", 1).unwrap();
		cat.deregister(1);

		assert!(cat.lookup("host.example.com").is_none());
		assert!(cat.reverse(ip).is_none());
	}

	#[test]
	fn deregister_keeps_an_entry_alive_via_its_parent_domain() {
		let mut cat = catalog();
		cat.register_hostname("*.example.com", 1);
		cat.register_hostname("foo.example.com", 2);
		cat.deregister(2);

		// The exact-name claimant is gone, but the domain still claims it.
		assert!(cat.lookup("foo.example.com").is_some());

		cat.deregister(1);
		assert!(cat.lookup("foo.example.com").is_none());
	}

	#[test]
	fn released_ip_is_reusable_by_a_later_registration() {
		let mut cat = catalog();
		let ip = cat.register_hostname("host.example.com", 1).unwrap();
		cat.deregister(1);

		let reused = cat.register_hostname("other.example.com", 2).unwrap();
		assert_eq!(cat.reverse(ip), if reused == ip { Some("other.example.com") } else { None });
	}
}
