//! The DNS engine (C6): wires C1-C5 together into the request lifecycle a
//! client's UDP flow actually drives — deduplicate, parse, route, respond.
//!
//! Grounded in `original_source/lib/ziti-tunnel-cbs/ziti_dns.c`'s
//! `on_dns_client_request`/`complete_dns_req`/`query_upstream`: the in-flight
//! table is keyed by the 16-bit transaction ID alone (not `(client, id)`),
//! which is also exactly what makes the "duplicate ID" dedup rule a sound
//! implementation of per-client uniqueness — a client can't collide with
//! itself, and two clients colliding on the same ID get the same silent-drop
//! treatment a same-client duplicate would. Timer wiring follows
//! `net/src/dns/mod.rs`'s pattern (`cx.after`/`cx.timer_del`); the routing
//! logic itself is kept free of `CX![]` so it can be driven directly in
//! tests, the same way `proxy.rs`'s `handle_event` is.
use core::net::{IpAddr, Ipv4Addr};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::{debug, warn};
use stakker::{fwd_to, Fwd, FixedTimerKey, CX};

use crate::catalog::{Catalog, ClaimantId};
use crate::error::Rcode;
use crate::overlay::{Overlay, ResolveEvent};
use crate::proxy::{Outcome, ProxyResolver};
use crate::upstream::{self, Upstream};
use crate::wire::{self, Answer, AnswerData, Query, TY_A, TY_AAAA, TY_MX, TY_SRV, TY_TXT};

/// A synthetic IP's A/AAAA answers get a short TTL since the mapping can be
/// torn down by a `deregister` at any time.
const SYNTHETIC_TTL: u32 = 60;

/// A client UDP flow is closed this long after its last packet if it hasn't
/// already closed on its own (see `complete`).
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Opaque handle for one client-side UDP flow, assigned by whatever owns the
/// TUN/stack collaborator (out of scope here; see the engine's boundary
/// trait below).
pub type ClientId = u64;

/// The engine's half of the TUN/stack contract: send a datagram back to a
/// client, or close its flow outright (malformed query, idle timeout, or
/// simply running out of in-flight requests).
pub trait FlowIo {
	fn send(&mut self, client: ClientId, bytes: &[u8]);
	fn close(&mut self, client: ClientId);
}

#[derive(Default)]
struct ClientSession {
	active: HashSet<u16>,
	idle_timer: Option<FixedTimerKey>,
}

struct InFlight {
	client: ClientId,
	query: Query,
}

pub struct Engine<O, F> {
	catalog: Catalog,
	upstream: Upstream,
	proxy: ProxyResolver<O>,
	clients: HashMap<ClientId, ClientSession>,
	in_flight: HashMap<u16, InFlight>,
	flow: F,
}

impl<O: Overlay, F: FlowIo> Engine<O, F> {
	pub fn init(cx: CX![], catalog: Catalog, overlay: O, flow: F) -> Option<Self> {
		let actor = cx.access_actor().clone();
		let on_packet = fwd_to!([actor], on_upstream_packet() as Vec<u8>);
		let upstream = Upstream::init(on_packet)?;

		Some(Self { catalog, upstream, proxy: ProxyResolver::new(overlay), clients: HashMap::new(), in_flight: HashMap::new(), flow })
	}

	/// `SetUpstreamDNS`/startup reconfiguration of C4. Takes owned hosts
	/// (rather than a borrowed slice, like `register_hostname`/
	/// `deregister_claimant`) so it can be driven through `call!` from the
	/// control plane's cx-free dispatcher, not just from `Engine::init`'s
	/// own caller.
	pub fn set_upstreams(&mut self, _cx: CX![], hosts: Vec<(IpAddr, Option<u16>)>) -> usize {
		self.upstream.set_upstreams(&hosts)
	}

	/// C3/C2 entry point for the identity registry (C7): claims `addr` (a
	/// hostname or `*.`-prefixed wildcard domain) for `claimant`, allocating
	/// a synthetic IP on first registration. The allocated IP isn't
	/// reported back; C7 only needs the claim to exist, and the engine
	/// looks the mapping back up itself when answering queries.
	pub fn register_hostname(&mut self, _cx: CX![], addr: String, claimant: ClaimantId) {
		let _: Option<Ipv4Addr> = self.catalog.register_hostname(&addr, claimant);
	}

	/// Releases every claim `claimant` holds, pruning entries and domains
	/// that become unclaimed and freeing their IPs back to the pool.
	pub fn deregister_claimant(&mut self, _cx: CX![], claimant: ClaimantId) {
		self.catalog.deregister(claimant);
	}

	/// Registers a new client flow and arms its idle timer. A flow that
	/// never sends a packet is still reaped after `IDLE_TIMEOUT`.
	pub fn on_new_udp_flow(&mut self, cx: CX![], client: ClientId) {
		self.clients.entry(client).or_default();
		self.arm_idle_timer(cx, client);
	}

	/// Steps 1-4 of the request lifecycle for one client datagram.
	pub fn on_udp_data(&mut self, cx: CX![], client: ClientId, bytes: Vec<u8>) {
		self.arm_idle_timer(cx, client);

		let actor = cx.access_actor().clone();
		let on_event = fwd_to!([actor], on_resolve_event() as ResolveEvent);

		if let Some(client) = self.process_datagram(client, &bytes, on_event) {
			self.close_client(cx, client);
		}
	}

	/// An upstream response arriving on the shared forwarder socket; relayed
	/// verbatim to whichever client is still waiting on its transaction ID.
	fn on_upstream_packet(&mut self, cx: CX![], bytes: Vec<u8>) {
		let Some(bytes) = upstream::accept_response(bytes) else {
			return;
		};
		if bytes.len() < 2 {
			return;
		}
		let id = u16::from_be_bytes([bytes[0], bytes[1]]);

		if let Some(client) = self.complete(id, Some(bytes)) {
			self.close_client(cx, client);
		}
	}

	/// An event from the shared `Fwd<ResolveEvent>` endpoint every proxied
	/// domain connection forwards into.
	fn on_resolve_event(&mut self, cx: CX![], event: ResolveEvent) {
		for (id, outcome) in self.proxy.handle_event(event) {
			if let Some(client) = self.finish_proxy(id, outcome) {
				self.close_client(cx, client);
			}
		}
	}

	/// Deduplicate, parse, route. Kept free of `CX![]` so it can be driven
	/// directly in tests; returns the client to close, if any (a malformed
	/// query, or a request whose completion leaves the client with no more
	/// in-flight work).
	fn process_datagram(&mut self, client: ClientId, bytes: &[u8], on_event: Fwd<ResolveEvent>) -> Option<ClientId> {
		if bytes.len() < 2 {
			return None;
		}
		let id = u16::from_be_bytes([bytes[0], bytes[1]]);

		if self.in_flight.contains_key(&id) {
			debug!("Dropping duplicate in-flight transaction 0x{id:x}");
			return None;
		}

		let query = match wire::parse_query(bytes) {
			Ok(q) => q,
			Err(_) => {
				warn!("Closing client after malformed query");
				return Some(client);
			}
		};

		self.clients.entry(client).or_default().active.insert(id);
		self.in_flight.insert(id, InFlight { client, query: query.clone() });
		self.route(query, bytes, on_event)
	}

	fn route(&mut self, query: Query, raw: &[u8], on_event: Fwd<ResolveEvent>) -> Option<ClientId> {
		match query.qtype {
			TY_A | TY_AAAA => self.route_address(query, raw),
			TY_MX | TY_SRV | TY_TXT => self.route_proxied(query, raw, on_event),
			_ => {
				if query.rd && self.upstream.is_configured() {
					self.forward(query, raw)
				} else {
					self.respond(&query, Rcode::NotImp, Vec::new())
				}
			}
		}
	}

	fn route_address(&mut self, query: Query, raw: &[u8]) -> Option<ClientId> {
		if let Some(entry) = self.catalog.lookup(&query.name) {
			let answers = match query.qtype {
				// AAAA gets an empty, NOERROR answer: the catalog only ever
				// hands out synthetic IPv4 addresses.
				TY_AAAA => Vec::new(),
				_ => vec![Answer { ttl: SYNTHETIC_TTL, data: AnswerData::A(entry.ip) }],
			};
			return self.respond(&query, Rcode::NoError, answers);
		}

		self.miss_or_forward(query, raw)
	}

	fn route_proxied(&mut self, query: Query, raw: &[u8], on_event: Fwd<ResolveEvent>) -> Option<ClientId> {
		let Some(domain) = self.catalog.lookup_domain(&query.name).map(str::to_string) else {
			return self.miss_or_forward(query, raw);
		};

		match self.proxy.resolve(&domain, &query, on_event) {
			Some(outcome) => self.finish_proxy(query.id, outcome),
			None => None,
		}
	}

	/// A catalog miss for an address or proxied query: forward upstream when
	/// recursion is requested and an upstream is configured, otherwise
	/// `REFUSED` — mirroring `query_upstream`'s `req->msg.recursive` check.
	fn miss_or_forward(&mut self, query: Query, raw: &[u8]) -> Option<ClientId> {
		if query.rd && self.upstream.is_configured() {
			self.forward(query, raw)
		} else {
			self.respond(&query, Rcode::Refused, Vec::new())
		}
	}

	fn forward(&mut self, query: Query, raw: &[u8]) -> Option<ClientId> {
		if !self.upstream.send(raw) {
			warn!("No upstream accepted query 0x{:x}", query.id);
			return self.respond(&query, Rcode::Refused, Vec::new());
		}
		// On success the response (or a client idle timeout) completes the
		// in-flight entry already inserted by `process_datagram`.
		None
	}

	fn finish_proxy(&mut self, id: u16, outcome: Outcome) -> Option<ClientId> {
		let (rcode, answers) = match outcome {
			Outcome::Answered(rcode, answers) => (rcode, answers),
			Outcome::Failed(rcode) => (rcode, Vec::new()),
		};

		let query = self.in_flight.get(&id)?.query.clone();
		let bytes = wire::assemble(&query, rcode, &answers, self.upstream.is_configured());
		self.complete(id, Some(bytes))
	}

	fn respond(&mut self, query: &Query, rcode: Rcode, answers: Vec<Answer>) -> Option<ClientId> {
		let bytes = wire::assemble(query, rcode, &answers, self.upstream.is_configured());
		self.complete(query.id, Some(bytes))
	}

	/// Removes `id` from the in-flight table and sends the reply (if any) to
	/// its client. Returns the client if it now has no in-flight requests
	/// left, meaning it should be closed immediately rather than waiting out
	/// the idle timeout — mirroring `complete_dns_req`'s eager
	/// `on_dns_close` when `active_reqs` empties.
	fn complete(&mut self, id: u16, bytes: Option<Vec<u8>>) -> Option<ClientId> {
		let InFlight { client, .. } = self.in_flight.remove(&id)?;

		if let Some(bytes) = &bytes {
			self.flow.send(client, bytes);
		}

		let empty = self.clients.get_mut(&client).is_some_and(|session| {
			session.active.remove(&id);
			session.active.is_empty()
		});

		empty.then_some(client)
	}

	fn arm_idle_timer(&mut self, cx: CX![], client: ClientId) {
		if let Some(session) = self.clients.get_mut(&client) {
			if let Some(key) = session.idle_timer.take() {
				cx.timer_del(key);
			}
		}

		let actor = cx.access_actor().clone();
		let key = cx.after(IDLE_TIMEOUT, move |s| actor.apply(s, move |this, cx| this.on_idle_timeout(cx, client)));

		self.clients.entry(client).or_default().idle_timer = Some(key);
	}

	fn on_idle_timeout(&mut self, cx: CX![], client: ClientId) {
		debug!("Closing idle client");
		self.close_client(cx, client);
	}

	/// Tears down a client's session: cancels its idle timer, discards every
	/// request still in flight for it (a late upstream/proxy reply for one
	/// of those IDs is simply dropped in `complete`, since it's no longer
	/// present), and tells the flow collaborator to close.
	pub fn close_client(&mut self, cx: CX![], client: ClientId) {
		if let Some(session) = self.clients.remove(&client) {
			if let Some(key) = session.idle_timer {
				cx.timer_del(key);
			}
			for id in session.active {
				self.in_flight.remove(&id);
			}
		}

		self.flow.close(client);
	}
}

#[cfg(test)]
mod tests {
	use core::net::Ipv4Addr;
	use std::cell::RefCell;
	use std::rc::Rc;

	use super::*;
	use crate::overlay::ConnId;
	use crate::wire::CLASS_IN;

	#[derive(Default)]
	struct FakeFlow {
		sent: Rc<RefCell<Vec<(ClientId, Vec<u8>)>>>,
	}

	impl FlowIo for FakeFlow {
		fn send(&mut self, client: ClientId, bytes: &[u8]) {
			self.sent.borrow_mut().push((client, bytes.to_vec()));
		}

		fn close(&mut self, _client: ClientId) {}
	}

	#[derive(Default)]
	struct FakeOverlay {
		next_id: ConnId,
	}

	impl Overlay for FakeOverlay {
		fn resolve_connect(&mut self, _domain: &str, _on_event: Fwd<ResolveEvent>) -> ConnId {
			self.next_id += 1;
			self.next_id
		}

		fn write(&mut self, _conn: ConnId, _bytes: Vec<u8>) {}
		fn close(&mut self, _conn: ConnId) {}
	}

	fn fwd() -> Fwd<ResolveEvent> {
		Fwd::new(|_: ResolveEvent| {})
	}

	fn engine() -> Engine<FakeOverlay, FakeFlow> {
		let catalog = Catalog::seed("100.64.0.1/24", Ipv4Addr::new(100, 64, 0, 2)).unwrap();
		Engine {
			catalog,
			upstream: Upstream::init(Fwd::new(|_: Vec<u8>| {})).unwrap(),
			proxy: ProxyResolver::new(FakeOverlay::default()),
			clients: HashMap::new(),
			in_flight: HashMap::new(),
			flow: FakeFlow::default(),
		}
	}

	fn query_bytes(id: u16, name: &str, qtype: u16) -> Vec<u8> {
		let q = Query { id, rd: true, name: name.into(), qtype, qclass: CLASS_IN };
		wire::assemble(&q, Rcode::NoError, &[], false)
	}

	#[test]
	fn registered_hostname_is_answered_and_client_is_closed() {
		let mut engine = engine();
		let sent = engine.flow.sent.clone();
		let ip = engine.catalog.register_hostname("host.example.com", 1).unwrap();

		let bytes = query_bytes(7, "host.example.com", TY_A);
		let closed = engine.process_datagram(1, &bytes, fwd());

		assert_eq!(closed, Some(1));
		let sent = sent.borrow();
		assert_eq!(sent.len(), 1);
		let reply = wire::parse_query(&sent[0].1).unwrap();
		assert_eq!(reply.id, 7);
		assert!(sent[0].1.len() > 12);
		let _ = ip;
	}

	#[test]
	fn miss_without_upstream_is_refused_immediately() {
		let mut engine = engine();
		let bytes = query_bytes(1, "unregistered.example.com", TY_A);
		let closed = engine.process_datagram(1, &bytes, fwd());

		assert_eq!(closed, Some(1));
		assert!(engine.in_flight.is_empty());
	}

	#[test]
	fn duplicate_transaction_id_is_dropped_while_pending() {
		let mut engine = engine();
		engine.catalog.register_hostname("*.corp.example", 1);

		let bytes = query_bytes(0x22, "mail.corp.example", TY_MX);
		// Goes to the proxy resolver, which never completes it synchronously
		// (no `Data`/`Closed` event is delivered here), so it stays in-flight.
		let closed = engine.process_datagram(1, &bytes, fwd());
		assert_eq!(closed, None);
		assert!(engine.in_flight.contains_key(&0x22));

		let closed_again = engine.process_datagram(1, &bytes, fwd());
		assert_eq!(closed_again, None);
	}

	#[test]
	fn malformed_query_closes_the_client() {
		let mut engine = engine();
		let closed = engine.process_datagram(1, &[0u8; 4], fwd());
		assert_eq!(closed, Some(1));
	}

	#[test]
	fn unknown_qtype_without_recursion_is_not_implemented() {
		let mut engine = engine();
		let q = Query { id: 5, rd: false, name: "example.com".into(), qtype: 99, qclass: CLASS_IN };
		let bytes = wire::assemble(&q, Rcode::NoError, &[], false);

		let closed = engine.process_datagram(1, &bytes, fwd());
		assert_eq!(closed, Some(1));
	}
}
