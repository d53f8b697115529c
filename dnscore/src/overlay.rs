//! The slice of the overlay SDK contract the proxy resolver needs:
//! `resolve_connect`/`write`/`close`. The rest of the contract
//! (`load_identity`, `enroll`, `dial`, the event stream) belongs to the
//! `control` crate, which depends on this trait rather than the other way
//! around so `dnscore` has no upward dependency on the control plane.
//!
//! Modeled as a trait object specifically so tests can supply a fake for
//! the overlay, treated throughout as an external collaborator rather than
//! something this crate implements.
use stakker::Fwd;

pub type ConnId = u64;

pub enum ResolveEvent {
	Open(ConnId),
	Data(ConnId, Vec<u8>),
	Closed(ConnId),
}

pub trait Overlay {
	/// Opens a "resolve" connection scoped to `domain`, reusing the
	/// connection for later queries against the same domain is the
	/// caller's (`ProxyResolver`'s) responsibility, not this trait's.
	fn resolve_connect(&mut self, domain: &str, on_event: Fwd<ResolveEvent>) -> ConnId;
	fn write(&mut self, conn: ConnId, bytes: Vec<u8>);
	fn close(&mut self, conn: ConnId);
}
