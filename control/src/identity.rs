//! The identity registry: the process-wide map from `identifier` to loaded
//! identity state, and the bridge between overlay service events and the
//! DNS engine's catalog.
//!
//! Not a `stakker` actor itself: its catalog-mutating decisions are kept in
//! cx-free methods returning a list of `CatalogOp`s (the same shape
//! `dnscore::engine`'s routing logic returns so it can be driven directly in
//! tests), and its one async boundary — subscribing to overlay SDK events in
//! `load` — uses a plain `Fwd::new` closure over `Rc<RefCell<Self>>` rather
//! than `fwd_to!`, the same pattern the control plane's connection handling
//! uses for its own callbacks.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use log::{info, warn};
use stakker::{call, Actor, Fwd};

use dnscore::catalog::ClaimantId;
use dnscore::engine::{Engine, FlowIo};
use dnscore::overlay::Overlay;

use crate::overlay::{OverlayCtx, OverlaySdk, SdkEvent};

pub struct Identity {
	pub identifier: String,
	pub ctx: Option<OverlayCtx>,
	/// overlay service-id → the claimant handle its intercepts were
	/// registered under.
	pub intercepts: HashMap<String, ClaimantId>,
	pub mfa_required: bool,
	pub last_mfa_ok: bool,
	pub active: bool,
}

/// A service as reported by the overlay SDK's `on_service_added`: the
/// addresses (hostnames, wildcard domains, or CIDRs) it wants intercepted.
pub struct Service {
	pub service_id: String,
	pub addresses: Vec<String>,
}

/// A catalog mutation decided by the registry's cx-free logic, dispatched
/// into the engine actor by the caller.
pub enum CatalogOp {
	Register { addr: String, claimant: ClaimantId },
	Deregister { claimant: ClaimantId },
}

pub struct IdentityRegistry<O> {
	overlay: O,
	identities: HashMap<String, Identity>,
	next_claimant: ClaimantId,
}

impl<O: OverlaySdk + Overlay> IdentityRegistry<O> {
	pub fn new(overlay: O) -> Self {
		Self { overlay, identities: HashMap::new(), next_claimant: 1 }
	}

	pub fn list(&self) -> Vec<&str> {
		self.identities.keys().map(String::as_str).collect()
	}

	pub fn get(&self, identifier: &str) -> Option<&Identity> {
		self.identities.get(identifier)
	}

	/// `IdentityOnOff`: the decision half of enabling/disabling traffic.
	/// Disabling drops every intercept the identity currently holds;
	/// re-enabling does not restore them on its own — the overlay SDK is
	/// expected to replay its service list once traffic resumes.
	pub fn set_active(&mut self, identifier: &str, on: bool) -> Option<Vec<CatalogOp>> {
		let identity = self.identities.get_mut(identifier)?;
		identity.active = on;

		if on {
			return Some(Vec::new());
		}

		Some(identity.intercepts.drain().map(|(_, claimant)| CatalogOp::Deregister { claimant }).collect())
	}

	/// `RemoveIdentity`: closes the overlay context and deregisters every
	/// remaining intercept.
	pub fn remove(&mut self, identifier: &str) -> Option<Vec<CatalogOp>> {
		let identity = self.identities.remove(identifier)?;

		if let Some(ctx) = identity.ctx {
			self.overlay.close_ctx(ctx);
		}

		Some(identity.intercepts.into_values().map(|claimant| CatalogOp::Deregister { claimant }).collect())
	}

	/// Claims every hostname/wildcard-domain address of a newly announced
	/// service under a fresh claimant handle; CIDR addresses are the
	/// TCP/IP stack collaborator's concern, out of scope here.
	pub fn on_service_added(&mut self, identifier: &str, service: Service) -> Vec<CatalogOp> {
		let Some(identity) = self.identities.get_mut(identifier) else {
			return Vec::new();
		};
		if !identity.active {
			return Vec::new();
		}

		let claimant = self.next_claimant;
		self.next_claimant += 1;
		identity.intercepts.insert(service.service_id, claimant);

		service.addresses.into_iter().filter(|addr| !addr.contains('/')).map(|addr| CatalogOp::Register { addr, claimant }).collect()
	}

	pub fn on_service_removed(&mut self, identifier: &str, service_id: &str) -> Option<CatalogOp> {
		let identity = self.identities.get_mut(identifier)?;
		let claimant = identity.intercepts.remove(service_id)?;
		Some(CatalogOp::Deregister { claimant })
	}

	fn on_mfa_event(&mut self, identifier: &str, required: Option<bool>, ok: Option<bool>) {
		let Some(identity) = self.identities.get_mut(identifier) else {
			return;
		};
		if let Some(required) = required {
			identity.mfa_required = required;
		}
		if let Some(ok) = ok {
			identity.last_mfa_ok = ok;
		}
	}

	/// Decides the catalog mutations for one overlay SDK event. Split out
	/// from `load`'s subscription closure so it stays a plain, directly
	/// testable method.
	fn handle_sdk_event(&mut self, identifier: &str, event: SdkEvent) -> Vec<CatalogOp> {
		match event {
			SdkEvent::MfaRequired => {
				self.on_mfa_event(identifier, Some(true), None);
				Vec::new()
			}
			SdkEvent::MfaStatus { ok } => {
				self.on_mfa_event(identifier, None, Some(ok));
				Vec::new()
			}
			SdkEvent::ContextStatus { available } => {
				if !available {
					warn!("Identity {identifier} lost its overlay context");
				}
				Vec::new()
			}
			SdkEvent::ServiceAdded { service_id, addresses } => self.on_service_added(identifier, Service { service_id, addresses }),
			SdkEvent::ServiceRemoved { service_id } => self.on_service_removed(identifier, &service_id).into_iter().collect(),
			SdkEvent::ExternalJwtRequest { provider } => {
				info!("Identity {identifier} requires external JWT login via {provider}");
				Vec::new()
			}
		}
	}
}

/// `LoadIdentity`: instantiates an overlay context from credentials at
/// `path` via the SDK adapter, installing a per-identifier event
/// subscription that decides catalog mutations and dispatches them into
/// `engine`. Takes `this` by shared handle (rather than `&mut self`) since
/// the subscription closure needs its own weak reference back into the
/// registry to call when an event arrives later.
pub fn load<O, F>(this: &Rc<RefCell<IdentityRegistry<O>>>, identifier: String, path: String, disabled: bool, engine: Actor<Engine<O, F>>) -> bool
where
	O: OverlaySdk + Overlay + 'static,
	F: FlowIo + 'static,
{
	if this.borrow().identities.contains_key(&identifier) {
		warn!("Identity {identifier} is already loaded");
		return false;
	}

	let weak: Weak<RefCell<IdentityRegistry<O>>> = Rc::downgrade(this);
	let on_event = Fwd::new(move |(identifier, event): (String, SdkEvent)| {
		let Some(this) = weak.upgrade() else {
			return;
		};
		let ops = this.borrow_mut().handle_sdk_event(&identifier, event);
		apply_ops(&engine, ops);
	});

	let ctx = this.borrow_mut().overlay.load_identity(&path, disabled, on_event);

	info!("Loaded identity {identifier}");
	this.borrow_mut().identities.insert(identifier.clone(), Identity { identifier, ctx: Some(ctx), intercepts: HashMap::new(), mfa_required: false, last_mfa_ok: false, active: !disabled });
	true
}

/// Dispatches decided catalog mutations into the engine actor. Split out so
/// both `load`'s subscription closure and C8's command handlers share it.
pub fn apply_ops<O, F>(engine: &Actor<Engine<O, F>>, ops: Vec<CatalogOp>)
where
	O: Overlay + 'static,
	F: FlowIo + 'static,
{
	for op in ops {
		match op {
			CatalogOp::Register { addr, claimant } => call!([engine], register_hostname(addr, claimant)),
			CatalogOp::Deregister { claimant } => call!([engine], deregister_claimant(claimant)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dnscore::overlay::ResolveEvent;

	#[derive(Default, Clone)]
	struct FakeSdk {
		closed: std::rc::Rc<std::cell::RefCell<Vec<OverlayCtx>>>,
	}

	impl Overlay for FakeSdk {
		fn resolve_connect(&mut self, _domain: &str, _on_event: Fwd<ResolveEvent>) -> dnscore::overlay::ConnId {
			0
		}
		fn write(&mut self, _conn: dnscore::overlay::ConnId, _bytes: Vec<u8>) {}
		fn close(&mut self, _conn: dnscore::overlay::ConnId) {}
	}

	impl OverlaySdk for FakeSdk {
		fn load_identity(&mut self, _path: &str, _disabled: bool, _on_event: Fwd<(String, SdkEvent)>) -> OverlayCtx {
			1
		}
		fn enroll(&mut self, _identifier: String, _opts: crate::overlay::EnrollOpts, _on_done: Fwd<(String, Result<String, String>)>) {}
		fn dial(&mut self, _ctx: OverlayCtx, _service: &str) -> dnscore::overlay::ConnId {
			0
		}
		fn close_ctx(&mut self, ctx: OverlayCtx) {
			self.closed.borrow_mut().push(ctx);
		}
	}

	fn registry_with_identity(identifier: &str, active: bool) -> IdentityRegistry<FakeSdk> {
		let mut reg = IdentityRegistry::new(FakeSdk::default());
		reg.identities.insert(identifier.to_string(), Identity { identifier: identifier.to_string(), ctx: Some(1), intercepts: HashMap::new(), mfa_required: false, last_mfa_ok: false, active });
		reg
	}

	#[test]
	fn service_added_claims_every_non_cidr_address() {
		let mut reg = registry_with_identity("id1", true);
		let ops = reg.on_service_added("id1", Service { service_id: "svc1".into(), addresses: vec!["host.example.com".into(), "10.0.0.0/8".into()] });

		assert_eq!(ops.len(), 1);
		assert!(matches!(&ops[0], CatalogOp::Register { addr, .. } if addr == "host.example.com"));
		assert_eq!(reg.get("id1").unwrap().intercepts.len(), 1);
	}

	#[test]
	fn inactive_identity_does_not_claim_services() {
		let mut reg = registry_with_identity("id1", false);
		let ops = reg.on_service_added("id1", Service { service_id: "svc1".into(), addresses: vec!["host.example.com".into()] });
		assert!(ops.is_empty());
	}

	#[test]
	fn disabling_identity_deregisters_its_intercepts() {
		let mut reg = registry_with_identity("id1", true);
		reg.on_service_added("id1", Service { service_id: "svc1".into(), addresses: vec!["host.example.com".into()] });

		let ops = reg.set_active("id1", false).unwrap();
		assert_eq!(ops.len(), 1);
		assert!(matches!(ops[0], CatalogOp::Deregister { .. }));
		assert!(reg.get("id1").unwrap().intercepts.is_empty());
	}

	#[test]
	fn remove_closes_the_overlay_context_and_deregisters_everything() {
		let mut reg = registry_with_identity("id1", true);
		let closed = reg.overlay.closed.clone();
		reg.on_service_added("id1", Service { service_id: "svc1".into(), addresses: vec!["a.example.com".into()] });

		let ops = reg.remove("id1").unwrap();
		assert_eq!(ops.len(), 1);
		assert_eq!(*closed.borrow(), vec![1]);
		assert!(reg.get("id1").is_none());
	}

	#[test]
	fn handle_sdk_event_routes_service_added_into_a_catalog_op() {
		let mut reg = registry_with_identity("id1", true);
		let ops = reg.handle_sdk_event("id1", SdkEvent::ServiceAdded { service_id: "svc1".into(), addresses: vec!["host.example.com".into()] });
		assert_eq!(ops.len(), 1);
	}
}
