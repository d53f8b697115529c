//! The fuller overlay SDK contract: extends `dnscore`'s minimal
//! `resolve_connect`/`write`/`close` trait with the identity-lifecycle
//! operations the identity registry and control plane need. Kept as a trait
//! object so tests can substitute a fake, the same reasoning
//! `dnscore::overlay::Overlay` itself follows.
use dnscore::overlay::{ConnId, Overlay};
use stakker::Fwd;

pub type OverlayCtx = u64;

/// Events the overlay SDK delivers about a loaded identity, outside the
/// resolve-connection traffic `dnscore::overlay::ResolveEvent` already
/// covers.
#[derive(Debug, Clone)]
pub enum SdkEvent {
	ContextStatus { available: bool },
	ServiceAdded { service_id: String, addresses: Vec<String> },
	ServiceRemoved { service_id: String },
	MfaRequired,
	MfaStatus { ok: bool },
	ExternalJwtRequest { provider: String },
}

#[derive(Debug, Clone)]
pub struct EnrollOpts {
	pub url: String,
	pub name: String,
	pub jwt: String,
	pub key: Option<String>,
	pub cert: Option<String>,
	pub use_keychain: bool,
}

/// The identity-lifecycle slice of the overlay SDK. A concrete adapter (or
/// test fake) implements both this and `dnscore::overlay::Overlay`, since
/// both the proxy resolver and the identity registry ultimately talk to the
/// same SDK connection.
pub trait OverlaySdk: Overlay {
	/// Loads an identity from `path`, installs tunnel callbacks, and
	/// subscribes `on_event` to its context/service/MFA events.
	fn load_identity(&mut self, path: &str, disabled: bool, on_event: Fwd<(String, SdkEvent)>) -> OverlayCtx;
	/// Enrolls a new identity; `identifier` tags the async result so the
	/// caller can match it back to the command that requested it.
	fn enroll(&mut self, identifier: String, opts: EnrollOpts, on_done: Fwd<(String, Result<String, String>)>);
	fn dial(&mut self, ctx: OverlayCtx, service: &str) -> ConnId;
	fn close_ctx(&mut self, ctx: OverlayCtx);
}
