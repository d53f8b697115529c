//! Stand-ins for the two external collaborators this binary wires together
//! but doesn't implement: the overlay SDK connection and the TUN/stack flow
//! I/O. Both are explicitly out of scope (the overlay SDK's own internals,
//! and the TUN driver/platform NRPT glue), so these just log what a real
//! adapter would be asked to do, keeping the daemon wiring runnable without
//! pulling in either integration.
use std::cell::Cell;

use dnscore::engine::{ClientId, FlowIo};
use dnscore::overlay::{ConnId, Overlay, ResolveEvent};
use log::debug;
use stakker::Fwd;

use control::overlay::{EnrollOpts, OverlayCtx, OverlaySdk, SdkEvent};

#[derive(Clone, Default)]
pub struct NullOverlay {
	next_conn: std::rc::Rc<Cell<ConnId>>,
}

impl Overlay for NullOverlay {
	fn resolve_connect(&mut self, domain: &str, _on_event: Fwd<ResolveEvent>) -> ConnId {
		debug!("overlay: resolve_connect({domain}) [no overlay SDK wired in]");
		self.next_id()
	}

	fn write(&mut self, conn: ConnId, bytes: Vec<u8>) {
		debug!("overlay: write({conn}, {} bytes) [no overlay SDK wired in]", bytes.len());
	}

	fn close(&mut self, conn: ConnId) {
		debug!("overlay: close({conn}) [no overlay SDK wired in]");
	}
}

impl OverlaySdk for NullOverlay {
	fn load_identity(&mut self, path: &str, disabled: bool, _on_event: Fwd<(String, SdkEvent)>) -> OverlayCtx {
		debug!("overlay: load_identity({path}, disabled={disabled}) [no overlay SDK wired in]");
		self.next_id()
	}

	fn enroll(&mut self, identifier: String, _opts: EnrollOpts, _on_done: Fwd<(String, Result<String, String>)>) {
		debug!("overlay: enroll({identifier}) [no overlay SDK wired in]");
	}

	fn dial(&mut self, ctx: OverlayCtx, service: &str) -> ConnId {
		debug!("overlay: dial({ctx}, {service}) [no overlay SDK wired in]");
		self.next_id()
	}

	fn close_ctx(&mut self, ctx: OverlayCtx) {
		debug!("overlay: close_ctx({ctx}) [no overlay SDK wired in]");
	}
}

impl NullOverlay {
	fn next_id(&self) -> ConnId {
		let id = self.next_conn.get() + 1;
		self.next_conn.set(id);
		id
	}
}

#[derive(Clone, Default)]
pub struct NullFlow;

impl FlowIo for NullFlow {
	fn send(&mut self, client: ClientId, bytes: &[u8]) {
		debug!("flow: send({client}, {} bytes) [no TUN/stack wired in]", bytes.len());
	}

	fn close(&mut self, client: ClientId) {
		debug!("flow: close({client}) [no TUN/stack wired in]");
	}
}
