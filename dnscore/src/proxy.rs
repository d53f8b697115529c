//! The proxy resolver (C5): one overlay "resolve" connection per wildcard
//! domain, used to answer MX/SRV/TXT queries that the catalog routed to a
//! domain instead of a plain hostname.
//!
//! The JSON-over-a-byte-stream shape follows the control plane's own JSON
//! command/event wire format, where field-name wire-compatibility with
//! existing clients must be preserved; `serde`/`serde_json` follow naturally
//! as the idiomatic choice already used by `control`.
use std::collections::{HashMap, HashSet};

use log::{error, warn};
use serde::{Deserialize, Serialize};
use stakker::Fwd;

use crate::error::Rcode;
use crate::overlay::{ConnId, Overlay, ResolveEvent};
use crate::wire::{Answer, AnswerData, Query, TY_MX, TY_SRV, TY_TXT};

#[derive(Default)]
struct DomainConn {
	conn: Option<ConnId>,
	/// Transaction IDs awaiting an answer on this connection.
	pending: HashSet<u16>,
}

pub enum Outcome {
	Answered(Rcode, Vec<Answer>),
	Failed(Rcode),
}

pub struct ProxyResolver<O> {
	overlay: O,
	domains: HashMap<String, DomainConn>,
	conn_domain: HashMap<ConnId, String>,
}

impl<O: Overlay> ProxyResolver<O> {
	pub fn new(overlay: O) -> Self {
		Self { overlay, domains: HashMap::new(), conn_domain: HashMap::new() }
	}

	/// Submits `query` against `domain`'s resolve connection, opening one
	/// (via `overlay.resolve_connect`) on first use. `on_event` is a single
	/// shared forwarding endpoint the caller routes back into
	/// `handle_event`; reusing one endpoint across every domain avoids
	/// needing a fresh bound closure per connection.
	///
	/// Returns `Some(Outcome::Failed(NotImp))` immediately, without
	/// touching any connection, for query types other than MX/SRV/TXT.
	pub fn resolve(&mut self, domain: &str, query: &Query, on_event: Fwd<ResolveEvent>) -> Option<Outcome> {
		if !matches!(query.qtype, TY_MX | TY_SRV | TY_TXT) {
			return Some(Outcome::Failed(Rcode::NotImp));
		}

		let dc = self.domains.entry(domain.to_string()).or_default();

		let conn = match dc.conn {
			Some(conn) => conn,
			None => {
				let conn = self.overlay.resolve_connect(domain, on_event);
				self.conn_domain.insert(conn, domain.to_string());
				dc.conn = Some(conn);
				conn
			}
		};

		dc.pending.insert(query.id);

		let wire_query = ProxyQuery {
			id: query.id,
			question: [ProxyQuestion { name: query.name.clone(), r#type: query.qtype, class: query.qclass }],
		};

		match serde_json::to_vec(&wire_query) {
			Ok(bytes) => self.overlay.write(conn, bytes),
			Err(err) => error!("Failed to serialize proxy query for {domain}: {err}"),
		}

		None
	}

	/// Processes an event from the shared `Fwd<ResolveEvent>` endpoint.
	/// `Open` is informational; `Data` resolves exactly one pending
	/// transaction; `Closed` fails every transaction still pending on that
	/// connection with `SERVFAIL` and forgets the connection so the next
	/// `resolve` call re-dials.
	pub fn handle_event(&mut self, event: ResolveEvent) -> Vec<(u16, Outcome)> {
		match event {
			ResolveEvent::Open(_) => Vec::new(),
			ResolveEvent::Data(conn, bytes) => self.handle_data(conn, &bytes).into_iter().collect(),
			ResolveEvent::Closed(conn) => self.handle_closed(conn),
		}
	}

	fn handle_data(&mut self, conn: ConnId, bytes: &[u8]) -> Option<(u16, Outcome)> {
		let Some(domain) = self.conn_domain.get(&conn) else {
			warn!("Proxy data on unknown connection");
			return None;
		};

		let dc = self.domains.get_mut(domain)?;

		let resp: ProxyResponse = match serde_json::from_slice(bytes) {
			Ok(resp) => resp,
			Err(err) => {
				warn!("Malformed proxy response on domain {domain}: {err}");
				return None;
			}
		};

		if !dc.pending.remove(&resp.id) {
			warn!("Proxy response for untracked transaction 0x{:x} on domain {domain}", resp.id);
			return None;
		}

		let outcome = if resp.rcode != 0 {
			Outcome::Failed(Rcode::from_u8(resp.rcode))
		} else {
			let answers = resp.answers.into_iter().map(Answer::from).collect();
			Outcome::Answered(Rcode::NoError, answers)
		};

		Some((resp.id, outcome))
	}

	fn handle_closed(&mut self, conn: ConnId) -> Vec<(u16, Outcome)> {
		let Some(domain) = self.conn_domain.remove(&conn) else {
			return Vec::new();
		};

		let Some(dc) = self.domains.get_mut(&domain) else {
			return Vec::new();
		};

		dc.conn = None;
		dc.pending.drain().map(|id| (id, Outcome::Failed(Rcode::ServFail))).collect()
	}
}

#[derive(Serialize)]
struct ProxyQuery {
	id: u16,
	question: [ProxyQuestion; 1],
}

#[derive(Serialize)]
struct ProxyQuestion {
	name: String,
	r#type: u16,
	class: u16,
}

#[derive(Deserialize)]
struct ProxyResponse {
	id: u16,
	#[serde(default)]
	rcode: u8,
	#[serde(default)]
	answers: Vec<ProxyAnswer>,
}

#[derive(Deserialize)]
struct ProxyAnswer {
	ttl: u32,
	#[serde(flatten)]
	data: ProxyAnswerData,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ProxyAnswerData {
	#[serde(rename = "MX")]
	Mx { preference: u16, exchange: String },
	#[serde(rename = "SRV")]
	Srv { priority: u16, weight: u16, port: u16, target: String },
	#[serde(rename = "TXT")]
	Txt { text: String },
}

impl From<ProxyAnswer> for Answer {
	fn from(value: ProxyAnswer) -> Self {
		let data = match value.data {
			ProxyAnswerData::Mx { preference, exchange } => AnswerData::Mx { preference, exchange },
			ProxyAnswerData::Srv { priority, weight, port, target } => AnswerData::Srv { priority, weight, port, target },
			ProxyAnswerData::Txt { text } => AnswerData::Txt(text),
		};

		Answer { ttl: value.ttl, data }
	}
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::rc::Rc;

	use stakker::Fwd;

	use super::*;
	use crate::wire::CLASS_IN;

	/// A fake overlay that hands out sequential connection IDs and records
	/// every write, for assertion by the test.
	#[derive(Default)]
	struct FakeOverlay {
		next_id: ConnId,
		writes: Rc<RefCell<Vec<(ConnId, Vec<u8>)>>>,
	}

	impl Overlay for FakeOverlay {
		fn resolve_connect(&mut self, _domain: &str, _on_event: Fwd<ResolveEvent>) -> ConnId {
			self.next_id += 1;
			self.next_id
		}

		fn write(&mut self, conn: ConnId, bytes: Vec<u8>) {
			self.writes.borrow_mut().push((conn, bytes));
		}

		fn close(&mut self, _conn: ConnId) {}
	}

	/// A `Fwd` that discards everything; these tests drive `handle_event`
	/// directly rather than through the actor system.
	fn fwd() -> Fwd<ResolveEvent> {
		Fwd::new(|_: ResolveEvent| {})
	}

	#[test]
	fn unsupported_qtype_fails_without_opening_a_connection() {
		let writes = Rc::new(RefCell::new(Vec::new()));
		let mut resolver = ProxyResolver::new(FakeOverlay { next_id: 0, writes: writes.clone() });

		let query = Query { id: 1, rd: true, name: "x.corp.example".into(), qtype: crate::wire::TY_A, qclass: CLASS_IN };
		let outcome = resolver.resolve("corp.example", &query, fwd());

		assert!(matches!(outcome, Some(Outcome::Failed(Rcode::NotImp))));
		assert!(writes.borrow().is_empty());
	}

	#[test]
	fn mx_query_is_serialized_and_answered_via_data_event() {
		let writes = Rc::new(RefCell::new(Vec::new()));
		let mut resolver = ProxyResolver::new(FakeOverlay { next_id: 0, writes: writes.clone() });

		let query = Query { id: 0x55, rd: true, name: "mail.corp.example".into(), qtype: TY_MX, qclass: CLASS_IN };
		let outcome = resolver.resolve("corp.example", &query, fwd());
		assert!(outcome.is_none());

		let (conn, bytes) = writes.borrow()[0].clone();
		let sent: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(sent["question"][0]["type"], 15);

		let response = serde_json::json!({
			"id": 0x55,
			"rcode": 0,
			"answers": [{"ttl": 60, "type": "MX", "preference": 10, "exchange": "mx.corp.example"}],
		});
		let results = resolver.handle_event(ResolveEvent::Data(conn, serde_json::to_vec(&response).unwrap()));

		assert_eq!(results.len(), 1);
		let (id, outcome) = &results[0];
		assert_eq!(*id, 0x55);
		assert!(matches!(outcome, Outcome::Answered(Rcode::NoError, answers) if answers.len() == 1));
	}

	#[test]
	fn closed_connection_fails_all_pending_queries() {
		let writes = Rc::new(RefCell::new(Vec::new()));
		let mut resolver = ProxyResolver::new(FakeOverlay { next_id: 0, writes: writes.clone() });

		let q1 = Query { id: 1, rd: true, name: "a.corp.example".into(), qtype: TY_MX, qclass: CLASS_IN };
		let q2 = Query { id: 2, rd: true, name: "b.corp.example".into(), qtype: TY_SRV, qclass: CLASS_IN };
		resolver.resolve("corp.example", &q1, fwd());
		resolver.resolve("corp.example", &q2, fwd());

		let conn = writes.borrow()[0].0;
		let results = resolver.handle_event(ResolveEvent::Closed(conn));

		assert_eq!(results.len(), 2);
		assert!(results.iter().all(|(_, o)| matches!(o, Outcome::Failed(Rcode::ServFail))));
	}
}
