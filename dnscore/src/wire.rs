//! RFC 1035 message parsing and serialization (C1).
//!
//! Builds on the hand-rolled single-question, single-answer stub resolver
//! query/response pair in `net/src/dns/mod.rs`, generalized into the full
//! parse/assemble pair the engine needs: multiple answer types, pointer
//! compression, and truncation.
use core::net::Ipv4Addr;

use bilge::prelude::*;
use collections::bytes::Cursor;
use utils::endian::{u16be, u32be, Wire as _};
use utils::Wire;

use crate::error::{DnsError, Rcode, Result};

pub const TY_A: u16 = 1;
pub const TY_AAAA: u16 = 28;
pub const TY_MX: u16 = 15;
pub const TY_TXT: u16 = 16;
pub const TY_SRV: u16 = 33;
pub const TY_OPT: u16 = 41;

pub const CLASS_IN: u16 = 1;

/// UDP payload size 4096, extended RCODE 0, version 0, empty RDATA.
pub const OPT: [u8; 11] = [0x00, 0x00, 0x29, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Responses are assembled into a buffer this large; once the next record
/// would overflow it the engine truncates (see `assemble`).
pub const RESPONSE_BUDGET: usize = 4096;

/// Offset of the question name in every message this codec writes; answer
/// records reuse it via a compression pointer instead of repeating the name.
const QUESTION_NAME_OFFSET: u16 = 0x000C;

/// Indirections allowed while following compression pointers before a
/// message is rejected as a loop.
const MAX_INDIRECTIONS: u32 = 16;

#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
	Query = 0,
	IQuery = 1,
	Status = 2,
	#[fallback]
	Reserved,
}

#[bitsize(16)]
#[derive(FromBits, Clone, Copy)]
pub struct Flags {
	rcode: Rcode,
	z: u3,
	ra: bool,
	rd: bool,
	tc: bool,
	aa: bool,
	opcode: Opcode,
	qr: bool,
}

impl utils::endian::Wire for Flags {
	const SIZE: usize = 2;

	fn write(&self, out: &mut [u8]) {
		let bits: u16 = (*self).into();
		out[..2].copy_from_slice(&bits.to_be_bytes());
	}

	fn read(bytes: &[u8]) -> Self {
		Flags::from(u16::from_be_bytes([bytes[0], bytes[1]]))
	}
}

#[derive(Wire)]
struct Header {
	id: u16be,
	flags: Flags,
	qdcount: u16be,
	ancount: u16be,
	nscount: u16be,
	arcount: u16be,
}

/// The parsed question section of an incoming query, plus the header bits
/// the engine needs to route and answer it.
#[derive(Debug, Clone)]
pub struct Query {
	pub id: u16,
	pub rd: bool,
	pub name: String,
	pub qtype: u16,
	pub qclass: u16,
}

/// A single answer record the engine wants assembled into a response.
pub struct Answer {
	pub ttl: u32,
	pub data: AnswerData,
}

pub enum AnswerData {
	A(Ipv4Addr),
	Mx { preference: u16, exchange: String },
	Srv { priority: u16, weight: u16, port: u16, target: String },
	Txt(String),
}

impl AnswerData {
	fn rtype(&self) -> u16 {
		match self {
			AnswerData::A(_) => TY_A,
			AnswerData::Mx { .. } => TY_MX,
			AnswerData::Srv { .. } => TY_SRV,
			AnswerData::Txt(_) => TY_TXT,
		}
	}

	fn encode(&self, cur: &mut Cursor) {
		match self {
			AnswerData::A(addr) => {
				cur.push(addr);
			}
			AnswerData::Mx { preference, exchange } => {
				cur.push(&u16be::from(*preference));
				encode_name_fresh(cur, exchange);
			}
			AnswerData::Srv { priority, weight, port, target } => {
				cur.push(&u16be::from(*priority));
				cur.push(&u16be::from(*weight));
				cur.push(&u16be::from(*port));
				encode_name_fresh(cur, target);
			}
			AnswerData::Txt(text) => {
				let bytes = text.as_bytes();
				let len: u8 = bytes.len().min(255) as u8;
				cur.push(&len);
				cur.push_bytes(&bytes[..len as usize]);
			}
		}
	}
}

/// Writes a length-prefixed, root-terminated name with no compression; used
/// for fresh names that don't already appear elsewhere in the message (MX
/// exchange, SRV target, and the question name itself). Labels longer than
/// 63 bytes are clamped rather than rejected: by the time a name reaches
/// here it has either come through `parse_query` (already validated) or
/// from a proxied answer the engine doesn't otherwise trust, and a clamp is
/// simpler than threading a result through `Answer` assembly.
fn encode_name_fresh(cur: &mut Cursor, name: &str) {
	for label in name.split('.') {
		if label.is_empty() {
			continue;
		}

		let bytes = &label.as_bytes()[..label.len().min(63)];
		cur.push(&(bytes.len() as u8));
		cur.push_bytes(bytes);
	}

	cur.push(&0u8);
}

/// Decodes a (possibly compressed) name starting at `pos` within `buf`,
/// returning the dotted name and the offset just past its last non-pointer
/// byte in the original stream.
fn decode_name(buf: &[u8], mut pos: usize) -> Result<(String, usize)> {
	let mut labels: Vec<String> = Vec::new();
	let mut end_pos = None;
	let mut indirections = 0u32;

	loop {
		let Some(&len) = buf.get(pos) else {
			return Err(DnsError::MalformedQuery);
		};

		match len & 0xC0 {
			0x00 => {
				if len == 0 {
					pos += 1;
					if end_pos.is_none() {
						end_pos = Some(pos);
					}
					break;
				}

				let len = len as usize;
				if len > 63 {
					return Err(DnsError::MalformedQuery);
				}

				pos += 1;
				let Some(label) = buf.get(pos..pos + len) else {
					return Err(DnsError::MalformedQuery);
				};
				labels.push(String::from_utf8_lossy(label).into_owned());
				pos += len;
			}
			0xC0 => {
				let Some(&lo) = buf.get(pos + 1) else {
					return Err(DnsError::MalformedQuery);
				};

				let ptr = (((len & 0x3F) as usize) << 8) | lo as usize;

				if end_pos.is_none() {
					end_pos = Some(pos + 2);
				}

				indirections += 1;
				if indirections > MAX_INDIRECTIONS || ptr >= pos {
					return Err(DnsError::MalformedQuery);
				}

				pos = ptr;
			}
			_ => return Err(DnsError::MalformedQuery),
		}

		let total: usize = labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1;
		if total > 255 {
			return Err(DnsError::MalformedQuery);
		}
	}

	Ok((labels.join("."), end_pos.expect("root label always sets end_pos")))
}

/// Parses a single-question query. Fails with `MalformedQuery` if the
/// header is short, QDCOUNT != 1, or the name/labels are malformed.
pub fn parse_query(bytes: &[u8]) -> Result<Query> {
	if bytes.len() < Header::SIZE {
		return Err(DnsError::MalformedQuery);
	}

	let header = Header::read(&bytes[..Header::SIZE]);

	if header.qdcount.get() != 1 {
		return Err(DnsError::MalformedQuery);
	}

	let (name, pos) = decode_name(bytes, Header::SIZE)?;

	let Some(rest) = bytes.get(pos..pos + 4) else {
		return Err(DnsError::MalformedQuery);
	};

	let qtype = u16::from_be_bytes([rest[0], rest[1]]);
	let qclass = u16::from_be_bytes([rest[2], rest[3]]);

	Ok(Query { id: header.id.get(), rd: header.flags.rd(), name, qtype, qclass })
}

/// Assembles a response to `query`. `recursion_available` sets RA; answers
/// are appended until the next one would exceed `RESPONSE_BUDGET`, at which
/// point TC is set and assembly stops (OPT is still appended if it fits).
pub fn assemble(query: &Query, rcode: Rcode, answers: &[Answer], recursion_available: bool) -> Vec<u8> {
	let mut body = Cursor::new();
	// Fresh encoding of the question name: this is the canonical copy every
	// answer's compression pointer refers back to.
	encode_name_fresh(&mut body, &query.name);
	body.push(&u16be::from(query.qtype));
	body.push(&u16be::from(query.qclass));

	let mut ancount: u16 = 0;
	let mut truncated = false;

	for answer in answers {
		let mut rec = Cursor::new();
		rec.push_bytes(&[0xC0, (QUESTION_NAME_OFFSET & 0xFF) as u8]);
		rec.push(&u16be::from(answer.data.rtype()));
		rec.push(&u16be::from(CLASS_IN));
		rec.push(&u32be::from(answer.ttl));

		let rdlen_at = rec.pivot();
		rec.push(&u16be::from(0u16));
		let rdata_at = rec.pivot();
		answer.data.encode(&mut rec);
		let rdlen = (rec.pivot() - rdata_at) as u16;
		rec.patch(rdlen_at, &u16be::from(rdlen));

		if Header::SIZE + body.pivot() + rec.pivot() > RESPONSE_BUDGET {
			truncated = true;
			break;
		}

		body.push_bytes(rec.as_slice());
		ancount += 1;
	}

	let opt_fits = Header::SIZE + body.pivot() + OPT.len() <= RESPONSE_BUDGET;

	let flags = Flags::new(rcode, u3::new(0), recursion_available, query.rd, truncated, false, Opcode::Query, true);

	let header = Header {
		id: u16be::from(query.id),
		flags,
		qdcount: u16be::from(1),
		ancount: u16be::from(ancount),
		nscount: u16be::from(0),
		arcount: u16be::from(u16::from(opt_fits)),
	};

	let mut out = Cursor::with_capacity(Header::SIZE + body.pivot() + OPT.len());
	out.push(&header);
	out.push_bytes(body.as_slice());
	if opt_fits {
		out.push_bytes(&OPT);
	}
	out.into_vec()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn encode_query(id: u16, rd: bool, name: &str, qtype: u16) -> Vec<u8> {
		let header = Header {
			id: u16be::from(id),
			flags: Flags::new(Rcode::NoError, u3::new(0), false, rd, false, false, Opcode::Query, false),
			qdcount: u16be::from(1),
			ancount: u16be::from(0),
			nscount: u16be::from(0),
			arcount: u16be::from(0),
		};

		let mut cur = Cursor::new();
		cur.push(&header);
		encode_name_fresh(&mut cur, name);
		cur.push(&u16be::from(qtype));
		cur.push(&u16be::from(CLASS_IN));
		cur.into_vec()
	}

	#[test]
	fn parses_a_simple_query() {
		let bytes = encode_query(0xBEEF, true, "foo.example.com", TY_A);
		let q = parse_query(&bytes).unwrap();

		assert_eq!(q.id, 0xBEEF);
		assert!(q.rd);
		assert_eq!(q.name, "foo.example.com");
		assert_eq!(q.qtype, TY_A);
		assert_eq!(q.qclass, CLASS_IN);
	}

	#[test]
	fn rejects_short_header() {
		assert_eq!(parse_query(&[0u8; 4]), Err(DnsError::MalformedQuery));
	}

	#[test]
	fn rejects_multi_question_messages() {
		let mut bytes = encode_query(1, true, "a.com", TY_A);
		// Bump QDCOUNT to 2 without actually adding a second question.
		bytes[4] = 0;
		bytes[5] = 2;
		assert_eq!(parse_query(&bytes), Err(DnsError::MalformedQuery));
	}

	#[test]
	fn rejects_pointer_loops() {
		// A name whose only label is a pointer to itself.
		let mut bytes = vec![0u8; Header::SIZE];
		let offset = bytes.len();
		bytes.extend_from_slice(&[0xC0, offset as u8]);
		bytes.extend_from_slice(&u16::from(TY_A).to_be_bytes());
		bytes.extend_from_slice(&u16::from(CLASS_IN).to_be_bytes());

		let header = Header {
			id: u16be::from(1),
			flags: Flags::new(Rcode::NoError, u3::new(0), false, true, false, false, Opcode::Query, false),
			qdcount: u16be::from(1),
			ancount: u16be::from(0),
			nscount: u16be::from(0),
			arcount: u16be::from(0),
		};
		header.write(&mut bytes[..Header::SIZE]);

		assert_eq!(parse_query(&bytes), Err(DnsError::MalformedQuery));
	}

	#[test]
	fn round_trips_an_a_answer() {
		let query = Query { id: 42, rd: true, name: "host.example.com".into(), qtype: TY_A, qclass: CLASS_IN };
		let answers = [Answer { ttl: 60, data: AnswerData::A(Ipv4Addr::new(100, 64, 0, 5)) }];
		let bytes = assemble(&query, Rcode::NoError, &answers, true);

		let reparsed = parse_query(&bytes).unwrap();
		assert_eq!(reparsed.id, query.id);
		assert_eq!(reparsed.name, query.name);
		assert_eq!(reparsed.qtype, TY_A);

		let header = Header::read(&bytes[..Header::SIZE]);
		assert_eq!(header.ancount.get(), 1);
		assert_eq!(header.arcount.get(), 1);
		assert!(!header.flags.tc());
		assert!(header.flags.qr());
	}

	#[test]
	fn truncates_when_the_budget_is_exceeded() {
		let query = Query { id: 1, rd: true, name: "x.example.com".into(), qtype: TY_TXT, qclass: CLASS_IN };
		// Each TXT record with a 200-byte string costs well over 200 bytes;
		// pushing 64 of them overflows the 4096-byte budget.
		let answers: Vec<Answer> = (0..64).map(|_| Answer { ttl: 60, data: AnswerData::Txt("x".repeat(200)) }).collect();
		let bytes = assemble(&query, Rcode::NoError, &answers, false);

		let header = Header::read(&bytes[..Header::SIZE]);
		assert!(header.flags.tc());
		assert!((header.ancount.get() as usize) < answers.len());
		assert!(bytes.len() <= RESPONSE_BUDGET);
	}
}
