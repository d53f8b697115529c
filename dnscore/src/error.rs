use bilge::prelude::*;

/// RCODE values a response can carry, shared between the wire codec and the
/// engine's routing decisions.
#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Rcode {
	NoError = 0,
	FormErr = 1,
	ServFail = 2,
	NxDomain = 3,
	NotImp = 4,
	Refused = 5,
	#[fallback]
	Reserved,
}

/// Error outcomes for the DNS core. Each variant maps onto an RCODE the
/// engine can hand back to the client; a few (`PoolExhausted`,
/// `UpstreamUnreachable`) don't correspond to a single RCODE on their own and
/// are translated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
	MalformedQuery,
	BadCidr,
	PoolExhausted,
	UpstreamUnreachable,
	ProxyConnectFailed,
	ProxyWriteFailed,
}

impl Rcode {
	/// Maps a raw RCODE byte (as carried in the proxy resolver's JSON wire
	/// format) onto this enum, folding anything outside 0-5 into `Reserved`.
	pub fn from_u8(v: u8) -> Rcode {
		match v {
			0 => Rcode::NoError,
			1 => Rcode::FormErr,
			2 => Rcode::ServFail,
			3 => Rcode::NxDomain,
			4 => Rcode::NotImp,
			5 => Rcode::Refused,
			_ => Rcode::Reserved,
		}
	}
}

impl DnsError {
	/// The RCODE to answer a client with when this error terminates a
	/// request locally (as opposed to just closing the client, which
	/// `MalformedQuery` does instead — see C6 step 2).
	pub fn rcode(self) -> Rcode {
		match self {
			DnsError::MalformedQuery => Rcode::FormErr,
			DnsError::BadCidr => Rcode::ServFail,
			DnsError::PoolExhausted => Rcode::ServFail,
			DnsError::UpstreamUnreachable => Rcode::Refused,
			DnsError::ProxyConnectFailed => Rcode::ServFail,
			DnsError::ProxyWriteFailed => Rcode::ServFail,
		}
	}
}

pub type Result<T> = core::result::Result<T, DnsError>;
