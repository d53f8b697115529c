//! The command/event wire format: `{"Command":"<name>","Data":<object>}`
//! requests, `{"Success":bool,"Error":string,"Code":int,"Data":<object>}`
//! responses, and the events broadcast on the event socket.
//!
//! The PascalCase tagging and field names are taken directly from
//! `programs/ziti-edge-tunnel/ziti-edge-tunnel.c`'s command dispatch, kept
//! byte-compatible since existing `ziti-edge-tunnel` clients send this shape
//! over the wire.
use core::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `UpdateTunIpv4`'s minimum/maximum prefix length, outside of which the
/// tun address range is rejected rather than applied.
const MIN_TUN_PREFIX: u8 = 10;
const MAX_TUN_PREFIX: u8 = 18;

#[derive(Debug, Clone, Deserialize)]
pub struct LoadIdentityData {
	#[serde(rename = "Identifier")]
	pub identifier: String,
	#[serde(rename = "Path")]
	pub path: String,
	#[serde(default, rename = "Disabled")]
	pub disabled: bool,
	#[serde(default, rename = "ApiPageSize")]
	pub api_page_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentifierData {
	#[serde(rename = "Identifier")]
	pub identifier: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityOnOffData {
	#[serde(rename = "Identifier")]
	pub identifier: String,
	#[serde(rename = "OnOff")]
	pub on_off: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollData {
	pub url: String,
	pub name: String,
	pub jwt: String,
	#[serde(default)]
	pub key: Option<String>,
	#[serde(default)]
	pub cert: Option<String>,
	#[serde(default, rename = "useKeychain")]
	pub use_keychain: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddIdentityData {
	#[serde(rename = "IdentityFilename")]
	pub identity_filename: String,
	#[serde(rename = "JwtContent")]
	pub jwt_content: String,
	#[serde(default, rename = "UseKeychain")]
	pub use_keychain: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaCodeData {
	#[serde(rename = "Identifier")]
	pub identifier: String,
	#[serde(default, rename = "Code")]
	pub code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DumpData {
	#[serde(default, rename = "Identifier")]
	pub identifier: Option<String>,
	#[serde(default, rename = "DumpPath")]
	pub dump_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogLevelData {
	#[serde(rename = "Level")]
	pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunIpv4Data {
	#[serde(rename = "TunIPv4")]
	pub tun_ipv4: String,
	#[serde(rename = "TunPrefixLength")]
	pub tun_prefix_length: u8,
	#[serde(default, rename = "AddDns")]
	pub add_dns: bool,
}

impl TunIpv4Data {
	/// Rejects prefixes outside `[10, 18]` and malformed dotted-quad
	/// addresses, returning the parsed address on success.
	pub fn validate(&self) -> Result<Ipv4Addr, String> {
		if !(MIN_TUN_PREFIX..=MAX_TUN_PREFIX).contains(&self.tun_prefix_length) {
			return Err(format!("tun prefix length {} outside [{MIN_TUN_PREFIX}, {MAX_TUN_PREFIX}]", self.tun_prefix_length));
		}

		self.tun_ipv4.parse::<Ipv4Addr>().map_err(|_| format!("malformed tun address {:?}", self.tun_ipv4))
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamData {
	pub host: String,
	#[serde(default)]
	pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceControlData {
	#[serde(rename = "Operation")]
	pub operation: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusChangeData {
	#[serde(default, rename = "Woke")]
	pub woke: bool,
	#[serde(default, rename = "Unlocked")]
	pub unlocked: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalAuthData {
	#[serde(rename = "Identifier")]
	pub identifier: String,
	#[serde(rename = "Provider")]
	pub provider: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenAuthData {
	#[serde(rename = "Identifier")]
	pub identifier: String,
	#[serde(rename = "AccessToken")]
	pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Command", content = "Data")]
pub enum Command {
	LoadIdentity(LoadIdentityData),
	RemoveIdentity(IdentifierData),
	IdentityOnOff(IdentityOnOffData),
	RefreshIdentity(IdentifierData),
	ListIdentities,
	Enroll(EnrollData),
	AddIdentity(AddIdentityData),
	EnableMFA(IdentifierData),
	SubmitMFA(MfaCodeData),
	VerifyMFA(MfaCodeData),
	RemoveMFA(IdentifierData),
	GenerateMFACodes(MfaCodeData),
	GetMFACodes(MfaCodeData),
	ZitiDump(DumpData),
	IpDump(DumpData),
	SetLogLevel(LogLevelData),
	UpdateTunIpv4(TunIpv4Data),
	SetUpstreamDNS(Vec<UpstreamData>),
	Status,
	ServiceControl(ServiceControlData),
	StatusChange(StatusChangeData),
	ExternalAuth(ExternalAuthData),
	AccessTokenAuth(AccessTokenAuthData),
}

/// Recognized but not-yet-rejected; parse errors surface as
/// `DnsError`-style command rejection rather than a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
	Malformed,
	Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
	#[serde(rename = "Success")]
	pub success: bool,
	#[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(rename = "Code")]
	pub code: i32,
	#[serde(rename = "Data", skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

impl Response {
	pub fn ok(data: impl Serialize) -> Self {
		Self { success: true, error: None, code: 0, data: serde_json::to_value(data).ok() }
	}

	pub fn ok_empty() -> Self {
		Self { success: true, error: None, code: 0, data: None }
	}

	pub fn rejected(message: impl Into<String>) -> Self {
		Self { success: false, error: Some(message.into()), code: 1, data: None }
	}

	pub fn malformed() -> Self {
		Self::rejected("failed to parse command")
	}
}

/// Parses one newline-framed command line. A JSON syntax error is reported
/// as `CommandMalformed`; the caller decides whether the connection itself
/// stays open (it does, unless the line was empty/unterminated garbage).
pub fn parse_command(line: &[u8]) -> Result<Command, CommandError> {
	serde_json::from_slice(line).map_err(|_| CommandError::Malformed)
}

/// Events broadcast on the event socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "Op")]
pub enum Event {
	#[serde(rename = "identity")]
	Identity { action: &'static str, identifier: String },
	#[serde(rename = "controller")]
	Controller { identifier: String, connected: bool },
	#[serde(rename = "bulkservice")]
	ServiceBulkUpdate { identifier: String, added: Vec<String>, removed: Vec<String> },
	#[serde(rename = "mfa")]
	MfaRequired { identifier: String },
	#[serde(rename = "mfa_status")]
	MfaStatus { identifier: String, ok: bool },
	#[serde(rename = "extjwt")]
	ExternalJwtRequest { identifier: String, provider: String },
	#[serde(rename = "tunnel_status_event")]
	StatusSnapshot { data: Value },
	#[serde(rename = "tunnel_metrics_event")]
	Metrics { rates: Vec<IdentityRate> },
	#[serde(rename = "notification_event")]
	Notification { identifiers: Vec<String>, severity: &'static str },
	#[serde(rename = "shutdown")]
	Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityRate {
	pub identifier: String,
	pub up: String,
	pub down: String,
}
