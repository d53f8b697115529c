//! Command-line surface: `clap`'s derive API, the same style `runner`'s
//! `Cli`/`Operations` pair uses — a thin `Cli` wrapping a `Subcommand` enum,
//! with argument structs doing the real parsing work.
use clap::{Args, Parser, Subcommand};

pub const DEFAULT_CIDR: &str = "100.64.0.1/10";

#[derive(Parser, Debug)]
#[command(name = "ziti-edge-tunnel", version)]
pub struct Cli {
	#[command(subcommand)]
	pub command: Command,
}

/// Flags shared by `run`/`run-host`: everything needed to start the daemon.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
	/// Identity file to load at startup.
	#[arg(short = 'i', long = "identity")]
	pub identity: Option<String>,
	/// Directory of identity files to load at startup.
	#[arg(short = 'I', long = "identity-dir")]
	pub identity_dir: Option<String>,
	/// Log verbosity (trace/debug/info/warn/error).
	#[arg(short = 'v', long = "verbose")]
	pub verbosity: Option<String>,
	/// Controller refresh interval, in seconds.
	#[arg(short = 'r', long = "refresh")]
	pub refresh_seconds: Option<u64>,
	/// Synthetic-address CIDR pool.
	#[arg(short = 'd', long = "dns-ip-range", default_value = DEFAULT_CIDR)]
	pub cidr: String,
	/// Upstream DNS resolver(s); repeatable.
	#[arg(short = 'u', long = "upstream")]
	pub upstream: Vec<String>,
	/// Outbound proxy URL; falls back to `HTTP_PROXY`/`http_proxy` if absent.
	#[arg(short = 'x', long = "proxy")]
	pub proxy: Option<String>,
	/// IPC socket discriminator, for running more than one instance.
	#[arg(short = 'P', long = "ipc-discriminator")]
	pub ipc_discriminator: Option<String>,
	/// Base directory for the command/event sockets.
	#[arg(long = "ipc-dir", default_value = control::plane::DEFAULT_BASE_DIR)]
	pub base_dir: String,
}

#[derive(Args, Debug, Clone)]
pub struct IdentifierArgs {
	#[arg(short = 'i', long = "identifier")]
	pub identifier: String,
}

#[derive(Args, Debug, Clone)]
pub struct EnrollArgs {
	#[arg(short = 'j', long = "jwt")]
	pub jwt: String,
	#[arg(short = 'i', long = "identity")]
	pub identity_file: String,
	#[arg(short = 'n', long = "identity-name", default_value = "")]
	pub name: String,
	#[arg(short = 'k', long = "key")]
	pub key: Option<String>,
	#[arg(short = 'c', long = "cert")]
	pub cert: Option<String>,
	#[arg(long = "use-keychain")]
	pub use_keychain: bool,
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
	#[arg(short = 'i', long = "identity")]
	pub identity_filename: String,
	#[arg(short = 'j', long = "jwt-content")]
	pub jwt_content: String,
	#[arg(long = "use-keychain")]
	pub use_keychain: bool,
}

#[derive(Args, Debug, Clone)]
pub struct OnOffArgs {
	#[arg(short = 'i', long = "identifier")]
	pub identifier: String,
	#[arg(short = 'o', long = "onOff")]
	pub on: bool,
}

#[derive(Args, Debug, Clone)]
pub struct MfaCodeArgs {
	#[arg(short = 'i', long = "identifier")]
	pub identifier: String,
	#[arg(short = 'c', long = "code")]
	pub code: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DumpArgs {
	#[arg(short = 'i', long = "identifier")]
	pub identifier: Option<String>,
	#[arg(short = 'p', long = "path")]
	pub dump_path: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct LogLevelArgs {
	#[arg(short = 'l', long = "level")]
	pub level: String,
}

#[derive(Args, Debug, Clone)]
pub struct TunIpArgs {
	#[arg(short = 't', long = "tunIP")]
	pub tun_ipv4: String,
	#[arg(short = 'p', long = "prefixLength")]
	pub tun_prefix_length: u8,
	#[arg(long = "addDns")]
	pub add_dns: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusChangeArgs {
	#[arg(long = "woke")]
	pub woke: bool,
	#[arg(long = "unlocked")]
	pub unlocked: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ExtJwtArgs {
	#[arg(short = 'i', long = "identifier")]
	pub identifier: String,
	#[arg(short = 'p', long = "provider")]
	pub provider: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
	/// Enrolls a new identity from a one-time JWT.
	Enroll(EnrollArgs),
	/// Starts the daemon: TUN-facing DNS intercept plus the control plane.
	Run(RunArgs),
	/// Starts the daemon without claiming the TUN device (host-only mode).
	RunHost(RunArgs),
	/// Loads an already-enrolled identity file.
	Add(AddArgs),
	/// Unloads an identity and releases its intercepts.
	Delete(IdentifierArgs),
	/// Enables or disables an identity's traffic in one step.
	Enable(IdentifierArgs),
	OnOffIdentity(OnOffArgs),
	Dump(DumpArgs),
	IpDump(DumpArgs),
	EnableMfa(IdentifierArgs),
	VerifyMfa(MfaCodeArgs),
	RemoveMfa(IdentifierArgs),
	SubmitMfa(MfaCodeArgs),
	GenerateMfaCodes(MfaCodeArgs),
	GetMfaCodes(MfaCodeArgs),
	TunnelStatus,
	SetLogLevel(LogLevelArgs),
	UpdateTunIp(TunIpArgs),
	EndpointStsChange(StatusChangeArgs),
	#[command(name = "ext-jwt-login")]
	ExtJwtLogin(ExtJwtArgs),
	ServiceControl(IdentifierArgs),
	Version,
}
