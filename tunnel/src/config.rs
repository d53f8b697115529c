//! Assembles a `Config` from CLI flags plus environment, the way
//! `RunArgs` alone can't: an explicit `-x` always wins, but a bare `run`
//! still needs to fall back to `HTTP_PROXY`/`http_proxy`.
use std::env;

use crate::cli::RunArgs;

pub struct Config {
	pub identity: Option<String>,
	pub identity_dir: Option<String>,
	pub log_level: log::LevelFilter,
	pub refresh_seconds: u64,
	pub cidr: String,
	pub upstreams: Vec<String>,
	pub proxy: Option<String>,
	pub ipc_discriminator: Option<String>,
	pub base_dir: String,
}

impl Config {
	pub fn from_args(args: RunArgs) -> Self {
		let proxy = args.proxy.or_else(|| env::var("HTTP_PROXY").or_else(|_| env::var("http_proxy")).ok());
		let log_level = args.verbosity.as_deref().map(parse_level).unwrap_or(log::LevelFilter::Info);

		Self {
			identity: args.identity,
			identity_dir: args.identity_dir,
			log_level,
			refresh_seconds: args.refresh_seconds.unwrap_or(60),
			cidr: args.cidr,
			upstreams: args.upstream,
			proxy,
			ipc_discriminator: args.ipc_discriminator,
			base_dir: args.base_dir,
		}
	}
}

fn parse_level(raw: &str) -> log::LevelFilter {
	match raw.to_ascii_lowercase().as_str() {
		"trace" => log::LevelFilter::Trace,
		"debug" => log::LevelFilter::Debug,
		"warn" => log::LevelFilter::Warn,
		"error" => log::LevelFilter::Error,
		"off" => log::LevelFilter::Off,
		_ => log::LevelFilter::Info,
	}
}
