//! Binary entrypoint: parses the CLI, and either starts the daemon (`run`/
//! `run-host`) or sends one command to an already-running daemon's command
//! socket and prints the response — the same two-mode split
//! `ziti-edge-tunnel`'s own CLI follows.
mod cli;
mod client;
mod config;
mod daemon;
mod platform;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use serde_json::json;

use cli::{Cli, Command};
use config::Config;

fn main() -> ExitCode {
	let cli = Cli::parse();

	match cli.command {
		Command::Run(args) => run_daemon(Config::from_args(args), true),
		Command::RunHost(args) => run_daemon(Config::from_args(args), false),
		Command::Version => {
			println!("ziti-edge-tunnel {}", env!("CARGO_PKG_VERSION"));
			ExitCode::SUCCESS
		}
		other => send_command(other),
	}
}

fn run_daemon(config: Config, claim_tun: bool) -> ExitCode {
	runtime::logger::init(config.log_level);

	let (cmd_path, event_path, peers) = control::plane::resolve_paths(&config.base_dir, config.ipc_discriminator.clone());

	if let Err(err) = control::plane::reject_conflicting_peer(&peers, &config.base_dir) {
		log::error!("{err}");
		return ExitCode::FAILURE;
	}

	match daemon::run(&config, &cmd_path, &event_path, claim_tun) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			log::error!("Startup failed: {err}");
			ExitCode::FAILURE
		}
	}
}

/// Every non-`run` subcommand: translate CLI args into one JSON command,
/// send it to the running daemon, and print the response.
fn send_command(command: Command) -> ExitCode {
	let request = match to_request(command) {
		Ok(request) => request,
		Err(err) => {
			eprintln!("{err}");
			return ExitCode::FAILURE;
		}
	};

	let (cmd_path, _, _) = control::plane::resolve_paths(control::plane::DEFAULT_BASE_DIR, None);
	match client::send(Path::new(&cmd_path), request) {
		Ok(response) => {
			println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
			if response.get("Success").and_then(serde_json::Value::as_bool).unwrap_or(false) {
				ExitCode::SUCCESS
			} else {
				ExitCode::FAILURE
			}
		}
		Err(err) => {
			eprintln!("{err}");
			ExitCode::FAILURE
		}
	}
}

fn to_request(command: Command) -> Result<serde_json::Value, String> {
	let (name, data) = match command {
		Command::Enroll(a) => ("Enroll", json!({"url": "", "name": a.name, "jwt": a.jwt, "key": a.key, "cert": a.cert, "useKeychain": a.use_keychain})),
		Command::Add(a) => ("AddIdentity", json!({"IdentityFilename": a.identity_filename, "JwtContent": a.jwt_content, "UseKeychain": a.use_keychain})),
		Command::Delete(a) => ("RemoveIdentity", json!({"Identifier": a.identifier})),
		Command::Enable(a) => ("IdentityOnOff", json!({"Identifier": a.identifier, "OnOff": true})),
		Command::OnOffIdentity(a) => ("IdentityOnOff", json!({"Identifier": a.identifier, "OnOff": a.on})),
		Command::Dump(a) => ("ZitiDump", json!({"Identifier": a.identifier, "DumpPath": a.dump_path})),
		Command::IpDump(a) => ("IpDump", json!({"Identifier": a.identifier, "DumpPath": a.dump_path})),
		Command::EnableMfa(a) => ("EnableMFA", json!({"Identifier": a.identifier})),
		Command::VerifyMfa(a) => ("VerifyMFA", json!({"Identifier": a.identifier, "Code": a.code})),
		Command::RemoveMfa(a) => ("RemoveMFA", json!({"Identifier": a.identifier})),
		Command::SubmitMfa(a) => ("SubmitMFA", json!({"Identifier": a.identifier, "Code": a.code})),
		Command::GenerateMfaCodes(a) => ("GenerateMFACodes", json!({"Identifier": a.identifier, "Code": a.code})),
		Command::GetMfaCodes(a) => ("GetMFACodes", json!({"Identifier": a.identifier, "Code": a.code})),
		Command::TunnelStatus => ("Status", serde_json::Value::Null),
		Command::SetLogLevel(a) => ("SetLogLevel", json!({"Level": a.level})),
		Command::UpdateTunIp(a) => ("UpdateTunIpv4", json!({"TunIPv4": a.tun_ipv4, "TunPrefixLength": a.tun_prefix_length, "AddDns": a.add_dns})),
		Command::EndpointStsChange(a) => ("StatusChange", json!({"Woke": a.woke, "Unlocked": a.unlocked})),
		Command::ExtJwtLogin(a) => ("ExternalAuth", json!({"Identifier": a.identifier, "Provider": a.provider})),
		Command::ServiceControl(a) => ("ServiceControl", json!({"Operation": a.identifier})),
		Command::Run(_) | Command::RunHost(_) | Command::Version => return Err("not a remote command".into()),
	};

	Ok(match data {
		serde_json::Value::Null => json!({"Command": name}),
		data => json!({"Command": name, "Data": data}),
	})
}
