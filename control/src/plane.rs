//! The control plane: local command/event sockets.
//!
//! The socket plumbing builds on `runtime`'s own `Listener`/`Io`, which
//! carries a `closable` mode specifically to support this module's
//! short-lived client connections. Every callback here is a plain
//! `Fwd::new` closure capturing `Rc<RefCell<_>>` state rather than routing
//! through `stakker` actor dispatch, the same pattern used for
//! `Fwd<ResolveEvent>` elsewhere in this workspace — accepted connections
//! are modeled as shared state rather than as dynamically spawned actors.
//!
//! Path selection and the startup peer check follow `ziti-edge-tunnel.c`'s
//! `configure_ipc`/`find_other_zets`/`same_dir`: scan the socket directory
//! for a matching basename prefix, fall back to a PID-derived discriminator
//! when peers are found, and query each peer's `Status` response for a
//! conflicting config directory before binding.
use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use log::error;
use runtime::{FrameMode, Io, Listener};
use serde_json::Value;
use stakker::Fwd;

use crate::commands::{parse_command, Event, Response};

pub const DEFAULT_BASE_DIR: &str = "/tmp/.ziti";
pub const CMD_BASENAME: &str = "ziti-edge-tunnel.sock";
pub const EVENT_BASENAME: &str = "ziti-edge-tunnel-event.sock";

/// Decides the command/event socket paths. Scans `base_dir` for existing
/// sockets sharing `CMD_BASENAME`'s prefix; if any are found and no
/// discriminator was given explicitly, one is generated from the current
/// process id (mirroring `configure_ipc`'s `automatic_ipc_discriminator`).
pub fn resolve_paths(base_dir: &str, discriminator: Option<String>) -> (PathBuf, PathBuf, Vec<PathBuf>) {
	let peers = scan_peers(base_dir, CMD_BASENAME);
	let discriminator = discriminator.or_else(|| (!peers.is_empty()).then(|| std::process::id().to_string()));

	let suffix = discriminator.map(|d| format!(".{d}")).unwrap_or_default();
	let cmd_path = Path::new(base_dir).join(format!("{CMD_BASENAME}{suffix}"));
	let event_path = Path::new(base_dir).join(format!("{EVENT_BASENAME}{suffix}"));

	(cmd_path, event_path, peers)
}

fn scan_peers(base_dir: &str, basename_prefix: &str) -> Vec<PathBuf> {
	let Ok(entries) = std::fs::read_dir(base_dir) else {
		return Vec::new();
	};

	entries
		.filter_map(|e| e.ok())
		.map(|e| e.path())
		.filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(basename_prefix)))
		.collect()
}

/// Sends a synchronous `Status` command to each peer socket and aborts
/// startup if one reports the same config directory. Run before the event
/// loop starts, so this blocks briefly rather than going through `Io`.
pub fn reject_conflicting_peer(peers: &[PathBuf], config_dir: &str) -> io::Result<()> {
	for peer in peers {
		let Ok(mut stream) = UnixStream::connect(peer) else { continue };
		stream.set_read_timeout(Some(Duration::from_secs(2)))?;

		use std::io::{BufRead, BufReader, Write};
		writeln!(stream, "{}", serde_json::json!({"Command": "Status"}))?;

		let mut reader = BufReader::new(stream);
		let mut line = String::new();
		if reader.read_line(&mut line).is_err() || line.is_empty() {
			continue;
		}

		let Ok(response): Result<Value, _> = serde_json::from_str(&line) else { continue };
		let Some(their_dir) = response.get("Data").and_then(|d| d.get("ConfigDir")).and_then(Value::as_str) else { continue };

		if their_dir == config_dir {
			error!("Another running ziti-edge-tunnel is configured to use the same config dir: {}", peer.display());
			return Err(io::Error::new(io::ErrorKind::AddrInUse, "config dir already in use by another instance"));
		}
	}

	Ok(())
}

/// Application logic the control plane dispatches commands into. Kept
/// trait-object-shaped so `ControlPlane` can be unit tested with a fake,
/// the same way `dnscore`'s `FlowIo`/`Overlay` are.
pub trait Dispatcher {
	fn dispatch(&mut self, cmd: crate::commands::Command) -> Response;
}

type CmdSlot = Rc<RefCell<Option<Io<UnixStream>>>>;

/// Owns the command/event listeners and every connection accepted on them.
/// Not an actor itself: every accept/read callback is a plain closure over
/// shared state, so construction needs no `CX![]` and the whole thing can
/// be driven directly in tests.
pub struct ControlPlane<D> {
	dispatcher: Rc<RefCell<D>>,
	cmd_listener: Listener<UnixListener>,
	event_listener: Listener<UnixListener>,
	cmd_conns: Rc<RefCell<Vec<CmdSlot>>>,
	event_conns: Rc<RefCell<Vec<Io<UnixStream>>>>,
}

impl<D: Dispatcher + 'static> ControlPlane<D> {
	pub fn bind(cmd_path: &Path, event_path: &Path, dispatcher: D) -> Option<Self> {
		let _ = std::fs::remove_file(cmd_path);
		let _ = std::fs::remove_file(event_path);

		let cmd_sock = bind_socket(cmd_path)?;
		let event_sock = bind_socket(event_path)?;

		let dispatcher = Rc::new(RefCell::new(dispatcher));
		let cmd_conns: Rc<RefCell<Vec<CmdSlot>>> = Rc::new(RefCell::new(Vec::new()));
		let event_conns: Rc<RefCell<Vec<Io<UnixStream>>>> = Rc::new(RefCell::new(Vec::new()));

		let accept_dispatcher = dispatcher.clone();
		let accept_cmd_conns = cmd_conns.clone();
		let on_cmd_accept = Fwd::new(move |fd: RawFd| {
			accept_cmd_conns.borrow_mut().push(accept_cmd_conn(fd, accept_dispatcher.clone()));
		});

		let accept_event_conns = event_conns.clone();
		let on_event_accept = Fwd::new(move |fd: RawFd| {
			let stream = unsafe { UnixStream::from_raw_fd(fd) };
			let io = Io::new_closable(stream, FrameMode::Lines, Fwd::new(|_: Vec<u8>| {}));
			accept_event_conns.borrow_mut().push(io);
		});

		log::info!("Control plane listening: command={} event={}", cmd_path.display(), event_path.display());

		Some(Self {
			dispatcher,
			cmd_listener: Listener::new(cmd_sock, on_cmd_accept),
			event_listener: Listener::new(event_sock, on_event_accept),
			cmd_conns,
			event_conns,
		})
	}

	/// Drops connections whose peer has already disconnected. Cheap enough
	/// to call from the 5-second metrics tick rather than needing its own
	/// timer.
	pub fn reap(&self) {
		self.cmd_conns.borrow_mut().retain(|slot| slot.borrow().as_ref().is_some_and(Io::is_registered));
		self.event_conns.borrow_mut().retain(Io::is_registered);
	}

	/// Broadcasts one event to every connected event-socket client.
	pub fn broadcast(&self, event: &Event) {
		let Ok(bytes) = serde_json::to_vec(event) else {
			return;
		};
		for io in self.event_conns.borrow().iter() {
			let _ = io.write(&bytes);
		}
	}

	pub fn connected_clients(&self) -> (usize, usize) {
		(self.cmd_conns.borrow().len(), self.event_conns.borrow().len())
	}

	/// A cheap, `D`-independent handle for broadcasting, so a `Dispatcher`
	/// impl can hold one without a circular `ControlPlane<D>` reference to
	/// itself.
	pub fn broadcaster(&self) -> EventBroadcaster {
		EventBroadcaster { event_conns: self.event_conns.clone() }
	}
}

#[derive(Clone)]
pub struct EventBroadcaster {
	event_conns: Rc<RefCell<Vec<Io<UnixStream>>>>,
}

impl EventBroadcaster {
	pub fn broadcast(&self, event: &Event) {
		let Ok(bytes) = serde_json::to_vec(event) else {
			return;
		};
		for io in self.event_conns.borrow().iter() {
			let _ = io.write(&bytes);
		}
	}
}

fn accept_cmd_conn<D: Dispatcher + 'static>(fd: RawFd, dispatcher: Rc<RefCell<D>>) -> CmdSlot {
	let stream = unsafe { UnixStream::from_raw_fd(fd) };
	let slot: CmdSlot = Rc::new(RefCell::new(None));
	let write_back = slot.clone();

	let fwd = Fwd::new(move |line: Vec<u8>| {
		let response = match parse_command(&line) {
			Ok(cmd) => dispatcher.borrow_mut().dispatch(cmd),
			Err(_) => Response::malformed(),
		};
		let Ok(bytes) = serde_json::to_vec(&response) else {
			return;
		};
		if let Some(io) = write_back.borrow().as_ref() {
			let _ = io.write(&bytes);
		}
	});

	*slot.borrow_mut() = Some(Io::new_closable(stream, FrameMode::Lines, fwd));
	slot
}

fn bind_socket(path: &Path) -> Option<UnixListener> {
	match UnixListener::bind(path) {
		Ok(listener) => {
			use std::os::unix::fs::PermissionsExt;
			if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)) {
				error!("Failed to set permissions on {}: {err}", path.display());
			}
			Some(listener)
		}
		Err(err) => {
			error!("Failed to bind control socket {}: {err}", path.display());
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::commands::{Command, IdentifierData};

	#[derive(Clone)]
	struct FakeDispatcher {
		calls: Rc<RefCell<Vec<String>>>,
	}

	impl Dispatcher for FakeDispatcher {
		fn dispatch(&mut self, cmd: Command) -> Response {
			match cmd {
				Command::ListIdentities => {
					self.calls.borrow_mut().push("ListIdentities".into());
					Response::ok_empty()
				}
				Command::RemoveIdentity(IdentifierData { identifier }) => {
					self.calls.borrow_mut().push(format!("RemoveIdentity:{identifier}"));
					Response::ok_empty()
				}
				_ => Response::rejected("unsupported in test"),
			}
		}
	}

	#[test]
	fn dispatches_a_parsed_command() {
		let mut dispatcher = FakeDispatcher { calls: Default::default() };
		let calls = dispatcher.calls.clone();

		let cmd = parse_command(br#"{"Command":"RemoveIdentity","Data":{"Identifier":"id1"}}"#).unwrap();
		let response = dispatcher.dispatch(cmd);

		assert!(response.success);
		assert_eq!(*calls.borrow(), vec!["RemoveIdentity:id1"]);
	}

	#[test]
	fn malformed_json_does_not_panic() {
		assert!(parse_command(b"not json").is_err());
	}

	#[test]
	fn resolve_paths_without_peers_uses_default_basename() {
		let dir = std::env::temp_dir().join(format!("zet-test-{}", std::process::id()));
		let _ = std::fs::create_dir_all(&dir);
		let (cmd, event, peers) = resolve_paths(dir.to_str().unwrap(), None);

		assert!(peers.is_empty());
		assert_eq!(cmd.file_name().unwrap().to_str().unwrap(), CMD_BASENAME);
		assert_eq!(event.file_name().unwrap().to_str().unwrap(), EVENT_BASENAME);
		let _ = std::fs::remove_dir_all(&dir);
	}
}
