//! Wires `dnscore`'s engine and `control`'s identity registry/control plane
//! into one `Stakker` instance and runs it to completion.
use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use log::{error, info};
use stakker::{actor, call, ret_nop, Actor, CX};

use control::commands::{Command, Response};
use control::identity;
use control::identity::IdentityRegistry;
use control::metrics::{IdentityMetrics, TICK_INTERVAL};
use control::plane::{ControlPlane, Dispatcher, EventBroadcaster};
use dnscore::catalog::Catalog;
use dnscore::engine::Engine;

use crate::config::Config;
use crate::platform::{NullFlow, NullOverlay};

type EngineActor = Actor<Engine<NullOverlay, NullFlow>>;
type Registry = Rc<RefCell<IdentityRegistry<NullOverlay>>>;

pub fn run(config: &Config, cmd_path: &Path, event_path: &Path, claim_tun: bool) -> Result<(), String> {
	let dns_ip = derive_dns_ip(&config.cidr)?;
	let catalog = Catalog::seed(&config.cidr, dns_ip).map_err(|err| format!("{err:?}"))?;

	info!("Synthetic address pool: {} addresses, tun_ip={}", catalog.capacity(), catalog.tun_ip());
	if !claim_tun {
		info!("Starting in host-only mode: not claiming the TUN device");
	}

	let mut s = runtime::rt::init();

	// The one glue point with no precedent elsewhere in this workspace: a
	// top-level actor spawned outside of another actor's own `init`. Every
	// other actor in this crate is constructed by a parent that already
	// holds a `cx`; the engine here is the root of the tree.
	let engine: EngineActor = actor!(s, Engine::init(catalog, NullOverlay::default(), NullFlow), ret_nop!());

	if !config.upstreams.is_empty() {
		let hosts: Vec<_> = config
			.upstreams
			.iter()
			.filter_map(|raw| raw.parse::<std::net::SocketAddr>().ok().map(|addr| (addr.ip(), Some(addr.port()))).or_else(|| raw.parse::<Ipv4Addr>().ok().map(|ip| (ip.into(), None))))
			.collect();
		engine.apply(&mut s, |this, cx| {
			this.set_upstreams(cx, hosts);
		});
	}

	let registry: Registry = Rc::new(RefCell::new(IdentityRegistry::new(NullOverlay::default())));

	if let Some(path) = &config.identity {
		identity::load(&registry, "default".to_string(), path.clone(), false, engine.clone());
	}
	if let Some(dir) = &config.identity_dir {
		load_identity_dir(&registry, dir, &engine);
	}

	let dispatcher = DaemonDispatcher { registry: registry.clone(), engine: engine.clone(), config_dir: config.base_dir.clone() };
	let Some(control_plane) = ControlPlane::bind(cmd_path, event_path, dispatcher) else {
		return Err("failed to bind control plane sockets".into());
	};
	let control_plane = Rc::new(control_plane);

	let metrics = Rc::new(RefCell::new(IdentityMetrics::new()));
	let _ticker: Actor<Ticker> = actor!(s, Ticker::init(registry, control_plane.clone(), metrics), ret_nop!());

	runtime::rt::exec(&mut s, || {
		info!("Shutting down");
	})
	.map_err(|()| "event loop failed".to_string())
}

fn derive_dns_ip(cidr: &str) -> Result<Ipv4Addr, String> {
	let addr = cidr.split_once('/').map(|(a, _)| a).unwrap_or(cidr);
	let addr: Ipv4Addr = addr.parse().map_err(|_| format!("invalid CIDR: {cidr}"))?;
	Ok(Ipv4Addr::from(u32::from(addr) + 1))
}

fn load_identity_dir(registry: &Registry, dir: &str, engine: &EngineActor) {
	let Ok(entries) = std::fs::read_dir(dir) else {
		error!("Could not read identity directory {dir}");
		return;
	};

	for entry in entries.filter_map(|e| e.ok()) {
		let path = entry.path();
		if path.extension().is_some_and(|ext| ext == "json") {
			let identifier = path.file_stem().and_then(|s| s.to_str()).unwrap_or("identity").to_string();
			identity::load(registry, identifier, path.to_string_lossy().into_owned(), false, engine.clone());
		}
	}
}

/// Translates control-socket commands into identity-registry/engine calls.
/// Runs from a plain `Fwd` closure (see `control::plane`), so it has no
/// `CX![]` of its own; every call it makes into `registry`/`engine` is
/// correspondingly cx-free.
struct DaemonDispatcher {
	registry: Registry,
	engine: EngineActor,
	config_dir: String,
}

impl Dispatcher for DaemonDispatcher {
	fn dispatch(&mut self, cmd: Command) -> Response {
		match cmd {
			Command::ListIdentities => Response::ok(self.registry.borrow().list()),
			Command::RemoveIdentity(data) => match self.registry.borrow_mut().remove(&data.identifier) {
				Some(ops) => {
					identity::apply_ops(&self.engine, ops);
					Response::ok_empty()
				}
				None => Response::rejected(format!("no such identity: {}", data.identifier)),
			},
			Command::IdentityOnOff(data) => match self.registry.borrow_mut().set_active(&data.identifier, data.on_off) {
				Some(ops) => {
					identity::apply_ops(&self.engine, ops);
					Response::ok_empty()
				}
				None => Response::rejected(format!("no such identity: {}", data.identifier)),
			},
			Command::LoadIdentity(data) => {
				let loaded = identity::load(&self.registry, data.identifier.clone(), data.path, data.disabled, self.engine.clone());
				if loaded {
					Response::ok_empty()
				} else {
					Response::rejected(format!("{} is already loaded", data.identifier))
				}
			}
			Command::SetLogLevel(data) => {
				let level = match data.level.to_ascii_lowercase().as_str() {
					"trace" => log::LevelFilter::Trace,
					"debug" => log::LevelFilter::Debug,
					"info" => log::LevelFilter::Info,
					"warn" => log::LevelFilter::Warn,
					"error" => log::LevelFilter::Error,
					"off" => log::LevelFilter::Off,
					_ => return Response::rejected("unrecognized log level"),
				};
				log::set_max_level(level);
				Response::ok_empty()
			}
			Command::Status => Response::ok(serde_json::json!({"ConfigDir": self.config_dir})),
			Command::UpdateTunIpv4(data) => match data.validate() {
				Ok(_tun_ip) => Response::ok_empty(),
				Err(err) => Response::rejected(err),
			},
			Command::SetUpstreamDNS(upstreams) => {
				let hosts: Vec<_> = upstreams.iter().filter_map(|u| u.host.parse::<IpAddr>().ok().map(|ip| (ip, u.port))).collect();
				call!([self.engine], set_upstreams(hosts));
				Response::ok_empty()
			}
			// ZitiDump/IpDump, MFA, enrollment, and external-auth commands all
			// bottom out in the overlay SDK connection itself (live service
			// state, MFA challenge state, token exchange) rather than in
			// anything the identity registry or engine track on their own, so
			// there's nothing for `NullOverlay` to answer with truthfully.
			cmd => Response::rejected(format!("{cmd:?}: requires a real overlay SDK connection")),
		}
	}
}

/// Periodic housekeeping actor: every 5 seconds, reaps disconnected control
/// sockets and broadcasts a metrics event for every loaded-and-active
/// identity (see `control::metrics`).
struct Ticker {
	registry: Registry,
	control_plane: Rc<ControlPlane<DaemonDispatcher>>,
	metrics: Rc<RefCell<IdentityMetrics>>,
}

impl Ticker {
	fn init(cx: CX![], registry: Registry, control_plane: Rc<ControlPlane<DaemonDispatcher>>, metrics: Rc<RefCell<IdentityMetrics>>) -> Option<Self> {
		schedule_tick(cx);
		Some(Self { registry, control_plane, metrics })
	}

	fn tick(&mut self, cx: CX![]) {
		self.control_plane.reap();

		let registry = self.registry.borrow();
		let active: Vec<&str> = registry.list().into_iter().filter(|id| registry.get(id).is_some_and(|identity| identity.active)).collect();

		let (metrics_event, notification) = self.metrics.borrow_mut().tick(&active);
		let broadcaster: EventBroadcaster = self.control_plane.broadcaster();
		broadcaster.broadcast(&metrics_event);
		if let Some(notification) = notification {
			broadcaster.broadcast(&notification);
		}

		drop(registry);
		schedule_tick(cx);
	}
}

fn schedule_tick(cx: CX![]) {
	let actor = cx.access_actor().clone();
	cx.after(TICK_INTERVAL, move |s| actor.apply(s, |this, cx| this.tick(cx)));
}

#[allow(dead_code)]
const _: Duration = TICK_INTERVAL;
