//! Periodic metrics and MFA-timeout notifications.
//!
//! Every 5 seconds the owning actor calls `tick()` once per loaded-and-active
//! identity to drain its accumulated byte counters into a `tunnel_metrics_event`,
//! and to check whether any identity's minimum service timeout has just entered
//! its warning window, in which case a single `notification_event` fires. A
//! per-identity `notified` flag (cleared whenever `set_mfa_deadline` installs a
//! fresh deadline) stops the same window from renotifying on every tick.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::commands::{Event, IdentityRate};

pub const TICK_INTERVAL: Duration = Duration::from_secs(5);
const WARNING_WINDOW: Duration = Duration::from_secs(20 * 60);
const MAJOR_WINDOW: Duration = Duration::from_secs(5 * 60);
const CRITICAL_WINDOW: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Counter {
	up: u64,
	down: u64,
}

pub struct IdentityMetrics {
	counters: HashMap<String, Counter>,
	mfa_deadlines: HashMap<String, (Instant, bool)>,
}

impl IdentityMetrics {
	pub fn new() -> Self {
		Self { counters: HashMap::new(), mfa_deadlines: HashMap::new() }
	}

	pub fn record_up(&mut self, identifier: &str, bytes: u64) {
		self.counters.entry(identifier.to_string()).or_default().up += bytes;
	}

	pub fn record_down(&mut self, identifier: &str, bytes: u64) {
		self.counters.entry(identifier.to_string()).or_default().down += bytes;
	}

	/// Installs (or clears, with `None`) the minimum service timeout deadline
	/// for `identifier`. Always resets the `notified` flag, so a freshly
	/// reported deadline gets its own notification even if the previous one
	/// already fired.
	pub fn set_mfa_deadline(&mut self, identifier: &str, deadline: Option<Instant>) {
		match deadline {
			Some(deadline) => {
				self.mfa_deadlines.insert(identifier.to_string(), (deadline, false));
			}
			None => {
				self.mfa_deadlines.remove(identifier);
			}
		}
	}

	pub fn forget(&mut self, identifier: &str) {
		self.counters.remove(identifier);
		self.mfa_deadlines.remove(identifier);
	}

	/// Drains the byte counters for `active` identities into a metrics event,
	/// and returns a notification event for any identity whose deadline has
	/// just entered its warning window.
	pub fn tick(&mut self, active: &[&str]) -> (Event, Option<Event>) {
		let rates = active
			.iter()
			.map(|id| {
				let counter = self.counters.remove(*id).unwrap_or_default();
				IdentityRate { identifier: id.to_string(), up: format_rate(counter.up), down: format_rate(counter.down) }
			})
			.collect();

		let now = Instant::now();
		let mut by_severity: HashMap<&'static str, Vec<String>> = HashMap::new();

		for id in active {
			let Some((deadline, notified)) = self.mfa_deadlines.get_mut(*id) else {
				continue;
			};
			if *notified {
				continue;
			}
			let remaining = deadline.saturating_duration_since(now);
			if remaining > WARNING_WINDOW {
				continue;
			}

			*notified = true;
			let severity = if remaining <= CRITICAL_WINDOW {
				"critical"
			} else if remaining <= MAJOR_WINDOW {
				"major"
			} else {
				"minor"
			};
			by_severity.entry(severity).or_default().push(id.to_string());
		}

		// One tick can only cross a single identity into a new window in the
		// common case; if several land in different severities at once, emit
		// the highest rather than splitting into multiple events.
		let notification = ["critical", "major", "minor"].iter().find_map(|severity| by_severity.remove(severity).map(|identifiers| Event::Notification { identifiers, severity }));

		(Event::Metrics { rates }, notification)
	}
}

impl Default for IdentityMetrics {
	fn default() -> Self {
		Self::new()
	}
}

fn format_rate(bytes: u64) -> String {
	let per_sec = bytes as f64 / TICK_INTERVAL.as_secs_f64();
	format!("{per_sec:.2}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tick_drains_counters_into_rates_and_resets_them() {
		let mut metrics = IdentityMetrics::new();
		metrics.record_up("id1", 500);
		metrics.record_down("id1", 1000);

		let (event, notification) = metrics.tick(&["id1"]);
		assert!(notification.is_none());
		let Event::Metrics { rates } = event else { panic!("expected Metrics event") };
		assert_eq!(rates.len(), 1);
		assert_eq!(rates[0].identifier, "id1");

		let (event, _) = metrics.tick(&["id1"]);
		let Event::Metrics { rates } = event else { panic!("expected Metrics event") };
		assert_eq!(rates[0].up, format_rate(0));
	}

	#[test]
	fn deadline_inside_warning_window_notifies_once() {
		let mut metrics = IdentityMetrics::new();
		metrics.set_mfa_deadline("id1", Some(Instant::now() + Duration::from_secs(10 * 60)));

		let (_, notification) = metrics.tick(&["id1"]);
		let notification = notification.expect("should notify once the window is entered");
		let Event::Notification { identifiers, severity } = notification else { panic!("expected Notification event") };
		assert_eq!(identifiers, vec!["id1".to_string()]);
		assert_eq!(severity, "major");

		let (_, notification) = metrics.tick(&["id1"]);
		assert!(notification.is_none(), "should not renotify until the deadline resets");
	}

	#[test]
	fn fresh_deadline_clears_the_notified_flag() {
		let mut metrics = IdentityMetrics::new();
		metrics.set_mfa_deadline("id1", Some(Instant::now() + Duration::from_secs(60)));
		metrics.tick(&["id1"]);

		metrics.set_mfa_deadline("id1", Some(Instant::now() + Duration::from_secs(10 * 60)));
		let (_, notification) = metrics.tick(&["id1"]);
		assert!(notification.is_some());
	}
}
