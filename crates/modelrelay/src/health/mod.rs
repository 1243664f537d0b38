use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;

use crate::types::{ChannelId, Outcome};

/// Why a (channel, model) pair is being suspended; each class carries its own
/// default backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
	/// Provider returned 429
	RateLimited,
	/// Provider 5xx, transport error, or timeout
	Upstream,
	/// Provider auth/quota failure (401/403/insufficient funds)
	Auth,
}

pub fn reason_for(outcome: Outcome) -> Option<SuspendReason> {
	match outcome {
		Outcome::HttpRate => Some(SuspendReason::RateLimited),
		Outcome::Http5xx | Outcome::TransportError | Outcome::Timeout | Outcome::ContractViolation => {
			Some(SuspendReason::Upstream)
		},
		Outcome::HttpAuth => Some(SuspendReason::Auth),
		Outcome::Success | Outcome::HttpBadRequest | Outcome::Cancelled => None,
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HealthConfig {
	#[serde(with = "crate::serdes::serde_dur")]
	pub backoff_rate_limited: Duration,
	#[serde(with = "crate::serdes::serde_dur")]
	pub backoff_upstream: Duration,
	#[serde(with = "crate::serdes::serde_dur")]
	pub backoff_auth: Duration,
	#[serde(with = "crate::serdes::serde_dur")]
	pub retry_after_min: Duration,
	#[serde(with = "crate::serdes::serde_dur")]
	pub retry_after_max: Duration,
	/// Rolling outcome window per (channel, model).
	pub window: usize,
	/// Failure ratio at which the channel is auto-disabled; off when absent.
	pub disable_threshold: Option<f64>,
	pub min_samples: usize,
	/// How long an open circuit waits before allowing a half-open trial.
	#[serde(with = "crate::serdes::serde_dur")]
	pub circuit_cooldown: Duration,
}

impl Default for HealthConfig {
	fn default() -> Self {
		Self {
			backoff_rate_limited: Duration::from_secs(60),
			backoff_upstream: Duration::from_secs(30),
			backoff_auth: Duration::from_secs(60),
			retry_after_min: Duration::from_secs(1),
			retry_after_max: Duration::from_secs(3600),
			window: 16,
			disable_threshold: None,
			min_samples: 8,
			circuit_cooldown: Duration::from_secs(120),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Circuit {
	Closed,
	Open { until: Instant },
	HalfOpen,
}

#[derive(Debug)]
struct Entry {
	suspended_until: Option<Instant>,
	window: VecDeque<bool>,
	circuit: Circuit,
}

impl Entry {
	fn new() -> Self {
		Self {
			suspended_until: None,
			window: VecDeque::new(),
			circuit: Circuit::Closed,
		}
	}

	fn failure_ratio(&self) -> f64 {
		if self.window.is_empty() {
			return 0.0;
		}
		let failures = self.window.iter().filter(|ok| !**ok).count();
		failures as f64 / self.window.len() as f64
	}
}

/// Per-(channel, model) suspension windows, rolling failure accounting and
/// circuit state. Routing-only: an in-flight request already holding a
/// channel is never cancelled by a new suspension.
pub struct HealthController {
	cfg: HealthConfig,
	entries: RwLock<HashMap<(ChannelId, String), Entry>>,
}

impl HealthController {
	pub fn new(cfg: HealthConfig) -> Self {
		Self {
			cfg,
			entries: RwLock::new(HashMap::new()),
		}
	}

	/// Whether selection may target this (channel, model) right now. Flips
	/// an expired open circuit to half-open, admitting one trial.
	pub fn available(&self, channel: ChannelId, model: &str) -> bool {
		let now = Instant::now();
		let mut entries = self.entries.write();
		let Some(entry) = entries.get_mut(&(channel, model.to_string())) else {
			return true;
		};
		if let Some(until) = entry.suspended_until
			&& now < until
		{
			return false;
		}
		match entry.circuit {
			Circuit::Closed | Circuit::HalfOpen => true,
			Circuit::Open { until } => {
				if now >= until {
					entry.circuit = Circuit::HalfOpen;
					true
				} else {
					false
				}
			},
		}
	}

	/// Suspend a pair. `retry_after` (when the provider sent one) is honored
	/// clamped to the configured bounds; suspensions only ever extend, a
	/// later shorter suspension cannot shrink an existing one.
	pub fn suspend(
		&self,
		channel: ChannelId,
		model: &str,
		reason: SuspendReason,
		retry_after: Option<Duration>,
	) {
		let backoff = match retry_after {
			Some(d) => d.clamp(self.cfg.retry_after_min, self.cfg.retry_after_max),
			None => match reason {
				SuspendReason::RateLimited => self.cfg.backoff_rate_limited,
				SuspendReason::Upstream => self.cfg.backoff_upstream,
				SuspendReason::Auth => self.cfg.backoff_auth,
			},
		};
		let until = Instant::now() + backoff;
		let mut entries = self.entries.write();
		let entry = entries
			.entry((channel, model.to_string()))
			.or_insert_with(Entry::new);
		entry.suspended_until = Some(match entry.suspended_until {
			Some(existing) => existing.max(until),
			None => until,
		});
	}

	/// Record an attempt outcome into the rolling window and drive the
	/// circuit. Returns true when the channel should be auto-disabled.
	pub fn observe(&self, channel: ChannelId, model: &str, ok: bool) -> bool {
		let mut entries = self.entries.write();
		let entry = entries
			.entry((channel, model.to_string()))
			.or_insert_with(Entry::new);
		entry.window.push_back(ok);
		while entry.window.len() > self.cfg.window {
			entry.window.pop_front();
		}
		match (entry.circuit, ok) {
			(Circuit::HalfOpen, true) => {
				entry.circuit = Circuit::Closed;
				entry.window.clear();
				entry.window.push_back(true);
			},
			(Circuit::HalfOpen, false) => {
				entry.circuit = Circuit::Open {
					until: Instant::now() + self.cfg.circuit_cooldown,
				};
			},
			(Circuit::Closed, false) => {
				if entry.window.len() >= self.cfg.min_samples && entry.failure_ratio() >= 1.0 {
					entry.circuit = Circuit::Open {
						until: Instant::now() + self.cfg.circuit_cooldown,
					};
				}
			},
			_ => {},
		}

		if ok {
			return false;
		}
		match self.cfg.disable_threshold {
			Some(threshold) => {
				entry.window.len() >= self.cfg.min_samples && entry.failure_ratio() >= threshold
			},
			None => false,
		}
	}

	/// Clear suspension and circuit state for every model of a channel, used
	/// when a probe succeeds and the channel is re-enabled.
	pub fn reset_channel(&self, channel: ChannelId) {
		self.entries.write().retain(|(ch, _), _| *ch != channel);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn controller(disable: Option<f64>) -> HealthController {
		HealthController::new(HealthConfig {
			disable_threshold: disable,
			min_samples: 4,
			window: 8,
			..Default::default()
		})
	}

	#[test]
	fn suspension_blocks_selection() {
		let h = controller(None);
		assert!(h.available(1, "m"));
		h.suspend(1, "m", SuspendReason::RateLimited, None);
		assert!(!h.available(1, "m"));
		// A different model on the same channel is unaffected.
		assert!(h.available(1, "other"));
		assert!(h.available(2, "m"));
	}

	#[test]
	fn suspensions_never_shrink() {
		let h = controller(None);
		h.suspend(1, "m", SuspendReason::Auth, Some(Duration::from_secs(600)));
		// A later, shorter suspension must not shorten the existing one.
		h.suspend(1, "m", SuspendReason::Upstream, None);
		let entries = h.entries.read();
		let until = entries[&(1, "m".to_string())].suspended_until.unwrap();
		assert!(until >= Instant::now() + Duration::from_secs(590));
	}

	#[test]
	fn retry_after_is_clamped() {
		let h = controller(None);
		h.suspend(
			1,
			"m",
			SuspendReason::RateLimited,
			Some(Duration::from_secs(86_400)),
		);
		let entries = h.entries.read();
		let until = entries[&(1, "m".to_string())].suspended_until.unwrap();
		assert!(until <= Instant::now() + Duration::from_secs(3600));

		drop(entries);
		h.suspend(2, "m", SuspendReason::RateLimited, Some(Duration::ZERO));
		let entries = h.entries.read();
		let until = entries[&(2, "m".to_string())].suspended_until.unwrap();
		assert!(until >= Instant::now());
	}

	#[test]
	fn auto_disable_needs_threshold_and_samples() {
		let h = controller(Some(0.5));
		assert!(!h.observe(1, "m", false));
		assert!(!h.observe(1, "m", false));
		assert!(!h.observe(1, "m", false));
		// Fourth sample reaches min_samples with 100% failures.
		assert!(h.observe(1, "m", false));

		// Mostly-successful channels never trip.
		let h = controller(Some(0.5));
		for _ in 0..6 {
			assert!(!h.observe(2, "m", true));
		}
		assert!(!h.observe(2, "m", false));
	}

	#[test]
	fn circuit_opens_and_recovers_via_half_open() {
		let mut cfg = HealthConfig {
			min_samples: 2,
			window: 4,
			circuit_cooldown: Duration::ZERO,
			..Default::default()
		};
		cfg.backoff_upstream = Duration::ZERO;
		let h = HealthController::new(cfg);
		h.observe(1, "m", false);
		h.observe(1, "m", false);
		// Circuit is open; zero cooldown means the next check admits a trial.
		assert!(h.available(1, "m"));
		// Trial success closes the circuit.
		h.observe(1, "m", true);
		assert!(h.available(1, "m"));
	}

	#[test]
	fn reset_clears_channel_state() {
		let h = controller(None);
		h.suspend(1, "a", SuspendReason::Auth, None);
		h.suspend(1, "b", SuspendReason::Auth, None);
		h.suspend(2, "a", SuspendReason::Auth, None);
		h.reset_channel(1);
		assert!(h.available(1, "a"));
		assert!(h.available(1, "b"));
		assert!(!h.available(2, "a"));
	}
}
