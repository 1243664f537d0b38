use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use serde::Deserialize;
use tracing::warn;

/// Fixed-window scopes, each with its own key space and default budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
	/// Any API request, keyed by client IP
	GlobalApi,
	/// Web/dashboard surface, keyed by client IP
	GlobalWeb,
	/// Relay requests, keyed by token id
	RelayToken,
	/// Upstream dispatches, keyed by channel id
	Channel,
	/// Sensitive endpoints, keyed by client IP
	Critical,
}

impl fmt::Display for Scope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Scope::GlobalApi => "api",
			Scope::GlobalWeb => "web",
			Scope::RelayToken => "relay",
			Scope::Channel => "channel",
			Scope::Critical => "critical",
		};
		write!(f, "{s}")
	}
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Rule {
	pub limit: u64,
	#[serde(with = "crate::serdes::serde_dur")]
	pub window: Duration,
}

impl Rule {
	const fn new(limit: u64, window_secs: u64) -> Self {
		Self {
			limit,
			window: Duration::from_secs(window_secs),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RateLimitConfig {
	pub global_api: Rule,
	pub global_web: Rule,
	pub relay_token: Rule,
	/// Per-channel dispatch budget; off by default.
	pub channel: Option<Rule>,
	pub critical: Rule,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			global_api: Rule::new(480, 180),
			global_web: Rule::new(240, 180),
			relay_token: Rule::new(480, 180),
			channel: None,
			critical: Rule::new(20, 1200),
		}
	}
}

impl RateLimitConfig {
	fn rule(&self, scope: Scope) -> Option<Rule> {
		match scope {
			Scope::GlobalApi => Some(self.global_api),
			Scope::GlobalWeb => Some(self.global_web),
			Scope::RelayToken => Some(self.relay_token),
			Scope::Channel => self.channel,
			Scope::Critical => Some(self.critical),
		}
	}
}

/// Raised when a window is exhausted; carries the seconds until it rolls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
	pub retry_after_secs: u64,
}

struct Hit {
	count: u64,
	reset_in: Duration,
}

#[async_trait]
trait CounterStore: Send + Sync {
	async fn hit(&self, key: &str, window: Duration) -> anyhow::Result<Hit>;
}

/// In-process counters with the same fixed-window semantics Redis gives us.
#[derive(Default)]
struct MemoryCounters {
	windows: Mutex<HashMap<String, (Instant, u64)>>,
}

#[async_trait]
impl CounterStore for MemoryCounters {
	async fn hit(&self, key: &str, window: Duration) -> anyhow::Result<Hit> {
		let now = Instant::now();
		let mut windows = self.windows.lock();
		let entry = windows.entry(key.to_string()).or_insert((now, 0));
		if now.duration_since(entry.0) >= window {
			*entry = (now, 0);
		}
		entry.1 += 1;
		let reset_in = window.saturating_sub(now.duration_since(entry.0));
		Ok(Hit {
			count: entry.1,
			reset_in,
		})
	}
}

/// Redis-backed counters: INCR, with EXPIRE set on the first hit of a window.
struct RedisCounters {
	conn: redis::aio::ConnectionManager,
}

#[async_trait]
impl CounterStore for RedisCounters {
	async fn hit(&self, key: &str, window: Duration) -> anyhow::Result<Hit> {
		let mut conn = self.conn.clone();
		let count: u64 = conn.incr(key, 1).await?;
		if count == 1 {
			let _: bool = conn.expire(key, window.as_secs() as i64).await?;
		}
		let ttl: i64 = conn.ttl(key).await?;
		let reset_in = if ttl > 0 {
			Duration::from_secs(ttl as u64)
		} else {
			window
		};
		Ok(Hit { count, reset_in })
	}
}

pub struct RateLimiter {
	cfg: RateLimitConfig,
	store: Box<dyn CounterStore>,
}

impl RateLimiter {
	pub fn in_memory(cfg: RateLimitConfig) -> Self {
		Self {
			cfg,
			store: Box::new(MemoryCounters::default()),
		}
	}

	pub async fn redis(cfg: RateLimitConfig, url: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(url)?;
		let conn = client.get_connection_manager().await?;
		Ok(Self {
			cfg,
			store: Box::new(RedisCounters { conn }),
		})
	}

	/// Charge one hit against `(scope, id)`. A counter-store failure fails
	/// open: availability over strictness when the backing store is down.
	pub async fn check(&self, scope: Scope, id: &str) -> Result<(), RateLimited> {
		let Some(rule) = self.cfg.rule(scope) else {
			return Ok(());
		};
		let key = format!("ratelimit:{scope}:{id}");
		match self.store.hit(&key, rule.window).await {
			Ok(hit) if hit.count > rule.limit => Err(RateLimited {
				retry_after_secs: hit.reset_in.as_secs().max(1),
			}),
			Ok(_) => Ok(()),
			Err(e) => {
				warn!(scope = %scope, error = %e, "rate limit store unavailable, failing open");
				Ok(())
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn limiter(limit: u64, window_secs: u64) -> RateLimiter {
		RateLimiter::in_memory(RateLimitConfig {
			global_api: Rule::new(limit, window_secs),
			..Default::default()
		})
	}

	#[tokio::test]
	async fn allows_up_to_the_limit_then_429s() {
		let rl = limiter(3, 180);
		for _ in 0..3 {
			rl.check(Scope::GlobalApi, "203.0.113.7").await.unwrap();
		}
		let err = rl.check(Scope::GlobalApi, "203.0.113.7").await.unwrap_err();
		assert!(err.retry_after_secs >= 1 && err.retry_after_secs <= 180);
		// A different key is unaffected.
		rl.check(Scope::GlobalApi, "203.0.113.8").await.unwrap();
	}

	#[tokio::test]
	async fn scopes_have_separate_counters() {
		let rl = limiter(1, 180);
		rl.check(Scope::GlobalApi, "k").await.unwrap();
		assert!(rl.check(Scope::GlobalApi, "k").await.is_err());
		// Other scopes still admit the same id.
		rl.check(Scope::RelayToken, "k").await.unwrap();
		rl.check(Scope::Critical, "k").await.unwrap();
	}

	#[tokio::test]
	async fn channel_scope_is_off_by_default() {
		let rl = limiter(1, 180);
		for _ in 0..10 {
			rl.check(Scope::Channel, "5").await.unwrap();
		}
	}

	#[tokio::test]
	async fn window_rolls_over() {
		let rl = RateLimiter::in_memory(RateLimitConfig {
			global_api: Rule {
				limit: 1,
				window: Duration::from_millis(20),
			},
			..Default::default()
		});
		rl.check(Scope::GlobalApi, "k").await.unwrap();
		assert!(rl.check(Scope::GlobalApi, "k").await.is_err());
		tokio::time::sleep(Duration::from_millis(30)).await;
		rl.check(Scope::GlobalApi, "k").await.unwrap();
	}
}
