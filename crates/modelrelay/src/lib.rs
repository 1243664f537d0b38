use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::health::HealthConfig;
use crate::ratelimit::RateLimitConfig;
use crate::serdes::serde_dur_option;

pub mod health;
pub mod http;
pub mod json;
pub mod ledger;
pub mod llm;
pub mod parse;
pub mod pricing;
pub mod ratelimit;
pub mod registry;
pub mod relay;
pub mod serdes;
pub mod store;
pub mod telemetry;
pub mod types;

/// User-supplied configuration: everything optional, camelCase, unknown keys
/// rejected. Resolved into [`Config`] at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	pub listen_addr: Option<String>,
	/// Quota units per USD; defaults to 500000.
	pub quota_per_usd: Option<i64>,
	/// Upstream retries beyond the first attempt.
	pub retry_times: Option<u32>,
	#[serde(default, with = "serde_dur_option")]
	pub idle_timeout: Option<Duration>,
	#[serde(default, with = "serde_dur_option")]
	pub request_timeout: Option<Duration>,
	#[serde(default, with = "serde_dur_option")]
	pub connect_timeout: Option<Duration>,
	/// Fail attempts whose provider omits usage instead of estimating.
	pub enforce_include_usage: Option<bool>,
	/// Largest image (bytes) fetched and inlined as base64.
	pub max_inline_image_size: Option<usize>,
	pub token_prefix: Option<String>,
	/// Extra quota units reserved for background modes (image generation).
	pub reservation_padding: Option<i64>,
	/// Reply 302 instead of transparently re-routing mis-shaped chat bodies.
	pub auto_detect_redirect: Option<bool>,
	/// Forward proxy for upstream dispatch.
	pub relay_proxy: Option<String>,
	/// Proxy for fetching user-supplied asset URLs.
	pub user_content_proxy: Option<String>,
	pub redis_url: Option<String>,
	/// SSE line cap in bytes.
	pub line_limit: Option<usize>,
	/// Inbound body cap in bytes.
	pub body_limit: Option<usize>,
	#[serde(default, with = "serde_dur_option")]
	pub sync_interval: Option<Duration>,
	#[serde(default, with = "serde_dur_option")]
	pub probe_interval: Option<Duration>,
	/// Ledger commit journal location; journaling is off when unset.
	pub journal_path: Option<PathBuf>,
	/// Seed file with channels/tokens/users for single-node runs.
	pub local_state_path: Option<PathBuf>,
	#[serde(default)]
	pub rate_limits: Option<RateLimitConfig>,
	#[serde(default)]
	pub health: Option<HealthConfig>,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub listen_addr: SocketAddr,
	pub quota_per_usd: i64,
	pub retry_times: u32,
	pub idle_timeout: Duration,
	pub request_timeout: Duration,
	pub connect_timeout: Duration,
	pub enforce_include_usage: bool,
	pub max_inline_image_size: usize,
	pub token_prefix: String,
	pub reservation_padding: i64,
	pub auto_detect_redirect: bool,
	pub relay_proxy: Option<String>,
	pub user_content_proxy: Option<String>,
	pub redis_url: Option<String>,
	pub line_limit: usize,
	pub body_limit: usize,
	pub sync_interval: Duration,
	pub probe_interval: Duration,
	pub journal_path: Option<PathBuf>,
	pub local_state_path: Option<PathBuf>,
	pub rate_limits: RateLimitConfig,
	pub health: HealthConfig,
}

impl RawConfig {
	pub fn parse_yaml(raw: &str) -> anyhow::Result<Self> {
		Ok(serde_yaml::from_str(raw)?)
	}

	pub fn build(self) -> anyhow::Result<Config> {
		Ok(Config {
			listen_addr: self
				.listen_addr
				.as_deref()
				.unwrap_or("127.0.0.1:3000")
				.parse()?,
			quota_per_usd: self.quota_per_usd.unwrap_or(pricing::DEFAULT_QUOTA_PER_USD),
			retry_times: self.retry_times.unwrap_or(2),
			idle_timeout: self.idle_timeout.unwrap_or(Duration::from_secs(30)),
			request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(300)),
			connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(10)),
			enforce_include_usage: self.enforce_include_usage.unwrap_or(false),
			max_inline_image_size: self.max_inline_image_size.unwrap_or(8 * 1024 * 1024),
			token_prefix: self.token_prefix.unwrap_or_else(|| "sk-".to_string()),
			reservation_padding: self.reservation_padding.unwrap_or(10_000),
			auto_detect_redirect: self.auto_detect_redirect.unwrap_or(false),
			relay_proxy: self.relay_proxy,
			user_content_proxy: self.user_content_proxy,
			redis_url: self.redis_url,
			line_limit: self.line_limit.unwrap_or(parse::sse::DEFAULT_LINE_LIMIT),
			body_limit: self.body_limit.unwrap_or(2 * 1024 * 1024),
			sync_interval: self.sync_interval.unwrap_or(Duration::from_secs(10)),
			probe_interval: self.probe_interval.unwrap_or(Duration::from_secs(60)),
			journal_path: self.journal_path,
			local_state_path: self.local_state_path,
			rate_limits: self.rate_limits.unwrap_or_default(),
			health: self.health.unwrap_or_default(),
		})
	}
}

impl Default for Config {
	fn default() -> Self {
		RawConfig::default().build().expect("defaults are valid")
	}
}

#[cfg(test)]
mod config_tests {
	use super::*;

	#[test]
	fn defaults_resolve() {
		let cfg = Config::default();
		assert_eq!(cfg.quota_per_usd, 500_000);
		assert_eq!(cfg.token_prefix, "sk-");
		assert_eq!(cfg.idle_timeout, Duration::from_secs(30));
		assert_eq!(cfg.retry_times, 2);
	}

	#[test]
	fn yaml_overrides_apply() {
		let raw = RawConfig::parse_yaml(
			r#"
listenAddr: "0.0.0.0:8080"
quotaPerUsd: 1000000
idleTimeout: 10s
enforceIncludeUsage: true
rateLimits:
  globalApi:
    limit: 10
    window: 60s
"#,
		)
		.unwrap();
		let cfg = raw.build().unwrap();
		assert_eq!(cfg.listen_addr.port(), 8080);
		assert_eq!(cfg.quota_per_usd, 1_000_000);
		assert_eq!(cfg.idle_timeout, Duration::from_secs(10));
		assert!(cfg.enforce_include_usage);
		assert_eq!(cfg.rate_limits.global_api.limit, 10);
	}

	#[test]
	fn unknown_keys_are_rejected() {
		assert!(RawConfig::parse_yaml("nope: 1").is_err());
	}
}
