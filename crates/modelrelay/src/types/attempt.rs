use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::types::channel::ChannelId;

/// Classified result of one upstream dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
	Success,
	TransportError,
	/// 401/403/insufficient-funds from the provider
	HttpAuth,
	/// 429 from the provider
	HttpRate,
	/// Other 4xx: the request itself is bad; not retried
	HttpBadRequest,
	Http5xx,
	Timeout,
	Cancelled,
	/// Provider omitted usage while enforcement is on
	ContractViolation,
}

impl Outcome {
	/// Whether the pipeline may try another channel after this outcome.
	pub fn retryable(&self) -> bool {
		match self {
			Outcome::Success | Outcome::HttpBadRequest | Outcome::Cancelled => false,
			Outcome::TransportError
			| Outcome::HttpAuth
			| Outcome::HttpRate
			| Outcome::Http5xx
			| Outcome::Timeout
			| Outcome::ContractViolation => true,
		}
	}
}

/// Usage as reported (or estimated) for one attempt. All token counts are
/// cumulative for the attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub cached_prompt_tokens: u64,
	pub reasoning_tokens: u64,
	/// Anthropic prompt-cache writes, by TTL class.
	pub cache_write_5m_tokens: u64,
	pub cache_write_1h_tokens: u64,
	pub images_out: u64,
	#[serde(skip_serializing_if = "HashMap::is_empty")]
	pub tool_calls: HashMap<String, u64>,
	/// Set when the provider omitted usage and the estimator filled it in.
	pub approximate: bool,
}

impl Usage {
	pub fn total_tokens(&self) -> u64 {
		self.prompt_tokens + self.completion_tokens + self.reasoning_tokens
	}

	/// Fold a later (cumulative) usage report into this one. Later values
	/// win where present; token counters from providers are cumulative so
	/// max keeps the final value even if frames arrive with partial fields.
	pub fn merge_cumulative(&mut self, other: &Usage) {
		self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
		self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
		self.cached_prompt_tokens = self.cached_prompt_tokens.max(other.cached_prompt_tokens);
		self.reasoning_tokens = self.reasoning_tokens.max(other.reasoning_tokens);
		self.cache_write_5m_tokens = self.cache_write_5m_tokens.max(other.cache_write_5m_tokens);
		self.cache_write_1h_tokens = self.cache_write_1h_tokens.max(other.cache_write_1h_tokens);
		self.images_out = self.images_out.max(other.images_out);
		for (k, v) in &other.tool_calls {
			let e = self.tool_calls.entry(k.clone()).or_default();
			*e = (*e).max(*v);
		}
		self.approximate |= other.approximate;
	}
}

/// One upstream try. A request owns a sequence of these; the trace endpoint
/// exposes them grouped by trace id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
	pub channel_id: ChannelId,
	pub upstream_model: String,
	pub outcome: Outcome,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
	#[serde(with = "crate::serdes::serde_dur")]
	pub latency: Duration,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	pub billed: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	/// Free-form notes, e.g. `reasoning_unsupported` when a thinking request
	/// hit a provider without reasoning support.
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub annotations: Vec<String>,
}
