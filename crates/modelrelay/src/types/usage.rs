use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::attempt::Usage;
use crate::types::channel::ChannelId;
use crate::types::principal::{TokenId, UserId};

/// The persisted billing record for one inbound request, keyed by request id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
	pub request_id: String,
	pub trace_id: String,
	pub user_id: UserId,
	pub token_id: TokenId,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub channel_id: Option<ChannelId>,
	pub model: String,
	pub usage: Usage,
	/// Quota units committed against the ledger.
	pub quota: i64,
	pub latency_ms: u64,
	pub streamed: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<String>,
	pub retries: u32,
	pub created_at: DateTime<Utc>,
}

impl UsageRecord {
	pub fn cost_usd(&self, quota_per_usd: i64) -> f64 {
		self.quota as f64 / quota_per_usd as f64
	}
}
