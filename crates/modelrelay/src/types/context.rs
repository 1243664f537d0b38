use std::net::IpAddr;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::channel::ChannelId;
use crate::types::principal::{Token, User};

/// The wire shape the client sent. Determines what every response (including
/// errors and stream frames) must look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IngressShape {
	Completions,
	Responses,
	Messages,
}

/// The inferred operation class, independent of wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RelayMode {
	Chat,
	Responses,
	Messages,
	Embeddings,
	ImagesGenerations,
	ImagesEdits,
	AudioSpeech,
	AudioTranscription,
	AudioTranslation,
	Rerank,
}

impl RelayMode {
	pub fn is_background(&self) -> bool {
		matches!(self, RelayMode::ImagesGenerations | RelayMode::ImagesEdits)
	}
}

/// Which key reasoning text is surfaced under in chat-shape responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningFormat {
	/// DeepSeek shape: `reasoning_content`
	ReasoningContent,
	/// OpenRouter shape: `reasoning`
	Reasoning,
	/// Claude shape: `thinking`
	Thinking,
}

/// Per-request relay options, accepted as query parameters on any relay
/// endpoint.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RelayOptions {
	#[serde(default)]
	pub thinking: Option<bool>,
	#[serde(default)]
	pub reasoning_format: Option<ReasoningFormat>,
}

impl RelayOptions {
	pub fn reasoning_format_or(&self, shape: IngressShape) -> ReasoningFormat {
		self.reasoning_format.unwrap_or(match shape {
			IngressShape::Messages => ReasoningFormat::Thinking,
			_ => ReasoningFormat::ReasoningContent,
		})
	}
}

/// Everything one inbound call carries through the pipeline. Owns the quota
/// reservation handle until commit or refund.
#[derive(Debug)]
pub struct RequestContext {
	pub request_id: String,
	pub trace_id: String,
	pub user: User,
	pub token: Token,
	pub shape: IngressShape,
	pub mode: RelayMode,
	/// Model name after request-level mapping; channel-level mapping is
	/// applied per attempt.
	pub model: String,
	pub options: RelayOptions,
	pub body: Bytes,
	/// Inbound Content-Type, forwarded verbatim for passthrough payloads.
	pub content_type: Option<String>,
	pub client_ip: IpAddr,
	/// Admin channel-affinity hint; restricts selection to one channel.
	pub channel_hint: Option<ChannelId>,
	pub estimated_prompt_tokens: u64,
	pub started: Instant,
}
