use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::llm::types::{RequestPayload, SimpleMessage};

/// Anthropic Messages request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Request {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(default)]
	pub messages: Vec<Message>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<SystemPrompt>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub stop_sequences: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_k: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<ToolChoice>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metadata: Option<Metadata>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thinking: Option<ThinkingInput>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	#[default]
	User,
	Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
	pub role: Role,
	#[serde(deserialize_with = "deserialize_content")]
	pub content: Vec<ContentBlock>,
}

/// Message content accepts both a bare string and an array of blocks.
fn deserialize_content<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
	D: Deserializer<'de>,
{
	use serde::de::Error;

	let value = Value::deserialize(deserializer)?;
	match value {
		Value::String(text) => Ok(vec![ContentBlock::Known(KnownBlock::Text {
			text,
			cache_control: None,
		})]),
		Value::Array(_) => Vec::<ContentBlock>::deserialize(value).map_err(D::Error::custom),
		_ => Err(D::Error::custom(
			"content must be either a string or an array",
		)),
	}
}

/// A content block we understand, or anything else kept as raw JSON. Raw
/// blocks survive conversion by being rendered as text instead of dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentBlock {
	Known(KnownBlock),
	Other(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum KnownBlock {
	Text {
		text: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<CacheControl>,
	},
	Image {
		source: Value,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<CacheControl>,
	},
	Thinking {
		thinking: String,
		#[serde(default, skip_serializing_if = "String::is_empty")]
		signature: String,
	},
	RedactedThinking {
		data: String,
	},
	ToolUse {
		id: String,
		name: String,
		input: Value,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<CacheControl>,
	},
	ToolResult {
		tool_use_id: String,
		content: ToolResultContent,
		#[serde(skip_serializing_if = "Option::is_none")]
		is_error: Option<bool>,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<CacheControl>,
	},
}

impl ContentBlock {
	pub fn text(text: impl Into<String>) -> Self {
		ContentBlock::Known(KnownBlock::Text {
			text: text.into(),
			cache_control: None,
		})
	}

	pub fn is_tool_use_or_result(&self) -> bool {
		matches!(
			self,
			ContentBlock::Known(KnownBlock::ToolUse { .. } | KnownBlock::ToolResult { .. })
		)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
	Text(String),
	Blocks(Vec<Value>),
}

impl ToolResultContent {
	pub fn as_text(&self) -> String {
		match self {
			ToolResultContent::Text(t) => t.clone(),
			ToolResultContent::Blocks(blocks) => blocks
				.iter()
				.filter_map(|b| b.get("text").and_then(Value::as_str))
				.collect::<Vec<_>>()
				.join("\n"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CacheControl {
	Ephemeral {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		ttl: Option<String>,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
	Text(String),
	Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
	pub fn joined_text(&self) -> String {
		match self {
			SystemPrompt::Text(t) => t.clone(),
			SystemPrompt::Blocks(blocks) => blocks
				.iter()
				.map(|b| match b {
					SystemBlock::Text { text, .. } => text.as_str(),
				})
				.collect::<Vec<_>>()
				.join("\n"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemBlock {
	Text {
		text: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<CacheControl>,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub input_schema: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_control: Option<CacheControl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
	Auto,
	Any,
	Tool { name: String },
	None,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metadata {
	#[serde(flatten)]
	pub fields: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ThinkingInput {
	Enabled { budget_tokens: u64 },
	Disabled {},
}

impl RequestPayload for Request {
	fn model(&mut self) -> &mut Option<String> {
		&mut self.model
	}

	fn model_name(&self) -> Option<&str> {
		self.model.as_deref()
	}

	fn streaming(&self) -> bool {
		self.stream.unwrap_or_default()
	}

	fn prompt_messages(&self) -> Vec<SimpleMessage> {
		let mut out = Vec::new();
		if let Some(system) = &self.system {
			out.push(SimpleMessage::new("system", system.joined_text()));
		}
		for m in &self.messages {
			let role = match m.role {
				Role::User => "user",
				Role::Assistant => "assistant",
			};
			let text = m
				.content
				.iter()
				.filter_map(|b| match b {
					ContentBlock::Known(KnownBlock::Text { text, .. }) => Some(text.as_str()),
					_ => None,
				})
				.collect::<Vec<_>>()
				.join("\n");
			out.push(SimpleMessage::new(role, text));
		}
		out
	}
}

// ---- responses ----

/// Reason generation stopped, in Anthropic vocabulary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
	EndTurn,
	MaxTokens,
	StopSequence,
	ToolUse,
	Refusal,
	PauseTurn,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
	#[serde(default)]
	pub input_tokens: u64,
	#[serde(default)]
	pub output_tokens: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_creation_input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_read_input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_creation: Option<CacheCreation>,
}

/// Cache-write token counts broken down by TTL class.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheCreation {
	#[serde(default)]
	pub ephemeral_5m_input_tokens: u64,
	#[serde(default)]
	pub ephemeral_1h_input_tokens: u64,
}

impl Usage {
	pub fn to_usage(&self) -> crate::types::attempt::Usage {
		let cached = self.cache_read_input_tokens.unwrap_or_default();
		crate::types::attempt::Usage {
			// Anthropic reports input_tokens exclusive of cache reads; the
			// accounting model wants the full prompt with the cached share
			// called out.
			prompt_tokens: self.input_tokens + cached,
			completion_tokens: self.output_tokens,
			cached_prompt_tokens: cached,
			cache_write_5m_tokens: self
				.cache_creation
				.as_ref()
				.map(|c| c.ephemeral_5m_input_tokens)
				.unwrap_or_else(|| self.cache_creation_input_tokens.unwrap_or_default()),
			cache_write_1h_tokens: self
				.cache_creation
				.as_ref()
				.map(|c| c.ephemeral_1h_input_tokens)
				.unwrap_or_default(),
			..Default::default()
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
	pub id: String,
	#[serde(rename = "type")]
	pub response_type: String,
	pub role: Role,
	pub content: Vec<ContentBlock>,
	pub model: String,
	pub stop_reason: Option<StopReason>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_sequence: Option<String>,
	pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StreamEvent {
	MessageStart {
		message: MessagesResponse,
	},
	ContentBlockStart {
		index: usize,
		content_block: ContentBlock,
	},
	ContentBlockDelta {
		index: usize,
		delta: ContentDelta,
	},
	ContentBlockStop {
		index: usize,
	},
	MessageDelta {
		delta: MessageDelta,
		usage: Usage,
	},
	MessageStop,
	Ping,
}

impl StreamEvent {
	pub fn event_name(&self) -> &'static str {
		match self {
			Self::MessageStart { .. } => "message_start",
			Self::ContentBlockStart { .. } => "content_block_start",
			Self::ContentBlockDelta { .. } => "content_block_delta",
			Self::ContentBlockStop { .. } => "content_block_stop",
			Self::MessageDelta { .. } => "message_delta",
			Self::MessageStop => "message_stop",
			Self::Ping => "ping",
		}
	}

	pub fn into_frame(self) -> (&'static str, Self) {
		(self.event_name(), self)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ContentDelta {
	TextDelta { text: String },
	InputJsonDelta { partial_json: String },
	ThinkingDelta { thinking: String },
	SignatureDelta { signature: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessageDelta {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_reason: Option<StopReason>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	#[serde(rename = "type", default = "error_type")]
	pub response_type: String,
	pub error: ErrorBody,
}

fn error_type() -> String {
	"error".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
	#[serde(rename = "type")]
	pub error_type: String,
	pub message: String,
}

impl ErrorResponse {
	pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			response_type: "error".to_string(),
			error: ErrorBody {
				error_type: error_type.into(),
				message: message.into(),
			},
		}
	}
}
