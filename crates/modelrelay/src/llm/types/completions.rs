use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::types::{RequestPayload, SimpleMessage};
use crate::types::attempt;

pub const SYSTEM_ROLE: &str = "system";
pub const USER_ROLE: &str = "user";
pub const ASSISTANT_ROLE: &str = "assistant";
pub const TOOL_ROLE: &str = "tool";

/// OpenAI Chat Completions request. Fields the gateway reads or rewrites are
/// typed; everything else rides along in `rest` so unknown parameters reach
/// the provider untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Request {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(default)]
	pub messages: Vec<RequestMessage>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream_options: Option<StreamOptions>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_completion_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop: Option<Stop>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<ToolChoice>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_format: Option<ResponseFormat>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reasoning_effort: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamOptions {
	pub include_usage: bool,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stop {
	String(String),
	StringArray(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
	pub role: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<MessageContent>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_call_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(flatten, default)]
	pub rest: Value,
}

impl RequestMessage {
	pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
		Self {
			role: role.into(),
			content: Some(MessageContent::Text(content.into())),
			tool_calls: None,
			tool_call_id: None,
			name: None,
			rest: Value::default(),
		}
	}

	/// Concatenated text of the message, ignoring non-text parts.
	pub fn content_text(&self) -> String {
		match &self.content {
			Some(MessageContent::Text(t)) => t.clone(),
			Some(MessageContent::Parts(parts)) => parts
				.iter()
				.filter_map(|p| p.text.as_deref())
				.collect::<Vec<_>>()
				.join("\n"),
			None => String::new(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
	#[serde(rename = "type")]
	pub part_type: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub image_url: Option<ImageUrl>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
	pub url: String,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Tool {
	Function { function: FunctionObject },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionObject {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub parameters: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub strict: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
	/// "auto" | "none" | "required"
	Mode(String),
	Named(NamedToolChoice),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedToolChoice {
	#[serde(rename = "type")]
	pub choice_type: String,
	pub function: FunctionName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionName {
	pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
	Text,
	JsonObject,
	JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSchemaFormat {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub schema: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub strict: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
	pub id: String,
	#[serde(rename = "type", default = "function_type")]
	pub call_type: String,
	pub function: FunctionCall,
}

fn function_type() -> String {
	"function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
	pub name: String,
	pub arguments: String,
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
		self
			.messages
			.iter()
			.map(|m| SimpleMessage::new(m.role.clone(), m.content_text()))
			.collect()
	}
}

// ---- responses ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub id: String,
	pub object: String,
	pub created: u64,
	pub model: String,
	pub choices: Vec<Choice>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
	pub index: u32,
	pub message: ResponseMessage,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<String>,
	#[serde(flatten, default)]
	pub rest: Value,
}

/// Assistant message in a non-stream response. The three optional reasoning
/// keys exist because providers disagree on the field name; exactly one is
/// populated on egress, per the request's `reasoning_format`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResponseMessage {
	pub role: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reasoning_content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reasoning: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thinking: Option<String>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub total_tokens: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub prompt_tokens_details: Option<PromptTokensDetails>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptTokensDetails {
	#[serde(default)]
	pub cached_tokens: u64,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionTokensDetails {
	#[serde(default)]
	pub reasoning_tokens: u64,
	#[serde(flatten, default)]
	pub rest: Value,
}

impl Usage {
	pub fn to_usage(&self) -> attempt::Usage {
		attempt::Usage {
			prompt_tokens: self.prompt_tokens,
			completion_tokens: self.completion_tokens,
			cached_prompt_tokens: self
				.prompt_tokens_details
				.as_ref()
				.map(|d| d.cached_tokens)
				.unwrap_or_default(),
			reasoning_tokens: self
				.completion_tokens_details
				.as_ref()
				.map(|d| d.reasoning_tokens)
				.unwrap_or_default(),
			..Default::default()
		}
	}

	pub fn from_tokens(prompt: u64, completion: u64) -> Self {
		Self {
			prompt_tokens: prompt,
			completion_tokens: completion,
			total_tokens: prompt + completion,
			prompt_tokens_details: None,
			completion_tokens_details: None,
		}
	}
}

// ---- streaming ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResponse {
	pub id: String,
	pub object: String,
	pub created: u64,
	pub model: String,
	#[serde(default)]
	pub choices: Vec<StreamChoice>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
	pub index: u32,
	pub delta: StreamDelta,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<String>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamDelta {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<StreamToolCall>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reasoning_content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reasoning: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thinking: Option<String>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamToolCall {
	pub index: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(rename = "type", skip_serializing_if = "Option::is_none")]
	pub call_type: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub function: Option<StreamFunctionCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamFunctionCall {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub arguments: Option<String>,
}

// ---- errors ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
	#[serde(rename = "type")]
	pub error_type: String,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub param: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}

impl ErrorResponse {
	pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			error: ErrorBody {
				error_type: error_type.into(),
				message: message.into(),
				param: None,
				code: None,
			},
		}
	}
}

/// The reasoning text of a delta/message, wherever the provider put it.
pub fn take_reasoning(delta: &mut StreamDelta) -> Option<String> {
	delta
		.reasoning_content
		.take()
		.or_else(|| delta.reasoning.take())
		.or_else(|| delta.thinking.take())
}
