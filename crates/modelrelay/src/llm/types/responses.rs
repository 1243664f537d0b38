use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::types::{RequestPayload, SimpleMessage};
use crate::types::attempt;

/// OpenAI Responses API request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Request {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input: Option<Input>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub instructions: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_output_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reasoning: Option<ReasoningConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub text: Option<TextConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Value>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<Value>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Input {
	Text(String),
	Items(Vec<InputItem>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputItem {
	#[serde(rename = "type", skip_serializing_if = "Option::is_none")]
	pub item_type: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<InputContent>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputContent {
	Text(String),
	Parts(Vec<InputPart>),
}

impl InputContent {
	pub fn joined_text(&self) -> String {
		match self {
			InputContent::Text(t) => t.clone(),
			InputContent::Parts(parts) => parts
				.iter()
				.filter_map(|p| p.text.as_deref())
				.collect::<Vec<_>>()
				.join("\n"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPart {
	#[serde(rename = "type")]
	pub part_type: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReasoningConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub effort: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub summary: Option<String>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TextConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub format: Option<Value>,
	#[serde(flatten, default)]
	pub rest: Value,
}

impl Request {
	/// A chat-completions body posted to `/v1/chat/completions` carries
	/// `messages`; a Responses body carries `input` or `instructions`. Used
	/// by the ingress auto-detection.
	pub fn looks_like_responses_body(body: &Value) -> bool {
		body.get("messages").is_none()
			&& (body.get("input").is_some() || body.get("instructions").is_some())
	}
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
		if let Some(instructions) = &self.instructions {
			out.push(SimpleMessage::new("system", instructions.clone()));
		}
		match &self.input {
			Some(Input::Text(t)) => out.push(SimpleMessage::new("user", t.clone())),
			Some(Input::Items(items)) => {
				for item in items {
					let role = item.role.as_deref().unwrap_or("user");
					if let Some(content) = &item.content {
						out.push(SimpleMessage::new(role, content.joined_text()));
					}
				}
			},
			None => {},
		}
		out
	}
}

// ---- responses ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub id: String,
	pub object: String,
	pub created_at: u64,
	pub status: String,
	pub model: String,
	pub output: Vec<OutputItem>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	#[serde(flatten, default)]
	pub rest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
	Message {
		id: String,
		role: String,
		status: String,
		content: Vec<OutputContent>,
	},
	Reasoning {
		id: String,
		#[serde(default)]
		summary: Vec<Value>,
	},
	FunctionCall {
		id: String,
		call_id: String,
		name: String,
		arguments: String,
		status: String,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputContent {
	OutputText {
		text: String,
		#[serde(default)]
		annotations: Vec<Value>,
	},
	Refusal {
		refusal: String,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
	#[serde(default)]
	pub input_tokens: u64,
	#[serde(default)]
	pub output_tokens: u64,
	#[serde(default)]
	pub total_tokens: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input_tokens_details: Option<InputTokensDetails>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub output_tokens_details: Option<OutputTokensDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InputTokensDetails {
	#[serde(default)]
	pub cached_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputTokensDetails {
	#[serde(default)]
	pub reasoning_tokens: u64,
}

impl Usage {
	pub fn to_usage(&self) -> attempt::Usage {
		attempt::Usage {
			prompt_tokens: self.input_tokens,
			completion_tokens: self.output_tokens,
			cached_prompt_tokens: self
				.input_tokens_details
				.as_ref()
				.map(|d| d.cached_tokens)
				.unwrap_or_default(),
			reasoning_tokens: self
				.output_tokens_details
				.as_ref()
				.map(|d| d.reasoning_tokens)
				.unwrap_or_default(),
			..Default::default()
		}
	}
}

// ---- streaming ----

/// Responses API stream events. Only the events the gateway must understand
/// are typed; unrecognized events pass through via `Other`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
	#[serde(rename = "response.created")]
	Created { response: Response },
	#[serde(rename = "response.output_item.added")]
	OutputItemAdded { output_index: u64, item: OutputItem },
	#[serde(rename = "response.output_text.delta")]
	OutputTextDelta {
		item_id: String,
		output_index: u64,
		content_index: u64,
		delta: String,
	},
	#[serde(rename = "response.output_text.done")]
	OutputTextDone {
		item_id: String,
		output_index: u64,
		content_index: u64,
		text: String,
	},
	#[serde(rename = "response.output_item.done")]
	OutputItemDone { output_index: u64, item: OutputItem },
	#[serde(rename = "response.completed")]
	Completed { response: Response },
	#[serde(rename = "response.failed")]
	Failed { response: Response },
	#[serde(untagged)]
	Other(Value),
}

impl StreamEvent {
	pub fn event_name(&self) -> &'static str {
		match self {
			Self::Created { .. } => "response.created",
			Self::OutputItemAdded { .. } => "response.output_item.added",
			Self::OutputTextDelta { .. } => "response.output_text.delta",
			Self::OutputTextDone { .. } => "response.output_text.done",
			Self::OutputItemDone { .. } => "response.output_item.done",
			Self::Completed { .. } => "response.completed",
			Self::Failed { .. } => "response.failed",
			Self::Other(_) => "response.other",
		}
	}
}

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
	pub code: Option<String>,
}
