use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::types::{RequestPayload, SimpleMessage};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Request {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	pub input: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub encoding_format: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub dimensions: Option<u64>,
	#[serde(flatten, default)]
	pub rest: Value,
}

impl RequestPayload for Request {
	fn model(&mut self) -> &mut Option<String> {
		&mut self.model
	}

	fn model_name(&self) -> Option<&str> {
		self.model.as_deref()
	}

	fn streaming(&self) -> bool {
		false
	}

	fn prompt_messages(&self) -> Vec<SimpleMessage> {
		let text = match &self.input {
			Value::String(s) => s.clone(),
			Value::Array(items) => items
				.iter()
				.filter_map(Value::as_str)
				.collect::<Vec<_>>()
				.join("\n"),
			_ => String::new(),
		};
		vec![SimpleMessage::new("user", text)]
	}
}

/// Embeddings responses pass through unmodified; only usage is read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage: Option<super::completions::Usage>,
	#[serde(flatten, default)]
	pub rest: Value,
}
