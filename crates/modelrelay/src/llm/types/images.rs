use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::types::{RequestPayload, SimpleMessage};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Request {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub prompt: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub n: Option<u64>,
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
		vec![SimpleMessage::new(
			"user",
			self.prompt.clone().unwrap_or_default(),
		)]
	}
}

/// Image responses pass through; the gateway only counts generated images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	#[serde(default)]
	pub data: Vec<Value>,
	#[serde(flatten, default)]
	pub rest: Value,
}

impl Response {
	pub fn image_count(&self) -> u64 {
		self.data.len() as u64
	}
}
