use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::types::{RequestPayload, SimpleMessage};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Request {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(default)]
	pub query: String,
	#[serde(default)]
	pub documents: Vec<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_n: Option<u64>,
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
		let docs = self
			.documents
			.iter()
			.map(crate::json::to_compact_text)
			.collect::<Vec<_>>()
			.join("\n");
		vec![SimpleMessage::new("user", format!("{}\n{docs}", self.query))]
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	#[serde(default)]
	pub results: Vec<Value>,
	#[serde(flatten, default)]
	pub rest: Value,
}
