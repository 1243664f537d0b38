pub mod completions;
pub mod messages;
pub mod responses;

use std::time::Instant;

use crate::llm::types::completions::{ResponseMessage, StreamDelta, take_reasoning};
use crate::types::ReasoningFormat;
use crate::types::attempt::Usage;

/// What stream conversions learn about a response while it flows; consumed
/// by the pipeline after the stream terminates to bill and log.
#[derive(Debug, Default, Clone)]
pub struct ResponseInfo {
	pub usage: Usage,
	pub provider_model: Option<String>,
	pub finish_reason: Option<String>,
	/// Characters of completion text seen; feeds the estimator when the
	/// provider never reports usage.
	pub completion_chars: usize,
	pub saw_usage: bool,
	pub first_token: Option<Instant>,
}

impl ResponseInfo {
	pub fn merge_usage(&mut self, usage: &Usage) {
		self.usage.merge_cumulative(usage);
		self.saw_usage = true;
	}
}

/// Surface reasoning text under the key the client asked for; exactly one of
/// the three candidate keys is populated on egress.
pub fn normalize_reasoning_delta(delta: &mut StreamDelta, format: ReasoningFormat) {
	let Some(text) = take_reasoning(delta) else {
		return;
	};
	match format {
		ReasoningFormat::ReasoningContent => delta.reasoning_content = Some(text),
		ReasoningFormat::Reasoning => delta.reasoning = Some(text),
		ReasoningFormat::Thinking => delta.thinking = Some(text),
	}
}

pub fn set_reasoning_message(
	message: &mut ResponseMessage,
	format: ReasoningFormat,
	text: Option<String>,
) {
	message.reasoning_content = None;
	message.reasoning = None;
	message.thinking = None;
	let Some(text) = text else { return };
	match format {
		ReasoningFormat::ReasoningContent => message.reasoning_content = Some(text),
		ReasoningFormat::Reasoning => message.reasoning = Some(text),
		ReasoningFormat::Thinking => message.thinking = Some(text),
	}
}

pub fn normalize_reasoning_message(message: &mut ResponseMessage, format: ReasoningFormat) {
	let text = message
		.reasoning_content
		.take()
		.or_else(|| message.reasoning.take())
		.or_else(|| message.thinking.take());
	set_reasoning_message(message, format, text);
}

#[cfg(test)]
#[path = "conversion_tests.rs"]
mod tests;
