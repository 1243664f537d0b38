use crate::types::RelayMode;

pub const NAME: &str = "xai";
pub const DEFAULT_HOST: &str = "api.x.ai";

/// xAI serves the Responses API natively but not the Messages API; messages
/// traffic rewrites down to chat completions.
pub fn path(mode: RelayMode) -> &'static str {
	match mode {
		RelayMode::Responses => "/v1/responses",
		_ => "/v1/chat/completions",
	}
}

pub fn supports_reasoning(model: &str) -> bool {
	model.starts_with("grok-3-mini") || model.starts_with("grok-4")
}
