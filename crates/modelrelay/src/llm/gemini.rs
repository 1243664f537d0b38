use crate::types::RelayMode;

pub const NAME: &str = "gcp.gemini";
pub const DEFAULT_HOST: &str = "generativelanguage.googleapis.com";

/// Gemini is dispatched through its OpenAI-compatibility surface.
pub fn path(mode: RelayMode) -> &'static str {
	match mode {
		RelayMode::Embeddings => "/v1beta/openai/embeddings",
		_ => "/v1beta/openai/chat/completions",
	}
}

pub fn supports_reasoning(model: &str) -> bool {
	model.starts_with("gemini-2.5")
}
