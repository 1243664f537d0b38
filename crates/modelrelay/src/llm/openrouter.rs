pub const NAME: &str = "openrouter";
pub const DEFAULT_HOST: &str = "openrouter.ai";
pub const DEFAULT_PATH: &str = "/api/v1/chat/completions";

/// OpenRouter exposes reasoning as a generic passthrough; assume support and
/// let the upstream decide.
pub fn supports_reasoning(_model: &str) -> bool {
	true
}
