pub const NAME: &str = "anthropic";
pub const DEFAULT_HOST: &str = "api.anthropic.com";
pub const DEFAULT_PATH: &str = "/v1/messages";
// https://docs.anthropic.com/en/api/versioning
pub const VERSION: &str = "2023-06-01";

/// Extended thinking is available from the 3.7 generation onward.
pub fn supports_reasoning(model: &str) -> bool {
	model.contains("claude-3-7")
		|| model.contains("claude-sonnet-4")
		|| model.contains("claude-opus-4")
		|| model.contains("claude-haiku-4")
}
