pub const NAME: &str = "deepseek";
pub const DEFAULT_HOST: &str = "api.deepseek.com";
pub const DEFAULT_PATH: &str = "/chat/completions";

pub fn supports_reasoning(model: &str) -> bool {
	model == "deepseek-reasoner" || model.contains("deepseek-r1")
}
