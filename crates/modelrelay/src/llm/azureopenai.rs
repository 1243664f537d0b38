use crate::types::RelayMode;

pub const NAME: &str = "azure.openai";

/// Azure addresses deployments, not models, and deployment names cannot
/// contain dots.
pub fn deployment_name(model: &str) -> String {
	model.replace('.', "")
}

pub fn path_for_model(api_version: &str, mode: RelayMode, model: &str) -> String {
	let t = match mode {
		RelayMode::Embeddings => "embeddings",
		RelayMode::Responses => "responses",
		RelayMode::ImagesGenerations => "images/generations",
		_ => "chat/completions",
	};
	if api_version == "v1" {
		format!("/openai/v1/{t}")
	} else {
		format!(
			"/openai/deployments/{}/{t}?api-version={}",
			deployment_name(model),
			api_version
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn deployment_paths_strip_dots() {
		assert_eq!(
			path_for_model("2024-10-21", RelayMode::Chat, "gpt-4.1-mini"),
			"/openai/deployments/gpt-41-mini/chat/completions?api-version=2024-10-21"
		);
		assert_eq!(
			path_for_model("v1", RelayMode::Chat, "gpt-4.1-mini"),
			"/openai/v1/chat/completions"
		);
	}
}
