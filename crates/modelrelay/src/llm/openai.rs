use crate::types::RelayMode;

pub const NAME: &str = "openai";
pub const DEFAULT_HOST: &str = "api.openai.com";

/// Hosts that speak the OpenAI protocol under a rewritten path layout.
pub const GITHUB_MODELS_HOST: &str = "models.github.ai";

pub fn path(mode: RelayMode) -> &'static str {
	match mode {
		RelayMode::Responses => "/v1/responses",
		RelayMode::Embeddings => "/v1/embeddings",
		RelayMode::ImagesGenerations => "/v1/images/generations",
		RelayMode::ImagesEdits => "/v1/images/edits",
		RelayMode::AudioSpeech => "/v1/audio/speech",
		RelayMode::AudioTranscription => "/v1/audio/transcriptions",
		RelayMode::AudioTranslation => "/v1/audio/translations",
		RelayMode::Rerank => "/v1/rerank",
		// Chat and Messages both translate down to completions
		RelayMode::Chat | RelayMode::Messages => "/v1/chat/completions",
	}
}

/// GitHub Models serves the OpenAI surface under `/inference/...`, keeping an
/// optional `/orgs/{org}` prefix from the configured base URL.
pub fn github_models_path(base_path: &str, openai_path: &str) -> String {
	let suffix = openai_path.strip_prefix("/v1").unwrap_or(openai_path);
	let mut parts = base_path.split('/').filter(|s| !s.is_empty());
	let org_prefix = match (parts.next(), parts.next()) {
		(Some("orgs"), Some(org)) => format!("/orgs/{org}"),
		_ => String::new(),
	};
	format!("{org_prefix}/inference{suffix}")
}

/// Whether the model accepts OpenAI reasoning controls.
pub fn supports_reasoning(model: &str) -> bool {
	model.starts_with("o1")
		|| model.starts_with("o3")
		|| model.starts_with("o4")
		|| model.starts_with("gpt-5")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn github_paths_normalize_with_org_prefix() {
		assert_eq!(
			github_models_path("", "/v1/chat/completions"),
			"/inference/chat/completions"
		);
		assert_eq!(
			github_models_path("/orgs/acme", "/v1/chat/completions"),
			"/orgs/acme/inference/chat/completions"
		);
		assert_eq!(
			github_models_path("/orgs/acme/", "/v1/embeddings"),
			"/orgs/acme/inference/embeddings"
		);
	}
}
