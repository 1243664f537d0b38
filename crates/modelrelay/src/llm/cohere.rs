use crate::types::RelayMode;

pub const NAME: &str = "cohere";
pub const DEFAULT_HOST: &str = "api.cohere.com";

pub fn path(mode: RelayMode) -> &'static str {
	match mode {
		RelayMode::Rerank => "/v1/rerank",
		RelayMode::Embeddings => "/compatibility/v1/embeddings",
		_ => "/compatibility/v1/chat/completions",
	}
}
