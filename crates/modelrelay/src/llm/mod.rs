use bytes::Bytes;
use http::{HeaderMap, HeaderValue, header};
use secrecy::ExposeSecret;
use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};
use url::Url;

use crate::types::{Channel, ChannelType, Credential, RelayMode};

pub mod anthropic;
pub mod azureopenai;
pub mod bedrock;
pub mod cohere;
pub mod conversion;
pub mod deepseek;
pub mod gemini;
pub mod openai;
pub mod openrouter;
pub mod types;
pub mod xai;

pub use types::{RequestPayload, SimpleMessage};

#[derive(thiserror::Error, Debug)]
pub enum AIError {
	#[error("missing field: {0}")]
	MissingField(String),
	#[error("unsupported conversion: {0}")]
	UnsupportedConversion(String),
	#[error("request was too large")]
	RequestTooLarge,
	#[error("invalid upstream url: {0}")]
	InvalidUrl(String),
	#[error("failed to sign request: {0}")]
	Signing(String),
	#[error("failed to parse request: {0}")]
	RequestParsing(serde_json::Error),
	#[error("failed to marshal request: {0}")]
	RequestMarshal(serde_json::Error),
	#[error("failed to parse response: {0}")]
	ResponseParsing(serde_json::Error),
	#[error("failed to marshal response: {0}")]
	ResponseMarshal(serde_json::Error),
}

/// The wire format a provider expects for a given relay mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFormat {
	Completions,
	Messages,
	Responses,
	/// Send the body as-is (embeddings, images, audio, rerank).
	Passthrough,
}

/// Tagged adaptor over the provider families. Selection is O(1) from the
/// channel type; all format work is dispatched through this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AIProvider {
	OpenAI,
	AzureOpenAI,
	Anthropic,
	Gemini,
	Bedrock,
	Xai,
	DeepSeek,
	OpenRouter,
	Cohere,
	Compatible,
}

impl From<ChannelType> for AIProvider {
	fn from(t: ChannelType) -> Self {
		match t {
			ChannelType::OpenAI => AIProvider::OpenAI,
			ChannelType::AzureOpenAI => AIProvider::AzureOpenAI,
			ChannelType::Anthropic => AIProvider::Anthropic,
			ChannelType::Gemini => AIProvider::Gemini,
			ChannelType::Bedrock => AIProvider::Bedrock,
			ChannelType::Xai => AIProvider::Xai,
			ChannelType::DeepSeek => AIProvider::DeepSeek,
			ChannelType::OpenRouter => AIProvider::OpenRouter,
			ChannelType::Cohere => AIProvider::Cohere,
			ChannelType::OpenAICompatible => AIProvider::Compatible,
		}
	}
}

impl AIProvider {
	pub fn name(&self) -> &'static str {
		match self {
			AIProvider::OpenAI => openai::NAME,
			AIProvider::AzureOpenAI => azureopenai::NAME,
			AIProvider::Anthropic => anthropic::NAME,
			AIProvider::Gemini => gemini::NAME,
			AIProvider::Bedrock => bedrock::NAME,
			AIProvider::Xai => xai::NAME,
			AIProvider::DeepSeek => deepseek::NAME,
			AIProvider::OpenRouter => openrouter::NAME,
			AIProvider::Cohere => cohere::NAME,
			AIProvider::Compatible => "openai.compatible",
		}
	}

	/// Which format the outbound body must be translated into.
	pub fn upstream_format(&self, mode: RelayMode) -> Result<UpstreamFormat, AIError> {
		use RelayMode::*;
		let unsupported =
			|| AIError::UnsupportedConversion(format!("{mode:?} is not supported by {}", self.name()));
		Ok(match (self, mode) {
			(AIProvider::Anthropic | AIProvider::Bedrock, Chat | Messages | Responses) => {
				UpstreamFormat::Messages
			},
			(AIProvider::Anthropic | AIProvider::Bedrock, _) => return Err(unsupported()),

			(AIProvider::OpenAI | AIProvider::AzureOpenAI, Responses) => UpstreamFormat::Responses,
			(AIProvider::Xai, Responses) => UpstreamFormat::Responses,
			(AIProvider::OpenAI | AIProvider::AzureOpenAI, Chat | Messages) => {
				UpstreamFormat::Completions
			},
			(AIProvider::OpenAI | AIProvider::AzureOpenAI, _) => UpstreamFormat::Passthrough,

			(AIProvider::Xai, Chat | Messages) => UpstreamFormat::Completions,
			(AIProvider::Xai, ImagesGenerations) => UpstreamFormat::Passthrough,
			(AIProvider::Xai, _) => return Err(unsupported()),

			(AIProvider::Gemini, Chat | Messages | Responses) => UpstreamFormat::Completions,
			(AIProvider::Gemini, Embeddings) => UpstreamFormat::Passthrough,
			(AIProvider::Gemini, _) => return Err(unsupported()),

			(AIProvider::DeepSeek, Chat | Messages | Responses) => UpstreamFormat::Completions,
			(AIProvider::DeepSeek, _) => return Err(unsupported()),

			(AIProvider::Cohere, Rerank | Embeddings) => UpstreamFormat::Passthrough,
			(AIProvider::Cohere, Chat | Messages | Responses) => UpstreamFormat::Completions,
			(AIProvider::Cohere, _) => return Err(unsupported()),

			(AIProvider::OpenRouter | AIProvider::Compatible, Chat | Messages | Responses) => {
				UpstreamFormat::Completions
			},
			(AIProvider::OpenRouter | AIProvider::Compatible, _) => UpstreamFormat::Passthrough,
		})
	}

	/// Resolve the full upstream URL for an attempt.
	pub fn build_url(
		&self,
		channel: &Channel,
		mode: RelayMode,
		upstream_model: &str,
		streaming: bool,
	) -> Result<String, AIError> {
		match self {
			AIProvider::Bedrock => {
				let Credential::Aws { region, .. } = &channel.credential else {
					return Err(AIError::MissingField(
						"bedrock channels require aws credentials".into(),
					));
				};
				Ok(format!(
					"https://{}{}",
					bedrock::host(region),
					bedrock::path(upstream_model, streaming)
				))
			},
			AIProvider::AzureOpenAI => {
				let base = channel.base_url.as_deref().ok_or_else(|| {
					AIError::MissingField("azure channels require a base url".into())
				})?;
				let Credential::Azure { api_version, .. } = &channel.credential else {
					return Err(AIError::MissingField(
						"azure channels require azure credentials".into(),
					));
				};
				Ok(format!(
					"{}{}",
					base.trim_end_matches('/'),
					azureopenai::path_for_model(api_version, mode, upstream_model)
				))
			},
			_ => {
				let default_host = match self {
					AIProvider::OpenAI => openai::DEFAULT_HOST,
					AIProvider::Anthropic => anthropic::DEFAULT_HOST,
					AIProvider::Gemini => gemini::DEFAULT_HOST,
					AIProvider::Xai => xai::DEFAULT_HOST,
					AIProvider::DeepSeek => deepseek::DEFAULT_HOST,
					AIProvider::OpenRouter => openrouter::DEFAULT_HOST,
					AIProvider::Cohere => cohere::DEFAULT_HOST,
					AIProvider::Compatible => {
						return compatible_url(channel, mode);
					},
					AIProvider::Bedrock | AIProvider::AzureOpenAI => unreachable!("handled above"),
				};
				let base = match &channel.base_url {
					Some(b) => b.trim_end_matches('/').to_string(),
					None => format!("https://{default_host}"),
				};
				let path = match self {
					AIProvider::Anthropic => anthropic::DEFAULT_PATH.to_string(),
					AIProvider::Gemini => gemini::path(mode).to_string(),
					AIProvider::Xai => xai::path(mode).to_string(),
					AIProvider::DeepSeek => deepseek::DEFAULT_PATH.to_string(),
					AIProvider::OpenRouter => openrouter::DEFAULT_PATH.to_string(),
					AIProvider::Cohere => cohere::path(mode).to_string(),
					_ => openai::path(mode).to_string(),
				};
				Ok(format!("{base}{path}"))
			},
		}
	}

	/// Attach provider auth headers. Bedrock signs at dispatch time instead
	/// (the signature covers the final body).
	pub fn build_headers(&self, channel: &Channel, headers: &mut HeaderMap) -> Result<(), AIError> {
		let bearer = |headers: &mut HeaderMap, key: &Credential| -> Result<(), AIError> {
			let Credential::Key { key } = key else {
				return Err(AIError::MissingField("channel requires an api key".into()));
			};
			let mut value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
				.map_err(|_| AIError::MissingField("api key is not a valid header value".into()))?;
			value.set_sensitive(true);
			headers.insert(header::AUTHORIZATION, value);
			Ok(())
		};
		match self {
			AIProvider::Anthropic => {
				let Credential::Key { key } = &channel.credential else {
					return Err(AIError::MissingField("channel requires an api key".into()));
				};
				let mut api_key = HeaderValue::from_str(key.expose_secret())
					.map_err(|_| AIError::MissingField("api key is not a valid header value".into()))?;
				api_key.set_sensitive(true);
				headers.remove(header::AUTHORIZATION);
				headers.insert("x-api-key", api_key);
				headers.insert("anthropic-version", HeaderValue::from_static(anthropic::VERSION));
				Ok(())
			},
			AIProvider::AzureOpenAI => {
				let Credential::Azure { key, .. } = &channel.credential else {
					return Err(AIError::MissingField(
						"azure channels require azure credentials".into(),
					));
				};
				let mut api_key = HeaderValue::from_str(key.expose_secret())
					.map_err(|_| AIError::MissingField("api key is not a valid header value".into()))?;
				api_key.set_sensitive(true);
				headers.insert("api-key", api_key);
				Ok(())
			},
			AIProvider::Bedrock => Ok(()),
			_ => bearer(headers, &channel.credential),
		}
	}

	pub fn supports_reasoning(&self, model: &str) -> bool {
		match self {
			AIProvider::OpenAI | AIProvider::AzureOpenAI => openai::supports_reasoning(model),
			AIProvider::Anthropic => anthropic::supports_reasoning(model),
			AIProvider::Bedrock => bedrock::supports_reasoning(model),
			AIProvider::Gemini => gemini::supports_reasoning(model),
			AIProvider::Xai => xai::supports_reasoning(model),
			AIProvider::DeepSeek => deepseek::supports_reasoning(model),
			AIProvider::OpenRouter => openrouter::supports_reasoning(model),
			AIProvider::Cohere | AIProvider::Compatible => false,
		}
	}
}

fn compatible_url(channel: &Channel, mode: RelayMode) -> Result<String, AIError> {
	let base = channel
		.base_url
		.as_deref()
		.ok_or_else(|| AIError::MissingField("openai-compatible channels require a base url".into()))?;
	let parsed = Url::parse(base).map_err(|e| AIError::InvalidUrl(e.to_string()))?;
	let path = openai::path(mode);
	if parsed.host_str() == Some(openai::GITHUB_MODELS_HOST) {
		let rewritten = openai::github_models_path(parsed.path(), path);
		let host = parsed.host_str().unwrap_or_default();
		return Ok(format!("{}://{host}{rewritten}", parsed.scheme()));
	}
	Ok(format!("{}{}", base.trim_end_matches('/'), path))
}

/// The inbound request body, parsed by relay mode. Chat/Responses/Messages
/// are typed; the passthrough modes keep their payloads opaque except for
/// the fields the gateway reads.
#[derive(Debug, Clone)]
pub enum Payload {
	Chat(types::completions::Request),
	Responses(types::responses::Request),
	Messages(types::messages::Request),
	Embeddings(types::embeddings::Request),
	Images(types::images::Request),
	Rerank(types::rerank::Request),
	/// Multipart and binary bodies (audio) relay verbatim.
	Raw { model: String, body: Bytes },
}

impl Payload {
	pub fn parse(mode: RelayMode, bytes: &Bytes) -> Result<Payload, AIError> {
		let p = match mode {
			RelayMode::Chat => Payload::Chat(from_slice(bytes)?),
			RelayMode::Responses => Payload::Responses(from_slice(bytes)?),
			RelayMode::Messages => Payload::Messages(from_slice(bytes)?),
			RelayMode::Embeddings => Payload::Embeddings(from_slice(bytes)?),
			RelayMode::ImagesGenerations | RelayMode::ImagesEdits => {
				Payload::Images(from_slice(bytes)?)
			},
			RelayMode::Rerank => Payload::Rerank(from_slice(bytes)?),
			RelayMode::AudioSpeech | RelayMode::AudioTranscription | RelayMode::AudioTranslation => {
				Payload::Raw {
					model: String::new(),
					body: bytes.clone(),
				}
			},
		};
		Ok(p)
	}

	pub fn model_name(&self) -> Option<&str> {
		match self {
			Payload::Chat(r) => r.model_name(),
			Payload::Responses(r) => r.model_name(),
			Payload::Messages(r) => r.model_name(),
			Payload::Embeddings(r) => r.model_name(),
			Payload::Images(r) => r.model_name(),
			Payload::Rerank(r) => r.model_name(),
			Payload::Raw { model, .. } => (!model.is_empty()).then_some(model.as_str()),
		}
	}

	pub fn set_model(&mut self, model: &str) {
		match self {
			Payload::Chat(r) => *r.model() = Some(model.to_string()),
			Payload::Responses(r) => *r.model() = Some(model.to_string()),
			Payload::Messages(r) => *r.model() = Some(model.to_string()),
			Payload::Embeddings(r) => *r.model() = Some(model.to_string()),
			Payload::Images(r) => *r.model() = Some(model.to_string()),
			Payload::Rerank(r) => *r.model() = Some(model.to_string()),
			Payload::Raw { model: m, .. } => *m = model.to_string(),
		}
	}

	pub fn streaming(&self) -> bool {
		match self {
			Payload::Chat(r) => r.streaming(),
			Payload::Responses(r) => r.streaming(),
			Payload::Messages(r) => r.streaming(),
			_ => false,
		}
	}

	pub fn prompt_messages(&self) -> Vec<SimpleMessage> {
		match self {
			Payload::Chat(r) => r.prompt_messages(),
			Payload::Responses(r) => r.prompt_messages(),
			Payload::Messages(r) => r.prompt_messages(),
			Payload::Embeddings(r) => r.prompt_messages(),
			Payload::Images(r) => r.prompt_messages(),
			Payload::Rerank(r) => r.prompt_messages(),
			Payload::Raw { .. } => Vec::new(),
		}
	}

	/// Streaming chat requests must ask for usage or the gateway cannot
	/// meter them; we always set it.
	pub fn ensure_stream_usage(&mut self) {
		if let Payload::Chat(r) = self
			&& r.stream.unwrap_or_default()
			&& r.stream_options.is_none()
		{
			r.stream_options = Some(types::completions::StreamOptions {
				include_usage: true,
				rest: Default::default(),
			});
		}
	}

	/// Force-enable (or disable) the provider's reasoning mode where
	/// supported. Returns false when the provider has no reasoning support,
	/// in which case the parameter is silently suppressed and the caller
	/// annotates the trace.
	pub fn apply_thinking(
		&mut self,
		provider: AIProvider,
		model: &str,
		enabled: bool,
	) -> bool {
		if !provider.supports_reasoning(model) {
			if let Payload::Messages(r) = self {
				r.thinking = None;
			}
			return false;
		}
		match self {
			Payload::Messages(r) => {
				r.thinking = Some(if enabled {
					types::messages::ThinkingInput::Enabled {
						budget_tokens: 2048,
					}
				} else {
					types::messages::ThinkingInput::Disabled {}
				});
			},
			Payload::Chat(r) => {
				if enabled {
					r.reasoning_effort.get_or_insert_with(|| "medium".to_string());
				} else {
					r.reasoning_effort = None;
				}
			},
			Payload::Responses(r) => {
				if enabled {
					let reasoning = r.reasoning.get_or_insert_with(Default::default);
					reasoning.effort.get_or_insert_with(|| "medium".to_string());
				} else {
					r.reasoning = None;
				}
			},
			_ => return false,
		}
		true
	}
}

fn from_slice<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> Result<T, AIError> {
	serde_json::from_slice(bytes).map_err(AIError::RequestParsing)
}

/// Estimate prompt tokens with the model's tokenizer; unsupported models
/// fall back to a chars/4 heuristic. Shape follows the OpenAI cookbook
/// accounting: 3 tokens per message, 1 for the role, 3 to prime the reply.
pub fn estimate_prompt_tokens(model: &str, messages: &[SimpleMessage]) -> u64 {
	let tokenizer = get_tokenizer(model).unwrap_or(Tokenizer::Cl100kBase);
	if tokenizer != Tokenizer::Cl100kBase && tokenizer != Tokenizer::O200kBase {
		let chars: usize = messages.iter().map(|m| m.content.len()).sum();
		return crate::pricing::estimate_tokens_from_chars(chars) + 4 * messages.len() as u64 + 3;
	}
	let bpe = bpe_for(tokenizer);
	let tokens_per_message = 3;
	let mut num_tokens: u64 = 0;
	for message in messages {
		num_tokens += tokens_per_message;
		// Role is always 1 token
		num_tokens += 1;
		num_tokens += bpe.encode_with_special_tokens(&message.content).len() as u64;
	}
	num_tokens += 3; // every reply is primed with <|start|>assistant<|message|>
	num_tokens
}

fn bpe_for<'a>(tokenizer: Tokenizer) -> &'a CoreBPE {
	match tokenizer {
		Tokenizer::O200kBase | Tokenizer::O200kHarmony => tiktoken_rs::o200k_base_singleton(),
		_ => tiktoken_rs::cl100k_base_singleton(),
	}
}

/// Tokenizers take ~200ms to load lazily; warm them outside the request path.
pub fn preload_tokenizers() {
	let _ = tiktoken_rs::cl100k_base_singleton();
	let _ = tiktoken_rs::o200k_base_singleton();
}

#[cfg(test)]
#[path = "llm_tests.rs"]
mod tests;
