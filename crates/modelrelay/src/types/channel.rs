use std::collections::HashMap;

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::pricing::ModelPrice;

pub type ChannelId = i64;

/// Which provider family the channel speaks. OpenAICompatible covers any
/// endpoint that implements the OpenAI wire protocol at a custom base URL
/// (together with the named compatibles below, which carry their own hosts
/// and quirks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelType {
	OpenAI,
	AzureOpenAI,
	Anthropic,
	Gemini,
	Bedrock,
	Xai,
	DeepSeek,
	OpenRouter,
	Cohere,
	OpenAICompatible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ChannelStatus {
	#[default]
	Enabled,
	ManuallyDisabled,
	AutoDisabled,
}

/// Channel credentials. The shape depends on the provider family; key
/// material is wrapped so Debug/Serialize never print it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Credential {
	Key {
		key: SecretString,
	},
	Aws {
		access_key_id: String,
		secret_access_key: SecretString,
		region: String,
	},
	Azure {
		key: SecretString,
		api_version: String,
	},
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Channel {
	pub id: ChannelId,
	#[serde(rename = "type")]
	pub channel_type: ChannelType,
	pub name: String,
	pub credential: Credential,
	/// Base URL override. Required for OpenAICompatible and AzureOpenAI,
	/// optional elsewhere (the provider default host is used).
	#[serde(default)]
	pub base_url: Option<String>,
	/// Models this channel may serve. A channel with an empty list is never
	/// selected.
	#[serde(default)]
	pub models: Vec<String>,
	/// User groups this channel serves.
	#[serde(default = "default_groups")]
	pub groups: Vec<String>,
	/// Request model name -> upstream model name.
	#[serde(default)]
	pub model_mapping: IndexMap<String, String>,
	/// Per-model pricing overrides, taking precedence over the global table.
	#[serde(default)]
	pub model_overrides: HashMap<String, ModelPrice>,
	#[serde(default)]
	pub priority: i64,
	#[serde(default = "default_weight")]
	pub weight: i64,
	/// Requests per minute cap for this channel; off when absent.
	#[serde(default)]
	pub rate_limit_rpm: Option<u32>,
	#[serde(default)]
	pub status: ChannelStatus,
	/// Model used by the health probe; defaults to the first declared model.
	#[serde(default)]
	pub test_model: Option<String>,
}

fn default_groups() -> Vec<String> {
	vec!["default".to_string()]
}

fn default_weight() -> i64 {
	1
}

impl Channel {
	pub fn is_enabled(&self) -> bool {
		self.status == ChannelStatus::Enabled
	}

	/// All model names this channel can answer for: declared models plus any
	/// name that maps or overrides to something.
	pub fn routable_models(&self) -> Vec<&str> {
		let mut out: Vec<&str> = self.models.iter().map(String::as_str).collect();
		for m in self.model_mapping.keys().map(String::as_str) {
			if !out.contains(&m) {
				out.push(m);
			}
		}
		for m in self.model_overrides.keys().map(String::as_str) {
			if !out.contains(&m) {
				out.push(m);
			}
		}
		out
	}

	/// Apply the channel-level model mapping. Mapping entries with an empty
	/// target are treated as absent.
	pub fn upstream_model<'a>(&'a self, request_model: &'a str) -> &'a str {
		match self.model_mapping.get(request_model) {
			Some(target) if !target.is_empty() => target,
			_ => request_model,
		}
	}

	pub fn probe_model(&self) -> Option<&str> {
		self
			.test_model
			.as_deref()
			.or_else(|| self.models.first().map(String::as_str))
	}

	/// Whether structured-output promotion (single forced JSON-schema tool ->
	/// response_format) may be applied when dispatching to this channel.
	pub fn structured_promotion_allowed(&self, upstream_model: &str) -> bool {
		match self.channel_type {
			ChannelType::DeepSeek => false,
			ChannelType::AzureOpenAI if upstream_model.starts_with("gpt-5") => false,
			ChannelType::OpenAICompatible if upstream_model.contains("deepseek") => false,
			_ => true,
		}
	}
}
