use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::attempt::Usage;

/// Quota is an integer in "quota units"; by default one USD buys 500k units.
pub const DEFAULT_QUOTA_PER_USD: i64 = 500_000;

/// Declarative per-model pricing. `ratio` and `cached_input_ratio` are quota
/// units per prompt token; `completion_ratio` is the output multiplier on the
/// input cost. Tool pricing and image pricing are USD per call / per image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelPrice {
	pub ratio: f64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cached_input_ratio: Option<f64>,
	pub completion_ratio: f64,
	/// Hint only; not enforced by the gateway.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image_price_usd: Option<f64>,
	/// When present, only these tools may be invoked through this model.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_whitelist: Option<Vec<String>>,
	/// USD per tool invocation, keyed by tool name.
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub tool_pricing: HashMap<String, f64>,
}

impl ModelPrice {
	pub fn cached_ratio(&self) -> f64 {
		self.cached_input_ratio.unwrap_or(self.ratio)
	}
}

/// The global model price table, resolved once at startup for the configured
/// quota unit. Channel-level overrides take precedence at lookup time.
#[derive(Debug, Clone)]
pub struct PriceTable {
	pub quota_per_usd: i64,
	models: HashMap<String, ModelPrice>,
	fallback: ModelPrice,
}

/// Banker's rounding (round half to even) to integer quota units.
pub fn round_half_even(x: f64) -> i64 {
	let floor = x.floor();
	let frac = x - floor;
	let floor_i = floor as i64;
	if frac > 0.5 {
		floor_i + 1
	} else if frac < 0.5 {
		floor_i
	} else if floor_i % 2 == 0 {
		floor_i
	} else {
		floor_i + 1
	}
}

impl PriceTable {
	pub fn new(quota_per_usd: i64) -> Self {
		let unit = quota_per_usd as f64;
		// usd per million tokens -> quota units per token
		let per_m = |usd: f64| usd * unit / 1_000_000.0;
		let mut models = HashMap::new();
		let mut add = |name: &str,
		               input_usd_m: f64,
		               cached_usd_m: Option<f64>,
		               output_usd_m: f64,
		               max_tokens: Option<u64>| {
			models.insert(
				name.to_string(),
				ModelPrice {
					ratio: per_m(input_usd_m),
					cached_input_ratio: cached_usd_m.map(per_m),
					completion_ratio: if input_usd_m > 0.0 {
						output_usd_m / input_usd_m
					} else {
						0.0
					},
					max_tokens,
					image_price_usd: None,
					tool_whitelist: None,
					tool_pricing: HashMap::new(),
				},
			);
		};

		// OpenAI
		add("gpt-4o", 2.5, Some(1.25), 10.0, Some(16_384));
		add("gpt-4o-mini", 0.15, Some(0.075), 0.6, Some(16_384));
		add("gpt-4.1", 2.0, Some(0.5), 8.0, Some(32_768));
		add("gpt-4.1-mini", 0.4, Some(0.1), 1.6, Some(32_768));
		add("gpt-4.1-nano", 0.1, Some(0.025), 0.4, Some(32_768));
		add("gpt-5", 1.25, Some(0.125), 10.0, Some(128_000));
		add("gpt-5-mini", 0.25, Some(0.025), 2.0, Some(128_000));
		add("gpt-5-nano", 0.05, Some(0.005), 0.4, Some(128_000));
		add("o3", 2.0, Some(0.5), 8.0, Some(100_000));
		add("o4-mini", 1.1, Some(0.275), 4.4, Some(100_000));
		add("text-embedding-3-small", 0.02, None, 0.0, None);
		add("text-embedding-3-large", 0.13, None, 0.0, None);
		// Anthropic
		add("claude-3-5-haiku", 0.8, Some(0.08), 4.0, Some(8_192));
		add("claude-3-7-sonnet", 3.0, Some(0.3), 15.0, Some(64_000));
		add("claude-sonnet-4", 3.0, Some(0.3), 15.0, Some(64_000));
		add("claude-opus-4", 15.0, Some(1.5), 75.0, Some(32_000));
		// Gemini
		add("gemini-2.0-flash", 0.1, Some(0.025), 0.4, Some(8_192));
		add("gemini-2.5-flash", 0.3, Some(0.075), 2.5, Some(65_536));
		add("gemini-2.5-pro", 1.25, Some(0.31), 10.0, Some(65_536));
		// DeepSeek
		add("deepseek-chat", 0.27, Some(0.07), 1.1, Some(8_192));
		add("deepseek-reasoner", 0.55, Some(0.14), 2.19, Some(65_536));
		// xAI
		add("grok-3", 3.0, Some(0.75), 15.0, Some(131_072));
		add("grok-3-mini", 0.3, Some(0.075), 0.5, Some(131_072));
		add("grok-4", 3.0, Some(0.75), 15.0, Some(256_000));

		// Image generation bills per image, not per token.
		models.insert(
			"dall-e-3".to_string(),
			ModelPrice {
				ratio: 0.0,
				cached_input_ratio: None,
				completion_ratio: 0.0,
				max_tokens: None,
				image_price_usd: Some(0.04),
				tool_whitelist: None,
				tool_pricing: HashMap::new(),
			},
		);
		models.insert(
			"gpt-image-1".to_string(),
			ModelPrice {
				ratio: per_m(5.0),
				cached_input_ratio: Some(per_m(1.25)),
				completion_ratio: 0.0,
				max_tokens: None,
				image_price_usd: Some(0.042),
				tool_whitelist: None,
				tool_pricing: HashMap::new(),
			},
		);
		// Rerank bills per search call.
		models.insert(
			"rerank-v3.5".to_string(),
			ModelPrice {
				ratio: 0.0,
				cached_input_ratio: None,
				completion_ratio: 0.0,
				max_tokens: None,
				image_price_usd: None,
				tool_whitelist: None,
				tool_pricing: HashMap::from([("rerank".to_string(), 0.002)]),
			},
		);

		let fallback = ModelPrice {
			ratio: per_m(2.5),
			cached_input_ratio: None,
			completion_ratio: 4.0,
			max_tokens: None,
			image_price_usd: None,
			tool_whitelist: None,
			tool_pricing: HashMap::new(),
		};
		Self {
			quota_per_usd,
			models,
			fallback,
		}
	}

	/// Resolve pricing for a model: channel override, exact name, name with
	/// a trailing date/tag suffix stripped, then the longest declared prefix.
	pub fn resolve<'a>(
		&'a self,
		model: &str,
		overrides: &'a HashMap<String, ModelPrice>,
	) -> &'a ModelPrice {
		if let Some(p) = overrides.get(model) {
			return p;
		}
		if let Some(p) = self.models.get(model) {
			return p;
		}
		if let Some(base) = strip_version_suffix(model)
			&& let Some(p) = self.models.get(base)
		{
			return p;
		}
		self
			.models
			.iter()
			.filter(|(name, _)| model.starts_with(name.as_str()))
			.max_by_key(|(name, _)| name.len())
			.map(|(_, p)| p)
			.unwrap_or(&self.fallback)
	}

	/// The actual cost of a finished attempt, in quota units.
	pub fn cost(&self, price: &ModelPrice, usage: &Usage) -> i64 {
		let billable_prompt = usage.prompt_tokens.saturating_sub(usage.cached_prompt_tokens);
		let mut cost = billable_prompt as f64 * price.ratio
			+ usage.cached_prompt_tokens as f64 * price.cached_ratio()
			+ (usage.completion_tokens + usage.reasoning_tokens) as f64
				* price.ratio
				* price.completion_ratio;
		// Anthropic cache writes bill at a premium over the input ratio.
		cost += usage.cache_write_5m_tokens as f64 * price.ratio * 1.25;
		cost += usage.cache_write_1h_tokens as f64 * price.ratio * 2.0;
		for (tool, count) in &usage.tool_calls {
			if let Some(per_call) = price.tool_pricing.get(tool) {
				cost += *count as f64 * per_call * self.quota_per_usd as f64;
			}
		}
		if let Some(per_image) = price.image_price_usd {
			cost += usage.images_out as f64 * per_image * self.quota_per_usd as f64;
		}
		round_half_even(cost).max(0)
	}

	/// The pre-reservation estimate: prompt estimate priced at input ratio,
	/// inflated by the completion ratio, plus the configured padding for
	/// background modes. Rounded up so reservations always cover the cost of
	/// an accurate estimate.
	pub fn estimate(&self, price: &ModelPrice, prompt_tokens: u64, padding: i64) -> i64 {
		let est = prompt_tokens as f64 * price.ratio * (1.0 + price.completion_ratio);
		(est.ceil() as i64 + padding).max(1)
	}
}

fn strip_version_suffix(model: &str) -> Option<&str> {
	// "gpt-4o-2024-11-20" -> "gpt-4o", "claude-sonnet-4-20250514" -> "claude-sonnet-4"
	let mut cut = None;
	for (idx, _) in model.match_indices('-') {
		let rest = &model[idx + 1..];
		if rest.len() >= 4 && rest.chars().take(4).all(|c| c.is_ascii_digit()) {
			cut = Some(idx);
			break;
		}
	}
	// "gpt-4o:beta" -> "gpt-4o"
	let cut = cut.or_else(|| model.find(':'));
	cut.map(|i| &model[..i]).filter(|s| !s.is_empty())
}

/// Rough completion-token estimator used only when the provider reports no
/// usage and enforcement is off.
pub fn estimate_tokens_from_chars(chars: usize) -> u64 {
	(chars as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	fn table() -> PriceTable {
		PriceTable::new(DEFAULT_QUOTA_PER_USD)
	}

	#[rstest]
	#[case(2.5, 2)]
	#[case(3.5, 4)]
	#[case(2.4, 2)]
	#[case(2.6, 3)]
	#[case(-0.5, 0)]
	#[case(0.0, 0)]
	#[case(0.5, 0)]
	#[case(1.5, 2)]
	fn bankers_rounding_ties_go_to_even(#[case] input: f64, #[case] want: i64) {
		assert_eq!(round_half_even(input), want);
	}

	#[test]
	fn cost_formula_matches_hand_computation() {
		let t = table();
		let overrides = HashMap::new();
		let p = t.resolve("gpt-4o-mini", &overrides);
		// $0.15/M input => 0.075 units per token at the default unit
		assert!((p.ratio - 0.075).abs() < 1e-9);
		let usage = Usage {
			prompt_tokens: 1000,
			cached_prompt_tokens: 200,
			completion_tokens: 500,
			..Default::default()
		};
		// 800 * 0.075 + 200 * 0.0375 + 500 * 0.075 * 4.0
		let want = round_half_even(800.0 * 0.075 + 200.0 * 0.0375 + 500.0 * 0.3);
		assert_eq!(t.cost(p, &usage), want);
	}

	#[test]
	fn image_and_tool_pricing() {
		let t = table();
		let overrides = HashMap::new();
		let p = t.resolve("dall-e-3", &overrides);
		let usage = Usage {
			images_out: 2,
			..Default::default()
		};
		assert_eq!(t.cost(p, &usage), round_half_even(2.0 * 0.04 * 500_000.0));

		let p = t.resolve("rerank-v3.5", &overrides);
		let usage = Usage {
			tool_calls: HashMap::from([("rerank".to_string(), 1)]),
			..Default::default()
		};
		assert_eq!(t.cost(p, &usage), 1000);
	}

	#[test]
	fn resolve_prefers_override_then_suffix_then_prefix() {
		let t = table();
		let mut overrides = HashMap::new();
		overrides.insert(
			"gpt-4o-mini".to_string(),
			ModelPrice {
				ratio: 1.0,
				cached_input_ratio: None,
				completion_ratio: 1.0,
				max_tokens: None,
				image_price_usd: None,
				tool_whitelist: None,
				tool_pricing: HashMap::new(),
			},
		);
		assert_eq!(t.resolve("gpt-4o-mini", &overrides).ratio, 1.0);

		let empty = HashMap::new();
		let dated = t.resolve("gpt-4o-2024-11-20", &empty);
		let exact = t.resolve("gpt-4o", &empty);
		assert_eq!(dated, exact);

		let prefixed = t.resolve("claude-sonnet-4-5", &empty);
		assert_eq!(prefixed, t.resolve("claude-sonnet-4", &empty));
	}

	#[test]
	fn estimate_covers_cost_of_accurate_prompt() {
		let t = table();
		let overrides = HashMap::new();
		let p = t.resolve("gpt-4o-mini", &overrides);
		let est = t.estimate(p, 1000, 0);
		let usage = Usage {
			prompt_tokens: 1000,
			completion_tokens: 1000,
			..Default::default()
		};
		assert!(est >= t.cost(p, &usage));
	}

	#[test]
	fn version_suffix_stripping() {
		assert_eq!(strip_version_suffix("gpt-4o-2024-11-20"), Some("gpt-4o"));
		assert_eq!(
			strip_version_suffix("claude-sonnet-4-20250514"),
			Some("claude-sonnet-4")
		);
		assert_eq!(strip_version_suffix("gpt-4o:beta"), Some("gpt-4o"));
		assert_eq!(strip_version_suffix("plain"), None);
	}
}
