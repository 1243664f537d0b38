//! Conversions for providers that speak the Anthropic Messages wire format
//! (Anthropic itself, and Claude models on Bedrock). Submodules are named for
//! the ingress shape being served.

use std::time::Instant;

use serde_json::Value;

use crate::http::Body;
use crate::llm::AIError;
use crate::llm::conversion::ResponseInfo;
use crate::llm::types::messages;
use crate::parse;
use crate::telemetry::AsyncLog;

pub fn stop_reason_to_finish(stop: &messages::StopReason) -> &'static str {
	match stop {
		messages::StopReason::EndTurn => "stop",
		messages::StopReason::MaxTokens => "length",
		messages::StopReason::StopSequence => "stop",
		messages::StopReason::ToolUse => "tool_calls",
		messages::StopReason::Refusal => "content_filter",
		messages::StopReason::PauseTurn => "stop",
	}
}

pub fn finish_to_stop_reason(finish: &str) -> messages::StopReason {
	match finish {
		"length" => messages::StopReason::MaxTokens,
		"tool_calls" => messages::StopReason::ToolUse,
		"content_filter" => messages::StopReason::Refusal,
		_ => messages::StopReason::EndTurn,
	}
}

/// Messages ingress on a Messages provider: bytes pass through while usage
/// and completion text are observed.
pub fn passthrough_stream(body: Body, limit: usize, log: AsyncLog<ResponseInfo>) -> Body {
	let mut saw_token = false;
	parse::sse::json_passthrough::<messages::StreamEvent>(body, limit, move |f| {
		let Some(Ok(event)) = f else { return };
		match event {
			messages::StreamEvent::MessageStart { message } => {
				log.non_atomic_mutate(|r| {
					r.merge_usage(&message.usage.to_usage());
					r.provider_model = Some(message.model.clone());
				});
			},
			messages::StreamEvent::ContentBlockDelta { delta, .. } => {
				if !saw_token {
					saw_token = true;
					log.non_atomic_mutate(|r| r.first_token = Some(Instant::now()));
				}
				if let messages::ContentDelta::TextDelta { text } = &delta {
					let chars = text.len();
					log.non_atomic_mutate(|r| r.completion_chars += chars);
				}
			},
			messages::StreamEvent::MessageDelta { delta, usage } => {
				log.non_atomic_mutate(|r| {
					r.merge_usage(&usage.to_usage());
					if let Some(stop) = &delta.stop_reason {
						r.finish_reason = Some(stop_reason_to_finish(stop).to_string());
					}
				});
			},
			_ => {},
		}
	})
}

/// A Messages request body prepared for Bedrock invoke: the model and stream
/// flag move to the URL, and the Bedrock anthropic version rides inline.
pub fn prepare_bedrock(req: &messages::Request) -> Result<Vec<u8>, AIError> {
	let mut v = serde_json::to_value(req).map_err(AIError::RequestMarshal)?;
	if let Value::Object(map) = &mut v {
		map.remove("model");
		map.remove("stream");
		map.insert(
			"anthropic_version".to_string(),
			Value::String(crate::llm::bedrock::ANTHROPIC_VERSION.to_string()),
		);
	}
	serde_json::to_vec(&v).map_err(AIError::RequestMarshal)
}

pub mod from_completions {
	use std::time::Instant;

	use bytes::Bytes;
	use chrono::Utc;
	use serde_json::Value;

	use super::stop_reason_to_finish;
	use crate::http::Body;
	use crate::llm::conversion::{ResponseInfo, normalize_reasoning_delta, set_reasoning_message};
	use crate::llm::types::{completions, messages};
	use crate::llm::AIError;
	use crate::parse;
	use crate::telemetry::AsyncLog;
	use crate::types::ReasoningFormat;

	/// Translate an OpenAI completions request into a Messages request.
	pub fn translate(req: &completions::Request) -> Result<messages::Request, AIError> {
		// Anthropic keeps all system prompts in a single field; join them.
		let system = req
			.messages
			.iter()
			.filter(|m| m.role == completions::SYSTEM_ROLE || m.role == "developer")
			.map(|m| m.content_text())
			.collect::<Vec<_>>()
			.join("\n");

		let mut msgs: Vec<messages::Message> = Vec::new();
		for msg in &req.messages {
			match msg.role.as_str() {
				completions::SYSTEM_ROLE | "developer" => {},
				completions::TOOL_ROLE => {
					let block = messages::ContentBlock::Known(messages::KnownBlock::ToolResult {
						tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
						content: messages::ToolResultContent::Text(msg.content_text()),
						is_error: None,
						cache_control: None,
					});
					msgs.push(messages::Message {
						role: messages::Role::User,
						content: vec![block],
					});
				},
				completions::ASSISTANT_ROLE => {
					let mut content = Vec::new();
					let text = msg.content_text();
					if !text.is_empty() {
						content.push(messages::ContentBlock::text(text));
					}
					for call in msg.tool_calls.iter().flatten() {
						content.push(messages::ContentBlock::Known(messages::KnownBlock::ToolUse {
							id: call.id.clone(),
							name: call.function.name.clone(),
							input: serde_json::from_str(&call.function.arguments)
								.unwrap_or(Value::Object(Default::default())),
							cache_control: None,
						}));
					}
					if !content.is_empty() {
						msgs.push(messages::Message {
							role: messages::Role::Assistant,
							content,
						});
					}
				},
				_ => {
					let text = msg.content_text();
					if !text.is_empty() {
						msgs.push(messages::Message {
							role: messages::Role::User,
							content: vec![messages::ContentBlock::text(text)],
						});
					}
				},
			}
		}

		let tools = req.tools.as_ref().map(|tools| {
			tools
				.iter()
				.map(|completions::Tool::Function { function }| messages::Tool {
					name: function.name.clone(),
					description: function.description.clone(),
					input_schema: function.parameters.clone().unwrap_or_default(),
					cache_control: None,
				})
				.collect()
		});
		let tool_choice = req.tool_choice.as_ref().map(|choice| match choice {
			completions::ToolChoice::Mode(mode) => match mode.as_str() {
				"required" => messages::ToolChoice::Any,
				"none" => messages::ToolChoice::None,
				_ => messages::ToolChoice::Auto,
			},
			completions::ToolChoice::Named(named) => messages::ToolChoice::Tool {
				name: named.function.name.clone(),
			},
		});
		// Reasoning effort maps onto thinking budgets; constants follow
		// common gateway practice and Anthropic's 1024-token floor.
		let thinking = req.reasoning_effort.as_deref().and_then(|e| match e {
			"minimal" | "low" => Some(1024),
			"medium" => Some(2048),
			"high" => Some(4096),
			_ => None,
		});

		let metadata = req.user.clone().map(|user| messages::Metadata {
			fields: std::collections::HashMap::from([("user_id".to_string(), user)]),
		});

		Ok(messages::Request {
			model: req.model.clone(),
			messages: msgs,
			system: (!system.is_empty()).then_some(messages::SystemPrompt::Text(system)),
			max_tokens: Some(
				req
					.max_completion_tokens
					.or(req.max_tokens)
					.unwrap_or(4096),
			),
			stop_sequences: match &req.stop {
				Some(completions::Stop::String(s)) => vec![s.clone()],
				Some(completions::Stop::StringArray(v)) => v.clone(),
				None => Vec::new(),
			},
			stream: req.stream,
			temperature: req.temperature,
			top_p: req.top_p,
			top_k: None,
			tools,
			tool_choice,
			metadata,
			thinking: thinking.map(|budget_tokens| messages::ThinkingInput::Enabled { budget_tokens }),
			rest: Default::default(),
		})
	}

	/// Translate a Messages response into a completions response.
	pub fn translate_response(
		bytes: &Bytes,
		format: ReasoningFormat,
	) -> Result<completions::Response, AIError> {
		let resp = serde_json::from_slice::<messages::MessagesResponse>(bytes)
			.map_err(AIError::ResponseParsing)?;
		let mut content = None;
		let mut reasoning = None;
		let mut tool_calls = Vec::new();
		for block in &resp.content {
			match block {
				messages::ContentBlock::Known(messages::KnownBlock::Text { text, .. }) => {
					content = Some(text.clone());
				},
				messages::ContentBlock::Known(messages::KnownBlock::Thinking { thinking, .. }) => {
					reasoning = Some(thinking.clone());
				},
				messages::ContentBlock::Known(messages::KnownBlock::ToolUse {
					id, name, input, ..
				}) => {
					tool_calls.push(completions::ToolCall {
						id: id.clone(),
						call_type: "function".to_string(),
						function: completions::FunctionCall {
							name: name.clone(),
							arguments: serde_json::to_string(input).unwrap_or_default(),
						},
					});
				},
				messages::ContentBlock::Known(_) => {},
				// Unknown blocks round-trip as text rather than being dropped.
				messages::ContentBlock::Other(value) => {
					let rendered = crate::json::to_compact_text(value);
					content = Some(match content.take() {
						Some(existing) => format!("{existing}\n{rendered}"),
						None => rendered,
					});
				},
			}
		}
		let mut message = completions::ResponseMessage {
			role: completions::ASSISTANT_ROLE.to_string(),
			content,
			tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
			..Default::default()
		};
		set_reasoning_message(&mut message, format, reasoning);
		let usage = resp.usage.to_usage();
		Ok(completions::Response {
			id: resp.id,
			object: "chat.completion".to_string(),
			// No date in the messages response, so stamp "now"
			created: Utc::now().timestamp() as u64,
			model: resp.model,
			choices: vec![completions::Choice {
				index: 0,
				message,
				finish_reason: resp
					.stop_reason
					.as_ref()
					.map(|s| stop_reason_to_finish(s).to_string()),
				rest: Default::default(),
			}],
			usage: Some(completions::Usage {
				prompt_tokens: usage.prompt_tokens,
				completion_tokens: usage.completion_tokens,
				total_tokens: usage.prompt_tokens + usage.completion_tokens,
				prompt_tokens_details: Some(completions::PromptTokensDetails {
					cached_tokens: usage.cached_prompt_tokens,
					rest: Default::default(),
				}),
				completion_tokens_details: None,
			}),
			rest: Default::default(),
		})
	}

	/// Translate a Messages SSE stream into completions chunks.
	pub fn translate_stream(
		body: Body,
		limit: usize,
		log: AsyncLog<ResponseInfo>,
		format: ReasoningFormat,
	) -> Body {
		let mut message_id = None::<String>;
		let mut model = String::new();
		let created = Utc::now().timestamp() as u64;
		let mut input_usage = crate::types::attempt::Usage::default();
		let mut saw_token = false;
		// Maps a messages content-block index to its completions tool index.
		let mut tool_indexes: std::collections::HashMap<usize, u32> = Default::default();
		let mut next_tool_index = 0u32;
		parse::sse::json_transform::<messages::StreamEvent, completions::StreamResponse>(
			body,
			limit,
			move |f| {
				let mk = |choices: Vec<completions::StreamChoice>,
				          usage: Option<completions::Usage>,
				          message_id: &Option<String>,
				          model: &str| {
					Some(completions::StreamResponse {
						id: message_id.clone().unwrap_or_else(|| "unknown".to_string()),
						object: "chat.completion.chunk".to_string(),
						created,
						model: model.to_string(),
						choices,
						usage,
						rest: Default::default(),
					})
				};
				let delta_choice = |delta: completions::StreamDelta| completions::StreamChoice {
					index: 0,
					delta,
					finish_reason: None,
					rest: Default::default(),
				};
				let event = f.ok()?;
				match event {
					messages::StreamEvent::MessageStart { message } => {
						message_id = Some(message.id.clone());
						model = message.model.clone();
						input_usage = message.usage.to_usage();
						log.non_atomic_mutate(|r| {
							r.merge_usage(&input_usage);
							r.provider_model = Some(message.model.clone());
						});
						None
					},
					messages::StreamEvent::ContentBlockStart {
						index,
						content_block,
					} => {
						if let messages::ContentBlock::Known(messages::KnownBlock::ToolUse {
							id, name, ..
						}) = content_block
						{
							let tool_index = next_tool_index;
							next_tool_index += 1;
							tool_indexes.insert(index, tool_index);
							let mut delta = completions::StreamDelta::default();
							delta.tool_calls = Some(vec![completions::StreamToolCall {
								index: tool_index,
								id: Some(id),
								call_type: Some("function".to_string()),
								function: Some(completions::StreamFunctionCall {
									name: Some(name),
									arguments: Some(String::new()),
								}),
							}]);
							return mk(vec![delta_choice(delta)], None, &message_id, &model);
						}
						None
					},
					messages::StreamEvent::ContentBlockDelta { index, delta } => {
						if !saw_token {
							saw_token = true;
							log.non_atomic_mutate(|r| r.first_token = Some(Instant::now()));
						}
						let mut dr = completions::StreamDelta::default();
						match delta {
							messages::ContentDelta::TextDelta { text } => {
								log.non_atomic_mutate(|r| r.completion_chars += text.len());
								dr.content = Some(text);
							},
							messages::ContentDelta::ThinkingDelta { thinking } => {
								dr.thinking = Some(thinking);
								normalize_reasoning_delta(&mut dr, format);
							},
							messages::ContentDelta::InputJsonDelta { partial_json } => {
								let tool_index = tool_indexes.get(&index).copied()?;
								dr.tool_calls = Some(vec![completions::StreamToolCall {
									index: tool_index,
									id: None,
									call_type: None,
									function: Some(completions::StreamFunctionCall {
										name: None,
										arguments: Some(partial_json),
									}),
								}]);
							},
							messages::ContentDelta::SignatureDelta { .. } => return None,
						}
						mk(vec![delta_choice(dr)], None, &message_id, &model)
					},
					messages::StreamEvent::MessageDelta { delta, usage } => {
						let mut cumulative = input_usage.clone();
						cumulative.merge_cumulative(&usage.to_usage());
						let finish = delta.stop_reason.as_ref().map(stop_reason_to_finish);
						log.non_atomic_mutate(|r| {
							r.merge_usage(&cumulative);
							if let Some(f) = finish {
								r.finish_reason = Some(f.to_string());
							}
						});
						let choice = completions::StreamChoice {
							index: 0,
							delta: completions::StreamDelta::default(),
							finish_reason: finish.map(|f| f.to_string()),
							rest: Default::default(),
						};
						mk(
							vec![choice],
							Some(completions::Usage {
								prompt_tokens: cumulative.prompt_tokens,
								completion_tokens: cumulative.completion_tokens,
								total_tokens: cumulative.prompt_tokens + cumulative.completion_tokens,
								prompt_tokens_details: Some(completions::PromptTokensDetails {
									cached_tokens: cumulative.cached_prompt_tokens,
									rest: Default::default(),
								}),
								completion_tokens_details: None,
							}),
							&message_id,
							&model,
						)
					},
					messages::StreamEvent::ContentBlockStop { .. }
					| messages::StreamEvent::MessageStop
					| messages::StreamEvent::Ping => None,
				}
			},
		)
	}

	pub fn translate_error(bytes: &Bytes) -> Result<Bytes, AIError> {
		let res = serde_json::from_slice::<messages::ErrorResponse>(bytes)
			.map_err(AIError::ResponseParsing)?;
		let out = completions::ErrorResponse::new(res.error.error_type, res.error.message);
		serde_json::to_vec(&out)
			.map(Bytes::from)
			.map_err(AIError::ResponseMarshal)
	}
}

pub mod from_responses {
	use bytes::Bytes;

	use crate::http::Body;
	use crate::llm::AIError;
	use crate::llm::conversion::{ResponseInfo, completions as completions_conv};
	use crate::llm::types::{messages, responses};
	use crate::telemetry::AsyncLog;
	use crate::types::ReasoningFormat;

	/// Responses ingress on a Messages provider, bridged through the
	/// completions form.
	pub fn translate(req: &responses::Request) -> Result<messages::Request, AIError> {
		let chat = completions_conv::from_responses::to_completions(req)?;
		super::from_completions::translate(&chat)
	}

	pub fn translate_response(bytes: &Bytes) -> Result<responses::Response, AIError> {
		let chat =
			super::from_completions::translate_response(bytes, ReasoningFormat::ReasoningContent)?;
		let chat_bytes = serde_json::to_vec(&chat).map_err(AIError::ResponseMarshal)?;
		completions_conv::from_responses::translate_response(&Bytes::from(chat_bytes))
	}

	/// Messages stream -> completions chunks -> responses events.
	pub fn translate_stream(body: Body, limit: usize, log: AsyncLog<ResponseInfo>) -> Body {
		let chat = super::from_completions::translate_stream(
			body,
			limit,
			log.clone(),
			ReasoningFormat::ReasoningContent,
		);
		completions_conv::from_responses::translate_stream(chat, limit, log)
	}

	pub fn translate_error(bytes: &Bytes) -> Result<Bytes, AIError> {
		let chat = super::from_completions::translate_error(bytes)?;
		completions_conv::from_responses::translate_error(&chat)
	}
}
