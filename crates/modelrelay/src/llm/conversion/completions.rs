//! Conversions for providers that speak OpenAI Chat Completions (OpenAI,
//! Azure, Gemini-compat, xAI, DeepSeek, OpenRouter, any compatible endpoint).
//! Submodules are named for the ingress shape being served.

use std::time::Instant;

use crate::http::Body;
use crate::llm::conversion::{ResponseInfo, normalize_reasoning_delta};
use crate::llm::types::completions;
use crate::parse;
use crate::telemetry::AsyncLog;
use crate::types::ReasoningFormat;

/// Chat ingress on a completions provider. Frames are re-emitted (rather
/// than passed through byte-for-byte) so reasoning keys can be normalized to
/// the requested format; unknown fields survive via the wire types' flatten
/// passthrough.
pub fn chat_stream(
	body: Body,
	limit: usize,
	log: AsyncLog<ResponseInfo>,
	format: ReasoningFormat,
) -> Body {
	let mut saw_token = false;
	let mut seen_model = false;
	parse::sse::json_transform::<completions::StreamResponse, completions::StreamResponse>(
		body,
		limit,
		move |f| {
			let mut frame = f.ok()?;
			if !seen_model {
				seen_model = true;
				let model = frame.model.clone();
				log.non_atomic_mutate(|r| r.provider_model = Some(model));
			}
			if !saw_token && !frame.choices.is_empty() {
				saw_token = true;
				log.non_atomic_mutate(|r| r.first_token = Some(Instant::now()));
			}
			for choice in &mut frame.choices {
				normalize_reasoning_delta(&mut choice.delta, format);
				if let Some(content) = &choice.delta.content {
					let chars = content.len();
					log.non_atomic_mutate(|r| r.completion_chars += chars);
				}
				if let Some(finish) = &choice.finish_reason {
					let finish = finish.clone();
					log.non_atomic_mutate(|r| r.finish_reason = Some(finish));
				}
			}
			if let Some(usage) = &frame.usage {
				let usage = usage.to_usage();
				log.non_atomic_mutate(|r| r.merge_usage(&usage));
			}
			Some(frame)
		},
	)
}

/// Non-stream chat ingress: parse, record usage, normalize reasoning keys.
pub fn chat_response(
	bytes: &bytes::Bytes,
	log: &AsyncLog<ResponseInfo>,
	format: ReasoningFormat,
) -> Result<completions::Response, crate::llm::AIError> {
	let mut resp = serde_json::from_slice::<completions::Response>(bytes)
		.map_err(crate::llm::AIError::ResponseParsing)?;
	for choice in &mut resp.choices {
		crate::llm::conversion::normalize_reasoning_message(&mut choice.message, format);
	}
	log.non_atomic_mutate(|r| {
		r.provider_model = Some(resp.model.clone());
		if let Some(usage) = &resp.usage {
			r.merge_usage(&usage.to_usage());
		}
		if let Some(choice) = resp.choices.first() {
			r.completion_chars += choice
				.message
				.content
				.as_deref()
				.map(str::len)
				.unwrap_or_default();
			r.finish_reason = choice.finish_reason.clone();
		}
	});
	Ok(resp)
}

pub mod from_messages {
	use std::time::Instant;

	use bytes::Bytes;
	use serde_json::Value;

	use super::super::messages as messages_conv;
	use crate::http::Body;
	use crate::llm::AIError;
	use crate::llm::conversion::ResponseInfo;
	use crate::llm::types::{completions, messages};
	use crate::parse;
	use crate::telemetry::AsyncLog;

	/// Translate a Messages request into a completions request. When
	/// `promote` is set and the request is a pure single-tool structured
	/// output ask, the tool becomes a strict `response_format` json schema.
	pub fn translate(
		req: &messages::Request,
		promote: bool,
	) -> Result<completions::Request, AIError> {
		let mut msgs: Vec<completions::RequestMessage> = Vec::new();
		if let Some(system) = &req.system {
			msgs.push(completions::RequestMessage::text(
				completions::SYSTEM_ROLE,
				system.joined_text(),
			));
		}
		for msg in &req.messages {
			translate_message(msg, &mut msgs);
		}

		let mut tools = req.tools.as_ref().map(|tools| {
			tools
				.iter()
				.map(|t| completions::Tool::Function {
					function: completions::FunctionObject {
						name: t.name.clone(),
						description: t.description.clone(),
						parameters: Some(t.input_schema.clone()),
						strict: None,
					},
				})
				.collect::<Vec<_>>()
		});
		let mut tool_choice = req.tool_choice.as_ref().map(|choice| match choice {
			messages::ToolChoice::Auto => completions::ToolChoice::Mode("auto".to_string()),
			messages::ToolChoice::Any => completions::ToolChoice::Mode("required".to_string()),
			messages::ToolChoice::None => completions::ToolChoice::Mode("none".to_string()),
			messages::ToolChoice::Tool { name } => {
				completions::ToolChoice::Named(completions::NamedToolChoice {
					choice_type: "function".to_string(),
					function: completions::FunctionName { name: name.clone() },
				})
			},
		});

		let mut response_format = None;
		if promote && let Some(schema) = promotable_schema(req) {
			response_format = Some(completions::ResponseFormat::JsonSchema {
				json_schema: schema,
			});
			tools = None;
			tool_choice = None;
		}

		let user = req
			.metadata
			.as_ref()
			.and_then(|m| m.fields.get("user_id").cloned());

		Ok(completions::Request {
			model: req.model.clone(),
			messages: msgs,
			stream: req.stream,
			stream_options: None,
			temperature: req.temperature,
			top_p: req.top_p,
			max_tokens: None,
			max_completion_tokens: req.max_tokens,
			stop: (!req.stop_sequences.is_empty())
				.then(|| completions::Stop::StringArray(req.stop_sequences.clone())),
			tools,
			tool_choice,
			response_format,
			reasoning_effort: req.thinking.as_ref().and_then(|t| match t {
				messages::ThinkingInput::Enabled { budget_tokens } => Some(match budget_tokens {
					0..=1024 => "low".to_string(),
					1025..=2048 => "medium".to_string(),
					_ => "high".to_string(),
				}),
				messages::ThinkingInput::Disabled {} => None,
			}),
			user,
			rest: Default::default(),
		})
	}

	fn translate_message(msg: &messages::Message, out: &mut Vec<completions::RequestMessage>) {
		let mut text = String::new();
		let mut tool_calls: Vec<completions::ToolCall> = Vec::new();
		let mut push_text = |text: &str, buf: &mut String| {
			if !buf.is_empty() {
				buf.push('\n');
			}
			buf.push_str(text);
		};
		for block in &msg.content {
			match block {
				messages::ContentBlock::Known(messages::KnownBlock::Text { text: t, .. }) => {
					push_text(t, &mut text);
				},
				messages::ContentBlock::Known(messages::KnownBlock::ToolResult {
					tool_use_id,
					content,
					..
				}) => {
					out.push(completions::RequestMessage {
						role: completions::TOOL_ROLE.to_string(),
						content: Some(completions::MessageContent::Text(content.as_text())),
						tool_calls: None,
						tool_call_id: Some(tool_use_id.clone()),
						name: None,
						rest: Default::default(),
					});
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
				messages::ContentBlock::Known(messages::KnownBlock::Image { .. }) => {
					// Inline image forwarding happens upstream of conversion.
				},
				messages::ContentBlock::Known(
					messages::KnownBlock::Thinking { .. } | messages::KnownBlock::RedactedThinking { .. },
				) => {},
				// Unknown blocks are preserved by round-tripping as text.
				messages::ContentBlock::Other(value) => {
					push_text(&crate::json::to_compact_text(value), &mut text);
				},
			}
		}
		let role = match msg.role {
			messages::Role::User => completions::USER_ROLE,
			messages::Role::Assistant => completions::ASSISTANT_ROLE,
		};
		if !text.is_empty() || !tool_calls.is_empty() {
			out.push(completions::RequestMessage {
				role: role.to_string(),
				content: (!text.is_empty()).then_some(completions::MessageContent::Text(text)),
				tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
				tool_call_id: None,
				name: None,
				rest: Default::default(),
			});
		}
	}

	/// Structured-output promotion: exactly one tool whose schema pins
	/// `additionalProperties: false`, a tool_choice forcing it, and no prior
	/// tool_use/tool_result turn.
	fn promotable_schema(req: &messages::Request) -> Option<completions::JsonSchemaFormat> {
		let tools = req.tools.as_ref()?;
		let [tool] = tools.as_slice() else {
			return None;
		};
		let forced = matches!(
			req.tool_choice.as_ref()?,
			messages::ToolChoice::Tool { name } if *name == tool.name
		);
		if !forced {
			return None;
		}
		if tool.input_schema.get("additionalProperties") != Some(&Value::Bool(false)) {
			return None;
		}
		let has_tool_turn = req
			.messages
			.iter()
			.any(|m| m.content.iter().any(|b| b.is_tool_use_or_result()));
		if has_tool_turn {
			return None;
		}
		Some(completions::JsonSchemaFormat {
			name: tool.name.clone(),
			description: tool.description.clone(),
			schema: tool.input_schema.clone(),
			strict: Some(true),
		})
	}

	/// Translate a completions response into a Messages response.
	pub fn translate_response(bytes: &Bytes) -> Result<messages::MessagesResponse, AIError> {
		let resp = serde_json::from_slice::<completions::Response>(bytes)
			.map_err(AIError::ResponseParsing)?;
		let choice = resp.choices.into_iter().next();
		let mut content = Vec::new();
		let mut stop_reason = messages::StopReason::EndTurn;
		if let Some(choice) = choice {
			let mut message = choice.message;
			if let Some(thinking) = message
				.reasoning_content
				.take()
				.or_else(|| message.reasoning.take())
				.or_else(|| message.thinking.take())
			{
				content.push(messages::ContentBlock::Known(messages::KnownBlock::Thinking {
					thinking,
					signature: String::new(),
				}));
			}
			if let Some(text) = message.content
				&& !text.is_empty()
			{
				content.push(messages::ContentBlock::text(text));
			}
			for call in message.tool_calls.into_iter().flatten() {
				content.push(messages::ContentBlock::Known(messages::KnownBlock::ToolUse {
					id: call.id,
					name: call.function.name,
					input: serde_json::from_str(&call.function.arguments)
						.unwrap_or(Value::Object(Default::default())),
					cache_control: None,
				}));
			}
			if let Some(finish) = &choice.finish_reason {
				stop_reason = messages_conv::finish_to_stop_reason(finish);
			}
		}
		let usage = resp.usage.unwrap_or_default();
		let cached = usage
			.prompt_tokens_details
			.as_ref()
			.map(|d| d.cached_tokens)
			.unwrap_or_default();
		Ok(messages::MessagesResponse {
			id: resp.id,
			response_type: "message".to_string(),
			role: messages::Role::Assistant,
			content,
			model: resp.model,
			stop_reason: Some(stop_reason),
			stop_sequence: None,
			usage: messages::Usage {
				input_tokens: usage.prompt_tokens.saturating_sub(cached),
				output_tokens: usage.completion_tokens,
				cache_read_input_tokens: (cached > 0).then_some(cached),
				cache_creation_input_tokens: None,
				cache_creation: None,
			},
		})
	}

	/// Translate a completions stream into Messages stream events.
	pub fn translate_stream(body: Body, limit: usize, log: AsyncLog<ResponseInfo>) -> Body {
		#[derive(Clone, Copy, PartialEq)]
		enum OpenBlock {
			None,
			Thinking(usize),
			Text(usize),
			Tool(usize),
		}
		let mut started = false;
		let mut saw_token = false;
		let mut open = OpenBlock::None;
		let mut next_index = 0usize;
		// openai tool index -> claude content block index
		let mut tool_blocks: std::collections::HashMap<u32, usize> = Default::default();
		let mut finish: Option<String> = None;
		let mut final_usage: Option<completions::Usage> = None;

		parse::sse::json_transform_multi::<completions::StreamResponse, messages::StreamEvent>(
			body,
			limit,
			move |f| {
				let mut frames: Vec<(&'static str, messages::StreamEvent)> = Vec::new();
				let close_open = |open: &mut OpenBlock,
				                  frames: &mut Vec<(&'static str, messages::StreamEvent)>| {
					let index = match *open {
						OpenBlock::None => return,
						OpenBlock::Thinking(i) | OpenBlock::Text(i) | OpenBlock::Tool(i) => i,
					};
					frames.push(messages::StreamEvent::ContentBlockStop { index }.into_frame());
					*open = OpenBlock::None;
				};
				let Some(frame) = f else {
					// Upstream ended: close blocks and finish the message.
					close_open(&mut open, &mut frames);
					let usage = final_usage.take().map(|u| u.to_usage()).unwrap_or_default();
					frames.push(
						messages::StreamEvent::MessageDelta {
							delta: messages::MessageDelta {
								stop_reason: Some(messages_conv::finish_to_stop_reason(
									finish.as_deref().unwrap_or("stop"),
								)),
								stop_sequence: None,
							},
							usage: messages::Usage {
								input_tokens: usage.prompt_tokens.saturating_sub(usage.cached_prompt_tokens),
								output_tokens: usage.completion_tokens,
								cache_read_input_tokens: (usage.cached_prompt_tokens > 0)
									.then_some(usage.cached_prompt_tokens),
								cache_creation_input_tokens: None,
								cache_creation: None,
							},
						}
						.into_frame(),
					);
					frames.push(messages::StreamEvent::MessageStop.into_frame());
					return frames;
				};
				let Ok(frame) = frame else {
					return frames;
				};
				if !started {
					started = true;
					log.non_atomic_mutate(|r| r.provider_model = Some(frame.model.clone()));
					frames.push(
						messages::StreamEvent::MessageStart {
							message: messages::MessagesResponse {
								id: frame.id.clone(),
								response_type: "message".to_string(),
								role: messages::Role::Assistant,
								content: vec![],
								model: frame.model.clone(),
								stop_reason: None,
								stop_sequence: None,
								usage: messages::Usage::default(),
							},
						}
						.into_frame(),
					);
				}
				if let Some(usage) = &frame.usage {
					final_usage = Some(usage.clone());
					let u = usage.to_usage();
					log.non_atomic_mutate(|r| r.merge_usage(&u));
				}
				for choice in frame.choices {
					if let Some(f) = &choice.finish_reason {
						finish = Some(f.clone());
						let f = f.clone();
						log.non_atomic_mutate(|r| r.finish_reason = Some(f));
					}
					let mut delta = choice.delta;
					if !saw_token {
						saw_token = true;
						log.non_atomic_mutate(|r| r.first_token = Some(Instant::now()));
					}
					if let Some(reasoning) = completions::take_reasoning(&mut delta) {
						if !matches!(open, OpenBlock::Thinking(_)) {
							close_open(&mut open, &mut frames);
							let index = next_index;
							next_index += 1;
							open = OpenBlock::Thinking(index);
							frames.push(
								messages::StreamEvent::ContentBlockStart {
									index,
									content_block: messages::ContentBlock::Known(
										messages::KnownBlock::Thinking {
											thinking: String::new(),
											signature: String::new(),
										},
									),
								}
								.into_frame(),
							);
						}
						if let OpenBlock::Thinking(index) = open {
							frames.push(
								messages::StreamEvent::ContentBlockDelta {
									index,
									delta: messages::ContentDelta::ThinkingDelta {
										thinking: reasoning,
									},
								}
								.into_frame(),
							);
						}
					}
					if let Some(text) = delta.content.take()
						&& !text.is_empty()
					{
						log.non_atomic_mutate(|r| r.completion_chars += text.len());
						if !matches!(open, OpenBlock::Text(_)) {
							close_open(&mut open, &mut frames);
							let index = next_index;
							next_index += 1;
							open = OpenBlock::Text(index);
							frames.push(
								messages::StreamEvent::ContentBlockStart {
									index,
									content_block: messages::ContentBlock::text(String::new()),
								}
								.into_frame(),
							);
						}
						if let OpenBlock::Text(index) = open {
							frames.push(
								messages::StreamEvent::ContentBlockDelta {
									index,
									delta: messages::ContentDelta::TextDelta { text },
								}
								.into_frame(),
							);
						}
					}
					for call in delta.tool_calls.into_iter().flatten() {
						let block = tool_blocks.get(&call.index).copied();
						let index = match block {
							Some(index) => index,
							None => {
								close_open(&mut open, &mut frames);
								let index = next_index;
								next_index += 1;
								tool_blocks.insert(call.index, index);
								open = OpenBlock::Tool(index);
								frames.push(
									messages::StreamEvent::ContentBlockStart {
										index,
										content_block: messages::ContentBlock::Known(
											messages::KnownBlock::ToolUse {
												id: call.id.clone().unwrap_or_else(|| {
													format!("toolu_{}", uuid::Uuid::new_v4().simple())
												}),
												name: call
													.function
													.as_ref()
													.and_then(|f| f.name.clone())
													.unwrap_or_default(),
												input: serde_json::Value::Object(Default::default()),
												cache_control: None,
											},
										),
									}
									.into_frame(),
								);
								index
							},
						};
						if let Some(arguments) = call.function.and_then(|f| f.arguments)
							&& !arguments.is_empty()
						{
							frames.push(
								messages::StreamEvent::ContentBlockDelta {
									index,
									delta: messages::ContentDelta::InputJsonDelta {
										partial_json: arguments,
									},
								}
								.into_frame(),
							);
						}
					}
				}
				frames
			},
		)
	}

	pub fn translate_error(bytes: &Bytes) -> Result<Bytes, AIError> {
		let res = serde_json::from_slice::<completions::ErrorResponse>(bytes)
			.map_err(AIError::ResponseParsing)?;
		let out = messages::ErrorResponse::new("api_error", res.error.message);
		serde_json::to_vec(&out)
			.map(Bytes::from)
			.map_err(AIError::ResponseMarshal)
	}
}

pub mod from_responses {
	use std::time::Instant;

	use bytes::Bytes;
	use chrono::Utc;
	use serde_json::Value;

	use crate::http::Body;
	use crate::llm::AIError;
	use crate::llm::conversion::ResponseInfo;
	use crate::llm::types::{completions, responses};
	use crate::parse;
	use crate::telemetry::AsyncLog;

	/// Translate a Responses request into a completions request.
	pub fn to_completions(req: &responses::Request) -> Result<completions::Request, AIError> {
		let mut msgs = Vec::new();
		if let Some(instructions) = &req.instructions {
			msgs.push(completions::RequestMessage::text(
				completions::SYSTEM_ROLE,
				instructions.clone(),
			));
		}
		match &req.input {
			Some(responses::Input::Text(text)) => {
				msgs.push(completions::RequestMessage::text(
					completions::USER_ROLE,
					text.clone(),
				));
			},
			Some(responses::Input::Items(items)) => {
				for item in items {
					match item.item_type.as_deref() {
						Some("function_call_output") => {
							msgs.push(completions::RequestMessage {
								role: completions::TOOL_ROLE.to_string(),
								content: Some(completions::MessageContent::Text(
									item
										.rest
										.get("output")
										.map(crate::json::to_compact_text)
										.unwrap_or_default(),
								)),
								tool_calls: None,
								tool_call_id: item
									.rest
									.get("call_id")
									.and_then(Value::as_str)
									.map(str::to_string),
								name: None,
								rest: Default::default(),
							});
						},
						None | Some("message") => {
							let role = item.role.as_deref().unwrap_or(completions::USER_ROLE);
							let text = item
								.content
								.as_ref()
								.map(|c| c.joined_text())
								.unwrap_or_default();
							msgs.push(completions::RequestMessage::text(role, text));
						},
						_ => {},
					}
				}
			},
			None => {},
		}

		// Responses tools are flat; completions nests them under `function`.
		let tools = req.tools.as_ref().map(|tools| {
			tools
				.iter()
				.filter(|t| t.get("type").and_then(Value::as_str) == Some("function"))
				.map(|t| completions::Tool::Function {
					function: completions::FunctionObject {
						name: t
							.get("name")
							.and_then(Value::as_str)
							.unwrap_or_default()
							.to_string(),
						description: t
							.get("description")
							.and_then(Value::as_str)
							.map(str::to_string),
						parameters: t.get("parameters").cloned(),
						strict: t.get("strict").and_then(Value::as_bool),
					},
				})
				.collect::<Vec<_>>()
		});

		let response_format = req
			.text
			.as_ref()
			.and_then(|t| t.format.as_ref())
			.and_then(|format| match format.get("type").and_then(Value::as_str) {
				Some("json_schema") => Some(completions::ResponseFormat::JsonSchema {
					json_schema: completions::JsonSchemaFormat {
						name: format
							.get("name")
							.and_then(Value::as_str)
							.unwrap_or("response")
							.to_string(),
						description: None,
						schema: format.get("schema").cloned().unwrap_or_default(),
						strict: format.get("strict").and_then(Value::as_bool),
					},
				}),
				Some("json_object") => Some(completions::ResponseFormat::JsonObject),
				_ => None,
			});

		Ok(completions::Request {
			model: req.model.clone(),
			messages: msgs,
			stream: req.stream,
			stream_options: None,
			temperature: req.temperature,
			top_p: req.top_p,
			max_tokens: None,
			max_completion_tokens: req.max_output_tokens,
			stop: None,
			tools: tools.filter(|t: &Vec<_>| !t.is_empty()),
			tool_choice: None,
			response_format,
			reasoning_effort: req.reasoning.as_ref().and_then(|r| r.effort.clone()),
			user: None,
			rest: Default::default(),
		})
	}

	fn response_id() -> String {
		format!("resp_{}", uuid::Uuid::new_v4().simple())
	}

	fn message_item_id() -> String {
		format!("msg_{}", uuid::Uuid::new_v4().simple())
	}

	/// Translate a completions response into a Responses response.
	pub fn translate_response(bytes: &Bytes) -> Result<responses::Response, AIError> {
		let resp = serde_json::from_slice::<completions::Response>(bytes)
			.map_err(AIError::ResponseParsing)?;
		let mut output = Vec::new();
		for choice in resp.choices {
			let mut message = choice.message;
			if message
				.reasoning_content
				.take()
				.or_else(|| message.reasoning.take())
				.or_else(|| message.thinking.take())
				.is_some()
			{
				output.push(responses::OutputItem::Reasoning {
					id: format!("rs_{}", uuid::Uuid::new_v4().simple()),
					summary: vec![],
				});
			}
			for call in message.tool_calls.into_iter().flatten() {
				output.push(responses::OutputItem::FunctionCall {
					id: format!("fc_{}", uuid::Uuid::new_v4().simple()),
					call_id: call.id,
					name: call.function.name,
					arguments: call.function.arguments,
					status: "completed".to_string(),
				});
			}
			if let Some(text) = message.content {
				output.push(responses::OutputItem::Message {
					id: message_item_id(),
					role: "assistant".to_string(),
					status: "completed".to_string(),
					content: vec![responses::OutputContent::OutputText {
						text,
						annotations: vec![],
					}],
				});
			}
		}
		let usage = resp.usage.map(|u| {
			let mapped = u.to_usage();
			responses::Usage {
				input_tokens: mapped.prompt_tokens,
				output_tokens: mapped.completion_tokens,
				total_tokens: mapped.prompt_tokens + mapped.completion_tokens,
				input_tokens_details: Some(responses::InputTokensDetails {
					cached_tokens: mapped.cached_prompt_tokens,
				}),
				output_tokens_details: Some(responses::OutputTokensDetails {
					reasoning_tokens: mapped.reasoning_tokens,
				}),
			}
		});
		Ok(responses::Response {
			id: response_id(),
			object: "response".to_string(),
			created_at: Utc::now().timestamp() as u64,
			status: "completed".to_string(),
			model: resp.model,
			output,
			usage,
			rest: Default::default(),
		})
	}

	/// Translate a completions stream into Responses stream events.
	pub fn translate_stream(body: Body, limit: usize, log: AsyncLog<ResponseInfo>) -> Body {
		let mut started = false;
		let mut item_open = false;
		let mut saw_token = false;
		let mut text = String::new();
		let mut model = String::new();
		let id = response_id();
		let item_id = message_item_id();
		let created_at = Utc::now().timestamp() as u64;
		let mut final_usage: Option<completions::Usage> = None;

		let skeleton = move |model: &str, status: &str, output: Vec<responses::OutputItem>, usage| {
			responses::Response {
				id: String::new(),
				object: "response".to_string(),
				created_at,
				status: status.to_string(),
				model: model.to_string(),
				output,
				usage,
				rest: Default::default(),
			}
		};

		parse::sse::json_transform_multi::<completions::StreamResponse, responses::StreamEvent>(
			body,
			limit,
			move |f| {
				let mut frames = Vec::new();
				let Some(frame) = f else {
					// Upstream ended: finalize the message and the response.
					if item_open {
						frames.push((
							"response.output_text.done",
							responses::StreamEvent::OutputTextDone {
								item_id: item_id.clone(),
								output_index: 0,
								content_index: 0,
								text: text.clone(),
							},
						));
						frames.push((
							"response.output_item.done",
							responses::StreamEvent::OutputItemDone {
								output_index: 0,
								item: responses::OutputItem::Message {
									id: item_id.clone(),
									role: "assistant".to_string(),
									status: "completed".to_string(),
									content: vec![responses::OutputContent::OutputText {
										text: text.clone(),
										annotations: vec![],
									}],
								},
							},
						));
					}
					let usage = final_usage.take().map(|u| {
						let mapped = u.to_usage();
						responses::Usage {
							input_tokens: mapped.prompt_tokens,
							output_tokens: mapped.completion_tokens,
							total_tokens: mapped.prompt_tokens + mapped.completion_tokens,
							input_tokens_details: Some(responses::InputTokensDetails {
								cached_tokens: mapped.cached_prompt_tokens,
							}),
							output_tokens_details: Some(responses::OutputTokensDetails {
								reasoning_tokens: mapped.reasoning_tokens,
							}),
						}
					});
					let mut done = skeleton(
						&model,
						"completed",
						vec![responses::OutputItem::Message {
							id: item_id.clone(),
							role: "assistant".to_string(),
							status: "completed".to_string(),
							content: vec![responses::OutputContent::OutputText {
								text: text.clone(),
								annotations: vec![],
							}],
						}],
						usage,
					);
					done.id = id.clone();
					frames.push((
						"response.completed",
						responses::StreamEvent::Completed { response: done },
					));
					return frames;
				};
				let Ok(frame) = frame else {
					return frames;
				};
				if !started {
					started = true;
					model = frame.model.clone();
					log.non_atomic_mutate(|r| r.provider_model = Some(frame.model.clone()));
					let mut created = skeleton(&model, "in_progress", vec![], None);
					created.id = id.clone();
					frames.push((
						"response.created",
						responses::StreamEvent::Created { response: created },
					));
				}
				if let Some(usage) = &frame.usage {
					final_usage = Some(usage.clone());
					let mapped = usage.to_usage();
					log.non_atomic_mutate(|r| r.merge_usage(&mapped));
				}
				for choice in frame.choices {
					if let Some(finish) = &choice.finish_reason {
						let finish = finish.clone();
						log.non_atomic_mutate(|r| r.finish_reason = Some(finish));
					}
					let Some(delta) = choice.delta.content else {
						continue;
					};
					if delta.is_empty() {
						continue;
					}
					if !saw_token {
						saw_token = true;
						log.non_atomic_mutate(|r| r.first_token = Some(Instant::now()));
					}
					if !item_open {
						item_open = true;
						frames.push((
							"response.output_item.added",
							responses::StreamEvent::OutputItemAdded {
								output_index: 0,
								item: responses::OutputItem::Message {
									id: item_id.clone(),
									role: "assistant".to_string(),
									status: "in_progress".to_string(),
									content: vec![],
								},
							},
						));
					}
					text.push_str(&delta);
					log.non_atomic_mutate(|r| r.completion_chars += delta.len());
					frames.push((
						"response.output_text.delta",
						responses::StreamEvent::OutputTextDelta {
							item_id: item_id.clone(),
							output_index: 0,
							content_index: 0,
							delta,
						},
					));
				}
				frames
			},
		)
	}

	pub fn translate_error(bytes: &Bytes) -> Result<Bytes, AIError> {
		let res = serde_json::from_slice::<completions::ErrorResponse>(bytes)
			.map_err(AIError::ResponseParsing)?;
		let out = responses::ErrorResponse {
			error: responses::ErrorBody {
				error_type: res.error.error_type,
				message: res.error.message,
				code: res.error.code,
			},
		};
		serde_json::to_vec(&out)
			.map(Bytes::from)
			.map_err(AIError::ResponseMarshal)
	}
}
