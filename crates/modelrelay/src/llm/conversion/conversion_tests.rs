use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{Value, json};

use super::*;
use crate::http::Body;
use crate::llm::conversion::{completions as completions_conv, messages as messages_conv};
use crate::llm::types::{completions, messages, responses};
use crate::telemetry::AsyncLog;

fn messages_request(v: Value) -> messages::Request {
	serde_json::from_value(v).unwrap()
}

async fn collect(body: Body) -> String {
	let bytes = body.collect().await.unwrap().to_bytes();
	String::from_utf8(bytes.to_vec()).unwrap()
}

fn sse_body(frames: &[Value]) -> Body {
	let mut out = String::new();
	for f in frames {
		out.push_str(&format!("data: {f}\n\n"));
	}
	out.push_str("data: [DONE]\n\n");
	Body::from(out)
}

#[test]
fn messages_request_translates_to_completions() {
	let req = messages_request(json!({
		"model": "gpt-4o-mini",
		"max_tokens": 512,
		"system": "be brief",
		"stop_sequences": ["END"],
		"messages": [
			{"role": "user", "content": "hello"},
			{"role": "assistant", "content": [
				{"type": "text", "text": "calling a tool"},
				{"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {"q": "x"}}
			]},
			{"role": "user", "content": [
				{"type": "tool_result", "tool_use_id": "toolu_1", "content": "42"}
			]}
		],
		"tools": [{"name": "lookup", "description": "look things up", "input_schema": {"type": "object"}}],
		"tool_choice": {"type": "auto"}
	}));
	let chat = completions_conv::from_messages::translate(&req, true).unwrap();

	assert_eq!(chat.model.as_deref(), Some("gpt-4o-mini"));
	assert_eq!(chat.max_completion_tokens, Some(512));
	assert_eq!(chat.messages[0].role, "system");
	assert_eq!(chat.messages[1].role, "user");
	// Assistant turn keeps both the text and the tool call.
	let assistant = &chat.messages[2];
	assert_eq!(assistant.role, "assistant");
	assert_eq!(assistant.content_text(), "calling a tool");
	let calls = assistant.tool_calls.as_ref().unwrap();
	assert_eq!(calls[0].id, "toolu_1");
	assert_eq!(calls[0].function.name, "lookup");
	assert_eq!(
		serde_json::from_str::<Value>(&calls[0].function.arguments).unwrap(),
		json!({"q": "x"})
	);
	// The paired tool_result becomes a role=tool message with matching id.
	let tool = &chat.messages[3];
	assert_eq!(tool.role, "tool");
	assert_eq!(tool.tool_call_id.as_deref(), Some("toolu_1"));
	assert_eq!(tool.content_text(), "42");
	// auto tool choice passes through; no promotion with a tool turn present.
	assert!(chat.tools.is_some());
	assert!(chat.response_format.is_none());
}

fn promotable() -> messages::Request {
	messages_request(json!({
		"model": "gpt-4o-mini",
		"max_tokens": 256,
		"messages": [{"role": "user", "content": "classify this"}],
		"tools": [{
			"name": "topic_classifier",
			"description": "classify",
			"input_schema": {"type": "object", "properties": {"topic": {"type": "string"}}, "additionalProperties": false}
		}],
		"tool_choice": {"type": "tool", "name": "topic_classifier"}
	}))
}

#[test]
fn structured_output_promotion_applies() {
	let chat = completions_conv::from_messages::translate(&promotable(), true).unwrap();
	assert!(chat.tools.is_none());
	assert!(chat.tool_choice.is_none());
	let Some(completions::ResponseFormat::JsonSchema { json_schema }) = &chat.response_format else {
		panic!("expected json_schema response format");
	};
	assert_eq!(json_schema.name, "topic_classifier");
	assert_eq!(json_schema.strict, Some(true));
	assert_eq!(
		json_schema.schema.get("additionalProperties"),
		Some(&Value::Bool(false))
	);
}

#[test]
fn structured_output_promotion_is_idempotent() {
	let once = completions_conv::from_messages::translate(&promotable(), true).unwrap();
	let twice = completions_conv::from_messages::translate(&promotable(), true).unwrap();
	assert_eq!(
		serde_json::to_vec(&once).unwrap(),
		serde_json::to_vec(&twice).unwrap()
	);
}

#[test]
fn structured_output_promotion_opt_outs() {
	// Channel-level opt-out keeps the tool form.
	let chat = completions_conv::from_messages::translate(&promotable(), false).unwrap();
	assert!(chat.tools.is_some());
	assert!(chat.response_format.is_none());

	// additionalProperties must be pinned false.
	let mut req = promotable();
	req.tools.as_mut().unwrap()[0].input_schema = json!({"type": "object"});
	let chat = completions_conv::from_messages::translate(&req, true).unwrap();
	assert!(chat.response_format.is_none());

	// tool_choice must force the tool.
	let mut req = promotable();
	req.tool_choice = Some(messages::ToolChoice::Auto);
	let chat = completions_conv::from_messages::translate(&req, true).unwrap();
	assert!(chat.response_format.is_none());

	// More than one tool is never promoted.
	let mut req = promotable();
	let extra = req.tools.as_ref().unwrap()[0].clone();
	req.tools.as_mut().unwrap().push(extra);
	let chat = completions_conv::from_messages::translate(&req, true).unwrap();
	assert!(chat.response_format.is_none());
}

#[test]
fn completions_response_translates_to_messages() {
	let chat = json!({
		"id": "chatcmpl-1",
		"object": "chat.completion",
		"created": 123,
		"model": "gpt-4o-mini",
		"choices": [{
			"index": 0,
			"message": {
				"role": "assistant",
				"content": "hi there",
				"tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":1}"}}]
			},
			"finish_reason": "tool_calls"
		}],
		"usage": {"prompt_tokens": 10, "completion_tokens": 4, "total_tokens": 14}
	});
	let resp = completions_conv::from_messages::translate_response(&Bytes::from(
		serde_json::to_vec(&chat).unwrap(),
	))
	.unwrap();
	assert_eq!(resp.stop_reason, Some(messages::StopReason::ToolUse));
	assert_eq!(resp.usage.input_tokens, 10);
	assert_eq!(resp.usage.output_tokens, 4);
	let [text, tool] = resp.content.as_slice() else {
		panic!("expected two content blocks");
	};
	assert!(matches!(
		text,
		messages::ContentBlock::Known(messages::KnownBlock::Text { text, .. }) if text == "hi there"
	));
	assert!(matches!(
		tool,
		messages::ContentBlock::Known(messages::KnownBlock::ToolUse { id, name, .. })
			if id == "call_1" && name == "lookup"
	));
}

#[test]
fn messages_response_translates_to_completions_with_unknown_blocks() {
	let claude = json!({
		"id": "msg_1",
		"type": "message",
		"role": "assistant",
		"model": "claude-sonnet-4",
		"content": [
			{"type": "text", "text": "answer"},
			{"type": "server_tool_use", "id": "x", "name": "web_search", "input": {}}
		],
		"stop_reason": "end_turn",
		"stop_sequence": null,
		"usage": {"input_tokens": 7, "output_tokens": 3, "cache_read_input_tokens": 2}
	});
	let resp = messages_conv::from_completions::translate_response(
		&Bytes::from(serde_json::to_vec(&claude).unwrap()),
		crate::types::ReasoningFormat::ReasoningContent,
	)
	.unwrap();
	assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
	// The unknown block is preserved as text rather than dropped.
	let content = resp.choices[0].message.content.as_deref().unwrap();
	assert!(content.starts_with("answer"));
	assert!(content.contains("server_tool_use"));
	let usage = resp.usage.as_ref().unwrap();
	// 7 reported + 2 cached reads
	assert_eq!(usage.prompt_tokens, 9);
	assert_eq!(
		usage.prompt_tokens_details.as_ref().unwrap().cached_tokens,
		2
	);
}

#[tokio::test]
async fn claude_stream_translates_to_chat_chunks() {
	let frames = [
		json!({"type": "message_start", "message": {"id": "msg_1", "type": "message", "role": "assistant", "model": "claude-sonnet-4", "content": [], "stop_reason": null, "stop_sequence": null, "usage": {"input_tokens": 12, "output_tokens": 1}}}),
		json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
		json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "hel"}}),
		json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}}),
		json!({"type": "content_block_stop", "index": 0}),
		json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null}, "usage": {"input_tokens": 12, "output_tokens": 5}}),
		json!({"type": "message_stop"}),
	];
	let mut raw = String::new();
	for f in &frames {
		raw.push_str(&format!("data: {f}\n\n"));
	}
	let log = AsyncLog::<ResponseInfo>::default();
	log.store(Some(ResponseInfo::default()));
	let out = messages_conv::from_completions::translate_stream(
		Body::from(raw),
		0,
		log.clone(),
		crate::types::ReasoningFormat::ReasoningContent,
	);
	let out = collect(out).await;

	assert!(out.contains("\"hel\""));
	assert!(out.contains("chat.completion.chunk"));
	assert!(out.ends_with("data: [DONE]\n\n"));
	assert_eq!(out.matches("[DONE]").count(), 1);
	// The usage frame carries totals in OpenAI shape.
	assert!(out.contains("\"prompt_tokens\":12"));
	assert!(out.contains("\"completion_tokens\":5"));
	assert!(out.contains("\"finish_reason\":\"stop\""));

	let info = log.take().unwrap();
	assert_eq!(info.usage.prompt_tokens, 12);
	assert_eq!(info.usage.completion_tokens, 5);
	assert_eq!(info.finish_reason.as_deref(), Some("stop"));
	assert_eq!(info.completion_chars, 5);
}

#[tokio::test]
async fn chat_stream_translates_to_claude_events() {
	let body = sse_body(&[
		json!({"id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o-mini",
			"choices": [{"index": 0, "delta": {"role": "assistant", "content": "hi"}, "finish_reason": null}]}),
		json!({"id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o-mini",
			"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
		json!({"id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o-mini",
			"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}}),
	]);
	let log = AsyncLog::<ResponseInfo>::default();
	log.store(Some(ResponseInfo::default()));
	let out = completions_conv::from_messages::translate_stream(body, 0, log.clone());
	let out = collect(out).await;

	for event in [
		"event: message_start",
		"event: content_block_start",
		"event: content_block_delta",
		"event: content_block_stop",
		"event: message_delta",
		"event: message_stop",
	] {
		assert!(out.contains(event), "missing {event} in: {out}");
	}
	// Claude streams end with message_stop, never [DONE].
	assert!(!out.contains("[DONE]"));
	assert_eq!(out.matches("event: message_stop").count(), 1);
	assert!(out.contains("\"stop_reason\":\"end_turn\""));
	let info = log.take().unwrap();
	assert_eq!(info.usage.prompt_tokens, 3);
	assert_eq!(info.usage.completion_tokens, 2);
}

#[tokio::test]
async fn chat_stream_tool_calls_become_tool_use_blocks() {
	let body = sse_body(&[
		json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
			"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_9", "type": "function", "function": {"name": "lookup", "arguments": ""}}]}, "finish_reason": null}]}),
		json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
			"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"q\":1}"}}]}, "finish_reason": null}]}),
		json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
			"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
	]);
	let log = AsyncLog::<ResponseInfo>::default();
	log.store(Some(ResponseInfo::default()));
	let out = completions_conv::from_messages::translate_stream(body, 0, log);
	let out = collect(out).await;
	assert!(out.contains("\"type\":\"tool_use\""));
	assert!(out.contains("\"id\":\"call_9\""));
	assert!(out.contains("input_json_delta"));
	assert!(out.contains("{\\\"q\\\":1}"));
	assert!(out.contains("\"stop_reason\":\"tool_use\""));
}

#[tokio::test]
async fn chat_stream_translates_to_responses_events() {
	let body = sse_body(&[
		json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-5-mini",
			"choices": [{"index": 0, "delta": {"role": "assistant", "content": "par"}, "finish_reason": null}]}),
		json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-5-mini",
			"choices": [{"index": 0, "delta": {"content": "is"}, "finish_reason": "stop"}]}),
		json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-5-mini",
			"choices": [], "usage": {"prompt_tokens": 8, "completion_tokens": 2, "total_tokens": 10}}),
	]);
	let log = AsyncLog::<ResponseInfo>::default();
	log.store(Some(ResponseInfo::default()));
	let out = completions_conv::from_responses::translate_stream(body, 0, log.clone());
	let out = collect(out).await;

	for event in [
		"event: response.created",
		"event: response.output_item.added",
		"event: response.output_text.delta",
		"event: response.output_text.done",
		"event: response.output_item.done",
		"event: response.completed",
	] {
		assert!(out.contains(event), "missing {event} in: {out}");
	}
	assert!(out.contains("\"text\":\"paris\""));
	assert!(out.contains("\"input_tokens\":8"));
	assert!(out.contains("\"output_tokens\":2"));
	assert!(out.contains("\"total_tokens\":10"));
	let info = log.take().unwrap();
	assert_eq!(info.usage.prompt_tokens, 8);
	assert_eq!(info.completion_chars, 5);
}

#[test]
fn responses_request_translates_to_completions() {
	let req: responses::Request = serde_json::from_value(json!({
		"model": "gpt-5-mini",
		"instructions": "answer briefly",
		"input": [
			{"type": "message", "role": "user", "content": "what is 2+2?"},
			{"type": "function_call_output", "call_id": "call_3", "output": "4"}
		],
		"max_output_tokens": 64,
		"reasoning": {"effort": "high"},
		"text": {"format": {"type": "json_schema", "name": "answer", "schema": {"type": "object", "additionalProperties": false}, "strict": true}},
		"tools": [{"type": "function", "name": "calc", "parameters": {"type": "object"}}]
	}))
	.unwrap();
	let chat = completions_conv::from_responses::to_completions(&req).unwrap();
	assert_eq!(chat.messages[0].role, "system");
	assert_eq!(chat.messages[1].content_text(), "what is 2+2?");
	assert_eq!(chat.messages[2].role, "tool");
	assert_eq!(chat.messages[2].tool_call_id.as_deref(), Some("call_3"));
	assert_eq!(chat.max_completion_tokens, Some(64));
	assert_eq!(chat.reasoning_effort.as_deref(), Some("high"));
	let Some(completions::ResponseFormat::JsonSchema { json_schema }) = &chat.response_format else {
		panic!("expected json_schema");
	};
	assert_eq!(json_schema.name, "answer");
	let tools = chat.tools.as_ref().unwrap();
	let completions::Tool::Function { function } = &tools[0];
	assert_eq!(function.name, "calc");
}

#[test]
fn completions_response_translates_to_responses() {
	let chat = json!({
		"id": "chatcmpl-1",
		"object": "chat.completion",
		"created": 5,
		"model": "gpt-5-mini",
		"choices": [{"index": 0, "message": {"role": "assistant", "content": "four"}, "finish_reason": "stop"}],
		"usage": {"prompt_tokens": 6, "completion_tokens": 1, "total_tokens": 7,
			"completion_tokens_details": {"reasoning_tokens": 3}}
	});
	let resp = completions_conv::from_responses::translate_response(&Bytes::from(
		serde_json::to_vec(&chat).unwrap(),
	))
	.unwrap();
	assert_eq!(resp.object, "response");
	assert_eq!(resp.status, "completed");
	let usage = resp.usage.as_ref().unwrap();
	assert_eq!(usage.input_tokens, 6);
	assert_eq!(usage.total_tokens, 7);
	assert_eq!(
		usage
			.output_tokens_details
			.as_ref()
			.unwrap()
			.reasoning_tokens,
		3
	);
	let text = resp.output.iter().find_map(|o| match o {
		responses::OutputItem::Message { content, .. } => content.first().map(|c| match c {
			responses::OutputContent::OutputText { text, .. } => text.clone(),
			responses::OutputContent::Refusal { refusal } => refusal.clone(),
		}),
		_ => None,
	});
	assert_eq!(text.as_deref(), Some("four"));
}

#[tokio::test]
async fn reasoning_format_selects_the_egress_key() {
	for (format, key) in [
		(crate::types::ReasoningFormat::ReasoningContent, "reasoning_content"),
		(crate::types::ReasoningFormat::Reasoning, "reasoning"),
		(crate::types::ReasoningFormat::Thinking, "thinking"),
	] {
		let body = sse_body(&[json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "deepseek-reasoner",
			"choices": [{"index": 0, "delta": {"reasoning_content": "mull"}, "finish_reason": null}]})]);
		let log = AsyncLog::<ResponseInfo>::default();
		log.store(Some(ResponseInfo::default()));
		let out = collect(completions_conv::chat_stream(body, 0, log, format)).await;
		assert!(out.contains(&format!("\"{key}\":\"mull\"")), "{key}: {out}");
		// Only the requested key appears.
		for other in ["reasoning_content", "reasoning", "thinking"] {
			if other != key {
				assert!(!out.contains(&format!("\"{other}\"")), "{other} leaked: {out}");
			}
		}
	}
}

#[tokio::test]
async fn messages_passthrough_stream_observes_usage() {
	let raw = concat!(
		"event: message_start\n",
		"data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-sonnet-4\",\"content\":[],\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":9,\"output_tokens\":1}}}\n\n",
		"event: content_block_delta\n",
		"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"ok\"}}\n\n",
		"event: message_delta\n",
		"data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"input_tokens\":9,\"output_tokens\":4}}\n\n",
		"event: message_stop\n",
		"data: {\"type\":\"message_stop\"}\n\n",
	);
	let log = AsyncLog::<ResponseInfo>::default();
	log.store(Some(ResponseInfo::default()));
	let out = messages_conv::passthrough_stream(Body::from(raw), 0, log.clone());
	let out = collect(out).await;
	// Passthrough preserves the upstream bytes exactly.
	assert_eq!(out, raw);
	let info = log.take().unwrap();
	assert_eq!(info.usage.prompt_tokens, 9);
	assert_eq!(info.usage.completion_tokens, 4);
	assert_eq!(info.finish_reason.as_deref(), Some("stop"));
}
