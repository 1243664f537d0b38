use std::net::IpAddr;
use std::time::Duration;

use http_body_util::BodyExt;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::health::HealthConfig;
use crate::ratelimit::RateLimitConfig;
use crate::store::MemoryStore;
use crate::types::{
	ChannelStatus, ChannelType, Credential, RelayOptions, Token, TokenStatus, User,
};

const TOKEN_QUOTA: i64 = 1_000_000;

struct Harness {
	store: Arc<MemoryStore>,
	service: Arc<RelayService>,
}

fn test_channel(id: i64, base_url: &str, priority: i64) -> Channel {
	Channel {
		id,
		channel_type: ChannelType::OpenAICompatible,
		name: format!("upstream-{id}"),
		credential: Credential::Key {
			key: "sk-upstream".into(),
		},
		base_url: Some(base_url.to_string()),
		models: vec!["gpt-4o-mini".into(), "gpt-5-mini".into()],
		groups: vec!["default".into()],
		model_mapping: Default::default(),
		model_overrides: Default::default(),
		priority,
		weight: 1,
		rate_limit_rpm: None,
		status: ChannelStatus::Enabled,
		test_model: None,
	}
}

async fn harness(channels: Vec<Channel>) -> Harness {
	harness_with(channels, |_| {}).await
}

async fn harness_with(channels: Vec<Channel>, tweak: impl FnOnce(&mut Config)) -> Harness {
	let store = Arc::new(MemoryStore::new());
	store.insert_user(User {
		id: 1,
		group: "default".into(),
		remaining_quota: TOKEN_QUOTA,
		used_quota: 0,
		request_count: 0,
	});
	store.insert_token(Token {
		id: 7,
		user_id: 1,
		key: "sk-test".into(),
		status: TokenStatus::Enabled,
		unlimited_quota: false,
		remaining_quota: TOKEN_QUOTA,
		used_quota: 0,
		expires_at: None,
		models: None,
		allowed_ips: None,
	});
	for c in channels {
		store.insert_channel(c);
	}
	let mut cfg = Config {
		retry_times: 2,
		..Default::default()
	};
	tweak(&mut cfg);
	let cfg = Arc::new(cfg);
	let ledger = Arc::new(QuotaLedger::new(store.clone()));
	let registry = Arc::new(ChannelRegistry::new(store.clone() as Arc<dyn Store>).await.unwrap());
	let health = Arc::new(HealthController::new(HealthConfig::default()));
	let limiter = Arc::new(RateLimiter::in_memory(RateLimitConfig::default()));
	let service = Arc::new(
		RelayService::new(
			cfg,
			store.clone(),
			ledger,
			registry,
			health,
			limiter,
		)
		.unwrap(),
	);
	Harness { store, service }
}

impl Harness {
	async fn token(&self) -> Token {
		self.store.token(7).await.unwrap().unwrap()
	}

	async fn ctx(&self, shape: IngressShape, mode: RelayMode, body: Value) -> RequestContext {
		self.ctx_with(shape, mode, body, RelayOptions::default()).await
	}

	async fn ctx_with(
		&self,
		shape: IngressShape,
		mode: RelayMode,
		body: Value,
		options: RelayOptions,
	) -> RequestContext {
		let model = body
			.get("model")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();
		RequestContext {
			request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
			trace_id: format!("trace_{}", uuid::Uuid::new_v4().simple()),
			user: self.store.user(1).await.unwrap().unwrap(),
			token: self.token().await,
			shape,
			mode,
			model,
			options,
			body: Bytes::from(serde_json::to_vec(&body).unwrap()),
			content_type: Some("application/json".to_string()),
			client_ip: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
			channel_hint: None,
			estimated_prompt_tokens: 0,
			started: Instant::now(),
		}
	}

	async fn wait_settled(&self) {
		// Stream settlement runs on a spawned task; give it a few turns.
		for _ in 0..50 {
			tokio::time::sleep(Duration::from_millis(10)).await;
			if self.store.token_balance(7) != Some(TOKEN_QUOTA) {
				return;
			}
		}
	}
}

fn chat_body(model: &str, stream: bool) -> Value {
	json!({
		"model": model,
		"stream": stream,
		"messages": [{"role": "user", "content": "ping"}]
	})
}

fn chat_ok_response() -> Value {
	json!({
		"id": "chatcmpl-1",
		"object": "chat.completion",
		"created": 1,
		"model": "gpt-4o-mini",
		"choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}, "finish_reason": "stop"}],
		"usage": {"prompt_tokens": 12, "completion_tokens": 2, "total_tokens": 14}
	})
}

async fn body_json(resp: axum::response::Response) -> Value {
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn chat_success_bills_and_traces() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(chat_ok_response()))
		.mount(&server)
		.await;
	let h = harness(vec![test_channel(1, &server.uri(), 0)]).await;
	let ctx = h.ctx(IngressShape::Completions, RelayMode::Chat, chat_body("gpt-4o-mini", false)).await;
	let trace_id = ctx.trace_id.clone();
	let request_id = ctx.request_id.clone();

	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 200);
	let v = body_json(resp).await;
	assert_eq!(v["choices"][0]["message"]["content"], "pong");
	assert!(v["usage"]["total_tokens"].as_u64().unwrap() >= 2);

	// Committed exactly the cost, the rest of the reservation came back.
	let remaining = h.store.token_balance(7).unwrap();
	let committed = TOKEN_QUOTA - remaining;
	assert!(committed > 0);
	let record = h
		.store
		.usage_by_request_id(&request_id)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(record.quota, committed);
	assert_eq!(record.usage.prompt_tokens, 12);
	assert_eq!(record.usage.completion_tokens, 2);
	assert!(!record.usage.approximate);

	let attempts = h.service.traces.get(&trace_id).unwrap();
	assert_eq!(attempts.len(), 1);
	assert_eq!(attempts[0].outcome, Outcome::Success);
	assert_eq!(attempts[0].billed, committed);
	// Token ledger invariant: used_quota mirrors the commit.
	assert_eq!(h.token().await.used_quota, committed);
}

#[tokio::test]
async fn retry_on_429_fails_over_and_suspends() {
	let server_a = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(
			ResponseTemplate::new(429)
				.insert_header("retry-after", "5")
				.set_body_json(json!({"error": {"type": "rate_limit_error", "message": "slow down"}})),
		)
		.mount(&server_a)
		.await;
	let server_b = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(chat_ok_response()))
		.mount(&server_b)
		.await;

	// A outranks B, so A is always tried first.
	let h = harness(vec![
		test_channel(1, &server_a.uri(), 10),
		test_channel(2, &server_b.uri(), 0),
	])
	.await;
	let ctx = h.ctx(IngressShape::Completions, RelayMode::Chat, chat_body("gpt-4o-mini", false)).await;
	let trace_id = ctx.trace_id.clone();

	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 200);

	let attempts = h.service.traces.get(&trace_id).unwrap();
	assert_eq!(attempts.len(), 2);
	assert_eq!(attempts[0].channel_id, 1);
	assert_eq!(attempts[0].outcome, Outcome::HttpRate);
	assert_eq!(attempts[0].status, Some(429));
	assert_eq!(attempts[1].channel_id, 2);
	assert_eq!(attempts[1].outcome, Outcome::Success);

	// The 429 suspended (channel 1, model) per its retry-after.
	assert!(!h.service.health.available(1, "gpt-4o-mini"));
	assert!(h.service.health.available(2, "gpt-4o-mini"));
}

#[tokio::test]
async fn messages_ingress_on_completions_channel() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(chat_ok_response()))
		.mount(&server)
		.await;
	let h = harness(vec![test_channel(1, &server.uri(), 0)]).await;
	let ctx = h.ctx(
		IngressShape::Messages,
		RelayMode::Messages,
		json!({
			"model": "gpt-4o-mini",
			"max_tokens": 64,
			"messages": [{"role": "user", "content": "ping"}]
		}),
	).await;
	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 200);
	let v = body_json(resp).await;
	assert_eq!(v["type"], "message");
	assert_eq!(v["content"][0]["type"], "text");
	assert_eq!(v["content"][0]["text"], "pong");
	assert_eq!(v["stop_reason"], "end_turn");
	assert_eq!(v["usage"]["input_tokens"], 12);
	assert_eq!(v["usage"]["output_tokens"], 2);
}

#[tokio::test]
async fn structured_output_promotion_reaches_the_wire() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(chat_ok_response()))
		.mount(&server)
		.await;
	let h = harness(vec![test_channel(1, &server.uri(), 0)]).await;
	let ctx = h.ctx(
		IngressShape::Messages,
		RelayMode::Messages,
		json!({
			"model": "gpt-4o-mini",
			"max_tokens": 64,
			"messages": [{"role": "user", "content": "classify"}],
			"tools": [{
				"name": "topic_classifier",
				"input_schema": {"type": "object", "additionalProperties": false}
			}],
			"tool_choice": {"type": "tool", "name": "topic_classifier"}
		}),
	).await;
	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 200);

	let requests = server.received_requests().await.unwrap();
	assert_eq!(requests.len(), 1);
	let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
	assert_eq!(sent["response_format"]["type"], "json_schema");
	assert_eq!(sent["response_format"]["json_schema"]["strict"], true);
	assert!(sent.get("tools").is_none());
}

#[tokio::test]
async fn chat_stream_settles_after_the_stream_ends() {
	let sse = concat!(
		"data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"po\"},\"finish_reason\":null}]}\n\n",
		"data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ng\"},\"finish_reason\":\"stop\"}]}\n\n",
		"data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2,\"total_tokens\":11}}\n\n",
		"data: [DONE]\n\n",
	);
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "text/event-stream")
				.set_body_raw(sse, "text/event-stream"),
		)
		.mount(&server)
		.await;
	let h = harness(vec![test_channel(1, &server.uri(), 0)]).await;
	let ctx = h.ctx(IngressShape::Completions, RelayMode::Chat, chat_body("gpt-4o-mini", true)).await;
	let request_id = ctx.request_id.clone();

	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 200);
	assert_eq!(
		resp.headers().get(header::CONTENT_TYPE).unwrap(),
		"text/event-stream"
	);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	let text = String::from_utf8(body.to_vec()).unwrap();
	assert!(text.contains("\"content\":\"po\""));
	assert!(text.ends_with("data: [DONE]\n\n"));
	assert_eq!(text.matches("[DONE]").count(), 1);

	h.wait_settled().await;
	let record = h
		.store
		.usage_by_request_id(&request_id)
		.await
		.unwrap()
		.unwrap();
	assert!(record.streamed);
	assert_eq!(record.usage.prompt_tokens, 9);
	assert_eq!(record.usage.completion_tokens, 2);
	assert!(record.quota > 0);
	assert_eq!(h.store.token_balance(7).unwrap(), TOKEN_QUOTA - record.quota);
}

#[tokio::test]
async fn responses_stream_over_completions_channel() {
	let sse = concat!(
		"data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-5-mini\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"pong\"},\"finish_reason\":\"stop\"}]}\n\n",
		"data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-5-mini\",\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":1,\"total_tokens\":5}}\n\n",
		"data: [DONE]\n\n",
	);
	let server = MockServer::start().await;
	// OpenRouter speaks completions and passes reasoning controls through.
	Mock::given(method("POST"))
		.and(path("/api/v1/chat/completions"))
		.respond_with(
			ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"),
		)
		.mount(&server)
		.await;
	let mut channel = test_channel(1, &server.uri(), 0);
	channel.channel_type = ChannelType::OpenRouter;
	let h = harness(vec![channel]).await;
	let options = RelayOptions {
		thinking: Some(true),
		reasoning_format: Some(crate::types::ReasoningFormat::Thinking),
	};
	let ctx = h
		.ctx_with(
			IngressShape::Responses,
			RelayMode::Responses,
			json!({
				"model": "gpt-5-mini",
				"stream": true,
				"input": "ping"
			}),
			options,
		)
		.await;
	let trace_id = ctx.trace_id.clone();
	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 200);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	let text = String::from_utf8(body.to_vec()).unwrap();
	assert!(text.contains("event: response.created"));
	assert!(text.contains("\"text\":\"pong\""));
	assert!(text.contains("event: response.completed"));
	assert!(text.contains("\"total_tokens\":5"));

	// The upstream request carried the forced reasoning mode.
	let requests = server.received_requests().await.unwrap();
	let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
	assert_eq!(sent["reasoning_effort"], "medium");
	h.wait_settled().await;
	let attempts = h.service.traces.get(&trace_id).unwrap();
	assert_eq!(attempts.last().unwrap().outcome, Outcome::Success);
}

#[tokio::test]
async fn missing_usage_with_enforcement_is_retried_then_502() {
	let mut resp = chat_ok_response();
	resp.as_object_mut().unwrap().remove("usage");
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(resp))
		.mount(&server)
		.await;
	let h = harness_with(vec![test_channel(1, &server.uri(), 0)], |cfg| {
		cfg.enforce_include_usage = true;
		cfg.retry_times = 1;
	})
	.await;
	let ctx = h.ctx(IngressShape::Completions, RelayMode::Chat, chat_body("gpt-4o-mini", false)).await;
	let trace_id = ctx.trace_id.clone();
	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 502);
	// Reservation fully refunded.
	assert_eq!(h.store.token_balance(7), Some(TOKEN_QUOTA));
	let attempts = h.service.traces.get(&trace_id).unwrap();
	assert_eq!(attempts[0].outcome, Outcome::ContractViolation);
}

#[tokio::test]
async fn missing_usage_without_enforcement_estimates() {
	let mut resp = chat_ok_response();
	resp.as_object_mut().unwrap().remove("usage");
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(resp))
		.mount(&server)
		.await;
	let h = harness(vec![test_channel(1, &server.uri(), 0)]).await;
	let ctx = h.ctx(IngressShape::Completions, RelayMode::Chat, chat_body("gpt-4o-mini", false)).await;
	let request_id = ctx.request_id.clone();
	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 200);
	let record = h
		.store
		.usage_by_request_id(&request_id)
		.await
		.unwrap()
		.unwrap();
	assert!(record.usage.approximate);
	assert!(record.usage.prompt_tokens > 0);
	// "pong" is one estimated token.
	assert_eq!(record.usage.completion_tokens, 1);
}

#[tokio::test]
async fn upstream_400_is_terminal_and_refunds() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(400).set_body_json(
			json!({"error": {"type": "invalid_request_error", "message": "bad schema"}}),
		))
		.mount(&server)
		.await;
	// A second healthy channel exists, but caller errors never fail over.
	let server_b = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(chat_ok_response()))
		.mount(&server_b)
		.await;
	let h = harness(vec![
		test_channel(1, &server.uri(), 10),
		test_channel(2, &server_b.uri(), 0),
	])
	.await;
	let ctx = h.ctx(IngressShape::Completions, RelayMode::Chat, chat_body("gpt-4o-mini", false)).await;
	let trace_id = ctx.trace_id.clone();
	let resp = h.service.handle(ctx).await;
	// Caller errors surface as 400 and never fail over to channel 2.
	assert_eq!(resp.status(), 400);
	let attempts = h.service.traces.get(&trace_id).unwrap();
	assert_eq!(attempts.len(), 1);
	assert_eq!(attempts[0].outcome, Outcome::HttpBadRequest);
	assert_eq!(h.store.token_balance(7), Some(TOKEN_QUOTA));
	assert!(server_b.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn no_channel_for_model_is_503() {
	let h = harness(vec![]).await;
	let ctx = h.ctx(IngressShape::Completions, RelayMode::Chat, chat_body("gpt-4o-mini", false)).await;
	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 503);
	assert_eq!(h.store.token_balance(7), Some(TOKEN_QUOTA));
}

#[tokio::test]
async fn token_model_allow_list_is_enforced() {
	let server = MockServer::start().await;
	let h = harness(vec![test_channel(1, &server.uri(), 0)]).await;
	let mut token = h.token().await;
	token.models = Some(vec!["gpt-5-mini".into()]);
	h.store.insert_token(token);
	let ctx = h.ctx(IngressShape::Completions, RelayMode::Chat, chat_body("gpt-4o-mini", false)).await;
	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn empty_prompt_is_400() {
	let server = MockServer::start().await;
	let h = harness(vec![test_channel(1, &server.uri(), 0)]).await;
	let ctx = h.ctx(
		IngressShape::Completions,
		RelayMode::Chat,
		json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": ""}]}),
	).await;
	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn insufficient_quota_is_rejected_before_dispatch() {
	let server = MockServer::start().await;
	let h = harness(vec![test_channel(1, &server.uri(), 0)]).await;
	let mut token = h.token().await;
	token.remaining_quota = 1;
	h.store.insert_token(token);
	let ctx = h.ctx(IngressShape::Completions, RelayMode::Chat, chat_body("gpt-4o-mini", false)).await;
	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 402);
	// Nothing hit the upstream.
	assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn model_mapping_applies_per_attempt() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(chat_ok_response()))
		.mount(&server)
		.await;
	let mut channel = test_channel(1, &server.uri(), 0);
	channel
		.model_mapping
		.insert("gpt-4o-mini".into(), "vendor-mini-v2".into());
	let h = harness(vec![channel]).await;
	let ctx = h.ctx(IngressShape::Completions, RelayMode::Chat, chat_body("gpt-4o-mini", false)).await;
	let resp = h.service.handle(ctx).await;
	assert_eq!(resp.status(), 200);
	let requests = server.received_requests().await.unwrap();
	let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
	assert_eq!(sent["model"], "vendor-mini-v2");
}
