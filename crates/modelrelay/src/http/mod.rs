use std::net::IpAddr;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub mod auth;
pub mod error;

pub use axum::body::Body;

use crate::ratelimit::Scope;
use crate::relay::RelayService;
use crate::types::{IngressShape, RelayMode, RelayOptions, RequestContext};
use error::ErrorKind;

pub const REQUEST_ID_HEADER: &str = "x-oneapi-request-id";
pub const TRACE_ID_HEADER: &str = "x-oneapi-trace-id";
/// Admin channel-affinity hint.
pub const CHANNEL_HINT_HEADER: &str = "x-oneapi-channel";

#[derive(Clone)]
pub struct AppState {
	pub relay: Arc<RelayService>,
}

pub fn router(state: AppState) -> Router {
	let body_limit = state.relay.cfg.body_limit;
	Router::new()
		.route("/v1/chat/completions", post(chat_completions))
		.route("/v1/responses", post(responses_api))
		.route("/v1/messages", post(messages_api))
		.route("/v1/embeddings", post(embeddings))
		.route("/v1/images/generations", post(images_generations))
		.route("/v1/images/edits", post(images_edits))
		.route("/v1/audio/{*op}", post(audio))
		.route("/v1/rerank", post(rerank))
		.route("/v1/models", get(models))
		.route("/api/cost/request/{id}", get(cost_lookup))
		.route("/api/token/consume", post(token_consume))
		.layer(axum::extract::DefaultBodyLimit::max(body_limit))
		.layer(tower_http::cors::CorsLayer::permissive())
		.layer(tower_http::catch_panic::CatchPanicLayer::custom(
			|_panic: Box<dyn std::any::Any + Send>| {
				ErrorKind::Internal("request handler panicked".to_string()).into_response(None)
			},
		))
		.with_state(state)
}

fn gen_id(prefix: &str) -> String {
	// Time-prefixed so ids sort by arrival; the uuid tail makes them unique.
	format!(
		"{prefix}{:012x}{}",
		Utc::now().timestamp_millis(),
		&uuid::Uuid::new_v4().simple().to_string()[..12]
	)
}

fn client_ip(headers: &HeaderMap) -> IpAddr {
	headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').next())
		.and_then(|v| v.trim().parse().ok())
		.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}

/// Pull the model name out of the request without committing to a full
/// parse; multipart bodies (audio uploads) get a light form-field scan.
fn extract_model(body: &Bytes, content_type: Option<&str>) -> Option<String> {
	if let Some(ct) = content_type
		&& ct.starts_with("multipart/form-data")
	{
		return extract_multipart_field(body, "model");
	}
	serde_json::from_slice::<Value>(body)
		.ok()?
		.get("model")?
		.as_str()
		.map(str::to_string)
}

fn extract_multipart_field(body: &Bytes, field: &str) -> Option<String> {
	let text = String::from_utf8_lossy(body);
	let marker = format!("name=\"{field}\"");
	let at = text.find(&marker)?;
	let rest = &text[at + marker.len()..];
	let start = rest.find("\r\n\r\n").map(|i| i + 4)?;
	let rest = &rest[start..];
	let end = rest.find("\r\n")?;
	Some(rest[..end].trim().to_string())
}

fn id_headers(resp: &mut Response, request_id: &str, trace_id: &str) {
	if let Ok(v) = HeaderValue::from_str(request_id) {
		resp.headers_mut().insert(REQUEST_ID_HEADER, v);
	}
	if let Ok(v) = HeaderValue::from_str(trace_id) {
		resp.headers_mut().insert(TRACE_ID_HEADER, v);
	}
}

#[allow(clippy::too_many_arguments)]
async fn relay_entry(
	state: AppState,
	headers: HeaderMap,
	options: RelayOptions,
	body: Bytes,
	shape: IngressShape,
	mode: RelayMode,
) -> Response {
	let request_id = gen_id("req_");
	let trace_id = gen_id("trace_");
	let ip = client_ip(&headers);
	let relay = &state.relay;

	let mut resp = relay_inner(relay, &headers, options, body, shape, mode, ip, &request_id, &trace_id)
		.await
		.unwrap_or_else(|kind| kind.into_response(Some(shape)));
	id_headers(&mut resp, &request_id, &trace_id);
	resp
}

#[allow(clippy::too_many_arguments)]
async fn relay_inner(
	relay: &Arc<RelayService>,
	headers: &HeaderMap,
	options: RelayOptions,
	body: Bytes,
	shape: IngressShape,
	mode: RelayMode,
	ip: IpAddr,
	request_id: &str,
	trace_id: &str,
) -> Result<Response, ErrorKind> {
	relay
		.limiter
		.check(Scope::GlobalApi, &ip.to_string())
		.await
		.map_err(|e| ErrorKind::RateLimited {
			retry_after_secs: e.retry_after_secs,
		})?;
	let principal =
		auth::authenticate(relay.store.as_ref(), &relay.cfg, headers, ip).await?;

	let content_type = headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);
	let model = extract_model(&body, content_type.as_deref())
		.ok_or_else(|| ErrorKind::InvalidRequest("model not specified".to_string()))?;
	let channel_hint = headers
		.get(CHANNEL_HINT_HEADER)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse().ok());

	let ctx = RequestContext {
		request_id: request_id.to_string(),
		trace_id: trace_id.to_string(),
		user: principal.user,
		token: principal.token,
		shape,
		mode,
		model,
		options,
		body,
		content_type,
		client_ip: ip,
		channel_hint,
		estimated_prompt_tokens: 0,
		started: Instant::now(),
	};
	Ok(relay.handle(ctx).await)
}

async fn chat_completions(
	State(state): State<AppState>,
	Query(options): Query<RelayOptions>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	// A Responses-API payload posted to the chat path is either transparently
	// re-routed (default) or redirected, per configuration.
	let (shape, mode) = match serde_json::from_slice::<Value>(&body) {
		Ok(v) if crate::llm::types::responses::Request::looks_like_responses_body(&v) => {
			if state.relay.cfg.auto_detect_redirect {
				return (
					StatusCode::FOUND,
					[(header::LOCATION, HeaderValue::from_static("/v1/responses"))],
				)
					.into_response();
			}
			(IngressShape::Responses, RelayMode::Responses)
		},
		_ => (IngressShape::Completions, RelayMode::Chat),
	};
	relay_entry(state, headers, options, body, shape, mode).await
}

async fn responses_api(
	State(state): State<AppState>,
	Query(options): Query<RelayOptions>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	relay_entry(
		state,
		headers,
		options,
		body,
		IngressShape::Responses,
		RelayMode::Responses,
	)
	.await
}

async fn messages_api(
	State(state): State<AppState>,
	Query(options): Query<RelayOptions>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	relay_entry(
		state,
		headers,
		options,
		body,
		IngressShape::Messages,
		RelayMode::Messages,
	)
	.await
}

async fn embeddings(
	State(state): State<AppState>,
	Query(options): Query<RelayOptions>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	relay_entry(
		state,
		headers,
		options,
		body,
		IngressShape::Completions,
		RelayMode::Embeddings,
	)
	.await
}

async fn images_generations(
	State(state): State<AppState>,
	Query(options): Query<RelayOptions>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	relay_entry(
		state,
		headers,
		options,
		body,
		IngressShape::Completions,
		RelayMode::ImagesGenerations,
	)
	.await
}

async fn images_edits(
	State(state): State<AppState>,
	Query(options): Query<RelayOptions>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	relay_entry(
		state,
		headers,
		options,
		body,
		IngressShape::Completions,
		RelayMode::ImagesEdits,
	)
	.await
}

async fn audio(
	State(state): State<AppState>,
	Path(op): Path<String>,
	Query(options): Query<RelayOptions>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let mode = match op.as_str() {
		"speech" => RelayMode::AudioSpeech,
		"transcriptions" => RelayMode::AudioTranscription,
		"translations" => RelayMode::AudioTranslation,
		_ => {
			return ErrorKind::InvalidRequest(format!("unknown audio operation {op}"))
				.into_response(Some(IngressShape::Completions));
		},
	};
	relay_entry(
		state,
		headers,
		options,
		body,
		IngressShape::Completions,
		mode,
	)
	.await
}

async fn rerank(
	State(state): State<AppState>,
	Query(options): Query<RelayOptions>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	relay_entry(
		state,
		headers,
		options,
		body,
		IngressShape::Completions,
		RelayMode::Rerank,
	)
	.await
}

#[derive(Serialize)]
struct ModelCard {
	id: String,
	object: &'static str,
	created: i64,
	owned_by: &'static str,
}

async fn models(State(state): State<AppState>, headers: HeaderMap) -> Response {
	let relay = &state.relay;
	let ip = client_ip(&headers);
	if let Err(e) = relay.limiter.check(Scope::GlobalApi, &ip.to_string()).await {
		return ErrorKind::RateLimited {
			retry_after_secs: e.retry_after_secs,
		}
		.into_response(None);
	}
	let principal = match auth::authenticate(relay.store.as_ref(), &relay.cfg, &headers, ip).await {
		Ok(p) => p,
		Err(kind) => return kind.into_response(None),
	};
	let snapshot = relay.registry.snapshot();
	let created = Utc::now().timestamp();
	let data: Vec<ModelCard> = snapshot
		.models_for_group(&principal.user.group)
		.into_iter()
		.filter(|m| principal.token.model_allowed(m))
		.map(|id| ModelCard {
			id,
			object: "model",
			created,
			owned_by: "modelrelay",
		})
		.collect();
	axum::Json(serde_json::json!({"object": "list", "data": data})).into_response()
}

#[derive(Serialize)]
struct CostResponse {
	id: String,
	created_time: i64,
	user_id: i64,
	request_id: String,
	quota: i64,
	cost_usd: f64,
}

async fn cost_lookup(
	State(state): State<AppState>,
	Path(id): Path<String>,
	headers: HeaderMap,
) -> Response {
	let relay = &state.relay;
	let ip = client_ip(&headers);
	if let Err(e) = relay.limiter.check(Scope::GlobalWeb, &ip.to_string()).await {
		return ErrorKind::RateLimited {
			retry_after_secs: e.retry_after_secs,
		}
		.into_response(None);
	}
	let principal = match auth::authenticate(relay.store.as_ref(), &relay.cfg, &headers, ip).await {
		Ok(p) => p,
		Err(kind) => return kind.into_response(None),
	};
	let record = match relay.store.usage_by_request_id(&id).await {
		Ok(Some(record)) if record.user_id == principal.user.id => record,
		Ok(_) => {
			return ErrorKind::InvalidRequest("request not found".to_string()).into_response(None);
		},
		Err(e) => return ErrorKind::from(e).into_response(None),
	};
	let cost_usd = record.cost_usd(relay.cfg.quota_per_usd);
	axum::Json(CostResponse {
		id: record.request_id.clone(),
		created_time: record.created_at.timestamp(),
		user_id: record.user_id,
		request_id: record.request_id,
		quota: record.quota,
		cost_usd,
	})
	.into_response()
}

#[derive(Deserialize)]
struct ConsumeRequest {
	add_reason: String,
	add_used_quota: i64,
}

/// External billing ingest: a background job reports consumption after the
/// fact, authenticated with the token's own key, debiting that same token.
async fn token_consume(
	State(state): State<AppState>,
	headers: HeaderMap,
	axum::Json(req): axum::Json<ConsumeRequest>,
) -> Response {
	let relay = &state.relay;
	let ip = client_ip(&headers);
	if let Err(e) = relay.limiter.check(Scope::Critical, &ip.to_string()).await {
		return ErrorKind::RateLimited {
			retry_after_secs: e.retry_after_secs,
		}
		.into_response(None);
	}
	let principal = match auth::authenticate(relay.store.as_ref(), &relay.cfg, &headers, ip).await {
		Ok(p) => p,
		Err(kind) => return kind.into_response(None),
	};
	if req.add_used_quota < 0 {
		return ErrorKind::InvalidRequest("add_used_quota must be non-negative".to_string())
			.into_response(None);
	}
	match relay
		.ledger
		.external_adjust(&principal.token, req.add_used_quota, &req.add_reason)
		.await
	{
		Ok(()) => axum::Json(serde_json::json!({"success": true})).into_response(),
		Err(e) => ErrorKind::from(e).into_response(None),
	}
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
