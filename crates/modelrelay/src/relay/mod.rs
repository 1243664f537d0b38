use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use tracing::{info, warn};

use crate::Config;
use crate::health::{HealthController, reason_for};
use crate::http::Body;
use crate::http::error::ErrorKind;
use crate::ledger::{QuotaLedger, ReservationHandle};
use crate::llm::conversion::{self, ResponseInfo};
use crate::llm::{AIError, AIProvider, Payload, UpstreamFormat};
use crate::pricing::{ModelPrice, PriceTable, estimate_tokens_from_chars};
use crate::ratelimit::{RateLimiter, Scope};
use crate::registry::ChannelRegistry;
use crate::store::Store;
use crate::telemetry::{AsyncLog, TraceStore};
use crate::types::{
	Attempt, Channel, IngressShape, Outcome, RelayMode, RequestContext, Usage, UsageRecord,
};

pub mod assets;
pub mod finalize;
pub mod probe;

use finalize::StreamEnd;

/// The relay pipeline: admit, reserve, attempt (with channel failover),
/// stream or buffer, classify, settle, log. One instance serves the whole
/// process; per-request state lives in [`RequestContext`].
pub struct RelayService {
	pub cfg: Arc<Config>,
	pub store: Arc<dyn Store>,
	pub ledger: Arc<QuotaLedger>,
	pub registry: Arc<ChannelRegistry>,
	pub health: Arc<HealthController>,
	pub limiter: Arc<RateLimiter>,
	pub pricing: Arc<PriceTable>,
	pub traces: Arc<TraceStore>,
	client: reqwest::Client,
	asset_client: reqwest::Client,
}

enum AttemptResult {
	/// Final response for the client; settlement already arranged.
	Done(axum::response::Response),
	/// Upstream failure; retried on another channel unless the outcome is
	/// terminal (caller errors never fail over).
	Failed {
		outcome: Outcome,
		status: Option<u16>,
		retry_after: Option<Duration>,
		message: String,
	},
}

impl RelayService {
	pub fn new(
		cfg: Arc<Config>,
		store: Arc<dyn Store>,
		ledger: Arc<QuotaLedger>,
		registry: Arc<ChannelRegistry>,
		health: Arc<HealthController>,
		limiter: Arc<RateLimiter>,
	) -> anyhow::Result<Self> {
		let mut builder = reqwest::Client::builder().connect_timeout(cfg.connect_timeout);
		if let Some(proxy) = &cfg.relay_proxy {
			builder = builder.proxy(reqwest::Proxy::all(proxy)?);
		}
		let client = builder.build()?;
		let mut asset_builder = reqwest::Client::builder()
			.connect_timeout(cfg.connect_timeout)
			.timeout(Duration::from_secs(20));
		if let Some(proxy) = cfg.user_content_proxy.as_ref().or(cfg.relay_proxy.as_ref()) {
			asset_builder = asset_builder.proxy(reqwest::Proxy::all(proxy)?);
		}
		let asset_client = asset_builder.build()?;
		let pricing = Arc::new(PriceTable::new(cfg.quota_per_usd));
		Ok(Self {
			cfg,
			store,
			ledger,
			registry,
			health,
			limiter,
			pricing,
			traces: Arc::new(TraceStore::default()),
			client,
			asset_client,
		})
	}

	pub async fn handle(&self, ctx: RequestContext) -> axum::response::Response {
		match self.handle_inner(ctx).await {
			Ok(resp) => resp,
			Err((shape, kind)) => kind.into_response(shape),
		}
	}

	async fn handle_inner(
		&self,
		mut ctx: RequestContext,
	) -> Result<axum::response::Response, (Option<IngressShape>, ErrorKind)> {
		let shape = Some(ctx.shape);
		let err = |kind: ErrorKind| (shape, kind);

		// Admit: token rate limit, then the token's model allow-list. Group
		// availability is checked by selection itself.
		self
			.limiter
			.check(Scope::RelayToken, &ctx.token.id.to_string())
			.await
			.map_err(|e| {
				err(ErrorKind::RateLimited {
					retry_after_secs: e.retry_after_secs,
				})
			})?;
		if !ctx.token.model_allowed(&ctx.model) {
			return Err(err(ErrorKind::ModelNotAllowed(ctx.model.clone())));
		}

		let mut payload = Payload::parse(ctx.mode, &ctx.body).map_err(|e| err(e.into()))?;
		if matches!(
			ctx.mode,
			RelayMode::Chat | RelayMode::Messages | RelayMode::Responses
		) && payload
			.prompt_messages()
			.iter()
			.all(|m| m.content.is_empty())
		{
			return Err(err(ErrorKind::InvalidRequest(
				"prompt must not be empty".to_string(),
			)));
		}
		payload.ensure_stream_usage();
		ctx.estimated_prompt_tokens =
			crate::llm::estimate_prompt_tokens(&ctx.model, &payload.prompt_messages());
		assets::inline_images(&self.asset_client, &mut payload, self.cfg.max_inline_image_size)
			.await;

		// Reserve against the global price for the requested model; the
		// channel override only affects the final commit.
		let base_price = self.pricing.resolve(&ctx.model, &Default::default()).clone();
		let padding = if ctx.mode.is_background() {
			self.cfg.reservation_padding
		} else {
			0
		};
		let estimate = self
			.pricing
			.estimate(&base_price, ctx.estimated_prompt_tokens, padding);
		let handle = self
			.ledger
			.reserve(&ctx.token, estimate)
			.await
			.map_err(|e| err(e.into()))?;
		// Settlement is idempotent by handle, so the guard may fire even on
		// paths that already refunded; it exists so a panic or early return
		// between reserve and settle can never strand the reservation.
		let mut guard = ReservationGuard {
			ledger: self.ledger.clone(),
			handle,
			armed: true,
		};

		// Attempt loop: each retry excludes channels already tried.
		let mut excluded: HashSet<i64> = HashSet::new();
		let mut last_failure: Option<(Outcome, Option<Duration>, String)> = None;
		let mut attempts_made = 0u32;
		for _ in 0..=self.cfg.retry_times {
			let snapshot = self.registry.snapshot();
			let Some(channel) = snapshot.select(
				&ctx.user.group,
				&ctx.model,
				&excluded,
				ctx.channel_hint,
				&self.health,
			) else {
				break;
			};
			excluded.insert(channel.id);
			if self
				.limiter
				.check(Scope::Channel, &channel.id.to_string())
				.await
				.is_err()
			{
				continue;
			}
			attempts_made += 1;
			match self
				.attempt(&ctx, &channel, &payload, handle, attempts_made - 1)
				.await
			{
				AttemptResult::Done(resp) => {
					// Success settles through commit (buffered) or the stream
					// settler; the guard must not refund behind their back.
					guard.armed = false;
					return Ok(resp);
				},
				AttemptResult::Failed {
					outcome,
					status,
					retry_after,
					message,
				} => {
					let upstream_model = channel.upstream_model(&ctx.model).to_string();
					if let Some(reason) = reason_for(outcome) {
						self
							.health
							.suspend(channel.id, &ctx.model, reason, retry_after);
					}
					if self.health.observe(channel.id, &ctx.model, false) {
						warn!(channel = channel.id, "rolling failures crossed the disable threshold");
						let _ = self
							.store
							.set_channel_status(channel.id, crate::types::ChannelStatus::AutoDisabled)
							.await;
						let _ = self.registry.rebuild().await;
					}
					self.traces.record(
						&ctx.trace_id,
						Attempt {
							channel_id: channel.id,
							upstream_model,
							outcome,
							status,
							latency: ctx.started.elapsed(),
							usage: None,
							billed: 0,
							error: Some(message.clone()),
							annotations: vec![],
						},
					);
					warn!(
						request_id = %ctx.request_id,
						channel = channel.id,
						?outcome,
						status,
						"upstream attempt failed, {}",
						message
					);
					last_failure = Some((outcome, retry_after, message));
					if !outcome.retryable() {
						break;
					}
				},
			}
		}

		self
			.refund_and_log(&ctx, None, &handle, attempts_made)
			.await;
		Err(err(match last_failure {
			None => ErrorKind::NoChannelAvailable,
			Some((Outcome::HttpRate, retry_after, _)) => ErrorKind::UpstreamRateLimited {
				retry_after_secs: retry_after.map(|d| d.as_secs()).unwrap_or(60).max(1),
			},
			Some((Outcome::HttpBadRequest, _, message)) => ErrorKind::InvalidRequest(message),
			Some((_, _, message)) => ErrorKind::Upstream(message),
		}))
	}

	async fn refund_and_log(
		&self,
		ctx: &RequestContext,
		channel_id: Option<i64>,
		handle: &ReservationHandle,
		retries: u32,
	) {
		if let Err(e) = self.ledger.refund(*handle).await {
			warn!(request_id = %ctx.request_id, error = %e, "refund failed");
		}
		let record = UsageRecord {
			request_id: ctx.request_id.clone(),
			trace_id: ctx.trace_id.clone(),
			user_id: ctx.user.id,
			token_id: ctx.token.id,
			channel_id,
			model: ctx.model.clone(),
			usage: Usage::default(),
			quota: 0,
			latency_ms: ctx.started.elapsed().as_millis() as u64,
			streamed: false,
			finish_reason: None,
			retries,
			created_at: Utc::now(),
		};
		let _ = self.store.record_usage(record).await;
	}

	async fn attempt(
		&self,
		ctx: &RequestContext,
		channel: &Arc<Channel>,
		payload: &Payload,
		handle: ReservationHandle,
		retries: u32,
	) -> AttemptResult {
		let provider = AIProvider::from(channel.channel_type);
		let upstream_model = channel.upstream_model(&ctx.model).to_string();
		let failed = |outcome: Outcome, message: String| AttemptResult::Failed {
			outcome,
			status: None,
			retry_after: None,
			message,
		};

		let format = match provider.upstream_format(ctx.mode) {
			Ok(f) => f,
			Err(e) => return failed(Outcome::TransportError, e.to_string()),
		};

		// Channel-local copy: upstream model name, reasoning toggles.
		let mut payload = payload.clone();
		payload.set_model(&upstream_model);
		let mut annotations = Vec::new();
		if let Some(thinking) = ctx.options.thinking
			&& !payload.apply_thinking(provider, &upstream_model, thinking)
			&& thinking
		{
			annotations.push("reasoning_unsupported".to_string());
		}

		let streaming = payload.streaming();
		let body = match self.build_upstream_body(ctx, channel, provider, format, &payload) {
			Ok(b) => b,
			Err(e) => return failed(Outcome::TransportError, e.to_string()),
		};
		let url = match provider.build_url(channel, ctx.mode, &upstream_model, streaming) {
			Ok(u) => u,
			Err(e) => return failed(Outcome::TransportError, e.to_string()),
		};
		let mut headers = HeaderMap::new();
		if let Payload::Raw { .. } = &payload {
			if let Some(ct) = &ctx.content_type
				&& let Ok(v) = HeaderValue::from_str(ct)
			{
				headers.insert(header::CONTENT_TYPE, v);
			}
		} else {
			headers.insert(
				header::CONTENT_TYPE,
				HeaderValue::from_static("application/json"),
			);
		}
		if let Err(e) = provider.build_headers(channel, &mut headers) {
			return failed(Outcome::TransportError, e.to_string());
		}
		if provider == AIProvider::Bedrock
			&& let Err(e) =
				crate::llm::bedrock::sign_request(&channel.credential, "POST", &url, &mut headers, &body)
		{
			return failed(Outcome::TransportError, e.to_string());
		}

		let mut request = self.client.post(&url).headers(headers).body(body);
		if !streaming {
			request = request.timeout(self.cfg.request_timeout);
		}
		let started = Instant::now();
		let resp = match request.send().await {
			Ok(resp) => resp,
			Err(e) if e.is_timeout() => return failed(Outcome::Timeout, e.to_string()),
			Err(e) => return failed(Outcome::TransportError, e.to_string()),
		};

		let status = resp.status();
		if !status.is_success() {
			return self.classify_failure(ctx, status, resp).await;
		}

		self.health.observe(channel.id, &ctx.model, true);
		let price = self
			.pricing
			.resolve(&ctx.model, &channel.model_overrides)
			.clone();

		if streaming {
			self.stream_response(ctx, channel, provider, format, resp, price, handle, retries, annotations)
		} else {
			self
				.buffered_response(ctx, channel, format, resp, price, handle, retries, annotations, started)
				.await
		}
	}

	async fn classify_failure(
		&self,
		_ctx: &RequestContext,
		status: StatusCode,
		resp: reqwest::Response,
	) -> AttemptResult {
		let retry_after = resp
			.headers()
			.get(header::RETRY_AFTER)
			.and_then(|v| v.to_str().ok())
			.and_then(parse_retry_after);
		let body = resp.bytes().await.unwrap_or_default();
		let message = sanitize_error(&body);
		match status.as_u16() {
			429 => AttemptResult::Failed {
				outcome: Outcome::HttpRate,
				status: Some(429),
				retry_after,
				message,
			},
			401 | 403 => AttemptResult::Failed {
				outcome: Outcome::HttpAuth,
				status: Some(status.as_u16()),
				retry_after: None,
				message,
			},
			code if (400..500).contains(&code) => AttemptResult::Failed {
				outcome: Outcome::HttpBadRequest,
				status: Some(code),
				retry_after: None,
				message,
			},
			code => AttemptResult::Failed {
				outcome: Outcome::Http5xx,
				status: Some(code),
				retry_after: None,
				message,
			},
		}
	}

	fn build_upstream_body(
		&self,
		ctx: &RequestContext,
		channel: &Channel,
		provider: AIProvider,
		format: UpstreamFormat,
		payload: &Payload,
	) -> Result<Vec<u8>, AIError> {
		let marshal = |v: &dyn erased_ser::ErasedSerialize| -> Result<Vec<u8>, AIError> {
			v.to_vec().map_err(AIError::RequestMarshal)
		};
		match (format, payload) {
			(UpstreamFormat::Completions, Payload::Chat(r)) => marshal(r),
			(UpstreamFormat::Completions, Payload::Messages(r)) => {
				let model = r.model.as_deref().unwrap_or_default();
				let promote = channel.structured_promotion_allowed(model);
				let chat = conversion::completions::from_messages::translate(r, promote)?;
				marshal(&chat)
			},
			(UpstreamFormat::Completions, Payload::Responses(r)) => {
				let mut chat = conversion::completions::from_responses::to_completions(r)?;
				if chat.stream.unwrap_or_default() && chat.stream_options.is_none() {
					chat.stream_options = Some(crate::llm::types::completions::StreamOptions {
						include_usage: true,
						rest: Default::default(),
					});
				}
				marshal(&chat)
			},
			(UpstreamFormat::Messages, Payload::Messages(r)) => {
				if provider == AIProvider::Bedrock {
					conversion::messages::prepare_bedrock(r)
				} else {
					marshal(r)
				}
			},
			(UpstreamFormat::Messages, Payload::Chat(r)) => {
				let translated = conversion::messages::from_completions::translate(r)?;
				if provider == AIProvider::Bedrock {
					conversion::messages::prepare_bedrock(&translated)
				} else {
					marshal(&translated)
				}
			},
			(UpstreamFormat::Messages, Payload::Responses(r)) => {
				let translated = conversion::messages::from_responses::translate(r)?;
				if provider == AIProvider::Bedrock {
					conversion::messages::prepare_bedrock(&translated)
				} else {
					marshal(&translated)
				}
			},
			(UpstreamFormat::Responses, Payload::Responses(r)) => marshal(r),
			(UpstreamFormat::Passthrough, Payload::Raw { body, .. }) => Ok(body.to_vec()),
			(UpstreamFormat::Passthrough, Payload::Embeddings(r)) => marshal(r),
			(UpstreamFormat::Passthrough, Payload::Images(r)) => marshal(r),
			(UpstreamFormat::Passthrough, Payload::Rerank(r)) => marshal(r),
			_ => Err(AIError::UnsupportedConversion(format!(
				"{:?} ingress for {:?} upstream",
				ctx.shape, format
			))),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn stream_response(
		&self,
		ctx: &RequestContext,
		channel: &Arc<Channel>,
		provider: AIProvider,
		format: UpstreamFormat,
		resp: reqwest::Response,
		price: ModelPrice,
		handle: ReservationHandle,
		retries: u32,
		annotations: Vec<String>,
	) -> AttemptResult {
		let timed_out = Arc::new(AtomicBool::new(false));
		let timed_out_mark = timed_out.clone();
		let idle = self.cfg.idle_timeout;
		let upstream = tokio_stream::StreamExt::timeout(resp.bytes_stream(), idle).map(move |item| {
			match item {
				Ok(Ok(chunk)) => Ok(chunk),
				Ok(Err(e)) => Err(axum::Error::new(e)),
				Err(elapsed) => {
					timed_out_mark.store(true, Ordering::SeqCst);
					Err(axum::Error::new(elapsed))
				},
			}
		});
		let mut upstream_body = Body::from_stream(upstream);
		if provider == AIProvider::Bedrock {
			upstream_body = crate::parse::aws::eventstream_to_sse(upstream_body);
		}

		let log = AsyncLog::<ResponseInfo>::default();
		log.store(Some(ResponseInfo::default()));
		let limit = self.cfg.line_limit;
		let reasoning_format = ctx.options.reasoning_format_or(ctx.shape);
		let egress = match (ctx.shape, format) {
			(IngressShape::Completions, UpstreamFormat::Completions) => {
				conversion::completions::chat_stream(upstream_body, limit, log.clone(), reasoning_format)
			},
			(IngressShape::Completions, UpstreamFormat::Messages) => {
				conversion::messages::from_completions::translate_stream(
					upstream_body,
					limit,
					log.clone(),
					reasoning_format,
				)
			},
			(IngressShape::Messages, UpstreamFormat::Messages) => {
				conversion::messages::passthrough_stream(upstream_body, limit, log.clone())
			},
			(IngressShape::Messages, UpstreamFormat::Completions) => {
				conversion::completions::from_messages::translate_stream(upstream_body, limit, log.clone())
			},
			(IngressShape::Responses, UpstreamFormat::Responses) => {
				conversion::responses::passthrough_stream(upstream_body, limit, log.clone())
			},
			(IngressShape::Responses, UpstreamFormat::Completions) => {
				conversion::completions::from_responses::translate_stream(upstream_body, limit, log.clone())
			},
			(IngressShape::Responses, UpstreamFormat::Messages) => {
				conversion::messages::from_responses::translate_stream(upstream_body, limit, log.clone())
			},
			(shape, format) => {
				return AttemptResult::Failed {
					outcome: Outcome::TransportError,
					status: None,
					retry_after: None,
					message: format!("no stream conversion from {format:?} to {shape:?}"),
				};
			},
		};

		let settler = Settler {
			store: self.store.clone(),
			ledger: self.ledger.clone(),
			pricing: self.pricing.clone(),
			traces: self.traces.clone(),
			enforce_usage: self.cfg.enforce_include_usage,
			request_id: ctx.request_id.clone(),
			trace_id: ctx.trace_id.clone(),
			user_id: ctx.user.id,
			token_id: ctx.token.id,
			channel_id: channel.id,
			model: ctx.model.clone(),
			upstream_model: channel.upstream_model(&ctx.model).to_string(),
			estimated_prompt_tokens: ctx.estimated_prompt_tokens,
			price,
			handle,
			retries,
			annotations,
			streamed: true,
			started: ctx.started,
		};
		let body = finalize::on_stream_end(egress, move |end| {
			let end = if timed_out.load(Ordering::SeqCst) {
				StreamEnd::Errored
			} else {
				end
			};
			let info = log.take().unwrap_or_default();
			tokio::spawn(settler.settle_stream(end, info));
		});

		let mut response = axum::response::Response::new(body);
		response.headers_mut().insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("text/event-stream"),
		);
		response
			.headers_mut()
			.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
		AttemptResult::Done(response)
	}

	#[allow(clippy::too_many_arguments)]
	async fn buffered_response(
		&self,
		ctx: &RequestContext,
		channel: &Arc<Channel>,
		format: UpstreamFormat,
		resp: reqwest::Response,
		price: ModelPrice,
		handle: ReservationHandle,
		retries: u32,
		annotations: Vec<String>,
		started: Instant,
	) -> AttemptResult {
		let bytes = match resp.bytes().await {
			Ok(b) => b,
			Err(e) if e.is_timeout() => {
				return AttemptResult::Failed {
					outcome: Outcome::Timeout,
					status: None,
					retry_after: None,
					message: e.to_string(),
				};
			},
			Err(e) => {
				return AttemptResult::Failed {
					outcome: Outcome::TransportError,
					status: None,
					retry_after: None,
					message: e.to_string(),
				};
			},
		};

		let log = AsyncLog::<ResponseInfo>::default();
		log.store(Some(ResponseInfo::default()));
		let reasoning_format = ctx.options.reasoning_format_or(ctx.shape);
		let out = match self.convert_buffered(ctx, format, &bytes, &log, reasoning_format) {
			Ok(out) => out,
			Err(e) => {
				return AttemptResult::Failed {
					outcome: Outcome::Http5xx,
					status: None,
					retry_after: None,
					message: format!("unparseable upstream response: {e}"),
				};
			},
		};
		let mut info = log.take().unwrap_or_default();

		if !info.saw_usage {
			if self.cfg.enforce_include_usage {
				return AttemptResult::Failed {
					outcome: Outcome::ContractViolation,
					status: None,
					retry_after: None,
					message: "provider omitted usage".to_string(),
				};
			}
			info.usage.prompt_tokens = ctx.estimated_prompt_tokens;
			info.usage.completion_tokens = estimate_tokens_from_chars(info.completion_chars);
			info.usage.approximate = true;
		}
		if let Some(extra) = mode_usage(ctx.mode, &bytes) {
			info.usage.merge_cumulative(&extra);
		}

		let cost = self.pricing.cost(&price, &info.usage);
		if let Err(e) = self.ledger.commit(handle, cost).await {
			warn!(request_id = %ctx.request_id, error = %e, "commit failed");
		}
		self.traces.record(
			&ctx.trace_id,
			Attempt {
				channel_id: channel.id,
				upstream_model: channel.upstream_model(&ctx.model).to_string(),
				outcome: Outcome::Success,
				status: Some(200),
				latency: started.elapsed(),
				usage: Some(info.usage.clone()),
				billed: cost,
				error: None,
				annotations,
			},
		);
		let record = UsageRecord {
			request_id: ctx.request_id.clone(),
			trace_id: ctx.trace_id.clone(),
			user_id: ctx.user.id,
			token_id: ctx.token.id,
			channel_id: Some(channel.id),
			model: ctx.model.clone(),
			usage: info.usage.clone(),
			quota: cost,
			latency_ms: ctx.started.elapsed().as_millis() as u64,
			streamed: false,
			finish_reason: info.finish_reason.clone(),
			retries,
			created_at: Utc::now(),
		};
		let _ = self.store.record_usage(record).await;
		info!(
			request_id = %ctx.request_id,
			channel = channel.id,
			model = %ctx.model,
			quota = cost,
			prompt_tokens = info.usage.prompt_tokens,
			completion_tokens = info.usage.completion_tokens,
			"relay completed"
		);

		let mut response = axum::response::Response::new(Body::from(out));
		response.headers_mut().insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		AttemptResult::Done(response)
	}

	fn convert_buffered(
		&self,
		ctx: &RequestContext,
		format: UpstreamFormat,
		bytes: &Bytes,
		log: &AsyncLog<ResponseInfo>,
		reasoning_format: crate::types::ReasoningFormat,
	) -> Result<Bytes, AIError> {
		match (ctx.shape, format) {
			(IngressShape::Completions, UpstreamFormat::Completions) => {
				let resp = conversion::completions::chat_response(bytes, log, reasoning_format)?;
				serde_json::to_vec(&resp)
					.map(Bytes::from)
					.map_err(AIError::ResponseMarshal)
			},
			(IngressShape::Completions, UpstreamFormat::Messages) => {
				let resp = conversion::messages::from_completions::translate_response(
					bytes,
					reasoning_format,
				)?;
				observe_chat_usage(&resp, log);
				serde_json::to_vec(&resp)
					.map(Bytes::from)
					.map_err(AIError::ResponseMarshal)
			},
			(IngressShape::Messages, UpstreamFormat::Messages) => {
				let resp = serde_json::from_slice::<crate::llm::types::messages::MessagesResponse>(bytes)
					.map_err(AIError::ResponseParsing)?;
				let usage = resp.usage.to_usage();
				log.non_atomic_mutate(|r| {
					r.merge_usage(&usage);
					r.provider_model = Some(resp.model.clone());
					r.finish_reason = resp
						.stop_reason
						.as_ref()
						.map(|s| conversion::messages::stop_reason_to_finish(s).to_string());
				});
				Ok(bytes.clone())
			},
			(IngressShape::Messages, UpstreamFormat::Completions) => {
				let resp = conversion::completions::from_messages::translate_response(bytes)?;
				let usage = resp.usage.to_usage();
				log.non_atomic_mutate(|r| {
					r.merge_usage(&usage);
					r.provider_model = Some(resp.model.clone());
					r.finish_reason = resp
						.stop_reason
						.as_ref()
						.map(|s| conversion::messages::stop_reason_to_finish(s).to_string());
				});
				serde_json::to_vec(&resp)
					.map(Bytes::from)
					.map_err(AIError::ResponseMarshal)
			},
			(IngressShape::Responses, UpstreamFormat::Responses) => {
				let resp = conversion::responses::passthrough_response(bytes, log)?;
				serde_json::to_vec(&resp)
					.map(Bytes::from)
					.map_err(AIError::ResponseMarshal)
			},
			(IngressShape::Responses, UpstreamFormat::Completions) => {
				let chat = conversion::completions::chat_response(bytes, log, reasoning_format)?;
				let chat_bytes =
					serde_json::to_vec(&chat).map_err(AIError::ResponseMarshal)?;
				let resp = conversion::completions::from_responses::translate_response(&Bytes::from(
					chat_bytes,
				))?;
				serde_json::to_vec(&resp)
					.map(Bytes::from)
					.map_err(AIError::ResponseMarshal)
			},
			(IngressShape::Responses, UpstreamFormat::Messages) => {
				let resp = conversion::messages::from_responses::translate_response(bytes)?;
				if let Some(usage) = &resp.usage {
					let mapped = usage.to_usage();
					log.non_atomic_mutate(|r| r.merge_usage(&mapped));
				}
				serde_json::to_vec(&resp)
					.map(Bytes::from)
					.map_err(AIError::ResponseMarshal)
			},
			(_, UpstreamFormat::Passthrough) => {
				// Embeddings/images/rerank/audio: body passes through; usage
				// is extracted per mode below.
				if let Ok(resp) =
					serde_json::from_slice::<crate::llm::types::embeddings::Response>(bytes)
					&& let Some(usage) = &resp.usage
				{
					let mapped = usage.to_usage();
					log.non_atomic_mutate(|r| r.merge_usage(&mapped));
				}
				Ok(bytes.clone())
			},
			(shape, format) => Err(AIError::UnsupportedConversion(format!(
				"no conversion from {format:?} to {shape:?}"
			))),
		}
	}
}

fn observe_chat_usage(resp: &crate::llm::types::completions::Response, log: &AsyncLog<ResponseInfo>) {
	log.non_atomic_mutate(|r| {
		r.provider_model = Some(resp.model.clone());
		if let Some(usage) = &resp.usage {
			r.merge_usage(&usage.to_usage());
		}
		if let Some(choice) = resp.choices.first() {
			r.finish_reason = choice.finish_reason.clone();
		}
	});
}

/// Mode-specific usage not carried in token counters: images generated,
/// rerank invocations.
fn mode_usage(mode: RelayMode, bytes: &Bytes) -> Option<Usage> {
	match mode {
		RelayMode::ImagesGenerations | RelayMode::ImagesEdits => {
			let resp = serde_json::from_slice::<crate::llm::types::images::Response>(bytes).ok()?;
			Some(Usage {
				images_out: resp.image_count(),
				..Default::default()
			})
		},
		RelayMode::Rerank => Some(Usage {
			tool_calls: std::collections::HashMap::from([("rerank".to_string(), 1)]),
			..Default::default()
		}),
		_ => None,
	}
}

/// Retry-After is either delta-seconds or an HTTP date.
fn parse_retry_after(value: &str) -> Option<Duration> {
	if let Ok(secs) = value.trim().parse::<u64>() {
		return Some(Duration::from_secs(secs));
	}
	let when = httpdate::parse_http_date(value).ok()?;
	when.duration_since(std::time::SystemTime::now()).ok()
}

fn sanitize_error(body: &Bytes) -> String {
	let text = String::from_utf8_lossy(body);
	let text = text.trim();
	let mut out = text.chars().take(512).collect::<String>();
	if out.is_empty() {
		out = "upstream returned an empty error body".to_string();
	}
	out
}

/// Refunds an unsettled reservation when dropped (panic, early return).
/// Harmless after a real settlement: refund of a settled handle is a no-op.
struct ReservationGuard {
	ledger: Arc<QuotaLedger>,
	handle: ReservationHandle,
	armed: bool,
}

impl Drop for ReservationGuard {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}
		let ledger = self.ledger.clone();
		let handle = self.handle;
		if let Ok(rt) = tokio::runtime::Handle::try_current() {
			rt.spawn(async move {
				let _ = ledger.refund(handle).await;
			});
		}
	}
}

/// Everything the stream settlement needs, detached from the request task.
struct Settler {
	store: Arc<dyn Store>,
	ledger: Arc<QuotaLedger>,
	pricing: Arc<PriceTable>,
	traces: Arc<TraceStore>,
	enforce_usage: bool,
	request_id: String,
	trace_id: String,
	user_id: i64,
	token_id: i64,
	channel_id: i64,
	model: String,
	upstream_model: String,
	estimated_prompt_tokens: u64,
	price: ModelPrice,
	handle: ReservationHandle,
	retries: u32,
	annotations: Vec<String>,
	streamed: bool,
	started: Instant,
}

impl Settler {
	async fn settle_stream(mut self, end: StreamEnd, mut info: ResponseInfo) {
		// Billing uses what the provider reported; when it reported nothing
		// the estimator fills in, tagged approximate. With enforcement on,
		// the bytes already reached the client, so the attempt is billed on
		// the estimate and annotated instead of failed retroactively.
		if !info.saw_usage {
			if self.enforce_usage && end == StreamEnd::Completed {
				self.annotations.push("usage_contract_violation".to_string());
			}
			info.usage.prompt_tokens = self.estimated_prompt_tokens;
			info.usage.completion_tokens = estimate_tokens_from_chars(info.completion_chars);
			info.usage.approximate = true;
		}
		let outcome = match end {
			StreamEnd::Completed => Outcome::Success,
			StreamEnd::Errored => Outcome::Timeout,
			StreamEnd::Cancelled => Outcome::Cancelled,
		};
		let cost = self.pricing.cost(&self.price, &info.usage);
		if let Err(e) = self.ledger.commit(self.handle, cost).await {
			warn!(request_id = %self.request_id, error = %e, "stream commit failed");
		}
		self.traces.record(
			&self.trace_id,
			Attempt {
				channel_id: self.channel_id,
				upstream_model: self.upstream_model.clone(),
				outcome,
				status: Some(200),
				latency: self.started.elapsed(),
				usage: Some(info.usage.clone()),
				billed: cost,
				error: None,
				annotations: self.annotations.clone(),
			},
		);
		let record = UsageRecord {
			request_id: self.request_id.clone(),
			trace_id: self.trace_id.clone(),
			user_id: self.user_id,
			token_id: self.token_id,
			channel_id: Some(self.channel_id),
			model: self.model.clone(),
			usage: info.usage.clone(),
			quota: cost,
			latency_ms: self.started.elapsed().as_millis() as u64,
			streamed: self.streamed,
			finish_reason: info.finish_reason.clone(),
			retries: self.retries,
			created_at: Utc::now(),
		};
		let _ = self.store.record_usage(record).await;
		info!(
			request_id = %self.request_id,
			channel = self.channel_id,
			model = %self.model,
			quota = cost,
			?outcome,
			prompt_tokens = info.usage.prompt_tokens,
			completion_tokens = info.usage.completion_tokens,
			"stream relay settled"
		);
	}
}

/// Serialize helper so `build_upstream_body` can stay one match.
mod erased_ser {
	use serde::Serialize;

	pub trait ErasedSerialize {
		fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error>;
	}

	impl<T: Serialize> ErasedSerialize for T {
		fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
			serde_json::to_vec(self)
		}
	}
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
