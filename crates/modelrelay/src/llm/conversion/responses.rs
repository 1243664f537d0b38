//! Conversions for providers that serve the Responses API natively (OpenAI,
//! Azure, xAI). Responses ingress passes through; only usage and completion
//! text are observed.

use std::time::Instant;

use bytes::Bytes;

use crate::http::Body;
use crate::llm::AIError;
use crate::llm::conversion::ResponseInfo;
use crate::llm::types::responses;
use crate::parse;
use crate::telemetry::AsyncLog;

fn observe_response(resp: &responses::Response, log: &AsyncLog<ResponseInfo>) {
	let usage = resp.usage.as_ref().map(|u| u.to_usage());
	let chars: usize = resp
		.output
		.iter()
		.map(|item| match item {
			responses::OutputItem::Message { content, .. } => content
				.iter()
				.map(|c| match c {
					responses::OutputContent::OutputText { text, .. } => text.len(),
					responses::OutputContent::Refusal { refusal } => refusal.len(),
				})
				.sum(),
			_ => 0,
		})
		.sum();
	log.non_atomic_mutate(|r| {
		r.provider_model = Some(resp.model.clone());
		r.completion_chars += chars;
		if let Some(usage) = &usage {
			r.merge_usage(usage);
		}
		if resp.status == "completed" {
			r.finish_reason = Some("stop".to_string());
		}
	});
}

pub fn passthrough_response(
	bytes: &Bytes,
	log: &AsyncLog<ResponseInfo>,
) -> Result<responses::Response, AIError> {
	let resp =
		serde_json::from_slice::<responses::Response>(bytes).map_err(AIError::ResponseParsing)?;
	observe_response(&resp, log);
	Ok(resp)
}

pub fn passthrough_stream(body: Body, limit: usize, log: AsyncLog<ResponseInfo>) -> Body {
	let mut saw_token = false;
	parse::sse::json_passthrough::<responses::StreamEvent>(body, limit, move |f| {
		let Some(Ok(event)) = f else { return };
		match event {
			responses::StreamEvent::OutputTextDelta { delta, .. } => {
				if !saw_token {
					saw_token = true;
					log.non_atomic_mutate(|r| r.first_token = Some(Instant::now()));
				}
				log.non_atomic_mutate(|r| r.completion_chars += delta.len());
			},
			responses::StreamEvent::Completed { response }
			| responses::StreamEvent::Failed { response } => {
				if let Some(usage) = &response.usage {
					let mapped = usage.to_usage();
					log.non_atomic_mutate(|r| {
						r.provider_model = Some(response.model.clone());
						r.merge_usage(&mapped);
						r.finish_reason = Some(if response.status == "completed" {
							"stop".to_string()
						} else {
							response.status.clone()
						});
					});
				}
			},
			_ => {},
		}
	})
}
