use axum::response::IntoResponse;
use http::{HeaderValue, StatusCode, header};

use crate::ledger::LedgerError;
use crate::llm::AIError;
use crate::llm::types::{completions, messages};
use crate::store::StoreError;
use crate::types::IngressShape;

/// Everything a relay request can fail with, mapped onto ingress-native
/// error envelopes. The raw upstream error stays in the trace; only the
/// sanitized message leaves the process.
#[derive(thiserror::Error, Debug)]
pub enum ErrorKind {
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("{0}")]
	AuthFailed(String),
	#[error("insufficient quota")]
	QuotaInsufficient,
	#[error("model {0} is not available")]
	ModelNotAllowed(String),
	#[error("rate limited")]
	RateLimited { retry_after_secs: u64 },
	#[error("no channel available for this model")]
	NoChannelAvailable,
	#[error("upstream rate limited")]
	UpstreamRateLimited { retry_after_secs: u64 },
	#[error("upstream error: {0}")]
	Upstream(String),
	#[error("internal error")]
	Internal(String),
}

impl ErrorKind {
	pub fn status(&self) -> StatusCode {
		match self {
			ErrorKind::InvalidRequest(_) => StatusCode::BAD_REQUEST,
			ErrorKind::AuthFailed(_) => StatusCode::UNAUTHORIZED,
			ErrorKind::QuotaInsufficient => StatusCode::PAYMENT_REQUIRED,
			ErrorKind::ModelNotAllowed(_) => StatusCode::FORBIDDEN,
			ErrorKind::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			ErrorKind::NoChannelAvailable => StatusCode::SERVICE_UNAVAILABLE,
			ErrorKind::UpstreamRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			ErrorKind::Upstream(_) => StatusCode::BAD_GATEWAY,
			ErrorKind::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	fn openai_type(&self) -> &'static str {
		match self {
			ErrorKind::InvalidRequest(_) | ErrorKind::ModelNotAllowed(_) => "invalid_request_error",
			ErrorKind::AuthFailed(_) => "authentication_error",
			ErrorKind::QuotaInsufficient => "insufficient_quota",
			ErrorKind::RateLimited { .. } | ErrorKind::UpstreamRateLimited { .. } => {
				"rate_limit_error"
			},
			ErrorKind::NoChannelAvailable | ErrorKind::Upstream(_) => "upstream_error",
			ErrorKind::Internal(_) => "api_error",
		}
	}

	fn anthropic_type(&self) -> &'static str {
		match self {
			ErrorKind::InvalidRequest(_) | ErrorKind::ModelNotAllowed(_) => "invalid_request_error",
			ErrorKind::AuthFailed(_) => "authentication_error",
			ErrorKind::QuotaInsufficient => "permission_error",
			ErrorKind::RateLimited { .. } | ErrorKind::UpstreamRateLimited { .. } => {
				"rate_limit_error"
			},
			ErrorKind::NoChannelAvailable => "overloaded_error",
			ErrorKind::Upstream(_) | ErrorKind::Internal(_) => "api_error",
		}
	}

	fn retry_after(&self) -> Option<u64> {
		match self {
			ErrorKind::RateLimited { retry_after_secs }
			| ErrorKind::UpstreamRateLimited { retry_after_secs } => Some(*retry_after_secs),
			_ => None,
		}
	}

	/// Render into the error schema of the ingress shape. Auth-stage errors
	/// happen before a shape is known; those use the OpenAI schema.
	pub fn into_response(self, shape: Option<IngressShape>) -> axum::response::Response {
		let status = self.status();
		let retry_after = self.retry_after();
		let body = match shape {
			Some(IngressShape::Messages) => serde_json::to_vec(&messages::ErrorResponse::new(
				self.anthropic_type(),
				self.to_string(),
			)),
			_ => serde_json::to_vec(&completions::ErrorResponse::new(
				self.openai_type(),
				self.to_string(),
			)),
		}
		.expect("error envelope serializes");
		let mut resp = (status, body).into_response();
		resp.headers_mut().insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		if let Some(secs) = retry_after
			&& let Ok(v) = HeaderValue::from_str(&secs.to_string())
		{
			resp.headers_mut().insert(header::RETRY_AFTER, v);
		}
		resp
	}
}

impl From<LedgerError> for ErrorKind {
	fn from(e: LedgerError) -> Self {
		match e {
			LedgerError::InsufficientQuota => ErrorKind::QuotaInsufficient,
			LedgerError::TokenDisabled => ErrorKind::AuthFailed("token is disabled".to_string()),
			LedgerError::TokenExpired => ErrorKind::AuthFailed("token is expired".to_string()),
			LedgerError::Store(e) => ErrorKind::Internal(e.to_string()),
		}
	}
}

impl From<StoreError> for ErrorKind {
	fn from(e: StoreError) -> Self {
		ErrorKind::Internal(e.to_string())
	}
}

impl From<AIError> for ErrorKind {
	fn from(e: AIError) -> Self {
		match e {
			AIError::RequestParsing(e) => ErrorKind::InvalidRequest(e.to_string()),
			AIError::MissingField(m) => ErrorKind::InvalidRequest(m),
			AIError::RequestTooLarge => ErrorKind::InvalidRequest("request too large".to_string()),
			AIError::UnsupportedConversion(m) => ErrorKind::InvalidRequest(m),
			other => ErrorKind::Internal(other.to_string()),
		}
	}
}
