use std::net::IpAddr;

use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use headers::HeaderMapExt;
use http::HeaderMap;

use crate::Config;
use crate::http::error::ErrorKind;
use crate::store::Store;
use crate::types::{Token, TokenStatus, User};

#[derive(Debug)]
pub struct Authenticated {
	pub user: User,
	pub token: Token,
}

/// Resolve the bearer key into an authenticated principal. Accepts
/// `Authorization: Bearer` and the Anthropic-style `x-api-key` header.
pub async fn authenticate(
	store: &dyn Store,
	cfg: &Config,
	headers: &HeaderMap,
	client_ip: IpAddr,
) -> Result<Authenticated, ErrorKind> {
	let bearer = headers.typed_get::<Authorization<Bearer>>();
	let key = bearer
		.as_ref()
		.map(|b| b.token())
		.or_else(|| x_api_key(headers))
		.ok_or_else(|| ErrorKind::AuthFailed("missing api key".to_string()))?;
	if !key.starts_with(&cfg.token_prefix) {
		return Err(ErrorKind::AuthFailed("invalid api key".to_string()));
	}
	let token = store
		.token_by_key(key)
		.await
		.map_err(ErrorKind::from)?
		.ok_or_else(|| ErrorKind::AuthFailed("invalid api key".to_string()))?;

	match token.status {
		TokenStatus::Enabled => {},
		TokenStatus::Disabled => {
			return Err(ErrorKind::AuthFailed("token is disabled".to_string()));
		},
		TokenStatus::Expired => {
			return Err(ErrorKind::AuthFailed("token is expired".to_string()));
		},
		TokenStatus::Exhausted => return Err(ErrorKind::QuotaInsufficient),
	}
	if token.is_expired(chrono::Utc::now()) {
		let _ = store.set_token_status(token.id, TokenStatus::Expired).await;
		return Err(ErrorKind::AuthFailed("token is expired".to_string()));
	}
	if !token.ip_allowed(client_ip) {
		return Err(ErrorKind::AuthFailed(
			"this address may not use this token".to_string(),
		));
	}
	let user = store
		.user(token.user_id)
		.await
		.map_err(ErrorKind::from)?
		.ok_or_else(|| ErrorKind::AuthFailed("token owner not found".to_string()))?;
	Ok(Authenticated { user, token })
}

fn x_api_key(headers: &HeaderMap) -> Option<&str> {
	headers
		.get("x-api-key")
		.and_then(|v| v.to_str().ok())
		.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use assert_matches::assert_matches;
	use http::HeaderValue;

	use super::*;
	use crate::store::MemoryStore;

	fn seeded() -> (Arc<MemoryStore>, Config) {
		let store = Arc::new(MemoryStore::new());
		store.insert_user(User {
			id: 1,
			group: "default".into(),
			remaining_quota: 1000,
			used_quota: 0,
			request_count: 0,
		});
		store.insert_token(Token {
			id: 7,
			user_id: 1,
			key: "sk-valid".into(),
			status: TokenStatus::Enabled,
			unlimited_quota: false,
			remaining_quota: 1000,
			used_quota: 0,
			expires_at: None,
			models: None,
			allowed_ips: None,
		});
		(store, Config::default())
	}

	fn with_auth(value: &str) -> HeaderMap {
		let mut headers = HeaderMap::new();
		headers.insert(
			http::header::AUTHORIZATION,
			HeaderValue::from_str(value).unwrap(),
		);
		headers
	}

	const IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

	#[tokio::test]
	async fn bearer_and_x_api_key_both_work() {
		let (store, cfg) = seeded();
		let ok = authenticate(store.as_ref(), &cfg, &with_auth("Bearer sk-valid"), IP).await;
		assert_eq!(ok.unwrap().token.id, 7);

		let mut headers = HeaderMap::new();
		headers.insert("x-api-key", HeaderValue::from_static("sk-valid"));
		let ok = authenticate(store.as_ref(), &cfg, &headers, IP).await;
		assert_eq!(ok.unwrap().user.id, 1);
	}

	#[tokio::test]
	async fn wrong_prefix_and_unknown_keys_fail() {
		let (store, cfg) = seeded();
		assert_matches!(
			authenticate(store.as_ref(), &cfg, &with_auth("Bearer nope"), IP).await,
			Err(ErrorKind::AuthFailed(_))
		);
		assert_matches!(
			authenticate(store.as_ref(), &cfg, &with_auth("Bearer sk-unknown"), IP).await,
			Err(ErrorKind::AuthFailed(_))
		);
		assert_matches!(
			authenticate(store.as_ref(), &cfg, &HeaderMap::new(), IP).await,
			Err(ErrorKind::AuthFailed(_))
		);
	}

	#[tokio::test]
	async fn expiry_is_observed_and_persisted() {
		let (store, cfg) = seeded();
		let mut token = store.token(7).await.unwrap().unwrap();
		token.expires_at = Some(chrono::Utc::now());
		store.insert_token(token);
		assert_matches!(
			authenticate(store.as_ref(), &cfg, &with_auth("Bearer sk-valid"), IP).await,
			Err(ErrorKind::AuthFailed(_))
		);
		assert_eq!(
			store.token(7).await.unwrap().unwrap().status,
			TokenStatus::Expired
		);
	}

	#[tokio::test]
	async fn ip_allow_list_is_enforced() {
		let (store, cfg) = seeded();
		let mut token = store.token(7).await.unwrap().unwrap();
		token.allowed_ips = Some(vec!["10.0.0.0/8".parse().unwrap()]);
		store.insert_token(token);
		assert_matches!(
			authenticate(store.as_ref(), &cfg, &with_auth("Bearer sk-valid"), IP).await,
			Err(ErrorKind::AuthFailed(_))
		);
		let ok = authenticate(
			store.as_ref(),
			&cfg,
			&with_auth("Bearer sk-valid"),
			"10.1.2.3".parse().unwrap(),
		)
		.await;
		assert!(ok.is_ok());
	}

	#[tokio::test]
	async fn exhausted_tokens_read_as_quota_errors() {
		let (store, cfg) = seeded();
		let mut token = store.token(7).await.unwrap().unwrap();
		token.status = TokenStatus::Exhausted;
		store.insert_token(token);
		assert_matches!(
			authenticate(store.as_ref(), &cfg, &with_auth("Bearer sk-valid"), IP).await,
			Err(ErrorKind::QuotaInsufficient)
		);
	}
}
