use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{
	Channel, ChannelId, ChannelStatus, Token, TokenId, TokenStatus, UsageRecord, User, UserId,
};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("insufficient quota")]
	InsufficientQuota,
	#[error("token {0} not found")]
	TokenNotFound(TokenId),
	#[error("user {0} not found")]
	UserNotFound(UserId),
	#[error("channel {0} not found")]
	ChannelNotFound(ChannelId),
	#[error("storage unavailable: {0}")]
	Unavailable(String),
}

/// Persistence surface the core consumes. Channel/token/user CRUD beyond
/// these calls is owned by external collaborators; the relay only needs
/// lookup, balance arithmetic, and append-style records.
#[async_trait]
pub trait Store: Send + Sync + 'static {
	async fn token_by_key(&self, key: &str) -> Result<Option<Token>, StoreError>;
	async fn token(&self, id: TokenId) -> Result<Option<Token>, StoreError>;
	async fn user(&self, id: UserId) -> Result<Option<User>, StoreError>;
	async fn channels(&self) -> Result<Vec<Arc<Channel>>, StoreError>;
	/// Monotonic version bumped on any channel mutation; the registry polls
	/// this to know when to rebuild its snapshot.
	async fn channel_version(&self) -> Result<u64, StoreError>;
	async fn set_channel_status(
		&self,
		id: ChannelId,
		status: ChannelStatus,
	) -> Result<(), StoreError>;
	async fn set_token_status(&self, id: TokenId, status: TokenStatus) -> Result<(), StoreError>;

	/// Atomically decrement the user and (unless unlimited) token balances.
	/// Fails with InsufficientQuota without partial effects.
	async fn debit(
		&self,
		user_id: UserId,
		token_id: TokenId,
		amount: i64,
		token_unlimited: bool,
	) -> Result<(), StoreError>;
	/// Credit balances back (commit release or refund).
	async fn credit(
		&self,
		user_id: UserId,
		token_id: TokenId,
		amount: i64,
		token_unlimited: bool,
	) -> Result<(), StoreError>;
	/// Unconditionally apply a signed delta to balances (post-hoc settlement
	/// when actual cost exceeded the reservation). Returns the token's
	/// resulting remaining quota, None when the token is unlimited.
	async fn adjust(
		&self,
		user_id: UserId,
		token_id: TokenId,
		delta: i64,
		token_unlimited: bool,
	) -> Result<Option<i64>, StoreError>;
	/// Record consumed quota on the token/user counters after commit.
	async fn finalize_usage(
		&self,
		user_id: UserId,
		token_id: TokenId,
		quota: i64,
	) -> Result<(), StoreError>;

	async fn record_usage(&self, record: UsageRecord) -> Result<(), StoreError>;
	async fn usage_by_request_id(&self, request_id: &str)
	-> Result<Option<UsageRecord>, StoreError>;
}

/// Seed state for single-node runs: channels, tokens and users loaded from
/// a local file at boot.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalState {
	#[serde(default)]
	pub channels: Vec<Channel>,
	#[serde(default)]
	pub tokens: Vec<Token>,
	#[serde(default)]
	pub users: Vec<User>,
}

/// In-memory store: the single-node default and the test double. Balance
/// arithmetic is serialized by the write lock, which is the same guarantee a
/// database row lock provides.
#[derive(Default)]
pub struct MemoryStore {
	inner: RwLock<Inner>,
	channel_version: AtomicU64,
}

#[derive(Default)]
struct Inner {
	tokens: HashMap<TokenId, Token>,
	users: HashMap<UserId, User>,
	channels: HashMap<ChannelId, Arc<Channel>>,
	usage: HashMap<String, UsageRecord>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_local_state(state: LocalState) -> Self {
		let store = Self::new();
		for user in state.users {
			store.insert_user(user);
		}
		for token in state.tokens {
			store.insert_token(token);
		}
		for channel in state.channels {
			store.insert_channel(channel);
		}
		store
	}

	pub fn insert_token(&self, token: Token) {
		self.inner.write().tokens.insert(token.id, token);
	}

	pub fn insert_user(&self, user: User) {
		self.inner.write().users.insert(user.id, user);
	}

	pub fn insert_channel(&self, channel: Channel) {
		self
			.inner
			.write()
			.channels
			.insert(channel.id, Arc::new(channel));
		self.channel_version.fetch_add(1, Ordering::SeqCst);
	}

	pub fn remove_channel(&self, id: ChannelId) {
		self.inner.write().channels.remove(&id);
		self.channel_version.fetch_add(1, Ordering::SeqCst);
	}

	pub fn token_balance(&self, id: TokenId) -> Option<i64> {
		self.inner.read().tokens.get(&id).map(|t| t.remaining_quota)
	}

	pub fn user_balance(&self, id: UserId) -> Option<i64> {
		self.inner.read().users.get(&id).map(|u| u.remaining_quota)
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn token_by_key(&self, key: &str) -> Result<Option<Token>, StoreError> {
		Ok(
			self
				.inner
				.read()
				.tokens
				.values()
				.find(|t| t.key == key)
				.cloned(),
		)
	}

	async fn token(&self, id: TokenId) -> Result<Option<Token>, StoreError> {
		Ok(self.inner.read().tokens.get(&id).cloned())
	}

	async fn user(&self, id: UserId) -> Result<Option<User>, StoreError> {
		Ok(self.inner.read().users.get(&id).cloned())
	}

	async fn channels(&self) -> Result<Vec<Arc<Channel>>, StoreError> {
		Ok(self.inner.read().channels.values().cloned().collect())
	}

	async fn channel_version(&self) -> Result<u64, StoreError> {
		Ok(self.channel_version.load(Ordering::SeqCst))
	}

	async fn set_channel_status(
		&self,
		id: ChannelId,
		status: ChannelStatus,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		let ch = inner
			.channels
			.get(&id)
			.ok_or(StoreError::ChannelNotFound(id))?;
		let mut updated = (**ch).clone();
		updated.status = status;
		inner.channels.insert(id, Arc::new(updated));
		self.channel_version.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn set_token_status(&self, id: TokenId, status: TokenStatus) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		let token = inner.tokens.get_mut(&id).ok_or(StoreError::TokenNotFound(id))?;
		token.status = status;
		Ok(())
	}

	async fn debit(
		&self,
		user_id: UserId,
		token_id: TokenId,
		amount: i64,
		token_unlimited: bool,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		let user_remaining = inner
			.users
			.get(&user_id)
			.ok_or(StoreError::UserNotFound(user_id))?
			.remaining_quota;
		if user_remaining < amount {
			return Err(StoreError::InsufficientQuota);
		}
		if !token_unlimited {
			let token = inner
				.tokens
				.get(&token_id)
				.ok_or(StoreError::TokenNotFound(token_id))?;
			if token.remaining_quota < amount {
				return Err(StoreError::InsufficientQuota);
			}
		}
		inner.users.get_mut(&user_id).expect("checked above").remaining_quota -= amount;
		if !token_unlimited {
			inner
				.tokens
				.get_mut(&token_id)
				.expect("checked above")
				.remaining_quota -= amount;
		}
		Ok(())
	}

	async fn credit(
		&self,
		user_id: UserId,
		token_id: TokenId,
		amount: i64,
		token_unlimited: bool,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		if let Some(user) = inner.users.get_mut(&user_id) {
			user.remaining_quota += amount;
		}
		if !token_unlimited && let Some(token) = inner.tokens.get_mut(&token_id) {
			token.remaining_quota += amount;
		}
		Ok(())
	}

	async fn adjust(
		&self,
		user_id: UserId,
		token_id: TokenId,
		delta: i64,
		token_unlimited: bool,
	) -> Result<Option<i64>, StoreError> {
		let mut inner = self.inner.write();
		if let Some(user) = inner.users.get_mut(&user_id) {
			user.remaining_quota += delta;
		}
		if token_unlimited {
			return Ok(None);
		}
		let token = inner
			.tokens
			.get_mut(&token_id)
			.ok_or(StoreError::TokenNotFound(token_id))?;
		token.remaining_quota += delta;
		Ok(Some(token.remaining_quota))
	}

	async fn finalize_usage(
		&self,
		user_id: UserId,
		token_id: TokenId,
		quota: i64,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		if let Some(user) = inner.users.get_mut(&user_id) {
			user.used_quota += quota;
			user.request_count += 1;
		}
		if let Some(token) = inner.tokens.get_mut(&token_id) {
			token.used_quota += quota;
		}
		Ok(())
	}

	async fn record_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
		self
			.inner
			.write()
			.usage
			.insert(record.request_id.clone(), record);
		Ok(())
	}

	async fn usage_by_request_id(
		&self,
		request_id: &str,
	) -> Result<Option<UsageRecord>, StoreError> {
		Ok(self.inner.read().usage.get(request_id).cloned())
	}
}
