use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{Store, StoreError};
use crate::types::{Token, TokenId, TokenStatus, UserId};

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
	#[error("insufficient quota")]
	InsufficientQuota,
	#[error("token is disabled")]
	TokenDisabled,
	#[error("token is expired")]
	TokenExpired,
	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Opaque pairing of a pre-reserved quota with its future commit or refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationHandle(u64);

#[derive(Debug, Clone)]
struct Held {
	user_id: UserId,
	token_id: TokenId,
	estimate: i64,
	unlimited: bool,
}

/// Per-user and per-token quota with atomic pre-reserve / commit / refund.
///
/// Reservations debit persisted balances up front, so at any instant
/// `persisted_remaining + outstanding == initial - committed`. Commits and
/// refunds are idempotent by handle id: settling an already-settled handle is
/// a no-op.
pub struct QuotaLedger {
	store: Arc<dyn Store>,
	outstanding: Mutex<HashMap<u64, Held>>,
	next_handle: AtomicU64,
	journal: Option<Journal>,
}

const COMMIT_RETRIES: u32 = 3;
const COMMIT_BACKOFF: Duration = Duration::from_millis(100);

impl QuotaLedger {
	pub fn new(store: Arc<dyn Store>) -> Self {
		Self {
			store,
			outstanding: Mutex::new(HashMap::new()),
			next_handle: AtomicU64::new(1),
			journal: None,
		}
	}

	/// Attach a commit journal and replay anything a previous process left
	/// behind.
	pub async fn with_journal(store: Arc<dyn Store>, path: PathBuf) -> anyhow::Result<Self> {
		let journal = Journal::open(path)?;
		journal.replay(store.as_ref()).await?;
		Ok(Self {
			journal: Some(journal),
			..Self::new(store)
		})
	}

	/// Decrement balances by the estimate and hand back the reservation.
	/// Status transitions (expired, exhausted) are applied on observation.
	pub async fn reserve(
		&self,
		token: &Token,
		estimate: i64,
	) -> Result<ReservationHandle, LedgerError> {
		match token.status {
			TokenStatus::Enabled => {},
			TokenStatus::Disabled => return Err(LedgerError::TokenDisabled),
			TokenStatus::Expired => return Err(LedgerError::TokenExpired),
			TokenStatus::Exhausted => return Err(LedgerError::InsufficientQuota),
		}
		if token.is_expired(Utc::now()) {
			let _ = self
				.store
				.set_token_status(token.id, TokenStatus::Expired)
				.await;
			return Err(LedgerError::TokenExpired);
		}
		match self
			.store
			.debit(token.user_id, token.id, estimate, token.unlimited_quota)
			.await
		{
			Ok(()) => {},
			Err(StoreError::InsufficientQuota) => {
				if !token.unlimited_quota && token.remaining_quota <= 0 {
					let _ = self
						.store
						.set_token_status(token.id, TokenStatus::Exhausted)
						.await;
				}
				return Err(LedgerError::InsufficientQuota);
			},
			Err(e) => return Err(e.into()),
		}
		let handle = ReservationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
		self.outstanding.lock().insert(
			handle.0,
			Held {
				user_id: token.user_id,
				token_id: token.id,
				estimate,
				unlimited: token.unlimited_quota,
			},
		);
		Ok(handle)
	}

	/// Settle a reservation against the actual cost. Over-reservation is
	/// released; overshoot is deducted post-hoc and may exhaust the token
	/// (the current request still returns).
	pub async fn commit(&self, handle: ReservationHandle, actual: i64) -> Result<(), LedgerError> {
		let Some(held) = self.outstanding.lock().remove(&handle.0) else {
			return Ok(());
		};
		let entry = Settlement {
			handle: handle.0,
			user_id: held.user_id,
			token_id: held.token_id,
			unlimited: held.unlimited,
			release: held.estimate - actual,
			actual,
		};
		if let Err(e) = self.settle_with_retry(&entry).await {
			warn!(handle = handle.0, error = %e, "commit could not reach storage, journaling");
			if let Some(j) = &self.journal {
				j.append(&entry)?;
				return Ok(());
			}
			return Err(e);
		}
		Ok(())
	}

	/// Release the entire reservation. Used on all non-success terminal
	/// outcomes.
	pub async fn refund(&self, handle: ReservationHandle) -> Result<(), LedgerError> {
		let Some(held) = self.outstanding.lock().remove(&handle.0) else {
			return Ok(());
		};
		self
			.store
			.credit(held.user_id, held.token_id, held.estimate, held.unlimited)
			.await?;
		Ok(())
	}

	/// Out-of-band consumption reported after the fact (background jobs,
	/// external billing ingest). Debits without a prior reservation.
	pub async fn external_adjust(
		&self,
		token: &Token,
		delta: i64,
		reason: &str,
	) -> Result<(), LedgerError> {
		let remaining = self
			.store
			.adjust(token.user_id, token.id, -delta, token.unlimited_quota)
			.await?;
		self
			.store
			.finalize_usage(token.user_id, token.id, delta)
			.await?;
		if let Some(remaining) = remaining
			&& remaining < 0
		{
			let _ = self
				.store
				.set_token_status(token.id, TokenStatus::Exhausted)
				.await;
		}
		info!(token = token.id, delta, reason, "external quota adjustment");
		Ok(())
	}

	/// Sum of outstanding reservation estimates for a token.
	pub fn outstanding(&self, token_id: TokenId) -> i64 {
		self
			.outstanding
			.lock()
			.values()
			.filter(|h| h.token_id == token_id)
			.map(|h| h.estimate)
			.sum()
	}

	async fn settle_with_retry(&self, entry: &Settlement) -> Result<(), LedgerError> {
		let mut backoff = COMMIT_BACKOFF;
		let mut last = None;
		for attempt in 0..=COMMIT_RETRIES {
			if attempt > 0 {
				tokio::time::sleep(backoff).await;
				backoff *= 3;
			}
			match apply_settlement(self.store.as_ref(), entry).await {
				Ok(()) => return Ok(()),
				Err(e @ LedgerError::Store(StoreError::Unavailable(_))) => last = Some(e),
				Err(e) => return Err(e),
			}
		}
		Err(last.expect("retry loop ran at least once"))
	}
}

async fn apply_settlement(store: &dyn Store, entry: &Settlement) -> Result<(), LedgerError> {
	if entry.release >= 0 {
		if entry.release > 0 {
			store
				.credit(entry.user_id, entry.token_id, entry.release, entry.unlimited)
				.await?;
		}
	} else {
		let remaining = store
			.adjust(entry.user_id, entry.token_id, entry.release, entry.unlimited)
			.await?;
		if let Some(remaining) = remaining
			&& remaining < 0
		{
			let _ = store
				.set_token_status(entry.token_id, TokenStatus::Exhausted)
				.await;
		}
	}
	store
		.finalize_usage(entry.user_id, entry.token_id, entry.actual)
		.await?;
	Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct Settlement {
	handle: u64,
	user_id: UserId,
	token_id: TokenId,
	unlimited: bool,
	/// estimate - actual; negative when the attempt overshot the reservation
	release: i64,
	actual: i64,
}

/// JSON-lines write-ahead journal for commits that could not reach storage.
/// Entries are appended on failure and replayed (then truncated) at boot.
struct Journal {
	path: PathBuf,
	lock: Mutex<()>,
}

impl Journal {
	fn open(path: PathBuf) -> anyhow::Result<Self> {
		if let Some(parent) = path.parent()
			&& !parent.as_os_str().is_empty()
		{
			fs_err::create_dir_all(parent)?;
		}
		Ok(Self {
			path,
			lock: Mutex::new(()),
		})
	}

	fn append(&self, entry: &Settlement) -> Result<(), LedgerError> {
		let _g = self.lock.lock();
		let mut line = serde_json::to_vec(entry).expect("settlement serializes");
		line.push(b'\n');
		let mut existing = match fs_err::read(&self.path) {
			Ok(b) => b,
			Err(_) => Vec::new(),
		};
		existing.extend_from_slice(&line);
		fs_err::write(&self.path, existing)
			.map_err(|e| StoreError::Unavailable(e.to_string()))?;
		Ok(())
	}

	async fn replay(&self, store: &dyn Store) -> anyhow::Result<()> {
		let Ok(raw) = fs_err::read_to_string(&self.path) else {
			return Ok(());
		};
		let mut replayed = 0usize;
		for line in raw.lines().filter(|l| !l.trim().is_empty()) {
			let entry: Settlement = serde_json::from_str(line)?;
			apply_settlement(store, &entry)
				.await
				.map_err(|e| anyhow::anyhow!("journal replay failed: {e}"))?;
			replayed += 1;
		}
		if replayed > 0 {
			info!(replayed, "replayed ledger journal");
		}
		fs_err::write(&self.path, b"")?;
		Ok(())
	}
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
