use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

pub type TokenId = i64;
pub type UserId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TokenStatus {
	#[default]
	Enabled,
	Disabled,
	Expired,
	Exhausted,
}

/// An API token. The key is the opaque bearer credential clients present;
/// quota fields are denormalized from the ledger for fast admission checks.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
	pub id: TokenId,
	pub user_id: UserId,
	pub key: String,
	#[serde(default)]
	pub status: TokenStatus,
	#[serde(default)]
	pub unlimited_quota: bool,
	#[serde(default)]
	pub remaining_quota: i64,
	#[serde(default)]
	pub used_quota: i64,
	#[serde(default)]
	pub expires_at: Option<DateTime<Utc>>,
	/// When present, restricts the token to a subset of the user's models.
	#[serde(default)]
	pub models: Option<Vec<String>>,
	/// When present, only these addresses/CIDRs may use the token.
	#[serde(default)]
	pub allowed_ips: Option<Vec<IpNet>>,
}

impl Token {
	/// Expiry is checked against observation time; a token whose expiry
	/// equals "now" is already expired.
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		match self.expires_at {
			Some(exp) => now >= exp,
			None => false,
		}
	}

	pub fn ip_allowed(&self, ip: IpAddr) -> bool {
		match &self.allowed_ips {
			Some(nets) => nets.iter().any(|n| n.contains(&ip)),
			None => true,
		}
	}

	pub fn model_allowed(&self, model: &str) -> bool {
		match &self.models {
			Some(models) => models.iter().any(|m| m == model),
			None => true,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
	pub id: UserId,
	#[serde(default = "default_group")]
	pub group: String,
	#[serde(default)]
	pub remaining_quota: i64,
	#[serde(default)]
	pub used_quota: i64,
	#[serde(default)]
	pub request_count: i64,
}

fn default_group() -> String {
	"default".to_string()
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone;

	use super::*;

	fn token() -> Token {
		Token {
			id: 1,
			user_id: 1,
			key: "sk-test".into(),
			status: TokenStatus::Enabled,
			unlimited_quota: false,
			remaining_quota: 1000,
			used_quota: 0,
			expires_at: None,
			models: None,
			allowed_ips: None,
		}
	}

	#[test]
	fn expiry_at_now_is_expired() {
		let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
		let mut t = token();
		assert!(!t.is_expired(now));
		t.expires_at = Some(now);
		assert!(t.is_expired(now));
		t.expires_at = Some(now + chrono::Duration::seconds(1));
		assert!(!t.is_expired(now));
	}

	#[test]
	fn ip_allow_list() {
		let mut t = token();
		assert!(t.ip_allowed("203.0.113.7".parse().unwrap()));
		t.allowed_ips = Some(vec!["10.0.0.0/8".parse().unwrap()]);
		assert!(t.ip_allowed("10.1.2.3".parse().unwrap()));
		assert!(!t.ip_allowed("203.0.113.7".parse().unwrap()));
	}

	#[test]
	fn model_allow_list() {
		let mut t = token();
		assert!(t.model_allowed("gpt-4o"));
		t.models = Some(vec!["gpt-4o-mini".into()]);
		assert!(t.model_allowed("gpt-4o-mini"));
		assert!(!t.model_allowed("gpt-4o"));
	}
}
