use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use itertools::Itertools;
use rand::RngExt;
use tracing::{debug, warn};

use crate::health::HealthController;
use crate::store::{Store, StoreError};
use crate::types::{Channel, ChannelId};

/// A denormalized (group, model, channel) routing row, derived from enabled
/// channels. The index is rebuilt whenever the channel set version changes.
#[derive(Debug, Clone)]
pub struct Ability {
	pub channel_id: ChannelId,
	pub priority: i64,
	pub weight: i64,
}

/// Immutable routing view handed out to the pipeline; one snapshot per
/// request.
#[derive(Debug, Default)]
pub struct Snapshot {
	pub version: u64,
	channels: HashMap<ChannelId, Arc<Channel>>,
	abilities: HashMap<(String, String), Vec<Ability>>,
}

impl Snapshot {
	fn build(version: u64, channels: Vec<Arc<Channel>>) -> Self {
		let mut by_id = HashMap::new();
		let mut abilities: HashMap<(String, String), Vec<Ability>> = HashMap::new();
		for channel in channels {
			if !channel.is_enabled() {
				continue;
			}
			if channel.models.is_empty() {
				// Never routable; do not index.
				continue;
			}
			for group in &channel.groups {
				for model in channel.routable_models() {
					abilities
						.entry((group.clone(), model.to_string()))
						.or_default()
						.push(Ability {
							channel_id: channel.id,
							priority: channel.priority,
							weight: channel.weight,
						});
				}
			}
			by_id.insert(channel.id, channel);
		}
		Self {
			version,
			channels: by_id,
			abilities,
		}
	}

	pub fn channel(&self, id: ChannelId) -> Option<&Arc<Channel>> {
		self.channels.get(&id)
	}

	/// All models routable for a group, sorted and deduplicated. Used by the
	/// /v1/models listing.
	pub fn models_for_group(&self, group: &str) -> Vec<String> {
		self
			.abilities
			.keys()
			.filter(|(g, _)| g == group)
			.map(|(_, m)| m.clone())
			.sorted()
			.dedup()
			.collect()
	}

	/// Select a channel for (group, model): filter unavailable and excluded
	/// abilities, take the highest-priority bucket that survives, and pick
	/// weighted-randomly within it. Buckets emptied by filtering retreat to
	/// the next priority.
	pub fn select(
		&self,
		group: &str,
		model: &str,
		exclude: &HashSet<ChannelId>,
		hint: Option<ChannelId>,
		health: &HealthController,
	) -> Option<Arc<Channel>> {
		let abilities = self
			.abilities
			.get(&(group.to_string(), model.to_string()))?;
		let candidates = abilities
			.iter()
			.filter(|a| !exclude.contains(&a.channel_id))
			.filter(|a| hint.is_none_or(|h| a.channel_id == h))
			.filter(|a| health.available(a.channel_id, model))
			.collect_vec();
		if candidates.is_empty() {
			return None;
		}
		for (_prio, bucket) in &candidates
			.into_iter()
			.sorted_by_key(|a| std::cmp::Reverse(a.priority))
			.chunk_by(|a| a.priority)
		{
			let bucket = bucket.collect_vec();
			if let Some(choice) = weighted_pick(&bucket) {
				return self.channels.get(&choice.channel_id).cloned();
			}
		}
		None
	}
}

/// Weighted random selection; weights of zero or below count as one so no
/// configured channel is starved.
fn weighted_pick<'a>(bucket: &[&'a Ability]) -> Option<&'a Ability> {
	if bucket.is_empty() {
		return None;
	}
	let weights: Vec<u64> = bucket.iter().map(|a| a.weight.max(1) as u64).collect();
	let total: u64 = weights.iter().sum();
	let mut roll = rand::rng().random_range(0..total);
	for (ability, weight) in bucket.iter().zip(weights) {
		if roll < weight {
			return Some(ability);
		}
		roll -= weight;
	}
	unreachable!("roll is bounded by the weight sum")
}

/// Owns the live channel snapshot. Readers grab an immutable Arc per request;
/// rebuilds happen when the store's channel version moves, driven by a
/// background sync task.
pub struct ChannelRegistry {
	store: Arc<dyn Store>,
	snapshot: ArcSwap<Snapshot>,
}

impl ChannelRegistry {
	pub async fn new(store: Arc<dyn Store>) -> Result<Self, StoreError> {
		let registry = Self {
			store,
			snapshot: ArcSwap::from_pointee(Snapshot::default()),
		};
		registry.rebuild().await?;
		Ok(registry)
	}

	pub fn snapshot(&self) -> Arc<Snapshot> {
		self.snapshot.load_full()
	}

	pub async fn rebuild(&self) -> Result<(), StoreError> {
		let version = self.store.channel_version().await?;
		let channels = self.store.channels().await?;
		let snap = Snapshot::build(version, channels);
		debug!(version, routes = snap.abilities.len(), "rebuilt ability index");
		self.snapshot.store(Arc::new(snap));
		Ok(())
	}

	/// Rebuild if the store moved past the current snapshot version.
	pub async fn sync(&self) -> Result<(), StoreError> {
		let version = self.store.channel_version().await?;
		if version != self.snapshot.load().version {
			self.rebuild().await?;
		}
		Ok(())
	}

	pub fn spawn_sync(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
		let registry = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				if let Err(e) = registry.sync().await {
					warn!(error = %e, "channel sync failed");
				}
			}
		})
	}
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
