use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::types::Attempt;

/// In-memory record of every upstream attempt, grouped by trace id. Bounded:
/// the oldest traces are evicted once the cap is reached.
pub struct TraceStore {
	inner: Mutex<Inner>,
	cap: usize,
}

#[derive(Default)]
struct Inner {
	traces: HashMap<String, Vec<Attempt>>,
	order: VecDeque<String>,
}

impl TraceStore {
	pub fn new(cap: usize) -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			cap: cap.max(1),
		}
	}

	pub fn record(&self, trace_id: &str, attempt: Attempt) {
		let mut inner = self.inner.lock();
		if !inner.traces.contains_key(trace_id) {
			inner.order.push_back(trace_id.to_string());
			while inner.order.len() > self.cap {
				if let Some(evicted) = inner.order.pop_front() {
					inner.traces.remove(&evicted);
				}
			}
		}
		inner
			.traces
			.entry(trace_id.to_string())
			.or_default()
			.push(attempt);
	}

	/// Attach a note to the most recent attempt of a trace.
	pub fn annotate(&self, trace_id: &str, note: &str) {
		let mut inner = self.inner.lock();
		if let Some(attempts) = inner.traces.get_mut(trace_id)
			&& let Some(last) = attempts.last_mut()
		{
			last.annotations.push(note.to_string());
		}
	}

	pub fn get(&self, trace_id: &str) -> Option<Vec<Attempt>> {
		self.inner.lock().traces.get(trace_id).cloned()
	}
}

impl Default for TraceStore {
	fn default() -> Self {
		Self::new(4096)
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::types::{Outcome, Usage};

	fn attempt(channel: i64) -> Attempt {
		Attempt {
			channel_id: channel,
			upstream_model: "gpt-4o-mini".into(),
			outcome: Outcome::Success,
			status: Some(200),
			latency: Duration::from_millis(12),
			usage: Some(Usage::default()),
			billed: 0,
			error: None,
			annotations: vec![],
		}
	}

	#[test]
	fn records_attempts_in_order() {
		let store = TraceStore::new(10);
		store.record("t1", attempt(1));
		store.record("t1", attempt(2));
		let attempts = store.get("t1").unwrap();
		assert_eq!(attempts.len(), 2);
		assert_eq!(attempts[0].channel_id, 1);
		assert_eq!(attempts[1].channel_id, 2);
	}

	#[test]
	fn evicts_oldest_traces() {
		let store = TraceStore::new(2);
		store.record("t1", attempt(1));
		store.record("t2", attempt(1));
		store.record("t3", attempt(1));
		assert!(store.get("t1").is_none());
		assert!(store.get("t2").is_some());
		assert!(store.get("t3").is_some());
	}

	#[test]
	fn annotates_last_attempt() {
		let store = TraceStore::new(10);
		store.record("t1", attempt(1));
		store.record("t1", attempt(2));
		store.annotate("t1", "reasoning_unsupported");
		let attempts = store.get("t1").unwrap();
		assert!(attempts[0].annotations.is_empty());
		assert_eq!(attempts[1].annotations, vec!["reasoning_unsupported"]);
	}
}
