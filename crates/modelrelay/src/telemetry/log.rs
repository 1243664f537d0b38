use std::sync::Arc;

use parking_lot::Mutex;

/// A shared slot for information that is produced while a response streams
/// and consumed when the request finalizes. Cloning shares the slot.
#[derive(Debug)]
pub struct AsyncLog<T> {
	inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for AsyncLog<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

impl<T> Default for AsyncLog<T> {
	fn default() -> Self {
		Self {
			inner: Arc::new(Mutex::new(None)),
		}
	}
}

impl<T> AsyncLog<T> {
	pub fn store(&self, value: Option<T>) {
		*self.inner.lock() = value;
	}

	/// Mutate the stored value in place; a no-op when nothing is stored.
	/// Not atomic with respect to other mutations of the same field, which
	/// is fine for last-writer-wins stream accounting.
	pub fn non_atomic_mutate(&self, f: impl FnOnce(&mut T)) {
		let mut guard = self.inner.lock();
		if let Some(value) = guard.as_mut() {
			f(value);
		}
	}

	pub fn take(&self) -> Option<T> {
		self.inner.lock().take()
	}

	pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
		let guard = self.inner.lock();
		f(guard.as_ref())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mutate_is_a_noop_until_stored() {
		let log: AsyncLog<u64> = AsyncLog::default();
		log.non_atomic_mutate(|v| *v += 1);
		assert_eq!(log.take(), None);

		log.store(Some(1));
		let shared = log.clone();
		shared.non_atomic_mutate(|v| *v += 10);
		assert_eq!(log.take(), Some(11));
		assert_eq!(log.take(), None);
	}
}
