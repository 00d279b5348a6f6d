use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;

use indexmap::IndexMap;

/// Insertion-order map bounded by `max_size`; reads promote the entry to
/// most-recently-used. On overflow the single least-recently-used entry is
/// evicted and `on_evict` (if set) runs exactly once, synchronously, before
/// `insert` returns.
///
/// Backed by `IndexMap` (the same structure the load-balancer's endpoint
/// groups use to keep deterministic order) so iteration is always
/// oldest-first without a side index.
pub struct LruMap<K, V> {
	map: IndexMap<K, V>,
	max_size: NonZeroUsize,
	on_evict: Option<Box<dyn Fn(&K, &V) + Send + Sync>>,
}

impl<K, V> LruMap<K, V>
where
	K: Hash + Eq + Clone,
{
	pub fn new(max_size: NonZeroUsize) -> Self {
		Self {
			map: IndexMap::new(),
			max_size,
			on_evict: None,
		}
	}

	pub fn with_evict(max_size: NonZeroUsize, on_evict: impl Fn(&K, &V) + Send + Sync + 'static) -> Self {
		Self {
			map: IndexMap::new(),
			max_size,
			on_evict: Some(Box::new(on_evict)),
		}
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	/// Insert or overwrite, promoting to most-recently-used. Never fails;
	/// evicts the oldest entry if this insertion pushes `len()` past
	/// `max_size`.
	pub fn insert(&mut self, key: K, value: V) {
		// Re-inserting an existing key should still promote it to the back.
		self.map.shift_remove(&key);
		self.map.insert(key, value);
		if self.map.len() > self.max_size.get() {
			if let Some((k, v)) = self.map.shift_remove_index(0)
				&& let Some(cb) = &self.on_evict
			{
				cb(&k, &v);
			}
		}
	}

	/// Read without promoting. Useful for stats snapshots that must not
	/// perturb LRU order.
	pub fn peek<Q>(&self, key: &Q) -> Option<&V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		self.map.get(key)
	}

	/// Read and promote to most-recently-used.
	pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		let (k, v) = self.map.shift_remove_entry(key)?;
		self.map.insert(k.clone(), v);
		// Re-borrow by key since `insert` above invalidated the prior reference.
		self.map.get(&k)
	}

	pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		self.map.shift_remove(key)
	}

	/// Oldest-first iteration order.
	pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
		self.map.iter()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cap(n: usize) -> NonZeroUsize {
		NonZeroUsize::new(n).unwrap()
	}

	#[test]
	fn evicts_oldest_on_overflow() {
		let mut m: LruMap<&str, u32> = LruMap::new(cap(2));
		m.insert("a", 1);
		m.insert("b", 2);
		m.insert("c", 3);
		assert_eq!(m.len(), 2);
		assert!(m.peek("a").is_none());
		assert_eq!(m.peek("b"), Some(&2));
		assert_eq!(m.peek("c"), Some(&3));
	}

	#[test]
	fn get_promotes_to_most_recent() {
		let mut m: LruMap<&str, u32> = LruMap::new(cap(2));
		m.insert("a", 1);
		m.insert("b", 2);
		// Touch "a" so "b" becomes the oldest.
		assert_eq!(m.get("a"), Some(&1));
		m.insert("c", 3);
		assert!(m.peek("b").is_none());
		assert_eq!(m.peek("a"), Some(&1));
	}

	#[test]
	fn on_evict_fires_exactly_once() {
		use std::sync::atomic::{AtomicUsize, Ordering};
		use std::sync::Arc;

		let calls = Arc::new(AtomicUsize::new(0));
		let calls2 = calls.clone();
		let mut m: LruMap<&str, u32> = LruMap::with_evict(cap(1), move |_k, _v| {
			calls2.fetch_add(1, Ordering::SeqCst);
		});
		m.insert("a", 1);
		m.insert("b", 2);
		m.insert("c", 3);
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn peek_does_not_reorder() {
		let mut m: LruMap<&str, u32> = LruMap::new(cap(2));
		m.insert("a", 1);
		m.insert("b", 2);
		assert_eq!(m.peek("a"), Some(&1));
		m.insert("c", 3);
		// "a" was only peeked, not `get`-promoted, so it's still the oldest.
		assert!(m.peek("a").is_none());
		assert_eq!(m.peek("b"), Some(&2));
	}
}
