use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::sleep_until;

use crate::error::ProxyError;

/// A queued request's admission key: higher priority first, then earlier
/// arrival (lower sequence number) first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AdmissionKey {
	priority: i32,
	seq: u64,
}

impl Ord for AdmissionKey {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.priority.cmp(&other.priority).then_with(|| Reverse(self.seq).cmp(&Reverse(other.seq)))
	}
}
impl PartialOrd for AdmissionKey {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

struct Entry {
	key: AdmissionKey,
	deadline: Instant,
	notify: oneshot::Sender<Result<(), ProxyError>>,
}

impl PartialEq for Entry {
	fn eq(&self, other: &Self) -> bool {
		self.key == other.key
	}
}
impl Eq for Entry {}
impl Ord for Entry {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.key.cmp(&other.key)
	}
}
impl PartialOrd for Entry {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

struct Inner {
	heap: BinaryHeap<Entry>,
	next_seq: u64,
}

/// Bounded FIFO waiting area with priority override and per-entry timeout,
/// spec §4.7. A request admitted via [`RequestQueue::enqueue`] suspends on
/// the returned receiver until either a slot frees (`Ok(())`) or its
/// deadline passes (`queue_timeout`).
pub struct RequestQueue {
	capacity: usize,
	inner: Mutex<Inner>,
}

impl RequestQueue {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			inner: Mutex::new(Inner {
				heap: BinaryHeap::new(),
				next_seq: 0,
			}),
		}
	}

	pub fn len(&self) -> usize {
		self.inner.lock().heap.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Enqueues one waiter and awaits it with a timeout. Returns
	/// `queue_full` immediately if at capacity, or `queue_timeout` if the
	/// deadline elapses before [`RequestQueue::admit_one`] reaches it.
	pub async fn enqueue(&self, priority: i32, timeout: Duration) -> Result<(), ProxyError> {
		let (tx, rx) = oneshot::channel();
		{
			let mut inner = self.inner.lock();
			if inner.heap.len() >= self.capacity {
				return Err(ProxyError::queue_full());
			}
			let seq = inner.next_seq;
			inner.next_seq += 1;
			inner.heap.push(Entry {
				key: AdmissionKey { priority, seq },
				deadline: Instant::now() + timeout,
				notify: tx,
			});
		}
		match rx.await {
			Ok(result) => result,
			Err(_) => Err(ProxyError::queue_timeout()),
		}
	}

	/// Admits the highest-priority, earliest-arrived waiter, if any.
	pub fn admit_one(&self) -> bool {
		let mut inner = self.inner.lock();
		while let Some(entry) = inner.heap.pop() {
			if entry.notify.send(Ok(())).is_ok() {
				return true;
			}
			// Receiver already gone (its own timeout or cancellation fired); skip it.
		}
		false
	}

	/// Evicts every waiter whose deadline has passed. Call periodically from
	/// the server's background loop (teacher's `maybe_sleep_until` + `select!`
	/// idiom — reused here to drive eviction only when the earliest deadline
	/// is actually due).
	pub fn evict_expired(&self) {
		let now = Instant::now();
		let mut inner = self.inner.lock();
		let mut keep = BinaryHeap::new();
		while let Some(entry) = inner.heap.pop() {
			if entry.deadline <= now {
				let _ = entry.notify.send(Err(ProxyError::queue_timeout()));
			} else {
				keep.push(entry);
			}
		}
		inner.heap = keep;
	}

	pub fn earliest_deadline(&self) -> Option<Instant> {
		self.inner.lock().heap.iter().map(|e| e.deadline).min()
	}

	/// Waits until the next entry's deadline so the caller's `select!` can
	/// drive `evict_expired` without busy-polling.
	pub async fn sleep_until_next_deadline(&self) {
		match self.earliest_deadline() {
			Some(deadline) => sleep_until(deadline.into()).await,
			None => std::future::pending().await,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn enqueue_fails_when_full() {
		let q = std::sync::Arc::new(RequestQueue::new(1));
		let q2 = q.clone();
		let handle = tokio::spawn(async move { q2.enqueue(0, Duration::from_secs(10)).await });
		// Give the spawned task a chance to register its entry in the heap.
		tokio::task::yield_now().await;
		tokio::time::sleep(Duration::from_millis(5)).await;
		assert_eq!(q.len(), 1);
		let err = q.enqueue(0, Duration::from_secs(10)).await.unwrap_err();
		assert_eq!(err.status(), http::StatusCode::SERVICE_UNAVAILABLE);
		q.admit_one();
		handle.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn admits_higher_priority_first() {
		let q = std::sync::Arc::new(RequestQueue::new(10));
		let q_low = q.clone();
		let low = tokio::spawn(async move { q_low.enqueue(0, Duration::from_secs(10)).await });
		let q_high = q.clone();
		let high = tokio::spawn(async move { q_high.enqueue(5, Duration::from_secs(10)).await });
		tokio::time::sleep(Duration::from_millis(5)).await;
		assert!(q.admit_one());
		assert!(high.await.unwrap().is_ok());
		q.admit_one();
		low.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn expired_entries_fail_with_queue_timeout() {
		let q = RequestQueue::new(10);
		let fut = q.enqueue(0, Duration::from_millis(1));
		tokio::time::sleep(Duration::from_millis(10)).await;
		q.evict_expired();
		let err = fut.await.unwrap_err();
		assert_eq!(err.status(), http::StatusCode::SERVICE_UNAVAILABLE);
	}
}
