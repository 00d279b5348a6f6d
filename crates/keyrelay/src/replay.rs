use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderMap;
use keyrelay_core::lru::LruMap;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayEvent {
	Enqueued { trace_id: Uuid },
	Evicted { trace_id: Uuid },
	ReplayStart { trace_id: Uuid },
	ReplaySuccess { trace_id: Uuid },
	ReplayError { trace_id: Uuid, message: String },
	Expired { trace_id: Uuid },
}

#[derive(Clone)]
pub struct ReplayEntry {
	pub trace_id: Uuid,
	pub model: Option<String>,
	pub method: http::Method,
	pub path: String,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub failed_at: Instant,
	pub failure_kind: crate::error::FailureKind,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
	pub model: Option<String>,
	pub failure_kind: Option<crate::error::FailureKind>,
}

impl ReplayFilter {
	fn matches(&self, entry: &ReplayEntry) -> bool {
		self.model.as_deref().is_none_or(|m| entry.model.as_deref() == Some(m)) && self.failure_kind.is_none_or(|k| k == entry.failure_kind)
	}
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReplayStats {
	pub enqueued: u64,
	pub evicted: u64,
	pub replayed: u64,
	pub replay_errors: u64,
	pub expired: u64,
}

/// An override applied to a replayed request before it is re-sent.
#[derive(Debug, Clone, Default)]
pub struct ReplayOverrides {
	pub headers: Option<HeaderMap>,
	pub body: Option<Bytes>,
	pub dry_run: bool,
}

/// Post-failure replay buffer, spec §4.8: retention-bounded, with
/// replay-by-id and filtered bulk replay. Built on `core::lru` the same way
/// `TokenTracker` is, so overflow eviction is O(1) and deterministic.
pub struct ReplayQueue {
	retention: Duration,
	max_retries: u32,
	entries: Mutex<LruMap<Uuid, ReplayEntry>>,
	events: Arc<Mutex<Vec<ReplayEvent>>>,
	stats: Arc<Mutex<ReplayStats>>,
}

impl ReplayQueue {
	pub fn new(max_size: NonZeroUsize, retention: Duration, max_retries: u32) -> Self {
		let events = Arc::new(Mutex::new(Vec::new()));
		let stats = Arc::new(Mutex::new(ReplayStats::default()));
		let evict_events = events.clone();
		let evict_stats = stats.clone();
		Self {
			retention,
			max_retries,
			entries: Mutex::new(LruMap::with_evict(max_size, move |k, _v| {
				evict_events.lock().push(ReplayEvent::Evicted { trace_id: *k });
				evict_stats.lock().evicted += 1;
			})),
			events,
			stats,
		}
	}

	fn emit(&self, event: ReplayEvent) {
		self.events.lock().push(event);
	}

	pub fn enqueue(&self, entry: ReplayEntry) {
		let trace_id = entry.trace_id;
		self.entries.lock().insert(trace_id, entry);
		self.stats.lock().enqueued += 1;
		self.emit(ReplayEvent::Enqueued { trace_id });
	}

	pub fn remove(&self, trace_id: Uuid) -> Option<ReplayEntry> {
		self.entries.lock().remove(&trace_id)
	}

	pub fn clear(&self) {
		let mut entries = self.entries.lock();
		let ids: Vec<Uuid> = entries.iter().map(|(k, _)| *k).collect();
		for id in ids {
			entries.remove(&id);
		}
	}

	pub fn get_stats(&self) -> ReplayStats {
		*self.stats.lock()
	}

	pub fn drain_events(&self) -> Vec<ReplayEvent> {
		std::mem::take(&mut self.events.lock())
	}

	/// Replays one entry by id, invoking the caller-supplied send function up
	/// to `maxRetries` times. `dryRun` skips the actual send and only
	/// reports what would happen.
	pub async fn replay<F, Fut>(&self, trace_id: Uuid, overrides: ReplayOverrides, send: F) -> Result<(), String>
	where
		F: Fn(Arc<ReplayEntry>) -> Fut,
		Fut: std::future::Future<Output = Result<(), String>>,
	{
		let Some(entry) = self.entries.lock().peek(&trace_id).cloned() else {
			return Err("trace_id not found".to_string());
		};
		let mut entry = entry;
		if let Some(h) = overrides.headers {
			entry.headers = h;
		}
		if let Some(b) = overrides.body {
			entry.body = b;
		}
		self.emit(ReplayEvent::ReplayStart { trace_id });
		if overrides.dry_run {
			return Ok(());
		}
		let entry = Arc::new(entry);
		let mut last_err = String::new();
		for _ in 0..=self.max_retries {
			match send(entry.clone()).await {
				Ok(()) => {
					self.stats.lock().replayed += 1;
					self.emit(ReplayEvent::ReplaySuccess { trace_id });
					return Ok(());
				},
				Err(e) => last_err = e,
			}
		}
		self.stats.lock().replay_errors += 1;
		self.emit(ReplayEvent::ReplayError {
			trace_id,
			message: last_err.clone(),
		});
		Err(last_err)
	}

	pub fn replay_all_matching(&self, filter: &ReplayFilter) -> Vec<Uuid> {
		self.entries.lock().iter().filter(|(_, v)| filter.matches(v)).map(|(k, _)| *k).collect()
	}

	/// Removes entries older than `retention`. Intended to be driven by a
	/// `tokio::time::interval` sweep task in the owning server, per the
	/// teacher's dedicated-background-worker pattern for state that must not
	/// share a lock with hot request paths.
	pub fn sweep_expired(&self) {
		let now = Instant::now();
		let mut entries = self.entries.lock();
		let expired: Vec<Uuid> = entries.iter().filter(|(_, v)| now.duration_since(v.failed_at) > self.retention).map(|(k, _)| *k).collect();
		drop(entries);
		for id in expired {
			self.entries.lock().remove(&id);
			self.stats.lock().expired += 1;
			self.emit(ReplayEvent::Expired { trace_id: id });
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(trace_id: Uuid) -> ReplayEntry {
		ReplayEntry {
			trace_id,
			model: Some("claude-3".to_string()),
			method: http::Method::POST,
			path: "/v1/messages".to_string(),
			headers: HeaderMap::new(),
			body: Bytes::new(),
			failed_at: Instant::now(),
			failure_kind: crate::error::FailureKind::ServerError,
		}
	}

	#[tokio::test]
	async fn replay_succeeds_on_first_try() {
		let q = ReplayQueue::new(NonZeroUsize::new(10).unwrap(), Duration::from_secs(60), 3);
		let id = Uuid::new_v4();
		q.enqueue(entry(id));
		let result = q.replay(id, ReplayOverrides::default(), |_e| async { Ok(()) }).await;
		assert!(result.is_ok());
		assert_eq!(q.get_stats().replayed, 1);
	}

	#[tokio::test]
	async fn dry_run_does_not_invoke_send() {
		let q = ReplayQueue::new(NonZeroUsize::new(10).unwrap(), Duration::from_secs(60), 3);
		let id = Uuid::new_v4();
		q.enqueue(entry(id));
		let overrides = ReplayOverrides {
			dry_run: true,
			..Default::default()
		};
		let result = q
			.replay(id, overrides, |_e| async { panic!("must not be called in dry run") })
			.await;
		assert!(result.is_ok());
		assert_eq!(q.get_stats().replayed, 0);
	}

	#[test]
	fn overflow_evicts_oldest() {
		let q = ReplayQueue::new(NonZeroUsize::new(1).unwrap(), Duration::from_secs(60), 3);
		q.enqueue(entry(Uuid::new_v4()));
		q.enqueue(entry(Uuid::new_v4()));
		assert_eq!(q.get_stats().evicted, 1);
	}

	#[test]
	fn sweep_expires_old_entries() {
		let q = ReplayQueue::new(NonZeroUsize::new(10).unwrap(), Duration::from_millis(1), 3);
		q.enqueue(entry(Uuid::new_v4()));
		std::thread::sleep(Duration::from_millis(10));
		q.sweep_expired();
		assert_eq!(q.get_stats().expired, 1);
	}
}
