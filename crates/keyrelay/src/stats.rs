use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use keyrelay_core::lru::LruMap;
use keyrelay_core::prelude::Strng;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::keys::{CredentialStats, KeyManager};
use crate::replay::ReplayStats;

/// Pure read-projection over the live key pool, spec §4.9. Never mutates
/// scheduler state; every field here is a copy taken under the same
/// per-credential locks `KeyManager` itself uses.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
	pub keys: Vec<CredentialStats>,
	pub totals: Totals,
	pub errors: HashMap<String, u64>,
	pub tokens: TokenSnapshot,
	pub replay: ReplayStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Totals {
	#[serde(rename = "totalRequests")]
	pub total_requests: u64,
	#[serde(rename = "successCount")]
	pub success_count: u64,
	#[serde(rename = "failureCount")]
	pub failure_count: u64,
	#[serde(rename = "inFlight")]
	pub in_flight: u32,
}

/// Categorized error counters, side-band to the key pool. Spec's "God class"
/// design note calls for this to stay a separate component wired by the
/// server rather than folded into `KeyManager`.
#[derive(Default)]
pub struct ErrorTracker {
	counts: Mutex<HashMap<FailureKind, u64>>,
}

impl ErrorTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record(&self, kind: FailureKind) {
		*self.counts.lock().entry(kind).or_insert(0) += 1;
	}

	pub fn snapshot(&self) -> HashMap<String, u64> {
		self.counts.lock().iter().map(|(k, v)| (format!("{k:?}"), *v)).collect()
	}
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenCount {
	pub input: u64,
	pub output: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenSnapshot {
	pub aggregate: TokenCount,
	pub per_key: HashMap<String, TokenCount>,
}

/// Per-key and aggregate token accounting, LRU-bounded to `maxKeys` exactly
/// as spec §4.9 describes — reuses `core::lru` the same way `ReplayQueue`
/// does.
pub struct TokenTracker {
	aggregate_input: AtomicU64,
	aggregate_output: AtomicU64,
	per_key: Mutex<LruMap<Strng, TokenCount>>,
}

impl TokenTracker {
	pub fn new(max_keys: NonZeroUsize) -> Self {
		Self {
			aggregate_input: AtomicU64::new(0),
			aggregate_output: AtomicU64::new(0),
			per_key: Mutex::new(LruMap::new(max_keys)),
		}
	}

	pub fn record(&self, key_id: &str, input: u64, output: u64) {
		self.aggregate_input.fetch_add(input, Ordering::Relaxed);
		self.aggregate_output.fetch_add(output, Ordering::Relaxed);
		let mut per_key = self.per_key.lock();
		let current = per_key.get(key_id).copied().unwrap_or_default();
		per_key.insert(
			Strng::from(key_id),
			TokenCount {
				input: current.input + input,
				output: current.output + output,
			},
		);
	}

	pub fn snapshot(&self) -> TokenSnapshot {
		let per_key = self.per_key.lock();
		TokenSnapshot {
			aggregate: TokenCount {
				input: self.aggregate_input.load(Ordering::Relaxed),
				output: self.aggregate_output.load(Ordering::Relaxed),
			},
			per_key: per_key.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
		}
	}
}

/// Wires the three collectors together into one read API for the admin
/// surface, without becoming a God object itself: it owns no mutable
/// scheduler state of its own.
pub struct StatsAggregator<'a> {
	pub keys: &'a KeyManager,
	pub errors: &'a ErrorTracker,
	pub tokens: &'a TokenTracker,
	pub replay: &'a crate::replay::ReplayQueue,
}

impl<'a> StatsAggregator<'a> {
	pub fn snapshot(&self) -> StatsSnapshot {
		let keys = self.keys.stats();
		let totals = keys.iter().fold(Totals::default(), |mut acc, k| {
			acc.total_requests += k.total_requests;
			acc.success_count += k.success_count;
			acc.failure_count += k.failure_count;
			acc.in_flight += k.in_flight;
			acc
		});
		StatsSnapshot {
			keys,
			totals,
			errors: self.errors.snapshot(),
			tokens: self.tokens.snapshot(),
			replay: self.replay.get_stats(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_tracker_categorizes() {
		let t = ErrorTracker::new();
		t.record(FailureKind::Timeout);
		t.record(FailureKind::Timeout);
		t.record(FailureKind::ServerError);
		let snap = t.snapshot();
		assert_eq!(snap.get("Timeout"), Some(&2));
		assert_eq!(snap.get("ServerError"), Some(&1));
	}

	#[test]
	fn token_tracker_accumulates_and_bounds_keys() {
		let t = TokenTracker::new(NonZeroUsize::new(2).unwrap());
		t.record("k0", 100, 50);
		t.record("k0", 10, 5);
		t.record("k1", 1, 1);
		t.record("k2", 1, 1); // evicts k0 despite it having the most data
		let snap = t.snapshot();
		assert_eq!(snap.aggregate.input, 112);
		assert_eq!(snap.per_key.len(), 2);
		assert!(!snap.per_key.contains_key("k0"));
	}
}
