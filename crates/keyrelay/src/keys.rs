use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use keyrelay_core::prelude::Strng;
use keyrelay_core::ring::RingBuffer;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::circuit::{CircuitBreaker, CircuitConfig, State as CircuitState, TransitionReason};
use crate::error::FailureKind;
use crate::ratelimit::RateLimiter;

const LATENCY_RING_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
	pub max_concurrency_per_key: u32,
	pub rate_limit_per_minute: u64,
	pub rate_limit_burst: u64,
	pub circuit: CircuitConfig,
	pub key_rate_limit_cooldown: KeyCooldownConfig,
	pub account_level_detection: AccountDetectionConfig,
	pub default_model_max_concurrency: u32,
	pub health_weights: HealthWeights,
	pub global_p95_ceiling_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyCooldownConfig {
	pub base_cooldown_ms: u64,
	pub cooldown_decay_ms: u64,
}

impl Default for KeyCooldownConfig {
	fn default() -> Self {
		Self {
			base_cooldown_ms: 1_000,
			cooldown_decay_ms: 30_000,
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct AccountDetectionConfig {
	pub enabled: bool,
	pub key_threshold: usize,
	pub window_ms: u64,
	pub cooldown_ms: u64,
}

impl Default for AccountDetectionConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			key_threshold: 3,
			window_ms: 5_000,
			cooldown_ms: 10_000,
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct HealthWeights {
	pub latency: f64,
	pub success: f64,
	pub error_recency: f64,
}

impl Default for HealthWeights {
	fn default() -> Self {
		Self {
			latency: 40.0,
			success: 40.0,
			error_recency: 20.0,
		}
	}
}

impl Default for KeyManagerConfig {
	fn default() -> Self {
		Self {
			max_concurrency_per_key: 10,
			rate_limit_per_minute: 60,
			rate_limit_burst: 10,
			circuit: CircuitConfig::default(),
			key_rate_limit_cooldown: KeyCooldownConfig::default(),
			account_level_detection: AccountDetectionConfig::default(),
			default_model_max_concurrency: 10,
			health_weights: HealthWeights::default(),
			// Design Note (spec §9 open question 3): the source never defines the
			// "global max p95" that latencyScore is normalized against. We define
			// it as the maximum p95 observed across all keys at selection time,
			// falling back to this ceiling when no key has any samples yet.
			global_p95_ceiling_ms: 5_000,
		}
	}
}

/// Mutable half of a credential. Per spec §5, every one of these fields is
/// mutated under the credential's single lock — no finer-grained locking.
struct CredentialState {
	in_flight: u32,
	total_requests: u64,
	success_count: u64,
	failure_count: u64,
	latencies: RingBuffer<u64>,
	last_used: Option<Instant>,
	last_success: Option<Instant>,
	last_failure: Option<Instant>,
	rate_limited_count: u32,
	rate_limited_at: Option<Instant>,
	rate_limit_cooldown_ms: u64,
	circuit: CircuitBreaker,
	rate_bucket: RateLimiter,
}

/// One upstream credential: the scheduler's atomic unit (spec §3).
pub struct Credential {
	pub index: usize,
	pub key_id: Strng,
	secret: Strng,
	state: Mutex<CredentialState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStats {
	pub index: usize,
	#[serde(rename = "keyId")]
	pub key_id: String,
	#[serde(rename = "inFlight")]
	pub in_flight: u32,
	#[serde(rename = "totalRequests")]
	pub total_requests: u64,
	#[serde(rename = "successCount")]
	pub success_count: u64,
	#[serde(rename = "failureCount")]
	pub failure_count: u64,
	#[serde(rename = "circuitState")]
	pub circuit_state: CircuitState,
	#[serde(rename = "rateLimitedCount")]
	pub rate_limited_count: u32,
	#[serde(rename = "p95LatencyMs")]
	pub p95_latency_ms: Option<u64>,
	#[serde(rename = "healthScore")]
	pub health_score: f64,
}

impl Credential {
	fn new(index: usize, key_id: Strng, secret: Strng, config: &KeyManagerConfig, on_circuit_change: impl Fn(usize, CircuitState, CircuitState, TransitionReason) + Send + Sync + 'static) -> Self {
		let circuit = CircuitBreaker::new(config.circuit).with_on_state_change(move |from, to, reason| {
			on_circuit_change(index, from, to, reason);
		});
		Self {
			index,
			key_id,
			secret,
			state: Mutex::new(CredentialState {
				in_flight: 0,
				total_requests: 0,
				success_count: 0,
				failure_count: 0,
				latencies: RingBuffer::new(NonZeroUsize::new(LATENCY_RING_CAPACITY).unwrap()),
				last_used: None,
				last_success: None,
				last_failure: None,
				rate_limited_count: 0,
				rate_limited_at: None,
				rate_limit_cooldown_ms: config.key_rate_limit_cooldown.base_cooldown_ms,
				circuit,
				rate_bucket: RateLimiter::new(config.rate_limit_per_minute, config.rate_limit_burst),
			}),
		}
	}

	/// `Bearer <id>.<secret>` — the only place the raw secret is ever
	/// materialized outside the keys file loader.
	pub fn authorization_header(&self) -> String {
		format!("Bearer {}.{}", self.key_id, self.secret)
	}

	fn decay_rate_limit(&self, state: &mut CredentialState, config: &KeyManagerConfig, now: Instant) {
		if let Some(at) = state.rate_limited_at
			&& now.duration_since(at) > Duration::from_millis(config.key_rate_limit_cooldown.cooldown_decay_ms)
		{
			state.rate_limited_count = 0;
			state.rate_limit_cooldown_ms = config.key_rate_limit_cooldown.base_cooldown_ms;
			state.rate_limited_at = None;
		}
	}

	fn is_available(&self, config: &KeyManagerConfig, now: Instant) -> bool {
		let mut state = self.state.lock();
		self.decay_rate_limit(&mut state, config, now);
		state.circuit.is_available()
			&& state.in_flight < config.max_concurrency_per_key
			&& state.rate_bucket.has_token()
			&& state.rate_limited_at.is_none_or(|at| now >= at + Duration::from_millis(state.rate_limit_cooldown_ms))
	}

	/// Exposed for the dispatcher's adaptive-timeout computation (spec §4.6
	/// step 5), in addition to internal selection scoring.
	pub fn p95_latency_ms(&self) -> Option<u64> {
		self.state.lock().latencies.percentile(0.95)
	}

	fn health_score(&self, weights: &HealthWeights, global_max_p95_ms: u64, max_concurrency: u32, now: Instant) -> f64 {
		let state = self.state.lock();
		let latency_score = match state.latencies.percentile(0.95) {
			Some(p95) => (1.0 - (p95 as f64 / global_max_p95_ms.max(1) as f64)).clamp(0.0, 1.0) * 100.0,
			None => 100.0,
		};
		let completed = state.total_requests.saturating_sub(state.in_flight as u64);
		// Open Question: spec leaves the no-data case undefined ("null"). We
		// treat an unproven key optimistically so it's eligible to be tried.
		let success_rate_score = if completed == 0 { 100.0 } else { 100.0 * state.success_count as f64 / completed as f64 };
		let error_recency_factor = match state.last_failure {
			None => 0.0,
			Some(ts) => {
				let elapsed = now.saturating_duration_since(ts).as_secs_f64();
				(1.0 - elapsed / 600.0).clamp(0.0, 1.0)
			},
		};
		let recency_penalty = match state.last_used {
			None => 0.0,
			Some(ts) => {
				let elapsed = now.saturating_duration_since(ts).as_secs_f64();
				if elapsed <= 1.0 {
					10.0
				} else if elapsed >= 5.0 {
					0.0
				} else {
					10.0 * (5.0 - elapsed) / 4.0
				}
			},
		};
		let in_flight_penalty = 15.0 * state.in_flight as f64 / max_concurrency.max(1) as f64;

		weights.latency * latency_score / 100.0 + weights.success * success_rate_score / 100.0 + weights.error_recency * (1.0 - error_recency_factor) - recency_penalty - in_flight_penalty
	}

	fn stats(&self, config: &KeyManagerConfig) -> CredentialStats {
		let mut state = self.state.lock();
		let circuit_state = state.circuit.stats().state;
		CredentialStats {
			index: self.index,
			key_id: self.key_id.to_string(),
			in_flight: state.in_flight,
			total_requests: state.total_requests,
			success_count: state.success_count,
			failure_count: state.failure_count,
			circuit_state,
			rate_limited_count: state.rate_limited_count,
			p95_latency_ms: state.latencies.percentile(0.95),
			health_score: self.health_score(&config.health_weights, config.global_p95_ceiling_ms, config.max_concurrency_per_key, Instant::now()),
		}
	}
}

/// Sliding window of 429 hits tagged by key index, spec §4.5.5.
struct AccountLevelDetector {
	recent_hits: Vec<(Instant, usize)>,
	cooldown_until: Option<Instant>,
}

impl AccountLevelDetector {
	fn new() -> Self {
		Self {
			recent_hits: Vec::new(),
			cooldown_until: None,
		}
	}

	fn record_hit(&mut self, config: &AccountDetectionConfig, key_index: usize, now: Instant) {
		if !config.enabled {
			return;
		}
		self.recent_hits.push((now, key_index));
		let window = Duration::from_millis(config.window_ms);
		self.recent_hits.retain(|(ts, _)| now.duration_since(*ts) <= window);
		let distinct: std::collections::HashSet<usize> = self.recent_hits.iter().map(|(_, idx)| *idx).collect();
		if distinct.len() >= config.key_threshold {
			self.cooldown_until = Some(now + Duration::from_millis(config.cooldown_ms));
		}
	}

	fn is_rate_limited(&self, now: Instant) -> bool {
		self.cooldown_until.is_some_and(|d| d > now)
	}

	fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
		self.cooldown_until.and_then(|d| d.checked_duration_since(now))
	}
}

#[derive(Debug, Clone, Copy)]
struct ModelGateState {
	in_flight: u32,
	max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelGateStats {
	pub model: String,
	#[serde(rename = "inFlight")]
	pub in_flight: u32,
	#[serde(rename = "maxConcurrency")]
	pub max_concurrency: u32,
	pub available: bool,
}

/// Pool of credentials, plus account-level detection and per-model
/// concurrency gating: spec §4.5 in full.
pub struct KeyManager {
	config: KeyManagerConfig,
	credentials: RwLock<Vec<Arc<Credential>>>,
	next_index: AtomicU32,
	account_detector: Mutex<AccountLevelDetector>,
	model_gates: RwLock<HashMap<Strng, ModelGateState>>,
	on_circuit_change: Arc<dyn Fn(usize, CircuitState, CircuitState, TransitionReason) + Send + Sync>,
}

pub struct AcquireOutcome {
	pub credential: Arc<Credential>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireFailure {
	/// No credential is available and no pool is cooling down.
	NoKeysAvailable,
	/// Account-level 429 lockout is active.
	AccountRateLimited,
}

impl KeyManager {
	pub fn new(config: KeyManagerConfig, on_circuit_change: impl Fn(usize, CircuitState, CircuitState, TransitionReason) + Send + Sync + 'static) -> Self {
		Self {
			config,
			credentials: RwLock::new(Vec::new()),
			next_index: AtomicU32::new(0),
			account_detector: Mutex::new(AccountLevelDetector::new()),
			model_gates: RwLock::new(HashMap::new()),
			on_circuit_change: Arc::new(on_circuit_change),
		}
	}

	pub fn load_keys(&self, entries: &[(Strng, Strng)]) {
		let mut creds = self.credentials.write();
		for (key_id, secret) in entries {
			let idx = self.next_index.fetch_add(1, Ordering::SeqCst) as usize;
			let cb = self.on_circuit_change.clone();
			creds.push(Arc::new(Credential::new(idx, key_id.clone(), secret.clone(), &self.config, move |i, f, t, r| cb(i, f, t, r))));
		}
	}

	pub fn len(&self) -> usize {
		self.credentials.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.credentials.read().is_empty()
	}

	pub fn any_available(&self) -> bool {
		let now = Instant::now();
		self.credentials.read().iter().any(|k| k.is_available(&self.config, now))
	}

	fn global_max_p95(&self) -> u64 {
		self.credentials.read().iter().filter_map(|k| k.p95_latency_ms()).max().unwrap_or(self.config.global_p95_ceiling_ms)
	}

	/// Selection algorithm §4.5.3. Recurses (bounded by key count) when
	/// token acquisition races with another selector.
	pub fn acquire_key(&self, excluded: &[usize]) -> Result<AcquireOutcome, AcquireFailure> {
		let now = Instant::now();
		if self.account_detector.lock().is_rate_limited(now) {
			return Err(AcquireFailure::AccountRateLimited);
		}

		let creds = self.credentials.read().clone();
		let global_max_p95 = self.global_max_p95();

		// Lazily advance OPEN -> HALF_OPEN before classifying anyone, so all
		// three sweeps below see a consistent, up-to-date circuit state.
		for k in &creds {
			k.state.lock().circuit.update_state();
		}

		// Step 1: primary sweep over CLOSED, available, non-excluded keys.
		let mut best: Option<(&Arc<Credential>, f64, u32, Option<Instant>)> = None;
		for k in &creds {
			if excluded.contains(&k.index) {
				continue;
			}
			let is_closed = { k.state.lock().circuit.stats().state == CircuitState::Closed };
			if !is_closed || !k.is_available(&self.config, now) {
				continue;
			}
			let score = k.health_score(&self.config.health_weights, global_max_p95, self.config.max_concurrency_per_key, now);
			let (in_flight, last_used) = {
				let s = k.state.lock();
				(s.in_flight, s.last_used)
			};
			let better = match &best {
				None => true,
				Some((_, best_score, best_inflight, best_last_used)) => {
					if (score - best_score).abs() > 0.5 {
						score > *best_score
					} else if in_flight != *best_inflight {
						in_flight < *best_inflight
					} else {
						last_used.unwrap_or(now) < best_last_used.unwrap_or(now)
					}
				},
			};
			if better {
				best = Some((k, score, in_flight, last_used));
			}
		}
		if let Some((k, ..)) = best {
			return self.try_finalize_acquire(k.clone(), excluded);
		}

		// Step 2: half-open probe, least-loaded.
		let mut half_open: Option<&Arc<Credential>> = None;
		let mut half_open_inflight = u32::MAX;
		for k in &creds {
			if excluded.contains(&k.index) {
				continue;
			}
			let s = k.state.lock();
			let eligible = s.circuit.stats().state == CircuitState::HalfOpen && s.in_flight < self.config.max_concurrency_per_key && s.rate_bucket.has_token();
			if eligible && s.in_flight < half_open_inflight {
				half_open_inflight = s.in_flight;
				drop(s);
				half_open = Some(k);
			}
		}
		if let Some(k) = half_open {
			return self.try_finalize_acquire(k.clone(), excluded);
		}

		// Step 3: rescue path — force the longest-open OPEN key to HALF_OPEN.
		let mut rescue: Option<&Arc<Credential>> = None;
		let mut rescue_opened_at = None;
		for k in &creds {
			if excluded.contains(&k.index) {
				continue;
			}
			let s = k.state.lock();
			if s.circuit.stats().state == CircuitState::Open {
				let opened_at = s.circuit.opened_at();
				if rescue_opened_at.is_none_or(|cur: Instant| opened_at.is_some_and(|o| o < cur)) {
					rescue_opened_at = opened_at;
					drop(s);
					rescue = Some(k);
				}
			}
		}
		if let Some(k) = rescue {
			k.state.lock().circuit.force_state(CircuitState::HalfOpen);
			return self.try_finalize_acquire(k.clone(), excluded);
		}

		Err(AcquireFailure::NoKeysAvailable)
	}

	fn try_finalize_acquire(&self, k: Arc<Credential>, excluded: &[usize]) -> Result<AcquireOutcome, AcquireFailure> {
		let acquired = {
			let mut state = k.state.lock();
			if state.in_flight >= self.config.max_concurrency_per_key {
				false
			} else if !state.rate_bucket.try_wait().allowed {
				false
			} else {
				state.in_flight += 1;
				state.total_requests += 1;
				state.last_used = Some(Instant::now());
				true
			}
		};
		if acquired {
			return Ok(AcquireOutcome { credential: k });
		}
		let mut next_excluded = excluded.to_vec();
		next_excluded.push(k.index);
		if next_excluded.len() >= self.len() {
			return Err(AcquireFailure::NoKeysAvailable);
		}
		self.acquire_key(&next_excluded)
	}

	pub fn record_success(&self, k: &Credential, latency: Duration) {
		let mut state = k.state.lock();
		state.in_flight = state.in_flight.saturating_sub(1);
		state.latencies.push(latency.as_millis() as u64);
		state.success_count += 1;
		state.last_success = Some(Instant::now());
		state.rate_limited_count = 0;
		state.rate_limited_at = None;
		state.rate_limit_cooldown_ms = self.config.key_rate_limit_cooldown.base_cooldown_ms;
		state.circuit.record_success();
	}

	pub fn record_failure(&self, k: &Credential, kind: FailureKind) {
		let mut state = k.state.lock();
		state.in_flight = state.in_flight.saturating_sub(1);
		state.failure_count += 1;
		state.last_failure = Some(Instant::now());
		if kind.counts_against_circuit() {
			state.circuit.record_failure(kind);
		}
	}

	pub fn record_rate_limit(&self, k: &Credential, cooldown: Duration) {
		let now = Instant::now();
		{
			let mut state = k.state.lock();
			state.in_flight = state.in_flight.saturating_sub(1);
			state.rate_limited_count += 1;
			state.rate_limited_at = Some(now);
			state.rate_limit_cooldown_ms = cooldown.as_millis() as u64;
		}
		self.account_detector.lock().record_hit(&self.config.account_level_detection, k.index, now);
	}

	pub fn release_key(&self, k: &Credential) {
		let mut state = k.state.lock();
		state.in_flight = state.in_flight.saturating_sub(1);
	}

	pub fn account_cooldown_remaining(&self) -> Option<Duration> {
		self.account_detector.lock().cooldown_remaining(Instant::now())
	}

	pub fn acquire_model_slot(&self, model: &str) -> bool {
		let mut gates = self.model_gates.write();
		let gate = gates.entry(Strng::from(model)).or_insert(ModelGateState {
			in_flight: 0,
			max_concurrency: self.config.default_model_max_concurrency,
		});
		if gate.in_flight < gate.max_concurrency {
			gate.in_flight += 1;
			true
		} else {
			false
		}
	}

	pub fn release_model_slot(&self, model: &str) {
		let mut gates = self.model_gates.write();
		if let Some(gate) = gates.get_mut(model) {
			gate.in_flight = gate.in_flight.saturating_sub(1);
		}
	}

	pub fn set_model_max_concurrency(&self, model: &str, max_concurrency: u32) {
		let mut gates = self.model_gates.write();
		let gate = gates.entry(Strng::from(model)).or_insert(ModelGateState { in_flight: 0, max_concurrency });
		gate.max_concurrency = max_concurrency;
	}

	/// Snapshot of every model gate seen so far, for `GET /models` (spec §6).
	/// Models only appear here once a request has referenced them; there is
	/// no static catalog to seed from.
	pub fn model_gate_stats(&self) -> Vec<ModelGateStats> {
		self.model_gates
			.read()
			.iter()
			.map(|(model, gate)| ModelGateStats {
				model: model.to_string(),
				in_flight: gate.in_flight,
				max_concurrency: gate.max_concurrency,
				available: gate.in_flight < gate.max_concurrency,
			})
			.collect()
	}

	/// Hot reload (§4.5.7): diff by `keyId`. Existing entries keep all
	/// stats/circuit state; new entries start fresh; dropped entries are
	/// removed. In-flight requests hold their own `Arc<Credential>` so they
	/// keep working even after this call returns.
	pub fn reload_keys(&self, entries: &[(Strng, Strng)]) -> ReloadReport {
		let mut creds = self.credentials.write();
		let existing: HashMap<Strng, Arc<Credential>> = creds.iter().map(|c| (c.key_id.clone(), c.clone())).collect();
		let new_ids: std::collections::HashSet<&Strng> = entries.iter().map(|(id, _)| id).collect();

		let mut next = Vec::with_capacity(entries.len());
		let mut added = 0;
		for (key_id, secret) in entries {
			if let Some(existing_cred) = existing.get(key_id) {
				next.push(existing_cred.clone());
			} else {
				let idx = self.next_index.fetch_add(1, Ordering::SeqCst) as usize;
				let cb = self.on_circuit_change.clone();
				next.push(Arc::new(Credential::new(idx, key_id.clone(), secret.clone(), &self.config, move |i, f, t, r| cb(i, f, t, r))));
				added += 1;
			}
		}
		let removed = existing.keys().filter(|id| !new_ids.contains(*id)).count();
		let total = next.len();
		*creds = next;
		ReloadReport { total, added, removed }
	}

	pub fn stats(&self) -> Vec<CredentialStats> {
		self.credentials.read().iter().map(|k| k.stats(&self.config)).collect()
	}

	pub fn config(&self) -> &KeyManagerConfig {
		&self.config
	}
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReloadReport {
	pub total: usize,
	pub added: usize,
	pub removed: usize,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn manager(config: KeyManagerConfig) -> KeyManager {
		KeyManager::new(config, |_, _, _, _| {})
	}

	fn keys(n: usize) -> Vec<(Strng, Strng)> {
		(0..n).map(|i| (Strng::from(format!("k{i}")), Strng::from("secret"))).collect()
	}

	#[test]
	fn acquire_then_release_returns_to_zero_inflight() {
		let km = manager(KeyManagerConfig::default());
		km.load_keys(&keys(1));
		let out = km.acquire_key(&[]).unwrap();
		assert_eq!(out.credential.state.lock().in_flight, 1);
		km.release_key(&out.credential);
		assert_eq!(out.credential.state.lock().in_flight, 0);
	}

	#[test]
	fn exhaustion_returns_none_when_all_keys_busy() {
		let mut config = KeyManagerConfig::default();
		config.max_concurrency_per_key = 1;
		let km = manager(config);
		km.load_keys(&keys(2));
		let a = km.acquire_key(&[]).unwrap();
		let b = km.acquire_key(&[]).unwrap();
		assert_matches::assert_matches!(km.acquire_key(&[]), Err(AcquireFailure::NoKeysAvailable));
		km.release_key(&a.credential);
		km.release_key(&b.credential);
	}

	#[test]
	fn circuit_open_key_is_excluded_from_primary_sweep() {
		let km = manager(KeyManagerConfig::default());
		km.load_keys(&keys(2));
		let stats = km.stats();
		let first_index = stats[0].index;
		{
			let creds = km.credentials.read();
			let k = creds.iter().find(|k| k.index == first_index).unwrap();
			k.state.lock().circuit.force_state(CircuitState::Open);
		}
		for _ in 0..5 {
			let out = km.acquire_key(&[]).unwrap();
			assert_ne!(out.credential.index, first_index);
			km.release_key(&out.credential);
		}
	}

	#[test]
	fn rescue_path_forces_half_open_when_all_open() {
		let km = manager(KeyManagerConfig::default());
		km.load_keys(&keys(1));
		{
			let creds = km.credentials.read();
			creds[0].state.lock().circuit.force_state(CircuitState::Open);
		}
		let out = km.acquire_key(&[]).unwrap();
		assert_eq!(out.credential.state.lock().circuit.stats().state, CircuitState::HalfOpen);
	}

	#[test]
	fn account_level_lockout_after_threshold_distinct_429s() {
		let km = manager(KeyManagerConfig::default());
		km.load_keys(&keys(4));
		let creds: Vec<Arc<Credential>> = km.credentials.read().clone();
		for k in creds.iter().take(3) {
			km.record_rate_limit(k, Duration::from_secs(1));
		}
		assert!(km.account_cooldown_remaining().is_some());
		assert!(km.acquire_key(&[]).is_err());
	}

	#[test]
	fn reload_preserves_stats_for_existing_keys() {
		let km = manager(KeyManagerConfig::default());
		km.load_keys(&keys(1));
		let cred = km.credentials.read()[0].clone();
		for _ in 0..50 {
			km.record_success(&cred, Duration::from_millis(10));
			cred.state.lock().in_flight += 1; // simulate a fresh acquire before each success
		}
		let mut new_list = keys(1);
		new_list.push((Strng::from("k1"), Strng::from("secret")));
		let report = km.reload_keys(&new_list);
		assert_eq!(report.added, 1);
		assert_eq!(report.removed, 0);
		let stats = km.stats();
		let preserved = stats.iter().find(|s| s.key_id == "k0").unwrap();
		assert_eq!(preserved.success_count, 50);
	}

	#[test]
	fn model_gate_blocks_past_max_concurrency() {
		let km = manager(KeyManagerConfig::default());
		km.set_model_max_concurrency("claude-3", 1);
		assert!(km.acquire_model_slot("claude-3"));
		assert!(!km.acquire_model_slot("claude-3"));
		km.release_model_slot("claude-3");
		assert!(km.acquire_model_slot("claude-3"));
	}

	#[test]
	fn rate_limit_zero_always_allows_selection_by_tokens() {
		let mut config = KeyManagerConfig::default();
		config.rate_limit_per_minute = 0;
		let km = manager(config);
		km.load_keys(&keys(1));
		for _ in 0..20 {
			let out = km.acquire_key(&[]).unwrap();
			km.release_key(&out.credential);
		}
	}
}
