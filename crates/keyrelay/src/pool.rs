use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::{HeaderMap, HeaderName, header};
use keyrelay_core::prelude::Strng;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;

pub const GLOBAL_POOL: &str = "__global__";

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
	pub base_ms: u64,
	pub cap_ms: u64,
	pub decay_ms: u64,
	pub remaining_threshold: u64,
	pub pacing_delay_ms: u64,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			base_ms: 500,
			cap_ms: 5_000,
			decay_ms: 10_000,
			remaining_threshold: 5,
			pacing_delay_ms: 200,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimitHeaderSnapshot {
	pub remaining: Option<u64>,
	pub limit: Option<u64>,
	pub reset: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct PoolState {
	rate_limited_until: Option<std::time::Instant>,
	count: u32,
	last_hit_at: Option<std::time::Instant>,
	last_headers: RateLimitHeaderSnapshot,
}

/// Per-model pool cooldown, spec §4.4. A small map behind one `RwLock`: the
/// teacher reserves lock-free structures for the hot per-key path and uses
/// plain locks for smaller, less-contended maps like this one.
pub struct PoolManager {
	config: PoolConfig,
	pools: RwLock<HashMap<Strng, PoolState>>,
}

impl PoolManager {
	pub fn new(config: PoolConfig) -> Self {
		Self {
			config,
			pools: RwLock::new(HashMap::new()),
		}
	}

	/// Records an upstream 429 attributed to `model` (or `GLOBAL_POOL` for
	/// unattributed hits) and escalates its cooldown.
	pub fn record_pool_rate_limit_hit(&self, model: &str) {
		let mut pools = self.pools.write();
		let state = pools.entry(Strng::from(model)).or_default();
		let now = std::time::Instant::now();
		if let Some(last_hit) = state.last_hit_at
			&& now.duration_since(last_hit) > Duration::from_millis(self.config.decay_ms)
		{
			state.count = 0;
		}
		state.count = (state.count + 1).min(10);
		state.last_hit_at = Some(now);

		let base = self.config.base_ms.saturating_mul(1u64 << (state.count.saturating_sub(1)).min(20));
		let cooldown_ms = base.min(self.config.cap_ms);
		let jitter: f64 = rand::rng().random_range(-0.15..=0.15);
		let final_ms = (cooldown_ms as f64 * (1.0 + jitter)).max(0.0) as u64;
		let deadline = now + Duration::from_millis(final_ms);
		state.rate_limited_until = Some(state.rate_limited_until.map_or(deadline, |d| d.max(deadline)));
	}

	/// Parses `x-ratelimit-{remaining,limit,reset}` from an upstream response
	/// and, if remaining capacity is low, applies a soft proactive cooldown
	/// that never shortens an existing one.
	pub fn record_rate_limit_headers(&self, model: &str, headers: &HeaderMap) {
		let remaining = get_header_as::<u64>(headers, "x-ratelimit-remaining");
		let limit = get_header_as::<u64>(headers, "x-ratelimit-limit");
		let reset = get_header_as::<u64>(headers, "x-ratelimit-reset");
		if remaining.is_none() && limit.is_none() && reset.is_none() {
			return;
		}
		let mut pools = self.pools.write();
		let state = pools.entry(Strng::from(model)).or_default();
		state.last_headers = RateLimitHeaderSnapshot { remaining, limit, reset };

		if let Some(remaining) = remaining
			&& remaining <= self.config.remaining_threshold
		{
			let frac = 1.0 - (remaining as f64 / self.config.remaining_threshold as f64);
			let delay_ms = (self.config.pacing_delay_ms as f64 * frac).max(0.0) as u64;
			let deadline = std::time::Instant::now() + Duration::from_millis(delay_ms);
			state.rate_limited_until = Some(state.rate_limited_until.map_or(deadline, |d| d.max(deadline)));
		}
	}

	pub fn is_pool_rate_limited(&self, model: &str) -> bool {
		self.cooldown_remaining(model).is_some()
	}

	pub fn is_any_pool_rate_limited(&self) -> bool {
		let pools = self.pools.read();
		let now = std::time::Instant::now();
		pools.values().any(|s| s.rate_limited_until.is_some_and(|d| d > now))
	}

	pub fn max_cooldown_remaining(&self) -> Option<Duration> {
		let pools = self.pools.read();
		let now = std::time::Instant::now();
		pools
			.values()
			.filter_map(|s| s.rate_limited_until.and_then(|d| d.checked_duration_since(now)))
			.max()
	}

	pub fn cooldown_remaining(&self, model: &str) -> Option<Duration> {
		let pools = self.pools.read();
		let now = std::time::Instant::now();
		pools.get(model).and_then(|s| s.rate_limited_until).and_then(|d| d.checked_duration_since(now))
	}

	pub fn pacing_delay(&self, model: &str) -> Duration {
		self.cooldown_remaining(model).unwrap_or_default()
	}
}

fn get_header_as<T: FromStr>(h: &HeaderMap, name: &str) -> Option<T> {
	let name = HeaderName::from_str(name).ok()?;
	h.get(&name).and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok())
}

/// `Retry-After`/`x-ratelimit-reset` parsing for a 429 response, grounded on
/// the teacher's `http::outlierdetection::retry_after`: seconds, an HTTP
/// date, or a (heuristically disambiguated) epoch timestamp.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
	let now = SystemTime::now();
	if let Some(v) = headers.get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()) {
		if let Ok(seconds) = v.parse::<u64>() {
			return Some(Duration::from_secs(seconds));
		}
		if let Ok(http_date) = httpdate::parse_http_date(v)
			&& let Ok(dur) = http_date.duration_since(now)
		{
			return Some(dur);
		}
	}
	if let Some(v) = get_header_as::<u64>(headers, "x-ratelimit-reset") {
		const THIRTY_DAYS_SECS: u64 = 60 * 60 * 24 * 30;
		if v < THIRTY_DAYS_SECS {
			return Some(Duration::from_secs(v));
		}
		let reset_at = UNIX_EPOCH + Duration::from_secs(v);
		if let Ok(dur) = reset_at.duration_since(now) {
			return Some(dur);
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn count_escalates_and_caps_at_ten() {
		let pm = PoolManager::new(PoolConfig::default());
		for _ in 0..15 {
			pm.record_pool_rate_limit_hit("claude-3");
		}
		let pools = pm.pools.read();
		assert_eq!(pools.get("claude-3").unwrap().count, 10);
	}

	#[test]
	fn cooldown_is_set_after_hit() {
		let pm = PoolManager::new(PoolConfig::default());
		pm.record_pool_rate_limit_hit("claude-3");
		assert!(pm.is_pool_rate_limited("claude-3"));
		assert!(!pm.is_pool_rate_limited("other-model"));
	}

	#[test]
	fn proactive_pacing_never_shortens_cooldown() {
		let pm = PoolManager::new(PoolConfig::default());
		pm.record_pool_rate_limit_hit("claude-3"); // sets a real cooldown, likely > 200ms*frac
		let before = pm.cooldown_remaining("claude-3").unwrap();
		let mut headers = HeaderMap::new();
		headers.insert("x-ratelimit-remaining", "1".parse().unwrap());
		pm.record_rate_limit_headers("claude-3", &headers);
		let after = pm.cooldown_remaining("claude-3").unwrap();
		assert!(after >= before.saturating_sub(Duration::from_millis(5)));
	}

	#[test]
	fn retry_after_parses_seconds() {
		let mut h = HeaderMap::new();
		h.insert(header::RETRY_AFTER, "30".parse().unwrap());
		assert_eq!(retry_after(&h), Some(Duration::from_secs(30)));
	}

	#[test]
	fn retry_after_parses_small_ratelimit_reset_as_seconds() {
		let mut h = HeaderMap::new();
		h.insert("x-ratelimit-reset", "120".parse().unwrap());
		assert_eq!(retry_after(&h), Some(Duration::from_secs(120)));
	}
}
