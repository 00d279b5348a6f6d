use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Per-key token bucket, spec §4.3. Grounded on the per-key local rate
/// limiter's atomics-plus-refill shape, reworked for a continuous refill
/// curve (`ratePerMinute`/60000 tokens per millisecond) instead of discrete
/// fill intervals, since the scheduler reasons in tokens-per-minute.
///
/// Token counts are tracked in milli-tokens (`available` scaled by 1000) so
/// the hot path (`try_wait`) is a single atomic RMW; only the refill
/// timestamp needs a lock, and only to serialize the refill computation
/// itself.
pub struct RateLimiter {
	rate_per_minute: u64,
	burst: u64,
	available_milli: AtomicI64,
	last_refill: Mutex<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitResult {
	pub allowed: bool,
	pub remaining: u64,
	pub wait: Option<Duration>,
}

impl RateLimiter {
	pub fn new(rate_per_minute: u64, burst: u64) -> Self {
		Self {
			rate_per_minute,
			burst,
			available_milli: AtomicI64::new(burst as i64 * 1000),
			last_refill: Mutex::new(Instant::now()),
		}
	}

	fn disabled(&self) -> bool {
		self.rate_per_minute == 0
	}

	fn refill(&self) {
		if self.rate_per_minute == 0 {
			return;
		}
		let mut last = self.last_refill.lock();
		let now = Instant::now();
		let elapsed = now.saturating_duration_since(*last);
		if elapsed.is_zero() {
			return;
		}
		*last = now;
		// milli-tokens added = elapsed_ms * rate_per_minute / 60
		let add_milli = (elapsed.as_millis() as i128 * self.rate_per_minute as i128 / 60) as i64;
		if add_milli <= 0 {
			return;
		}
		let cap = self.burst as i64 * 1000;
		let _ = self.available_milli.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some((v + add_milli).min(cap)));
	}

	/// Refill, then peek: true iff at least one token is available, without
	/// consuming it. Used by selection's availability check (§4.5.1), which
	/// must not itself consume a token.
	pub fn has_token(&self) -> bool {
		if self.disabled() {
			return true;
		}
		self.refill();
		self.available_milli.load(Ordering::Acquire) >= 1000
	}

	pub fn try_wait(&self) -> LimitResult {
		self.try_wait_n(1)
	}

	pub fn try_wait_n(&self, n: u64) -> LimitResult {
		if self.disabled() {
			return LimitResult {
				allowed: true,
				remaining: u64::MAX,
				wait: None,
			};
		}
		self.refill();
		let need_milli = n as i64 * 1000;
		loop {
			let available = self.available_milli.load(Ordering::Acquire);
			if available < need_milli {
				let deficit_milli = need_milli - available;
				let wait_ms = (deficit_milli as u128 * 60 / self.rate_per_minute.max(1) as u128) as u64;
				return LimitResult {
					allowed: false,
					remaining: (available.max(0) / 1000) as u64,
					wait: Some(Duration::from_millis(wait_ms)),
				};
			}
			let new = available - need_milli;
			if self
				.available_milli
				.compare_exchange(available, new, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				return LimitResult {
					allowed: true,
					remaining: (new / 1000) as u64,
					wait: None,
				};
			}
		}
	}

}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zero_rate_always_allows() {
		let rl = RateLimiter::new(0, 5);
		for _ in 0..100 {
			assert!(rl.try_wait().allowed);
		}
	}

	#[test]
	fn exhausts_burst_then_denies() {
		let rl = RateLimiter::new(60, 3);
		assert!(rl.try_wait().allowed);
		assert!(rl.try_wait().allowed);
		assert!(rl.try_wait().allowed);
		let result = rl.try_wait();
		assert!(!result.allowed);
		assert_eq!(result.remaining, 0);
	}

	#[test]
	fn refills_over_time() {
		let rl = RateLimiter::new(6000, 1); // 100 tokens/sec
		assert!(rl.try_wait().allowed);
		assert!(!rl.try_wait().allowed);
		std::thread::sleep(Duration::from_millis(20));
		assert!(rl.try_wait().allowed);
	}

	#[test]
	fn has_token_does_not_consume() {
		let rl = RateLimiter::new(60, 2);
		assert!(rl.has_token());
		assert!(rl.has_token());
		// Still available for try_wait, proving has_token was non-consuming.
		assert!(rl.try_wait().allowed);
	}
}
