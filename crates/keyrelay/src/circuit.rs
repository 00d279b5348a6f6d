use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
	Threshold,
	Cooldown,
	Success,
	Forced,
	Reset,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
	pub failure_threshold: usize,
	pub failure_window: Duration,
	pub cooldown_period: Duration,
}

impl Default for CircuitConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			failure_window: Duration::from_millis(60_000),
			cooldown_period: Duration::from_millis(30_000),
		}
	}
}

/// Point-in-time snapshot, safe to hand to stats/admin readers.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
	pub state: State,
	pub failure_count: usize,
	pub success_count: u64,
	pub last_error: Option<FailureKind>,
}

type OnStateChange = Box<dyn Fn(State, State, TransitionReason) + Send + Sync>;

/// Per-credential CLOSED/OPEN/HALF_OPEN state machine, per spec §4.2. Never
/// blocks and needs no background timer: `update_state` is invoked lazily
/// from the selection path.
pub struct CircuitBreaker {
	config: CircuitConfig,
	state: State,
	recent_failures: VecDeque<(Instant, FailureKind)>,
	success_count: u64,
	failure_count: usize,
	opened_at: Option<Instant>,
	last_error: Option<FailureKind>,
	on_state_change: Option<OnStateChange>,
}

impl CircuitBreaker {
	pub fn new(config: CircuitConfig) -> Self {
		Self {
			config,
			state: State::Closed,
			recent_failures: VecDeque::new(),
			success_count: 0,
			failure_count: 0,
			opened_at: None,
			last_error: None,
			on_state_change: None,
		}
	}

	pub fn with_on_state_change(mut self, f: impl Fn(State, State, TransitionReason) + Send + Sync + 'static) -> Self {
		self.on_state_change = Some(Box::new(f));
		self
	}

	pub fn state(&self) -> State {
		self.state
	}

	fn transition(&mut self, to: State, reason: TransitionReason) {
		let from = self.state;
		if from == to && reason != TransitionReason::Reset {
			return;
		}
		self.state = to;
		if to == State::Open {
			self.opened_at = Some(Instant::now());
		}
		if let Some(cb) = &self.on_state_change {
			cb(from, to, reason);
		}
	}

	fn prune(&mut self, now: Instant) {
		let window = self.config.failure_window;
		while let Some((ts, _)) = self.recent_failures.front() {
			if now.duration_since(*ts) > window {
				self.recent_failures.pop_front();
			} else {
				break;
			}
		}
	}

	pub fn record_failure(&mut self, kind: FailureKind) {
		let now = Instant::now();
		self.recent_failures.push_back((now, kind));
		self.failure_count += 1;
		self.last_error = Some(kind);
		self.prune(now);

		if self.state == State::HalfOpen {
			self.transition(State::Open, TransitionReason::Threshold);
		} else if self.state == State::Closed && self.recent_failures.len() >= self.config.failure_threshold {
			self.transition(State::Open, TransitionReason::Threshold);
		}
	}

	pub fn record_success(&mut self) {
		if self.state == State::HalfOpen {
			self.recent_failures.clear();
			self.transition(State::Closed, TransitionReason::Success);
		} else if self.state == State::Closed {
			self.success_count += 1;
			self.failure_count = self.failure_count.saturating_sub(1);
		}
	}

	/// Lazily advances OPEN -> HALF_OPEN once `cooldown_period` has elapsed.
	/// Idempotent.
	pub fn update_state(&mut self) {
		if self.state == State::Open
			&& let Some(opened_at) = self.opened_at
			&& Instant::now().duration_since(opened_at) >= self.config.cooldown_period
		{
			self.transition(State::HalfOpen, TransitionReason::Cooldown);
		}
	}

	pub fn is_available(&mut self) -> bool {
		self.update_state();
		matches!(self.state, State::Closed | State::HalfOpen)
	}

	/// Administrative override used by the rescue path (§4.5.3 step 3) and
	/// the admin surface.
	pub fn force_state(&mut self, state: State) {
		if state == State::Closed {
			self.recent_failures.clear();
		}
		self.transition(state, TransitionReason::Forced);
	}

	pub fn reset(&mut self) {
		self.recent_failures.clear();
		self.success_count = 0;
		self.failure_count = 0;
		self.opened_at = None;
		self.transition(State::Closed, TransitionReason::Reset);
	}

	pub fn opened_at(&self) -> Option<Instant> {
		self.opened_at
	}

	pub fn stats(&self) -> CircuitStats {
		CircuitStats {
			state: self.state,
			failure_count: self.recent_failures.len(),
			success_count: self.success_count,
			last_error: self.last_error,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;
	use std::thread::sleep;

	use super::*;

	fn config(threshold: usize, window_ms: u64, cooldown_ms: u64) -> CircuitConfig {
		CircuitConfig {
			failure_threshold: threshold,
			failure_window: Duration::from_millis(window_ms),
			cooldown_period: Duration::from_millis(cooldown_ms),
		}
	}

	#[test]
	fn trips_after_threshold_within_window() {
		let mut cb = CircuitBreaker::new(config(3, 1000, 500));
		cb.record_failure(FailureKind::ServerError);
		cb.record_failure(FailureKind::ServerError);
		assert_eq!(cb.state(), State::Closed);
		cb.record_failure(FailureKind::ServerError);
		assert_eq!(cb.state(), State::Open);
	}

	#[test]
	fn recovers_via_half_open_to_closed() {
		let mut cb = CircuitBreaker::new(config(1, 1000, 20));
		cb.record_failure(FailureKind::ServerError);
		assert_eq!(cb.state(), State::Open);
		sleep(Duration::from_millis(30));
		assert!(cb.is_available());
		assert_eq!(cb.state(), State::HalfOpen);
		cb.record_success();
		assert_eq!(cb.state(), State::Closed);
	}

	#[test]
	fn half_open_failure_reopens() {
		let mut cb = CircuitBreaker::new(config(1, 1000, 10));
		cb.record_failure(FailureKind::ServerError);
		sleep(Duration::from_millis(15));
		cb.update_state();
		assert_eq!(cb.state(), State::HalfOpen);
		cb.record_failure(FailureKind::ServerError);
		assert_eq!(cb.state(), State::Open);
	}

	#[test]
	fn on_state_change_fires() {
		let calls = Arc::new(AtomicUsize::new(0));
		let calls2 = calls.clone();
		let mut cb = CircuitBreaker::new(config(1, 1000, 500)).with_on_state_change(move |_from, _to, _reason| {
			calls2.fetch_add(1, Ordering::SeqCst);
		});
		cb.record_failure(FailureKind::ServerError);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn reset_clears_everything() {
		let mut cb = CircuitBreaker::new(config(1, 1000, 500));
		cb.record_failure(FailureKind::ServerError);
		cb.reset();
		assert_eq!(cb.state(), State::Closed);
		cb.reset();
		assert_eq!(cb.state(), State::Closed);
		assert_eq!(cb.stats().failure_count, 0);
	}

	#[test]
	fn force_state_is_observable_via_stats() {
		let mut cb = CircuitBreaker::new(config(5, 1000, 500));
		cb.force_state(State::Open);
		assert_eq!(cb.stats().state, State::Open);
	}
}
