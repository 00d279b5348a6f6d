use std::time::Duration;

use http::StatusCode;
use serde::Serialize;

/// The error taxonomy the scheduler and dispatcher reason about. Every
/// upstream or internal failure is classified into exactly one kind before
/// it touches a circuit breaker, a retry decision, or a client response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
	#[error("upstream exceeded adaptive timeout")]
	Timeout,
	#[error("upstream returned a 5xx")]
	ServerError,
	#[error("dns resolution failed")]
	DnsError,
	#[error("tls handshake failed")]
	TlsError,
	#[error("connection refused")]
	ConnectionRefused,
	#[error("peer closed the socket mid-write")]
	SocketHangup,
	#[error("client disconnected")]
	ClientDisconnect,
	#[error("upstream returned 429")]
	RateLimited,
	#[error("credential rejected (401/403)")]
	AuthError,
	#[error("broken pipe")]
	BrokenPipe,
	#[error("stream closed prematurely")]
	StreamPrematureClose,
	#[error("connection aborted")]
	ConnectionAborted,
	#[error("malformed upstream response")]
	HttpParseError,
	#[error("unclassified failure")]
	Other,
}

impl FailureKind {
	/// Whether this kind should be appended to a credential's circuit-breaker
	/// failure window. `socket_hangup`, client-side aborts, and `rate_limited`
	/// are deliberately excluded (spec §4.5.4/§7).
	pub fn counts_against_circuit(self) -> bool {
		!matches!(
			self,
			FailureKind::SocketHangup
				| FailureKind::ClientDisconnect
				| FailureKind::RateLimited
				| FailureKind::BrokenPipe
				| FailureKind::StreamPrematureClose
				| FailureKind::ConnectionAborted
		)
	}

	/// Whether the dispatcher may retry against another credential for this
	/// kind, independent of attempts-remaining.
	pub fn is_retryable(self) -> bool {
		matches!(
			self,
			FailureKind::Timeout
				| FailureKind::ServerError
				| FailureKind::DnsError
				| FailureKind::TlsError
				| FailureKind::ConnectionRefused
				| FailureKind::RateLimited
		)
	}
}

/// A fully-formed, client-visible proxy failure: one JSON body
/// `{error:{kind, message, retryAfterMs?}}` plus the status line to use.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProxyError {
	pub kind: FailureKind,
	pub message: String,
	#[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
	pub retry_after_ms: Option<u64>,
	#[serde(skip)]
	pub status: u16,
}

impl ProxyError {
	pub fn new(status: StatusCode, kind: FailureKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			retry_after_ms: None,
			status: status.as_u16(),
		}
	}

	pub fn with_retry_after(mut self, d: Duration) -> Self {
		self.retry_after_ms = Some(d.as_millis() as u64);
		self
	}

	pub fn body_too_large() -> Self {
		Self::new(StatusCode::PAYLOAD_TOO_LARGE, FailureKind::Other, "request body exceeds maxBodySize")
	}

	pub fn queue_timeout() -> Self {
		Self::new(StatusCode::SERVICE_UNAVAILABLE, FailureKind::Timeout, "queue_timeout")
	}

	pub fn queue_full() -> Self {
		Self::new(StatusCode::SERVICE_UNAVAILABLE, FailureKind::Other, "queue_full")
	}

	pub fn no_keys_available() -> Self {
		Self::new(StatusCode::SERVICE_UNAVAILABLE, FailureKind::Other, "no_keys_available")
	}

	pub fn model_gate_exhausted(retry_after: Duration) -> Self {
		Self::new(StatusCode::TOO_MANY_REQUESTS, FailureKind::RateLimited, "model concurrency exhausted").with_retry_after(retry_after)
	}

	pub fn pool_cooling_down(retry_after: Duration) -> Self {
		Self::new(StatusCode::TOO_MANY_REQUESTS, FailureKind::RateLimited, "all pools are cooling down").with_retry_after(retry_after)
	}

	pub fn account_rate_limited(retry_after: Duration) -> Self {
		Self::new(StatusCode::TOO_MANY_REQUESTS, FailureKind::RateLimited, "account-level rate limit").with_retry_after(retry_after)
	}

	pub fn upstream_rate_limited(retry_after: Option<Duration>) -> Self {
		let mut e = Self::new(StatusCode::TOO_MANY_REQUESTS, FailureKind::RateLimited, "upstream rate limit");
		if let Some(d) = retry_after {
			e = e.with_retry_after(d);
		}
		e
	}

	pub fn bad_gateway(kind: FailureKind, message: impl Into<String>) -> Self {
		Self::new(StatusCode::BAD_GATEWAY, kind, message)
	}

	pub fn gateway_timeout(kind: FailureKind, message: impl Into<String>) -> Self {
		Self::new(StatusCode::GATEWAY_TIMEOUT, kind, message)
	}

	pub fn status(&self) -> StatusCode {
		StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
	}
}
