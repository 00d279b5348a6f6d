use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::Full;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use keyrelay_core::prelude::Strng;
use rand::Rng;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{FailureKind, ProxyError};
use crate::keys::{AcquireFailure, Credential, KeyManager};
use crate::pool::{self, PoolManager};
use crate::queue::RequestQueue;
use crate::replay::{ReplayEntry, ReplayQueue};
use crate::stats::{ErrorTracker, TokenTracker};
use crate::webhook::{EventType, WebhookEvent, WebhookSink};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	pub max_backpressure: usize,
	pub queue_timeout: Duration,
	pub max_retries: u32,
	pub retry_backoff_base_ms: u64,
	pub base_upstream_timeout: Duration,
	pub max_upstream_timeout: Duration,
}

/// One outgoing HTTP call, abstracted behind a trait so the retry/outcome
/// logic below is testable without a socket (the teacher's `PolicyClient`
/// plays the analogous seam for its proxy pipeline).
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
	async fn send(&self, request: http::Request<Full<Bytes>>, timeout: Duration) -> Result<http::Response<axum::body::Body>, UpstreamError>;
}

#[derive(Debug, Clone)]
pub enum UpstreamError {
	Timeout,
	Connect(String),
	Other(String),
}

impl UpstreamError {
	fn classify(&self) -> FailureKind {
		match self {
			UpstreamError::Timeout => FailureKind::Timeout,
			UpstreamError::Connect(msg) | UpstreamError::Other(msg) => {
				let lower = msg.to_lowercase();
				if lower.contains("dns") || lower.contains("resolve") {
					FailureKind::DnsError
				} else if lower.contains("tls") || lower.contains("certificate") {
					FailureKind::TlsError
				} else if lower.contains("connection refused") {
					FailureKind::ConnectionRefused
				} else if lower.contains("broken pipe") {
					FailureKind::BrokenPipe
				} else if lower.contains("reset") || lower.contains("aborted") {
					FailureKind::ConnectionAborted
				} else {
					FailureKind::Other
				}
			},
		}
	}
}

/// A `hyper_util` legacy client over plain HTTP connections plus TLS via
/// `hyper-rustls`, matching the teacher's own outbound-call stack.
pub struct HyperUpstreamClient {
	client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperUpstreamClient {
	pub fn new() -> Self {
		let https = hyper_rustls::HttpsConnectorBuilder::new()
			.with_native_roots()
			.expect("native root certificates must be loadable")
			.https_or_http()
			.enable_http1()
			.enable_http2()
			.build();
		Self {
			client: Client::builder(TokioExecutor::new()).build(https),
		}
	}
}

impl Default for HyperUpstreamClient {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl UpstreamClient for HyperUpstreamClient {
	async fn send(&self, request: http::Request<Full<Bytes>>, timeout: Duration) -> Result<http::Response<axum::body::Body>, UpstreamError> {
		let fut = self.client.request(request);
		let response = match tokio::time::timeout(timeout, fut).await {
			Ok(Ok(r)) => r,
			Ok(Err(e)) => {
				return Err(if e.is_connect() {
					UpstreamError::Connect(e.to_string())
				} else {
					UpstreamError::Other(e.to_string())
				});
			},
			Err(_) => return Err(UpstreamError::Timeout),
		};
		let (parts, body) = response.into_parts();
		Ok(http::Response::from_parts(parts, axum::body::Body::new(body)))
	}
}

/// Guards exactly-once release of a credential: whichever terminal method is
/// called consumes `self`; if none is called (early return, panic unwind),
/// `Drop` falls back to a plain `releaseKey` (spec §5 "scoped acquisition").
struct KeyLease<'a> {
	keys: &'a KeyManager,
	credential: Arc<Credential>,
	resolved: bool,
}

impl<'a> KeyLease<'a> {
	fn new(keys: &'a KeyManager, credential: Arc<Credential>) -> Self {
		Self { keys, credential, resolved: false }
	}

	fn success(mut self, latency: Duration) {
		self.keys.record_success(&self.credential, latency);
		self.resolved = true;
	}

	fn failure(mut self, kind: FailureKind) {
		self.keys.record_failure(&self.credential, kind);
		self.resolved = true;
	}

	fn rate_limited(mut self, cooldown: Duration) {
		self.keys.record_rate_limit(&self.credential, cooldown);
		self.resolved = true;
	}
}

impl Drop for KeyLease<'_> {
	fn drop(&mut self) {
		if !self.resolved {
			self.keys.release_key(&self.credential);
		}
	}
}

struct ModelSlotGuard<'a> {
	keys: &'a KeyManager,
	model: Strng,
}

impl Drop for ModelSlotGuard<'_> {
	fn drop(&mut self) {
		self.keys.release_model_slot(&self.model);
	}
}

struct BackpressureGuard<'a> {
	dispatcher: &'a Dispatcher,
}

impl Drop for BackpressureGuard<'_> {
	fn drop(&mut self) {
		self.dispatcher.in_flight.fetch_sub(1, Ordering::AcqRel);
		self.dispatcher.queue.admit_one();
	}
}

/// Drives one client request through queue -> selection -> upstream -> retry
/// -> client response, per spec §4.6. Owns no long-lived request state beyond
/// a single call to [`Dispatcher::handle`]; everything else is borrowed from
/// the shared scheduler components.
pub struct Dispatcher {
	config: DispatcherConfig,
	keys: Arc<KeyManager>,
	pool: Arc<PoolManager>,
	queue: Arc<RequestQueue>,
	replay: Arc<ReplayQueue>,
	errors: Arc<ErrorTracker>,
	tokens: Arc<TokenTracker>,
	client: Arc<dyn UpstreamClient>,
	webhook: Arc<dyn WebhookSink>,
	base_url: Strng,
	in_flight: AtomicU32,
}

pub struct DispatchOutcome {
	pub response: http::Response<axum::body::Body>,
}

impl Dispatcher {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: DispatcherConfig,
		keys: Arc<KeyManager>,
		pool: Arc<PoolManager>,
		queue: Arc<RequestQueue>,
		replay: Arc<ReplayQueue>,
		errors: Arc<ErrorTracker>,
		tokens: Arc<TokenTracker>,
		client: Arc<dyn UpstreamClient>,
		webhook: Arc<dyn WebhookSink>,
		base_url: Strng,
	) -> Self {
		Self {
			config,
			keys,
			pool,
			queue,
			replay,
			errors,
			tokens,
			client,
			webhook,
			base_url,
			in_flight: AtomicU32::new(0),
		}
	}

	pub fn backpressure_snapshot(&self) -> (u32, usize) {
		(self.in_flight.load(Ordering::Acquire), self.queue.len())
	}

	async fn admit(&self, priority: i32) -> Result<BackpressureGuard<'_>, ProxyError> {
		if self.in_flight.load(Ordering::Acquire) as usize >= self.config.max_backpressure {
			self.queue.enqueue(priority, self.config.queue_timeout).await?;
		}
		self.in_flight.fetch_add(1, Ordering::AcqRel);
		Ok(BackpressureGuard { dispatcher: self })
	}

	fn adaptive_timeout(&self, cred: &Credential) -> Duration {
		match cred.p95_latency_ms() {
			Some(p95) => Duration::from_millis(p95 * 2).clamp(self.config.base_upstream_timeout, self.config.max_upstream_timeout),
			None => self.config.base_upstream_timeout,
		}
	}

	fn backoff_duration(&self, attempt: u32) -> Duration {
		let base = self.config.retry_backoff_base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
		let jitter: f64 = rand::rng().random_range(-0.15..=0.15);
		Duration::from_millis((base as f64 * (1.0 + jitter)).max(0.0) as u64)
	}

	fn build_upstream_request(&self, method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes, credential: &Credential) -> Result<http::Request<Full<Bytes>>, ProxyError> {
		let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
		let target = format!("{}{}", self.base_url, path_and_query);
		let mut builder = http::Request::builder().method(method.clone()).uri(target);
		for (name, value) in headers.iter() {
			if name == http::header::AUTHORIZATION || name == http::header::HOST {
				continue;
			}
			builder = builder.header(name, value);
		}
		builder = builder.header(http::header::AUTHORIZATION, credential.authorization_header());
		builder
			.body(Full::new(body))
			.map_err(|e| ProxyError::bad_gateway(FailureKind::HttpParseError, format!("failed to build upstream request: {e}")))
	}

	/// Drives the full request lifecycle: admission, model gate, key
	/// selection, upstream call, retry loop, and terminal recording. Returns
	/// either the upstream response (passed through) or a proxy-level
	/// `ProxyError` to be rendered as JSON.
	pub async fn handle(&self, method: Method, uri: Uri, headers: HeaderMap, body: Bytes, priority: i32, max_body_size: usize) -> Result<DispatchOutcome, ProxyError> {
		if body.len() > max_body_size {
			return Err(ProxyError::body_too_large());
		}

		let trace_id = Uuid::new_v4();
		let _backpressure = self.admit(priority).await?;

		let model = extract_model(&headers, &body).unwrap_or_else(|| Strng::from("default"));
		let mut excluded: Vec<usize> = Vec::new();
		let mut attempt: u32 = 0;

		// Acquired once for the whole request, not per retry attempt: spec §4.6
		// step 9 releases the model slot exactly once per request, and retries
		// return to key acquisition, not back to the model gate.
		if !self.keys.acquire_model_slot(&model) {
			return Err(ProxyError::model_gate_exhausted(Duration::from_millis(self.config.retry_backoff_base_ms)));
		}
		let _model_slot = ModelSlotGuard { keys: &self.keys, model: model.clone() };

		loop {
			attempt += 1;

			let acquired = match self.keys.acquire_key(&excluded) {
				Ok(o) => o,
				Err(AcquireFailure::AccountRateLimited) => {
					return Err(ProxyError::account_rate_limited(self.keys.account_cooldown_remaining().unwrap_or_default()));
				},
				Err(AcquireFailure::NoKeysAvailable) => {
					if let Some(remaining) = self.pool.max_cooldown_remaining() {
						self.webhook
							.send(WebhookEvent::new(EventType::RateLimitPoolExhausted, serde_json::json!({"model": model.to_string(), "retryAfterMs": remaining.as_millis() as u64})))
							.await;
						return Err(ProxyError::pool_cooling_down(remaining));
					}
					return Err(ProxyError::no_keys_available());
				},
			};
			let credential = acquired.credential;
			let lease = KeyLease::new(&self.keys, credential.clone());

			let request = self.build_upstream_request(&method, &uri, &headers, body.clone(), &credential)?;

			let pacing = self.pool.pacing_delay(&model);
			if !pacing.is_zero() {
				tokio::time::sleep(pacing).await;
			}

			let timeout = self.adaptive_timeout(&credential);
			let started = Instant::now();

			match self.client.send(request, timeout).await {
				Ok(response) => {
					self.pool.record_rate_limit_headers(&model, response.headers());
					let status = response.status();
					let latency = started.elapsed();

					if status.is_success() {
						lease.success(latency);
						let response = self.maybe_record_tokens(response, &model).await;
						return Ok(DispatchOutcome { response });
					}

					if status == StatusCode::TOO_MANY_REQUESTS {
						let cooldown = pool::retry_after(response.headers()).unwrap_or(Duration::from_millis(self.keys.config().key_rate_limit_cooldown.base_cooldown_ms));
						lease.rate_limited(cooldown);
						self.pool.record_pool_rate_limit_hit(&model);
						self.webhook
							.send(WebhookEvent::new(EventType::RateLimitHit, serde_json::json!({"keyId": credential.key_id.to_string(), "model": model.to_string()})))
							.await;

						if attempt < self.config.max_retries && self.keys.any_available() {
							excluded.push(credential.index);
							tokio::time::sleep(self.backoff_duration(attempt)).await;
							continue;
						}
						return Err(ProxyError::upstream_rate_limited(Some(cooldown)));
					}

					if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
						lease.failure(FailureKind::AuthError);
						return Ok(DispatchOutcome { response });
					}

					if status.is_server_error() {
						self.errors.record(FailureKind::ServerError);
						lease.failure(FailureKind::ServerError);
						if attempt < self.config.max_retries {
							excluded.push(credential.index);
							self.enqueue_replay(trace_id, &method, &uri, &headers, &body, &model, FailureKind::ServerError);
							tokio::time::sleep(self.backoff_duration(attempt)).await;
							continue;
						}
						return Ok(DispatchOutcome { response });
					}

					// Other 4xx: a client-shape issue, not a credential health
					// issue. Pass through without penalizing the circuit.
					lease.success(latency);
					return Ok(DispatchOutcome { response });
				},
				Err(e) => {
					let kind = e.classify();
					self.errors.record(kind);
					lease.failure(kind);
					if kind.is_retryable() && attempt < self.config.max_retries {
						excluded.push(credential.index);
						self.enqueue_replay(trace_id, &method, &uri, &headers, &body, &model, kind);
						tokio::time::sleep(self.backoff_duration(attempt)).await;
						continue;
					}
					let status = if kind == FailureKind::Timeout { StatusCode::GATEWAY_TIMEOUT } else { StatusCode::BAD_GATEWAY };
					return Err(ProxyError::new(status, kind, format!("upstream call failed: {e:?}")));
				},
			}
		}
	}

	/// Called when the client socket goes away mid-stream. Per spec §4.6
	/// step 8, this is not a circuit failure: the credential is simply
	/// released via `recordSocketHangup`-equivalent accounting.
	pub fn record_client_disconnect(&self, credential: &Credential) {
		self.keys.record_failure(credential, FailureKind::SocketHangup);
	}

	fn enqueue_replay(&self, trace_id: Uuid, method: &Method, uri: &Uri, headers: &HeaderMap, body: &Bytes, model: &Strng, kind: FailureKind) {
		self.replay.enqueue(ReplayEntry {
			trace_id,
			model: Some(model.to_string()),
			method: method.clone(),
			path: uri.path().to_string(),
			headers: crate::redact::redact_headers(headers),
			body: body.clone(),
			failed_at: Instant::now(),
			failure_kind: kind,
		});
	}

	/// For non-streaming JSON responses, buffers the body to pull the
	/// `usage` field into `TokenTracker`, then re-wraps it as a fresh body so
	/// the caller still streams it to the client. Streaming (`text/event-stream`)
	/// responses are passed through untouched — sniffing token usage out of an
	/// SSE stream is out of scope for this slice.
	async fn maybe_record_tokens(&self, response: http::Response<axum::body::Body>, model: &str) -> http::Response<axum::body::Body> {
		let is_streaming = response
			.headers()
			.get(http::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|v| v.contains("event-stream"));
		if is_streaming {
			return response;
		}

		let (parts, body) = response.into_parts();
		match http_body_util::BodyExt::collect(body).await {
			Ok(collected) => {
				let bytes = collected.to_bytes();
				if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
					record_usage(&self.tokens, model, &value);
				}
				http::Response::from_parts(parts, axum::body::Body::from(bytes))
			},
			Err(e) => {
				warn!(error = %e, "failed to buffer upstream response body for token accounting");
				http::Response::from_parts(parts, axum::body::Body::empty())
			},
		}
	}
}

fn record_usage(tokens: &TokenTracker, model: &str, value: &Value) {
	let usage = match value.get("usage") {
		Some(u) => u,
		None => return,
	};
	let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
	let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
	if input > 0 || output > 0 {
		tokens.record(model, input, output);
		info!(model, input, output, "recorded token usage");
	}
}

/// Determines the target model from an `x-model` header or a top-level
/// `model` JSON field, matching the shape of upstream chat-completion bodies.
fn extract_model(headers: &HeaderMap, body: &Bytes) -> Option<Strng> {
	if let Some(v) = headers.get("x-model").and_then(|v| v.to_str().ok()) {
		return Some(Strng::from(v));
	}
	serde_json::from_slice::<Value>(body).ok().and_then(|v| v.get("model").and_then(Value::as_str).map(Strng::from))
}

#[cfg(test)]
mod tests {
	use std::num::NonZeroUsize;

	use http::Response;

	use super::*;
	use crate::keys::KeyManagerConfig;
	use crate::pool::PoolConfig;

	struct ScriptedClient {
		responses: parking_lot::Mutex<Vec<Result<StatusCode, UpstreamError>>>,
	}

	impl ScriptedClient {
		fn new(responses: Vec<Result<StatusCode, UpstreamError>>) -> Self {
			Self {
				responses: parking_lot::Mutex::new(responses),
			}
		}
	}

	#[async_trait::async_trait]
	impl UpstreamClient for ScriptedClient {
		async fn send(&self, _request: http::Request<Full<Bytes>>, _timeout: Duration) -> Result<http::Response<axum::body::Body>, UpstreamError> {
			let next = self.responses.lock().remove(0);
			match next {
				Ok(status) => Ok(Response::builder()
					.status(status)
					.header(http::header::CONTENT_TYPE, "application/json")
					.body(axum::body::Body::from(r#"{"usage":{"input_tokens":10,"output_tokens":5}}"#))
					.unwrap()),
				Err(e) => Err(e),
			}
		}
	}

	fn dispatcher(client: ScriptedClient, n_keys: usize) -> Dispatcher {
		let keys = Arc::new(KeyManager::new(KeyManagerConfig::default(), |_, _, _, _| {}));
		keys.load_keys(&(0..n_keys).map(|i| (Strng::from(format!("k{i}")), Strng::from("secret"))).collect::<Vec<_>>());
		Dispatcher::new(
			DispatcherConfig {
				max_backpressure: 100,
				queue_timeout: Duration::from_secs(1),
				max_retries: 3,
				retry_backoff_base_ms: 1,
				base_upstream_timeout: Duration::from_secs(1),
				max_upstream_timeout: Duration::from_secs(5),
			},
			keys,
			Arc::new(PoolManager::new(PoolConfig::default())),
			Arc::new(RequestQueue::new(10)),
			Arc::new(ReplayQueue::new(NonZeroUsize::new(10).unwrap(), Duration::from_secs(60), 3)),
			Arc::new(ErrorTracker::new()),
			Arc::new(TokenTracker::new(NonZeroUsize::new(10).unwrap())),
			Arc::new(client),
			Arc::new(crate::webhook::NullWebhookSink),
			Strng::from("https://upstream.example.com"),
		)
	}

	fn req() -> (Method, Uri, HeaderMap, Bytes) {
		(Method::POST, "/v1/messages".parse().unwrap(), HeaderMap::new(), Bytes::from(r#"{"model":"claude-3"}"#))
	}

	#[tokio::test]
	async fn success_releases_key_and_records_tokens() {
		let d = dispatcher(ScriptedClient::new(vec![Ok(StatusCode::OK)]), 1);
		let (m, u, h, b) = req();
		let outcome = d.handle(m, u, h, b, 0, 1024 * 1024).await.unwrap();
		assert_eq!(outcome.response.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn retries_on_server_error_then_succeeds() {
		let d = dispatcher(ScriptedClient::new(vec![Ok(StatusCode::INTERNAL_SERVER_ERROR), Ok(StatusCode::OK)]), 2);
		let (m, u, h, b) = req();
		let outcome = d.handle(m, u, h, b, 0, 1024 * 1024).await.unwrap();
		assert_eq!(outcome.response.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn no_keys_available_returns_service_unavailable() {
		let mut config = KeyManagerConfig::default();
		config.max_concurrency_per_key = 1;
		let keys = Arc::new(KeyManager::new(config, |_, _, _, _| {}));
		keys.load_keys(&[(Strng::from("k0"), Strng::from("secret"))]);
		let held = keys.acquire_key(&[]).unwrap();

		let d = Dispatcher::new(
			DispatcherConfig {
				max_backpressure: 100,
				queue_timeout: Duration::from_millis(50),
				max_retries: 1,
				retry_backoff_base_ms: 1,
				base_upstream_timeout: Duration::from_secs(1),
				max_upstream_timeout: Duration::from_secs(5),
			},
			keys.clone(),
			Arc::new(PoolManager::new(PoolConfig::default())),
			Arc::new(RequestQueue::new(10)),
			Arc::new(ReplayQueue::new(NonZeroUsize::new(10).unwrap(), Duration::from_secs(60), 3)),
			Arc::new(ErrorTracker::new()),
			Arc::new(TokenTracker::new(NonZeroUsize::new(10).unwrap())),
			Arc::new(ScriptedClient::new(vec![])),
			Arc::new(crate::webhook::NullWebhookSink),
			Strng::from("https://upstream.example.com"),
		);
		let (m, u, h, b) = req();
		let err = d.handle(m, u, h, b, 0, 1024 * 1024).await.unwrap_err();
		assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
		keys.release_key(&held.credential);
	}

	#[test]
	fn upstream_error_classification_matches_keywords() {
		assert_eq!(UpstreamError::Other("dns lookup failed".into()).classify(), FailureKind::DnsError);
		assert_eq!(UpstreamError::Other("tls handshake error".into()).classify(), FailureKind::TlsError);
		assert_eq!(UpstreamError::Timeout.classify(), FailureKind::Timeout);
	}

	#[test]
	fn adaptive_timeout_respects_bounds() {
		let d = Duration::from_secs(100).clamp(Duration::from_secs(1), Duration::from_secs(10));
		assert_eq!(d, Duration::from_secs(10));
	}
}
