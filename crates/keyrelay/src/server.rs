use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode, Uri};
use keyrelay_core::prelude::Strng;
use notify_debouncer_full::DebounceEventResult;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::circuit::{State as CircuitState, TransitionReason};
use crate::config::{Config, KeysFile};
use crate::dispatcher::{Dispatcher, DispatcherConfig, HyperUpstreamClient};
use crate::error::ProxyError;
use crate::keys::KeyManager;
use crate::pool::PoolManager;
use crate::queue::RequestQueue;
use crate::replay::ReplayQueue;
use crate::stats::{ErrorTracker, StatsAggregator, StatsSnapshot, TokenTracker};
use crate::webhook::{EventType, HttpWebhookSink, NullWebhookSink, WebhookEvent, WebhookSink};

#[derive(Clone)]
struct AppState {
	dispatcher: Arc<Dispatcher>,
	keys: Arc<KeyManager>,
	pool: Arc<PoolManager>,
	replay: Arc<ReplayQueue>,
	errors: Arc<ErrorTracker>,
	tokens: Arc<TokenTracker>,
	webhook: Arc<dyn WebhookSink>,
	config: Arc<Config>,
	started_at: Instant,
	keys_file: Arc<PathBuf>,
	draining: Arc<AtomicBool>,
}

/// Sampling interval for the background health/error-spike watch.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);
/// Fraction of credentials with a non-`Open` circuit below which the pool
/// counts as degraded (spec has no literal threshold; judgment call).
const HEALTH_DEGRADED_FRACTION: f64 = 0.5;
/// Growth in total error count between two samples that counts as a spike.
const ERROR_SPIKE_THRESHOLD: u64 = 10;

/// Owns the HTTP listener, the hot-reload watcher over the keys file, the
/// background queue-eviction/replay-sweep tasks, and graceful shutdown
/// (spec §4.10). Constructed once at startup from a resolved [`Config`].
pub struct ProxyServer {
	listen_addr: SocketAddr,
	router: Router,
	queue: Arc<RequestQueue>,
	state: AppState,
}

impl ProxyServer {
	pub async fn build(config: Config) -> anyhow::Result<Self> {
		let keys_file = KeysFile::load(&config.keys_file)?;
		let entries = keys_file.parse_entries();

		let webhook: Arc<dyn WebhookSink> = match &config.webhook_url {
			Some(url) => Arc::new(HttpWebhookSink::new(url.clone(), config.webhook_secret.clone())),
			None => Arc::new(NullWebhookSink),
		};

		let webhook_for_circuit = webhook.clone();
		let on_circuit_change = move |index: usize, from: CircuitState, to: CircuitState, reason: TransitionReason| {
			let event_type = if to == CircuitState::Open && from != CircuitState::Open {
				Some(EventType::CircuitTrip)
			} else if from == CircuitState::Open && to != CircuitState::Open {
				Some(EventType::CircuitRecover)
			} else {
				None
			};
			if let Some(event_type) = event_type {
				let webhook = webhook_for_circuit.clone();
				let payload = serde_json::json!({"keyIndex": index, "reason": format!("{reason:?}")});
				tokio::spawn(async move {
					webhook.send(WebhookEvent::new(event_type, payload)).await;
				});
			}
		};

		let keys = Arc::new(KeyManager::new(config.key_manager_config(), on_circuit_change));
		keys.load_keys(&entries);

		let pool = Arc::new(PoolManager::new(config.pool_config()));
		let queue = Arc::new(RequestQueue::new(config.queue_capacity));
		let replay = Arc::new(ReplayQueue::new(
			std::num::NonZeroUsize::new(config.replay_max_size).unwrap_or(std::num::NonZeroUsize::new(1).unwrap()),
			Duration::from_millis(config.replay_retention_ms),
			config.max_retries,
		));
		let errors = Arc::new(ErrorTracker::new());
		let tokens = Arc::new(TokenTracker::new(
			std::num::NonZeroUsize::new(config.token_tracker_max_keys).unwrap_or(std::num::NonZeroUsize::new(1).unwrap()),
		));

		let dispatcher = Arc::new(Dispatcher::new(
			DispatcherConfig {
				max_backpressure: config.max_backpressure,
				queue_timeout: Duration::from_millis(config.queue_timeout_ms),
				max_retries: config.max_retries,
				retry_backoff_base_ms: config.retry_backoff_base_ms,
				base_upstream_timeout: Duration::from_millis(config.base_upstream_timeout_ms),
				max_upstream_timeout: Duration::from_millis(config.max_upstream_timeout_ms),
			},
			keys.clone(),
			pool.clone(),
			queue.clone(),
			replay.clone(),
			errors.clone(),
			tokens.clone(),
			Arc::new(HyperUpstreamClient::new()),
			webhook.clone(),
			Strng::from(keys_file.base_url.as_str()),
		));

		let state = AppState {
			dispatcher,
			keys,
			pool,
			replay,
			errors,
			tokens,
			webhook,
			config: Arc::new(config.clone()),
			started_at: Instant::now(),
			keys_file: Arc::new(config.keys_file.clone()),
			draining: Arc::new(AtomicBool::new(false)),
		};

		let router = Router::new()
			.route("/health", get(health_handler))
			.route("/stats", get(stats_handler))
			.route("/backpressure", get(backpressure_handler))
			.route("/models", get(models_handler))
			.route("/reload", post(reload_handler))
			.fallback(proxy_handler)
			.with_state(state.clone());

		Ok(Self {
			listen_addr: config.listen_addr,
			router,
			queue,
			state,
		})
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let listener = TcpListener::bind(self.listen_addr).await?;
		info!(addr = %self.listen_addr, "keyrelay listening");

		let _watcher = spawn_hot_reload_watcher(self.state.keys_file.as_ref().clone(), self.state.keys.clone());

		let eviction_queue = self.queue.clone();
		let eviction_task = tokio::spawn(async move {
			loop {
				eviction_queue.sleep_until_next_deadline().await;
				eviction_queue.evict_expired();
			}
		});

		let sweep_replay = self.state.replay.clone();
		let sweep_task = tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_secs(30));
			loop {
				interval.tick().await;
				sweep_replay.sweep_expired();
			}
		});

		let health_task = tokio::spawn(health_monitor_loop(self.state.clone()));

		let shutdown_timeout = Duration::from_millis(self.state.config.shutdown_timeout_ms);
		let draining = self.state.draining.clone();
		let dispatcher = self.state.dispatcher.clone();

		// The drain wait runs concurrently with the server, not inside the
		// shutdown-signal future: the signal future only flips `draining` (so
		// `proxy_handler` starts rejecting new requests and axum stops accepting
		// new connections immediately) and returns. This task's own loop is
		// bookkeeping — logging when in-flight work has actually settled or the
		// shutdown timeout has run out.
		let drain_task = tokio::spawn({
			let draining = draining.clone();
			async move {
				while !draining.load(Ordering::SeqCst) {
					tokio::time::sleep(Duration::from_millis(50)).await;
				}
				let deadline = Instant::now() + shutdown_timeout;
				loop {
					let (in_flight, _) = dispatcher.backpressure_snapshot();
					if in_flight == 0 || Instant::now() >= deadline {
						info!(in_flight, "drain window complete");
						break;
					}
					tokio::time::sleep(Duration::from_millis(100)).await;
				}
			}
		});

		axum::serve(listener, self.router)
			.with_graceful_shutdown(async move {
				let _ = tokio::signal::ctrl_c().await;
				draining.store(true, Ordering::SeqCst);
				info!("draining: no longer admitting new requests");
			})
			.await?;

		eviction_task.abort();
		sweep_task.abort();
		health_task.abort();
		let _ = drain_task.await;

		if let Some(stats_file) = &self.state.config.stats_file {
			let snapshot = StatsAggregator {
				keys: self.state.keys.as_ref(),
				errors: self.state.errors.as_ref(),
				tokens: self.state.tokens.as_ref(),
				replay: self.state.replay.as_ref(),
			}
			.snapshot();
			if let Err(e) = flush_stats_to_disk(stats_file, &snapshot) {
				warn!(error = %e, "failed to flush stats to disk during shutdown");
			}
		}

		Ok(())
	}
}

fn spawn_hot_reload_watcher(keys_file: PathBuf, keys: Arc<KeyManager>) -> notify_debouncer_full::Debouncer<notify::RecommendedWatcher, notify_debouncer_full::RecommendedCache> {
	let mut debouncer = notify_debouncer_full::new_debouncer(Duration::from_millis(500), None, move |result: DebounceEventResult| match result {
		Ok(events) => {
			if events.iter().any(|e| e.kind.is_modify() || e.kind.is_create()) {
				match KeysFile::load(&keys_file) {
					Ok(kf) => {
						let entries = kf.parse_entries();
						let report = keys.reload_keys(&entries);
						info!(total = report.total, added = report.added, removed = report.removed, "keys file hot-reloaded");
					},
					Err(e) => warn!(error = %e, "hot-reload: keys file failed to parse, keeping existing keys"),
				}
			}
		},
		Err(errors) => warn!(?errors, "keys file watcher error"),
	})
	.expect("failed to build keys file watcher");

	if let Some(parent) = keys_file.parent() {
		if let Err(e) = debouncer.watch(parent, notify::RecursiveMode::NonRecursive) {
			warn!(error = %e, "failed to watch keys file directory; hot reload disabled");
		}
	}
	debouncer
}

/// Periodically samples pool health and the error counters for the webhook
/// events spec §6 lists but that no hot-path call site naturally fires:
/// `ErrorSpike`, `HealthDegraded`, `HealthCritical`.
async fn health_monitor_loop(state: AppState) {
	let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
	let mut last_error_total: u64 = 0;
	loop {
		interval.tick().await;

		let stats = state.keys.stats();
		if !stats.is_empty() {
			let healthy = stats.iter().filter(|s| s.circuit_state != CircuitState::Open).count();
			let healthy_fraction = healthy as f64 / stats.len() as f64;
			if healthy_fraction == 0.0 {
				state
					.webhook
					.send(WebhookEvent::new(EventType::HealthCritical, serde_json::json!({"healthyKeys": healthy, "totalKeys": stats.len()})))
					.await;
			} else if healthy_fraction < HEALTH_DEGRADED_FRACTION {
				state
					.webhook
					.send(WebhookEvent::new(EventType::HealthDegraded, serde_json::json!({"healthyKeys": healthy, "totalKeys": stats.len()})))
					.await;
			}
		}

		let error_total: u64 = state.errors.snapshot().values().sum();
		let delta = error_total.saturating_sub(last_error_total);
		last_error_total = error_total;
		if delta >= ERROR_SPIKE_THRESHOLD {
			state
				.webhook
				.send(WebhookEvent::new(EventType::ErrorSpike, serde_json::json!({"newErrors": delta, "windowSecs": HEALTH_CHECK_INTERVAL.as_secs()})))
				.await;
		}
	}
}

async fn proxy_handler(State(state): State<AppState>, method: Method, uri: Uri, headers: HeaderMap, body: Body) -> Response {
	if method != Method::POST {
		return StatusCode::NOT_FOUND.into_response();
	}
	if state.draining.load(Ordering::SeqCst) {
		return (StatusCode::SERVICE_UNAVAILABLE, axum::Json(serde_json::json!({ "error": "server is shutting down" }))).into_response();
	}
	let bytes = match to_bytes(body, state.config.max_body_size + 1).await {
		Ok(b) => b,
		Err(_) => return proxy_error_response(ProxyError::body_too_large()),
	};
	match state.dispatcher.handle(method, uri, headers, bytes, 0, state.config.max_body_size).await {
		Ok(outcome) => outcome.response.into_response(),
		Err(e) => proxy_error_response(e),
	}
}

fn proxy_error_response(e: ProxyError) -> Response {
	let status = e.status();
	(status, axum::Json(serde_json::json!({ "error": e }))).into_response()
}

async fn health_handler(State(state): State<AppState>) -> Response {
	let available = state.keys.any_available();
	let (in_flight, queued) = state.dispatcher.backpressure_snapshot();
	let body = serde_json::json!({
		"status": if available { "OK" } else { "DEGRADED" },
		"totalKeys": state.keys.len(),
		"uptime": state.started_at.elapsed().as_secs(),
		"backpressure": { "inFlight": in_flight, "queued": queued },
	});
	let status = if available { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
	(status, axum::Json(body)).into_response()
}

async fn stats_handler(State(state): State<AppState>) -> Response {
	let snapshot = StatsAggregator {
		keys: state.keys.as_ref(),
		errors: state.errors.as_ref(),
		tokens: state.tokens.as_ref(),
		replay: state.replay.as_ref(),
	}
	.snapshot();
	axum::Json(snapshot).into_response()
}

async fn backpressure_handler(State(state): State<AppState>) -> Response {
	let (in_flight, queued) = state.dispatcher.backpressure_snapshot();
	let max = state.config.max_backpressure;
	let available = max.saturating_sub(in_flight as usize);
	let percent_used = if max == 0 { 0.0 } else { (in_flight as f64 / max as f64) * 100.0 };
	axum::Json(serde_json::json!({
		"current": in_flight,
		"max": max,
		"available": available,
		"percentUsed": percent_used,
		"queue": { "current": queued, "max": state.config.queue_capacity },
	}))
	.into_response()
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
	#[allow(dead_code)]
	tier: Option<String>,
}

async fn models_handler(State(state): State<AppState>, Query(_query): Query<ModelsQuery>) -> Response {
	axum::Json(serde_json::json!({ "models": state.keys.model_gate_stats() })).into_response()
}

async fn reload_handler(State(state): State<AppState>) -> Response {
	match KeysFile::load(&state.keys_file) {
		Ok(kf) => {
			let entries = kf.parse_entries();
			let report = state.keys.reload_keys(&entries);
			axum::Json(serde_json::json!({
				"success": true,
				"total": report.total,
				"added": report.added,
				"removed": report.removed,
			}))
			.into_response()
		},
		Err(e) => {
			warn!(error = %e, "manual reload failed, keeping existing keys");
			(StatusCode::INTERNAL_SERVER_ERROR, axum::Json(serde_json::json!({ "success": false, "error": e.to_string() }))).into_response()
		},
	}
}

const STATS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedKeyStats {
	requests: u64,
	successes: u64,
	failures: u64,
	retries: u64,
}

/// On-disk stats layout, spec §6. Writes are atomic (temp-file + rename).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedStats {
	#[serde(rename = "schemaVersion")]
	schema_version: u32,
	#[serde(rename = "firstSeen")]
	first_seen: DateTime<Utc>,
	#[serde(rename = "lastUpdated")]
	last_updated: DateTime<Utc>,
	keys: HashMap<String, PersistedKeyStats>,
	totals: crate::stats::Totals,
}

fn flush_stats_to_disk(path: &std::path::Path, snapshot: &StatsSnapshot) -> anyhow::Result<()> {
	let first_seen = fs_err::read_to_string(path)
		.ok()
		.and_then(|raw| serde_json::from_str::<PersistedStats>(&raw).ok())
		.map(|p| p.first_seen)
		.unwrap_or_else(Utc::now);

	let keys = snapshot
		.keys
		.iter()
		.map(|k| {
			(
				k.key_id.clone(),
				PersistedKeyStats {
					requests: k.total_requests,
					successes: k.success_count,
					failures: k.failure_count,
					retries: 0,
				},
			)
		})
		.collect();

	let persisted = PersistedStats {
		schema_version: STATS_SCHEMA_VERSION,
		first_seen,
		last_updated: Utc::now(),
		keys,
		totals: snapshot.totals.clone(),
	};

	let tmp_path = path.with_extension("tmp");
	fs_err::write(&tmp_path, serde_json::to_vec_pretty(&persisted)?)?;
	fs_err::rename(&tmp_path, path)?;
	Ok(())
}
