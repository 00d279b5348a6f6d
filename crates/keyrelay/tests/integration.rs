use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use keyrelay::dispatcher::{Dispatcher, DispatcherConfig, HyperUpstreamClient};
use keyrelay::keys::{KeyManager, KeyManagerConfig};
use keyrelay::pool::{PoolConfig, PoolManager};
use keyrelay::queue::RequestQueue;
use keyrelay::replay::ReplayQueue;
use keyrelay::stats::{ErrorTracker, TokenTracker};
use keyrelay::webhook::NullWebhookSink;
use keyrelay_core::prelude::Strng;
use rstest::rstest;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn build_dispatcher(base_url: String, n_keys: usize) -> Dispatcher {
	let keys = Arc::new(KeyManager::new(KeyManagerConfig::default(), |_, _, _, _| {}));
	keys.load_keys(&(0..n_keys).map(|i| (Strng::from(format!("k{i}")), Strng::from("secret"))).collect::<Vec<_>>());
	Dispatcher::new(
		DispatcherConfig {
			max_backpressure: 16,
			queue_timeout: Duration::from_secs(1),
			max_retries: 2,
			retry_backoff_base_ms: 5,
			base_upstream_timeout: Duration::from_secs(2),
			max_upstream_timeout: Duration::from_secs(5),
		},
		keys,
		Arc::new(PoolManager::new(PoolConfig::default())),
		Arc::new(RequestQueue::new(16)),
		Arc::new(ReplayQueue::new(NonZeroUsize::new(16).unwrap(), Duration::from_secs(60), 2)),
		Arc::new(ErrorTracker::new()),
		Arc::new(TokenTracker::new(NonZeroUsize::new(16).unwrap())),
		Arc::new(HyperUpstreamClient::new()),
		Arc::new(NullWebhookSink),
		Strng::from(base_url),
	)
}

#[tokio::test]
async fn successful_upstream_call_is_passed_through() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"usage": {"input_tokens": 3, "output_tokens": 7}})))
		.mount(&server)
		.await;

	let dispatcher = build_dispatcher(server.uri(), 1);
	let outcome = dispatcher
		.handle(
			Method::POST,
			"/v1/messages".parse().unwrap(),
			HeaderMap::new(),
			Bytes::from(r#"{"model":"claude-3"}"#),
			0,
			1024 * 1024,
		)
		.await
		.unwrap();
	assert_eq!(outcome.response.status(), StatusCode::OK);
}

#[rstest]
#[case(StatusCode::BAD_REQUEST)]
#[case(StatusCode::NOT_FOUND)]
#[tokio::test]
async fn client_shape_errors_pass_through_without_retry(#[case] status: StatusCode) {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(status.as_u16()))
		.expect(1)
		.mount(&server)
		.await;

	let dispatcher = build_dispatcher(server.uri(), 1);
	let outcome = dispatcher
		.handle(Method::POST, "/v1/messages".parse().unwrap(), HeaderMap::new(), Bytes::from("{}"), 0, 1024 * 1024)
		.await
		.unwrap();
	assert_eq!(outcome.response.status(), status);
}

#[tokio::test]
async fn server_error_is_retried_against_the_same_key_pool() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(503))
		.up_to_n_times(1)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"usage": {"input_tokens": 1, "output_tokens": 1}})))
		.mount(&server)
		.await;

	let dispatcher = build_dispatcher(server.uri(), 2);
	let outcome = dispatcher
		.handle(Method::POST, "/v1/messages".parse().unwrap(), HeaderMap::new(), Bytes::from("{}"), 0, 1024 * 1024)
		.await
		.unwrap();
	assert_eq!(outcome.response.status(), StatusCode::OK);
}
