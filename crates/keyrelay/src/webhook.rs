use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::redact::sign_webhook;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	CircuitTrip,
	CircuitRecover,
	RateLimitHit,
	RateLimitPoolExhausted,
	ErrorSpike,
	HealthDegraded,
	HealthCritical,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
	pub id: Uuid,
	#[serde(rename = "type")]
	pub event_type: EventType,
	pub timestamp: u64,
	pub payload: Value,
}

impl WebhookEvent {
	pub fn new(event_type: EventType, payload: Value) -> Self {
		Self {
			id: Uuid::new_v4(),
			event_type,
			timestamp: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64,
			payload,
		}
	}
}

/// Narrow capability interface for event delivery (spec §9 design note:
/// "callbacks instead of inheritance"). The scheduler core only depends on
/// this trait; `HttpWebhookSink` is one concrete, fire-and-forget
/// implementation. Delivery retries/dead-lettering are explicitly out of
/// scope (spec §1) — a failed delivery is logged and dropped.
#[async_trait::async_trait]
pub trait WebhookSink: Send + Sync {
	async fn send(&self, event: WebhookEvent);
}

pub struct HttpWebhookSink {
	client: reqwest_client::Client,
	url: String,
	secret: Option<String>,
}

/// A tiny hyper-based client is all this sink needs; it does not reuse the
/// dispatcher's upstream client since webhook delivery has no streaming or
/// retry requirements.
mod reqwest_client {
	use hyper_util::client::legacy::Client;
	use hyper_util::client::legacy::connect::HttpConnector;
	use hyper_util::rt::TokioExecutor;

	pub type Client = Client<HttpConnector, http_body_util::Full<bytes::Bytes>>;

	pub fn new() -> Client {
		Client::builder(TokioExecutor::new()).build(HttpConnector::new())
	}
}

impl HttpWebhookSink {
	pub fn new(url: impl Into<String>, secret: Option<String>) -> Self {
		Self {
			client: reqwest_client::new(),
			url: url.into(),
			secret,
		}
	}
}

#[async_trait::async_trait]
impl WebhookSink for HttpWebhookSink {
	async fn send(&self, event: WebhookEvent) {
		let body = match serde_json::to_vec(&event) {
			Ok(b) => b,
			Err(e) => {
				warn!(error = %e, "failed to serialize webhook event");
				return;
			},
		};

		let mut builder = http::Request::post(&self.url)
			.header(http::header::CONTENT_TYPE, "application/json")
			.header("X-Event", format!("{:?}", event.event_type))
			.header("X-Event-ID", event.id.to_string())
			.header("X-Timestamp", event.timestamp.to_string());
		if let Some(secret) = &self.secret {
			let sig = sign_webhook(secret, event.timestamp, &body);
			builder = builder.header("X-Signature", sig);
		}

		let request = match builder.body(http_body_util::Full::new(bytes::Bytes::from(body))) {
			Ok(r) => r,
			Err(e) => {
				warn!(error = %e, "failed to build webhook request");
				return;
			},
		};

		if let Err(e) = self.client.request(request).await {
			warn!(error = %e, url = %self.url, "webhook delivery failed");
		}
	}
}

/// A sink that drops every event; used when no webhook URL is configured.
pub struct NullWebhookSink;

#[async_trait::async_trait]
impl WebhookSink for NullWebhookSink {
	async fn send(&self, _event: WebhookEvent) {}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn null_sink_accepts_everything() {
		let sink = NullWebhookSink;
		sink.send(WebhookEvent::new(EventType::CircuitTrip, serde_json::json!({"keyId": "k0"}))).await;
	}

	#[test]
	fn webhook_event_serializes_with_expected_shape() {
		let event = WebhookEvent::new(EventType::RateLimitHit, serde_json::json!({"keyId": "k0"}));
		let v = serde_json::to_value(&event).unwrap();
		assert_eq!(v["type"], "rate_limit_hit");
		assert!(v["id"].is_string());
	}
}
