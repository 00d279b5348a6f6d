use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit::CircuitConfig;
use crate::keys::{AccountDetectionConfig, HealthWeights, KeyCooldownConfig, KeyManagerConfig};
use crate::pool::PoolConfig;

fn millis(v: u64) -> Duration {
	Duration::from_millis(v)
}

/// Every knob spec §6 lists, plus the ambient pieces (keys file location,
/// admin bind address, log format) a real binary needs. Deserialized from
/// YAML or JSON via `serde_yaml`/`serde_json` (both teacher dependencies);
/// CLI flags via `clap` override file values, matching the teacher's general
/// posture of layering env/flags over a base file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
	pub listen_addr: SocketAddr,
	pub admin_addr: SocketAddr,
	pub keys_file: PathBuf,
	pub stats_file: Option<PathBuf>,
	pub log_format: LogFormat,

	pub max_concurrency_per_key: u32,
	pub rate_limit_per_minute: u64,
	pub rate_limit_burst: u64,

	pub circuit_breaker: CircuitBreakerConfig,
	pub pool_cooldown: PoolCooldownConfig,
	pub account_level_detection: AccountLevelConfig,
	pub key_rate_limit_cooldown: KeyRateLimitCooldownConfig,

	pub max_retries: u32,
	pub retry_backoff_base_ms: u64,

	pub max_backpressure: usize,
	pub queue_timeout_ms: u64,
	pub queue_capacity: usize,

	pub max_body_size: usize,
	pub base_upstream_timeout_ms: u64,
	pub max_upstream_timeout_ms: u64,

	pub shutdown_timeout_ms: u64,

	pub default_model_max_concurrency: u32,
	pub health_weights: HealthWeightsConfig,
	pub global_p95_ceiling_ms: u64,

	pub webhook_url: Option<String>,
	pub webhook_secret: Option<String>,

	pub replay_max_size: usize,
	pub replay_retention_ms: u64,

	pub token_tracker_max_keys: usize,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			listen_addr: "0.0.0.0:8080".parse().unwrap(),
			admin_addr: "127.0.0.1:9090".parse().unwrap(),
			keys_file: PathBuf::from("keys.json"),
			stats_file: None,
			log_format: LogFormat::Text,

			max_concurrency_per_key: 10,
			rate_limit_per_minute: 60,
			rate_limit_burst: 10,

			circuit_breaker: CircuitBreakerConfig::default(),
			pool_cooldown: PoolCooldownConfig::default(),
			account_level_detection: AccountLevelConfig::default(),
			key_rate_limit_cooldown: KeyRateLimitCooldownConfig::default(),

			max_retries: 3,
			retry_backoff_base_ms: 200,

			max_backpressure: 256,
			queue_timeout_ms: 30_000,
			queue_capacity: 512,

			max_body_size: 10 * 1024 * 1024,
			base_upstream_timeout_ms: 10_000,
			max_upstream_timeout_ms: 120_000,

			shutdown_timeout_ms: 30_000,

			default_model_max_concurrency: 10,
			health_weights: HealthWeightsConfig::default(),
			global_p95_ceiling_ms: 5_000,

			webhook_url: None,
			webhook_secret: None,

			replay_max_size: 500,
			replay_retention_ms: 3_600_000,

			token_tracker_max_keys: 256,
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	Text,
	Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
	pub failure_threshold: usize,
	pub failure_window_ms: u64,
	pub cooldown_period_ms: u64,
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		let d = CircuitConfig::default();
		Self {
			failure_threshold: d.failure_threshold,
			failure_window_ms: d.failure_window.as_millis() as u64,
			cooldown_period_ms: d.cooldown_period.as_millis() as u64,
		}
	}
}

impl From<CircuitBreakerConfig> for CircuitConfig {
	fn from(c: CircuitBreakerConfig) -> Self {
		CircuitConfig {
			failure_threshold: c.failure_threshold,
			failure_window: millis(c.failure_window_ms),
			cooldown_period: millis(c.cooldown_period_ms),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolCooldownConfig {
	pub base_ms: u64,
	pub cap_ms: u64,
	pub decay_ms: u64,
	pub remaining_threshold: u64,
	pub pacing_delay_ms: u64,
}

impl Default for PoolCooldownConfig {
	fn default() -> Self {
		let d = PoolConfig::default();
		Self {
			base_ms: d.base_ms,
			cap_ms: d.cap_ms,
			decay_ms: d.decay_ms,
			remaining_threshold: d.remaining_threshold,
			pacing_delay_ms: d.pacing_delay_ms,
		}
	}
}

impl From<PoolCooldownConfig> for PoolConfig {
	fn from(c: PoolCooldownConfig) -> Self {
		PoolConfig {
			base_ms: c.base_ms,
			cap_ms: c.cap_ms,
			decay_ms: c.decay_ms,
			remaining_threshold: c.remaining_threshold,
			pacing_delay_ms: c.pacing_delay_ms,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountLevelConfig {
	pub enabled: bool,
	pub key_threshold: usize,
	pub window_ms: u64,
	pub cooldown_ms: u64,
}

impl Default for AccountLevelConfig {
	fn default() -> Self {
		let d = AccountDetectionConfig::default();
		Self {
			enabled: d.enabled,
			key_threshold: d.key_threshold,
			window_ms: d.window_ms,
			cooldown_ms: d.cooldown_ms,
		}
	}
}

impl From<AccountLevelConfig> for AccountDetectionConfig {
	fn from(c: AccountLevelConfig) -> Self {
		AccountDetectionConfig {
			enabled: c.enabled,
			key_threshold: c.key_threshold,
			window_ms: c.window_ms,
			cooldown_ms: c.cooldown_ms,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyRateLimitCooldownConfig {
	pub base_cooldown_ms: u64,
	pub cooldown_decay_ms: u64,
}

impl Default for KeyRateLimitCooldownConfig {
	fn default() -> Self {
		let d = KeyCooldownConfig::default();
		Self {
			base_cooldown_ms: d.base_cooldown_ms,
			cooldown_decay_ms: d.cooldown_decay_ms,
		}
	}
}

impl From<KeyRateLimitCooldownConfig> for KeyCooldownConfig {
	fn from(c: KeyRateLimitCooldownConfig) -> Self {
		KeyCooldownConfig {
			base_cooldown_ms: c.base_cooldown_ms,
			cooldown_decay_ms: c.cooldown_decay_ms,
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthWeightsConfig {
	pub latency: f64,
	pub success: f64,
	pub error_recency: f64,
}

impl Default for HealthWeightsConfig {
	fn default() -> Self {
		let d = HealthWeights::default();
		Self {
			latency: d.latency,
			success: d.success,
			error_recency: d.error_recency,
		}
	}
}

impl From<HealthWeightsConfig> for HealthWeights {
	fn from(c: HealthWeightsConfig) -> Self {
		HealthWeights {
			latency: c.latency,
			success: c.success,
			error_recency: c.error_recency,
		}
	}
}

impl Config {
	/// Loads from a YAML or JSON file by extension, falling back to YAML
	/// parsing for unrecognized extensions (matches the teacher's
	/// "config errors don't crash a running proxy" posture: returns a
	/// `Result` so the caller decides whether a bad config is fatal at
	/// startup or should keep previously-loaded config).
	pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
		let raw = fs_err::read_to_string(path)?;
		let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
		let cfg = if is_json { serde_json::from_str(&raw)? } else { serde_yaml::from_str(&raw)? };
		Ok(cfg)
	}

	pub fn key_manager_config(&self) -> KeyManagerConfig {
		KeyManagerConfig {
			max_concurrency_per_key: self.max_concurrency_per_key,
			rate_limit_per_minute: self.rate_limit_per_minute,
			rate_limit_burst: self.rate_limit_burst,
			circuit: self.circuit_breaker.clone().into(),
			key_rate_limit_cooldown: self.key_rate_limit_cooldown.clone().into(),
			account_level_detection: self.account_level_detection.clone().into(),
			default_model_max_concurrency: self.default_model_max_concurrency,
			health_weights: self.health_weights.into(),
			global_p95_ceiling_ms: self.global_p95_ceiling_ms,
		}
	}

	pub fn pool_config(&self) -> PoolConfig {
		self.pool_cooldown.clone().into()
	}
}

/// The on-disk keys file shape, spec §6: `{keys: ["<id>.<secret>", ...], baseUrl: "<origin>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysFile {
	pub keys: Vec<String>,
	#[serde(rename = "baseUrl")]
	pub base_url: String,
}

impl KeysFile {
	pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
		let raw = fs_err::read_to_string(path)?;
		Ok(serde_json::from_str(&raw)?)
	}

	/// Splits each `<id>.<secret>` entry on the first `.`. Malformed entries
	/// (missing separator) are dropped with a warning rather than aborting
	/// the whole reload.
	pub fn parse_entries(&self) -> Vec<(keyrelay_core::prelude::Strng, keyrelay_core::prelude::Strng)> {
		self.keys
			.iter()
			.filter_map(|raw| {
				raw.split_once('.').map(|(id, secret)| (keyrelay_core::prelude::Strng::from(id), keyrelay_core::prelude::Strng::from(secret)))
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_round_trip_through_key_manager_config() {
		let cfg = Config::default();
		let kmc = cfg.key_manager_config();
		assert_eq!(kmc.max_concurrency_per_key, 10);
		assert_eq!(kmc.circuit.failure_threshold, 5);
	}

	#[test]
	fn keys_file_splits_id_and_secret_on_first_dot() {
		let kf = KeysFile {
			keys: vec!["id1.sec.ret".to_string(), "malformed".to_string()],
			base_url: "https://api.example.com".to_string(),
		};
		let entries = kf.parse_entries();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].0.as_str(), "id1");
		assert_eq!(entries[0].1.as_str(), "sec.ret");
	}

	#[test]
	fn loads_yaml_config_from_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.yaml");
		fs_err::write(&path, "listenAddr: \"127.0.0.1:9999\"\nmaxRetries: 7\n").unwrap();
		let cfg = Config::load(&path).unwrap();
		assert_eq!(cfg.listen_addr.port(), 9999);
		assert_eq!(cfg.max_retries, 7);
	}

	#[test]
	fn loads_keys_file_json_from_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("keys.json");
		fs_err::write(&path, r#"{"keys": ["id1.secret1"], "baseUrl": "https://api.example.com"}"#).unwrap();
		let kf = KeysFile::load(&path).unwrap();
		assert_eq!(kf.base_url, "https://api.example.com");
		assert_eq!(kf.parse_entries().len(), 1);
	}
}
