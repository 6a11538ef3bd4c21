use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::{circuit_breaker::CircuitBreakerConfig, retry::RetryConfig};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acknowledge as soon as a delivery arrives; a crash loses the message.
    #[default]
    OnReceipt,
    /// Acknowledge once the status update is written; a crash redelivers.
    AfterProcessing,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_exchange_name")]
    pub exchange_name: String,
    #[serde(default = "default_email_queue_name")]
    pub email_queue_name: String,
    #[serde(default = "default_push_queue_name")]
    pub push_queue_name: String,
    #[serde(default = "default_failed_queue_name")]
    pub failed_queue_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: u64,

    pub redis_url: String,
    #[serde(default = "default_idempotency_ttl_seconds")]
    pub idempotency_ttl_seconds: u64,
    #[serde(default = "default_idempotency_reservation_ttl_seconds")]
    pub idempotency_reservation_ttl_seconds: u64,
    #[serde(default = "default_dedup_lock_ttl_seconds")]
    pub dedup_lock_ttl_seconds: u64,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    pub database_url: String,

    pub user_service_url: Option<String>,
    pub template_service_url: Option<String>,
    #[serde(default = "default_proxy_timeout_seconds")]
    pub proxy_timeout_seconds: u64,

    #[serde(default = "default_circuit_breaker_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_circuit_breaker_timeout_seconds")]
    pub circuit_breaker_timeout_seconds: u64,
    #[serde(default = "default_circuit_breaker_interval_seconds")]
    pub circuit_breaker_interval_seconds: u64,
    #[serde(default = "default_circuit_breaker_half_open_max_requests")]
    pub circuit_breaker_half_open_max_requests: u32,
    #[serde(default = "default_circuit_breaker_success_threshold")]
    pub circuit_breaker_success_threshold: u32,

    #[serde(default = "default_publish_max_retries")]
    pub publish_max_retries: u32,
    #[serde(default = "default_publish_retry_base_delay_ms")]
    pub publish_retry_base_delay_ms: u64,

    #[serde(default = "default_consumer_poll_interval_seconds")]
    pub consumer_poll_interval_seconds: u64,
    #[serde(default = "default_consumer_subscribe_backoff_seconds")]
    pub consumer_subscribe_backoff_seconds: u64,
    #[serde(default)]
    pub consumer_ack_mode: AckMode,
    #[serde(default = "default_delivery_latency_ms")]
    pub delivery_latency_ms: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Exchange and queue names declared on every (re)connect.
#[derive(Clone, Debug)]
pub struct BrokerTopology {
    pub exchange: String,
    pub email_queue: String,
    pub push_queue: String,
    pub failed_queue: String,
    pub prefetch_count: u16,
}

impl BrokerTopology {
    pub fn queues(&self) -> [&str; 3] {
        [&self.email_queue, &self.push_queue, &self.failed_queue]
    }
}

/// Timing knobs of the consumer loop.
#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    pub poll_interval: Duration,
    pub subscribe_backoff: Duration,
    pub ack_mode: AckMode,
    pub lock_ttl: Duration,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.publish_max_retries,
            base_delay_ms: self.publish_retry_base_delay_ms,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            timeout: Duration::from_secs(self.circuit_breaker_timeout_seconds),
            interval: Duration::from_secs(self.circuit_breaker_interval_seconds),
            half_open_max_requests: self.circuit_breaker_half_open_max_requests,
            success_threshold: self.circuit_breaker_success_threshold,
        }
    }

    pub fn topology(&self) -> BrokerTopology {
        BrokerTopology {
            exchange: self.exchange_name.clone(),
            email_queue: self.email_queue_name.clone(),
            push_queue: self.push_queue_name.clone(),
            failed_queue: self.failed_queue_name.clone(),
            prefetch_count: self.prefetch_count,
        }
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            poll_interval: Duration::from_secs(self.consumer_poll_interval_seconds),
            subscribe_backoff: Duration::from_secs(self.consumer_subscribe_backoff_seconds),
            ack_mode: self.consumer_ack_mode,
            lock_ttl: Duration::from_secs(self.dedup_lock_ttl_seconds),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_exchange_name() -> String {
    "notifications".to_string()
}

fn default_email_queue_name() -> String {
    "email.queue".to_string()
}

fn default_push_queue_name() -> String {
    "push.queue".to_string()
}

fn default_failed_queue_name() -> String {
    "failed.queue".to_string()
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_reconnect_delay_seconds() -> u64 {
    10
}

fn default_idempotency_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_idempotency_reservation_ttl_seconds() -> u64 {
    120
}

fn default_dedup_lock_ttl_seconds() -> u64 {
    5 * 60
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_proxy_timeout_seconds() -> u64 {
    10
}

fn default_circuit_breaker_failure_threshold() -> u32 {
    5
}

fn default_circuit_breaker_timeout_seconds() -> u64 {
    30
}

fn default_circuit_breaker_interval_seconds() -> u64 {
    60
}

fn default_circuit_breaker_half_open_max_requests() -> u32 {
    5
}

fn default_circuit_breaker_success_threshold() -> u32 {
    1
}

fn default_publish_max_retries() -> u32 {
    5
}

fn default_publish_retry_base_delay_ms() -> u64 {
    2000
}

fn default_consumer_poll_interval_seconds() -> u64 {
    5
}

fn default_consumer_subscribe_backoff_seconds() -> u64 {
    10
}

fn default_delivery_latency_ms() -> u64 {
    2000
}

fn default_server_port() -> u16 {
    8080
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut vars = vec![
            ("RABBITMQ_URL".to_string(), "amqp://localhost:5672/%2f".to_string()),
            ("REDIS_URL".to_string(), "redis://localhost:6379".to_string()),
            ("DATABASE_URL".to_string(), "postgres://localhost/notifications".to_string()),
        ];
        vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        vars
    }

    #[test]
    fn defaults_follow_the_wire_contract() {
        let config: Config = envy::from_iter(vars(&[])).unwrap();

        assert_eq!(config.exchange_name, "notifications");
        assert_eq!(config.topology().queues(), ["email.queue", "push.queue", "failed.queue"]);
        assert_eq!(config.idempotency_ttl_seconds, 86_400);
        assert_eq!(config.dedup_lock_ttl_seconds, 300);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(10));
        assert_eq!(config.consumer_ack_mode, AckMode::OnReceipt);
        assert_eq!(config.retry_config().max_retries, 5);
        assert!(config.user_service_url.is_none());
    }

    #[test]
    fn ack_mode_and_log_format_are_parsed() {
        let config: Config = envy::from_iter(vars(&[
            ("CONSUMER_ACK_MODE", "after_processing"),
            ("LOG_FORMAT", "pretty"),
            ("SERVER_PORT", "9090"),
        ]))
        .unwrap();

        assert_eq!(config.consumer_ack_mode, AckMode::AfterProcessing);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.server_port, 9090);
    }

    #[test]
    fn missing_broker_url_is_rejected() {
        let result = envy::from_iter::<_, Config>(vec![(
            "REDIS_URL".to_string(),
            "redis://localhost:6379".to_string(),
        )]);

        assert!(result.is_err());
    }
}
