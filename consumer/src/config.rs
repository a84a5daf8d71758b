use common_inference::http::InferenceConfig;
use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3305")]
    pub port: u16,

    #[envconfig(nested)]
    pub kafka: KafkaConfig,

    #[envconfig(nested)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested)]
    pub inference: InferenceConfig,

    #[envconfig(default = "10")]
    pub batch_size: usize,

    #[envconfig(default = "5")]
    pub batch_timeout_seconds: u64,

    // The primary store caps batch writes at 25 items.
    #[envconfig(default = "25")]
    pub store_batch_size: usize,

    // Inputs longer than this (in code points) go through summarization.
    #[envconfig(default = "1024")]
    pub summary_threshold: usize,

    // While a gate is closed, a stage holds at most this many multiples of
    // its batch size before shedding oldest-first.
    #[envconfig(default = "10")]
    pub held_batch_multiplier: usize,

    #[envconfig(default = "15")]
    pub healthcheck_interval_seconds: u64,

    #[envconfig(from = "DEDUP_CACHE_ADDRESS", default = "localhost:6379")]
    pub dedup_cache_address: String,

    #[envconfig(from = "DEDUP_CACHE_PASSWORD")]
    pub dedup_cache_password: Option<String>,

    #[envconfig(from = "DEDUP_CACHE_TLS", default = "false")]
    pub dedup_cache_tls: bool,

    #[envconfig(default = "86400")]
    pub dedup_ttl_seconds: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        ConsumerConfig::set_defaults(common_kafka::TOPIC_RAW_CONTENT);
        Self::init_from_env()
    }

    pub fn dedup_cache_url(&self) -> String {
        let scheme = if self.dedup_cache_tls { "rediss" } else { "redis" };
        match &self.dedup_cache_password {
            Some(password) => format!("{scheme}://:{password}@{}", self.dedup_cache_address),
            None => format!("{scheme}://{}", self.dedup_cache_address),
        }
    }

    pub fn batch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.batch_timeout_seconds)
    }

    pub fn dedup_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.dedup_ttl_seconds)
    }

    /// Cap on items a gated stage may hold before shedding.
    pub fn held_batch_cap(&self) -> usize {
        self.batch_size * self.held_batch_multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_url_reflects_tls_and_password() {
        let mut config = Config::init_from_hashmap(&std::collections::HashMap::from([(
            "KAFKA_CONSUMER_TOPIC".to_string(),
            "raw-content".to_string(),
        )]))
        .unwrap();
        assert_eq!(config.dedup_cache_url(), "redis://localhost:6379");

        config.dedup_cache_tls = true;
        config.dedup_cache_password = Some("secret".to_string());
        assert_eq!(config.dedup_cache_url(), "rediss://:secret@localhost:6379");
    }
}
